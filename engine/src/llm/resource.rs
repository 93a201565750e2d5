//! Token-bucket counter replenished lazily from wall-clock deltas.
//!
//! ```text
//! available = min(capacity, available + elapsed * capacity / window)
//! ```
//!
//! There is no background timer. Every read replenishes first, so callers
//! that need test-and-consume semantics must hold their own lock around
//! `has_capacity` + `consume`.

use std::time::{Duration, Instant};

use thiserror::Error;

/// Refresh window used by provider rate limits (per-minute quotas).
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Returned by [`RateResource::consume`] when the bucket cannot cover the request.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("resource does not have enough capacity to consume {requested} units ({available:.2} available)")]
pub struct InsufficientCapacity {
    pub requested: f64,
    pub available: f64,
}

/// A rate-limited quantity (requests or tokens) for a single model id.
#[derive(Debug, Clone)]
pub struct RateResource {
    capacity: f64,
    available: f64,
    window: Duration,
    last_update: Instant,
    consumed_total: f64,
}

impl RateResource {
    /// Create a full bucket holding `capacity` units per `window`.
    pub fn new(capacity: f64, window: Duration) -> Self {
        Self::new_at(capacity, window, Instant::now())
    }

    /// Create a full bucket with a one-minute refresh window.
    pub fn per_minute(capacity: f64) -> Self {
        Self::new(capacity, DEFAULT_WINDOW)
    }

    pub fn new_at(capacity: f64, window: Duration, now: Instant) -> Self {
        let capacity = capacity.max(0.0);
        Self {
            capacity,
            available: capacity,
            window,
            last_update: now,
            consumed_total: 0.0,
        }
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Total units consumed over the lifetime of this resource.
    pub fn consumed_total(&self) -> f64 {
        self.consumed_total
    }

    /// Current headroom after replenishment.
    pub fn available(&mut self) -> f64 {
        self.available_at(Instant::now())
    }

    pub fn available_at(&mut self, now: Instant) -> f64 {
        self.replenish(now);
        self.available
    }

    /// Replenish, then report whether `amount` units could be consumed.
    pub fn has_capacity(&mut self, amount: f64) -> bool {
        self.has_capacity_at(amount, Instant::now())
    }

    pub fn has_capacity_at(&mut self, amount: f64, now: Instant) -> bool {
        self.replenish(now);
        self.available >= amount
    }

    /// Consume `amount` units. Fails without mutating when headroom is short.
    pub fn consume(&mut self, amount: f64) -> Result<(), InsufficientCapacity> {
        self.consume_at(amount, Instant::now())
    }

    pub fn consume_at(&mut self, amount: f64, now: Instant) -> Result<(), InsufficientCapacity> {
        if !self.has_capacity_at(amount, now) {
            return Err(InsufficientCapacity {
                requested: amount,
                available: self.available,
            });
        }
        let amount = amount.max(0.0);
        self.available = (self.available - amount).clamp(0.0, self.capacity);
        self.consumed_total += amount;
        Ok(())
    }

    fn replenish(&mut self, now: Instant) {
        // Instants older than the last update contribute nothing.
        let elapsed = now.saturating_duration_since(self.last_update);
        let refill = if self.window.is_zero() {
            self.capacity
        } else {
            elapsed.as_secs_f64() * self.capacity / self.window.as_secs_f64()
        };
        self.available = (self.available + refill).min(self.capacity);
        if now > self.last_update {
            self.last_update = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_full() {
        let now = Instant::now();
        let mut r = RateResource::new_at(100.0, DEFAULT_WINDOW, now);
        assert_eq!(r.available_at(now), 100.0);
        assert!(r.has_capacity_at(100.0, now));
        assert!(!r.has_capacity_at(100.5, now));
    }

    #[test]
    fn test_consume_then_replenish_linearly() {
        let now = Instant::now();
        let mut r = RateResource::new_at(60.0, DEFAULT_WINDOW, now);
        r.consume_at(60.0, now).unwrap();
        assert_eq!(r.available_at(now), 0.0);

        // 60 units per 60s window → 1 unit per second.
        let later = now + Duration::from_secs(10);
        let available = r.available_at(later);
        assert!((available - 10.0).abs() < 1e-9, "got {available}");
    }

    #[test]
    fn test_replenish_caps_at_capacity() {
        let now = Instant::now();
        let mut r = RateResource::new_at(10.0, DEFAULT_WINDOW, now);
        r.consume_at(5.0, now).unwrap();
        let much_later = now + Duration::from_secs(3600);
        assert_eq!(r.available_at(much_later), 10.0);
    }

    #[test]
    fn test_consume_without_capacity_fails_and_leaves_state() {
        let now = Instant::now();
        let mut r = RateResource::new_at(5.0, DEFAULT_WINDOW, now);
        let err = r.consume_at(6.0, now).unwrap_err();
        assert_eq!(err.requested, 6.0);
        assert_eq!(r.available_at(now), 5.0);
        assert_eq!(r.consumed_total(), 0.0);
    }

    #[test]
    fn test_bounds_hold_for_mixed_sequences() {
        let start = Instant::now();
        let mut r = RateResource::new_at(50.0, Duration::from_secs(30), start);
        let mut now = start;
        // Deterministic pseudo-random walk of consumes and clock advances.
        let mut seed: u64 = 0x9e37_79b9;
        for _ in 0..2_000 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let amount = (seed >> 33) as f64 % 40.0;
            let advance_ms = (seed >> 20) % 1_500;
            now += Duration::from_millis(advance_ms);
            let _ = r.consume_at(amount, now);
            let available = r.available_at(now);
            assert!(available >= 0.0, "negative: {available}");
            assert!(available <= r.capacity(), "overflow: {available}");
        }
    }

    #[test]
    fn test_stale_instant_does_not_rewind() {
        let now = Instant::now();
        let mut r = RateResource::new_at(10.0, DEFAULT_WINDOW, now + Duration::from_secs(5));
        r.consume_at(10.0, now + Duration::from_secs(5)).unwrap();
        // An earlier instant neither refills nor panics.
        assert_eq!(r.available_at(now), 0.0);
    }

    #[test]
    fn test_zero_capacity_never_admits() {
        let now = Instant::now();
        let mut r = RateResource::new_at(0.0, DEFAULT_WINDOW, now);
        assert!(!r.has_capacity_at(1.0, now + Duration::from_secs(120)));
        assert!(r.has_capacity_at(0.0, now));
    }
}
