//! End-to-end rollouts over scripted providers: step ordering, checkpoint
//! resume, failure reporting, and the token-limit ending.

mod common;

use std::path::Path;
use std::sync::Arc;

use common::{dispatcher, Reply, ScriptedProvider};
use debate_engine::agents::{
    Debater, DebaterConfig, Judge, JudgeConfig, LanguageModelConfig, Method, PromptTemplate,
    TOKEN_LIMIT_ARGUMENT,
};
use debate_engine::checkpoint::CheckpointStore;
use debate_engine::llm::{CompletionDispatcher, ProviderKind};
use debate_engine::rollout::{
    ExampleRow, Participants, RolloutConfig, RolloutEngine, RolloutError, RolloutKind,
    TokenLimitPolicy,
};
use debate_engine::transcript::{RoundType, Side, Transcript};

fn row() -> ExampleRow {
    ExampleRow {
        question: "Who left first?".into(),
        correct_answer: "Ann".into(),
        negative_answer: "Ben".into(),
        story: "Ann left. Then Ben left.".into(),
        story_title: Some("Leaving".into()),
        question_set_id: None,
    }
}

fn by_side(prompt: &str, _call: usize) -> Vec<Reply> {
    let text = if prompt.contains("Ask the debaters") {
        "<thinking>hmm</thinking><question>Why?</question>"
    } else if prompt.contains("You argue that the answer is A") {
        "<argument>A wins <quote>a</quote></argument>"
    } else {
        "<argument>B wins <quote>b</quote></argument>"
    };
    vec![Reply::text(text)]
}

fn by_call(_prompt: &str, call: usize) -> Vec<Reply> {
    vec![Reply::text(format!("<argument>arg{call} <quote>q</quote></argument>"))]
}

fn lm() -> LanguageModelConfig {
    LanguageModelConfig::new("gpt-4")
}

fn debaters(d: &Arc<CompletionDispatcher>, correct: DebaterConfig, incorrect: DebaterConfig) -> Participants {
    Participants {
        correct: Some(Debater::new(Side::Correct, Method::Debate, correct, d.clone())),
        incorrect: Some(Debater::new(Side::Incorrect, Method::Debate, incorrect, d.clone())),
        ..Participants::default()
    }
}

fn debate_engine(
    d: &Arc<CompletionDispatcher>,
    kind: RolloutKind,
    num_steps: usize,
    cache_dir: &Path,
) -> RolloutEngine {
    let mut participants = debaters(d, DebaterConfig::new(lm()), DebaterConfig::new(lm()));
    participants.cross_examiner = Some(Judge::new(
        Method::Debate,
        JudgeConfig::new(lm(), PromptTemplate::cross_examiner()),
        d.clone(),
    ));
    let config = RolloutConfig::new(kind, num_steps).cross_examiner_name("Judge");
    RolloutEngine::new(Method::Debate, config, cache_dir, participants, d.clone()).unwrap()
}

fn argument(t: &Transcript, round: usize, side: Side) -> Option<String> {
    t.rounds()[round].side(side).map(|u| u.to_string())
}

#[tokio::test]
async fn test_simultaneous_rollout_runs_all_steps() {
    let provider = ScriptedProvider::new(ProviderKind::OpenAIChat, by_side);
    let d = dispatcher(provider.clone());
    let dir = tempfile::tempdir().unwrap();
    let engine = debate_engine(&d, RolloutKind::Simultaneous, 2, dir.path());

    let outcome = engine.run(0, &row(), false).await.unwrap();
    assert!(outcome.complete);
    // Two debaters per step plus one question from step 1 on.
    assert_eq!(provider.calls(), 5);

    let t = Transcript::from_json(&outcome.transcript).unwrap();
    assert_eq!(t.rounds().len(), 2);
    assert!(t.rounds()[0].cross_examiner.is_none());
    assert_eq!(
        t.rounds()[1].cross_examiner.as_ref().map(|q| q.to_string()),
        Some("Why?".to_string())
    );
    assert_eq!(
        t.responses()[1].cross_examiner.as_ref().map(|q| q.to_string()),
        Some("<thinking>hmm</thinking><question>Why?</question>".to_string())
    );
    assert_eq!(argument(&t, 0, Side::Correct).as_deref(), Some("A wins <quote>a</quote>"));
    assert_eq!(argument(&t, 1, Side::Incorrect).as_deref(), Some("B wins <quote>b</quote>"));
    assert_eq!(t.step_durations().len(), 2);
    assert_eq!(t.rollout_type.as_deref(), Some("quality_sim"));
}

#[tokio::test]
async fn test_resume_extends_a_finished_rollout() {
    let provider = ScriptedProvider::new(ProviderKind::OpenAIChat, by_side);
    let d = dispatcher(provider.clone());
    let dir = tempfile::tempdir().unwrap();

    let first = debate_engine(&d, RolloutKind::Simultaneous, 2, dir.path())
        .run(1, &row(), false)
        .await
        .unwrap();
    assert_eq!(provider.calls(), 5);

    let second = debate_engine(&d, RolloutKind::Simultaneous, 3, dir.path())
        .run(1, &row(), false)
        .await
        .unwrap();
    assert!(second.complete);
    assert_eq!(provider.calls(), 8);

    let before = Transcript::from_json(&first.transcript).unwrap();
    let after = Transcript::from_json(&second.transcript).unwrap();
    assert_eq!(after.rounds().len(), 3);
    assert_eq!(&after.rounds()[..2], before.rounds());
}

#[tokio::test]
async fn test_finished_rollout_reruns_without_calls() {
    let provider = ScriptedProvider::new(ProviderKind::OpenAIChat, by_side);
    let d = dispatcher(provider.clone());
    let dir = tempfile::tempdir().unwrap();
    let engine = debate_engine(&d, RolloutKind::Simultaneous, 2, dir.path());

    let first = engine.run(2, &row(), false).await.unwrap();
    let calls = provider.calls();
    let again = engine.run(2, &row(), false).await.unwrap();
    assert_eq!(provider.calls(), calls);
    assert_eq!(again, first);
}

#[tokio::test]
async fn test_truncated_checkpoint_replays_lost_steps() {
    let provider = ScriptedProvider::new(ProviderKind::OpenAIChat, by_side);
    let d = dispatcher(provider.clone());
    let dir = tempfile::tempdir().unwrap();
    let engine = debate_engine(&d, RolloutKind::Simultaneous, 3, dir.path());

    let full = engine.run(3, &row(), false).await.unwrap();
    assert_eq!(provider.calls(), 8);

    let path = dir.path().join("3.json");
    let mut entries: Vec<serde_json::Value> =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    entries.truncate(2);
    std::fs::write(&path, serde_json::to_string(&entries).unwrap()).unwrap();

    let replayed = engine.run(3, &row(), false).await.unwrap();
    assert!(replayed.complete);
    assert_eq!(provider.calls(), 11);
    let full = Transcript::from_json(&full.transcript).unwrap();
    let replayed = Transcript::from_json(&replayed.transcript).unwrap();
    assert_eq!(replayed.rounds(), full.rounds());
}

#[tokio::test]
async fn test_open_step_reuses_cached_responses() {
    let provider = ScriptedProvider::new(ProviderKind::OpenAIChat, by_side);
    let d = dispatcher(provider.clone());
    let dir = tempfile::tempdir().unwrap();
    let store = CheckpointStore::open(dir.path(), 5).unwrap();
    store
        .save(0, "responses_correct", vec!["<argument>cached <quote>c</quote></argument>"])
        .unwrap();
    drop(store);

    let engine = debate_engine(&d, RolloutKind::Simultaneous, 1, dir.path());
    let outcome = engine.run(5, &row(), false).await.unwrap();
    assert_eq!(provider.calls(), 1);
    let t = Transcript::from_json(&outcome.transcript).unwrap();
    assert_eq!(argument(&t, 0, Side::Correct).as_deref(), Some("cached <quote>c</quote>"));
}

#[tokio::test]
async fn test_failed_step_reports_incomplete() {
    let provider = ScriptedProvider::new(ProviderKind::OpenAIChat, |prompt, _| {
        let text = if prompt.contains("You argue that the answer is A") {
            "<argument>A wins <quote>a</quote></argument>"
        } else {
            "No argument from me."
        };
        vec![Reply::text(text)]
    });
    let d = dispatcher(provider);
    let dir = tempfile::tempdir().unwrap();
    let engine = debate_engine(&d, RolloutKind::Simultaneous, 2, dir.path());

    let outcome = engine.run(4, &row(), false).await.unwrap();
    assert!(!outcome.complete);
    assert!(
        outcome
            .transcript
            .starts_with("Error occurred on debate 4, step 0."),
        "{}",
        outcome.transcript
    );
    assert!(outcome.transcript.contains("responses are invalid, retry."));
}

struct TokenLimitedRun {
    transcript: Transcript,
    provider: Arc<ScriptedProvider>,
    engine: RolloutEngine,
    _dir: tempfile::TempDir,
}

async fn token_limited_run(policy: TokenLimitPolicy) -> TokenLimitedRun {
    let provider = ScriptedProvider::new(ProviderKind::OpenAIChat, by_side);
    let d = dispatcher(provider.clone());
    let dir = tempfile::tempdir().unwrap();
    let mut starved = DebaterConfig::new(lm());
    starved.prompt_token_limit = Some(1);
    let participants = debaters(&d, starved, DebaterConfig::new(lm()));
    let config = RolloutConfig::new(RolloutKind::Simultaneous, 3).token_limit_policy(policy);
    let engine = RolloutEngine::new(Method::Debate, config, dir.path(), participants, d).unwrap();

    let outcome = engine.run(6, &row(), false).await.unwrap();
    assert!(outcome.complete);
    TokenLimitedRun {
        transcript: Transcript::from_json(&outcome.transcript).unwrap(),
        provider,
        engine,
        _dir: dir,
    }
}

#[tokio::test]
async fn test_token_limit_overrides_both_sides() {
    let run = token_limited_run(TokenLimitPolicy::OverrideBoth).await;
    let (t, provider) = (&run.transcript, &run.provider);
    assert!(t.token_limit_reached());
    assert_eq!(t.rounds().len(), 1);
    assert_eq!(argument(&t, 0, Side::Correct).as_deref(), Some(TOKEN_LIMIT_ARGUMENT));
    assert_eq!(argument(&t, 0, Side::Incorrect).as_deref(), Some(TOKEN_LIMIT_ARGUMENT));
    assert_eq!(provider.calls(), 1);

    let rerun = run.engine.run(6, &row(), false).await.unwrap();
    assert!(rerun.complete);
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn test_token_limit_can_keep_opponent() {
    let run = token_limited_run(TokenLimitPolicy::KeepOpponent).await;
    let t = &run.transcript;
    assert!(t.token_limit_reached());
    assert_eq!(argument(t, 0, Side::Correct).as_deref(), Some(TOKEN_LIMIT_ARGUMENT));
    assert_eq!(argument(t, 0, Side::Incorrect).as_deref(), Some("B wins <quote>b</quote>"));
}

#[tokio::test]
async fn test_sequential_second_debater_sees_first() {
    let provider = ScriptedProvider::new(ProviderKind::OpenAIChat, by_call);
    let d = dispatcher(provider.clone());
    let dir = tempfile::tempdir().unwrap();
    let participants = debaters(&d, DebaterConfig::new(lm()), DebaterConfig::new(lm()));
    let config = RolloutConfig::new(RolloutKind::Sequential, 2);
    let engine = RolloutEngine::new(Method::Debate, config, dir.path(), participants, d).unwrap();

    let outcome = engine.run(7, &row(), false).await.unwrap();
    assert!(outcome.complete);
    let prompts = provider.prompts();
    assert_eq!(prompts.len(), 4);
    // Opening arguments are blind.
    assert!(!prompts[1].contains("arg0"));
    assert!(prompts[2].contains("arg0") && prompts[2].contains("arg1"));
    assert!(prompts[3].contains("arg2"));

    let t = Transcript::from_json(&outcome.transcript).unwrap();
    assert_eq!(t.rounds()[0].kind, Some(RoundType::Sim));
    assert_eq!(t.rounds()[1].kind, Some(RoundType::Seq));
    assert_eq!(argument(&t, 1, Side::Incorrect).as_deref(), Some("arg3 <quote>q</quote>"));
}

#[tokio::test]
async fn test_sequential_swap_puts_incorrect_first() {
    let provider = ScriptedProvider::new(ProviderKind::OpenAIChat, by_call);
    let d = dispatcher(provider);
    let dir = tempfile::tempdir().unwrap();
    let participants = debaters(&d, DebaterConfig::new(lm()), DebaterConfig::new(lm()));
    let config = RolloutConfig::new(RolloutKind::Sequential, 1);
    let engine = RolloutEngine::new(Method::Debate, config, dir.path(), participants, d).unwrap();

    let outcome = engine.run(8, &row(), true).await.unwrap();
    let t = Transcript::from_json(&outcome.transcript).unwrap();
    assert!(t.swap);
    assert_eq!(argument(&t, 0, Side::Incorrect).as_deref(), Some("arg0 <quote>q</quote>"));
    assert_eq!(argument(&t, 0, Side::Correct).as_deref(), Some("arg1 <quote>q</quote>"));
    assert_eq!(t.names.correct.as_deref(), Some("Debater B"));
}

#[test]
fn test_engine_rejects_invalid_setups() {
    let d = dispatcher(ScriptedProvider::constant("unused"));
    let dir = tempfile::tempdir().unwrap();
    let sim = || RolloutConfig::new(RolloutKind::Simultaneous, 1);
    let seq = || RolloutConfig::new(RolloutKind::Sequential, 1);

    let empty = RolloutEngine::new(Method::Debate, sim(), dir.path(), Participants::default(), d.clone());
    assert!(matches!(empty, Err(RolloutError::NoParticipants)));

    let mut same_names = sim();
    same_names.name2 = same_names.name1.clone();
    let participants = debaters(&d, DebaterConfig::new(lm()), DebaterConfig::new(lm()));
    let duplicate = RolloutEngine::new(Method::Debate, same_names, dir.path(), participants, d.clone());
    assert!(matches!(duplicate, Err(RolloutError::DuplicateNames(name)) if name == "Debater A"));

    let lonely = Participants {
        correct: Some(Debater::new(Side::Correct, Method::Debate, DebaterConfig::new(lm()), d.clone())),
        ..Participants::default()
    };
    let one_sided = RolloutEngine::new(Method::Debate, seq(), dir.path(), lonely, d.clone());
    assert!(matches!(one_sided, Err(RolloutError::SequentialNeedsBothDebaters)));

    let participants = debaters(&d, DebaterConfig::new(lm()).cbon(1), DebaterConfig::new(lm()));
    let refining = RolloutEngine::new(Method::Debate, seq(), dir.path(), participants, d);
    assert!(matches!(refining, Err(RolloutError::SequentialRefinement)));
}
