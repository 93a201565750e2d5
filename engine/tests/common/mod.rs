//! Scripted in-process provider shared by the engine integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use debate_engine::llm::{
    CompletionDispatcher, CompletionResult, DispatchError, ModelCatalog, Provider, ProviderKind,
    ProviderRequest, StopReason, TokenLogprobs,
};

/// One scripted sample: completion text plus optional first-position logprobs.
#[derive(Clone)]
pub struct Reply {
    pub text: String,
    pub logprobs: Option<TokenLogprobs>,
}

impl Reply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            logprobs: None,
        }
    }

    pub fn logprobs(pairs: &[(&str, f64)]) -> Self {
        Self {
            text: String::new(),
            logprobs: Some(
                pairs
                    .iter()
                    .map(|(token, logprob)| (token.to_string(), *logprob))
                    .collect(),
            ),
        }
    }
}

type Script = dyn Fn(&str, usize) -> Vec<Reply> + Send + Sync;

/// Provider answering from a closure over (joined prompt text, call index).
pub struct ScriptedProvider {
    kind: ProviderKind,
    script: Box<Script>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn new(
        kind: ProviderKind,
        script: impl Fn(&str, usize) -> Vec<Reply> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            kind,
            script: Box::new(script),
            prompts: Mutex::new(Vec::new()),
        })
    }

    /// Chat provider returning the same text for every sample.
    pub fn constant(text: &'static str) -> Arc<Self> {
        Self::new(ProviderKind::OpenAIChat, move |_, _| vec![Reply::text(text)])
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn execute(
        &self,
        request: &ProviderRequest,
    ) -> Result<Vec<CompletionResult>, DispatchError> {
        let prompt = request.prompt.joined_text();
        let call = {
            let mut prompts = self.prompts.lock().unwrap();
            prompts.push(prompt.clone());
            prompts.len() - 1
        };
        let replies = (self.script)(&prompt, call);
        let n = request.n.max(1) as usize;
        Ok(replies
            .into_iter()
            .cycle()
            .take(n)
            .map(|reply| CompletionResult {
                model_id: request.model_ids[0].clone(),
                completion: reply.text,
                stop_reason: StopReason::StopSequence,
                duration_secs: 0.2,
                api_duration_secs: 0.1,
                cost: 0.01,
                logprobs: reply.logprobs.map(|l| vec![l]),
            })
            .collect())
    }
}

pub fn dispatcher(provider: Arc<ScriptedProvider>) -> Arc<CompletionDispatcher> {
    Arc::new(CompletionDispatcher::new(Arc::new(ModelCatalog::new())).register(provider))
}
