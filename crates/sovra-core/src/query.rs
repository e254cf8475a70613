//! Query processor: the per-request pipeline. Validate, classify, enrich
//! the prompt with live status and learned guidance, call the backend, and
//! record the outcome either way.
//!
//! Persistence failures degrade to in-memory operation; only an empty prompt
//! or a backend failure surfaces as an error to the caller.

use crate::analyzer::{classify, ActivityLog, QueryType};
use crate::bridge::LlmBackend;
use crate::error::QueryError;
use crate::knowledge::{InteractionPattern, KnowledgeStore};
use crate::learning::OptimizationCache;
use crate::state::{AvatarState, SystemStateMachine};
use std::sync::Arc;

/// A successful query, with the metadata callers echo back.
#[derive(Debug)]
pub struct QueryOutcome {
    pub response: String,
    pub query_type: QueryType,
    pub interactions: u64,
}

pub struct QueryProcessor {
    backend: Arc<dyn LlmBackend>,
    store: Arc<KnowledgeStore>,
    state: Arc<SystemStateMachine>,
    activity: Arc<ActivityLog>,
    optimizations: OptimizationCache,
}

impl QueryProcessor {
    pub fn new(
        backend: Arc<dyn LlmBackend>,
        store: Arc<KnowledgeStore>,
        state: Arc<SystemStateMachine>,
        activity: Arc<ActivityLog>,
        optimizations: OptimizationCache,
    ) -> Self {
        Self {
            backend,
            store,
            state,
            activity,
            optimizations,
        }
    }

    /// Bounded context prefix: live status plus at most one guidance line.
    fn build_prompt(&self, user_text: &str) -> String {
        let mut prompt = format!(
            "[Core status: uptime {}s, {} interactions served.]\n",
            self.state.uptime().as_secs(),
            self.state.interaction_count(),
        );
        if let Some(guidance) = self.optimizations.first() {
            prompt.push_str(&format!("[Guidance: {}]\n", guidance));
        }
        prompt.push('\n');
        prompt.push_str(user_text);
        prompt
    }

    /// Best-effort pattern append; a failed write degrades, never aborts.
    fn record_pattern(&self, query_type: QueryType, input: &str, response_length: usize, success: bool) {
        let pattern = InteractionPattern::new(query_type, input, response_length, success);
        if let Err(e) = self.store.append_pattern(&pattern) {
            tracing::warn!(
                target: "sovra::query",
                error = %e,
                "pattern not persisted; continuing in-memory"
            );
        }
    }

    /// Runs one query end to end. An empty prompt is rejected before any
    /// state mutation.
    pub async fn process(&self, prompt: &str) -> Result<QueryOutcome, QueryError> {
        let user_text = prompt.trim();
        if user_text.is_empty() {
            return Err(QueryError::EmptyPrompt);
        }

        self.state.set_avatar(AvatarState::Processing);
        let query_type = classify(user_text);
        let enriched = self.build_prompt(user_text);
        tracing::debug!(
            target: "sovra::query",
            query_type = query_type.as_str(),
            chars = user_text.chars().count(),
            "dispatching query"
        );

        match self.backend.generate(&enriched).await {
            Ok(response) => {
                self.record_pattern(query_type, user_text, response.len(), true);
                let interactions = self.state.record_success();
                self.state.set_avatar(AvatarState::Conscious);
                self.state.settle_later();
                self.activity
                    .record(format!("query ok: {} ({} chars)", query_type.as_str(), response.len()));
                Ok(QueryOutcome {
                    response,
                    query_type,
                    interactions,
                })
            }
            Err(e) => {
                self.record_pattern(query_type, user_text, 0, false);
                self.activity.record_error(&format!("backend generate failed: {}", e));
                self.state.set_avatar(AvatarState::Recovering);
                self.state.settle_later();
                tracing::warn!(target: "sovra::query", error = %e, "backend unavailable");
                Err(QueryError::BackendUnavailable(e))
            }
        }
    }
}
