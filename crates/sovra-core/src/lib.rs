//! sovra-core: the SOVRA cognitive core library.
//!
//! Keeps an LLM-backed query endpoint alive under adverse conditions:
//! a durable knowledge store of interaction patterns, frequency-based
//! pattern analysis, rule-driven auto-remediation, periodic health and
//! learning loops, and the avatar state machine exposed to callers.

mod analyzer;
mod bridge;
mod config;
mod error;
mod knowledge;
mod learning;
mod monitor;
mod query;
mod remediation;
mod state;

pub use analyzer::{classify, top_error_signatures, ActivityLog, QueryType};
pub use bridge::{LlmBackend, OllamaBridge, SharedTimeout};
pub use config::CoreConfig;
pub use error::{BackendError, QueryError, StoreError};
pub use knowledge::{
    now_epoch_ms, InteractionPattern, KnowledgeStore, PromptOptimization, RemediationDecision,
};
pub use learning::{
    init_learning_loop, run_learning_cycle, LearningConfig, LearningSummary, OptimizationCache,
};
pub use monitor::{
    init_health_loop, load_average_one, memory_utilization_pct, run_health_cycle, HealthConfig,
    ProbeState,
};
pub use query::{QueryOutcome, QueryProcessor};
pub use remediation::{match_rule, AutoRemediator, RemediationAction};
pub use state::{AvatarState, SystemStateMachine};
