//! Learning engine: the slow loop that turns raw interaction history into
//! prompt guidance and remediation dispatches.
//!
//! Each cycle reads the recent pattern window, re-scores one prompt
//! optimization per query type by observed success rate, publishes the top
//! candidates for the query path, feeds the error-signature table to the
//! remediator, and bumps the evolution counter when its 24h gate has
//! elapsed. A cycle that fails midway logs and leaves the rest for the next
//! tick.

use crate::analyzer::{top_error_signatures, ActivityLog, QueryType};
use crate::knowledge::{now_epoch_ms, KnowledgeStore, PromptOptimization};
use crate::remediation::AutoRemediator;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Number of optimization prompts kept live for the query path.
const PUBLISHED_OPTIMIZATIONS: usize = 3;

/// Cadence and window sizing for the learning loop. The interval must stay
/// strictly longer than the health interval so a health pass lands between
/// learning passes.
#[derive(Debug, Clone)]
pub struct LearningConfig {
    pub interval: Duration,
    pub analysis_window: usize,
    pub evolution_gate: Duration,
}

/// What one learning pass observed and did. Returned for logging and tests.
#[derive(Debug, Default)]
pub struct LearningSummary {
    pub patterns_analyzed: usize,
    pub success_rates: Vec<(QueryType, f64)>,
    pub signatures: Vec<(String, usize)>,
    pub remediations_dispatched: usize,
    pub evolution_cycle: Option<u64>,
}

/// Shared, in-memory view of the current best prompt guidance. Rebuilt each
/// learning cycle from the durable optimization records; cleared by the
/// memory-pressure remediation and simply repopulated on the next cycle.
#[derive(Clone, Default)]
pub struct OptimizationCache {
    prompts: Arc<RwLock<Vec<String>>>,
}

impl OptimizationCache {
    pub fn publish(&self, prompts: Vec<String>) {
        let mut slot = self
            .prompts
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = prompts;
    }

    /// The highest-ranked guidance prompt, if any.
    pub fn first(&self) -> Option<String> {
        self.prompts
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .first()
            .cloned()
    }

    pub fn clear(&self) {
        self.prompts
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    pub fn len(&self) -> usize {
        self.prompts
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Stable guidance text per query type, so re-scoring updates one durable
/// record per type instead of accreting near-duplicates.
fn guidance_for(query_type: QueryType) -> &'static str {
    match query_type {
        QueryType::Instruction => "Produce concrete, step-by-step output and state any assumptions.",
        QueryType::Explanation => "Define terms first, then explain from first principles.",
        QueryType::Reasoning => "Reason through the causes explicitly before concluding.",
        QueryType::Example => "Lead with a minimal worked example, then generalize.",
        QueryType::General => "Answer directly and keep the response focused.",
    }
}

/// Runs one learning pass over the recent window.
pub fn run_learning_cycle(
    store: &KnowledgeStore,
    activity: &ActivityLog,
    optimizations: &OptimizationCache,
    config: &LearningConfig,
) -> LearningSummary {
    let mut summary = LearningSummary::default();

    // An unreadable pattern window degrades to empty; the later sub-steps
    // (signatures, evolution gate, learning stamp) still run.
    let patterns = store
        .recent_patterns(config.analysis_window)
        .unwrap_or_else(|e| {
            tracing::warn!(target: "sovra::learning", error = %e, "pattern window unreadable; treating as empty");
            Vec::new()
        });
    summary.patterns_analyzed = patterns.len();

    // Success rate per query type over the window.
    let mut totals: HashMap<QueryType, (usize, usize)> = HashMap::new();
    for pattern in &patterns {
        let entry = totals.entry(pattern.query_type).or_insert((0, 0));
        entry.0 += 1;
        if pattern.success {
            entry.1 += 1;
        }
    }
    for query_type in QueryType::all() {
        if let Some((total, successes)) = totals.get(&query_type) {
            let rate = *successes as f64 / *total as f64;
            summary.success_rates.push((query_type, rate));
            let opt = PromptOptimization {
                prompt: guidance_for(query_type).to_string(),
                success_rate: rate,
                updated_ms: now_epoch_ms(),
            };
            if let Err(e) = store.record_optimization(&opt) {
                tracing::warn!(target: "sovra::learning", error = %e, "optimization not persisted");
            }
        }
    }

    match store.top_optimizations(PUBLISHED_OPTIMIZATIONS) {
        Ok(top) => {
            optimizations.publish(top.into_iter().map(|o| o.prompt).collect());
        }
        Err(e) => {
            tracing::warn!(target: "sovra::learning", error = %e, "optimization ranking unreadable");
        }
    }

    summary.signatures = top_error_signatures(&activity.recent(config.analysis_window), 1);

    if let Some(cycle) = store
        .bump_evolution_if_due(config.evolution_gate)
        .unwrap_or_else(|e| {
            tracing::warn!(target: "sovra::learning", error = %e, "evolution gate check failed");
            None
        })
    {
        tracing::info!(target: "sovra::learning", cycle, "evolution cycle advanced");
        summary.evolution_cycle = Some(cycle);
    }

    if let Err(e) = store.mark_learning_cycle() {
        tracing::warn!(target: "sovra::learning", error = %e, "learning timestamp not persisted");
    }

    summary
}

/// Spawns the periodic learning loop. Remediation evaluation happens here,
/// after the pure analysis step, so the loop owns all slow-path side effects.
pub fn init_learning_loop(
    store: Arc<KnowledgeStore>,
    activity: Arc<ActivityLog>,
    remediator: Arc<AutoRemediator>,
    optimizations: OptimizationCache,
    config: LearningConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            target: "sovra::learning",
            interval_secs = config.interval.as_secs(),
            window = config.analysis_window,
            "learning engine started"
        );
        loop {
            ticker.tick().await;
            let mut summary = run_learning_cycle(&store, &activity, &optimizations, &config);
            for (signature, frequency) in summary.signatures.clone() {
                if remediator.evaluate(&signature, frequency).await.is_some() {
                    summary.remediations_dispatched += 1;
                }
            }
            tracing::info!(
                target: "sovra::learning",
                patterns = summary.patterns_analyzed,
                signatures = summary.signatures.len(),
                remediations = summary.remediations_dispatched,
                "learning cycle complete"
            );
        }
    })
}
