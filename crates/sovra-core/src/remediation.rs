//! Auto-remediation: maps frequent error signatures to fixed, idempotent
//! corrective actions via an ordered rule table.
//!
//! Unmatched signatures are logged and ignored; there is no default action,
//! so the system never guesses at unknown failure causes. Every dispatched
//! action lands in the decisions audit trail.

use crate::analyzer::ActivityLog;
use crate::bridge::{LlmBackend, SharedTimeout};
use crate::knowledge::{now_epoch_ms, KnowledgeStore, RemediationDecision};
use crate::learning::OptimizationCache;
use crate::monitor::memory_utilization_pct;
use std::sync::Arc;
use std::time::Duration;

/// Fixed corrective operations. The first three are reachable from the rule
/// table; priority rebalancing is dispatched by the health monitor only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemediationAction {
    RestartBackend,
    RelieveMemoryPressure,
    WidenTimeout,
    RebalancePriorities,
}

impl RemediationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemediationAction::RestartBackend => "restart_backend",
            RemediationAction::RelieveMemoryPressure => "relieve_memory_pressure",
            RemediationAction::WidenTimeout => "widen_timeout",
            RemediationAction::RebalancePriorities => "rebalance_priorities",
        }
    }
}

struct RemediationRule {
    cues: &'static [&'static str],
    action: RemediationAction,
}

/// Ordered rule table; first match wins. Backend-disconnect outranks memory
/// outranks timeout.
const RULES: &[RemediationRule] = &[
    RemediationRule {
        cues: &["connection refused", "connection failed", "unreachable", "disconnect", "connect"],
        action: RemediationAction::RestartBackend,
    },
    RemediationRule {
        cues: &["out of memory", "memory", "oom"],
        action: RemediationAction::RelieveMemoryPressure,
    },
    RemediationRule {
        cues: &["timed out", "timeout"],
        action: RemediationAction::WidenTimeout,
    },
];

/// Maps a normalized signature to an action by substring match, in rule
/// priority order. Pure and independently testable.
pub fn match_rule(signature: &str) -> Option<RemediationAction> {
    let lower = signature.to_lowercase();
    for rule in RULES {
        if rule.cues.iter().any(|cue| lower.contains(cue)) {
            return Some(rule.action);
        }
    }
    None
}

/// Widening step applied per timeout remediation.
const TIMEOUT_WIDEN_STEP: Duration = Duration::from_secs(60);

pub struct AutoRemediator {
    backend: Arc<dyn LlmBackend>,
    store: Arc<KnowledgeStore>,
    activity: Arc<ActivityLog>,
    optimizations: OptimizationCache,
    timeout: SharedTimeout,
    timeout_cap: Duration,
    min_frequency: usize,
    restart_cmd: Option<String>,
}

impl AutoRemediator {
    pub fn new(
        backend: Arc<dyn LlmBackend>,
        store: Arc<KnowledgeStore>,
        activity: Arc<ActivityLog>,
        optimizations: OptimizationCache,
        timeout: SharedTimeout,
        timeout_cap: Duration,
        min_frequency: usize,
        restart_cmd: Option<String>,
    ) -> Self {
        Self {
            backend,
            store,
            activity,
            optimizations,
            timeout,
            timeout_cap,
            min_frequency,
            restart_cmd,
        }
    }

    /// Evaluates one signature from the frequency table. No-op at or below
    /// the frequency gate; otherwise dispatches the first matching rule.
    pub async fn evaluate(&self, signature: &str, frequency: usize) -> Option<RemediationAction> {
        if frequency <= self.min_frequency {
            tracing::debug!(
                target: "sovra::remediation",
                signature,
                frequency,
                gate = self.min_frequency,
                "below frequency gate; skipping"
            );
            return None;
        }
        match match_rule(signature) {
            Some(action) => {
                self.dispatch(action, signature, frequency).await;
                Some(action)
            }
            None => {
                tracing::info!(
                    target: "sovra::remediation",
                    signature,
                    frequency,
                    "no rule matches signature; ignoring"
                );
                None
            }
        }
    }

    /// Executes an action and journals the decision. Callable directly by the
    /// health monitor (`trigger` describes what fired, `frequency` 0).
    pub async fn dispatch(
        &self,
        action: RemediationAction,
        trigger: &str,
        frequency: usize,
    ) -> String {
        let outcome = match action {
            RemediationAction::RestartBackend => self.restart_backend().await,
            RemediationAction::RelieveMemoryPressure => self.relieve_memory_pressure().await,
            RemediationAction::WidenTimeout => self.widen_timeout(),
            RemediationAction::RebalancePriorities => self.rebalance_priorities(),
        };
        tracing::info!(
            target: "sovra::remediation",
            action = action.as_str(),
            trigger,
            outcome = %outcome,
            "remediation dispatched"
        );
        let decision = RemediationDecision {
            timestamp_ms: now_epoch_ms(),
            signature: trigger.to_string(),
            frequency,
            action: action.as_str().to_string(),
            outcome: outcome.clone(),
        };
        if let Err(e) = self.store.record_decision(&decision) {
            tracing::warn!(
                target: "sovra::remediation",
                error = %e,
                "decision not persisted; continuing in-memory"
            );
        }
        outcome
    }

    /// Idempotent: a healthy backend makes this a probe-and-log no-op. When
    /// the backend is down and a restart command is configured, the command
    /// is spawned detached; the next monitor cycle re-probes.
    async fn restart_backend(&self) -> String {
        if self.backend.probe().await {
            return "backend healthy; restart skipped".to_string();
        }
        match &self.restart_cmd {
            Some(cmd) => match tokio::process::Command::new("sh").arg("-c").arg(cmd).spawn() {
                Ok(child) => format!("restart command spawned (pid {:?})", child.id()),
                Err(e) => format!("restart command failed to spawn: {}", e),
            },
            None => "backend down; no restart command configured".to_string(),
        }
    }

    /// Drops optimizable in-memory state (activity history, optimization
    /// candidates) and re-checks memory utilization.
    async fn relieve_memory_pressure(&self) -> String {
        let before = self.activity.len();
        self.activity.shrink(before / 2);
        self.optimizations.clear();
        let utilization = memory_utilization_pct();
        format!(
            "activity log {} -> {} lines, optimization cache cleared; memory now {:.1}%",
            before,
            self.activity.len(),
            utilization
        )
    }

    fn widen_timeout(&self) -> String {
        let widened = self.timeout.widen(TIMEOUT_WIDEN_STEP, self.timeout_cap);
        format!("request timeout widened to {}s", widened.as_secs())
    }

    /// Lowers our own scheduling priority so the backend gets CPU headroom.
    fn rebalance_priorities(&self) -> String {
        #[cfg(unix)]
        {
            let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, 10) };
            if rc == 0 {
                "process niceness set to 10".to_string()
            } else {
                "setpriority failed; load rebalance skipped".to_string()
            }
        }
        #[cfg(not(unix))]
        {
            "priority rebalancing unsupported on this platform".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackendError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct StubBackend {
        healthy: AtomicBool,
        probes: AtomicUsize,
    }

    impl StubBackend {
        fn new(healthy: bool) -> Self {
            Self {
                healthy: AtomicBool::new(healthy),
                probes: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl LlmBackend for StubBackend {
        async fn generate(&self, _prompt: &str) -> Result<String, BackendError> {
            if self.healthy.load(Ordering::Acquire) {
                Ok("ok".to_string())
            } else {
                Err(BackendError::Connection("refused".to_string()))
            }
        }

        async fn probe(&self) -> bool {
            self.probes.fetch_add(1, Ordering::AcqRel);
            self.healthy.load(Ordering::Acquire)
        }
    }

    fn remediator(
        backend: Arc<StubBackend>,
    ) -> (tempfile::TempDir, Arc<KnowledgeStore>, AutoRemediator) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(KnowledgeStore::open_path(dir.path().join("kb"), 1000).unwrap());
        let remediator = AutoRemediator::new(
            backend,
            Arc::clone(&store),
            Arc::new(ActivityLog::new(100)),
            OptimizationCache::default(),
            SharedTimeout::new(Duration::from_secs(120)),
            Duration::from_secs(600),
            5,
            None,
        );
        (dir, store, remediator)
    }

    #[test]
    fn rule_table_priority_order() {
        // Disconnect outranks timeout when both cues are present.
        assert_eq!(
            match_rule("connection refused after timeout"),
            Some(RemediationAction::RestartBackend)
        );
        assert_eq!(
            match_rule("out of memory while caching"),
            Some(RemediationAction::RelieveMemoryPressure)
        );
        assert_eq!(
            match_rule("request timed out"),
            Some(RemediationAction::WidenTimeout)
        );
        assert_eq!(match_rule("segmentation fault"), None);
    }

    #[tokio::test]
    async fn frequency_gate_suppresses_action() {
        let backend = Arc::new(StubBackend::new(true));
        let (_dir, store, remediator) = remediator(Arc::clone(&backend));
        assert!(remediator.evaluate("connection refused", 5).await.is_none());
        assert!(store.recent_decisions(10).unwrap().is_empty());
        // Strictly above the gate: dispatches.
        assert_eq!(
            remediator.evaluate("connection refused", 6).await,
            Some(RemediationAction::RestartBackend)
        );
        assert_eq!(store.recent_decisions(10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn restart_on_healthy_backend_is_an_idempotent_noop() {
        let backend = Arc::new(StubBackend::new(true));
        let (_dir, store, remediator) = remediator(Arc::clone(&backend));
        let first = remediator
            .dispatch(RemediationAction::RestartBackend, "probe", 0)
            .await;
        let second = remediator
            .dispatch(RemediationAction::RestartBackend, "probe", 0)
            .await;
        assert_eq!(first, "backend healthy; restart skipped");
        assert_eq!(second, first);
        // Both no-ops are still auditable decisions.
        assert_eq!(store.recent_decisions(10).unwrap().len(), 2);
        assert_eq!(backend.probes.load(Ordering::Acquire), 2);
    }

    #[tokio::test]
    async fn unmatched_signature_takes_no_action() {
        let backend = Arc::new(StubBackend::new(true));
        let (_dir, store, remediator) = remediator(backend);
        assert!(remediator.evaluate("kernel panic", 100).await.is_none());
        assert!(store.recent_decisions(10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn widen_timeout_is_capped() {
        let backend = Arc::new(StubBackend::new(true));
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(KnowledgeStore::open_path(dir.path().join("kb"), 1000).unwrap());
        let timeout = SharedTimeout::new(Duration::from_secs(120));
        let remediator = AutoRemediator::new(
            backend,
            store,
            Arc::new(ActivityLog::new(100)),
            OptimizationCache::default(),
            timeout.clone(),
            Duration::from_secs(150),
            5,
            None,
        );
        remediator
            .dispatch(RemediationAction::WidenTimeout, "timeout", 6)
            .await;
        assert_eq!(timeout.get(), Duration::from_secs(150));
        remediator
            .dispatch(RemediationAction::WidenTimeout, "timeout", 6)
            .await;
        assert_eq!(timeout.get(), Duration::from_secs(150));
    }
}
