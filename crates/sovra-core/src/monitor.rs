//! Health monitor: periodic backend liveness probe plus host resource
//! checks, each wired to its remediation.
//!
//! The three triggers are independent per cycle: a down backend dispatches a
//! restart, high memory dispatches pressure relief, high load dispatches a
//! priority rebalance. A cycle that fails to act never kills the loop.

use crate::analyzer::ActivityLog;
use crate::bridge::LlmBackend;
use crate::remediation::{AutoRemediator, RemediationAction};
use crate::state::{AvatarState, SystemStateMachine};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;

/// Thresholds and cadence for the health loop.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub interval: Duration,
    pub memory_threshold_pct: f64,
    pub load_threshold: f64,
}

/// Remembers the last observed backend liveness so the down/up transitions
/// drive the recovery handoff and keep the outage logging at one warning
/// per transition. Remediation itself fires on every failing cycle.
pub struct ProbeState {
    backend_up: AtomicBool,
}

impl ProbeState {
    pub fn new() -> Self {
        // Optimistic start: the first failing probe still counts as a
        // transition and triggers remediation.
        Self {
            backend_up: AtomicBool::new(true),
        }
    }

    pub fn backend_up(&self) -> bool {
        self.backend_up.load(Ordering::Acquire)
    }

    /// Records the latest probe result; returns the previous value.
    fn observe(&self, up: bool) -> bool {
        self.backend_up.swap(up, Ordering::AcqRel)
    }
}

impl Default for ProbeState {
    fn default() -> Self {
        Self::new()
    }
}

/// Current memory utilization of the host, in percent.
pub fn memory_utilization_pct() -> f64 {
    let mut sys = System::new();
    sys.refresh_memory();
    let total = sys.total_memory();
    if total == 0 {
        return 0.0;
    }
    sys.used_memory() as f64 / total as f64 * 100.0
}

/// One-minute load average. Reported as 0 on platforms without the notion.
pub fn load_average_one() -> f64 {
    System::load_average().one
}

/// Runs a single health pass: probe the backend, then check memory and load
/// against their thresholds. Each trigger fires independently.
pub async fn run_health_cycle(
    backend: &Arc<dyn LlmBackend>,
    state: &Arc<SystemStateMachine>,
    remediator: &AutoRemediator,
    activity: &ActivityLog,
    probe: &ProbeState,
    config: &HealthConfig,
) {
    let up = backend.probe().await;
    let was_up = probe.observe(up);
    if !up {
        if was_up {
            tracing::warn!(target: "sovra::monitor", "backend probe failed");
        }
        activity.record_error("backend connection failed during health probe");
        // Re-asserted every cycle: the query path's settle decay may have
        // returned the avatar to NEUTRAL mid-outage.
        if state.avatar() != AvatarState::Recovering {
            state.set_avatar(AvatarState::Recovering);
        }
        // Process-level retry lives here: the restart is idempotent, so a
        // still-down backend gets a fresh attempt on every cycle until a
        // probe succeeds.
        remediator
            .dispatch(
                RemediationAction::RestartBackend,
                "health probe: backend unreachable",
                0,
            )
            .await;
    } else if !was_up {
        tracing::info!(target: "sovra::monitor", "backend recovered");
        if state.avatar() == AvatarState::Recovering {
            state.set_avatar(AvatarState::Neutral);
        }
    }

    let memory_pct = memory_utilization_pct();
    if memory_pct > config.memory_threshold_pct {
        tracing::warn!(
            target: "sovra::monitor",
            memory_pct,
            threshold = config.memory_threshold_pct,
            "memory threshold exceeded"
        );
        remediator
            .dispatch(
                RemediationAction::RelieveMemoryPressure,
                "health probe: memory threshold exceeded",
                0,
            )
            .await;
    }

    let load = load_average_one();
    if load > config.load_threshold {
        tracing::warn!(
            target: "sovra::monitor",
            load,
            threshold = config.load_threshold,
            "load threshold exceeded"
        );
        remediator
            .dispatch(
                RemediationAction::RebalancePriorities,
                "health probe: load threshold exceeded",
                0,
            )
            .await;
    }

    tracing::debug!(
        target: "sovra::monitor",
        backend_up = up,
        memory_pct,
        load,
        "health cycle complete"
    );
}

/// Spawns the periodic health loop. Runs for the life of the process.
pub fn init_health_loop(
    backend: Arc<dyn LlmBackend>,
    state: Arc<SystemStateMachine>,
    remediator: Arc<AutoRemediator>,
    activity: Arc<ActivityLog>,
    probe: Arc<ProbeState>,
    config: HealthConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            target: "sovra::monitor",
            interval_secs = config.interval.as_secs(),
            "health monitor started"
        );
        loop {
            ticker.tick().await;
            run_health_cycle(&backend, &state, &remediator, &activity, &probe, &config).await;
        }
    })
}
