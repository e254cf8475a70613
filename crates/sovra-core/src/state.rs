//! Avatar/system state machine: the small enumerated status exposed to
//! callers, plus the uptime and interaction counters.
//!
//! Transitions are advisory, not a gate on request admission: a request may
//! observe RECOVERING being set mid-flight by the health monitor. The state
//! word carries an epoch counter so the post-request decay back to NEUTRAL
//! never clobbers a newer write.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Coarse processing/health condition reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AvatarState {
    Neutral,
    Processing,
    Conscious,
    Recovering,
    Error,
}

impl AvatarState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AvatarState::Neutral => "NEUTRAL",
            AvatarState::Processing => "PROCESSING",
            AvatarState::Conscious => "CONSCIOUS",
            AvatarState::Recovering => "RECOVERING",
            AvatarState::Error => "ERROR",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => AvatarState::Processing,
            2 => AvatarState::Conscious,
            3 => AvatarState::Recovering,
            4 => AvatarState::Error,
            _ => AvatarState::Neutral,
        }
    }
}

/// Default display delay before a terminal-per-request state settles back
/// to NEUTRAL.
const DEFAULT_SETTLE_DELAY_SECS: u64 = 4;

/// Process-wide system state: one instance, lifetime = process lifetime.
/// Mutated by the query path on every call and by the health monitor on
/// detected backend failure.
pub struct SystemStateMachine {
    avatar: AtomicU8,
    /// Bumped on every avatar write; decay tasks only settle if unchanged.
    epoch: AtomicU64,
    interactions: AtomicU64,
    started: Instant,
    settle_delay: Duration,
}

impl SystemStateMachine {
    pub fn new() -> Self {
        Self::with_settle_delay(Duration::from_secs(DEFAULT_SETTLE_DELAY_SECS))
    }

    pub fn with_settle_delay(settle_delay: Duration) -> Self {
        Self {
            avatar: AtomicU8::new(AvatarState::Neutral as u8),
            epoch: AtomicU64::new(0),
            interactions: AtomicU64::new(0),
            started: Instant::now(),
            settle_delay,
        }
    }

    pub fn avatar(&self) -> AvatarState {
        AvatarState::from_u8(self.avatar.load(Ordering::Acquire))
    }

    /// Writes the avatar state and returns the new epoch.
    pub fn set_avatar(&self, state: AvatarState) -> u64 {
        self.avatar.store(state as u8, Ordering::Release);
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!(target: "sovra::state", state = state.as_str(), epoch, "avatar transition");
        epoch
    }

    /// Schedules the decay back to NEUTRAL after the display delay. The decay
    /// is skipped if any other transition happens first.
    pub fn settle_later(self: &Arc<Self>) {
        let observed = self.epoch.load(Ordering::Acquire);
        let me = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(me.settle_delay).await;
            if me.epoch.load(Ordering::Acquire) == observed {
                me.set_avatar(AvatarState::Neutral);
            }
        });
    }

    /// Increments the interaction counter; returns the new total.
    pub fn record_success(&self) -> u64 {
        self.interactions.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn interaction_count(&self) -> u64 {
        self.interactions.load(Ordering::Acquire)
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Default for SystemStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
