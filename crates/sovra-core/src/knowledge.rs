//! Sled-backed knowledge store: the durable record of observed interaction
//! patterns, remediation decisions, optimization candidates, and evolution
//! counters.
//!
//! One tree per collection. Keys are zero-padded epoch-millis plus a uuid,
//! so lexicographic tree order equals chronological order and FIFO eviction
//! is `pop_min`. Sled gives per-write atomicity and crash durability (the
//! store is flushed after every mutation), which is what the append/persist
//! contract needs: concurrent writers never observe a half-written record
//! and never lose each other's appends.

use crate::analyzer::QueryType;
use crate::error::StoreError;
use serde::{Deserialize, Serialize};
use sled::Db;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

const PATTERNS_TREE: &str = "patterns";
const DECISIONS_TREE: &str = "decisions";
const OPTIMIZATIONS_TREE: &str = "optimizations";
const PREFERENCES_TREE: &str = "preferences";
const META_TREE: &str = "meta";

const EVOLUTION_CYCLE_KEY: &str = "evolution_cycle";
const LAST_EVOLUTION_KEY: &str = "last_evolution_ms";
const LAST_LEARNING_KEY: &str = "last_learning_ms";

/// Truncation bound for stored query text.
const INPUT_TRUNCATE_CHARS: usize = 80;

pub fn now_epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// One classified record of a single query/response exchange. Created by the
/// query processor after every call, successful or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionPattern {
    pub timestamp_ms: i64,
    pub query_type: QueryType,
    pub truncated_input: String,
    pub response_length: usize,
    pub success: bool,
}

impl InteractionPattern {
    pub fn new(query_type: QueryType, input: &str, response_length: usize, success: bool) -> Self {
        Self {
            timestamp_ms: now_epoch_ms(),
            query_type,
            truncated_input: input.chars().take(INPUT_TRUNCATE_CHARS).collect(),
            response_length,
            success,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }
}

/// Audit-trail entry for a dispatched remediation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationDecision {
    pub timestamp_ms: i64,
    /// The normalized error signature (or monitor trigger) that caused this.
    pub signature: String,
    /// Observed frequency in the analysis window (0 for monitor triggers).
    pub frequency: usize,
    pub action: String,
    pub outcome: String,
}

impl RemediationDecision {
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }
}

/// Prompt-prefix candidate, re-ranked by recorded success rate each
/// learning cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptOptimization {
    pub prompt: String,
    pub success_rate: f64,
    pub updated_ms: i64,
}

impl PromptOptimization {
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }
}

/// Durable root entity, one per process. Opening a missing path yields a
/// fresh empty knowledge base; undecodable records are skipped on read, so
/// decode failure can never fail startup.
pub struct KnowledgeStore {
    db: Db,
    pattern_cap: usize,
    /// Serializes the read-check-bump of the evolution gate so concurrent
    /// learning cycles cannot double-bump.
    evolution_gate: Mutex<()>,
}

impl KnowledgeStore {
    pub fn open_path<P: AsRef<Path>>(path: P, pattern_cap: usize) -> Result<Self, sled::Error> {
        let db = sled::open(path)?;
        Ok(Self {
            db,
            pattern_cap: pattern_cap.max(1),
            evolution_gate: Mutex::new(()),
        })
    }

    fn chrono_key(timestamp_ms: i64) -> String {
        format!("{:020}_{}", timestamp_ms, Uuid::new_v4().simple())
    }

    /// Appends an interaction pattern, enforces the FIFO cap, and flushes.
    pub fn append_pattern(&self, pattern: &InteractionPattern) -> Result<(), StoreError> {
        let tree = self.db.open_tree(PATTERNS_TREE)?;
        let key = Self::chrono_key(pattern.timestamp_ms);
        tree.insert(key.as_bytes(), pattern.to_bytes())?;
        while tree.len() > self.pattern_cap {
            if tree.pop_min()?.is_none() {
                break;
            }
        }
        self.db.flush()?;
        tracing::debug!(
            target: "sovra::knowledge",
            query_type = pattern.query_type.as_str(),
            success = pattern.success,
            total = tree.len(),
            "pattern appended"
        );
        Ok(())
    }

    pub fn pattern_count(&self) -> Result<usize, StoreError> {
        Ok(self.db.open_tree(PATTERNS_TREE)?.len())
    }

    /// Most recent patterns, newest first.
    pub fn recent_patterns(&self, limit: usize) -> Result<Vec<InteractionPattern>, StoreError> {
        let tree = self.db.open_tree(PATTERNS_TREE)?;
        let mut out = Vec::new();
        for item in tree.iter().rev().take(limit) {
            let (_, bytes) = item?;
            if let Some(p) = InteractionPattern::from_bytes(&bytes) {
                out.push(p);
            }
        }
        Ok(out)
    }

    pub fn record_decision(&self, decision: &RemediationDecision) -> Result<(), StoreError> {
        let tree = self.db.open_tree(DECISIONS_TREE)?;
        let key = Self::chrono_key(decision.timestamp_ms);
        tree.insert(key.as_bytes(), decision.to_bytes())?;
        self.db.flush()?;
        tracing::info!(
            target: "sovra::knowledge",
            action = %decision.action,
            signature = %decision.signature,
            "remediation decision recorded"
        );
        Ok(())
    }

    /// Most recent remediation decisions, newest first.
    pub fn recent_decisions(&self, limit: usize) -> Result<Vec<RemediationDecision>, StoreError> {
        let tree = self.db.open_tree(DECISIONS_TREE)?;
        let mut out = Vec::new();
        for item in tree.iter().rev().take(limit) {
            let (_, bytes) = item?;
            if let Some(d) = RemediationDecision::from_bytes(&bytes) {
                out.push(d);
            }
        }
        Ok(out)
    }

    /// Upserts an optimization keyed by its prompt text, so re-recording the
    /// same candidate updates its success rate instead of duplicating it.
    pub fn record_optimization(&self, opt: &PromptOptimization) -> Result<(), StoreError> {
        let tree = self.db.open_tree(OPTIMIZATIONS_TREE)?;
        let key = format!("opt_{:016x}", prompt_key_hash(&opt.prompt));
        tree.insert(key.as_bytes(), opt.to_bytes())?;
        self.db.flush()?;
        Ok(())
    }

    /// Optimizations ranked by success rate, best first.
    pub fn top_optimizations(&self, limit: usize) -> Result<Vec<PromptOptimization>, StoreError> {
        let tree = self.db.open_tree(OPTIMIZATIONS_TREE)?;
        let mut all = Vec::new();
        for item in tree.iter() {
            let (_, bytes) = item?;
            if let Some(o) = PromptOptimization::from_bytes(&bytes) {
                all.push(o);
            }
        }
        all.sort_by(|a, b| {
            b.success_rate
                .partial_cmp(&a.success_rate)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        all.truncate(limit);
        Ok(all)
    }

    /// Reserved extension point: per-user preference blobs. Not populated by
    /// the core path.
    pub fn set_preference(&self, user_id: &str, value: &serde_json::Value) -> Result<(), StoreError> {
        let tree = self.db.open_tree(PREFERENCES_TREE)?;
        tree.insert(user_id.as_bytes(), serde_json::to_vec(value)?)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn get_preference(&self, user_id: &str) -> Result<Option<serde_json::Value>, StoreError> {
        let tree = self.db.open_tree(PREFERENCES_TREE)?;
        Ok(tree
            .get(user_id.as_bytes())?
            .and_then(|b| serde_json::from_slice(&b).ok()))
    }

    pub fn evolution_cycle(&self) -> Result<u64, StoreError> {
        let tree = self.db.open_tree(META_TREE)?;
        Ok(tree
            .get(EVOLUTION_CYCLE_KEY)?
            .map(|b| decode_u64(&b))
            .unwrap_or(0))
    }

    pub fn last_evolution_ms(&self) -> Result<Option<i64>, StoreError> {
        let tree = self.db.open_tree(META_TREE)?;
        Ok(tree.get(LAST_EVOLUTION_KEY)?.map(|b| decode_u64(&b) as i64))
    }

    /// Bumps the evolution counter if the gate has elapsed since the last
    /// bump. Returns the new cycle number when a bump happened. The counter
    /// only ever increases, by exactly one per qualifying call.
    pub fn bump_evolution_if_due(&self, gate: Duration) -> Result<Option<u64>, StoreError> {
        let _guard = self
            .evolution_gate
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let now = now_epoch_ms();
        if let Some(last) = self.last_evolution_ms()? {
            if now.saturating_sub(last) < gate.as_millis() as i64 {
                return Ok(None);
            }
        }

        let tree = self.db.open_tree(META_TREE)?;
        let bumped = tree.update_and_fetch(EVOLUTION_CYCLE_KEY, |old| {
            let next = old.map(decode_u64).unwrap_or(0) + 1;
            Some(next.to_be_bytes().to_vec())
        })?;
        tree.insert(LAST_EVOLUTION_KEY, &(now as u64).to_be_bytes())?;
        self.db.flush()?;

        let cycle = bumped.map(|b| decode_u64(&b)).unwrap_or(0);
        tracing::info!(target: "sovra::knowledge", cycle, "evolution cycle bumped");
        Ok(Some(cycle))
    }

    /// Stamps the completion of a learning cycle.
    pub fn mark_learning_cycle(&self) -> Result<(), StoreError> {
        let tree = self.db.open_tree(META_TREE)?;
        tree.insert(LAST_LEARNING_KEY, &(now_epoch_ms() as u64).to_be_bytes())?;
        self.db.flush()?;
        Ok(())
    }

    pub fn last_learning_ms(&self) -> Result<Option<i64>, StoreError> {
        let tree = self.db.open_tree(META_TREE)?;
        Ok(tree.get(LAST_LEARNING_KEY)?.map(|b| decode_u64(&b) as i64))
    }
}

fn decode_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let n = bytes.len().min(8);
    buf[8 - n..].copy_from_slice(&bytes[..n]);
    u64::from_be_bytes(buf)
}

fn prompt_key_hash(prompt: &str) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    prompt.hash(&mut hasher);
    hasher.finish()
}
