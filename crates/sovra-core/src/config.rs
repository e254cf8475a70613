//! Core configuration. Precedence: env `SOVRA_CONFIG` path > `config/gateway.toml` > defaults,
//! with `SOVRA__`-prefixed environment overrides on top.
//!
//! Thresholds and intervals are policy knobs, not invariants: tests and
//! deployments override them freely.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct CoreConfig {
    /// Application identity reported by the status endpoint.
    pub app_name: String,
    /// HTTP port for the gateway.
    pub port: u16,
    /// Base directory for the Sled knowledge store.
    pub storage_path: String,

    /// Ollama base URL (e.g. `http://127.0.0.1:11434`).
    pub ollama_url: String,
    /// Model tag requested from Ollama.
    pub ollama_model: String,
    /// Sampling temperature passed to the backend.
    pub temperature: f32,
    /// System persona sent with every generate call.
    pub system_prompt: String,

    /// Upper bound for a single backend generate call, in seconds.
    pub request_timeout_secs: u64,
    /// Hard cap the timeout-widening remediation may not exceed.
    pub request_timeout_cap_secs: u64,

    /// Health probe cadence, in seconds.
    pub health_interval_secs: u64,
    /// Learning cycle cadence, in seconds. Clamped to be strictly longer
    /// than the health interval (learning is the coarser cycle).
    pub learning_interval_secs: u64,

    /// Memory utilization percentage above which the monitor remediates.
    pub memory_threshold_pct: f64,
    /// 1-minute load average above which the monitor rebalances priorities.
    pub load_threshold: f64,

    /// An error signature must be seen strictly more often than this before
    /// the remediator acts on it.
    pub remediation_min_frequency: usize,
    /// Hours between evolution-cycle bumps.
    pub evolution_gate_hours: u64,

    /// Maximum retained interaction patterns (FIFO eviction past this).
    pub pattern_cap: usize,
    /// Maximum retained in-memory activity log lines.
    pub activity_log_cap: usize,
    /// Recent-log window scanned per learning cycle.
    pub analysis_window: usize,

    /// Shell command spawned by the backend-restart remediation. When unset
    /// the restart action degrades to a probe-and-log no-op.
    #[serde(default)]
    pub backend_restart_cmd: Option<String>,
}

impl CoreConfig {
    /// Load config from file and environment, mirroring the gateway boot order.
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_path =
            std::env::var("SOVRA_CONFIG").unwrap_or_else(|_| "config/gateway".to_string());
        let builder = config::Config::builder()
            .set_default("app_name", "SOVRA AGI Core")?
            .set_default("port", 5001_i64)?
            .set_default("storage_path", "./data")?
            .set_default("ollama_url", "http://127.0.0.1:11434")?
            .set_default("ollama_model", "phi3:mini")?
            .set_default("temperature", 0.2_f64)?
            .set_default(
                "system_prompt",
                "You are SOVRA, an autonomous Web3-native AGI core. \
                 Respond concisely, authoritatively, and technically.",
            )?
            .set_default("request_timeout_secs", 120_i64)?
            .set_default("request_timeout_cap_secs", 600_i64)?
            .set_default("health_interval_secs", 30_i64)?
            .set_default("learning_interval_secs", 60_i64)?
            .set_default("memory_threshold_pct", 85.0_f64)?
            .set_default("load_threshold", 2.5_f64)?
            .set_default("remediation_min_frequency", 5_i64)?
            .set_default("evolution_gate_hours", 24_i64)?
            .set_default("pattern_cap", 1000_i64)?
            .set_default("activity_log_cap", 500_i64)?
            .set_default("analysis_window", 200_i64)?;

        let path = Path::new(&config_path);
        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(config::Environment::with_prefix("SOVRA").separator("__"))
            .build()?;

        built.try_deserialize()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn request_timeout_cap(&self) -> Duration {
        Duration::from_secs(self.request_timeout_cap_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs.max(1))
    }

    /// Learning runs strictly less often than the health probe.
    pub fn learning_interval(&self) -> Duration {
        Duration::from_secs(
            self.learning_interval_secs
                .max(self.health_interval_secs.max(1) + 1),
        )
    }

    pub fn evolution_gate(&self) -> Duration {
        Duration::from_secs(self.evolution_gate_hours * 3600)
    }
}
