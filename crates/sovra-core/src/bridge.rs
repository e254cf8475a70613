//! Ollama bridge: the single collaborator interface to the LLM backend.
//!
//! One operation matters to the core: `generate(prompt) -> text`. Timeout,
//! connection refusal, and non-success status are all surfaced as
//! `BackendError` and treated uniformly as "backend unavailable" upstream.
//! The request timeout is a shared knob so the timeout-widening remediation
//! affects subsequent calls.

use crate::config::CoreConfig;
use crate::error::BackendError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Probe timeout: liveness checks must stay cheap.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Model pulls can take minutes on first boot.
const PULL_TIMEOUT: Duration = Duration::from_secs(300);

/// Startup connect retries before the gateway gives up and starts degraded.
const CONNECT_RETRIES: u32 = 5;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Seam between the core and the text-generation service. The monitor,
/// remediator, query processor, and tests all talk to this trait.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Generates a completion for the prompt. Any failure means "backend
    /// unavailable" to the caller.
    async fn generate(&self, prompt: &str) -> Result<String, BackendError>;

    /// Cheap liveness probe.
    async fn probe(&self) -> bool;
}

/// Mutable request-timeout knob shared between the bridge and the
/// remediator. Widening is monotone up to a cap.
#[derive(Clone)]
pub struct SharedTimeout {
    millis: Arc<AtomicU64>,
}

impl SharedTimeout {
    pub fn new(initial: Duration) -> Self {
        Self {
            millis: Arc::new(AtomicU64::new(initial.as_millis() as u64)),
        }
    }

    pub fn get(&self) -> Duration {
        Duration::from_millis(self.millis.load(Ordering::Acquire))
    }

    /// Raises the timeout by `step`, never past `cap`. Returns the new value.
    pub fn widen(&self, step: Duration, cap: Duration) -> Duration {
        let step_ms = step.as_millis() as u64;
        let cap_ms = cap.as_millis() as u64;
        let mut current = self.millis.load(Ordering::Acquire);
        loop {
            let next = (current + step_ms).min(cap_ms);
            match self.millis.compare_exchange(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Duration::from_millis(next),
                Err(observed) => current = observed,
            }
        }
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    system: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelTag>,
}

#[derive(Deserialize)]
struct ModelTag {
    name: String,
}

#[derive(Serialize)]
struct PullRequest<'a> {
    name: &'a str,
    stream: bool,
}

/// Reqwest-backed bridge to a local Ollama service.
pub struct OllamaBridge {
    base_url: String,
    model: String,
    system_prompt: String,
    temperature: f32,
    timeout: SharedTimeout,
    client: reqwest::Client,
}

impl OllamaBridge {
    pub fn from_config(config: &CoreConfig, timeout: SharedTimeout) -> Self {
        Self::new(
            &config.ollama_url,
            &config.ollama_model,
            &config.system_prompt,
            config.temperature,
            timeout,
        )
    }

    pub fn new(
        base_url: &str,
        model: &str,
        system_prompt: &str,
        temperature: f32,
        timeout: SharedTimeout,
    ) -> Self {
        let client = reqwest::Client::builder()
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            system_prompt: system_prompt.to_string(),
            temperature,
            timeout,
            client,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Startup sequence recovered from the connector script: bounded connect
    /// retries, then a model-presence check with an automatic pull. Failure
    /// is non-fatal; the gateway starts degraded and the monitor re-probes.
    pub async fn initialize(&self) -> bool {
        for attempt in 1..=CONNECT_RETRIES {
            tracing::info!(
                target: "sovra::bridge",
                attempt,
                max = CONNECT_RETRIES,
                url = %self.base_url,
                "connecting to Ollama"
            );
            if self.probe().await {
                if let Err(e) = self.ensure_model().await {
                    tracing::warn!(target: "sovra::bridge", error = %e, "model check failed");
                    return false;
                }
                tracing::info!(target: "sovra::bridge", model = %self.model, "Ollama ready");
                return true;
            }
            if attempt < CONNECT_RETRIES {
                tokio::time::sleep(CONNECT_RETRY_DELAY).await;
            }
        }
        tracing::warn!(
            target: "sovra::bridge",
            url = %self.base_url,
            "Ollama unreachable after {} attempts; starting degraded",
            CONNECT_RETRIES
        );
        false
    }

    /// Checks `/api/tags` for the configured model and pulls it when absent.
    async fn ensure_model(&self) -> Result<(), BackendError> {
        let url = format!("{}/api/tags", self.base_url);
        let res = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| BackendError::from_reqwest(e, Duration::from_secs(30)))?;
        if !res.status().is_success() {
            return Err(BackendError::Status(res.status().as_u16()));
        }
        let tags: TagsResponse = res
            .json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))?;
        if tags.models.iter().any(|m| m.name.contains(&self.model)) {
            tracing::info!(target: "sovra::bridge", model = %self.model, "model found");
            return Ok(());
        }

        tracing::info!(
            target: "sovra::bridge",
            model = %self.model,
            "model missing; pulling (this may take several minutes)"
        );
        let pull_url = format!("{}/api/pull", self.base_url);
        let res = self
            .client
            .post(&pull_url)
            .timeout(PULL_TIMEOUT)
            .json(&PullRequest {
                name: &self.model,
                stream: false,
            })
            .send()
            .await
            .map_err(|e| BackendError::from_reqwest(e, PULL_TIMEOUT))?;
        if !res.status().is_success() {
            return Err(BackendError::Status(res.status().as_u16()));
        }
        tracing::info!(target: "sovra::bridge", model = %self.model, "model pulled");
        Ok(())
    }
}

#[async_trait]
impl LlmBackend for OllamaBridge {
    async fn generate(&self, prompt: &str) -> Result<String, BackendError> {
        let timeout = self.timeout.get();
        let url = format!("{}/api/generate", self.base_url);
        let body = GenerateRequest {
            model: &self.model,
            prompt,
            system: &self.system_prompt,
            stream: false,
            options: GenerateOptions {
                temperature: self.temperature,
            },
        };

        let res = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::from_reqwest(e, timeout))?;

        if !res.status().is_success() {
            return Err(BackendError::Status(res.status().as_u16()));
        }

        let parsed: GenerateResponse = res
            .json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))?;
        Ok(parsed.response.trim().to_string())
    }

    async fn probe(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        match self
            .client
            .get(&url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(res) => res.status().is_success(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_timeout_widens_to_cap() {
        let timeout = SharedTimeout::new(Duration::from_secs(120));
        assert_eq!(timeout.get(), Duration::from_secs(120));
        assert_eq!(
            timeout.widen(Duration::from_secs(60), Duration::from_secs(200)),
            Duration::from_secs(180)
        );
        // Capped: widening again stops at 200.
        assert_eq!(
            timeout.widen(Duration::from_secs(60), Duration::from_secs(200)),
            Duration::from_secs(200)
        );
        assert_eq!(
            timeout.widen(Duration::from_secs(60), Duration::from_secs(200)),
            Duration::from_secs(200)
        );
    }

    #[test]
    fn base_url_trailing_slash_is_normalized() {
        let bridge = OllamaBridge::new(
            "http://127.0.0.1:11434/",
            "phi3:mini",
            "system",
            0.2,
            SharedTimeout::new(Duration::from_secs(1)),
        );
        assert_eq!(bridge.base_url, "http://127.0.0.1:11434");
    }
}
