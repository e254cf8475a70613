//! Pattern analysis: query-type classification and error-signature
//! frequency tables over the recent activity window.
//!
//! "Learning" here is frequency bookkeeping, not model fitting: classify is
//! a keyword-membership test, and signatures are normalized strings counted
//! over a sliding window of recent log lines.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Fixed query categories, in classification priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    Instruction,
    Explanation,
    Reasoning,
    Example,
    General,
}

impl QueryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryType::Instruction => "instruction",
            QueryType::Explanation => "explanation",
            QueryType::Reasoning => "reasoning",
            QueryType::Example => "example",
            QueryType::General => "general",
        }
    }

    pub fn all() -> [Self; 5] {
        [
            QueryType::Instruction,
            QueryType::Explanation,
            QueryType::Reasoning,
            QueryType::Example,
            QueryType::General,
        ]
    }
}

const INSTRUCTION_CUES: &[&str] = &["write", "create", "generate", "build", "implement", "make me"];
const EXPLANATION_CUES: &[&str] = &["explain", "what is", "what are", "describe", "define"];
const REASONING_CUES: &[&str] = &["why", "how does", "how do", "analyze", "compare", "reason"];
const EXAMPLE_CUES: &[&str] = &["example", "sample", "show me", "demonstrate"];

/// Classifies a query. Total and deterministic: first cue match wins in
/// priority order instruction > explanation > reasoning > example; anything
/// else is general.
pub fn classify(query: &str) -> QueryType {
    let lower = query.to_lowercase();
    let table: [(&[&str], QueryType); 4] = [
        (INSTRUCTION_CUES, QueryType::Instruction),
        (EXPLANATION_CUES, QueryType::Explanation),
        (REASONING_CUES, QueryType::Reasoning),
        (EXAMPLE_CUES, QueryType::Example),
    ];
    for (cues, query_type) in table {
        if cues.iter().any(|cue| lower.contains(cue)) {
            return query_type;
        }
    }
    QueryType::General
}

/// Marker that makes a log line eligible for signature extraction.
const ERROR_MARKER: &str = "ERROR:";

/// Signature length bound after normalization.
const SIGNATURE_MAX_CHARS: usize = 160;

/// Maximum signatures returned per analysis pass.
const MAX_SIGNATURES: usize = 5;

/// Normalizes the text after the `ERROR:` marker: digit runs collapse to
/// `#` so timestamps, ports, and pids group together; whitespace trimmed;
/// length capped.
fn normalize_signature(raw: &str) -> String {
    let mut out = String::new();
    let mut in_digits = false;
    for c in raw.trim().chars() {
        if c.is_ascii_digit() {
            if !in_digits {
                out.push('#');
                in_digits = true;
            }
        } else {
            in_digits = false;
            out.push(c);
        }
        if out.chars().count() >= SIGNATURE_MAX_CHARS {
            break;
        }
    }
    out.trim().to_string()
}

/// Derives the error-signature frequency table from the recent log window.
/// Returns (signature, frequency) sorted by frequency descending (ties by
/// signature for determinism), only entries at or above `min_frequency`,
/// capped to the top 5.
pub fn top_error_signatures(lines: &[String], min_frequency: usize) -> Vec<(String, usize)> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for line in lines {
        if let Some(idx) = line.find(ERROR_MARKER) {
            let sig = normalize_signature(&line[idx + ERROR_MARKER.len()..]);
            if !sig.is_empty() {
                *counts.entry(sig).or_insert(0) += 1;
            }
        }
    }
    let mut ranked: Vec<(String, usize)> = counts
        .into_iter()
        .filter(|(_, freq)| *freq >= min_frequency.max(1))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.truncate(MAX_SIGNATURES);
    ranked
}

/// Bounded in-memory ring of recent activity lines. The query path and the
/// monitors push failure lines; the learning engine reads the window. Never
/// persisted: signatures are recomputed fresh each cycle.
pub struct ActivityLog {
    lines: Mutex<VecDeque<String>>,
    cap: usize,
}

impl ActivityLog {
    pub fn new(cap: usize) -> Self {
        Self {
            lines: Mutex::new(VecDeque::with_capacity(cap.min(1024))),
            cap: cap.max(1),
        }
    }

    pub fn record(&self, line: impl Into<String>) {
        let mut lines = self
            .lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        lines.push_back(line.into());
        while lines.len() > self.cap {
            lines.pop_front();
        }
    }

    pub fn record_error(&self, message: &str) {
        self.record(format!("{} {}", ERROR_MARKER, message));
    }

    /// The most recent `window` lines, oldest first.
    pub fn recent(&self, window: usize) -> Vec<String> {
        let lines = self
            .lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        lines
            .iter()
            .skip(lines.len().saturating_sub(window))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops all but the newest `keep` lines. Used by the memory-pressure
    /// remediation.
    pub fn shrink(&self, keep: usize) {
        let mut lines = self
            .lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        while lines.len() > keep {
            lines.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_priority_when_multiple_cues_present() {
        // "write" (instruction) beats "explain" (explanation).
        assert_eq!(classify("Write code and explain it"), QueryType::Instruction);
        // "explain" beats "why".
        assert_eq!(classify("Explain why the sky is blue"), QueryType::Explanation);
        // "why" beats "example".
        assert_eq!(classify("Why is this example broken"), QueryType::Reasoning);
        assert_eq!(classify("Give me a sample output"), QueryType::Example);
    }

    #[test]
    fn classify_is_total_with_general_default() {
        assert_eq!(classify(""), QueryType::General);
        assert_eq!(classify("hola"), QueryType::General);
        assert_eq!(classify("🤖🤖🤖"), QueryType::General);
    }

    #[test]
    fn classify_is_case_insensitive() {
        assert_eq!(classify("EXPLAIN staking"), QueryType::Explanation);
    }

    #[test]
    fn signatures_group_after_digit_collapse() {
        let lines: Vec<String> = (0..6)
            .map(|i| format!("[{}] ERROR: connection refused on port 1143{}", i, i))
            .collect();
        let top = top_error_signatures(&lines, 5);
        assert_eq!(top.len(), 1);
        assert_eq!(top[0], ("connection refused on port #".to_string(), 6));
    }

    #[test]
    fn signatures_respect_min_frequency_and_cap() {
        let mut lines = Vec::new();
        for sig in ["alpha", "beta", "gamma", "delta", "epsilon", "zeta", "eta"] {
            for _ in 0..3 {
                lines.push(format!("ERROR: {} failed", sig));
            }
        }
        lines.push("ERROR: rare failure".to_string());
        let top = top_error_signatures(&lines, 2);
        // Seven signatures qualify at frequency 3, but only the top 5 surface.
        assert_eq!(top.len(), 5);
        assert!(top.iter().all(|(_, f)| *f == 3));
        assert!(!top.iter().any(|(s, _)| s.contains("rare")));
    }

    #[test]
    fn non_error_lines_are_ignored() {
        let lines = vec![
            "INFO: all good".to_string(),
            "WARN: slow response".to_string(),
        ];
        assert!(top_error_signatures(&lines, 1).is_empty());
    }

    #[test]
    fn activity_log_is_bounded_and_windowed() {
        let log = ActivityLog::new(5);
        for i in 0..9 {
            log.record(format!("line {}", i));
        }
        assert_eq!(log.len(), 5);
        let window = log.recent(3);
        assert_eq!(window, vec!["line 6", "line 7", "line 8"]);
        log.shrink(2);
        assert_eq!(log.len(), 2);
        assert_eq!(log.recent(10), vec!["line 7", "line 8"]);
    }
}
