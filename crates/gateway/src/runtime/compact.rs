//! Context-pressure detection.
//!
//! Two triggers write `pending_compaction` markers for the external
//! compactor: a failed run whose error text matches a known overflow
//! pattern (the session's resume state is also reset so the next run
//! starts fresh), and a successful run whose reported usage comes close
//! to the engine's context window.

use courier_domain::config::CompactionConfig;
use courier_domain::event::Usage;
use courier_sessions::PendingCompaction;

/// Error-text fragments that indicate the context window was blown.
/// Matched case-insensitively as substrings; providers phrase this many
/// ways, including localized variants.
const OVERFLOW_PATTERNS: &[&str] = &[
    "context_length_exceeded",
    "context window",
    "http 413",
    "payload too large",
    "request entity too large",
    "string too long",
    "maximum length",
    "prompt is too long",
    "input is too long",
    "上下文长度",
];

/// Whether an error message signals context overflow.
pub fn is_context_overflow(error: &str) -> bool {
    let lower = error.to_lowercase();
    OVERFLOW_PATTERNS.iter().any(|p| lower.contains(p))
}

/// The token count at which a near-limit marker is written:
/// `min(window - reserve, window * trigger_ratio)`.
pub fn near_limit_threshold(config: &CompactionConfig, context_window: u64) -> u64 {
    let reserved = context_window.saturating_sub(config.reserve_tokens);
    let ratio = (context_window as f64 * config.trigger_ratio) as u64;
    reserved.min(ratio)
}

/// Estimate the input-side token load of a completed run. Prefers the
/// engine-reported usage (input plus cache fields); falls back to a
/// bytes/4 heuristic over the prompt.
pub fn estimate_input_tokens(usage: Option<&Usage>, prompt: &str) -> u64 {
    match usage {
        Some(u) if u.effective_input_tokens() > 0 => u.effective_input_tokens(),
        _ => (prompt.len() as u64) / 4,
    }
}

/// Evaluate the near-limit condition for a successful completion.
/// Returns the marker to persist when the threshold is crossed.
pub fn check_near_limit(
    config: &CompactionConfig,
    context_window: u64,
    usage: Option<&Usage>,
    prompt: &str,
) -> Option<PendingCompaction> {
    let input_tokens = estimate_input_tokens(usage, prompt);
    let threshold = near_limit_threshold(config, context_window);
    if input_tokens >= threshold {
        Some(PendingCompaction::near_limit(
            input_tokens,
            threshold,
            context_window,
        ))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_sessions::CompactionReason;

    #[test]
    fn overflow_patterns_match_case_insensitively() {
        assert!(is_context_overflow(
            "context_length_exceeded: input[3] too long"
        ));
        assert!(is_context_overflow("Context Window exhausted"));
        assert!(is_context_overflow("upstream said HTTP 413"));
        assert!(is_context_overflow("Request Entity Too Large"));
        assert!(is_context_overflow("string too long: 1048576 chars"));
        assert!(is_context_overflow("maximum length of input reached"));
    }

    #[test]
    fn unrelated_errors_do_not_match() {
        assert!(!is_context_overflow("assistant_error: transient TLS"));
        assert!(!is_context_overflow("connection reset by peer"));
        assert!(!is_context_overflow(""));
    }

    #[test]
    fn threshold_is_min_of_reserve_and_ratio() {
        let config = CompactionConfig::default(); // reserve 16384, ratio 0.9
        // 400k window: reserve bound = 383_616, ratio bound = 360_000.
        assert_eq!(near_limit_threshold(&config, 400_000), 360_000);
        // 100k window: reserve bound = 83_616, ratio bound = 90_000.
        assert_eq!(near_limit_threshold(&config, 100_000), 83_616);
    }

    #[test]
    fn estimate_prefers_reported_usage() {
        let usage = Usage {
            input_tokens: 1000,
            output_tokens: 10,
            cache_read_tokens: 200,
            cache_creation_tokens: 100,
        };
        assert_eq!(estimate_input_tokens(Some(&usage), "whatever"), 1300);
    }

    #[test]
    fn estimate_falls_back_to_prompt_bytes() {
        let prompt = "x".repeat(4000);
        assert_eq!(estimate_input_tokens(None, &prompt), 1000);

        let zero_usage = Usage::default();
        assert_eq!(estimate_input_tokens(Some(&zero_usage), &prompt), 1000);
    }

    #[test]
    fn near_limit_fires_at_threshold() {
        let config = CompactionConfig::default();
        let usage = Usage {
            input_tokens: 360_000,
            ..Default::default()
        };
        let marker = check_near_limit(&config, 400_000, Some(&usage), "").unwrap();
        assert_eq!(marker.reason, CompactionReason::NearLimit);
        assert_eq!(marker.input_tokens, Some(360_000));
        assert_eq!(marker.threshold_tokens, Some(360_000));
        assert_eq!(marker.context_window_tokens, Some(400_000));
    }

    #[test]
    fn below_threshold_no_marker() {
        let config = CompactionConfig::default();
        let usage = Usage {
            input_tokens: 100_000,
            ..Default::default()
        };
        assert!(check_near_limit(&config, 400_000, Some(&usage), "").is_none());
    }
}
