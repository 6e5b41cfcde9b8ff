//! Zero-answer auto-retry.
//!
//! A run that fails before streaming any text, on a transient
//! assistant-side error, is resubmitted once with identical routing and a
//! prompt prefixed by a retry notice naming the failed run. The attempt
//! counter travels in the request meta so a retry never retries again.

use courier_domain::request::{Job, RunOrigin, RunRequest};

use super::compact::is_context_overflow;

/// Error labels that must never trigger an auto-retry even when no answer
/// was produced.
const NON_RETRYABLE_MARKERS: &[&str] = &[
    "user_requested",
    "interrupted",
    "new_session",
    "timeout",
    "run_idle_watchdog_timeout",
];

/// Whether an error belongs to the retryable assistant-error family.
pub fn is_retryable_error(error: &str) -> bool {
    let lower = error.to_lowercase();
    if !lower.contains("assistant_error") {
        return false;
    }
    if is_context_overflow(&lower) {
        return false;
    }
    !NON_RETRYABLE_MARKERS.iter().any(|m| lower.contains(m))
}

/// Decide whether a failed completion qualifies for a zero-answer retry.
pub fn should_retry(job: &Job, answer: &str, error: &str, max_retries: u32) -> bool {
    answer.trim().is_empty()
        && job.request.meta.zero_answer_retry_attempt < max_retries
        && is_retryable_error(error)
}

/// Compress an error message into a short label safe to embed in a prompt:
/// first line only, non-alphanumerics collapsed to `_`, capped at 60 chars.
pub fn sanitize_error_label(error: &str) -> String {
    let first_line = error.lines().next().unwrap_or("");
    let mut label: String = first_line
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    label.truncate(60);
    while label.contains("__") {
        label = label.replace("__", "_");
    }
    label.trim_matches('_').to_owned()
}

/// Build the retry submission: identical routing, incremented attempt
/// counter, prompt prefixed with a fixed notice referencing the failed run.
pub fn build_retry_request(job: &Job, error: &str) -> RunRequest {
    let label = sanitize_error_label(error);
    let mut request = job.request.clone();
    request.origin = RunOrigin::Retry;
    request.meta.zero_answer_retry_attempt += 1;
    request.prompt = format!(
        "[retry notice: run {} produced no answer ({label}); \
         answer the original message below]\n{}",
        job.run_id, job.request.prompt
    );
    request
}
