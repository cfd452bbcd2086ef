use super::output::strip_ansi;
use crate::models::{NotifyPolicy, WorkspaceStatus};
use once_cell::sync::Lazy;
use regex::Regex;

pub const DEFAULT_NOTIFY_MIN_IDLE_SECS: u64 = 30;
const ELLIPSIS: &str = "...";

static ERROR_LINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(error|errors|failed|failure|failures|exception|fatal|panicked)\b")
        .expect("valid error line regex")
});

/// Status a finished run leaves its workspace in. A missing exit code counts
/// as a failure.
pub fn derive_status(exit_code: Option<i32>, needs_input: bool) -> WorkspaceStatus {
    match exit_code {
        Some(0) if needs_input => WorkspaceStatus::NeedsInput,
        Some(0) => WorkspaceStatus::Idle,
        _ => WorkspaceStatus::Failed,
    }
}

fn clean_lines(chunks: &[String]) -> Vec<String> {
    let joined = strip_ansi(&chunks.concat());
    joined
        .split(['\n', '\r'])
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect()
}

pub fn truncate_chars(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    let keep = max_chars.saturating_sub(ELLIPSIS.len());
    let mut truncated = value.chars().take(keep).collect::<String>();
    truncated.push_str(ELLIPSIS);
    truncated
}

/// One-line description of a finished run for notifications.
pub fn summarize(chunks: &[String], status: WorkspaceStatus, max_chars: usize) -> String {
    let lines = clean_lines(chunks);
    let chosen = if status == WorkspaceStatus::Failed {
        lines
            .iter()
            .rev()
            .find(|line| ERROR_LINE_RE.is_match(line))
            .or_else(|| lines.last())
    } else {
        lines.last()
    };
    chosen
        .map(|line| truncate_chars(line, max_chars))
        .unwrap_or_default()
}

/// Keeps the trailing `max_chars` characters of `existing + chunk`.
pub fn tail_snippet(existing: &str, chunk: &str, max_chars: usize) -> String {
    let combined = format!("{}{}", existing, chunk);
    let count = combined.chars().count();
    if count <= max_chars {
        return combined;
    }
    combined.chars().skip(count - max_chars).collect()
}

pub fn should_notify(policy: NotifyPolicy, status: WorkspaceStatus, duration_secs: u64) -> bool {
    should_notify_with_threshold(policy, status, duration_secs, DEFAULT_NOTIFY_MIN_IDLE_SECS)
}

pub fn should_notify_with_threshold(
    policy: NotifyPolicy,
    status: WorkspaceStatus,
    duration_secs: u64,
    min_idle_secs: u64,
) -> bool {
    match (policy, status) {
        (NotifyPolicy::Off, _) => false,
        (_, WorkspaceStatus::Failed | WorkspaceStatus::NeedsInput) => true,
        (NotifyPolicy::All, WorkspaceStatus::Idle) => duration_secs >= min_idle_secs,
        (NotifyPolicy::NeedsInputFailed, WorkspaceStatus::Idle) => false,
    }
}

/// Repeated failed or needs-input outcomes stay quiet; idle completions are
/// judged on duration alone.
pub fn is_notable_transition(previous: WorkspaceStatus, status: WorkspaceStatus) -> bool {
    previous != status || status == WorkspaceStatus::Idle
}
