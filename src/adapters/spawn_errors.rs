use std::io::ErrorKind;
use std::path::Path;

/// Exit code recorded when the program could not be started at all.
pub const SPAWN_FAILURE_EXIT_CODE: i32 = 127;

/// Turns a spawn error into the stderr line shown on the run.
pub fn describe_spawn_error(program: &str, cwd: &str, error: &std::io::Error) -> String {
    if !cwd.is_empty() && !Path::new(cwd).is_dir() {
        return format!("working directory not found: {}", cwd);
    }
    match error.kind() {
        ErrorKind::NotFound => format!("command not found: {}", program),
        ErrorKind::PermissionDenied => format!("permission denied: {}", program),
        _ => format!("failed to start {}: {}", program, error),
    }
}
