pub mod spawn_errors;

use crate::config::RunnerConfig;
use crate::errors::{AppError, AppResult};
use crate::models::Workspace;
use std::collections::BTreeMap;

/// Run kinds the dashboard can start on a workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    GitStatus,
    GitDiff,
    Test,
    Message,
}

impl RunKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GitStatus => "git_status",
            Self::GitDiff => "git_diff",
            Self::Test => "test",
            Self::Message => "message",
        }
    }

    pub fn parse(raw: &str) -> AppResult<Self> {
        match raw.trim() {
            "git_status" => Ok(Self::GitStatus),
            "git_diff" => Ok(Self::GitDiff),
            "test" => Ok(Self::Test),
            "message" => Ok(Self::Message),
            other => Err(AppError::Validation(format!("Unsupported run type '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: String,
    pub env: BTreeMap<String, String>,
}

impl ValidatedCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>, cwd: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args,
            cwd: cwd.into(),
            env: BTreeMap::new(),
        }
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    /// Human readable command line stored on the run record.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(quote_for_display)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn quote_for_display(part: &str) -> String {
    if !part.is_empty() && !part.chars().any(|ch| ch.is_whitespace() || ch == '"' || ch == '\'') {
        return part.to_string();
    }
    format!("\"{}\"", part.replace('"', "\\\""))
}

fn shell_command(script: &str, cwd: &str) -> ValidatedCommand {
    #[cfg(windows)]
    {
        ValidatedCommand::new("cmd", vec!["/C".to_string(), script.to_string()], cwd)
    }

    #[cfg(not(windows))]
    {
        ValidatedCommand::new("sh", vec!["-c".to_string(), script.to_string()], cwd)
    }
}

/// Resolves a run kind on a workspace into the concrete process to spawn.
pub fn build_command(
    kind: RunKind,
    workspace: &Workspace,
    prompt: Option<&str>,
    runner: &RunnerConfig,
) -> AppResult<ValidatedCommand> {
    let cwd = workspace.repo_path.as_str();
    let command = match kind {
        RunKind::GitStatus => ValidatedCommand::new(
            "git",
            vec!["status".to_string(), "--short".to_string(), "--branch".to_string()],
            cwd,
        )
        .with_env("GIT_PAGER", "cat"),
        RunKind::GitDiff => ValidatedCommand::new(
            "git",
            vec!["--no-pager".to_string(), "diff".to_string(), "--stat".to_string(), "--patch".to_string()],
            cwd,
        )
        .with_env("GIT_PAGER", "cat"),
        RunKind::Test => {
            let script = workspace
                .test_command_override
                .as_deref()
                .map(str::trim)
                .filter(|script| !script.is_empty())
                .unwrap_or(runner.default_test_command.as_str());
            shell_command(script, cwd).with_env("CI", "1")
        }
        RunKind::Message => {
            let prompt = prompt.map(str::trim).unwrap_or_default();
            if prompt.is_empty() {
                return Err(AppError::Validation("Message prompt cannot be empty".to_string()));
            }
            ValidatedCommand::new(
                runner.agent_program.clone(),
                vec!["exec".to_string(), prompt.to_string()],
                cwd,
            )
            .with_env("NO_COLOR", "1")
        }
    };
    Ok(command)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{now_utc, NotifyPolicy, WorkspaceStatus};

    fn workspace(test_override: Option<&str>) -> Workspace {
        Workspace {
            id: "ws-1".to_string(),
            title: "api".to_string(),
            repo_path: "/src/api".to_string(),
            status: WorkspaceStatus::Idle,
            notify_policy: NotifyPolicy::default(),
            default_thread_id: None,
            test_command_override: test_override.map(ToString::to_string),
            created_at: now_utc(),
            updated_at: now_utc(),
        }
    }

    #[test]
    fn test_runs_prefer_workspace_override() {
        let runner = RunnerConfig::default();
        let custom = build_command(RunKind::Test, &workspace(Some("cargo test")), None, &runner).expect("cmd");
        assert_eq!(custom.args.last().map(String::as_str), Some("cargo test"));
        let fallback = build_command(RunKind::Test, &workspace(Some("   ")), None, &runner).expect("cmd");
        assert_eq!(fallback.args.last().map(String::as_str), Some("npm test"));
        assert_eq!(fallback.cwd, "/src/api");
    }

    #[test]
    fn message_runs_require_a_prompt() {
        let runner = RunnerConfig::default();
        assert!(build_command(RunKind::Message, &workspace(None), Some("  "), &runner).is_err());
        let command =
            build_command(RunKind::Message, &workspace(None), Some("fix the build"), &runner).expect("cmd");
        assert_eq!(command.display(), "codex exec \"fix the build\"");
    }

    #[test]
    fn unknown_kinds_are_rejected() {
        assert!(RunKind::parse("bootstrap").is_err());
        assert_eq!(RunKind::parse("git_diff").expect("kind"), RunKind::GitDiff);
    }
}
