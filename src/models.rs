use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Exit code recorded for runs that were still `running` when the previous
/// server process went away.
pub const STALE_RUN_EXIT_CODE: i32 = -1;

pub fn now_utc() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceStatus {
    #[default]
    Idle,
    Failed,
    NeedsInput,
}

impl WorkspaceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Failed => "failed",
            Self::NeedsInput => "needs_input",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "failed" => Self::Failed,
            "needs_input" => Self::NeedsInput,
            _ => Self::Idle,
        }
    }
}

impl<'de> Deserialize<'de> for WorkspaceStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.as_deref().map(Self::parse).unwrap_or_default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum NotifyPolicy {
    #[serde(rename = "off")]
    Off,
    #[default]
    #[serde(rename = "needs_input+failed")]
    NeedsInputFailed,
    #[serde(rename = "all")]
    All,
}

impl NotifyPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::NeedsInputFailed => "needs_input+failed",
            Self::All => "all",
        }
    }

    /// Accepts the legacy `needs_input_failed` spelling.
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "off" => Self::Off,
            "all" => Self::All,
            "needs_input+failed" | "needs_input_failed" => Self::NeedsInputFailed,
            _ => Self::NeedsInputFailed,
        }
    }
}

impl<'de> Deserialize<'de> for NotifyPolicy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.as_deref().map(Self::parse).unwrap_or_default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Done,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Done => "done",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "running" => Self::Running,
            _ => Self::Done,
        }
    }
}

impl<'de> Deserialize<'de> for RunStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStream {
    Stdout,
    Stderr,
}

impl RunStream {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "stderr" => Self::Stderr,
            _ => Self::Stdout,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Workspace {
    pub id: String,
    pub title: String,
    pub repo_path: String,
    #[serde(default)]
    pub status: WorkspaceStatus,
    #[serde(default)]
    pub notify_policy: NotifyPolicy,
    #[serde(default)]
    pub default_thread_id: Option<String>,
    #[serde(default)]
    pub test_command_override: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct NewWorkspace {
    pub title: String,
    pub repo_path: String,
    #[serde(default)]
    pub notify_policy: Option<NotifyPolicy>,
    #[serde(default)]
    pub default_thread_id: Option<String>,
    #[serde(default)]
    pub test_command_override: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct WorkspacePatch {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub repo_path: Option<String>,
    #[serde(default)]
    pub notify_policy: Option<NotifyPolicy>,
    #[serde(default, deserialize_with = "double_option")]
    pub default_thread_id: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub test_command_override: Option<Option<String>>,
}

impl WorkspacePatch {
    pub fn apply(self, workspace: &mut Workspace) {
        if let Some(title) = self.title {
            workspace.title = title;
        }
        if let Some(repo_path) = self.repo_path {
            workspace.repo_path = repo_path;
        }
        if let Some(policy) = self.notify_policy {
            workspace.notify_policy = policy;
        }
        if let Some(thread_id) = self.default_thread_id {
            workspace.default_thread_id = thread_id;
        }
        if let Some(command) = self.test_command_override {
            workspace.test_command_override = command;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Run {
    pub id: String,
    #[serde(default)]
    pub workspace_id: Option<String>,
    #[serde(rename = "type")]
    pub run_type: String,
    pub command: String,
    pub cwd: String,
    pub status: RunStatus,
    #[serde(default)]
    pub exit_code: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_snippet: Option<String>,
}

impl Run {
    pub fn is_done(&self) -> bool {
        self.status == RunStatus::Done
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewRun {
    pub workspace_id: Option<String>,
    pub run_type: String,
    pub command: String,
    pub cwd: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListRunsFilter {
    #[serde(default)]
    pub workspace_id: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunEvent {
    pub run_id: String,
    pub seq: i64,
    pub ts: DateTime<Utc>,
    pub stream: RunStream,
    pub chunk: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFinal {
    pub run_id: String,
    pub exit_code: Option<i32>,
    pub ts: DateTime<Utc>,
}

/// What a run subscriber receives: recorded chunks, then exactly one `final`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunStreamEvent {
    Chunk(RunEvent),
    Final(RunFinal),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ThreadMeta {
    pub thread_id: String,
    #[serde(default)]
    pub title_override: Option<String>,
    #[serde(default)]
    pub last_seen_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub archived: bool,
}

impl ThreadMeta {
    pub fn new(thread_id: &str) -> Self {
        Self {
            thread_id: thread_id.to_string(),
            title_override: None,
            last_seen_at: None,
            pinned: false,
            archived: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ThreadMetaPatch {
    #[serde(default, deserialize_with = "double_option")]
    pub title_override: Option<Option<String>>,
    #[serde(default)]
    pub last_seen_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pinned: Option<bool>,
    #[serde(default)]
    pub archived: Option<bool>,
}

impl ThreadMetaPatch {
    pub fn apply(self, meta: &mut ThreadMeta) {
        if let Some(title) = self.title_override {
            meta.title_override = title;
        }
        if let Some(seen) = self.last_seen_at {
            meta.last_seen_at = Some(seen);
        }
        if let Some(pinned) = self.pinned {
            meta.pinned = pinned;
        }
        if let Some(archived) = self.archived {
            meta.archived = archived;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceThread {
    pub workspace_id: String,
    pub thread_id: String,
    pub created_at: DateTime<Utc>,
}

// Distinguishes an absent field (no change) from an explicit `null` (clear).
fn double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}
