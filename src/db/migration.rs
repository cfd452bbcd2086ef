use crate::models::{now_utc, NotifyPolicy};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{json, Map, Value};

pub const STATE_VERSION: u64 = 2;

/// Upgrades older persisted shapes in place: `sessions` become `workspaces`,
/// run `session_id` becomes `workspace_id`, and the flat `threads_map` is split
/// into `thread_meta` rows plus `workspace_threads` links. Returns whether
/// anything was rewritten.
pub fn migrate_legacy_state(state: &mut Value) -> bool {
    if !state.is_object() {
        *state = json!({});
    }
    let Some(root) = state.as_object_mut() else {
        return false;
    };
    let mut changed = false;

    if let Some(sessions) = root.remove("sessions") {
        let workspaces = entries(sessions)
            .into_iter()
            .filter_map(|(key, session)| session_to_workspace(key, session))
            .collect::<Vec<_>>();
        let existing = root.entry("workspaces").or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(list) = existing {
            for workspace in workspaces {
                let id = workspace.get("id").cloned();
                if !list.iter().any(|current| current.get("id") == id.as_ref()) {
                    list.push(workspace);
                }
            }
        }
        changed = true;
    }

    if let Some(events) = root.remove("events") {
        root.entry("run_events").or_insert(events);
        changed = true;
    }

    if let Some(Value::Array(runs)) = root.get_mut("runs") {
        for run in runs.iter_mut().filter_map(Value::as_object_mut) {
            if let Some(session_id) = run.remove("session_id") {
                run.entry("workspace_id").or_insert(session_id);
                changed = true;
            }
        }
    }

    if let Some(threads_map) = root.remove("threads_map") {
        let mut metas = Vec::new();
        let mut links = Vec::new();
        for (thread_id, entry) in entries(threads_map) {
            let Some(thread_id) = thread_id.or_else(|| string_field(&entry, &["thread_id", "id"])) else {
                continue;
            };
            let (meta, link) = thread_entry_to_rows(&thread_id, &entry);
            metas.push(meta);
            if let Some(link) = link {
                links.push(link);
            }
        }
        append_unique(root, "thread_meta", metas, &["thread_id"]);
        append_unique(root, "workspace_threads", links, &["workspace_id", "thread_id"]);
        changed = true;
    }

    if let Some(Value::Array(workspaces)) = root.get_mut("workspaces") {
        for workspace in workspaces.iter_mut().filter_map(Value::as_object_mut) {
            if let Some(mode) = workspace.remove("notify_mode") {
                workspace.entry("notify_policy").or_insert(mode);
                changed = true;
            }
            let rename = match workspace.get("notify_policy") {
                Some(Value::String(policy)) => {
                    let normalized = NotifyPolicy::parse(policy).as_str();
                    (policy.as_str() != normalized).then_some(normalized)
                }
                _ => None,
            };
            if let Some(normalized) = rename {
                workspace.insert("notify_policy".to_string(), Value::String(normalized.to_string()));
                changed = true;
            }
        }
    }

    for key in ["workspaces", "runs", "run_events", "thread_meta", "workspace_threads"] {
        root.entry(key).or_insert_with(|| Value::Array(Vec::new()));
    }
    if root.get("version").and_then(Value::as_u64) != Some(STATE_VERSION) {
        root.insert("version".to_string(), json!(STATE_VERSION));
        changed = true;
    }

    changed
}

fn entries(value: Value) -> Vec<(Option<String>, Value)> {
    match value {
        Value::Array(items) => items.into_iter().map(|item| (None, item)).collect(),
        Value::Object(map) => map.into_iter().map(|(key, item)| (Some(key), item)).collect(),
        _ => Vec::new(),
    }
}

fn session_to_workspace(key: Option<String>, session: Value) -> Option<Value> {
    let id = string_field(&session, &["id"]).or(key)?;
    let repo_path = string_field(&session, &["repo_path", "repoPath", "path", "cwd"]).unwrap_or_default();
    let title = string_field(&session, &["title", "name"]).unwrap_or_else(|| default_title(&repo_path, &id));
    let created_at = timestamp_field(&session, &["created_at", "createdAt"]);
    let updated_at = session
        .get("updated_at")
        .or_else(|| session.get("updatedAt"))
        .map(normalize_timestamp)
        .unwrap_or_else(|| created_at.clone());
    let policy = string_field(&session, &["notify_policy", "notify_mode", "notifyMode"])
        .map(|raw| NotifyPolicy::parse(&raw))
        .unwrap_or_default();

    Some(json!({
        "id": id,
        "title": title,
        "repo_path": repo_path,
        "status": string_field(&session, &["status"]).unwrap_or_else(|| "idle".to_string()),
        "notify_policy": policy.as_str(),
        "default_thread_id": string_field(&session, &["default_thread_id", "thread_id", "threadId"]),
        "test_command_override": string_field(&session, &["test_command_override", "test_command", "testCommand"]),
        "created_at": created_at,
        "updated_at": updated_at,
    }))
}

fn thread_entry_to_rows(thread_id: &str, entry: &Value) -> (Value, Option<Value>) {
    let workspace_id = match entry {
        Value::String(session_id) => Some(session_id.clone()),
        _ => string_field(entry, &["workspace_id", "session_id", "sessionId"]),
    };
    let last_seen_at = entry
        .get("last_seen_at")
        .or_else(|| entry.get("lastSeenAt"))
        .filter(|value| !value.is_null())
        .map(normalize_timestamp);
    let meta = json!({
        "thread_id": thread_id,
        "title_override": string_field(entry, &["title_override", "title"]),
        "last_seen_at": last_seen_at,
        "pinned": entry.get("pinned").and_then(Value::as_bool).unwrap_or(false),
        "archived": entry.get("archived").and_then(Value::as_bool).unwrap_or(false),
    });
    let link = workspace_id.map(|workspace_id| {
        json!({
            "workspace_id": workspace_id,
            "thread_id": thread_id,
            "created_at": timestamp_field(entry, &["created_at", "createdAt"]),
        })
    });
    (meta, link)
}

fn append_unique(root: &mut Map<String, Value>, key: &str, rows: Vec<Value>, identity: &[&str]) {
    let target = root.entry(key).or_insert_with(|| Value::Array(Vec::new()));
    let Value::Array(list) = target else {
        return;
    };
    for row in rows {
        let duplicate = list
            .iter()
            .any(|current| identity.iter().all(|field| current.get(*field) == row.get(*field)));
        if !duplicate {
            list.push(row);
        }
    }
}

fn string_field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        value
            .get(*key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|raw| !raw.is_empty())
            .map(ToString::to_string)
    })
}

fn timestamp_field(value: &Value, keys: &[&str]) -> Value {
    keys.iter()
        .find_map(|key| value.get(*key).filter(|raw| !raw.is_null()))
        .map(normalize_timestamp)
        .unwrap_or_else(|| Value::String(format_timestamp(now_utc())))
}

/// Legacy files stored either RFC 3339 strings or epoch milliseconds.
fn normalize_timestamp(value: &Value) -> Value {
    let parsed = match value {
        Value::Number(number) => number
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        Value::String(raw) => DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        _ => None,
    };
    Value::String(format_timestamp(parsed.unwrap_or_else(now_utc)))
}

fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn default_title(repo_path: &str, id: &str) -> String {
    std::path::Path::new(repo_path)
        .file_name()
        .and_then(|name| name.to_str())
        .map(ToString::to_string)
        .unwrap_or_else(|| id.to_string())
}
