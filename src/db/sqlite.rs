use super::json_file::load_state;
use super::{build_run, build_workspace, patch_workspace, Store, StoreBackend};
use crate::errors::{AppError, AppResult};
use crate::models::{
    now_utc, ListRunsFilter, NewRun, NewWorkspace, NotifyPolicy, Run, RunEvent, RunStatus, RunStream,
    ThreadMeta, ThreadMetaPatch, Workspace, WorkspacePatch, WorkspaceStatus, WorkspaceThread,
    STALE_RUN_EXIT_CODE,
};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

const SCHEMA_SQL: &str = include_str!("schema.sql");

const WORKSPACE_COLUMNS: &str = "id, title, repo_path, status, notify_policy, default_thread_id,
       test_command_override, created_at, updated_at";
const RUN_COLUMNS: &str = "id, workspace_id, type, command, cwd, status, exit_code, last_snippet,
       created_at, updated_at";

#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl SqliteStore {
    pub fn open(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        Ok(Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Copies a JSON state file into the database, but only while the
    /// database holds no workspaces and no runs.
    pub fn import_json_state_if_empty(&self, path: &Path) -> AppResult<bool> {
        let (state, _) = load_state(path)?;
        let mut conn = self.lock()?;
        let existing: i64 = conn.query_row(
            "SELECT (SELECT COUNT(*) FROM workspaces) + (SELECT COUNT(*) FROM runs)",
            [],
            |row| row.get(0),
        )?;
        if existing > 0 {
            return Ok(false);
        }

        let tx = conn.transaction()?;
        for workspace in &state.workspaces {
            insert_workspace(&tx, workspace)?;
        }
        for run in &state.runs {
            insert_run(&tx, run)?;
        }
        for event in &state.run_events {
            tx.execute(
                "INSERT OR IGNORE INTO run_events (run_id, seq, ts, stream, chunk) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![event.run_id, event.seq, fmt_time(event.ts), event.stream.as_str(), event.chunk],
            )?;
        }
        for meta in &state.thread_meta {
            write_thread_meta(&tx, meta)?;
        }
        for link in &state.workspace_threads {
            tx.execute(
                "INSERT OR IGNORE INTO workspace_threads (workspace_id, thread_id, created_at) VALUES (?1, ?2, ?3)",
                params![link.workspace_id, link.thread_id, fmt_time(link.created_at)],
            )?;
        }
        tx.commit()?;
        Ok(true)
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    fn touch_run(conn: &Connection, run_id: &str, sql: &str, params: &[&dyn rusqlite::ToSql]) -> AppResult<()> {
        let changed = conn.execute(sql, params)?;
        if changed == 0 {
            return Err(AppError::NotFound(format!("Run {} not found", run_id)));
        }
        Ok(())
    }

    fn insert_event(conn: &Connection, run_id: &str, stream: RunStream, chunk: &str) -> AppResult<RunEvent> {
        let known: Option<String> = conn
            .query_row("SELECT id FROM runs WHERE id = ?1", params![run_id], |row| row.get(0))
            .optional()?;
        if known.is_none() {
            return Err(AppError::NotFound(format!("Run {} not found", run_id)));
        }
        let seq: i64 = conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM run_events WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )?;
        let ts = now_utc();
        conn.execute(
            "INSERT INTO run_events (run_id, seq, ts, stream, chunk) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![run_id, seq, fmt_time(ts), stream.as_str(), chunk],
        )?;
        Ok(RunEvent {
            run_id: run_id.to_string(),
            seq,
            ts,
            stream,
            chunk: chunk.to_string(),
        })
    }
}

impl Store for SqliteStore {
    fn backend(&self) -> StoreBackend {
        StoreBackend::Sqlite
    }

    fn list_workspaces(&self) -> AppResult<Vec<Workspace>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {WORKSPACE_COLUMNS} FROM workspaces ORDER BY created_at DESC, rowid DESC"
        ))?;
        let rows = stmt.query_map([], parse_workspace_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn get_workspace(&self, workspace_id: &str) -> AppResult<Option<Workspace>> {
        let conn = self.lock()?;
        Ok(query_workspace(&conn, workspace_id)?)
    }

    fn create_workspace(&self, input: NewWorkspace) -> AppResult<Workspace> {
        let workspace = build_workspace(input)?;
        let conn = self.lock()?;
        insert_workspace(&conn, &workspace)?;
        Ok(workspace)
    }

    fn update_workspace(&self, workspace_id: &str, patch: WorkspacePatch) -> AppResult<Option<Workspace>> {
        let conn = self.lock()?;
        let Some(mut workspace) = query_workspace(&conn, workspace_id)? else {
            return Ok(None);
        };
        patch_workspace(&mut workspace, patch)?;
        conn.execute(
            "UPDATE workspaces
             SET title = ?2, repo_path = ?3, notify_policy = ?4, default_thread_id = ?5,
                 test_command_override = ?6, updated_at = ?7
             WHERE id = ?1",
            params![
                workspace.id,
                workspace.title,
                workspace.repo_path,
                workspace.notify_policy.as_str(),
                workspace.default_thread_id,
                workspace.test_command_override,
                fmt_time(workspace.updated_at),
            ],
        )?;
        Ok(Some(workspace))
    }

    fn set_workspace_status(&self, workspace_id: &str, status: WorkspaceStatus) -> AppResult<()> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE workspaces SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![workspace_id, status.as_str(), fmt_time(now_utc())],
        )?;
        if changed == 0 {
            return Err(AppError::NotFound(format!("Workspace {} not found", workspace_id)));
        }
        Ok(())
    }

    fn delete_workspace(&self, workspace_id: &str) -> AppResult<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM run_events WHERE run_id IN (SELECT id FROM runs WHERE workspace_id = ?1)",
            params![workspace_id],
        )?;
        tx.execute("DELETE FROM runs WHERE workspace_id = ?1", params![workspace_id])?;
        tx.execute(
            "DELETE FROM workspace_threads WHERE workspace_id = ?1",
            params![workspace_id],
        )?;
        let removed = tx.execute("DELETE FROM workspaces WHERE id = ?1", params![workspace_id])?;
        tx.commit()?;
        Ok(removed > 0)
    }

    fn create_run(&self, input: NewRun) -> AppResult<Run> {
        let run = build_run(input);
        let conn = self.lock()?;
        insert_run(&conn, &run)?;
        Ok(run)
    }

    fn get_run(&self, run_id: &str) -> AppResult<Option<Run>> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"),
                params![run_id],
                parse_run_row,
            )
            .optional()?)
    }

    fn list_runs(&self, filter: &ListRunsFilter) -> AppResult<Vec<Run>> {
        let conn = self.lock()?;
        let limit = filter.limit.map(|limit| limit as i64).unwrap_or(-1);
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM runs
             WHERE (?1 IS NULL OR workspace_id = ?1)
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![filter.workspace_id, limit], parse_run_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn finish_run(&self, run_id: &str, exit_code: Option<i32>, last_snippet: Option<&str>) -> AppResult<()> {
        let conn = self.lock()?;
        Self::touch_run(
            &conn,
            run_id,
            "UPDATE runs
             SET status = ?2, exit_code = ?3, last_snippet = COALESCE(?4, last_snippet), updated_at = ?5
             WHERE id = ?1",
            params![run_id, RunStatus::Done.as_str(), exit_code, last_snippet, fmt_time(now_utc())],
        )
    }

    fn append_run_event(&self, run_id: &str, stream: RunStream, chunk: &str) -> AppResult<RunEvent> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let event = Self::insert_event(&tx, run_id, stream, chunk)?;
        tx.commit()?;
        Ok(event)
    }

    fn append_run_output(&self, run_id: &str, stream: RunStream, chunk: &str, snippet: &str) -> AppResult<RunEvent> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let event = Self::insert_event(&tx, run_id, stream, chunk)?;
        tx.execute(
            "UPDATE runs SET last_snippet = ?2, updated_at = ?3 WHERE id = ?1",
            params![run_id, snippet, fmt_time(event.ts)],
        )?;
        tx.commit()?;
        Ok(event)
    }

    fn list_run_events(&self, run_id: &str, after_seq: Option<i64>) -> AppResult<Vec<RunEvent>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT run_id, seq, ts, stream, chunk FROM run_events
             WHERE run_id = ?1 AND seq > ?2
             ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![run_id, after_seq.unwrap_or(0)], |row| {
            Ok(RunEvent {
                run_id: row.get(0)?,
                seq: row.get(1)?,
                ts: parse_time(&row.get::<_, String>(2)?)?,
                stream: RunStream::parse(&row.get::<_, String>(3)?),
                chunk: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn mark_stale_runs(&self) -> AppResult<u64> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE runs SET status = ?1, exit_code = ?2, updated_at = ?3 WHERE status = ?4",
            params![
                RunStatus::Done.as_str(),
                STALE_RUN_EXIT_CODE,
                fmt_time(now_utc()),
                RunStatus::Running.as_str()
            ],
        )?;
        Ok(changed as u64)
    }

    fn get_thread_meta(&self, thread_id: &str) -> AppResult<Option<ThreadMeta>> {
        let conn = self.lock()?;
        Ok(query_thread_meta(&conn, thread_id)?)
    }

    fn upsert_thread_meta(&self, thread_id: &str, patch: ThreadMetaPatch) -> AppResult<ThreadMeta> {
        let conn = self.lock()?;
        let mut meta = query_thread_meta(&conn, thread_id)?.unwrap_or_else(|| ThreadMeta::new(thread_id));
        patch.apply(&mut meta);
        write_thread_meta(&conn, &meta)?;
        Ok(meta)
    }

    fn list_thread_meta(&self) -> AppResult<Vec<ThreadMeta>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT thread_id, title_override, last_seen_at, pinned, archived
             FROM thread_meta ORDER BY thread_id ASC",
        )?;
        let rows = stmt.query_map([], parse_thread_meta_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn link_workspace_thread(&self, workspace_id: &str, thread_id: &str) -> AppResult<WorkspaceThread> {
        let conn = self.lock()?;
        if query_workspace(&conn, workspace_id)?.is_none() {
            return Err(AppError::NotFound(format!("Workspace {} not found", workspace_id)));
        }
        conn.execute(
            "INSERT OR IGNORE INTO workspace_threads (workspace_id, thread_id, created_at) VALUES (?1, ?2, ?3)",
            params![workspace_id, thread_id, fmt_time(now_utc())],
        )?;
        let link = conn.query_row(
            "SELECT workspace_id, thread_id, created_at FROM workspace_threads
             WHERE workspace_id = ?1 AND thread_id = ?2",
            params![workspace_id, thread_id],
            parse_link_row,
        )?;
        Ok(link)
    }

    fn unlink_workspace_thread(&self, workspace_id: &str, thread_id: &str) -> AppResult<bool> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM workspace_threads WHERE workspace_id = ?1 AND thread_id = ?2",
            params![workspace_id, thread_id],
        )?;
        Ok(removed > 0)
    }

    fn list_workspace_threads(&self, workspace_id: &str) -> AppResult<Vec<WorkspaceThread>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT workspace_id, thread_id, created_at FROM workspace_threads
             WHERE workspace_id = ?1
             ORDER BY created_at DESC, rowid DESC",
        )?;
        let rows = stmt.query_map(params![workspace_id], parse_link_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

fn insert_workspace(conn: &Connection, workspace: &Workspace) -> AppResult<()> {
    conn.execute(
        "INSERT OR IGNORE INTO workspaces (
           id, title, repo_path, status, notify_policy, default_thread_id,
           test_command_override, created_at, updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            workspace.id,
            workspace.title,
            workspace.repo_path,
            workspace.status.as_str(),
            workspace.notify_policy.as_str(),
            workspace.default_thread_id,
            workspace.test_command_override,
            fmt_time(workspace.created_at),
            fmt_time(workspace.updated_at),
        ],
    )?;
    Ok(())
}

fn insert_run(conn: &Connection, run: &Run) -> AppResult<()> {
    conn.execute(
        "INSERT OR IGNORE INTO runs (
           id, workspace_id, type, command, cwd, status, exit_code, last_snippet, created_at, updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            run.id,
            run.workspace_id,
            run.run_type,
            run.command,
            run.cwd,
            run.status.as_str(),
            run.exit_code,
            run.last_snippet,
            fmt_time(run.created_at),
            fmt_time(run.updated_at),
        ],
    )?;
    Ok(())
}

fn write_thread_meta(conn: &Connection, meta: &ThreadMeta) -> AppResult<()> {
    conn.execute(
        "INSERT INTO thread_meta (thread_id, title_override, last_seen_at, pinned, archived)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(thread_id) DO UPDATE SET
           title_override = excluded.title_override,
           last_seen_at = excluded.last_seen_at,
           pinned = excluded.pinned,
           archived = excluded.archived",
        params![
            meta.thread_id,
            meta.title_override,
            meta.last_seen_at.map(fmt_time),
            meta.pinned,
            meta.archived,
        ],
    )?;
    Ok(())
}

fn query_workspace(conn: &Connection, workspace_id: &str) -> rusqlite::Result<Option<Workspace>> {
    conn.query_row(
        &format!("SELECT {WORKSPACE_COLUMNS} FROM workspaces WHERE id = ?1"),
        params![workspace_id],
        parse_workspace_row,
    )
    .optional()
}

fn query_thread_meta(conn: &Connection, thread_id: &str) -> rusqlite::Result<Option<ThreadMeta>> {
    conn.query_row(
        "SELECT thread_id, title_override, last_seen_at, pinned, archived FROM thread_meta WHERE thread_id = ?1",
        params![thread_id],
        parse_thread_meta_row,
    )
    .optional()
}

fn parse_workspace_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Workspace> {
    Ok(Workspace {
        id: row.get(0)?,
        title: row.get(1)?,
        repo_path: row.get(2)?,
        status: WorkspaceStatus::parse(&row.get::<_, String>(3)?),
        notify_policy: NotifyPolicy::parse(&row.get::<_, String>(4)?),
        default_thread_id: row.get(5)?,
        test_command_override: row.get(6)?,
        created_at: parse_time(&row.get::<_, String>(7)?)?,
        updated_at: parse_time(&row.get::<_, String>(8)?)?,
    })
}

fn parse_run_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Run> {
    Ok(Run {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        run_type: row.get(2)?,
        command: row.get(3)?,
        cwd: row.get(4)?,
        status: RunStatus::parse(&row.get::<_, String>(5)?),
        exit_code: row.get(6)?,
        last_snippet: row.get(7)?,
        created_at: parse_time(&row.get::<_, String>(8)?)?,
        updated_at: parse_time(&row.get::<_, String>(9)?)?,
    })
}

fn parse_thread_meta_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ThreadMeta> {
    Ok(ThreadMeta {
        thread_id: row.get(0)?,
        title_override: row.get(1)?,
        last_seen_at: row
            .get::<_, Option<String>>(2)?
            .map(|raw| parse_time(&raw))
            .transpose()?,
        pinned: row.get(3)?,
        archived: row.get(4)?,
    })
}

fn parse_link_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkspaceThread> {
    Ok(WorkspaceThread {
        workspace_id: row.get(0)?,
        thread_id: row.get(1)?,
        created_at: parse_time(&row.get::<_, String>(2)?)?,
    })
}

// Fixed width keeps lexical ORDER BY equal to chronological order.
fn fmt_time(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, error.to_string())),
            )
        })
}
