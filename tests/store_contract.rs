use local_agent_dashboard_lib::db::{JsonFileStore, SqliteStore, Store};
use local_agent_dashboard_lib::errors::AppError;
use local_agent_dashboard_lib::models::{
    ListRunsFilter, NewRun, NewWorkspace, NotifyPolicy, RunStatus, RunStream, ThreadMetaPatch, WorkspacePatch,
    WorkspaceStatus, STALE_RUN_EXIT_CODE,
};
use std::sync::Arc;
use tempfile::TempDir;

fn sqlite_store() -> (TempDir, Arc<dyn Store>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SqliteStore::open(&dir.path().join("state.sqlite")).expect("sqlite store");
    (dir, Arc::new(store))
}

fn json_store() -> (TempDir, Arc<dyn Store>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = JsonFileStore::open(&dir.path().join("state.json")).expect("json store");
    (dir, Arc::new(store))
}

fn workspace(store: &dyn Store, repo_path: &str) -> String {
    store
        .create_workspace(NewWorkspace {
            title: String::new(),
            repo_path: repo_path.to_string(),
            ..NewWorkspace::default()
        })
        .expect("create workspace")
        .id
}

fn run(store: &dyn Store, workspace_id: Option<&str>, run_type: &str) -> String {
    store
        .create_run(NewRun {
            workspace_id: workspace_id.map(ToString::to_string),
            run_type: run_type.to_string(),
            command: format!("{} command", run_type),
            cwd: "/src/api".to_string(),
        })
        .expect("create run")
        .id
}

fn workspace_defaults_and_patches(store: Arc<dyn Store>) {
    let id = workspace(store.as_ref(), "/src/api-server");
    let created = store.get_workspace(&id).expect("get").expect("exists");
    assert_eq!(created.title, "api-server");
    assert_eq!(created.status, WorkspaceStatus::Idle);
    assert_eq!(created.notify_policy, NotifyPolicy::NeedsInputFailed);

    let updated = store
        .update_workspace(
            &id,
            WorkspacePatch {
                title: Some("API".to_string()),
                notify_policy: Some(NotifyPolicy::All),
                default_thread_id: Some(Some("thr_1".to_string())),
                ..WorkspacePatch::default()
            },
        )
        .expect("update")
        .expect("exists");
    assert_eq!(updated.title, "API");
    assert_eq!(updated.notify_policy, NotifyPolicy::All);
    assert_eq!(updated.default_thread_id.as_deref(), Some("thr_1"));
    assert!(updated.updated_at >= created.updated_at);

    let cleared = store
        .update_workspace(
            &id,
            WorkspacePatch {
                default_thread_id: Some(None),
                ..WorkspacePatch::default()
            },
        )
        .expect("update")
        .expect("exists");
    assert_eq!(cleared.default_thread_id, None);
    assert_eq!(cleared.title, "API");

    assert!(store
        .update_workspace("missing", WorkspacePatch::default())
        .expect("update missing")
        .is_none());
    assert!(matches!(
        store.create_workspace(NewWorkspace {
            repo_path: "   ".to_string(),
            ..NewWorkspace::default()
        }),
        Err(AppError::Validation(_))
    ));

    store
        .set_workspace_status(&id, WorkspaceStatus::NeedsInput)
        .expect("set status");
    let reread = store.get_workspace(&id).expect("get").expect("exists");
    assert_eq!(reread.status, WorkspaceStatus::NeedsInput);
}

fn listings_are_newest_first(store: Arc<dyn Store>) {
    let first = workspace(store.as_ref(), "/src/a");
    let second = workspace(store.as_ref(), "/src/b");
    let ids = store
        .list_workspaces()
        .expect("list")
        .into_iter()
        .map(|workspace| workspace.id)
        .collect::<Vec<_>>();
    assert_eq!(ids, vec![second.clone(), first.clone()]);

    let older = run(store.as_ref(), Some(&first), "git_status");
    let newer = run(store.as_ref(), Some(&first), "git_diff");
    let other = run(store.as_ref(), Some(&second), "test");
    let unscoped = run(store.as_ref(), None, "bootstrap");

    let all = store.list_runs(&ListRunsFilter::default()).expect("all runs");
    assert_eq!(
        all.iter().map(|run| run.id.clone()).collect::<Vec<_>>(),
        vec![unscoped, other, newer.clone(), older.clone()]
    );

    let scoped = store
        .list_runs(&ListRunsFilter {
            workspace_id: Some(first.clone()),
            limit: None,
        })
        .expect("scoped runs");
    assert_eq!(
        scoped.iter().map(|run| run.id.clone()).collect::<Vec<_>>(),
        vec![newer.clone(), older]
    );

    let limited = store
        .list_runs(&ListRunsFilter {
            workspace_id: Some(first),
            limit: Some(1),
        })
        .expect("limited runs");
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0].id, newer);
    assert_eq!(limited[0].run_type, "git_diff");
    assert_eq!(limited[0].status, RunStatus::Running);
}

fn event_seqs_are_contiguous_under_concurrency(store: Arc<dyn Store>) {
    let run_id = run(store.as_ref(), None, "test");
    let writers = (0..4)
        .map(|writer| {
            let store = store.clone();
            let run_id = run_id.clone();
            std::thread::spawn(move || {
                for index in 0..25 {
                    let stream = if index % 2 == 0 { RunStream::Stdout } else { RunStream::Stderr };
                    store
                        .append_run_event(&run_id, stream, &format!("writer {} line {}\n", writer, index))
                        .expect("append");
                }
            })
        })
        .collect::<Vec<_>>();
    for writer in writers {
        writer.join().expect("writer thread");
    }

    let events = store.list_run_events(&run_id, None).expect("events");
    let seqs = events.iter().map(|event| event.seq).collect::<Vec<_>>();
    assert_eq!(seqs, (1..=100).collect::<Vec<i64>>());

    let tail = store.list_run_events(&run_id, Some(97)).expect("tail");
    assert_eq!(tail.iter().map(|event| event.seq).collect::<Vec<_>>(), vec![98, 99, 100]);
    assert!(matches!(
        store.append_run_event("missing-run", RunStream::Stdout, "x"),
        Err(AppError::NotFound(_))
    ));
}

fn finish_and_snippet(store: Arc<dyn Store>) {
    let run_id = run(store.as_ref(), None, "test");
    let event = store
        .append_run_output(&run_id, RunStream::Stdout, "halfway\n", "halfway")
        .expect("output");
    assert_eq!(event.seq, 1);
    let running = store.get_run(&run_id).expect("get").expect("run");
    assert_eq!(running.last_snippet.as_deref(), Some("halfway"));
    assert_eq!(running.updated_at, event.ts);
    assert_eq!(store.list_run_events(&run_id, None).expect("events").len(), 1);
    assert!(matches!(
        store.append_run_output("missing-run", RunStream::Stdout, "x", "x"),
        Err(AppError::NotFound(_))
    ));

    store.finish_run(&run_id, Some(2), Some("tail")).expect("finish");
    let finished = store.get_run(&run_id).expect("get").expect("run");
    assert_eq!(finished.status, RunStatus::Done);
    assert_eq!(finished.exit_code, Some(2));
    assert_eq!(finished.last_snippet.as_deref(), Some("tail"));

    store.finish_run(&run_id, None, None).expect("finish without snippet");
    let refinished = store.get_run(&run_id).expect("get").expect("run");
    assert_eq!(refinished.exit_code, None);
    assert_eq!(refinished.last_snippet.as_deref(), Some("tail"));
}

fn stale_sweep_closes_running_runs(store: Arc<dyn Store>) {
    let done = run(store.as_ref(), None, "test");
    store.finish_run(&done, Some(0), None).expect("finish");
    let stale = (0..3).map(|_| run(store.as_ref(), None, "message")).collect::<Vec<_>>();

    assert_eq!(store.mark_stale_runs().expect("sweep"), 3);
    for run_id in &stale {
        let run = store.get_run(run_id).expect("get").expect("run");
        assert_eq!(run.status, RunStatus::Done);
        assert_eq!(run.exit_code, Some(STALE_RUN_EXIT_CODE));
    }
    assert_eq!(store.get_run(&done).expect("get").expect("run").exit_code, Some(0));
    assert_eq!(store.mark_stale_runs().expect("second sweep"), 0);
}

fn delete_cascades_but_keeps_thread_meta(store: Arc<dyn Store>) {
    let doomed = workspace(store.as_ref(), "/src/doomed");
    let kept = workspace(store.as_ref(), "/src/kept");
    let first = run(store.as_ref(), Some(&doomed), "test");
    let second = run(store.as_ref(), Some(&doomed), "git_status");
    let survivor = run(store.as_ref(), Some(&kept), "test");
    for index in 0..5 {
        let run_id = if index < 3 { &first } else { &second };
        store
            .append_run_event(run_id, RunStream::Stdout, "chunk")
            .expect("append");
    }
    store.append_run_event(&survivor, RunStream::Stdout, "kept").expect("append");
    store.link_workspace_thread(&doomed, "thr_1").expect("link");
    store
        .upsert_thread_meta(
            "thr_1",
            ThreadMetaPatch {
                pinned: Some(true),
                ..ThreadMetaPatch::default()
            },
        )
        .expect("meta");

    assert!(store.delete_workspace(&doomed).expect("delete"));
    assert!(!store.delete_workspace(&doomed).expect("second delete"));

    assert!(store.get_workspace(&doomed).expect("get").is_none());
    assert!(store.get_run(&first).expect("get").is_none());
    assert!(store.get_run(&second).expect("get").is_none());
    assert!(store.list_run_events(&first, None).expect("events").is_empty());
    assert!(store.list_run_events(&second, None).expect("events").is_empty());
    assert!(store.list_workspace_threads(&doomed).expect("links").is_empty());
    let remaining = store.list_runs(&ListRunsFilter::default()).expect("runs");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, survivor);
    assert_eq!(store.list_run_events(&survivor, None).expect("events").len(), 1);

    let meta = store.get_thread_meta("thr_1").expect("meta").expect("meta survives");
    assert!(meta.pinned);
}

fn thread_links_and_meta(store: Arc<dyn Store>) {
    let id = workspace(store.as_ref(), "/src/api");
    let link = store.link_workspace_thread(&id, "thr_b").expect("link");
    let again = store.link_workspace_thread(&id, "thr_b").expect("relink");
    assert_eq!(link, again);
    store.link_workspace_thread(&id, "thr_a").expect("link");
    assert_eq!(store.list_workspace_threads(&id).expect("links").len(), 2);
    assert!(matches!(
        store.link_workspace_thread("missing", "thr_a"),
        Err(AppError::NotFound(_))
    ));

    assert!(store.unlink_workspace_thread(&id, "thr_b").expect("unlink"));
    assert!(!store.unlink_workspace_thread(&id, "thr_b").expect("unlink again"));
    let links = store.list_workspace_threads(&id).expect("links");
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].thread_id, "thr_a");

    assert!(store.get_thread_meta("thr_z").expect("meta").is_none());
    let created = store
        .upsert_thread_meta(
            "thr_z",
            ThreadMetaPatch {
                title_override: Some(Some("Refactor".to_string())),
                ..ThreadMetaPatch::default()
            },
        )
        .expect("upsert");
    assert_eq!(created.title_override.as_deref(), Some("Refactor"));
    assert!(!created.archived);

    let archived = store
        .upsert_thread_meta(
            "thr_z",
            ThreadMetaPatch {
                archived: Some(true),
                ..ThreadMetaPatch::default()
            },
        )
        .expect("upsert");
    assert!(archived.archived);
    assert_eq!(archived.title_override.as_deref(), Some("Refactor"));

    store
        .upsert_thread_meta("thr_y", ThreadMetaPatch::default())
        .expect("upsert");
    let ids = store
        .list_thread_meta()
        .expect("list meta")
        .into_iter()
        .map(|meta| meta.thread_id)
        .collect::<Vec<_>>();
    assert_eq!(ids, vec!["thr_y".to_string(), "thr_z".to_string()]);
}

macro_rules! store_contract {
    ($($case:ident),* $(,)?) => {
        mod sqlite {
            $(
                #[test]
                fn $case() {
                    let (_dir, store) = super::sqlite_store();
                    super::$case(store);
                }
            )*
        }

        mod json_file {
            $(
                #[test]
                fn $case() {
                    let (_dir, store) = super::json_store();
                    super::$case(store);
                }
            )*
        }
    };
}

store_contract!(
    workspace_defaults_and_patches,
    listings_are_newest_first,
    event_seqs_are_contiguous_under_concurrency,
    finish_and_snippet,
    stale_sweep_closes_running_runs,
    delete_cascades_but_keeps_thread_meta,
    thread_links_and_meta,
);

#[test]
fn json_file_write_failure_leaves_no_trace() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("state.json");
    let store = JsonFileStore::open(&path).expect("json store");
    let run_id = run(&store, None, "test");

    let blocker = dir.path().join("state.json.tmp");
    std::fs::create_dir(&blocker).expect("block tmp file");
    assert!(store.append_run_event(&run_id, RunStream::Stdout, "lost").is_err());
    assert!(store.append_run_output(&run_id, RunStream::Stdout, "lost", "lost").is_err());
    std::fs::remove_dir(&blocker).expect("unblock tmp file");

    let event = store
        .append_run_event(&run_id, RunStream::Stdout, "after")
        .expect("append after failure");
    assert_eq!(event.seq, 1);
    let chunks = store
        .list_run_events(&run_id, None)
        .expect("events")
        .into_iter()
        .map(|event| (event.seq, event.chunk))
        .collect::<Vec<_>>();
    assert_eq!(chunks, vec![(1, "after".to_string())]);
    assert_eq!(store.get_run(&run_id).expect("get").expect("run").last_snippet, None);

    let reopened = JsonFileStore::open(&path).expect("reopen");
    assert_eq!(reopened.list_run_events(&run_id, None).expect("events").len(), 1);
}
