#![forbid(unsafe_code)]

//! The server loop: poll → buffer → dispatch → drain check.
//!
//! Single-threaded cooperative. Events accumulate during a dispatch but do
//! not interrupt it; the only suspension points are subprocess waits and the
//! polling sleep. Shutdown is process-level (the loop runs until the process
//! is signalled), and startup recovery plus the L0 drain check make a kill at
//! any point safe.

use std::path::Path;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::briefing::regenerate_l0_briefing;
use crate::buffer::{ContextBuffer, FillInfo};
use crate::dispatcher::{DispatchOutcome, Dispatcher};
use crate::error::ServerError;
use crate::watcher::{DocPoller, GitPoller, SessionPoller};
use engram_core::Config;
use engram_fold::{engram_dir, queue_is_empty};
use engram_storage::{DispatchRow, ServerState, StateStore};

/// If the briefing is stale and the queue has drained, regenerate the L0
/// briefing and clear the flag. A failed regeneration leaves the flag set so
/// the next iteration retries.
fn l0_check(config: &Config, project_root: &Path, store: &StateStore) -> Result<(), ServerError> {
    if !store.l0_stale()? || !queue_is_empty(project_root) {
        return Ok(());
    }
    info!("queue drained: regenerating L0 briefing");
    let doc_paths = config.doc_paths(project_root);
    if regenerate_l0_briefing(config, project_root, &doc_paths) {
        store.clear_l0_stale()?;
    }
    Ok(())
}

/// Startup recovery followed by the same drain check the loop runs.
fn recover_and_check(
    config: &Config,
    project_root: &Path,
    store: &mut StateStore,
) -> Result<(), ServerError> {
    let dispatcher = Dispatcher::new(config, project_root);
    let stale = store.recover_on_startup()?;
    for dispatch in stale {
        info!(
            dispatch_id = dispatch.id,
            state = dispatch.state.as_str(),
            "recovering dispatch"
        );
        dispatcher.recover(store, &dispatch)?;
    }
    l0_check(config, project_root, store)
}

/// Run the engram knowledge server in the foreground. Exits only when the
/// process is signalled.
pub fn run_server(config: &Config, project_root: &Path) -> Result<(), ServerError> {
    let mut store = StateStore::open(engram_dir(project_root))?;

    info!("checking for incomplete dispatches");
    recover_and_check(config, project_root, &mut store)?;

    let buffer = ContextBuffer::new(config, project_root);
    let dispatcher = Dispatcher::new(config, project_root);
    let mut doc_poller = DocPoller::new(config, project_root);
    let mut git_poller = GitPoller::new(config, project_root);
    let mut session_poller = SessionPoller::new(config, project_root);

    // Restore polling bookmarks.
    let state = store.server_state()?;
    git_poller.set_last_commit(state.last_poll_commit.clone());
    session_poller.set_bookmarks(state.last_session_mtime, state.last_session_offset);

    let poll_interval = Duration::from_secs(config.poll_interval_secs.max(1));
    info!(
        poll_interval_secs = config.poll_interval_secs,
        project = %project_root.display(),
        "engram server started"
    );

    loop {
        if let Err(err) = run_iteration(
            config,
            project_root,
            &mut store,
            &buffer,
            &dispatcher,
            &mut doc_poller,
            &mut git_poller,
            &mut session_poller,
        ) {
            error!(%err, "error in server loop");
        }
        std::thread::sleep(poll_interval);
    }
}

/// One loop iteration; extracted so error handling and tests can drive it.
#[allow(clippy::too_many_arguments)]
pub(crate) fn run_iteration(
    config: &Config,
    project_root: &Path,
    store: &mut StateStore,
    buffer: &ContextBuffer<'_>,
    dispatcher: &Dispatcher<'_>,
    doc_poller: &mut DocPoller,
    git_poller: &mut GitPoller,
    session_poller: &mut SessionPoller,
) -> Result<(), ServerError> {
    for item in git_poller.poll() {
        buffer.add_item(store, &item)?;
    }
    if let Some(commit) = git_poller.last_commit() {
        store.set_last_poll_commit(commit)?;
    }

    let session_items = session_poller.poll();
    if !session_items.is_empty() {
        info!(count = session_items.len(), "sessions: new entries");
    }
    for item in &session_items {
        buffer.add_item(store, item)?;
    }
    let (mtime, offset) = session_poller.bookmarks();
    store.set_session_bookmarks(mtime, offset)?;

    for item in doc_poller.poll() {
        buffer.add_item(store, &item)?;
    }

    if let Some(reason) = buffer.should_dispatch(store)? {
        info!(%reason, "dispatch triggered");
        match dispatcher.dispatch(store)? {
            DispatchOutcome::Committed => info!("dispatch completed"),
            DispatchOutcome::QueueDrained => info!("nothing to dispatch"),
            DispatchOutcome::LockHeld => warn!("dispatch skipped: active chunk present"),
            DispatchOutcome::Failed => warn!("dispatch failed"),
        }
    }

    // Unconditional drain check — every iteration, not only after dispatch.
    l0_check(config, project_root, store)?;

    store.touch_last_poll_time()?;
    Ok(())
}

/// Current server status for CLI display.
#[derive(Debug)]
pub struct Status {
    pub fill: FillInfo,
    pub pending_items: usize,
    pub last_dispatch: Option<DispatchRow>,
    pub recent_dispatches: Vec<DispatchRow>,
    pub state: ServerState,
    pub queue_empty: bool,
}

pub fn get_status(config: &Config, project_root: &Path) -> Result<Status, ServerError> {
    let store = StateStore::open(engram_dir(project_root))?;
    let buffer = ContextBuffer::new(config, project_root);
    Ok(Status {
        fill: buffer.fill_info(&store)?,
        pending_items: store.buffer_items()?.len(),
        last_dispatch: store.last_dispatch()?,
        recent_dispatches: store.recent_dispatches(5)?,
        state: store.server_state()?,
        queue_empty: queue_is_empty(project_root),
    })
}

/// Startup recovery entry point shared with the CLI (`run` performs it
/// before entering the loop; one-shot commands can invoke it directly).
pub fn recover_on_startup(config: &Config, project_root: &Path) -> Result<(), ServerError> {
    let mut store = StateStore::open(engram_dir(project_root))?;
    recover_and_check(config, project_root, &mut store)
}
