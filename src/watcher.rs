//! Filesystem event adapter.
//!
//! Wraps the OS notification backend behind a cloneable handle and maps its
//! event taxonomy down to the five operations the engine reasons about.
//! Watches are non-recursive: the walker registers every directory it
//! visits, and the engine attaches new directories as they appear.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsOp {
    Create,
    Write,
    Chmod,
    Remove,
    Rename,
}

#[derive(Debug, Clone)]
pub struct FsEvent {
    pub path: PathBuf,
    pub op: FsOp,
}

/// Cloneable, thread-safe handle over the OS watcher. The notify callback
/// runs on its own thread and forwards events into the engine's channel;
/// a full channel blocks the callback, which is the intended backpressure.
#[derive(Clone)]
pub struct WatchHandle {
    inner: Arc<Mutex<RecommendedWatcher>>,
}

impl WatchHandle {
    pub fn new(events: mpsc::Sender<FsEvent>) -> notify::Result<Self> {
        let watcher = RecommendedWatcher::new(
            move |result: notify::Result<Event>| match result {
                Ok(event) => {
                    let Some(op) = map_kind(&event.kind) else {
                        return;
                    };
                    for path in &event.paths {
                        let fs_event = FsEvent {
                            path: path.clone(),
                            op,
                        };
                        if events.blocking_send(fs_event).is_err() {
                            return;
                        }
                    }
                }
                Err(err) => warn!("watch error: {err}"),
            },
            Config::default(),
        )?;

        Ok(WatchHandle {
            inner: Arc::new(Mutex::new(watcher)),
        })
    }

    pub fn watch_dir(&self, dir: &Path) -> notify::Result<()> {
        self.lock().watch(dir, RecursiveMode::NonRecursive)
    }

    pub fn unwatch(&self, dir: &Path) -> notify::Result<()> {
        self.lock().unwatch(dir)
    }

    fn lock(&self) -> MutexGuard<'_, RecommendedWatcher> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn map_kind(kind: &EventKind) -> Option<FsOp> {
    match kind {
        EventKind::Create(_) => Some(FsOp::Create),
        EventKind::Remove(_) => Some(FsOp::Remove),
        // The target of a rename is a fresh path; the source is a removal
        // in disguise and handled as a rename.
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => Some(FsOp::Create),
        EventKind::Modify(ModifyKind::Name(_)) => Some(FsOp::Rename),
        EventKind::Modify(ModifyKind::Metadata(_)) => Some(FsOp::Chmod),
        EventKind::Modify(_) => Some(FsOp::Write),
        _ => None,
    }
}
