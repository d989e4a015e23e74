//! Session broadcaster: watches the runtime's transcript directory and
//! fans out `sync_update` events so multiple UIs observing the same
//! session stay in sync.

use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebouncedEvent, Debouncer};
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::events::StreamEvent;

/// Bursts of writes to one session coalesce within this window.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(250);

pub struct SessionBroadcaster {
    tx: broadcast::Sender<StreamEvent>,
    watcher: StdMutex<Option<Debouncer<notify::RecommendedWatcher>>>,
}

impl SessionBroadcaster {
    /// Start watching `transcripts_root`. A missing root is tolerated; the
    /// broadcaster simply stays quiet until `watch` is called again.
    pub fn new(transcripts_root: &Path) -> Self {
        let (tx, _) = broadcast::channel(256);
        let broadcaster = Self {
            tx,
            watcher: StdMutex::new(None),
        };
        broadcaster.watch(transcripts_root);
        broadcaster
    }

    /// (Re)attach the filesystem watcher.
    pub fn watch(&self, transcripts_root: &Path) {
        if !transcripts_root.is_dir() {
            tracing::debug!(
                path = %transcripts_root.display(),
                "Transcript root absent; session sync idle"
            );
            return;
        }

        let tx = self.tx.clone();
        let debouncer = new_debouncer(DEBOUNCE_WINDOW, move |result: Result<Vec<DebouncedEvent>, notify::Error>| match result {
            Ok(events) => fan_out(&tx, &events),
            Err(e) => tracing::warn!(error = %e, "Transcript watch error"),
        });

        match debouncer {
            Ok(mut debouncer) => {
                if let Err(e) = debouncer
                    .watcher()
                    .watch(transcripts_root, RecursiveMode::Recursive)
                {
                    tracing::warn!(error = %e, "Transcript watch failed");
                    return;
                }
                *self.watcher.lock().unwrap() = Some(debouncer);
                tracing::info!(path = %transcripts_root.display(), "Watching transcripts");
            }
            Err(e) => tracing::warn!(error = %e, "Debouncer init failed"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.tx.subscribe()
    }

    /// Emit a `sync_update` directly (used by tests and in-process callers).
    #[allow(dead_code)]
    pub fn emit(&self, session_id: &str) {
        let _ = self.tx.send(StreamEvent::SyncUpdate {
            session_id: session_id.to_string(),
        });
    }

    /// Idempotent shutdown: drop the watcher.
    pub fn close(&self) {
        self.watcher.lock().unwrap().take();
    }
}

/// Map changed transcript files to session ids, deduplicating within the
/// debounce batch, and broadcast one event per session.
fn fan_out(tx: &broadcast::Sender<StreamEvent>, events: &[DebouncedEvent]) {
    let mut seen: Vec<String> = Vec::new();
    for event in events {
        let Some(session_id) = session_id_for(&event.path) else {
            continue;
        };
        if seen.contains(&session_id) {
            continue;
        }
        seen.push(session_id.clone());
        let _ = tx.send(StreamEvent::SyncUpdate { session_id });
    }
}

/// The session id is the transcript file's stem.
fn session_id_for(path: &PathBuf) -> Option<String> {
    if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
        return None;
    }
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(String::from)
}
