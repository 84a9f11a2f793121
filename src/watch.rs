//! Debounced file watching.
//!
//! A [`DebouncedWatcher`] turns bursts of filesystem notifications into batches
//! of changed paths on a channel. [`spawn_batch_consumer`] drains that channel
//! from a single task, so rebuilds of one watched root never overlap.

use notify_debouncer_mini::notify::{self, RecursiveMode, Watcher};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, Debouncer};
use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Quiet period before a burst of changes is reported.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(200);

/// Errors from the watch layer.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("failed to watch {path}: {source}")]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
    #[error("failed to start file watcher: {0}")]
    Init(#[from] notify::Error),
}

/// A batch of changed paths.
pub type ChangeBatch = Vec<PathBuf>;

/// Watcher over a set of paths, reporting debounced change batches.
pub struct DebouncedWatcher {
    debouncer: Debouncer<notify::RecommendedWatcher>,
    watched: HashSet<PathBuf>,
}

impl DebouncedWatcher {
    /// Create a watcher. Paths under any of `ignored` are never reported.
    pub fn new(
        delay: Duration,
        ignored: Vec<PathBuf>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ChangeBatch>), WatchError> {
        let (tx, rx) = mpsc::unbounded_channel();

        let debouncer = new_debouncer(delay, move |result: DebounceEventResult| match result {
            Ok(events) => {
                let mut paths: Vec<PathBuf> = events
                    .into_iter()
                    .map(|event| event.path)
                    .filter(|path| !ignored.iter().any(|prefix| path.starts_with(prefix)))
                    .collect();
                paths.sort();
                paths.dedup();
                if !paths.is_empty() {
                    let _ = tx.send(paths);
                }
            }
            Err(err) => warn!("File watcher error: {}", err),
        })?;

        Ok((
            Self {
                debouncer,
                watched: HashSet::new(),
            },
            rx,
        ))
    }

    /// Start watching a path. Watching an already watched path is a no-op.
    pub fn watch(&mut self, path: &Path, recursive: bool) -> Result<(), WatchError> {
        if self.watched.contains(path) {
            return Ok(());
        }
        let mode = if recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        self.debouncer
            .watcher()
            .watch(path, mode)
            .map_err(|source| WatchError::Watch {
                path: path.to_path_buf(),
                source,
            })?;
        debug!("Watching {}", path.display());
        self.watched.insert(path.to_path_buf());
        Ok(())
    }

    /// Stop watching a path.
    pub fn unwatch(&mut self, path: &Path) {
        if self.watched.remove(path) {
            if let Err(err) = self.debouncer.watcher().unwatch(path) {
                debug!("Could not unwatch {}: {}", path.display(), err);
            }
        }
    }

    /// Paths currently watched.
    pub fn watched(&self) -> impl Iterator<Item = &PathBuf> {
        self.watched.iter()
    }
}

/// Drain change batches on one task. Batches that queue up while `handler`
/// runs are merged into the next call.
pub fn spawn_batch_consumer<F, Fut>(
    mut rx: mpsc::UnboundedReceiver<ChangeBatch>,
    mut handler: F,
) -> JoinHandle<()>
where
    F: FnMut(ChangeBatch) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        while let Some(mut batch) = rx.recv().await {
            while let Ok(more) = rx.try_recv() {
                batch.extend(more);
            }
            batch.sort();
            batch.dedup();
            handler(batch).await;
        }
    })
}
