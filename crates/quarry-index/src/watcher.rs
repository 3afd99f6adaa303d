//! Debounced filesystem watcher that keeps the index current between runs.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify_debouncer_mini::{DebouncedEventKind, new_debouncer};
use quarry_llm::EmbeddingProvider;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::indexer::{CodeIndexer, FileOutcome};
use crate::languages::detect_language;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

pub struct IndexWatcher {
    handle: tokio::task::JoinHandle<()>,
    cancel: CancellationToken,
}

impl IndexWatcher {
    /// Watch `root` recursively and re-index each changed file after `debounce`
    /// of quiet. Stops when `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns an error if the filesystem watcher cannot be initialized.
    pub fn start<P: EmbeddingProvider + 'static>(
        root: &Path,
        indexer: Arc<CodeIndexer<P>>,
        debounce: Duration,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let (notify_tx, mut notify_rx) = mpsc::channel::<PathBuf>(256);

        let mut debouncer = new_debouncer(
            debounce,
            move |events: std::result::Result<Vec<notify_debouncer_mini::DebouncedEvent>, notify::Error>| {
                let events = match events {
                    Ok(events) => events,
                    Err(e) => {
                        tracing::warn!("index watcher error: {e}");
                        return;
                    }
                };

                let paths: HashSet<PathBuf> = events
                    .into_iter()
                    .filter(|e| {
                        matches!(e.kind, DebouncedEventKind::Any | DebouncedEventKind::AnyContinuous)
                            && detect_language(&e.path).is_some()
                    })
                    .map(|e| e.path)
                    .collect();

                for path in paths {
                    let _ = notify_tx.blocking_send(path);
                }
            },
        )?;

        debouncer
            .watcher()
            .watch(root, notify::RecursiveMode::Recursive)?;
        tracing::info!(root = %root.display(), debounce_ms = debounce.as_millis(), "watching for changes");

        let root = root.to_path_buf();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let _debouncer = debouncer;
            loop {
                let path = tokio::select! {
                    () = token.cancelled() => break,
                    path = notify_rx.recv() => match path {
                        Some(path) => path,
                        None => break,
                    },
                };
                match indexer.reindex_file(&root, &path).await {
                    Ok(FileOutcome::Indexed | FileOutcome::Removed) => {}
                    Ok(outcome) => {
                        tracing::debug!(path = %path.display(), ?outcome, "watch event ignored");
                    }
                    Err(e) => tracing::warn!(path = %path.display(), "reindex failed: {e:#}"),
                }
            }
            tracing::debug!("index watcher stopped");
        });

        Ok(Self { handle, cancel })
    }

    /// Stop watching and wait for the in-flight re-index, if any, to finish.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestIndex;

    #[tokio::test]
    async fn start_with_valid_directory() {
        let t = TestIndex::new().await;
        let watcher = IndexWatcher::start(
            t.root(),
            Arc::clone(&t.indexer),
            Duration::from_millis(50),
            CancellationToken::new(),
        )
        .unwrap();
        assert!(watcher.is_running());
        watcher.stop().await;
    }

    #[tokio::test]
    async fn start_with_nonexistent_directory_fails() {
        let t = TestIndex::new().await;
        let result = IndexWatcher::start(
            Path::new("/nonexistent/path/xyz"),
            Arc::clone(&t.indexer),
            DEFAULT_DEBOUNCE,
            CancellationToken::new(),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn cancellation_stops_the_loop() {
        let t = TestIndex::new().await;
        let cancel = CancellationToken::new();
        let watcher = IndexWatcher::start(
            t.root(),
            Arc::clone(&t.indexer),
            Duration::from_millis(50),
            cancel.clone(),
        )
        .unwrap();
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), watcher.stop())
            .await
            .unwrap();
    }
}
