//! Project indexing orchestrator: walk → detect → parse → embed → upsert → commit.
//!
//! Each file moves through [`FileState`] on its own task. A file's record is
//! only written after all of its units are embedded and upserted, so an
//! interrupted or failed file is simply retried on the next run.

use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

use ignore::Match;
use ignore::gitignore::GitignoreBuilder;
use ignore::overrides::{Override, OverrideBuilder};
use quarry_llm::EmbeddingProvider;
use quarry_memory::{GatewayError, VectorGateway, VectorPoint};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::change::{ChangeDetector, ChangeStatus, DEFAULT_MAX_FILE_SIZE, pair_renames};
use crate::embedder::EmbeddingGenerator;
use crate::error::{IndexError, Result};
use crate::languages::{Lang, detect_language};
use crate::lexical::{LexicalIndex, UnitDoc};
use crate::parser::ParserBackend;
use crate::records::{FileIndexRecord, RecordStore};

/// Per-directory exclusion file, gitignore syntax.
pub const IGNORE_FILE_NAME: &str = ".quarryignore";

pub const DEFAULT_EXCLUDES: &[&str] = &[
    "target/",
    "node_modules/",
    "build/",
    "dist/",
    "__pycache__/",
    ".venv/",
    "venv/",
];

/// Indexer configuration.
#[derive(Debug, Clone)]
pub struct IndexerConfig {
    /// Written into every unit's payload; searches can filter on it.
    pub project: String,
    pub max_concurrent_files: usize,
    pub max_file_size: u64,
    /// Whitelist globs. When non-empty only matching files are indexed.
    pub include: Vec<String>,
    /// Globs (gitignore syntax) excluded on top of `.gitignore` and `.quarryignore`.
    pub exclude: Vec<String>,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            project: "default".into(),
            max_concurrent_files: 4,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            include: Vec::new(),
            exclude: DEFAULT_EXCLUDES.iter().map(|s| (*s).to_owned()).collect(),
        }
    }
}

/// Lifecycle of one file within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Discovered,
    Unchanged,
    Parsing,
    Parsed,
    Embedding,
    Embedded,
    Upserted,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOutcome {
    Indexed,
    Unchanged,
    /// Over the size limit; left untouched.
    Skipped,
    Failed,
    Cancelled,
    /// Vanished between discovery and reading; removed from the index.
    Removed,
}

/// Emitted once per discovered file, in completion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    /// 1-based.
    pub index: usize,
    pub total: usize,
    pub file_path: String,
    pub outcome: FileOutcome,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFailure {
    pub path: String,
    pub reason: String,
}

/// Summary of an indexing run.
#[derive(Debug, Default, Clone)]
pub struct RunSummary {
    pub files_discovered: usize,
    pub files_indexed: usize,
    pub files_unchanged: usize,
    pub files_skipped: usize,
    pub files_failed: Vec<FileFailure>,
    pub files_deleted: usize,
    /// `(old_path, new_path)` pairs detected by identical fingerprint.
    pub renamed: Vec<(String, String)>,
    pub units_indexed: usize,
    pub units_deleted: usize,
    pub cancelled: bool,
    pub duration_ms: u64,
}

impl RunSummary {
    #[must_use]
    pub fn files_succeeded(&self) -> usize {
        self.files_indexed + self.files_unchanged
    }
}

#[derive(Debug, Clone)]
struct FileJob {
    /// Canonical root the file was discovered under.
    root: Arc<str>,
    abs: PathBuf,
    rel: String,
    lang: Lang,
}

#[derive(Debug)]
enum Processed {
    Indexed {
        units: usize,
        stale_deleted: usize,
        fingerprint: String,
        was_new: bool,
    },
    Unchanged,
    Removed {
        units: usize,
    },
    Cancelled,
}

/// Orchestrates code indexing over a project tree.
pub struct CodeIndexer<P> {
    parser: Arc<ParserBackend>,
    detector: ChangeDetector,
    generator: Arc<EmbeddingGenerator<P>>,
    gateway: Arc<VectorGateway>,
    records: RecordStore,
    lexical: LexicalIndex,
    config: IndexerConfig,
    ready: AtomicBool,
}

impl<P> std::fmt::Debug for CodeIndexer<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeIndexer")
            .field("parser", &self.parser.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<P: EmbeddingProvider + 'static> CodeIndexer<P> {
    #[must_use]
    pub fn new(
        parser: ParserBackend,
        generator: Arc<EmbeddingGenerator<P>>,
        gateway: Arc<VectorGateway>,
        records: RecordStore,
        lexical: LexicalIndex,
        config: IndexerConfig,
    ) -> Self {
        Self {
            parser: Arc::new(parser),
            detector: ChangeDetector::new(config.max_file_size),
            generator,
            gateway,
            records,
            lexical,
            config,
            ready: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    #[must_use]
    pub fn records(&self) -> &RecordStore {
        &self.records
    }

    #[must_use]
    pub fn lexical(&self) -> &LexicalIndex {
        &self.lexical
    }

    /// Check both backends answer and the collection exists with the model's width.
    async fn prepare(&self) -> Result<u64> {
        self.gateway.ping().await.map_err(IndexError::from)?;
        let dims = u64::try_from(self.generator.probe_dimensions().await?)?;
        self.gateway
            .ensure_collection(dims)
            .await
            .map_err(IndexError::from)?;
        self.ready.store(true, Ordering::Release);
        Ok(dims)
    }

    /// Full project indexing with incremental change detection.
    ///
    /// # Errors
    ///
    /// Fails fast if the vector store or embedding backend is unreachable, or
    /// if `root` cannot be walked. Per-file problems are reported in the
    /// returned [`RunSummary`] instead.
    pub async fn index_directory(
        self: &Arc<Self>,
        root: &Path,
        cancel: &CancellationToken,
        progress: Option<mpsc::UnboundedSender<ProgressEvent>>,
    ) -> Result<RunSummary> {
        let start = Instant::now();
        let mut summary = RunSummary::default();

        if !tokio::fs::metadata(root).await?.is_dir() {
            return Err(IndexError::Other(format!("{} is not a directory", root.display())));
        }
        let root_key = root_key(root).await?;
        let dims = self.prepare().await?;

        let jobs = self.discover(root, &root_key).await?;
        let mut previous = self.records.load_all(&root_key).await?;
        let total = jobs.len();
        summary.files_discovered = total;
        tracing::info!(
            root = %root.display(),
            total,
            dims,
            parser = self.parser.name(),
            "indexing started"
        );

        let discovered: HashSet<String> = jobs.iter().map(|j| j.rel.clone()).collect();
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_files.max(1)));
        let completed = Arc::new(AtomicUsize::new(0));
        let mut set = JoinSet::new();
        let mut task_paths = HashMap::new();

        for job in jobs {
            let permit = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => permit
                    .map_err(|e| IndexError::Other(format!("file semaphore closed: {e}")))?,
            };
            let this = Arc::clone(self);
            let token = cancel.clone();
            let progress = progress.clone();
            let completed = Arc::clone(&completed);
            let record = previous.get(&job.rel).cloned();
            let rel = job.rel.clone();
            let handle = set.spawn(async move {
                let _permit = permit;
                let result = this.process_file(&job, record.as_ref(), &token).await;
                let index = completed.fetch_add(1, Ordering::Relaxed) + 1;
                emit(progress.as_ref(), index, total, &job.rel, &result);
                (job.rel, result)
            });
            task_paths.insert(handle.id(), rel);
        }

        let mut new_files: Vec<(String, String)> = Vec::new();
        while let Some(joined) = set.join_next_with_id().await {
            let (rel, result) = match joined {
                Ok((_, pair)) => pair,
                Err(e) => {
                    let rel = task_paths.get(&e.id()).cloned().unwrap_or_default();
                    tracing::error!(file = %rel, "indexing task panicked: {e}");
                    summary.files_failed.push(FileFailure {
                        path: rel,
                        reason: format!("task failed: {e}"),
                    });
                    continue;
                }
            };
            match result {
                Ok(Processed::Indexed {
                    units,
                    stale_deleted,
                    fingerprint,
                    was_new,
                }) => {
                    summary.files_indexed += 1;
                    summary.units_indexed += units;
                    summary.units_deleted += stale_deleted;
                    if was_new {
                        new_files.push((rel, fingerprint));
                    }
                }
                Ok(Processed::Unchanged) => summary.files_unchanged += 1,
                Ok(Processed::Removed { units }) => {
                    summary.files_deleted += 1;
                    summary.units_deleted += units;
                    previous.remove(&rel);
                }
                Ok(Processed::Cancelled) => summary.cancelled = true,
                Err(IndexError::FileTooLarge { size, limit, .. }) => {
                    tracing::warn!(file = %rel, size, limit, "skipping oversized file");
                    summary.files_skipped += 1;
                }
                Err(e) => summary.files_failed.push(FileFailure {
                    path: rel,
                    reason: e.to_string(),
                }),
            }
        }

        if cancel.is_cancelled() {
            summary.cancelled = true;
        } else {
            let gone: Vec<&FileIndexRecord> = previous
                .values()
                .filter(|r| !discovered.contains(&r.file_path))
                .collect();
            summary.renamed = pair_renames(&gone, &new_files);
            let mut gone_paths: Vec<&str> = gone.iter().map(|r| r.file_path.as_str()).collect();
            gone_paths.sort_unstable();
            for path in gone_paths {
                let Some(record) = previous.get(path) else {
                    continue;
                };
                match self.remove_indexed(record).await {
                    Ok(units) => {
                        summary.files_deleted += 1;
                        summary.units_deleted += units;
                        tracing::debug!(file = %path, units, "removed deleted file");
                    }
                    Err(e) => summary.files_failed.push(FileFailure {
                        path: path.to_owned(),
                        reason: format!("cleanup: {e}"),
                    }),
                }
            }
        }

        summary
            .files_failed
            .sort_by(|a, b| a.path.cmp(&b.path));
        summary.duration_ms = start.elapsed().as_millis().try_into().unwrap_or(u64::MAX);
        tracing::info!(
            indexed = summary.files_indexed,
            unchanged = summary.files_unchanged,
            skipped = summary.files_skipped,
            failed = summary.files_failed.len(),
            deleted = summary.files_deleted,
            renamed = summary.renamed.len(),
            units_indexed = summary.units_indexed,
            units_deleted = summary.units_deleted,
            cancelled = summary.cancelled,
            duration_ms = summary.duration_ms,
            "indexing finished"
        );
        Ok(summary)
    }

    /// Re-index a specific file (for the file watcher). A file that no longer
    /// exists is removed from the index.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, embedded, or stored.
    pub async fn reindex_file(&self, root: &Path, abs_path: &Path) -> Result<FileOutcome> {
        let rel = relative_path(root, abs_path).ok_or_else(|| {
            IndexError::Other(format!(
                "{} is outside {}",
                abs_path.display(),
                root.display()
            ))
        })?;
        let Some(lang) = detect_language(abs_path)
            .filter(|l| self.parser.supported_languages().contains(l))
        else {
            return Ok(FileOutcome::Skipped);
        };
        if is_hidden(&rel) || is_overridden(&self.overrides(root)?, &rel) {
            return Ok(FileOutcome::Skipped);
        }
        let ignored = {
            let (root, rel) = (root.to_path_buf(), rel.clone());
            tokio::task::spawn_blocking(move || is_ignored_by_files(&root, &rel))
                .await
                .map_err(|e| IndexError::Other(format!("ignore check failed: {e}")))?
        };
        if ignored {
            tracing::debug!(file = %rel, "ignored by ignore file");
            return Ok(FileOutcome::Skipped);
        }
        let root_key = root_key(root).await?;
        if !self.ready.load(Ordering::Acquire) {
            self.prepare().await?;
        }

        let previous = self.records.get(&root_key, &rel).await?;
        let job = FileJob {
            root: root_key.into(),
            abs: abs_path.to_path_buf(),
            rel,
            lang,
        };
        let outcome = match self
            .process_file(&job, previous.as_ref(), &CancellationToken::new())
            .await
        {
            Ok(Processed::Indexed { units, .. }) => {
                tracing::info!(file = %job.rel, units, "reindexed");
                FileOutcome::Indexed
            }
            Ok(Processed::Unchanged) => FileOutcome::Unchanged,
            Ok(Processed::Removed { units }) => {
                tracing::info!(file = %job.rel, units, "removed from index");
                FileOutcome::Removed
            }
            Ok(Processed::Cancelled) => FileOutcome::Cancelled,
            Err(IndexError::FileTooLarge { .. }) => FileOutcome::Skipped,
            Err(e) => return Err(e),
        };
        Ok(outcome)
    }

    fn overrides(&self, root: &Path) -> Result<Override> {
        let mut builder = OverrideBuilder::new(root);
        let add = |builder: &mut OverrideBuilder, glob: &str| {
            builder
                .add(glob)
                .map(|_| ())
                .map_err(|e| IndexError::Other(format!("invalid glob {glob}: {e}")))
        };
        for glob in &self.config.include {
            add(&mut builder, glob)?;
        }
        for glob in &self.config.exclude {
            add(&mut builder, &format!("!{glob}"))?;
        }
        builder
            .build()
            .map_err(|e| IndexError::Other(format!("invalid override set: {e}")))
    }

    /// Indexable files under `root`, sorted by relative path.
    async fn discover(&self, root: &Path, root_key: &str) -> Result<Vec<FileJob>> {
        let overrides = self.overrides(root)?;
        let supported = self.parser.supported_languages();
        let root = root.to_path_buf();
        let key: Arc<str> = root_key.into();
        let jobs = tokio::task::spawn_blocking(move || {
            let mut jobs: Vec<FileJob> = ignore::WalkBuilder::new(&root)
                .hidden(true)
                .git_ignore(true)
                .require_git(false)
                .add_custom_ignore_filename(IGNORE_FILE_NAME)
                .overrides(overrides)
                .build()
                .filter_map(|entry| match entry {
                    Ok(e) => Some(e),
                    Err(err) => {
                        tracing::warn!("walk error: {err}");
                        None
                    }
                })
                .filter(|e| e.file_type().is_some_and(|ft| ft.is_file()))
                .filter_map(|e| {
                    let lang = detect_language(e.path()).filter(|l| supported.contains(l))?;
                    let rel = relative_path(&root, e.path())?;
                    Some(FileJob {
                        root: Arc::clone(&key),
                        abs: e.into_path(),
                        rel,
                        lang,
                    })
                })
                .collect();
            jobs.sort_by(|a, b| a.rel.cmp(&b.rel));
            jobs
        })
        .await
        .map_err(|e| IndexError::Other(format!("directory walk failed: {e}")))?;
        Ok(jobs)
    }

    async fn process_file(
        &self,
        job: &FileJob,
        previous: Option<&FileIndexRecord>,
        cancel: &CancellationToken,
    ) -> Result<Processed> {
        let rel = job.rel.as_str();
        if cancel.is_cancelled() {
            return Ok(Processed::Cancelled);
        }
        trace_state(rel, FileState::Discovered);

        let inspection = self.detector.should_reindex(&job.abs, previous).await?;
        let (content, fingerprint, meta) = match inspection.status {
            ChangeStatus::Deleted => {
                let units = match previous {
                    Some(record) => self.remove_indexed(record).await?,
                    None => 0,
                };
                return Ok(Processed::Removed { units });
            }
            ChangeStatus::Unchanged => {
                if inspection.needs_meta_refresh()
                    && let Some(meta) = inspection.meta
                {
                    self.records.touch(&job.root, rel, meta).await?;
                }
                trace_state(rel, FileState::Unchanged);
                return Ok(Processed::Unchanged);
            }
            ChangeStatus::Changed | ChangeStatus::New => match (
                inspection.content,
                inspection.fingerprint,
                inspection.meta,
            ) {
                (Some(c), Some(f), Some(m)) => (c, f, m),
                _ => return Err(IndexError::Other(format!("{rel}: inspection carried no content"))),
            },
        };

        trace_state(rel, FileState::Parsing);
        let parser = Arc::clone(&self.parser);
        let path = job.rel.clone();
        let lang = job.lang;
        let units = tokio::task::spawn_blocking(move || parser.parse(&content, &path, lang))
            .await
            .map_err(|e| IndexError::Other(format!("parser task failed: {e}")))??
            .into_iter()
            .map(|u| u.in_root(&job.root))
            .collect::<Vec<_>>();
        trace_state(rel, FileState::Parsed);

        if cancel.is_cancelled() {
            return Ok(Processed::Cancelled);
        }
        trace_state(rel, FileState::Embedding);
        let vectors = self.generator.embed_batch(&units).await?;
        trace_state(rel, FileState::Embedded);

        if cancel.is_cancelled() {
            return Ok(Processed::Cancelled);
        }

        // Past this point the file runs to completion: upsert, stale delete, commit.
        let docs: Vec<UnitDoc> = units
            .iter()
            .map(|u| UnitDoc::from_unit(u, &self.config.project, &job.root))
            .collect();
        self.upsert_units(rel, &docs, &vectors).await?;

        let stale: Vec<String> = {
            let new_ids: HashSet<&str> = docs.iter().map(|d| d.unit_id.as_str()).collect();
            previous
                .map(|r| {
                    r.unit_ids
                        .iter()
                        .filter(|id| !new_ids.contains(id.as_str()))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };
        let stale_deleted = if stale.is_empty() {
            0
        } else {
            self.gateway.delete(stale).await.map_err(IndexError::from)?
        };

        let record = FileIndexRecord {
            root: job.root.to_string(),
            file_path: job.rel.clone(),
            fingerprint: fingerprint.clone(),
            mtime_ns: meta.mtime_ns,
            size: meta.size,
            language: job.lang,
            unit_ids: docs.iter().map(|d| d.unit_id.clone()).collect(),
        };
        self.records.commit_file(&record, &docs).await?;
        let units = docs.len();
        self.lexical.upsert_file_docs(&job.root, rel, docs);
        trace_state(rel, FileState::Upserted);

        Ok(Processed::Indexed {
            units,
            stale_deleted,
            fingerprint,
            was_new: previous.is_none(),
        })
    }

    /// Upsert every unit; when only some chunks fail, retry just those ids once.
    async fn upsert_units(&self, rel: &str, docs: &[UnitDoc], vectors: &[Vec<f32>]) -> Result<()> {
        let points = build_points(docs, vectors, None);
        if points.is_empty() {
            return Ok(());
        }
        match self.gateway.upsert(points).await {
            Ok(_) => Ok(()),
            Err(GatewayError::PartialUpsert { failed_ids, reason, .. }) => {
                tracing::warn!(
                    file = %rel,
                    failed = failed_ids.len(),
                    "retrying failed units: {reason}"
                );
                let failed: HashSet<&str> = failed_ids.iter().map(String::as_str).collect();
                let retry = build_points(docs, vectors, Some(&failed));
                self.gateway
                    .upsert(retry)
                    .await
                    .map(|_| ())
                    .map_err(IndexError::from)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a file's vectors, then its record and units, then its lexical docs.
    async fn remove_indexed(&self, record: &FileIndexRecord) -> Result<usize> {
        let deleted = if record.unit_ids.is_empty() {
            0
        } else {
            self.gateway
                .delete(record.unit_ids.clone())
                .await
                .map_err(IndexError::from)?
        };
        self.records.remove_file(&record.root, &record.file_path).await?;
        self.lexical.remove_file(&record.root, &record.file_path);
        Ok(deleted)
    }
}

fn build_points(docs: &[UnitDoc], vectors: &[Vec<f32>], only: Option<&HashSet<&str>>) -> Vec<VectorPoint> {
    docs.iter()
        .zip(vectors)
        .filter(|(d, _)| only.is_none_or(|ids| ids.contains(d.unit_id.as_str())))
        .map(|(d, v)| VectorPoint {
            id: d.unit_id.clone(),
            vector: v.clone(),
            payload: d.payload(),
        })
        .collect()
}

fn trace_state(file: &str, state: FileState) {
    tracing::debug!(file, ?state, "file state");
}

fn emit(
    progress: Option<&mpsc::UnboundedSender<ProgressEvent>>,
    index: usize,
    total: usize,
    file_path: &str,
    result: &Result<Processed>,
) {
    let (outcome, error) = match result {
        Ok(Processed::Indexed { .. }) => (FileOutcome::Indexed, None),
        Ok(Processed::Unchanged) => (FileOutcome::Unchanged, None),
        Ok(Processed::Removed { .. }) => (FileOutcome::Removed, None),
        Ok(Processed::Cancelled) => (FileOutcome::Cancelled, None),
        Err(e @ IndexError::FileTooLarge { .. }) => (FileOutcome::Skipped, Some(e.to_string())),
        Err(e) => (FileOutcome::Failed, Some(e.to_string())),
    };
    match &error {
        Some(reason) if outcome == FileOutcome::Failed => {
            trace_state(file_path, FileState::Failed);
            tracing::warn!(
                file = %file_path,
                progress = format_args!("{index}/{total}"),
                "failed: {reason}"
            );
        }
        _ => tracing::info!(
            file = %file_path,
            progress = format_args!("{index}/{total}"),
            outcome = ?outcome,
        ),
    }
    if let Some(tx) = progress {
        let _ = tx.send(ProgressEvent {
            index,
            total,
            file_path: file_path.to_owned(),
            outcome,
            error,
        });
    }
}

/// `abs` relative to `root`, `/`-separated. `None` if `abs` is not under `root`.
fn relative_path(root: &Path, abs: &Path) -> Option<String> {
    let rel = abs.strip_prefix(root).ok()?;
    let parts: Vec<&str> = rel
        .components()
        .map(|c| match c {
            Component::Normal(s) => s.to_str(),
            _ => None,
        })
        .collect::<Option<_>>()?;
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Canonical form of `root`, the key every record and unit id is scoped by.
async fn root_key(root: &Path) -> Result<String> {
    let canonical = tokio::fs::canonicalize(root).await?;
    canonical
        .to_str()
        .map(str::to_owned)
        .ok_or_else(|| IndexError::Other(format!("{} is not valid UTF-8", canonical.display())))
}

fn is_hidden(rel: &str) -> bool {
    rel.split('/').any(|part| part.starts_with('.'))
}

/// Whether `.gitignore` or `.quarryignore` files between `root` and `rel`
/// exclude it. Deeper files take precedence, and `.quarryignore` wins over
/// `.gitignore` in the same directory, as in the directory walk.
fn is_ignored_by_files(root: &Path, rel: &str) -> bool {
    let abs = root.join(rel);
    let mut dirs = vec![root.to_path_buf()];
    let parts: Vec<&str> = rel.split('/').collect();
    for part in &parts[..parts.len().saturating_sub(1)] {
        let next = dirs[dirs.len() - 1].join(part);
        dirs.push(next);
    }
    for dir in dirs.iter().rev() {
        for name in [IGNORE_FILE_NAME, ".gitignore"] {
            let file = dir.join(name);
            if !file.is_file() {
                continue;
            }
            let mut builder = GitignoreBuilder::new(dir);
            if let Some(err) = builder.add(&file) {
                tracing::warn!(file = %file.display(), "unreadable ignore file: {err}");
                continue;
            }
            let matcher = match builder.build() {
                Ok(m) => m,
                Err(err) => {
                    tracing::warn!(file = %file.display(), "invalid ignore file: {err}");
                    continue;
                }
            };
            match matcher.matched_path_or_any_parents(&abs, false) {
                Match::Ignore(_) => return true,
                Match::Whitelist(_) => return false,
                Match::None => {}
            }
        }
    }
    false
}

/// Whether `rel` or any directory above it is excluded by `overrides`.
fn is_overridden(overrides: &Override, rel: &str) -> bool {
    if overrides.matched(rel, false).is_ignore() {
        return true;
    }
    rel.match_indices('/')
        .any(|(i, _)| overrides.matched(&rel[..i], true).is_ignore())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_path_uses_forward_slashes() {
        let root = Path::new("/repo");
        assert_eq!(
            relative_path(root, Path::new("/repo/src/lib.rs")).as_deref(),
            Some("src/lib.rs")
        );
        assert_eq!(relative_path(root, Path::new("/other/lib.rs")), None);
        assert_eq!(relative_path(root, Path::new("/repo")), None);
    }

    #[test]
    fn hidden_detection_checks_every_component() {
        assert!(is_hidden(".github/workflows/ci.yml"));
        assert!(is_hidden("src/.cache/x.rs"));
        assert!(!is_hidden("src/lib.rs"));
    }

    #[test]
    fn overrides_exclude_files_under_excluded_dirs() {
        let mut builder = OverrideBuilder::new("/repo");
        builder.add("!target/").unwrap();
        let overrides = builder.build().unwrap();
        assert!(is_overridden(&overrides, "target/debug/gen.rs"));
        assert!(!is_overridden(&overrides, "src/target.rs"));
    }

    #[test]
    fn ignore_files_follow_walk_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("sub")).unwrap();
        std::fs::write(root.join(".gitignore"), "*.gen.py\n").unwrap();
        std::fs::write(root.join(IGNORE_FILE_NAME), "generated/\n").unwrap();
        std::fs::write(root.join("sub/.gitignore"), "!special.gen.py\n").unwrap();

        assert!(is_ignored_by_files(root, "generated/deep/x.py"));
        assert!(is_ignored_by_files(root, "a.gen.py"));
        assert!(!is_ignored_by_files(root, "sub/special.gen.py"));
        assert!(!is_ignored_by_files(root, "src/keep.py"));
    }

    #[test]
    fn default_config_excludes_build_dirs() {
        let config = IndexerConfig::default();
        assert_eq!(config.max_concurrent_files, 4);
        assert_eq!(config.max_file_size, DEFAULT_MAX_FILE_SIZE);
        assert!(config.exclude.iter().any(|g| g == "target/"));
        assert!(config.exclude.iter().any(|g| g == "node_modules/"));
    }

    #[test]
    fn summary_counts_successes() {
        let summary = RunSummary {
            files_indexed: 3,
            files_unchanged: 2,
            ..RunSummary::default()
        };
        assert_eq!(summary.files_succeeded(), 5);
    }

    #[test]
    fn build_points_respects_subset() {
        let docs: Vec<UnitDoc> = ["a", "b"]
            .iter()
            .map(|name| {
                let unit = crate::unit::SemanticUnit::new(
                    "x.py",
                    crate::unit::UnitType::Function,
                    *name,
                    "pass",
                    (1, 1),
                    Lang::Python,
                );
                UnitDoc::from_unit(&unit, "p", "/repo")
            })
            .collect();
        let vectors = vec![vec![0.0; 4], vec![1.0; 4]];
        assert_eq!(build_points(&docs, &vectors, None).len(), 2);
        let only: HashSet<&str> = [docs[1].unit_id.as_str()].into_iter().collect();
        let subset = build_points(&docs, &vectors, Some(&only));
        assert_eq!(subset.len(), 1);
        assert_eq!(subset[0].id, docs[1].unit_id);
        assert_eq!(subset[0].vector, vec![1.0; 4]);
    }
}
