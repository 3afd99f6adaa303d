use std::fmt::Write as _;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use quarry_core::{AppContext, IndexStatus};
use quarry_index::{
    FileOutcome, ProgressEvent, RunSummary, SearchFilter, SearchHit, SearchQuery,
};
use quarry_llm::EmbeddingProvider;
use quarry_memory::CacheStats;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cli::{CacheCommand, Command};

const PREVIEW_LINES: usize = 4;

/// Run one subcommand to completion, writing human-readable output to `out`.
pub async fn run<P: EmbeddingProvider + 'static>(
    app: &AppContext<P>,
    command: Command,
    cancel: &CancellationToken,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    match command {
        Command::Index { path, quiet } => {
            let summary = index(app, &path, cancel, quiet).await?;
            out.write_all(render_summary(&summary).as_bytes())?;
        }
        Command::Search {
            query,
            limit,
            mode,
            lang,
            file,
            project,
            categories,
            no_content,
        } => {
            let query = SearchQuery::new(query)
                .with_limit(limit.unwrap_or(0))
                .with_mode(mode)
                .with_filter(SearchFilter {
                    project,
                    file_path: file,
                    language: lang,
                    categories,
                });
            let hits = app.searcher.search(&query).await?;
            out.write_all(render_hits(&hits, !no_content).as_bytes())?;
        }
        Command::Watch { path } => {
            let summary = index(app, &path, cancel, true).await?;
            out.write_all(render_summary(&summary).as_bytes())?;
            if summary.cancelled {
                return Ok(());
            }
            let root = canonical(&path)?;
            let watcher = app.watch(&root, cancel.child_token())?;
            writeln!(out, "watching {} (ctrl-c to stop)", root.display())?;
            out.flush()?;
            cancel.cancelled().await;
            watcher.stop().await;
        }
        Command::Cache { action } => match action {
            CacheCommand::Stats => {
                let stats = app.cache.stats().await?;
                out.write_all(render_cache_stats(&stats).as_bytes())?;
            }
            CacheCommand::Purge { older_than_days } => {
                let ttl = older_than_days.map(|d| Duration::from_secs(d.saturating_mul(86_400)));
                let expired = app.cache.purge_expired(ttl).await?;
                let evicted = app.cache.evict_to_capacity().await?;
                writeln!(out, "purged {expired} expired, evicted {evicted} over capacity")?;
            }
            CacheCommand::Clear => {
                let removed = app.cache.clear().await?;
                writeln!(out, "removed {removed} cached embeddings")?;
            }
        },
        Command::Status => {
            let status = app.status().await?;
            out.write_all(render_status(&status).as_bytes())?;
        }
    }
    Ok(())
}

async fn index<P: EmbeddingProvider + 'static>(
    app: &AppContext<P>,
    path: &Path,
    cancel: &CancellationToken,
    quiet: bool,
) -> anyhow::Result<RunSummary> {
    let root = canonical(path)?;
    let (tx, rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_progress(rx, quiet));
    let result = app.indexer.index_directory(&root, cancel, Some(tx)).await;
    let _ = printer.await;
    result.with_context(|| format!("indexing {} failed", root.display()))
}

fn canonical(path: &Path) -> anyhow::Result<std::path::PathBuf> {
    std::fs::canonicalize(path).with_context(|| format!("cannot resolve {}", path.display()))
}

/// Drains progress until the sender side is dropped at the end of the run.
async fn print_progress(mut rx: mpsc::UnboundedReceiver<ProgressEvent>, quiet: bool) {
    while let Some(event) = rx.recv().await {
        if quiet && event.outcome != FileOutcome::Failed {
            continue;
        }
        eprintln!("{}", render_progress(&event));
    }
}

fn outcome_label(outcome: FileOutcome) -> &'static str {
    match outcome {
        FileOutcome::Indexed => "indexed",
        FileOutcome::Unchanged => "unchanged",
        FileOutcome::Skipped => "skipped",
        FileOutcome::Failed => "FAILED",
        FileOutcome::Cancelled => "cancelled",
        FileOutcome::Removed => "removed",
    }
}

pub fn render_progress(event: &ProgressEvent) -> String {
    let mut line = format!(
        "[{}/{}] {:<9} {}",
        event.index,
        event.total,
        outcome_label(event.outcome),
        event.file_path
    );
    if let Some(error) = &event.error {
        let _ = write!(line, ": {error}");
    }
    line
}

pub fn render_summary(summary: &RunSummary) -> String {
    let mut out = String::new();
    if summary.cancelled {
        out.push_str("run cancelled; completed files were saved\n");
    }
    let _ = writeln!(
        out,
        "{} files: {} indexed, {} unchanged, {} skipped, {} failed, {} removed ({} ms)",
        summary.files_discovered,
        summary.files_indexed,
        summary.files_unchanged,
        summary.files_skipped,
        summary.files_failed.len(),
        summary.files_deleted,
        summary.duration_ms
    );
    let _ = writeln!(
        out,
        "{} units written, {} units deleted",
        summary.units_indexed, summary.units_deleted
    );
    for (from, to) in &summary.renamed {
        let _ = writeln!(out, "renamed {from} -> {to}");
    }
    for failure in &summary.files_failed {
        let _ = writeln!(out, "failed {}: {}", failure.path, failure.reason);
    }
    out
}

pub fn render_hits(hits: &[SearchHit], with_content: bool) -> String {
    if hits.is_empty() {
        return "no results\n".into();
    }
    let mut out = String::new();
    for (i, hit) in hits.iter().enumerate() {
        let rank = |r: Option<usize>| r.map_or_else(|| "-".to_owned(), |r| format!("#{r}"));
        let _ = writeln!(
            out,
            "{}. {} [{} {}] score {:.4} (lexical {}, vector {})",
            i + 1,
            hit.header(),
            hit.language,
            hit.unit_type,
            hit.fused_score,
            rank(hit.lexical_rank),
            rank(hit.vector_rank)
        );
        if with_content {
            for line in hit.content.lines().take(PREVIEW_LINES) {
                let _ = writeln!(out, "    {line}");
            }
            if hit.content.lines().nth(PREVIEW_LINES).is_some() {
                out.push_str("    ...\n");
            }
        }
    }
    out
}

pub fn render_cache_stats(stats: &CacheStats) -> String {
    format!(
        "entries: {}\nsession hits: {}\nsession misses: {}\nhit rate: {:.1}%\ncorrupt entries dropped: {}\nlifetime hits: {}\n",
        stats.total_entries,
        stats.hits,
        stats.misses,
        stats.hit_rate * 100.0,
        stats.corruptions,
        stats.total_hits_recorded
    )
}

pub fn render_status(status: &IndexStatus) -> String {
    let points = status
        .vector_points
        .map_or_else(|| "unreachable".to_owned(), |n| n.to_string());
    let mut out = String::new();
    let _ = writeln!(out, "project: {}", status.project);
    let _ = writeln!(out, "files: {}", status.files);
    let _ = writeln!(out, "units: {} ({} searchable)", status.units, status.lexical_units);
    let _ = writeln!(out, "collection: {} ({points} points)", status.collection);
    let _ = writeln!(out, "provider: {} {}", status.provider, status.model);
    let _ = writeln!(out, "parser: {}", status.parser);
    let _ = writeln!(out, "cache entries: {}", status.cache.total_entries);
    let _ = writeln!(
        out,
        "pool: {} idle, {} in use, max {} (acquire avg {:.1} ms, p95 {:.1} ms)",
        status.pool.idle,
        status.pool.in_use,
        status.pool.max_size,
        status.pool.avg_wait_ms,
        status.pool.p95_wait_ms
    );
    out
}
