use std::path::PathBuf;

use clap::{Parser, Subcommand};
use quarry_index::{Category, Lang, SearchMode};

#[derive(Debug, Parser)]
#[command(name = "quarry")]
#[command(about = "Incremental code indexer with hybrid BM25 + vector search")]
#[command(version)]
pub struct Cli {
    /// Config file (defaults to $QUARRY_CONFIG, then config/default.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Index a directory, re-processing only files that changed
    Index {
        #[arg(default_value = ".")]
        path: PathBuf,
        /// Suppress per-file progress
        #[arg(short, long)]
        quiet: bool,
    },
    /// Search the index
    Search {
        query: String,
        /// Max results
        #[arg(short = 'n', long)]
        limit: Option<usize>,
        /// hybrid, lexical (bm25), or vector (semantic)
        #[arg(short, long, default_value = "hybrid")]
        mode: SearchMode,
        /// Restrict to one language id (python, rust, ...)
        #[arg(short, long, value_parser = parse_lang)]
        lang: Option<Lang>,
        /// Restrict to one file, relative to the indexed root
        #[arg(short, long)]
        file: Option<String>,
        /// Restrict to a project name
        #[arg(long)]
        project: Option<String>,
        /// code, config, or docs; repeatable
        #[arg(short, long = "category")]
        categories: Vec<Category>,
        /// Print only headers, no code
        #[arg(long)]
        no_content: bool,
    },
    /// Index a directory, then keep it up to date as files change
    Watch {
        #[arg(default_value = ".")]
        path: PathBuf,
    },
    /// Inspect or maintain the embedding cache
    Cache {
        #[command(subcommand)]
        action: CacheCommand,
    },
    /// Show index, cache, and vector store state
    Status,
}

#[derive(Debug, Subcommand)]
pub enum CacheCommand {
    /// Hit rate and entry counts
    Stats,
    /// Drop entries past their TTL, then evict down to capacity
    Purge {
        /// Override the configured TTL
        #[arg(long)]
        older_than_days: Option<u64>,
    },
    /// Delete every cached embedding
    Clear,
}

fn parse_lang(s: &str) -> Result<Lang, String> {
    Lang::from_id(&s.to_ascii_lowercase()).ok_or_else(|| format!("unknown language: {s}"))
}
