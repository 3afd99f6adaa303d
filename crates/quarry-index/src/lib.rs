//! Incremental code indexing and hybrid retrieval.
//!
//! Source files are parsed into semantic units (tree-sitter, or a regex scanner
//! when no grammar is available), embedded through a cache-aware generator, and
//! written to a vector store. A BM25 index is kept alongside, and queries fuse
//! both rankings with reciprocal rank fusion.

pub mod category;
pub mod change;
pub(crate) mod context;
pub mod embedder;
pub mod error;
pub mod fusion;
pub mod indexer;
pub mod languages;
pub mod lexical;
pub mod parser;
pub mod records;
pub mod searcher;
pub mod unit;
pub mod watcher;

#[cfg(test)]
pub(crate) mod test_support;

pub use category::{CATEGORY_FIELD, Category};
pub use change::{ChangeDetector, ChangeStatus, FileMeta, Inspection};
pub use embedder::EmbeddingGenerator;
pub use error::{IndexError, Result};
pub use fusion::{DEFAULT_RRF_K, SearchResult, reciprocal_rank_fusion};
pub use indexer::{
    CodeIndexer, FileFailure, FileOutcome, FileState, IndexerConfig, ProgressEvent, RunSummary,
};
pub use languages::{Lang, detect_language};
pub use lexical::{LexicalIndex, UnitDoc};
pub use parser::{ParserBackend, ParserPreference};
pub use records::{FileIndexRecord, RecordStore};
pub use searcher::{
    HybridSearcher, SearchConfig, SearchFilter, SearchHit, SearchMode, SearchQuery,
};
pub use unit::{SemanticUnit, UnitType};
pub use watcher::IndexWatcher;
