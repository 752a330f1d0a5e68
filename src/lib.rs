//! Privacy-first semantic code search: the indexing and retrieval core.
//!
//! The pipeline turns a source tree into embedded chunks, keeps that
//! representation reconciled with the on-disk state, and serves ranked
//! similarity queries:
//!
//! - [`Scanner`] walks the project, honors ignore rules, and hashes content.
//! - [`Chunker`] splits files into size-bounded chunks with stable ids.
//! - [`Embedder`] maps text to fixed-dimension vectors via a selectable
//!   provider (Ollama, OpenAI-compatible, or the offline synthetic one).
//! - [`VectorStore`] persists chunks and documents and answers top-k
//!   similarity queries; backends: single-file binary, SQLite, remote
//!   vector database.
//! - [`Indexer`] orchestrates full and incremental indexing; [`Searcher`]
//!   executes query → embed → retrieve → fuse → boost → rank.
//! - [`Workspace`] bundles several projects into one namespaced store.
//!
//! Frontends (CLI, watcher, statistics) live outside this crate and drive
//! it through these types.

pub mod chunker;
pub mod config;
pub mod embedder;
pub mod error;
pub mod indexer;
pub mod scanner;
pub mod searcher;
pub mod store;
pub mod workspace;

pub use chunker::{chunk_id, Chunker, RawChunk};
pub use config::Config;
pub use embedder::{create_embedder, estimate_tokens, Embedder};
pub use error::{EmbedderErrorKind, Error, Result};
pub use indexer::{IndexReport, Indexer};
pub use scanner::{hash_content, FileInfo, ScanOutcome, Scanner};
pub use searcher::Searcher;
pub use store::{
    cosine_similarity, create_store, sanitize_collection_name, Chunk, Document, SearchResult,
    VectorStore,
};
pub use workspace::{Workspace, WorkspaceProject};
