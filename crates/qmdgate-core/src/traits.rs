//! The backend executor seam.
//!
//! Everything qmdgate knows about the retrieval backend goes through the
//! [`Executor`] trait: three retrieval primitives, document fetches, and the
//! mutating maintenance operations used by the scheduler and admin surface.
//! Concrete implementations (subprocess CLI, JSON-RPC sidecar) live in
//! `qmdgate-exec`; tests substitute mocks.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{CollectionInfo, Document, Hit, IndexStatus, PathContext};

/// Which backend features were detected at construction time.
///
/// Probing is best effort: a missing subcommand downgrades the capability,
/// it never fails executor construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub vector: bool,
    pub deep_query: bool,
    pub sidecar: bool,
    pub status: bool,
}

/// A single probed capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Vector,
    DeepQuery,
    Sidecar,
    Status,
}

impl Capabilities {
    pub fn has(&self, cap: Capability) -> bool {
        match cap {
            Capability::Vector => self.vector,
            Capability::DeepQuery => self.deep_query,
            Capability::Sidecar => self.sidecar,
            Capability::Status => self.status,
        }
    }
}

/// Options common to the three retrieval primitives.
#[derive(Debug, Clone, Default)]
pub struct SearchOpts {
    /// Target collection; empty means all
    pub collection: String,
    /// Coarse candidate count; 0 drops the cap (used with `files_only && all`)
    pub n: usize,
    /// Minimum score forwarded to the backend
    pub min_score: f64,
    /// Ask for file URIs only
    pub files_only: bool,
    /// With `files_only`, ask for every file hit
    pub all: bool,
}

/// Options for fetching a single document.
#[derive(Debug, Clone, Copy, Default)]
pub struct GetOpts {
    pub full: bool,
    pub line_numbers: bool,
}

/// Uniform access to the retrieval backend.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Lexical (BM25) search.
    async fn search(&self, query: &str, opts: SearchOpts) -> Result<Vec<Hit>>;

    /// Vector search. Fails with `Unavailable` when the capability is absent.
    async fn vsearch(&self, query: &str, opts: SearchOpts) -> Result<Vec<Hit>>;

    /// Deep semantic query. Gated by a bounded concurrency semaphore.
    async fn query(&self, query: &str, opts: SearchOpts) -> Result<Vec<Hit>>;

    /// Fetch one document body by reference.
    async fn get(&self, doc_ref: &str, opts: GetOpts) -> Result<String>;

    /// Fetch documents matching a pattern, bounded by `max_bytes`.
    async fn multi_get(&self, pattern: &str, max_bytes: usize) -> Result<Vec<Document>>;

    async fn collection_add(&self, path: &str, name: &str, mask: &str) -> Result<()>;
    async fn collection_list(&self) -> Result<Vec<CollectionInfo>>;

    /// Incremental reindex of all collections.
    async fn update(&self) -> Result<()>;

    /// Embedding pass; `force` re-embeds everything.
    async fn embed(&self, force: bool) -> Result<()>;

    async fn context_add(&self, path: &str, description: &str) -> Result<()>;
    async fn context_list(&self) -> Result<Vec<PathContext>>;
    async fn context_remove(&self, path: &str) -> Result<()>;

    /// Index statistics. Fails with `Unavailable` when unsupported.
    async fn status(&self) -> Result<IndexStatus>;

    /// Start the backend sidecar daemon.
    async fn sidecar_start(&self) -> Result<()>;
    /// Stop the backend sidecar daemon.
    async fn sidecar_stop(&self) -> Result<()>;
    /// Probe the sidecar health endpoint.
    async fn sidecar_health(&self) -> Result<()>;

    /// Backend version string; "unknown" when the backend has no version flag.
    async fn version(&self) -> Result<String>;

    fn has_capability(&self, cap: Capability) -> bool;
}
