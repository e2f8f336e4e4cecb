//! # qmdgate-route
//!
//! The decision-making heart of qmdgate:
//!
//! - [`router`]: pure textual heuristics mapping a query to an executor mode
//! - [`registry`]: the config-driven collection registry with tiering and
//!   exclusion globs
//! - [`finalize`]: dedup / sort / snippet-budget result post-processing
//! - [`orchestrator`]: composes executors, caches, and the CPU guard into
//!   the full search pipeline (tier fan-out, deep/broad racing, overload
//!   handling)

pub mod finalize;
pub mod orchestrator;
pub mod registry;
pub mod router;

pub use orchestrator::{
    Orchestrator, OrchestratorDeps, RuntimeSettings, SearchOutcome, SearchParams, SearchSettings,
};
pub use registry::{CollectionRegistry, CollectionSpec};
pub use router::{detect_mode, ExecMode};
