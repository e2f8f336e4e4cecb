//! # qmdgate-core
//!
//! Core types and traits for qmdgate, a query-routing and result-aggregation
//! gateway in front of a `qmd` markdown-corpus retrieval backend.
//!
//! This crate provides the foundational abstractions used throughout qmdgate:
//!
//! - **Backend access**: [`Executor`] trait with a fixed operation set and a
//!   probed [`Capabilities`] record
//! - **Result model**: [`Hit`], [`SearchMeta`], [`Document`] and friends
//! - **Health model**: [`HealthLevel`], [`ComponentHealth`], [`SystemHealth`]
//! - **Text utilities**: CJK-aware word counting and markdown snippet cleanup
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Hit`] | A single retrieval result row |
//! | [`SearchMeta`] | Routing and degradation metadata for a response |
//! | [`CollectionInfo`] | A collection as reported by the backend |
//! | [`IndexStatus`] | Backend index statistics |
//!
//! ## Related Crates
//!
//! - `qmdgate-exec`: subprocess and JSON-RPC sidecar executors
//! - `qmdgate-cache`: result cache and deep-negative cache
//! - `qmdgate-guard`: CPU overload guard
//! - `qmdgate-route`: mode router and search orchestrator
//! - `qmdgate-sched`: periodic maintenance scheduler

pub mod error;
pub mod text;
pub mod traits;
pub mod types;

pub use error::{Error, Result};
pub use traits::*;
pub use types::*;
