//! # qmdgate-exec
//!
//! Backend executors for qmdgate. Two transports implement the
//! [`qmdgate_core::Executor`] trait:
//!
//! - [`CliExecutor`]: spawns the `qmd` binary per operation
//! - [`SidecarExecutor`]: routes the retrieval primitives through the
//!   backend's JSON-RPC sidecar, falling back to the CLI transport when the
//!   sidecar misbehaves
//!
//! Output parsing is shared in [`parse`]: JSON first, then structured text,
//! then CSV for hit rows. Textual "no results" never surfaces as an error.

pub mod cli;
pub mod parse;
pub mod sidecar;

pub use cli::{CliExecutor, ExecConfig};
pub use sidecar::SidecarExecutor;
