//! HTTP API surface.
//!
//! JSON-over-HTTP endpoints with payloads matching the gateway's wire
//! contract: search and search-and-get, document fetches, quick markdown
//! endpoints, admin operations, health, and status. Errors map onto the
//! stable wire codes via [`server::ApiError`].

pub mod admin;
pub mod convert;
pub mod format;
pub mod search;
pub mod server;

pub use server::{build_router, AppState};
