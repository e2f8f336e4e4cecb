//! # qmdgate-cache
//!
//! Two caches back the orchestrator:
//!
//! - [`ResultCache`]: a fingerprint-keyed LRU of finalized search responses
//!   with TTL and index-version invalidation
//! - [`DeepNegativeCache`]: short-lived records of deep-path failures, per
//!   exact query and per scope (with a cooldown after repeated failures)
//!
//! Both use a single mutex each; critical sections are short and never span
//! I/O.

pub mod negative;
pub mod result;

pub use negative::{DeepNegativeCache, DeepNegativeConfig, SkipReason};
pub use result::{CacheEntry, CacheSettings, ResultCache, SearchFingerprint};
