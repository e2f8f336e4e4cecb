//! Core types for qmdgate.
//!
//! Shared data structures used across the gateway:
//!
//! ## Results
//! - [`Hit`]: a single retrieval result row
//! - [`SearchMeta`]: routing and degradation metadata attached to a response
//! - [`Document`]: a fetched document body
//!
//! ## Backend
//! - [`CollectionInfo`]: a collection as reported by the backend
//! - [`PathContext`]: a per-path context description
//! - [`IndexStatus`]: index statistics from the backend `status` operation
//!
//! ## Health
//! - [`HealthLevel`], [`ComponentHealth`], [`SystemHealth`]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ============================================================================
// Search results
// ============================================================================

/// A single retrieval result row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Hit {
    /// Document title
    #[serde(default)]
    pub title: String,
    /// File URI (`qmd://collection/path.md`)
    #[serde(default)]
    pub file: String,
    /// Collection the hit came from
    #[serde(default)]
    pub collection: String,
    /// Relevance score, higher is better; always finite
    #[serde(default)]
    pub score: f64,
    /// Snippet text (markdown before cleanup)
    #[serde(default)]
    pub snippet: String,
    /// Backend document id, when provided
    #[serde(default)]
    pub docid: String,
}

impl Hit {
    /// Identity key for deduplication: docid, else file URI, else a
    /// title|snippet|score composite with the score at 4 decimal places.
    pub fn identity_key(&self) -> String {
        let docid = self.docid.trim();
        if !docid.is_empty() {
            return docid.to_string();
        }
        let file = self.file.trim();
        if !file.is_empty() {
            return file.to_string();
        }
        format!("{}|{}|{:.4}", self.title, self.snippet, self.score)
    }

    /// Best URI to show for this hit: the file URI, falling back to the title.
    pub fn preferred_uri(&self) -> &str {
        if self.file.trim().is_empty() {
            &self.title
        } else {
            &self.file
        }
    }
}

/// The mode actually delivered to the client, possibly different from the
/// backend primitive that produced the hits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServedMode {
    Core,
    Broad,
    Deep,
}

impl ServedMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServedMode::Core => "core",
            ServedMode::Broad => "broad",
            ServedMode::Deep => "deep",
        }
    }
}

/// Routing and degradation metadata for one search response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchMeta {
    /// Backend primitive used: `search`, `vsearch`, or `query`
    pub mode_used: String,
    /// Mode actually served to the client
    #[serde(skip_serializing_if = "Option::is_none")]
    pub served_mode: Option<ServedMode>,
    /// Collections actually searched, including tier-2 on fallback
    pub collections_searched: Vec<String>,
    /// Whether tier-2 fallback produced the results
    pub fallback_triggered: bool,
    /// Whether the response came from the result cache
    pub cache_hit: bool,
    /// Request succeeded below the requested quality level
    pub degraded: bool,
    /// Machine-readable reason, set iff degraded
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub degrade_reason: String,
    /// Trace id for correlation
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub trace_id: String,
    /// End-to-end latency in milliseconds
    pub latency_ms: i64,
}

/// A fetched document body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub file: String,
    pub content: String,
}

// ============================================================================
// Backend entities
// ============================================================================

/// A collection as reported by the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectionInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub mask: String,
    #[serde(default)]
    pub files: u64,
}

/// A per-path context description registered with the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathContext {
    pub path: String,
    pub description: String,
}

/// Index statistics from the backend `status` operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexStatus {
    #[serde(default)]
    pub collections: Vec<CollectionInfo>,
    #[serde(default)]
    pub vectors: u64,
    #[serde(default)]
    pub last_update: Option<DateTime<Utc>>,
    /// Raw backend output, kept for diagnostics
    #[serde(default)]
    pub raw: String,
}

// ============================================================================
// Health model
// ============================================================================

/// Component health severity, ordered from healthy to critical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    Degraded,
    Unhealthy,
    Critical,
}

impl HealthLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthLevel::Healthy => "healthy",
            HealthLevel::Degraded => "degraded",
            HealthLevel::Unhealthy => "unhealthy",
            HealthLevel::Critical => "critical",
        }
    }
}

/// Health of one named component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub level: HealthLevel,
    pub last_check: DateTime<Utc>,
    pub last_healthy: Option<DateTime<Utc>>,
    pub message: String,
    pub fail_count: u32,
}

/// Aggregated system health.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealth {
    pub overall: HealthLevel,
    pub components: HashMap<String, ComponentHealth>,
    pub started_at: DateTime<Utc>,
    pub uptime_sec: i64,
    /// Operating mode derived from the overall level
    pub mode: String,
}
