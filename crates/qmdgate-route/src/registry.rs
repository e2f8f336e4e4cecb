//! Config-driven collection registry.
//!
//! Collections are loaded once at startup and immutable at runtime. The
//! registry compiles each collection's exclusion globs ahead of time and
//! answers tier and exclusion queries for the orchestrator.

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use qmdgate_core::{Error, Result};

/// One configured collection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectionSpec {
    pub name: String,
    pub path: String,
    /// File-glob mask registered with the backend; empty means `**/*.md`
    #[serde(default)]
    pub mask: String,
    /// Exclusion globs applied to hits, relative to the collection root
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Context description synced to the backend
    #[serde(default)]
    pub context: String,
    /// 1 = primary, 2 = secondary fallback
    #[serde(default = "default_tier")]
    pub tier: u32,
    #[serde(default)]
    pub embed: bool,
    /// Only searchable when named explicitly
    #[serde(default)]
    pub require_explicit: bool,
    /// With `require_explicit`, demands `confirm=true` per request
    #[serde(default)]
    pub safety_prompt: bool,
}

fn default_tier() -> u32 {
    1
}

/// Immutable runtime view over the configured collections.
pub struct CollectionRegistry {
    collections: Vec<CollectionSpec>,
    exclude_sets: HashMap<String, GlobSet>,
}

impl CollectionRegistry {
    pub fn new(collections: Vec<CollectionSpec>) -> Result<Self> {
        let mut exclude_sets = HashMap::new();
        for col in &collections {
            if col.exclude.is_empty() {
                continue;
            }
            exclude_sets.insert(col.name.clone(), build_exclude_set(&col.exclude)?);
        }
        Ok(Self {
            collections,
            exclude_sets,
        })
    }

    pub fn all(&self) -> &[CollectionSpec] {
        &self.collections
    }

    pub fn find(&self, name: &str) -> Option<&CollectionSpec> {
        self.collections.iter().find(|c| c.name == name)
    }

    /// Collections in a tier that may be searched implicitly.
    pub fn by_tier(&self, tier: u32) -> Vec<&CollectionSpec> {
        self.collections
            .iter()
            .filter(|c| c.tier == tier && !c.require_explicit)
            .collect()
    }

    /// Whether a hit's file falls under the collection's exclusion globs.
    /// The path is made relative to the collection root before matching.
    pub fn is_excluded(&self, collection: &str, file: &str) -> bool {
        let Some(set) = self.exclude_sets.get(collection) else {
            return false;
        };
        let rel = match self.find(collection) {
            Some(col) => relative_to_root(file, &col.path),
            None => file.to_string(),
        };
        set.is_match(rel.as_str())
    }
}

fn build_exclude_set(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            continue;
        }
        builder.add(
            Glob::new(pattern)
                .map_err(|e| Error::Config(format!("exclude glob {pattern:?}: {e}")))?,
        );
        // "drafts/**" should also exclude the directory itself, and a bare
        // "drafts/" prefix should exclude everything below it.
        if let Some(prefix) = pattern.strip_suffix("/**") {
            builder.add(
                Glob::new(prefix)
                    .map_err(|e| Error::Config(format!("exclude glob {pattern:?}: {e}")))?,
            );
        } else if let Some(prefix) = pattern.strip_suffix('/') {
            builder.add(
                Glob::new(&format!("{prefix}/**"))
                    .map_err(|e| Error::Config(format!("exclude glob {pattern:?}: {e}")))?,
            );
        }
    }
    builder
        .build()
        .map_err(|e| Error::Config(format!("exclude globs: {e}")))
}

/// Strip the collection root (or the `qmd://name` authority) from a hit URI.
fn relative_to_root(file: &str, root: &str) -> String {
    let mut rel = file;
    if let Some(rest) = rel.strip_prefix("qmd://") {
        rel = rest.split_once('/').map(|(_, tail)| tail).unwrap_or("");
        return rel.to_string();
    }
    if !root.is_empty() {
        if let Some(rest) = rel.strip_prefix(root) {
            rel = rest.trim_start_matches('/');
        }
    }
    rel.to_string()
}
