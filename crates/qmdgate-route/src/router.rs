//! Query mode routing.
//!
//! Pure textual heuristics: no I/O, no state. Maps a free-form query string
//! plus the probed backend capabilities to the executor mode to run.

use once_cell::sync::Lazy;
use regex::Regex;

use qmdgate_core::text::{count_words_mixed, is_predominantly_ascii};

static QUOTED: Lazy<Regex> = Lazy::new(|| Regex::new(r#""[^"]+""#).unwrap());

/// CJK interrogative prefixes that signal a deep question.
const QUESTION_PREFIXES: &[&str] = &[
    "如何", "怎么", "怎样", "什么", "为什么", "为何", "哪些", "哪个", "哪里", "谁", "多少",
    "是否", "能不能", "可以", "应该",
];

/// Temporal cues that signal recall over past material.
const TEMPORAL_WORDS: &[&str] = &[
    "之前", "上次", "昨天", "今天", "最近", "过去", "以前", "历史", "曾经", "earlier",
    "previous", "last time",
];

/// The backend primitive selected for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// Lexical BM25 search
    Search,
    /// Vector search
    VSearch,
    /// Deep semantic query
    Query,
}

impl ExecMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecMode::Search => "search",
            ExecMode::VSearch => "vsearch",
            ExecMode::Query => "query",
        }
    }

    /// Parse an explicit mode tag; anything unrecognized is treated as auto.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "search" => Some(ExecMode::Search),
            "vsearch" => Some(ExecMode::VSearch),
            "query" => Some(ExecMode::Query),
            _ => None,
        }
    }
}

/// Route a query to an executor mode given the available capabilities.
pub fn detect_mode(query: &str, has_vector: bool, has_deep_query: bool) -> ExecMode {
    let query = query.trim();
    if query.is_empty() {
        return ExecMode::Search;
    }

    // A double-quoted phrase means the user wants exact matching.
    if QUOTED.is_match(query) {
        return ExecMode::Search;
    }

    let words = count_words_mixed(query);
    if words <= 3 && is_predominantly_ascii(query) {
        return ExecMode::Search;
    }

    if has_deep_query {
        if QUESTION_PREFIXES.iter().any(|p| query.starts_with(p)) {
            return ExecMode::Query;
        }
        if TEMPORAL_WORDS.iter().any(|w| query.contains(w)) {
            return ExecMode::Query;
        }
        if words > 8 {
            return ExecMode::Query;
        }
    }

    if has_vector && words >= 4 {
        return ExecMode::VSearch;
    }
    if has_vector && !is_predominantly_ascii(query) && words >= 2 {
        return ExecMode::VSearch;
    }

    ExecMode::Search
}
