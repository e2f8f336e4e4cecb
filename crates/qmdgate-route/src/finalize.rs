//! Result finalization: dedup, ordering, and snippet budgets.

use qmdgate_core::text::{clean_snippet, truncate_with_ellipsis};
use qmdgate_core::Hit;
use std::collections::{HashMap, HashSet};

/// Per-result snippet ceiling, in runes.
pub const MAX_SNIPPET_CHARS_PER_RESULT: usize = 1500;

/// How many hits one file may contribute when the diversity cap is active.
const PER_FILE_DIVERSITY_CAP: usize = 2;

/// Remove duplicate hits (stable, by identity key), sort by score
/// descending (stable for ties), then apply top-K. When `diversity` is set,
/// a single file contributes at most two hits to the kept set. `top_k == 0`
/// means unlimited.
pub fn dedup_sort_limit(hits: Vec<Hit>, top_k: usize, diversity: bool) -> Vec<Hit> {
    let mut seen = HashSet::with_capacity(hits.len());
    let mut deduped: Vec<Hit> = Vec::with_capacity(hits.len());
    for hit in hits {
        if seen.insert(hit.identity_key()) {
            deduped.push(hit);
        }
    }

    deduped.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    let mut kept: Vec<Hit> = Vec::with_capacity(deduped.len());
    let mut per_file: HashMap<String, usize> = HashMap::new();
    for hit in deduped {
        if diversity && !hit.file.is_empty() {
            let count = per_file.entry(hit.file.clone()).or_insert(0);
            if *count >= PER_FILE_DIVERSITY_CAP {
                continue;
            }
            *count += 1;
        }
        kept.push(hit);
        if top_k > 0 && kept.len() >= top_k {
            break;
        }
    }
    kept
}

/// Clean every snippet and truncate it to the per-result rune ceiling.
pub fn clean_snippets(mut hits: Vec<Hit>) -> Vec<Hit> {
    for hit in &mut hits {
        hit.snippet = clean_snippet(&hit.snippet, MAX_SNIPPET_CHARS_PER_RESULT);
    }
    hits
}

/// Enforce the global snippet character budget: accumulate rune counts in
/// order; the hit that would exceed the budget gets a rune-safe truncated
/// snippet and every later hit is dropped. `max_chars == 0` disables.
pub fn enforce_max_chars(mut hits: Vec<Hit>, max_chars: usize) -> Vec<Hit> {
    if max_chars == 0 {
        return hits;
    }

    let mut total = 0usize;
    for i in 0..hits.len() {
        let snippet_chars = hits[i].snippet.chars().count();
        let next_total = total + snippet_chars;
        if next_total <= max_chars {
            total = next_total;
            continue;
        }

        let remain = max_chars - total;
        if remain == 0 {
            hits.truncate(i);
            return hits;
        }
        hits[i].snippet = truncate_with_ellipsis(&hits[i].snippet, remain);
        hits.truncate(i + 1);
        return hits;
    }
    hits
}

/// Drop hits whose score falls below the minimum. `min_score <= 0` disables.
pub fn filter_min_score(hits: Vec<Hit>, min_score: f64) -> Vec<Hit> {
    if min_score <= 0.0 {
        return hits;
    }
    hits.into_iter().filter(|h| h.score >= min_score).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(docid: &str, file: &str, score: f64) -> Hit {
        Hit {
            docid: docid.to_string(),
            file: file.to_string(),
            score,
            ..Hit::default()
        }
    }

    #[test]
    fn test_dedup_sort_limit_enforces_file_diversity() {
        let input = vec![
            hit("a1", "a.md", 0.95),
            hit("a2", "a.md", 0.90),
            hit("a3", "a.md", 0.85),
            hit("b1", "b.md", 0.80),
            hit("c1", "c.md", 0.70),
        ];
        let out = dedup_sort_limit(input, 4, true);
        assert_eq!(out.len(), 4);
        let from_a = out.iter().filter(|h| h.file == "a.md").count();
        assert_eq!(from_a, 2);
        assert_eq!(out[0].docid, "a1");
        assert_eq!(out.last().unwrap().docid, "c1");
    }

    #[test]
    fn test_dedup_sort_limit_still_dedups_when_top_k_unlimited() {
        let input = vec![
            hit("dup", "a.md", 0.9),
            hit("dup", "a.md", 0.8),
            hit("b1", "b.md", 0.7),
        ];
        let out = dedup_sort_limit(input, 0, true);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_dedup_sort_limit_without_diversity_keeps_same_file_hits() {
        let input = vec![
            hit("a1", "a.md", 0.95),
            hit("a2", "a.md", 0.90),
            hit("a3", "a.md", 0.85),
        ];
        let out = dedup_sort_limit(input, 0, false);
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn test_sort_is_descending_and_stable() {
        let mut first = hit("x1", "x.md", 0.5);
        first.title = "first".to_string();
        let mut second = hit("x2", "y.md", 0.5);
        second.title = "second".to_string();
        let out = dedup_sort_limit(vec![first, second, hit("top", "z.md", 0.9)], 0, true);
        assert_eq!(out[0].docid, "top");
        assert_eq!(out[1].title, "first");
        assert_eq!(out[2].title, "second");
    }

    #[test]
    fn test_enforce_max_chars_truncates_boundary_hit() {
        let mut a = hit("a", "a.md", 0.9);
        a.snippet = "x".repeat(50);
        let mut b = hit("b", "b.md", 0.8);
        b.snippet = "y".repeat(50);
        let mut c = hit("c", "c.md", 0.7);
        c.snippet = "z".repeat(50);

        let out = enforce_max_chars(vec![a, b, c], 80);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].snippet.chars().count(), 50);
        assert_eq!(out[1].snippet.chars().count(), 30);
        assert!(out[1].snippet.ends_with("..."));
    }

    #[test]
    fn test_enforce_max_chars_drops_hit_when_budget_spent() {
        let mut a = hit("a", "a.md", 0.9);
        a.snippet = "x".repeat(80);
        let mut b = hit("b", "b.md", 0.8);
        b.snippet = "y".repeat(10);

        let out = enforce_max_chars(vec![a, b], 80);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_enforce_max_chars_rune_safe() {
        let mut a = hit("a", "a.md", 0.9);
        a.snippet = "中文内容很长".repeat(10);
        let out = enforce_max_chars(vec![a], 20);
        assert_eq!(out[0].snippet.chars().count(), 20);
    }

    #[test]
    fn test_finalize_chain_is_idempotent() {
        let mut a = hit("a", "a.md", 0.9);
        a.snippet = "# Heading\n\nBody **bold** text. More sentences follow here.".to_string();
        let mut b = hit("b", "b.md", 0.8);
        b.snippet = "Second snippet.".to_string();

        let once = enforce_max_chars(
            clean_snippets(dedup_sort_limit(vec![a, b], 5, true)),
            40,
        );
        let twice = enforce_max_chars(
            clean_snippets(dedup_sort_limit(once.clone(), 5, true)),
            40,
        );
        assert_eq!(once, twice);
    }

    #[test]
    fn test_filter_min_score() {
        let input = vec![hit("a", "a.md", 0.9), hit("b", "b.md", 0.2)];
        let out = filter_min_score(input, 0.3);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].docid, "a");
    }

    #[test]
    fn test_filter_min_score_disabled() {
        let input = vec![hit("a", "a.md", 0.9), hit("b", "b.md", 0.2)];
        assert_eq!(filter_min_score(input, 0.0).len(), 2);
    }
}
