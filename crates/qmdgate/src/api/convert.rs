//! Requested-mode and served-mode plumbing between the wire surface and the
//! orchestrator.

use qmdgate_core::{SearchMeta, ServedMode};

/// Canonicalize the wire mode: `core`, `broad`, `deep`, or `auto`. Backend
/// primitive names are accepted as aliases.
pub fn normalize_requested_mode(mode: &str) -> &'static str {
    match mode.trim().to_lowercase().as_str() {
        "core" | "search" => "core",
        "broad" | "vsearch" => "broad",
        "deep" | "query" => "deep",
        _ => "auto",
    }
}

/// Map the wire mode to the orchestrator's mode tag.
pub fn requested_mode_to_exec_tag(requested: &str) -> &'static str {
    match requested {
        "core" | "broad" => "search",
        "deep" => "query",
        _ => "auto",
    }
}

/// Fallback default when the caller did not set `allow_fallback`: deep and
/// broad imply fallback, core forbids it, auto takes the config default.
pub fn default_allow_fallback(
    requested: &str,
    explicit: Option<bool>,
    config_default: bool,
) -> bool {
    if explicit == Some(true) {
        return true;
    }
    match requested {
        "deep" | "broad" => true,
        "core" => false,
        _ => config_default,
    }
}

/// Trim, deduplicate, and sort a collection selector.
pub fn normalize_collections(cols: &[String]) -> Vec<String> {
    let mut set: Vec<String> = cols
        .iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect();
    set.sort();
    set.dedup();
    set
}

/// The mode actually delivered to the client.
pub fn derive_served_mode(
    requested: &str,
    mode_used: &str,
    fallback_triggered: bool,
    degraded: bool,
) -> ServedMode {
    if mode_used == "query" {
        return ServedMode::Deep;
    }

    match requested {
        "deep" | "broad" => ServedMode::Broad,
        "core" => {
            if fallback_triggered {
                ServedMode::Broad
            } else {
                ServedMode::Core
            }
        }
        _ => {
            if fallback_triggered || degraded {
                ServedMode::Broad
            } else {
                ServedMode::Core
            }
        }
    }
}

/// Routing decisions reported back when `explain=true`.
pub fn build_route_log(
    requested_mode: &str,
    allow_fallback: bool,
    exec_mode_tag: &str,
    meta: &SearchMeta,
    collection_count: usize,
    hit_count: usize,
) -> Vec<String> {
    vec![
        format!("requested_mode={requested_mode}"),
        format!("orchestrator_mode={exec_mode_tag}"),
        format!("allow_fallback={allow_fallback}"),
        format!("collections={collection_count}"),
        format!("mode_used={}", meta.mode_used),
        format!(
            "served_mode={}",
            meta.served_mode.map(|m| m.as_str()).unwrap_or("")
        ),
        format!("degraded={}", meta.degraded),
        format!("degrade_reason={}", meta.degrade_reason),
        format!("hits={hit_count}"),
        format!("cache_hit={}", meta.cache_hit),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_requested_mode() {
        assert_eq!(normalize_requested_mode("core"), "core");
        assert_eq!(normalize_requested_mode("Search"), "core");
        assert_eq!(normalize_requested_mode("broad"), "broad");
        assert_eq!(normalize_requested_mode("vsearch"), "broad");
        assert_eq!(normalize_requested_mode("DEEP"), "deep");
        assert_eq!(normalize_requested_mode("query"), "deep");
        assert_eq!(normalize_requested_mode(""), "auto");
        assert_eq!(normalize_requested_mode("bogus"), "auto");
    }

    #[test]
    fn test_requested_mode_to_exec_tag() {
        assert_eq!(requested_mode_to_exec_tag("core"), "search");
        assert_eq!(requested_mode_to_exec_tag("broad"), "search");
        assert_eq!(requested_mode_to_exec_tag("deep"), "query");
        assert_eq!(requested_mode_to_exec_tag("auto"), "auto");
    }

    #[test]
    fn test_default_allow_fallback() {
        assert!(default_allow_fallback("deep", None, false));
        assert!(default_allow_fallback("broad", None, false));
        assert!(!default_allow_fallback("core", None, true));
        assert!(default_allow_fallback("auto", None, true));
        assert!(!default_allow_fallback("auto", None, false));
        assert!(default_allow_fallback("core", Some(true), false));
    }

    #[test]
    fn test_normalize_collections() {
        let cols = vec![
            " beta ".to_string(),
            "alpha".to_string(),
            String::new(),
            "beta".to_string(),
        ];
        assert_eq!(normalize_collections(&cols), vec!["alpha", "beta"]);
        assert!(normalize_collections(&[]).is_empty());
    }

    #[test]
    fn test_derive_served_mode() {
        assert_eq!(derive_served_mode("auto", "query", false, false), ServedMode::Deep);
        assert_eq!(derive_served_mode("deep", "search", false, true), ServedMode::Broad);
        assert_eq!(derive_served_mode("broad", "search", false, false), ServedMode::Broad);
        assert_eq!(derive_served_mode("core", "search", false, false), ServedMode::Core);
        assert_eq!(derive_served_mode("core", "search", true, false), ServedMode::Broad);
        assert_eq!(derive_served_mode("auto", "search", false, false), ServedMode::Core);
        assert_eq!(derive_served_mode("auto", "search", false, true), ServedMode::Broad);
        assert_eq!(derive_served_mode("auto", "vsearch", true, false), ServedMode::Broad);
    }

    #[test]
    fn test_build_route_log_reports_decisions() {
        let meta = SearchMeta {
            mode_used: "search".to_string(),
            served_mode: Some(ServedMode::Core),
            cache_hit: true,
            ..SearchMeta::default()
        };
        let log = build_route_log("auto", true, "search", &meta, 2, 5);
        assert!(log.contains(&"requested_mode=auto".to_string()));
        assert!(log.contains(&"collections=2".to_string()));
        assert!(log.contains(&"hits=5".to_string()));
        assert!(log.contains(&"cache_hit=true".to_string()));
        assert!(log.contains(&"served_mode=core".to_string()));
    }
}
