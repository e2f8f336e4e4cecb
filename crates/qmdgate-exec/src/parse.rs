//! Resilient parsing of backend output.
//!
//! The backend emits JSON when asked (`--json`) but older builds fall back to
//! human-oriented text, and some prepend warning lines before the payload.
//! Every parser here tries JSON first, then a structured-text form, and for
//! hit rows a final CSV form. Empty output and the literal
//! `No results found.` both mean an empty result, never a parse error.

use qmdgate_core::{CollectionInfo, Error, Hit, IndexStatus, Result};

/// Parse search output into hits.
///
/// Accepted shapes, in order: a JSON array of hits; the textual empty-result
/// marker; a JSON array after prepended warning lines; CSV rows of
/// `docid,score,uri,title` with the collection derived from the URI
/// authority.
pub fn parse_search_output(out: &str) -> Result<Vec<Hit>> {
    let trimmed = out.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    if let Ok(hits) = serde_json::from_str::<Vec<Hit>>(trimmed) {
        return Ok(hits);
    }

    if trimmed.contains("No results found.") {
        return Ok(Vec::new());
    }

    // Some backend builds prepend warnings before the JSON payload.
    if let Some(idx) = trimmed.find('[') {
        if idx > 0 {
            if let Ok(hits) = serde_json::from_str::<Vec<Hit>>(&trimmed[idx..]) {
                return Ok(hits);
            }
        }
    }

    if let Some(hits) = parse_csv_hits(trimmed) {
        return Ok(hits);
    }

    Err(Error::Parse(format!(
        "invalid search output: {:.200}",
        trimmed
    )))
}

/// CSV hit rows: `docid,score,uri,title`. The title may itself contain
/// commas, so only the first three fields are split strictly.
fn parse_csv_hits(out: &str) -> Option<Vec<Hit>> {
    let mut hits = Vec::new();
    for line in out.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.splitn(4, ',');
        let docid = parts.next()?.trim();
        let score = parts.next()?.trim().parse::<f64>().ok()?;
        let uri = parts.next()?.trim();
        let title = parts.next().unwrap_or("").trim();
        if docid.is_empty() || uri.is_empty() {
            return None;
        }
        hits.push(Hit {
            docid: docid.to_string(),
            score,
            file: uri.to_string(),
            title: title.to_string(),
            collection: collection_from_uri(uri),
            snippet: String::new(),
        });
    }
    if hits.is_empty() {
        None
    } else {
        Some(hits)
    }
}

/// Authority component of a `qmd://collection/path` URI.
pub fn collection_from_uri(uri: &str) -> String {
    uri.strip_prefix("qmd://")
        .map(|rest| rest.split('/').next().unwrap_or("").to_string())
        .unwrap_or_default()
}

/// Parse `collection list` output: a JSON array, a `{collections: […]}`
/// wrapper, or the text listing with `name (qmd://…)` headings.
pub fn parse_collection_list(out: &str) -> Result<Vec<CollectionInfo>> {
    match parse_collection_list_json(out) {
        Ok(cols) => Ok(cols),
        Err(json_err) => parse_collection_list_text(out).map_err(|text_err| {
            Error::Parse(format!(
                "collection list: json parse failed: {json_err}; text parse failed: {text_err}"
            ))
        }),
    }
}

fn parse_collection_list_json(out: &str) -> Result<Vec<CollectionInfo>> {
    let trimmed = out.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    if let Ok(cols) = serde_json::from_str::<Vec<CollectionInfo>>(trimmed) {
        return Ok(cols);
    }

    #[derive(serde::Deserialize)]
    struct Wrapped {
        collections: Option<Vec<CollectionInfo>>,
    }
    if let Ok(wrapped) = serde_json::from_str::<Wrapped>(trimmed) {
        if let Some(cols) = wrapped.collections {
            return Ok(cols);
        }
    }

    Err(Error::Parse("invalid json output".to_string()))
}

fn parse_collection_list_text(out: &str) -> Result<Vec<CollectionInfo>> {
    let mut cols: Vec<CollectionInfo> = Vec::new();

    for raw in out.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with("Collections") {
            continue;
        }

        if line.contains(" (qmd://") && line.ends_with(')') {
            let name = line.split(" (qmd://").next().unwrap_or("").trim();
            push_unique_collection(&mut cols, name);
        } else if line.starts_with("qmd://") && line.contains('/') {
            let rest = line.trim_start_matches("qmd://");
            let name = rest.split('/').next().unwrap_or("").trim();
            push_unique_collection(&mut cols, name);
        } else if let Some(value) = line.strip_prefix("Pattern:") {
            if let Some(last) = cols.last_mut() {
                last.mask = value.trim().to_string();
            }
        } else if let Some(value) = line.strip_prefix("Files:") {
            if let Some(last) = cols.last_mut() {
                if let Some(n) = first_field_u64(value) {
                    last.files = n;
                }
            }
        }
    }

    if cols.is_empty() {
        return Err(Error::Parse("no collections parsed".to_string()));
    }
    Ok(cols)
}

fn push_unique_collection(cols: &mut Vec<CollectionInfo>, name: &str) {
    if name.is_empty() || cols.iter().any(|c| c.name == name) {
        return;
    }
    cols.push(CollectionInfo {
        name: name.to_string(),
        ..CollectionInfo::default()
    });
}

fn first_field_u64(value: &str) -> Option<u64> {
    value.split_whitespace().next()?.parse().ok()
}

/// Parse `status` output: direct JSON, a `{status: {…}}` wrapper, a generic
/// object with a `vectors` field (possibly nested under `documents`), or the
/// text form with `Vectors:` and per-collection `Files:` rows.
pub fn parse_status(out: &str) -> Result<IndexStatus> {
    match parse_status_json(out) {
        Ok(status) => Ok(status),
        Err(json_err) => parse_status_text(out).map_err(|text_err| {
            Error::Parse(format!(
                "status: json parse failed: {json_err}; text parse failed: {text_err}"
            ))
        }),
    }
}

fn parse_status_json(out: &str) -> Result<IndexStatus> {
    let trimmed = out.trim();
    if trimmed.is_empty() {
        return Err(Error::Parse("empty status output".to_string()));
    }

    if let Ok(status) = serde_json::from_str::<IndexStatus>(trimmed) {
        if status.vectors > 0 || !status.collections.is_empty() {
            return Ok(status);
        }
    }

    #[derive(serde::Deserialize)]
    struct Wrapped {
        status: Option<IndexStatus>,
    }
    if let Ok(wrapped) = serde_json::from_str::<Wrapped>(trimmed) {
        if let Some(status) = wrapped.status {
            return Ok(status);
        }
    }

    let generic: serde_json::Value =
        serde_json::from_str(trimmed).map_err(|_| Error::Parse("invalid json output".into()))?;

    if let Some(v) = u64_from_value(&generic["vectors"]) {
        return Ok(IndexStatus {
            vectors: v,
            ..IndexStatus::default()
        });
    }
    if let Some(v) = u64_from_value(&generic["documents"]["vectors"]) {
        return Ok(IndexStatus {
            vectors: v,
            ..IndexStatus::default()
        });
    }

    Err(Error::Parse("vectors field not found".to_string()))
}

fn u64_from_value(v: &serde_json::Value) -> Option<u64> {
    match v {
        serde_json::Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f as u64)),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_status_text(out: &str) -> Result<IndexStatus> {
    let mut status = IndexStatus::default();
    let mut parsed_vectors = false;

    for raw in out.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(value) = line.strip_prefix("Vectors:") {
            if let Some(v) = first_field_u64(value) {
                status.vectors = v;
                parsed_vectors = true;
            }
        } else if line.contains(" (qmd://") && line.ends_with(')') {
            let name = line.split(" (qmd://").next().unwrap_or("").trim();
            push_unique_collection(&mut status.collections, name);
        } else if let Some(value) = line.strip_prefix("Files:") {
            if let Some(last) = status.collections.last_mut() {
                if let Some(n) = first_field_u64(value) {
                    last.files = n;
                }
            }
        }
    }

    if !parsed_vectors {
        return Err(Error::Parse("vectors line not found".to_string()));
    }
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_search_output_json() {
        let out = r#"[{"title":"A","file":"qmd://notes/a.md","collection":"notes","score":0.9,"snippet":"s","docid":"d1"}]"#;
        let hits = parse_search_output(out).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].docid, "d1");
    }

    #[test]
    fn test_parse_search_output_empty_and_no_results() {
        assert!(parse_search_output("").unwrap().is_empty());
        assert!(parse_search_output("   \n").unwrap().is_empty());
        assert!(parse_search_output("No results found.").unwrap().is_empty());
    }

    #[test]
    fn test_parse_search_output_with_warning_prefix() {
        let out = "warning: model cache is cold\n[{\"file\":\"qmd://n/a.md\",\"score\":1.0}]";
        let hits = parse_search_output(out).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].file, "qmd://n/a.md");
    }

    #[test]
    fn test_parse_search_output_csv() {
        let out = "d1,0.91,qmd://notes/a.md,First title\nd2,0.80,qmd://wiki/b.md,Second, with comma";
        let hits = parse_search_output(out).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].collection, "notes");
        assert_eq!(hits[1].collection, "wiki");
        assert_eq!(hits[1].title, "Second, with comma");
    }

    #[test]
    fn test_parse_search_output_invalid() {
        assert!(parse_search_output("totally unparseable").is_err());
    }

    #[test]
    fn test_parse_collection_list_json_array() {
        let out = r#"[{"name":"alpha","path":"/tmp/a","mask":"**/*.md","files":12}]"#;
        let cols = parse_collection_list(out).unwrap();
        assert_eq!(cols.len(), 1);
        assert_eq!(cols[0].name, "alpha");
        assert_eq!(cols[0].files, 12);
    }

    #[test]
    fn test_parse_collection_list_wrapped() {
        let out = r#"{"collections":[{"name":"beta","mask":"*.txt","files":3}]}"#;
        let cols = parse_collection_list(out).unwrap();
        assert_eq!(cols.len(), 1);
        assert_eq!(cols[0].name, "beta");
        assert_eq!(cols[0].mask, "*.txt");
    }

    #[test]
    fn test_parse_collection_list_text() {
        let out = "Collections (2):\n\nalpha (qmd://alpha/)\n  Pattern:  **/*.md\n  Files:    12\n  Updated:  1h ago\n\nbeta (qmd://beta/)\n  Pattern:  docs/*.md\n  Files:    7\n";
        let cols = parse_collection_list(out).unwrap();
        assert_eq!(cols.len(), 2);
        assert_eq!(cols[0].name, "alpha");
        assert_eq!(cols[0].mask, "**/*.md");
        assert_eq!(cols[0].files, 12);
        assert_eq!(cols[1].name, "beta");
        assert_eq!(cols[1].mask, "docs/*.md");
        assert_eq!(cols[1].files, 7);
    }

    #[test]
    fn test_parse_status_json() {
        let out = r#"{"vectors":32,"collections":[{"name":"alpha","files":12}]}"#;
        let status = parse_status(out).unwrap();
        assert_eq!(status.vectors, 32);
    }

    #[test]
    fn test_parse_status_json_nested_documents() {
        let out = r#"{"documents":{"total":581,"vectors":32}}"#;
        let status = parse_status(out).unwrap();
        assert_eq!(status.vectors, 32);
    }

    #[test]
    fn test_parse_status_text() {
        let out = "QMD Status\n\nDocuments\n  Total:    581 files indexed\n  Vectors:  32 embedded\n  Pending:  534 need embedding\n\nCollections\n  alpha (qmd://alpha/)\n    Files:    28 (updated 1h ago)\n  beta (qmd://beta/)\n    Files:    67 (updated 3h ago)\n";
        let status = parse_status(out).unwrap();
        assert_eq!(status.vectors, 32);
        assert_eq!(status.collections.len(), 2);
        assert_eq!(status.collections[0].name, "alpha");
        assert_eq!(status.collections[0].files, 28);
        assert_eq!(status.collections[1].name, "beta");
        assert_eq!(status.collections[1].files, 67);
    }

    #[test]
    fn test_collection_from_uri() {
        assert_eq!(collection_from_uri("qmd://notes/deep/a.md"), "notes");
        assert_eq!(collection_from_uri("/plain/path.md"), "");
    }
}
