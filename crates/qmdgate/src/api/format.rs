//! Human-readable renderings embedded in JSON responses.

use qmdgate_core::{Document, Hit, SearchMeta};

/// Render search hits as readable text: a scope header, then one numbered
/// entry per hit with its snippet indented.
pub fn render_formatted_text(hits: &[Hit], meta: &SearchMeta, files_only: bool) -> String {
    let mut out = String::new();
    let scope = format_scope(&meta.collections_searched);

    if files_only {
        out.push_str(&format!("## Matching files ({} hits)\n\n", hits.len()));
        for hit in hits {
            out.push_str(&format!("{} ({:.2})\n", hit.preferred_uri(), hit.score));
        }
        return out.trim().to_string();
    }

    out.push_str(&format!("## Results ({scope}, {} hits)\n\n", hits.len()));
    for (i, hit) in hits.iter().enumerate() {
        out.push_str(&format!("{}. [{:.2}] {}\n", i + 1, hit.score, hit.preferred_uri()));
        let snippet = hit.snippet.trim();
        if snippet.is_empty() {
            out.push('\n');
            continue;
        }
        for line in snippet.lines() {
            out.push_str("   ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
    }
    out.trim().to_string()
}

/// Render a search-and-get response: fetched documents in full, skipped
/// (over-budget) files marked, then the remaining file hits.
pub fn render_search_and_get_text(
    file_hits: &[Hit],
    docs: &[Document],
    truncated: &[String],
    meta: &SearchMeta,
) -> String {
    let mut out = String::new();
    let scope = format_scope(&meta.collections_searched);
    out.push_str(&format!("## Matched files ({scope}, {} files)\n\n", file_hits.len()));

    for (i, doc) in docs.iter().enumerate() {
        let score = score_by_uri(file_hits, &doc.file);
        out.push_str(&format!(
            "### Document {}/{}: {} (score: {:.2})\n\n",
            i + 1,
            docs.len(),
            doc.file,
            score
        ));
        out.push_str(&preserve_structured_block(&doc.content));
        out.push_str("\n\n");
    }

    if !truncated.is_empty() {
        out.push_str("### Skipped by byte budget\n\n");
        for file in truncated {
            out.push_str(file);
            out.push_str(" (TRUNCATED)\n");
        }
        out.push('\n');
    }

    if file_hits.len() > docs.len() {
        out.push_str("### Other matching files\n\n");
        for hit in file_hits {
            let uri = hit.preferred_uri();
            if docs.iter().any(|d| d.file == uri) {
                continue;
            }
            out.push_str(&format!("{} ({:.2})\n", uri, hit.score));
        }
    }

    out.trim().to_string()
}

fn format_scope(collections: &[String]) -> String {
    if collections.is_empty() {
        "all".to_string()
    } else {
        collections.join(", ")
    }
}

fn score_by_uri(hits: &[Hit], uri: &str) -> f64 {
    hits.iter()
        .find(|h| h.preferred_uri() == uri)
        .map(|h| h.score)
        .unwrap_or(0.0)
}

/// Wrap structured document bodies (currently: valid JSON) in a fenced
/// block so they survive markdown rendering.
fn preserve_structured_block(content: &str) -> String {
    if content.is_empty() {
        return String::new();
    }
    let trimmed = content.trim();
    if serde_json::from_str::<serde_json::Value>(trimmed).is_ok() {
        return fence_block(content, "json");
    }
    content.to_string()
}

fn fence_block(content: &str, language: &str) -> String {
    let fence = if content.contains("```") { "````" } else { "```" };
    format!("{fence}{language}\n{content}\n{fence}")
}
