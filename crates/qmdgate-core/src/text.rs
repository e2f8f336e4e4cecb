//! CJK-aware text measurement and markdown snippet cleanup.

use once_cell::sync::Lazy;
use regex::Regex;

static RE_HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^#{1,6}\s+").unwrap());
static RE_LINK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[([^\]]+)\]\([^)]+\)").unwrap());
static RE_BOLD_STAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*\*([^*\n]+)\*\*").unwrap());
static RE_ITALIC_STAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*([^*\n]+)\*").unwrap());
static RE_BOLD_UNDERS: Lazy<Regex> = Lazy::new(|| Regex::new(r"__([^_\n]+)__").unwrap());
static RE_ITALIC_UNDERS: Lazy<Regex> = Lazy::new(|| Regex::new(r"_([^_\n]+)_").unwrap());
static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

/// Whether `r` falls within the common Han ranges.
pub fn is_cjk(r: char) -> bool {
    let c = r as u32;
    (0x4E00..=0x9FFF).contains(&c)
        || (0x3400..=0x4DBF).contains(&c)
        || (0x20000..=0x2A6DF).contains(&c)
        || (0xF900..=0xFAFF).contains(&c)
}

/// Number of CJK runes in `s`.
pub fn count_cjk(s: &str) -> usize {
    s.chars().filter(|&r| is_cjk(r)).count()
}

/// Word count with CJK-aware splitting: each CJK rune counts as its own
/// word, ASCII words split on whitespace.
pub fn count_words_mixed(s: &str) -> usize {
    let mut count = 0;
    let mut in_word = false;
    for r in s.chars() {
        if r.is_whitespace() {
            if in_word {
                count += 1;
                in_word = false;
            }
            continue;
        }
        if is_cjk(r) {
            if in_word {
                count += 1;
                in_word = false;
            }
            count += 1;
        } else {
            in_word = true;
        }
    }
    if in_word {
        count += 1;
    }
    count
}

/// The deep-routing word metric: whitespace-delimited token count, unless
/// the CJK rune count is larger.
pub fn count_words_max_fields_or_cjk(s: &str) -> usize {
    let ascii_words = s.split_whitespace().count();
    let cjk_words = count_cjk(s);
    cjk_words.max(ascii_words)
}

/// Share of non-whitespace runes that are ASCII exceeds 80%.
pub fn is_predominantly_ascii(s: &str) -> bool {
    let mut ascii = 0usize;
    let mut total = 0usize;
    for r in s.chars() {
        if !r.is_whitespace() {
            total += 1;
            if (r as u32) < 128 {
                ascii += 1;
            }
        }
    }
    if total == 0 {
        return true;
    }
    ascii as f64 / total as f64 > 0.8
}

/// Strip markdown-heavy noise from a snippet and apply a rune-safe maximum
/// length, preferring a sentence boundary within the last 200 runes before
/// the cut. `max_len == 0` disables truncation.
pub fn clean_snippet(s: &str, max_len: usize) -> String {
    let s = RE_HEADING.replace_all(s, "");
    let s = RE_LINK.replace_all(&s, "$1");
    let s = RE_BOLD_STAR.replace_all(&s, "$1");
    let s = RE_ITALIC_STAR.replace_all(&s, "$1");
    let s = RE_BOLD_UNDERS.replace_all(&s, "$1");
    let s = RE_ITALIC_UNDERS.replace_all(&s, "$1");
    let s = RE_BLANK_LINES.replace_all(&s, "\n\n");
    let s = s.trim();

    if max_len == 0 {
        return s.to_string();
    }

    let runes: Vec<char> = s.chars().collect();
    if runes.len() <= max_len {
        return s.to_string();
    }

    if max_len <= 3 {
        return runes[..max_len].iter().collect();
    }

    let mut cut = max_len - 3;
    let start = cut.saturating_sub(200);
    for i in (start..cut).rev() {
        if is_sentence_end(runes[i]) {
            cut = i + 1;
            break;
        }
    }

    let head: String = runes[..cut].iter().collect();
    format!("{}...", head.trim_end())
}

/// Rune-safe truncation with a trailing ellipsis when there is room for one.
pub fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    if max_chars == 0 {
        return String::new();
    }
    let runes: Vec<char> = s.chars().collect();
    if runes.len() <= max_chars {
        return s.to_string();
    }
    if max_chars <= 3 {
        return runes[..max_chars].iter().collect();
    }
    let head: String = runes[..max_chars - 3].iter().collect();
    format!("{head}...")
}

fn is_sentence_end(r: char) -> bool {
    matches!(r, '。' | '.' | '？' | '?' | '！' | '!' | '\n')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_snippet_removes_markdown_noise() {
        let input = "# Title\n\nSome **bold** text with [link](https://example.com).\n\n\nNext.";
        let want = "Title\n\nSome bold text with link.\n\nNext.";
        assert_eq!(clean_snippet(input, 0), want);
    }

    #[test]
    fn test_clean_snippet_truncates_by_runes() {
        assert_eq!(clean_snippet("你好世界abc", 4), "你...");
    }

    #[test]
    fn test_clean_snippet_truncates_at_sentence_boundary() {
        let input = "第一句。第二句很长很长很长。第三句";
        assert_eq!(clean_snippet(input, 16), "第一句。...");
    }

    #[test]
    fn test_clean_snippet_no_split_codepoints() {
        let out = clean_snippet("演示文本之外的更多内容在这里继续延伸", 10);
        // The output must be valid UTF-8 built from whole runes.
        assert!(out.chars().count() <= 10);
        assert!(out.ends_with("..."));
    }

    #[test]
    fn test_count_words_mixed() {
        assert_eq!(count_words_mixed("hello world"), 2);
        assert_eq!(count_words_mixed("网络"), 2);
        assert_eq!(count_words_mixed("memory 检索 fallback"), 4);
        assert_eq!(count_words_mixed("路由policy"), 3);
        assert_eq!(count_words_mixed(""), 0);
    }

    #[test]
    fn test_count_words_max_fields_or_cjk() {
        assert_eq!(count_words_max_fields_or_cjk("one two three"), 3);
        assert_eq!(count_words_max_fields_or_cjk("如何修复网络问题"), 8);
    }

    #[test]
    fn test_is_predominantly_ascii() {
        assert!(is_predominantly_ascii("plain ascii query"));
        assert!(!is_predominantly_ascii("网络 架构 优化"));
        assert!(is_predominantly_ascii(""));
    }

    #[test]
    fn test_truncate_with_ellipsis() {
        assert_eq!(truncate_with_ellipsis("short", 10), "short");
        assert_eq!(truncate_with_ellipsis("a longer sentence", 8), "a lon...");
        assert_eq!(truncate_with_ellipsis("abc", 0), "");
        assert_eq!(truncate_with_ellipsis("abcdef", 2), "ab");
    }
}
