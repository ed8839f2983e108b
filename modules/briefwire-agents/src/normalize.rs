//! Content normalization ahead of any model call.

use regex::Regex;
use std::sync::OnceLock;

/// Boilerplate fragments commonly injected by feeds and CMS templates.
/// Lines containing one of these (case-insensitive) are dropped wholesale.
const BOILERPLATE_PATTERNS: &[&str] = &[
    "click to read more",
    "read more",
    "continue reading",
    "subscribe to our newsletter",
    "sign up for our newsletter",
    "follow us on",
    "share this article",
    "all rights reserved",
    "advertisement",
    "sponsored content",
    "related articles",
    "cookie policy",
];

fn tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<[^>]+>").expect("invalid tag regex"))
}

fn entity_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"&(amp|lt|gt|quot|#39|nbsp);").expect("invalid entity regex"))
}

/// Strip HTML, decode the common entities, drop boilerplate lines, and
/// collapse whitespace. The output feeds prompts, not rendering, so the
/// transformation is lossy.
pub fn clean_article_text(raw: &str) -> String {
    let without_tags = tag_regex().replace_all(raw, " ");
    let decoded = entity_regex().replace_all(&without_tags, |caps: &regex::Captures| {
        match &caps[1] {
            "amp" => "&",
            "lt" => "<",
            "gt" => ">",
            "quot" => "\"",
            "#39" => "'",
            _ => " ", // nbsp
        }
        .to_string()
    });

    decoded
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| {
            let lowered = line.to_lowercase();
            !BOILERPLATE_PATTERNS.iter().any(|p| lowered.contains(p))
        })
        .collect::<Vec<_>>()
        .join("\n")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Truncate on a char boundary so prompts stay under token limits.
pub fn truncate_for_prompt(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
