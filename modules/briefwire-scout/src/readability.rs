//! Heuristic main-content extraction from raw HTML.
//!
//! Not a rendering engine: strip the chrome, keep the densest prose. Runs
//! on a blocking worker since large pages are CPU-bound to scan.

use regex::Regex;
use std::sync::OnceLock;

const CHROME_TAGS: &[&str] = &[
    "script", "style", "nav", "header", "footer", "aside", "form", "noscript", "iframe",
];

fn chrome_regexes() -> &'static Vec<Regex> {
    static RE: OnceLock<Vec<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        CHROME_TAGS
            .iter()
            .map(|tag| {
                Regex::new(&format!(r"(?is)<{tag}[^>]*>.*?</{tag}>"))
                    .expect("invalid chrome regex")
            })
            .collect()
    })
}

fn comment_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<!--.*?-->").expect("invalid comment regex"))
}

fn paragraph_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<p[^>]*>(.*?)</p>").expect("invalid paragraph regex"))
}

fn tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<[^>]+>").expect("invalid tag regex"))
}

/// Pull the main article text out of an HTML page.
///
/// Strategy: drop scripts/styles/navigation chrome and comments, then take
/// paragraph contents if the page has meaningful `<p>` density, else fall
/// back to stripping every tag. Whitespace is collapsed either way.
pub fn extract_main_content(html: &str) -> String {
    let without_comments = comment_regex().replace_all(html, " ");
    let mut without_chrome = without_comments.into_owned();
    for regex in chrome_regexes() {
        without_chrome = regex.replace_all(&without_chrome, " ").into_owned();
    }

    let paragraphs: Vec<String> = paragraph_regex()
        .captures_iter(&without_chrome)
        .map(|cap| strip_tags(&cap[1]))
        .filter(|p| !p.is_empty())
        .collect();

    let paragraph_text = paragraphs.join("\n\n");
    let text = if paragraph_text.len() > 200 {
        paragraph_text
    } else {
        strip_tags(&without_chrome)
    };

    collapse_whitespace(&text)
}

fn strip_tags(html: &str) -> String {
    let text = tag_regex().replace_all(html, " ");
    decode_entities(&text)
}

fn decode_entities(text: &str) -> String {
    text.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_paragraph_content() {
        let html = format!(
            r#"<html><head><script>var x = "junk";</script></head>
            <body><nav>Home | About</nav>
            <p>{}</p><p>{}</p>
            <footer>Copyright</footer></body></html>"#,
            "First paragraph of the actual article body. ".repeat(5),
            "Second paragraph with more substance. ".repeat(5),
        );
        let text = extract_main_content(&html);
        assert!(text.contains("First paragraph"));
        assert!(text.contains("Second paragraph"));
        assert!(!text.contains("junk"));
        assert!(!text.contains("Home | About"));
        assert!(!text.contains("Copyright"));
    }

    #[test]
    fn falls_back_to_full_strip_without_paragraphs() {
        let html = "<html><body><div>Short page body without paragraph tags.</div></body></html>";
        let text = extract_main_content(html);
        assert_eq!(text, "Short page body without paragraph tags.");
    }

    #[test]
    fn decodes_entities_and_collapses_whitespace() {
        let html = "<p>Profits &amp; losses


            balanced&nbsp;out</p>";
        let text = extract_main_content(html);
        assert_eq!(text, "Profits & losses balanced out");
    }
}
