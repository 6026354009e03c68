use once_cell::sync::Lazy;
use regex::Regex;

static IMG_SRC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)<img[^>]+src\s*=\s*["']([^"']+)["']"#).expect("img regex"));

static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").expect("tag regex"));

/// Remove HTML tags, leaving the visible text.
pub fn strip_tags(html: &str) -> String {
    TAG.replace_all(html, " ").to_string()
}

/// Words of visible text in an HTML fragment.
pub fn word_count(html: &str) -> usize {
    strip_tags(html).split_whitespace().count()
}

/// First `<img src="...">` URL in the content, if any. Used for the
/// best-effort cover image on publish.
pub fn first_image_url(html: &str) -> Option<String> {
    IMG_SRC
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_tags_and_counts_words() {
        let html = "<p>Hello <b>world</b></p><div>again</div>";
        assert_eq!(word_count(html), 3);
    }

    #[test]
    fn word_count_ignores_attributes() {
        let html = r#"<a href="https://example.com/x" title="many words here">link</a>"#;
        assert_eq!(word_count(html), 1);
    }

    #[test]
    fn finds_first_image() {
        let html = r#"<p>text</p><img alt="x" src="https://cdn.example.com/a.jpg"><img src="b.png">"#;
        assert_eq!(
            first_image_url(html).as_deref(),
            Some("https://cdn.example.com/a.jpg")
        );
    }

    #[test]
    fn no_image_returns_none() {
        assert_eq!(first_image_url("<p>plain</p>"), None);
    }
}
