//! Link discovery for opportunistic prefetch.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use url::Url;

static LINK_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(?:href|src)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).unwrap()
});

/// Markup types whose links are worth following
pub(crate) fn is_markup(mime: &str) -> bool {
    matches!(mime, "text/html" | "application/xhtml+xml")
}

/// Types that can be consumed before the whole body has arrived
pub(crate) fn is_progressive_capable(mime: &str) -> bool {
    mime.starts_with("text/")
        || mime.starts_with("image/")
        || mime.starts_with("audio/")
        || mime.starts_with("video/")
        || mime == "application/octet-stream"
        || mime == "application/xhtml+xml"
}

/// Absolute http(s) URLs referenced by `href`/`src` attributes, in document
/// order, without duplicates or fragments.
pub(crate) fn extract_links(base: &Url, markup: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut links = Vec::new();

    for captures in LINK_ATTR.captures_iter(markup) {
        let Some(raw) = captures.get(1).or_else(|| captures.get(2)) else {
            continue;
        };
        let raw = raw.as_str().trim();
        if raw.is_empty() || raw.starts_with('#') {
            continue;
        }

        let Ok(mut resolved) = base.join(raw) else {
            continue;
        };
        if !matches!(resolved.scheme(), "http" | "https") {
            continue;
        }
        resolved.set_fragment(None);

        let resolved = resolved.to_string();
        if resolved != base.as_str() && seen.insert(resolved.clone()) {
            links.push(resolved);
        }
    }

    links
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_links_resolves_and_filters() {
        let base = Url::parse("http://example.com/docs/index.html").unwrap();
        let page = r##"
            <link rel="stylesheet" href="style.css">
            <img SRC='/img/logo.png'>
            <a href="#top">top</a>
            <a href="mailto:someone@example.com">mail</a>
            <a href="https://other.org/page#section">other</a>
            <a href="style.css">again</a>
            <a href="index.html">self</a>
            <script src="javascript:void(0)"></script>
        "##;

        assert_eq!(
            extract_links(&base, page),
            vec![
                "http://example.com/docs/style.css",
                "http://example.com/img/logo.png",
                "https://other.org/page",
            ]
        );
    }

    #[test]
    fn test_progressive_types() {
        assert!(is_progressive_capable("text/html"));
        assert!(is_progressive_capable("image/png"));
        assert!(is_progressive_capable("video/mp4"));
        assert!(is_progressive_capable("application/octet-stream"));
        assert!(!is_progressive_capable("application/json"));
        assert!(is_markup("text/html"));
        assert!(!is_markup("text/css"));
    }
}
