//! Per-asset-type payload optimization applied before an entry is measured.
//!
//! Only UTF-8 payloads are touched; anything else is stored as received.

use std::sync::LazyLock;

use bytes::Bytes;
use regex::Regex;

use super::AssetType;

static MARKUP_COMMENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").unwrap());

static INTER_TAG_SPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r">\s+<").unwrap());

static STYLE_COMMENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)/\*.*?\*/").unwrap());

static WHITESPACE_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

pub fn optimize(asset_type: AssetType, payload: Bytes) -> Bytes {
    let Ok(text) = std::str::from_utf8(&payload) else {
        return payload;
    };

    let optimized = match asset_type {
        AssetType::Image => collapse_image(text),
        AssetType::Text if looks_like_markup(text) => strip_markup(text),
        AssetType::Style => strip_style(text),
        _ => return payload,
    };

    if optimized.len() < payload.len() {
        Bytes::from(optimized)
    } else {
        payload
    }
}

fn looks_like_markup(text: &str) -> bool {
    text.trim_start().starts_with('<')
}

/// Text-paint images use spaces for transparent pixels: trailing runs on a
/// row and trailing blank rows draw nothing.
fn collapse_image(text: &str) -> String {
    let rows: Vec<&str> = text.lines().map(str::trim_end).collect();
    let used = rows.iter().rposition(|row| !row.is_empty()).map_or(0, |i| i + 1);
    rows[..used].join("\n")
}

fn strip_markup(text: &str) -> String {
    let without_comments = MARKUP_COMMENT.replace_all(text, "");
    INTER_TAG_SPACE
        .replace_all(&without_comments, "><")
        .trim()
        .to_string()
}

fn strip_style(text: &str) -> String {
    let without_comments = STYLE_COMMENT.replace_all(text, "");
    WHITESPACE_RUN
        .replace_all(&without_comments, " ")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(asset_type: AssetType, input: &str) -> String {
        let out = optimize(asset_type, Bytes::from(input.to_string()));
        String::from_utf8(out.to_vec()).unwrap()
    }

    #[test]
    fn test_markup_comments_and_whitespace() {
        let html = "<html>\n  <!-- nav -->\n  <body>\n    <p>Hello  world</p>\n  </body>\n</html>\n";
        assert_eq!(
            run(AssetType::Text, html),
            "<html><body><p>Hello  world</p></body></html>"
        );
    }

    #[test]
    fn test_plain_text_is_untouched() {
        let text = "a > b\n   < c";
        assert_eq!(run(AssetType::Text, text), text);
    }

    #[test]
    fn test_style_is_minified() {
        let css = "/* header */\nbody {\n  color: red;\n}\n";
        assert_eq!(run(AssetType::Style, css), "body { color: red; }");
    }

    #[test]
    fn test_image_rows_are_collapsed() {
        let image = "ff  \n f f    \n\n   \n";
        assert_eq!(run(AssetType::Image, image), "ff\n f f");
    }

    #[test]
    fn test_scripts_and_binary_pass_through() {
        let script = "local x = 1  -- keep\n\n";
        assert_eq!(run(AssetType::Script, script), script);

        let binary = Bytes::from_static(&[0xff, 0xfe, b' ', b' ', b'\n']);
        assert_eq!(optimize(AssetType::Image, binary.clone()), binary);
    }
}
