//! Strips markup from a finished unit before it is spoken.
//!
//! Models asked for plain text still emit markdown emphasis, stray tags
//! and list bullets; the synthesizer would read those aloud.

use std::sync::LazyLock;

use regex::Regex;

static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"</?[A-Za-z][A-Za-z0-9_-]*\s*/?>").unwrap());
static LINK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[([^\]]*)\]\([^)]*\)").unwrap());
static CODE_FENCE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"```[A-Za-z0-9_-]*").unwrap());
static LINE_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*(?:#{1,6}\s+|>\s*|[-*+]\s+|\d+[.)]\s+)").unwrap());
static EMPHASIS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[*_`~]+").unwrap());
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Return `text` with markup removed and whitespace collapsed.
///
/// Can return an empty string; callers skip synthesis in that case.
pub fn sanitize(text: &str) -> String {
    let text = TAG.replace_all(text, " ");
    let text = LINK.replace_all(&text, "$1");
    let text = CODE_FENCE.replace_all(&text, " ");
    let text = LINE_PREFIX.replace_all(&text, "");
    let text = EMPHASIS.replace_all(&text, "");
    let text = WHITESPACE.replace_all(&text, " ");
    text.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_untouched() {
        assert_eq!(sanitize("Hello there, how are you?"), "Hello there, how are you?");
    }

    #[test]
    fn test_strips_markdown() {
        assert_eq!(
            sanitize("**Great** job! Try `this` and _that_."),
            "Great job! Try this and that."
        );
        assert_eq!(sanitize("## Tips\n- one\n- two"), "Tips one two");
        assert_eq!(sanitize("1. First\n2) Second"), "First Second");
    }

    #[test]
    fn test_strips_tags_and_links() {
        assert_eq!(sanitize("<response>Hi</response>"), "Hi");
        assert_eq!(sanitize("See [the guide](https://x.y/z) now"), "See the guide now");
        assert_eq!(sanitize("a <br/> b"), "a b");
    }

    #[test]
    fn test_keeps_comparison_signs() {
        assert_eq!(sanitize("3 < 4 and 5 > 2"), "3 < 4 and 5 > 2");
    }

    #[test]
    fn test_markup_only_becomes_empty() {
        assert_eq!(sanitize("  ** __ ``` \n"), "");
    }
}
