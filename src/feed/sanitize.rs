//! HTML to plain text cleanup for post content.
//!
//! Post content is indexed for full-text search, so markup, navigation
//! chrome and code listings are removed before it is stored. Block-level
//! regions are stripped *with* their contents first; stripping tags alone
//! would leave their inner text behind.

use quick_xml::escape::{resolve_html5_entity, unescape_with};
use regex::Regex;
use std::sync::LazyLock;

/// Elements removed together with everything inside them.
const STRIPPED_BLOCKS: [&str; 8] = [
    "head", "script", "style", "code", "header", "footer", "nav", "pre",
];

/// Opening or closing tag of each stripped block; group 1 marks a close.
static BLOCK_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    STRIPPED_BLOCKS
        .iter()
        .map(|tag| {
            Regex::new(&format!(r"(?i)<(/)?{tag}(?:\s[^>]*)?>")).expect("static block pattern")
        })
        .collect()
});

static COMMENT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").expect("static comment pattern"));

static TAG_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)</?[A-Za-z!][^>]*>").expect("static tag pattern"));

static ENTITY_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"&#?[A-Za-z0-9]{1,32};").expect("static entity pattern"));

/// Clean raw bytes of unknown validity.
///
/// Invalid UTF-8 sequences are dropped (not replaced) before cleaning.
pub fn clean_html_bytes(raw: &[u8]) -> String {
    let text: String = raw.utf8_chunks().map(|chunk| chunk.valid()).collect();
    clean_html(&text)
}

/// Convert an HTML fragment or page into plain text.
///
/// Deterministic and free of I/O:
///
/// ```
/// use blogroll::feed::clean_html;
///
/// assert_eq!(clean_html("<p>hello</p>"), "hello");
/// assert_eq!(clean_html("a<pre>let x = 1;</pre>b"), "ab");
/// assert_eq!(clean_html("Fish &amp; Chips"), "Fish & Chips");
/// ```
pub fn clean_html(raw: &str) -> String {
    let mut text = COMMENT_PATTERN.replace_all(raw, "").into_owned();
    for pattern in BLOCK_PATTERNS.iter() {
        text = strip_block(&text, pattern);
    }
    let text = TAG_PATTERN.replace_all(&text, "");
    unescape_entities(&text)
}

/// Remove each outermost region of one block element.
///
/// Nesting depth is tracked so `<nav><nav>a</nav>b</nav>` goes as a whole.
/// Stray closing tags are left for the tag pass. A region still open at the
/// end of input runs to its last closing tag, if it has one.
fn strip_block(text: &str, pattern: &Regex) -> String {
    let mut regions: Vec<(usize, usize)> = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    let mut last_close = None;

    for caps in pattern.captures_iter(text) {
        let Some(tag) = caps.get(0) else { continue };
        if caps.get(1).is_none() {
            if depth == 0 {
                start = tag.start();
                last_close = None;
            }
            depth += 1;
        } else if depth > 0 {
            depth -= 1;
            last_close = Some(tag.end());
            if depth == 0 {
                regions.push((start, tag.end()));
            }
        }
    }
    if depth > 0 {
        if let Some(end) = last_close {
            regions.push((start, end));
        }
    }

    if regions.is_empty() {
        return text.to_owned();
    }
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for (from, to) in regions {
        out.push_str(&text[cursor..from]);
        cursor = to;
    }
    out.push_str(&text[cursor..]);
    out
}

/// Resolve HTML entities one reference at a time.
///
/// Unknown or malformed references are left verbatim instead of failing the
/// whole document, and a bare `&` is plain text.
fn unescape_entities(text: &str) -> String {
    ENTITY_PATTERN
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let entity = &caps[0];
            match unescape_with(entity, resolve_html5_entity) {
                Ok(resolved) => resolved.into_owned(),
                Err(_) => entity.to_owned(),
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_paragraph_tags_removed() {
        assert_eq!(clean_html("<p>hello</p>"), "hello");
    }

    #[test]
    fn test_block_contents_removed() {
        let html = "<header>SiteHeader</header>\
                    <nav>Home About</nav>\
                    <p>Body text</p>\
                    <pre>fn main() {}</pre>\
                    <p>with <code>inline_code()</code> inside</p>\
                    <footer>Copyright</footer>";
        let text = clean_html(html);
        assert_eq!(text, "Body textwith  inside");
        for hidden in ["SiteHeader", "Home About", "fn main", "inline_code", "Copyright"] {
            assert!(!text.contains(hidden), "{hidden} leaked into {text:?}");
        }
    }

    #[test]
    fn test_block_with_attributes_and_newlines() {
        let html = "<p>keep</p><pre class=\"rust\">\nlet a = 1;\nlet b = 2;\n</pre><NAV id=x>menu</NAV>";
        assert_eq!(clean_html(html), "keep");
    }

    #[test]
    fn test_head_script_style_removed() {
        let html = "<html><head><title>T</title></head><body>\
                    <script>alert(1)</script><style>p{color:red}</style>visible</body></html>";
        assert_eq!(clean_html(html), "visible");
    }

    #[test]
    fn test_nested_blocks_removed_whole() {
        let html = "<p>keep</p><nav>outer <nav>inner</nav> tail</nav><p>end</p>";
        assert_eq!(clean_html(html), "keepend");

        let code = "a<pre><pre>x</pre>y</pre>b<pre>z</pre>c";
        assert_eq!(clean_html(code), "abc");
    }

    #[test]
    fn test_unbalanced_blocks() {
        // stray close: only the tag goes
        assert_eq!(clean_html("left</nav>right"), "leftright");
        // unclosed outer: stripped through the last close
        assert_eq!(clean_html("a<nav>b<nav>c</nav>d"), "ad");
        // never closed: only the tag goes
        assert_eq!(clean_html("a<nav>b"), "ab");
    }

    #[test]
    fn test_similar_tag_names_not_stripped_as_blocks() {
        // <navigation> and <preview> are not <nav> / <pre>
        assert_eq!(clean_html("<preview>seen</preview>"), "seen");
        assert_eq!(clean_html("<navigation>seen</navigation>"), "seen");
    }

    #[test]
    fn test_comments_removed() {
        assert_eq!(clean_html("a<!-- <p>hidden</p> -->b"), "ab");
    }

    #[test]
    fn test_entities_unescaped() {
        assert_eq!(clean_html("&lt;tag&gt; &quot;q&quot; &#39;s&#39;"), "<tag> \"q\" 's'");
        assert_eq!(clean_html("caf&eacute; &#x263A;"), "café ☺");
        assert_eq!(clean_html("a&nbsp;b"), "a\u{a0}b");
    }

    #[test]
    fn test_unknown_entities_and_bare_ampersands_kept() {
        assert_eq!(clean_html("Tom & Jerry"), "Tom & Jerry");
        assert_eq!(clean_html("&notanentity;"), "&notanentity;");
    }

    #[test]
    fn test_escaped_markup_is_not_stripped_again() {
        // Entities are resolved after tag removal, so text that *describes* a
        // tag survives as text.
        assert_eq!(clean_html("use &lt;pre&gt; for code"), "use <pre> for code");
    }

    #[test]
    fn test_invalid_utf8_dropped() {
        let raw = b"caf\xc3\xa9 \xff\xfeok <b>bold</b>";
        assert_eq!(clean_html_bytes(raw), "café ok bold");
    }

    proptest! {
        #[test]
        fn prop_clean_html_is_deterministic(s in ".{0,200}") {
            prop_assert_eq!(clean_html(&s), clean_html(&s));
        }

        #[test]
        fn prop_block_inner_text_never_survives(
            tag in prop::sample::select(vec!["code", "header", "footer", "nav", "pre"]),
            inner in "[A-Z]{12}",
            before in "[a-z ]{0,20}",
            after in "[a-z ]{0,20}",
        ) {
            let html = format!("{before}<{tag}>{inner}</{tag}>{after}");
            let text = clean_html(&html);
            prop_assert!(!text.contains(&inner));
            prop_assert_eq!(text, format!("{before}{after}"));
        }

        #[test]
        fn prop_bytes_output_is_valid_text(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
            // String is UTF-8 by construction; this checks we never panic.
            let _ = clean_html_bytes(&bytes);
        }
    }
}
