//! HTML-safe escaping helpers, text vs. attribute context.
//!
//! Grounded on the teacher's `diff/parser.rs::escape_html`, split into two
//! modes because spec.md §4.2 requires attribute-context slots to be escaped
//! differently from text-position slots (quotes must be escaped in the
//! latter, not just `&`/`<`/`>`).

/// Escape a string for placement between HTML tags (text-position slot).
pub fn escape_text(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

/// Escape a string for placement inside a double-quoted HTML attribute value.
pub fn escape_attr(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_escapes_angle_brackets_and_amp() {
        assert_eq!(escape_text("<b>a & b</b>"), "&lt;b&gt;a &amp; b&lt;/b&gt;");
    }

    #[test]
    fn text_leaves_quotes_alone() {
        assert_eq!(escape_text(r#"he said "hi""#), r#"he said "hi""#);
    }

    #[test]
    fn attr_escapes_quotes() {
        assert_eq!(escape_attr(r#"a"b'c"#), "a&quot;b&#39;c");
    }
}
