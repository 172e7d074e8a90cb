/// Smart punctuation and HTML entities the chat platform injects, mapped
/// back to what a MOO parser expects. Entity unescaping runs after the
/// bracket entities so a literal `&amp;lt;` decodes in one pass.
const REPLACEMENTS: &[(&str, &str)] = &[
    ("\u{201c}", "\""), // left double quotation mark
    ("\u{201d}", "\""), // right double quotation mark
    ("\u{2018}", "'"),  // left single quotation mark
    ("\u{2019}", "'"),  // right single quotation mark
    ("&lt;", "<"),
    ("&gt;", ">"),
    ("&amp;", "&"),
];

/// Normalize inbound chat text before it reaches the MOO command line.
pub fn to_ascii(text: &str) -> String {
    REPLACEMENTS
        .iter()
        .fold(text.to_string(), |acc, (from, to)| acc.replace(from, to))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smart_quotes_become_ascii() {
        assert_eq!(to_ascii("\u{201c}hi\u{201d}"), "\"hi\"");
        assert_eq!(to_ascii("it\u{2019}s"), "it's");
    }

    #[test]
    fn html_entities_are_unescaped() {
        assert_eq!(to_ascii("say &lt;hello&gt; &amp; wave"), "say <hello> & wave");
    }

    #[test]
    fn plain_ascii_is_untouched() {
        assert_eq!(to_ascii("look at sign"), "look at sign");
    }
}
