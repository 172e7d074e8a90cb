//! Tokenizer and key-value grammar for out-of-band lines.
//!
//! Tokens are single-space-delimited. Quoted values may span several tokens;
//! doubled spaces inside quotes survive because empty tokens still contribute
//! a separator when rejoined.

use crate::{
    error::McpError,
    types::{KeyVals, Value},
};

/// Protocol version, compared numerically as major then minor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    pub fn parse(s: &str) -> Result<Self, McpError> {
        let (major, minor) = s
            .split_once('.')
            .ok_or_else(|| McpError::BadVersion(s.to_string()))?;
        let major = major
            .parse()
            .map_err(|_| McpError::BadVersion(s.to_string()))?;
        let minor = minor
            .parse()
            .map_err(|_| McpError::BadVersion(s.to_string()))?;
        Ok(Self { major, minor })
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Split off up to `count` leading non-empty tokens; the rest of the line is
/// returned verbatim (leading/doubled spaces in the remainder preserved).
pub(crate) fn extract_tokens(line: &str, count: usize) -> (Vec<String>, String) {
    let tokens: Vec<&str> = line.split(' ').collect();
    let mut leading = Vec::with_capacity(count);
    for (i, token) in tokens.iter().enumerate() {
        if token.is_empty() {
            continue;
        }
        leading.push((*token).to_string());
        if leading.len() >= count {
            return (leading, tokens[i + 1..].join(" "));
        }
    }
    (leading, String::new())
}

/// A keyword token: `name:` or `name*:` (the `*` marks a multiline value).
/// Keyword chars are `[A-Za-z_][A-Za-z_0-9-]+`; returned case-folded.
pub(crate) fn parse_keyword(token: &str) -> Option<(String, bool)> {
    let body = token.strip_suffix(':')?;
    let (body, multiline) = match body.strip_suffix('*') {
        Some(b) => (b, true),
        None => (body, false),
    };
    let mut chars = body.chars();
    let first = chars.next()?;
    if !(first.is_ascii_alphabetic() || first == '_') {
        return None;
    }
    let mut rest = 0usize;
    for c in chars {
        if !(c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return None;
        }
        rest += 1;
    }
    if rest == 0 {
        return None;
    }
    Some((body.to_ascii_lowercase(), multiline))
}

/// Parse a line remainder as keyword/value pairs.
///
/// An inline value for a keyword marked multiline is validated but discarded;
/// the keyword starts as an empty sequence either way.
pub fn parse_key_vals(input: &str) -> Result<KeyVals, McpError> {
    let mut key_vals = KeyVals::new();
    let mut current: Option<String> = None;
    let mut quoted = false;

    for token in input.split(' ') {
        if token.is_empty() && !quoted {
            continue;
        }

        let Some(keyword) = current.clone() else {
            let (keyword, multiline) =
                parse_keyword(token).ok_or_else(|| McpError::InvalidKeyword(token.to_string()))?;
            if key_vals.contains_key(&keyword) {
                return Err(McpError::DuplicateKeyword(keyword));
            }
            current = Some(keyword.clone());
            let initial = if multiline {
                Value::Multiline(Vec::new())
            } else {
                Value::Scalar(String::new())
            };
            key_vals.insert(keyword, initial);
            continue;
        };

        // Value token.
        let mut parsed = token;
        let mut opening = false;
        let mut closing = false;
        if !quoted && parsed.starts_with('"') {
            opening = true;
            quoted = true;
            parsed = &parsed[1..];
        }
        let piece = if quoted {
            closing = strip_escape_pairs(parsed).ends_with('"');
            if closing {
                parsed = trim_last_char(parsed);
            }
            unquote(parsed)?
        } else {
            if parsed.contains(['"', '\\', ':', '*']) {
                return Err(McpError::InvalidUnquoted(token.to_string()));
            }
            parsed.to_string()
        };

        if let Some(Value::Scalar(val)) = key_vals.get_mut(&keyword) {
            if opening || (!quoted && val.is_empty()) {
                val.push_str(&piece);
            } else {
                val.push(' ');
                val.push_str(&piece);
            }
        }
        if closing || !quoted {
            quoted = false;
            current = None;
        }
    }

    if quoted {
        return Err(McpError::UnclosedQuote);
    }
    if let Some(keyword) = current {
        return Err(McpError::MissingValue(keyword));
    }
    Ok(key_vals)
}

/// Inside a quoted value only `\"` and `\\` are legal escapes; any other
/// bare `"` or `\` is a protocol violation.
fn unquote(token: &str) -> Result<String, McpError> {
    if strip_escape_pairs(token).contains(['"', '\\']) {
        return Err(McpError::UnescapedChar);
    }
    let mut out = String::with_capacity(token.len());
    let mut chars = token.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next @ ('"' | '\\')) = chars.clone().next() {
                chars.next();
                out.push(next);
                continue;
            }
        }
        out.push(c);
    }
    Ok(out)
}

/// Drop every `\"` and `\\` pair, left to right; what remains is the token's
/// unescaped skeleton (used to spot rogue quotes and backslashes).
fn strip_escape_pairs(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some('"' | '\\') = chars.clone().next() {
                chars.next();
                continue;
            }
        }
        out.push(c);
    }
    out
}

fn trim_last_char(s: &str) -> &str {
    let mut chars = s.chars();
    chars.next_back();
    chars.as_str()
}

/// `true` when a value must be rendered quoted on the wire.
pub(crate) fn needs_quoting(value: &str) -> bool {
    value.is_empty() || value.contains([' ', '"', '\\', ':', '*'])
}

/// Render a value as a quoted literal, escaping `"` and `\`.
pub(crate) fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}
