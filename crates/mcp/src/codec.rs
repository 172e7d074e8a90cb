//! The codec proper: line filters, handshake, multiline reassembly, and
//! outgoing message encoding.

use std::collections::HashMap;

use {
    rand::Rng,
    tracing::{debug, warn},
};

use crate::{
    DATA_TAG_KEY, OUT_OF_BAND_PREFIX, QUOTE_PREFIX, SUPPORTED_VERSION,
    error::McpError,
    packages::{NegotiatePackage, Package},
    parse::{Version, extract_tokens, needs_quoting, parse_key_vals, parse_keyword, quote},
    types::{KeyVals, McpMessage, Value},
};

/// Where protocol replies go: one raw line onto the connection's outbound
/// queue. Enqueueing is synchronous; the write itself is not.
pub trait LineSink: Send + Sync {
    fn send_line(&self, line: &str);
}

impl<F: Fn(&str) + Send + Sync> LineSink for F {
    fn send_line(&self, line: &str) {
        self(line)
    }
}

type MessageHandler = Box<dyn Fn(McpMessage) + Send + Sync>;

struct PendingMessage {
    name: String,
    key_vals: KeyVals,
}

/// Per-connection protocol state.
///
/// The authentication key is regenerated on every handshake; the pending
/// table holds multiline messages between their start and end lines.
pub struct Mcp {
    sink: Box<dyn LineSink>,
    handler: Option<MessageHandler>,
    auth_key: Option<String>,
    pending: HashMap<String, PendingMessage>,
    packages: Vec<Package>,
}

impl Mcp {
    pub fn new(sink: impl LineSink + 'static) -> Self {
        Self {
            sink: Box::new(sink),
            handler: None,
            auth_key: None,
            pending: HashMap::new(),
            packages: vec![Package::Negotiate(NegotiatePackage::default())],
        }
    }

    /// Install a handler for fully received protocol messages. Without one,
    /// dispatched messages are logged and dropped.
    pub fn with_handler(mut self, handler: impl Fn(McpMessage) + Send + Sync + 'static) -> Self {
        self.handler = Some(Box::new(handler));
        self
    }

    /// Current session key, once a handshake has completed.
    pub fn auth_key(&self) -> Option<&str> {
        self.auth_key.as_deref()
    }

    /// Filter one inbound line. Out-of-band lines are consumed (`None`);
    /// quote-escaped lines are unwrapped; everything else passes through.
    ///
    /// A malformed out-of-band line is logged and discarded; it never
    /// surfaces in-band.
    pub fn filter_incoming(&mut self, line: &str) -> Option<String> {
        if let Some(rest) = line.strip_prefix(OUT_OF_BAND_PREFIX) {
            if let Err(error) = self.handle_out_of_band(rest) {
                warn!(%error, line = rest, "discarding bad out-of-band line");
            }
            return None;
        }
        if let Some(rest) = line.strip_prefix(QUOTE_PREFIX) {
            return Some(rest.to_string());
        }
        Some(line.to_string())
    }

    /// Escape an outgoing in-band line that collides with a reserved marker.
    pub fn filter_outgoing(&self, line: &str) -> String {
        if line.starts_with(OUT_OF_BAND_PREFIX) || line.starts_with(QUOTE_PREFIX) {
            format!("{QUOTE_PREFIX}{line}")
        } else {
            line.to_string()
        }
    }

    fn handle_out_of_band(&mut self, line: &str) -> Result<(), McpError> {
        match line.split(' ').next().unwrap_or("") {
            "mcp" => self.startup(line),
            "*" => self.message_continue(line),
            ":" => self.message_end(line),
            _ => self.message_start(line),
        }
    }

    /// `mcp version: <min> to: <max>` — version handshake. On success this
    /// side replies with a fresh authentication key and activates packages.
    fn startup(&mut self, line: &str) -> Result<(), McpError> {
        let (_leading, rest) = extract_tokens(line, 1);
        let key_vals = parse_key_vals(&rest)?;
        let version = handshake_version(&key_vals, "version")?;
        let to = handshake_version(&key_vals, "to")?;

        if to < SUPPORTED_VERSION {
            return Err(McpError::VersionTooLow);
        }
        if SUPPORTED_VERSION < version {
            return Err(McpError::VersionTooHigh);
        }

        let key = generate_key(4);
        self.auth_key = Some(key.clone());

        let supported = SUPPORTED_VERSION.to_string();
        self.send_message(
            "mcp",
            &[
                ("authentication-key", Value::Scalar(key)),
                ("version", Value::Scalar(supported.clone())),
                ("to", Value::Scalar(supported)),
            ],
        )?;
        self.activate_packages()
    }

    fn activate_packages(&mut self) -> Result<(), McpError> {
        let registry: Vec<_> = self.packages.iter().map(Package::info).collect();
        let mut outgoing = Vec::new();
        for package in &mut self.packages {
            outgoing.extend(package.activate(&registry));
        }
        for message in outgoing {
            let key_vals: Vec<(&str, Value)> = message
                .key_vals
                .iter()
                .map(|(k, v)| (k.as_str(), Value::Scalar(v.clone())))
                .collect();
            self.send_message(&message.name, &key_vals)?;
        }
        Ok(())
    }

    /// `<name> <auth-key> <key-vals>` — either dispatched immediately, or
    /// parked in the pending table when any value is multiline.
    fn message_start(&mut self, line: &str) -> Result<(), McpError> {
        let (leading, rest) = extract_tokens(line, 2);
        let name = leading
            .first()
            .map(|t| t.to_lowercase())
            .unwrap_or_default();
        let offered_key = leading.get(1).map(String::as_str).unwrap_or("");
        if self.auth_key.as_deref() != Some(offered_key) {
            return Err(McpError::BadAuthKey(offered_key.to_string()));
        }

        let key_vals = parse_key_vals(&rest)?;
        let has_multiline = key_vals.values().any(Value::is_multiline);
        if has_multiline {
            let data_tag = key_vals
                .get(DATA_TAG_KEY)
                .and_then(Value::as_scalar)
                .filter(|tag| !tag.is_empty())
                .ok_or(McpError::MissingDataTag)?
                .to_string();
            if self.pending.contains_key(&data_tag) {
                return Err(McpError::DataTagInUse(data_tag));
            }
            self.pending
                .insert(data_tag, PendingMessage { name, key_vals });
            Ok(())
        } else {
            self.dispatch(name, key_vals);
            Ok(())
        }
    }

    /// `* <data-tag> <keyword>: <text>` — append one line, verbatim, to a
    /// pending multiline value. No escape processing on the remainder.
    fn message_continue(&mut self, line: &str) -> Result<(), McpError> {
        let (leading, rest) = extract_tokens(line, 3);
        let data_tag = leading.get(1).map(String::as_str).unwrap_or("");
        let message = self
            .pending
            .get_mut(data_tag)
            .ok_or_else(|| McpError::UnknownDataTag(data_tag.to_string()))?;

        let keyword_token = leading.get(2).map(String::as_str).unwrap_or("");
        let (keyword, _) = parse_keyword(keyword_token).ok_or(McpError::MissingKeyword)?;
        match message.key_vals.get_mut(&keyword) {
            None => Err(McpError::UnknownKeyword(keyword)),
            Some(Value::Scalar(_)) => Err(McpError::NonMultilineKeyword(keyword)),
            Some(Value::Multiline(lines)) => {
                lines.push(rest);
                Ok(())
            },
        }
    }

    /// `: <data-tag>` — close a pending message and dispatch it. Trailing
    /// tokens are ignored.
    fn message_end(&mut self, line: &str) -> Result<(), McpError> {
        let (leading, _rest) = extract_tokens(line, 2);
        let data_tag = leading.get(1).map(String::as_str).unwrap_or("");
        let message = self
            .pending
            .remove(data_tag)
            .ok_or_else(|| McpError::UnknownDataTag(data_tag.to_string()))?;
        self.dispatch(message.name, message.key_vals);
        Ok(())
    }

    fn dispatch(&self, name: String, key_vals: KeyVals) {
        let message = McpMessage { name, key_vals };
        match &self.handler {
            Some(handler) => handler(message),
            None => debug!(name = %message.name, "mcp message received, no handler"),
        }
    }

    /// Encode and send one protocol message. Requires a completed handshake.
    /// Multiline values are unsupported outbound and fail loudly.
    pub fn send_message(&self, name: &str, key_vals: &[(&str, Value)]) -> Result<(), McpError> {
        let auth_key = self.auth_key.as_deref().ok_or(McpError::HandshakeNotComplete)?;

        let mut rendered = Vec::with_capacity(key_vals.len());
        for (key, value) in key_vals {
            let Value::Scalar(value) = value else {
                return Err(McpError::MultilineUnsupported);
            };
            if needs_quoting(value) {
                rendered.push(format!("{key}: {}", quote(value)));
            } else {
                rendered.push(format!("{key}: {value}"));
            }
        }

        let line = format!("{OUT_OF_BAND_PREFIX}{name} {auth_key} {}", rendered.join(" "));
        self.sink.send_line(&line);
        Ok(())
    }
}

fn handshake_version(key_vals: &KeyVals, key: &str) -> Result<Version, McpError> {
    let value = key_vals
        .get(key)
        .and_then(Value::as_scalar)
        .filter(|s| !s.is_empty())
        .ok_or(McpError::MissingVersion)?;
    Version::parse(value)
}

fn generate_key(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::rng().fill(&mut buf[..]);
    buf.iter().map(|b| format!("{b:02x}")).collect()
}
