//! Protocol extension packages.
//!
//! Packages are a closed set of tagged variants selected from the static
//! registry in [`Mcp::new`](crate::Mcp::new) — no runtime registration. Each
//! variant knows its name and version range and, on activation, which
//! messages to emit.

/// Static facts about a package, as announced during negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackageInfo {
    pub name: &'static str,
    pub min_version: &'static str,
    pub max_version: &'static str,
}

/// A message a package wants sent, name plus scalar key-values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub name: String,
    pub key_vals: Vec<(String, String)>,
}

/// The supported package set.
#[derive(Debug)]
pub enum Package {
    Negotiate(NegotiatePackage),
}

impl Package {
    pub fn info(&self) -> PackageInfo {
        match self {
            Package::Negotiate(_) => PackageInfo {
                name: "mcp-negotiate",
                min_version: "1.0",
                max_version: "2.0",
            },
        }
    }

    pub fn enabled(&self) -> bool {
        match self {
            Package::Negotiate(p) => p.enabled,
        }
    }

    /// Mark the package enabled and return its activation messages.
    /// Idempotent: a second activation emits nothing.
    pub fn activate(&mut self, registry: &[PackageInfo]) -> Vec<OutgoingMessage> {
        match self {
            Package::Negotiate(p) => p.activate(registry),
        }
    }
}

/// The `mcp-negotiate` package: announces every package this side supports,
/// then closes the announcement.
#[derive(Debug, Default)]
pub struct NegotiatePackage {
    enabled: bool,
}

impl NegotiatePackage {
    fn activate(&mut self, registry: &[PackageInfo]) -> Vec<OutgoingMessage> {
        if self.enabled {
            return Vec::new();
        }
        self.enabled = true;

        let mut messages: Vec<OutgoingMessage> = registry
            .iter()
            .map(|info| OutgoingMessage {
                name: "mcp-negotiate-can".to_string(),
                key_vals: vec![
                    ("package".to_string(), info.name.to_string()),
                    ("min-version".to_string(), info.min_version.to_string()),
                    ("max-version".to_string(), info.max_version.to_string()),
                ],
            })
            .collect();
        messages.push(OutgoingMessage {
            name: "mcp-negotiate-end".to_string(),
            key_vals: Vec::new(),
        });
        messages
    }
}
