use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level config, loaded from `moobridge.{toml,json}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub moo: MooConfig,
    #[serde(default)]
    pub chat: ChatConfig,
}

/// MOO server endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MooConfig {
    /// `host:port` of the MOO server.
    #[serde(default = "default_address")]
    pub address: String,
    /// Login sent on the privileged service connection, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_login: Option<String>,
}

/// Chat platform settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// File holding the bot access token (kept out of the config file itself).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_file: Option<PathBuf>,
    /// Platform hard limit on message size, in characters.
    #[serde(default = "default_char_limit")]
    pub message_char_limit: usize,
}

fn default_address() -> String {
    "localhost:7777".to_string()
}

fn default_char_limit() -> usize {
    4000
}

impl Default for MooConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            service_login: None,
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            token_file: None,
            message_char_limit: default_char_limit(),
        }
    }
}
