//! Configuration schema and file discovery for the bridge binary.

pub mod loader;
pub mod schema;

pub use {
    loader::{discover_and_load, load_config, read_token_file},
    schema::{BridgeConfig, ChatConfig, MooConfig},
};
