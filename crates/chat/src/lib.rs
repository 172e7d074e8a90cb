//! Chat platform interface and the per-user outbound message chunker.

pub mod api;
pub mod chunker;

pub use {
    api::{ChatApi, ChatEvent, ChatPlatform, MessageHandle},
    chunker::OutboundChunker,
};
