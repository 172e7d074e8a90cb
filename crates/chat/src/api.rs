//! The chat platform seam. The real platform client lives outside this
//! core; everything here talks to it through these traits.

use {
    anyhow::Result,
    async_trait::async_trait,
    moobridge_common::{ChannelId, UserId},
    tokio::sync::broadcast,
};

/// Handle to a delivered platform message, usable for later edits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHandle {
    pub id: String,
}

/// Outbound platform calls. Both are asynchronous and fallible; failures
/// drop the affected user's pending output, they are never retried.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn send_message(&self, text: &str, channel: &ChannelId) -> Result<MessageHandle>;

    async fn update_message(
        &self,
        message: &MessageHandle,
        channel: &ChannelId,
        text: &str,
    ) -> Result<MessageHandle>;
}

/// Inbound platform traffic.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    /// A direct message to the bot.
    DirectMessage {
        user: UserId,
        channel: ChannelId,
        text: String,
    },
    /// A message in a group or shared channel.
    ChannelMessage {
        user: UserId,
        user_first_name: String,
        channel: ChannelId,
        channel_name: String,
        text: String,
    },
}

/// A full platform adapter: outbound calls plus an inbound event stream.
pub trait ChatPlatform: ChatApi {
    fn subscribe(&self) -> broadcast::Receiver<ChatEvent>;
}
