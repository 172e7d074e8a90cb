//! Console stand-in for the real chat platform, for local smoke runs:
//! stdin lines become direct messages, outbound messages print to stdout.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};

use {
    anyhow::Result,
    async_trait::async_trait,
    moobridge_chat::{ChatApi, ChatEvent, ChatPlatform, MessageHandle},
    moobridge_common::{ChannelId, UserId},
    tokio::{
        io::{AsyncBufReadExt, BufReader},
        sync::broadcast,
    },
    tracing::debug,
};

const CONSOLE_USER: &str = "operator";
const CONSOLE_CHANNEL: &str = "console";

pub struct ConsolePlatform {
    events: broadcast::Sender<ChatEvent>,
    next_id: AtomicU64,
    stdout: Mutex<()>,
}

impl ConsolePlatform {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            events,
            next_id: AtomicU64::new(1),
            stdout: Mutex::new(()),
        })
    }

    /// Feed stdin into the event stream until EOF. Lines starting with `!`
    /// are treated as channel commands, everything else as a DM.
    pub async fn pump_stdin(&self) {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let event = if line.starts_with('!') {
                ChatEvent::ChannelMessage {
                    user: UserId::from(CONSOLE_USER),
                    user_first_name: "Operator".to_string(),
                    channel: ChannelId::from(CONSOLE_CHANNEL),
                    channel_name: CONSOLE_CHANNEL.to_string(),
                    text: line,
                }
            } else {
                ChatEvent::DirectMessage {
                    user: UserId::from(CONSOLE_USER),
                    channel: ChannelId::from(CONSOLE_CHANNEL),
                    text: line,
                }
            };
            if self.events.send(event).is_err() {
                debug!("no bridge subscribed, dropping console input");
            }
        }
    }

    fn print(&self, label: &str, channel: &ChannelId, text: &str) {
        let _guard = self.stdout.lock().unwrap_or_else(|e| e.into_inner());
        println!("[{channel}] {label}{text}");
    }
}

#[async_trait]
impl ChatApi for ConsolePlatform {
    async fn send_message(&self, text: &str, channel: &ChannelId) -> Result<MessageHandle> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.print("", channel, text);
        Ok(MessageHandle { id: id.to_string() })
    }

    async fn update_message(
        &self,
        message: &MessageHandle,
        channel: &ChannelId,
        text: &str,
    ) -> Result<MessageHandle> {
        self.print(&format!("(edit #{}) ", message.id), channel, text);
        Ok(message.clone())
    }
}

impl ChatPlatform for ConsolePlatform {
    fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }
}
