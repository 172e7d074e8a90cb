//! Wires the chat platform to the MOO client: DMs become MOO sessions,
//! MOO output becomes batched chat messages, group commands ride the
//! service connection.

pub mod normalize;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use {
    moobridge_chat::{ChatApi, ChatEvent, ChatPlatform, OutboundChunker},
    moobridge_common::{ChannelId, UserId},
    moobridge_mcp::Mcp,
    moobridge_moo::MooClient,
    tokio::sync::broadcast::{Receiver, error::RecvError},
    tracing::{debug, info, warn},
};

/// Service-connection lines carrying chat-bound traffic start with this.
const SERVICE_CHAT_PREFIX: &str = "#SLACK#";

pub struct Bridge {
    chat: Arc<dyn ChatPlatform>,
    moo: Arc<MooClient>,
    chunker: Arc<OutboundChunker>,
    /// One protocol codec per user session.
    codecs: Mutex<HashMap<UserId, Mcp>>,
}

impl Bridge {
    pub fn new(
        chat: Arc<dyn ChatPlatform>,
        moo: Arc<MooClient>,
        chunker: Arc<OutboundChunker>,
    ) -> Self {
        Self {
            chat,
            moo,
            chunker,
            codecs: Mutex::new(HashMap::new()),
        }
    }

    /// Run all three pumps until every upstream closes. All streams are
    /// subscribed before the first await, so nothing sent after this call
    /// starts is missed.
    pub async fn run(&self) {
        let chat_rx = self.chat.subscribe();
        let moo_rx = self.moo.subscribe_data();
        let service_rx = self.moo.subscribe_service_data();
        info!("bridge running");
        tokio::join!(
            self.pump_chat_events(chat_rx),
            self.pump_moo_data(moo_rx),
            self.pump_service_data(service_rx),
        );
    }

    async fn pump_chat_events(&self, mut rx: Receiver<ChatEvent>) {
        loop {
            match rx.recv().await {
                Ok(ChatEvent::DirectMessage {
                    user,
                    channel,
                    text,
                }) => self.on_direct_message(user, channel, text).await,
                Ok(ChatEvent::ChannelMessage {
                    user,
                    user_first_name,
                    channel,
                    channel_name,
                    text,
                }) => self.on_channel_message(user, user_first_name, channel, channel_name, text),
                Err(RecvError::Lagged(n)) => {
                    warn!(missed = n, "chat event stream lagged");
                },
                Err(RecvError::Closed) => break,
            }
        }
    }

    async fn on_direct_message(&self, user: UserId, channel: ChannelId, text: String) {
        self.chunker.note_incoming(&user, &channel);
        let text = normalize::to_ascii(&text);
        let text = {
            let mut codecs = self.codecs.lock().unwrap_or_else(|e| e.into_inner());
            let codec = self.codec_for(&mut codecs, &user);
            text.split('\n')
                .map(|line| codec.filter_outgoing(line))
                .collect::<Vec<_>>()
                .join("\n")
        };
        if let Err(error) = self.moo.send(&user, &text).await {
            warn!(%error, user = %user, "dropping direct message");
        }
    }

    /// `!command` in a shared channel goes to the MOO side as one service
    /// line carrying the channel and sender identity.
    fn on_channel_message(
        &self,
        user: UserId,
        first_name: String,
        channel: ChannelId,
        channel_name: String,
        text: String,
    ) {
        let Some(command) = text.strip_prefix('!') else {
            return;
        };
        let line = format!("= {channel} {channel_name} {user} {first_name} {command}");
        if let Err(error) = self.moo.service_send(&line) {
            warn!(%error, "dropping channel command");
        }
    }

    async fn pump_moo_data(&self, mut rx: Receiver<(UserId, String)>) {
        loop {
            match rx.recv().await {
                Ok((user, blob)) => self.on_moo_data(user, blob),
                Err(RecvError::Lagged(n)) => {
                    warn!(missed = n, "moo data stream lagged");
                },
                Err(RecvError::Closed) => break,
            }
        }
    }

    /// Strip protocol lines out of one inbound blob; whatever remains is
    /// user-visible text for the chunker.
    fn on_moo_data(&self, user: UserId, blob: String) {
        let in_band = {
            let mut codecs = self.codecs.lock().unwrap_or_else(|e| e.into_inner());
            let codec = self.codec_for(&mut codecs, &user);
            blob.split('\n')
                .filter_map(|line| codec.filter_incoming(line))
                .collect::<Vec<_>>()
        };
        if !in_band.is_empty() {
            self.chunker.send(&user, &in_band.join("\n"));
        }
    }

    fn codec_for<'a>(&self, codecs: &'a mut HashMap<UserId, Mcp>, user: &UserId) -> &'a mut Mcp {
        codecs.entry(user.clone()).or_insert_with(|| {
            debug!(user = %user, "creating protocol codec");
            let moo = Arc::clone(&self.moo);
            let sink_user = user.clone();
            Mcp::new(move |line: &str| {
                match moo.existing(&sink_user) {
                    Some(conn) => {
                        if let Err(error) = conn.send(line) {
                            warn!(%error, user = %sink_user, "dropping protocol reply");
                        }
                    },
                    None => debug!(user = %sink_user, "protocol reply with no live session"),
                }
            })
        })
    }

    async fn pump_service_data(&self, mut rx: Receiver<String>) {
        loop {
            match rx.recv().await {
                Ok(blob) => self.on_service_data(blob).await,
                Err(RecvError::Lagged(n)) => {
                    warn!(missed = n, "service data stream lagged");
                },
                Err(RecvError::Closed) => break,
            }
        }
    }

    async fn on_service_data(&self, blob: String) {
        for line in blob.split('\n') {
            let Some((channel, text)) = parse_service_line(line) else {
                continue;
            };
            // Service traffic goes to the channel directly, unchunked.
            if let Err(error) = self.chat.send_message(&text, &channel).await {
                warn!(%error, channel = %channel, "service channel send failed");
            }
        }
    }
}

/// `#SLACK# <channel> <text>` → deliver `text` to `channel`.
fn parse_service_line(line: &str) -> Option<(ChannelId, String)> {
    let rest = line.strip_prefix(SERVICE_CHAT_PREFIX)?.strip_prefix(' ')?;
    let mut parts = rest.splitn(2, ' ');
    let channel = parts.next().filter(|c| !c.is_empty())?;
    let text = parts.next().unwrap_or("").to_string();
    Some((ChannelId::from(channel), text))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use {
        anyhow::Result,
        async_trait::async_trait,
        moobridge_chat::{ChatApi, MessageHandle},
        moobridge_moo::UnresolvedPlayers,
        tokio::{
            io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
            net::TcpListener,
            sync::broadcast,
        },
    };

    use super::*;

    struct FakePlatform {
        events: broadcast::Sender<ChatEvent>,
        sent: Mutex<Vec<(String, String)>>,
    }

    impl FakePlatform {
        fn new() -> Arc<Self> {
            let (events, _) = broadcast::channel(16);
            Arc::new(Self {
                events,
                sent: Mutex::new(Vec::new()),
            })
        }

        fn sent(&self) -> Vec<(String, String)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChatApi for FakePlatform {
        async fn send_message(&self, text: &str, channel: &ChannelId) -> Result<MessageHandle> {
            self.sent
                .lock()
                .unwrap()
                .push((channel.as_str().to_string(), text.to_string()));
            Ok(MessageHandle {
                id: "ts-1".to_string(),
            })
        }

        async fn update_message(
            &self,
            message: &MessageHandle,
            channel: &ChannelId,
            text: &str,
        ) -> Result<MessageHandle> {
            self.sent
                .lock()
                .unwrap()
                .push((channel.as_str().to_string(), text.to_string()));
            Ok(message.clone())
        }
    }

    impl ChatPlatform for FakePlatform {
        fn subscribe(&self) -> Receiver<ChatEvent> {
            self.events.subscribe()
        }
    }

    struct Harness {
        platform: Arc<FakePlatform>,
        listener: TcpListener,
    }

    async fn harness() -> Harness {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
        let platform = FakePlatform::new();

        let moo = Arc::new(
            MooClient::new(&addr, Some("service".to_string()), Arc::new(UnresolvedPlayers))
                .unwrap(),
        );
        let chunker = Arc::new(OutboundChunker::new(
            Arc::clone(&platform) as Arc<dyn ChatApi>,
            4000,
        ));
        let bridge = Bridge::new(
            Arc::clone(&platform) as Arc<dyn ChatPlatform>,
            moo,
            chunker,
        );
        tokio::spawn(async move { bridge.run().await });
        // Give the pumps a beat to subscribe before events start flowing.
        tokio::time::sleep(Duration::from_millis(20)).await;

        Harness { platform, listener }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(80)).await;
    }

    fn dm(platform: &FakePlatform, user: &str, text: &str) {
        let _ = platform.events.send(ChatEvent::DirectMessage {
            user: UserId::from(user),
            channel: ChannelId::from("D42"),
            text: text.to_string(),
        });
    }

    #[test]
    fn service_line_parsing() {
        assert_eq!(
            parse_service_line("#SLACK# C123 hello there"),
            Some((ChannelId::from("C123"), "hello there".to_string()))
        );
        assert_eq!(
            parse_service_line("#SLACK# C123"),
            Some((ChannelId::from("C123"), String::new()))
        );
        assert_eq!(parse_service_line("not for slack"), None);
        assert_eq!(parse_service_line("#SLACK#"), None);
    }

    #[tokio::test]
    async fn direct_message_reaches_the_moo_normalized() {
        let h = harness().await;
        dm(&h.platform, "alice", "say \u{201c}hi&amp;bye\u{201d}");

        let (sock, _) = h.listener.accept().await.unwrap();
        let mut reader = BufReader::new(sock);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "say \"hi&bye\"\n");
    }

    #[tokio::test]
    async fn moo_output_comes_back_as_a_chat_message() {
        let h = harness().await;
        dm(&h.platform, "alice", "look");

        let (sock, _) = h.listener.accept().await.unwrap();
        let mut reader = BufReader::new(sock);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();

        reader
            .into_inner()
            .write_all(b"A small white house.\n")
            .await
            .unwrap();
        settle().await;

        assert_eq!(
            h.platform.sent(),
            vec![(
                "D42".to_string(),
                "```A small white house.```".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn protocol_lines_are_stripped_and_answered() {
        let h = harness().await;
        dm(&h.platform, "alice", "look");

        let (sock, _) = h.listener.accept().await.unwrap();
        let mut reader = BufReader::new(sock);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "look\n");

        // The server starts an MCP handshake alongside real output.
        reader
            .get_mut()
            .write_all(b"#$#mcp version: 2.1 to: 2.1\nThe sign reads welcome.\n")
            .await
            .unwrap();

        // The handshake reply comes back out-of-band on the same session.
        line.clear();
        reader.read_line(&mut line).await.unwrap();
        assert!(line.starts_with("#$#mcp "), "got: {line}");

        settle().await;
        // Only the in-band line reached the platform.
        assert_eq!(
            h.platform.sent(),
            vec![(
                "D42".to_string(),
                "```The sign reads welcome.```".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn channel_command_rides_the_service_connection() {
        let h = harness().await;
        let _ = h.platform.events.send(ChatEvent::ChannelMessage {
            user: UserId::from("alice"),
            user_first_name: "Alice".to_string(),
            channel: ChannelId::from("C9"),
            channel_name: "general".to_string(),
            text: "!who".to_string(),
        });

        let (sock, _) = h.listener.accept().await.unwrap();
        let mut reader = BufReader::new(sock);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "connect service\n");
        line.clear();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "= C9 general alice Alice who\n");
    }

    #[tokio::test]
    async fn non_command_channel_chatter_is_ignored() {
        let h = harness().await;
        let _ = h.platform.events.send(ChatEvent::ChannelMessage {
            user: UserId::from("alice"),
            user_first_name: "Alice".to_string(),
            channel: ChannelId::from("C9"),
            channel_name: "general".to_string(),
            text: "just chatting".to_string(),
        });
        settle().await;

        // No service connection was ever opened.
        let accepted = tokio::time::timeout(Duration::from_millis(100), h.listener.accept()).await;
        assert!(accepted.is_err());
    }

    #[tokio::test]
    async fn service_output_goes_straight_to_the_channel() {
        let h = harness().await;
        let _ = h
            .platform
            .events
            .send(ChatEvent::ChannelMessage {
                user: UserId::from("alice"),
                user_first_name: "Alice".to_string(),
                channel: ChannelId::from("C9"),
                channel_name: "general".to_string(),
                text: "!who".to_string(),
            });

        let (sock, _) = h.listener.accept().await.unwrap();
        let mut reader = BufReader::new(sock);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        line.clear();
        reader.read_line(&mut line).await.unwrap();

        reader
            .into_inner()
            .write_all(b"#SLACK# C9 Wizard is awake.\nignored noise\n")
            .await
            .unwrap();
        settle().await;

        assert_eq!(
            h.platform.sent(),
            vec![("C9".to_string(), "Wizard is awake.".to_string())]
        );
    }

    #[tokio::test]
    async fn outgoing_lines_with_reserved_prefixes_are_escaped() {
        let h = harness().await;
        dm(&h.platform, "alice", "#$#not a protocol line");

        let (sock, _) = h.listener.accept().await.unwrap();
        let mut reader = BufReader::new(sock);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "#$\"#$#not a protocol line\n");
    }
}
