//! Batches a user's outbound lines into as few platform messages as the
//! size ceiling allows, editing the previous message in place while that is
//! still permitted.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use {
    anyhow::Result,
    async_trait::async_trait,
    moobridge_common::{Backlog, ChannelId, Cycle, QueueWorker, TaskQueue, UserId},
    thiserror::Error,
    tracing::debug,
};

use crate::api::{ChatApi, MessageHandle};

/// Messages are wrapped in fixed-width markup before sending.
const MESSAGE_PREFIX: &str = "```";
const MESSAGE_SUFFIX: &str = "```";

#[derive(Debug, Error)]
enum ChunkerError {
    #[error("no delivery channel recorded for user")]
    NoChannel,
    #[error("reuse requested without a previous message")]
    MissingPrevious,
}

/// Per-user outbound batching over a shared platform client.
///
/// Each user gets a lazily created processor: a task queue of pending line
/// fragments plus the handle of the last message sent. A delivery failure
/// drops that user's pending fragments and previous-message state wholesale.
pub struct OutboundChunker {
    api: Arc<dyn ChatApi>,
    ceiling: usize,
    users: Mutex<HashMap<UserId, Processor>>,
}

struct Processor {
    queue: TaskQueue<ChunkWorker>,
    shared: Arc<ProcessorShared>,
}

struct ProcessorShared {
    channel: Mutex<Option<ChannelId>>,
    start_fresh: AtomicBool,
}

impl OutboundChunker {
    /// `char_limit` is the platform's hard message size. The working ceiling
    /// leaves markup expansion headroom at floor(limit × 0.85).
    pub fn new(api: Arc<dyn ChatApi>, char_limit: usize) -> Self {
        Self {
            api,
            ceiling: char_limit * 85 / 100,
            users: Mutex::new(HashMap::new()),
        }
    }

    /// Record an inbound command from `user`: replies go to `channel`, and
    /// the next delivery starts a new platform message instead of editing
    /// the previous one.
    pub fn note_incoming(&self, user: &UserId, channel: &ChannelId) {
        let shared = self.processor(user).shared;
        *shared.channel.lock().unwrap_or_else(|e| e.into_inner()) = Some(channel.clone());
        shared.start_fresh.store(true, Ordering::SeqCst);
    }

    /// Queue `text` for delivery to `user`, one fragment per line.
    pub fn send(&self, user: &UserId, text: &str) {
        let processor = self.processor(user);
        processor
            .queue
            .enqueue(text.split('\n').map(str::to_string));
    }

    fn processor(&self, user: &UserId) -> Processor {
        let mut users = self.users.lock().unwrap_or_else(|e| e.into_inner());
        users
            .entry(user.clone())
            .or_insert_with(|| {
                debug!(user = %user, "creating outbound processor");
                let shared = Arc::new(ProcessorShared {
                    channel: Mutex::new(None),
                    start_fresh: AtomicBool::new(false),
                });
                Processor {
                    queue: TaskQueue::new(ChunkWorker {
                        api: Arc::clone(&self.api),
                        shared: Arc::clone(&shared),
                        ceiling: self.ceiling,
                    }),
                    shared,
                }
            })
            .clone()
    }
}

impl Clone for Processor {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

/// One delivery per cycle: `extract` gathers fragments under the ceiling,
/// `execute` sends a new message or edits the previous one.
struct ChunkWorker {
    api: Arc<dyn ChatApi>,
    shared: Arc<ProcessorShared>,
    ceiling: usize,
}

struct Delivery {
    text: String,
    reuse: bool,
}

#[async_trait]
impl QueueWorker for ChunkWorker {
    type Item = String;
    type Payload = Delivery;
    type Output = MessageHandle;

    async fn extract(
        &self,
        backlog: &mut Backlog<String>,
        previous: Option<&Cycle<Delivery, MessageHandle>>,
    ) -> Result<Delivery> {
        let mut reuse = !self.shared.start_fresh.load(Ordering::SeqCst) && previous.is_some();
        if let (Some(prev), Some(next)) = (previous, backlog.peek()) {
            if !self.fits(&prev.payload.text, next) {
                reuse = false;
            }
        }

        let mut text = if reuse {
            previous.map(|c| c.payload.text.clone()).unwrap_or_default()
        } else {
            String::new()
        };

        while let Some(next) = backlog.peek() {
            if !self.fits(&text, next) {
                break;
            }
            if !text.is_empty() {
                text.push('\n');
            }
            // peek() just succeeded, pop() cannot fail
            if let Some(fragment) = backlog.pop() {
                text.push_str(&fragment);
            }
        }

        // A fragment too large for an empty message still goes out alone:
        // dropping it or spinning on it are both worse than one oversized
        // message the platform may reject on its own terms.
        if text.is_empty() {
            if let Some(fragment) = backlog.pop() {
                debug!(len = fragment.len(), "oversized fragment sent alone");
                text = fragment;
            }
        }

        Ok(Delivery { text, reuse })
    }

    async fn execute(
        &self,
        payload: &Delivery,
        previous: Option<&Cycle<Delivery, MessageHandle>>,
    ) -> Result<MessageHandle> {
        let channel = self
            .shared
            .channel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(ChunkerError::NoChannel)?;
        self.shared.start_fresh.store(false, Ordering::SeqCst);

        let decorated = decorate(&payload.text);
        let handle = if payload.reuse {
            let prev = previous.ok_or(ChunkerError::MissingPrevious)?;
            self.api
                .update_message(&prev.result, &channel, &decorated)
                .await?
        } else {
            self.api.send_message(&decorated, &channel).await?
        };
        Ok(handle)
    }
}

impl ChunkWorker {
    /// Would `text` plus one more fragment, decorated, still fit?
    fn fits(&self, text: &str, next: &str) -> bool {
        decorated_size(&[text, next]) <= self.ceiling
    }
}

/// Joined size of `parts` once newline-separated and wrapped in the fixed
/// markup (each joint costs one byte, as do the joints to the markup).
fn decorated_size(parts: &[&str]) -> usize {
    let content: usize = parts.iter().map(|p| p.len()).sum();
    content + MESSAGE_PREFIX.len() + MESSAGE_SUFFIX.len() + parts.len() + 1
}

fn decorate(text: &str) -> String {
    format!("{MESSAGE_PREFIX}{text}{MESSAGE_SUFFIX}")
}
