//! Shared identifiers and the ordered task queue every other crate builds on.

pub mod queue;
pub mod types;

pub use queue::{Backlog, Cycle, QueueWorker, TaskQueue};
pub use types::{ChannelId, UserId};
