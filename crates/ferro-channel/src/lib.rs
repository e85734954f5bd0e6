//! Push-update channel clients for the task backend: a global feed that
//! reconnects forever, and per-task channels bounded by a poll budget.

use ferro_core::wire::TaskUpdate;
use ferro_core::TaskId;
use serde_json::Value;
use std::time::Duration;

mod feed;
mod manager;

pub use feed::UpdateFeed;
pub use manager::ChannelManager;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_POLLS: u32 = 10;
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Keepalive interval on a per-task channel.
    pub poll_interval: Duration,
    /// Polls sent before a per-task channel retires itself. Bounds each
    /// channel's lifetime to `poll_interval * max_polls` wall clock.
    pub max_polls: u32,
    /// Fixed delay before the global feed reconnects. No backoff growth.
    pub reconnect_delay: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_polls: DEFAULT_MAX_POLLS,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

/// Lifecycle of one per-task channel instance. `Closed` is terminal; a
/// retry means constructing a new instance via `open_channel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The bounded poll loop ran out of budget. A soft timeout, not an
    /// error.
    PollBudgetExhausted,
    /// The backend closed the connection.
    Remote,
    /// Connect or I/O failure.
    Transport,
}

/// Events delivered to the single consumer queue.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// Parsed status/progress update from the global feed.
    Update(TaskUpdate),
    /// Verbatim JSON payload from a per-task channel.
    TaskFrame { task_id: TaskId, payload: Value },
    /// A per-task channel retired itself. Not emitted for owner-initiated
    /// closes.
    ChannelClosed { task_id: TaskId, reason: CloseReason },
}
