use crate::{ChannelConfig, ChannelEvent, ChannelState, CloseReason};
use ferro_core::wire::{self, ClientFrame};
use ferro_core::TaskId;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};
use url::Url;

struct ChannelHandle {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
    state: Arc<Mutex<ChannelState>>,
}

/// Multiplexes one bounded-poll channel per task. Exactly one connection
/// may exist per task id; `open_channel` enforces close-before-open.
pub struct ChannelManager {
    base_url: Url,
    config: ChannelConfig,
    events: mpsc::Sender<ChannelEvent>,
    channels: HashMap<TaskId, ChannelHandle>,
}

impl ChannelManager {
    pub fn new(base_url: Url, config: ChannelConfig, events: mpsc::Sender<ChannelEvent>) -> Self {
        ChannelManager {
            base_url,
            config,
            events,
            channels: HashMap::new(),
        }
    }

    /// Open a channel scoped to the task's endpoint, tearing down any
    /// existing channel for the same id first.
    pub fn open_channel(&mut self, task_id: &TaskId) {
        self.close_channel(task_id);
        let url = match task_endpoint(&self.base_url, task_id) {
            Ok(url) => url,
            Err(err) => {
                warn!(task_id = %task_id, "bad task endpoint: {err}");
                return;
            }
        };
        let state = Arc::new(Mutex::new(ChannelState::Connecting));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(channel_loop(
            url,
            task_id.clone(),
            self.config.clone(),
            self.events.clone(),
            state.clone(),
            shutdown_rx,
        ));
        self.channels.insert(
            task_id.clone(),
            ChannelHandle {
                shutdown: shutdown_tx,
                handle,
                state,
            },
        );
    }

    /// Tear down and forget the task's channel. Safe when none exists.
    pub fn close_channel(&mut self, task_id: &TaskId) {
        if let Some(channel) = self.channels.remove(task_id) {
            let _ = channel.shutdown.send(true);
        }
    }

    /// Tear down every tracked channel and wait for their loops to end.
    pub async fn close_all(&mut self) {
        for (_, channel) in self.channels.drain() {
            let _ = channel.shutdown.send(true);
            let _ = channel.handle.await;
        }
    }

    /// Lifecycle state of the task's current channel instance, if one is
    /// tracked.
    pub fn state(&self, task_id: &TaskId) -> Option<ChannelState> {
        self.channels
            .get(task_id)
            .map(|channel| channel.state.lock().map(|s| *s).unwrap_or(ChannelState::Closed))
    }

    /// Drop bookkeeping for a channel that already reported itself
    /// closed.
    pub fn forget_closed(&mut self, task_id: &TaskId) {
        if self.state(task_id) == Some(ChannelState::Closed) {
            self.channels.remove(task_id);
        }
    }
}

fn task_endpoint(base: &Url, task_id: &TaskId) -> Result<Url, url::ParseError> {
    Url::parse(&format!(
        "{}/ws/task/{}",
        base.as_str().trim_end_matches('/'),
        task_id
    ))
}

fn set_state(state: &Arc<Mutex<ChannelState>>, value: ChannelState) {
    if let Ok(mut slot) = state.lock() {
        *slot = value;
    }
}

async fn channel_loop(
    url: Url,
    task_id: TaskId,
    config: ChannelConfig,
    events: mpsc::Sender<ChannelEvent>,
    state: Arc<Mutex<ChannelState>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let connect = tokio::select! {
        _ = shutdown.changed() => {
            set_state(&state, ChannelState::Closed);
            return;
        }
        result = connect_async(url.as_str()) => result,
    };
    let (mut ws, _) = match connect {
        Ok(value) => value,
        Err(err) => {
            warn!(task_id = %task_id, "task channel connect error: {err}");
            set_state(&state, ChannelState::Closed);
            let _ = events
                .send(ChannelEvent::ChannelClosed {
                    task_id,
                    reason: CloseReason::Transport,
                })
                .await;
            return;
        }
    };
    set_state(&state, ChannelState::Open);
    debug!(task_id = %task_id, "task channel connected");

    // First poll goes out immediately, then one per interval.
    let mut ticker = tokio::time::interval(config.poll_interval);
    let mut sent = 0u32;
    let reason = loop {
        tokio::select! {
            _ = shutdown.changed() => break None,
            _ = ticker.tick() => {
                if sent >= config.max_polls {
                    info!(task_id = %task_id, polls = sent, "poll budget exhausted");
                    break Some(CloseReason::PollBudgetExhausted);
                }
                let frame = ClientFrame::Poll { task_id: task_id.clone() }.to_json();
                if ws.send(WsMessage::Text(frame)).await.is_err() {
                    break Some(CloseReason::Transport);
                }
                sent += 1;
            }
            msg = ws.next() => match msg {
                Some(Ok(WsMessage::Text(text))) => match wire::parse_frame(&text) {
                    Ok(payload) => {
                        let event = ChannelEvent::TaskFrame {
                            task_id: task_id.clone(),
                            payload,
                        };
                        if events.send(event).await.is_err() {
                            break None;
                        }
                    }
                    Err(err) => warn!(task_id = %task_id, "dropping bad task frame: {err}"),
                },
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(task_id = %task_id, "task channel read error: {err}");
                    break Some(CloseReason::Transport);
                }
                None => break Some(CloseReason::Remote),
            },
        }
    };

    let _ = ws.close(None).await;
    set_state(&state, ChannelState::Closed);
    if let Some(reason) = reason {
        let _ = events
            .send(ChannelEvent::ChannelClosed { task_id, reason })
            .await;
    }
}
