use crate::{ChannelConfig, ChannelEvent};
use ferro_core::wire::{self, ClientFrame};
use ferro_core::TaskId;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, warn};
use url::Url;

/// Shared set of task ids the feed subscribes to. Consulted at every
/// (re)connect; ids added mid-connection take effect on the next one.
pub type TrackedTasks = Arc<Mutex<HashSet<TaskId>>>;

/// Client for the backend's global update stream. Reconnects after a
/// fixed delay, forever, until `shutdown` is called.
pub struct UpdateFeed {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl UpdateFeed {
    pub fn spawn(
        url: Url,
        tracked: TrackedTasks,
        events: mpsc::Sender<ChannelEvent>,
        config: ChannelConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(feed_loop(url, tracked, events, config, shutdown_rx));
        UpdateFeed {
            shutdown: shutdown_tx,
            handle,
        }
    }

    /// Stop the reconnect loop and wait for it to wind down.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

async fn feed_loop(
    url: Url,
    tracked: TrackedTasks,
    events: mpsc::Sender<ChannelEvent>,
    config: ChannelConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let connect = tokio::select! {
            _ = shutdown.changed() => return,
            result = connect_async(url.as_str()) => result,
        };
        let (mut ws, _) = match connect {
            Ok(value) => value,
            Err(err) => {
                warn!("feed connect error: {err}");
                if wait_or_shutdown(&mut shutdown, config.reconnect_delay).await {
                    return;
                }
                continue;
            }
        };
        debug!("update feed connected");

        if !send_subscriptions(&mut ws, &tracked).await {
            let _ = ws.close(None).await;
            if wait_or_shutdown(&mut shutdown, config.reconnect_delay).await {
                return;
            }
            continue;
        }

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let _ = ws.close(None).await;
                    return;
                }
                msg = ws.next() => match msg {
                    Some(Ok(WsMessage::Text(text))) => match wire::parse_update(&text) {
                        Ok(update) => {
                            if events.send(ChannelEvent::Update(update)).await.is_err() {
                                // Consumer gone; nothing left to feed.
                                let _ = ws.close(None).await;
                                return;
                            }
                        }
                        Err(err) => warn!("dropping bad feed frame: {err}"),
                    },
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!("feed read error: {err}");
                        break;
                    }
                    None => {
                        debug!("update feed disconnected");
                        break;
                    }
                },
            }
        }

        let _ = ws.close(None).await;
        if wait_or_shutdown(&mut shutdown, config.reconnect_delay).await {
            return;
        }
    }
}

async fn send_subscriptions<S>(ws: &mut S, tracked: &TrackedTasks) -> bool
where
    S: SinkExt<WsMessage> + Unpin,
{
    let mut ids: Vec<TaskId> = tracked
        .lock()
        .map(|set| set.iter().cloned().collect())
        .unwrap_or_default();
    ids.sort_by_key(|id| id.to_string());
    for id in ids {
        let frame = ClientFrame::Subscribe { task_id: id }.to_json();
        if ws.send(WsMessage::Text(frame)).await.is_err() {
            warn!("feed subscribe failed");
            return false;
        }
    }
    true
}

/// Returns true when shutdown was requested during the wait.
async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = shutdown.changed() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}
