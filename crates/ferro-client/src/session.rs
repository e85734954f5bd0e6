use crate::api::{ApiClient, ApiError};
use crate::cache::{self, CacheSnapshot};
use chrono::Utc;
use ferro_channel::{ChannelConfig, ChannelEvent, ChannelManager, UpdateFeed};
use ferro_core::metrics::{self, TaskStats, TrendBucket};
use ferro_core::store::{Dashboard, SendDecision, StoreError};
use ferro_core::wire::TaskUpdate;
use ferro_core::{Message, Step, StepStatus, Task, TaskId, TaskStatus};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

const EVENT_QUEUE_DEPTH: usize = 256;
const STREAMING_TEXT: &str = "Working on your request...";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid endpoint: {0}")]
    Endpoint(#[from] url::ParseError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    Accepted { task_id: TaskId },
    /// Policy rejection (cancelled task); a synthetic notice was appended
    /// to the conversation.
    Rejected { task_id: TaskId },
    NoActiveTask,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// HTTP base, e.g. `http://localhost:8000`.
    pub base_url: Url,
    /// WebSocket base, e.g. `ws://localhost:8000`. The global feed lives
    /// at `<ws>/ws`, per-task channels at `<ws>/ws/task/{id}`.
    pub ws_url: Url,
    pub cache_path: Option<PathBuf>,
    pub channel: ChannelConfig,
}

/// Owns the dashboard state and reconciles its three producers: user
/// intents, HTTP responses, and push updates. All mutations go through
/// one lock; push events are applied in receipt order by a single
/// dispatcher task.
pub struct Session {
    state: Arc<Mutex<Dashboard>>,
    api: ApiClient,
    manager: Arc<Mutex<ChannelManager>>,
    tracked: Arc<StdMutex<HashSet<TaskId>>>,
    feed: Option<UpdateFeed>,
    dispatcher: JoinHandle<()>,
    dispatcher_stop: watch::Sender<bool>,
    cache_path: Option<PathBuf>,
}

impl Session {
    pub async fn start(config: SessionConfig) -> Result<Self, SessionError> {
        let api = ApiClient::new(config.base_url.clone())?;

        let mut dashboard = Dashboard::default();
        if let Some(path) = &config.cache_path {
            if let Some(snapshot) = cache::load(path) {
                dashboard.restore(snapshot.tasks, snapshot.active_task_id);
            }
        }
        // The backend is the source of truth; the cache only bridges the
        // gap while it is unreachable.
        match api.list_tasks().await {
            Ok(tasks) => dashboard.replace_confirmed(tasks),
            Err(err) => warn!("task list fetch failed, continuing on cached state: {err}"),
        }

        let tracked: Arc<StdMutex<HashSet<TaskId>>> = Arc::new(StdMutex::new(
            dashboard.tasks().iter().map(|task| task.id.clone()).collect(),
        ));

        let feed_url = Url::parse(&format!(
            "{}/ws",
            config.ws_url.as_str().trim_end_matches('/')
        ))?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let manager = Arc::new(Mutex::new(ChannelManager::new(
            config.ws_url.clone(),
            config.channel.clone(),
            events_tx.clone(),
        )));
        let feed = UpdateFeed::spawn(feed_url, tracked.clone(), events_tx, config.channel.clone());

        let state = Arc::new(Mutex::new(dashboard));
        let (stop_tx, stop_rx) = watch::channel(false);
        let dispatcher = tokio::spawn(dispatch_loop(
            events_rx,
            state.clone(),
            manager.clone(),
            stop_rx,
        ));

        Ok(Session {
            state,
            api,
            manager,
            tracked,
            feed: Some(feed),
            dispatcher,
            dispatcher_stop: stop_tx,
            cache_path: config.cache_path,
        })
    }

    /// Start a new draft task and select it.
    pub async fn add_task(&self) -> TaskId {
        self.state.lock().await.create_provisional(Utc::now())
    }

    pub async fn select_task(&self, target: Option<TaskId>) {
        self.state.lock().await.select(target);
    }

    /// Send a message on the active task. A draft is created on the
    /// backend first and promoted to its confirmed id; the draft stays in
    /// place when creation fails, so the user can retry.
    pub async fn send_message(&self, text: &str) -> Result<SendOutcome, SessionError> {
        let now = Utc::now();
        let active = {
            let mut dashboard = self.state.lock().await;
            let Some(active) = dashboard.active().cloned() else {
                return Ok(SendOutcome::NoActiveTask);
            };
            if let SendDecision::Rejected(notice) = dashboard.send_policy(&active, now) {
                dashboard.append_message(&active, notice);
                return Ok(SendOutcome::Rejected { task_id: active });
            }
            dashboard.append_message(&active, Message::user(text, now));
            dashboard.append_message(
                &active,
                Message::streaming(STREAMING_TEXT, processing_steps(), now),
            );
            active
        };

        if !active.is_provisional() {
            if let Err(err) = self.api.send_message(&active, text).await {
                warn!(task_id = %active, "message send failed: {err}");
            }
            return Ok(SendOutcome::Accepted { task_id: active });
        }

        let confirmed = match self.api.create_task(text).await {
            Ok(confirmed) => confirmed,
            Err(err) => {
                warn!("task create failed, draft kept for retry: {err}");
                return Err(err.into());
            }
        };
        let confirmed_id = self.promote(&active, confirmed).await?;

        // Promotion is complete before the task has any channel, so no
        // update for the confirmed id can race the re-key.
        self.manager.lock().await.open_channel(&confirmed_id);

        if let Err(err) = self.api.send_message(&confirmed_id, text).await {
            warn!(task_id = %confirmed_id, "message send failed: {err}");
        }
        Ok(SendOutcome::Accepted {
            task_id: confirmed_id,
        })
    }

    async fn promote(&self, provisional: &TaskId, confirmed: Task) -> Result<TaskId, SessionError> {
        let mut dashboard = self.state.lock().await;
        let confirmed_id = match dashboard.promote(provisional, confirmed.clone()) {
            Ok(id) => id,
            Err(err) => {
                // The draft disappeared while the create call was in
                // flight (replaced or discarded). The backend task is
                // real, so adopt it.
                warn!("promotion fell back to adoption: {err}");
                let id = confirmed.id.clone();
                dashboard.restore(vec![confirmed], None);
                id
            }
        };
        drop(dashboard);
        if let Ok(mut tracked) = self.tracked.lock() {
            tracked.insert(confirmed_id.clone());
        }
        Ok(confirmed_id)
    }

    /// Optimistic cancellation: local status flips to ERROR immediately,
    /// the channel is torn down, and the backend call is fire-and-forget.
    pub async fn cancel_task(&self, id: &TaskId) -> bool {
        let applied = self.state.lock().await.cancel(id, Utc::now());
        self.manager.lock().await.close_channel(id);
        if applied && !id.is_provisional() {
            let api = self.api.clone();
            let id = id.clone();
            tokio::spawn(async move {
                if let Err(err) = api.cancel_task(&id).await {
                    warn!(task_id = %id, "cancel request failed: {err}");
                }
            });
        }
        applied
    }

    /// Reopen the bounded-poll channel for a task; close-before-open is
    /// handled by the manager.
    pub async fn reopen_channel(&self, id: &TaskId) {
        if id.is_provisional() {
            return;
        }
        self.manager.lock().await.open_channel(id);
    }

    pub async fn tasks(&self) -> Vec<Task> {
        self.state.lock().await.tasks().to_vec()
    }

    pub async fn active_task(&self) -> Option<Task> {
        self.state.lock().await.active_task().cloned()
    }

    pub async fn messages(&self, id: &TaskId) -> Vec<Message> {
        self.state.lock().await.messages(id).to_vec()
    }

    pub async fn stats(&self) -> TaskStats {
        metrics::task_stats(self.state.lock().await.tasks())
    }

    pub async fn trend(&self) -> Vec<TrendBucket> {
        metrics::weekly_trend(self.state.lock().await.tasks(), Utc::now().date_naive())
    }

    pub async fn save_cache(&self) {
        let Some(path) = &self.cache_path else {
            return;
        };
        let snapshot = {
            let dashboard = self.state.lock().await;
            CacheSnapshot::from_dashboard(&dashboard)
        };
        if let Err(err) = cache::save(path, &snapshot) {
            warn!("cache save failed: {err}");
        }
    }

    /// Deterministic teardown: stop the feed's reconnect loop, retire
    /// every per-task channel, drain the dispatcher, persist the cache.
    pub async fn shutdown(mut self) {
        if let Some(feed) = self.feed.take() {
            feed.shutdown().await;
        }
        self.manager.lock().await.close_all().await;
        let _ = self.dispatcher_stop.send(true);
        let _ = (&mut self.dispatcher).await;
        self.save_cache().await;
    }
}

/// Steps shown on the synthetic streaming reply while the backend works.
fn processing_steps() -> Vec<Step> {
    vec![
        Step {
            title: "Request queued".to_string(),
            status: StepStatus::Completed,
            time_estimate: None,
        },
        Step {
            title: "Processing request".to_string(),
            status: StepStatus::InProgress,
            time_estimate: Some("~2 min".to_string()),
        },
        Step {
            title: "Preparing summary".to_string(),
            status: StepStatus::Pending,
            time_estimate: None,
        },
    ]
}

/// Single consumer of all push events. Per-task receipt order is the
/// queue order; nothing else touches the stores concurrently with an
/// application because every mutation goes through the state lock.
async fn dispatch_loop(
    mut events: mpsc::Receiver<ChannelEvent>,
    state: Arc<Mutex<Dashboard>>,
    manager: Arc<Mutex<ChannelManager>>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            event = events.recv() => match event {
                Some(event) => handle_event(event, &state, &manager).await,
                None => break,
            },
            _ = stop.changed() => break,
        }
    }
}

async fn handle_event(
    event: ChannelEvent,
    state: &Arc<Mutex<Dashboard>>,
    manager: &Arc<Mutex<ChannelManager>>,
) {
    match event {
        ChannelEvent::Update(update) => apply_update(update, state, manager).await,
        ChannelEvent::TaskFrame { task_id, payload } => {
            // Per-task frames arrive verbatim; anything that is not a
            // status update is ignored.
            match serde_json::from_value::<TaskUpdate>(payload) {
                Ok(update) => apply_update(update, state, manager).await,
                Err(err) => debug!(task_id = %task_id, "non-update task frame ignored: {err}"),
            }
        }
        ChannelEvent::ChannelClosed { task_id, reason } => {
            debug!(task_id = %task_id, ?reason, "task channel closed");
            manager.lock().await.forget_closed(&task_id);
        }
    }
}

async fn apply_update(
    update: TaskUpdate,
    state: &Arc<Mutex<Dashboard>>,
    manager: &Arc<Mutex<ChannelManager>>,
) {
    let applied = {
        let mut dashboard = state.lock().await;
        let applied =
            dashboard.apply_update(&update.task_id, update.status, update.progress, Utc::now());
        if applied && update.status == TaskStatus::Completed {
            dashboard.finalize_streaming(&update.task_id);
        }
        applied
    };
    if applied && update.status.is_terminal() {
        manager.lock().await.close_channel(&update.task_id);
    }
}
