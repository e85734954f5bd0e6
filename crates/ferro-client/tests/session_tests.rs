use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use ferro_channel::ChannelConfig;
use ferro_client::{SendOutcome, Session, SessionConfig};
use ferro_core::store::{CANCELLED_NOTICE, COMPLETED_SUMMARY};
use ferro_core::{StepStatus, TaskId, TaskStatus};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

#[derive(Default)]
struct Backend {
    tasks: Mutex<Vec<Value>>,
    posted_messages: Mutex<Vec<String>>,
    cancelled: AtomicBool,
    fail_create: AtomicBool,
}

fn backend_task(id: &str, status: &str, progress: f64) -> Value {
    json!({
        "id": id,
        "description": format!("task {id}"),
        "status": status,
        "progress": progress,
        "createdAt": "2026-08-30T10:00:00Z",
        "updatedAt": "2026-08-30T10:00:00Z"
    })
}

fn router(backend: Arc<Backend>) -> Router {
    Router::new()
        .route(
            "/tasks",
            get(|State(backend): State<Arc<Backend>>| async move {
                Json(Value::Array(backend.tasks.lock().expect("tasks").clone()))
            })
            .post(|State(backend): State<Arc<Backend>>| async move {
                if backend.fail_create.load(Ordering::SeqCst) {
                    return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({}))).into_response();
                }
                Json(backend_task("abc", "PENDING", 0.0)).into_response()
            }),
        )
        .route(
            "/tasks/:id/messages",
            post(
                |State(backend): State<Arc<Backend>>, Json(body): Json<Value>| async move {
                    let message = body["message"].as_str().unwrap_or_default().to_string();
                    backend
                        .posted_messages
                        .lock()
                        .expect("messages")
                        .push(message);
                    Json(json!({"ok": true}))
                },
            ),
        )
        .route(
            "/tasks/:id/cancel",
            post(|State(backend): State<Arc<Backend>>| async move {
                backend.cancelled.store(true, Ordering::SeqCst);
                Json(json!({"ok": true}))
            }),
        )
        .route(
            "/ws",
            get(|ws: WebSocketUpgrade| async move { ws.on_upgrade(park) }),
        )
        .route(
            "/ws/task/:id",
            get(|ws: WebSocketUpgrade| async move { ws.on_upgrade(push_progress) }),
        )
        .with_state(backend)
}

async fn park(mut socket: WebSocket) {
    while let Some(Ok(_)) = socket.recv().await {}
}

async fn push_progress(mut socket: WebSocket) {
    let frames = [
        json!({"taskId": "abc", "status": "PROCESSING", "progress": 40}),
        json!({"taskId": "abc", "status": "COMPLETED", "progress": 100}),
    ];
    for frame in frames {
        if socket
            .send(WsMessage::Text(frame.to_string()))
            .await
            .is_err()
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    while let Some(Ok(_)) = socket.recv().await {}
}

async fn start_session(backend: Arc<Backend>) -> (Session, Url) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router(backend)).await;
    });
    let base_url = Url::parse(&format!("http://{addr}")).expect("base url");
    let ws_url = Url::parse(&format!("ws://{addr}")).expect("ws url");
    let session = Session::start(SessionConfig {
        base_url: base_url.clone(),
        ws_url,
        cache_path: None,
        channel: ChannelConfig {
            poll_interval: Duration::from_millis(20),
            max_polls: 50,
            reconnect_delay: Duration::from_millis(20),
        },
    })
    .await
    .expect("session start");
    (session, base_url)
}

async fn wait_for_status(session: &Session, id: &TaskId, status: TaskStatus) {
    for _ in 0..200 {
        if session
            .tasks()
            .await
            .iter()
            .any(|task| &task.id == id && task.status == status)
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("task {id} never reached {status}");
}

#[tokio::test]
async fn draft_is_promoted_and_completed_by_push_updates() {
    let backend = Arc::new(Backend::default());
    let (session, _) = start_session(backend.clone()).await;

    let draft = session.add_task().await;
    assert!(draft.is_provisional());

    let outcome = session.send_message("hello").await.expect("send accepted");
    let confirmed = TaskId::confirmed("abc");
    assert_eq!(
        outcome,
        SendOutcome::Accepted {
            task_id: confirmed.clone()
        }
    );

    // Messages recorded under the draft id moved to the confirmed id.
    let messages = session.messages(&confirmed).await;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].text, "hello");
    assert!(messages[1].is_streaming);
    assert!(session.messages(&draft).await.is_empty());

    // The per-task channel pushes PROCESSING/40 then COMPLETED.
    wait_for_status(&session, &confirmed, TaskStatus::Completed).await;
    let task = session
        .tasks()
        .await
        .into_iter()
        .find(|task| task.id == confirmed)
        .expect("confirmed task present");
    assert_eq!(task.progress, 100.0);

    // Completion finalized the streaming reply.
    let messages = session.messages(&confirmed).await;
    let last = messages.last().expect("reply present");
    assert!(!last.is_streaming);
    assert_eq!(last.text, COMPLETED_SUMMARY);
    assert!(last
        .steps
        .iter()
        .all(|step| step.status == StepStatus::Completed));

    // The message itself reached the backend.
    assert_eq!(
        backend.posted_messages.lock().expect("messages").as_slice(),
        ["hello".to_string()]
    );

    session.shutdown().await;
}

#[tokio::test]
async fn cancelled_task_rejects_further_sends() {
    let backend = Arc::new(Backend::default());
    backend
        .tasks
        .lock()
        .expect("tasks")
        .push(backend_task("xyz", "PROCESSING", 60.0));
    let (session, _) = start_session(backend.clone()).await;

    let id = TaskId::confirmed("xyz");
    assert_eq!(session.tasks().await.len(), 1);
    session.select_task(Some(id.clone())).await;

    assert!(session.cancel_task(&id).await);
    let task = session.tasks().await.pop().expect("task present");
    assert_eq!(task.status, TaskStatus::Error);

    let outcome = session.send_message("are you there").await.expect("policy");
    assert_eq!(
        outcome,
        SendOutcome::Rejected {
            task_id: id.clone()
        }
    );
    let messages = session.messages(&id).await;
    assert_eq!(messages.last().expect("notice").text, CANCELLED_NOTICE);

    // The fire-and-forget cancel call eventually lands.
    for _ in 0..100 {
        if backend.cancelled.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(backend.cancelled.load(Ordering::SeqCst));

    let stats = session.stats().await;
    assert_eq!(stats.total, 1);
    assert_eq!(stats.error, 1);
    assert_eq!(stats.success_rate, 0.0);

    session.shutdown().await;
}

#[tokio::test]
async fn create_failure_keeps_the_draft_for_retry() {
    let backend = Arc::new(Backend::default());
    backend.fail_create.store(true, Ordering::SeqCst);
    let (session, _) = start_session(backend.clone()).await;

    let draft = session.add_task().await;
    assert!(session.send_message("hello").await.is_err());

    // Draft and its optimistic messages survive for a retry.
    let tasks = session.tasks().await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].id, draft);
    assert_eq!(session.messages(&draft).await.len(), 2);
    assert_eq!(session.active_task().await.expect("active").id, draft);

    // Retry succeeds once the backend recovers.
    backend.fail_create.store(false, Ordering::SeqCst);
    let outcome = session.send_message("hello again").await.expect("retry");
    assert_eq!(
        outcome,
        SendOutcome::Accepted {
            task_id: TaskId::confirmed("abc")
        }
    );
    // Both attempts' messages now live under the confirmed id.
    assert_eq!(session.messages(&TaskId::confirmed("abc")).await.len(), 4);

    session.shutdown().await;
}

#[tokio::test]
async fn shutdown_persists_the_cache() {
    let backend = Arc::new(Backend::default());
    backend
        .tasks
        .lock()
        .expect("tasks")
        .push(backend_task("xyz", "COMPLETED", 100.0));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router(backend)).await;
    });

    let dir = tempfile::tempdir().expect("temp dir");
    let cache_path = dir.path().join("ferro-cache.json");
    let session = Session::start(SessionConfig {
        base_url: Url::parse(&format!("http://{addr}")).expect("base url"),
        ws_url: Url::parse(&format!("ws://{addr}")).expect("ws url"),
        cache_path: Some(cache_path.clone()),
        channel: ChannelConfig::default(),
    })
    .await
    .expect("session start");

    // An abandoned draft must not leak into the cache.
    session.add_task().await;
    session.shutdown().await;

    let snapshot = ferro_client::cache::load(&cache_path).expect("cache written");
    assert_eq!(snapshot.tasks.len(), 1);
    assert_eq!(snapshot.tasks[0].id, TaskId::confirmed("xyz"));
}
