use clap::Parser;
use ferro_channel::ChannelConfig;
use ferro_client::{SendOutcome, Session, SessionConfig};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "ferro-console", about = "Live console view of the task dashboard")]
struct Args {
    /// HTTP base of the task backend.
    #[arg(long, default_value = "http://localhost:8000")]
    backend: String,
    /// WebSocket base of the task backend.
    #[arg(long, default_value = "ws://localhost:8000")]
    ws: String,
    /// Snapshot cache file; omit to run without one.
    #[arg(long)]
    cache: Option<PathBuf>,
    /// Create a new task from this message before entering the view.
    #[arg(long)]
    send: Option<String>,
    #[arg(long, default_value_t = 5)]
    refresh_seconds: u64,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.debug);

    let base_url = match Url::parse(&args.backend) {
        Ok(value) => value,
        Err(err) => {
            error!(backend = %args.backend, "invalid backend url: {err}");
            return;
        }
    };
    let ws_url = match Url::parse(&args.ws) {
        Ok(value) => value,
        Err(err) => {
            error!(ws = %args.ws, "invalid websocket url: {err}");
            return;
        }
    };

    let session = match Session::start(SessionConfig {
        base_url,
        ws_url,
        cache_path: args.cache.clone(),
        channel: ChannelConfig::default(),
    })
    .await
    {
        Ok(session) => session,
        Err(err) => {
            error!("session start failed: {err}");
            return;
        }
    };

    if let Some(text) = &args.send {
        session.add_task().await;
        match session.send_message(text).await {
            Ok(SendOutcome::Accepted { task_id }) => {
                info!(task_id = %task_id, "message accepted");
            }
            Ok(SendOutcome::Rejected { task_id }) => {
                warn!(task_id = %task_id, "message rejected by task status");
            }
            Ok(SendOutcome::NoActiveTask) => warn!("no active task to send to"),
            Err(err) => error!("send failed: {err}"),
        }
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(args.refresh_seconds.max(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => print_dashboard(&session).await,
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }
    session.shutdown().await;
}

fn init_logging(debug: bool) {
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn print_dashboard(session: &Session) {
    let tasks = session.tasks().await;
    let stats = session.stats().await;
    let trend = session.trend().await;

    println!(
        "tasks: {} total | {} pending | {} processing | {} completed | {} error | {:.0}% success",
        stats.total, stats.pending, stats.processing, stats.completed, stats.error, stats.success_rate
    );
    for task in &tasks {
        println!(
            "  [{:>10}] {:>5.1}%  {}  {}",
            task.status.as_str(),
            task.progress_clamped(),
            task.id,
            task.description
        );
    }
    let week: Vec<String> = trend
        .iter()
        .map(|bucket| format!("{}/{}", bucket.completed, bucket.total))
        .collect();
    println!("  last 7 days (completed/total): {}", week.join("  "));
}
