//! Camera pipeline daemon.
//!
//! Reads JSON commands line by line from stdin and writes events and replies
//! as JSON lines to stdout. Logs go to stderr.

use std::path::PathBuf;
use std::sync::Arc;

use campipe::control::{Command, Request};
use campipe::{Config, Event, Pipeline};
use color_eyre::Result;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("campipe=info"));

    #[cfg(feature = "profiling")]
    {
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_timer(tracing_subscriber::fmt::time::uptime()),
            )
            .with(tracing_tracy::TracyLayer::default())
            .init();
    }

    #[cfg(not(feature = "profiling"))]
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();
}

/// Live frames are large, so only their size is echoed to stdout.
fn event_line(event: &Event) -> serde_json::Result<String> {
    match event {
        Event::VideoFrame { frame } => {
            serde_json::to_string(&json!({ "event": "video_frame", "data": { "bytes": frame.len() } }))
        }
        other => serde_json::to_string(other),
    }
}

async fn forward_events(pipeline: Arc<Pipeline>) {
    let mut rx = pipeline.events().subscribe();
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                debug!(skipped, "event forwarder lagging");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let line = match event_line(&event) {
            Ok(line) => line,
            Err(e) => {
                warn!(event = event.name(), error = %e, "failed to serialize event");
                continue;
            }
        };
        println!("{line}");
    }
}

/// Parse stdin lines into inbox requests and print each reply.
async fn read_commands(inbox: flume::Sender<Request>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let command = match Command::parse(line) {
            Ok(command) => command,
            Err(e) => {
                warn!(error = %e, "unparseable command");
                println!("{}", json!({ "result": "error", "reason": "invalid_command" }));
                continue;
            }
        };

        let (request, reply) = Request::new(command);
        if inbox.send_async(request).await.is_err() {
            break;
        }
        let line = match reply.await {
            Ok(Ok(reply)) => serde_json::to_string(&reply)?,
            Ok(Err(e)) => json!({ "result": "error", "reason": e.reason(), "detail": e.to_string() })
                .to_string(),
            Err(_) => break,
        };
        println!("{line}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    info!("campipe launching...");

    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;

    let pipeline = Arc::new(Pipeline::builder(config).build());
    tokio::spawn(forward_events(pipeline.clone()));

    let report = pipeline.arm().await;
    println!("{}", json!({ "preflight": report }));
    if !report.is_ok() {
        error!(status = report.status.code(), detail = ?report.detail, "pre-flight failed");
    }

    let (inbox_tx, inbox_rx) = flume::bounded::<Request>(16);
    let inbox = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move { pipeline.run_inbox(inbox_rx).await })
    };

    tokio::select! {
        result = read_commands(inbox_tx) => {
            if let Err(e) = result {
                error!(error = %e, "command reader failed");
            }
            info!("stdin closed");
        }
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }

    pipeline.shutdown().await;
    inbox.abort();

    info!("campipe shutting down");
    Ok(())
}
