use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::prelude::*;

use cidx::config;
use cidx::embedding::{self, HttpEmbeddingClient};
use cidx::rpc::Daemon;

#[tokio::main]
async fn main() -> Result<()> {
    let log_dir = std::env::var("CIDX_LOG_DIR").unwrap_or_else(|_| {
        dirs::data_local_dir()
            .map(|d| d.join("cidx").join("logs").to_string_lossy().to_string())
            .unwrap_or_else(|_| ".cidx-data/logs".to_string())
    });
    std::fs::create_dir_all(&log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(&log_dir, "cidx.log");
    let (non_blocking_writer, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "cidx=info".into());

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .compact();

    let file_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(non_blocking_writer)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let location = info.location().map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column())).unwrap_or_default();
        let payload = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        error!(target: "cidx::panic", location = %location, payload = %payload, "PANIC: thread panicked");
        default_panic(info);
    }));

    let daemon_config = config::DaemonConfig::from_env();
    info!(
        data_dir_name = %daemon_config.data_dir_name,
        log_level = %daemon_config.log_level,
        log_dir = %log_dir,
        "cidx daemon starting"
    );

    let api_key = daemon_config
        .voyage_api_key
        .clone()
        .context("VOYAGE_API_KEY must be set")?;
    let embedder: std::sync::Arc<dyn embedding::EmbeddingClient> = std::sync::Arc::new(HttpEmbeddingClient::new(
        "https://api.voyageai.com/v1/embeddings".to_string(),
        api_key,
        "voyage-code-3".to_string(),
        1536,
    ));

    let daemon = std::sync::Arc::new(Daemon::new(daemon_config, embedder));

    // IMPORTANT: Daemon::serve binds the Unix socket and starts accepting
    // connections before any collection is loaded or watcher restored, so a
    // `status` request succeeds immediately rather than timing out while a
    // large project's first index warms up.
    let serve_daemon = daemon.clone();
    let serve_task = tokio::spawn(async move { serve_daemon.serve().await });

    shutdown_signal().await;
    daemon.shutdown.notify_one();

    match serve_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "daemon serve loop exited with error"),
        Err(e) => error!(error = %e, "daemon serve task panicked"),
    }

    info!("cidx daemon shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install secondary Ctrl+C handler");
    };

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, initiating shutdown"); },
        _ = terminate => { info!("received terminate signal, initiating shutdown"); },
    }
}
