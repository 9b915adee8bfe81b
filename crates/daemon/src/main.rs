//! AgenticQA bridge daemon
//!
//! Bridges the QA tracker UI and the browser automation agent.

use agenticqa_daemon::http::{self, AppState};
use agenticqa_daemon::{Bridge, BridgeConfig};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "agenticqa-bridged")]
#[command(about = "AgenticQA bridge - drives a browser automation agent for the QA tracker")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "AGENTICQA_CONFIG", default_value = "agenticqa.toml")]
    config: PathBuf,

    /// HTTP listen address
    #[arg(short, long, env = "AGENTICQA_LISTEN")]
    listen: Option<SocketAddr>,

    /// Dedicated push-channel listen address
    #[arg(long, env = "AGENTICQA_PUSH_LISTEN")]
    push_listen: Option<SocketAddr>,

    /// Automation agent program
    #[arg(long, env = "AGENTICQA_AGENT_PROGRAM")]
    agent_program: Option<String>,

    /// Automation agent argument (repeatable; replaces the configured list)
    #[arg(long = "agent-arg", allow_hyphen_values = true)]
    agent_args: Vec<String>,

    /// Start the agent on the first run instead of at startup
    #[arg(long)]
    no_autostart: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

impl Cli {
    fn apply(&self, config: &mut BridgeConfig) {
        if let Some(listen) = self.listen {
            config.http.listen = listen;
        }
        if let Some(push_listen) = self.push_listen {
            config.http.push_listen = Some(push_listen);
        }
        if let Some(program) = &self.agent_program {
            config.agent.program = program.clone();
        }
        if !self.agent_args.is_empty() {
            config.agent.args = self.agent_args.clone();
        }
        if self.no_autostart {
            config.agent.autostart = false;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("AgenticQA bridge v{}", env!("CARGO_PKG_VERSION"));

    let mut config = BridgeConfig::load(&cli.config)?;
    cli.apply(&mut config);

    let bridge = Arc::new(Bridge::new(config.clone())?);
    if config.agent.autostart {
        // A failed start is reported to subscribers; runs retry it.
        if let Err(e) = bridge.start() {
            warn!("Automation agent did not start: {}", e);
        }
    }

    let state = AppState::new(bridge.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener = tokio::net::TcpListener::bind(config.http.listen).await?;
    let mut http_handle = tokio::spawn(http::serve(
        listener,
        http::router(state.clone()),
        wait_for(shutdown_rx.clone()),
    ));

    let push_handle = match config.http.push_listen {
        Some(addr) => {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            info!("Push channel available at ws://{}/", addr);
            Some(tokio::spawn(http::serve(
                listener,
                http::push_router(state),
                wait_for(shutdown_rx),
            )))
        }
        None => None,
    };

    info!("Bridge API available at http://{}", config.http.listen);

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut http_handle => {
            match result {
                Ok(Err(e)) => error!("HTTP server error: {}", e),
                Err(e) => error!("HTTP server task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }
    }

    let _ = shutdown_tx.send(true);
    bridge.shutdown().await;
    if !http_handle.is_finished() {
        let _ = http_handle.await;
    }
    if let Some(handle) = push_handle {
        let _ = handle.await;
    }

    info!("Bridge shutdown complete");
    Ok(())
}

async fn wait_for(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
