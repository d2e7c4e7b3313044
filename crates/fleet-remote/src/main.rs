mod config;
mod dispatch;
mod fs_ops;
mod idempotency;
mod simple_executor;
mod tmux_session;

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use config::{Args, ServerConfig};
use dispatch::{Executor, ServerState};
use idempotency::IdempotencyCache;
use tmux_session::TmuxSession;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = ServerConfig::resolve(args)?;
    info!(port = config.port, use_tmux = config.use_tmux, "starting fleet-remote");

    let executor = if config.use_tmux {
        let mut session = TmuxSession::new(config.tmux_socket_path());
        session.ensure_created().await?;
        Executor::Tmux(session)
    } else {
        Executor::Simple
    };

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let state = Arc::new(ServerState {
        config: config.clone(),
        cache: IdempotencyCache::new(),
        executor,
        exec_lock: tokio::sync::Mutex::new(()),
        shutdown: shutdown_tx,
    });

    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!("listening on 0.0.0.0:{}", config.port);

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        info!("accepted connection from {addr}");
                        let state = state.clone();
                        tokio::spawn(async move {
                            dispatch::handle_connection(stream, state).await;
                        });
                    }
                    Err(e) => warn!("accept failed: {e}"),
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("shutdown requested over RPC, exiting");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT, exiting");
                break;
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, exiting");
                break;
            }
        }
    }

    if let Executor::Tmux(mut session) = Arc::try_unwrap(state)
        .map(|s| s.executor)
        .unwrap_or(Executor::Simple)
    {
        session.destroy().await;
    } else {
        info!("no tmux session to tear down, or connections still holding a reference");
    }

    Ok(())
}
