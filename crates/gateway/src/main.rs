use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use aegis_domain::config::Config;
use aegis_gateway::api;
use aegis_gateway::bootstrap::build_app_state;
use aegis_gateway::cli::{self, Cli, Command, ConfigCommand};
use aegis_gateway::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            init_tracing();
            let (config, source) = cli::load_config(cli.config.as_ref())?;
            tracing::info!(config = %source, "aegis starting");
            run_server(Arc::new(config)).await
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let (config, source) = cli::load_config(cli.config.as_ref())?;
            if !cli::validate(&config, &source) {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let (config, _) = cli::load_config(cli.config.as_ref())?;
            cli::show(&config);
            Ok(())
        }
        Some(Command::Doctor) => {
            let (config, _) = cli::load_config(cli.config.as_ref())?;
            if !cli::doctor(&config).await {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Version) => {
            println!("aegis {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Structured JSON tracing for the serve path.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,aegis_gateway=debug")),
        )
        .json()
        .init();
}

async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    let state = build_app_state(config.clone()).await?;

    // ── Listeners ────────────────────────────────────────────────────
    let gateway_addr = format!("{}:{}", config.server.host, config.server.port);
    let health_addr = format!("{}:{}", config.server.host, config.server.health_port);

    let gateway_listener = tokio::net::TcpListener::bind(&gateway_addr)
        .await
        .with_context(|| format!("binding {gateway_addr}"))?;
    let health_listener = tokio::net::TcpListener::bind(&health_addr)
        .await
        .with_context(|| format!("binding {health_addr}"))?;
    tracing::info!(gateway = %gateway_addr, health = %health_addr, "listening");

    let gateway_server = {
        let shutdown = state.shutdown.clone();
        let router = api::gateway_router(state.clone());
        tokio::spawn(async move {
            let serve = axum::serve(gateway_listener, router)
                .with_graceful_shutdown(async move { shutdown.cancelled().await });
            if let Err(e) = serve.await {
                tracing::error!(error = %e, "gateway server error");
            }
        })
    };
    let health_server = {
        let shutdown = state.shutdown.clone();
        let router = api::health_router(state.clone());
        tokio::spawn(async move {
            let serve = axum::serve(health_listener, router)
                .with_graceful_shutdown(async move { shutdown.cancelled().await });
            if let Err(e) = serve.await {
                tracing::error!(error = %e, "health server error");
            }
        })
    };

    wait_for_signal().await;
    tracing::info!("shutdown signal received");

    graceful_shutdown(&state).await;

    let _ = gateway_server.await;
    let _ = health_server.await;
    tracing::info!("aegis stopped");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// The orderly shutdown sequence: stop accepting sessions, notify and
/// drain clients, terminate workers, flush the audit buffer, release
/// the leader lock, close the pool.
async fn graceful_shutdown(state: &AppState) {
    let drain = Duration::from_millis(state.config.server.drain_timeout_ms);

    state.clients.drain(drain).await;
    state.supervisor.shutdown_all().await;
    state.shutdown.cancel();

    state.audit.stop();
    match state.audit.flush_all().await {
        Ok(flushed) => tracing::info!(flushed, "audit buffer flushed"),
        Err(e) => tracing::warn!(error = %e, "audit flush failed during shutdown"),
    }

    if let Some(leader) = &state.leader {
        leader.resign().await;
    }
    if let Some(pool) = &state.pool {
        pool.close().await;
    }
}
