mod cli;
mod crypto;
mod env;
mod error;
mod http;
mod keepalive;
mod metrics;
mod protocol;
mod session;
mod sftp;
mod ssh;
mod state;
mod ws;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use log::{info, warn};
use tokio::signal;

use crate::error::ErrorClassifier;
use crate::state::AppState;

const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const ERROR_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);
const METRICS_LOG_INTERVAL: Duration = Duration::from_secs(60);

fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("install rustls crypto provider");

    let rt = gateway_common::runtime::build_runtime_from_env();

    rt.block_on(async {
        let cli = cli::parse();
        match cli.command {
            Some(cli::Commands::Version) => {
                println!("{}", env::version());
                Ok(())
            }
            Some(cli::Commands::Start) | None => {
                gateway_common::logger::init_logger("ssh-gateway");
                let config = env::init()?;
                run(config).await
            }
        }
    })
}

async fn run(config: env::Env) -> anyhow::Result<()> {
    info!("running ssh gateway in {} mode", config.mode);

    let ip_source = config.ip_source.clone();
    let host = format!("{}:{}", config.host, config.port);
    let pending_sweep = Duration::from_secs(config.pending_connection_sweep_secs);

    let state = AppState::new(Arc::new(config));

    let session_sweeper = tokio::spawn(session::registry::run_sweeper(
        Arc::clone(&state.sessions),
        SESSION_SWEEP_INTERVAL,
    ));
    let pending_sweeper = tokio::spawn(session::pending::run_sweeper(
        Arc::clone(&state.pending),
        pending_sweep,
    ));
    let error_sweeper = tokio::spawn(run_error_sweeper(
        Arc::clone(&state.errors),
        ERROR_SWEEP_INTERVAL,
    ));
    let metrics_logger = tokio::spawn(metrics::run_logger(
        Arc::clone(&state.metrics),
        METRICS_LOG_INTERVAL,
    ));

    let app = Router::new()
        .route("/ssh", get(ws::ws_ssh_handler))
        .route("/version", get(http::get_version))
        .layer(ip_source.into_extension())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&host).await?;
    info!("listening on: {}", listener.local_addr()?);

    let shutdown_signal = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!("failed to listen for shutdown signal: {err}");
        } else {
            info!("ctrl+c pressed, shutting down");
        }
    };

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal)
    .await?;

    session_sweeper.abort();
    pending_sweeper.abort();
    error_sweeper.abort();
    metrics_logger.abort();

    Ok(())
}

async fn run_error_sweeper(errors: Arc<ErrorClassifier>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        errors.sweep_expired();
    }
}
