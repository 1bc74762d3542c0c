use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{error, info};

use tidewatch::{
    cli::{self, Cli, Commands},
    config::Config,
    relay::{self, session::SessionStore, RelayState},
    rendezvous::RendezvousCache,
    shard::{coalesce::Coalescer, Shard},
};

#[tokio::main]
async fn main() {
    // Default to INFO unless the environment says otherwise.
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let args = Cli::parse();

    // Probe mode: act as a viewer against a running relay, then exit.
    if let Some(Commands::Probe {
        url,
        token,
        subject,
    }) = args.command
    {
        if let Err(err) = cli::run_probe(url, token, subject).await {
            error!("probe failed: {err}");
            std::process::exit(1);
        }
        return;
    }

    let mut config = Config::from_env();
    if let Some(port) = args.port {
        config.port = port;
    }
    let config = Arc::new(config);
    info!("starting tidewatch relay on port {}", config.port);
    info!("gateway endpoint: {}", config.gateway_url);
    info!(
        "session TTL: {}s, connection cap: {}",
        config.session_ttl_seconds, config.max_connections
    );

    // The rendezvous cache is constructed once here and handed to both the
    // shard and the relay's collaborator surface; no process-wide statics.
    let rendezvous = Arc::new(RendezvousCache::new());
    let sessions = Arc::new(SessionStore::new(Duration::from_secs(
        config.session_ttl_seconds,
    )));
    let (shard_handle, shard_commands) = tidewatch::shard::command_channel();
    let state = Arc::new(RelayState::new(
        config.clone(),
        sessions,
        rendezvous.clone(),
        shard_handle,
    ));

    let coalescer = Arc::new(Coalescer::new(
        Duration::from_millis(config.coalesce_quiet_ms),
        Duration::from_secs(config.coalesce_idle_evict_seconds),
        state.clone(),
    ));
    coalescer.start_sweeper();

    let shard = Shard::new(config.clone(), rendezvous, coalescer);
    tokio::spawn(async move {
        // The shard restarts itself per its recovery policy; an error here
        // means it gave up (exhausted connects or an unrecoverable close).
        if let Err(err) = shard.run(shard_commands).await {
            error!("upstream shard failed: {err}");
            std::process::exit(1);
        }
    });

    let app = relay::router(state);
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind listen address");
    info!("tidewatch listening on {addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("server error");
}
