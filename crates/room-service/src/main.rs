//! Room Service
//!
//! SFU control plane: admission, signaling and media session tracking.
//!
//! # Servers
//!
//! One HTTP listener (default: 0.0.0.0:3001) serves the admission and status
//! API, the `/ws` signaling endpoint, probes and `/metrics`.
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Start media workers
//! 4. Initialize the registry actor
//! 5. Watch workers; the first death exits the process after a delay
//! 6. Bind the listener and mark ready
//! 7. Wait for shutdown signal, then drain

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use anyhow::Context;
use room_service::actors::{RoomRegistryActorHandle, SHUTDOWN_REASON};
use room_service::auth::SessionTokenIssuer;
use room_service::capacity::CapacityPool;
use room_service::config::Config;
use room_service::media::allocator::{supervise_workers, WorkerPool};
use room_service::media::local::LocalEngine;
use room_service::observability::{init_metrics_recorder, HealthState};
use room_service::registry::RoomRegistry;
use room_service::routes::{build_routes, AppState};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Upper bound on waiting for open connections after rooms are closed.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let started_at = Instant::now();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "room_service=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Room Service");

    // Load configuration
    let config = Config::from_env().inspect_err(|e| {
        error!("Failed to load configuration: {}", e);
    })?;

    info!(
        bind_address = %config.bind_address,
        cors_origin = %config.cors_origin,
        total_max_rooms = config.capacity.total_max_rooms,
        free_percent = config.capacity.free_percent,
        supporter_percent = config.capacity.supporter_percent,
        media_workers = config.media.num_workers,
        "Configuration loaded successfully"
    );

    // Initialize Prometheus metrics recorder
    // This must happen before any metrics are recorded
    let prometheus_handle = init_metrics_recorder().map_err(anyhow::Error::msg)?;
    info!("Prometheus metrics recorder initialized");

    let health_state = Arc::new(HealthState::new());

    // Start media workers
    let engine = LocalEngine::new();
    let workers = Arc::new(
        WorkerPool::start(&engine, &config.media)
            .await
            .context("failed to start media workers")?,
    );
    info!(workers = workers.worker_count(), "Media workers started");

    // Initialize registry actor
    let registry = RoomRegistryActorHandle::new(
        RoomRegistry::new(CapacityPool::new(config.capacity), config.tiers.clone()),
        config.housekeeping.clone(),
    );
    info!("Registry actor initialized");

    // A dead worker is never replaced in place. Stop taking traffic, give
    // the logs a moment to flush, and let the supervisor restart us.
    {
        let supervisor = supervise_workers(&workers, Arc::clone(&health_state));
        let exit_delay = config.media.worker_death_exit_delay;
        tokio::spawn(async move {
            let death = supervisor.await;
            error!(
                target: "room.media",
                worker_id = %death.worker_id,
                exit_delay_ms = exit_delay.as_millis() as u64,
                "Exiting after media worker death"
            );
            tokio::time::sleep(exit_delay).await;
            std::process::exit(1);
        });
    }

    let issuer = SessionTokenIssuer::new(&config.jwt_secret, config.session_token_ttl_seconds);
    let bind_address = config.bind_address.clone();

    let state = Arc::new(AppState {
        config,
        registry: registry.clone(),
        issuer,
        workers: Arc::clone(&workers),
        health: Arc::clone(&health_state),
        started_at,
    });
    let app = build_routes(state, prometheus_handle);

    // Bind listener BEFORE marking ready to fail fast on bind errors
    let addr: SocketAddr = bind_address
        .parse()
        .with_context(|| format!("invalid bind address: {bind_address}"))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, "Listener bound");

    let server_shutdown = CancellationToken::new();
    let server_token = server_shutdown.clone();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(server_token.cancelled_owned())
            .await
    });

    health_state.set_ready();
    info!("Room Service running - press Ctrl+C to shutdown");

    tokio::select! {
        () = shutdown_signal() => {
            info!("Shutdown signal received, initiating graceful shutdown...");
        }
        result = &mut server => {
            // The server only returns early on an accept-loop failure
            match result {
                Ok(Ok(())) => warn!("HTTP server stopped unexpectedly"),
                Ok(Err(e)) => error!(error = %e, "HTTP server failed"),
                Err(e) => error!(error = %e, "HTTP server task failed"),
            }
            registry.cancel();
            workers.close();
            anyhow::bail!("HTTP server exited");
        }
    }

    // Mark as not ready immediately so the load balancer stops sending traffic
    health_state.set_not_ready();

    // Close every room. Members get `room-closed` and their sockets close,
    // which lets the HTTP server drain.
    match registry.shutdown(SHUTDOWN_REASON.to_string()).await {
        Ok(closed) => info!(rooms = closed, "Rooms closed"),
        Err(e) => warn!(error = %e, "Registry shutdown error"),
    }

    server_shutdown.cancel();
    match tokio::time::timeout(DRAIN_TIMEOUT, server).await {
        Ok(Ok(Ok(()))) => info!("HTTP server drained"),
        Ok(Ok(Err(e))) => warn!(error = %e, "HTTP server error during drain"),
        Ok(Err(e)) => warn!(error = %e, "HTTP server task failed during drain"),
        Err(_) => warn!(
            timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "HTTP server did not drain in time"
        ),
    }

    registry.cancel();
    workers.close();

    info!("Room Service shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. This is acceptable because
/// without signal handlers, we cannot gracefully shut down the service.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
