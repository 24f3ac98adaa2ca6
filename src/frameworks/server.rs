// Framework bootstrap for the room server runtime.

use crate::domain::PlayField;
use crate::frameworks::config;
use crate::interface_adapters::bus::Bus;
use crate::interface_adapters::net::{list_rooms_handler, room_route_handler, ws_handler};
use crate::interface_adapters::state::AppState;
use crate::use_cases::{CoordinatorSettings, RegistrySettings, RoomRegistry};

use axum::{Router, routing::get};
use std::net::SocketAddr;
use std::{io::Result, sync::Arc};

fn init_runtime() {
    let _ = dotenvy::dotenv();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let json = matches!(std::env::var("LOG_FORMAT").as_deref(), Ok("json"));
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .json()
            .with_current_span(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .init();
    }

    std::panic::set_hook(Box::new(|info| {
        let backtrace = std::backtrace::Backtrace::capture();
        tracing::error!(%info, ?backtrace, "panic");
    }));
}

pub async fn run(listener: tokio::net::TcpListener) -> Result<()> {
    let address = listener.local_addr()?;
    // build state
    let state = build_state();
    let registry = state.registry.clone();

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/rooms", get(list_rooms_handler))
        .route("/rooms/{room_code}", get(room_route_handler))
        .with_state(state);

    tracing::info!(%address, "listening");

    // Serve app and report errors rather than panicking
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .inspect_err(|e| {
            tracing::error!(error = %e, "server error");
        });

    // Let every coordinator publish its termination before the process exits.
    registry.shutdown(config::SHUTDOWN_TIMEOUT).await;
    tracing::info!("server stopped");
    served
}

pub async fn run_with_config() -> Result<()> {
    init_runtime();

    let address = SocketAddr::from(([127, 0, 0, 1], config::http_port()));

    // Bind TCP listener with error handling
    let listener = tokio::net::TcpListener::bind(address)
        .await
        .inspect_err(|e| {
            tracing::error!(%address, error = %e, "failed to bind");
        })?;

    run(listener).await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

fn build_state() -> Arc<AppState> {
    let field = PlayField {
        width: config::FIELD_WIDTH,
        height: config::FIELD_HEIGHT,
        step: config::FIELD_STEP,
    };
    let settings = RegistrySettings {
        max_rooms: config::max_rooms(),
        lifecycle_capacity: config::LIFECYCLE_CHANNEL_CAPACITY,
        coordinator: CoordinatorSettings {
            tick_interval: config::tick_interval(),
            grace_broadcasts: config::removal_grace_ticks(),
            idle_timeout: config::room_idle_timeout(),
            inbox_capacity: config::ROOM_INBOX_CAPACITY,
            field,
        },
    };
    tracing::debug!(
        max_rooms = settings.max_rooms,
        tick_ms = settings.coordinator.tick_interval.as_millis() as u64,
        grace_broadcasts = settings.coordinator.grace_broadcasts,
        "room settings configured"
    );

    // Setup Room Registry
    // This owns the set of active room coordinators.
    let bus = Bus::new(config::BUS_CHANNEL_CAPACITY);
    let registry = RoomRegistry::start(bus.clone(), settings);

    Arc::new(AppState {
        registry,
        bus,
        field,
        end_navigation_delay: config::end_navigation_delay(),
    })
}
