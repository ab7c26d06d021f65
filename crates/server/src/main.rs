//! tabcal server
//!
//! Listens for tab-activity frames from the browser extension on a local
//! WebSocket and turns qualifying browsing sessions into calendar events.

mod calendar;
mod config;
mod logging;
mod state;
mod tracker;
mod websocket;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{response::IntoResponse, routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::calendar::{EventSink, GoogleCalendarSink};
use crate::state::AppState;
use crate::websocket::ws_handler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _logging = logging::init_logging()?;

    info!(
        component = "server",
        event = "server.starting",
        "Starting tabcal server..."
    );

    let config = config::Config::load()?;

    // A sink-less server still tracks history and logs what it would have
    // written to the calendar.
    let sink = match GoogleCalendarSink::connect(&config).await {
        Ok(sink) => Some(Arc::new(sink) as Arc<dyn EventSink>),
        Err(e) => {
            warn!(
                component = "server",
                event = "server.sink_unavailable",
                error = %e,
                "Calendar sink unavailable, qualifying sessions will be skipped"
            );
            None
        }
    };

    let state = Arc::new(AppState::new(sink));

    // The extension connects to the root path; /ws is the conventional
    // alias for other clients.
    let app = Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], 3000));
    info!(
        component = "server",
        event = "server.listening",
        %addr,
        "Listening on {}",
        addr
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_handler() -> impl IntoResponse {
    "OK"
}
