//! Broadcast relay for the global chat and call room.

pub mod config;
pub mod room;
pub mod websocket;

use std::future::Future;

use axum::Router;
use axum::routing::get;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use config::RelayConfig;
pub use room::Room;

pub const ROOM_PATH: &str = "/ws/chat/global/";

pub fn router(room: Room) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route(ROOM_PATH, get(websocket::websocket_handler))
        .with_state(room)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Serves the relay on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    room: Room,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    axum::serve(listener, router(room))
        .with_graceful_shutdown(shutdown)
        .await
}
