pub mod battle;
pub mod config;
pub mod player;
pub mod room;
pub mod room_heap;
pub mod state;
pub mod ws;

use axum::Router;
use tower_http::trace::TraceLayer;

use config::ServerConfig;
use state::AppState;

/// Build the Axum router and application state from a config.
pub fn build_app(config: ServerConfig) -> (Router<()>, AppState) {
    let state = AppState::new(config);

    let app = Router::new()
        .route("/ws", axum::routing::get(ws::ws_handler))
        .route("/health", axum::routing::get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    (app, state)
}

async fn health_check() -> &'static str {
    "ok"
}
