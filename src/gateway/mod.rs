pub mod handler;

pub use handler::AppState;

use axum::Router;
use axum::middleware;
use axum::routing::{get, post};
use std::sync::Arc;

pub fn router(state: Arc<AppState>) -> Router {
    let api_routes = Router::new()
        .route("/api/v1/quota", get(handler::handle_quota))
        .route("/api/v1/quota/toggle", post(handler::handle_toggle))
        .route("/api/v1/channels/{id}", get(handler::handle_channel))
        .route("/api/v1/videos", get(handler::handle_videos))
        .route("/api/v1/videos/{id}", get(handler::handle_video))
        .route("/api/v1/search/channel", get(handler::handle_search_channel))
        .route(
            "/api/v1/playlists/{id}/items",
            get(handler::handle_playlist_items),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            handler::log_requests,
        ))
        .with_state(state);

    Router::new()
        .route("/health", get(handler::handle_health))
        .merge(api_routes)
}
