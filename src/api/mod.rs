//! HTTP API surface (spec.md §6): a thin read/command layer translating
//! Store queries and Session commands into JSON responses. Auth/CSRF
//! middleware, argument-parsing niceties beyond the contract table, and the
//! browser UI are explicitly out of scope (spec.md §1) — this module only
//! builds the router and the handlers that back it.

pub mod dto;
pub mod handlers;

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::session::SessionHandle;
use crate::store::Store;

/// Shared state every handler reads from. Cheap to clone (all fields are
/// already `Clone`/`Arc`-backed); wrapped once more in `Arc` so axum's
/// `State` extractor hands out references instead of copies.
pub struct AppState {
    pub store: Store,
    pub session: SessionHandle,
    pub radio_endpoint: String,
    /// Keys written through `POST /api/settings` so `GET /api/settings` can
    /// list them back; the Store's `settings` table also holds internal
    /// scheduler bookkeeping this surface shouldn't expose.
    pub exposed_setting_keys: Mutex<Vec<String>>,
}

pub fn build_router(store: Store, session: SessionHandle, radio_endpoint: String) -> Router {
    let state = Arc::new(AppState {
        store,
        session,
        radio_endpoint,
        exposed_setting_keys: Mutex::new(Vec::new()),
    });

    Router::new()
        .route("/api/config", get(handlers::get_config))
        .route("/api/connection", get(handlers::get_connection))
        .route("/api/connection/disconnect", post(handlers::post_disconnect))
        .route("/api/connection/reconnect", post(handlers::post_reconnect))
        .route("/api/nodes", get(handlers::list_nodes))
        .route("/api/nodes/refresh", post(handlers::refresh_nodes))
        .route("/api/nodes/:id/favorite", post(handlers::set_favorite))
        .route("/api/nodes/:id/position-history", get(handlers::position_history))
        .route("/api/messages", get(handlers::list_messages))
        .route("/api/messages/send", post(handlers::send_message))
        .route("/api/messages/read", post(handlers::mark_read))
        .route("/api/channels", get(handlers::list_channels))
        .route("/api/traceroutes/recent", get(handlers::recent_traceroutes))
        .route("/api/traceroute", post(handlers::request_traceroute))
        .route("/api/neighbor-info", get(handlers::neighbor_info))
        .route("/api/telemetry/available/nodes", get(handlers::telemetry_available_nodes))
        .route("/api/poll", get(handlers::poll))
        .route("/api/settings", get(handlers::get_settings).post(handlers::post_settings))
        .route("/api/purge/nodes", post(handlers::purge_nodes))
        .route("/api/purge/messages", post(handlers::purge_messages))
        .route("/api/purge/telemetry", post(handlers::purge_telemetry))
        .route("/api/device/reboot", post(handlers::reboot_device))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RadioConfig;
    use crate::session::DeviceSession;
    use axum::body::Body;
    use axum::http::Request;
    use tempfile::tempdir;
    use tower::ServiceExt;

    async fn test_app() -> Router {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("api_test.db")).unwrap();
        let (session, _packet_rx) = DeviceSession::new(RadioConfig::default());
        let handle = session.handle();
        build_router(store, handle, "192.168.1.1:4403".to_string())
    }

    #[tokio::test]
    async fn channels_excludes_role_zero() {
        let app = test_app().await;
        let resp = app
            .oneshot(Request::builder().uri("/api/channels").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), axum::http::StatusCode::OK);
    }

    #[tokio::test]
    async fn connection_reports_disconnected_before_any_session_activity() {
        let app = test_app().await;
        let resp = app
            .oneshot(Request::builder().uri("/api/connection").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), axum::http::StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["connected"], false);
    }
}
