use axum::{
    extract::{Path, State},
    http::{HeaderValue, Method, StatusCode},
    middleware,
    routing::get,
    Json, Router,
};
use domain::UserId;
use serde::Serialize;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{error::ApiError, middleware::rate_limit, state::AppState, websocket::websocket_upgrade};

#[derive(Debug, Serialize)]
struct OnlineUsersResponse {
    count: usize,
    user_ids: Vec<UserId>,
}

#[derive(Debug, Serialize)]
struct OnlineStatusResponse {
    user_id: UserId,
    online: bool,
}

pub fn router(state: AppState) -> Router {
    router_with_cors(state, &["*".to_string()])
}

pub fn router_with_cors(state: AppState, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api_routes(state.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(cors_origins))
        .with_state(state)
}

fn api_routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/online", get(list_online))
        .route("/online/{user_id}", get(user_online))
        .route("/ws", get(websocket_upgrade))
        .route_layer(middleware::from_fn_with_state(state, rate_limit))
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    if origins.iter().any(|origin| origin == "*") {
        return layer.allow_origin(Any);
    }

    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    layer.allow_origin(AllowOrigin::list(parsed))
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn list_online(State(state): State<AppState>) -> Json<OnlineUsersResponse> {
    let user_ids = state.registry.list_online();
    Json(OnlineUsersResponse {
        count: user_ids.len(),
        user_ids,
    })
}

/// 本节点没有连接时再查共享的在线状态存储
async fn user_online(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
) -> Result<Json<OnlineStatusResponse>, ApiError> {
    let user_id = UserId(user_id);
    let online = state.registry.is_online(user_id) || state.presence.is_online(user_id).await?;
    Ok(Json(OnlineStatusResponse { user_id, online }))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use application::SystemClock;
    use axum::{body::Body, http::Request};
    use config::AppConfig;
    use infrastructure::{Infrastructure, MemoryChatStore};
    use tower::ServiceExt;

    use super::*;

    fn app() -> Router {
        let state = AppState::build(
            &AppConfig::default(),
            Infrastructure::in_memory(Arc::new(MemoryChatStore::new())),
            Arc::new(SystemClock),
        );
        router(state)
    }

    #[tokio::test]
    async fn health_is_ok() {
        let response = app()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn online_listing_starts_empty() {
        let response = app()
            .oneshot(Request::builder().uri("/api/v1/online").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json, serde_json::json!({"count": 0, "user_ids": []}));
    }
}
