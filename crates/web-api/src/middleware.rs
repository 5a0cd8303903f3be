use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use application::{Actor, ResourceClass};
use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};

use crate::{error::ApiError, state::AppState};

/// 按路径选择限流档位
pub fn classify(path: &str) -> ResourceClass {
    if path.contains("/auth/") || path.ends_with("/auth") {
        ResourceClass::Auth
    } else if path.contains("/upload") {
        ResourceClass::Upload
    } else {
        ResourceClass::General
    }
}

/// 已认证请求按用户限流，其余按客户端 IP
fn actor_for(state: &AppState, request: &Request) -> Actor {
    if let Some(Ok(user_id)) = state.jwt_service.user_from_headers(request.headers()) {
        return Actor::User(user_id);
    }

    let ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    Actor::Ip(ip)
}

pub async fn rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let class = classify(request.uri().path());
    let actor = actor_for(&state, &request);

    if !state.limiter.allow(&actor, class) {
        tracing::debug!(actor = %actor, class = ?class, path = %request.uri().path(), "request rate limited");
        return Err(ApiError::too_many_requests(format!(
            "too many requests for {:?} resources",
            class
        )));
    }

    Ok(next.run(request).await)
}
