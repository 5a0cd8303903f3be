//! Web API 层。
//!
//! 提供 Axum 路由：WebSocket 握手接入实时通道，在线状态查询接口，以及
//! 作用于所有 API 请求的限流中间件。

mod auth;
mod error;
mod middleware;
mod routes;
mod state;
mod websocket;

pub use auth::{Claims, JwtService};
pub use config::JwtConfig;
pub use error::{ApiError, ErrorBody};
pub use middleware::classify;
pub use routes::{router, router_with_cors};
pub use state::AppState;
pub use websocket::AxumTransport;
