//! WebSocket 接入
//!
//! 握手阶段完成认证，失败直接返回 401，不会创建连接。升级后把 axum 的
//! socket 拆成写端（注册表持有）和读端（会话读循环消费）。

use application::{InboundFrame, Transport, TransportError};
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use domain::UserId;
use futures_util::{future, stream::SplitSink, SinkExt, StreamExt};
use serde::Deserialize;

use crate::{error::ApiError, state::AppState};

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// axum WebSocket 写端
pub struct AxumTransport {
    sink: SplitSink<WebSocket, WsMessage>,
}

#[async_trait]
impl Transport for AxumTransport {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.sink
            .send(WsMessage::Text(text.into()))
            .await
            .map_err(|err| TransportError::Io(err.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        // 对端可能已经断开，关闭帧发送失败不影响后续清理
        let _ = self.sink.send(WsMessage::Close(None)).await;
        self.sink
            .close()
            .await
            .map_err(|err| TransportError::Io(err.to_string()))
    }
}

/// 协议层 ping/pong 由 axum 处理，不进入会话
fn inbound_frame(message: Result<WsMessage, axum::Error>) -> Option<InboundFrame> {
    match message {
        Ok(WsMessage::Text(text)) => Some(InboundFrame::Text(text.as_str().to_owned())),
        Ok(WsMessage::Binary(_)) => Some(InboundFrame::Binary),
        Ok(WsMessage::Close(_)) => Some(InboundFrame::Close),
        Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => None,
        Err(err) => Some(InboundFrame::Error(err.to_string())),
    }
}

pub async fn websocket_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let user_id = state.handler.authenticate(query.token.as_deref()).await?;
    tracing::debug!(user_id = %user_id, "websocket handshake authenticated");
    Ok(ws.on_upgrade(move |socket| websocket_handler(socket, state, user_id)))
}

async fn websocket_handler(socket: WebSocket, state: AppState, user_id: UserId) {
    let (sink, incoming) = socket.split();
    let inbound = incoming.filter_map(|message| future::ready(inbound_frame(message)));

    state
        .handler
        .serve(user_id, Box::new(AxumTransport { sink }), inbound)
        .await;
}
