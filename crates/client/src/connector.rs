//! 客户端传输抽象
//!
//! 每次连接产生一对写端和入站文本流。生产实现基于 tokio-tungstenite，
//! 测试里可以换成内存通道。

use async_trait::async_trait;
use futures_util::{
    future,
    stream::{BoxStream, SplitSink},
    SinkExt, StreamExt,
};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};

use crate::error::ClientError;

#[async_trait]
pub trait ClientTransport: Send {
    async fn send_text(&mut self, text: String) -> Result<(), ClientError>;
    async fn close(&mut self) -> Result<(), ClientError>;
}

/// 一次成功建立的连接
pub struct ClientConnection {
    pub sink: Box<dyn ClientTransport>,
    /// 入站文本帧；流结束表示对端已断开
    pub inbound: BoxStream<'static, Result<String, ClientError>>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<ClientConnection, ClientError>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// 通过 query 参数携带 token 连接服务端
pub struct WsConnector {
    url: String,
    token: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
        }
    }

    fn endpoint(&self) -> String {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{}token={}", self.url, separator, self.token)
    }
}

struct WsTransport {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl ClientTransport for WsTransport {
    async fn send_text(&mut self, text: String) -> Result<(), ClientError> {
        self.sink
            .send(Message::Text(text.into()))
            .await
            .map_err(|err| ClientError::Transport(err.to_string()))
    }

    async fn close(&mut self) -> Result<(), ClientError> {
        self.sink
            .close()
            .await
            .map_err(|err| ClientError::Transport(err.to_string()))
    }
}

fn inbound_text(
    message: Result<Message, tokio_tungstenite::tungstenite::Error>,
) -> Option<Result<String, ClientError>> {
    match message {
        Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
        Ok(Message::Close(_)) => Some(Err(ClientError::Closed)),
        Ok(_) => None,
        Err(err) => Some(Err(ClientError::Transport(err.to_string()))),
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<ClientConnection, ClientError> {
        let (stream, _response) = connect_async(self.endpoint())
            .await
            .map_err(|err| ClientError::Connect(err.to_string()))?;
        let (sink, incoming) = stream.split();

        Ok(ClientConnection {
            sink: Box::new(WsTransport { sink }),
            inbound: incoming
                .filter_map(|message| future::ready(inbound_text(message)))
                .boxed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_appended_to_query() {
        let connector = WsConnector::new("ws://127.0.0.1:8080/api/v1/ws", "abc");
        assert_eq!(connector.endpoint(), "ws://127.0.0.1:8080/api/v1/ws?token=abc");

        let connector = WsConnector::new("ws://host/ws?v=1", "abc");
        assert_eq!(connector.endpoint(), "ws://host/ws?v=1&token=abc");
    }
}
