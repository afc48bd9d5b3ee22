//! WebSocket transport seam.
//!
//! The resilience manager only ever sees [`StreamTransport`] and [`StreamConnection`], so
//! reconnect and health-check behaviour can be driven against an in-memory transport.

use crate::exchanges::error::{GatewayError, GatewayResult};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// Frame exchanged over a streaming connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsFrame {
    Text(String),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

/// One open socket
#[async_trait]
pub trait StreamConnection: Send {
    async fn send(&mut self, frame: WsFrame) -> GatewayResult<()>;

    /// Next inbound frame; `None` once the stream has ended
    async fn recv(&mut self) -> Option<GatewayResult<WsFrame>>;

    async fn close(&mut self);
}

/// Opens sockets. One transport is shared by every connection of an adapter.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    async fn open(&self, exchange: &str, url: &str) -> GatewayResult<Box<dyn StreamConnection>>;
}

/// Production transport on top of tokio-tungstenite
#[derive(Debug, Default, Clone, Copy)]
pub struct TungsteniteTransport;

#[async_trait]
impl StreamTransport for TungsteniteTransport {
    async fn open(&self, exchange: &str, url: &str) -> GatewayResult<Box<dyn StreamConnection>> {
        let (stream, _response) = connect_async(url).await.map_err(|e| {
            GatewayError::network(exchange, format!("websocket handshake failed: {}", e))
        })?;
        Ok(Box::new(TungsteniteConnection {
            exchange: exchange.to_string(),
            stream,
        }))
    }
}

struct TungsteniteConnection {
    exchange: String,
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl StreamConnection for TungsteniteConnection {
    async fn send(&mut self, frame: WsFrame) -> GatewayResult<()> {
        let message = match frame {
            WsFrame::Text(text) => Message::Text(text),
            WsFrame::Ping(payload) => Message::Ping(payload),
            WsFrame::Pong(payload) => Message::Pong(payload),
            WsFrame::Close => Message::Close(None),
        };
        self.stream
            .send(message)
            .await
            .map_err(|e| GatewayError::network(&self.exchange, format!("websocket send failed: {}", e)))
    }

    async fn recv(&mut self) -> Option<GatewayResult<WsFrame>> {
        loop {
            let frame = match self.stream.next().await? {
                Ok(Message::Text(text)) => WsFrame::Text(text),
                // some venues compress nothing but still use binary frames for JSON
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => WsFrame::Text(text),
                    Err(_) => continue,
                },
                Ok(Message::Ping(payload)) => WsFrame::Ping(payload),
                Ok(Message::Pong(payload)) => WsFrame::Pong(payload),
                Ok(Message::Close(_)) => WsFrame::Close,
                Ok(Message::Frame(_)) => continue,
                Err(e) => {
                    return Some(Err(GatewayError::network(
                        &self.exchange,
                        format!("websocket read failed: {}", e),
                    )))
                }
            };
            return Some(Ok(frame));
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}
