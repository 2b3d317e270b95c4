use async_trait::async_trait;
use futures_util::StreamExt;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use url::Url;

/// Raw bytes of one inbound frame, before decoding.
pub type Frame = Vec<u8>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("transport error: {0}")]
    Other(String),
}

/// Opens links to the gateway. One link per connect attempt.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self, endpoint: &Url) -> Result<Box<dyn Link>, TransportError>;
}

/// An established connection.
#[async_trait]
pub trait Link: Send {
    /// `None` once the remote side has closed the link.
    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>>;

    async fn close(&mut self);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WsTransport;

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, endpoint: &Url) -> Result<Box<dyn Link>, TransportError> {
        let (ws, _response) = connect_async(endpoint.as_str()).await?;
        Ok(Box::new(WsLink { ws }))
    }
}

struct WsLink {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Link for WsLink {
    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>> {
        loop {
            match self.ws.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.into_bytes())),
                Ok(Message::Binary(bytes)) => return Some(Ok(bytes)),
                Ok(Message::Close(_)) => return None,
                // ping/pong are answered by tungstenite itself
                Ok(_) => continue,
                Err(err) => return Some(Err(err.into())),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.ws.close(None).await;
    }
}
