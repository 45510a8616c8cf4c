use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue, StatusCode},
        Error as WsError, Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::debug;

use crate::error::TransportError;

/// Opens realtime connections authenticated with an access token.
#[async_trait]
pub trait RealtimeConnector: Send + Sync {
    async fn connect(&self, access_token: &str) -> Result<Box<dyn RealtimeLink>, TransportError>;
}

/// One open realtime connection carrying JSON text frames.
#[async_trait]
pub trait RealtimeLink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;
    /// Next inbound text frame; `None` once the peer has gone away.
    async fn next_text(&mut self) -> Option<Result<String, TransportError>>;
    async fn close(&mut self);
}

pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

fn map_connect_error(err: WsError) -> TransportError {
    match err {
        WsError::Http(response) if response.status() == StatusCode::UNAUTHORIZED => {
            TransportError::Unauthorized("upgrade rejected with 401".into())
        }
        other => TransportError::Io(other.to_string()),
    }
}

#[async_trait]
impl RealtimeConnector for WebSocketConnector {
    async fn connect(&self, access_token: &str) -> Result<Box<dyn RealtimeLink>, TransportError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|err| TransportError::Io(format!("invalid realtime url {}: {err}", self.url)))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {access_token}"))
            .map_err(|_| TransportError::Unauthorized("access token is not a valid header".into()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (stream, _) = connect_async(request).await.map_err(map_connect_error)?;
        debug!(url = %self.url, "transport: websocket opened");
        Ok(Box::new(WebSocketLink { stream }))
    }
}

struct WebSocketLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl RealtimeLink for WebSocketLink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|err| TransportError::Io(err.to_string()))
    }

    async fn next_text(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Some(Ok(text)),
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Ok(_)) => continue,
                Some(Err(err)) => return Some(Err(TransportError::Io(err.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}
