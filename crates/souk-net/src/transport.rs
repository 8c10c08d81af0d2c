//! Transport seam for the live channel.
//!
//! The connection task only ever sees a [`Link`]: a sink of outbound text
//! frames and a stream of inbound ones. [`WsConnector`] produces links over
//! a real WebSocket; [`crate::memory`] produces in-process links.

use std::pin::Pin;

use async_trait::async_trait;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue, Request};
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use souk_shared::constants::IDENTITY_QUERY_PARAM;
use souk_shared::Identity;

use crate::error::{NetError, Result};

pub type FrameSink = Pin<Box<dyn Sink<String, Error = NetError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Both halves of one established connection.
pub struct Link {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Dials the hub on behalf of an identity.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, identity: &Identity) -> Result<Link>;
}

/// WebSocket connector. The identity travels as the `userId` query
/// parameter and, when present, as a bearer token.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn build_request(&self, identity: &Identity) -> Result<Request<()>> {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        let url = format!(
            "{}{}{}={}",
            self.url,
            separator,
            IDENTITY_QUERY_PARAM,
            urlencoding::encode(identity.user_id.as_str())
        );

        let mut request = url
            .into_client_request()
            .map_err(|e| NetError::InvalidRequest(e.to_string()))?;

        if let Some(token) = &identity.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| NetError::InvalidRequest(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        Ok(request)
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, identity: &Identity) -> Result<Link> {
        let request = self.build_request(identity)?;
        debug!(url = %self.url, user = %identity.user_id.short(), "Dialing hub");

        let (ws, _response) = connect_async(request)
            .await
            .map_err(|e| NetError::Transport(e.to_string()))?;
        let (write, read) = ws.split();

        let sink = write
            .sink_map_err(|e| NetError::Transport(e.to_string()))
            .with(|text: String| future::ready(Ok::<_, NetError>(Message::Text(text))));

        // Only text frames carry events; pings are answered by tungstenite.
        let stream = read.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Close(_)) => Some(Err(NetError::Closed)),
                Ok(_) => None,
                Err(e) => Some(Err(NetError::Transport(e.to_string()))),
            })
        });

        Ok(Link {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}
