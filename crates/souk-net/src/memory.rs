//! In-process transport.
//!
//! [`memory_transport`] returns a connector and the hub side that accepts its
//! connections. Every successful `connect` yields a [`MemoryPeer`] on the hub
//! side, which can push frames to the client, read what the client sent, and
//! drop the link to simulate a network failure. Used by the test suites and
//! by embedders that run the hub in the same process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use serde_json::Value;

use souk_shared::{Frame, Identity};

use crate::error::{NetError, Result};
use crate::transport::{Connector, Link};

/// Create a connected connector/hub pair.
pub fn memory_transport() -> (MemoryConnector, MemoryHub) {
    let (accept_tx, accept_rx) = mpsc::unbounded();
    let refusing = Arc::new(AtomicBool::new(false));
    (
        MemoryConnector {
            accept_tx,
            refusing: refusing.clone(),
        },
        MemoryHub {
            accept_rx,
            refusing,
        },
    )
}

#[derive(Clone)]
pub struct MemoryConnector {
    accept_tx: mpsc::UnboundedSender<MemoryPeer>,
    refusing: Arc<AtomicBool>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, identity: &Identity) -> Result<Link> {
        if self.refusing.load(Ordering::SeqCst) {
            return Err(NetError::Transport("connection refused".into()));
        }

        let (to_client_tx, to_client_rx) = mpsc::unbounded::<Result<String>>();
        let (to_hub_tx, to_hub_rx) = mpsc::unbounded::<String>();

        let peer = MemoryPeer {
            identity: identity.clone(),
            to_client: to_client_tx,
            from_client: to_hub_rx,
        };
        self.accept_tx
            .unbounded_send(peer)
            .map_err(|_| NetError::Transport("hub is gone".into()))?;

        Ok(Link {
            sink: Box::pin(to_hub_tx.sink_map_err(|_| NetError::Closed)),
            stream: Box::pin(to_client_rx),
        })
    }
}

/// Accepting side of the in-process transport.
pub struct MemoryHub {
    accept_rx: mpsc::UnboundedReceiver<MemoryPeer>,
    refusing: Arc<AtomicBool>,
}

impl MemoryHub {
    /// Wait for the next client connection.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.accept_rx.next().await
    }

    /// Make every subsequent `connect` fail until switched back.
    pub fn refuse_connections(&self, refuse: bool) {
        self.refusing.store(refuse, Ordering::SeqCst);
    }
}

/// Hub-side view of one client connection.
pub struct MemoryPeer {
    pub identity: Identity,
    to_client: mpsc::UnboundedSender<Result<String>>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl MemoryPeer {
    /// Push an event to the client. Returns false once the client is gone.
    pub fn send_event(&self, event: &str, data: Value) -> bool {
        match Frame::new(event, data).to_text() {
            Ok(text) => self.send_text(text),
            Err(_) => false,
        }
    }

    /// Push a raw text frame, which need not be valid JSON.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.to_client.unbounded_send(Ok(text.into())).is_ok()
    }

    /// Next frame the client sent, `None` once it hung up.
    pub async fn recv_frame(&mut self) -> Option<Frame> {
        loop {
            let text = self.from_client.next().await?;
            if let Ok(frame) = Frame::from_text(&text) {
                return Some(frame);
            }
        }
    }

    /// Drop the link as a network failure would.
    pub fn disconnect(self) {
        let _ = self
            .to_client
            .unbounded_send(Err(NetError::Transport("connection reset".into())));
    }
}
