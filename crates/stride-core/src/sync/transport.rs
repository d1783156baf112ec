//! Transport channel to the companion device
//!
//! Two delivery modes sit behind one `PeerLink`: a direct request/reply path
//! that only works while the peer is reachable, and a queued path that stores
//! the payload and forwards it later.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::error::{Error, Result};

use super::message::{Message, Reply};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Immediate request/reply, requires reachability
    Direct,
    /// Store-and-forward, delivered eventually
    Queued,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Delivered(Reply),
    Queued,
}

impl DeliveryOutcome {
    pub const fn mode(&self) -> DeliveryMode {
        match self {
            Self::Delivered(_) => DeliveryMode::Direct,
            Self::Queued => DeliveryMode::Queued,
        }
    }

    /// Fails when the peer answered a direct delivery with an error reply.
    pub fn accepted(self) -> Result<Self> {
        match &self {
            Self::Delivered(reply) if !reply.is_ok() => Err(reply.rejection()),
            _ => Ok(self),
        }
    }
}

/// A payload arriving at the receiving side of a link.
///
/// Direct deliveries carry a reply slot; queued ones do not.
#[derive(Debug)]
pub struct InboundPayload {
    pub payload: Vec<u8>,
    pub reply: Option<oneshot::Sender<Vec<u8>>>,
}

/// Raw byte link to the companion device.
#[async_trait]
pub trait PeerLink: Send + Sync + 'static {
    /// Whether the direct path can currently be attempted.
    fn is_reachable(&self) -> bool;

    /// Deliver on the direct path and wait for the encoded reply.
    async fn send_direct(&self, payload: Vec<u8>) -> Result<Vec<u8>>;

    /// Hand the payload to the store-and-forward queue.
    async fn enqueue(&self, payload: Vec<u8>) -> Result<()>;
}

/// Encodes messages and picks a delivery mode.
pub struct TransportChannel<L> {
    link: Arc<L>,
    direct_timeout: Duration,
}

impl<L> Clone for TransportChannel<L> {
    fn clone(&self) -> Self {
        Self {
            link: Arc::clone(&self.link),
            direct_timeout: self.direct_timeout,
        }
    }
}

impl<L: PeerLink> TransportChannel<L> {
    pub const fn new(link: Arc<L>, direct_timeout: Duration) -> Self {
        Self {
            link,
            direct_timeout,
        }
    }

    pub fn is_reachable(&self) -> bool {
        self.link.is_reachable()
    }

    /// Send using exactly one mode.
    pub async fn send(&self, message: &Message, mode: DeliveryMode) -> Result<DeliveryOutcome> {
        let payload = message.encode()?;
        match mode {
            DeliveryMode::Direct => self.send_direct(payload).await.map(DeliveryOutcome::Delivered),
            DeliveryMode::Queued => {
                self.link.enqueue(payload).await?;
                Ok(DeliveryOutcome::Queued)
            }
        }
    }

    /// Try the direct path first, fall back to the queue.
    ///
    /// Fails only when both modes fail.
    pub async fn deliver(&self, message: &Message) -> Result<DeliveryOutcome> {
        let payload = message.encode()?;

        if self.link.is_reachable() {
            match self.send_direct(payload.clone()).await {
                Ok(reply) => return Ok(DeliveryOutcome::Delivered(reply)),
                Err(error) => {
                    tracing::warn!(kind = message.kind(), %error, "direct delivery failed, queueing");
                }
            }
        }

        self.link.enqueue(payload).await.map_err(|error| {
            Error::TransportUnavailable(format!("both delivery modes failed: {error}"))
        })?;
        tracing::debug!(kind = message.kind(), "message queued for later delivery");
        Ok(DeliveryOutcome::Queued)
    }

    /// Direct request whose reply the caller needs.
    pub async fn request(&self, message: &Message) -> Result<Reply> {
        self.send_direct(message.encode()?).await
    }

    async fn send_direct(&self, payload: Vec<u8>) -> Result<Reply> {
        if !self.link.is_reachable() {
            return Err(Error::TransportUnavailable("peer is not reachable".to_string()));
        }
        let bytes = tokio::time::timeout(self.direct_timeout, self.link.send_direct(payload))
            .await
            .map_err(|_| {
                Error::TransportUnavailable(format!(
                    "no reply within {}ms",
                    self.direct_timeout.as_millis()
                ))
            })??;
        Reply::decode(&bytes)
    }
}
