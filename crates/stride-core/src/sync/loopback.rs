//! In-process peer link
//!
//! Connects two engines in the same process. Used by the `mirror` command and
//! the sync tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};

use super::transport::{InboundPayload, PeerLink};

/// Send counters, per delivery mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub direct: usize,
    pub queued: usize,
}

/// Sending half of a one-way in-process link.
pub struct LoopbackLink {
    reachable: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<InboundPayload>,
    direct_sent: AtomicUsize,
    queued_sent: AtomicUsize,
}

/// Receiving half of a [`LoopbackLink`].
pub type LoopbackEndpoint = mpsc::UnboundedReceiver<InboundPayload>;

impl LoopbackLink {
    /// One-way link and the endpoint its payloads arrive on.
    pub fn channel() -> (Self, LoopbackEndpoint) {
        let (tx, rx) = mpsc::unbounded_channel();
        let link = Self {
            reachable: Arc::new(AtomicBool::new(true)),
            tx,
            direct_sent: AtomicUsize::new(0),
            queued_sent: AtomicUsize::new(0),
        };
        (link, rx)
    }

    /// Two links sharing one reachability flag, for devices `a` and `b`.
    ///
    /// Returns `((a_to_b, b_inbox), (b_to_a, a_inbox))`.
    pub fn pair() -> ((Self, LoopbackEndpoint), (Self, LoopbackEndpoint)) {
        let (a_to_b, b_inbox) = Self::channel();
        let (mut b_to_a, a_inbox) = Self::channel();
        b_to_a.reachable = Arc::clone(&a_to_b.reachable);
        ((a_to_b, b_inbox), (b_to_a, a_inbox))
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn stats(&self) -> LinkStats {
        LinkStats {
            direct: self.direct_sent.load(Ordering::SeqCst),
            queued: self.queued_sent.load(Ordering::SeqCst),
        }
    }
}

#[async_trait]
impl PeerLink for LoopbackLink {
    fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    async fn send_direct(&self, payload: Vec<u8>) -> Result<Vec<u8>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(InboundPayload {
                payload,
                reply: Some(reply_tx),
            })
            .map_err(|_| Error::TransportUnavailable("peer endpoint closed".to_string()))?;
        self.direct_sent.fetch_add(1, Ordering::SeqCst);

        reply_rx
            .await
            .map_err(|_| Error::TransportUnavailable("peer dropped the request".to_string()))
    }

    async fn enqueue(&self, payload: Vec<u8>) -> Result<()> {
        self.tx
            .send(InboundPayload {
                payload,
                reply: None,
            })
            .map_err(|_| Error::TransportUnavailable("peer queue closed".to_string()))?;
        self.queued_sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::message::{Message, Reply};
    use crate::sync::transport::{DeliveryOutcome, TransportChannel};
    use std::time::Duration;

    fn echo_server(mut endpoint: LoopbackEndpoint) -> tokio::task::JoinHandle<usize> {
        tokio::spawn(async move {
            let mut received = 0;
            while let Some(inbound) = endpoint.recv().await {
                received += 1;
                if let Some(reply) = inbound.reply {
                    let _ = reply.send(Reply::ok("test", None).encode().unwrap());
                }
            }
            received
        })
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_deliver_prefers_direct() {
        let (link, endpoint) = LoopbackLink::channel();
        let server = echo_server(endpoint);
        let link = Arc::new(link);
        let channel = TransportChannel::new(Arc::clone(&link), Duration::from_secs(1));

        let outcome = channel.deliver(&Message::Test { nonce: None }).await.unwrap();

        assert_eq!(outcome, DeliveryOutcome::Delivered(Reply::ok("test", None)));
        assert_eq!(link.stats(), LinkStats { direct: 1, queued: 0 });
        drop(channel);
        drop(link);
        assert_eq!(server.await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_deliver_queues_when_unreachable() {
        let (link, mut endpoint) = LoopbackLink::channel();
        link.set_reachable(false);
        let link = Arc::new(link);
        let channel = TransportChannel::new(Arc::clone(&link), Duration::from_secs(1));

        let outcome = channel.deliver(&Message::Test { nonce: None }).await.unwrap();

        assert_eq!(outcome, DeliveryOutcome::Queued);
        assert_eq!(link.stats(), LinkStats { direct: 0, queued: 1 });
        let inbound = endpoint.recv().await.unwrap();
        assert!(inbound.reply.is_none());
        assert_eq!(
            Message::decode(&inbound.payload).unwrap(),
            Message::Test { nonce: None }
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unanswered_direct_times_out_then_queues() {
        let (link, mut endpoint) = LoopbackLink::channel();
        let link = Arc::new(link);
        let channel = TransportChannel::new(Arc::clone(&link), Duration::from_millis(50));

        let outcome = channel.deliver(&Message::Test { nonce: None }).await.unwrap();

        assert_eq!(outcome, DeliveryOutcome::Queued);
        assert_eq!(link.stats(), LinkStats { direct: 1, queued: 1 });
        let _direct = endpoint.recv().await.unwrap();
        let queued = endpoint.recv().await.unwrap();
        assert!(queued.reply.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_both_modes_failing_is_transport_unavailable() {
        let (link, endpoint) = LoopbackLink::channel();
        drop(endpoint);
        let channel = TransportChannel::new(Arc::new(link), Duration::from_millis(50));

        let error = channel.deliver(&Message::Test { nonce: None }).await.unwrap_err();

        assert!(matches!(error, Error::TransportUnavailable(_)));
    }

    #[test]
    fn test_pair_shares_reachability() {
        let ((a_to_b, _b_inbox), (b_to_a, _a_inbox)) = LoopbackLink::pair();
        a_to_b.set_reachable(false);
        assert!(!b_to_a.is_reachable());
    }
}
