//! Sync engine facade
//!
//! Wires the store, the companion transport and the cloud backend into the
//! operations the app drives: peer passes, inbound handling, cloud pushes, goals,
//! and recorded sessions.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::SyncSettings;
use crate::db::SyncStore;
use crate::error::{Error, Result};
use crate::models::{GoalMap, RecordId};

use super::cloud::{CloudStore, CloudSyncCoordinator, PushReport};
use super::connectivity::NetworkMonitor;
use super::events::{EventBus, SyncEvent};
use super::goals::GoalsBroadcaster;
use super::inbound::PeerInbox;
use super::merge::{MergeEngine, MergeOrigin, MergeReport};
use super::message::{Action, Message, Reply};
use super::outbound::{OutboundAgent, OutboundReport};
use super::session::{ActiveSession, FinishedSession, SessionRecorder, TelemetrySource};
use super::transport::{DeliveryOutcome, InboundPayload, PeerLink, TransportChannel};

/// What finishing a session set in motion.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub session: FinishedSession,
    pub peer: OutboundReport,
    pub cloud: PushReport,
}

pub struct SyncEngine<S, L, C> {
    store: Arc<S>,
    events: EventBus,
    network: NetworkMonitor,
    channel: TransportChannel<L>,
    outbound: OutboundAgent<S, L>,
    inbox: Arc<PeerInbox<S>>,
    merge: MergeEngine<S>,
    goals: GoalsBroadcaster<S, L>,
    cloud: Arc<CloudSyncCoordinator<S, C>>,
    sessions: SessionRecorder<S>,
}

impl<S: SyncStore, L: PeerLink, C: CloudStore> SyncEngine<S, L, C> {
    pub fn new(
        store: Arc<S>,
        link: Arc<L>,
        cloud: Arc<C>,
        network: NetworkMonitor,
        settings: &SyncSettings,
    ) -> Self {
        let events = EventBus::new();
        let channel = TransportChannel::new(link, settings.direct_timeout);
        Self {
            outbound: OutboundAgent::new(Arc::clone(&store), channel.clone(), settings),
            inbox: Arc::new(PeerInbox::new(Arc::clone(&store), events.clone(), settings)),
            merge: MergeEngine::new(Arc::clone(&store), events.clone()),
            goals: GoalsBroadcaster::new(
                Arc::clone(&store),
                channel.clone(),
                events.clone(),
                settings.goals_mode,
            ),
            cloud: Arc::new(CloudSyncCoordinator::new(
                Arc::clone(&store),
                cloud,
                events.clone(),
                network.clone(),
                settings,
            )),
            sessions: SessionRecorder::new(Arc::clone(&store), events.clone(), settings),
            store,
            events,
            network,
            channel,
        }
    }

    pub const fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub const fn network(&self) -> &NetworkMonitor {
        &self.network
    }

    pub const fn outbound(&self) -> &OutboundAgent<S, L> {
        &self.outbound
    }

    pub const fn cloud(&self) -> &Arc<CloudSyncCoordinator<S, C>> {
        &self.cloud
    }

    /// Forward captured local changes to the companion.
    pub async fn sync_peer(&self) -> Result<OutboundReport> {
        self.outbound.sync_pass().await
    }

    /// Handle one raw payload from the companion.
    pub async fn handle_peer_payload(&self, payload: &[u8]) -> Reply {
        self.inbox.receive(payload).await
    }

    /// Handle every payload already waiting on `endpoint`.
    pub async fn drain_peer(&self, endpoint: &mut mpsc::UnboundedReceiver<InboundPayload>) -> usize {
        self.inbox.drain(endpoint).await
    }

    /// Serve companion payloads in the background until `shutdown` flips.
    pub fn spawn_peer_server(
        &self,
        endpoint: mpsc::UnboundedReceiver<InboundPayload>,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let inbox = Arc::clone(&self.inbox);
        tokio::spawn(async move { inbox.serve(endpoint, shutdown).await })
    }

    /// Run the cloud coordinator in the background until `shutdown` flips.
    pub fn spawn_cloud(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<Result<()>> {
        tokio::spawn(Arc::clone(&self.cloud).run(shutdown))
    }

    /// Re-send every subgraph to the companion, ignoring the resend window.
    pub async fn request_full_resync(&self) -> Result<OutboundReport> {
        self.outbound.resend_all().await
    }

    /// Pull every workout the companion holds.
    pub async fn request_all_workouts(&self) -> Result<MergeReport> {
        self.request_all(Action::RequestAllWorkouts).await
    }

    /// Pull every template the companion holds.
    pub async fn request_all_templates(&self) -> Result<MergeReport> {
        self.request_all(Action::RequestAllTemplates).await
    }

    async fn request_all(&self, action: Action) -> Result<MergeReport> {
        let reply = self.channel.request(&Message::action(action)).await?;
        if !reply.is_ok() {
            return Err(reply.rejection());
        }
        let payload = reply.payload.ok_or_else(|| {
            Error::MalformedMessage(format!("{} reply has no payload", action.as_str()))
        })?;
        let Message::Changes { changes } = serde_json::from_value(payload)
            .map_err(|error| Error::MalformedMessage(format!("invalid export payload: {error}")))?
        else {
            return Err(Error::MalformedMessage(format!(
                "{} reply is not a changes message",
                action.as_str()
            )));
        };
        self.merge.apply_wire(changes, MergeOrigin::Peer).await
    }

    /// Ask the companion to run an action, without waiting for its result.
    pub async fn send_action(&self, action: Action, id: Option<RecordId>) -> Result<DeliveryOutcome> {
        let message = Message::Action {
            action,
            id: id.map(|id| id.to_string()),
        };
        self.channel.deliver(&message).await
    }

    /// Round-trip a test message over the direct path.
    pub async fn ping(&self, nonce: impl Into<String>) -> Result<Reply> {
        self.channel
            .request(&Message::Test {
                nonce: Some(nonce.into()),
            })
            .await
    }

    pub async fn goals(&self) -> Result<GoalMap> {
        self.goals.goals().await
    }

    pub async fn set_goal(&self, exercise: &str, target_seconds: u32) -> Result<GoalMap> {
        self.goals.set_goal(exercise, target_seconds).await
    }

    pub async fn broadcast_goals(&self) -> Result<DeliveryOutcome> {
        self.goals.broadcast().await
    }

    /// Push pending subgraphs to the cloud.
    pub async fn push_cloud(&self) -> Result<PushReport> {
        self.cloud.push_pending().await
    }

    pub async fn start_session(
        &self,
        workout_id: RecordId,
        source: Arc<dyn TelemetrySource>,
    ) -> Result<ActiveSession<S>> {
        self.sessions.start(workout_id, source).await
    }

    /// Finish a session, then sync it to the companion and the cloud.
    ///
    /// The final write is committed before either push starts.
    pub async fn finish_session(&self, session: ActiveSession<S>) -> Result<SessionSummary> {
        let session = session.finish().await?;
        let peer = self.sync_peer().await?;
        let cloud = self.push_cloud().await?;
        Ok(SessionSummary {
            session,
            peer,
            cloud,
        })
    }
}
