//! Sync engine: replication between this device, its companion, and the cloud
//!
//! - Local writes are captured by the store and forwarded to the companion by the
//!   outbound agent, one message per subgraph.
//! - Companion messages arrive through the peer inbox and are applied by the
//!   merge engine in a single transaction per pass.
//! - The cloud coordinator pushes pending subgraphs as whole documents and merges
//!   remote snapshots through the conflict resolver.

mod capture;
pub mod cloud;
mod conflict;
mod connectivity;
mod engine;
mod events;
mod goals;
mod inbound;
mod loopback;
mod merge;
mod message;
mod outbound;
mod session;
mod transport;


pub use capture::{CaptureBatch, ChangeCaptureLog, PEER_AUTHORS};
pub use conflict::{ConflictResolver, Resolution, VersionResolver, VersionStamp};
pub use connectivity::NetworkMonitor;
pub use engine::{SessionSummary, SyncEngine};
pub use events::{ChangeSource, EventBus, SyncEvent};
pub use goals::{apply_goals, set_local_goal, GoalsBroadcaster};
pub use inbound::PeerInbox;
pub use loopback::{LinkStats, LoopbackEndpoint, LoopbackLink};
pub use merge::{coalesce, MergeEngine, MergeOrigin, MergeReport};
pub use message::{Action, Message, Reply, ReplyStatus, WireChange};
pub use outbound::{OutboundAgent, OutboundReport, SendOutcome, PEER_CONSUMER};
pub use session::{ActiveSession, FinishedSession, SessionRecorder, TelemetryReading, TelemetrySource};
pub use transport::{DeliveryMode, DeliveryOutcome, InboundPayload, PeerLink, TransportChannel};
