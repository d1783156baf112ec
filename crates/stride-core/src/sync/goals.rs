//! Goals broadcaster: exercise name to target seconds, mirrored on both devices

use std::sync::Arc;

use crate::config::GoalsReplaceMode;
use crate::db::{on_store, Author, SyncStore};
use crate::error::{Error, Result};
use crate::models::GoalMap;

use super::events::{EventBus, SyncEvent};
use super::message::Message;
use super::transport::{DeliveryOutcome, PeerLink, TransportChannel};

/// Store a received goals snapshot and announce it.
///
/// Returns the number of goals held afterwards.
pub async fn apply_goals<S: SyncStore>(
    store: &Arc<S>,
    events: &EventBus,
    goals: GoalMap,
    mode: GoalsReplaceMode,
) -> Result<usize> {
    let received = goals.len();
    let count = on_store(store, move |store| {
        store.transaction(Author::Peer, |tx| match mode {
            GoalsReplaceMode::Replace => tx.replace_goals(&goals),
            GoalsReplaceMode::Merge => tx.merge_goals(&goals),
        })?;
        Ok(store.load_goals()?.len())
    })
    .await?;

    tracing::info!(received, count, ?mode, "goals updated from companion");
    events.publish(SyncEvent::GoalsReplaced { count });
    Ok(count)
}

/// Set one local goal, keeping every other entry. Does not broadcast.
///
/// Returns the full goals map afterwards.
pub async fn set_local_goal<S: SyncStore>(
    store: &Arc<S>,
    exercise: &str,
    target_seconds: u32,
) -> Result<GoalMap> {
    let exercise = exercise.trim().to_string();
    if exercise.is_empty() {
        return Err(Error::InvalidInput("Goal exercise name cannot be empty".into()));
    }
    on_store(store, move |store| {
        store.transaction(Author::Local, |tx| {
            tx.merge_goals(&GoalMap::from([(exercise, target_seconds)]))
        })?;
        store.load_goals()
    })
    .await
}

pub struct GoalsBroadcaster<S, L> {
    store: Arc<S>,
    channel: TransportChannel<L>,
    events: EventBus,
    mode: GoalsReplaceMode,
}

impl<S: SyncStore, L: PeerLink> GoalsBroadcaster<S, L> {
    pub const fn new(
        store: Arc<S>,
        channel: TransportChannel<L>,
        events: EventBus,
        mode: GoalsReplaceMode,
    ) -> Self {
        Self {
            store,
            channel,
            events,
            mode,
        }
    }

    pub async fn goals(&self) -> Result<GoalMap> {
        on_store(&self.store, |store| store.load_goals()).await
    }

    /// Set one local goal. Does not broadcast.
    pub async fn set_goal(&self, exercise: &str, target_seconds: u32) -> Result<GoalMap> {
        set_local_goal(&self.store, exercise, target_seconds).await
    }

    /// Send the full local goals map to the companion.
    pub async fn broadcast(&self) -> Result<DeliveryOutcome> {
        let goals = self.goals().await?;
        let count = goals.len();
        let outcome = self
            .channel
            .deliver(&Message::Goals { goals })
            .await?
            .accepted()?;
        tracing::info!(count, mode = ?outcome.mode(), "goals broadcast");
        Ok(outcome)
    }

    pub async fn receive(&self, goals: GoalMap) -> Result<usize> {
        apply_goals(&self.store, &self.events, goals, self.mode).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteStore;
    use crate::sync::loopback::LoopbackLink;
    use std::time::Duration;

    fn broadcaster(
        mode: GoalsReplaceMode,
    ) -> (
        GoalsBroadcaster<SqliteStore, LoopbackLink>,
        crate::sync::loopback::LoopbackEndpoint,
    ) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let (link, endpoint) = LoopbackLink::channel();
        link.set_reachable(false);
        let channel = TransportChannel::new(Arc::new(link), Duration::from_secs(1));
        (
            GoalsBroadcaster::new(store, channel, EventBus::new(), mode),
            endpoint,
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_broadcast_sends_whole_map() {
        let (goals, mut endpoint) = broadcaster(GoalsReplaceMode::Replace);
        goals.set_goal("Plank", 90).await.unwrap();
        goals.set_goal("Wall sit", 45).await.unwrap();

        goals.broadcast().await.unwrap();

        let inbound = endpoint.recv().await.unwrap();
        let Message::Goals { goals } = Message::decode(&inbound.payload).unwrap() else {
            panic!("expected goals message");
        };
        assert_eq!(
            goals,
            GoalMap::from([("Plank".to_string(), 90), ("Wall sit".to_string(), 45)])
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_receive_replaces_by_default() {
        let (goals, _endpoint) = broadcaster(GoalsReplaceMode::Replace);
        goals.set_goal("Plank", 90).await.unwrap();

        let count = goals
            .receive(GoalMap::from([("Burpees".to_string(), 120)]))
            .await
            .unwrap();

        assert_eq!(count, 1);
        assert_eq!(
            goals.goals().await.unwrap(),
            GoalMap::from([("Burpees".to_string(), 120)])
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_receive_merge_mode_keeps_unmentioned_keys() {
        let (goals, _endpoint) = broadcaster(GoalsReplaceMode::Merge);
        goals.set_goal("Plank", 90).await.unwrap();

        let count = goals
            .receive(GoalMap::from([("Plank".to_string(), 100), ("Row".to_string(), 300)]))
            .await
            .unwrap();

        assert_eq!(count, 2);
        assert_eq!(goals.goals().await.unwrap()["Plank"], 100);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_set_local_goal_trims_and_merges() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        set_local_goal(&store, "Plank", 60).await.unwrap();

        let goals = set_local_goal(&store, "  Row ", 300).await.unwrap();

        assert_eq!(
            goals,
            GoalMap::from([("Plank".to_string(), 60), ("Row".to_string(), 300)])
        );
        assert_eq!(store.load_goals().unwrap(), goals);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_set_goal_rejects_blank_name() {
        let (goals, _endpoint) = broadcaster(GoalsReplaceMode::Replace);
        assert!(matches!(
            goals.set_goal("  ", 10).await,
            Err(Error::InvalidInput(_))
        ));
    }
}
