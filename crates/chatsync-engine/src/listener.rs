use std::sync::Arc;

use chatsync_core::{
    ChangeFilter, ChannelId, LiveChange, QueryRequest, SyncError, normalize_change_event,
};
use chatsync_platform::{ChangeFeed, ChangeSubscription, RemoteStore};
use serde::de::DeserializeOwned;

use crate::loader::decode_row;

/// Owns the single change subscription of one view.
#[derive(Debug)]
pub struct LiveEventListener {
    subscription: Option<ChangeSubscription>,
}

impl LiveEventListener {
    /// Subscribe with `filter`. The subscription lives until [`release`](Self::release)
    /// or drop.
    pub fn open(feed: &dyn ChangeFeed, filter: ChangeFilter) -> Result<Self, SyncError> {
        let relation = filter.relation;
        let subscription = feed.subscribe(filter)?;
        tracing::debug!(channel = %subscription.channel(), %relation, "live listener subscribed");
        Ok(Self {
            subscription: Some(subscription),
        })
    }

    pub fn channel(&self) -> Option<ChannelId> {
        self.subscription.as_ref().map(ChangeSubscription::channel)
    }

    pub fn is_open(&self) -> bool {
        self.subscription.is_some()
    }

    /// Next usable change in arrival order.
    ///
    /// Rows without an identifier are skipped. Returns `None` once the feed
    /// closed the channel or the listener was released. Cancel-safe.
    pub async fn next_change(&mut self) -> Option<LiveChange> {
        let subscription = self.subscription.as_mut()?;
        loop {
            let event = subscription.recv().await?;
            match normalize_change_event(&event) {
                Some(change) => return Some(change),
                None => {
                    tracing::trace!(relation = %event.relation, op = ?event.op, "change without identifier skipped");
                }
            }
        }
    }

    /// Release the subscription. Later calls are no-ops.
    pub fn release(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.release();
        }
    }
}

/// Re-fetches a full enriched record for an identifier seen in a raw change.
#[derive(Clone)]
pub struct Hydrator {
    store: Arc<dyn RemoteStore>,
}

impl Hydrator {
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        Self { store }
    }

    /// Point lookup; `Ok(None)` when the row no longer exists.
    pub async fn hydrate<E: DeserializeOwned>(
        &self,
        lookup: QueryRequest,
    ) -> Result<Option<E>, SyncError> {
        let page = self.store.query(lookup).await?;
        page.rows.into_iter().next().map(decode_row).transpose()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chatsync_core::{ChangeEvent, ChangeOp, RawRow, Relation, Room, RoomId};
    use chatsync_platform::InMemoryServer;
    use serde_json::json;
    use tokio::time::timeout;

    use super::*;

    fn rooms_filter() -> ChangeFilter {
        ChangeFilter::new(Relation::Rooms, &[ChangeOp::Insert, ChangeOp::Delete])
    }

    #[tokio::test]
    async fn yields_identifiers_and_skips_rows_without_one() {
        let server = InMemoryServer::new();
        let client = server.connect();
        let mut listener = LiveEventListener::open(&client, rooms_filter()).expect("subscribe");

        server.publish(ChangeEvent {
            relation: Relation::Rooms,
            op: ChangeOp::Insert,
            row: RawRow::default(),
        });
        let serde_json::Value::Object(row) = json!({ "id": 41 }) else {
            panic!("object literal");
        };
        server.publish(ChangeEvent {
            relation: Relation::Rooms,
            op: ChangeOp::Delete,
            row: RawRow(row),
        });

        let change = timeout(Duration::from_secs(1), listener.next_change())
            .await
            .expect("change timeout")
            .expect("listener open");
        assert_eq!(change.op, ChangeOp::Delete);
        assert_eq!(change.id, 41);
    }

    #[tokio::test]
    async fn release_unsubscribes_once() {
        let server = InMemoryServer::new();
        let client = server.connect();
        let mut listener = LiveEventListener::open(&client, rooms_filter()).expect("subscribe");
        assert!(listener.channel().is_some());
        assert_eq!(server.active_channels(), 1);

        listener.release();
        listener.release();
        assert!(!listener.is_open());
        assert_eq!(server.active_channels(), 0);
        assert_eq!(listener.next_change().await, None);
    }

    #[tokio::test]
    async fn dropping_listener_releases_subscription() {
        let server = InMemoryServer::new();
        let client = server.connect();
        let listener = LiveEventListener::open(&client, rooms_filter()).expect("subscribe");
        drop(listener);
        assert_eq!(server.active_channels(), 0);
    }

    #[tokio::test]
    async fn hydrates_from_enriched_view() {
        let server = InMemoryServer::new();
        let client = server.connect();
        let session = client
            .sign_up("jack@example.org", "password1")
            .await
            .expect("sign up");
        let room_id = server.seed_room(&session, "hydrated").expect("seed");

        let hydrator = Hydrator::new(Arc::new(client));
        let room: Option<Room> = hydrator
            .hydrate(QueryRequest::new(Relation::RoomProfiles).eq("id", room_id.0))
            .await
            .expect("lookup");
        let room = room.expect("row exists");
        assert_eq!(room.id, room_id);
        assert_eq!(room.creator_email.as_deref(), Some("jack@example.org"));

        let missing: Option<Room> = hydrator
            .hydrate(QueryRequest::new(Relation::RoomProfiles).eq("id", 999))
            .await
            .expect("lookup");
        assert_eq!(missing.map(|room| room.id), None::<RoomId>);
    }
}
