use chatsync_core::{
    ChangeFilter, ChangeOp, Confirmation, EventStream, Mutation, PageRange, PageRequest,
    PaginationCursor, QueryRequest, Relation, Room, RoomId, SortDirection, SyncError,
    ViewCollection, ViewConfig, ViewSnapshot,
};
use tokio::sync::watch;

use crate::runtime::{ViewHandle, ViewKind};

/// Every room, newest first, paged by offset.
///
/// The live subscription is unfiltered so rooms created or deleted by anyone
/// become visible.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct RoomListKind;

impl ViewKind for RoomListKind {
    type Entity = Room;

    const NAME: &'static str = "room_list";
    const DIRECTION: SortDirection = SortDirection::NewestFirst;

    fn snapshot_query(&self, request: PageRequest) -> QueryRequest {
        let query = QueryRequest::new(Relation::RoomProfiles)
            .order("created_at", false)
            .with_count();
        match request {
            PageRequest::Range(range) => query.range(range),
            PageRequest::Full => query,
        }
    }

    fn lookup_query(&self, id: i64) -> QueryRequest {
        QueryRequest::new(Relation::RoomProfiles)
            .eq("id", id)
            .range(PageRange {
                offset: 0,
                limit: 1,
            })
    }

    fn change_filter(&self) -> ChangeFilter {
        ChangeFilter::new(Relation::Rooms, &[ChangeOp::Insert, ChangeOp::Delete])
    }

    fn cursor(&self, config: &ViewConfig) -> PaginationCursor {
        PaginationCursor::paged(config.page_size)
    }

    fn prepare_mutation(&self, mutation: Mutation, collection: &ViewCollection<Room>) -> Mutation {
        match mutation {
            Mutation::DeleteRoom {
                room_id,
                known_owner: None,
            } => Mutation::DeleteRoom {
                room_id,
                known_owner: collection.get(room_id).and_then(|room| room.created_by),
            },
            other => other,
        }
    }
}

/// Open room list. Dropping it releases the live subscription.
pub struct RoomListHandle {
    inner: ViewHandle<Room>,
}

impl RoomListHandle {
    pub(crate) fn new(inner: ViewHandle<Room>) -> Self {
        Self { inner }
    }

    pub fn snapshot(&self) -> ViewSnapshot<Room> {
        self.inner.snapshot()
    }

    pub fn watch(&self) -> watch::Receiver<ViewSnapshot<Room>> {
        self.inner.watch()
    }

    pub fn subscribe(&self) -> EventStream {
        self.inner.subscribe()
    }

    /// Fetch the next page. `Ok(false)` when every room is loaded or a load is
    /// already running.
    pub async fn load_more(&self) -> Result<bool, SyncError> {
        self.inner.load_more().await
    }

    pub async fn create_room(&self, name: &str) -> Result<(), SyncError> {
        self.inner
            .mutate(Mutation::CreateRoom {
                name: name.to_owned(),
            })
            .await
    }

    /// Delete a room the signed-in user created. A declined confirmation
    /// returns without contacting the store.
    pub async fn delete_room(
        &self,
        room_id: RoomId,
        confirmation: Confirmation,
    ) -> Result<(), SyncError> {
        if confirmation == Confirmation::Declined {
            tracing::debug!(%room_id, "room deletion declined");
            return Ok(());
        }
        self.inner
            .mutate(Mutation::DeleteRoom {
                room_id,
                known_owner: None,
            })
            .await
    }

    pub async fn close(self) {
        self.inner.close().await;
    }
}
