use chatsync_core::{
    ChangeFilter, ChangeOp, EventStream, Message, Mutation, PageRange, PageRequest,
    PaginationCursor, QueryRequest, Relation, Room, RoomId, RowFilter, SortDirection, SyncError,
    ViewConfig, ViewSnapshot,
};
use tokio::sync::watch;

use crate::runtime::{ViewHandle, ViewKind};

/// Full message history of one room, oldest first, loaded in one request.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RoomHistoryKind {
    pub room_id: RoomId,
}

impl ViewKind for RoomHistoryKind {
    type Entity = Message;

    const NAME: &'static str = "room_history";
    const DIRECTION: SortDirection = SortDirection::OldestFirst;

    // Always the whole room, fetched newest first; the collection re-sorts
    // for display.
    fn snapshot_query(&self, _request: PageRequest) -> QueryRequest {
        QueryRequest::new(Relation::MessageProfiles)
            .eq("room_id", self.room_id.0)
            .order("created_at", false)
    }

    fn lookup_query(&self, id: i64) -> QueryRequest {
        QueryRequest::new(Relation::MessageProfiles)
            .eq("id", id)
            .range(PageRange {
                offset: 0,
                limit: 1,
            })
    }

    fn change_filter(&self) -> ChangeFilter {
        ChangeFilter::new(Relation::Messages, &[ChangeOp::Insert, ChangeOp::Delete])
            .with_row_filter(RowFilter::eq("room_id", self.room_id.0))
    }

    fn cursor(&self, _config: &ViewConfig) -> PaginationCursor {
        PaginationCursor::unpaginated()
    }
}

/// Open message history of one room. Dropping it releases the live subscription.
pub struct RoomHistoryHandle {
    room: Room,
    inner: ViewHandle<Message>,
}

impl RoomHistoryHandle {
    pub(crate) fn new(room: Room, inner: ViewHandle<Message>) -> Self {
        Self { room, inner }
    }

    pub fn room_id(&self) -> RoomId {
        self.room.id
    }

    /// Room as it was listed when the history was opened.
    pub fn room(&self) -> &Room {
        &self.room
    }

    pub fn snapshot(&self) -> ViewSnapshot<Message> {
        self.inner.snapshot()
    }

    pub fn watch(&self) -> watch::Receiver<ViewSnapshot<Message>> {
        self.inner.watch()
    }

    pub fn subscribe(&self) -> EventStream {
        self.inner.subscribe()
    }

    pub async fn send_message(&self, content: &str) -> Result<(), SyncError> {
        self.inner
            .mutate(Mutation::SendMessage {
                room_id: self.room.id,
                content: content.to_owned(),
            })
            .await
    }

    pub async fn close(self) {
        self.inner.close().await;
    }
}
