use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::SyncError;

const UNKNOWN_LABEL: &str = "unknown";
const DEFAULT_PAGE_SIZE: u16 = 10;
const DEFAULT_COMMAND_BUFFER: usize = 32;
const DEFAULT_EVENT_BUFFER: usize = 64;
const DEFAULT_ITEM_WARN_THRESHOLD: usize = 5_000;

/// Room identifier assigned by the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub i64);

/// Message identifier assigned by the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub i64);

/// Handle of one change-feed subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub u64);

macro_rules! integer_id {
    ($name:ident) => {
        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }

        impl From<$name> for i64 {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

integer_id!(RoomId);
integer_id!(MessageId);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel-{}", self.0)
    }
}

/// Authenticated identity issued by the session provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    /// Stable user identity.
    pub user_id: Uuid,
    /// Email the account signed up with.
    pub email: Option<String>,
    /// Opaque bearer token.
    pub access_token: String,
}

impl Session {
    /// Label shown for the signed-in user.
    pub fn display_label(&self) -> String {
        display_label(self.email.as_deref())
    }
}

/// Derive a creator label from an email column: the local part, or `"unknown"`.
pub fn display_label(email: Option<&str>) -> String {
    email
        .and_then(|email| email.split('@').next())
        .map(str::trim)
        .filter(|local| !local.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| UNKNOWN_LABEL.to_owned())
}

/// Room row as exposed by the enriched room read view.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Room {
    pub id: RoomId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub created_by: Option<Uuid>,
    /// Joined from the identity provider; absent from raw change payloads.
    #[serde(default)]
    pub creator_email: Option<String>,
    /// Server-assigned ISO-8601 timestamp.
    #[serde(default)]
    pub created_at: Option<String>,
}

impl Room {
    /// Name for display, falling back to `"unknown"`.
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(UNKNOWN_LABEL)
    }

    pub fn creator_label(&self) -> String {
        display_label(self.creator_email.as_deref())
    }

    /// Only the creator may delete a room.
    pub fn is_owned_by(&self, session: &Session) -> bool {
        self.created_by == Some(session.user_id)
    }
}

/// Message row as exposed by the enriched message read view.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub room_id: RoomId,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub created_by: Option<Uuid>,
    #[serde(default)]
    pub creator_email: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl Message {
    pub fn creator_label(&self) -> String {
        display_label(self.creator_email.as_deref())
    }

    /// Whether the message was sent by the given session's user.
    pub fn is_own(&self, session: &Session) -> bool {
        self.created_by == Some(session.user_id)
    }
}

/// Tables and read views exposed by the remote store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Relation {
    /// Base room table (mutations and change events).
    Rooms,
    /// Room read view joined with creator email.
    RoomProfiles,
    /// Base message table.
    Messages,
    /// Message read view joined with creator email.
    MessageProfiles,
}

impl Relation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rooms => "rooms",
            Self::RoomProfiles => "room_profiles",
            Self::Messages => "messages",
            Self::MessageProfiles => "message_profiles",
        }
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Equality filter on one column.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RowFilter {
    pub column: String,
    pub value: Value,
}

impl RowFilter {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }

    /// Whether a JSON row satisfies this filter.
    pub fn matches(&self, row: &Map<String, Value>) -> bool {
        row.get(&self.column) == Some(&self.value)
    }
}

/// Ordering clause for a query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SortOrder {
    pub column: String,
    pub ascending: bool,
}

/// Offset/limit window for a query.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageRange {
    pub offset: u64,
    pub limit: u64,
}

/// Read request against a table or read view.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryRequest {
    pub relation: Relation,
    pub filters: Vec<RowFilter>,
    pub order: Option<SortOrder>,
    pub range: Option<PageRange>,
    /// Ask for the exact number of matching rows, ignoring `range`.
    pub count_exact: bool,
}

impl QueryRequest {
    pub fn new(relation: Relation) -> Self {
        Self {
            relation,
            filters: Vec::new(),
            order: None,
            range: None,
            count_exact: false,
        }
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(RowFilter::eq(column, value));
        self
    }

    pub fn order(mut self, column: impl Into<String>, ascending: bool) -> Self {
        self.order = Some(SortOrder {
            column: column.into(),
            ascending,
        });
        self
    }

    pub fn range(mut self, range: PageRange) -> Self {
        self.range = Some(range);
        self
    }

    pub fn with_count(mut self) -> Self {
        self.count_exact = true;
        self
    }

    /// Whether this request targets a single row by identifier.
    pub fn is_point_lookup(&self) -> bool {
        self.filters.iter().any(|filter| filter.column == "id")
    }
}

/// Rows returned by a query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct QueryPage {
    pub rows: Vec<Value>,
    /// Present when the request asked for an exact count.
    pub total_count: Option<u64>,
}

/// Row-level change operation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ChangeOp {
    Insert,
    Delete,
}

/// Raw row image carried by a change notification.
///
/// For inserts this is the base-table projection (no joined columns); for
/// deletes it is the pre-delete image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(transparent)]
pub struct RawRow(pub Map<String, Value>);

impl RawRow {
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    /// Identifier column, when present and integral.
    pub fn id(&self) -> Option<i64> {
        self.0.get("id").and_then(Value::as_i64)
    }
}

impl From<Map<String, Value>> for RawRow {
    fn from(value: Map<String, Value>) -> Self {
        Self(value)
    }
}

/// One notification delivered by the change feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeEvent {
    pub relation: Relation,
    pub op: ChangeOp,
    pub row: RawRow,
}

/// Server-side filter for a change subscription.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeFilter {
    pub relation: Relation,
    pub ops: Vec<ChangeOp>,
    pub row_filter: Option<RowFilter>,
}

impl ChangeFilter {
    pub fn new(relation: Relation, ops: &[ChangeOp]) -> Self {
        Self {
            relation,
            ops: ops.to_vec(),
            row_filter: None,
        }
    }

    pub fn with_row_filter(mut self, filter: RowFilter) -> Self {
        self.row_filter = Some(filter);
        self
    }

    pub fn accepts(&self, event: &ChangeEvent) -> bool {
        event.relation == self.relation
            && self.ops.contains(&event.op)
            && self
                .row_filter
                .as_ref()
                .is_none_or(|filter| filter.matches(&event.row.0))
    }
}

/// Runtime tuning for one view.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ViewConfig {
    /// Rows requested per room-list page.
    pub page_size: u16,
    /// Capacity of the command channel into a view runtime.
    pub command_buffer: usize,
    /// Capacity of the broadcast event channel out of a view runtime.
    pub event_buffer: usize,
    /// Collection size that triggers a one-time warning. Items are never dropped.
    pub item_warn_threshold: usize,
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            command_buffer: DEFAULT_COMMAND_BUFFER,
            event_buffer: DEFAULT_EVENT_BUFFER,
            item_warn_threshold: DEFAULT_ITEM_WARN_THRESHOLD,
        }
    }
}

/// Lifecycle of one open view.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ViewLifecycleState {
    /// Subscription is open; the initial snapshot has not settled yet.
    Opening,
    /// Initial snapshot settled (applied or failed); live and paging.
    Ready,
    /// Subscription released; no further changes are applied.
    Closed,
}

/// Explicit user answer to a destructive prompt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Confirmation {
    Confirmed,
    Declined,
}

/// Remote write requested through a view.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Mutation {
    CreateRoom {
        name: String,
    },
    DeleteRoom {
        room_id: RoomId,
        /// Creator as known to the local view, when the room is materialized.
        known_owner: Option<Uuid>,
    },
    SendMessage {
        room_id: RoomId,
        content: String,
    },
}

impl Mutation {
    pub fn kind(&self) -> MutationKind {
        match self {
            Self::CreateRoom { .. } => MutationKind::CreateRoom,
            Self::DeleteRoom { .. } => MutationKind::DeleteRoom,
            Self::SendMessage { .. } => MutationKind::SendMessage,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MutationKind {
    CreateRoom,
    DeleteRoom,
    SendMessage,
}

/// Acknowledgement for a mutation issued through a view.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MutationAck {
    /// Handle-assigned transaction ID.
    pub client_txn_id: String,
    pub kind: MutationKind,
    /// Stable error code on failure.
    pub error_code: Option<String>,
}

/// Point-in-time state of a view, published after every applied input.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewSnapshot<E> {
    /// Deduplicated entries in display order.
    pub items: Vec<E>,
    /// A page load or mutation is in flight.
    pub loading: bool,
    /// Exact row count reported by the latest snapshot page.
    pub total_count: Option<u64>,
    /// Another page exists remotely.
    pub has_more: bool,
    pub state: ViewLifecycleState,
}

impl<E> ViewSnapshot<E> {
    pub fn opening() -> Self {
        Self {
            items: Vec::new(),
            loading: false,
            total_count: None,
            has_more: false,
            state: ViewLifecycleState::Opening,
        }
    }
}

/// Notifications emitted by a view runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ViewEvent {
    /// View lifecycle transition.
    StateChanged { state: ViewLifecycleState },
    /// A snapshot page was merged into the collection.
    PageApplied {
        offset: u64,
        received: usize,
        added: usize,
    },
    /// A hydrated live insert was appended.
    ItemInserted { id: i64 },
    /// A live delete removed an entry.
    ItemRemoved { id: i64 },
    /// Mutation acknowledgement.
    MutationAck(MutationAck),
    /// Remote failure to surface to the user.
    Error(SyncError),
}
