//! Core view-synchronization contract shared by loaders, listeners and view runtimes.
//!
//! This crate defines the room/message data model, the reconciler that merges
//! snapshot pages with live change events, pagination and lifecycle helpers,
//! and the channel and error abstractions used across the boundary.

/// View command/event/snapshot channel primitives.
pub mod channel;
/// Stable error types.
pub mod error;
/// Change-event and mutation-outcome normalization.
pub mod normalization;
/// Snapshot pagination cursor.
pub mod pagination;
/// Ordered, deduplicated view collection.
pub mod reconciler;
/// View lifecycle state machine.
pub mod state_machine;
/// Entities, query/change payloads and view protocol types.
pub mod types;

pub use channel::{EventStream, ViewChannelError, ViewChannels, ViewInbox};
pub use error::{SyncError, SyncErrorCategory};
pub use normalization::{
    LiveChange, MutationOutcome, normalize_change_event, normalize_mutation_outcome,
};
pub use pagination::{MAX_PAGE_SIZE, PageRequest, PaginationCursor, bounded_page_size};
pub use reconciler::{
    ApplyOutcome, Entity, SortDirection, ViewCollection, ViewOp, compare_created_at,
};
pub use state_machine::{ViewAction, ViewStateMachine};
pub use types::{
    ChangeEvent, ChangeFilter, ChangeOp, ChannelId, Confirmation, Message, MessageId, Mutation,
    MutationAck, MutationKind, PageRange, QueryPage, QueryRequest, RawRow, Relation, Room, RoomId,
    RowFilter, Session, SortOrder, ViewConfig, ViewEvent, ViewLifecycleState, ViewSnapshot,
    display_label,
};
