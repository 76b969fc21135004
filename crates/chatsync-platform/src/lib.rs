//! Collaborator seams consumed by the chatsync engine.
//!
//! The engine only talks to the identity provider, the remote store and the
//! change feed through the traits in this crate. [`memory`] provides a
//! deterministic in-process implementation of all three.

use std::fmt;

use async_trait::async_trait;
use chatsync_core::{
    ChangeEvent, ChangeFilter, ChannelId, QueryPage, QueryRequest, Relation, RowFilter, Session,
    SyncError,
};
use serde_json::Value;
use tokio::sync::{mpsc, watch};

pub mod memory;

pub use memory::{FailurePoint, InMemoryClient, InMemoryServer, QueryScope};

/// Identity provider as seen by the engine.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// One-shot read of the current session.
    async fn current_session(&self) -> Result<Option<Session>, SyncError>;

    /// Receiver notified on sign-in, sign-out and token refresh.
    ///
    /// Dropping the receiver unsubscribes.
    fn session_changes(&self) -> watch::Receiver<Option<Session>>;
}

/// Query and mutation interface of the remote relational store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn query(&self, request: QueryRequest) -> Result<QueryPage, SyncError>;

    async fn insert(&self, relation: Relation, record: Value) -> Result<(), SyncError>;

    async fn delete(&self, relation: Relation, filter: RowFilter) -> Result<(), SyncError>;
}

/// Change-notification transport.
pub trait ChangeFeed: Send + Sync {
    /// Open a filtered subscription. Events flow until the returned handle is
    /// released or dropped.
    fn subscribe(&self, filter: ChangeFilter) -> Result<ChangeSubscription, SyncError>;
}

type ReleaseFn = Box<dyn FnOnce(ChannelId) + Send>;

/// Scoped handle of one change-feed subscription.
///
/// The channel is unsubscribed exactly once: by [`ChangeSubscription::release`]
/// or, failing that, on drop.
pub struct ChangeSubscription {
    channel: ChannelId,
    events: mpsc::UnboundedReceiver<ChangeEvent>,
    release: Option<ReleaseFn>,
}

impl ChangeSubscription {
    pub fn new(
        channel: ChannelId,
        events: mpsc::UnboundedReceiver<ChangeEvent>,
        release: impl FnOnce(ChannelId) + Send + 'static,
    ) -> Self {
        Self {
            channel,
            events,
            release: Some(Box::new(release)),
        }
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    /// Next delivered event; `None` once the transport closed the channel.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }

    /// Unsubscribe now.
    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if let Some(release) = self.release.take() {
            self.events.close();
            release(self.channel);
            tracing::debug!(channel = %self.channel, "change subscription released");
        }
    }
}

impl Drop for ChangeSubscription {
    fn drop(&mut self) {
        self.release_once();
    }
}

impl fmt::Debug for ChangeSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeSubscription")
            .field("channel", &self.channel)
            .field("released", &self.release.is_none())
            .finish()
    }
}
