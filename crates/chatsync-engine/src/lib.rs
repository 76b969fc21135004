//! View-synchronization engine.
//!
//! A [`ChatClient`] opens views over the remote store. Each open view runs as
//! one task that owns its collection: snapshot pages, hydrated live changes
//! and mutation results are all applied there, in arrival order.

use std::sync::Arc;

use chatsync_core::{Room, Session, SyncError, ViewConfig};
use chatsync_platform::{ChangeFeed, RemoteStore, SessionProvider};
use tokio::sync::watch;

mod gateway;
mod history;
mod listener;
mod loader;
mod rooms;
mod runtime;

pub use gateway::MutationGateway;
pub use history::RoomHistoryHandle;
pub use listener::{Hydrator, LiveEventListener};
pub use loader::{SnapshotLoader, SnapshotPage};
pub use rooms::RoomListHandle;

use crate::{
    history::RoomHistoryKind,
    rooms::RoomListKind,
    runtime::{Collaborators, spawn_view},
};

/// Entry point for opening room-list and room-history views.
#[derive(Clone)]
pub struct ChatClient {
    collaborators: Collaborators,
    config: ViewConfig,
}

impl ChatClient {
    /// Build from one backend that implements every collaborator seam.
    pub fn new<B>(backend: B, config: ViewConfig) -> Self
    where
        B: SessionProvider + RemoteStore + ChangeFeed + 'static,
    {
        let backend = Arc::new(backend);
        Self::from_parts(backend.clone(), backend.clone(), backend, config)
    }

    pub fn from_parts(
        session: Arc<dyn SessionProvider>,
        store: Arc<dyn RemoteStore>,
        feed: Arc<dyn ChangeFeed>,
        config: ViewConfig,
    ) -> Self {
        Self {
            collaborators: Collaborators {
                session,
                store,
                feed,
            },
            config,
        }
    }

    pub fn config(&self) -> &ViewConfig {
        &self.config
    }

    pub async fn current_session(&self) -> Result<Option<Session>, SyncError> {
        self.collaborators.session.current_session().await
    }

    /// Receiver notified on sign-in and sign-out. Drop it to unsubscribe.
    pub fn session_changes(&self) -> watch::Receiver<Option<Session>> {
        self.collaborators.session.session_changes()
    }

    /// Open the room list. Available without a session.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open_room_list(&self) -> Result<RoomListHandle, SyncError> {
        let inner = spawn_view(RoomListKind, &self.collaborators, &self.config)?;
        tracing::debug!("room list opened");
        Ok(RoomListHandle::new(inner))
    }

    /// Open the message history of `room`. Requires a session.
    pub async fn open_history(&self, room: &Room) -> Result<RoomHistoryHandle, SyncError> {
        if self.current_session().await?.is_none() {
            return Err(SyncError::not_signed_in("open_history"));
        }
        let kind = RoomHistoryKind { room_id: room.id };
        let inner = spawn_view(kind, &self.collaborators, &self.config)?;
        tracing::debug!(room_id = %room.id, "room history opened");
        Ok(RoomHistoryHandle::new(room.clone(), inner))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chatsync_core::{RoomId, ViewLifecycleState};
    use chatsync_platform::InMemoryServer;
    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn room_list_opens_signed_out() {
        let server = InMemoryServer::new();
        let client = ChatClient::new(server.connect(), ViewConfig::default());
        assert_eq!(client.current_session().await.expect("session"), None);

        let list = client.open_room_list().expect("room list opens");
        let mut snapshots = list.watch();
        let ready = timeout(
            Duration::from_secs(2),
            snapshots.wait_for(|snapshot| snapshot.state == ViewLifecycleState::Ready),
        )
        .await
        .expect("ready timeout")
        .expect("runtime alive")
        .clone();
        assert!(ready.items.is_empty());
        assert_eq!(ready.total_count, Some(0));
        assert!(!ready.has_more);
        assert!(!ready.loading);
        assert_eq!(server.active_channels(), 1);
    }

    #[tokio::test]
    async fn history_requires_a_session() {
        let server = InMemoryServer::new();
        let client = ChatClient::new(server.connect(), ViewConfig::default());
        let room = Room {
            id: RoomId(1),
            name: Some("lobby".into()),
            created_by: None,
            creator_email: None,
            created_at: None,
        };

        let err = client
            .open_history(&room)
            .await
            .err()
            .expect("signed out");
        assert_eq!(err.code, "not_signed_in");
        assert_eq!(server.active_channels(), 0);
    }

    #[tokio::test]
    async fn session_changes_follow_sign_in() {
        let server = InMemoryServer::new();
        let backend = server.connect();
        let client = ChatClient::new(backend.clone(), ViewConfig::default());
        let mut changes = client.session_changes();

        backend
            .sign_up("pat@example.org", "password1")
            .await
            .expect("sign up");
        changes.changed().await.expect("provider alive");
        assert_eq!(
            changes
                .borrow()
                .as_ref()
                .map(Session::display_label)
                .as_deref(),
            Some("pat")
        );
    }
}
