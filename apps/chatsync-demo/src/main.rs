mod config;
mod logging;

use std::time::Duration;

use chatsync_core::{Confirmation, SyncError, ViewLifecycleState, ViewSnapshot};
use chatsync_engine::ChatClient;
use chatsync_platform::InMemoryServer;
use thiserror::Error;
use tokio::sync::watch;

use crate::config::{ConfigError, DemoConfig};

const STEP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
enum DemoError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("view closed while waiting for {0}")]
    ViewClosed(&'static str),
    #[error("{0}")]
    Unexpected(String),
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    logging::init();
    if let Err(err) = run().await {
        tracing::error!(error = %err, "demo failed");
        eprintln!("chatsync demo failed: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), DemoError> {
    let config = DemoConfig::from_env()?;
    tracing::info!(view = ?config.view, seed_rooms = config.seed_rooms, "starting demo");

    let server = InMemoryServer::new();
    let alice_backend = server.connect();
    let alice_session = alice_backend
        .sign_up("alice@example.org", &config.password)
        .await?;
    let bob_backend = server.connect();
    bob_backend
        .sign_up("bob@example.org", &config.password)
        .await?;
    for n in 0..config.seed_rooms {
        server.seed_room(&alice_session, &format!("room {}", n + 1))?;
    }

    let alice = ChatClient::new(alice_backend, config.view.clone());
    let bob = ChatClient::new(bob_backend, config.view.clone());

    let alice_rooms = alice.open_room_list()?;
    let mut alice_view = alice_rooms.watch();
    let ready = wait_for(&mut alice_view, "initial room list", is_settled).await?;
    tracing::info!(
        items = ready.items.len(),
        total = ?ready.total_count,
        has_more = ready.has_more,
        "room list ready"
    );

    while alice_rooms.load_more().await? {
        let page = wait_for(&mut alice_view, "next page", |s| !s.loading).await?;
        tracing::info!(items = page.items.len(), "page loaded");
    }

    let bob_rooms = bob.open_room_list()?;
    bob_rooms.create_room("from bob").await?;
    let seen = wait_for(&mut alice_view, "remote room", |s| {
        s.items
            .iter()
            .any(|room| room.name.as_deref() == Some("from bob"))
    })
    .await?;
    let newest = seen
        .items
        .first()
        .cloned()
        .ok_or_else(|| DemoError::Unexpected("room list is empty".to_owned()))?;
    tracing::info!(room = %newest.display_name(), creator = %newest.creator_label(), "remote room arrived");

    let history = alice.open_history(&newest).await?;
    let mut messages = history.watch();
    wait_for(&mut messages, "history snapshot", is_settled).await?;
    history.send_message("hello from alice").await?;
    let delivered = wait_for(&mut messages, "own message", |s| !s.items.is_empty()).await?;
    for message in &delivered.items {
        tracing::info!(
            author = %message.creator_label(),
            content = message.content.as_deref().unwrap_or_default(),
            "message"
        );
    }

    match alice_rooms
        .delete_room(newest.id, Confirmation::Confirmed)
        .await
    {
        Err(err) if err.code == "not_room_owner" => {
            tracing::info!(room_id = %newest.id, "foreign room deletion refused")
        }
        Err(err) => return Err(err.into()),
        Ok(()) => {
            return Err(DemoError::Unexpected(
                "deleted a room owned by someone else".to_owned(),
            ));
        }
    }
    bob_rooms
        .delete_room(newest.id, Confirmation::Confirmed)
        .await?;
    wait_for(&mut messages, "cascade delete", |s| s.items.is_empty()).await?;
    wait_for(&mut alice_view, "room removal", |s| {
        s.items.iter().all(|room| room.id != newest.id)
    })
    .await?;
    tracing::info!(room_id = %newest.id, "room deleted by its creator");

    history.close().await;
    alice_rooms.close().await;
    bob_rooms.close().await;
    let open = server.active_channels();
    if open != 0 {
        return Err(DemoError::Unexpected(format!(
            "{open} change channels still open after close"
        )));
    }
    tracing::info!(rooms = server.room_count(), "demo finished");
    Ok(())
}

fn is_settled<E>(snapshot: &ViewSnapshot<E>) -> bool {
    snapshot.state == ViewLifecycleState::Ready && !snapshot.loading
}

async fn wait_for<E, F>(
    snapshots: &mut watch::Receiver<ViewSnapshot<E>>,
    what: &'static str,
    predicate: F,
) -> Result<ViewSnapshot<E>, DemoError>
where
    E: Clone,
    F: FnMut(&ViewSnapshot<E>) -> bool,
{
    let snapshot = tokio::time::timeout(STEP_TIMEOUT, snapshots.wait_for(predicate))
        .await
        .map_err(|_| DemoError::Timeout(what))?
        .map_err(|_| DemoError::ViewClosed(what))?;
    Ok(snapshot.clone())
}
