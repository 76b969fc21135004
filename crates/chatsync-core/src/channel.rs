use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};

use crate::{
    error::SyncError,
    types::{ViewEvent, ViewSnapshot},
};

/// Broadcast event stream type used by view subscribers.
pub type EventStream = broadcast::Receiver<ViewEvent>;

/// Errors returned by view channel operations.
#[derive(Debug, Error)]
pub enum ViewChannelError {
    /// The command receiver side is closed.
    #[error("view command channel is closed")]
    CommandChannelClosed,
}

impl From<ViewChannelError> for SyncError {
    fn from(_: ViewChannelError) -> Self {
        SyncError::view_closed()
    }
}

/// Command, event and snapshot channels shared between a view handle and its runtime.
#[derive(Debug)]
pub struct ViewChannels<C, E> {
    command_tx: mpsc::Sender<C>,
    event_tx: broadcast::Sender<ViewEvent>,
    snapshot_rx: watch::Receiver<ViewSnapshot<E>>,
}

impl<C, E> Clone for ViewChannels<C, E> {
    fn clone(&self) -> Self {
        Self {
            command_tx: self.command_tx.clone(),
            event_tx: self.event_tx.clone(),
            snapshot_rx: self.snapshot_rx.clone(),
        }
    }
}

/// Runtime-side ends of a [`ViewChannels`] set.
#[derive(Debug)]
pub struct ViewInbox<C, E> {
    pub commands: mpsc::Receiver<C>,
    pub snapshots: watch::Sender<ViewSnapshot<E>>,
}

impl<C, E> ViewChannels<C, E> {
    /// Create a new channel set and return it with the runtime-side ends.
    pub fn new(command_buffer: usize, event_buffer: usize) -> (Self, ViewInbox<C, E>) {
        let (command_tx, command_rx) = mpsc::channel(command_buffer.max(1));
        let (event_tx, _) = broadcast::channel(event_buffer.max(1));
        let (snapshot_tx, snapshot_rx) = watch::channel(ViewSnapshot::opening());

        (
            Self {
                command_tx,
                event_tx,
                snapshot_rx,
            },
            ViewInbox {
                commands: command_rx,
                snapshots: snapshot_tx,
            },
        )
    }

    /// Clone the event sender.
    pub fn event_sender(&self) -> broadcast::Sender<ViewEvent> {
        self.event_tx.clone()
    }

    /// Subscribe to emitted view events.
    pub fn subscribe(&self) -> EventStream {
        self.event_tx.subscribe()
    }

    /// Receiver that observes every published snapshot.
    pub fn watch(&self) -> watch::Receiver<ViewSnapshot<E>> {
        self.snapshot_rx.clone()
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> ViewSnapshot<E>
    where
        E: Clone,
    {
        self.snapshot_rx.borrow().clone()
    }

    /// Send one command to the runtime.
    pub async fn send_command(&self, command: C) -> Result<(), ViewChannelError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| ViewChannelError::CommandChannelClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ViewLifecycleState;

    #[tokio::test]
    async fn sends_commands_to_receiver() {
        let (channels, mut inbox) = ViewChannels::<&'static str, u8>::new(4, 4);
        channels
            .send_command("load_more")
            .await
            .expect("command send should work");

        let cmd = inbox
            .commands
            .recv()
            .await
            .expect("receiver should have a command");
        assert_eq!(cmd, "load_more");
    }

    #[tokio::test]
    async fn reports_closed_runtime() {
        let (channels, inbox) = ViewChannels::<u8, u8>::new(1, 1);
        drop(inbox);
        let err = channels
            .send_command(1)
            .await
            .expect_err("dropped runtime must close the channel");
        assert_eq!(SyncError::from(err).code, "view_closed");
    }

    #[tokio::test]
    async fn fans_out_events_to_subscribers() {
        let (channels, _inbox) = ViewChannels::<u8, u8>::new(4, 16);
        let mut a = channels.subscribe();
        let mut b = channels.subscribe();

        let publisher = channels.event_sender();
        publisher
            .send(ViewEvent::StateChanged {
                state: ViewLifecycleState::Ready,
            })
            .expect("subscribers are attached");

        let event_a = a.recv().await.expect("subscriber a should receive event");
        let event_b = b.recv().await.expect("subscriber b should receive event");
        assert_eq!(event_a, event_b);
    }

    #[test]
    fn snapshot_starts_opening_and_follows_publisher() {
        let (channels, inbox) = ViewChannels::<u8, u8>::new(1, 1);
        assert_eq!(channels.snapshot().state, ViewLifecycleState::Opening);

        let mut next = ViewSnapshot::opening();
        next.items = vec![1, 2];
        next.state = ViewLifecycleState::Ready;
        inbox.snapshots.send_replace(next);

        let snapshot = channels.snapshot();
        assert_eq!(snapshot.items, vec![1, 2]);
        assert_eq!(snapshot.state, ViewLifecycleState::Ready);
    }
}
