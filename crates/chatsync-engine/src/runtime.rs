use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use chatsync_core::{
    ApplyOutcome, ChangeFilter, ChangeOp, Entity, EventStream, LiveChange, Mutation,
    MutationKind, MutationOutcome, PageRequest, PaginationCursor, QueryRequest, SortDirection,
    SyncError, SyncErrorCategory, ViewAction, ViewChannels, ViewCollection, ViewConfig, ViewEvent,
    ViewInbox, ViewLifecycleState, ViewOp, ViewSnapshot, ViewStateMachine,
    normalize_mutation_outcome,
};
use chatsync_platform::{ChangeFeed, RemoteStore, SessionProvider};
use serde::de::DeserializeOwned;
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    gateway::MutationGateway,
    listener::{Hydrator, LiveEventListener},
    loader::{SnapshotLoader, SnapshotPage},
};

/// Entity-specific half of a view: queries, change filter and paging mode.
pub(crate) trait ViewKind: Send + Sync + 'static {
    type Entity: Entity + DeserializeOwned;

    /// Label used in logs and transaction IDs.
    const NAME: &'static str;
    const DIRECTION: SortDirection;

    fn snapshot_query(&self, request: PageRequest) -> QueryRequest;

    /// Point lookup against the enriched read view.
    fn lookup_query(&self, id: i64) -> QueryRequest;

    fn change_filter(&self) -> ChangeFilter;

    fn cursor(&self, config: &ViewConfig) -> PaginationCursor;

    /// Fill in view-local knowledge before a mutation is dispatched.
    fn prepare_mutation(
        &self,
        mutation: Mutation,
        _collection: &ViewCollection<Self::Entity>,
    ) -> Mutation {
        mutation
    }
}

/// Remote collaborators shared by every view of one client.
#[derive(Clone)]
pub(crate) struct Collaborators {
    pub session: Arc<dyn SessionProvider>,
    pub store: Arc<dyn RemoteStore>,
    pub feed: Arc<dyn ChangeFeed>,
}

pub(crate) enum ViewCommand {
    LoadMore {
        reply: oneshot::Sender<Result<bool, SyncError>>,
    },
    Mutate {
        mutation: Mutation,
        client_txn_id: String,
        reply: oneshot::Sender<Result<(), SyncError>>,
    },
}

enum Completion<E> {
    Page {
        request: PageRequest,
        result: Result<SnapshotPage<E>, SyncError>,
    },
    Hydrated {
        id: i64,
        result: Result<Option<E>, SyncError>,
    },
    Mutated {
        client_txn_id: String,
        kind: MutationKind,
        result: Result<(), SyncError>,
        reply: oneshot::Sender<Result<(), SyncError>>,
    },
}

/// Caller side of a running view. Dropping it stops the runtime.
pub(crate) struct ViewHandle<E> {
    name: &'static str,
    channels: ViewChannels<ViewCommand, E>,
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
    next_txn_id: AtomicU64,
}

impl<E: Clone> ViewHandle<E> {
    pub fn snapshot(&self) -> ViewSnapshot<E> {
        self.channels.snapshot()
    }

    pub fn watch(&self) -> watch::Receiver<ViewSnapshot<E>> {
        self.channels.watch()
    }

    pub fn subscribe(&self) -> EventStream {
        self.channels.subscribe()
    }

    /// Request the next page. `Ok(false)` when nothing remains or a load is in flight.
    pub async fn load_more(&self) -> Result<bool, SyncError> {
        let (reply, response) = oneshot::channel();
        self.channels
            .send_command(ViewCommand::LoadMore { reply })
            .await?;
        response.await.map_err(|_| SyncError::view_closed())?
    }

    /// Dispatch a mutation and wait for the remote call to finish.
    ///
    /// Success does not mean the view shows the change yet; that happens when
    /// the matching change event is hydrated.
    pub async fn mutate(&self, mutation: Mutation) -> Result<(), SyncError> {
        let client_txn_id = format!(
            "{}-{}",
            self.name,
            self.next_txn_id.fetch_add(1, Ordering::Relaxed)
        );
        tracing::debug!(view = self.name, %client_txn_id, kind = ?mutation.kind(), "mutation requested");

        let (reply, response) = oneshot::channel();
        self.channels
            .send_command(ViewCommand::Mutate {
                mutation,
                client_txn_id,
                reply,
            })
            .await?;
        response.await.map_err(|_| SyncError::view_closed())?
    }

    /// Stop the runtime and wait until its subscription is released.
    pub async fn close(mut self) {
        self.stop.cancel();
        if let Some(task) = self.task.take()
            && let Err(err) = task.await
        {
            tracing::warn!(view = self.name, error = %err, "view runtime ended abnormally");
        }
    }
}

impl<E> Drop for ViewHandle<E> {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Subscribe, then start the runtime that owns the view collection.
///
/// The subscription is opened before the first snapshot request so no change
/// committed after the snapshot read can be missed.
pub(crate) fn spawn_view<K: ViewKind>(
    kind: K,
    collaborators: &Collaborators,
    config: &ViewConfig,
) -> Result<ViewHandle<K::Entity>, SyncError> {
    let listener = LiveEventListener::open(collaborators.feed.as_ref(), kind.change_filter())?;
    let (channels, inbox) = ViewChannels::new(config.command_buffer, config.event_buffer);
    let (completions_tx, completions) = mpsc::unbounded_channel();
    let stop = CancellationToken::new();

    let runtime = ViewRuntime {
        cursor: kind.cursor(config),
        kind,
        item_warn_threshold: config.item_warn_threshold,
        events: channels.event_sender(),
        inbox,
        collection: ViewCollection::new(K::DIRECTION),
        machine: ViewStateMachine::default(),
        listener,
        loader: SnapshotLoader::new(collaborators.store.clone()),
        hydrator: Hydrator::new(collaborators.store.clone()),
        gateway: MutationGateway::new(
            collaborators.session.clone(),
            collaborators.store.clone(),
        ),
        completions_tx,
        completions,
        pending_hydrations: HashSet::new(),
        discarded_hydrations: HashSet::new(),
        mutations_in_flight: 0,
        size_warned: false,
        stop: stop.child_token(),
    };
    let task = tokio::spawn(runtime.run());

    Ok(ViewHandle {
        name: K::NAME,
        channels,
        stop,
        task: Some(task),
        next_txn_id: AtomicU64::new(1),
    })
}

/// Single writer of one view collection.
///
/// Remote calls run as detached tasks that report back through
/// `completions`, so every state change is applied here against the current
/// collection.
struct ViewRuntime<K: ViewKind> {
    kind: K,
    item_warn_threshold: usize,
    events: broadcast::Sender<ViewEvent>,
    inbox: ViewInbox<ViewCommand, K::Entity>,
    collection: ViewCollection<K::Entity>,
    cursor: PaginationCursor,
    machine: ViewStateMachine,
    listener: LiveEventListener,
    loader: SnapshotLoader,
    hydrator: Hydrator,
    gateway: MutationGateway,
    completions_tx: mpsc::UnboundedSender<Completion<K::Entity>>,
    completions: mpsc::UnboundedReceiver<Completion<K::Entity>>,
    pending_hydrations: HashSet<i64>,
    // Lookups whose row was deleted while they were in flight.
    discarded_hydrations: HashSet<i64>,
    mutations_in_flight: usize,
    size_warned: bool,
    stop: CancellationToken,
}

impl<K: ViewKind> ViewRuntime<K> {
    async fn run(mut self) {
        tracing::debug!(view = K::NAME, channel = ?self.listener.channel(), "view opening");
        self.request_page();
        self.publish();

        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                Some(completion) = self.completions.recv() => self.on_completion(completion),
                change = self.listener.next_change(), if self.listener.is_open() => {
                    self.on_change(change);
                }
                command = self.inbox.commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
            }
        }

        self.shutdown();
    }

    fn on_command(&mut self, command: ViewCommand) {
        match command {
            ViewCommand::LoadMore { reply } => {
                let result = self
                    .machine
                    .check(ViewAction::LoadMore)
                    .map(|()| self.request_page());
                // Callers observe `loading` as soon as the reply lands.
                self.publish();
                let _ = reply.send(result);
            }
            ViewCommand::Mutate {
                mutation,
                client_txn_id,
                reply,
            } => {
                self.dispatch_mutation(mutation, client_txn_id, reply);
                self.publish();
            }
        }
    }

    fn on_completion(&mut self, completion: Completion<K::Entity>) {
        match completion {
            Completion::Page { request, result } => self.on_page(request, result),
            Completion::Hydrated { id, result } => self.on_hydrated(id, result),
            Completion::Mutated {
                client_txn_id,
                kind,
                result,
                reply,
            } => {
                self.on_mutated(client_txn_id, kind, &result);
                // Published before the caller resumes so `loading` is already settled.
                self.publish();
                let _ = reply.send(result);
                return;
            }
        }
        self.publish();
    }

    fn on_change(&mut self, change: Option<LiveChange>) {
        let Some(change) = change else {
            self.listener.release();
            tracing::warn!(view = K::NAME, "change feed closed the subscription");
            self.emit(ViewEvent::Error(SyncError::new(
                SyncErrorCategory::Network,
                "change_feed_closed",
                "live updates stopped; reopen the view to resume",
            )));
            return;
        };
        if let Err(err) = self.machine.check(ViewAction::ApplyChange) {
            tracing::trace!(view = K::NAME, code = %err.code, "change ignored");
            return;
        }

        match change.op {
            ChangeOp::Insert => self.begin_hydration(change.id),
            ChangeOp::Delete => self.apply_delete(change.id),
        }
        self.publish();
    }

    fn request_page(&mut self) -> bool {
        let Some(request) = self.cursor.next_request(self.collection.len()) else {
            tracing::trace!(view = K::NAME, "no page to request");
            return false;
        };

        tracing::debug!(view = K::NAME, offset = request.offset(), "snapshot page requested");
        let query = self.kind.snapshot_query(request);
        let loader = self.loader.clone();
        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            let result = loader.load_page(query).await;
            let _ = completions.send(Completion::Page { request, result });
        });
        true
    }

    fn on_page(&mut self, request: PageRequest, result: Result<SnapshotPage<K::Entity>, SyncError>) {
        match result {
            Ok(page) => {
                let received = page.rows.len();
                let added = self.collection.apply_snapshot_batch(page.rows);
                self.cursor.complete(page.total_count, self.collection.len());
                tracing::debug!(
                    view = K::NAME,
                    offset = request.offset(),
                    received,
                    added,
                    items = self.collection.len(),
                    total = ?self.cursor.total_count(),
                    "snapshot page applied"
                );
                self.emit(ViewEvent::PageApplied {
                    offset: request.offset(),
                    received,
                    added,
                });
                self.check_size();
            }
            Err(error) => {
                self.cursor.fail();
                tracing::warn!(
                    view = K::NAME,
                    offset = request.offset(),
                    code = %error.code,
                    message = %error.message,
                    "snapshot page failed"
                );
                self.emit(ViewEvent::Error(error));
            }
        }

        if self.machine.state() == ViewLifecycleState::Opening {
            match self.machine.on_initial_settled() {
                Ok(event) => self.emit(event),
                Err(err) => tracing::trace!(view = K::NAME, code = %err.code, "settle skipped"),
            }
        }
    }

    fn begin_hydration(&mut self, id: i64) {
        if self.collection.contains(id.into()) {
            tracing::trace!(view = K::NAME, id, "insert for present entry absorbed");
            return;
        }
        if !self.pending_hydrations.insert(id) {
            tracing::trace!(view = K::NAME, id, "hydration already pending");
            return;
        }

        let lookup = self.kind.lookup_query(id);
        let hydrator = self.hydrator.clone();
        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            let result = hydrator.hydrate(lookup).await;
            let _ = completions.send(Completion::Hydrated { id, result });
        });
    }

    fn on_hydrated(&mut self, id: i64, result: Result<Option<K::Entity>, SyncError>) {
        self.pending_hydrations.remove(&id);
        if self.discarded_hydrations.remove(&id) {
            tracing::trace!(view = K::NAME, id, "hydration discarded after delete");
            return;
        }

        match result {
            Ok(Some(item)) => match self.collection.apply(ViewOp::Insert(item)) {
                ApplyOutcome::Duplicate => {
                    tracing::trace!(view = K::NAME, id, "hydrated duplicate absorbed");
                }
                _ => {
                    tracing::trace!(view = K::NAME, id, "live insert applied");
                    self.emit(ViewEvent::ItemInserted { id });
                    self.check_size();
                }
            },
            Ok(None) => tracing::trace!(view = K::NAME, id, "hydration found no row"),
            Err(error) => {
                tracing::warn!(view = K::NAME, id, code = %error.code, "hydration failed");
                self.emit(ViewEvent::Error(error));
            }
        }
    }

    fn apply_delete(&mut self, id: i64) {
        if self.pending_hydrations.contains(&id) {
            self.discarded_hydrations.insert(id);
        }
        match self.collection.apply(ViewOp::Delete(id.into())) {
            ApplyOutcome::Absent => {
                tracing::trace!(view = K::NAME, id, "delete for absent entry absorbed");
            }
            _ => {
                tracing::trace!(view = K::NAME, id, "live delete applied");
                self.emit(ViewEvent::ItemRemoved { id });
            }
        }
    }

    fn dispatch_mutation(
        &mut self,
        mutation: Mutation,
        client_txn_id: String,
        reply: oneshot::Sender<Result<(), SyncError>>,
    ) {
        let kind = mutation.kind();
        let checked = self
            .machine
            .check(ViewAction::Mutate)
            .and_then(|()| MutationGateway::validate(&mutation));
        if let Err(error) = checked {
            tracing::debug!(view = K::NAME, %client_txn_id, code = %error.code, "mutation rejected locally");
            self.emit(normalize_mutation_outcome(
                client_txn_id,
                kind,
                MutationOutcome::Failure {
                    error: error.clone(),
                },
            ));
            let _ = reply.send(Err(error));
            return;
        }

        let mutation = self.kind.prepare_mutation(mutation, &self.collection);
        self.mutations_in_flight += 1;
        let gateway = self.gateway.clone();
        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            let result = gateway.execute(mutation).await;
            let _ = completions.send(Completion::Mutated {
                client_txn_id,
                kind,
                result,
                reply,
            });
        });
    }

    fn on_mutated(
        &mut self,
        client_txn_id: String,
        kind: MutationKind,
        result: &Result<(), SyncError>,
    ) {
        self.mutations_in_flight = self.mutations_in_flight.saturating_sub(1);
        if let Err(error) = result
            && !error.is_local()
        {
            tracing::warn!(view = K::NAME, %client_txn_id, code = %error.code, "mutation failed");
            self.emit(ViewEvent::Error(error.clone()));
        }
        self.emit(normalize_mutation_outcome(
            client_txn_id,
            kind,
            MutationOutcome::from(result),
        ));
    }

    fn check_size(&mut self) {
        if !self.size_warned && self.collection.len() >= self.item_warn_threshold {
            self.size_warned = true;
            tracing::warn!(
                view = K::NAME,
                items = self.collection.len(),
                threshold = self.item_warn_threshold,
                "view collection passed its soft size limit; entries are kept"
            );
        }
    }

    fn emit(&self, event: ViewEvent) {
        let _ = self.events.send(event);
    }

    fn publish(&self) {
        let closed = self.machine.is_closed();
        self.inbox.snapshots.send_replace(ViewSnapshot {
            items: self.collection.items().to_vec(),
            loading: !closed && (self.cursor.in_flight() || self.mutations_in_flight > 0),
            total_count: self.cursor.total_count(),
            has_more: self.cursor.has_more(self.collection.len()),
            state: self.machine.state(),
        });
    }

    fn shutdown(mut self) {
        self.listener.release();
        self.pending_hydrations.clear();
        self.discarded_hydrations.clear();
        if let Some(event) = self.machine.on_closed() {
            self.emit(event);
        }
        self.publish();
        tracing::debug!(view = K::NAME, items = self.collection.len(), "view closed");
    }
}
