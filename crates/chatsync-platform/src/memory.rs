//! In-process identity provider, relational store and change feed.
//!
//! One [`InMemoryServer`] is shared by any number of [`InMemoryClient`]s, each
//! carrying its own session. Test controls let callers pause event delivery,
//! hold queries at the gate and inject one-shot failures.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use chatsync_core::{
    ChangeEvent, ChangeFilter, ChangeOp, ChannelId, MessageId, QueryPage, QueryRequest, RawRow,
    Relation, RoomId, RowFilter, Session, SyncError, SyncErrorCategory,
};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value, json};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::{ChangeFeed, ChangeSubscription, RemoteStore, SessionProvider};

const MIN_PASSWORD_LEN: usize = 6;

/// Which queries a hold applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryScope {
    /// Snapshot scans (no `id` filter).
    Scans,
    /// Point lookups by `id`.
    Lookups,
    All,
}

/// Operation that an injected failure is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailurePoint {
    Scan,
    Lookup,
    Insert,
    Delete,
    Subscribe,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct QueryHold {
    scans: bool,
    lookups: bool,
}

impl QueryHold {
    fn set(&mut self, scope: QueryScope, held: bool) {
        match scope {
            QueryScope::Scans => self.scans = held,
            QueryScope::Lookups => self.lookups = held,
            QueryScope::All => {
                self.scans = held;
                self.lookups = held;
            }
        }
    }

    fn holds(&self, lookup: bool) -> bool {
        if lookup { self.lookups } else { self.scans }
    }
}

#[derive(Debug, Clone, Serialize)]
struct RoomRow {
    id: i64,
    name: String,
    created_by: Uuid,
    created_at: String,
}

#[derive(Debug, Clone, Serialize)]
struct MessageRow {
    id: i64,
    room_id: i64,
    content: String,
    created_by: Uuid,
    created_at: String,
}

#[derive(Debug)]
struct Account {
    user_id: Uuid,
    password: String,
}

#[derive(Debug, Default)]
struct Tables {
    rooms: BTreeMap<i64, RoomRow>,
    messages: BTreeMap<i64, MessageRow>,
    accounts: HashMap<String, Account>,
    emails: HashMap<Uuid, String>,
    next_room_id: i64,
    next_message_id: i64,
    last_timestamp_micros: i64,
}

impl Tables {
    /// Server clock, strictly increasing at microsecond resolution.
    fn next_timestamp(&mut self) -> Result<String, SyncError> {
        let micros = Utc::now()
            .timestamp_micros()
            .max(self.last_timestamp_micros.saturating_add(1));
        self.last_timestamp_micros = micros;
        DateTime::<Utc>::from_timestamp_micros(micros)
            .map(|at| at.to_rfc3339_opts(SecondsFormat::Micros, true))
            .ok_or_else(|| {
                SyncError::new(
                    SyncErrorCategory::Internal,
                    "clock_out_of_range",
                    "server clock left the representable range",
                )
            })
    }

    fn enrich(&self, mut row: Map<String, Value>, created_by: Uuid) -> Map<String, Value> {
        let email = self
            .emails
            .get(&created_by)
            .map_or(Value::Null, |email| Value::String(email.clone()));
        row.insert("creator_email".to_owned(), email);
        row
    }

    fn relation_rows(&self, relation: Relation) -> Result<Vec<Map<String, Value>>, SyncError> {
        match relation {
            Relation::Rooms => self.rooms.values().map(to_map).collect(),
            Relation::Messages => self.messages.values().map(to_map).collect(),
            Relation::RoomProfiles => self
                .rooms
                .values()
                .map(|room| Ok(self.enrich(to_map(room)?, room.created_by)))
                .collect(),
            Relation::MessageProfiles => self
                .messages
                .values()
                .map(|message| Ok(self.enrich(to_map(message)?, message.created_by)))
                .collect(),
        }
    }
}

#[derive(Debug)]
struct Registration {
    filter: ChangeFilter,
    tx: mpsc::UnboundedSender<ChangeEvent>,
}

#[derive(Debug, Default)]
struct FeedRegistry {
    channels: HashMap<ChannelId, Registration>,
    paused: bool,
    held: VecDeque<ChangeEvent>,
}

impl FeedRegistry {
    fn deliver(&self, event: &ChangeEvent) {
        for (channel, registration) in &self.channels {
            if registration.filter.accepts(event) {
                tracing::trace!(%channel, relation = %event.relation, op = ?event.op, "deliver change");
                let _ = registration.tx.send(event.clone());
            }
        }
    }
}

#[derive(Debug)]
struct ServerState {
    tables: Mutex<Tables>,
    feed: Mutex<FeedRegistry>,
    failures: Mutex<HashMap<FailurePoint, VecDeque<SyncError>>>,
    hold: watch::Sender<QueryHold>,
    waiting: watch::Sender<usize>,
    next_channel: AtomicU64,
}

impl Default for ServerState {
    fn default() -> Self {
        Self {
            tables: Mutex::default(),
            feed: Mutex::default(),
            failures: Mutex::default(),
            hold: watch::channel(QueryHold::default()).0,
            waiting: watch::channel(0).0,
            next_channel: AtomicU64::new(0),
        }
    }
}

struct WaitingGuard<'a>(&'a watch::Sender<usize>);

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.send_modify(|waiting| *waiting = waiting.saturating_sub(1));
    }
}

/// Shared backend state: accounts, tables and live channels.
#[derive(Debug, Clone, Default)]
pub struct InMemoryServer {
    state: Arc<ServerState>,
}

impl InMemoryServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// New client with no session.
    pub fn connect(&self) -> InMemoryClient {
        InMemoryClient {
            server: self.clone(),
            session: Arc::new(watch::channel(None).0),
        }
    }

    /// Insert a room on behalf of `creator`, publishing its change event.
    pub fn seed_room(&self, creator: &Session, name: &str) -> Result<RoomId, SyncError> {
        self.insert_row(Some(creator), Relation::Rooms, &json!({ "name": name }))
            .map(RoomId)
    }

    /// Insert a message on behalf of `creator`, publishing its change event.
    pub fn seed_message(
        &self,
        creator: &Session,
        room_id: RoomId,
        content: &str,
    ) -> Result<MessageId, SyncError> {
        self.insert_row(
            Some(creator),
            Relation::Messages,
            &json!({ "room_id": room_id.0, "content": content }),
        )
        .map(MessageId)
    }

    /// Inject a raw change event as if the database had emitted it.
    pub fn publish(&self, event: ChangeEvent) {
        self.dispatch(vec![event]);
    }

    /// Queue events instead of delivering them.
    pub fn pause_delivery(&self) {
        self.feed_or_recover().paused = true;
    }

    /// Deliver queued events in order and stop queueing.
    pub fn resume_delivery(&self) {
        let mut feed = self.feed_or_recover();
        feed.paused = false;
        while let Some(event) = feed.held.pop_front() {
            feed.deliver(&event);
        }
    }

    /// Park matching queries at the gate until released.
    pub fn hold_queries(&self, scope: QueryScope) {
        self.state.hold.send_modify(|hold| hold.set(scope, true));
    }

    pub fn release_queries(&self, scope: QueryScope) {
        self.state.hold.send_modify(|hold| hold.set(scope, false));
    }

    /// Queries currently parked at the gate.
    pub fn waiting_queries(&self) -> usize {
        *self.state.waiting.borrow()
    }

    /// Resolve once at least `count` queries are parked.
    pub async fn wait_for_waiting_queries(&self, count: usize) {
        let mut waiting = self.state.waiting.subscribe();
        let _ = waiting.wait_for(|waiting| *waiting >= count).await;
    }

    /// Fail the next operation at `point` with `error`. Failures queue per point.
    pub fn fail_next(&self, point: FailurePoint, error: SyncError) {
        self.state
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(point)
            .or_default()
            .push_back(error);
    }

    /// Open change channels.
    pub fn active_channels(&self) -> usize {
        self.feed_or_recover().channels.len()
    }

    pub fn room_count(&self) -> usize {
        self.state
            .tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .rooms
            .len()
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, SyncError> {
        self.state.tables.lock().map_err(|_| poisoned("tables"))
    }

    fn feed_or_recover(&self) -> MutexGuard<'_, FeedRegistry> {
        self.state.feed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_failure(&self, point: FailurePoint) -> Result<(), SyncError> {
        let mut failures = self.state.failures.lock().map_err(|_| poisoned("failures"))?;
        match failures.get_mut(&point).and_then(VecDeque::pop_front) {
            Some(error) => {
                tracing::debug!(?point, code = %error.code, "injected failure");
                Err(error)
            }
            None => Ok(()),
        }
    }

    async fn gate(&self, lookup: bool) {
        let mut hold = self.state.hold.subscribe();
        if !hold.borrow().holds(lookup) {
            return;
        }
        self.state.waiting.send_modify(|waiting| *waiting += 1);
        let _guard = WaitingGuard(&self.state.waiting);
        let _ = hold.wait_for(|hold| !hold.holds(lookup)).await;
    }

    fn dispatch(&self, events: Vec<ChangeEvent>) {
        let mut feed = self.feed_or_recover();
        if feed.paused {
            feed.held.extend(events);
            return;
        }
        for event in &events {
            feed.deliver(event);
        }
    }

    async fn query(&self, request: QueryRequest) -> Result<QueryPage, SyncError> {
        let lookup = request.is_point_lookup();
        tokio::task::yield_now().await;
        self.gate(lookup).await;
        self.take_failure(if lookup {
            FailurePoint::Lookup
        } else {
            FailurePoint::Scan
        })?;
        self.run_query(&request)
    }

    fn run_query(&self, request: &QueryRequest) -> Result<QueryPage, SyncError> {
        let mut rows = self.tables()?.relation_rows(request.relation)?;
        rows.retain(|row| request.filters.iter().all(|filter| filter.matches(row)));

        if let Some(order) = &request.order {
            rows.sort_by_key(|row| SortKey::of(row, &order.column));
            if !order.ascending {
                rows.reverse();
            }
        }

        let total_count = request.count_exact.then_some(rows.len() as u64);
        let rows: Vec<Value> = match request.range {
            Some(range) => rows
                .into_iter()
                .skip(usize::try_from(range.offset).unwrap_or(usize::MAX))
                .take(usize::try_from(range.limit).unwrap_or(usize::MAX))
                .map(Value::Object)
                .collect(),
            None => rows.into_iter().map(Value::Object).collect(),
        };

        tracing::trace!(
            relation = %request.relation,
            rows = rows.len(),
            ?total_count,
            "query served"
        );
        Ok(QueryPage { rows, total_count })
    }

    fn insert_row(
        &self,
        caller: Option<&Session>,
        relation: Relation,
        record: &Value,
    ) -> Result<i64, SyncError> {
        self.take_failure(FailurePoint::Insert)?;
        let caller = caller.ok_or_else(|| SyncError::not_signed_in("insert"))?;

        let (id, raw) = {
            let mut tables = self.tables()?;
            match relation {
                Relation::Rooms => {
                    let name = required_text(record, "name")?;
                    let created_at = tables.next_timestamp()?;
                    tables.next_room_id += 1;
                    let row = RoomRow {
                        id: tables.next_room_id,
                        name,
                        created_by: caller.user_id,
                        created_at,
                    };
                    let raw = to_map(&row)?;
                    tables.rooms.insert(row.id, row.clone());
                    (row.id, raw)
                }
                Relation::Messages => {
                    let room_id = record
                        .get("room_id")
                        .and_then(Value::as_i64)
                        .ok_or_else(|| missing_column("room_id"))?;
                    let content = required_text(record, "content")?;
                    if !tables.rooms.contains_key(&room_id) {
                        return Err(SyncError::new(
                            SyncErrorCategory::Query,
                            "foreign_key_violation",
                            format!("room {room_id} does not exist"),
                        ));
                    }
                    let created_at = tables.next_timestamp()?;
                    tables.next_message_id += 1;
                    let row = MessageRow {
                        id: tables.next_message_id,
                        room_id,
                        content,
                        created_by: caller.user_id,
                        created_at,
                    };
                    let raw = to_map(&row)?;
                    tables.messages.insert(row.id, row.clone());
                    (row.id, raw)
                }
                other => return Err(read_only(other)),
            }
        };

        tracing::debug!(%relation, id, user = %caller.user_id, "row inserted");
        self.dispatch(vec![ChangeEvent {
            relation,
            op: ChangeOp::Insert,
            row: RawRow(raw),
        }]);
        Ok(id)
    }

    fn delete_rows(
        &self,
        caller: Option<&Session>,
        relation: Relation,
        filter: &RowFilter,
    ) -> Result<(), SyncError> {
        self.take_failure(FailurePoint::Delete)?;
        let caller = caller.ok_or_else(|| SyncError::not_signed_in("delete"))?;
        if relation != Relation::Rooms {
            return Err(read_only(relation));
        }

        let events = {
            let mut tables = self.tables()?;
            let mut targets = Vec::new();
            for room in tables.rooms.values() {
                let raw = to_map(room)?;
                if filter.matches(&raw) {
                    if room.created_by != caller.user_id {
                        return Err(SyncError::new(
                            SyncErrorCategory::Auth,
                            "permission_denied",
                            format!("room {} can only be deleted by its creator", room.id),
                        ));
                    }
                    targets.push((room.id, raw));
                }
            }

            let mut events = Vec::new();
            for (room_id, raw) in targets {
                let orphaned: Vec<i64> = tables
                    .messages
                    .values()
                    .filter(|message| message.room_id == room_id)
                    .map(|message| message.id)
                    .collect();
                for message_id in orphaned {
                    if let Some(message) = tables.messages.remove(&message_id) {
                        events.push(ChangeEvent {
                            relation: Relation::Messages,
                            op: ChangeOp::Delete,
                            row: RawRow(to_map(&message)?),
                        });
                    }
                }
                tables.rooms.remove(&room_id);
                events.push(ChangeEvent {
                    relation: Relation::Rooms,
                    op: ChangeOp::Delete,
                    row: RawRow(raw),
                });
            }
            events
        };

        tracing::debug!(%relation, deleted = events.len(), "rows deleted");
        self.dispatch(events);
        Ok(())
    }

    fn open_channel(&self, filter: ChangeFilter) -> Result<ChangeSubscription, SyncError> {
        self.take_failure(FailurePoint::Subscribe)?;
        let channel = ChannelId(self.state.next_channel.fetch_add(1, Ordering::Relaxed) + 1);
        let (tx, rx) = mpsc::unbounded_channel();
        self.state
            .feed
            .lock()
            .map_err(|_| poisoned("feed"))?
            .channels
            .insert(channel, Registration { filter, tx });
        tracing::debug!(%channel, "change channel opened");

        let server = self.clone();
        Ok(ChangeSubscription::new(channel, rx, move |channel| {
            server.feed_or_recover().channels.remove(&channel);
        }))
    }

    fn register_account(&self, email: &str, password: &str) -> Result<Session, SyncError> {
        let email = normalize_email(email)?;
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(SyncError::validation(
                "weak_password",
                format!("password must be at least {MIN_PASSWORD_LEN} characters"),
            ));
        }

        let mut tables = self.tables()?;
        if tables.accounts.contains_key(&email) {
            return Err(SyncError::new(
                SyncErrorCategory::Auth,
                "user_already_exists",
                "an account with this email already exists",
            ));
        }
        let user_id = Uuid::new_v4();
        tables.accounts.insert(
            email.clone(),
            Account {
                user_id,
                password: password.to_owned(),
            },
        );
        tables.emails.insert(user_id, email.clone());
        tracing::debug!(%user_id, "account registered");
        Ok(issue_session(user_id, email))
    }

    fn authenticate(&self, email: &str, password: &str) -> Result<Session, SyncError> {
        let email = normalize_email(email)?;
        let tables = self.tables()?;
        match tables.accounts.get(&email) {
            Some(account) if account.password == password => {
                Ok(issue_session(account.user_id, email))
            }
            _ => Err(SyncError::new(
                SyncErrorCategory::Auth,
                "invalid_credentials",
                "invalid email or password",
            )),
        }
    }
}

/// One signed-in (or anonymous) connection to an [`InMemoryServer`].
#[derive(Debug, Clone)]
pub struct InMemoryClient {
    server: InMemoryServer,
    session: Arc<watch::Sender<Option<Session>>>,
}

impl InMemoryClient {
    pub fn server(&self) -> &InMemoryServer {
        &self.server
    }

    /// Create an account and sign in with it.
    pub async fn sign_up(&self, email: &str, password: &str) -> Result<Session, SyncError> {
        let session = self.server.register_account(email, password)?;
        self.session.send_replace(Some(session.clone()));
        Ok(session)
    }

    pub async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Session, SyncError> {
        let session = self.server.authenticate(email, password)?;
        self.session.send_replace(Some(session.clone()));
        Ok(session)
    }

    pub async fn sign_out(&self) {
        self.session.send_replace(None);
    }

    fn caller(&self) -> Option<Session> {
        self.session.borrow().clone()
    }
}

#[async_trait]
impl SessionProvider for InMemoryClient {
    async fn current_session(&self) -> Result<Option<Session>, SyncError> {
        Ok(self.caller())
    }

    fn session_changes(&self) -> watch::Receiver<Option<Session>> {
        self.session.subscribe()
    }
}

#[async_trait]
impl RemoteStore for InMemoryClient {
    async fn query(&self, request: QueryRequest) -> Result<QueryPage, SyncError> {
        self.server.query(request).await
    }

    async fn insert(&self, relation: Relation, record: Value) -> Result<(), SyncError> {
        tokio::task::yield_now().await;
        self.server
            .insert_row(self.caller().as_ref(), relation, &record)
            .map(|_| ())
    }

    async fn delete(&self, relation: Relation, filter: RowFilter) -> Result<(), SyncError> {
        tokio::task::yield_now().await;
        self.server
            .delete_rows(self.caller().as_ref(), relation, &filter)
    }
}

impl ChangeFeed for InMemoryClient {
    fn subscribe(&self, filter: ChangeFilter) -> Result<ChangeSubscription, SyncError> {
        self.server.open_channel(filter)
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum SortKey {
    Missing,
    Number(i64),
    Text(String),
}

impl SortKey {
    fn of(row: &Map<String, Value>, column: &str) -> Self {
        match row.get(column) {
            Some(Value::Number(number)) => number.as_i64().map_or(Self::Missing, Self::Number),
            Some(Value::String(text)) => Self::Text(text.clone()),
            _ => Self::Missing,
        }
    }
}

fn to_map<T: Serialize>(row: &T) -> Result<Map<String, Value>, SyncError> {
    match serde_json::to_value(row) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(SyncError::new(
            SyncErrorCategory::Serialization,
            "row_encode_error",
            format!("row encoded as non-object: {other}"),
        )),
        Err(err) => Err(SyncError::new(
            SyncErrorCategory::Serialization,
            "row_encode_error",
            err.to_string(),
        )),
    }
}

fn required_text(record: &Value, column: &str) -> Result<String, SyncError> {
    record
        .get(column)
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
        .ok_or_else(|| missing_column(column))
}

fn missing_column(column: &str) -> SyncError {
    SyncError::new(
        SyncErrorCategory::Query,
        "not_null_violation",
        format!("column '{column}' is required"),
    )
}

fn read_only(relation: Relation) -> SyncError {
    SyncError::new(
        SyncErrorCategory::Query,
        "operation_not_supported",
        format!("'{relation}' does not accept this write"),
    )
}

fn poisoned(what: &str) -> SyncError {
    SyncError::new(
        SyncErrorCategory::Internal,
        "poisoned_lock",
        format!("{what} lock is poisoned"),
    )
}

fn normalize_email(email: &str) -> Result<String, SyncError> {
    let email = email.trim().to_lowercase();
    if !email.contains('@') {
        return Err(SyncError::validation(
            "invalid_email",
            "email must contain '@'",
        ));
    }
    Ok(email)
}

fn issue_session(user_id: Uuid, email: String) -> Session {
    Session {
        user_id,
        email: Some(email),
        access_token: Uuid::new_v4().to_string(),
    }
}
