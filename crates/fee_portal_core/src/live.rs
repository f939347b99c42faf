//! crates/fee_portal_core/src/live.rs
//!
//! The live view synchronizer: an in-memory mirror of remote rows, seeded by one
//! bulk read and kept current by a single change-event subscription.
//!
//! Two shapes share the same subscription lifecycle:
//! - [`LiveView`] mirrors a whole collection (the roster).
//! - [`LiveRecord`] mirrors one row owned by a principal (the profile).

use async_trait::async_trait;
use futures::future::{self, Either};
use futures::stream::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::domain::{Principal, Student};
use crate::ports::{ChangeFeedService, DatabaseService, PortResult};

//=========================================================================================
// Row Identity
//=========================================================================================

/// A row with a stable identifier.
pub trait Keyed {
    fn key(&self) -> Uuid;
}

/// A row that belongs to exactly one principal.
pub trait Owned {
    fn owner(&self) -> Uuid;
}

impl Keyed for Student {
    fn key(&self) -> Uuid {
        self.id
    }
}

impl Owned for Student {
    fn owner(&self) -> Uuid {
        self.user_id
    }
}

/// Which rows of a table a read or subscription covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    All,
    OwnedBy(Uuid),
}

impl Scope {
    pub fn admits<T: Owned>(&self, row: &T) -> bool {
        match self {
            Scope::All => true,
            Scope::OwnedBy(user_id) => row.owner() == *user_id,
        }
    }

    /// Deletes carry only an identifier, so owner-scoped channels never see them.
    pub fn admits_event<T: Owned>(&self, event: &ChangeEvent<T>) -> bool {
        match event {
            ChangeEvent::Insert(row) | ChangeEvent::Update(row) => self.admits(row),
            ChangeEvent::Delete(_) => matches!(self, Scope::All),
        }
    }
}

//=========================================================================================
// Change Events and Subscriptions
//=========================================================================================

/// A notification of a write on a remote table, delivered in emission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent<T> {
    Insert(T),
    Update(T),
    Delete(Uuid),
}

impl<T> ChangeEvent<T> {
    pub fn kind(&self) -> &'static str {
        match self {
            ChangeEvent::Insert(_) => "insert",
            ChangeEvent::Update(_) => "update",
            ChangeEvent::Delete(_) => "delete",
        }
    }
}

pub type EventStream<T> = Pin<Box<dyn Stream<Item = ChangeEvent<T>> + Send>>;

/// An open change-event channel.
///
/// Dropping the subscription cancels it, so a consumer that goes out of scope
/// can never leave a live channel behind.
pub struct Subscription<T> {
    events: EventStream<T>,
    token: CancellationToken,
}

impl<T> Subscription<T> {
    /// Wraps a producer stream. The producer should stop once `token` is cancelled.
    pub fn new(events: EventStream<T>, token: CancellationToken) -> Self {
        Self { events, token }
    }

    /// Waits for the next event. `None` means the channel is gone.
    pub async fn next(&mut self) -> Option<ChangeEvent<T>> {
        let cancelled = self.token.cancelled();
        futures::pin_mut!(cancelled);
        match future::select(cancelled, self.events.next()).await {
            Either::Left(_) => None,
            Either::Right((event, _)) => event,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

//=========================================================================================
// Row Sources
//=========================================================================================

/// A remote table the synchronizer can read in bulk and subscribe to.
#[async_trait]
pub trait RowSource<T: Send + 'static>: Send + Sync {
    /// All rows in `scope`, newest first.
    async fn read(&self, scope: &Scope) -> PortResult<Vec<T>>;

    async fn subscribe(&self, scope: &Scope) -> PortResult<Subscription<T>>;
}

/// The students table, reached through explicitly injected service handles.
#[derive(Clone)]
pub struct StudentRows {
    db: Arc<dyn DatabaseService>,
    feed: Arc<dyn ChangeFeedService>,
}

impl StudentRows {
    pub fn new(db: Arc<dyn DatabaseService>, feed: Arc<dyn ChangeFeedService>) -> Self {
        Self { db, feed }
    }
}

#[async_trait]
impl RowSource<Student> for StudentRows {
    async fn read(&self, scope: &Scope) -> PortResult<Vec<Student>> {
        self.db.list_students(scope).await
    }

    async fn subscribe(&self, scope: &Scope) -> PortResult<Subscription<Student>> {
        self.feed.subscribe_students(*scope).await
    }
}

//=========================================================================================
// The Reducer
//=========================================================================================

/// Applies one change event to a cached collection, returning whether it changed.
///
/// Inserts append without re-sorting; an insert for a row already cached replaces
/// it in place, so a replayed insert never duplicates a row. Updates and deletes
/// that name an unknown identifier leave the collection untouched.
pub fn reduce<T: Keyed>(rows: &mut Vec<T>, event: ChangeEvent<T>) -> bool {
    match event {
        ChangeEvent::Insert(row) => {
            let key = row.key();
            match rows.iter_mut().find(|existing| existing.key() == key) {
                Some(slot) => *slot = row,
                None => rows.push(row),
            }
            true
        }
        ChangeEvent::Update(row) => {
            let key = row.key();
            match rows.iter_mut().find(|existing| existing.key() == key) {
                Some(slot) => {
                    *slot = row;
                    true
                }
                None => false,
            }
        }
        ChangeEvent::Delete(key) => match rows.iter().position(|existing| existing.key() == key) {
            Some(index) => {
                rows.remove(index);
                true
            }
            None => false,
        },
    }
}

//=========================================================================================
// Subscription Lifecycle (shared by both view shapes)
//=========================================================================================

struct Channel<T> {
    subscription: Option<Subscription<T>>,
}

impl<T: Send + 'static> Channel<T> {
    fn new() -> Self {
        Self { subscription: None }
    }

    fn is_open(&self) -> bool {
        self.subscription.is_some()
    }

    async fn open(&mut self, source: &dyn RowSource<T>, scope: &Scope) -> bool {
        if self.is_open() {
            debug!("Change channel already open; ignoring subscribe.");
            return true;
        }
        match source.subscribe(scope).await {
            Ok(subscription) => {
                debug!("Change channel opened for {:?}", scope);
                self.subscription = Some(subscription);
                true
            }
            Err(e) => {
                error!("Failed to open change channel: {:?}", e);
                false
            }
        }
    }

    async fn next(&mut self) -> Option<ChangeEvent<T>> {
        let Some(subscription) = self.subscription.as_mut() else {
            return future::pending().await;
        };
        match subscription.next().await {
            Some(event) => Some(event),
            None => {
                warn!("Change channel closed; live updates stopped.");
                self.subscription = None;
                None
            }
        }
    }

    fn close(&mut self) -> bool {
        match self.subscription.take() {
            Some(subscription) => {
                subscription.unsubscribe();
                debug!("Change channel closed by teardown.");
                true
            }
            None => false,
        }
    }
}

//=========================================================================================
// LiveView (collection)
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Loading,
    Ready,
    /// The bulk read failed; the cache is empty rather than stale.
    Unavailable,
}

/// A cached collection mirroring a remote table.
pub struct LiveView<T> {
    rows: Vec<T>,
    state: LoadState,
    channel: Channel<T>,
}

impl<T: Keyed + Send + 'static> LiveView<T> {
    pub fn new() -> Self {
        Self {
            rows: Vec::new(),
            state: LoadState::Loading,
            channel: Channel::new(),
        }
    }

    /// Replaces the cache with one bulk read. Failures are logged, never returned.
    pub async fn initialize(&mut self, source: &dyn RowSource<T>, scope: &Scope) {
        match source.read(scope).await {
            Ok(rows) => {
                debug!("Live view loaded {} rows.", rows.len());
                self.rows = rows;
                self.state = LoadState::Ready;
            }
            Err(e) => {
                error!("Failed to load live view: {:?}", e);
                self.rows.clear();
                self.state = LoadState::Unavailable;
            }
        }
    }

    /// Subscribes, then loads. Events for writes that land during the read stay
    /// queued on the channel and replay onto the loaded rows, so none is lost.
    /// Returns whether a channel is open afterwards.
    pub async fn open(&mut self, source: &dyn RowSource<T>, scope: &Scope) -> bool {
        let live = self.subscribe(source, scope).await;
        self.initialize(source, scope).await;
        live
    }

    /// Opens the change channel. Returns whether a channel is open afterwards.
    pub async fn subscribe(&mut self, source: &dyn RowSource<T>, scope: &Scope) -> bool {
        self.channel.open(source, scope).await
    }

    pub fn apply_event(&mut self, event: ChangeEvent<T>) -> bool {
        reduce(&mut self.rows, event)
    }

    /// Waits for the next change event.
    ///
    /// Yields `None` once when the channel drops and pends forever afterwards,
    /// so it is safe to poll from a `select!` loop.
    pub async fn next_event(&mut self) -> Option<ChangeEvent<T>> {
        self.channel.next().await
    }

    /// Closes the change channel. Returns `false` if none was open.
    pub fn teardown(&mut self) -> bool {
        self.channel.close()
    }

    pub fn rows(&self) -> &[T] {
        &self.rows
    }

    pub fn state(&self) -> LoadState {
        self.state
    }

    pub fn is_live(&self) -> bool {
        self.channel.is_open()
    }
}

impl<T: Keyed + Send + 'static> Default for LiveView<T> {
    fn default() -> Self {
        Self::new()
    }
}

//=========================================================================================
// LiveRecord (singleton)
//=========================================================================================

/// A single cached row belonging to the current principal.
pub struct LiveRecord<T> {
    row: Option<T>,
    owner: Option<Uuid>,
    channel: Channel<T>,
}

impl<T: Keyed + Owned + Send + 'static> LiveRecord<T> {
    pub fn new() -> Self {
        Self {
            row: None,
            owner: None,
            channel: Channel::new(),
        }
    }

    pub fn load(&mut self, row: T) {
        self.owner = Some(row.owner());
        self.row = Some(row);
    }

    /// Opens a channel filtered to the principal's rows. Without a principal no
    /// channel is opened and `false` is returned.
    pub async fn subscribe(
        &mut self,
        source: &dyn RowSource<T>,
        principal: Option<&Principal>,
    ) -> bool {
        let Some(principal) = principal else {
            debug!("No principal resolved; profile channel not opened.");
            return false;
        };
        self.owner = Some(principal.user_id);
        self.channel
            .open(source, &Scope::OwnedBy(principal.user_id))
            .await
    }

    /// Only updates for the subscribed principal replace the row.
    pub fn apply_event(&mut self, event: ChangeEvent<T>) -> bool {
        match event {
            ChangeEvent::Update(row) if Some(row.owner()) == self.owner => {
                self.row = Some(row);
                true
            }
            _ => false,
        }
    }

    /// Stores a row the remote store has already confirmed.
    pub fn commit(&mut self, row: T) -> bool {
        match &self.row {
            Some(current) if current.key() != row.key() => false,
            _ => {
                self.load(row);
                true
            }
        }
    }

    pub async fn next_event(&mut self) -> Option<ChangeEvent<T>> {
        self.channel.next().await
    }

    pub fn teardown(&mut self) -> bool {
        self.channel.close()
    }

    pub fn get(&self) -> Option<&T> {
        self.row.as_ref()
    }

    pub fn is_live(&self) -> bool {
        self.channel.is_open()
    }
}

impl<T: Keyed + Owned + Send + 'static> Default for LiveRecord<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::PortError;
    use chrono::Utc;
    use futures::channel::mpsc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn student(name: &str, fees_paid: bool) -> Student {
        let now = Utc::now();
        Student {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            name: name.to_string(),
            email: format!("{}@school.edu", name.to_lowercase()),
            fees_paid,
            created_at: now,
            updated_at: now,
        }
    }

    /// A row source fed by a test-controlled channel.
    struct FakeSource {
        rows: Option<Vec<Student>>,
        events: Mutex<Option<mpsc::UnboundedReceiver<ChangeEvent<Student>>>>,
        subscribes: AtomicUsize,
        token: CancellationToken,
    }

    impl FakeSource {
        fn new(rows: Option<Vec<Student>>) -> (Self, mpsc::UnboundedSender<ChangeEvent<Student>>) {
            let (tx, rx) = mpsc::unbounded();
            let source = Self {
                rows,
                events: Mutex::new(Some(rx)),
                subscribes: AtomicUsize::new(0),
                token: CancellationToken::new(),
            };
            (source, tx)
        }
    }

    #[async_trait]
    impl RowSource<Student> for FakeSource {
        async fn read(&self, _scope: &Scope) -> PortResult<Vec<Student>> {
            self.rows
                .clone()
                .ok_or_else(|| PortError::Unexpected("store offline".to_string()))
        }

        async fn subscribe(&self, _scope: &Scope) -> PortResult<Subscription<Student>> {
            self.subscribes.fetch_add(1, Ordering::SeqCst);
            let rx = self
                .events
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| PortError::Unexpected("already subscribed".to_string()))?;
            Ok(Subscription::new(Box::pin(rx), self.token.clone()))
        }
    }

    #[test]
    fn insert_appends_at_the_end() {
        let mut rows = vec![student("Ana", false)];
        let bo = student("Bo", true);
        assert!(reduce(&mut rows, ChangeEvent::Insert(bo.clone())));
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1], bo);
    }

    #[test]
    fn update_replaces_matching_row_in_place() {
        let ana = student("Ana", false);
        let mut rows = vec![ana.clone(), student("Bo", false)];
        let paid = Student {
            fees_paid: true,
            ..ana.clone()
        };
        assert!(reduce(&mut rows, ChangeEvent::Update(paid.clone())));
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], paid);
    }

    #[test]
    fn replayed_insert_replaces_instead_of_duplicating() {
        let ana = student("Ana", false);
        let mut rows = vec![ana.clone()];
        let paid = Student {
            fees_paid: true,
            ..ana.clone()
        };
        assert!(reduce(&mut rows, ChangeEvent::Insert(paid.clone())));
        assert_eq!(rows, vec![paid]);
    }

    #[test]
    fn unknown_identifiers_leave_cache_unchanged() {
        let mut rows = vec![student("Ana", false), student("Bo", true)];
        let before = rows.clone();

        assert!(!reduce(&mut rows, ChangeEvent::Update(student("Cy", true))));
        assert!(!reduce(&mut rows, ChangeEvent::Delete(Uuid::new_v4())));
        assert_eq!(rows, before);
    }

    #[test]
    fn delete_removes_matching_row() {
        let ana = student("Ana", false);
        let mut rows = vec![ana.clone(), student("Bo", true)];
        assert!(reduce(&mut rows, ChangeEvent::Delete(ana.id)));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "Bo");
    }

    #[test]
    fn owner_scope_filters_rows_and_drops_deletes() {
        let ana = student("Ana", false);
        let scope = Scope::OwnedBy(ana.user_id);
        assert!(scope.admits(&ana));
        assert!(!scope.admits(&student("Bo", false)));
        assert!(!scope.admits_event::<Student>(&ChangeEvent::Delete(ana.id)));
        assert!(Scope::All.admits_event::<Student>(&ChangeEvent::Delete(ana.id)));
    }

    #[tokio::test]
    async fn failed_bulk_read_leaves_view_empty_and_not_loading() {
        let (source, _tx) = FakeSource::new(None);
        let mut view: LiveView<Student> = LiveView::new();
        assert_eq!(view.state(), LoadState::Loading);

        view.initialize(&source, &Scope::All).await;

        assert_eq!(view.state(), LoadState::Unavailable);
        assert!(view.rows().is_empty());
    }

    #[tokio::test]
    async fn events_are_applied_in_delivery_order() {
        let ana = student("Ana", false);
        let (source, tx) = FakeSource::new(Some(vec![ana.clone()]));
        let mut view: LiveView<Student> = LiveView::new();
        view.initialize(&source, &Scope::All).await;
        assert!(view.subscribe(&source, &Scope::All).await);

        let bo = student("Bo", true);
        tx.unbounded_send(ChangeEvent::Insert(bo.clone())).unwrap();
        tx.unbounded_send(ChangeEvent::Delete(ana.id)).unwrap();

        for _ in 0..2 {
            let event = view.next_event().await.expect("event expected");
            view.apply_event(event);
        }
        assert_eq!(view.rows(), &[bo]);
    }

    #[tokio::test]
    async fn writes_during_the_initial_read_are_not_lost() {
        let ana = student("Ana", false);
        let (source, tx) = FakeSource::new(Some(vec![ana.clone()]));
        let bo = student("Bo", true);
        // Ana was inserted before the read saw her; Bo landed after it.
        tx.unbounded_send(ChangeEvent::Insert(ana.clone())).unwrap();
        tx.unbounded_send(ChangeEvent::Insert(bo.clone())).unwrap();

        let mut view: LiveView<Student> = LiveView::new();
        assert!(view.open(&source, &Scope::All).await);
        assert_eq!(view.state(), LoadState::Ready);
        assert_eq!(view.rows(), &[ana.clone()]);

        for _ in 0..2 {
            let event = view.next_event().await.expect("event expected");
            view.apply_event(event);
        }
        assert_eq!(view.rows(), &[ana, bo]);
    }

    #[tokio::test]
    async fn subscribe_is_idempotent() {
        let (source, _tx) = FakeSource::new(Some(Vec::new()));
        let mut view: LiveView<Student> = LiveView::new();
        assert!(view.subscribe(&source, &Scope::All).await);
        assert!(view.subscribe(&source, &Scope::All).await);
        assert_eq!(source.subscribes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn teardown_cancels_the_producer_token() {
        let (source, _tx) = FakeSource::new(Some(Vec::new()));
        let mut view: LiveView<Student> = LiveView::new();
        view.subscribe(&source, &Scope::All).await;

        assert!(view.teardown());
        assert!(source.token.is_cancelled());
        assert!(!view.teardown());
        assert!(!view.is_live());
    }

    #[tokio::test]
    async fn dropping_the_view_tears_down_its_channel() {
        let (source, _tx) = FakeSource::new(Some(Vec::new()));
        {
            let mut view: LiveView<Student> = LiveView::new();
            view.subscribe(&source, &Scope::All).await;
        }
        assert!(source.token.is_cancelled());
    }

    #[tokio::test]
    async fn closed_channel_yields_none_once() {
        let (source, tx) = FakeSource::new(Some(Vec::new()));
        let mut view: LiveView<Student> = LiveView::new();
        view.subscribe(&source, &Scope::All).await;
        drop(tx);

        assert!(view.next_event().await.is_none());
        assert!(!view.is_live());
    }

    #[tokio::test]
    async fn record_without_principal_does_not_subscribe() {
        let (source, _tx) = FakeSource::new(Some(Vec::new()));
        let mut record: LiveRecord<Student> = LiveRecord::new();
        assert!(!record.subscribe(&source, None).await);
        assert_eq!(source.subscribes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn record_accepts_only_its_owners_updates() {
        let ana = student("Ana", false);
        let mut record = LiveRecord::new();
        record.load(ana.clone());

        let stranger = student("Bo", true);
        assert!(!record.apply_event(ChangeEvent::Update(stranger)));
        assert!(!record.apply_event(ChangeEvent::Insert(ana.clone())));
        assert!(!record.apply_event(ChangeEvent::Delete(ana.id)));

        let renamed = Student {
            name: "Ana Maria".to_string(),
            ..ana.clone()
        };
        assert!(record.apply_event(ChangeEvent::Update(renamed.clone())));
        assert_eq!(record.get(), Some(&renamed));
    }

    #[test]
    fn commit_rejects_a_different_row() {
        let ana = student("Ana", false);
        let mut record = LiveRecord::new();
        record.load(ana.clone());
        assert!(!record.commit(student("Bo", false)));
        assert_eq!(record.get(), Some(&ana));
    }
}
