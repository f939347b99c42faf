//! services/api/src/adapters/change_feed.rs
//!
//! Change-event fan-out for the students table. It implements the
//! `ChangeFeedService` port from the `core` crate.
//!
//! `ChangeHub` is an in-process broadcast channel. Writers (the in-memory store, or
//! `PgChangeRelay` listening to PostgreSQL notifications) publish into it, and every
//! subscriber receives a scope-filtered stream of events in publish order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fee_portal_core::domain::Student;
use fee_portal_core::live::{ChangeEvent, Scope, Subscription};
use fee_portal_core::ports::{ChangeFeedService, PortResult};
use futures::stream::{Stream, StreamExt};
use serde::Deserialize;
use sqlx::postgres::{PgListener, PgPool};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// The PostgreSQL notification channel the students trigger publishes on.
pub const STUDENT_CHANNEL: &str = "students_changes";

const DEFAULT_CAPACITY: usize = 1024;

//=========================================================================================
// The Hub
//=========================================================================================

pub struct ChangeHub {
    sender: broadcast::Sender<ChangeEvent<Student>>,
    shutdown: CancellationToken,
}

impl ChangeHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn publish(&self, event: ChangeEvent<Student>) {
        let kind = event.kind();
        match self.sender.send(event) {
            Ok(receivers) => debug!("Published student {} to {} subscribers.", kind, receivers),
            Err(_) => debug!("Published student {} with no subscribers.", kind),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Ends every open subscription.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Default for ChangeHub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChangeFeedService for ChangeHub {
    async fn subscribe_students(&self, scope: Scope) -> PortResult<Subscription<Student>> {
        let mut receiver = self.sender.subscribe();
        let token = self.shutdown.child_token();
        let stop = token.clone();

        let events = async_stream::stream! {
            loop {
                let received = tokio::select! {
                    _ = stop.cancelled() => break,
                    received = receiver.recv() => received,
                };
                match received {
                    Ok(event) => {
                        if scope.admits_event(&event) {
                            yield event;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        // A cache that missed events can no longer be trusted.
                        warn!("Change subscriber fell behind by {} events; closing channel.", skipped);
                        break;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        };

        debug!("Opened student change subscription for {:?}", scope);
        Ok(Subscription::new(Box::pin(events), token))
    }
}

//=========================================================================================
// PostgreSQL Notification Relay
//=========================================================================================

#[derive(Deserialize)]
struct StudentPayload {
    id: Uuid,
    user_id: Uuid,
    name: String,
    email: String,
    fees_paid: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl StudentPayload {
    fn to_domain(self) -> Student {
        Student {
            id: self.id,
            user_id: self.user_id,
            name: self.name,
            email: self.email,
            fees_paid: self.fees_paid,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Deserialize)]
struct StudentNotification {
    op: String,
    record: Option<StudentPayload>,
    old_id: Option<Uuid>,
}

/// Decodes a `students_changes` notification payload.
pub fn decode_notification(payload: &str) -> Result<ChangeEvent<Student>, String> {
    let notification: StudentNotification =
        serde_json::from_str(payload).map_err(|e| e.to_string())?;

    match (notification.op.as_str(), notification.record, notification.old_id) {
        ("INSERT", Some(record), _) => Ok(ChangeEvent::Insert(record.to_domain())),
        ("UPDATE", Some(record), _) => Ok(ChangeEvent::Update(record.to_domain())),
        ("DELETE", _, Some(old_id)) => Ok(ChangeEvent::Delete(old_id)),
        (op, _, _) => Err(format!("malformed '{}' notification", op)),
    }
}

/// Forwards PostgreSQL notifications into a `ChangeHub`.
pub struct PgChangeRelay;

impl PgChangeRelay {
    /// Starts listening and returns the relay task. A listener failure stops the
    /// relay and shuts the hub down, so every open view reports that it is no
    /// longer live.
    pub async fn spawn(pool: &PgPool, hub: Arc<ChangeHub>) -> Result<JoinHandle<()>, sqlx::Error> {
        let mut listener = PgListener::connect_with(pool).await?;
        listener.listen(STUDENT_CHANNEL).await?;
        info!("Listening for student changes on '{}'.", STUDENT_CHANNEL);

        let payloads = listener
            .into_stream()
            .map(|received| received.map(|notification| notification.payload().to_string()));
        Ok(tokio::spawn(async move {
            relay_notifications(payloads, &hub).await;
        }))
    }
}

/// Publishes each decodable payload until the source fails or ends, then shuts
/// the hub down.
async fn relay_notifications<S, E>(payloads: S, hub: &ChangeHub)
where
    S: Stream<Item = Result<String, E>>,
    E: std::fmt::Debug,
{
    futures::pin_mut!(payloads);
    while let Some(received) = payloads.next().await {
        match received {
            Ok(payload) => match decode_notification(&payload) {
                Ok(event) => hub.publish(event),
                Err(e) => warn!("Ignoring undecodable student notification: {}", e),
            },
            Err(e) => {
                error!("Student change listener failed: {:?}", e);
                break;
            }
        }
    }
    warn!("Student change relay stopped; closing all change subscriptions.");
    hub.shutdown();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn student(user_id: Uuid, name: &str) -> Student {
        let now = Utc::now();
        Student {
            id: Uuid::new_v4(),
            user_id,
            name: name.to_string(),
            email: format!("{}@school.edu", name.to_lowercase()),
            fees_paid: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn subscribers_receive_events_in_publish_order() {
        let hub = ChangeHub::new();
        let mut subscription = hub.subscribe_students(Scope::All).await.unwrap();

        let ana = student(Uuid::new_v4(), "Ana");
        hub.publish(ChangeEvent::Insert(ana.clone()));
        hub.publish(ChangeEvent::Delete(ana.id));

        assert_eq!(subscription.next().await, Some(ChangeEvent::Insert(ana.clone())));
        assert_eq!(subscription.next().await, Some(ChangeEvent::Delete(ana.id)));
    }

    #[tokio::test]
    async fn owner_scope_only_sees_own_rows() {
        let hub = ChangeHub::new();
        let owner = Uuid::new_v4();
        let mut subscription = hub.subscribe_students(Scope::OwnedBy(owner)).await.unwrap();

        let other = student(Uuid::new_v4(), "Bo");
        let mine = student(owner, "Ana");
        hub.publish(ChangeEvent::Update(other));
        hub.publish(ChangeEvent::Delete(mine.id));
        hub.publish(ChangeEvent::Update(mine.clone()));

        assert_eq!(subscription.next().await, Some(ChangeEvent::Update(mine)));
    }

    #[tokio::test]
    async fn dropping_a_subscription_releases_its_receiver() {
        let hub = ChangeHub::new();
        let subscription = hub.subscribe_students(Scope::All).await.unwrap();
        assert_eq!(hub.subscriber_count(), 1);
        subscription.unsubscribe();
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn lagging_subscriber_is_closed() {
        let hub = ChangeHub::with_capacity(2);
        let mut subscription = hub.subscribe_students(Scope::All).await.unwrap();
        for i in 0..5 {
            hub.publish(ChangeEvent::Insert(student(Uuid::new_v4(), &format!("S{}", i))));
        }
        assert_eq!(subscription.next().await, None);
    }

    #[tokio::test]
    async fn shutdown_ends_open_subscriptions() {
        let hub = ChangeHub::new();
        let mut subscription = hub.subscribe_students(Scope::All).await.unwrap();
        hub.shutdown();
        assert_eq!(subscription.next().await, None);
    }

    #[tokio::test]
    async fn failed_listener_shuts_the_hub_down() {
        let hub = Arc::new(ChangeHub::new());
        let mut subscription = hub.subscribe_students(Scope::All).await.unwrap();
        let (tx, rx) = futures::channel::mpsc::unbounded::<Result<String, &'static str>>();
        let relay = {
            let hub = hub.clone();
            tokio::spawn(async move { relay_notifications(rx, &hub).await })
        };

        let id = Uuid::new_v4();
        tx.unbounded_send(Ok("not json".to_string())).unwrap();
        tx.unbounded_send(Ok(format!(r#"{{"op":"DELETE","old_id":"{id}"}}"#)))
            .unwrap();
        assert_eq!(subscription.next().await, Some(ChangeEvent::Delete(id)));

        tx.unbounded_send(Err("connection reset")).unwrap();
        relay.await.unwrap();

        assert_eq!(subscription.next().await, None);
        assert!(subscription.is_cancelled());
    }

    #[test]
    fn decodes_trigger_payloads() {
        let id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let payload = format!(
            r#"{{"op":"UPDATE","record":{{"id":"{id}","user_id":"{user_id}","name":"Ana","email":"ana@school.edu","fees_paid":true,"created_at":"2025-01-02T03:04:05.123456+00:00","updated_at":"2025-01-02T03:04:05.123456+00:00"}}}}"#
        );
        match decode_notification(&payload).unwrap() {
            ChangeEvent::Update(student) => {
                assert_eq!(student.id, id);
                assert!(student.fees_paid);
            }
            other => panic!("unexpected event {:?}", other),
        }

        let delete = format!(r#"{{"op":"DELETE","old_id":"{id}"}}"#);
        assert_eq!(decode_notification(&delete).unwrap(), ChangeEvent::Delete(id));
        assert!(decode_notification(r#"{"op":"INSERT"}"#).is_err());
    }
}
