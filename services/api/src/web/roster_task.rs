//! services/api/src/web/roster_task.rs
//!
//! The live roster behind one WebSocket connection. The connection owns a
//! `LiveView` of every student; filters only change what is sent, never what is
//! cached.

use crate::web::{
    protocol::{ClientMessage, ServerMessage},
    rest::{FilterStatus, RosterStatsDto, StudentDto},
    ws_handler::send_message,
};
use axum::extract::ws::Message;
use fee_portal_core::domain::Student;
use fee_portal_core::live::{ChangeEvent, LiveView, LoadState, RowSource, Scope};
use fee_portal_core::roster::{project, RosterStats};
use futures::{Sink, Stream, StreamExt};
use tracing::{debug, info, warn};

/// The cache plus the projection currently selected by the client.
pub struct RosterSession {
    view: LiveView<Student>,
    search: String,
    status: FilterStatus,
}

impl RosterSession {
    /// Opens the change channel, then loads the roster.
    pub async fn open(source: &dyn RowSource<Student>, search: String, status: FilterStatus) -> Self {
        let mut view = LiveView::new();
        if !view.open(source, &Scope::All).await {
            warn!("Roster loaded without live updates.");
        }
        Self { view, search, status }
    }

    pub fn set_filter(&mut self, search: String, status: FilterStatus) {
        self.search = search;
        self.status = status;
    }

    pub fn apply_event(&mut self, event: ChangeEvent<Student>) -> bool {
        self.view.apply_event(event)
    }

    pub async fn next_event(&mut self) -> Option<ChangeEvent<Student>> {
        self.view.next_event().await
    }

    pub fn is_loaded(&self) -> bool {
        self.view.state() == LoadState::Ready
    }

    /// The filtered rows with stats over the whole cache.
    pub fn snapshot(&self) -> ServerMessage {
        let rows = self.view.rows();
        ServerMessage::Roster {
            students: project(rows, &self.search, self.status.into())
                .into_iter()
                .map(StudentDto::from)
                .collect(),
            stats: RosterStatsDto::from(RosterStats::from_rows(rows)),
            live: self.view.is_live(),
        }
    }

    pub fn teardown(&mut self) -> bool {
        self.view.teardown()
    }
}

/// Drives a roster connection until the client leaves.
pub async fn roster_process<S, R>(
    mut session: RosterSession,
    ws_sender: &mut S,
    receiver: &mut R,
) where
    S: Sink<Message> + Unpin,
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    if !session.is_loaded() {
        send_message(ws_sender, &ServerMessage::error("Failed to load students")).await;
    }
    if !send_message(ws_sender, &session.snapshot()).await {
        session.teardown();
        return;
    }

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Roster client disconnected.");
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!("Roster socket error: {}", e);
                        break;
                    }
                };
                match serde_json::from_str::<ClientMessage>(text.as_str()) {
                    Ok(ClientMessage::SetFilter { search, status }) => {
                        session.set_filter(search, status);
                    }
                    Ok(other) => {
                        warn!("Ignoring {:?} on a roster connection.", other);
                        continue;
                    }
                    Err(e) => {
                        warn!("Failed to deserialize client message: {}", e);
                        continue;
                    }
                }
            }
            event = session.next_event() => {
                match event {
                    Some(event) => {
                        debug!("Roster received student {}.", event.kind());
                        if !session.apply_event(event) {
                            continue;
                        }
                    }
                    // The channel dropped; tell the client updates have stopped.
                    None => {}
                }
            }
        }

        if !send_message(ws_sender, &session.snapshot()).await {
            break;
        }
    }

    session.teardown();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{ChangeHub, InMemoryDb};
    use fee_portal_core::domain::StudentPatch;
    use fee_portal_core::live::StudentRows;
    use fee_portal_core::ports::DatabaseService;
    use std::sync::Arc;
    use uuid::Uuid;

    fn fixture() -> (Arc<InMemoryDb>, Arc<ChangeHub>, StudentRows) {
        let hub = Arc::new(ChangeHub::new());
        let db = Arc::new(InMemoryDb::new(hub.clone()));
        let rows = StudentRows::new(db.clone(), hub.clone());
        (db, hub, rows)
    }

    fn roster(message: ServerMessage) -> (Vec<StudentDto>, RosterStatsDto, bool) {
        match message {
            ServerMessage::Roster { students, stats, live } => (students, stats, live),
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[tokio::test]
    async fn new_students_appear_after_the_initial_load() {
        let (db, hub, rows) = fixture();
        db.get_or_create_student(Uuid::new_v4(), "Ana", "ana@school.edu")
            .await
            .unwrap();

        let mut session = RosterSession::open(&rows, String::new(), FilterStatus::All).await;
        assert_eq!(hub.subscriber_count(), 1);

        db.get_or_create_student(Uuid::new_v4(), "Bo", "bo@school.edu")
            .await
            .unwrap();
        let event = session.next_event().await.expect("insert expected");
        assert!(session.apply_event(event));

        let (students, stats, live) = roster(session.snapshot());
        let names: Vec<_> = students.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["Ana", "Bo"]);
        assert_eq!(stats.total, 2);
        assert!(live);
    }

    #[tokio::test]
    async fn filters_change_the_projection_but_not_the_stats() {
        let (db, _hub, rows) = fixture();
        let ana = db
            .get_or_create_student(Uuid::new_v4(), "Ana", "ana@school.edu")
            .await
            .unwrap();
        db.get_or_create_student(Uuid::new_v4(), "Bo", "bo@school.edu")
            .await
            .unwrap();

        let mut session = RosterSession::open(&rows, String::new(), FilterStatus::All).await;
        db.update_student(ana.id, &StudentPatch::mark_paid()).await.unwrap();
        let event = session.next_event().await.expect("update expected");
        session.apply_event(event);

        session.set_filter(String::new(), FilterStatus::Unpaid);
        let (students, stats, _) = roster(session.snapshot());
        assert_eq!(students.len(), 1);
        assert_eq!(students[0].name, "Bo");
        assert_eq!((stats.total, stats.paid, stats.unpaid), (2, 1, 1));

        session.set_filter("ANA".to_string(), FilterStatus::Paid);
        let (students, _, _) = roster(session.snapshot());
        assert_eq!(students.len(), 1);
        assert!(students[0].fees_paid);
    }

    #[tokio::test]
    async fn teardown_releases_the_hub_subscription() {
        let (_db, hub, rows) = fixture();
        let mut session = RosterSession::open(&rows, String::new(), FilterStatus::All).await;
        assert!(session.teardown());
        assert_eq!(hub.subscriber_count(), 0);

        let (_, _, live) = roster(session.snapshot());
        assert!(!live);
    }

    #[tokio::test]
    async fn hub_shutdown_marks_the_roster_offline() {
        let (_db, hub, rows) = fixture();
        let mut session = RosterSession::open(&rows, String::new(), FilterStatus::All).await;
        hub.shutdown();
        assert!(session.next_event().await.is_none());

        let (_, _, live) = roster(session.snapshot());
        assert!(!live);
    }
}
