//! services/api/src/web/profile_task.rs
//!
//! The live profile behind one WebSocket connection: the caller's own student
//! row, kept current by an owner-filtered change channel.

use crate::web::{
    protocol::{ClientMessage, ServerMessage},
    rest::StudentDto,
    state::{profile_patch, AppState},
    ws_handler::send_message,
};
use axum::extract::ws::Message;
use fee_portal_core::domain::{Principal, Student};
use fee_portal_core::live::{ChangeEvent, LiveRecord};
use futures::{Sink, Stream, StreamExt};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct ProfileSession {
    app_state: Arc<AppState>,
    principal: Principal,
    record: LiveRecord<Student>,
}

impl ProfileSession {
    /// Subscribes, then provisions the caller's row if needed and loads it.
    pub async fn open(app_state: Arc<AppState>, principal: Principal) -> Self {
        let mut record = LiveRecord::new();
        let source = app_state.student_rows();
        if !record.subscribe(&source, Some(&principal)).await {
            warn!("Profile for {} loaded without live updates.", principal.user_id);
        }
        match app_state.provision_student(&principal, None).await {
            Ok(student) => record.load(student),
            Err(e) => error!("Error fetching student profile: {:?}", e),
        }
        Self {
            app_state,
            principal,
            record,
        }
    }

    /// Writes the edit remotely and caches the row only once it is confirmed.
    pub async fn update_profile(&mut self, name: &str, email: &str) -> Result<(), String> {
        let patch = profile_patch(name, email)?;
        let student_id = self
            .record
            .get()
            .map(|s| s.id)
            .ok_or_else(|| "Failed to load profile".to_string())?;

        let updated = self
            .app_state
            .db
            .update_student(student_id, &patch)
            .await
            .map_err(|e| {
                error!("Failed to update profile for {}: {:?}", self.principal.user_id, e);
                "Failed to update profile".to_string()
            })?;
        self.record.commit(updated);
        Ok(())
    }

    pub fn apply_event(&mut self, event: ChangeEvent<Student>) -> bool {
        self.record.apply_event(event)
    }

    pub async fn next_event(&mut self) -> Option<ChangeEvent<Student>> {
        self.record.next_event().await
    }

    pub fn snapshot(&self) -> ServerMessage {
        ServerMessage::Profile {
            student: self.record.get().map(StudentDto::from),
            live: self.record.is_live(),
        }
    }

    pub fn teardown(&mut self) -> bool {
        self.record.teardown()
    }
}

/// Drives a profile connection until the client leaves.
pub async fn profile_process<S, R>(
    mut session: ProfileSession,
    ws_sender: &mut S,
    receiver: &mut R,
) where
    S: Sink<Message> + Unpin,
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
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
                        info!("Profile client disconnected.");
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!("Profile socket error: {}", e);
                        break;
                    }
                };
                match serde_json::from_str::<ClientMessage>(text.as_str()) {
                    Ok(ClientMessage::UpdateProfile { name, email }) => {
                        if let Err(message) = session.update_profile(&name, &email).await {
                            if !send_message(ws_sender, &ServerMessage::error(message)).await {
                                break;
                            }
                            continue;
                        }
                    }
                    Ok(other) => {
                        warn!("Ignoring {:?} on a profile connection.", other);
                        continue;
                    }
                    Err(e) => {
                        warn!("Failed to deserialize client message: {}", e);
                        continue;
                    }
                }
            }
            event = session.next_event() => {
                if let Some(event) = event {
                    debug!("Profile received student {}.", event.kind());
                    if !session.apply_event(event) {
                        continue;
                    }
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
    use crate::config::Config;
    use fee_portal_core::domain::StudentPatch;
    use fee_portal_core::ports::DatabaseService;
    use uuid::Uuid;

    fn app_state() -> (Arc<AppState>, Arc<InMemoryDb>, Arc<ChangeHub>) {
        let hub = Arc::new(ChangeHub::new());
        let db = Arc::new(InMemoryDb::new(hub.clone()));
        let state = Arc::new(AppState {
            db: db.clone(),
            feed: hub.clone(),
            config: Arc::new(Config::for_memory()),
        });
        (state, db, hub)
    }

    fn principal(email: &str) -> Principal {
        Principal {
            user_id: Uuid::new_v4(),
            email: email.to_string(),
        }
    }

    /// Opens a session and consumes the insert its own provisioning queued.
    async fn open_provisioned(state: Arc<AppState>, principal: Principal) -> ProfileSession {
        let mut session = ProfileSession::open(state, principal).await;
        let event = session.next_event().await;
        assert!(matches!(event, Some(ChangeEvent::Insert(_))));
        assert!(!session.apply_event(event.unwrap()));
        session
    }

    fn profile(message: ServerMessage) -> (Option<StudentDto>, bool) {
        match message {
            ServerMessage::Profile { student, live } => (student, live),
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[tokio::test]
    async fn first_visit_provisions_from_the_email() {
        let (state, db, _hub) = app_state();
        let ana = principal("ana.lopez@school.edu");

        let session = ProfileSession::open(state, ana.clone()).await;

        let (student, live) = profile(session.snapshot());
        let student = student.expect("profile expected");
        assert_eq!(student.name, "ana.lopez");
        assert!(!student.fees_paid);
        assert!(live);
        assert_eq!(db.get_student_by_user(ana.user_id).await.unwrap().id, student.id);
    }

    #[tokio::test]
    async fn payment_elsewhere_reaches_the_open_profile() {
        let (state, db, _hub) = app_state();
        let ana = principal("ana@school.edu");
        let mut session = open_provisioned(state, ana.clone()).await;

        let student = db.get_student_by_user(ana.user_id).await.unwrap();
        db.update_student(student.id, &StudentPatch::mark_paid()).await.unwrap();

        let event = session.next_event().await.expect("update expected");
        assert!(session.apply_event(event));
        let (student, _) = profile(session.snapshot());
        assert!(student.unwrap().fees_paid);
    }

    #[tokio::test]
    async fn other_students_changes_are_filtered_out() {
        let (state, db, _hub) = app_state();
        let ana = principal("ana@school.edu");
        let mut session = open_provisioned(state, ana.clone()).await;

        let bo = db
            .get_or_create_student(Uuid::new_v4(), "Bo", "bo@school.edu")
            .await
            .unwrap();
        db.update_student(bo.id, &StudentPatch::mark_paid()).await.unwrap();
        let mine = db.get_student_by_user(ana.user_id).await.unwrap();
        let renamed = db
            .update_student(
                mine.id,
                &StudentPatch {
                    name: Some("Ana Maria".to_string()),
                    ..StudentPatch::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(session.next_event().await, Some(ChangeEvent::Update(renamed)));
    }

    #[tokio::test]
    async fn edits_are_cached_after_the_store_confirms_them() {
        let (state, _db, _hub) = app_state();
        let mut session = ProfileSession::open(state, principal("ana@school.edu")).await;

        session
            .update_profile("  Ana Maria ", "ana.maria@school.edu")
            .await
            .unwrap();
        let (student, _) = profile(session.snapshot());
        let student = student.unwrap();
        assert_eq!(student.name, "Ana Maria");
        assert_eq!(student.email, "ana.maria@school.edu");

        assert_eq!(
            session.update_profile("", "x@y.z").await,
            Err("Name cannot be empty".to_string())
        );
    }

    #[tokio::test]
    async fn teardown_releases_the_channel() {
        let (state, _db, hub) = app_state();
        let mut session = ProfileSession::open(state, principal("ana@school.edu")).await;
        assert_eq!(hub.subscriber_count(), 1);
        assert!(session.teardown());
        assert_eq!(hub.subscriber_count(), 0);
    }
}
