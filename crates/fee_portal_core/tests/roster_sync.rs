//! End-to-end behaviour of a roster cache fed by a change stream.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use fee_portal_core::{
    project, ChangeEvent, LiveView, LoadState, PortResult, RosterStats, RowSource, Scope,
    StatusFilter, Student, Subscription,
};
use futures::channel::mpsc;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct ScriptedSource {
    rows: Vec<Student>,
    events: Mutex<Option<mpsc::UnboundedReceiver<ChangeEvent<Student>>>>,
}

#[async_trait]
impl RowSource<Student> for ScriptedSource {
    async fn read(&self, _scope: &Scope) -> PortResult<Vec<Student>> {
        Ok(self.rows.clone())
    }

    async fn subscribe(&self, _scope: &Scope) -> PortResult<Subscription<Student>> {
        let rx = self.events.lock().unwrap().take().expect("single subscribe");
        Ok(Subscription::new(Box::pin(rx), CancellationToken::new()))
    }
}

fn student(name: &str, fees_paid: bool, age_minutes: i64) -> Student {
    let created = Utc::now() - Duration::minutes(age_minutes);
    Student {
        id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        name: name.to_string(),
        email: format!("{}@school.edu", name.to_lowercase()),
        fees_paid,
        created_at: created,
        updated_at: created,
    }
}

fn names(rows: &[&Student]) -> Vec<String> {
    rows.iter().map(|s| s.name.clone()).collect()
}

#[tokio::test]
async fn roster_follows_inserts_and_updates() {
    let ana = student("Ana", false, 10);
    let (tx, rx) = mpsc::unbounded();
    let source = ScriptedSource {
        rows: vec![ana.clone()],
        events: Mutex::new(Some(rx)),
    };

    let mut view: LiveView<Student> = LiveView::new();
    view.initialize(&source, &Scope::All).await;
    assert_eq!(view.state(), LoadState::Ready);
    assert!(view.subscribe(&source, &Scope::All).await);

    let bo = student("Bo", true, 0);
    tx.unbounded_send(ChangeEvent::Insert(bo.clone())).unwrap();
    let event = view.next_event().await.unwrap();
    assert!(view.apply_event(event));
    let all = project(view.rows(), "", StatusFilter::All);
    assert_eq!(names(&all), vec!["Ana", "Bo"]);

    let ana_paid = Student {
        fees_paid: true,
        ..ana.clone()
    };
    tx.unbounded_send(ChangeEvent::Update(ana_paid)).unwrap();
    let event = view.next_event().await.unwrap();
    assert!(view.apply_event(event));
    assert!(view.rows()[0].fees_paid);

    assert!(project(view.rows(), "", StatusFilter::Unpaid).is_empty());
    let paid = project(view.rows(), "an", StatusFilter::Paid);
    assert_eq!(names(&paid), vec!["Ana"]);

    assert_eq!(
        RosterStats::from_rows(view.rows()),
        RosterStats {
            total: 2,
            paid: 2,
            unpaid: 0
        }
    );

    assert!(view.teardown());
}
