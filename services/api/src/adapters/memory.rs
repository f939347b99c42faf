//! services/api/src/adapters/memory.rs
//!
//! An in-process implementation of the `DatabaseService` port. Student writes are
//! published to a `ChangeHub`, so live views behave exactly as they do against
//! PostgreSQL. Selected with `DATABASE_URL=memory` and used by the test suite.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fee_portal_core::domain::{
    AuthSession, NewTransaction, Principal, Student, StudentPatch, Transaction, TransactionStatus,
    UserCredentials,
};
use fee_portal_core::live::{ChangeEvent, Scope};
use fee_portal_core::ports::{DatabaseService, PortError, PortResult};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::adapters::change_feed::ChangeHub;

#[derive(Default)]
struct Tables {
    users: HashMap<String, UserCredentials>,
    auth_sessions: HashMap<String, AuthSession>,
    /// Insertion order; reads sort by `created_at`.
    students: Vec<Student>,
    transactions: Vec<Transaction>,
}

pub struct InMemoryDb {
    tables: RwLock<Tables>,
    hub: Arc<ChangeHub>,
}

impl InMemoryDb {
    pub fn new(hub: Arc<ChangeHub>) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            hub,
        }
    }
}

fn newest_first<T>(rows: &mut [T], created_at: impl Fn(&T) -> DateTime<Utc>) {
    rows.sort_by(|a, b| created_at(b).cmp(&created_at(a)));
}

#[async_trait]
impl DatabaseService for InMemoryDb {
    async fn create_user_with_email(
        &self,
        email: &str,
        hashed_password: &str,
    ) -> PortResult<Principal> {
        let mut tables = self.tables.write().await;
        if tables.users.contains_key(email) {
            return Err(PortError::Conflict(format!("User {} already exists", email)));
        }
        let credentials = UserCredentials {
            user_id: Uuid::new_v4(),
            email: email.to_string(),
            hashed_password: hashed_password.to_string(),
        };
        let principal = Principal {
            user_id: credentials.user_id,
            email: credentials.email.clone(),
        };
        tables.users.insert(email.to_string(), credentials);
        Ok(principal)
    }

    async fn get_user_by_email(&self, email: &str) -> PortResult<UserCredentials> {
        self.tables
            .read()
            .await
            .users
            .get(email)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("User {} not found", email)))
    }

    async fn create_auth_session(
        &self,
        session_id: &str,
        user_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> PortResult<()> {
        let session = AuthSession {
            id: session_id.to_string(),
            user_id,
            expires_at,
        };
        self.tables
            .write()
            .await
            .auth_sessions
            .insert(session_id.to_string(), session);
        Ok(())
    }

    async fn validate_auth_session(&self, session_id: &str) -> PortResult<Principal> {
        let tables = self.tables.read().await;
        let session = tables
            .auth_sessions
            .get(session_id)
            .filter(|s| s.expires_at > Utc::now())
            .ok_or(PortError::Unauthorized)?;
        tables
            .users
            .values()
            .find(|u| u.user_id == session.user_id)
            .map(|u| Principal {
                user_id: u.user_id,
                email: u.email.clone(),
            })
            .ok_or(PortError::Unauthorized)
    }

    async fn delete_auth_session(&self, session_id: &str) -> PortResult<()> {
        self.tables.write().await.auth_sessions.remove(session_id);
        Ok(())
    }

    async fn list_students(&self, scope: &Scope) -> PortResult<Vec<Student>> {
        let mut rows: Vec<Student> = self
            .tables
            .read()
            .await
            .students
            .iter()
            .filter(|s| scope.admits(*s))
            .cloned()
            .collect();
        newest_first(&mut rows, |s| s.created_at);
        Ok(rows)
    }

    async fn get_student_by_user(&self, user_id: Uuid) -> PortResult<Student> {
        self.tables
            .read()
            .await
            .students
            .iter()
            .find(|s| s.user_id == user_id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("Student for user {} not found", user_id)))
    }

    async fn get_or_create_student(
        &self,
        user_id: Uuid,
        name: &str,
        email: &str,
    ) -> PortResult<Student> {
        // The write lock spans the check and the insert.
        let mut tables = self.tables.write().await;
        if let Some(existing) = tables.students.iter().find(|s| s.user_id == user_id) {
            return Ok(existing.clone());
        }
        let now = Utc::now();
        let student = Student {
            id: Uuid::new_v4(),
            user_id,
            name: name.to_string(),
            email: email.to_string(),
            fees_paid: false,
            created_at: now,
            updated_at: now,
        };
        tables.students.push(student.clone());
        self.hub.publish(ChangeEvent::Insert(student.clone()));
        Ok(student)
    }

    async fn update_student(&self, student_id: Uuid, patch: &StudentPatch) -> PortResult<Student> {
        let mut tables = self.tables.write().await;
        let slot = tables
            .students
            .iter_mut()
            .find(|s| s.id == student_id)
            .ok_or_else(|| PortError::NotFound(format!("Student {} not found", student_id)))?;
        *slot = patch.apply_to(slot, Utc::now());
        let updated = slot.clone();
        self.hub.publish(ChangeEvent::Update(updated.clone()));
        Ok(updated)
    }

    async fn create_transaction(&self, transaction: NewTransaction) -> PortResult<Transaction> {
        let mut tables = self.tables.write().await;
        if !tables.students.iter().any(|s| s.id == transaction.student_id) {
            return Err(PortError::NotFound(format!(
                "Student {} not found",
                transaction.student_id
            )));
        }
        if transaction.status == TransactionStatus::Completed
            && tables.transactions.iter().any(|t| {
                t.student_id == transaction.student_id && t.status == TransactionStatus::Completed
            })
        {
            return Err(PortError::Conflict(format!(
                "Student {} already has a completed payment",
                transaction.student_id
            )));
        }
        let now = Utc::now();
        let record = Transaction {
            id: Uuid::new_v4(),
            student_id: transaction.student_id,
            amount: transaction.amount,
            payment_method: transaction.payment_method,
            card_last_four: transaction.card_last_four,
            status: transaction.status,
            transaction_id: transaction.transaction_id,
            created_at: now,
            updated_at: now,
        };
        tables.transactions.push(record.clone());
        Ok(record)
    }

    async fn list_transactions_for_student(
        &self,
        student_id: Uuid,
    ) -> PortResult<Vec<Transaction>> {
        let mut rows: Vec<Transaction> = self
            .tables
            .read()
            .await
            .transactions
            .iter()
            .filter(|t| t.student_id == student_id)
            .cloned()
            .collect();
        newest_first(&mut rows, |t| t.created_at);
        Ok(rows)
    }

    async fn check_schema(&self) -> PortResult<()> {
        Ok(())
    }
}
