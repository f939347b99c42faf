//! crates/fee_portal_core/src/ports.rs
//!
//! Defines the service contracts (traits) for the fee portal's core logic.
//! These traits form the boundary of the hexagonal architecture, allowing the core
//! to be independent of the concrete data store and change-notification transport.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{NewTransaction, Principal, Student, StudentPatch, Transaction, UserCredentials};
use crate::live::{Scope, Subscription};

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// A generic error type for all port operations.
/// This abstracts away the specific errors from external services (e.g., database, network).
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("Item not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
    #[error("Unauthorized")]
    Unauthorized,
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

//=========================================================================================
// Service Ports (Traits)
//=========================================================================================

#[async_trait]
pub trait DatabaseService: Send + Sync {
    // --- Auth Methods ---
    async fn create_user_with_email(&self, email: &str, hashed_password: &str)
        -> PortResult<Principal>;

    async fn get_user_by_email(&self, email: &str) -> PortResult<UserCredentials>;

    async fn create_auth_session(
        &self,
        session_id: &str,
        user_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> PortResult<()>;

    /// Resolves a live auth session to its principal. Expired sessions are `Unauthorized`.
    async fn validate_auth_session(&self, session_id: &str) -> PortResult<Principal>;

    async fn delete_auth_session(&self, session_id: &str) -> PortResult<()>;

    // --- Student Records ---
    /// All students visible in `scope`, newest first.
    async fn list_students(&self, scope: &Scope) -> PortResult<Vec<Student>>;

    async fn get_student_by_user(&self, user_id: Uuid) -> PortResult<Student>;

    /// Returns the principal's student record, creating it if absent.
    ///
    /// Implementations must make the check-and-insert atomic so two concurrent
    /// calls for the same principal yield the same row.
    async fn get_or_create_student(
        &self,
        user_id: Uuid,
        name: &str,
        email: &str,
    ) -> PortResult<Student>;

    /// Applies `patch` and returns the row as stored.
    async fn update_student(&self, student_id: Uuid, patch: &StudentPatch) -> PortResult<Student>;

    // --- Transactions ---
    async fn create_transaction(&self, transaction: NewTransaction) -> PortResult<Transaction>;

    async fn list_transactions_for_student(&self, student_id: Uuid)
        -> PortResult<Vec<Transaction>>;

    // --- Setup ---
    /// Verifies that the student and transaction tables are reachable.
    async fn check_schema(&self) -> PortResult<()>;
}

#[async_trait]
pub trait ChangeFeedService: Send + Sync {
    /// Opens a change-event channel on the students table, filtered to `scope`.
    async fn subscribe_students(&self, scope: Scope) -> PortResult<Subscription<Student>>;
}
