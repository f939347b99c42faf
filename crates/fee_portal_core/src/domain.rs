//! crates/fee_portal_core/src/domain.rs
//!
//! Defines the pure, core data structures for the fee portal.
//! These structs are independent of any database or serialization format.

use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// An authenticated identity, resolved from an auth session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: Uuid,
    pub email: String,
}

impl Principal {
    /// The display name used when a student record is provisioned without one.
    pub fn fallback_name(&self) -> String {
        match self.email.split('@').next() {
            Some(local) if !local.is_empty() => local.to_string(),
            _ => "Student".to_string(),
        }
    }
}

/// A student's fee record. At most one exists per owning principal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Student {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub email: String,
    pub fees_paid: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A partial update to a student record. `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StudentPatch {
    pub name: Option<String>,
    pub email: Option<String>,
    pub fees_paid: Option<bool>,
}

impl StudentPatch {
    pub fn mark_paid() -> Self {
        Self {
            fees_paid: Some(true),
            ..Self::default()
        }
    }

    /// Applies the patch to a row, returning the patched copy.
    pub fn apply_to(&self, student: &Student, now: DateTime<Utc>) -> Student {
        Student {
            name: self.name.clone().unwrap_or_else(|| student.name.clone()),
            email: self.email.clone().unwrap_or_else(|| student.email.clone()),
            fees_paid: self.fees_paid.unwrap_or(student.fees_paid),
            updated_at: now,
            ..student.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TransactionStatus::Pending),
            "completed" => Ok(TransactionStatus::Completed),
            "failed" => Ok(TransactionStatus::Failed),
            other => Err(format!("unknown transaction status '{}'", other)),
        }
    }
}

/// A recorded fee payment. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub id: Uuid,
    pub student_id: Uuid,
    /// Amount in the smallest currency unit.
    pub amount: i64,
    pub payment_method: String,
    pub card_last_four: String,
    pub status: TransactionStatus,
    /// Human-readable token, e.g. `TXN_1700000000000_k3j9x0a1b`.
    pub transaction_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The fields a caller supplies when recording a transaction.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub student_id: Uuid,
    pub amount: i64,
    pub payment_method: String,
    pub card_last_four: String,
    pub status: TransactionStatus,
    pub transaction_id: String,
}

// Only used internally for login/signup - contains sensitive data
#[derive(Debug, Clone)]
pub struct UserCredentials {
    pub user_id: Uuid,
    pub email: String,
    pub hashed_password: String,
}

// Represents a browser login session (auth cookie)
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub id: String,
    pub user_id: Uuid,
    pub expires_at: DateTime<Utc>,
}
