//! services/api/src/adapters/db.rs
//!
//! This module contains the database adapter, which is the concrete implementation
//! of the `DatabaseService` port from the `core` crate. It handles all interactions
//! with the PostgreSQL database using `sqlx`.
//!
//! Change notifications are not published from here: a trigger installed by the
//! migrations emits them, and `PgChangeRelay` forwards them to subscribers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fee_portal_core::domain::{
    NewTransaction, Principal, Student, StudentPatch, Transaction, UserCredentials,
};
use fee_portal_core::live::Scope;
use fee_portal_core::ports::{DatabaseService, PortError, PortResult};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// A database adapter that implements the `DatabaseService` port.
#[derive(Clone)]
pub struct DbAdapter {
    pool: PgPool,
}

impl DbAdapter {
    /// Creates a new `DbAdapter`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// A helper function to run database migrations at startup.
    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn unexpected(e: sqlx::Error) -> PortError {
    PortError::Unexpected(e.to_string())
}

const STUDENT_COLUMNS: &str = "id, user_id, name, email, fees_paid, created_at, updated_at";
const TRANSACTION_COLUMNS: &str = "id, student_id, amount, payment_method, card_last_four, status, transaction_id, created_at, updated_at";

//=========================================================================================
// "Impure" Database Record Structs
//=========================================================================================

#[derive(FromRow)]
struct PrincipalRecord {
    user_id: Uuid,
    email: String,
}
impl PrincipalRecord {
    fn to_domain(self) -> Principal {
        Principal {
            user_id: self.user_id,
            email: self.email,
        }
    }
}

#[derive(FromRow)]
struct CredentialsRecord {
    user_id: Uuid,
    email: String,
    hashed_password: String,
}
impl CredentialsRecord {
    fn to_domain(self) -> UserCredentials {
        UserCredentials {
            user_id: self.user_id,
            email: self.email,
            hashed_password: self.hashed_password,
        }
    }
}

#[derive(FromRow)]
struct StudentRecord {
    id: Uuid,
    user_id: Uuid,
    name: String,
    email: String,
    fees_paid: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}
impl StudentRecord {
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

#[derive(FromRow)]
struct TransactionRecord {
    id: Uuid,
    student_id: Uuid,
    amount: i64,
    payment_method: String,
    card_last_four: String,
    status: String,
    transaction_id: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}
impl TransactionRecord {
    fn to_domain(self) -> PortResult<Transaction> {
        Ok(Transaction {
            id: self.id,
            student_id: self.student_id,
            amount: self.amount,
            payment_method: self.payment_method,
            card_last_four: self.card_last_four,
            status: self.status.parse().map_err(PortError::Unexpected)?,
            transaction_id: self.transaction_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

//=========================================================================================
// `DatabaseService` Trait Implementation
//=========================================================================================

#[async_trait]
impl DatabaseService for DbAdapter {
    async fn create_user_with_email(
        &self,
        email: &str,
        hashed_password: &str,
    ) -> PortResult<Principal> {
        let record = sqlx::query_as::<_, PrincipalRecord>(
            "INSERT INTO users (email, hashed_password) VALUES ($1, $2) RETURNING user_id, email",
        )
        .bind(email)
        .bind(hashed_password)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                PortError::Conflict(format!("User {} already exists", email))
            }
            _ => unexpected(e),
        })?;
        Ok(record.to_domain())
    }

    async fn get_user_by_email(&self, email: &str) -> PortResult<UserCredentials> {
        let record = sqlx::query_as::<_, CredentialsRecord>(
            "SELECT user_id, email, hashed_password FROM users WHERE email = $1",
        )
        .bind(email)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::RowNotFound => PortError::NotFound(format!("User {} not found", email)),
            _ => unexpected(e),
        })?;
        Ok(record.to_domain())
    }

    async fn create_auth_session(
        &self,
        session_id: &str,
        user_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> PortResult<()> {
        sqlx::query("INSERT INTO auth_sessions (id, user_id, expires_at) VALUES ($1, $2, $3)")
            .bind(session_id)
            .bind(user_id)
            .bind(expires_at)
            .execute(&self.pool)
            .await
            .map_err(unexpected)?;
        Ok(())
    }

    async fn validate_auth_session(&self, session_id: &str) -> PortResult<Principal> {
        let record = sqlx::query_as::<_, PrincipalRecord>(
            "SELECT u.user_id, u.email FROM auth_sessions s \
             JOIN users u ON u.user_id = s.user_id \
             WHERE s.id = $1 AND s.expires_at > NOW()",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?
        .ok_or(PortError::Unauthorized)?;
        Ok(record.to_domain())
    }

    async fn delete_auth_session(&self, session_id: &str) -> PortResult<()> {
        sqlx::query("DELETE FROM auth_sessions WHERE id = $1")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(unexpected)?;
        Ok(())
    }

    async fn list_students(&self, scope: &Scope) -> PortResult<Vec<Student>> {
        let records = match scope {
            Scope::All => {
                sqlx::query_as::<_, StudentRecord>(&format!(
                    "SELECT {} FROM students ORDER BY created_at DESC",
                    STUDENT_COLUMNS
                ))
                .fetch_all(&self.pool)
                .await
            }
            Scope::OwnedBy(user_id) => {
                sqlx::query_as::<_, StudentRecord>(&format!(
                    "SELECT {} FROM students WHERE user_id = $1 ORDER BY created_at DESC",
                    STUDENT_COLUMNS
                ))
                .bind(*user_id)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(unexpected)?;

        Ok(records.into_iter().map(|r| r.to_domain()).collect())
    }

    async fn get_student_by_user(&self, user_id: Uuid) -> PortResult<Student> {
        let record = sqlx::query_as::<_, StudentRecord>(&format!(
            "SELECT {} FROM students WHERE user_id = $1",
            STUDENT_COLUMNS
        ))
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::RowNotFound => {
                PortError::NotFound(format!("Student for user {} not found", user_id))
            }
            _ => unexpected(e),
        })?;
        Ok(record.to_domain())
    }

    async fn get_or_create_student(
        &self,
        user_id: Uuid,
        name: &str,
        email: &str,
    ) -> PortResult<Student> {
        // `students.user_id` is UNIQUE, so racing inserts collapse into one row.
        sqlx::query(
            "INSERT INTO students (user_id, name, email) VALUES ($1, $2, $3) \
             ON CONFLICT (user_id) DO NOTHING",
        )
        .bind(user_id)
        .bind(name)
        .bind(email)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;

        self.get_student_by_user(user_id).await
    }

    async fn update_student(&self, student_id: Uuid, patch: &StudentPatch) -> PortResult<Student> {
        let record = sqlx::query_as::<_, StudentRecord>(&format!(
            "UPDATE students SET \
             name = COALESCE($2, name), \
             email = COALESCE($3, email), \
             fees_paid = COALESCE($4, fees_paid), \
             updated_at = NOW() \
             WHERE id = $1 RETURNING {}",
            STUDENT_COLUMNS
        ))
        .bind(student_id)
        .bind(patch.name.as_deref())
        .bind(patch.email.as_deref())
        .bind(patch.fees_paid)
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?
        .ok_or_else(|| PortError::NotFound(format!("Student {} not found", student_id)))?;
        Ok(record.to_domain())
    }

    async fn create_transaction(&self, transaction: NewTransaction) -> PortResult<Transaction> {
        let record = sqlx::query_as::<_, TransactionRecord>(&format!(
            "INSERT INTO transactions \
             (student_id, amount, payment_method, card_last_four, status, transaction_id) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING {}",
            TRANSACTION_COLUMNS
        ))
        .bind(transaction.student_id)
        .bind(transaction.amount)
        .bind(&transaction.payment_method)
        .bind(&transaction.card_last_four)
        .bind(transaction.status.as_str())
        .bind(&transaction.transaction_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_foreign_key_violation() => {
                PortError::NotFound(format!("Student {} not found", transaction.student_id))
            }
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                PortError::Conflict(format!(
                    "Student {} already has a completed payment",
                    transaction.student_id
                ))
            }
            _ => unexpected(e),
        })?;
        record.to_domain()
    }

    async fn list_transactions_for_student(
        &self,
        student_id: Uuid,
    ) -> PortResult<Vec<Transaction>> {
        let records = sqlx::query_as::<_, TransactionRecord>(&format!(
            "SELECT {} FROM transactions WHERE student_id = $1 ORDER BY created_at DESC",
            TRANSACTION_COLUMNS
        ))
        .bind(student_id)
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;

        records.into_iter().map(|r| r.to_domain()).collect()
    }

    async fn check_schema(&self) -> PortResult<()> {
        sqlx::query("SELECT id FROM students LIMIT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| {
                PortError::Unexpected(format!("Students table not found or accessible: {}", e))
            })?;
        sqlx::query("SELECT id FROM transactions LIMIT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| {
                PortError::Unexpected(format!("Transactions table not found or accessible: {}", e))
            })?;
        Ok(())
    }
}
