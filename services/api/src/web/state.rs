//! services/api/src/web/state.rs
//!
//! Defines the application's shared state and the profile helpers used by both
//! the REST handlers and the live profile task.

use crate::config::Config;
use fee_portal_core::domain::{Principal, Student, StudentPatch};
use fee_portal_core::live::StudentRows;
use fee_portal_core::ports::{ChangeFeedService, DatabaseService, PortResult};
use std::sync::Arc;

//=========================================================================================
// AppState (Shared Across All Connections)
//=========================================================================================

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<dyn DatabaseService>,
    pub feed: Arc<dyn ChangeFeedService>,
    pub config: Arc<Config>,
}

impl AppState {
    /// The students table as a live-view source.
    pub fn student_rows(&self) -> StudentRows {
        StudentRows::new(self.db.clone(), self.feed.clone())
    }

    /// Returns the principal's student record, creating it on first visit.
    ///
    /// Without a known display name the email's local part is used.
    pub async fn provision_student(
        &self,
        principal: &Principal,
        name: Option<&str>,
    ) -> PortResult<Student> {
        let name = match name.map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => principal.fallback_name(),
        };
        self.db
            .get_or_create_student(principal.user_id, &name, &principal.email)
            .await
    }
}

//=========================================================================================
// Profile Edits
//=========================================================================================

/// Turns an edit form into a patch, rejecting blank fields.
pub fn profile_patch(name: &str, email: &str) -> Result<StudentPatch, String> {
    let name = name.trim();
    let email = email.trim();
    if name.is_empty() {
        return Err("Name cannot be empty".to_string());
    }
    if email.is_empty() {
        return Err("Email cannot be empty".to_string());
    }
    Ok(StudentPatch {
        name: Some(name.to_string()),
        email: Some(email.to_string()),
        fees_paid: None,
    })
}
