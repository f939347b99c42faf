//! services/api/src/web/rest.rs
//!
//! Contains the Axum handlers for the REST API endpoints and the master
//! definition for the OpenAPI specification.

use crate::web::auth::{AuthResponse, LoginRequest, SignupRequest};
use crate::web::state::{profile_patch, AppState};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    Extension,
};
use chrono::{DateTime, Utc};
use fee_portal_core::domain::{
    NewTransaction, Principal, Student, StudentPatch, Transaction, TransactionStatus,
};
use fee_portal_core::live::Scope;
use fee_portal_core::payment::{self, PaymentForm, CARD_PAYMENT_METHOD};
use fee_portal_core::ports::PortError;
use fee_portal_core::roster::{project, RosterStats, StatusFilter};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};
use utoipa::{IntoParams, OpenApi, ToSchema};
use uuid::Uuid;

//=========================================================================================
// OpenAPI Master Definition
//=========================================================================================

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::web::auth::signup_handler,
        crate::web::auth::login_handler,
        crate::web::auth::logout_handler,
        get_profile_handler,
        update_profile_handler,
        list_students_handler,
        submit_payment_handler,
        setup_status_handler,
    ),
    components(
        schemas(
            SignupRequest, LoginRequest, AuthResponse, StudentDto, TransactionDto,
            RosterStatsDto, ProfileResponse, UpdateProfileRequest, RosterResponse,
            FilterStatus, PaymentRequest, PaymentResponse, SetupStatus
        )
    ),
    tags(
        (name = "Fee Portal API", description = "Student fee records, simulated payments and the live roster.")
    )
)]
pub struct ApiDoc;

//=========================================================================================
// API Response and Payload Structs
//=========================================================================================

#[derive(Serialize, Debug, Clone, PartialEq, ToSchema)]
pub struct StudentDto {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub email: String,
    pub fees_paid: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Student> for StudentDto {
    fn from(student: &Student) -> Self {
        Self {
            id: student.id,
            user_id: student.user_id,
            name: student.name.clone(),
            email: student.email.clone(),
            fees_paid: student.fees_paid,
            created_at: student.created_at,
            updated_at: student.updated_at,
        }
    }
}

#[derive(Serialize, Debug, Clone, ToSchema)]
pub struct TransactionDto {
    pub id: Uuid,
    pub student_id: Uuid,
    pub amount: i64,
    pub payment_method: String,
    pub card_last_four: String,
    /// One of `pending`, `completed`, `failed`.
    pub status: String,
    pub transaction_id: String,
    pub created_at: DateTime<Utc>,
}

impl From<&Transaction> for TransactionDto {
    fn from(transaction: &Transaction) -> Self {
        Self {
            id: transaction.id,
            student_id: transaction.student_id,
            amount: transaction.amount,
            payment_method: transaction.payment_method.clone(),
            card_last_four: transaction.card_last_four.clone(),
            status: transaction.status.to_string(),
            transaction_id: transaction.transaction_id.clone(),
            created_at: transaction.created_at,
        }
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, ToSchema)]
pub struct RosterStatsDto {
    pub total: usize,
    pub paid: usize,
    pub unpaid: usize,
}

impl From<RosterStats> for RosterStatsDto {
    fn from(stats: RosterStats) -> Self {
        Self {
            total: stats.total,
            paid: stats.paid,
            unpaid: stats.unpaid,
        }
    }
}

/// The roster's payment-status filter as it appears on the wire.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum FilterStatus {
    #[default]
    All,
    Paid,
    Unpaid,
}

impl From<FilterStatus> for StatusFilter {
    fn from(status: FilterStatus) -> Self {
        match status {
            FilterStatus::All => StatusFilter::All,
            FilterStatus::Paid => StatusFilter::Paid,
            FilterStatus::Unpaid => StatusFilter::Unpaid,
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct ProfileResponse {
    pub student: StudentDto,
    /// Newest first.
    pub transactions: Vec<TransactionDto>,
}

#[derive(Deserialize, ToSchema)]
pub struct UpdateProfileRequest {
    pub name: String,
    pub email: String,
}

#[derive(Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct RosterQuery {
    /// Case-insensitive substring of name or email.
    #[serde(default)]
    pub search: String,
    #[serde(default)]
    pub status: FilterStatus,
}

#[derive(Serialize, ToSchema)]
pub struct RosterResponse {
    pub students: Vec<StudentDto>,
    pub stats: RosterStatsDto,
}

#[derive(Deserialize, ToSchema)]
pub struct PaymentRequest {
    pub card_number: String,
    pub expiry: String,
    pub cvv: String,
    pub cardholder_name: String,
}

#[derive(Serialize, ToSchema)]
pub struct PaymentResponse {
    pub transaction: TransactionDto,
    pub student: StudentDto,
}

#[derive(Serialize, ToSchema)]
pub struct SetupStatus {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

//=========================================================================================
// REST API Handlers
//=========================================================================================

/// Load the caller's student profile, creating it on first visit.
#[utoipa::path(
    get,
    path = "/profile",
    responses(
        (status = 200, description = "Profile and payment history", body = ProfileResponse),
        (status = 401, description = "Not signed in"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn get_profile_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let student = app_state
        .provision_student(&principal, None)
        .await
        .map_err(|e| {
            error!("Failed to load profile for {}: {:?}", principal.user_id, e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to load profile".to_string())
        })?;

    // A failed history read still shows the profile.
    let transactions = match app_state.db.list_transactions_for_student(student.id).await {
        Ok(transactions) => transactions,
        Err(e) => {
            error!("Error fetching transactions: {:?}", e);
            Vec::new()
        }
    };

    Ok(Json(ProfileResponse {
        student: StudentDto::from(&student),
        transactions: transactions.iter().map(TransactionDto::from).collect(),
    }))
}

/// Edit the caller's name and email. The stored row is returned once confirmed.
#[utoipa::path(
    put,
    path = "/profile",
    request_body = UpdateProfileRequest,
    responses(
        (status = 200, description = "Profile updated", body = StudentDto),
        (status = 400, description = "Blank name or email"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn update_profile_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<UpdateProfileRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let patch = profile_patch(&req.name, &req.email).map_err(|m| (StatusCode::BAD_REQUEST, m))?;

    let db = &app_state.db;
    let result = async {
        let student = app_state.provision_student(&principal, None).await?;
        db.update_student(student.id, &patch).await
    }
    .await;

    match result {
        Ok(student) => Ok(Json(StudentDto::from(&student))),
        Err(e) => {
            error!("Failed to update profile: {:?}", e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to update profile".to_string(),
            ))
        }
    }
}

/// The roster, filtered by search term and payment status.
#[utoipa::path(
    get,
    path = "/students",
    params(RosterQuery),
    responses(
        (status = 200, description = "Matching students, newest first", body = RosterResponse),
        (status = 400, description = "Unknown status filter"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn list_students_handler(
    State(app_state): State<Arc<AppState>>,
    Query(query): Query<RosterQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let students = app_state.db.list_students(&Scope::All).await.map_err(|e| {
        error!("Error fetching students: {:?}", e);
        (StatusCode::INTERNAL_SERVER_ERROR, "Failed to load students".to_string())
    })?;

    let visible = project(&students, &query.search, query.status.into());
    Ok(Json(RosterResponse {
        students: visible.into_iter().map(StudentDto::from).collect(),
        stats: RosterStats::from_rows(&students).into(),
    }))
}

/// Submit the simulated card payment for the caller's fees.
#[utoipa::path(
    post,
    path = "/payments",
    request_body = PaymentRequest,
    responses(
        (status = 201, description = "Payment recorded and fees marked paid", body = PaymentResponse),
        (status = 400, description = "Invalid card details"),
        (status = 404, description = "No student profile"),
        (status = 409, description = "Fees already paid"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn submit_payment_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<PaymentRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let form = PaymentForm {
        card_number: req.card_number,
        expiry: req.expiry,
        cvv: req.cvv,
        cardholder_name: req.cardholder_name,
        amount: app_state.config.fee_amount,
    }
    .normalized();
    form.validate()
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    let card_last_four = payment::card_last_four(&form.card_number).ok_or_else(|| {
        (
            StatusCode::BAD_REQUEST,
            "Please enter a valid 16-digit card number".to_string(),
        )
    })?;

    let student = app_state
        .db
        .get_student_by_user(principal.user_id)
        .await
        .map_err(|e| match e {
            PortError::NotFound(_) => (StatusCode::NOT_FOUND, "Failed to load profile".to_string()),
            e => {
                error!("Error fetching student profile: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Failed to load profile".to_string())
            }
        })?;
    if student.fees_paid {
        return Err((StatusCode::CONFLICT, "Fees have already been paid".to_string()));
    }

    // Simulated processing; no payment network is contacted.
    tokio::time::sleep(app_state.config.payment_delay).await;

    let transaction = app_state
        .db
        .create_transaction(NewTransaction {
            student_id: student.id,
            amount: form.amount,
            payment_method: CARD_PAYMENT_METHOD.to_string(),
            card_last_four,
            status: TransactionStatus::Completed,
            transaction_id: payment::transaction_token(Utc::now()),
        })
        .await
        .map_err(|e| match e {
            // An overlapping submission completed first.
            PortError::Conflict(_) => {
                (StatusCode::CONFLICT, "Fees have already been paid".to_string())
            }
            e => {
                error!("Error creating transaction: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Payment failed. Please try again.".to_string(),
                )
            }
        })?;

    let student = app_state
        .db
        .update_student(student.id, &StudentPatch::mark_paid())
        .await
        .map_err(|e| {
            error!(
                "Transaction {} recorded but fee status update failed: {:?}",
                transaction.transaction_id, e
            );
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Payment processed but failed to update status. Please contact support."
                    .to_string(),
            )
        })?;
    info!(
        "Payment {} recorded for student {}",
        transaction.transaction_id, student.id
    );

    Ok((
        StatusCode::CREATED,
        Json(PaymentResponse {
            transaction: TransactionDto::from(&transaction),
            student: StudentDto::from(&student),
        }),
    ))
}

/// Check that the database tables are in place.
#[utoipa::path(
    get,
    path = "/setup/status",
    responses(
        (status = 200, description = "Tables are accessible", body = SetupStatus),
        (status = 503, description = "Tables are missing or unreachable", body = SetupStatus)
    )
)]
pub async fn setup_status_handler(State(app_state): State<Arc<AppState>>) -> impl IntoResponse {
    match app_state.db.check_schema().await {
        Ok(()) => (
            StatusCode::OK,
            Json(SetupStatus {
                success: true,
                message: Some("Database tables are accessible".to_string()),
                error: None,
            }),
        ),
        Err(e) => {
            warn!("Database setup check failed: {:?}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(SetupStatus {
                    success: false,
                    message: None,
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}
