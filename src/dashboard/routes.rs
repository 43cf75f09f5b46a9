//! Dashboard API route handlers.
//!
//! All endpoints return JSON. The engine is shared via `Arc<SettlementEngine>`.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use ethers::types::Address;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

use crate::engine::settlement::SettlementEngine;
use crate::engine::state::StatusSnapshot;
use crate::types::{
    ConnectionState, ErrorKind, ExecutionRecord, SettlementError, TransferReceipt, Trigger,
};

pub type AppState = Arc<SettlementEngine>;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub connection: ConnectionState,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WithdrawRequest {
    pub amount: Decimal,
    pub to_address: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct WithdrawResponse {
    pub success: bool,
    pub receipt: TransferReceipt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    pub details: Option<serde_json::Value>,
}

/// A settlement error plus the diagnostics shown to the operator.
#[derive(Debug)]
pub struct ApiError {
    pub error: SettlementError,
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self.error.kind() {
            ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorKind::InsufficientFunds => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::Busy => StatusCode::CONFLICT,
            ErrorKind::SigningUnavailable
            | ErrorKind::NoQuorum
            | ErrorKind::ConnectionFailure => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::ConfirmationTimeout => StatusCode::ACCEPTED,
            ErrorKind::SubmissionRejected => StatusCode::BAD_GATEWAY,
            ErrorKind::Signing => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(ErrorResponse {
            error: self.error.to_string(),
            error_code: self.error.kind().code().to_string(),
            details: self.details,
        });
        (status, body).into_response()
    }
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// GET /health
pub async fn health(State(engine): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        connection: engine.state().connection().await,
    })
}

/// GET /api/status
pub async fn get_status(State(engine): State<AppState>) -> Json<StatusSnapshot> {
    Json(engine.status().await)
}

/// POST /api/execute. Same path and guard as the timer.
pub async fn execute(State(engine): State<AppState>) -> Json<ExecutionRecord> {
    Json(engine.run_tick(Trigger::Manual).await)
}

/// POST /api/withdraw
pub async fn withdraw(
    State(engine): State<AppState>,
    Json(req): Json<WithdrawRequest>,
) -> Result<Json<WithdrawResponse>, ApiError> {
    let reserve = engine.settings().min_balance;

    let to: Address = req.to_address.trim().parse().map_err(|_| ApiError {
        error: SettlementError::InvalidRequest(format!("invalid address: {}", req.to_address)),
        details: None,
    })?;

    match engine.withdraw(req.amount, to).await {
        Ok(receipt) => Ok(Json(WithdrawResponse {
            success: true,
            receipt,
        })),
        Err(error) => {
            warn!(error = %error, amount = %req.amount, "Withdrawal rejected");
            let details = match &error {
                SettlementError::InsufficientFunds { balance, required } => Some(json!({
                    "requested": req.amount,
                    "balance": balance,
                    "required": required,
                    "reserve": reserve,
                })),
                _ => Some(json!({
                    "requested": req.amount,
                    "reserve": reserve,
                })),
            };
            Err(ApiError { error, details })
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
