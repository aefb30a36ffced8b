use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::error;

const PG_UNIQUE_VIOLATION: &str = "23505";
const PG_FOREIGN_KEY_VIOLATION: &str = "23503";

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("duplicate value violates {constraint}")]
    Duplicate { constraint: String },
    #[error("reference to a missing row violates {constraint}")]
    MissingReference { constraint: String },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("borrower {0} is on the do-not-call list")]
    DoNotCall(i32),
    #[error("turn {turn_no} does not follow turn {last_turn_no} in call session {session_id}")]
    TurnOutOfOrder {
        session_id: i32,
        turn_no: i32,
        last_turn_no: i32,
    },
    #[error("{entity} {id} cannot move from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        id: i32,
        from: String,
        to: String,
    },
    #[error("database error: {0}")]
    Database(sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("{service} error: {message}")]
    Upstream {
        service: &'static str,
        message: String,
    },
}

impl AppError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        AppError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn upstream(service: &'static str, message: impl ToString) -> Self {
        AppError::Upstream {
            service,
            message: message.to_string(),
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::NotFound { .. } => StatusCode::NOT_FOUND,
            AppError::InvalidInput(_) | AppError::DoNotCall(_) => StatusCode::BAD_REQUEST,
            AppError::Duplicate { .. }
            | AppError::MissingReference { .. }
            | AppError::TurnOutOfOrder { .. }
            | AppError::InvalidTransition { .. } => StatusCode::CONFLICT,
            AppError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            AppError::Config(_) | AppError::Database(_) | AppError::Migrate(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Constraint violations reported by PostgreSQL become typed errors; everything else is kept
/// as a raw database error.
impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &e {
            let constraint = db_err.constraint().unwrap_or("unknown").to_string();
            match db_err.code().as_deref() {
                Some(PG_UNIQUE_VIOLATION) => return AppError::Duplicate { constraint },
                Some(PG_FOREIGN_KEY_VIOLATION) => return AppError::MissingReference { constraint },
                _ => {}
            }
        }
        AppError::Database(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error=%self, "request failed");
        }
        let body = Json(json!({
            "status": "error",
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}

pub async fn handle_error(e: impl std::error::Error) {
    error!("ERROR: {e}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dnc_refusal_is_a_bad_request() {
        let response = AppError::DoNotCall(5).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn missing_borrower_is_not_found() {
        let err = AppError::not_found("borrower", 42);
        assert_eq!(err.to_string(), "borrower 42 not found");
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn constraint_violations_conflict() {
        let err = AppError::Duplicate {
            constraint: "borrowers_phone_e164_key".to_string(),
        };
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        let err = AppError::TurnOutOfOrder {
            session_id: 1,
            turn_no: 2,
            last_turn_no: 3,
        };
        assert_eq!(
            err.to_string(),
            "turn 2 does not follow turn 3 in call session 1"
        );
    }

    #[test]
    fn non_database_sqlx_errors_stay_raw() {
        let err: AppError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, AppError::Database(sqlx::Error::RowNotFound)));
    }

    #[test]
    fn upstream_failures_are_bad_gateway() {
        let err = AppError::upstream("twilio", "503 Service Unavailable");
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }
}
