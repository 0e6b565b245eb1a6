use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use points_ledger::ErrorKind;
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ApiError>;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Ledger(#[from] points_ledger::Error),

    #[error("Missing or malformed X-Actor-Account header")]
    MissingActor,

    #[error("Invalid account or password")]
    InvalidCredentials,

    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl ResponseError for ApiError {
    fn error_response(&self) -> HttpResponse {
        let status_code = self.status_code();
        let error_message = match self.status_code() {
            StatusCode::INTERNAL_SERVER_ERROR => {
                tracing::error!(error = %self, "Request failed");
                "Internal server error".to_string()
            }
            _ => self.to_string(),
        };

        HttpResponse::build(status_code).json(json!({
            "error": {
                "code": status_code.as_u16(),
                "message": error_message,
                "type": self.error_type()
            }
        }))
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Ledger(e) => match e.kind() {
                ErrorKind::Validation => StatusCode::BAD_REQUEST,
                ErrorKind::NotFound => StatusCode::NOT_FOUND,
                ErrorKind::Authorization => StatusCode::FORBIDDEN,
                ErrorKind::Conflict => StatusCode::CONFLICT,
                ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::MissingActor => StatusCode::UNAUTHORIZED,
            ApiError::InvalidCredentials => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl ApiError {
    fn error_type(&self) -> &str {
        match self {
            ApiError::Ledger(e) => match e.kind() {
                ErrorKind::Validation => "validation_error",
                ErrorKind::NotFound => "not_found",
                ErrorKind::Authorization => "forbidden",
                ErrorKind::Conflict => "conflict",
                ErrorKind::Internal => "internal_error",
            },
            ApiError::MissingActor => "unauthorized",
            ApiError::InvalidCredentials => "unauthorized",
            ApiError::BadRequest(_) => "bad_request",
        }
    }
}
