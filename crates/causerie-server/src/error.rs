use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use causerie_shared::{IdError, RpcError};
use causerie_store::StoreError;
use thiserror::Error;

/// Why an RPC was refused before it could enter the log.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("{0}")]
    Rejected(String),

    /// Distinct from `Rejected` so callers can back off.
    #[error("{0}")]
    RateLimited(String),

    #[error("abuse attestation failed: {0}")]
    AttestationFailed(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ValidationError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        ValidationError::Rejected(reason.into())
    }
}

impl From<RpcError> for ValidationError {
    fn from(e: RpcError) -> Self {
        ValidationError::Rejected(e.to_string())
    }
}

impl From<IdError> for ValidationError {
    fn from(e: IdError) -> Self {
        ValidationError::Rejected(e.to_string())
    }
}

/// A failed apply. The transaction has been rolled back.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("could not resolve acting user: {0}")]
    UnknownUser(#[source] StoreError),

    #[error(transparent)]
    Params(#[from] RpcError),

    #[error("id decode failed: {0}")]
    Decode(#[from] IdError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for ServerError {
    fn from(e: StoreError) -> Self {
        ServerError::Internal(e.to_string())
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::InvalidSignature => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ServerError::Validation(ValidationError::Rejected(_)) => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            ServerError::Validation(ValidationError::RateLimited(_)) => {
                (StatusCode::TOO_MANY_REQUESTS, self.to_string())
            }
            ServerError::Validation(ValidationError::AttestationFailed(_)) => {
                (StatusCode::FORBIDDEN, self.to_string())
            }
            ServerError::Apply(ApplyError::UnknownUser(_))
            | ServerError::Apply(ApplyError::Params(_))
            | ServerError::Apply(ApplyError::Decode(_)) => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            ServerError::Validation(ValidationError::Store(e))
            | ServerError::Apply(ApplyError::Store(e)) => {
                tracing::error!(error = %e, "Storage failure");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
            ServerError::Internal(e) => {
                tracing::error!(error = %e, "Internal failure");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        let cases = [
            (ServerError::BadRequest("x".into()), StatusCode::BAD_REQUEST),
            (ServerError::NotFound("chat".into()), StatusCode::NOT_FOUND),
            (
                ValidationError::rejected("user is not a member of this chat").into(),
                StatusCode::BAD_REQUEST,
            ),
            (
                ValidationError::RateLimited("slow down".into()).into(),
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (
                ValidationError::AttestationFailed("403".into()).into(),
                StatusCode::FORBIDDEN,
            ),
            (
                ApplyError::Store(StoreError::NotFound).into(),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (error, status) in cases {
            assert_eq!(error.into_response().status(), status);
        }
    }
}
