use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use ragsync_core::SyncError;
use tracing::error;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Internal(String),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Sync(err) => match err {
                SyncError::NotFound(_) => StatusCode::NOT_FOUND,
                SyncError::InvalidSource(_) | SyncError::InvalidConfig(_) => {
                    StatusCode::BAD_REQUEST
                }
                // Provider rejected the code
                SyncError::Auth(_) => StatusCode::BAD_REQUEST,
                SyncError::ReauthorizationRequired(_) => StatusCode::UNAUTHORIZED,
                SyncError::ConfigurationMissing(_) => StatusCode::PRECONDITION_FAILED,
                SyncError::Discovery(_) | SyncError::Http(_) => StatusCode::BAD_GATEWAY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {:?}", self);
        }

        let body = Json(serde_json::json!({
            "error": self.to_string()
        }));

        (status, body).into_response()
    }
}
