use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

use crate::services::{binding_store::BindingStoreError, provisioner::ProvisionError};

/// Error returned by HTTP handlers, rendered as a small JSON body.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<ProvisionError> for AppError {
    fn from(err: ProvisionError) -> Self {
        let status = match &err {
            ProvisionError::NotInitialized(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProvisionError::BucketNotFound(_) => StatusCode::NOT_FOUND,
            ProvisionError::QuotaParse(_) => StatusCode::BAD_REQUEST,
            ProvisionError::Configuration(_)
            | ProvisionError::MissingKeys(_)
            | ProvisionError::BucketOwnerUnknown(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ProvisionError::UserCreation { .. }
            | ProvisionError::BucketCreation { .. }
            | ProvisionError::Policy { .. }
            | ProvisionError::Quota { .. }
            | ProvisionError::AdminOps { .. }
            | ProvisionError::DataPlane { .. }
            | ProvisionError::UserDeletion { .. } => StatusCode::BAD_GATEWAY,
        };
        AppError::new(status, err.to_string())
    }
}

impl From<BindingStoreError> for AppError {
    fn from(err: BindingStoreError) -> Self {
        match err {
            BindingStoreError::NotFound { .. } => AppError::not_found(err.to_string()),
            other => AppError::internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_errors_map_to_status() {
        let cases = [
            (
                ProvisionError::NotInitialized("cluster not ready".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                ProvisionError::BucketNotFound("photos".into()),
                StatusCode::NOT_FOUND,
            ),
            (
                ProvisionError::Configuration("no store".into()),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                ProvisionError::BucketOwnerUnknown("photos".into()),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status, status);
        }
    }

    #[test]
    fn missing_binding_is_not_found() {
        let err = AppError::from(BindingStoreError::NotFound {
            namespace: "apps".into(),
            name: "photos".into(),
        });
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.message, "binding `apps/photos` not found");
    }
}
