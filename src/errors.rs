use crate::services::{
    file_validator::FileRejection,
    image_repository::ImageError,
    image_transcoder::TranscodeError,
    project_pipeline::ProjectError,
    query_cache::MutationFailure,
    validation::{FieldErrors, ValidationError},
};
use axum::{
    Json,
    extract::{multipart::MultipartError, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

pub const UNEXPECTED: &str = "An unexpected error occurred.";

/// Failure at the HTTP boundary: a status, a human-readable message and,
/// for validation failures, the field-keyed errors.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
    pub errors: Option<FieldErrors>,
}

impl AppError {
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
            errors: None,
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, msg)
    }

    pub fn validation(err: ValidationError) -> Self {
        Self {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            message: err.to_string(),
            errors: Some(err.errors),
        }
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
        let body = match self.errors {
            Some(errors) => json!({
                "success": false,
                "message": self.message,
                "errors": errors,
            }),
            None => json!({
                "success": false,
                "message": self.message,
            }),
        };
        (self.status, Json(body)).into_response()
    }
}

impl MutationFailure for AppError {
    fn is_validation(&self) -> bool {
        self.errors.is_some()
    }

    fn user_message(&self) -> String {
        self.message.clone()
    }
}

impl From<ValidationError> for AppError {
    fn from(err: ValidationError) -> Self {
        Self::validation(err)
    }
}

impl From<FileRejection> for AppError {
    fn from(err: FileRejection) -> Self {
        Self::bad_request(err.to_string())
    }
}

impl From<TranscodeError> for AppError {
    fn from(err: TranscodeError) -> Self {
        match err {
            TranscodeError::Decode(_) | TranscodeError::Canvas { .. } => {
                Self::bad_request(format!("Failed to process image: {err}"))
            }
            other => {
                tracing::error!(error = %other, "transcoding failed");
                Self::internal("Failed to process image. Please try again.")
            }
        }
    }
}

impl From<ImageError> for AppError {
    fn from(err: ImageError) -> Self {
        match err {
            ImageError::Validation(v) => Self::validation(v),
            ImageError::Rejected(rejection) => rejection.into(),
            ImageError::Unauthenticated(_) => Self::unauthorized(err.to_string()),
            ImageError::Forbidden(_) => Self::new(StatusCode::FORBIDDEN, err.to_string()),
            ImageError::NotFound => Self::not_found(err.to_string()),
            other => {
                tracing::error!(error = ?other, "image operation failed");
                Self::internal(other.to_string())
            }
        }
    }
}

impl From<ProjectError> for AppError {
    fn from(err: ProjectError) -> Self {
        match err {
            ProjectError::Validation(v) => Self::validation(v),
            ProjectError::Unauthenticated(_) => Self::unauthorized(err.to_string()),
            ProjectError::NotFound => Self::not_found(err.to_string()),
            ProjectError::BlankName
            | ProjectError::BlankDescription
            | ProjectError::InvalidUrl(_)
            | ProjectError::GalleryOverflow(_)
            | ProjectError::NoFields => Self::bad_request(err.to_string()),
            other => {
                tracing::error!(error = ?other, "project operation failed");
                Self::internal(other.to_string())
            }
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        tracing::debug!(error = %rejection.body_text(), "rejected request body");
        Self::new(rejection.status(), "Invalid request body.")
    }
}

impl From<MultipartError> for AppError {
    fn from(err: MultipartError) -> Self {
        tracing::debug!(error = %err.body_text(), "rejected multipart body");
        Self::new(err.status(), "Invalid upload.")
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!(error = ?err, "unexpected error");
        Self::internal(UNEXPECTED)
    }
}
