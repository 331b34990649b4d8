use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SegmentError {
    /// The inference gate is already held by another request.
    #[error("Busy")]
    Busy,

    #[error("Download failed: {0}")]
    Transport(String),

    #[error("Invalid volume: {0}")]
    InvalidVolume(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Rendering failed: {0}")]
    Render(String),

    #[error("Upload failed: {0}")]
    Upload(String),

    #[error("Credentials error: {0}")]
    Credentials(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timed out after {0} seconds")]
    Timeout(u64),

    #[error("Internal error: {0}")]
    InternalError(String),
}

pub type Result<T> = std::result::Result<T, SegmentError>;

impl SegmentError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            SegmentError::Busy => StatusCode::TOO_MANY_REQUESTS,
            SegmentError::InvalidRequest(_) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short label used for the `outcome` metric dimension.
    pub fn kind(&self) -> &'static str {
        match self {
            SegmentError::Busy => "busy",
            SegmentError::Transport(_) | SegmentError::Upload(_) => "transport",
            SegmentError::InvalidVolume(_) | SegmentError::InvalidRequest(_) => "data",
            SegmentError::Model(_)
            | SegmentError::Inference(_)
            | SegmentError::Credentials(_)
            | SegmentError::Config(_) => "resource",
            SegmentError::Render(_) | SegmentError::Timeout(_) | SegmentError::InternalError(_) => {
                "internal"
            }
        }
    }
}

impl From<anyhow::Error> for SegmentError {
    fn from(err: anyhow::Error) -> Self {
        SegmentError::InternalError(err.to_string())
    }
}

impl From<std::io::Error> for SegmentError {
    fn from(err: std::io::Error) -> Self {
        SegmentError::InternalError(format!("I/O error: {}", err))
    }
}

impl From<nifti::NiftiError> for SegmentError {
    fn from(err: nifti::NiftiError) -> Self {
        SegmentError::InvalidVolume(err.to_string())
    }
}

impl From<ort::Error> for SegmentError {
    fn from(err: ort::Error) -> Self {
        SegmentError::Inference(err.to_string())
    }
}

impl From<image::ImageError> for SegmentError {
    fn from(err: image::ImageError) -> Self {
        SegmentError::Render(err.to_string())
    }
}

impl From<tokio::task::JoinError> for SegmentError {
    fn from(err: tokio::task::JoinError) -> Self {
        SegmentError::InternalError(format!("pipeline task failed: {}", err))
    }
}

impl IntoResponse for SegmentError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_maps_to_429_with_plain_detail() {
        let err = SegmentError::Busy;
        assert_eq!(err.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.to_string(), "Busy");
    }

    #[test]
    fn test_processing_errors_map_to_500() {
        let errors = [
            SegmentError::Transport("connection refused".into()),
            SegmentError::InvalidVolume("bad header".into()),
            SegmentError::Model("missing weights".into()),
            SegmentError::Upload("403".into()),
        ];
        for err in errors {
            assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        }
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(SegmentError::Transport(String::new()).kind(), "transport");
        assert_eq!(SegmentError::InvalidVolume(String::new()).kind(), "data");
        assert_eq!(SegmentError::Model(String::new()).kind(), "resource");
    }
}
