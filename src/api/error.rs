use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

/// Structured error type for all API handlers.
///
/// Each variant maps to an HTTP status code, a machine-readable code string,
/// and a human-readable message. Implements [`IntoResponse`] so handlers can
/// return `Result<T, ApiError>` directly.
#[derive(Debug)]
pub enum ApiError {
    /// 400 - Malformed or invalid request.
    InvalidRequest(String),
    /// 400 - Field identifier in the URL is not acceptable.
    InvalidField(String),
    /// 400 - Cover upload with an empty body.
    EmptyUpload,
    /// 400 - Cover request without a `path` query parameter.
    MissingPath,
    /// 404 - No cover is loaded for this path.
    CoverNotFound(String),
    /// 503 - The server is shutting down.
    ShuttingDown,
}

impl ApiError {
    /// Returns the HTTP status code for this error variant.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::InvalidField(_) => StatusCode::BAD_REQUEST,
            ApiError::EmptyUpload => StatusCode::BAD_REQUEST,
            ApiError::MissingPath => StatusCode::BAD_REQUEST,
            ApiError::CoverNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Returns a machine-readable error code string.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::InvalidField(_) => "invalid_field",
            ApiError::EmptyUpload => "empty_upload",
            ApiError::MissingPath => "missing_path",
            ApiError::CoverNotFound(_) => "cover_not_found",
            ApiError::ShuttingDown => "shutting_down",
        }
    }

    /// Returns a human-readable error message.
    pub fn message(&self) -> String {
        match self {
            ApiError::InvalidRequest(detail) => format!("Invalid request: {}.", detail),
            ApiError::InvalidField(detail) => format!("Invalid field: {}.", detail),
            ApiError::EmptyUpload => "Cover upload body is empty.".to_string(),
            ApiError::MissingPath => "Missing 'path' query parameter.".to_string(),
            ApiError::CoverNotFound(path) => format!("No cover loaded for '{}'.", path),
            ApiError::ShuttingDown => "Server is shutting down.".to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::InvalidRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.message(),
            }
        });
        (self.status_code(), Json(body)).into_response()
    }
}
