//! Error taxonomy and JSON error responses

use crate::body::{full, ProxyBody};
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Uniform error kinds shared by every component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Malformed body, missing field, unsupported endpoint type, non-zip upload
    InvalidInput,
    /// Entity lookup miss or no matching route
    NotFound,
    /// Duplicate state
    Conflict,
    /// Missing or wrong credentials
    Unauthorized,
    /// Request body over the configured limit
    PayloadTooLarge,
    /// Upstream of a route failed
    BadGateway,
    /// Detected stack has no built-in Dockerfile template
    NoTemplateForStack,
    /// Project tree matched no stack indicator
    NoStackDetected,
    /// No interactive listener attached to answer a prompt
    NoInteractiveClient,
    /// Interactive listener never answered
    PromptTimeout,
    /// Container engine failure
    EngineError,
    /// Anything else
    InternalError,
}

impl ErrorKind {
    /// Get the HTTP status code for this kind
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ErrorKind::BadGateway => StatusCode::BAD_GATEWAY,
            ErrorKind::NoTemplateForStack => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::NoStackDetected => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::NoInteractiveClient => StatusCode::PRECONDITION_FAILED,
            ErrorKind::PromptTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::EngineError => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the kind as a string for the X-Neploy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "INVALID_INPUT",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::Unauthorized => "UNAUTHORIZED",
            ErrorKind::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            ErrorKind::BadGateway => "BAD_GATEWAY",
            ErrorKind::NoTemplateForStack => "NO_TEMPLATE_FOR_STACK",
            ErrorKind::NoStackDetected => "NO_STACK_DETECTED",
            ErrorKind::NoInteractiveClient => "NO_INTERACTIVE_CLIENT",
            ErrorKind::PromptTimeout => "PROMPT_TIMEOUT",
            ErrorKind::EngineError => "ENGINE_ERROR",
            ErrorKind::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// Errors returned by the core
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("request body exceeds {0} bytes")]
    PayloadTooLarge(usize),

    #[error("{0}")]
    BadGateway(String),

    #[error("no Dockerfile template for stack '{0}'")]
    NoTemplateForStack(String),

    #[error("no technology stack detected in {0}")]
    NoStackDetected(String),

    #[error("no interactive client connected")]
    NoInteractiveClient,

    #[error("timed out waiting for a response to '{0}'")]
    PromptTimeout(String),

    #[error("container engine error: {0}")]
    Engine(String),

    /// Non-fatal naming collision; the caller reconciles by name
    #[error("container name already in use: {0}")]
    ContainerInUse(String),

    #[error("git error: {0}")]
    Git(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidInput(_) | Error::Json(_) => ErrorKind::InvalidInput,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::Unauthorized => ErrorKind::Unauthorized,
            Error::PayloadTooLarge(_) => ErrorKind::PayloadTooLarge,
            Error::BadGateway(_) => ErrorKind::BadGateway,
            Error::NoTemplateForStack(_) => ErrorKind::NoTemplateForStack,
            Error::NoStackDetected(_) => ErrorKind::NoStackDetected,
            Error::NoInteractiveClient => ErrorKind::NoInteractiveClient,
            Error::PromptTimeout(_) => ErrorKind::PromptTimeout,
            Error::Engine(_) | Error::ContainerInUse(_) => ErrorKind::EngineError,
            Error::Git(_) | Error::Database(_) | Error::Io(_) | Error::Archive(_) => {
                ErrorKind::InternalError
            }
        }
    }

    /// True for engine naming collisions, which the pipeline reconciles instead of failing
    pub fn is_in_use(&self) -> bool {
        matches!(self, Error::ContainerInUse(_))
    }

    /// Render as a JSON error response
    pub fn to_response(&self) -> Response<ProxyBody> {
        json_error_response(self.kind(), self.to_string())
    }
}

impl From<bollard::errors::Error> for Error {
    fn from(err: bollard::errors::Error) -> Self {
        let message = err.to_string();
        if message.contains("already in use") {
            Error::ContainerInUse(message)
        } else {
            Error::Engine(message)
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ErrorKind,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Neploy-Error header
pub fn json_error_response(kind: ErrorKind, message: impl Into<String>) -> Response<ProxyBody> {
    let error = ErrorResponse::new(kind, message);

    Response::builder()
        .status(kind.status_code())
        .header("Content-Type", "application/json")
        .header("X-Neploy-Error", kind.as_header_value())
        .body(full(error.to_json()))
        .expect("valid response with StatusCode enum and static headers")
}
