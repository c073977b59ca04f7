use std::fmt;

use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use thiserror::Error;
use tokio::time::Duration;

use crate::validation::ValidationError;

#[derive(Error, Debug)]
pub enum StdError {
    #[error("JsonSerializationError: {0}")]
    JsonSerializationError(#[source] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("Finalizer Error: {0}")]
    // NB: awkward type because finalizer::Error embeds the reconciler error (which is this)
    // so boxing this error to break cycles
    FinalizerError(#[source] Box<kube::runtime::finalizer::Error<Error>>),

    #[error("MetadataMissing: {0}")]
    MetadataMissing(String),

    #[error("InvalidArgument: {0}")]
    InvalidArgument(String),

    #[error("ConfigError: {0}")]
    Config(String),

    #[error("{0}")]
    Validation(#[source] ValidationError),

    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("task {task} exists and has not completed")]
    TaskInFlight { task: String },

    #[error("write conflict updating {name}")]
    WriteConflict { name: String },

    #[error("workflow {id} has {found} marker tasks, expected exactly one")]
    WorkflowIntegrity { id: String, found: usize },

    #[error("invalid strategy {0}")]
    UnknownStrategy(String),

    #[error("disk usage probe failed on {instance}: {detail}")]
    ProbeFailed { instance: String, detail: String },
}

impl StdError {
    pub fn metric_label(&self) -> String {
        format!("{self:?}").to_lowercase()
    }

    fn status_code(&self) -> StatusCode {
        match self {
            StdError::Validation(_) | StdError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            StdError::NotFound { .. } => StatusCode::NOT_FOUND,
            StdError::AlreadyExists { .. }
            | StdError::TaskInFlight { .. }
            | StdError::WriteConflict { .. } => StatusCode::CONFLICT,
            StdError::KubeError(kube::Error::Api(e)) if e.code == 404 => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Error, Debug)]
pub struct ErrorWithRequeue {
    pub duration: Duration,
    pub error: StdError,
}

impl ErrorWithRequeue {
    pub fn new(error: StdError, duration: Duration) -> ErrorWithRequeue {
        ErrorWithRequeue { error, duration }
    }

    pub fn metric_label(&self) -> String {
        self.error.metric_label()
    }
}

impl fmt::Display for ErrorWithRequeue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Standard Error: {0}")]
    StdError(#[source] StdError),

    #[error("Error With Requeue: {0}")]
    ErrorWithRequeue(#[source] ErrorWithRequeue),
}

impl Error {
    pub fn metric_label(&self) -> String {
        format!("{self:?}").to_lowercase()
    }
}

impl From<ValidationError> for Error {
    fn from(e: ValidationError) -> Self {
        Error::StdError(StdError::Validation(e))
    }
}

/// Intent handlers bubble the error taxonomy straight out of actix routes:
/// admission rejections map to 400, conflicting in-flight work to 409,
/// missing targets to 404 and everything else to 500.
impl actix_web::ResponseError for Error {
    fn status_code(&self) -> StatusCode {
        match self {
            Error::StdError(e) => e.status_code(),
            Error::ErrorWithRequeue(e) => e.error.status_code(),
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(serde_json::json!({
            "error": self.to_string(),
        }))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
