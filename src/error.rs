use thiserror::Error;

#[derive(Error, Debug)]
pub enum JudgeError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Submission not found: {0}")]
    SubmissionNotFound(String),

    #[error("Invalid submission cursor: {0}")]
    InvalidCursor(String),

    #[error("Job queue is at capacity ({0} pending)")]
    QueueFull(usize),

    #[error("Broker is shutting down")]
    ShuttingDown,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] crate::sandbox::SandboxError),

    #[error("gRPC error: {0}")]
    GrpcError(#[from] tonic::Status),

    #[error("Transport error: {0}")]
    TransportError(#[from] tonic::transport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, JudgeError>;

impl From<JudgeError> for tonic::Status {
    fn from(err: JudgeError) -> Self {
        match err {
            JudgeError::InvalidRequest(msg) => tonic::Status::invalid_argument(msg),
            JudgeError::InvalidCursor(_) => tonic::Status::invalid_argument(err.to_string()),
            JudgeError::SubmissionNotFound(_) => tonic::Status::not_found(err.to_string()),
            JudgeError::QueueFull(_) => tonic::Status::resource_exhausted(err.to_string()),
            JudgeError::ShuttingDown => tonic::Status::unavailable(err.to_string()),
            JudgeError::Sandbox(_) | JudgeError::TransportError(_) => {
                tonic::Status::unavailable(err.to_string())
            }
            JudgeError::GrpcError(status) => status,
            JudgeError::Storage(_) | JudgeError::Io(_) | JudgeError::Internal(_) => {
                tonic::Status::internal(err.to_string())
            }
        }
    }
}
