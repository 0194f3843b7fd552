use serde::{Deserialize, Serialize};

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the orchestrator.
///
/// Every variant carries a human-readable message; the variant itself is the
/// error kind that drives retry classification and process exit codes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message")]
pub enum Error {
    /// Configuration violates a documented contract
    InvalidArgument(String),
    /// Token rejected; permanent and user-visible
    AccessDenied(String),
    /// Referenced resource is missing
    NotFound(String),
    /// Plan or operation already present
    AlreadyExists(String),
    /// Concurrent operation conflict; retryable
    CompareFailed(String),
    /// Transient transport failure; retried with backoff
    ConnectionProblem(String),
    /// Preflight or contract failure that must not be retried
    Aborted(String),
    /// Unexpected error
    Internal(String),
}

impl Error {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn access_denied(msg: impl Into<String>) -> Self {
        Error::AccessDenied(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn already_exists(msg: impl Into<String>) -> Self {
        Error::AlreadyExists(msg.into())
    }

    pub fn compare_failed(msg: impl Into<String>) -> Self {
        Error::CompareFailed(msg.into())
    }

    pub fn connection_problem(msg: impl Into<String>) -> Self {
        Error::ConnectionProblem(msg.into())
    }

    pub fn aborted(msg: impl Into<String>) -> Self {
        Error::Aborted(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    pub fn is_access_denied(&self) -> bool {
        matches!(self, Error::AccessDenied(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists(_))
    }

    pub fn is_compare_failed(&self) -> bool {
        matches!(self, Error::CompareFailed(_))
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Error::Aborted(_))
    }

    /// Whether the peer connect loop may retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::AlreadyExists(_)
                | Error::CompareFailed(_)
                | Error::ConnectionProblem(_)
                | Error::NotFound(_)
                | Error::Internal(_)
        )
    }

    /// Process exit code for the CLI surface.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::AccessDenied(_) => 4,
            Error::Aborted(_) => 3,
            Error::CompareFailed(_) | Error::ConnectionProblem(_) | Error::AlreadyExists(_) => 2,
            _ => 1,
        }
    }

    /// Short kind name, stable across serialization.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidArgument(_) => "InvalidArgument",
            Error::AccessDenied(_) => "AccessDenied",
            Error::NotFound(_) => "NotFound",
            Error::AlreadyExists(_) => "AlreadyExists",
            Error::CompareFailed(_) => "CompareFailed",
            Error::ConnectionProblem(_) => "ConnectionProblem",
            Error::Aborted(_) => "Aborted",
            Error::Internal(_) => "Internal",
        }
    }

    fn message(&self) -> &str {
        match self {
            Error::InvalidArgument(m)
            | Error::AccessDenied(m)
            | Error::NotFound(m)
            | Error::AlreadyExists(m)
            | Error::CompareFailed(m)
            | Error::ConnectionProblem(m)
            | Error::Aborted(m)
            | Error::Internal(m) => m,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidArgument(m) => write!(f, "invalid argument: {}", m),
            Error::AccessDenied(m) => write!(f, "access denied: {}", m),
            Error::NotFound(m) => write!(f, "not found: {}", m),
            Error::AlreadyExists(m) => write!(f, "already exists: {}", m),
            Error::CompareFailed(m) => write!(f, "compare failed: {}", m),
            Error::ConnectionProblem(m) => write!(f, "connection problem: {}", m),
            Error::Aborted(m) => write!(f, "aborted: {}", m),
            Error::Internal(m) => write!(f, "internal error: {}", m),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(err.to_string()),
            std::io::ErrorKind::AlreadyExists => Error::AlreadyExists(err.to_string()),
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::TimedOut => Error::ConnectionProblem(err.to_string()),
            _ => Error::Internal(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Internal(format!("serialization: {}", err))
    }
}

impl From<tonic::Status> for Error {
    fn from(status: tonic::Status) -> Self {
        let msg = status.message().to_string();
        match status.code() {
            tonic::Code::InvalidArgument => Error::InvalidArgument(msg),
            tonic::Code::PermissionDenied | tonic::Code::Unauthenticated => {
                Error::AccessDenied(msg)
            }
            tonic::Code::NotFound => Error::NotFound(msg),
            tonic::Code::AlreadyExists => Error::AlreadyExists(msg),
            tonic::Code::FailedPrecondition => Error::CompareFailed(msg),
            tonic::Code::Unavailable | tonic::Code::DeadlineExceeded => {
                Error::ConnectionProblem(msg)
            }
            tonic::Code::Aborted => Error::Aborted(msg),
            _ => Error::Internal(msg),
        }
    }
}

impl From<Error> for tonic::Status {
    fn from(err: Error) -> Self {
        let msg = err.message().to_string();
        match err {
            Error::InvalidArgument(_) => tonic::Status::invalid_argument(msg),
            Error::AccessDenied(_) => tonic::Status::permission_denied(msg),
            Error::NotFound(_) => tonic::Status::not_found(msg),
            Error::AlreadyExists(_) => tonic::Status::already_exists(msg),
            Error::CompareFailed(_) => tonic::Status::failed_precondition(msg),
            Error::ConnectionProblem(_) => tonic::Status::unavailable(msg),
            Error::Aborted(_) => tonic::Status::aborted(msg),
            Error::Internal(_) => tonic::Status::internal(msg),
        }
    }
}

impl From<tonic::transport::Error> for Error {
    fn from(err: tonic::transport::Error) -> Self {
        Error::ConnectionProblem(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::ConnectionProblem(err.to_string())
    }
}

/// Collects multiple shutdown/cleanup errors into a single report.
pub fn aggregate(errors: Vec<Error>) -> Result<()> {
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.into_iter().next().unwrap()),
        _ => {
            let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            Err(Error::Internal(messages.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(Error::access_denied("bad secret token").exit_code(), 4);
        assert_eq!(Error::aborted("preflight failed").exit_code(), 3);
        assert_eq!(Error::connection_problem("timed out").exit_code(), 2);
        assert_eq!(Error::invalid_argument("missing peers").exit_code(), 1);
    }

    #[test]
    fn test_retry_classification() {
        assert!(Error::compare_failed("operation in progress").is_retryable());
        assert!(Error::already_exists("install in progress").is_retryable());
        assert!(!Error::access_denied("bad secret token").is_retryable());
        assert!(!Error::aborted("unknown role").is_retryable());
    }

    #[test]
    fn test_kind_roundtrip_through_json() {
        let err = Error::compare_failed("another operation is running");
        let encoded = serde_json::to_string(&err).unwrap();
        let decoded: Error = serde_json::from_str(&encoded).unwrap();
        assert_eq!(err, decoded);
    }

    #[test]
    fn test_status_conversion() {
        let status: tonic::Status = Error::access_denied("bad secret token").into();
        assert_eq!(status.code(), tonic::Code::PermissionDenied);
        let back: Error = status.into();
        assert!(back.is_access_denied());
    }

    #[test]
    fn test_aggregate() {
        assert!(aggregate(vec![]).is_ok());
        let err = aggregate(vec![
            Error::internal("stop listener"),
            Error::internal("stop agent"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("stop listener"));
        assert!(err.to_string().contains("stop agent"));
    }
}
