use serde::{Deserialize, Serialize};

/// Categorical failure kind carried on the wire next to a free-text
/// diagnostic. `None` marks a successful reply.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    #[default]
    None,
    InvalidInput,
    InvalidFileName,
    OpenFile,
    ReadFile,
    WriteFile,
    Unauthorized,
    NotFound,
    ChildProcess,
    Application,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::None => "none",
            ErrorKind::InvalidInput => "invalid-input",
            ErrorKind::InvalidFileName => "invalid-file-name",
            ErrorKind::OpenFile => "open-file",
            ErrorKind::ReadFile => "read-file",
            ErrorKind::WriteFile => "write-file",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::NotFound => "not-found",
            ErrorKind::ChildProcess => "child-process",
            ErrorKind::Application => "application",
            ErrorKind::Unknown => "unknown",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        let all = [
            ErrorKind::None,
            ErrorKind::InvalidInput,
            ErrorKind::InvalidFileName,
            ErrorKind::OpenFile,
            ErrorKind::ReadFile,
            ErrorKind::WriteFile,
            ErrorKind::Unauthorized,
            ErrorKind::NotFound,
            ErrorKind::ChildProcess,
            ErrorKind::Application,
            ErrorKind::Unknown,
        ];
        all.into_iter().find(|k| k.as_str() == value)
    }

    pub fn message(&self) -> &'static str {
        match self {
            ErrorKind::None => "No error",
            ErrorKind::InvalidInput => "Invalid input",
            ErrorKind::InvalidFileName => "Invalid file name",
            ErrorKind::OpenFile => "Failed to open file",
            ErrorKind::ReadFile => "Failed to read file",
            ErrorKind::WriteFile => "Failed to write file",
            ErrorKind::Unauthorized => "Unauthorized access",
            ErrorKind::NotFound => "Not found",
            ErrorKind::ChildProcess => "Child process error",
            ErrorKind::Application => "Internal application error",
            ErrorKind::Unknown => "Unknown error",
        }
    }
}

/// A service-level failure: kind for the wire, message for humans.
#[derive(Clone, Debug)]
pub struct ServiceError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ServiceError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ServiceError {}

pub type ServiceResult<T> = Result<T, ServiceError>;
