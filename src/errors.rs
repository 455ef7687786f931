use thiserror::Error;

/// Stratum wire error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireCode {
    Unknown,
    JobNotFound,
    DuplicateShare,
    LowDifficultyShare,
    UnauthorizedWorker,
    NotSubscribed,
}

impl WireCode {
    pub fn code(self) -> i64 {
        match self {
            WireCode::Unknown => 20,
            WireCode::JobNotFound => 21,
            WireCode::DuplicateShare => 22,
            WireCode::LowDifficultyShare => 23,
            WireCode::UnauthorizedWorker => 24,
            WireCode::NotSubscribed => 25,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            WireCode::Unknown => "Unknown problem",
            WireCode::JobNotFound => "Job not found",
            WireCode::DuplicateShare => "Duplicate share submitted",
            WireCode::LowDifficultyShare => "Invalid difficulty",
            WireCode::UnauthorizedWorker => "Unauthorized worker",
            WireCode::NotSubscribed => "Not subscribed",
        }
    }
}

/// Request-handling failures that terminate the offending connection.
/// Recoverable rejects (bad shares, failed authorization) are answered on the
/// wire and never surface here.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown method '{0}'")]
    UnknownMethod(String),
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("client disconnected")]
    Disconnected,
}

/// Block submission failures reported by the upstream capability.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("block rejected by upstream: {0}")]
    Rejected(String),
    #[error("submit transport failure: {0}")]
    Transport(String),
}

/// Template source payloads that cannot be decoded into a block header.
#[derive(Debug, Error)]
#[error("malformed template payload: {0}")]
pub struct TemplateError(pub String);
