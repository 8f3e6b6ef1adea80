//! Machine-readable error taxonomy carried in the RPC `error` field.

use serde::{Deserialize, Serialize};

/// Error codes propagated to clients.
///
/// Serialized by variant name so the wire form is the code itself
/// (e.g. `"PathEscapesSharing"`).
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, strum::Display)]
pub enum ErrorCode {
    TransportError,
    ProtocolError,
    AuthRequired,
    AuthFailed,
    NotBound,
    AlreadyBound,
    NoSuchSharing,
    ReadOnly,
    PathEscapesSharing,
    NotFound,
    NotADirectory,
    IsADirectory,
    Exists,
    PermissionDenied,
    RexecDisabled,
    Truncated,
    Aborted,
    InvalidArgument,
}

impl std::error::Error for ErrorCode {}

impl ErrorCode {
    /// One-line diagnostic the client prints for this code.
    pub fn message(&self) -> &'static str {
        match self {
            ErrorCode::TransportError => "connection failed",
            ErrorCode::ProtocolError => "malformed frame or payload",
            ErrorCode::AuthRequired => "authentication required",
            ErrorCode::AuthFailed => "authentication failed",
            ErrorCode::NotBound => "no sharing is open",
            ErrorCode::AlreadyBound => "a sharing is already open",
            ErrorCode::NoSuchSharing => "no sharing with that name",
            ErrorCode::ReadOnly => "sharing is read-only",
            ErrorCode::PathEscapesSharing => "path escapes the sharing",
            ErrorCode::NotFound => "no such file or directory",
            ErrorCode::NotADirectory => "not a directory",
            ErrorCode::IsADirectory => "is a directory",
            ErrorCode::Exists => "already exists",
            ErrorCode::PermissionDenied => "permission denied",
            ErrorCode::RexecDisabled => "remote execution is disabled on this server",
            ErrorCode::Truncated => "transfer stream truncated",
            ErrorCode::Aborted => "transfer aborted",
            ErrorCode::InvalidArgument => "invalid argument",
        }
    }
}

impl From<std::io::ErrorKind> for ErrorCode {
    fn from(kind: std::io::ErrorKind) -> Self {
        match kind {
            std::io::ErrorKind::NotFound => ErrorCode::NotFound,
            std::io::ErrorKind::PermissionDenied => ErrorCode::PermissionDenied,
            std::io::ErrorKind::AlreadyExists => ErrorCode::Exists,
            std::io::ErrorKind::NotADirectory => ErrorCode::NotADirectory,
            std::io::ErrorKind::IsADirectory => ErrorCode::IsADirectory,
            std::io::ErrorKind::InvalidInput => ErrorCode::InvalidArgument,
            std::io::ErrorKind::UnexpectedEof => ErrorCode::Truncated,
            // catch-all for the remaining kinds; the detailed message
            // travels next to the code
            _ => ErrorCode::PermissionDenied,
        }
    }
}

impl From<std::io::Error> for ErrorCode {
    fn from(error: std::io::Error) -> Self {
        error.kind().into()
    }
}
