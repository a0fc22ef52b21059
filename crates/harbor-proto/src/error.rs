use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::envelope::ErrorDescriptor;

/// Failures a target reports back to the controller in a response envelope.
///
/// None of these are fatal to either side; they all travel over the relay as
/// an `{error, code}` payload correlated to the originating request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("Permission denied")]
    PermissionDenied,
    #[error("Unknown command")]
    UnknownCommand,
    #[error("{0}")]
    HandlerFailure(String),
    #[error("Another permission prompt is pending")]
    Busy,
    #[error("Permission decision timed out")]
    Timeout,
    #[error("Controller is not bound to this target")]
    UnboundController,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    PermissionDenied,
    UnknownCommand,
    HandlerFailure,
    Busy,
    Timeout,
    UnboundController,
}

impl CommandError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CommandError::PermissionDenied => ErrorCode::PermissionDenied,
            CommandError::UnknownCommand => ErrorCode::UnknownCommand,
            CommandError::HandlerFailure(_) => ErrorCode::HandlerFailure,
            CommandError::Busy => ErrorCode::Busy,
            CommandError::Timeout => ErrorCode::Timeout,
            CommandError::UnboundController => ErrorCode::UnboundController,
        }
    }

    pub fn descriptor(&self) -> ErrorDescriptor {
        ErrorDescriptor {
            error: self.to_string(),
            code: Some(self.code()),
        }
    }
}
