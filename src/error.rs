use std::fmt::{self, Debug, Display};
use std::io;

use serde_json::Value;

/// Provides `TetherError` and maps other errors to
/// convert to a `TetherError`
#[derive(Debug)]
#[allow(clippy::module_name_repetitions)]
pub enum TetherError {
    /// A validator rejected a proposed attribute set. Carries the
    /// validator's payload, also available via `Model::validation_error`.
    Validation(Value),
    IoError(io::Error),
    JsonError(serde_json::Error),
    TetherError(String),
}

impl From<io::Error> for TetherError {
    fn from(error: io::Error) -> Self {
        TetherError::IoError(error)
    }
}

impl From<serde_json::Error> for TetherError {
    fn from(error: serde_json::Error) -> Self {
        TetherError::JsonError(error)
    }
}

impl From<String> for TetherError {
    fn from(error: String) -> Self {
        TetherError::TetherError(error)
    }
}

impl From<&str> for TetherError {
    fn from(error: &str) -> Self {
        TetherError::TetherError(error.to_string())
    }
}

impl std::error::Error for TetherError {}

impl Display for TetherError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Error: {self:?}")?;
        Ok(())
    }
}
