use rusqlite::Error as RusqliteError;
use std::fmt;
use std::io;
use thiserror::Error;

use crate::source::Location;

/// A database error that was not covered by an active ignore scope.
#[derive(Debug, Clone)]
pub struct SqlFailure {
    /// Symbolic and numeric codes reported by the driver, e.g. `SQLITE_CONSTRAINT_UNIQUE`, `2067`
    pub codes: Vec<String>,
    pub message: String,
    pub command: String,
    pub location: Location,
}

impl SqlFailure {
    /// Short form used in the history log
    pub fn outcome_text(&self) -> String {
        match self.codes.first() {
            Some(code) => format!("{}: {}", code, self.message),
            None => self.message.clone(),
        }
    }
}

impl fmt::Display for SqlFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (at {})\nSQL: {}",
            self.outcome_text(),
            self.location,
            self.command
        )
    }
}

#[derive(Error, Debug)]
pub enum UpgradeError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error), // Converts io::Error into UpgradeError automatically

    #[error("Database error: {0}")]
    DatabaseError(#[from] RusqliteError), // Converts rusqlite::Error automatically

    #[error("{message}, at {location}")]
    Source { message: String, location: Location },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Statement failed: {0}")]
    StatementFailed(SqlFailure),

    #[error("Error: {0}")]
    Error(String), // Allows custom application errors
}

impl UpgradeError {
    pub fn source_error(message: impl Into<String>, location: &Location) -> Self {
        UpgradeError::Source {
            message: message.into(),
            location: location.clone(),
        }
    }
}
