/*!
Error types for the hwinv core.
*/

use thiserror::Error;

/// Result type used throughout the hwinv core.
pub type Result<T> = std::result::Result<T, InventoryError>;

/// Errors that can occur while polling, diffing and reporting facets.
#[derive(Error, Debug)]
pub enum InventoryError {
    /// The environment could not be queried for a facet
    #[error("Acquisition error for facet '{facet}': {message}")]
    Acquisition { facet: String, message: String },

    /// The reporting sink failed to deliver a payload
    #[error("Upload to table '{table}' failed: {message}")]
    Upload { table: String, message: String },

    /// A facet provider broke the record contract
    #[error("Contract violation in facet '{facet}': {message}")]
    Contract { facet: String, message: String },

    /// The collection service answered with something we cannot use
    #[error("Invalid response from collection service: {0}")]
    InvalidResponse(String),

    /// Configuration or argument validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// I/O errors during file operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl InventoryError {
    /// Create a new acquisition error
    pub fn acquisition<F: Into<String>, S: Into<String>>(facet: F, msg: S) -> Self {
        Self::Acquisition {
            facet: facet.into(),
            message: msg.into(),
        }
    }

    /// Create a new upload error
    pub fn upload<T: Into<String>, S: Into<String>>(table: T, msg: S) -> Self {
        Self::Upload {
            table: table.into(),
            message: msg.into(),
        }
    }

    /// Create a new contract violation
    pub fn contract<F: Into<String>, S: Into<String>>(facet: F, msg: S) -> Self {
        Self::Contract {
            facet: facet.into(),
            message: msg.into(),
        }
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new invalid response error
    pub fn invalid_response<S: Into<String>>(msg: S) -> Self {
        Self::InvalidResponse(msg.into())
    }

    /// Whether the failure only costs the current cycle.
    ///
    /// Contract violations and serialization bugs are not recoverable: the
    /// facet's task stops on them.
    pub fn is_recoverable(&self) -> bool {
        match self {
            InventoryError::Acquisition { .. }
            | InventoryError::Upload { .. }
            | InventoryError::InvalidResponse(_)
            | InventoryError::Io(_) => true,
            InventoryError::Contract { .. }
            | InventoryError::Validation(_)
            | InventoryError::Json(_) => false,
        }
    }
}
