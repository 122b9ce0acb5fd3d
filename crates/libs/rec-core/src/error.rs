//! Error types for rec-core operations.
//!
//! Errors split into three groups:
//!
//! - **External errors**: wrapped errors from dependencies (git2, reqwest,
//!   serde, io)
//! - **Configuration errors**: invalid action definitions, fatal at startup
//! - **Execution errors**: failures scoped to a single delivery; these are
//!   turned into `failed` execution reports and never abort the agent

use strum_macros::AsRefStr;
use thiserror::Error;

/// The error type for rec-core operations.
#[derive(Debug, Error, AsRefStr)]
pub enum Error {
    // -- External errors from dependencies
    /// Git repository error.
    #[error("Git error: {0}")]
    Git2(#[from] git2::Error),

    /// Outbound HTTP error (control plane or http action transport).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error.
    #[error("Serde JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    /// Actions file parse error.
    #[error("Actions file error: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),

    /// Standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -- Configuration errors (fatal at startup)
    /// An action definition failed validation. The string names the action
    /// and the reason.
    #[error("Invalid action: {0}")]
    InvalidAction(String),

    /// Two actions share the same id.
    #[error("Duplicate action id: {0}")]
    DuplicateAction(String),

    /// The control plane sent a delivery the agent cannot use.
    #[error("Invalid delivery: {0}")]
    InvalidDelivery(String),

    // -- Execution errors (reported, never fatal)
    /// Template rendering failed for a parameter or body.
    #[error("Template error: {0}")]
    Template(String),

    /// No repository handle exists for the given URL.
    #[error("Repository not found: {0}")]
    RepositoryNotFound(String),

    /// The requested script does not exist inside the repository checkout.
    #[error("Script not found: {0}")]
    ScriptNotFound(String),

    /// The resolved script path is outside every allowed root.
    #[error("Script path not allowed: {0}")]
    ScriptPathNotAllowed(String),

    /// The control plane answered outside the 2xx range.
    #[error("API error: status {status}: {message}")]
    Api { status: u16, message: String },
}

impl From<minijinja::Error> for Error {
    fn from(err: minijinja::Error) -> Self {
        Error::Template(err.to_string())
    }
}

/// A specialized [`Result`] type for rec-core operations.
pub type Result<T> = core::result::Result<T, Error>;
