use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum Error {
    /// Configuration that cannot produce a working batcher, repository or registry
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// A repository was requested for a resource type nobody registered
    #[error("No reference repository registered for resource type '{resource_type}'")]
    UnknownResourceType { resource_type: String },

    /// IDs must be non-empty strings
    #[error("Invalid {resource_type} ID: {reason}")]
    InvalidId { resource_type: String, reason: String },

    /// A raw resource could not be mapped to a reference item
    #[error("Failed to adapt {resource_type} resource: {message}")]
    Adaptor { resource_type: String, message: String },

    /// A bulk list call failed
    #[error("Failed to fetch {resource_type} references: {source}")]
    Fetch {
        resource_type: String,
        #[source]
        source: Box<Error>,
    },

    /// Transport-level HTTP failure
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// The backend answered with a non-success status
    #[error("Backend returned status {status}: {body}")]
    Status { status: u16, body: String },

    /// Response body could not be (de)serialized
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Waiting for references took longer than allowed
    #[error("Timed out after {waited:?} waiting for {pending} unresolved reference(s)")]
    Timeout { waited: std::time::Duration, pending: usize },

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Wraps a lower-level failure with the resource type whose fetch it broke.
    pub fn fetch(resource_type: impl Into<String>, source: Error) -> Self {
        Error::Fetch {
            resource_type: resource_type.into(),
            source: Box::new(source),
        }
    }

    /// Whether the error came from talking to the backend, as opposed to misuse of the API.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Fetch { source, .. } => source.is_transient(),
            Error::Http(_) | Error::Timeout { .. } => true,
            Error::Status { status, .. } => *status >= 500 || *status == 429 || *status == 408,
            _ => false,
        }
    }
}

/// Type alias for reference operation results
pub type Result<T> = std::result::Result<T, Error>;
