//! Crate-wide error type.

use thiserror::Error;

use crate::providers::ProviderError;
use crate::ssh::RemoteError;

/// Errors surfaced by cluster operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A precondition failed before anything was mutated.
    #[error("Preflight check failed: {0}")]
    Preflight(String),

    /// The cluster configuration cannot be used as given.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// A cloud API call failed.
    #[error("{context}: {source}")]
    Provider {
        context: String,
        #[source]
        source: ProviderError,
    },

    /// A remote command failed after its retries were used up.
    #[error("Remote command on {address} failed: {source}")]
    Remote {
        address: String,
        #[source]
        source: RemoteError,
    },

    /// A server never reported its readiness marker.
    #[error("Server {server} not ready after {attempts} attempts: {last_error}")]
    ReadinessTimeout {
        server: String,
        attempts: u32,
        last_error: String,
    },

    /// Applying a cluster manifest failed.
    #[error("Cannot {step}: {message}")]
    Manifest { step: String, message: String },

    /// Listing upstream releases failed.
    #[error("Cannot fetch releases: {0}")]
    Releases(String),

    /// Local filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The operation was interrupted.
    #[error("Operation cancelled")]
    Cancelled,

    /// A spawned task panicked or was aborted.
    #[error("Task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl Error {
    /// Wrap a provider error with the resource it concerns.
    pub fn provider(context: impl Into<String>, source: ProviderError) -> Self {
        Self::Provider {
            context: context.into(),
            source,
        }
    }

    /// Wrap a remote execution error with the address it ran against.
    pub fn remote(address: impl Into<String>, source: RemoteError) -> Self {
        Self::Remote {
            address: address.into(),
            source,
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
