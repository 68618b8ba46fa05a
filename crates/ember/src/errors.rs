//! Error types for the plugin and their mapping onto gRPC status codes.

use thiserror::Error;
use tonic::Status;

/// Errors coming out of the persistence store.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("store is unreachable: {0}")]
    Unreachable(String),
    #[error("record {0} conflicts with a concurrent change")]
    Conflict(String),
    #[error("malformed record for {kind} {id}: {source}")]
    Corrupt {
        kind: &'static str,
        id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Sql(#[from] sqlx::Error),
    #[error(transparent)]
    Kube(#[from] kube::Error),
}

/// Errors reported by the storage driver. Anything the driver fails at maps
/// to `UNKNOWN` on the wire, matching how driver exceptions surface.
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("backend setup check failed: {0}")]
    Setup(String),
    #[error("{operation} failed for {resource}: {message}")]
    Operation {
        operation: &'static str,
        resource: String,
        message: String,
    },
    #[error("resource {0} does not exist in the backend")]
    NotFound(String),
}

/// Errors from host-side mount, format and device inspection helpers.
#[derive(Error, Debug)]
pub enum MountError {
    #[error("command {command} exited with code {code}: {stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },
    #[error("could not spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<PersistenceError> for Status {
    fn from(err: PersistenceError) -> Self {
        match err {
            PersistenceError::Conflict(_) => Status::aborted(err.to_string()),
            _ => Status::unavailable(err.to_string()),
        }
    }
}

impl From<DriverError> for Status {
    fn from(err: DriverError) -> Self {
        Status::unknown(err.to_string())
    }
}

impl From<MountError> for Status {
    fn from(err: MountError) -> Self {
        Status::unknown(err.to_string())
    }
}
