use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

use crate::metadata::DocumentType;

/// Transport, authentication or session failure while talking to the device.
///
/// Always retryable: the same request can succeed once the device is reachable again.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to resolve device address {address}: {source}")]
    Resolve {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("trouble connecting to device at {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("ssh {stage} failed: {source}")]
    Ssh {
        stage: &'static str,
        #[source]
        source: ssh2::Error,
    },
    #[error("device rejected credentials for user {0}")]
    AuthRejected(String),
    #[error("device host key does not match the known hosts entry")]
    HostKeyMismatch,
    #[error("sftp {operation} failed for {path}: {source}")]
    Sftp {
        operation: &'static str,
        path: String,
        #[source]
        source: ssh2::Error,
    },
    #[error("I/O error during {operation} of {path}: {source}")]
    Io {
        operation: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("device session task failed: {0}")]
    Task(String),
}

/// The device answered, but the request cannot succeed without a change on the device.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("entry {id} is not a folder (type {kind})")]
    NotAFolder { id: Uuid, kind: DocumentType },
    #[error("entry {id} is not a document (type {kind})")]
    NotADocument { id: Uuid, kind: DocumentType },
    #[error("malformed metadata for {id}: {source}")]
    MalformedMetadata {
        id: Uuid,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize {what}: {source}")]
    Serialize {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to read local file {path:?}: {source}")]
    LocalFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("entry {0} does not exist on the device")]
    MissingEntry(Uuid),
    #[error("entry {0} already exists on the device")]
    EntryExists(Uuid),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("device is busy with another operation")]
    Busy,
    #[error(transparent)]
    Device(#[from] DeviceError),
}

impl ClientError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Connection(_) | ClientError::Busy)
    }
}
