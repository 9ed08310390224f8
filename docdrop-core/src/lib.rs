mod client;
mod error;
mod metadata;
mod session;

pub use client::{Device, DeviceClient, TreeReadStatus};
pub use error::{ClientError, ConnectionError, DeviceError};
pub use metadata::{
    Content, DocumentType, FileType, Metadata, Transform, epoch_millis, from_millis, to_millis,
};
pub use session::{
    BASE_PATH, CONTENT_SUFFIX, DEFAULT_CONNECT_TIMEOUT, DEFAULT_HOST, DEFAULT_IO_TIMEOUT,
    DEFAULT_PORT, DeviceSession, METADATA_SUFFIX, RemoteEntry, SessionConfig, SessionState,
    SftpSession,
};
