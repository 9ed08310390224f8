use std::sync::Arc;

use docdrop_core::{ClientError, ConnectionError, Device};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use super::command::{Command, CommandKind, SyncOutcome, SyncResult};
use crate::files::FileStorage;

pub const PARENT_MISSING: &str = "parent folder does not exist";
pub const FOLDER_EXISTS: &str = "folder already exists";
pub const FILE_EXISTS: &str = "file already exists";
pub const ENTITY_MISSING: &str = "entity does not exist";
pub const FOLDER_NOT_EMPTY: &str = "folder is not empty";

/// Stops the current run; the command stays unsynced and is retried next run.
#[derive(Debug, Error)]
pub enum SyncAbort {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("device is busy with another operation")]
    DeviceBusy,
}

impl SyncAbort {
    pub fn result(&self) -> SyncResult {
        SyncResult::ConnectionFailed
    }
}

/// Applies one command to the device and folds every expected failure into a
/// [`SyncOutcome`].
#[derive(Clone)]
pub struct CommandHandler {
    device: Arc<dyn Device>,
    storage: FileStorage,
}

impl CommandHandler {
    pub fn new(device: Arc<dyn Device>, storage: FileStorage) -> Self {
        Self { device, storage }
    }

    pub async fn handle(&self, command: &Command) -> Result<SyncOutcome, SyncAbort> {
        let id = command.entity_id;
        let applied = match &command.kind {
            CommandKind::CreateFolder { name, parent_id } => {
                self.create_folder(id, name, *parent_id).await
            }
            CommandKind::UploadFile { name, parent_id } => {
                self.upload_file(id, name, *parent_id).await
            }
            CommandKind::Rename { new_name } => self.rename(id, new_name).await,
            CommandKind::Delete => self.delete(id).await,
        };
        match applied {
            Ok(outcome) => Ok(outcome),
            Err(ClientError::Connection(err)) => Err(SyncAbort::Connection(err)),
            Err(ClientError::Busy) => Err(SyncAbort::DeviceBusy),
            Err(ClientError::Device(err)) => {
                debug!(%id, number = command.command_number, error = %err, "command failed on device");
                Ok(SyncOutcome::execution_failed(err.to_string()))
            }
        }
    }

    async fn parent_missing(&self, parent_id: Option<Uuid>) -> Result<bool, ClientError> {
        match parent_id {
            Some(parent_id) => Ok(!self.device.folder_exists(parent_id).await?),
            None => Ok(false),
        }
    }

    async fn create_folder(
        &self,
        id: Uuid,
        name: &str,
        parent_id: Option<Uuid>,
    ) -> Result<SyncOutcome, ClientError> {
        if self.parent_missing(parent_id).await? {
            return Ok(SyncOutcome::precondition_failed(PARENT_MISSING));
        }
        if self.device.folder_exists(id).await? {
            return Ok(SyncOutcome::precondition_failed(FOLDER_EXISTS));
        }
        self.device.create_folder(id, name, parent_id).await?;
        Ok(SyncOutcome::success())
    }

    async fn upload_file(
        &self,
        id: Uuid,
        name: &str,
        parent_id: Option<Uuid>,
    ) -> Result<SyncOutcome, ClientError> {
        if self.parent_missing(parent_id).await? {
            return Ok(SyncOutcome::precondition_failed(PARENT_MISSING));
        }
        if self.device.file_exists(id).await? {
            return Ok(SyncOutcome::precondition_failed(FILE_EXISTS));
        }
        let content_path = self.storage.document_path(id);
        let thumbnail_path = self.storage.thumbnail_path(id);
        self.device
            .upload_file(id, parent_id, name, &content_path, Some(&thumbnail_path))
            .await?;
        Ok(SyncOutcome::success())
    }

    async fn rename(&self, id: Uuid, new_name: &str) -> Result<SyncOutcome, ClientError> {
        if !self.device.entry_exists(id).await? {
            return Ok(SyncOutcome::precondition_failed(ENTITY_MISSING));
        }
        self.device.rename(id, new_name).await?;
        Ok(SyncOutcome::success())
    }

    async fn delete(&self, id: Uuid) -> Result<SyncOutcome, ClientError> {
        if !self.device.entry_exists(id).await? {
            return Ok(SyncOutcome::precondition_failed(ENTITY_MISSING));
        }
        if self.device.has_children(id).await? {
            return Ok(SyncOutcome::precondition_failed(FOLDER_NOT_EMPTY));
        }
        self.device.delete(id).await?;
        Ok(SyncOutcome::success())
    }
}

#[cfg(test)]
#[path = "handler_tests.rs"]
mod tests;
