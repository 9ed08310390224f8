use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ClientError, ConnectionError, DeviceError};
use crate::metadata::{Content, DocumentType, Metadata};
use crate::session::{BASE_PATH, CONTENT_SUFFIX, DeviceSession, METADATA_SUFFIX};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeReadStatus {
    Available,
    Busy,
}

/// Domain operations the sync handler applies commands through.
#[async_trait]
pub trait Device: Send + Sync {
    /// `false` when the metadata is absent or marked deleted.
    async fn folder_exists(&self, id: Uuid) -> Result<bool, ClientError>;
    async fn file_exists(&self, id: Uuid) -> Result<bool, ClientError>;
    /// Non-deleted entry of either type.
    async fn entry_exists(&self, id: Uuid) -> Result<bool, ClientError>;
    async fn has_children(&self, id: Uuid) -> Result<bool, ClientError>;
    async fn create_folder(
        &self,
        id: Uuid,
        name: &str,
        parent: Option<Uuid>,
    ) -> Result<(), ClientError>;
    async fn upload_file(
        &self,
        id: Uuid,
        parent: Option<Uuid>,
        name: &str,
        content_path: &Path,
        thumbnail_path: Option<&Path>,
    ) -> Result<(), ClientError>;
    async fn rename(&self, id: Uuid, new_name: &str) -> Result<(), ClientError>;
    async fn delete(&self, id: Uuid) -> Result<(), ClientError>;
}

/// Single-flight facade over a [`DeviceSession`].
///
/// Every public operation takes the one permit with a non-blocking acquire and
/// reports busy instead of queueing behind a running operation.
#[derive(Clone)]
pub struct DeviceClient {
    session: Arc<dyn DeviceSession>,
    guard: Arc<Semaphore>,
    base_path: String,
    clock: fn() -> OffsetDateTime,
}

impl DeviceClient {
    pub fn new(session: Arc<dyn DeviceSession>) -> Self {
        Self {
            session,
            guard: Arc::new(Semaphore::new(1)),
            base_path: BASE_PATH.to_string(),
            clock: OffsetDateTime::now_utc,
        }
    }

    pub fn with_clock(mut self, clock: fn() -> OffsetDateTime) -> Self {
        self.clock = clock;
        self
    }

    pub fn is_busy(&self) -> bool {
        self.guard.available_permits() == 0
    }

    /// Enumerates every metadata file on a spawned task.
    ///
    /// `on_entry` receives the entry id and the raw metadata JSON. `on_done` runs exactly
    /// once, after the guard is released, with the connection error that ended the walk.
    /// Must be called from within a tokio runtime.
    pub fn read_file_tree<E, D>(&self, mut on_entry: E, on_done: D) -> TreeReadStatus
    where
        E: FnMut(Uuid, String) + Send + 'static,
        D: FnOnce(Option<ConnectionError>) + Send + 'static,
    {
        let Ok(permit) = self.acquire() else {
            return TreeReadStatus::Busy;
        };
        let session = Arc::clone(&self.session);
        let base_path = self.base_path.clone();
        tokio::spawn(async move {
            let result = walk_tree(session.as_ref(), &base_path, &mut on_entry).await;
            drop(permit);
            on_done(result.err());
        });
        TreeReadStatus::Available
    }

    fn acquire(&self) -> Result<OwnedSemaphorePermit, ClientError> {
        Arc::clone(&self.guard)
            .try_acquire_owned()
            .map_err(|_| ClientError::Busy)
    }

    fn entry_path(&self, id: Uuid, suffix: &str) -> String {
        format!("{}/{id}{suffix}", self.base_path)
    }

    async fn read_metadata(&self, id: Uuid) -> Result<Option<Metadata>, ClientError> {
        let path = self.entry_path(id, METADATA_SUFFIX);
        match self.session.read_file(&path).await? {
            Some(bytes) => Ok(Some(Metadata::from_slice(id, &bytes)?)),
            None => Ok(None),
        }
    }

    async fn live_metadata(&self, id: Uuid) -> Result<Option<Metadata>, ClientError> {
        Ok(self.read_metadata(id).await?.filter(|metadata| !metadata.deleted))
    }

    /// The type is checked before `deleted`, so a deleted entry of the wrong type
    /// is still an error.
    async fn exists_as(&self, id: Uuid, expected: DocumentType) -> Result<bool, ClientError> {
        let _permit = self.acquire()?;
        let Some(metadata) = self.read_metadata(id).await? else {
            return Ok(false);
        };
        if metadata.kind == expected {
            return Ok(!metadata.deleted);
        }
        Err(match expected {
            DocumentType::Folder => DeviceError::NotAFolder {
                id,
                kind: metadata.kind,
            },
            DocumentType::Document => DeviceError::NotADocument {
                id,
                kind: metadata.kind,
            },
        }
        .into())
    }

    /// Fails with [`DeviceError::EntryExists`] when `{id}.metadata` is on the device,
    /// deleted or not.
    async fn ensure_absent(&self, id: Uuid) -> Result<(), ClientError> {
        let path = self.entry_path(id, METADATA_SUFFIX);
        if self.session.read_file(&path).await?.is_some() {
            return Err(DeviceError::EntryExists(id).into());
        }
        Ok(())
    }

    async fn rewrite_metadata(
        &self,
        id: Uuid,
        change: impl FnOnce(&Metadata, OffsetDateTime) -> Metadata + Send,
    ) -> Result<(), ClientError> {
        let _permit = self.acquire()?;
        let current = self
            .read_metadata(id)
            .await?
            .ok_or(DeviceError::MissingEntry(id))?;
        let updated = change(&current, (self.clock)());
        let path = self.entry_path(id, METADATA_SUFFIX);
        self.session.overwrite_file(&path, &updated.to_vec()?).await?;
        Ok(())
    }
}

async fn walk_tree<E>(
    session: &dyn DeviceSession,
    base_path: &str,
    on_entry: &mut E,
) -> Result<(), ConnectionError>
where
    E: FnMut(Uuid, String) + Send,
{
    let entries = session.list_metadata_files(base_path).await?;
    debug!(count = entries.len(), "reading device file tree");
    for entry in entries {
        let Some(id) = entry
            .name
            .strip_suffix(METADATA_SUFFIX)
            .and_then(|stem| Uuid::parse_str(stem).ok())
        else {
            debug!(name = %entry.name, "skipping metadata file without an id");
            continue;
        };
        // Gone between listing and reading.
        let Some(bytes) = session.read_file(&entry.path).await? else {
            continue;
        };
        on_entry(id, String::from_utf8_lossy(&bytes).into_owned());
    }
    Ok(())
}

async fn read_local(path: &Path) -> Result<Vec<u8>, DeviceError> {
    tokio::fs::read(path)
        .await
        .map_err(|source| DeviceError::LocalFile {
            path: path.to_path_buf(),
            source,
        })
}

async fn read_optional_local(path: &Path) -> Result<Option<Vec<u8>>, DeviceError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(source) => Err(DeviceError::LocalFile {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[async_trait]
impl Device for DeviceClient {
    async fn folder_exists(&self, id: Uuid) -> Result<bool, ClientError> {
        self.exists_as(id, DocumentType::Folder).await
    }

    async fn file_exists(&self, id: Uuid) -> Result<bool, ClientError> {
        self.exists_as(id, DocumentType::Document).await
    }

    async fn entry_exists(&self, id: Uuid) -> Result<bool, ClientError> {
        let _permit = self.acquire()?;
        Ok(self.live_metadata(id).await?.is_some())
    }

    async fn has_children(&self, id: Uuid) -> Result<bool, ClientError> {
        let _permit = self.acquire()?;
        let entries = self.session.list_metadata_files(&self.base_path).await?;
        for entry in entries {
            let Some(bytes) = self.session.read_file(&entry.path).await? else {
                continue;
            };
            match serde_json::from_slice::<Metadata>(&bytes) {
                Ok(metadata) if metadata.parent == Some(id) && !metadata.deleted => {
                    return Ok(true);
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(path = %entry.path, error = %err, "ignoring unreadable metadata");
                }
            }
        }
        Ok(false)
    }

    async fn create_folder(
        &self,
        id: Uuid,
        name: &str,
        parent: Option<Uuid>,
    ) -> Result<(), ClientError> {
        let _permit = self.acquire()?;
        self.ensure_absent(id).await?;
        let metadata = Metadata::folder(name, parent, (self.clock)()).to_vec()?;
        self.session
            .overwrite_file(&self.entry_path(id, CONTENT_SUFFIX), b"{}")
            .await?;
        self.session
            .write_new_file(&self.entry_path(id, METADATA_SUFFIX), &metadata)
            .await?;
        info!(%id, name, "created folder on device");
        Ok(())
    }

    async fn upload_file(
        &self,
        id: Uuid,
        parent: Option<Uuid>,
        name: &str,
        content_path: &Path,
        thumbnail_path: Option<&Path>,
    ) -> Result<(), ClientError> {
        let _permit = self.acquire()?;
        let document = read_local(content_path).await?;
        let thumbnail = match thumbnail_path {
            Some(path) => read_optional_local(path).await?,
            None => None,
        };
        let content = Content::pdf_document().to_vec()?;
        let metadata = Metadata::document(name, parent, (self.clock)()).to_vec()?;
        self.ensure_absent(id).await?;

        self.session
            .overwrite_file(&self.entry_path(id, CONTENT_SUFFIX), &content)
            .await?;
        self.session
            .overwrite_file(&self.entry_path(id, ".pdf"), &document)
            .await?;
        if let Some(thumbnail) = thumbnail {
            let dir = self.entry_path(id, ".thumbnails");
            self.session.create_dir(&dir).await?;
            self.session
                .overwrite_file(&format!("{dir}/0.png"), &thumbnail)
                .await?;
        }
        // Written last: a device listing only shows the document once this exists.
        self.session
            .write_new_file(&self.entry_path(id, METADATA_SUFFIX), &metadata)
            .await?;
        info!(%id, name, bytes = document.len(), "uploaded document to device");
        Ok(())
    }

    async fn rename(&self, id: Uuid, new_name: &str) -> Result<(), ClientError> {
        self.rewrite_metadata(id, |metadata, now| metadata.renamed(new_name, now))
            .await?;
        info!(%id, new_name, "renamed entry on device");
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<(), ClientError> {
        self.rewrite_metadata(id, |metadata, now| metadata.marked_deleted(now))
            .await?;
        info!(%id, "deleted entry on device");
        Ok(())
    }
}
