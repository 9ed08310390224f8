use docdrop_core::{ConnectionError, DeviceClient, DocumentType, Metadata, TreeReadStatus, to_millis};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};
use uuid::Uuid;

use crate::sync::log::{CommandLog, LogError, parse_id};
use crate::sync::now_millis;

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Log(#[from] LogError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("device tree read ended without reporting completion")]
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Another device operation holds the client.
    Busy,
    Refreshed { entries: usize, skipped: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedDocument {
    pub id: Uuid,
    pub parent_id: Option<Uuid>,
    pub is_folder: bool,
    pub name: String,
    pub deleted: bool,
    pub version: i32,
    pub last_modified: i64,
    pub refreshed_at: i64,
}

impl CachedDocument {
    fn from_metadata(id: Uuid, metadata: &Metadata, refreshed_at: i64) -> Self {
        Self {
            id,
            parent_id: metadata.parent,
            is_folder: metadata.kind == DocumentType::Folder,
            name: metadata.visible_name.clone(),
            deleted: metadata.deleted,
            version: metadata.version,
            last_modified: to_millis(metadata.last_modified),
            refreshed_at,
        }
    }
}

/// Last known listing of the device, replaced wholesale on every refresh.
#[derive(Clone)]
pub struct DeviceTree {
    pool: SqlitePool,
}

impl DeviceTree {
    pub fn new(log: &CommandLog) -> Self {
        Self {
            pool: log.pool().clone(),
        }
    }

    pub async fn refresh(&self, client: &DeviceClient) -> Result<RefreshOutcome, TreeError> {
        let (entry_tx, mut entry_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();
        let status = client.read_file_tree(
            move |id, raw| {
                let _ = entry_tx.send((id, raw));
            },
            move |error| {
                let _ = done_tx.send(error);
            },
        );
        if status == TreeReadStatus::Busy {
            return Ok(RefreshOutcome::Busy);
        }

        let refreshed_at = now_millis();
        let mut documents = Vec::new();
        let mut skipped = 0;
        // Closes once the read task drops its entry callback.
        while let Some((id, raw)) = entry_rx.recv().await {
            match Metadata::from_slice(id, raw.as_bytes()) {
                Ok(metadata) => {
                    documents.push(CachedDocument::from_metadata(id, &metadata, refreshed_at));
                }
                Err(err) => {
                    warn!(%id, error = %err, "skipping unreadable device entry");
                    skipped += 1;
                }
            }
        }
        if let Some(err) = done_rx.await.map_err(|_| TreeError::Interrupted)? {
            return Err(err.into());
        }

        self.replace_all(&documents).await?;
        info!(entries = documents.len(), skipped, "device tree refreshed");
        Ok(RefreshOutcome::Refreshed {
            entries: documents.len(),
            skipped,
        })
    }

    pub async fn list(&self, parent_id: Option<Uuid>) -> Result<Vec<CachedDocument>, TreeError> {
        let rows = sqlx::query(
            "SELECT id, parent_id, is_folder, name, deleted, version, last_modified, refreshed_at
             FROM cached_documents
             WHERE parent_id IS ?1 AND deleted = 0
             ORDER BY is_folder DESC, name ASC",
        )
        .bind(parent_id.map(|id| id.to_string()))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(document_from_row).collect()
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<CachedDocument>, TreeError> {
        let row = sqlx::query(
            "SELECT id, parent_id, is_folder, name, deleted, version, last_modified, refreshed_at
             FROM cached_documents WHERE id = ?1",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(document_from_row).transpose()
    }

    async fn replace_all(&self, documents: &[CachedDocument]) -> Result<(), TreeError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM cached_documents")
            .execute(&mut *tx)
            .await?;
        for document in documents {
            sqlx::query(
                "INSERT INTO cached_documents
                    (id, parent_id, is_folder, name, deleted, version, last_modified, refreshed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )
            .bind(document.id.to_string())
            .bind(document.parent_id.map(|id| id.to_string()))
            .bind(document.is_folder)
            .bind(&document.name)
            .bind(document.deleted)
            .bind(document.version)
            .bind(document.last_modified)
            .bind(document.refreshed_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

fn document_from_row(row: &SqliteRow) -> Result<CachedDocument, TreeError> {
    let id: String = row.try_get("id")?;
    let parent_id: Option<String> = row.try_get("parent_id")?;
    Ok(CachedDocument {
        id: parse_id(&id)?,
        parent_id: parent_id.as_deref().map(parse_id).transpose()?,
        is_folder: row.try_get("is_folder")?,
        name: row.try_get("name")?,
        deleted: row.try_get("deleted")?,
        version: row.try_get("version")?,
        last_modified: row.try_get("last_modified")?,
        refreshed_at: row.try_get("refreshed_at")?,
    })
}
