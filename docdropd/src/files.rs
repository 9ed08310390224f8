use std::path::{Path, PathBuf};

use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::sync::command::{Command, CommandKind};
use crate::sync::log::{CommandLog, LogError, parse_id};
use crate::sync::now_millis;

#[derive(Debug, Error)]
pub enum FileServiceError {
    #[error(transparent)]
    Log(#[from] LogError),
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("parent folder {0} does not exist")]
    MissingParent(Uuid),
    #[error("entry {0} does not exist")]
    NotFound(Uuid),
    #[error("folder {0} is not empty")]
    FolderNotEmpty(Uuid),
    #[error("name must not be empty")]
    EmptyName,
    #[error("cannot derive a document name from {0:?}")]
    UnnamedFile(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub id: Uuid,
    pub parent_id: Option<Uuid>,
    pub is_folder: bool,
    pub name: String,
    pub created_at: i64,
}

/// Local copies of uploaded documents, kept until the device has them.
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn document_path(&self, id: Uuid) -> PathBuf {
        self.root.join(format!("{id}.pdf"))
    }

    pub fn thumbnail_path(&self, id: Uuid) -> PathBuf {
        self.root.join(format!("{id}.png"))
    }

    pub async fn store(
        &self,
        id: Uuid,
        document: &[u8],
        thumbnail: Option<&[u8]>,
    ) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::write(self.document_path(id), document).await?;
        if let Some(thumbnail) = thumbnail {
            tokio::fs::write(self.thumbnail_path(id), thumbnail).await?;
        }
        Ok(())
    }

    pub async fn discard(&self, id: Uuid) {
        for path in [self.document_path(id), self.thumbnail_path(id)] {
            if let Err(err) = tokio::fs::remove_file(&path).await
                && err.kind() != std::io::ErrorKind::NotFound
            {
                debug!(path = %path.display(), error = %err, "failed to discard stored file");
            }
        }
    }
}

/// Local folder and document mutations.
///
/// Each mutation writes the entity row and its command in one transaction.
#[derive(Clone)]
pub struct FileService {
    pool: SqlitePool,
    storage: FileStorage,
}

impl FileService {
    pub fn new(log: &CommandLog, storage: FileStorage) -> Self {
        Self {
            pool: log.pool().clone(),
            storage,
        }
    }

    pub fn storage(&self) -> &FileStorage {
        &self.storage
    }

    pub async fn create_folder(
        &self,
        name: &str,
        parent_id: Option<Uuid>,
    ) -> Result<(FileInfo, Command), FileServiceError> {
        let info = new_entry(name, parent_id, true)?;
        let kind = CommandKind::CreateFolder {
            name: info.name.clone(),
            parent_id,
        };
        let command = self.record_new_entry(&info, kind).await?;
        info!(id = %info.id, name = %info.name, "folder created");
        Ok((info, command))
    }

    pub async fn upload_file(
        &self,
        name: &str,
        parent_id: Option<Uuid>,
        document: &[u8],
        thumbnail: Option<&[u8]>,
    ) -> Result<(FileInfo, Command), FileServiceError> {
        let info = new_entry(name, parent_id, false)?;
        let kind = CommandKind::UploadFile {
            name: info.name.clone(),
            parent_id,
        };
        self.storage.store(info.id, document, thumbnail).await?;
        match self.record_new_entry(&info, kind).await {
            Ok(command) => {
                info!(id = %info.id, name = %info.name, bytes = document.len(), "document stored");
                Ok((info, command))
            }
            Err(err) => {
                self.storage.discard(info.id).await;
                Err(err)
            }
        }
    }

    /// Uploads a local file, named after its file stem.
    pub async fn import_file(
        &self,
        path: &Path,
        parent_id: Option<Uuid>,
    ) -> Result<(FileInfo, Command), FileServiceError> {
        let name = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .ok_or_else(|| FileServiceError::UnnamedFile(path.to_path_buf()))?
            .to_string();
        let document = tokio::fs::read(path).await?;
        self.upload_file(&name, parent_id, &document, None).await
    }

    pub async fn rename(&self, id: Uuid, new_name: &str) -> Result<Command, FileServiceError> {
        let new_name = validated_name(new_name)?;
        let mut tx = self.pool.begin().await?;
        fetch_info(&mut tx, id)
            .await?
            .ok_or(FileServiceError::NotFound(id))?;
        sqlx::query("UPDATE file_info SET name = ?1 WHERE id = ?2")
            .bind(&new_name)
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        let command =
            CommandLog::enqueue(&mut tx, id, CommandKind::Rename { new_name }, now_millis())
                .await?;
        tx.commit().await?;
        info!(%id, "entry renamed");
        Ok(command)
    }

    pub async fn remove(&self, id: Uuid) -> Result<Command, FileServiceError> {
        let mut tx = self.pool.begin().await?;
        let entry = fetch_info(&mut tx, id)
            .await?
            .ok_or(FileServiceError::NotFound(id))?;
        if entry.is_folder && has_children(&mut tx, id).await? {
            return Err(FileServiceError::FolderNotEmpty(id));
        }
        sqlx::query("DELETE FROM file_info WHERE id = ?1")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        let command = CommandLog::enqueue(&mut tx, id, CommandKind::Delete, now_millis()).await?;
        tx.commit().await?;
        info!(%id, "entry removed");
        Ok(command)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<FileInfo>, FileServiceError> {
        let mut conn = self.pool.acquire().await?;
        fetch_info(&mut conn, id).await
    }

    pub async fn list(&self, parent_id: Option<Uuid>) -> Result<Vec<FileInfo>, FileServiceError> {
        let rows = sqlx::query(
            "SELECT id, parent_id, is_folder, name, created_at FROM file_info
             WHERE parent_id IS ?1
             ORDER BY is_folder DESC, name ASC",
        )
        .bind(parent_id.map(|id| id.to_string()))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(info_from_row).collect()
    }

    async fn record_new_entry(
        &self,
        info: &FileInfo,
        kind: CommandKind,
    ) -> Result<Command, FileServiceError> {
        let mut tx = self.pool.begin().await?;
        if let Some(parent_id) = info.parent_id {
            ensure_folder(&mut tx, parent_id).await?;
        }
        sqlx::query(
            "INSERT INTO file_info (id, parent_id, is_folder, name, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(info.id.to_string())
        .bind(info.parent_id.map(|id| id.to_string()))
        .bind(info.is_folder)
        .bind(&info.name)
        .bind(info.created_at)
        .execute(&mut *tx)
        .await?;
        let command = CommandLog::enqueue(&mut tx, info.id, kind, info.created_at).await?;
        tx.commit().await?;
        Ok(command)
    }
}

fn validated_name(name: &str) -> Result<String, FileServiceError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(FileServiceError::EmptyName);
    }
    Ok(name.to_string())
}

fn new_entry(
    name: &str,
    parent_id: Option<Uuid>,
    is_folder: bool,
) -> Result<FileInfo, FileServiceError> {
    Ok(FileInfo {
        id: Uuid::new_v4(),
        parent_id,
        is_folder,
        name: validated_name(name)?,
        created_at: now_millis(),
    })
}

async fn ensure_folder(conn: &mut SqliteConnection, id: Uuid) -> Result<(), FileServiceError> {
    match fetch_info(conn, id).await? {
        Some(info) if info.is_folder => Ok(()),
        _ => Err(FileServiceError::MissingParent(id)),
    }
}

async fn has_children(conn: &mut SqliteConnection, id: Uuid) -> Result<bool, FileServiceError> {
    let row = sqlx::query("SELECT 1 FROM file_info WHERE parent_id = ?1 LIMIT 1")
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.is_some())
}

async fn fetch_info(
    conn: &mut SqliteConnection,
    id: Uuid,
) -> Result<Option<FileInfo>, FileServiceError> {
    let row = sqlx::query(
        "SELECT id, parent_id, is_folder, name, created_at FROM file_info WHERE id = ?1",
    )
    .bind(id.to_string())
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(info_from_row).transpose()
}

fn info_from_row(row: &SqliteRow) -> Result<FileInfo, FileServiceError> {
    let id: String = row.try_get("id")?;
    let parent_id: Option<String> = row.try_get("parent_id")?;
    Ok(FileInfo {
        id: parse_id(&id)?,
        parent_id: parent_id.as_deref().map(parse_id).transpose()?,
        is_folder: row.try_get("is_folder")?,
        name: row.try_get("name")?,
        created_at: row.try_get("created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::memory_pool;
    use tempfile::tempdir;

    async fn make_service(root: &Path) -> (FileService, CommandLog) {
        let log = CommandLog::from_pool(memory_pool().await);
        log.init().await.unwrap();
        (FileService::new(&log, FileStorage::new(root)), log)
    }

    async fn reject_commands(log: &CommandLog) {
        sqlx::query(
            "CREATE TRIGGER reject_commands BEFORE INSERT ON commands
             BEGIN SELECT RAISE(ABORT, 'command log unavailable'); END",
        )
        .execute(log.pool())
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn create_folder_enqueues_matching_command() {
        let dir = tempdir().unwrap();
        let (service, log) = make_service(dir.path()).await;

        let (root, first) = service.create_folder(" Inbox ", None).await.unwrap();
        let (child, second) = service
            .create_folder("Notes", Some(root.id))
            .await
            .unwrap();

        assert_eq!(root.name, "Inbox");
        assert_eq!(first.entity_id, root.id);
        assert_eq!(first.command_number, 0);
        assert_eq!(second.command_number, 1);
        assert_eq!(
            second.kind,
            CommandKind::CreateFolder {
                name: "Notes".into(),
                parent_id: Some(root.id),
            }
        );
        assert_eq!(service.list(Some(root.id)).await.unwrap(), vec![child]);
        assert_eq!(service.list(None).await.unwrap(), vec![root]);
        assert_eq!(log.count_unsynced().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn missing_or_non_folder_parent_is_rejected() {
        let dir = tempdir().unwrap();
        let (service, log) = make_service(dir.path()).await;
        let ghost = Uuid::new_v4();

        let err = service.create_folder("A", Some(ghost)).await.unwrap_err();
        assert!(matches!(err, FileServiceError::MissingParent(id) if id == ghost));

        let (document, _) = service
            .upload_file("Doc", None, b"%PDF", None)
            .await
            .unwrap();
        let err = service
            .create_folder("B", Some(document.id))
            .await
            .unwrap_err();
        assert!(matches!(err, FileServiceError::MissingParent(_)));
        assert_eq!(log.list_commands().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn upload_keeps_a_local_copy() {
        let dir = tempdir().unwrap();
        let (service, _log) = make_service(dir.path()).await;

        let (info, command) = service
            .upload_file("Report", None, b"%PDF-1.7", Some(b"png"))
            .await
            .unwrap();

        assert!(!info.is_folder);
        assert!(matches!(command.kind, CommandKind::UploadFile { .. }));
        let stored = tokio::fs::read(service.storage().document_path(info.id))
            .await
            .unwrap();
        assert_eq!(stored, b"%PDF-1.7");
        assert!(service.storage().thumbnail_path(info.id).exists());
    }

    #[tokio::test]
    async fn import_uses_the_file_stem() {
        let dir = tempdir().unwrap();
        let (service, _log) = make_service(&dir.path().join("store")).await;
        let source = dir.path().join("Quarterly Report.pdf");
        std::fs::write(&source, b"%PDF").unwrap();

        let (info, _) = service.import_file(&source, None).await.unwrap();
        assert_eq!(info.name, "Quarterly Report");
    }

    #[tokio::test]
    async fn failed_enqueue_rolls_back_the_entity() {
        let dir = tempdir().unwrap();
        let (service, log) = make_service(dir.path()).await;
        reject_commands(&log).await;

        let err = service.create_folder("Inbox", None).await.unwrap_err();
        assert!(matches!(err, FileServiceError::Log(LogError::Sqlx(_))));
        assert!(service.list(None).await.unwrap().is_empty());

        service
            .upload_file("Doc", None, b"%PDF", None)
            .await
            .unwrap_err();
        assert!(service.list(None).await.unwrap().is_empty());
        let mut leftovers = std::fs::read_dir(dir.path()).unwrap();
        assert!(leftovers.next().is_none());
    }

    #[tokio::test]
    async fn remove_requires_an_empty_folder() {
        let dir = tempdir().unwrap();
        let (service, _log) = make_service(dir.path()).await;
        let (folder, _) = service.create_folder("Inbox", None).await.unwrap();
        let (document, _) = service
            .upload_file("Doc", Some(folder.id), b"%PDF", None)
            .await
            .unwrap();

        let err = service.remove(folder.id).await.unwrap_err();
        assert!(matches!(err, FileServiceError::FolderNotEmpty(_)));

        let command = service.remove(document.id).await.unwrap();
        assert_eq!(command.kind, CommandKind::Delete);
        service.remove(folder.id).await.unwrap();
        assert_eq!(service.get(folder.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn rename_updates_row_and_enqueues() {
        let dir = tempdir().unwrap();
        let (service, _log) = make_service(dir.path()).await;
        let (folder, _) = service.create_folder("Old", None).await.unwrap();

        let command = service.rename(folder.id, "New").await.unwrap();
        assert_eq!(
            command.kind,
            CommandKind::Rename {
                new_name: "New".into()
            }
        );
        assert_eq!(service.get(folder.id).await.unwrap().unwrap().name, "New");

        assert!(matches!(
            service.rename(Uuid::new_v4(), "x").await,
            Err(FileServiceError::NotFound(_))
        ));
        assert!(matches!(
            service.rename(folder.id, "  ").await,
            Err(FileServiceError::EmptyName)
        ));
    }
}
