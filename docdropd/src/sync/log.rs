use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteRow};
use sqlx::{Row, SqlitePool, migrate::Migrator};
use thiserror::Error;
use uuid::Uuid;

use super::command::{Command, CommandKind, CommandOutcome, SyncOutcome, SyncResult};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const COMMAND_COLUMNS: &str =
    "entity_id, command_number, kind, name, parent_id, created_at, synced_at, result, message";

#[derive(Debug, Error)]
pub enum LogError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid command kind: {0}")]
    InvalidCommandKind(String),
    #[error("invalid sync result: {0}")]
    InvalidResult(String),
    #[error("invalid entity id: {0}")]
    InvalidId(String),
    #[error("{kind} command is missing {field}")]
    MissingField { kind: String, field: &'static str },
    #[error("command {entity_id}#{command_number} is already synced")]
    AlreadySynced { entity_id: Uuid, command_number: i64 },
    #[error("command {entity_id}#{command_number} does not exist")]
    MissingCommand { entity_id: Uuid, command_number: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
    pub last_run_at: i64,
    pub processed: i64,
    pub last_result: Option<SyncResult>,
    pub last_error: Option<String>,
}

/// Durable, globally ordered log of device commands and their outcomes.
#[derive(Clone)]
pub struct CommandLog {
    pool: SqlitePool,
}

impl CommandLog {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn new(database_url: &str) -> Result<Self, LogError> {
        let pool = SqlitePool::connect(database_url).await?;
        let log = Self { pool };
        log.init().await?;
        Ok(log)
    }

    pub async fn open(db_path: &Path) -> Result<Self, LogError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let log = Self { pool };
        log.init().await?;
        Ok(log)
    }

    pub async fn init(&self) -> Result<(), LogError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// `MAX(command_number) + 1` over the whole log, `0` when it is empty.
    pub async fn next_command_number(conn: &mut SqliteConnection) -> Result<i64, LogError> {
        let next: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(command_number) + 1, 0) FROM commands")
                .fetch_one(&mut *conn)
                .await?;
        Ok(next)
    }

    /// Numbers and stores a command on the caller's connection.
    ///
    /// Run it inside the transaction that carries the matching entity change so both
    /// commit or roll back together.
    pub async fn enqueue(
        conn: &mut SqliteConnection,
        entity_id: Uuid,
        kind: CommandKind,
        created_at: i64,
    ) -> Result<Command, LogError> {
        let number = Self::next_command_number(&mut *conn).await?;
        let command = Command::new(entity_id, number, kind, created_at);
        insert_command(conn, &command).await?;
        Ok(command)
    }

    /// Enqueues a command in a transaction of its own.
    pub async fn append(&self, entity_id: Uuid, kind: CommandKind) -> Result<Command, LogError> {
        let mut tx = self.pool.begin().await?;
        let command = Self::enqueue(&mut tx, entity_id, kind, super::now_millis()).await?;
        tx.commit().await?;
        Ok(command)
    }

    /// Stores a command with a number chosen by the caller.
    pub async fn insert(&self, command: &Command) -> Result<(), LogError> {
        let mut conn = self.pool.acquire().await?;
        insert_command(&mut conn, command).await
    }

    pub async fn fetch_unsynced_ordered(&self, page_size: u32) -> Result<Vec<Command>, LogError> {
        let rows = sqlx::query(&format!(
            "SELECT {COMMAND_COLUMNS} FROM commands
             WHERE synced_at IS NULL
             ORDER BY command_number ASC
             LIMIT ?1"
        ))
        .bind(i64::from(page_size))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(command_from_row).collect()
    }

    /// Writes the outcome once; a second write for the same command is refused.
    pub async fn mark_synced(
        &self,
        entity_id: Uuid,
        command_number: i64,
        outcome: &SyncOutcome,
        synced_at: i64,
    ) -> Result<(), LogError> {
        let updated = sqlx::query(
            "UPDATE commands SET result = ?1, message = ?2, synced_at = ?3
             WHERE entity_id = ?4 AND command_number = ?5 AND synced_at IS NULL",
        )
        .bind(outcome.result.as_str())
        .bind(&outcome.message)
        .bind(synced_at)
        .bind(entity_id.to_string())
        .bind(command_number)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated > 0 {
            return Ok(());
        }
        match self.get_command(entity_id, command_number).await? {
            Some(_) => Err(LogError::AlreadySynced {
                entity_id,
                command_number,
            }),
            None => Err(LogError::MissingCommand {
                entity_id,
                command_number,
            }),
        }
    }

    pub async fn get_command(
        &self,
        entity_id: Uuid,
        command_number: i64,
    ) -> Result<Option<Command>, LogError> {
        let row = sqlx::query(&format!(
            "SELECT {COMMAND_COLUMNS} FROM commands WHERE entity_id = ?1 AND command_number = ?2"
        ))
        .bind(entity_id.to_string())
        .bind(command_number)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(command_from_row).transpose()
    }

    pub async fn list_commands(&self) -> Result<Vec<Command>, LogError> {
        let rows = sqlx::query(&format!(
            "SELECT {COMMAND_COLUMNS} FROM commands ORDER BY command_number ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(command_from_row).collect()
    }

    pub async fn count_unsynced(&self) -> Result<i64, LogError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM commands WHERE synced_at IS NULL")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn record_run(
        &self,
        at: i64,
        processed: i64,
        last_result: Option<SyncResult>,
        last_error: Option<&str>,
    ) -> Result<(), LogError> {
        sqlx::query(
            "INSERT INTO sync_status (id, last_run_at, processed, last_result, last_error)
             VALUES (1, ?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                last_run_at = excluded.last_run_at,
                processed = excluded.processed,
                last_result = excluded.last_result,
                last_error = excluded.last_error",
        )
        .bind(at)
        .bind(processed)
        .bind(last_result.map(|result| result.as_str()))
        .bind(last_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn sync_status(&self) -> Result<Option<SyncStatus>, LogError> {
        let row = sqlx::query(
            "SELECT last_run_at, processed, last_result, last_error FROM sync_status WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let last_result: Option<String> = row.try_get("last_result")?;
        Ok(Some(SyncStatus {
            last_run_at: row.try_get("last_run_at")?,
            processed: row.try_get("processed")?,
            last_result: last_result.as_deref().map(SyncResult::parse).transpose()?,
            last_error: row.try_get("last_error")?,
        }))
    }
}

async fn insert_command(conn: &mut SqliteConnection, command: &Command) -> Result<(), LogError> {
    let outcome = command.outcome.as_ref();
    sqlx::query(
        "INSERT INTO commands (entity_id, command_number, kind, name, parent_id, created_at, synced_at, result, message)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
    )
    .bind(command.entity_id.to_string())
    .bind(command.command_number)
    .bind(command.kind.as_str())
    .bind(command.kind.name())
    .bind(command.kind.parent_id().map(|id| id.to_string()))
    .bind(command.created_at)
    .bind(outcome.map(|outcome| outcome.synced_at))
    .bind(outcome.map(|outcome| outcome.result.as_str()))
    .bind(outcome.and_then(|outcome| outcome.message.as_deref()))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub(crate) fn parse_id(value: &str) -> Result<Uuid, LogError> {
    Uuid::parse_str(value).map_err(|_| LogError::InvalidId(value.to_string()))
}

fn command_from_row(row: &SqliteRow) -> Result<Command, LogError> {
    let entity_id: String = row.try_get("entity_id")?;
    let kind: String = row.try_get("kind")?;
    let parent_id: Option<String> = row.try_get("parent_id")?;
    let parent_id = parent_id.as_deref().map(parse_id).transpose()?;
    let synced_at: Option<i64> = row.try_get("synced_at")?;
    let result: Option<String> = row.try_get("result")?;
    let outcome = match (synced_at, result) {
        (Some(synced_at), Some(result)) => Some(CommandOutcome {
            result: SyncResult::parse(&result)?,
            message: row.try_get("message")?,
            synced_at,
        }),
        _ => None,
    };
    Ok(Command {
        entity_id: parse_id(&entity_id)?,
        command_number: row.try_get("command_number")?,
        kind: CommandKind::from_columns(&kind, row.try_get("name")?, parent_id)?,
        created_at: row.try_get("created_at")?,
        outcome,
    })
}

#[cfg(test)]
#[path = "log_tests.rs"]
mod tests;
