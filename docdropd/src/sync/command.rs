use std::fmt;

use uuid::Uuid;

use super::log::LogError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    CreateFolder {
        name: String,
        parent_id: Option<Uuid>,
    },
    UploadFile {
        name: String,
        parent_id: Option<Uuid>,
    },
    Rename {
        new_name: String,
    },
    Delete,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::CreateFolder { .. } => "create_folder",
            CommandKind::UploadFile { .. } => "upload_file",
            CommandKind::Rename { .. } => "rename",
            CommandKind::Delete => "delete",
        }
    }

    pub(crate) fn name(&self) -> Option<&str> {
        match self {
            CommandKind::CreateFolder { name, .. } | CommandKind::UploadFile { name, .. } => {
                Some(name)
            }
            CommandKind::Rename { new_name } => Some(new_name),
            CommandKind::Delete => None,
        }
    }

    pub(crate) fn parent_id(&self) -> Option<Uuid> {
        match self {
            CommandKind::CreateFolder { parent_id, .. }
            | CommandKind::UploadFile { parent_id, .. } => *parent_id,
            CommandKind::Rename { .. } | CommandKind::Delete => None,
        }
    }

    /// Rebuilds a variant from its stored columns.
    pub(crate) fn from_columns(
        kind: &str,
        name: Option<String>,
        parent_id: Option<Uuid>,
    ) -> Result<Self, LogError> {
        let require_name = |name: Option<String>| {
            name.ok_or_else(|| LogError::MissingField {
                kind: kind.to_string(),
                field: "name",
            })
        };
        match kind {
            "create_folder" => Ok(CommandKind::CreateFolder {
                name: require_name(name)?,
                parent_id,
            }),
            "upload_file" => Ok(CommandKind::UploadFile {
                name: require_name(name)?,
                parent_id,
            }),
            "rename" => Ok(CommandKind::Rename {
                new_name: require_name(name)?,
            }),
            "delete" => Ok(CommandKind::Delete),
            other => Err(LogError::InvalidCommandKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncResult {
    Success,
    PreConditionFailed,
    ExecutionFailed,
    /// Only ever recorded in the sync status, never on a command.
    ConnectionFailed,
}

impl SyncResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncResult::Success => "SUCCESS",
            SyncResult::PreConditionFailed => "PRE_CONDITION_FAILED",
            SyncResult::ExecutionFailed => "EXECUTION_FAILED",
            SyncResult::ConnectionFailed => "CONNECTION_FAILED",
        }
    }

    pub fn parse(value: &str) -> Result<Self, LogError> {
        match value {
            "SUCCESS" => Ok(SyncResult::Success),
            "PRE_CONDITION_FAILED" => Ok(SyncResult::PreConditionFailed),
            "EXECUTION_FAILED" => Ok(SyncResult::ExecutionFailed),
            "CONNECTION_FAILED" => Ok(SyncResult::ConnectionFailed),
            other => Err(LogError::InvalidResult(other.to_string())),
        }
    }
}

impl fmt::Display for SyncResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal result of applying one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    pub result: SyncResult,
    pub message: Option<String>,
}

impl SyncOutcome {
    pub fn success() -> Self {
        Self {
            result: SyncResult::Success,
            message: None,
        }
    }

    pub fn precondition_failed(message: impl Into<String>) -> Self {
        Self {
            result: SyncResult::PreConditionFailed,
            message: Some(message.into()),
        }
    }

    pub fn execution_failed(message: impl Into<String>) -> Self {
        Self {
            result: SyncResult::ExecutionFailed,
            message: Some(message.into()),
        }
    }
}

/// Outcome persisted on a command once the worker has applied it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub result: SyncResult,
    pub message: Option<String>,
    pub synced_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub entity_id: Uuid,
    pub command_number: i64,
    pub kind: CommandKind,
    pub created_at: i64,
    pub outcome: Option<CommandOutcome>,
}

impl Command {
    pub fn new(entity_id: Uuid, command_number: i64, kind: CommandKind, created_at: i64) -> Self {
        Self {
            entity_id,
            command_number,
            kind,
            created_at,
            outcome: None,
        }
    }

    pub fn is_synced(&self) -> bool {
        self.outcome.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_rebuild_from_columns() {
        let parent = Uuid::new_v4();
        let kind = CommandKind::CreateFolder {
            name: "Inbox".into(),
            parent_id: Some(parent),
        };
        let rebuilt = CommandKind::from_columns(
            kind.as_str(),
            kind.name().map(str::to_string),
            kind.parent_id(),
        )
        .unwrap();
        assert_eq!(rebuilt, kind);

        assert_eq!(
            CommandKind::from_columns("delete", None, None).unwrap(),
            CommandKind::Delete
        );
    }

    #[test]
    fn missing_name_is_rejected() {
        assert!(matches!(
            CommandKind::from_columns("rename", None, None),
            Err(LogError::MissingField { field: "name", .. })
        ));
        assert!(matches!(
            CommandKind::from_columns("move", None, None),
            Err(LogError::InvalidCommandKind(kind)) if kind == "move"
        ));
    }

    #[test]
    fn results_use_upper_snake_case() {
        for result in [
            SyncResult::Success,
            SyncResult::PreConditionFailed,
            SyncResult::ExecutionFailed,
            SyncResult::ConnectionFailed,
        ] {
            assert_eq!(SyncResult::parse(result.as_str()).unwrap(), result);
        }
        assert_eq!(SyncResult::PreConditionFailed.to_string(), "PRE_CONDITION_FAILED");
        assert!(SyncResult::parse("success").is_err());
    }
}
