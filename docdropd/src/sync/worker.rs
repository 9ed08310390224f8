use thiserror::Error;
use tracing::{debug, info, warn};

use super::command::SyncResult;
use super::handler::{CommandHandler, SyncAbort};
use super::log::{CommandLog, LogError};
use super::now_millis;

pub const DEFAULT_PAGE_SIZE: u32 = 10;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to persist sync progress: {0}")]
    Log(#[from] LogError),
}

#[derive(Debug)]
pub struct RunReport {
    pub processed: usize,
    /// Set when the device became unreachable before the log was drained.
    pub aborted: Option<SyncAbort>,
}

impl RunReport {
    pub fn is_complete(&self) -> bool {
        self.aborted.is_none()
    }
}

/// Drains the command log against the device, one command at a time.
///
/// Runs must not overlap; the daemon drives a single loop.
pub struct SyncWorker {
    log: CommandLog,
    handler: CommandHandler,
    page_size: u32,
}

impl SyncWorker {
    pub fn new(log: CommandLog, handler: CommandHandler) -> Self {
        Self {
            log,
            handler,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn log(&self) -> &CommandLog {
        &self.log
    }

    pub async fn run(&self) -> Result<RunReport, WorkerError> {
        let mut processed = 0;
        let mut last_result = None;
        let mut aborted = None;

        'drain: loop {
            let page = self.log.fetch_unsynced_ordered(self.page_size).await?;
            if page.is_empty() {
                break;
            }
            for command in page {
                match self.handler.handle(&command).await {
                    Ok(outcome) => {
                        self.log
                            .mark_synced(
                                command.entity_id,
                                command.command_number,
                                &outcome,
                                now_millis(),
                            )
                            .await?;
                        debug!(
                            id = %command.entity_id,
                            number = command.command_number,
                            kind = command.kind.as_str(),
                            result = %outcome.result,
                            "command synced"
                        );
                        if outcome.result != SyncResult::Success {
                            warn!(
                                id = %command.entity_id,
                                number = command.command_number,
                                result = %outcome.result,
                                message = outcome.message.as_deref().unwrap_or_default(),
                                "command was not applied"
                            );
                        }
                        last_result = Some(outcome.result);
                        processed += 1;
                    }
                    Err(abort) => {
                        warn!(
                            number = command.command_number,
                            error = %abort,
                            "sync run aborted"
                        );
                        aborted = Some(abort);
                        break 'drain;
                    }
                }
            }
        }

        let last_error = aborted.as_ref().map(ToString::to_string);
        if let Some(abort) = &aborted {
            last_result = Some(abort.result());
        }
        self.log
            .record_run(
                now_millis(),
                processed as i64,
                last_result,
                last_error.as_deref(),
            )
            .await?;
        if processed > 0 {
            info!(processed, complete = aborted.is_none(), "sync run finished");
        }
        Ok(RunReport { processed, aborted })
    }
}

#[cfg(test)]
#[path = "worker_tests.rs"]
mod tests;
