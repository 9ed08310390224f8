use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use docdrop_core::{DEFAULT_HOST, DEFAULT_PORT, DeviceClient, SessionConfig, SftpSession};
use tracing::{debug, error, info, warn};

use crate::device_tree::{DeviceTree, RefreshOutcome};
use crate::files::{FileService, FileStorage};
use crate::sync::backoff::Backoff;
use crate::sync::handler::CommandHandler;
use crate::sync::log::CommandLog;
use crate::sync::worker::{DEFAULT_PAGE_SIZE, RunReport, SyncWorker};

const DEFAULT_USER: &str = "root";
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 200;
const DEFAULT_IO_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_SYNC_INTERVAL_SECS: u64 = 30;
const DEFAULT_TREE_REFRESH_SECS: u64 = 300;
const RETRY_BASE: Duration = Duration::from_secs(5);
const RETRY_MAX: Duration = Duration::from_secs(300);

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub device: SessionConfig,
    pub storage_dir: PathBuf,
    pub database_path: PathBuf,
    pub sync_interval: Duration,
    pub tree_refresh_interval: Duration,
    pub page_size: u32,
    pub enable_tree_refresh: bool,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        Self::from_vars(|name| std::env::var(name).ok(), &home, &default_data_root(&home))
    }

    fn from_vars<F>(var: F, home: &Path, data_root: &Path) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let port = read_u64_var(&var, "DOCDROP_DEVICE_PORT", u64::from(DEFAULT_PORT));
        let port = u16::try_from(port).context("DOCDROP_DEVICE_PORT is out of range")?;
        let known_hosts = match var("DOCDROP_KNOWN_HOSTS") {
            Some(value) if !value.trim().is_empty() => Some(expand_with_home(&value, home)),
            _ => Some(home.join(".ssh/known_hosts")).filter(|path| path.is_file()),
        };
        let device = SessionConfig {
            host: var("DOCDROP_DEVICE_HOST").unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port,
            username: var("DOCDROP_DEVICE_USER").unwrap_or_else(|| DEFAULT_USER.to_string()),
            password: var("DOCDROP_DEVICE_PASSWORD").unwrap_or_default(),
            known_hosts,
            connect_timeout: Duration::from_millis(read_u64_var(
                &var,
                "DOCDROP_CONNECT_TIMEOUT_MS",
                DEFAULT_CONNECT_TIMEOUT_MS,
            )),
            io_timeout: Duration::from_millis(read_u64_var(
                &var,
                "DOCDROP_IO_TIMEOUT_MS",
                DEFAULT_IO_TIMEOUT_MS,
            )),
        };
        let storage_dir = var("DOCDROP_STORAGE_DIR")
            .map(|value| expand_with_home(&value, home))
            .unwrap_or_else(|| data_root.join("files"));
        let database_path = var("DOCDROP_DATABASE")
            .map(|value| expand_with_home(&value, home))
            .unwrap_or_else(|| data_root.join("docdrop.db"));
        let page_size = u32::try_from(read_u64_var(
            &var,
            "DOCDROP_SYNC_PAGE_SIZE",
            u64::from(DEFAULT_PAGE_SIZE),
        ))
        .unwrap_or(DEFAULT_PAGE_SIZE);

        Ok(Self {
            device,
            storage_dir,
            database_path,
            sync_interval: Duration::from_secs(read_u64_var(
                &var,
                "DOCDROP_SYNC_INTERVAL_SECS",
                DEFAULT_SYNC_INTERVAL_SECS,
            )),
            tree_refresh_interval: Duration::from_secs(read_u64_var(
                &var,
                "DOCDROP_TREE_REFRESH_SECS",
                DEFAULT_TREE_REFRESH_SECS,
            )),
            page_size,
            enable_tree_refresh: read_bool_var(&var, "DOCDROP_ENABLE_TREE_REFRESH", true),
        })
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    client: DeviceClient,
    worker: SyncWorker,
    tree: DeviceTree,
    files: FileService,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.storage_dir)
            .await
            .with_context(|| format!("failed to create storage dir at {:?}", config.storage_dir))?;
        let log = CommandLog::open(&config.database_path)
            .await
            .with_context(|| format!("failed to open command log at {:?}", config.database_path))?;

        let client = DeviceClient::new(Arc::new(SftpSession::new(config.device.clone())));
        let storage = FileStorage::new(&config.storage_dir);
        let handler = CommandHandler::new(Arc::new(client.clone()), storage.clone());
        let worker = SyncWorker::new(log.clone(), handler).with_page_size(config.page_size);
        let tree = DeviceTree::new(&log);
        let files = FileService::new(&log, storage);

        Ok(Self {
            config,
            client,
            worker,
            tree,
            files,
        })
    }

    pub fn files(&self) -> &FileService {
        &self.files
    }

    pub fn tree(&self) -> &DeviceTree {
        &self.tree
    }

    pub fn log(&self) -> &CommandLog {
        self.worker.log()
    }

    /// One drain of the command log followed, when enabled, by a tree refresh.
    pub async fn sync_once(&self) -> anyhow::Result<RunReport> {
        let report = self.worker.run().await.context("sync run failed")?;
        if report.is_complete() && self.config.enable_tree_refresh {
            match self.tree.refresh(&self.client).await {
                Ok(outcome) => debug!(?outcome, "device tree refresh"),
                Err(err) => warn!(error = %err, "device tree refresh failed"),
            }
        }
        Ok(report)
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(
            host = %self.config.device.host,
            database = %self.config.database_path.display(),
            tree_refresh = self.config.enable_tree_refresh,
            "docdropd started"
        );

        let worker = Arc::new(self.worker);
        let sync_interval = self.config.sync_interval;
        let sync_handle = tokio::spawn(async move {
            let mut backoff = Backoff::new(RETRY_BASE, RETRY_MAX, true);
            loop {
                let delay = match worker.run().await {
                    Ok(report) => next_sync_delay(&report, &mut backoff, sync_interval),
                    Err(err) => {
                        error!(error = %err, "sync worker error");
                        sync_interval
                    }
                };
                tokio::time::sleep(delay).await;
            }
        });

        let tree_handle = self.config.enable_tree_refresh.then(|| {
            let tree = self.tree.clone();
            let client = self.client.clone();
            let interval = self.config.tree_refresh_interval;
            tokio::spawn(async move {
                loop {
                    match tree.refresh(&client).await {
                        Ok(RefreshOutcome::Busy) => debug!("device busy, tree refresh skipped"),
                        Ok(RefreshOutcome::Refreshed { .. }) => {}
                        Err(err) => warn!(error = %err, "device tree refresh failed"),
                    }
                    tokio::time::sleep(interval).await;
                }
            })
        });

        tokio::signal::ctrl_c()
            .await
            .context("failed waiting for shutdown signal")?;
        info!("shutting down");
        sync_handle.abort();
        if let Some(handle) = tree_handle {
            handle.abort();
        }
        Ok(())
    }
}

fn next_sync_delay(report: &RunReport, backoff: &mut Backoff, interval: Duration) -> Duration {
    if report.is_complete() {
        backoff.reset();
        return interval;
    }
    let delay = backoff.next_delay();
    info!(
        failures = backoff.failures(),
        retry_in_ms = delay.as_millis() as u64,
        "device unavailable, retrying later"
    );
    delay
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn default_data_root(home: &Path) -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| home.join(".local/share"))
        .join("docdrop")
}

fn read_u64_var<F>(var: &F, name: &str, default: u64) -> u64
where
    F: Fn(&str) -> Option<String>,
{
    var(name)
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_bool_var<F>(var: &F, name: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    var(name)
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
