use std::collections::HashMap;
use std::net::TcpListener;

use super::*;
use crate::sync::command::SyncResult;
use crate::sync::handler::SyncAbort;
use tempfile::tempdir;

fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();
    move |name| map.get(name).cloned()
}

fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

#[test]
fn expands_tilde_to_home() {
    let home = PathBuf::from("/tmp/home-user");
    assert_eq!(
        expand_with_home("~/docdrop/files", &home),
        PathBuf::from("/tmp/home-user/docdrop/files")
    );
    assert_eq!(expand_with_home("~", &home), home);
    assert_eq!(expand_with_home("/srv/db", &home), PathBuf::from("/srv/db"));
}

#[test]
fn numeric_vars_fall_back_on_garbage_or_zero() {
    let var = vars(&[("A", "abc"), ("B", "0"), ("C", " 15 ")]);
    assert_eq!(read_u64_var(&var, "A", 42), 42);
    assert_eq!(read_u64_var(&var, "B", 42), 42);
    assert_eq!(read_u64_var(&var, "C", 42), 15);
    assert_eq!(read_u64_var(&var, "MISSING", 7), 7);
}

#[test]
fn tree_refresh_is_enabled_by_default() {
    let var = vars(&[("OFF", "no"), ("ON", "Yes")]);
    assert!(read_bool_var(&var, "MISSING", true));
    assert!(!read_bool_var(&var, "OFF", true));
    assert!(read_bool_var(&var, "ON", false));
}

#[test]
fn config_defaults_target_the_usb_network() {
    let home = tempdir().unwrap();
    let data_root = home.path().join("data");
    let config = DaemonConfig::from_vars(vars(&[]), home.path(), &data_root).unwrap();

    assert_eq!(config.device.host, "10.11.99.1");
    assert_eq!(config.device.port, 22);
    assert_eq!(config.device.username, "root");
    assert_eq!(config.device.password, "");
    assert_eq!(config.device.known_hosts, None);
    assert_eq!(config.device.connect_timeout, Duration::from_millis(200));
    assert_eq!(config.device.io_timeout, Duration::from_secs(10));
    assert_eq!(config.storage_dir, data_root.join("files"));
    assert_eq!(config.database_path, data_root.join("docdrop.db"));
    assert_eq!(config.sync_interval, Duration::from_secs(30));
    assert_eq!(config.tree_refresh_interval, Duration::from_secs(300));
    assert_eq!(config.page_size, 10);
    assert!(config.enable_tree_refresh);
}

#[test]
fn config_reads_overrides() {
    let home = tempdir().unwrap();
    std::fs::create_dir_all(home.path().join(".ssh")).unwrap();
    std::fs::write(home.path().join(".ssh/known_hosts"), "").unwrap();
    let config = DaemonConfig::from_vars(
        vars(&[
            ("DOCDROP_DEVICE_HOST", "192.168.1.20"),
            ("DOCDROP_DEVICE_PORT", "2222"),
            ("DOCDROP_DEVICE_PASSWORD", "secret"),
            ("DOCDROP_STORAGE_DIR", "~/blobs"),
            ("DOCDROP_SYNC_PAGE_SIZE", "25"),
            ("DOCDROP_ENABLE_TREE_REFRESH", "false"),
        ]),
        home.path(),
        &home.path().join("data"),
    )
    .unwrap();

    assert_eq!(config.device.host, "192.168.1.20");
    assert_eq!(config.device.port, 2222);
    assert_eq!(config.device.password, "secret");
    assert_eq!(
        config.device.known_hosts,
        Some(home.path().join(".ssh/known_hosts"))
    );
    assert_eq!(config.storage_dir, home.path().join("blobs"));
    assert_eq!(config.page_size, 25);
    assert!(!config.enable_tree_refresh);
}

#[test]
fn out_of_range_port_is_an_error() {
    let home = tempdir().unwrap();
    let result = DaemonConfig::from_vars(
        vars(&[("DOCDROP_DEVICE_PORT", "70000")]),
        home.path(),
        home.path(),
    );
    assert!(result.is_err());
}

#[test]
fn aborted_runs_back_off_and_complete_runs_reset() {
    let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60), false);
    let interval = Duration::from_secs(30);
    let aborted = RunReport {
        processed: 0,
        aborted: Some(SyncAbort::DeviceBusy),
    };
    let complete = RunReport {
        processed: 2,
        aborted: None,
    };

    assert_eq!(
        next_sync_delay(&aborted, &mut backoff, interval),
        Duration::from_secs(1)
    );
    assert_eq!(
        next_sync_delay(&aborted, &mut backoff, interval),
        Duration::from_secs(2)
    );
    assert_eq!(next_sync_delay(&complete, &mut backoff, interval), interval);
    assert_eq!(backoff.failures(), 0);
}

#[tokio::test]
async fn unreachable_device_leaves_commands_queued() {
    let home = tempdir().unwrap();
    let data_root = home.path().join("data");
    let port = closed_port().to_string();
    let config = DaemonConfig::from_vars(
        vars(&[
            ("DOCDROP_DEVICE_HOST", "127.0.0.1"),
            ("DOCDROP_DEVICE_PORT", port.as_str()),
        ]),
        home.path(),
        &data_root,
    )
    .unwrap();
    let runtime = DaemonRuntime::bootstrap(config).await.unwrap();
    assert!(data_root.join("docdrop.db").exists());

    let (folder, _) = runtime.files().create_folder("Inbox", None).await.unwrap();
    let report = runtime.sync_once().await.unwrap();

    assert_eq!(report.processed, 0);
    assert!(matches!(report.aborted, Some(SyncAbort::Connection(_))));
    let pending = runtime.log().fetch_unsynced_ordered(10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].entity_id, folder.id);
    let status = runtime.log().sync_status().await.unwrap().unwrap();
    assert_eq!(status.last_result, Some(SyncResult::ConnectionFailed));
    assert!(runtime.tree().list(None).await.unwrap().is_empty());
}
