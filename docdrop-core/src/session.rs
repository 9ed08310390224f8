use std::fmt;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use ssh2::{CheckResult, ErrorCode, KnownHostFileKind, OpenFlags, OpenType, Session, Sftp};
use tracing::{debug, info, warn};

use crate::error::ConnectionError;

/// Directory on the device that holds every document and folder.
pub const BASE_PATH: &str = "/home/root/.local/share/remarkable/xochitl";
pub const METADATA_SUFFIX: &str = ".metadata";
pub const CONTENT_SUFFIX: &str = ".content";

pub const DEFAULT_HOST: &str = "10.11.99.1";
pub const DEFAULT_PORT: u16 = 22;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(200);
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(10);

// LIBSSH2_FX_NO_SUCH_FILE
const SFTP_NO_SUCH_FILE: i32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Disconnected = 0,
    Connecting = 1,
    Authenticated = 2,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SessionState::Connecting,
            2 => SessionState::Authenticated,
            _ => SessionState::Disconnected,
        }
    }
}

/// Byte-level file primitives on the device.
///
/// Every call connects on demand, so callers never call [`ensure_connected`] first.
///
/// [`ensure_connected`]: DeviceSession::ensure_connected
#[async_trait]
pub trait DeviceSession: Send + Sync {
    async fn ensure_connected(&self) -> Result<(), ConnectionError>;

    /// Entries under `base_path` whose name ends in [`METADATA_SUFFIX`].
    async fn list_metadata_files(&self, base_path: &str)
    -> Result<Vec<RemoteEntry>, ConnectionError>;

    /// `Ok(None)` when the file does not exist on the device.
    async fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>, ConnectionError>;

    /// Creates `path`, failing when it already exists.
    async fn write_new_file(&self, path: &str, content: &[u8]) -> Result<(), ConnectionError>;

    /// Creates or truncates `path`.
    async fn overwrite_file(&self, path: &str, content: &[u8]) -> Result<(), ConnectionError>;

    /// Creates a directory; an existing directory is not an error.
    async fn create_dir(&self, path: &str) -> Result<(), ConnectionError>;
}

#[derive(Clone)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub known_hosts: Option<PathBuf>,
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
}

impl SessionConfig {
    pub fn new(host: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            username: username.into(),
            password: password.into(),
            known_hosts: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            io_timeout: DEFAULT_IO_TIMEOUT,
        }
    }

    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("known_hosts", &self.known_hosts)
            .field("connect_timeout", &self.connect_timeout)
            .field("io_timeout", &self.io_timeout)
            .finish()
    }
}

/// The single SSH/SFTP connection to the device.
///
/// `ssh2` is blocking, so every operation runs on the blocking pool while holding the
/// connection mutex. At most one transport handle exists at a time.
pub struct SftpSession {
    inner: Arc<Mutex<Connection>>,
    phase: Arc<AtomicU8>,
}

struct Connection {
    config: SessionConfig,
    state: State,
    /// Lock-free copy of `state` for observers.
    phase: Arc<AtomicU8>,
}

enum State {
    Disconnected,
    Connecting,
    Authenticated { session: Session, sftp: Sftp },
}

impl SftpSession {
    pub fn new(config: SessionConfig) -> Self {
        let phase = Arc::new(AtomicU8::new(SessionState::Disconnected as u8));
        Self {
            inner: Arc::new(Mutex::new(Connection {
                config,
                state: State::Disconnected,
                phase: Arc::clone(&phase),
            })),
            phase,
        }
    }

    /// Does not wait for an in-flight operation, so `Connecting` is visible while a
    /// handshake runs.
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.phase.load(Ordering::Acquire))
    }

    async fn with_sftp<T, F>(&self, op: F) -> Result<T, ConnectionError>
    where
        T: Send + 'static,
        F: FnOnce(&Sftp) -> Result<T, ConnectionError> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let mut conn = inner.lock().unwrap_or_else(PoisonError::into_inner);
            let result = conn.sftp().and_then(op);
            if let Err(err) = &result {
                // The transport may be half-dead; the next call starts from scratch.
                debug!(error = %err, "dropping device session after failure");
                conn.set_state(State::Disconnected);
            }
            result
        })
        .await
        .map_err(|err| ConnectionError::Task(err.to_string()))?
    }
}

impl Connection {
    fn set_state(&mut self, state: State) {
        let phase = match &state {
            State::Disconnected => SessionState::Disconnected,
            State::Connecting => SessionState::Connecting,
            State::Authenticated { .. } => SessionState::Authenticated,
        };
        self.state = state;
        self.phase.store(phase as u8, Ordering::Release);
    }

    fn sftp(&mut self) -> Result<&Sftp, ConnectionError> {
        let alive = matches!(
            &self.state,
            State::Authenticated { session, .. } if session.authenticated()
        );
        if !alive {
            self.set_state(State::Connecting);
            match open_session(&self.config) {
                Ok((session, sftp)) => {
                    info!(address = %self.config.address(), "connected to device");
                    self.set_state(State::Authenticated { session, sftp });
                }
                Err(err) => {
                    self.set_state(State::Disconnected);
                    return Err(err);
                }
            }
        }
        match &self.state {
            State::Authenticated { sftp, .. } => Ok(sftp),
            _ => Err(ConnectionError::Task("device session is not authenticated".into())),
        }
    }
}

fn open_session(config: &SessionConfig) -> Result<(Session, Sftp), ConnectionError> {
    let address = config.address();
    let socket = address
        .to_socket_addrs()
        .map_err(|source| ConnectionError::Resolve {
            address: address.clone(),
            source,
        })?
        .next()
        .ok_or_else(|| ConnectionError::Resolve {
            address: address.clone(),
            source: std::io::Error::other("no addresses resolved"),
        })?;
    let tcp = TcpStream::connect_timeout(&socket, config.connect_timeout).map_err(|source| {
        ConnectionError::Connect {
            address: address.clone(),
            source,
        }
    })?;

    let mut session = Session::new().map_err(|source| ConnectionError::Ssh {
        stage: "setup",
        source,
    })?;
    session.set_tcp_stream(tcp);
    session.set_timeout(timeout_millis(config.io_timeout));
    session.handshake().map_err(|source| ConnectionError::Ssh {
        stage: "handshake",
        source,
    })?;
    if let Some(known_hosts) = &config.known_hosts {
        verify_host_key(&session, config, known_hosts)?;
    }
    session
        .userauth_password(&config.username, &config.password)
        .map_err(|source| ConnectionError::Ssh {
            stage: "authentication",
            source,
        })?;
    if !session.authenticated() {
        return Err(ConnectionError::AuthRejected(config.username.clone()));
    }
    let sftp = session.sftp().map_err(|source| ConnectionError::Ssh {
        stage: "sftp subsystem",
        source,
    })?;
    Ok((session, sftp))
}

fn verify_host_key(
    session: &Session,
    config: &SessionConfig,
    known_hosts: &Path,
) -> Result<(), ConnectionError> {
    let mut hosts = session.known_hosts().map_err(|source| ConnectionError::Ssh {
        stage: "known hosts",
        source,
    })?;
    hosts
        .read_file(known_hosts, KnownHostFileKind::OpenSSH)
        .map_err(|source| ConnectionError::Ssh {
            stage: "known hosts",
            source,
        })?;
    let (key, _) = session.host_key().ok_or(ConnectionError::HostKeyMismatch)?;
    match hosts.check_port(&config.host, config.port, key) {
        CheckResult::Match => Ok(()),
        other => {
            warn!(host = %config.host, result = ?other, "device host key rejected");
            Err(ConnectionError::HostKeyMismatch)
        }
    }
}

fn timeout_millis(timeout: Duration) -> u32 {
    timeout.as_millis().min(u128::from(u32::MAX)) as u32
}

fn is_no_such_file(err: &ssh2::Error) -> bool {
    matches!(err.code(), ErrorCode::SFTP(code) if code == SFTP_NO_SUCH_FILE)
}

fn write_with_flags(
    sftp: &Sftp,
    path: &str,
    content: &[u8],
    flags: OpenFlags,
) -> Result<(), ConnectionError> {
    let mut file = sftp
        .open_mode(Path::new(path), flags, 0o644, OpenType::File)
        .map_err(|source| ConnectionError::Sftp {
            operation: "create",
            path: path.to_string(),
            source,
        })?;
    // The remote handle is closed when `file` drops, on the error path too.
    file.write_all(content)
        .map_err(|source| ConnectionError::Io {
            operation: "write",
            path: path.to_string(),
            source,
        })
}

#[async_trait]
impl DeviceSession for SftpSession {
    async fn ensure_connected(&self) -> Result<(), ConnectionError> {
        self.with_sftp(|_| Ok(())).await
    }

    async fn list_metadata_files(
        &self,
        base_path: &str,
    ) -> Result<Vec<RemoteEntry>, ConnectionError> {
        let base_path = base_path.to_string();
        self.with_sftp(move |sftp| {
            let listing = sftp
                .readdir(Path::new(&base_path))
                .map_err(|source| ConnectionError::Sftp {
                    operation: "list",
                    path: base_path.clone(),
                    source,
                })?;
            Ok(listing
                .into_iter()
                .filter_map(|(path, _)| {
                    let name = path.file_name()?.to_str()?.to_string();
                    name.ends_with(METADATA_SUFFIX).then(|| RemoteEntry {
                        path: path.to_string_lossy().into_owned(),
                        name,
                    })
                })
                .collect())
        })
        .await
    }

    async fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>, ConnectionError> {
        let path = path.to_string();
        self.with_sftp(move |sftp| {
            let mut file = match sftp.open(Path::new(&path)) {
                Ok(file) => file,
                Err(err) if is_no_such_file(&err) => return Ok(None),
                Err(source) => {
                    return Err(ConnectionError::Sftp {
                        operation: "open",
                        path,
                        source,
                    });
                }
            };
            let mut contents = Vec::new();
            file.read_to_end(&mut contents)
                .map_err(|source| ConnectionError::Io {
                    operation: "read",
                    path: path.clone(),
                    source,
                })?;
            Ok(Some(contents))
        })
        .await
    }

    async fn write_new_file(&self, path: &str, content: &[u8]) -> Result<(), ConnectionError> {
        let path = path.to_string();
        let content = content.to_vec();
        self.with_sftp(move |sftp| {
            write_with_flags(
                sftp,
                &path,
                &content,
                OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::EXCLUSIVE,
            )
        })
        .await
    }

    async fn overwrite_file(&self, path: &str, content: &[u8]) -> Result<(), ConnectionError> {
        let path = path.to_string();
        let content = content.to_vec();
        self.with_sftp(move |sftp| {
            write_with_flags(
                sftp,
                &path,
                &content,
                OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
            )
        })
        .await
    }

    async fn create_dir(&self, path: &str) -> Result<(), ConnectionError> {
        let path = path.to_string();
        self.with_sftp(move |sftp| match sftp.mkdir(Path::new(&path), 0o755) {
            Ok(()) => Ok(()),
            Err(source) => match sftp.stat(Path::new(&path)) {
                Ok(stat) if stat.is_dir() => Ok(()),
                _ => Err(ConnectionError::Sftp {
                    operation: "mkdir",
                    path,
                    source,
                }),
            },
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    #[test]
    fn debug_output_hides_password() {
        let config = SessionConfig::new(DEFAULT_HOST, "root", "hunter2");
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("10.11.99.1"));
    }

    #[test]
    fn timeouts_are_clamped_to_u32_millis() {
        assert_eq!(timeout_millis(Duration::from_millis(200)), 200);
        assert_eq!(timeout_millis(Duration::from_secs(u64::MAX)), u32::MAX);
    }

    #[tokio::test]
    async fn failed_connect_leaves_session_disconnected() {
        let mut config = SessionConfig::new("127.0.0.1", "root", "secret");
        config.port = closed_port();
        let session = SftpSession::new(config);
        assert_eq!(session.state(), SessionState::Disconnected);

        let err = session.ensure_connected().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Connect { .. }));
        assert_eq!(session.state(), SessionState::Disconnected);

        // A later call retries from scratch and fails the same way.
        let err = session.read_file("/tmp/missing").await.unwrap_err();
        assert!(matches!(err, ConnectionError::Connect { .. }));
    }

    #[tokio::test]
    async fn state_reports_connecting_during_a_stalled_handshake() {
        // Accepts TCP through the backlog but never sends an SSH banner.
        let silent = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = SessionConfig::new("127.0.0.1", "root", "secret");
        config.port = silent.local_addr().unwrap().port();
        config.io_timeout = Duration::from_millis(500);
        let session = Arc::new(SftpSession::new(config));

        let connecting = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.ensure_connected().await }
        });
        let mut seen = false;
        for _ in 0..200 {
            if session.state() == SessionState::Connecting {
                seen = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(seen, "handshake never reported as connecting");

        let err = connecting.await.unwrap().unwrap_err();
        assert!(matches!(err, ConnectionError::Ssh { stage: "handshake", .. }));
        assert_eq!(session.state(), SessionState::Disconnected);
    }
}
