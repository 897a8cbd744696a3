//! Centralized configuration for framelock.
//!
//! Holds the IPC sizing constants, the process-wide timeout, and the session
//! description (which processes take part and how they talk to each other).

use crate::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// IPC sizing and polling constants.
pub struct IpcConfig;

impl IpcConfig {
    /// Bytes of each server->client ring region, control header included.
    ///
    /// Sized so that ordinary frames never block on a full ring; only
    /// applications that serialize a lot of dynamic data hit backpressure.
    pub const SERVER_REGION_SIZE: usize = 1024 * 1024;
    /// Bytes of each client->server ring region, control header included.
    pub const CLIENT_REGION_SIZE: usize = 2048;
    /// Largest blob the `i32` size prefix can carry.
    pub const MAX_BLOB_SIZE: usize = i32::MAX as usize;
    /// Polls that only yield before the ring wait strategy starts sleeping.
    pub const RING_SPIN_POLLS: u32 = 64;
    /// Sleep interval of the ring wait strategy once spinning is exhausted.
    pub const RING_SLEEP_INTERVAL: Duration = Duration::from_micros(200);
    /// Sleep interval while waiting for a ring reader to connect.
    pub const READER_CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(10);
    /// Prefix of generated local socket names and shared memory keys.
    pub const ENDPOINT_PREFIX: &'static str = "framelock-";
    /// Read buffer size of socket transports.
    pub const SOCKET_BUFFER_SIZE: usize = 64 * 1024;
}

/// The process-wide timeout applied to every blocking IPC operation.
///
/// Built from a millisecond value: negative means wait forever, zero means
/// do not wait at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub struct Timeout(Option<Duration>);

impl Timeout {
    /// Never time out.
    pub const INFINITE: Timeout = Timeout(None);

    pub fn from_millis(msecs: i64) -> Self {
        if msecs < 0 {
            Timeout(None)
        } else {
            Timeout(Some(Duration::from_millis(msecs as u64)))
        }
    }

    pub fn duration(&self) -> Option<Duration> {
        self.0
    }

    pub fn is_infinite(&self) -> bool {
        self.0.is_none()
    }

    /// Millisecond form, as passed on child process command lines.
    pub fn as_millis(&self) -> i64 {
        match self.0 {
            Some(d) => d.as_millis() as i64,
            None => -1,
        }
    }

    /// Twice this timeout; used for process start and exit.
    pub fn doubled(&self) -> Self {
        Timeout(self.0.map(|d| d * 2))
    }

    /// Run `fut` under this timeout, reporting `operation` on expiry.
    pub async fn run<F, T>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        match self.0 {
            None => fut.await,
            Some(after) => match tokio::time::timeout(after, fut).await {
                Ok(result) => result,
                Err(_) => Err(SyncError::Timeout { operation, after }),
            },
        }
    }
}

impl Default for Timeout {
    fn default() -> Self {
        Timeout::INFINITE
    }
}

impl From<i64> for Timeout {
    fn from(msecs: i64) -> Self {
        Timeout::from_millis(msecs)
    }
}

impl From<Timeout> for i64 {
    fn from(timeout: Timeout) -> Self {
        timeout.as_millis()
    }
}

/// Which transport the master offers to its slaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IpcKind {
    /// TCP if any slave is launched remotely, shared memory otherwise.
    #[default]
    Automatic,
    Tcp,
    Local,
    SharedMemory,
}

/// Log verbosity shared between master and launched slaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Fatal,
    Warning,
    #[default]
    Info,
    Debug,
    Firehose,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Fatal => "fatal",
            LogLevel::Warning => "warning",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Firehose => "firehose",
        }
    }

    /// The tracing level this verbosity enables.
    pub fn tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Fatal => tracing::Level::ERROR,
            LogLevel::Warning => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Firehose => tracing::Level::TRACE,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "fatal" => Ok(LogLevel::Fatal),
            "warning" => Ok(LogLevel::Warning),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "firehose" => Ok(LogLevel::Firehose),
            _ => Err(SyncError::Config {
                message: format!("unknown log level '{}'", s),
            }),
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One participating process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Human readable identifier, used in log messages.
    pub id: String,
    /// Whether this slave may render at its own pace.
    pub decoupled: bool,
    /// Command prefix used to start this process (e.g. `ssh render-node-2`).
    /// The value `manual` means the process is started by hand.
    pub launcher: Option<String>,
    /// Address the master binds its TCP server to. Only read for process 0.
    pub address: Option<String>,
}

impl ProcessConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn decoupled(mut self, decoupled: bool) -> Self {
        self.decoupled = decoupled;
        self
    }

    pub fn with_launcher(mut self, launcher: impl Into<String>) -> Self {
        self.launcher = Some(launcher.into());
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Launcher words, or `None` if the process is launched directly.
    pub fn launcher_command(&self) -> Option<Vec<&str>> {
        let launcher = self.launcher.as_deref()?.trim();
        if launcher.is_empty() || launcher == "manual" {
            return None;
        }
        Some(launcher.split(' ').filter(|w| !w.is_empty()).collect())
    }

    pub fn is_manual(&self) -> bool {
        self.launcher.as_deref().map(str::trim) == Some("manual")
    }

    fn is_remote(&self) -> bool {
        self.launcher
            .as_deref()
            .map(|l| !l.trim().is_empty())
            .unwrap_or(false)
    }
}

/// Description of a whole multi-process session. Process 0 is the master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub timeout_ms: Timeout,
    #[serde(default)]
    pub ipc: IpcKind,
    pub processes: Vec<ProcessConfig>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: Timeout::INFINITE,
            ipc: IpcKind::Automatic,
            processes: vec![ProcessConfig::new("master")],
        }
    }
}

impl SessionConfig {
    /// Read and validate a JSON session file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| SyncError::Io {
            message: format!("Failed to read session config {}", path.display()),
            source: Some(e),
        })?;
        let config: SessionConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let master = self.processes.first().ok_or_else(|| SyncError::Config {
            message: "session has no processes".to_string(),
        })?;
        if master.decoupled {
            return Err(SyncError::Config {
                message: format!("master process '{}' cannot be decoupled", master.id),
            });
        }
        Ok(())
    }

    pub fn process_count(&self) -> usize {
        self.processes.len()
    }

    /// The transport to use, with `Automatic` resolved.
    ///
    /// A slave with a launcher command is assumed to run on another host,
    /// which rules out local sockets and shared memory.
    pub fn resolved_ipc(&self) -> IpcKind {
        match self.ipc {
            IpcKind::Automatic => {
                if self.processes.iter().skip(1).any(ProcessConfig::is_remote) {
                    IpcKind::Tcp
                } else {
                    IpcKind::SharedMemory
                }
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_from_millis() {
        assert!(Timeout::from_millis(-1).is_infinite());
        assert_eq!(
            Timeout::from_millis(1500).duration(),
            Some(Duration::from_millis(1500))
        );
        assert_eq!(Timeout::from_millis(0).duration(), Some(Duration::ZERO));
        assert_eq!(Timeout::INFINITE.as_millis(), -1);
        assert_eq!(Timeout::from_millis(40).doubled().as_millis(), 80);
    }

    #[tokio::test]
    async fn test_timeout_run_expires() {
        let timeout = Timeout::from_millis(20);
        let result: Result<()> = timeout
            .run("sleeping", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(result.unwrap_err().is_timeout());
    }

    #[test]
    fn test_automatic_ipc_resolution() {
        let mut config = SessionConfig {
            processes: vec![
                ProcessConfig::new("master"),
                ProcessConfig::new("left"),
                ProcessConfig::new("right").decoupled(true),
            ],
            ..Default::default()
        };
        assert_eq!(config.resolved_ipc(), IpcKind::SharedMemory);

        config.processes[2].launcher = Some("ssh render2".to_string());
        assert_eq!(config.resolved_ipc(), IpcKind::Tcp);

        config.ipc = IpcKind::Local;
        assert_eq!(config.resolved_ipc(), IpcKind::Local);
    }

    #[test]
    fn test_launcher_command_splitting() {
        let p = ProcessConfig::new("wall").with_launcher("ssh  -X wall-node");
        assert_eq!(p.launcher_command(), Some(vec!["ssh", "-X", "wall-node"]));
        assert!(ProcessConfig::new("hand")
            .with_launcher("manual")
            .launcher_command()
            .is_none());
        assert!(ProcessConfig::new("hand").with_launcher("manual").is_manual());
    }

    #[test]
    fn test_validate_rejects_decoupled_master() {
        let config = SessionConfig {
            processes: vec![ProcessConfig::new("master").decoupled(true)],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(SyncError::Config { .. })));

        let empty = SessionConfig {
            processes: vec![],
            ..Default::default()
        };
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_load_from_json_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(
            &path,
            r#"{
                "timeout_ms": 2000,
                "ipc": "local",
                "processes": [
                    {"id": "master"},
                    {"id": "cave-left"},
                    {"id": "monitor", "decoupled": true}
                ]
            }"#,
        )
        .unwrap();

        let config = SessionConfig::load(&path).unwrap();
        assert_eq!(config.timeout_ms, Timeout::from_millis(2000));
        assert_eq!(config.ipc, IpcKind::Local);
        assert_eq!(config.process_count(), 3);
        assert!(config.processes[2].decoupled);
        assert!(!config.processes[1].decoupled);
    }

    #[test]
    fn test_log_level_mapping() {
        assert_eq!("FIREHOSE".parse::<LogLevel>().unwrap(), LogLevel::Firehose);
        assert_eq!(LogLevel::Firehose.tracing_level(), tracing::Level::TRACE);
        assert_eq!(LogLevel::Warning.to_string(), "warning");
        assert!(matches!(
            "loud".parse::<LogLevel>(),
            Err(SyncError::Config { .. })
        ));
        for level in [LogLevel::Fatal, LogLevel::Info, LogLevel::Debug] {
            assert_eq!(level.as_str().parse::<LogLevel>().unwrap(), level);
        }
    }
}
