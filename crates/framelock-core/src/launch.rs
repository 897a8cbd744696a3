//! Starting slave processes from the master.
//!
//! Every slave runs the same program as the master, told where to connect
//! and which process it is via command line options:
//!
//! ```text
//! [launcher words...] <program> --server=<name> --process=<i> --timeout=<ms>
//!     --log-level=<lvl> [--config=<path>] [app args...]
//! ```
//!
//! A launcher such as `ssh render-02` runs the slave elsewhere. The launcher
//! `manual` starts nothing; the command line is logged so the slave can be
//! started by hand.

use crate::config::{LogLevel, ProcessConfig, Timeout};
use crate::{Result, SyncError};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

/// Options shared by every slave launched by one master.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// Program run by the slaves; usually the master's own executable.
    pub program: PathBuf,
    /// Server address string the slaves connect to.
    pub server_name: String,
    pub timeout: Timeout,
    pub log_level: LogLevel,
    /// Session configuration file handed to the slaves.
    pub config_path: Option<PathBuf>,
    /// Extra arguments appended for the application.
    pub app_args: Vec<String>,
}

impl LaunchOptions {
    pub fn new(program: impl Into<PathBuf>, server_name: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            server_name: server_name.into(),
            timeout: Timeout::INFINITE,
            log_level: LogLevel::default(),
            config_path: None,
            app_args: Vec::new(),
        }
    }

    /// Launch options for re-running the current executable.
    pub fn current_exe(server_name: impl Into<String>) -> Result<Self> {
        let program = std::env::current_exe().map_err(|e| SyncError::Io {
            message: format!("cannot determine current executable: {}", e),
            source: Some(e),
        })?;
        Ok(Self::new(program, server_name))
    }
}

/// A fully resolved slave command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaveCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl SlaveCommand {
    pub fn build(options: &LaunchOptions, process_index: usize, process: &ProcessConfig) -> Self {
        let mut args = vec![
            format!("--server={}", options.server_name),
            format!("--process={}", process_index),
            format!("--timeout={}", options.timeout.as_millis()),
            format!("--log-level={}", options.log_level),
        ];
        if let Some(path) = &options.config_path {
            args.push(format!("--config={}", path.display()));
        }
        args.extend(options.app_args.iter().cloned());

        let program = options.program.display().to_string();
        match process.launcher_command() {
            Some(words) if !words.is_empty() => {
                let mut prefixed: Vec<String> = words[1..].iter().map(|w| w.to_string()).collect();
                prefixed.push(program);
                prefixed.extend(args);
                Self {
                    program: words[0].to_string(),
                    args: prefixed,
                }
            }
            _ => Self { program, args },
        }
    }
}

impl std::fmt::Display for SlaveCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// A slave process started (or announced, if manual) by the master.
#[derive(Debug)]
pub struct SlaveProcess {
    index: usize,
    id: String,
    child: Option<Child>,
}

impl SlaveProcess {
    /// Start slave `process_index` as described by `process`.
    pub fn launch(options: &LaunchOptions, process_index: usize, process: &ProcessConfig) -> Result<Self> {
        let command = SlaveCommand::build(options, process_index, process);
        if process.is_manual() {
            info!(
                "Process {} (index {}) is started manually: {}",
                process.id, process_index, command
            );
            return Ok(Self {
                index: process_index,
                id: process.id.clone(),
                child: None,
            });
        }

        info!(
            "Launching child process {} (index {})",
            process.id, process_index
        );
        debug!("Child command line: {}", command);
        let child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                error!("Failed to launch process {}: {}", process_index, e);
                SyncError::Io {
                    message: format!("cannot launch process {} ({}): {}", process_index, command.program, e),
                    source: Some(e),
                }
            })?;

        Ok(Self {
            index: process_index,
            id: process.id.clone(),
            child: Some(child),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_manual(&self) -> bool {
        self.child.is_none()
    }

    /// OS process id, while the process runs.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Wait for the slave to exit after it was told to quit.
    ///
    /// The wait is bounded by twice `timeout`; a slave that overstays is
    /// killed and reported as a timeout. Manual slaves return `None`.
    pub async fn wait_for_exit(&mut self, timeout: Timeout) -> Result<Option<ExitStatus>> {
        let Some(child) = self.child.as_mut() else {
            return Ok(None);
        };
        debug!("Waiting for process {} to finish", self.index);
        let index = self.index;
        let result = timeout
            .doubled()
            .run("waiting for a slave to exit", async {
                child.wait().await.map_err(|e| SyncError::Io {
                    message: format!("cannot wait for process {}: {}", index, e),
                    source: Some(e),
                })
            })
            .await;
        match result {
            Ok(status) => {
                if status.success() {
                    debug!("Process {} finished", index);
                } else {
                    warn!("Process {} exited with {}", index, status);
                }
                Ok(Some(status))
            }
            Err(e) => {
                error!("Failed to terminate process {}: {}", index, e);
                if let Err(kill) = child.kill().await {
                    warn!("Cannot kill process {}: {}", index, kill);
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> LaunchOptions {
        LaunchOptions {
            program: PathBuf::from("/opt/app/bin/viewer"),
            server_name: "tcp,head-node,4711".to_string(),
            timeout: Timeout::from_millis(5000),
            log_level: LogLevel::Debug,
            config_path: Some(PathBuf::from("/etc/cave.json")),
            app_args: vec!["--scene=lab".to_string()],
        }
    }

    #[test]
    fn test_direct_command_line() {
        let cmd = SlaveCommand::build(&options(), 2, &ProcessConfig::new("left"));
        assert_eq!(cmd.program, "/opt/app/bin/viewer");
        assert_eq!(
            cmd.args,
            vec![
                "--server=tcp,head-node,4711",
                "--process=2",
                "--timeout=5000",
                "--log-level=debug",
                "--config=/etc/cave.json",
                "--scene=lab",
            ]
        );
    }

    #[test]
    fn test_launcher_prefix() {
        let process = ProcessConfig::new("wall").with_launcher("ssh -X wall-03");
        let cmd = SlaveCommand::build(&options(), 1, &process);
        assert_eq!(cmd.program, "ssh");
        assert_eq!(&cmd.args[..3], &["-X", "wall-03", "/opt/app/bin/viewer"]);
        assert_eq!(cmd.args[3], "--server=tcp,head-node,4711");
    }

    #[test]
    fn test_infinite_timeout_on_command_line() {
        let mut opts = options();
        opts.timeout = Timeout::INFINITE;
        opts.config_path = None;
        let cmd = SlaveCommand::build(&opts, 1, &ProcessConfig::new("x"));
        assert!(cmd.args.contains(&"--timeout=-1".to_string()));
        assert!(!cmd.args.iter().any(|a| a.starts_with("--config=")));
    }

    #[tokio::test]
    async fn test_manual_process_is_not_started() {
        let process = ProcessConfig::new("desk").with_launcher("manual");
        let mut slave = SlaveProcess::launch(&options(), 1, &process).unwrap();
        assert!(slave.is_manual());
        assert!(slave.pid().is_none());
        assert_eq!(slave.wait_for_exit(Timeout::from_millis(10)).await.unwrap(), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launch_and_wait() {
        let mut opts = options();
        opts.program = PathBuf::from("/bin/sh");
        // `sh -c true` takes the slave arguments as positional parameters
        let process = ProcessConfig::new("sh").with_launcher("/bin/sh -c true");
        let mut slave = SlaveProcess::launch(&opts, 1, &process).unwrap();
        let status = slave
            .wait_for_exit(Timeout::from_millis(5000))
            .await
            .unwrap()
            .unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn test_missing_program_fails() {
        let mut opts = options();
        opts.program = PathBuf::from("/nonexistent/framelock-slave");
        assert!(SlaveProcess::launch(&opts, 1, &ProcessConfig::new("x")).is_err());
    }
}
