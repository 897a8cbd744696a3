//! Platform abstraction layer.
//!
//! All `#[cfg]` blocks for OS-specific behavior live here: shared memory
//! segments, local socket paths, and host name lookup.
//!
//! # Supported Platforms
//!
//! - **Linux**: Full support
//! - **macOS**: Full support (shared memory keys are kept under the 31 byte
//!   POSIX name limit)
//! - **Windows**: TCP transport only

pub mod shm;

pub use shm::SharedSegment;

use crate::config::IpcConfig;
use std::path::PathBuf;

/// Generate a fresh endpoint name for a local socket or shared memory key.
pub fn generate_endpoint_name() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{}{}", IpcConfig::ENDPOINT_PREFIX, &id[..16])
}

/// Filesystem path of a named local socket.
///
/// Bare names live in the temp directory; absolute paths are used as given.
pub fn local_socket_path(name: &str) -> PathBuf {
    let path = PathBuf::from(name);
    if path.is_absolute() {
        path
    } else {
        std::env::temp_dir().join(name)
    }
}

/// Name of this host, as reported to slaves that connect over TCP.
pub fn host_name() -> String {
    #[cfg(unix)]
    {
        match nix::unistd::gethostname() {
            Ok(name) => name.to_string_lossy().into_owned(),
            Err(e) => {
                tracing::warn!("Cannot determine host name: {}", e);
                "localhost".to_string()
            }
        }
    }

    #[cfg(not(unix))]
    {
        std::env::var("COMPUTERNAME").unwrap_or_else(|_| "localhost".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_names_are_unique_and_short() {
        let a = generate_endpoint_name();
        let b = generate_endpoint_name();
        assert_ne!(a, b);
        assert!(a.starts_with(IpcConfig::ENDPOINT_PREFIX));
        // POSIX shm names on macOS are limited to 31 bytes including the slash
        assert!(a.len() < 31);
    }

    #[test]
    fn test_local_socket_path() {
        assert_eq!(local_socket_path("/run/fl.sock"), PathBuf::from("/run/fl.sock"));
        assert_eq!(
            local_socket_path("framelock-x"),
            std::env::temp_dir().join("framelock-x")
        );
    }

    #[test]
    fn test_host_name_not_empty() {
        assert!(!host_name().is_empty());
    }
}
