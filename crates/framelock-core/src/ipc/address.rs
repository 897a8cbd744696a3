//! Server address strings handed to slave processes.
//!
//! ```text
//! tcp,<host>,<port>
//! local,<socket-name>
//! shmem,<shared-memory-key>
//! ```

use crate::SyncError;
use std::fmt;
use std::str::FromStr;

/// Where a slave finds its master.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ServerAddress {
    Tcp { host: String, port: u16 },
    Local { name: String },
    SharedMemory { key: String },
}

impl FromStr for ServerAddress {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SyncError::InvalidAddress(s.to_string());
        let (kind, rest) = s.split_once(',').ok_or_else(invalid)?;
        match kind {
            "tcp" => {
                let (host, port) = rest.rsplit_once(',').ok_or_else(invalid)?;
                if host.is_empty() {
                    return Err(invalid());
                }
                let port = port.parse::<u16>().map_err(|_| invalid())?;
                Ok(ServerAddress::Tcp {
                    host: host.to_string(),
                    port,
                })
            }
            "local" if !rest.is_empty() => Ok(ServerAddress::Local {
                name: rest.to_string(),
            }),
            "shmem" if !rest.is_empty() => Ok(ServerAddress::SharedMemory {
                key: rest.to_string(),
            }),
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerAddress::Tcp { host, port } => write!(f, "tcp,{},{}", host, port),
            ServerAddress::Local { name } => write!(f, "local,{}", name),
            ServerAddress::SharedMemory { key } => write!(f, "shmem,{}", key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_addresses() {
        assert_eq!(
            "tcp,render-01,17001".parse::<ServerAddress>().unwrap(),
            ServerAddress::Tcp {
                host: "render-01".to_string(),
                port: 17001
            }
        );
        assert_eq!(
            "local,framelock-1234".parse::<ServerAddress>().unwrap(),
            ServerAddress::Local {
                name: "framelock-1234".to_string()
            }
        );
        assert_eq!(
            "shmem,framelock-abcd".parse::<ServerAddress>().unwrap(),
            ServerAddress::SharedMemory {
                key: "framelock-abcd".to_string()
            }
        );
    }

    #[test]
    fn test_display_matches_parse() {
        let s = "tcp,10.0.0.7,4000";
        assert_eq!(s.parse::<ServerAddress>().unwrap().to_string(), s);
    }

    #[test]
    fn test_reject_malformed_addresses() {
        for bad in [
            "",
            "tcp",
            "tcp,host",
            "tcp,host,port",
            "tcp,,80",
            "tcp,host,70000",
            "local,",
            "shmem,",
            "udp,host,80",
        ] {
            assert!(
                matches!(bad.parse::<ServerAddress>(), Err(SyncError::InvalidAddress(_))),
                "accepted {:?}",
                bad
            );
        }
    }
}
