//! Slave side of the frame-sync protocol.
//!
//! A [`SyncClient`] connects to the master's server, announces its process
//! index (sockets only; with shared memory the reader slot identifies the
//! slave), then reads commands one at a time. The caller reads the arguments
//! of each command with the matching `receive_*_args` method and answers
//! `Render` and `UpdateDevices` with exactly one reply before asking for the
//! next command. Skipping an argument read or a reply is reported as a
//! protocol error instead of silently desynchronizing the stream.

use super::address::ServerAddress;
use super::framing::{read_blob, write_i32};
use super::protocol::{read_render_args, read_wasdqe_state, Command, RecordBatch, RenderArgs, WasdqeState};
use super::ring::{RingRegion, RingStream};
use super::transport::Transport;
use super::wait::WaitStrategy;
use crate::config::Timeout;
use crate::platform::{self, SharedSegment};
use crate::roster::Roster;
use crate::{Result, SyncError};
use std::sync::Arc;
use tracing::{debug, info, trace};

/// Connection state of a slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Connected and identified, no command received yet.
    Connected,
    Running,
    Closed,
}

/// Slave-side protocol engine.
#[derive(Debug)]
pub struct SyncClient {
    transport: Transport,
    process_index: usize,
    state: ClientState,
    /// Command whose argument blobs have not been read yet.
    pending_args: Option<Command>,
    /// Command still waiting for its reply.
    pending_reply: Option<Command>,
}

impl SyncClient {
    /// Connect to the server at `address` as slave `process_index`.
    ///
    /// The roster is only consulted for shared memory, where it determines
    /// which rings belong to this slave.
    pub async fn start(
        address: &ServerAddress,
        roster: &Roster,
        process_index: usize,
        timeout: Timeout,
    ) -> Result<Self> {
        let mode = roster.mode(process_index)?;
        debug!(
            "Slave {} ({:?}) connecting to {}",
            process_index, mode, address
        );

        let transport = match address {
            ServerAddress::Tcp { host, port } => {
                let endpoint = address.to_string();
                let stream = timeout
                    .run("connecting", async {
                        tokio::net::TcpStream::connect((host.as_str(), *port))
                            .await
                            .map_err(|e| SyncError::connection(endpoint.clone(), e))
                    })
                    .await?;
                info!("Connected to tcp server {} port {}", host, port);
                let mut transport = Transport::tcp(stream, endpoint, timeout);
                Self::handshake(&mut transport, process_index).await?;
                transport
            }
            #[cfg(unix)]
            ServerAddress::Local { name } => {
                let endpoint = address.to_string();
                let path = platform::local_socket_path(name);
                let stream = timeout
                    .run("connecting", async {
                        tokio::net::UnixStream::connect(&path)
                            .await
                            .map_err(|e| SyncError::connection(endpoint.clone(), e))
                    })
                    .await?;
                info!("Connected to local server {}", path.display());
                let mut transport = Transport::local(stream, endpoint, timeout);
                Self::handshake(&mut transport, process_index).await?;
                transport
            }
            #[cfg(not(unix))]
            ServerAddress::Local { name } => {
                return Err(SyncError::Connection {
                    endpoint: name.clone(),
                    message: "local sockets are not supported on this platform".to_string(),
                    source: None,
                });
            }
            ServerAddress::SharedMemory { key } => {
                let transport = Self::attach_shared_memory(key, roster, process_index, timeout)?;
                info!("Connected to shared memory {}", key);
                transport
            }
        };

        Ok(Self {
            transport,
            process_index,
            state: ClientState::Connected,
            pending_args: None,
            pending_reply: None,
        })
    }

    async fn handshake(transport: &mut Transport, process_index: usize) -> Result<()> {
        let index = i32::try_from(process_index)
            .map_err(|_| SyncError::protocol(format!("process index {} too large", process_index)))?;
        write_i32(transport, index).await?;
        transport.flush().await
    }

    fn attach_shared_memory(
        key: &str,
        roster: &Roster,
        process_index: usize,
        timeout: Timeout,
    ) -> Result<Transport> {
        let segment = Arc::new(SharedSegment::open(key)?);
        let plan = roster.shared_memory_plan();
        if segment.len() < plan.total_size() {
            return Err(SyncError::SharedMemory {
                message: format!(
                    "segment {} has {} bytes, the roster needs {}",
                    key,
                    segment.len(),
                    plan.total_size()
                ),
                source: None,
            });
        }
        let slot = plan.slot(process_index)?;

        // Open our writer before announcing ourselves as a reader, so the
        // server never sees a connected slave without a reply ring.
        let tx = RingRegion::new(
            segment.clone(),
            plan.client_region_offset(process_index),
            plan.client_region_size(),
            1,
        )?
        .open_writer();
        let rx = RingRegion::new(
            segment,
            plan.server_region_offset(slot.writer_region),
            plan.server_region_size(),
            slot.region_readers,
        )?
        .open_reader(slot.reader_slot)?;

        let stream = RingStream::new(Some(rx), Some(tx), WaitStrategy::default());
        Ok(Transport::ring(stream, format!("shmem,{}", key), timeout))
    }

    pub fn process_index(&self) -> usize {
        self.process_index
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Read the next command tag.
    ///
    /// With `wait == false` this returns `Ok(None)` when no command has
    /// arrived yet; with `wait == true` it waits up to the timeout.
    pub async fn receive_cmd(&mut self, wait: bool) -> Result<Option<Command>> {
        if self.state == ClientState::Closed {
            return Err(SyncError::protocol("client is closed"));
        }
        if let Some(cmd) = self.pending_args {
            return Err(SyncError::protocol(format!(
                "arguments of {} command were not read",
                cmd
            )));
        }
        if let Some(cmd) = self.pending_reply {
            return Err(SyncError::protocol(format!(
                "{} command was not answered before reading the next command",
                cmd
            )));
        }
        if !wait && !self.transport.has_pending_input() {
            return Ok(None);
        }

        let mut tag = [0u8; 1];
        self.transport.read_into(&mut tag).await?;
        let cmd = Command::from_tag(tag[0])?;
        trace!("Slave {} received {} command", self.process_index, cmd);

        self.state = ClientState::Running;
        if cmd.arg_blobs() > 0 {
            self.pending_args = Some(cmd);
        }
        if cmd.expects_reply() {
            self.pending_reply = Some(cmd);
        }
        Ok(Some(cmd))
    }

    fn take_args(&mut self, cmd: Command) -> Result<()> {
        if self.pending_args != Some(cmd) {
            return Err(SyncError::protocol(format!(
                "no {} command is waiting for its arguments",
                cmd
            )));
        }
        self.pending_args = None;
        Ok(())
    }

    /// Serialized static application data.
    pub async fn receive_init_args(&mut self) -> Result<Vec<u8>> {
        self.take_args(Command::Init)?;
        read_blob(&mut self.transport).await
    }

    /// One serialized device record.
    pub async fn receive_device_args(&mut self) -> Result<Vec<u8>> {
        self.take_args(Command::Device)?;
        read_blob(&mut self.transport).await
    }

    pub async fn receive_wasdqe_state_args(&mut self) -> Result<WasdqeState> {
        self.take_args(Command::WasdqeState)?;
        read_wasdqe_state(&mut self.transport).await
    }

    /// One serialized observer record.
    pub async fn receive_observer_args(&mut self) -> Result<Vec<u8>> {
        self.take_args(Command::Observer)?;
        read_blob(&mut self.transport).await
    }

    pub async fn receive_render_args(&mut self) -> Result<RenderArgs> {
        self.take_args(Command::Render)?;
        read_render_args(&mut self.transport).await
    }

    async fn send_reply(&mut self, to: Command, batch: &RecordBatch) -> Result<()> {
        if self.pending_args.is_some() || self.pending_reply != Some(to) {
            return Err(SyncError::protocol(format!(
                "no {} command is waiting for a reply",
                to
            )));
        }
        batch.write_to(&mut self.transport).await?;
        self.transport.flush().await?;
        self.pending_reply = None;
        Ok(())
    }

    /// Answer an `UpdateDevices` command with this slave's device records.
    pub async fn send_reply_update_devices(&mut self, devices: &RecordBatch) -> Result<()> {
        self.send_reply(Command::UpdateDevices, devices).await
    }

    /// Answer a `Render` command with the input events gathered since the
    /// last one. Must be sent even when there are no events.
    pub async fn send_sync(&mut self, events: &RecordBatch) -> Result<()> {
        trace!(
            "Slave {} syncing with {} events",
            self.process_index,
            events.count
        );
        self.send_reply(Command::Render, events).await
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.transport.flush().await
    }

    /// Close this end. Safe to call more than once.
    pub async fn close(&mut self) -> Result<()> {
        if self.state == ClientState::Closed {
            return Ok(());
        }
        self.state = ClientState::Closed;
        self.transport.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::framing::{read_i32, write_blob};
    use crate::ipc::protocol::ClipPlanes;
    use crate::roster::SlaveMode;
    use tokio::net::TcpListener;

    async fn connected_pair() -> (SyncClient, Transport) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let address = ServerAddress::Tcp {
            host: "127.0.0.1".to_string(),
            port,
        };
        let roster = Roster::new(vec![SlaveMode::Coupled, SlaveMode::Coupled]);
        let timeout = Timeout::from_millis(2000);
        let (client, accepted) = tokio::join!(
            SyncClient::start(&address, &roster, 2, timeout),
            listener.accept()
        );
        let server = Transport::tcp(accepted.unwrap().0, "slave 2", timeout);
        (client.unwrap(), server)
    }

    #[tokio::test]
    async fn test_handshake_sends_process_index() {
        let (client, mut server) = connected_pair().await;
        assert_eq!(client.state(), ClientState::Connected);
        assert_eq!(read_i32(&mut server).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_render_then_sync() {
        let (mut client, mut server) = connected_pair().await;
        read_i32(&mut server).await.unwrap();

        server.write_all(&[Command::Render.tag()]).await.unwrap();
        write_blob(&mut server, &ClipPlanes::new(0.1, 50.0).encode()).await.unwrap();
        write_blob(&mut server, b"frame").await.unwrap();
        server.flush().await.unwrap();

        assert_eq!(client.receive_cmd(true).await.unwrap(), Some(Command::Render));
        assert_eq!(client.state(), ClientState::Running);
        let args = client.receive_render_args().await.unwrap();
        assert_eq!(args.clip, ClipPlanes::new(0.1, 50.0));
        assert_eq!(args.dynamic_data, b"frame");

        client.send_sync(&RecordBatch::empty()).await.unwrap();
        let reply = RecordBatch::read_from(&mut server).await.unwrap();
        assert!(reply.is_empty());
    }

    #[tokio::test]
    async fn test_missing_sync_is_detected() {
        let (mut client, mut server) = connected_pair().await;
        read_i32(&mut server).await.unwrap();

        server.write_all(&[Command::Render.tag()]).await.unwrap();
        write_blob(&mut server, &ClipPlanes::default().encode()).await.unwrap();
        write_blob(&mut server, &[]).await.unwrap();
        server.write_all(&[Command::Quit.tag()]).await.unwrap();
        server.flush().await.unwrap();

        client.receive_cmd(true).await.unwrap();
        client.receive_render_args().await.unwrap();
        let err = client.receive_cmd(true).await.unwrap_err();
        assert!(matches!(err, SyncError::Protocol { .. }));
    }

    #[tokio::test]
    async fn test_unread_args_are_detected() {
        let (mut client, mut server) = connected_pair().await;
        read_i32(&mut server).await.unwrap();
        server.write_all(&[Command::Device.tag()]).await.unwrap();
        write_blob(&mut server, b"dev").await.unwrap();
        server.flush().await.unwrap();

        assert_eq!(client.receive_cmd(true).await.unwrap(), Some(Command::Device));
        assert!(client.receive_cmd(true).await.is_err());
        assert!(client.receive_observer_args().await.is_err());
        assert_eq!(client.receive_device_args().await.unwrap(), b"dev");
    }

    #[tokio::test]
    async fn test_sync_without_render_is_rejected() {
        let (mut client, _server) = connected_pair().await;
        assert!(matches!(
            client.send_sync(&RecordBatch::empty()).await,
            Err(SyncError::Protocol { .. })
        ));
    }

    #[tokio::test]
    async fn test_non_blocking_receive() {
        let (mut client, mut server) = connected_pair().await;
        read_i32(&mut server).await.unwrap();
        assert_eq!(client.receive_cmd(false).await.unwrap(), None);

        server.write_all(&[b'?']).await.unwrap();
        server.flush().await.unwrap();
        let err = client.receive_cmd(true).await.unwrap_err();
        assert!(matches!(err, SyncError::Protocol { .. }));
    }

    #[tokio::test]
    async fn test_closed_client_rejects_commands() {
        let (mut client, _server) = connected_pair().await;
        client.close().await.unwrap();
        client.close().await.unwrap();
        assert_eq!(client.state(), ClientState::Closed);
        assert!(client.receive_cmd(false).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_slave_index_is_rejected() {
        let roster = Roster::new(vec![SlaveMode::Coupled]);
        let address = ServerAddress::Tcp {
            host: "127.0.0.1".to_string(),
            port: 1,
        };
        let err = SyncClient::start(&address, &roster, 3, Timeout::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Protocol { .. }));
    }
}
