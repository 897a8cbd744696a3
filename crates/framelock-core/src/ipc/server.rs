//! Master side of the frame-sync protocol.
//!
//! The server owns the link to every slave. With sockets that is one
//! bidirectional [`Transport`] per slave, stored by the process index the
//! slave announced. With shared memory it is one fan-out ring read by all
//! coupled slaves together, one ring per decoupled slave, and one reply ring
//! per slave.
//!
//! # Synchronization
//!
//! Each slave has an is-synced flag. Commands go only to synced slaves.
//! Sending `Render` clears the flag of every decoupled slave; collecting
//! syncs then takes two passes: wait for every slave that is still synced
//! (the coupled ones), then take a sync from each decoupled slave only if
//! one is already waiting. A decoupled slave therefore never stalls the
//! master, and gets its next command once it has caught up.

use super::address::ServerAddress;
use super::framing::{read_i32, write_blob};
use super::protocol::{ClipPlanes, Command, RecordBatch, SlaveBatch, WasdqeState};
use super::ring::{RingRegion, RingStream, RingWriter};
use super::transport::Transport;
use super::wait::WaitStrategy;
use crate::config::Timeout;
use crate::platform::{self, SharedSegment};
use crate::roster::{Roster, SharedMemoryPlan, SlaveMode};
use crate::{Result, SyncError};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, trace, warn};

/// Where slaves connect before `wait_for_clients` has finished.
#[derive(Debug)]
enum Listener {
    Tcp {
        listener: TcpListener,
        addr: SocketAddr,
    },
    #[cfg(unix)]
    Local {
        listener: tokio::net::UnixListener,
        name: String,
        path: std::path::PathBuf,
    },
    SharedMemory {
        segment: Arc<SharedSegment>,
        plan: SharedMemoryPlan,
    },
}

/// Established links to all slaves.
#[derive(Debug)]
enum Links {
    /// One transport per slave, indexed by `process_index - 1`.
    Sockets(Vec<Transport>),
    SharedMemory {
        /// Writer-only transports, one per server->client region.
        outputs: Vec<Transport>,
        /// Output index of each slave.
        route: Vec<usize>,
        /// Reader-only transports, one per slave.
        inputs: Vec<Transport>,
    },
}

impl Links {
    fn output_index(&self, slave: usize) -> usize {
        match self {
            Links::Sockets(_) => slave,
            Links::SharedMemory { route, .. } => route[slave],
        }
    }

    fn output(&mut self, index: usize) -> &mut Transport {
        match self {
            Links::Sockets(transports) => &mut transports[index],
            Links::SharedMemory { outputs, .. } => &mut outputs[index],
        }
    }

    fn outputs_mut(&mut self) -> &mut [Transport] {
        match self {
            Links::Sockets(transports) => transports,
            Links::SharedMemory { outputs, .. } => outputs,
        }
    }

    fn input(&mut self, slave: usize) -> &mut Transport {
        match self {
            Links::Sockets(transports) => &mut transports[slave],
            Links::SharedMemory { inputs, .. } => &mut inputs[slave],
        }
    }
}

/// Per-slave synchronization state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlaveSyncState {
    pub mode: SlaveMode,
    /// Acknowledged everything it was sent; will receive the next command.
    pub synced: bool,
    /// Master frame of the last render command sent to this slave.
    pub last_sent_frame: u64,
    /// Master frame this slave last acknowledged with a sync.
    pub last_synced_frame: u64,
}

impl SlaveSyncState {
    /// Frames this slave is behind the master.
    pub fn lag(&self, frame: u64) -> u64 {
        frame.saturating_sub(self.last_synced_frame)
    }
}

/// Master-side protocol engine.
#[derive(Debug)]
pub struct SyncServer {
    roster: Roster,
    timeout: Timeout,
    listener: Listener,
    links: Option<Links>,
    slaves: Vec<SlaveSyncState>,
    frame: u64,
}

impl SyncServer {
    fn new(roster: Roster, timeout: Timeout, listener: Listener) -> Self {
        let slaves = roster
            .slave_indices()
            .map(|p| SlaveSyncState {
                mode: if roster.is_decoupled(p) {
                    SlaveMode::Decoupled
                } else {
                    SlaveMode::Coupled
                },
                synced: true,
                last_sent_frame: 0,
                last_synced_frame: 0,
            })
            .collect();
        Self {
            roster,
            timeout,
            listener,
            links: None,
            slaves,
            frame: 0,
        }
    }

    /// Listen for TCP slaves on `bind` (an IP address; default all
    /// interfaces) and an OS-assigned port.
    pub async fn start_tcp(bind: Option<&str>, roster: Roster, timeout: Timeout) -> Result<Self> {
        let ip = match bind.map(str::trim).filter(|b| !b.is_empty()) {
            Some(b) => b
                .parse::<IpAddr>()
                .map_err(|_| SyncError::InvalidAddress(b.to_string()))?,
            None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };
        let listener = TcpListener::bind((ip, 0))
            .await
            .map_err(|e| SyncError::connection(format!("tcp {}", ip), e))?;
        let addr = listener.local_addr()?;
        info!("Started tcp server on {} port {}", addr.ip(), addr.port());
        Ok(Self::new(roster, timeout, Listener::Tcp { listener, addr }))
    }

    /// Listen for slaves on a freshly named local socket.
    #[cfg(unix)]
    pub async fn start_local(roster: Roster, timeout: Timeout) -> Result<Self> {
        use std::os::unix::fs::PermissionsExt;

        let name = platform::generate_endpoint_name();
        let path = platform::local_socket_path(&name);
        let listener = tokio::net::UnixListener::bind(&path)
            .map_err(|e| SyncError::connection(path.display().to_string(), e))?;
        // Only our own user may connect.
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        info!("Started local server {}", path.display());
        Ok(Self::new(
            roster,
            timeout,
            Listener::Local {
                listener,
                name,
                path,
            },
        ))
    }

    #[cfg(not(unix))]
    pub async fn start_local(_roster: Roster, _timeout: Timeout) -> Result<Self> {
        Err(SyncError::Config {
            message: "local sockets are not supported on this platform".to_string(),
        })
    }

    /// Create the shared memory segment that slaves attach to.
    pub fn start_shared_memory(roster: Roster, timeout: Timeout) -> Result<Self> {
        if roster.slave_count() == 0 {
            return Err(SyncError::Config {
                message: "a shared memory server needs at least one slave".to_string(),
            });
        }
        let plan = roster.shared_memory_plan();
        let key = platform::generate_endpoint_name();
        let segment = Arc::new(SharedSegment::create(&key, plan.total_size())?);
        info!(
            "Started shared memory server {} ({} writer regions, {} bytes)",
            key,
            plan.writer_regions(),
            plan.total_size()
        );
        Ok(Self::new(
            roster,
            timeout,
            Listener::SharedMemory { segment, plan },
        ))
    }

    /// Address a slave must be given to connect to this server.
    pub fn address(&self) -> ServerAddress {
        match &self.listener {
            Listener::Tcp { addr, .. } => {
                let host = if addr.ip().is_unspecified() {
                    platform::host_name()
                } else {
                    addr.ip().to_string()
                };
                ServerAddress::Tcp {
                    host,
                    port: addr.port(),
                }
            }
            #[cfg(unix)]
            Listener::Local { name, .. } => ServerAddress::Local { name: name.clone() },
            Listener::SharedMemory { segment, .. } => ServerAddress::SharedMemory {
                key: segment.key().to_string(),
            },
        }
    }

    /// [`Self::address`] in its string form.
    pub fn name(&self) -> String {
        self.address().to_string()
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    /// Frames rendered so far; advanced by every render command.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Synchronization state of slave `process_index`.
    pub fn slave_state(&self, process_index: usize) -> Option<&SlaveSyncState> {
        process_index
            .checked_sub(1)
            .and_then(|i| self.slaves.get(i))
    }

    pub fn is_synced(&self, process_index: usize) -> bool {
        self.slave_state(process_index).is_some_and(|s| s.synced)
    }

    pub fn is_connected(&self) -> bool {
        self.links.is_some()
    }

    /// Wait until every slave of the roster has connected.
    pub async fn wait_for_clients(&mut self) -> Result<()> {
        if self.links.is_some() {
            return Ok(());
        }
        let n = self.roster.slave_count();
        let timeout = self.timeout;
        let links = match &self.listener {
            Listener::Tcp { listener, .. } => {
                let mut slots: Vec<Option<Transport>> = (0..n).map(|_| None).collect();
                for _ in 0..n {
                    let (stream, peer) = timeout
                        .run("waiting for clients", async {
                            listener
                                .accept()
                                .await
                                .map_err(|e| SyncError::connection("tcp listener", e))
                        })
                        .await?;
                    debug!("Accepted tcp connection from {}", peer);
                    let transport = Transport::tcp(stream, peer.to_string(), timeout);
                    Self::identify(transport, &mut slots).await?;
                }
                Links::Sockets(slots.into_iter().flatten().collect())
            }
            #[cfg(unix)]
            Listener::Local { listener, path, .. } => {
                let mut slots: Vec<Option<Transport>> = (0..n).map(|_| None).collect();
                for _ in 0..n {
                    let (stream, _) = timeout
                        .run("waiting for clients", async {
                            listener
                                .accept()
                                .await
                                .map_err(|e| SyncError::connection(path.display().to_string(), e))
                        })
                        .await?;
                    debug!("Accepted local connection on {}", path.display());
                    let transport = Transport::local(stream, path.display().to_string(), timeout);
                    Self::identify(transport, &mut slots).await?;
                }
                Links::Sockets(slots.into_iter().flatten().collect())
            }
            Listener::SharedMemory { segment, plan } => {
                Self::open_shared_memory_links(segment, plan, &self.roster, timeout).await?
            }
        };
        self.links = Some(links);
        for slave in &mut self.slaves {
            slave.synced = true;
        }
        info!("All {} slaves connected", n);
        Ok(())
    }

    /// Read a slave's handshake and file its transport under its index.
    async fn identify(mut transport: Transport, slots: &mut [Option<Transport>]) -> Result<()> {
        let index = read_i32(&mut transport).await?;
        let slot = usize::try_from(index)
            .ok()
            .and_then(|i| i.checked_sub(1))
            .filter(|i| *i < slots.len())
            .ok_or_else(|| {
                error!("Client sent invalid process index {}", index);
                SyncError::protocol(format!(
                    "client sent invalid process index {} (valid: 1..={})",
                    index,
                    slots.len()
                ))
            })?;
        if slots[slot].is_some() {
            return Err(SyncError::protocol(format!(
                "process index {} connected twice",
                index
            )));
        }
        debug!("Client with process index {} connected", index);
        transport.set_endpoint(format!("slave {}", index));
        slots[slot] = Some(transport);
        Ok(())
    }

    async fn open_shared_memory_links(
        segment: &Arc<SharedSegment>,
        plan: &SharedMemoryPlan,
        roster: &Roster,
        timeout: Timeout,
    ) -> Result<Links> {
        let mut writers: Vec<RingWriter> = Vec::with_capacity(plan.writer_regions());
        for region in 0..plan.writer_regions() {
            let writer = RingRegion::new(
                segment.clone(),
                plan.server_region_offset(region),
                plan.server_region_size(),
                plan.region_readers(region),
            )?
            .open_writer();
            writers.push(writer);
        }

        let mut inputs = Vec::with_capacity(roster.slave_count());
        let mut route = Vec::with_capacity(roster.slave_count());
        for p in roster.slave_indices() {
            let reader = RingRegion::new(
                segment.clone(),
                plan.client_region_offset(p),
                plan.client_region_size(),
                1,
            )?
            .open_reader(0)?;
            let stream = RingStream::new(Some(reader), None, WaitStrategy::default());
            inputs.push(Transport::ring(stream, format!("slave {}", p), timeout));
            route.push(plan.slot(p)?.writer_region);
        }

        for (region, writer) in writers.iter().enumerate() {
            for reader in 0..writer.readers() {
                if !writer.wait_for_reader_connection(reader, timeout).await {
                    error!("Client did not connect (region {}, reader {})", region, reader);
                    return Err(SyncError::Timeout {
                        operation: "waiting for clients",
                        after: timeout.duration().unwrap_or_default(),
                    });
                }
            }
        }

        let outputs = writers
            .into_iter()
            .enumerate()
            .map(|(region, writer)| {
                let stream = RingStream::new(None, Some(writer), WaitStrategy::default());
                Transport::ring(stream, format!("region {}", region), timeout)
            })
            .collect();

        Ok(Links::SharedMemory {
            outputs,
            route,
            inputs,
        })
    }

    fn links(&mut self) -> Result<&mut Links> {
        self.links
            .as_mut()
            .ok_or_else(|| SyncError::protocol("slaves are not connected yet"))
    }

    /// Write one command to every synced slave. A shared fan-out ring is
    /// written once no matter how many synced slaves read it.
    async fn send_cmd(&mut self, cmd: Command, blobs: &[&[u8]]) -> Result<()> {
        trace!("Sending {} command", cmd);
        let mut targets: Vec<usize> = Vec::with_capacity(self.slaves.len());
        {
            let links = self
                .links
                .as_ref()
                .ok_or_else(|| SyncError::protocol("slaves are not connected yet"))?;
            for (slave, state) in self.slaves.iter().enumerate() {
                if state.synced {
                    let output = links.output_index(slave);
                    if !targets.contains(&output) {
                        targets.push(output);
                    }
                }
            }
        }

        let links = self.links()?;
        for output in targets {
            let transport = links.output(output);
            transport.write_all(&[cmd.tag()]).await?;
            for blob in blobs {
                write_blob(transport, blob).await?;
            }
        }
        Ok(())
    }

    /// Serialized static application data, sent once after connecting.
    pub async fn send_cmd_init(&mut self, static_data: &[u8]) -> Result<()> {
        self.send_cmd(Command::Init, &[static_data]).await
    }

    /// Ask synced slaves for the state of the devices they own.
    pub async fn send_cmd_update_devices(&mut self) -> Result<()> {
        self.send_cmd(Command::UpdateDevices, &[]).await
    }

    pub async fn send_cmd_device(&mut self, device: &[u8]) -> Result<()> {
        self.send_cmd(Command::Device, &[device]).await
    }

    pub async fn send_cmd_wasdqe_state(&mut self, state: &WasdqeState) -> Result<()> {
        self.send_cmd(Command::WasdqeState, &[&state.encode()]).await
    }

    pub async fn send_cmd_observer(&mut self, observer: &[u8]) -> Result<()> {
        self.send_cmd(Command::Observer, &[observer]).await
    }

    /// Start a frame. Every decoupled slave that receives it is busy until
    /// its sync is collected.
    pub async fn send_cmd_render(&mut self, clip: ClipPlanes, dynamic_data: &[u8]) -> Result<()> {
        self.send_cmd(Command::Render, &[&clip.encode(), dynamic_data])
            .await?;
        self.frame += 1;
        let frame = self.frame;
        for slave in &mut self.slaves {
            if slave.synced {
                slave.last_sent_frame = frame;
                if slave.mode == SlaveMode::Decoupled {
                    slave.synced = false;
                }
            }
        }
        Ok(())
    }

    /// Tell every slave to quit, including decoupled slaves that are still
    /// busy. No acknowledgment is awaited.
    pub async fn send_cmd_quit(&mut self) -> Result<()> {
        for slave in &mut self.slaves {
            slave.synced = true;
        }
        self.send_cmd(Command::Quit, &[]).await?;
        self.flush().await
    }

    /// Push all queued commands to the slaves.
    pub async fn flush(&mut self) -> Result<()> {
        for transport in self.links()?.outputs_mut() {
            transport.flush().await?;
        }
        Ok(())
    }

    /// Collect the device replies to `send_cmd_update_devices`, one batch
    /// per synced slave, in process index order.
    pub async fn receive_reply_update_devices(&mut self) -> Result<Vec<SlaveBatch>> {
        self.flush().await?;
        let mut batches = Vec::new();
        for slave in 0..self.slaves.len() {
            if !self.slaves[slave].synced {
                continue;
            }
            let transport = self.links()?.input(slave);
            let batch = Self::read_reply(transport, slave).await?;
            batches.push(SlaveBatch {
                process_index: slave + 1,
                batch,
            });
        }
        Ok(batches)
    }

    /// Collect the syncs for the current frame.
    ///
    /// Blocks until every coupled slave has replied; decoupled slaves are
    /// only read if their reply is already waiting. Coupled batches come
    /// first in the result, each group in process index order.
    pub async fn receive_cmd_sync(&mut self) -> Result<Vec<SlaveBatch>> {
        self.flush().await?;
        let mut batches = Vec::new();

        // Synced at this point means coupled: decoupled flags were cleared
        // by the render command.
        for slave in 0..self.slaves.len() {
            if !self.slaves[slave].synced {
                continue;
            }
            let transport = self.links()?.input(slave);
            let batch = Self::read_reply(transport, slave).await?;
            self.acknowledge(slave);
            batches.push(SlaveBatch {
                process_index: slave + 1,
                batch,
            });
        }

        for slave in 0..self.slaves.len() {
            if self.slaves[slave].synced {
                continue;
            }
            let transport = self.links()?.input(slave);
            if !transport.has_pending_input() {
                continue;
            }
            let batch = Self::read_reply(transport, slave).await?;
            self.slaves[slave].synced = true;
            self.acknowledge(slave);
            batches.push(SlaveBatch {
                process_index: slave + 1,
                batch,
            });
        }

        Ok(batches)
    }

    fn acknowledge(&mut self, slave: usize) {
        let frame = self.frame;
        let state = &mut self.slaves[slave];
        state.last_synced_frame = state.last_sent_frame;
        if state.mode == SlaveMode::Decoupled && state.lag(frame) > 0 {
            trace!(
                "Decoupled slave {} synced frame {} ({} behind)",
                slave + 1,
                state.last_synced_frame,
                state.lag(frame)
            );
        }
    }

    async fn read_reply(transport: &mut Transport, slave: usize) -> Result<RecordBatch> {
        RecordBatch::read_from(transport).await.map_err(|e| {
            error!("Slave {} failed to reply: {}", slave + 1, e);
            e
        })
    }
}

impl Drop for SyncServer {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Listener::Local { path, .. } = &self.listener {
            if let Err(e) = std::fs::remove_file(path) {
                warn!("Failed to remove local socket {}: {}", path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::framing::write_i32;
    use tokio::net::TcpStream;

    fn roster(modes: &[SlaveMode]) -> Roster {
        Roster::new(modes.to_vec())
    }

    async fn connect_raw(server: &SyncServer) -> Transport {
        let port = match server.address() {
            ServerAddress::Tcp { port, .. } => port,
            other => panic!("not a tcp server: {}", other),
        };
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        Transport::tcp(stream, "master", Timeout::from_millis(2000))
    }

    #[tokio::test]
    async fn test_tcp_name_uses_host_name_for_any_address() {
        let server = SyncServer::start_tcp(None, roster(&[SlaveMode::Coupled]), Timeout::INFINITE)
            .await
            .unwrap();
        let name = server.name();
        assert!(name.starts_with(&format!("tcp,{},", platform::host_name())));

        let bound = SyncServer::start_tcp(Some("127.0.0.1"), roster(&[]), Timeout::INFINITE)
            .await
            .unwrap();
        assert!(bound.name().starts_with("tcp,127.0.0.1,"));
    }

    #[tokio::test]
    async fn test_invalid_bind_address() {
        let err = SyncServer::start_tcp(Some("not-an-ip"), roster(&[]), Timeout::INFINITE)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidAddress(_)));
    }

    #[tokio::test]
    async fn test_commands_before_clients_connect_fail() {
        let mut server =
            SyncServer::start_tcp(Some("127.0.0.1"), roster(&[SlaveMode::Coupled]), Timeout::INFINITE)
                .await
                .unwrap();
        assert!(!server.is_connected());
        assert!(matches!(
            server.send_cmd_update_devices().await,
            Err(SyncError::Protocol { .. })
        ));
    }

    #[tokio::test]
    async fn test_handshake_with_invalid_index_is_rejected() {
        let mut server = SyncServer::start_tcp(
            Some("127.0.0.1"),
            roster(&[SlaveMode::Coupled, SlaveMode::Coupled]),
            Timeout::from_millis(2000),
        )
        .await
        .unwrap();
        let mut slave = connect_raw(&server).await;
        write_i32(&mut slave, 3).await.unwrap();
        slave.flush().await.unwrap();

        let err = server.wait_for_clients().await.unwrap_err();
        assert!(matches!(err, SyncError::Protocol { .. }));
    }

    #[tokio::test]
    async fn test_slaves_are_stored_by_announced_index() {
        let mut server = SyncServer::start_tcp(
            Some("127.0.0.1"),
            roster(&[SlaveMode::Coupled, SlaveMode::Coupled]),
            Timeout::from_millis(2000),
        )
        .await
        .unwrap();

        // Connect in reverse order.
        let mut second = connect_raw(&server).await;
        write_i32(&mut second, 2).await.unwrap();
        second.flush().await.unwrap();
        let mut first = connect_raw(&server).await;
        write_i32(&mut first, 1).await.unwrap();
        first.flush().await.unwrap();

        server.wait_for_clients().await.unwrap();

        RecordBatch::new(1, b"from-2".to_vec())
            .write_to(&mut second)
            .await
            .unwrap();
        second.flush().await.unwrap();
        RecordBatch::new(1, b"from-1".to_vec())
            .write_to(&mut first)
            .await
            .unwrap();
        first.flush().await.unwrap();

        let replies = server.receive_reply_update_devices().await.unwrap();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].process_index, 1);
        assert_eq!(replies[0].batch.payload, b"from-1");
        assert_eq!(replies[1].process_index, 2);
    }

    #[tokio::test]
    async fn test_clients_that_never_connect_time_out() {
        let mut server = SyncServer::start_tcp(
            Some("127.0.0.1"),
            roster(&[SlaveMode::Coupled]),
            Timeout::from_millis(50),
        )
        .await
        .unwrap();
        let err = server.wait_for_clients().await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_shared_memory_needs_slaves() {
        assert!(matches!(
            SyncServer::start_shared_memory(roster(&[]), Timeout::INFINITE),
            Err(SyncError::Config { .. })
        ));
    }

    #[test]
    fn test_lag() {
        let state = SlaveSyncState {
            mode: SlaveMode::Decoupled,
            synced: false,
            last_sent_frame: 5,
            last_synced_frame: 3,
        };
        assert_eq!(state.lag(6), 3);
        assert_eq!(state.lag(2), 0);
    }
}
