//! Master and slave control loops on top of the protocol engines.
//!
//! A session object is created once per process and owns everything the
//! frame loop needs: the roster, the server or client, the launched slave
//! processes and the queue of events collected from slaves.
//!
//! # Frame cycle (master)
//!
//! 1. Optionally refresh devices owned by slaves ([`MasterSession::update_devices`]).
//! 2. Broadcast device, navigation and observer state, then `Render`.
//! 3. Render locally.
//! 4. Collect syncs; their events are appended to the event queue.

use crate::config::{IpcKind, SessionConfig, Timeout};
use crate::ipc::{
    ClipPlanes, Command, RecordBatch, RenderArgs, ServerAddress, SlaveBatch, SyncClient,
    SyncServer, WasdqeState,
};
use crate::launch::{LaunchOptions, SlaveProcess};
use crate::roster::Roster;
use crate::{Result, SyncError};
use std::collections::VecDeque;
use std::future::Future;
use tracing::{debug, info, trace, warn};

/// Everything the master replicates to its slaves for one frame.
#[derive(Debug, Clone, Default)]
pub struct FrameState {
    /// Serialized device records, one blob each.
    pub devices: Vec<Vec<u8>>,
    pub wasdqe: Option<WasdqeState>,
    /// Serialized observer records, one blob each.
    pub observers: Vec<Vec<u8>>,
    pub clip: ClipPlanes,
    /// Serialized dynamic application data.
    pub dynamic_data: Vec<u8>,
}

/// Outcome of one master frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameReport {
    pub frame: u64,
    /// Slaves whose sync was collected this frame.
    pub synced: Vec<usize>,
    /// Decoupled slaves still busy with an earlier frame.
    pub lagging: Vec<usize>,
    /// Event records appended to the event queue.
    pub events: usize,
}

/// The master's side of a session.
#[derive(Debug)]
pub struct MasterSession {
    config: SessionConfig,
    roster: Roster,
    server: Option<SyncServer>,
    slaves: Vec<SlaveProcess>,
    events: VecDeque<SlaveBatch>,
}

impl MasterSession {
    /// Start the server chosen by the configuration. A session without
    /// slaves runs without a server.
    pub async fn start(config: SessionConfig) -> Result<Self> {
        config.validate()?;
        let roster = Roster::from_config(&config);
        let timeout = config.timeout_ms;

        let server = if roster.slave_count() == 0 {
            info!("No slave processes configured");
            None
        } else {
            let server = match config.resolved_ipc() {
                IpcKind::Tcp => {
                    let bind = config.processes[0].address.as_deref();
                    SyncServer::start_tcp(bind, roster.clone(), timeout).await?
                }
                IpcKind::Local => SyncServer::start_local(roster.clone(), timeout).await?,
                IpcKind::SharedMemory | IpcKind::Automatic => {
                    SyncServer::start_shared_memory(roster.clone(), timeout)?
                }
            };
            Some(server)
        };

        Ok(Self {
            config,
            roster,
            server,
            slaves: Vec::new(),
            events: VecDeque::new(),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn server(&self) -> Option<&SyncServer> {
        self.server.as_ref()
    }

    /// Address string slaves must be started with.
    pub fn server_name(&self) -> Option<String> {
        self.server.as_ref().map(SyncServer::name)
    }

    pub fn timeout(&self) -> Timeout {
        self.config.timeout_ms
    }

    /// Start every slave process of the configuration.
    pub fn launch_slaves(&mut self, options: &LaunchOptions) -> Result<()> {
        for (index, process) in self.config.processes.iter().enumerate().skip(1) {
            let slave = SlaveProcess::launch(options, index, process)?;
            self.slaves.push(slave);
        }
        Ok(())
    }

    /// Wait for all slaves, then send them the static application data.
    pub async fn connect_slaves(&mut self, static_data: &[u8]) -> Result<()> {
        let Some(server) = self.server.as_mut() else {
            return Ok(());
        };
        info!("Waiting for child processes to connect to main");
        server.wait_for_clients().await?;
        info!(
            "Initializing child processes with {} bytes of static application data",
            static_data.len()
        );
        server.send_cmd_init(static_data).await?;
        server.flush().await
    }

    /// Ask slaves for the devices they own and return their replies.
    pub async fn update_devices(&mut self) -> Result<Vec<SlaveBatch>> {
        let Some(server) = self.server.as_mut() else {
            return Ok(Vec::new());
        };
        server.send_cmd_update_devices().await?;
        server.receive_reply_update_devices().await
    }

    /// Broadcast a frame's state and the render command.
    pub async fn begin_frame(&mut self, state: &FrameState) -> Result<()> {
        let Some(server) = self.server.as_mut() else {
            return Ok(());
        };
        for device in &state.devices {
            server.send_cmd_device(device).await?;
        }
        if let Some(wasdqe) = &state.wasdqe {
            server.send_cmd_wasdqe_state(wasdqe).await?;
        }
        for observer in &state.observers {
            server.send_cmd_observer(observer).await?;
        }
        server.send_cmd_render(state.clip, &state.dynamic_data).await?;
        server.flush().await
    }

    /// Collect this frame's syncs and queue the events they carry.
    pub async fn end_frame(&mut self) -> Result<FrameReport> {
        let Some(server) = self.server.as_mut() else {
            return Ok(FrameReport {
                frame: 0,
                synced: Vec::new(),
                lagging: Vec::new(),
                events: 0,
            });
        };
        let batches = server.receive_cmd_sync().await?;
        let synced = batches.iter().map(|b| b.process_index).collect();
        let lagging = self
            .roster
            .slave_indices()
            .filter(|p| !server.is_synced(*p))
            .collect();
        let mut events = 0;
        for batch in batches {
            events += batch.batch.count as usize;
            if !batch.batch.is_empty() {
                self.events.push_back(batch);
            }
        }
        let report = FrameReport {
            frame: server.frame(),
            synced,
            lagging,
            events,
        };
        trace!("Frame {} done: {:?}", report.frame, report);
        Ok(report)
    }

    /// Run one full frame, rendering locally with `render` between the
    /// broadcast and the sync.
    pub async fn run_frame<F>(&mut self, state: &FrameState, render: F) -> Result<FrameReport>
    where
        F: Future<Output = Result<()>>,
    {
        self.begin_frame(state).await?;
        render.await?;
        self.end_frame().await
    }

    /// Next queued event batch, in arrival order.
    pub fn next_event(&mut self) -> Option<SlaveBatch> {
        self.events.pop_front()
    }

    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    /// Tell all slaves to quit and wait for launched ones to exit.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(server) = self.server.as_mut() {
            info!("Sending quit to all slaves");
            server.send_cmd_quit().await?;
        }
        let timeout = self.config.timeout_ms;
        let mut first_error = None;
        for slave in &mut self.slaves {
            if let Err(e) = slave.wait_for_exit(timeout).await {
                warn!("Slave {} did not exit cleanly: {}", slave.id(), e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Application callbacks of a slave process.
///
/// Only `init` and `render` must be provided. `update_devices` returns the
/// devices this slave owns; `render` returns the input events gathered
/// since the previous frame, which may be an empty batch.
#[async_trait::async_trait]
pub trait SlaveHandler: Send {
    async fn init(&mut self, static_data: Vec<u8>) -> Result<()>;

    async fn update_devices(&mut self) -> Result<RecordBatch> {
        Ok(RecordBatch::empty())
    }

    async fn device(&mut self, _device: Vec<u8>) -> Result<()> {
        Ok(())
    }

    async fn wasdqe_state(&mut self, _state: WasdqeState) -> Result<()> {
        Ok(())
    }

    async fn observer(&mut self, _observer: Vec<u8>) -> Result<()> {
        Ok(())
    }

    async fn render(&mut self, args: RenderArgs) -> Result<RecordBatch>;

    async fn quit(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Result of a call to [`SlaveSession::process_commands`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaveStatus {
    /// A frame was rendered, or nothing was waiting.
    Idle,
    /// The master said quit; the session is closed.
    Quit,
}

/// A slave's side of a session.
#[derive(Debug)]
pub struct SlaveSession<H> {
    client: SyncClient,
    handler: H,
    frames: u64,
}

impl<H: SlaveHandler> SlaveSession<H> {
    /// Connect to the master and run the handler's `init` with the static
    /// data the master sends first.
    pub async fn connect(
        address: &ServerAddress,
        roster: &Roster,
        process_index: usize,
        timeout: Timeout,
        mut handler: H,
    ) -> Result<Self> {
        info!("Child process {} connecting to main", process_index);
        let mut client = SyncClient::start(address, roster, process_index, timeout).await?;
        info!("Child process {} waiting for init command from main", process_index);
        match client.receive_cmd(true).await? {
            Some(Command::Init) => {}
            other => {
                return Err(SyncError::protocol(format!(
                    "expected init command from main, got {:?}",
                    other
                )));
            }
        }
        let static_data = client.receive_init_args().await?;
        handler.init(static_data).await?;
        debug!("Child process {} initialized", process_index);
        Ok(Self {
            client,
            handler,
            frames: 0,
        })
    }

    pub fn process_index(&self) -> usize {
        self.client.process_index()
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Frames rendered so far.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Handle commands until one frame has been rendered and synced, or
    /// until quit. With `wait == false` returns `Idle` as soon as no
    /// command is waiting.
    pub async fn process_commands(&mut self, wait: bool) -> Result<SlaveStatus> {
        loop {
            let Some(cmd) = self.client.receive_cmd(wait).await? else {
                return Ok(SlaveStatus::Idle);
            };
            trace!("Child process {} got {} command", self.process_index(), cmd);
            match cmd {
                Command::Init => {
                    let data = self.client.receive_init_args().await?;
                    self.handler.init(data).await?;
                }
                Command::UpdateDevices => {
                    let devices = self.handler.update_devices().await?;
                    self.client.send_reply_update_devices(&devices).await?;
                }
                Command::Device => {
                    let device = self.client.receive_device_args().await?;
                    self.handler.device(device).await?;
                }
                Command::WasdqeState => {
                    let state = self.client.receive_wasdqe_state_args().await?;
                    self.handler.wasdqe_state(state).await?;
                }
                Command::Observer => {
                    let observer = self.client.receive_observer_args().await?;
                    self.handler.observer(observer).await?;
                }
                Command::Render => {
                    let args = self.client.receive_render_args().await?;
                    let events = self.handler.render(args).await?;
                    self.client.send_sync(&events).await?;
                    self.frames += 1;
                    return Ok(SlaveStatus::Idle);
                }
                Command::Quit => {
                    self.handler.quit().await?;
                    self.client.close().await?;
                    return Ok(SlaveStatus::Quit);
                }
            }
        }
    }

    /// Process commands until the master says quit; returns the handler.
    pub async fn run(mut self) -> Result<H> {
        while self.process_commands(true).await? == SlaveStatus::Idle {}
        info!(
            "Child process {} quitting after {} frames",
            self.process_index(),
            self.frames
        );
        Ok(self.handler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcessConfig;

    struct Counter {
        frames: u32,
    }

    #[async_trait::async_trait]
    impl SlaveHandler for Counter {
        async fn init(&mut self, _static_data: Vec<u8>) -> Result<()> {
            Ok(())
        }

        async fn render(&mut self, _args: RenderArgs) -> Result<RecordBatch> {
            self.frames += 1;
            Ok(RecordBatch::empty())
        }
    }

    #[tokio::test]
    async fn test_master_without_slaves() {
        let mut master = MasterSession::start(SessionConfig::default()).await.unwrap();
        assert!(master.server_name().is_none());
        master.connect_slaves(b"static").await.unwrap();
        assert!(master.update_devices().await.unwrap().is_empty());

        let mut rendered = false;
        let report = master
            .run_frame(&FrameState::default(), async {
                rendered = true;
                Ok(())
            })
            .await
            .unwrap();
        assert!(rendered);
        assert!(report.synced.is_empty());
        master.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_session_round_trip() {
        let config = SessionConfig {
            timeout_ms: Timeout::from_millis(5000),
            ipc: IpcKind::Tcp,
            processes: vec![
                ProcessConfig::new("master").with_address("127.0.0.1"),
                ProcessConfig::new("slave").with_launcher("manual"),
            ],
        };
        let mut master = MasterSession::start(config.clone()).await.unwrap();
        let address: ServerAddress = master.server_name().unwrap().parse().unwrap();
        let roster = master.roster().clone();

        let slave = tokio::spawn(async move {
            let session = SlaveSession::connect(
                &address,
                &roster,
                1,
                Timeout::from_millis(5000),
                Counter { frames: 0 },
            )
            .await
            .unwrap();
            session.run().await.unwrap()
        });

        master.connect_slaves(b"scene").await.unwrap();
        for _ in 0..3 {
            let report = master
                .run_frame(&FrameState::default(), async { Ok(()) })
                .await
                .unwrap();
            assert_eq!(report.synced, vec![1]);
        }
        master.shutdown().await.unwrap();
        assert_eq!(slave.await.unwrap().frames, 3);
    }
}
