//! Framelock Core - frame synchronization between a master and its slave
//! render processes.
//!
//! One master process and any number of slave processes render the same
//! scene in lock-step. Once per frame the master replicates device, observer
//! and application state to every slave and collects the slaves' input
//! events together with an acknowledgment that they have caught up. The same
//! protocol runs over TCP, local sockets, or a shared memory ring buffer.
//!
//! Slaves are either *coupled* (acknowledge every frame before the master
//! continues) or *decoupled* (may lag behind by whole frames without
//! stalling the master).
//!
//! # Example
//!
//! ```rust,ignore
//! use framelock_core::{FrameState, MasterSession, SessionConfig};
//!
//! #[tokio::main]
//! async fn main() -> framelock_core::Result<()> {
//!     let config = SessionConfig::load("session.json")?;
//!     let mut master = MasterSession::start(config).await?;
//!     master.connect_slaves(b"static scene").await?;
//!
//!     let frame = FrameState::default();
//!     master.run_frame(&frame, async { Ok(()) }).await?;
//!     while let Some(events) = master.next_event() {
//!         println!("{} events from slave {}", events.batch.count, events.process_index);
//!     }
//!
//!     master.shutdown().await
//! }
//! ```

pub mod config;
pub mod error;
pub mod ipc;
pub mod launch;
pub mod platform;
pub mod roster;
pub mod session;

// Re-export commonly used types
pub use config::{IpcConfig, IpcKind, LogLevel, ProcessConfig, SessionConfig, Timeout};
pub use error::{Result, SyncError};
pub use ipc::{
    ClipPlanes, Command, RecordBatch, RenderArgs, ServerAddress, SlaveBatch, SyncClient,
    SyncServer, WaitStrategy, WasdqeState,
};
pub use launch::{LaunchOptions, SlaveCommand, SlaveProcess};
pub use roster::{Roster, SharedMemoryPlan, SlaveMode};
pub use session::{FrameReport, FrameState, MasterSession, SlaveHandler, SlaveSession, SlaveStatus};
