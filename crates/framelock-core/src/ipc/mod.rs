//! Frame-sync IPC between the master and its slave processes.
//!
//! # Architecture
//!
//! - **Ring**: single-writer / multi-reader byte ring in shared memory
//! - **Transport**: one buffered byte stream over TCP, local sockets or rings
//! - **Framing**: length-prefixed blobs, identical on every transport
//! - **Protocol**: the command vocabulary and message bodies
//! - **Server**: master side; broadcasts commands and collects syncs
//! - **Client**: slave side; receives commands and replies

pub mod address;
pub mod client;
pub mod framing;
pub mod protocol;
pub mod ring;
pub mod server;
pub mod transport;
pub mod wait;

pub use address::ServerAddress;
pub use client::{ClientState, SyncClient};
pub use protocol::{ClipPlanes, Command, RecordBatch, RenderArgs, SlaveBatch, WasdqeState};
pub use ring::{RingReader, RingRegion, RingStream, RingWriter};
pub use server::{SlaveSyncState, SyncServer};
pub use transport::{Link, LinkKind, Transport};
pub use wait::WaitStrategy;
