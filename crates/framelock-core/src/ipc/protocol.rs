//! Command vocabulary and message bodies of the frame-sync protocol.
//!
//! Master to slave, every command is one ASCII tag byte followed by the
//! blobs that command defines:
//!
//! ```text
//! 'i' Init           [blob: static data]
//! 'u' UpdateDevices  (no body)
//! 'd' Device         [blob: device record]
//! 'w' WasdqeState    [blob: i32 LE process, i32 LE window, u8 initialized]
//! 'o' Observer       [blob: observer record]
//! 'r' Render         [blob: f32 LE near, f32 LE far][blob: dynamic data]
//! 'q' Quit           (no body)
//! ```
//!
//! Slave to master, replies are untagged: `[i32 LE: count][blob: records]`.
//! The records inside the blob are opaque at this layer.

use super::framing::{read_blob, read_fixed_blob, read_i32, write_blob, write_i32};
use super::transport::Transport;
use crate::{Result, SyncError};

/// A master to slave command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Init,
    UpdateDevices,
    Device,
    WasdqeState,
    Observer,
    Render,
    Quit,
}

impl Command {
    pub const ALL: [Command; 7] = [
        Command::Init,
        Command::UpdateDevices,
        Command::Device,
        Command::WasdqeState,
        Command::Observer,
        Command::Render,
        Command::Quit,
    ];

    /// Wire tag byte.
    pub fn tag(&self) -> u8 {
        match self {
            Command::Init => b'i',
            Command::UpdateDevices => b'u',
            Command::Device => b'd',
            Command::WasdqeState => b'w',
            Command::Observer => b'o',
            Command::Render => b'r',
            Command::Quit => b'q',
        }
    }

    /// Decode a tag byte. An unknown tag is a protocol violation.
    pub fn from_tag(tag: u8) -> Result<Self> {
        Command::ALL
            .into_iter()
            .find(|c| c.tag() == tag)
            .ok_or_else(|| SyncError::protocol(format!("unknown command tag 0x{:02x}", tag)))
    }

    /// Number of argument blobs following the tag.
    pub fn arg_blobs(&self) -> usize {
        match self {
            Command::UpdateDevices | Command::Quit => 0,
            Command::Render => 2,
            _ => 1,
        }
    }

    /// Whether the slave must answer this command with a reply.
    pub fn expects_reply(&self) -> bool {
        matches!(self, Command::UpdateDevices | Command::Render)
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::Init => "init",
            Command::UpdateDevices => "update-devices",
            Command::Device => "device",
            Command::WasdqeState => "wasdqe-state",
            Command::Observer => "observer",
            Command::Render => "render",
            Command::Quit => "quit",
        };
        f.write_str(name)
    }
}

/// Which process and window currently own the mouse for WASDQE navigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WasdqeState {
    pub mouse_process: i32,
    pub mouse_window: i32,
    pub initialized: bool,
}

impl WasdqeState {
    pub const ENCODED_LEN: usize = 9;

    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[0..4].copy_from_slice(&self.mouse_process.to_le_bytes());
        out[4..8].copy_from_slice(&self.mouse_window.to_le_bytes());
        out[8] = u8::from(self.initialized);
        out
    }

    pub fn decode(bytes: &[u8; Self::ENCODED_LEN]) -> Self {
        let mut word = [0u8; 4];
        word.copy_from_slice(&bytes[0..4]);
        let mouse_process = i32::from_le_bytes(word);
        word.copy_from_slice(&bytes[4..8]);
        let mouse_window = i32::from_le_bytes(word);
        Self {
            mouse_process,
            mouse_window,
            initialized: bytes[8] != 0,
        }
    }
}

/// Near and far clipping distances sent with every render command.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ClipPlanes {
    pub near: f32,
    pub far: f32,
}

impl ClipPlanes {
    pub const ENCODED_LEN: usize = 8;

    pub fn new(near: f32, far: f32) -> Self {
        Self { near, far }
    }

    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[0..4].copy_from_slice(&self.near.to_le_bytes());
        out[4..8].copy_from_slice(&self.far.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8; Self::ENCODED_LEN]) -> Self {
        let mut word = [0u8; 4];
        word.copy_from_slice(&bytes[0..4]);
        let near = f32::from_le_bytes(word);
        word.copy_from_slice(&bytes[4..8]);
        let far = f32::from_le_bytes(word);
        Self { near, far }
    }
}

/// Arguments of a render command.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RenderArgs {
    pub clip: ClipPlanes,
    pub dynamic_data: Vec<u8>,
}

/// A counted batch of opaque records: device records in an update-devices
/// reply, input events in a sync reply.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RecordBatch {
    pub count: i32,
    pub payload: Vec<u8>,
}

impl RecordBatch {
    pub fn new(count: i32, payload: Vec<u8>) -> Self {
        Self { count, payload }
    }

    /// A batch with no records; still a valid, required reply.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub async fn write_to(&self, transport: &mut Transport) -> Result<()> {
        write_i32(transport, self.count).await?;
        write_blob(transport, &self.payload).await
    }

    pub async fn read_from(transport: &mut Transport) -> Result<Self> {
        let count = read_i32(transport).await?;
        if count < 0 {
            return Err(SyncError::protocol(format!(
                "negative record count {} from {}",
                count,
                transport.endpoint()
            )));
        }
        let payload = read_blob(transport).await?;
        Ok(Self { count, payload })
    }
}

/// A reply batch together with the slave it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaveBatch {
    pub process_index: usize,
    pub batch: RecordBatch,
}

/// Read the body of a render command.
pub(crate) async fn read_render_args(transport: &mut Transport) -> Result<RenderArgs> {
    let clip = ClipPlanes::decode(&read_fixed_blob::<{ ClipPlanes::ENCODED_LEN }>(transport).await?);
    let dynamic_data = read_blob(transport).await?;
    Ok(RenderArgs { clip, dynamic_data })
}

/// Read the body of a wasdqe-state command.
pub(crate) async fn read_wasdqe_state(transport: &mut Transport) -> Result<WasdqeState> {
    let bytes = read_fixed_blob::<{ WasdqeState::ENCODED_LEN }>(transport).await?;
    Ok(WasdqeState::decode(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_tags() {
        let tags: Vec<u8> = Command::ALL.iter().map(Command::tag).collect();
        assert_eq!(tags, b"iudworq".to_vec());
        for cmd in Command::ALL {
            assert_eq!(Command::from_tag(cmd.tag()).unwrap(), cmd);
        }
    }

    #[test]
    fn test_unknown_tag_is_protocol_error() {
        assert!(matches!(
            Command::from_tag(b'x'),
            Err(SyncError::Protocol { .. })
        ));
        assert!(Command::from_tag(0).is_err());
    }

    #[test]
    fn test_reply_expectations() {
        assert!(Command::Render.expects_reply());
        assert!(Command::UpdateDevices.expects_reply());
        assert!(!Command::Quit.expects_reply());
        assert_eq!(Command::Render.arg_blobs(), 2);
        assert_eq!(Command::Quit.arg_blobs(), 0);
    }

    #[test]
    fn test_wasdqe_layout() {
        let state = WasdqeState {
            mouse_process: 2,
            mouse_window: -1,
            initialized: true,
        };
        let bytes = state.encode();
        assert_eq!(bytes, [2, 0, 0, 0, 0xff, 0xff, 0xff, 0xff, 1]);
        assert_eq!(WasdqeState::decode(&bytes), state);
    }

    #[test]
    fn test_clip_planes_layout() {
        let clip = ClipPlanes::new(0.5, 100.0);
        let bytes = clip.encode();
        assert_eq!(&bytes[0..4], &0.5f32.to_le_bytes());
        assert_eq!(ClipPlanes::decode(&bytes), clip);
    }
}
