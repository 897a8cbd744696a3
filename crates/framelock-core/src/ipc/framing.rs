//! Length-prefixed blob framing.
//!
//! Every command argument and reply travels as a blob:
//!
//! ```text
//! [i32 LE: len][payload bytes of len]
//! ```
//!
//! Counts and the socket handshake are sent as bare little-endian `i32`s.
//! The format is identical on every transport.

use super::transport::Transport;
use crate::config::IpcConfig;
use crate::{Result, SyncError};

/// Size prefix for a payload of `len` bytes.
fn size_prefix(len: usize) -> Result<i32> {
    if len > IpcConfig::MAX_BLOB_SIZE {
        return Err(SyncError::protocol(format!(
            "blob of {} bytes exceeds maximum {}",
            len,
            IpcConfig::MAX_BLOB_SIZE
        )));
    }
    Ok(len as i32)
}

/// Write a length-prefixed blob. Does not flush.
pub async fn write_blob(transport: &mut Transport, payload: &[u8]) -> Result<()> {
    let prefix = size_prefix(payload.len())?;
    write_i32(transport, prefix).await?;
    transport.write_all(payload).await
}

/// Read a length-prefixed blob.
pub async fn read_blob(transport: &mut Transport) -> Result<Vec<u8>> {
    let len = read_i32(transport).await?;
    let len = usize::try_from(len).map_err(|_| {
        SyncError::protocol(format!(
            "invalid blob size {} from {}",
            len,
            transport.endpoint()
        ))
    })?;
    transport.read_exact(len).await
}

/// Read a blob that must have exactly `N` bytes.
pub async fn read_fixed_blob<const N: usize>(transport: &mut Transport) -> Result<[u8; N]> {
    let blob = read_blob(transport).await?;
    <[u8; N]>::try_from(blob.as_slice()).map_err(|_| {
        SyncError::protocol(format!(
            "expected a {} byte blob from {}, got {} bytes",
            N,
            transport.endpoint(),
            blob.len()
        ))
    })
}

pub async fn write_i32(transport: &mut Transport, value: i32) -> Result<()> {
    transport.write_all(&value.to_le_bytes()).await
}

pub async fn read_i32(transport: &mut Transport) -> Result<i32> {
    let mut buf = [0u8; 4];
    transport.read_into(&mut buf).await?;
    Ok(i32::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Timeout;
    use tokio::net::{TcpListener, TcpStream};

    async fn pair() -> (Transport, Transport) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let timeout = Timeout::from_millis(1000);
        (
            Transport::tcp(client.unwrap(), "server", timeout),
            Transport::tcp(server.unwrap().0, "client", timeout),
        )
    }

    #[tokio::test]
    async fn test_blob_wire_format() {
        let (mut a, mut b) = pair().await;
        write_blob(&mut a, b"abc").await.unwrap();
        a.flush().await.unwrap();
        assert_eq!(b.read_exact(7).await.unwrap(), vec![3, 0, 0, 0, b'a', b'b', b'c']);
    }

    #[tokio::test]
    async fn test_empty_blob() {
        let (mut a, mut b) = pair().await;
        write_blob(&mut a, &[]).await.unwrap();
        write_i32(&mut a, -7).await.unwrap();
        a.flush().await.unwrap();
        assert!(read_blob(&mut b).await.unwrap().is_empty());
        assert_eq!(read_i32(&mut b).await.unwrap(), -7);
    }

    #[tokio::test]
    async fn test_negative_size_is_protocol_error() {
        let (mut a, mut b) = pair().await;
        write_i32(&mut a, -1).await.unwrap();
        a.flush().await.unwrap();
        assert!(matches!(
            read_blob(&mut b).await,
            Err(SyncError::Protocol { .. })
        ));
    }

    #[test]
    fn test_size_prefix_covers_i32_range() {
        assert_eq!(size_prefix(0).unwrap(), 0);
        assert_eq!(size_prefix(300 * 1024 * 1024).unwrap(), 300 * 1024 * 1024);
        assert_eq!(size_prefix(i32::MAX as usize).unwrap(), i32::MAX);
        assert!(matches!(
            size_prefix(i32::MAX as usize + 1),
            Err(SyncError::Protocol { .. })
        ));
    }

    #[tokio::test]
    async fn test_fixed_blob_size_mismatch() {
        let (mut a, mut b) = pair().await;
        write_blob(&mut a, &[0u8; 7]).await.unwrap();
        write_blob(&mut a, &[5u8; 8]).await.unwrap();
        a.flush().await.unwrap();
        assert!(read_fixed_blob::<8>(&mut b).await.is_err());
        assert_eq!(read_fixed_blob::<8>(&mut b).await.unwrap(), [5u8; 8]);
    }
}
