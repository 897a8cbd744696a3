//! Single-writer / multi-reader byte ring on top of shared memory.
//!
//! A ring region is laid out as:
//!
//! ```text
//! [reader_connected: u8 x R, padded to 4][write_cursor: i32][read_cursor: i32 x R][data: u8 x S]
//! ```
//!
//! The writer only advances `write_cursor`; reader `i` only advances
//! `read_cursor[i]`. One data byte always stays unused so that equal cursors
//! mean "empty" and never "full". With those two rules the cursor arithmetic
//! needs no lock: the writer publishes data with a release store of its
//! cursor, readers acquire it before copying, and readers release their own
//! cursor only after the copy so the writer never overwrites bytes still
//! being read.
//!
//! Each reader sees the full byte stream independently, which is what lets
//! one ring fan a command stream out to every coupled slave at once.

#![allow(unsafe_code)]

use super::wait::{poll_until, Backoff, WaitStrategy};
use crate::config::{IpcConfig, Timeout};
use crate::platform::SharedSegment;
use crate::{Result, SyncError};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

const CURSOR_ALIGN: usize = std::mem::align_of::<AtomicI32>();

/// A ring laid over a byte range of a shared segment, not yet opened.
#[derive(Debug, Clone)]
pub struct RingRegion {
    segment: Arc<SharedSegment>,
    offset: usize,
    readers: usize,
    data_len: usize,
}

impl RingRegion {
    /// Bytes taken by the control header for `readers` readers.
    pub fn header_len(readers: usize) -> usize {
        readers.next_multiple_of(CURSOR_ALIGN) + CURSOR_ALIGN * (1 + readers)
    }

    /// View `region_len` bytes at `offset` of `segment` as a ring with
    /// `readers` readers.
    pub fn new(
        segment: Arc<SharedSegment>,
        offset: usize,
        region_len: usize,
        readers: usize,
    ) -> Result<Self> {
        if readers == 0 {
            return Err(ring_error("a ring needs at least one reader"));
        }
        if offset % CURSOR_ALIGN != 0 {
            return Err(ring_error(format!(
                "region offset {} is not {}-byte aligned",
                offset, CURSOR_ALIGN
            )));
        }
        let end = offset
            .checked_add(region_len)
            .filter(|end| *end <= segment.len())
            .ok_or_else(|| {
                ring_error(format!(
                    "region {}..{} exceeds segment of {} bytes",
                    offset,
                    offset.saturating_add(region_len),
                    segment.len()
                ))
            })?;
        let header = Self::header_len(readers);
        // One byte is always kept free, so two are needed to move any data.
        if region_len < header + 2 {
            return Err(ring_error(format!(
                "region of {} bytes is too small for {} readers",
                region_len, readers
            )));
        }
        let data_len = region_len - header;
        if data_len > i32::MAX as usize {
            return Err(ring_error(format!("region {}..{} is too large", offset, end)));
        }
        Ok(Self {
            segment,
            offset,
            readers,
            data_len,
        })
    }

    pub fn readers(&self) -> usize {
        self.readers
    }

    /// Usable data bytes `S`; at most `S - 1` can be in flight.
    pub fn data_len(&self) -> usize {
        self.data_len
    }

    /// Become the single writer of this ring. Resets the write cursor.
    pub fn open_writer(self) -> RingWriter {
        self.write_cursor().store(0, Ordering::Release);
        RingWriter { region: self }
    }

    /// Become reader `index` of this ring. Resets that reader's cursor and
    /// then announces the connection.
    pub fn open_reader(self, index: usize) -> Result<RingReader> {
        if index >= self.readers {
            return Err(ring_error(format!(
                "reader index {} out of range for {} readers",
                index, self.readers
            )));
        }
        // Reset the cursor first so the writer never sees a stale one connected.
        self.read_cursor(index).store(0, Ordering::Release);
        self.connected_flag(index).store(1, Ordering::Release);
        Ok(RingReader {
            region: self,
            index,
        })
    }

    fn base(&self) -> *mut u8 {
        // SAFETY: `new` checked that offset + region_len is within the segment.
        unsafe { self.segment.as_ptr().add(self.offset) }
    }

    fn connected_flag(&self, reader: usize) -> &AtomicU8 {
        debug_assert!(reader < self.readers);
        // SAFETY: the flag bytes are the first `readers` bytes of the region;
        // AtomicU8 has alignment 1 and the memory lives as long as `segment`.
        unsafe { &*(self.base().add(reader) as *const AtomicU8) }
    }

    fn write_cursor(&self) -> &AtomicI32 {
        let offset = self.readers.next_multiple_of(CURSOR_ALIGN);
        // SAFETY: offset is 4-aligned inside a 4-aligned region and within
        // the header computed by `header_len`.
        unsafe { &*(self.base().add(offset) as *const AtomicI32) }
    }

    fn read_cursor(&self, reader: usize) -> &AtomicI32 {
        debug_assert!(reader < self.readers);
        let offset = self.readers.next_multiple_of(CURSOR_ALIGN) + CURSOR_ALIGN * (1 + reader);
        // SAFETY: as for `write_cursor`; reader < readers keeps us inside the header.
        unsafe { &*(self.base().add(offset) as *const AtomicI32) }
    }

    fn data(&self) -> *mut u8 {
        // SAFETY: the data area starts right after the header and spans data_len bytes.
        unsafe { self.base().add(Self::header_len(self.readers)) }
    }

    fn load_cursor(cursor: &AtomicI32) -> usize {
        cursor.load(Ordering::Acquire) as usize
    }

    /// Bytes written but not yet consumed by `reader`, for a given write cursor.
    fn pending(&self, write: usize, reader: usize) -> usize {
        let read = Self::load_cursor(self.read_cursor(reader));
        if write >= read {
            write - read
        } else {
            self.data_len - read + write
        }
    }

    fn is_reader_connected(&self, reader: usize) -> bool {
        self.connected_flag(reader).load(Ordering::Acquire) != 0
    }
}

/// The writing end of a ring.
#[derive(Debug)]
pub struct RingWriter {
    region: RingRegion,
}

impl RingWriter {
    pub fn readers(&self) -> usize {
        self.region.readers
    }

    pub fn data_len(&self) -> usize {
        self.region.data_len
    }

    /// Bytes not yet consumed by `reader`.
    pub fn pending_for(&self, reader: usize) -> usize {
        let write = RingRegion::load_cursor(self.region.write_cursor());
        self.region.pending(write, reader)
    }

    /// Free space: `S - 1 - max_i(pending_i)` over every reader.
    pub fn bytes_available_for_writing(&self) -> usize {
        let write = RingRegion::load_cursor(self.region.write_cursor());
        let max_pending = (0..self.region.readers)
            .map(|i| self.region.pending(write, i))
            .max()
            .unwrap_or(0);
        self.region.data_len - 1 - max_pending
    }

    /// Copy as much of `data` as currently fits, wrapping at the end of the
    /// data area. Returns the number of bytes written; 0 means full.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.bytes_available_for_writing());
        if n == 0 {
            return 0;
        }
        let size = self.region.data_len;
        let write = RingRegion::load_cursor(self.region.write_cursor());
        let first = n.min(size - write);
        // SAFETY: [write, write + first) and [0, n - first) lie inside the data
        // area, and the free-space check guarantees no reader still needs them.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.region.data().add(write), first);
            if first < n {
                std::ptr::copy_nonoverlapping(
                    data.as_ptr().add(first),
                    self.region.data(),
                    n - first,
                );
            }
        }
        let next = (write + n) % size;
        self.region
            .write_cursor()
            .store(next as i32, Ordering::Release);
        n
    }

    pub fn is_reader_connected(&self, reader: usize) -> bool {
        reader < self.region.readers && self.region.is_reader_connected(reader)
    }

    /// Wait until reader `reader` has opened its end.
    ///
    /// Returns `false` if the timeout elapses first; with an infinite timeout
    /// this only returns once the reader connects.
    pub async fn wait_for_reader_connection(&self, reader: usize, timeout: Timeout) -> bool {
        if reader >= self.region.readers {
            return false;
        }
        let strategy = WaitStrategy::Sleep(IpcConfig::READER_CONNECT_POLL_INTERVAL);
        let wait = poll_until(strategy, || self.region.is_reader_connected(reader));
        match timeout.duration() {
            None => {
                wait.await;
                true
            }
            Some(after) => tokio::time::timeout(after, wait).await.is_ok(),
        }
    }
}

/// One reading end of a ring.
#[derive(Debug)]
pub struct RingReader {
    region: RingRegion,
    index: usize,
}

impl RingReader {
    /// The reader slot this end owns.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn data_len(&self) -> usize {
        self.region.data_len
    }

    /// Bytes ready to be read by this reader: `(write - read) mod S`.
    pub fn bytes_available(&self) -> usize {
        let write = RingRegion::load_cursor(self.region.write_cursor());
        self.region.pending(write, self.index)
    }

    /// Copy up to `buf.len()` pending bytes, wrapping at the end of the data
    /// area. Returns the number of bytes read; 0 means empty.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let size = self.region.data_len;
        let write = RingRegion::load_cursor(self.region.write_cursor());
        let read = self.region.read_cursor(self.index).load(Ordering::Relaxed) as usize;
        let available = if write >= read {
            write - read
        } else {
            size - read + write
        };
        let n = buf.len().min(available);
        if n == 0 {
            return 0;
        }
        let first = n.min(size - read);
        // SAFETY: the acquire load of the write cursor makes [read, read + n)
        // (mod S) visible, and the writer does not touch it until we release
        // our cursor below.
        unsafe {
            std::ptr::copy_nonoverlapping(self.region.data().add(read), buf.as_mut_ptr(), first);
            if first < n {
                std::ptr::copy_nonoverlapping(
                    self.region.data(),
                    buf.as_mut_ptr().add(first),
                    n - first,
                );
            }
        }
        let next = (read + n) % size;
        self.region
            .read_cursor(self.index)
            .store(next as i32, Ordering::Release);
        n
    }
}

/// Byte stream over a pair of ring ends.
///
/// Either end may be missing: the server's fan-out link only writes, and
/// using an absent end fails with `ErrorKind::Unsupported`. An empty ring on
/// read and a full ring on write are retried according to the wait strategy
/// and never fail on their own; the caller's timeout bounds them.
#[derive(Debug)]
pub struct RingStream {
    rx: Option<RingReader>,
    tx: Option<RingWriter>,
    read_backoff: Backoff,
    write_backoff: Backoff,
}

impl RingStream {
    pub fn new(rx: Option<RingReader>, tx: Option<RingWriter>, strategy: WaitStrategy) -> Self {
        Self {
            rx,
            tx,
            read_backoff: Backoff::new(strategy),
            write_backoff: Backoff::new(strategy),
        }
    }

    pub fn reader(&self) -> Option<&RingReader> {
        self.rx.as_ref()
    }

    pub fn writer(&self) -> Option<&RingWriter> {
        self.tx.as_ref()
    }

    /// Bytes waiting in the read end; 0 without one.
    pub fn bytes_available(&self) -> usize {
        self.rx.as_ref().map_or(0, RingReader::bytes_available)
    }
}

fn missing_end(what: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        format!("ring stream has no {} end", what),
    )
}

impl AsyncRead for RingStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let Some(rx) = this.rx.as_mut() else {
            return Poll::Ready(Err(missing_end("read")));
        };
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        let n = rx.read(buf.initialize_unfilled());
        if n > 0 {
            buf.advance(n);
            this.read_backoff.reset();
            Poll::Ready(Ok(()))
        } else {
            this.read_backoff.schedule_retry(cx);
            Poll::Pending
        }
    }
}

impl AsyncWrite for RingStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let Some(tx) = this.tx.as_mut() else {
            return Poll::Ready(Err(missing_end("write")));
        };
        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let n = tx.write(data);
        if n > 0 {
            this.write_backoff.reset();
            Poll::Ready(Ok(n))
        } else {
            this.write_backoff.schedule_retry(cx);
            Poll::Pending
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Bytes are visible to readers as soon as the cursor is stored.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

fn ring_error(message: impl Into<String>) -> SyncError {
    SyncError::SharedMemory {
        message: message.into(),
        source: None,
    }
}
