//! Named shared memory segments.
//!
//! A segment is a POSIX shared memory object mapped read/write into this
//! process. The creating process owns the name and unlinks it on drop;
//! processes that attach only unmap their view.

#![allow(unsafe_code)]

use crate::{Result, SyncError};
use std::ptr::NonNull;
use tracing::debug;

/// A mapped region of memory that other processes may map as well.
#[derive(Debug)]
pub struct SharedSegment {
    ptr: NonNull<u8>,
    len: usize,
    key: String,
    backing: Backing,
}

#[derive(Debug)]
enum Backing {
    /// Process-private memory, for tests of the ring layer.
    Heap(#[allow(dead_code)] Vec<u64>),
    #[cfg(unix)]
    Mapped { owner: bool },
}

// SAFETY: the segment is plain memory. All cross-thread and cross-process
// access goes through the ring buffer's atomic cursors, which order the
// plain data copies.
unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

impl SharedSegment {
    /// Create a zero-filled, process-private segment.
    pub fn anonymous(len: usize) -> Result<Self> {
        if len == 0 {
            return Err(SyncError::SharedMemory {
                message: "segment size must be non-zero".to_string(),
                source: None,
            });
        }
        // u64 storage keeps every cursor word aligned
        let mut storage = vec![0u64; len.div_ceil(8)];
        let ptr = NonNull::new(storage.as_mut_ptr().cast::<u8>()).ok_or_else(|| {
            SyncError::SharedMemory {
                message: "allocation returned null".to_string(),
                source: None,
            }
        })?;
        Ok(Self {
            ptr,
            len,
            key: String::new(),
            backing: Backing::Heap(storage),
        })
    }

    /// Create a new named segment of `len` zeroed bytes.
    #[cfg(unix)]
    pub fn create(key: &str, len: usize) -> Result<Self> {
        use nix::fcntl::OFlag;
        use nix::sys::stat::Mode;

        let name = shm_name(key);
        let fd = nix::sys::mman::shm_open(
            name.as_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| SyncError::shared_memory(format!("cannot create {}", name), e))?;

        let file = std::fs::File::from(fd);
        if let Err(e) = file.set_len(len as u64) {
            let _ = nix::sys::mman::shm_unlink(name.as_str());
            return Err(SyncError::SharedMemory {
                message: format!("cannot size {} to {} bytes: {}", name, len, e),
                source: Some(e),
            });
        }

        match map(&file, len) {
            Ok(ptr) => {
                debug!("Created shared memory {} ({} bytes)", name, len);
                Ok(Self {
                    ptr,
                    len,
                    key: key.to_string(),
                    backing: Backing::Mapped { owner: true },
                })
            }
            Err(e) => {
                let _ = nix::sys::mman::shm_unlink(name.as_str());
                Err(e)
            }
        }
    }

    /// Attach to an existing named segment.
    #[cfg(unix)]
    pub fn open(key: &str) -> Result<Self> {
        use nix::fcntl::OFlag;
        use nix::sys::stat::Mode;

        let name = shm_name(key);
        let fd = nix::sys::mman::shm_open(name.as_str(), OFlag::O_RDWR, Mode::empty())
            .map_err(|e| SyncError::shared_memory(format!("cannot attach to {}", name), e))?;
        let file = std::fs::File::from(fd);
        let len = file.metadata()?.len() as usize;
        let ptr = map(&file, len)?;
        debug!("Attached to shared memory {} ({} bytes)", name, len);
        Ok(Self {
            ptr,
            len,
            key: key.to_string(),
            backing: Backing::Mapped { owner: false },
        })
    }

    #[cfg(not(unix))]
    pub fn create(key: &str, _len: usize) -> Result<Self> {
        Err(SyncError::SharedMemory {
            message: format!("cannot create {}: shared memory is not supported on this platform", key),
            source: None,
        })
    }

    #[cfg(not(unix))]
    pub fn open(key: &str) -> Result<Self> {
        Err(SyncError::SharedMemory {
            message: format!("cannot attach to {}: shared memory is not supported on this platform", key),
            source: None,
        })
    }

    /// Key under which other processes can attach; empty for anonymous segments.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Base address of the mapping.
    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        match self.backing {
            Backing::Heap(_) => {}
            #[cfg(unix)]
            Backing::Mapped { owner } => {
                // SAFETY: ptr/len describe exactly the mapping created in `map`,
                // and no references into it outlive the segment.
                if let Err(e) = unsafe { nix::sys::mman::munmap(self.ptr.cast(), self.len) } {
                    tracing::warn!("Failed to unmap shared memory {}: {}", self.key, e);
                }
                if owner {
                    let name = shm_name(&self.key);
                    if let Err(e) = nix::sys::mman::shm_unlink(name.as_str()) {
                        tracing::warn!("Failed to unlink shared memory {}: {}", name, e);
                    }
                }
            }
        }
    }
}

#[cfg(unix)]
fn shm_name(key: &str) -> String {
    format!("/{}", key.trim_start_matches('/'))
}

#[cfg(unix)]
fn map(file: &std::fs::File, len: usize) -> Result<NonNull<u8>> {
    use nix::sys::mman::{MapFlags, ProtFlags};
    use std::num::NonZeroUsize;

    let length = NonZeroUsize::new(len).ok_or_else(|| SyncError::SharedMemory {
        message: "cannot map an empty segment".to_string(),
        source: None,
    })?;
    // SAFETY: a fresh shared mapping of a file we hold open; nothing else in
    // this process aliases the returned range yet.
    let ptr = unsafe {
        nix::sys::mman::mmap(
            None,
            length,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            file,
            0,
        )
    }
    .map_err(|e| SyncError::shared_memory("cannot map shared memory", e))?;
    Ok(ptr.cast::<u8>())
}
