//! Named shared-memory regions.
//!
//! The rig's cross-process state (IO token, global config word, command
//! logs, integrity tables) lives in regions with deterministic names. The
//! primary process creates a region; secondary processes attach to it by
//! name. Regions are plain files under a base directory (`/dev/shm` by
//! default) mapped read-write, so dropping the creating handle unlinks the
//! name while existing attachments stay valid.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64};

use memmap2::MmapRaw;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    #[error("shared region {0:?} already exists")]
    AlreadyExists(String),
    #[error("shared region {0:?} not found")]
    NotFound(String),
    #[error("shared region {name:?} is {actual} bytes, need at least {need}")]
    TooSmall {
        name: String,
        actual: u64,
        need: u64,
    },
    #[error("shared region {0:?} size is not addressable")]
    TooLarge(String),
    #[error("shared memory i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Factory for named regions rooted at one base directory.
///
/// Production uses [`Registry::system`]; tests point it at a tempdir so
/// parallel test processes cannot collide.
#[derive(Debug, Clone)]
pub struct Registry {
    base: PathBuf,
}

impl Registry {
    pub fn system() -> Self {
        Registry {
            base: PathBuf::from("/dev/shm"),
        }
    }

    pub fn with_base(base: impl AsRef<Path>) -> Self {
        Registry {
            base: base.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, name: &str) -> PathBuf {
        // Region names embed transport addresses and NQNs; keep them
        // filesystem-safe.
        let sanitized: String = name
            .chars()
            .map(|c| if c == '/' || c == '\0' { '_' } else { c })
            .collect();
        self.base.join(sanitized)
    }

    /// Reserve a new zero-filled region. Fails if the name is taken.
    pub fn create(&self, name: &str, len: usize) -> Result<Region, ShmError> {
        let path = self.path_for(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    ShmError::AlreadyExists(name.to_string())
                } else {
                    ShmError::Io(e)
                }
            })?;
        file.set_len(len as u64)?;
        debug!(name, len, "shm region created");
        Region::map(file, path, name, len, true)
    }

    /// Attach to an existing region.
    pub fn lookup(&self, name: &str) -> Result<Region, ShmError> {
        let path = self.path_for(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ShmError::NotFound(name.to_string())
                } else {
                    ShmError::Io(e)
                }
            })?;
        let len = file.metadata()?.len() as usize;
        debug!(name, len, "shm region attached");
        Region::map(file, path, name, len, false)
    }

    /// Attach to an existing region, requiring at least `need` bytes.
    pub fn lookup_sized(&self, name: &str, need: usize) -> Result<Region, ShmError> {
        let region = self.lookup(name)?;
        if region.len() < need {
            return Err(ShmError::TooSmall {
                name: name.to_string(),
                actual: region.len() as u64,
                need: need as u64,
            });
        }
        Ok(region)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path_for(name).exists()
    }
}

/// One mapped region. The handle returned by [`Registry::create`] owns the
/// name and unlinks it on drop; lookup handles never unlink.
pub struct Region {
    map: MmapRaw,
    // Keeps the fd alive for the lifetime of the mapping.
    _file: File,
    path: PathBuf,
    name: String,
    len: usize,
    owner: bool,
}

impl Region {
    fn map(
        file: File,
        path: PathBuf,
        name: &str,
        len: usize,
        owner: bool,
    ) -> Result<Region, ShmError> {
        let map = MmapRaw::map_raw(&file)?;
        Ok(Region {
            map,
            _file: file,
            path,
            name: name.to_string(),
            len,
            owner,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.map.as_mut_ptr()
    }

    fn check(&self, offset: usize, size: usize, align: usize) {
        assert!(offset + size <= self.len, "region access out of bounds");
        assert_eq!(offset % align, 0, "misaligned region access");
    }

    /// Atomic view of one 32-bit word.
    pub fn atomic_u32(&self, offset: usize) -> &AtomicU32 {
        self.check(offset, 4, 4);
        unsafe { &*(self.as_ptr().add(offset) as *const AtomicU32) }
    }

    /// Atomic view of one 64-bit word.
    pub fn atomic_u64(&self, offset: usize) -> &AtomicU64 {
        self.check(offset, 8, 8);
        unsafe { &*(self.as_ptr().add(offset) as *const AtomicU64) }
    }

    /// Atomic view of `count` consecutive 32-bit words.
    pub fn atomic_u32_slice(&self, offset: usize, count: usize) -> &[AtomicU32] {
        self.check(offset, count * 4, 4);
        unsafe {
            std::slice::from_raw_parts(self.as_ptr().add(offset) as *const AtomicU32, count)
        }
    }

    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) {
        self.check(offset, out.len(), 1);
        unsafe {
            std::ptr::copy_nonoverlapping(self.as_ptr().add(offset), out.as_mut_ptr(), out.len())
        }
    }

    pub fn write_bytes(&self, offset: usize, data: &[u8]) {
        self.check(offset, data.len(), 1);
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.as_ptr().add(offset), data.len())
        }
    }
}

// The mapping is shared memory: all access goes through atomics or through
// raw pointers whose single-writer discipline is enforced by the owning
// layer (see the command log).
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Drop for Region {
    fn drop(&mut self) {
        if self.owner {
            debug!(name = %self.name, "shm region unlinked");
            let _ = fs::remove_file(&self.path);
        }
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("name", &self.name)
            .field("len", &self.len)
            .field("owner", &self.owner)
            .finish()
    }
}
