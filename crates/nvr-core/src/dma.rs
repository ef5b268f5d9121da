//! Page-aligned DMA buffers.
//!
//! Allocation goes through the [`DmaAllocator`] trait: the default
//! [`HeapAllocator`] reports the virtual address as the IOVA, which is
//! what the in-memory device model and NVMe-over-TCP need; a VFIO-backed
//! allocator would translate through the IOMMU instead.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::Arc;

use rand::RngCore;
use tracing::debug;

pub const DMA_ALIGN: usize = 4096;

/// Backs [`DmaBuf`] allocations with device-reachable memory.
pub trait DmaAllocator: Send + Sync {
    /// Allocate `len` zeroed bytes at [`DMA_ALIGN`] alignment; returns
    /// the virtual pointer and the bus address the device must use.
    fn allocate(&self, len: usize) -> Result<(NonNull<u8>, u64), DmaError>;

    /// # Safety
    /// `ptr` must come from [`DmaAllocator::allocate`] on this allocator
    /// with the same `len`, and no command may still reference the range.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, len: usize);
}

/// Identity-mapped heap allocator (IOVA == virtual address).
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapAllocator;

impl HeapAllocator {
    fn layout(len: usize) -> Result<Layout, DmaError> {
        Layout::from_size_align(len, DMA_ALIGN).map_err(|_| DmaError::ZeroLength)
    }
}

impl DmaAllocator for HeapAllocator {
    fn allocate(&self, len: usize) -> Result<(NonNull<u8>, u64), DmaError> {
        let ptr = unsafe { alloc::alloc_zeroed(Self::layout(len)?) };
        let ptr = NonNull::new(ptr).ok_or(DmaError::OutOfMemory(len))?;
        Ok((ptr, ptr.as_ptr() as u64))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, len: usize) {
        // `len` was accepted by `allocate`, so the layout is valid.
        alloc::dealloc(
            ptr.as_ptr(),
            Layout::from_size_align_unchecked(len, DMA_ALIGN),
        );
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DmaError {
    #[error("dma allocation of {0} bytes failed")]
    OutOfMemory(usize),
    #[error("zero-length dma allocation")]
    ZeroLength,
}

/// Buffer fill pattern, selected at allocation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PatternType {
    /// All-zero; a non-zero `pvalue` selects all-ones instead.
    #[default]
    Zero,
    /// The 32-bit `pvalue` repeated across whole 32-bit slots.
    Word32,
    /// The first `len * pvalue / 100` bytes from system entropy, the rest
    /// zero. `pvalue` is clamped to 0..=100.
    Random,
}

impl PatternType {
    /// Decode the raw selector scripts pass (0, 32, 0xbeef).
    pub fn from_raw(raw: u32) -> Option<PatternType> {
        match raw {
            0 => Some(PatternType::Zero),
            32 => Some(PatternType::Word32),
            0xbeef => Some(PatternType::Random),
            _ => None,
        }
    }
}

/// Borrow-free handle to a sub-range of a [`DmaBuf`], handed to the
/// transport at submit time. The device may read or write through it until
/// the command completes; the cooperative single-threaded data plane is
/// what makes that sound, exactly as with real DMA.
#[derive(Debug, Clone, Copy)]
pub struct DmaRef {
    ptr: *mut u8,
    len: usize,
    iova: u64,
}

impl DmaRef {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iova(&self) -> u64 {
        self.iova
    }

    /// # Safety
    /// Only while no command is in flight against an overlapping range, or
    /// from the completion path of the command that owns the range.
    pub unsafe fn as_slice<'a>(&self) -> &'a [u8] {
        std::slice::from_raw_parts(self.ptr, self.len)
    }

    /// # Safety
    /// Same contract as [`DmaRef::as_slice`].
    pub unsafe fn as_mut_slice<'a>(&self) -> &'a mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr, self.len)
    }

    pub fn truncated(&self, len: usize) -> DmaRef {
        DmaRef {
            ptr: self.ptr,
            len: self.len.min(len),
            iova: self.iova,
        }
    }
}

/// One page-aligned allocation, returned to its allocator on drop.
pub struct DmaBuf {
    ptr: NonNull<u8>,
    len: usize,
    iova: u64,
    allocator: Arc<dyn DmaAllocator>,
}

// Single owner; the data plane never touches a buffer from two threads.
unsafe impl Send for DmaBuf {}

impl DmaBuf {
    /// Allocate `len` zeroed bytes from the heap allocator, then apply
    /// the pattern.
    pub fn alloc(len: usize, ptype: PatternType, pvalue: u32) -> Result<DmaBuf, DmaError> {
        Self::alloc_with(Arc::new(HeapAllocator), len, ptype, pvalue)
    }

    /// Allocate from a specific allocator.
    pub fn alloc_with(
        allocator: Arc<dyn DmaAllocator>,
        len: usize,
        ptype: PatternType,
        pvalue: u32,
    ) -> Result<DmaBuf, DmaError> {
        if len == 0 {
            return Err(DmaError::ZeroLength);
        }
        let (ptr, iova) = allocator.allocate(len)?;
        let mut buf = DmaBuf {
            ptr,
            len,
            iova,
            allocator,
        };
        buf.fill_pattern(ptype, pvalue);
        debug!(len, ?ptype, pvalue, iova = buf.iova(), "dma buffer allocated");
        Ok(buf)
    }

    fn fill_pattern(&mut self, ptype: PatternType, pvalue: u32) {
        match ptype {
            PatternType::Zero => {
                if pvalue != 0 {
                    self.as_mut_slice().fill(0xff);
                }
            }
            PatternType::Word32 => {
                // Whole 32-bit slots only; a trailing partial word stays zero.
                let words = self.len / 4;
                let bytes = pvalue.to_le_bytes();
                for w in 0..words {
                    self.as_mut_slice()[w * 4..w * 4 + 4].copy_from_slice(&bytes);
                }
            }
            PatternType::Random => {
                let pct = pvalue.min(100) as usize;
                let count = (self.len * pct / 100).min(self.len);
                rand::rngs::OsRng.fill_bytes(&mut self.as_mut_slice()[..count]);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bus address of the buffer, as reported by its allocator.
    pub fn iova(&self) -> u64 {
        self.iova
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Handle to the whole buffer.
    pub fn dma_ref(&self) -> DmaRef {
        self.dma_range(0, self.len)
    }

    /// Handle to `[offset, offset+len)`.
    pub fn dma_range(&self, offset: usize, len: usize) -> DmaRef {
        assert!(offset + len <= self.len, "dma range out of bounds");
        DmaRef {
            ptr: unsafe { self.ptr.as_ptr().add(offset) },
            len,
            iova: self.iova() + offset as u64,
        }
    }
}

impl Drop for DmaBuf {
    fn drop(&mut self) {
        unsafe { self.allocator.deallocate(self.ptr, self.len) }
    }
}

impl std::fmt::Debug for DmaBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaBuf")
            .field("len", &self.len)
            .field("iova", &self.iova())
            .finish()
    }
}

/// Stamp blocks about to be written: the first 8 bytes of each block carry
/// the LBA, the last 8 the per-block token, so every write payload on the
/// device is unique and self-identifying.
pub fn stamp_write_blocks(data: &mut [u8], slba: u64, nlb: u32, lba_size: usize, token: u64) {
    for i in 0..nlb as usize {
        let block = &mut data[i * lba_size..(i + 1) * lba_size];
        block[0..8].copy_from_slice(&(slba + i as u64).to_le_bytes());
        block[lba_size - 8..].copy_from_slice(&(token + i as u64).to_le_bytes());
    }
}
