//! DMA-capable buffer allocation.
//!
//! The NVMe device reads and writes I/O buffers directly, so they must come
//! from DMA-capable memory (pinned and, with SPDK, registered with the IOMMU)
//! and be aligned to the device boundary, 4096 bytes by default.
//!
//! A [`DmaBuf`] remembers how it was allocated and releases itself through
//! the same allocator on drop:
//!
//! - [`DmaBuf::alloc`] uses `spdk_dma_malloc()` (feature `spdk`).
//! - [`DmaBuf::alloc_host`] uses the global allocator with the requested
//!   alignment. Only the simulated driver hands these to a "device".
//!
//! # Example
//!
//! ```
//! use spdk_nvme::DmaBuf;
//!
//! let mut buf = DmaBuf::alloc_host(4096, 4096).expect("allocation failed");
//! buf.as_mut_slice()[..5].copy_from_slice(b"hello");
//! assert!(buf.is_aligned_to(4096));
//! ```

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use crate::error::{Error, Result};

/// Device-required buffer alignment.
pub const DMA_ALIGNMENT: usize = 4096;

/// How the memory behind a [`DmaBuf`] is given back.
enum Release {
    /// Global allocator, with the layout it was allocated with.
    Host(Layout),
    /// `spdk_dma_free`.
    #[cfg(feature = "spdk")]
    Spdk,
}

/// A DMA-capable memory buffer owned by exactly one I/O request at a time.
///
/// # Thread Safety
///
/// `DmaBuf` is `Send` but not `Sync`. It can be moved between threads,
/// but cannot be shared across threads simultaneously.
pub struct DmaBuf {
    ptr: NonNull<u8>,
    len: usize,
    release: Release,
}

// The underlying memory is just bytes, no thread-local state
unsafe impl Send for DmaBuf {}

impl DmaBuf {
    /// Allocate a DMA-capable buffer from SPDK's hugepage memory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DmaAlloc`] if allocation fails (e.g., out of hugepage memory).
    #[cfg(feature = "spdk")]
    pub fn alloc(size: usize, align: usize) -> Result<Self> {
        Self::check_args(size, align)?;

        let ptr = unsafe { spdk_nvme_sys::spdk_dma_malloc(size, align, std::ptr::null_mut()) };

        NonNull::new(ptr as *mut u8)
            .map(|ptr| Self {
                ptr,
                len: size,
                release: Release::Spdk,
            })
            .ok_or(Error::DmaAlloc(size))
    }

    /// Allocate a zeroed, aligned buffer from the global allocator.
    ///
    /// The memory is not pinned, so it is only suitable for backends that do
    /// not hand it to real hardware.
    pub fn alloc_host(size: usize, align: usize) -> Result<Self> {
        Self::check_args(size, align)?;

        let layout = Layout::from_size_align(size, align)
            .map_err(|e| Error::InvalidArgument(e.to_string()))?;
        // SAFETY: layout has a non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };

        NonNull::new(ptr)
            .map(|ptr| Self {
                ptr,
                len: size,
                release: Release::Host(layout),
            })
            .ok_or(Error::DmaAlloc(size))
    }

    fn check_args(size: usize, align: usize) -> Result<()> {
        if size == 0 {
            return Err(Error::InvalidArgument("size must be > 0".to_string()));
        }
        if !align.is_power_of_two() {
            return Err(Error::InvalidArgument(format!(
                "alignment {align} is not a power of two"
            )));
        }
        Ok(())
    }

    /// Get the buffer length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if the buffer is empty (zero length).
    ///
    /// Note: Zero-length buffers cannot be created via the allocators.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the start of the buffer sits on an `align` byte boundary.
    #[inline]
    pub fn is_aligned_to(&self, align: usize) -> bool {
        align == 0 || (self.ptr.as_ptr() as usize) % align == 0
    }

    /// Get mutable raw pointer to the buffer.
    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Get raw pointer to the buffer.
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Get an immutable slice view of the buffer.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Get a mutable slice view of the buffer.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for DmaBuf {
    fn drop(&mut self) {
        match self.release {
            // SAFETY: allocated by alloc::alloc_zeroed with this exact layout.
            Release::Host(layout) => unsafe { alloc::dealloc(self.ptr.as_ptr(), layout) },
            #[cfg(feature = "spdk")]
            Release::Spdk => unsafe {
                spdk_nvme_sys::spdk_dma_free(self.ptr.as_ptr() as *mut std::ffi::c_void)
            },
        }
    }
}

impl std::fmt::Debug for DmaBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaBuf")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

impl AsRef<[u8]> for DmaBuf {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsMut<[u8]> for DmaBuf {
    fn as_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_size_fails() {
        assert!(DmaBuf::alloc_host(0, DMA_ALIGNMENT).is_err());
    }

    #[test]
    fn test_bad_alignment_fails() {
        assert!(matches!(
            DmaBuf::alloc_host(4096, 3000),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            DmaBuf::alloc_host(4096, 0),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_host_buffer_is_aligned_and_zeroed() {
        let buf = DmaBuf::alloc_host(8192, DMA_ALIGNMENT).unwrap();
        assert_eq!(buf.len(), 8192);
        assert!(buf.is_aligned_to(DMA_ALIGNMENT));
        assert!(buf.as_slice().iter().all(|&b| b == 0));
    }
}
