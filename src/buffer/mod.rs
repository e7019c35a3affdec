//! Buffer pools: fixed-size frame buffers a capture device writes into

pub mod host;

use std::ptr::NonNull;

use crate::capture::FrameDim;
use crate::error::{BufferError, Result};

pub use host::{heap_block, HostBufferPool, HostMemory, MemoryBudget, SystemMemory};

/// Non-owning view of one pool buffer.
///
/// The pointer is only valid while the pool that produced it is still at the
/// same allocation generation; any reallocation or release invalidates it.
/// Check with [`BufferPool::is_current`] before dereferencing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPtr {
    ptr: NonNull<u8>,
    len: usize,
    generation: u64,
}

// SAFETY: BufferPtr is an address plus bookkeeping; it never dereferences on
// its own. All access goes through the unsafe methods below, whose callers
// uphold the aliasing and lifetime rules.
unsafe impl Send for BufferPtr {}

impl BufferPtr {
    /// Wraps a pool-owned region. Pool implementations call this from
    /// [`BufferPool::buffer_ptr`].
    pub fn new(ptr: NonNull<u8>, len: usize, generation: u64) -> Self {
        Self {
            ptr,
            len,
            generation,
        }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Borrows the buffer contents.
    ///
    /// # Safety
    ///
    /// The owning pool must still be at `self.generation()` for the whole
    /// lifetime `'a`, and nothing may write to the buffer meanwhile.
    pub unsafe fn as_slice<'a>(&self) -> &'a [u8] {
        std::slice::from_raw_parts(self.ptr.as_ptr(), self.len)
    }

    /// Mutably borrows the buffer contents.
    ///
    /// # Safety
    ///
    /// The owning pool must still be at `self.generation()` for the whole
    /// lifetime `'a`, and no other reference to the buffer may exist.
    pub unsafe fn as_mut_slice<'a>(&self) -> &'a mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len)
    }
}

/// Capability every buffer-supplying backend provides.
///
/// A pool is either empty (unset geometry, no buffers) or holds `n >= 1`
/// buffers of exactly `frame_dim().byte_size()` bytes each. Geometry and count
/// only change together, through [`allocate`](BufferPool::allocate) or
/// [`release`](BufferPool::release).
pub trait BufferPool {
    /// Upper bound on the number of buffers this backend will allocate for
    /// `frame_dim`.
    fn max_buffers(&self, frame_dim: &FrameDim) -> Result<usize>;

    /// Allocates `nb_buffers` buffers for `frame_dim`. A no-op when the pool
    /// already holds exactly that. On failure the pool is left empty.
    fn allocate(&mut self, nb_buffers: usize, frame_dim: &FrameDim) -> Result<()>;

    /// Frees all buffers. Safe to call on an empty pool.
    fn release(&mut self);

    fn nb_buffers(&self) -> usize;

    fn frame_dim(&self) -> FrameDim;

    /// Allocation generation; changes whenever buffers are allocated or
    /// released.
    fn generation(&self) -> u64;

    fn buffer_ptr(&self, index: usize) -> Result<BufferPtr>;

    fn clear_buffer(&mut self, index: usize) -> Result<()> {
        let buffer = self.buffer_ptr(index)?;
        // SAFETY: `&mut self` gives exclusive access to the pool, and the
        // pointer was just produced for the current generation.
        unsafe { std::ptr::write_bytes(buffer.as_ptr(), 0, buffer.len()) };
        Ok(())
    }

    fn clear_all_buffers(&mut self) -> Result<()> {
        for index in 0..self.nb_buffers() {
            self.clear_buffer(index)?;
        }
        Ok(())
    }

    /// Whether `buffer` still points into this pool's current allocation.
    fn is_current(&self, buffer: &BufferPtr) -> bool {
        self.nb_buffers() > 0 && buffer.generation() == self.generation()
    }

    fn total_bytes(&self) -> usize {
        self.nb_buffers() * self.frame_dim().byte_size()
    }
}

/// Rejects geometries no buffer can be allocated for.
pub(crate) fn check_frame_dim(frame_dim: &FrameDim) -> Result<usize> {
    match frame_dim.byte_size() {
        0 => Err(BufferError::InvalidGeometry { byte_size: 0 }),
        byte_size => Ok(byte_size),
    }
}

/// Maps a buffer index to `Ok(index)` when it lies inside `[0, len)`.
pub(crate) fn check_index(index: usize, len: usize) -> Result<usize> {
    if index < len {
        Ok(index)
    } else {
        Err(BufferError::OutOfRange {
            index: index as u64,
            len,
        })
    }
}
