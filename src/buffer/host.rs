//! Buffer pool backed by plain process heap memory

use std::io;
use std::ptr::NonNull;

use tracing::{debug, info, instrument, warn};

use super::{check_frame_dim, check_index, BufferPool, BufferPtr};
use crate::capture::FrameDim;
use crate::error::{BufferError, Result};

/// Fraction of total system memory the pool may fill with frame buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBudget {
    numerator: u64,
    denominator: u64,
}

impl MemoryBudget {
    pub fn new(numerator: u64, denominator: u64) -> Result<Self> {
        if denominator == 0 || numerator == 0 || numerator > denominator {
            return Err(BufferError::InvalidValue("memory budget must be in (0, 1]"));
        }
        Ok(Self {
            numerator,
            denominator,
        })
    }

    /// Applies the budget to a buffer count, truncating down.
    fn apply(&self, blocks: u64) -> Result<u64> {
        blocks
            .checked_mul(self.numerator)
            .map(|scaled| scaled / self.denominator)
            .ok_or(BufferError::BudgetOverflow)
    }
}

impl Default for MemoryBudget {
    /// Three quarters, leaving headroom for the rest of the process and the OS
    fn default() -> Self {
        Self {
            numerator: 3,
            denominator: 4,
        }
    }
}

/// Where host buffers come from: the memory size query and the per-buffer
/// acquisition. Swap it out to simulate small machines or failing
/// allocations.
pub trait HostMemory {
    /// Total installed memory in bytes.
    fn total_memory(&self) -> io::Result<u64>;

    /// Acquires the `index`-th buffer of an allocation, `size` bytes long.
    fn acquire(&self, index: usize, size: usize) -> Result<Box<[u8]>> {
        heap_block(index, size)
    }
}

/// Zeroed heap block, reporting out-of-memory instead of aborting.
pub fn heap_block(index: usize, size: usize) -> Result<Box<[u8]>> {
    let mut block = Vec::new();
    block
        .try_reserve_exact(size)
        .map_err(|_| BufferError::AllocationFailed { index, size })?;
    block.resize(size, 0u8);
    Ok(block.into_boxed_slice())
}

/// The machine's own memory, as reported by `sysinfo(2)`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemMemory;

impl HostMemory for SystemMemory {
    #[cfg(target_os = "linux")]
    fn total_memory(&self) -> io::Result<u64> {
        let mut info = std::mem::MaybeUninit::<libc::sysinfo>::zeroed();
        // SAFETY: sysinfo only writes into the struct we hand it.
        if unsafe { libc::sysinfo(info.as_mut_ptr()) } < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: zero-initialised and filled in by a successful call.
        let info = unsafe { info.assume_init() };
        Ok((info.totalram as u64).saturating_mul(u64::from(info.mem_unit)))
    }

    #[cfg(not(target_os = "linux"))]
    fn total_memory(&self) -> io::Result<u64> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "system memory query is only implemented on Linux",
        ))
    }
}

/// One heap block owned by the pool. Freed on drop.
struct HostBuffer {
    ptr: NonNull<u8>,
    len: usize,
}

impl HostBuffer {
    fn from_block(block: Box<[u8]>) -> Self {
        let len = block.len();
        let raw = Box::into_raw(block).cast::<u8>();
        // SAFETY: Box::into_raw never returns null.
        let ptr = unsafe { NonNull::new_unchecked(raw) };
        Self { ptr, len }
    }
}

impl Drop for HostBuffer {
    fn drop(&mut self) {
        let raw = std::ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len);
        // SAFETY: ptr/len came from Box::into_raw in from_block and are freed
        // exactly once, here.
        drop(unsafe { Box::from_raw(raw) });
    }
}

/// [`BufferPool`] over process heap memory, refusing to allocate more than
/// its [`MemoryBudget`] of total system memory.
pub struct HostBufferPool<M: HostMemory = SystemMemory> {
    memory: M,
    budget: MemoryBudget,
    frame_dim: FrameDim,
    buffers: Vec<HostBuffer>,
    generation: u64,
}

impl HostBufferPool<SystemMemory> {
    /// Pool over system memory, budgeted by the global configuration.
    pub fn new() -> Self {
        Self::with_memory(SystemMemory)
    }
}

impl Default for HostBufferPool<SystemMemory> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: HostMemory> HostBufferPool<M> {
    /// Pool over `memory`, budgeted by the global [`CONFIG`](crate::CONFIG)
    /// as it stands at construction time (3/4 if the configured budget is
    /// invalid). Use [`with_memory_budget`](Self::with_memory_budget) to stay
    /// independent of process-wide configuration.
    pub fn with_memory(memory: M) -> Self {
        let budget = crate::CONFIG.load().memory.budget().unwrap_or_else(|err| {
            warn!("Ignoring configured memory budget: {}", err);
            MemoryBudget::default()
        });
        Self::with_memory_budget(memory, budget)
    }

    pub fn with_memory_budget(memory: M, budget: MemoryBudget) -> Self {
        Self {
            memory,
            budget,
            frame_dim: FrameDim::default(),
            buffers: Vec::new(),
            generation: 0,
        }
    }

    pub fn with_budget(mut self, budget: MemoryBudget) -> Self {
        self.budget = budget;
        self
    }

    pub fn budget(&self) -> MemoryBudget {
        self.budget
    }

    /// Total memory expressed in frame-sized blocks.
    fn system_blocks(&self, frame_size: usize) -> Result<u64> {
        if frame_size == 0 {
            return Err(BufferError::InvalidValue("memory unit must be positive"));
        }
        let total = self
            .memory
            .total_memory()
            .map_err(BufferError::MemoryQuery)?;
        Ok(total / frame_size as u64)
    }

    pub fn buffer(&self, index: usize) -> Result<&[u8]> {
        let buffer = &self.buffers[check_index(index, self.buffers.len())?];
        // SAFETY: the block lives as long as `self.buffers` holds it, and the
        // shared borrow of self excludes writers through this pool.
        Ok(unsafe { std::slice::from_raw_parts(buffer.ptr.as_ptr(), buffer.len) })
    }

    pub fn buffer_mut(&mut self, index: usize) -> Result<&mut [u8]> {
        let buffer = &self.buffers[check_index(index, self.buffers.len())?];
        // SAFETY: as in `buffer`, with exclusivity from `&mut self`.
        Ok(unsafe { std::slice::from_raw_parts_mut(buffer.ptr.as_ptr(), buffer.len) })
    }
}

impl<M: HostMemory> BufferPool for HostBufferPool<M> {
    fn max_buffers(&self, frame_dim: &FrameDim) -> Result<usize> {
        let frame_size = check_frame_dim(frame_dim)?;
        let blocks = self.system_blocks(frame_size)?;
        let max = self.budget.apply(blocks)?;
        usize::try_from(max).map_err(|_| BufferError::BudgetOverflow)
    }

    #[instrument(skip(self, frame_dim), fields(frame_size = frame_dim.byte_size()))]
    fn allocate(&mut self, nb_buffers: usize, frame_dim: &FrameDim) -> Result<()> {
        let frame_size = check_frame_dim(frame_dim)?;

        if *frame_dim == self.frame_dim && nb_buffers == self.nb_buffers() {
            return Ok(());
        }

        self.release();

        let max = self.max_buffers(frame_dim)?;
        if nb_buffers < 1 || nb_buffers > max {
            return Err(BufferError::InvalidCount {
                requested: nb_buffers,
                max,
            });
        }

        // Built aside and only installed once complete; dropping it on an
        // early return frees whatever was acquired so far.
        let mut buffers = Vec::new();
        buffers
            .try_reserve_exact(nb_buffers)
            .map_err(|_| BufferError::AllocationFailed {
                index: 0,
                size: frame_size,
            })?;

        for index in 0..nb_buffers {
            match self.memory.acquire(index, frame_size) {
                Ok(block) => buffers.push(HostBuffer::from_block(block)),
                Err(err) => {
                    warn!(
                        index,
                        nb_buffers, "Buffer allocation failed, releasing {} buffers", index
                    );
                    return Err(err);
                }
            }
        }
        debug!("Acquired {} buffers of {} bytes", nb_buffers, frame_size);

        self.buffers = buffers;
        self.frame_dim = *frame_dim;
        self.generation += 1;

        let total = self.total_bytes();
        metrics::gauge!("hwbuffer_pool_bytes").set(total as f64);
        info!(
            "Allocated {} host buffers ({} bytes, limit {})",
            nb_buffers, total, max
        );
        Ok(())
    }

    fn release(&mut self) {
        if self.buffers.is_empty() && !self.frame_dim.is_set() {
            return;
        }
        debug!("Releasing {} host buffers", self.buffers.len());
        self.buffers.clear();
        self.frame_dim = FrameDim::default();
        self.generation += 1;
        metrics::gauge!("hwbuffer_pool_bytes").set(0.0);
    }

    fn nb_buffers(&self) -> usize {
        self.buffers.len()
    }

    fn frame_dim(&self) -> FrameDim {
        self.frame_dim
    }

    fn generation(&self) -> u64 {
        self.generation
    }

    fn buffer_ptr(&self, index: usize) -> Result<BufferPtr> {
        let buffer = &self.buffers[check_index(index, self.buffers.len())?];
        Ok(BufferPtr::new(buffer.ptr, buffer.len, self.generation))
    }
}
