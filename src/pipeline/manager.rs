//! Frame buffer manager: a buffer pool plus per-buffer capture timestamps and
//! frame-ready notification over a ring of reusable buffers

use tracing::{debug, info, instrument, trace, warn};

use super::callback::{FrameCallback, FrameReadyEvent};
use crate::buffer::{check_frame_dim, check_index, BufferPool, BufferPtr, HostBufferPool};
use crate::capture::{Clock, FrameDim, SystemClock, Timestamp};
use crate::error::{BufferError, Result};

/// The wrapped pool, either owned by the manager or lent by the caller.
enum PoolHandle<'a> {
    Owned(Box<dyn BufferPool + 'a>),
    Borrowed(&'a mut dyn BufferPool),
}

impl<'a> PoolHandle<'a> {
    fn get(&self) -> &(dyn BufferPool + 'a) {
        match self {
            PoolHandle::Owned(pool) => pool.as_ref(),
            PoolHandle::Borrowed(pool) => &**pool,
        }
    }

    fn get_mut(&mut self) -> &mut (dyn BufferPool + 'a) {
        match self {
            PoolHandle::Owned(pool) => pool.as_mut(),
            PoolHandle::Borrowed(pool) => &mut **pool,
        }
    }
}

/// Maps an unbounded acquisition frame counter onto a ring of `n` buffers and
/// turns "frame k captured" into a frame-ready notification.
///
/// Frame `k` lands in buffer `k % n`. Slots are overwritten unconditionally
/// once the counter wraps, so consumers must be done with a buffer before
/// that happens.
///
/// Not synchronized: allocation and release must never run concurrently with
/// [`new_frame_ready`](Self::new_frame_ready).
pub struct FrameBufferManager<'a> {
    pool: PoolHandle<'a>,
    timestamps: Vec<Timestamp>,
    start_ts: Timestamp,
    callbacks_active: bool,
    callback: Option<Box<dyn FrameCallback + 'a>>,
    clock: Box<dyn Clock + 'a>,
}

impl FrameBufferManager<'static> {
    /// Manager owning a host memory pool.
    pub fn new() -> Self {
        Self::with_owned_pool(Box::new(HostBufferPool::new()))
    }
}

impl Default for FrameBufferManager<'static> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> FrameBufferManager<'a> {
    /// Manager over a caller-owned pool. The pool outlives the manager and is
    /// never released on drop.
    pub fn with_pool(pool: &'a mut dyn BufferPool) -> Self {
        Self::from_handle(PoolHandle::Borrowed(pool))
    }

    /// Manager taking ownership of an already built pool.
    pub fn with_owned_pool(pool: Box<dyn BufferPool + 'a>) -> Self {
        Self::from_handle(PoolHandle::Owned(pool))
    }

    /// A pool handed over already allocated gets one unset timestamp per
    /// buffer.
    fn from_handle(pool: PoolHandle<'a>) -> Self {
        let timestamps = vec![Timestamp::UNSET; pool.get().nb_buffers()];
        Self {
            pool,
            timestamps,
            start_ts: Timestamp::UNSET,
            callbacks_active: false,
            callback: None,
            clock: Box::new(SystemClock),
        }
    }

    /// Replaces the source of capture timestamps.
    pub fn with_clock(mut self, clock: impl Clock + 'a) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn is_pool_owned(&self) -> bool {
        matches!(self.pool, PoolHandle::Owned(_))
    }

    pub fn pool(&self) -> &(dyn BufferPool + 'a) {
        self.pool.get()
    }

    pub fn max_buffers(&self, frame_dim: &FrameDim) -> Result<usize> {
        self.pool.get().max_buffers(frame_dim)
    }

    /// Allocates `nb_buffers` buffers and as many unset timestamps. On
    /// failure both are released before the error is returned.
    #[instrument(skip(self, frame_dim), fields(frame_size = frame_dim.byte_size()))]
    pub fn allocate(&mut self, nb_buffers: usize, frame_dim: &FrameDim) -> Result<()> {
        check_frame_dim(frame_dim)?;

        if *frame_dim == self.frame_dim() && nb_buffers == self.nb_buffers() {
            if self.timestamps.len() == nb_buffers {
                return Ok(());
            }
            // Pool already holds the buffers; only the timestamps are missing
            if let Err(err) = self.size_timestamps(nb_buffers) {
                warn!("Timestamp allocation failed: {}", err);
                self.release();
                return Err(err);
            }
            return Ok(());
        }

        self.release();

        if let Err(err) = self.try_allocate(nb_buffers, frame_dim) {
            warn!("Buffer allocation failed: {}", err);
            self.release();
            return Err(err);
        }

        info!(
            "Frame ring ready: {} buffers of {} bytes",
            nb_buffers,
            frame_dim.byte_size()
        );
        Ok(())
    }

    fn try_allocate(&mut self, nb_buffers: usize, frame_dim: &FrameDim) -> Result<()> {
        self.pool.get_mut().allocate(nb_buffers, frame_dim)?;
        self.size_timestamps(nb_buffers)
    }

    fn size_timestamps(&mut self, nb_buffers: usize) -> Result<()> {
        self.timestamps.clear();
        self.timestamps
            .try_reserve_exact(nb_buffers)
            .map_err(|_| BufferError::AllocationFailed {
                index: 0,
                size: nb_buffers.saturating_mul(std::mem::size_of::<Timestamp>()),
            })?;
        self.timestamps.resize(nb_buffers, Timestamp::UNSET);
        Ok(())
    }

    /// Releases the buffers and forgets their timestamps. Every
    /// [`BufferPtr`] handed out so far becomes invalid.
    pub fn release(&mut self) {
        self.pool.get_mut().release();
        self.timestamps.clear();
    }

    /// Sets the acquisition start that buffer timestamps are reported
    /// relative to.
    pub fn set_start_timestamp(&mut self, start_ts: Timestamp) -> Result<()> {
        if !start_ts.is_set() {
            return Err(BufferError::InvalidValue("invalid start timestamp"));
        }
        debug!("Acquisition start at {}", start_ts);
        self.start_ts = start_ts;
        Ok(())
    }

    pub fn start_timestamp(&self) -> Timestamp {
        self.start_ts
    }

    pub fn set_callbacks_active(&mut self, active: bool) {
        self.callbacks_active = active;
    }

    pub fn callbacks_active(&self) -> bool {
        self.callbacks_active
    }

    /// Installs the consumer of frame-ready events, replacing any previous one.
    pub fn register_callback(&mut self, callback: impl FrameCallback + 'a) {
        self.callback = Some(Box::new(callback));
    }

    pub fn unregister_callback(&mut self) -> Option<Box<dyn FrameCallback + 'a>> {
        self.callback.take()
    }

    /// Called by the capture side once `frame_number` has been written into
    /// buffer `frame_number % nb_buffers()`.
    ///
    /// Returns `Ok(false)` without touching anything while callbacks are
    /// inactive. Otherwise stamps the slot with the current time and returns
    /// whether the registered callback accepted the frame (`false` if none
    /// is registered).
    pub fn new_frame_ready(&mut self, frame_number: u64) -> Result<bool> {
        if !self.callbacks_active {
            return Ok(false);
        }

        let nb_buffers = self.nb_buffers();
        if nb_buffers == 0 {
            return Err(BufferError::OutOfRange {
                index: frame_number,
                len: 0,
            });
        }

        let slot = (frame_number % nb_buffers as u64) as usize;
        let len = self.timestamps.len();
        let entry = self
            .timestamps
            .get_mut(slot)
            .ok_or(BufferError::OutOfRange {
                index: slot as u64,
                len,
            })?;
        let now = self.clock.now();
        *entry = now;

        let event = FrameReadyEvent {
            frame_number,
            buffer: self.pool.get().buffer_ptr(slot)?,
            frame_dim: self.frame_dim(),
            timestamp: now,
        };
        trace!(frame_number, slot, "New frame ready");

        let accepted = match self.callback.as_mut() {
            Some(callback) => callback.new_frame_ready(&event),
            None => false,
        };
        if accepted {
            metrics::counter!("hwbuffer_frames_ready_total").increment(1);
        } else {
            metrics::counter!("hwbuffer_frames_rejected_total").increment(1);
        }
        Ok(accepted)
    }

    /// Capture time of the frame last written to buffer `index`, relative to
    /// the acquisition start. Unset if the buffer has not been written since
    /// allocation.
    pub fn buffer_timestamp(&self, index: usize) -> Result<Timestamp> {
        let ts = self.timestamps[check_index(index, self.timestamps.len())?];
        if !ts.is_set() {
            return Ok(ts);
        }
        Ok(ts - self.start_ts)
    }

    pub fn frame_dim(&self) -> FrameDim {
        self.pool.get().frame_dim()
    }

    pub fn nb_buffers(&self) -> usize {
        self.pool.get().nb_buffers()
    }

    pub fn buffer_ptr(&self, index: usize) -> Result<BufferPtr> {
        self.pool.get().buffer_ptr(index)
    }

    pub fn clear_all_buffers(&mut self) -> Result<()> {
        self.pool.get_mut().clear_all_buffers()
    }
}
