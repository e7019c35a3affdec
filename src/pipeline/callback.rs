//! Frame-ready notifications and the consumers that receive them

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;
use flume::{Sender, TrySendError};
use tracing::{debug, warn};

use crate::buffer::BufferPtr;
use crate::capture::{FrameDim, Timestamp};

/// A buffer now holds a completed frame.
///
/// Built for each notification and handed to the registered callback; the
/// manager keeps no copy. `buffer` stays valid until the acquisition counter
/// wraps back onto the same slot or the buffers are released.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameReadyEvent {
    pub frame_number: u64,
    pub buffer: BufferPtr,
    pub frame_dim: FrameDim,
    pub timestamp: Timestamp,
}

/// Receiver of frame-ready notifications. Returns whether the frame was
/// accepted.
pub trait FrameCallback {
    fn new_frame_ready(&mut self, event: &FrameReadyEvent) -> bool;
}

impl<F> FrameCallback for F
where
    F: FnMut(&FrameReadyEvent) -> bool,
{
    fn new_frame_ready(&mut self, event: &FrameReadyEvent) -> bool {
        self(event)
    }
}

#[derive(Default)]
struct Stats {
    frames_sent: AtomicUsize,
    frames_dropped: AtomicUsize,
}

/// Forwards events to a consumer over a bounded channel.
///
/// Never blocks the capture path: a full channel rejects the frame and counts
/// it as dropped, which is how a lagging consumer shows up.
pub struct ChannelCallback {
    tx: Sender<FrameReadyEvent>,

    /// Statistics
    stats: CachePadded<Stats>,
}

impl ChannelCallback {
    pub fn new(tx: Sender<FrameReadyEvent>) -> Self {
        Self {
            tx,
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Creates a callback together with the receiving end of a channel
    /// holding at most `capacity` pending events.
    pub fn bounded(capacity: usize) -> (Self, flume::Receiver<FrameReadyEvent>) {
        let (tx, rx) = flume::bounded(capacity);
        (Self::new(tx), rx)
    }

    /// (sent, dropped)
    pub fn stats(&self) -> (usize, usize) {
        (
            self.stats.frames_sent.load(Ordering::Relaxed),
            self.stats.frames_dropped.load(Ordering::Relaxed),
        )
    }
}

impl FrameCallback for ChannelCallback {
    fn new_frame_ready(&mut self, event: &FrameReadyEvent) -> bool {
        match self.tx.try_send(*event) {
            Ok(()) => {
                self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) => {
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    frame_number = event.frame_number,
                    "Consumer lagging, frame notification dropped"
                );
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!(frame_number = event.frame_number, "Consumer gone");
                false
            }
        }
    }
}
