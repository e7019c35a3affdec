use std::cell::{Cell, RefCell};
use std::io;
use std::rc::Rc;
use std::time::Duration;

use hwbuffer::buffer::{heap_block, HostMemory, MemoryBudget};
use hwbuffer::capture::Clock;
use hwbuffer::error::ErrorKind;
use hwbuffer::{
    BufferError, BufferPool, FrameBufferManager, FrameDim, FrameReadyEvent, HostBufferPool,
    PixelFormat, Timestamp,
};

const MIB: u64 = 1024 * 1024;

/// Machine with a fixed amount of memory whose `fail_at`-th buffer
/// acquisition fails.
struct FakeMemory {
    total: u64,
    fail_at: Option<usize>,
}

impl HostMemory for FakeMemory {
    fn total_memory(&self) -> io::Result<u64> {
        Ok(self.total)
    }

    fn acquire(&self, index: usize, size: usize) -> hwbuffer::Result<Box<[u8]>> {
        if self.fail_at == Some(index) {
            return Err(BufferError::AllocationFailed { index, size });
        }
        heap_block(index, size)
    }
}

#[derive(Clone, Default)]
struct ManualClock(Rc<Cell<Duration>>);

impl ManualClock {
    fn set_millis(&self, millis: u64) {
        self.0.set(Duration::from_millis(millis));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_duration(self.0.get())
    }
}

fn host_pool(total: u64) -> HostBufferPool<FakeMemory> {
    HostBufferPool::with_memory_budget(
        FakeMemory {
            total,
            fail_at: None,
        },
        MemoryBudget::default(),
    )
}

fn kib_frame() -> FrameDim {
    FrameDim::new(32, 32, PixelFormat::Mono8)
}

/// Manager over a 64 MiB fake host, recording every event it emits.
fn recording_manager(
    clock: &ManualClock,
) -> (FrameBufferManager<'static>, Rc<RefCell<Vec<FrameReadyEvent>>>) {
    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&events);
    let mut mgr =
        FrameBufferManager::with_owned_pool(Box::new(host_pool(64 * MIB))).with_clock(clock.clone());
    mgr.register_callback(move |ev: &FrameReadyEvent| {
        sink.borrow_mut().push(*ev);
        true
    });
    (mgr, events)
}

#[test]
fn allocation_postconditions() {
    let mut mgr = FrameBufferManager::with_owned_pool(Box::new(host_pool(64 * MIB)));
    assert!(mgr.is_pool_owned());
    for (n, dim) in [
        (1, kib_frame()),
        (7, FrameDim::new(640, 480, PixelFormat::Mono16)),
        (3, FrameDim::new(100, 100, PixelFormat::Rgb24)),
    ] {
        mgr.allocate(n, &dim).unwrap();
        assert_eq!(mgr.nb_buffers(), n);
        assert_eq!(mgr.frame_dim(), dim);
        for i in 0..n {
            assert_eq!(mgr.buffer_ptr(i).unwrap().len(), dim.byte_size());
            assert!(!mgr.buffer_timestamp(i).unwrap().is_set());
        }
    }
}

#[test]
fn repeated_allocation_keeps_buffers() {
    let mut mgr = FrameBufferManager::with_owned_pool(Box::new(host_pool(64 * MIB)));
    mgr.allocate(4, &kib_frame()).unwrap();
    let before: Vec<_> = (0..4).map(|i| mgr.buffer_ptr(i).unwrap()).collect();
    mgr.allocate(4, &kib_frame()).unwrap();
    let after: Vec<_> = (0..4).map(|i| mgr.buffer_ptr(i).unwrap()).collect();
    assert_eq!(before, after);
    assert!(after.iter().all(|ptr| mgr.pool().is_current(ptr)));
}

#[test]
fn release_invalidates_pointers() {
    let mut mgr = FrameBufferManager::with_owned_pool(Box::new(host_pool(64 * MIB)));
    mgr.allocate(2, &kib_frame()).unwrap();
    let ptr = mgr.buffer_ptr(1).unwrap();
    mgr.release();
    assert_eq!(mgr.nb_buffers(), 0);
    assert!(!mgr.pool().is_current(&ptr));
    let err = mgr.buffer_ptr(0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutOfRange);
}

/// Drives a manager whose pool already held 4 buffers before it was wrapped
/// through the same steps as a freshly allocated one.
fn check_preallocated_ring(mgr: &mut FrameBufferManager<'_>, clock: &ManualClock) {
    assert_eq!(mgr.nb_buffers(), 4);
    for i in 0..4 {
        assert!(!mgr.buffer_timestamp(i).unwrap().is_set());
    }

    let before: Vec<_> = (0..4).map(|i| mgr.buffer_ptr(i).unwrap()).collect();
    mgr.allocate(4, &kib_frame()).unwrap();
    let after: Vec<_> = (0..4).map(|i| mgr.buffer_ptr(i).unwrap()).collect();
    assert_eq!(before, after);

    mgr.set_start_timestamp(Timestamp::from_duration(Duration::from_millis(100)))
        .unwrap();
    mgr.set_callbacks_active(true);
    clock.set_millis(400);
    assert!(!mgr.new_frame_ready(5).unwrap());
    assert_eq!(
        mgr.buffer_timestamp(1).unwrap().as_duration(),
        Some(Duration::from_millis(300))
    );
    assert!(!mgr.buffer_timestamp(0).unwrap().is_set());
}

#[test]
fn wraps_borrowed_pool_already_allocated() {
    let clock = ManualClock::default();
    let mut pool = host_pool(64 * MIB);
    pool.allocate(4, &kib_frame()).unwrap();

    let mut mgr = FrameBufferManager::with_pool(&mut pool).with_clock(clock.clone());
    check_preallocated_ring(&mut mgr, &clock);
    drop(mgr);
    assert_eq!(pool.nb_buffers(), 4);
}

#[test]
fn wraps_owned_pool_already_allocated() {
    let clock = ManualClock::default();
    let mut pool = host_pool(64 * MIB);
    pool.allocate(4, &kib_frame()).unwrap();

    let mut mgr = FrameBufferManager::with_owned_pool(Box::new(pool)).with_clock(clock.clone());
    assert!(mgr.is_pool_owned());
    check_preallocated_ring(&mut mgr, &clock);
}

#[test]
fn frame_ready_on_preallocated_pool_without_allocate() {
    let mut pool = host_pool(64 * MIB);
    pool.allocate(2, &kib_frame()).unwrap();
    let mut mgr = FrameBufferManager::with_pool(&mut pool);
    mgr.set_callbacks_active(true);
    assert!(!mgr.new_frame_ready(3).unwrap());
    assert!(mgr.buffer_timestamp(1).unwrap().is_set());
}

#[test]
fn partial_failure_rolls_back_for_every_k() {
    let n = 5;
    for k in 0..n {
        let mut pool = HostBufferPool::with_memory_budget(
            FakeMemory {
                total: 64 * MIB,
                fail_at: Some(k),
            },
            MemoryBudget::default(),
        );
        let mut mgr = FrameBufferManager::with_pool(&mut pool);
        let err = mgr.allocate(n, &kib_frame()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Error);
        assert_eq!(mgr.nb_buffers(), 0, "failure at buffer {k}");
        assert!(mgr.buffer_timestamp(0).is_err());
        drop(mgr);
        assert_eq!(pool.nb_buffers(), 0);
        assert!(!pool.frame_dim().is_set());
    }
}

#[test]
fn max_buffers_shrinks_with_frame_size() {
    let mgr = FrameBufferManager::with_owned_pool(Box::new(host_pool(256 * MIB)));
    let sizes = [
        FrameDim::new(64, 64, PixelFormat::Mono8),
        FrameDim::new(64, 64, PixelFormat::Mono16),
        FrameDim::new(640, 480, PixelFormat::Yuyv4),
        FrameDim::new(1920, 1080, PixelFormat::Rgba32),
    ];
    let maxima: Vec<_> = sizes
        .iter()
        .map(|dim| mgr.max_buffers(dim).unwrap())
        .collect();
    assert!(maxima.windows(2).all(|w| w[0] >= w[1]), "{maxima:?}");
    // 256 MiB / 4 KiB = 65536 blocks, three quarters of that
    assert_eq!(maxima[0], 49152);
}

#[test]
fn frame_numbers_wrap_around_the_ring() {
    let clock = ManualClock::default();
    let (mut mgr, events) = recording_manager(&clock);
    let n = 4u64;
    mgr.allocate(n as usize, &kib_frame()).unwrap();
    mgr.set_callbacks_active(true);

    for f in n..2 * n {
        assert!(mgr.new_frame_ready(f).unwrap());
    }

    let events = events.borrow();
    for (slot, ev) in events.iter().enumerate() {
        assert_eq!(ev.frame_number, n + slot as u64);
        assert_eq!(ev.buffer, mgr.buffer_ptr(slot).unwrap());
        assert_eq!(ev.frame_dim, kib_frame());
    }
}

#[test]
fn inactive_callbacks_do_nothing() {
    let clock = ManualClock::default();
    clock.set_millis(10);
    let (mut mgr, events) = recording_manager(&clock);
    mgr.allocate(2, &kib_frame()).unwrap();

    assert!(!mgr.new_frame_ready(0).unwrap());
    assert!(!mgr.buffer_timestamp(0).unwrap().is_set());
    assert!(events.borrow().is_empty());

    mgr.set_callbacks_active(true);
    assert!(mgr.new_frame_ready(0).unwrap());
    mgr.set_callbacks_active(false);
    assert!(!mgr.new_frame_ready(1).unwrap());
    assert!(!mgr.buffer_timestamp(1).unwrap().is_set());
    assert_eq!(events.borrow().len(), 1);
}

#[test]
fn timestamps_are_relative_to_start() {
    let clock = ManualClock::default();
    let (mut mgr, _events) = recording_manager(&clock);
    mgr.allocate(3, &kib_frame()).unwrap();
    mgr.set_start_timestamp(Timestamp::from_duration(Duration::from_millis(1_000)))
        .unwrap();
    mgr.set_callbacks_active(true);

    assert!(!mgr.buffer_timestamp(2).unwrap().is_set());

    clock.set_millis(1_250);
    mgr.new_frame_ready(2).unwrap();
    assert_eq!(
        mgr.buffer_timestamp(2).unwrap().as_duration(),
        Some(Duration::from_millis(250))
    );
    assert!(matches!(
        mgr.buffer_timestamp(3),
        Err(BufferError::OutOfRange { index: 3, len: 3 })
    ));
}

#[test]
fn overwrite_scenario() {
    let clock = ManualClock::default();
    let (mut mgr, events) = recording_manager(&clock);
    mgr.allocate(4, &kib_frame()).unwrap();
    assert_eq!(kib_frame().byte_size(), 1024);
    mgr.set_start_timestamp(Timestamp::from_duration(Duration::ZERO))
        .unwrap();
    mgr.set_callbacks_active(true);

    clock.set_millis(100);
    assert!(mgr.new_frame_ready(0).unwrap());
    clock.set_millis(200);
    assert!(mgr.new_frame_ready(1).unwrap());
    clock.set_millis(500);
    assert!(mgr.new_frame_ready(4).unwrap());

    assert_eq!(
        mgr.buffer_timestamp(0).unwrap().as_duration(),
        Some(Duration::from_millis(500))
    );
    assert_eq!(
        mgr.buffer_timestamp(1).unwrap().as_duration(),
        Some(Duration::from_millis(200))
    );
    assert!(!mgr.buffer_timestamp(2).unwrap().is_set());

    let events = events.borrow();
    assert_eq!(events.len(), 3);
    assert_eq!(events[2].buffer, events[0].buffer);
}

#[test]
fn invalid_request_scenario() {
    let mut mgr = FrameBufferManager::with_owned_pool(Box::new(host_pool(64 * MIB)));
    let err = mgr.allocate(0, &kib_frame()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidCount);

    let empty = FrameDim::new(0, 32, PixelFormat::Mono8);
    let err = mgr.allocate(5, &empty).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidGeometry);
    assert_eq!(mgr.nb_buffers(), 0);
}

#[test]
fn channel_consumer_receives_frames() {
    let (callback, rx) = hwbuffer::ChannelCallback::bounded(8);
    let mut mgr = FrameBufferManager::with_owned_pool(Box::new(host_pool(64 * MIB)));
    mgr.register_callback(callback);
    mgr.allocate(2, &kib_frame()).unwrap();
    mgr.set_callbacks_active(true);

    for f in 0..3 {
        assert!(mgr.new_frame_ready(f).unwrap());
    }
    let received: Vec<_> = rx.drain().map(|ev| ev.frame_number).collect();
    assert_eq!(received, vec![0, 1, 2]);

    mgr.unregister_callback();
    assert!(!mgr.new_frame_ready(3).unwrap());
}
