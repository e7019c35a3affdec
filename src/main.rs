//! Simulated acquisition over a host frame buffer ring

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use tracing::{info, warn};

use hwbuffer::{ChannelCallback, Config, FrameBufferManager, Timestamp};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hwbuffer=debug".into()),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("hwbuffer acquisition demo");

    // Load configuration
    let path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = Config::load(path.as_deref())?;
    hwbuffer::CONFIG.store(Arc::new(config.clone()));
    let acq = config.acquisition;
    let frame_dim = acq.frame_dim();

    let mut manager = FrameBufferManager::new();
    let max = manager.max_buffers(&frame_dim)?;
    info!(
        "Frame {:?}: {} bytes, at most {} buffers",
        frame_dim,
        frame_dim.byte_size(),
        max
    );
    manager.allocate(acq.buffer_count, &frame_dim)?;

    // Consumer gets half a ring of slack before it starts losing frames
    let (callback, rx) = ChannelCallback::bounded((acq.buffer_count / 2).max(1));
    manager.register_callback(callback);

    let consumer = tokio::spawn(async move {
        let mut received = 0u64;
        while let Ok(event) = rx.recv_async().await {
            received += 1;
            tracing::debug!(
                frame = event.frame_number,
                bytes = event.buffer.len(),
                captured = %event.timestamp,
                "Frame received"
            );
        }
        received
    });

    let period = Duration::from_secs_f64(1.0 / f64::from(acq.fps.max(1)));
    let mut ticker = tokio::time::interval(period);
    let nb_buffers = manager.nb_buffers() as u64;

    manager.set_start_timestamp(Timestamp::now())?;
    manager.set_callbacks_active(true);

    let mut rejected = 0u64;
    for frame_number in 0..acq.frame_count {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted after {} frames", frame_number);
                break;
            }
        }

        // Stand-in for the device: stamp the frame number into its slot
        let slot = (frame_number % nb_buffers) as usize;
        let buffer = manager.buffer_ptr(slot)?;
        // SAFETY: the pool is not reallocated during the loop, and nothing
        // else holds a reference into this slot while we write it.
        unsafe { buffer.as_mut_slice() }.fill(frame_number as u8);

        if !manager.new_frame_ready(frame_number)? {
            rejected += 1;
        }
    }

    manager.set_callbacks_active(false);
    let last = manager.buffer_timestamp(0)?;
    manager.unregister_callback();

    let received = consumer
        .await
        .map_err(|e| eyre!("Consumer task failed: {}", e))?;

    info!(
        "Acquisition done: {} frames received, {} rejected, slot 0 last written at {}",
        received, rejected, last
    );
    manager.release();
    Ok(())
}
