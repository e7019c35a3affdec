pub mod callback;
pub mod manager;

pub use callback::{ChannelCallback, FrameCallback, FrameReadyEvent};
pub use manager::FrameBufferManager;
