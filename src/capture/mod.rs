pub mod frame;
pub mod timestamp;

pub use frame::FrameDim;
pub use frame::PixelFormat;
pub use timestamp::{Clock, SystemClock, Timestamp};
