//! Frame buffer pools for image acquisition.
//!
//! A capture device writes frames into fixed-size buffers supplied by a
//! [`BufferPool`](buffer::BufferPool). The
//! [`FrameBufferManager`](pipeline::FrameBufferManager) wraps a pool, maps the
//! acquisition frame counter onto its ring of buffers, records capture
//! timestamps and emits frame-ready notifications.

pub mod buffer;
pub mod capture;
pub mod error;
pub mod pipeline;

use std::path::Path;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

pub use buffer::{BufferPool, BufferPtr, HostBufferPool};
pub use capture::{FrameDim, PixelFormat, Timestamp};
pub use error::{BufferError, Result};
pub use pipeline::{ChannelCallback, FrameBufferManager, FrameCallback, FrameReadyEvent};

use buffer::MemoryBudget;

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// System configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub acquisition: AcquisitionConfig,
    pub memory: MemoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub buffer_count: usize,
    pub fps: u32,
    pub frame_count: u64,
}

impl AcquisitionConfig {
    pub fn frame_dim(&self) -> FrameDim {
        FrameDim::new(self.width, self.height, self.format)
    }
}

/// Share of total system memory host buffers may take
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    pub budget_numerator: u64,
    pub budget_denominator: u64,
}

impl MemoryConfig {
    pub fn budget(&self) -> Result<MemoryBudget> {
        MemoryBudget::new(self.budget_numerator, self.budget_denominator)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            acquisition: AcquisitionConfig {
                width: 1024,
                height: 1024,
                format: PixelFormat::Mono16,
                buffer_count: 16,
                fps: 30,
                frame_count: 100,
            },
            memory: MemoryConfig {
                budget_numerator: 3,
                budget_denominator: 4,
            },
        }
    }
}

impl Config {
    /// Layers the defaults, an optional TOML file and `HWBUF_*` environment
    /// variables (`HWBUF_ACQUISITION__FPS=60`).
    pub fn load(path: Option<&Path>) -> std::result::Result<Self, config::ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config: Config = builder
            .add_source(
                config::Environment::with_prefix("HWBUF")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config
            .memory
            .budget()
            .map_err(|e| config::ConfigError::Message(e.to_string()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_round_trip_through_loader() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.acquisition.buffer_count, 16);
        assert_eq!(config.acquisition.format, PixelFormat::Mono16);
        assert_eq!(config.memory.budget().unwrap(), MemoryBudget::default());
    }

    #[test]
    fn file_overrides_defaults() {
        let path = std::env::temp_dir().join(format!("hwbuffer-{}.toml", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[acquisition]\nwidth = 640\nheight = 480\nformat = \"Rgb24\"\n\n[memory]\nbudget_numerator = 1\nbudget_denominator = 2"
        )
        .unwrap();
        drop(file);

        let config = Config::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(
            config.acquisition.frame_dim(),
            FrameDim::new(640, 480, PixelFormat::Rgb24)
        );
        assert_eq!(config.acquisition.fps, 30);
        assert_eq!(config.memory.budget().unwrap(), MemoryBudget::new(1, 2).unwrap());
    }

    #[test]
    fn bad_budget_is_rejected() {
        let path = std::env::temp_dir().join(format!("hwbuffer-bad-{}.toml", std::process::id()));
        std::fs::write(&path, "[memory]\nbudget_numerator = 5\nbudget_denominator = 4\n").unwrap();
        let result = Config::load(Some(&path));
        std::fs::remove_file(&path).unwrap();
        assert!(result.is_err());
    }
}
