//! src/native/mod.rs
//!
//! Native bulk loaders: handle-based storage-to-device data movers with an
//! `init → next* → term` lifecycle.
//!
//! Two implementations share the [`NativeLoader`] contract:
//! - [`DylibLoader`]: the storage-to-GPU loader shipped as a C shared library,
//!   bound at run time.
//! - [`HostLoader`]: an in-process loader serving files (or synthetic samples) from
//!   host memory. Useful on machines without the storage device and in tests.
//!
//! Example:
//! ```ignore
//! let config = LoaderConfig::builder()
//!     .data_dir("/mnt/imagenet/train")
//!     .batch_size(256)
//!     .queue_depth(1024)
//!     .build();
//! let (loader, total) = native::open(&config)?;
//! ```

mod dylib;
mod host;

pub use dylib::DylibLoader;
pub use host::HostLoader;

use crate::batch::DType;
use crate::error::{LoaderError, Result};
use std::path::PathBuf;
use tch::Device;

/// Backend id served by [`HostLoader`]. Every other id is passed to the shared library.
pub const HOST_BACKEND: &str = "host";

/// One sample buffer as reported by a native loader. The memory stays owned by
/// the loader.
#[derive(Debug, Clone)]
pub struct RawDescriptor {
    pub ptr: *const u8,
    pub shape: Vec<i64>,
    pub dtype: DType,
    pub device: Device,
}

impl RawDescriptor {
    pub fn numel(&self) -> usize {
        self.shape.iter().map(|&d| d.max(0) as usize).product()
    }

    pub fn size_bytes(&self) -> usize {
        self.numel() * self.dtype.size_in_bytes()
    }
}

/// A running native loader handle.
///
/// `next` yields one batch worth of descriptors. The final batch of an epoch may be
/// short or padded; that is the loader's decision. After `term` the handle is dead
/// and every pointer it returned is invalid.
pub trait NativeLoader {
    /// Backend id this handle was initialised with.
    fn backend(&self) -> &str;

    fn next(&mut self) -> Result<Vec<RawDescriptor>>;

    /// Releases the handle. Must be idempotent.
    fn term(&mut self);
}

/// Construction parameters of a native loader handle.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Storage device path (e.g. `/dev/libnvm0`)
    pub device: String,
    /// Directory holding the samples
    pub data_dir: PathBuf,
    /// Backend id understood by the loader
    pub backend: String,
    /// Samples per `next()` call (must be > 0)
    pub batch_size: usize,
    /// Outstanding I/O requests per queue
    pub queue_depth: u32,
    /// Number of GPU-side I/O queues
    pub gpu_nqueues: u32,
    /// Mount point hint for file-system backends, empty if unused
    pub mnt: String,
    /// Device the loader places samples on
    pub gpu: Device,
    /// Shared library implementing the loader ABI
    pub library: PathBuf,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            device: "/dev/libnvm0".to_string(),
            data_dir: PathBuf::new(),
            backend: "libnvm-gpu".to_string(),
            batch_size: 1,
            queue_depth: 1024,
            gpu_nqueues: 6,
            mnt: String::new(),
            gpu: Device::Cuda(0),
            library: PathBuf::from("libsil.so"),
        }
    }
}

impl LoaderConfig {
    pub fn builder() -> LoaderConfigBuilder {
        LoaderConfigBuilder::default()
    }

    /// Rejects configurations no backend could start with.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(LoaderError::backend_init(&self.backend, "batch_size must be > 0"));
        }
        if self.backend.is_empty() {
            return Err(LoaderError::backend_init("", "backend id is empty"));
        }
        if self.data_dir.as_os_str().is_empty() {
            return Err(LoaderError::backend_init(&self.backend, "data_dir is not set"));
        }
        Ok(())
    }
}

/// Builder for [`LoaderConfig`] with method chaining
#[derive(Default)]
pub struct LoaderConfigBuilder {
    config: LoaderConfig,
}

impl LoaderConfigBuilder {
    pub fn device(mut self, device: impl Into<String>) -> Self {
        self.config.device = device.into();
        self
    }

    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.data_dir = dir.into();
        self
    }

    pub fn backend(mut self, backend: impl Into<String>) -> Self {
        self.config.backend = backend.into();
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    pub fn queue_depth(mut self, depth: u32) -> Self {
        self.config.queue_depth = depth;
        self
    }

    /// Set the parallelism width (number of GPU I/O queues)
    pub fn gpu_nqueues(mut self, nqueues: u32) -> Self {
        self.config.gpu_nqueues = nqueues;
        self
    }

    pub fn mnt(mut self, mnt: impl Into<String>) -> Self {
        self.config.mnt = mnt.into();
        self
    }

    pub fn gpu(mut self, device: Device) -> Self {
        self.config.gpu = device;
        self
    }

    pub fn library(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.library = path.into();
        self
    }

    pub fn build(self) -> LoaderConfig {
        self.config
    }
}

/// Initialises the loader selected by `config.backend` and returns it together with
/// the number of samples it will yield per epoch.
pub fn open(config: &LoaderConfig) -> Result<(Box<dyn NativeLoader>, usize)> {
    config.validate()?;
    if config.backend == HOST_BACKEND {
        let loader = HostLoader::init(config)?;
        let total = loader.sample_count();
        Ok((Box::new(loader), total))
    } else {
        let (loader, total) = DylibLoader::init(config)?;
        Ok((Box::new(loader), total))
    }
}
