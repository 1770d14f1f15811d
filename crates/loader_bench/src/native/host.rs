use super::{LoaderConfig, NativeLoader, RawDescriptor, HOST_BACKEND};
use crate::batch::DType;
use crate::error::{LoaderError, Result};
use anyhow::{anyhow, Context};
use std::fs;
use tch::Device;
use walkdir::WalkDir;

/// In-process loader serving samples from host memory.
///
/// Every regular file under `data_dir` is read once at init; `next()` then walks the
/// samples in order, returning a short final batch and wrapping to the start of
/// the next epoch on the following call.
pub struct HostLoader {
    samples: Vec<Vec<u8>>,
    batch_size: usize,
    cursor: usize,
    terminated: bool,
}

impl HostLoader {
    /// Reads all files under `config.data_dir` (recursively, sorted by path).
    pub fn init(config: &LoaderConfig) -> Result<Self> {
        let dir = &config.data_dir;
        if !dir.is_dir() {
            return Err(LoaderError::backend_init(
                HOST_BACKEND,
                format!("not a directory: {}", dir.display()),
            ));
        }

        let mut samples = Vec::new();
        for entry in WalkDir::new(dir).follow_links(true).sort_by_file_name() {
            let entry = entry.map_err(|e| LoaderError::backend_init(HOST_BACKEND, e))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let bytes = fs::read(entry.path())
                .with_context(|| format!("Failed to read sample: {}", entry.path().display()))?;
            samples.push(bytes);
        }

        tracing::debug!(
            dir = %dir.display(),
            samples = samples.len(),
            "host loader initialised"
        );
        Ok(Self::from_samples(samples, config.batch_size))
    }

    /// `total` samples of `sample_bytes` each. Sample `i` is filled with `i as u8`.
    pub fn synthetic(total: usize, sample_bytes: usize, batch_size: usize) -> Self {
        let samples = (0..total).map(|i| vec![i as u8; sample_bytes]).collect();
        Self::from_samples(samples, batch_size)
    }

    fn from_samples(samples: Vec<Vec<u8>>, batch_size: usize) -> Self {
        Self {
            samples,
            batch_size: batch_size.max(1),
            cursor: 0,
            terminated: false,
        }
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}

impl NativeLoader for HostLoader {
    fn backend(&self) -> &str {
        HOST_BACKEND
    }

    fn next(&mut self) -> Result<Vec<RawDescriptor>> {
        if self.terminated {
            return Err(anyhow!("host loader used after term").into());
        }
        if self.samples.is_empty() {
            return Ok(Vec::new());
        }
        if self.cursor >= self.samples.len() {
            self.cursor = 0;
        }

        let end = (self.cursor + self.batch_size).min(self.samples.len());
        let batch = self.samples[self.cursor..end]
            .iter()
            .map(|sample| RawDescriptor {
                ptr: sample.as_ptr(),
                shape: vec![sample.len() as i64],
                dtype: DType::U8,
                device: Device::Cpu,
            })
            .collect();
        self.cursor = end;
        Ok(batch)
    }

    fn term(&mut self) {
        if !self.terminated {
            self.samples = Vec::new();
            self.terminated = true;
        }
    }
}
