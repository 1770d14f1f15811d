//! Direct-read backend: a file-reading graph that pulls encoded samples straight
//! from disk and copies them into device memory.

use super::{Pipeline, FILE_READER};
use crate::batch::{Batch, BatchResult, DeviceArray};
use crate::error::{LoaderError, Result};
use anyhow::Context;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::fs;
use std::path::PathBuf;
use tch::{Device, Tensor};
use walkdir::WalkDir;

const NAME: &str = "direct";

/// Configuration of the direct-read pipeline.
#[derive(Debug, Clone)]
pub struct FileReaderConfig {
    /// Root directory with one subdirectory per class
    pub file_root: PathBuf,
    /// Samples per batch (must be > 0)
    pub batch_size: usize,
    /// Reshuffle sample order every epoch
    pub random_shuffle: bool,
    /// Pad the final partial batch by repeating its last sample
    pub pad_last_batch: bool,
    /// Shuffle seed (None = seeded from the OS)
    pub seed: Option<u64>,
    /// Device the samples are copied to
    pub device: Device,
    /// Reader name answered by `epoch_size`
    pub reader_name: String,
}

impl Default for FileReaderConfig {
    fn default() -> Self {
        Self {
            file_root: PathBuf::new(),
            batch_size: 1,
            random_shuffle: true,
            pad_last_batch: true,
            seed: None,
            device: Device::Cuda(0),
            reader_name: FILE_READER.to_string(),
        }
    }
}

impl FileReaderConfig {
    pub fn builder() -> FileReaderConfigBuilder {
        FileReaderConfigBuilder::default()
    }
}

/// Builder for [`FileReaderConfig`] with method chaining
#[derive(Default)]
pub struct FileReaderConfigBuilder {
    config: FileReaderConfig,
}

impl FileReaderConfigBuilder {
    pub fn file_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.file_root = root.into();
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    pub fn random_shuffle(mut self, shuffle: bool) -> Self {
        self.config.random_shuffle = shuffle;
        self
    }

    pub fn pad_last_batch(mut self, pad: bool) -> Self {
        self.config.pad_last_batch = pad;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = Some(seed);
        self
    }

    pub fn device(mut self, device: Device) -> Self {
        self.config.device = device;
        self
    }

    pub fn build(self) -> FileReaderConfig {
        self.config
    }
}

/// File-reading pipeline over a class-per-directory dataset.
///
/// Labels are the index of the sample's class directory in sorted order.
pub struct DirectReadPipeline {
    config: FileReaderConfig,
    files: Vec<(PathBuf, i32)>,
    order: Vec<usize>,
    cursor: usize,
    rng: StdRng,
    built: bool,
}

impl DirectReadPipeline {
    pub fn new(config: FileReaderConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            config,
            files: Vec::new(),
            order: Vec::new(),
            cursor: 0,
            rng,
            built: false,
        }
    }

    fn scan(&self) -> Result<Vec<(PathBuf, i32)>> {
        let root = &self.config.file_root;
        let init_error = |reason: String| LoaderError::backend_init(NAME, reason);

        if !root.is_dir() {
            return Err(init_error(format!("not a directory: {}", root.display())));
        }

        let mut classes = Vec::new();
        for entry in fs::read_dir(root)
            .with_context(|| format!("Failed to read directory: {}", root.display()))?
        {
            let path = entry
                .with_context(|| format!("Failed to read entry in: {}", root.display()))?
                .path();
            if path.is_dir() {
                classes.push(path);
            }
        }
        classes.sort();

        let mut files = Vec::new();
        for (label, class_dir) in classes.iter().enumerate() {
            for entry in WalkDir::new(class_dir).follow_links(true).sort_by_file_name() {
                let entry = entry.map_err(|e| init_error(e.to_string()))?;
                if entry.file_type().is_file() {
                    files.push((entry.into_path(), label as i32));
                }
            }
        }

        if files.is_empty() {
            return Err(init_error(format!(
                "no samples under {} (expected one subdirectory per class)",
                root.display()
            )));
        }
        Ok(files)
    }

    fn rewind(&mut self) {
        self.cursor = 0;
        if self.config.random_shuffle {
            self.order.shuffle(&mut self.rng);
        }
    }

    fn next_indices(&mut self) -> Option<Vec<usize>> {
        let total = self.order.len();
        if self.cursor >= total {
            return None;
        }

        let end = (self.cursor + self.config.batch_size).min(total);
        let mut indices = self.order[self.cursor..end].to_vec();
        self.cursor = end;

        if self.config.pad_last_batch {
            if let Some(&last) = indices.last() {
                indices.resize(self.config.batch_size, last);
            }
            // Padded readers roll straight into the next epoch.
            if self.cursor >= total {
                self.rewind();
            }
        }
        Some(indices)
    }
}

impl Pipeline for DirectReadPipeline {
    fn name(&self) -> &str {
        NAME
    }

    fn build(&mut self) -> Result<()> {
        if self.config.batch_size == 0 {
            return Err(LoaderError::backend_init(NAME, "batch_size must be > 0"));
        }
        self.files = self.scan()?;
        self.order = (0..self.files.len()).collect();
        if self.config.random_shuffle {
            self.order.shuffle(&mut self.rng);
        }
        self.cursor = 0;
        self.built = true;

        tracing::debug!(
            root = %self.config.file_root.display(),
            samples = self.files.len(),
            shuffle = self.config.random_shuffle,
            pad_last_batch = self.config.pad_last_batch,
            "file reader built"
        );
        Ok(())
    }

    fn run(&mut self) -> Result<BatchResult> {
        if !self.built {
            return Err(LoaderError::PipelineNotBuilt(NAME.to_string()));
        }

        let Some(indices) = self.next_indices() else {
            self.rewind();
            return Ok(BatchResult::EndOfEpoch);
        };

        let device = self.config.device;
        let mut images = Vec::with_capacity(indices.len());
        let mut labels = Vec::with_capacity(indices.len());
        for index in indices {
            let (path, label) = &self.files[index];
            let bytes = fs::read(path)
                .with_context(|| format!("Failed to read sample: {}", path.display()))?;
            images.push(DeviceArray::Owned(Tensor::from_slice(&bytes).to_device(device)));
            labels.push(*label);
        }
        let labels = Tensor::from_slice(&labels).to_device(device);

        Ok(BatchResult::Batch(Batch::new(images, labels)))
    }

    fn reset(&mut self) -> Result<()> {
        if !self.built {
            return Err(LoaderError::PipelineNotBuilt(NAME.to_string()));
        }
        self.rewind();
        Ok(())
    }

    fn epoch_size(&self, reader: &str) -> Option<usize> {
        (self.built && reader == self.config.reader_name).then_some(self.files.len())
    }
}
