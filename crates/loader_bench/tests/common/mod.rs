#![allow(dead_code)]

use anyhow::anyhow;
use loader_bench::{Batch, BatchResult, LoaderError, Pipeline, Result};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tch::Device;

/// Pipeline with a fixed number of batches per epoch that records how it is driven.
pub struct ScriptedPipeline {
    pub batch_size: usize,
    /// Batches before `EndOfEpoch` (usize::MAX = never)
    pub epoch_batches: usize,
    /// Value reported for the "FILE" reader
    pub epoch_size: Option<usize>,
    /// 1-based `run()` call that fails
    pub fail_at: Option<usize>,
    /// Simulated per-batch latency
    pub latency: Duration,
    pub run_calls: usize,
    pub resets: usize,
    pub built: bool,
    cursor: usize,
}

impl ScriptedPipeline {
    pub fn new(batch_size: usize, epoch_batches: usize) -> Self {
        Self {
            batch_size,
            epoch_batches,
            epoch_size: None,
            fail_at: None,
            latency: Duration::ZERO,
            run_calls: 0,
            resets: 0,
            built: false,
            cursor: 0,
        }
    }

    pub fn with_epoch_size(mut self, samples: usize) -> Self {
        self.epoch_size = Some(samples);
        self
    }

    pub fn failing_at(mut self, call: usize) -> Self {
        self.fail_at = Some(call);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

impl Pipeline for ScriptedPipeline {
    fn name(&self) -> &str {
        "scripted"
    }

    fn build(&mut self) -> Result<()> {
        self.built = true;
        Ok(())
    }

    fn run(&mut self) -> Result<BatchResult> {
        if !self.built {
            return Err(LoaderError::PipelineNotBuilt("scripted".to_string()));
        }
        self.run_calls += 1;
        if self.fail_at == Some(self.run_calls) {
            return Err(anyhow!("injected failure at call {}", self.run_calls).into());
        }
        if self.cursor >= self.epoch_batches {
            self.cursor = 0;
            return Ok(BatchResult::EndOfEpoch);
        }
        self.cursor += 1;
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        Ok(BatchResult::Batch(Batch::new(
            Vec::new(),
            Batch::zero_labels(self.batch_size, Device::Cpu),
        )))
    }

    fn reset(&mut self) -> Result<()> {
        self.resets += 1;
        self.cursor = 0;
        Ok(())
    }

    fn epoch_size(&self, reader: &str) -> Option<usize> {
        (reader == "FILE").then_some(self.epoch_size).flatten()
    }
}

/// Writes a two-class dataset: `class_a` holds samples 0..3, `class_b` samples 3..5.
/// Sample `i` is `i + 1` bytes long.
pub fn write_dataset(root: &Path) -> anyhow::Result<()> {
    for (class, range) in [("class_a", 0..3), ("class_b", 3..5)] {
        let dir = root.join(class);
        fs::create_dir_all(&dir)?;
        for i in range {
            fs::write(dir.join(format!("{i}.JPEG")), vec![i as u8; i + 1])?;
        }
    }
    Ok(())
}

/// Lines of a captured report.
pub fn lines(out: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(out)
        .lines()
        .map(str::to_string)
        .collect()
}
