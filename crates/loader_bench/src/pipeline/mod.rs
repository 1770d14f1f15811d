//! src/pipeline/mod.rs
//!
//! Backend pipelines: "build once, run() repeatedly".
//!
//! ```text
//!   ┌────────────────────┐        ┌────────────────────┐
//!   │ DirectReadPipeline │        │  AdapterPipeline   │
//!   │  file_root scan    │        │  ZeroCopyIterator  │
//!   │  read + to_device  │        │  NativeLoader      │
//!   └─────────┬──────────┘        └─────────┬──────────┘
//!             │      Pipeline::run()        │
//!             └─────────────┬───────────────┘
//!                           ↓
//!                  BatchResult (Batch | EndOfEpoch)
//! ```
//!
//! Only the direct-read variant knows its epoch length up front
//! (`epoch_size("FILE")`). The adapter-fed variant signals exhaustion itself, so the
//! harness runs it until `EndOfEpoch`.

mod external;
mod file_reader;

pub use external::AdapterPipeline;
pub use file_reader::{DirectReadPipeline, FileReaderConfig};

use crate::batch::BatchResult;
use crate::error::Result;

/// Name of the file reader inside the direct-read graph.
pub const FILE_READER: &str = "FILE";

/// A data-loading backend driven by the benchmark loop.
pub trait Pipeline {
    /// Short backend name for the report header.
    fn name(&self) -> &str;

    /// Prepares the pipeline. Must be called once before `run()`.
    fn build(&mut self) -> Result<()>;

    /// Produces the next batch.
    fn run(&mut self) -> Result<BatchResult>;

    /// Starts a new epoch.
    fn reset(&mut self) -> Result<()>;

    /// Samples per epoch of the named reader, when the backend knows it.
    fn epoch_size(&self, _reader: &str) -> Option<usize> {
        None
    }
}

impl<P: Pipeline + ?Sized> Pipeline for Box<P> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn build(&mut self) -> Result<()> {
        (**self).build()
    }

    fn run(&mut self) -> Result<BatchResult> {
        (**self).run()
    }

    fn reset(&mut self) -> Result<()> {
        (**self).reset()
    }

    fn epoch_size(&self, reader: &str) -> Option<usize> {
        (**self).epoch_size(reader)
    }
}
