//! Throughput harness for GPU data-loading backends.
//!
//! Two interchangeable backends feed GPU-resident batches:
//! - a direct file-reading pipeline ([`pipeline::DirectReadPipeline`]), and
//! - a native storage-to-GPU loader wrapped by the zero-copy adapter
//!   ([`adapter::ZeroCopyIterator`], driven through [`pipeline::AdapterPipeline`]).
//!
//! [`bench::run_benchmark`] drives either one through the same [`pipeline::Pipeline`]
//! contract and reports windowed and mean images/second.

pub mod adapter;
pub mod batch;
pub mod bench;
pub mod error;
pub mod gpu;
pub mod logging;
pub mod native;
pub mod pipeline;
pub mod view;

pub use adapter::ZeroCopyIterator;
pub use batch::{Batch, BatchResult, DType, DeviceArray};
pub use bench::{run_benchmark, BatchTarget, BenchmarkConfig, BenchmarkReport};
pub use error::{LoaderError, Result};
pub use native::{LoaderConfig, NativeLoader, RawDescriptor};
pub use pipeline::{AdapterPipeline, DirectReadPipeline, FileReaderConfig, Pipeline};
pub use view::DeviceArrayView;
