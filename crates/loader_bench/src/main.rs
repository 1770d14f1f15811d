//! Benchmark loading data onto the GPU with a direct file reader or the zero-copy
//! native storage loader.
//!
//! ```bash
//! loader_bench --batchsize 256 direct --datadir /data/imagenet/train
//! loader_bench --batchsize 256 --batches 500 adapter --datadir /data/imagenet/train
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use loader_bench::native::LoaderConfig;
use loader_bench::pipeline::{AdapterPipeline, DirectReadPipeline, FileReaderConfig, Pipeline};
use loader_bench::{gpu, logging, run_benchmark, BenchmarkConfig};
use std::io;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "loader_bench")]
#[command(version)]
#[command(about = "Benchmark loading data with a direct file reader or a zero-copy storage loader", long_about = None)]
struct Cli {
    /// The number of samples per batch
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    batchsize: u64,

    /// The number of batches to load; default loads the entire dataset
    #[arg(long)]
    batches: Option<usize>,

    /// CUDA device receiving the batches
    #[arg(long, default_value = "0")]
    device_id: usize,

    /// Enable debug logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    dataloader: Dataloader,
}

#[derive(Subcommand, Debug)]
enum Dataloader {
    /// Use the direct file reader for loading data
    #[command(alias = "dali")]
    Direct {
        /// The directory from which to load files
        #[arg(long)]
        datadir: PathBuf,

        /// Keep the on-disk sample order
        #[arg(long, default_value = "false")]
        no_shuffle: bool,

        /// Emit a short final batch and signal end of epoch instead of padding
        #[arg(long, default_value = "false")]
        no_pad: bool,

        /// Shuffle seed
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Use the zero-copy native storage loader for loading data
    #[command(alias = "aisio")]
    Adapter {
        /// The directory from which to load files
        #[arg(long)]
        datadir: PathBuf,

        /// Storage device the loader reads from
        #[arg(long, default_value = "/dev/libnvm0")]
        device: String,

        /// Loader backend id ("host" serves files from host memory)
        #[arg(long, default_value = "libnvm-gpu")]
        backend: String,

        /// Number of GPU I/O queues
        #[arg(long, default_value = "6")]
        gpu_nqueues: u32,

        /// Outstanding requests per I/O queue
        #[arg(long, default_value = "1024")]
        queue_depth: u32,

        /// Mount point hint for file-system backends
        #[arg(long, default_value = "")]
        mnt: String,

        /// Shared library implementing the loader
        #[arg(long, default_value = "libsil.so", env = "SIL_LIBRARY")]
        library: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose)?;

    let device = gpu::select_device(cli.device_id);
    if let Some(name) = gpu::device_name(cli.device_id) {
        info!(gpu = %name, ?device, "target device");
    }

    let batch_size = cli.batchsize as usize;
    let mut pipeline: Box<dyn Pipeline> = match cli.dataloader {
        Dataloader::Direct {
            datadir,
            no_shuffle,
            no_pad,
            seed,
        } => {
            let mut builder = FileReaderConfig::builder()
                .file_root(datadir)
                .batch_size(batch_size)
                .random_shuffle(!no_shuffle)
                .pad_last_batch(!no_pad)
                .device(device);
            if let Some(seed) = seed {
                builder = builder.seed(seed);
            }
            Box::new(DirectReadPipeline::new(builder.build()))
        }
        Dataloader::Adapter {
            datadir,
            device: storage_device,
            backend,
            gpu_nqueues,
            queue_depth,
            mnt,
            library,
        } => {
            let config = LoaderConfig::builder()
                .device(storage_device)
                .data_dir(datadir)
                .backend(backend)
                .batch_size(batch_size)
                .gpu_nqueues(gpu_nqueues)
                .queue_depth(queue_depth)
                .mnt(mnt)
                .gpu(device)
                .library(library)
                .build();
            Box::new(AdapterPipeline::new(config))
        }
    };

    let config = BenchmarkConfig::builder()
        .batch_size(batch_size)
        .batches(cli.batches)
        .build();

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let report = run_benchmark(&mut pipeline, &config, &mut out)
        .with_context(|| format!("{} benchmark failed", pipeline.name()))?;

    info!(
        batches = report.batches_completed,
        windows = report.windows.len(),
        stopped_early = report.stopped_early,
        "benchmark finished"
    );
    Ok(())
}
