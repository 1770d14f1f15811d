//! src/bench.rs
//!
//! The benchmark loop.
//!
//! ```text
//!   Init ──▶ Warmup ──▶ Measuring ──▶ Done
//!    │         │            │           │
//!    │         │            │           └─ "Running Time" + "Mean img/s"
//!    │         │            └─ run() until target or EndOfEpoch,
//!    │         │               "img/s" whenever a window exceeds the interval
//!    │         └─ exactly WARMUP_ITERATIONS run() calls, then reset()
//!    └─ header line, build(), resolve batch target
//! ```
//!
//! The loop never looks at batch contents; it only times blocking `run()` calls.
//! Errors other than end of epoch abort the run as-is: a retried batch would
//! misrepresent throughput.

use crate::batch::BatchResult;
use crate::error::{LoaderError, Result};
use crate::pipeline::{Pipeline, FILE_READER};
use std::fmt;
use std::io::Write;
use std::time::{Duration, Instant};

/// Untimed `run()` calls before measuring.
pub const WARMUP_ITERATIONS: usize = 10;

/// Spacing of windowed rate samples.
pub const REPORT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Warmup,
    Measuring,
    Done,
}

/// How many batches the measuring phase runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchTarget {
    Count(usize),
    /// Run until the pipeline reports end of epoch.
    UntilExhausted,
}

impl BatchTarget {
    /// An explicit count wins; otherwise a known epoch size gives
    /// `ceil(epoch_size / batch_size)`; otherwise run until exhaustion.
    pub fn resolve(explicit: Option<usize>, epoch_size: Option<usize>, batch_size: usize) -> Self {
        match (explicit, epoch_size) {
            (Some(count), _) => BatchTarget::Count(count),
            (None, Some(samples)) => BatchTarget::Count(samples.div_ceil(batch_size.max(1))),
            (None, None) => BatchTarget::UntilExhausted,
        }
    }

    fn allows(&self, completed: usize) -> bool {
        match self {
            BatchTarget::Count(count) => completed < *count,
            BatchTarget::UntilExhausted => true,
        }
    }
}

impl fmt::Display for BatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchTarget::Count(count) => write!(f, "{count}"),
            BatchTarget::UntilExhausted => f.write_str("until end of epoch"),
        }
    }
}

/// Configuration for a benchmark run
#[derive(Debug, Clone)]
pub struct BenchmarkConfig {
    /// Samples per batch, used to convert batches into images
    pub batch_size: usize,
    /// Explicit number of measured batches (None = resolve from the pipeline)
    pub batches: Option<usize>,
    /// Minimum window length before a rate sample is emitted
    pub report_interval: Duration,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            batches: None,
            report_interval: REPORT_INTERVAL,
        }
    }
}

impl BenchmarkConfig {
    pub fn builder() -> BenchmarkConfigBuilder {
        BenchmarkConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(LoaderError::InvalidConfig("batch_size must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Builder for [`BenchmarkConfig`] with method chaining
#[derive(Default)]
pub struct BenchmarkConfigBuilder {
    config: BenchmarkConfig,
}

impl BenchmarkConfigBuilder {
    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    pub fn batches(mut self, batches: Option<usize>) -> Self {
        self.config.batches = batches;
        self
    }

    pub fn report_interval(mut self, interval: Duration) -> Self {
        self.config.report_interval = interval;
        self
    }

    pub fn build(self) -> BenchmarkConfig {
        self.config
    }
}

/// One windowed throughput sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowSample {
    pub batches: usize,
    pub elapsed: Duration,
    pub images_per_sec: f64,
}

/// Images per second; 0 when no time has elapsed.
pub fn images_per_sec(batch_size: usize, batches: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        (batch_size * batches) as f64 / secs
    } else {
        0.0
    }
}

/// Run state of the measuring phase.
///
/// Every completed batch belongs to exactly one window: either an emitted one or
/// the still-open tail ([`ThroughputWindow::pending`]).
#[derive(Debug, Clone)]
pub struct ThroughputWindow {
    batch_size: usize,
    interval: Duration,
    run_start: Instant,
    window_start: Instant,
    window_start_batch: usize,
    completed: usize,
}

impl ThroughputWindow {
    pub fn start(batch_size: usize, interval: Duration, now: Instant) -> Self {
        Self {
            batch_size,
            interval,
            run_start: now,
            window_start: now,
            window_start_batch: 0,
            completed: 0,
        }
    }

    /// Records one finished batch at `now`; emits a sample once the open window
    /// is longer than the interval and re-anchors the window at `now`.
    pub fn record_batch(&mut self, now: Instant) -> Option<WindowSample> {
        self.completed += 1;
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed <= self.interval {
            return None;
        }

        let batches = self.completed - self.window_start_batch;
        self.window_start = now;
        self.window_start_batch = self.completed;
        Some(WindowSample {
            batches,
            elapsed,
            images_per_sec: images_per_sec(self.batch_size, batches, elapsed),
        })
    }

    pub fn completed(&self) -> usize {
        self.completed
    }

    /// Batches in the open window.
    pub fn pending(&self) -> usize {
        self.completed - self.window_start_batch
    }

    pub fn total_elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.run_start)
    }
}

/// Outcome of a benchmark run.
#[derive(Debug, Clone)]
pub struct BenchmarkReport {
    pub target: BatchTarget,
    pub batches_completed: usize,
    pub elapsed: Duration,
    pub mean_images_per_sec: f64,
    pub windows: Vec<WindowSample>,
    /// Batches after the last emitted window.
    pub tail_batches: usize,
    /// End of epoch arrived before an explicit target was reached.
    pub stopped_early: bool,
}

fn enter(phase: Phase) {
    tracing::debug!(?phase, "benchmark phase");
}

/// Drives `pipeline` through warmup and measurement, writing the report lines to
/// `out`.
pub fn run_benchmark<P, W>(
    pipeline: &mut P,
    config: &BenchmarkConfig,
    out: &mut W,
) -> Result<BenchmarkReport>
where
    P: Pipeline + ?Sized,
    W: Write,
{
    config.validate()?;
    let batch_size = config.batch_size;

    enter(Phase::Init);
    let requested = config
        .batches
        .map_or_else(|| "auto".to_string(), |count| count.to_string());
    writeln!(
        out,
        "dataloader: {} batches: {} batchsize: {}",
        pipeline.name(),
        requested,
        batch_size
    )?;
    pipeline.build()?;
    let target = BatchTarget::resolve(config.batches, pipeline.epoch_size(FILE_READER), batch_size);
    tracing::info!(backend = pipeline.name(), %target, batch_size, "pipeline built");

    enter(Phase::Warmup);
    for call in 0..WARMUP_ITERATIONS {
        if pipeline.run()?.is_end_of_epoch() {
            tracing::debug!(call, "end of epoch during warmup");
        }
    }
    pipeline.reset()?;

    enter(Phase::Measuring);
    let mut window = ThroughputWindow::start(batch_size, config.report_interval, Instant::now());
    let mut windows = Vec::new();
    let mut exhausted = false;
    while target.allows(window.completed()) {
        match pipeline.run()? {
            BatchResult::EndOfEpoch => {
                exhausted = true;
                break;
            }
            BatchResult::Batch(batch) => {
                drop(batch);
                if let Some(sample) = window.record_batch(Instant::now()) {
                    writeln!(out, "img/s: {}", sample.images_per_sec)?;
                    windows.push(sample);
                }
            }
        }
    }
    let elapsed = window.total_elapsed(Instant::now());

    enter(Phase::Done);
    let batches_completed = window.completed();
    let mean_images_per_sec = images_per_sec(batch_size, batches_completed, elapsed);
    writeln!(out, "Running Time: {}", elapsed.as_secs_f64())?;
    writeln!(out, "Mean img/s: {}", mean_images_per_sec)?;
    out.flush()?;

    let stopped_early = exhausted && matches!(target, BatchTarget::Count(_));
    if stopped_early {
        tracing::info!(batches_completed, %target, "end of epoch before batch target");
    }

    Ok(BenchmarkReport {
        target,
        batches_completed,
        elapsed,
        mean_images_per_sec,
        windows,
        tail_batches: window.pending(),
        stopped_early,
    })
}
