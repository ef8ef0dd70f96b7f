//! Metric collectors and the registry the pipeline drives them through.
//!
//! A collector fills one or more top-level snapshot fields. The pipeline never
//! sees a collector fail: [`CollectorSet::collect_all`] runs every collector on
//! its own task under a timeout and turns errors, timeouts and panics into
//! unavailable fields plus a logged warning.

mod system;
mod videocore;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::warn;

use crate::metrics::COLLECTOR_FAILURES;
use crate::snapshot::{FieldValue, StatField, StatsSnapshot};

pub use system::{
    CpuCollector, DiskCollector, DiskIoCollector, HostCollector, MemoryCollector,
    NetworkCollector, TemperatureCollector,
};
pub use videocore::{ClockCollector, GpuCollector, HardwareCollector, PowerCollector};

/// How long interval-sampling collectors may block when asked to.
pub const BLOCKING_SAMPLE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleMode {
    /// Read whatever the counters say right now.
    Instant,
    /// Sample over [`BLOCKING_SAMPLE`] for a more accurate reading.
    Blocking,
}

impl SampleMode {
    pub fn from_block(block: bool) -> Self {
        if block {
            SampleMode::Blocking
        } else {
            SampleMode::Instant
        }
    }
}

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("command `{command}` failed: {reason}")]
    Command { command: String, reason: String },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("could not parse {what} from {input:?}")]
    Parse { what: &'static str, input: String },

    #[error("{0}")]
    Unavailable(String),

    #[error("collector task aborted: {0}")]
    Aborted(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait MetricCollector: Send + Sync {
    /// Short name used in logs and metric labels.
    fn name(&self) -> &'static str;

    /// Fields this collector is responsible for.
    fn fields(&self) -> &'static [StatField];

    async fn collect(&self, mode: SampleMode) -> Result<Vec<FieldValue>, CollectorError>;
}

/// A collector that failed during one collection round.
#[derive(Debug)]
pub struct CollectorFailure {
    pub collector: &'static str,
    pub error: CollectorError,
}

/// Outcome of running every registered collector once.
#[derive(Debug)]
pub struct Collection {
    pub snapshot: StatsSnapshot,
    pub failures: Vec<CollectorFailure>,
    pub attempted: usize,
}

impl Collection {
    // Every collector failed (an empty registry is not a failure)
    pub fn is_total_failure(&self) -> bool {
        self.attempted > 0 && self.failures.len() == self.attempted
    }

    pub fn failure_details(&self) -> String {
        self.failures
            .iter()
            .map(|f| format!("{}: {}", f.collector, f.error))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

pub struct CollectorSet {
    collectors: Vec<Arc<dyn MetricCollector>>,
    timeout: Duration,
}

impl CollectorSet {
    pub fn new(collectors: Vec<Arc<dyn MetricCollector>>, timeout: Duration) -> Self {
        Self {
            collectors,
            timeout,
        }
    }

    /// The stock collectors for a Linux host, VideoCore readers included.
    pub fn standard(timeout: Duration) -> Self {
        let collectors: Vec<Arc<dyn MetricCollector>> = vec![
            Arc::new(CpuCollector::new()),
            Arc::new(TemperatureCollector),
            Arc::new(MemoryCollector),
            Arc::new(DiskCollector::root()),
            Arc::new(DiskIoCollector),
            Arc::new(HostCollector),
            Arc::new(NetworkCollector::new(timeout)),
            Arc::new(GpuCollector::new(timeout)),
            Arc::new(PowerCollector::new(timeout)),
            Arc::new(ClockCollector::new(timeout)),
            Arc::new(HardwareCollector::new(timeout)),
        ];
        Self::new(collectors, timeout)
    }

    pub fn len(&self) -> usize {
        self.collectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collectors.is_empty()
    }

    /// Run every collector concurrently and assemble one full snapshot.
    pub async fn collect_all(&self, mode: SampleMode) -> Collection {
        let mut snapshot = StatsSnapshot::new(unix_timestamp());

        let handles: Vec<_> = self
            .collectors
            .iter()
            .map(|collector| {
                let task_collector = Arc::clone(collector);
                let limit = self.timeout;
                let handle = tokio::spawn(async move {
                    match tokio::time::timeout(limit, task_collector.collect(mode)).await {
                        Ok(result) => result,
                        Err(_) => Err(CollectorError::Timeout(limit)),
                    }
                });
                (Arc::clone(collector), handle)
            })
            .collect();

        let mut failures = Vec::new();
        for (collector, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(join_err) => Err(CollectorError::Aborted(join_err.to_string())),
            };

            match result {
                Ok(values) => {
                    for value in values {
                        snapshot.apply(value);
                    }
                }
                Err(error) => {
                    let fields: Vec<&str> = collector.fields().iter().map(|f| f.as_str()).collect();
                    warn!(
                        collector = collector.name(),
                        fields = ?fields,
                        %error,
                        "collector failed, marking fields unavailable"
                    );
                    COLLECTOR_FAILURES.with_label_values(&[collector.name()]).inc();
                    failures.push(CollectorFailure {
                        collector: collector.name(),
                        error,
                    });
                }
            }
        }

        Collection {
            snapshot,
            failures,
            attempted: self.collectors.len(),
        }
    }
}

fn unix_timestamp() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Run an external command and return its trimmed stdout.
///
/// The child is killed if it outlives `limit` or the caller stops waiting.
pub async fn run_command(
    program: &str,
    args: &[&str],
    limit: Duration,
) -> Result<String, CollectorError> {
    let command = std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ");

    let output = tokio::time::timeout(
        limit,
        Command::new(program).args(args).kill_on_drop(true).output(),
    )
    .await
    .map_err(|_| CollectorError::Timeout(limit))?
    .map_err(|e| CollectorError::Command {
        command: command.clone(),
        reason: e.to_string(),
    })?;

    if !output.status.success() {
        return Err(CollectorError::Command {
            command,
            reason: output.status.to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
