use crate::{error::ConfigError, payload::Payload};
use std::num::NonZeroUsize;

/// Configuration entry-point for instantiating graphs and executors.
///
/// A concrete `Config` binds the payload type moved between nodes. The engine
/// never looks inside a payload; it only moves it and, on fan-out, asks it for
/// an explicit copy.
pub trait Config: Sized + 'static {
    /// The opaque data type produced and consumed by node callbacks.
    type Payload: Payload;
}

/// Runtime settings shared by both scheduling strategies.
///
/// ```
/// use pipegraph::config::ExecutorConfig;
///
/// let cfg = ExecutorConfig::new()
///     .with_worker_count(4)
///     .with_pipeline_depth(3)
///     .with_backlog_capacity(16);
/// assert!(cfg.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Number of worker threads of the work-stealing executor.
    ///
    /// Default: number of logical CPUs.
    pub worker_count: usize,

    /// Maximum number of runs in flight at once. Also the capacity of every
    /// buffer pool.
    ///
    /// Default: 2
    pub pipeline_depth: usize,

    /// Number of submitted runs allowed to wait for a free pipeline slot.
    /// Submissions beyond it are rejected with `RunQueueOverflow`.
    ///
    /// Default: 1024
    pub backlog_capacity: usize,

    /// Failed steal attempts before a thief starts yielding the CPU.
    ///
    /// Default: `2 * (worker_count + 1)`
    pub steal_spins: Option<usize>,

    /// Number of yields before a thief gives up and parks.
    ///
    /// Default: 100
    pub yield_limit: usize,

    /// Prefix of spawned thread names.
    ///
    /// Default: `"pipegraph"`
    pub thread_name: String,

    /// Seed of the per-worker victim selection generators. `None` seeds from
    /// the OS.
    pub rng_seed: Option<u64>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            worker_count: std::thread::available_parallelism().map_or(1, NonZeroUsize::get),
            pipeline_depth: 2,
            backlog_capacity: 1024,
            steal_spins: None,
            yield_limit: 100,
            thread_name: "pipegraph".to_owned(),
            rng_seed: None,
        }
    }
}

impl ExecutorConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of worker threads.
    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    /// Set the pipeline depth.
    pub fn with_pipeline_depth(mut self, pipeline_depth: usize) -> Self {
        self.pipeline_depth = pipeline_depth;
        self
    }

    /// Set the backlog capacity.
    pub fn with_backlog_capacity(mut self, backlog_capacity: usize) -> Self {
        self.backlog_capacity = backlog_capacity;
        self
    }

    /// Set the steal spin and yield bounds.
    pub fn with_steal_bounds(mut self, spins: usize, yield_limit: usize) -> Self {
        self.steal_spins = Some(spins);
        self.yield_limit = yield_limit;
        self
    }

    /// Set the thread name prefix.
    pub fn with_thread_name(mut self, thread_name: impl Into<String>) -> Self {
        self.thread_name = thread_name.into();
        self
    }

    /// Seed victim selection for reproducible steal sequences.
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    /// Effective spin bound of a thief before yielding.
    #[must_use]
    pub fn effective_steal_spins(&self) -> usize {
        self.steal_spins
            .unwrap_or_else(|| (self.worker_count + 1) << 1)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    /// If there are no workers, the pipeline depth is zero, or the depth does
    /// not fit the `u16` slot index.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if self.pipeline_depth == 0 {
            return Err(ConfigError::ZeroPipelineDepth);
        }
        if self.pipeline_depth > usize::from(u16::MAX) {
            return Err(ConfigError::PipelineDepthTooLarge(self.pipeline_depth));
        }
        Ok(())
    }
}
