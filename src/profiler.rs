use crate::{
    error::SchedulingError,
    types::{NodeId, ObjectId},
};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use derive_more::Display;
use std::{
    sync::Weak,
    thread::{self, JoinHandle},
    time::Duration,
};

/// Callback duration statistics of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingStats {
    /// Number of timed invocations.
    pub count: u64,
    /// Shortest invocation, in nanoseconds.
    pub min_ns: u64,
    /// Longest invocation, in nanoseconds.
    pub max_ns: u64,
    /// Sum of all invocations, in nanoseconds.
    pub total_ns: u64,
}

impl TimingStats {
    /// Average invocation time in nanoseconds.
    pub fn mean_ns(&self) -> u64 {
        self.total_ns.checked_div(self.count).unwrap_or(0)
    }
}

/// Point-in-time view of one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSnapshot {
    /// The node.
    pub node: NodeId,
    /// Its name.
    pub name: String,
    /// Longest distance from an input node.
    pub level: u16,
    /// Unread entries in each outgoing pool, in successor order.
    pub queue_depths: Vec<usize>,
    /// Free slots summed over the outgoing pools.
    pub free_slots: usize,
    /// Payloads staged for an input node and not yet consumed.
    pub staged_inputs: usize,
    /// How often a producer waited for a free outgoing slot.
    pub starved: u64,
    /// Completed executions.
    pub run_count: u64,
    /// Callback timings, if the callback ever ran.
    pub timing: Option<TimingStats>,
}

/// Point-in-time view of one in-flight run.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
#[display("run {object_id} in slot {slot}: {remaining_sinks} sink(s) left")]
pub struct RunSnapshot {
    /// Pipeline slot the run occupies.
    pub slot: u16,
    /// The run.
    pub object_id: ObjectId,
    /// Sinks that have not finished yet.
    pub remaining_sinks: usize,
}

/// Point-in-time view of a bound graph.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphSnapshot {
    /// Node views in insertion order. Empty if nodes were not sampled.
    pub nodes: Vec<NodeSnapshot>,
    /// In-flight runs ordered by slot. Empty if runs were not sampled.
    pub runs: Vec<RunSnapshot>,
    /// Runs waiting for a pipeline slot.
    pub backlog: usize,
}

impl GraphSnapshot {
    fn restrict(mut self, mode: ProfilerMode) -> Self {
        if !mode.nodes {
            self.nodes.clear();
        }
        if !mode.runs {
            self.runs.clear();
        }
        self
    }
}

/// Which views a [`Profiler`] samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfilerMode {
    /// Sample per-node state.
    pub nodes: bool,
    /// Sample per-run state.
    pub runs: bool,
}

impl ProfilerMode {
    /// Nodes and runs.
    pub const ALL: Self = Self {
        nodes: true,
        runs: true,
    };
    /// Nodes only.
    pub const NODES: Self = Self {
        nodes: true,
        runs: false,
    };
    /// Runs only.
    pub const RUNS: Self = Self {
        nodes: false,
        runs: true,
    };
}

impl Default for ProfilerMode {
    fn default() -> Self {
        Self::ALL
    }
}

/// Something that can be sampled.
pub trait SnapshotSource: Send + Sync + 'static {
    /// Current state.
    fn snapshot(&self) -> GraphSnapshot;
}

/// Consumer of periodic snapshots.
pub trait MonitorSink: Send + 'static {
    /// Handle one sample.
    fn record(&mut self, snapshot: &GraphSnapshot);
}

impl<F> MonitorSink for F
where
    F: FnMut(&GraphSnapshot) + Send + 'static,
{
    fn record(&mut self, snapshot: &GraphSnapshot) {
        self(snapshot);
    }
}

/// Logs every sample as `info` events, one per node and one per run.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl MonitorSink for TracingSink {
    fn record(&mut self, snapshot: &GraphSnapshot) {
        for node in &snapshot.nodes {
            tracing::info!(
                node = %node.node,
                name = %node.name,
                level = node.level,
                queue_depths = ?node.queue_depths,
                staged_inputs = node.staged_inputs,
                free_slots = node.free_slots,
                starved = node.starved,
                run_count = node.run_count,
                mean_ns = node.timing.map_or(0, |t| t.mean_ns()),
                max_ns = node.timing.map_or(0, |t| t.max_ns),
                "node"
            );
        }
        for run in &snapshot.runs {
            tracing::info!(
                slot = run.slot,
                object_id = run.object_id,
                remaining_sinks = run.remaining_sinks,
                "run"
            );
        }
        tracing::info!(backlog = snapshot.backlog, "profiler sample");
    }
}

/// Background thread sampling a [`SnapshotSource`] at a fixed interval.
///
/// Only a weak reference to the source is held: once the source is dropped
/// (for a scheduler, when its graph is unbound) the thread exits on its own.
/// Dropping the profiler stops and joins the thread.
#[derive(Debug)]
pub struct Profiler {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Profiler {
    /// Start sampling `source` every `interval`.
    ///
    /// # Errors
    /// If the thread cannot be spawned.
    pub fn spawn<S: SnapshotSource>(
        source: Weak<S>,
        interval: Duration,
        mode: ProfilerMode,
        sink: impl MonitorSink,
    ) -> Result<Self, SchedulingError> {
        let (stop, stopped) = crossbeam_channel::bounded(0);
        let name = "pipegraph-profiler".to_owned();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || sample_loop(&source, interval, mode, sink, &stopped))
            .map_err(|err| SchedulingError::Spawn {
                name,
                message: err.to_string(),
            })?;
        Ok(Self {
            stop: Some(stop),
            handle: Some(handle),
        })
    }

    /// Whether the sampling thread has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Stop sampling and join the thread.
    pub fn stop(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        // Disconnecting the channel interrupts the sleep.
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("profiler thread panicked");
            }
        }
    }
}

impl Drop for Profiler {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

fn sample_loop<S: SnapshotSource>(
    source: &Weak<S>,
    interval: Duration,
    mode: ProfilerMode,
    mut sink: impl MonitorSink,
    stopped: &Receiver<()>,
) {
    tracing::debug!(?interval, ?mode, "profiler started");
    loop {
        match stopped.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
        let Some(source) = source.upgrade() else {
            break;
        };
        let snapshot = source.snapshot().restrict(mode);
        drop(source);
        sink.record(&snapshot);
    }
    tracing::debug!("profiler stopped");
}
