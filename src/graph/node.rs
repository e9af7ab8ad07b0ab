use crate::{
    config::Config,
    error::{ExecutionError, SchedulingError},
    graph::GraphError,
    payload::{Payload, PayloadCopyError},
    pool::{BufferPool, PoolError, Tagged},
    profiler::{NodeSnapshot, TimingStats},
    sync::{AtomicU64, Ordering},
    types::{NodeId, ObjectId, PayloadOf},
    utils::panic_message,
    work::Work,
};
use derive_more::Debug;
use std::{
    panic::{self, AssertUnwindSafe},
    sync::atomic::{AtomicU64 as StdAtomicU64, Ordering as StdOrdering},
    time::Instant,
};

/// Pool entry. `None` marks a run that produced no data for this edge.
pub(crate) type Slot<C> = Option<PayloadOf<C>>;

/// A graph vertex.
///
/// Holds the callback, the ordered predecessor and successor lists (ids into
/// the owning graph), one buffer pool per successor, and the run bookkeeping.
/// Nodes are only created through [`Graph`](crate::graph::Graph).
#[derive(Debug)]
pub struct Node<C: Config> {
    id: NodeId,
    name: String,
    #[debug(skip)]
    work: Option<Box<dyn Work<PayloadOf<C>>>>,
    predecessors: Vec<NodeId>,
    successors: Vec<NodeId>,
    level: u16,
    #[debug(skip)]
    input: BufferPool<Slot<C>>,
    #[debug(skip)]
    outputs: Box<[BufferPool<Slot<C>>]>,
    run_count: AtomicU64,
    #[debug(skip)]
    timer: ExecTimer,
}

/// Outcome of one execution.
///
/// `output` and `error` go to the run's status, `outgoing` to
/// [`Node::publish`]. The status must be updated first: a successor may
/// complete the run as soon as it sees the published entries.
#[must_use]
pub(crate) struct Firing<P> {
    /// Output of a sink node. Always `None` for nodes with successors.
    pub(crate) output: Option<P>,
    pub(crate) error: Option<ExecutionError>,
    /// One entry per successor.
    pub(crate) outgoing: Vec<Option<P>>,
}

impl<C: Config> Node<C> {
    pub(super) fn new(id: NodeId, name: String, work: Option<Box<dyn Work<PayloadOf<C>>>>) -> Self {
        Self {
            id,
            name,
            work,
            predecessors: Vec::new(),
            successors: Vec::new(),
            level: 0,
            input: BufferPool::new(0),
            outputs: Box::default(),
            run_count: AtomicU64::new(0),
            timer: ExecTimer::default(),
        }
    }

    /// The node's id.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The node's unique name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Predecessors in registration order.
    pub fn predecessors(&self) -> &[NodeId] {
        &self.predecessors
    }

    /// Successors in registration order.
    pub fn successors(&self) -> &[NodeId] {
        &self.successors
    }

    /// Whether the node has no predecessors.
    pub fn is_source(&self) -> bool {
        self.predecessors.is_empty()
    }

    /// Whether the node has no successors.
    pub fn is_sink(&self) -> bool {
        self.successors.is_empty()
    }

    /// Whether the node has a callback.
    pub fn has_work(&self) -> bool {
        self.work.is_some()
    }

    /// Longest distance in edges from any input node. Zero until frozen.
    pub fn level(&self) -> u16 {
        self.level
    }

    /// Number of completed executions.
    pub fn run_count(&self) -> u64 {
        self.run_count.load(Ordering::Relaxed)
    }

    /// Pool staging payloads of an input node.
    pub fn input_pool(&self) -> &BufferPool<Slot<C>> {
        &self.input
    }

    /// Pool feeding the `branch`-th successor.
    pub fn output_pool(&self, branch: usize) -> Option<&BufferPool<Slot<C>>> {
        self.outputs.get(branch)
    }

    /// Stage a payload for the next execution of this input node.
    ///
    /// Blocks while the staging pool is full.
    ///
    /// # Errors
    /// If the pool is closed or the graph was never frozen.
    pub fn push_input(
        &self,
        input: Tagged<PayloadOf<C>>,
    ) -> Result<(), PoolError<Tagged<PayloadOf<C>>>> {
        self.input.push(input.map(Some)).map_err(|err| match err {
            PoolError::Full(v) => PoolError::Full(unwrap_staged(v)),
            PoolError::Closed(v) => PoolError::Closed(unwrap_staged(v)),
            PoolError::ZeroCapacity(v) => PoolError::ZeroCapacity(unwrap_staged(v)),
        })
    }

    /// Publish `output` to every successor as if this node had produced it,
    /// copying it once per extra branch. Blocks while a pool is full.
    ///
    /// # Errors
    /// If a copy fails nothing is published. Pool failures are reported for
    /// the first branch that refused its entry; earlier branches keep theirs.
    pub fn push_output(&self, output: Tagged<PayloadOf<C>>) -> crate::error::Result<()> {
        let Tagged { object_id, payload } = output;
        if self.outputs.len() != self.successors.len() {
            return Err(GraphError::NotFrozen.into());
        }
        let copies = self.fan_out(Some(payload))?;
        for (pool, payload) in self.outputs.iter().zip(copies) {
            pool.push(Tagged::new(object_id, payload))
                .map_err(|_| SchedulingError::ExecutorShutDown)?;
        }
        Ok(())
    }

    /// Pop the oldest payload published towards the `branch`-th successor,
    /// without waiting. Entries of failed runs are discarded.
    pub fn pop_output(&self, branch: usize) -> Option<Tagged<PayloadOf<C>>> {
        let pool = self.outputs.get(branch)?;
        loop {
            let Tagged { object_id, payload } = pool.try_pop()?;
            if let Some(payload) = payload {
                return Some(Tagged { object_id, payload });
            }
        }
    }

    /// Summary for monitoring.
    pub fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            node: self.id,
            name: self.name.clone(),
            level: self.level,
            queue_depths: self.outputs.iter().map(BufferPool::num_full).collect(),
            free_slots: self.outputs.iter().map(BufferPool::num_free).sum(),
            staged_inputs: self.input.num_full(),
            starved: self.outputs.iter().map(BufferPool::starved).sum(),
            run_count: self.run_count(),
            timing: self.timer.stats(),
        }
    }

    pub(super) fn push_successor(&mut self, to: NodeId) {
        self.successors.push(to);
    }

    pub(super) fn push_predecessor(&mut self, from: NodeId) {
        self.predecessors.push(from);
    }

    pub(super) fn allocate_pools(&mut self, depth: usize, level: u16) {
        self.level = level;
        self.input = BufferPool::new(if self.is_source() { depth } else { 0 });
        self.outputs = self
            .successors
            .iter()
            .map(|_| BufferPool::new(depth))
            .collect();
    }

    pub(super) fn release_pools(&mut self) {
        self.level = 0;
        self.input = BufferPool::new(0);
        self.outputs = Box::default();
    }

    pub(crate) fn close_pools(&self) {
        self.input.close();
        self.outputs.iter().for_each(BufferPool::close);
    }

    /// Pool this node publishes into for successor `to`.
    pub(crate) fn pool_towards(&self, to: NodeId) -> &BufferPool<Slot<C>> {
        let branch = self
            .successors
            .iter()
            .position(|&s| s == to)
            .expect("Node::pool_towards: [1]");
        &self.outputs[branch]
    }

    /// Execute the callback on `inputs` and prepare one entry per successor.
    ///
    /// A `None` input, or `poisoned`, means the run already failed: the
    /// callback is skipped and the entries are tombstones, so that consumers
    /// still see exactly one entry per run.
    pub(crate) fn fire(&self, inputs: Vec<Slot<C>>, poisoned: bool) -> Firing<PayloadOf<C>> {
        let inputs = if poisoned {
            None
        } else {
            inputs.into_iter().collect::<Option<Vec<_>>>()
        };
        let (output, mut error) = match inputs.map(|inputs| self.invoke(inputs)) {
            None => (None, None),
            Some(Ok(output)) => (Some(output), None),
            Some(Err(err)) => (None, Some(err)),
        };
        self.run_count.fetch_add(1, Ordering::Relaxed);
        if self.is_sink() {
            return Firing {
                output,
                error,
                outgoing: Vec::new(),
            };
        }
        let outgoing = match self.fan_out(output) {
            Ok(copies) => copies,
            Err(err) => {
                error = Some(err);
                self.successors.iter().map(|_| None).collect()
            }
        };
        Firing {
            output: None,
            error,
            outgoing,
        }
    }

    /// Push the entries prepared by [`fire`](Self::fire) for run `object_id`.
    pub(crate) fn publish(&self, object_id: ObjectId, outgoing: Vec<Slot<C>>) {
        for (pool, payload) in self.outputs.iter().zip(outgoing) {
            if let Err(err) = pool.push(Tagged::new(object_id, payload)) {
                tracing::trace!(node = %self.id, object_id, %err, "dropping output");
            }
        }
    }

    fn invoke(&self, inputs: Vec<PayloadOf<C>>) -> Result<PayloadOf<C>, ExecutionError> {
        let Some(work) = &self.work else {
            return inputs
                .into_iter()
                .next()
                .ok_or(ExecutionError::NoInput(self.id));
        };
        let started = Instant::now();
        let result = panic::catch_unwind(AssertUnwindSafe(|| work.run(&inputs)));
        self.timer.record(started);
        match result {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(err)) => {
                tracing::warn!(node = %self.id, name = %self.name, error = %err, "node failed");
                Err(ExecutionError::WorkFnFailed {
                    node: self.id,
                    message: err.to_string(),
                })
            }
            Err(panic) => {
                let message = panic_message(&*panic);
                tracing::warn!(node = %self.id, name = %self.name, %message, "node panicked");
                Err(ExecutionError::WorkFnPanicked {
                    node: self.id,
                    message,
                })
            }
        }
    }

    /// One entry per successor. Either every successor gets a value-equal
    /// copy, or none gets anything. A panicking copy counts as a failed one.
    fn fan_out(
        &self,
        output: Option<PayloadOf<C>>,
    ) -> Result<Vec<Slot<C>>, ExecutionError> {
        let branches = self.successors.len();
        let Some(output) = output else {
            return Ok((0..branches).map(|_| None).collect());
        };
        let copied = panic::catch_unwind(AssertUnwindSafe(|| {
            (1..branches)
                .map(|_| output.try_copy().map(Some))
                .collect::<Result<Vec<_>, _>>()
        }));
        let mut copies = match copied {
            Ok(Ok(copies)) => copies,
            Ok(Err(source)) => {
                return Err(ExecutionError::PayloadCopyFailed {
                    node: self.id,
                    source,
                });
            }
            Err(panic) => {
                let message = panic_message(&*panic);
                tracing::warn!(
                    node = %self.id,
                    name = %self.name,
                    %message,
                    "payload copy panicked"
                );
                return Err(ExecutionError::PayloadCopyFailed {
                    node: self.id,
                    source: PayloadCopyError::new(format!("panicked: {message}")),
                });
            }
        };
        copies.insert(0, Some(output));
        Ok(copies)
    }
}

fn unwrap_staged<P>(value: Tagged<Option<P>>) -> Tagged<P> {
    value.map(|payload| payload.expect("unwrap_staged: [1]"))
}

/// Callback duration statistics. Diagnostic only, so plain `std` atomics.
#[derive(Debug)]
struct ExecTimer {
    count: StdAtomicU64,
    total_ns: StdAtomicU64,
    min_ns: StdAtomicU64,
    max_ns: StdAtomicU64,
}

impl Default for ExecTimer {
    fn default() -> Self {
        Self {
            count: StdAtomicU64::new(0),
            total_ns: StdAtomicU64::new(0),
            min_ns: StdAtomicU64::new(u64::MAX),
            max_ns: StdAtomicU64::new(0),
        }
    }
}

impl ExecTimer {
    fn record(&self, started: Instant) {
        let ns = u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.count.fetch_add(1, StdOrdering::Relaxed);
        self.total_ns.fetch_add(ns, StdOrdering::Relaxed);
        self.min_ns.fetch_min(ns, StdOrdering::Relaxed);
        self.max_ns.fetch_max(ns, StdOrdering::Relaxed);
    }

    fn stats(&self) -> Option<TimingStats> {
        let count = self.count.load(StdOrdering::Relaxed);
        (count > 0).then(|| TimingStats {
            count,
            min_ns: self.min_ns.load(StdOrdering::Relaxed),
            max_ns: self.max_ns.load(StdOrdering::Relaxed),
            total_ns: self.total_ns.load(StdOrdering::Relaxed),
        })
    }
}
