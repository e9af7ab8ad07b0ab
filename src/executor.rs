mod completion;
mod dedicated;
mod notifier;
mod status;
mod worker;

pub use crate::executor::{
    completion::{RunFuture, RunResult},
    dedicated::DedicatedExecutor,
};
use crate::{
    config::{Config, ExecutorConfig},
    error::{Error, SchedulingError},
    executor::{
        status::{Admitted, StatusTable},
        worker::Shared,
    },
    graph::Graph,
    pool::Tagged,
    profiler::{GraphSnapshot, MonitorSink, Profiler, ProfilerMode, SnapshotSource},
    types::{NodeId, PayloadOf},
};
use derive_more::Debug;
use std::{sync::Arc, thread::JoinHandle, time::Duration};

/// The contract shared by every scheduling strategy: bind a graph, submit
/// runs, await their results.
pub trait Scheduler<C: Config> {
    /// Freeze `graph` with the scheduler's pipeline depth and take ownership
    /// of it.
    ///
    /// # Errors
    /// If a graph is already bound, the scheduler is shut down, or the graph
    /// fails to freeze (the graph is dropped in that case).
    fn bind(&mut self, graph: Graph<C>) -> Result<(), Error>;

    /// Wait for in-flight runs and hand the graph back, unfrozen.
    ///
    /// # Errors
    /// If no graph is bound.
    fn unbind(&mut self) -> Result<Graph<C>, Error>;

    /// The bound graph.
    fn graph(&self) -> Option<&Graph<C>>;

    /// Submit one run with a payload per input node, without blocking.
    ///
    /// Input nodes with a callback may be omitted; they then run with no
    /// inputs. If every pipeline slot is busy the run waits in the backlog.
    ///
    /// # Errors
    /// If the inputs do not match the graph's input nodes, no graph is bound,
    /// the backlog is full, or the scheduler is shut down.
    fn run<I>(&self, inputs: I) -> Result<RunFuture<PayloadOf<C>>, Error>
    where
        I: IntoIterator<Item = (NodeId, PayloadOf<C>)>;

    /// Block until no run is in flight.
    fn wait_idle(&self);

    /// Cancel backlog runs, let in-flight runs finish, and stop every thread.
    /// Idempotent; also performed on drop.
    fn shutdown(&mut self);

    /// Current state of the bound graph and its runs.
    fn snapshot(&self) -> Option<GraphSnapshot>;
}

/// A frozen graph together with the runs in flight on it.
#[derive(Debug)]
pub(crate) struct Bound<C: Config> {
    pub(crate) graph: Graph<C>,
    pub(crate) statuses: StatusTable<PayloadOf<C>>,
}

impl<C: Config> Bound<C> {
    pub(crate) fn new(mut graph: Graph<C>, cfg: &ExecutorConfig) -> Result<Self, Error> {
        graph.freeze(cfg.pipeline_depth)?;
        let in_degrees = graph.nodes().iter().map(|node| {
            u16::try_from(node.predecessors().len()).expect("Bound::new: [1]")
        });
        let statuses = StatusTable::new(
            cfg.pipeline_depth,
            in_degrees,
            graph.num_sinks(),
            cfg.backlog_capacity,
        );
        tracing::debug!(nodes = graph.len(), pipeline_depth = cfg.pipeline_depth, "graph bound");
        Ok(Self { graph, statuses })
    }

    /// Validate `inputs` and admit a run, calling `start` once it holds a
    /// slot.
    pub(crate) fn submit<I>(
        &self,
        inputs: I,
        start: impl FnOnce(Admitted<PayloadOf<C>>),
    ) -> Result<RunFuture<PayloadOf<C>>, Error>
    where
        I: IntoIterator<Item = (NodeId, PayloadOf<C>)>,
    {
        let staged = self.graph.stage_inputs(inputs)?;
        Ok(self.statuses.submit(staged, start)?)
    }

    /// Move the payloads of a run that just got its slot into the staging
    /// pools of the input nodes. Returns the slot.
    pub(crate) fn stage(&self, admitted: Admitted<PayloadOf<C>>) -> u16 {
        let Admitted {
            slot,
            object_id,
            inputs,
        } = admitted;
        for (source, staged) in inputs {
            let pushed = self
                .graph
                .node_at(source)
                .input_pool()
                .try_push(Tagged::new(object_id, staged));
            // One staging slot per pipeline slot, so there is always room.
            assert!(pushed.is_ok(), "Bound::stage: [1]");
        }
        slot
    }

    /// Wait for the runs to drain and take the graph back.
    pub(crate) fn reclaim(mut bound: Arc<Self>) -> Graph<C> {
        bound.statuses.wait_idle();
        // Threads finishing the last run may still hold a clone for a moment.
        let Self { mut graph, .. } = loop {
            match Arc::try_unwrap(bound) {
                Ok(inner) => break inner,
                Err(shared) => {
                    bound = shared;
                    std::thread::yield_now();
                }
            }
        };
        graph.thaw();
        tracing::debug!(nodes = graph.len(), "graph unbound");
        graph
    }
}

impl<C: Config> SnapshotSource for Bound<C> {
    fn snapshot(&self) -> GraphSnapshot {
        let (runs, backlog) = self.statuses.snapshot();
        GraphSnapshot {
            nodes: self.graph.nodes().iter().map(|node| node.snapshot()).collect(),
            runs,
            backlog,
        }
    }
}

/// Work-stealing executor: a fixed pool of workers, each with a local LIFO
/// deque, sharing one global injection queue.
///
/// Runs are pipelined: up to `pipeline_depth` runs of the bound graph are in
/// flight at once, each tracked by its own status slot. A node becomes ready
/// for a run when its last predecessor for that run finishes; the finishing
/// worker pushes it onto its own deque, where idle workers can steal it.
///
/// ```
/// use pipegraph::{
///     config::Config,
///     executor::{Executor, Scheduler},
///     graph::Graph,
/// };
///
/// struct Ints;
/// impl Config for Ints {
///     type Payload = i64;
/// }
///
/// let mut graph = Graph::<Ints>::new();
/// let a = graph.add_source("a").unwrap();
/// let b = graph.add_node("b", |x: &[i64]| Ok(x[0] + 1)).unwrap();
/// let c = graph.add_node("c", |x: &[i64]| Ok(x[0] * 2)).unwrap();
/// graph.precede(a, b).unwrap();
/// graph.precede(b, c).unwrap();
///
/// let mut executor = Executor::<Ints>::new(2, 2).unwrap();
/// executor.bind(graph).unwrap();
/// let first = executor.run([(a, 10)]).unwrap();
/// let second = executor.run([(a, 20)]).unwrap();
/// assert_eq!(second.wait().unwrap().output(c), Some(&42));
/// assert_eq!(first.wait().unwrap().output(c), Some(&22));
/// ```
#[derive(Debug)]
pub struct Executor<C: Config> {
    cfg: ExecutorConfig,
    #[debug(skip)]
    shared: Arc<Shared<C>>,
    bound: Option<Arc<Bound<C>>>,
    #[debug(skip)]
    threads: Vec<JoinHandle<()>>,
}

impl<C: Config> Executor<C> {
    /// Start `worker_count` workers for graphs run `pipeline_depth` at a time.
    ///
    /// # Errors
    /// If the settings are invalid or a thread cannot be spawned.
    pub fn new(worker_count: usize, pipeline_depth: usize) -> Result<Self, Error> {
        Self::with_config(
            ExecutorConfig::new()
                .with_worker_count(worker_count)
                .with_pipeline_depth(pipeline_depth),
        )
    }

    /// Start an executor with explicit settings.
    ///
    /// # Errors
    /// If the settings are invalid or a thread cannot be spawned.
    pub fn with_config(cfg: ExecutorConfig) -> Result<Self, Error> {
        cfg.validate()?;
        let (shared, threads) = Shared::spawn(&cfg)?;
        tracing::debug!(workers = cfg.worker_count, "executor started");
        Ok(Self {
            cfg,
            shared,
            bound: None,
            threads,
        })
    }

    /// Settings the executor was started with.
    pub fn config(&self) -> &ExecutorConfig {
        &self.cfg
    }

    /// Sample the bound graph every `interval` on a background thread.
    ///
    /// # Errors
    /// If no graph is bound or the thread cannot be spawned.
    pub fn profiler(
        &self,
        interval: Duration,
        mode: ProfilerMode,
        sink: impl MonitorSink,
    ) -> Result<Profiler, Error> {
        spawn_profiler(self.bound.as_ref(), interval, mode, sink)
    }
}

pub(crate) fn spawn_profiler<C: Config>(
    bound: Option<&Arc<Bound<C>>>,
    interval: Duration,
    mode: ProfilerMode,
    sink: impl MonitorSink,
) -> Result<Profiler, Error> {
    let bound = bound.ok_or(SchedulingError::NotBound)?;
    Ok(Profiler::spawn(Arc::downgrade(bound), interval, mode, sink)?)
}

impl<C: Config> Scheduler<C> for Executor<C> {
    fn bind(&mut self, graph: Graph<C>) -> Result<(), Error> {
        if self.shared.is_shut_down() {
            return Err(SchedulingError::ExecutorShutDown.into());
        }
        if self.bound.is_some() {
            return Err(SchedulingError::AlreadyBound.into());
        }
        self.bound = Some(Arc::new(Bound::new(graph, &self.cfg)?));
        Ok(())
    }

    fn unbind(&mut self) -> Result<Graph<C>, Error> {
        let bound = self.bound.take().ok_or(SchedulingError::NotBound)?;
        Ok(Bound::reclaim(bound))
    }

    fn graph(&self) -> Option<&Graph<C>> {
        self.bound.as_ref().map(|bound| &bound.graph)
    }

    fn run<I>(&self, inputs: I) -> Result<RunFuture<PayloadOf<C>>, Error>
    where
        I: IntoIterator<Item = (NodeId, PayloadOf<C>)>,
    {
        if self.shared.is_shut_down() {
            return Err(SchedulingError::ExecutorShutDown.into());
        }
        let bound = self.bound.as_ref().ok_or(SchedulingError::NotBound)?;
        bound.submit(inputs, |admitted| self.shared.start(bound, admitted, None))
    }

    fn wait_idle(&self) {
        if let Some(bound) = &self.bound {
            bound.statuses.wait_idle();
        }
    }

    fn shutdown(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        if let Some(bound) = &self.bound {
            bound.statuses.close();
            bound.statuses.wait_idle();
        }
        self.shared.stop();
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                tracing::error!("worker thread died");
            }
        }
        tracing::debug!("executor shut down");
    }

    fn snapshot(&self) -> Option<GraphSnapshot> {
        self.bound.as_ref().map(|bound| bound.snapshot())
    }
}

impl<C: Config> Drop for Executor<C> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
