use crate::{
    config::{Config, ExecutorConfig},
    error::{Error, SchedulingError},
    executor::{Bound, RunFuture, Scheduler, spawn_profiler},
    graph::{Firing, Graph, Node, Slot},
    profiler::{GraphSnapshot, MonitorSink, Profiler, ProfilerMode, SnapshotSource},
    types::{NodeId, ObjectId, PayloadOf},
};
use derive_more::Debug;
use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

/// Scheduler running every node on its own OS thread.
///
/// Each thread blocks on its predecessors' buffer pools until all of them
/// hold data, consumes one entry from each, executes, and publishes into its
/// own pools, waiting for free slots when they are full. Runs reach every
/// node in admission order, so inputs are matched by FIFO position.
///
/// Threads scale with the graph rather than the machine; useful as a
/// reference implementation of the [`Scheduler`] contract.
#[derive(Debug)]
pub struct DedicatedExecutor<C: Config> {
    cfg: ExecutorConfig,
    bound: Option<Arc<Bound<C>>>,
    #[debug(skip)]
    threads: Vec<JoinHandle<()>>,
    shut_down: bool,
}

impl<C: Config> DedicatedExecutor<C> {
    /// Create a scheduler running up to `pipeline_depth` runs at once.
    ///
    /// # Errors
    /// If `pipeline_depth` is out of range.
    pub fn new(pipeline_depth: usize) -> Result<Self, Error> {
        Self::with_config(ExecutorConfig::new().with_pipeline_depth(pipeline_depth))
    }

    /// Create a scheduler with explicit settings. `worker_count` and the
    /// steal settings are ignored.
    ///
    /// # Errors
    /// If the settings are invalid.
    pub fn with_config(cfg: ExecutorConfig) -> Result<Self, Error> {
        cfg.validate()?;
        Ok(Self {
            cfg,
            bound: None,
            threads: Vec::new(),
            shut_down: false,
        })
    }

    /// Settings the scheduler was created with.
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

    fn spawn_threads(&mut self, bound: &Arc<Bound<C>>) -> Result<(), SchedulingError> {
        for node in bound.graph.nodes() {
            let name = format!("{}-{}", self.cfg.thread_name, node.name());
            let id = node.id();
            let owned = Arc::clone(bound);
            let spawned = thread::Builder::new()
                .name(name.clone())
                .spawn(move || node_loop(&owned, id));
            match spawned {
                Ok(handle) => self.threads.push(handle),
                Err(err) => {
                    self.stop_threads(bound);
                    return Err(SchedulingError::Spawn {
                        name,
                        message: err.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Wait for in-flight runs, then wake and join every node thread.
    fn stop_threads(&mut self, bound: &Bound<C>) {
        bound.statuses.wait_idle();
        bound.graph.nodes().iter().for_each(Node::close_pools);
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                tracing::error!("node thread died");
            }
        }
    }
}

impl<C: Config> Scheduler<C> for DedicatedExecutor<C> {
    fn bind(&mut self, graph: Graph<C>) -> Result<(), Error> {
        if self.shut_down {
            return Err(SchedulingError::ExecutorShutDown.into());
        }
        if self.bound.is_some() {
            return Err(SchedulingError::AlreadyBound.into());
        }
        let bound = Arc::new(Bound::new(graph, &self.cfg)?);
        self.spawn_threads(&bound)?;
        tracing::debug!(threads = self.threads.len(), "node threads started");
        self.bound = Some(bound);
        Ok(())
    }

    fn unbind(&mut self) -> Result<Graph<C>, Error> {
        let bound = self.bound.take().ok_or(SchedulingError::NotBound)?;
        self.stop_threads(&bound);
        Ok(Bound::reclaim(bound))
    }

    fn graph(&self) -> Option<&Graph<C>> {
        self.bound.as_ref().map(|bound| &bound.graph)
    }

    fn run<I>(&self, inputs: I) -> Result<RunFuture<PayloadOf<C>>, Error>
    where
        I: IntoIterator<Item = (NodeId, PayloadOf<C>)>,
    {
        if self.shut_down {
            return Err(SchedulingError::ExecutorShutDown.into());
        }
        let bound = self.bound.as_ref().ok_or(SchedulingError::NotBound)?;
        bound.submit(inputs, |admitted| {
            bound.stage(admitted);
        })
    }

    fn wait_idle(&self) {
        if let Some(bound) = &self.bound {
            bound.statuses.wait_idle();
        }
    }

    fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        if let Some(bound) = self.bound.clone() {
            bound.statuses.close();
            self.stop_threads(&bound);
        }
        tracing::debug!("dedicated executor shut down");
    }

    fn snapshot(&self) -> Option<GraphSnapshot> {
        self.bound.as_ref().map(|bound| bound.snapshot())
    }
}

impl<C: Config> Drop for DedicatedExecutor<C> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Body of the thread dedicated to node `id`. Exits once a pool it reads
/// from is closed.
fn node_loop<C: Config>(bound: &Bound<C>, id: NodeId) {
    let node = bound.graph.node_at(id);
    tracing::debug!(node = %id, name = node.name(), "node thread started");
    while let Some((object_id, inputs)) = next_inputs(&bound.graph, node) {
        let slot = bound
            .statuses
            .slot_of(object_id)
            .expect("node_loop: [1]");
        let status = bound.statuses.status(slot);
        tracing::trace!(node = %id, object_id, "executing node");
        let Firing {
            output,
            error,
            outgoing,
        } = node.fire(inputs, status.is_failed());
        // Successors may finish the run once they see the entries, so the
        // outcome is recorded first.
        status.record(id, output, error);
        node.publish(object_id, outgoing);
        if node.is_sink() && status.finish_sink() {
            bound.statuses.complete(slot, |admitted| {
                bound.stage(admitted);
            });
        }
    }
    tracing::debug!(node = %id, "node thread stopped");
}

/// Block until every predecessor pool, or the staging pool of an input node,
/// has an entry, and take one from each.
fn next_inputs<C: Config>(
    graph: &Graph<C>,
    node: &Node<C>,
) -> Option<(ObjectId, Vec<Slot<C>>)> {
    if node.is_source() {
        let staged = node.input_pool().pop()?;
        return Some((staged.object_id, staged.payload.map(Some).into_iter().collect()));
    }
    let mut object_id = None;
    let mut inputs = Vec::with_capacity(node.predecessors().len());
    for &pred in node.predecessors() {
        let entry = graph.node_at(pred).pool_towards(node.id()).pop()?;
        assert_eq!(
            *object_id.get_or_insert(entry.object_id),
            entry.object_id,
            "next_inputs: [1]"
        );
        inputs.push(entry.payload);
    }
    Some((object_id.expect("next_inputs: [2]"), inputs))
}
