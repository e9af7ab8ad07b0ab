use crate::{
    config::{Config, ExecutorConfig},
    error::SchedulingError,
    executor::{Bound, notifier::Notifier, status::Admitted},
    graph::Firing,
    sync::{AtomicBool, AtomicUsize, Ordering, yield_now},
    types::{NodeId, PayloadOf},
};
use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use rand::{Rng, SeedableRng, rngs::SmallRng};
use std::{
    sync::Arc,
    thread::{self, JoinHandle},
};

/// One node to execute for the run in `slot`.
pub(crate) struct Task<C: Config> {
    bound: Arc<Bound<C>>,
    node: NodeId,
    slot: u16,
}

/// Per-worker state, handed explicitly to every scheduling function.
pub(crate) struct WorkerContext<C: Config> {
    id: usize,
    local: Worker<Task<C>>,
    rng: SmallRng,
}

impl<C: Config> WorkerContext<C> {
    fn new(id: usize, local: Worker<Task<C>>, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => SmallRng::seed_from_u64(seed ^ id as u64),
            None => SmallRng::from_entropy(),
        };
        Self { id, local, rng }
    }
}

/// State shared by all workers of one executor.
pub(crate) struct Shared<C: Config> {
    injector: Injector<Task<C>>,
    stealers: Box<[Stealer<Task<C>>]>,
    notifier: Notifier,
    num_actives: AtomicUsize,
    num_thieves: AtomicUsize,
    shutdown: AtomicBool,
    steal_spins: usize,
    yield_limit: usize,
}

impl<C: Config> Shared<C> {
    fn new(cfg: &ExecutorConfig) -> (Arc<Self>, Vec<WorkerContext<C>>) {
        let locals: Vec<_> = (0..cfg.worker_count).map(|_| Worker::new_lifo()).collect();
        let shared = Arc::new(Self {
            injector: Injector::new(),
            stealers: locals.iter().map(Worker::stealer).collect(),
            notifier: Notifier::new(),
            num_actives: AtomicUsize::new(0),
            num_thieves: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            steal_spins: cfg.effective_steal_spins(),
            yield_limit: cfg.yield_limit,
        });
        let contexts = locals
            .into_iter()
            .enumerate()
            .map(|(id, local)| WorkerContext::new(id, local, cfg.rng_seed))
            .collect();
        (shared, contexts)
    }

    /// Create the shared state and one running thread per worker.
    pub(crate) fn spawn(
        cfg: &ExecutorConfig,
    ) -> Result<(Arc<Self>, Vec<JoinHandle<()>>), SchedulingError> {
        let (shared, contexts) = Self::new(cfg);
        let mut threads = Vec::with_capacity(contexts.len());
        for ctx in contexts {
            let name = format!("{}-worker-{}", cfg.thread_name, ctx.id);
            let worker = Arc::clone(&shared);
            match thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker.worker_loop(ctx))
            {
                Ok(handle) => threads.push(handle),
                Err(err) => {
                    shared.stop();
                    for handle in threads {
                        let _ = handle.join();
                    }
                    return Err(SchedulingError::Spawn {
                        name,
                        message: err.to_string(),
                    });
                }
            }
        }
        Ok((shared, threads))
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Ask every worker to exit once the queues are empty.
    pub(crate) fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.notifier.notify(true);
    }

    fn worker_loop(&self, mut ctx: WorkerContext<C>) {
        tracing::debug!(worker = ctx.id, "worker started");
        let mut task = None;
        loop {
            self.exploit(&mut ctx, &mut task);
            if !self.wait_for_task(&mut ctx, &mut task) {
                break;
            }
        }
        tracing::debug!(worker = ctx.id, "worker stopped");
    }

    /// Run `task` and then everything that lands in the local deque.
    fn exploit(&self, ctx: &mut WorkerContext<C>, task: &mut Option<Task<C>>) {
        let Some(first) = task.take() else {
            return;
        };
        // The first worker to become active wakes a thief for the work it is
        // about to spawn.
        if self.num_actives.fetch_add(1, Ordering::SeqCst) == 0
            && self.num_thieves.load(Ordering::SeqCst) == 0
        {
            self.notifier.notify(false);
        }
        let mut next = Some(first);
        while let Some(task) = next {
            self.execute(task, ctx);
            next = ctx.local.pop();
        }
        self.num_actives.fetch_sub(1, Ordering::SeqCst);
    }

    /// Steal from uniformly random victims. Picking oneself means the
    /// injection queue. Gives up after `steal_spins` failures followed by
    /// `yield_limit` yields.
    fn explore(&self, ctx: &mut WorkerContext<C>) -> Option<Task<C>> {
        let mut failures = 0;
        let mut yields = 0;
        while !self.shutdown.load(Ordering::Relaxed) {
            let victim = ctx.rng.gen_range(0..self.stealers.len());
            let stolen = if victim == ctx.id {
                self.injector.steal_batch_and_pop(&ctx.local)
            } else {
                self.stealers[victim].steal()
            };
            if let Steal::Success(task) = stolen {
                tracing::trace!(worker = ctx.id, victim, "stole task");
                return Some(task);
            }
            failures += 1;
            if failures >= self.steal_spins {
                if yields >= self.yield_limit {
                    break;
                }
                yield_now();
                yields += 1;
            }
        }
        None
    }

    /// Explore, then park. Returns `false` when the worker must exit.
    fn wait_for_task(&self, ctx: &mut WorkerContext<C>, task: &mut Option<Task<C>>) -> bool {
        self.num_thieves.fetch_add(1, Ordering::SeqCst);
        loop {
            if let Some(found) = self.explore(ctx) {
                return self.found(task, found);
            }
            let ticket = self.notifier.prepare_wait();
            // Re-check after registering to close the race with a producer
            // that pushed before we became a waiter.
            if !self.injector.is_empty() {
                self.notifier.cancel_wait();
                if let Steal::Success(found) = self.injector.steal() {
                    return self.found(task, found);
                }
                continue;
            }
            if self.shutdown.load(Ordering::SeqCst) {
                self.notifier.cancel_wait();
                self.notifier.notify(true);
                self.num_thieves.fetch_sub(1, Ordering::SeqCst);
                return false;
            }
            // The last thief keeps exploring while anyone is still active.
            if self.num_thieves.fetch_sub(1, Ordering::SeqCst) == 1
                && self.num_actives.load(Ordering::SeqCst) > 0
            {
                self.notifier.cancel_wait();
                self.num_thieves.fetch_add(1, Ordering::SeqCst);
                continue;
            }
            self.notifier.commit_wait(ticket);
            return true;
        }
    }

    fn found(&self, slot: &mut Option<Task<C>>, task: Task<C>) -> bool {
        *slot = Some(task);
        // Hand the thief role to someone else.
        if self.num_thieves.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.notifier.notify(false);
        }
        true
    }

    /// Enqueue a ready task: on the worker's own deque, or on the injection
    /// queue with a wake-up when called from outside the pool.
    fn schedule(&self, task: Task<C>, ctx: Option<&WorkerContext<C>>) {
        match ctx {
            Some(ctx) => ctx.local.push(task),
            None => {
                self.injector.push(task);
                self.notifier.notify(false);
            }
        }
    }

    /// Stage the inputs of a run that just got its slot and schedule its
    /// input nodes.
    pub(crate) fn start(
        &self,
        bound: &Arc<Bound<C>>,
        admitted: Admitted<PayloadOf<C>>,
        ctx: Option<&WorkerContext<C>>,
    ) {
        let slot = bound.stage(admitted);
        for &source in bound.graph.sources() {
            let task = Task {
                bound: Arc::clone(bound),
                node: source,
                slot,
            };
            self.schedule(task, ctx);
        }
    }

    /// Execute one node, then release its successors or, for the last sink,
    /// complete the run.
    fn execute(&self, task: Task<C>, ctx: &WorkerContext<C>) {
        let Task { bound, node, slot } = task;
        let status = bound.statuses.status(slot);
        let object_id = status.object_id();
        let current = bound.graph.node_at(node);
        let inputs = bound
            .graph
            .take_inputs(node, object_id)
            .expect("Shared::execute: [1]");
        tracing::trace!(worker = ctx.id, %node, object_id, "executing node");
        let Firing {
            output,
            error,
            outgoing,
        } = current.fire(inputs, status.is_failed());
        status.record(node, output, error);
        current.publish(object_id, outgoing);

        if current.is_sink() {
            if status.finish_sink() {
                bound
                    .statuses
                    .complete(slot, |admitted| self.start(&bound, admitted, Some(ctx)));
            }
            return;
        }
        for &successor in current.successors() {
            if status.release_dependency(successor) {
                self.schedule(
                    Task {
                        bound: Arc::clone(&bound),
                        node: successor,
                        slot,
                    },
                    Some(ctx),
                );
            }
        }
    }
}
