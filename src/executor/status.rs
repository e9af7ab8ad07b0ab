use crate::{
    error::{ExecutionError, SchedulingError},
    executor::completion::{Completion, RunFuture, RunResult},
    profiler::RunSnapshot,
    sync::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Condvar, Mutex, Ordering, lock, wait},
    types::{NodeId, ObjectId},
};
use std::{collections::VecDeque, sync::Arc};

/// Staged payload per input node, `None` for callback sources without one.
pub(crate) type StagedInputs<P> = Vec<(NodeId, Option<P>)>;

/// A run that just received a pipeline slot and must be started.
#[derive(Debug)]
pub(crate) struct Admitted<P> {
    pub(crate) slot: u16,
    pub(crate) object_id: ObjectId,
    pub(crate) inputs: StagedInputs<P>,
}

#[derive(Debug)]
struct PendingRun<P> {
    object_id: ObjectId,
    inputs: StagedInputs<P>,
    completion: Arc<Completion<P>>,
}

/// Bookkeeping of the run occupying one pipeline slot.
#[derive(Debug)]
pub(crate) struct RunStatus<P> {
    object_id: AtomicU64,
    remaining_deps: Box<[AtomicU16]>,
    remaining_sinks: AtomicUsize,
    failed: AtomicBool,
    record: Mutex<RunRecord<P>>,
}

#[derive(Debug)]
struct RunRecord<P> {
    error: Option<ExecutionError>,
    outputs: Vec<(NodeId, P)>,
    completion: Option<Arc<Completion<P>>>,
}

impl<P> RunStatus<P> {
    fn new(num_nodes: usize) -> Self {
        Self {
            object_id: AtomicU64::new(ObjectId::MAX),
            remaining_deps: (0..num_nodes).map(|_| AtomicU16::new(0)).collect(),
            remaining_sinks: AtomicUsize::new(0),
            failed: AtomicBool::new(false),
            record: Mutex::new(RunRecord {
                error: None,
                outputs: Vec::new(),
                completion: None,
            }),
        }
    }

    fn reset(
        &self,
        object_id: ObjectId,
        in_degrees: &[u16],
        num_sinks: usize,
        completion: Arc<Completion<P>>,
    ) {
        let mut record = lock(&self.record);
        assert!(record.completion.is_none(), "RunStatus::reset: [1]");
        record.error = None;
        record.outputs.clear();
        record.completion = Some(completion);
        drop(record);
        for (counter, &degree) in self.remaining_deps.iter().zip(in_degrees) {
            counter.store(degree, Ordering::Relaxed);
        }
        self.remaining_sinks.store(num_sinks, Ordering::Relaxed);
        self.failed.store(false, Ordering::Relaxed);
        self.object_id.store(object_id, Ordering::Release);
    }

    pub(crate) fn object_id(&self) -> ObjectId {
        self.object_id.load(Ordering::Acquire)
    }

    /// Whether a node of this run already failed.
    pub(crate) fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Count one finished predecessor of `node`. True for the last one.
    ///
    /// # Panics
    /// If the counter was already zero.
    pub(crate) fn release_dependency(&self, node: NodeId) -> bool {
        let prev = self.remaining_deps[node.index()].fetch_sub(1, Ordering::AcqRel);
        assert_ne!(prev, 0, "RunStatus::release_dependency: [1]");
        prev == 1
    }

    /// Store what one node execution produced. The first error wins.
    pub(crate) fn record(&self, node: NodeId, output: Option<P>, error: Option<ExecutionError>) {
        if output.is_none() && error.is_none() {
            return;
        }
        let mut record = lock(&self.record);
        if let Some(error) = error {
            self.failed.store(true, Ordering::Release);
            record.error.get_or_insert(error);
        }
        if let Some(output) = output {
            record.outputs.push((node, output));
        }
    }

    /// Count one finished sink. True for the last one.
    ///
    /// # Panics
    /// If every sink already finished.
    pub(crate) fn finish_sink(&self) -> bool {
        let prev = self.remaining_sinks.fetch_sub(1, Ordering::AcqRel);
        assert_ne!(prev, 0, "RunStatus::finish_sink: [1]");
        prev == 1
    }

    fn take_outcome(&self) -> (Result<RunResult<P>, ExecutionError>, Arc<Completion<P>>) {
        let object_id = self.object_id();
        let mut record = lock(&self.record);
        let completion = record
            .completion
            .take()
            .expect("RunStatus::take_outcome: [1]");
        let outputs = std::mem::take(&mut record.outputs);
        let outcome = match record.error.take() {
            Some(error) => Err(error),
            None => Ok(RunResult::new(object_id, outputs)),
        };
        (outcome, completion)
    }
}

/// Fixed table of `pipeline_depth` run slots plus the bounded FIFO backlog of
/// runs waiting for one.
///
/// A slot is handed out from a free list and only returns to it once its run
/// completed, so a slot still in use is never reused. The thread completing a
/// run moves the oldest backlog entry into the freed slot.
#[derive(Debug)]
pub(crate) struct StatusTable<P> {
    slots: Box<[RunStatus<P>]>,
    in_degrees: Box<[u16]>,
    num_sinks: usize,
    backlog_capacity: usize,
    admission: Mutex<Admission<P>>,
    idle: Condvar,
}

#[derive(Debug)]
struct Admission<P> {
    free: Vec<u16>,
    backlog: VecDeque<PendingRun<P>>,
    next_object_id: ObjectId,
    in_flight: usize,
    closed: bool,
}

impl<P> StatusTable<P> {
    /// # Panics
    /// If `depth` does not fit in `u16`.
    pub(crate) fn new(
        depth: usize,
        in_degrees: impl IntoIterator<Item = u16>,
        num_sinks: usize,
        backlog_capacity: usize,
    ) -> Self {
        let depth = u16::try_from(depth).expect("StatusTable::new: [1]");
        let in_degrees: Box<[u16]> = in_degrees.into_iter().collect();
        Self {
            slots: (0..depth).map(|_| RunStatus::new(in_degrees.len())).collect(),
            in_degrees,
            num_sinks,
            backlog_capacity,
            admission: Mutex::new(Admission {
                free: (0..depth).rev().collect(),
                backlog: VecDeque::new(),
                next_object_id: 0,
                in_flight: 0,
                closed: false,
            }),
            idle: Condvar::new(),
        }
    }

    pub(crate) fn status(&self, slot: u16) -> &RunStatus<P> {
        &self.slots[usize::from(slot)]
    }

    /// Slot of the in-flight run `object_id`.
    pub(crate) fn slot_of(&self, object_id: ObjectId) -> Option<u16> {
        self.slots
            .iter()
            .position(|status| status.object_id() == object_id)
            .map(|idx| u16::try_from(idx).expect("StatusTable::slot_of: [1]"))
    }

    /// Admit a new run. If a slot is free, `start` is called with it before
    /// this returns, still under the admission lock, so runs start in
    /// submission order.
    ///
    /// # Errors
    /// If the table is closed or the backlog is full.
    pub(crate) fn submit(
        &self,
        inputs: StagedInputs<P>,
        start: impl FnOnce(Admitted<P>),
    ) -> Result<RunFuture<P>, SchedulingError> {
        let mut admission = lock(&self.admission);
        if admission.closed {
            return Err(SchedulingError::ExecutorShutDown);
        }
        if admission.free.is_empty() && admission.backlog.len() >= self.backlog_capacity {
            return Err(SchedulingError::RunQueueOverflow {
                capacity: self.backlog_capacity,
            });
        }
        let object_id = admission.next_object_id;
        admission.next_object_id += 1;
        let completion = Arc::new(Completion::new());
        let future = RunFuture::new(object_id, Arc::clone(&completion));
        match admission.free.pop() {
            Some(slot) => {
                self.launch(&mut admission, slot, object_id, completion);
                tracing::debug!(object_id, slot, "run admitted");
                start(Admitted {
                    slot,
                    object_id,
                    inputs,
                });
            }
            None => {
                tracing::debug!(
                    object_id,
                    backlog = admission.backlog.len() + 1,
                    "run queued"
                );
                admission.backlog.push_back(PendingRun {
                    object_id,
                    inputs,
                    completion,
                });
            }
        }
        Ok(future)
    }

    fn launch(
        &self,
        admission: &mut Admission<P>,
        slot: u16,
        object_id: ObjectId,
        completion: Arc<Completion<P>>,
    ) {
        self.status(slot)
            .reset(object_id, &self.in_degrees, self.num_sinks, completion);
        admission.in_flight += 1;
    }

    /// Finish the run in `slot`: free the slot (or hand it to the oldest
    /// backlog entry, started through `start`), then resolve the run.
    pub(crate) fn complete(&self, slot: u16, start: impl FnOnce(Admitted<P>)) {
        let status = self.status(slot);
        let object_id = status.object_id();
        let (outcome, completion) = status.take_outcome();
        {
            let mut admission = lock(&self.admission);
            admission.in_flight = admission
                .in_flight
                .checked_sub(1)
                .expect("StatusTable::complete: [1]");
            match admission.backlog.pop_front() {
                Some(PendingRun {
                    object_id,
                    inputs,
                    completion,
                }) => {
                    self.launch(&mut admission, slot, object_id, completion);
                    tracing::debug!(object_id, slot, "queued run admitted");
                    start(Admitted {
                        slot,
                        object_id,
                        inputs,
                    });
                }
                None => admission.free.push(slot),
            }
            if admission.in_flight == 0 {
                self.idle.notify_all();
            }
        }
        tracing::debug!(object_id, slot, ok = outcome.is_ok(), "run completed");
        completion.resolve(outcome.map_err(Into::into));
    }

    /// Refuse new runs and cancel the backlog. Runs already holding a slot
    /// are left to finish.
    pub(crate) fn close(&self) {
        let cancelled: Vec<_> = {
            let mut admission = lock(&self.admission);
            admission.closed = true;
            admission.backlog.drain(..).collect()
        };
        for run in cancelled {
            tracing::debug!(object_id = run.object_id, "run cancelled");
            run.completion
                .resolve(Err(SchedulingError::Cancelled.into()));
        }
    }

    #[cfg(test)]
    pub(crate) fn is_closed(&self) -> bool {
        lock(&self.admission).closed
    }

    /// Block until no run holds a slot.
    pub(crate) fn wait_idle(&self) {
        let mut admission = lock(&self.admission);
        while admission.in_flight > 0 {
            admission = wait(&self.idle, admission);
        }
    }

    /// In-flight runs ordered by slot, and the backlog length.
    pub(crate) fn snapshot(&self) -> (Vec<RunSnapshot>, usize) {
        let admission = lock(&self.admission);
        let runs = (0..self.slots.len())
            .map(|idx| u16::try_from(idx).expect("StatusTable::snapshot: [1]"))
            .filter(|slot| !admission.free.contains(slot))
            .map(|slot| {
                let status = self.status(slot);
                RunSnapshot {
                    slot,
                    object_id: status.object_id(),
                    remaining_sinks: status.remaining_sinks.load(Ordering::Relaxed),
                }
            })
            .collect();
        (runs, admission.backlog.len())
    }
}
