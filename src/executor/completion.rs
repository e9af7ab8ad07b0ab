use crate::{
    error::Error,
    sync::{Condvar, Mutex, lock, wait},
    types::{NodeId, ObjectId},
};
use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, Waker},
};

/// Outcome of a run.
pub(crate) type RunOutcome<P> = Result<RunResult<P>, Error>;

/// Single-assignment cell shared between a run's status and its
/// [`RunFuture`].
#[derive(Debug)]
pub(crate) struct Completion<P> {
    state: Mutex<CompletionState<P>>,
    resolved: Condvar,
}

#[derive(Debug)]
struct CompletionState<P> {
    outcome: Option<RunOutcome<P>>,
    resolved: bool,
    waker: Option<Waker>,
}

impl<P> Completion<P> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(CompletionState {
                outcome: None,
                resolved: false,
                waker: None,
            }),
            resolved: Condvar::new(),
        }
    }

    /// Store the outcome and wake the waiter.
    ///
    /// # Panics
    /// If the cell was already resolved.
    pub(crate) fn resolve(&self, outcome: RunOutcome<P>) {
        let waker = {
            let mut state = lock(&self.state);
            assert!(!state.resolved, "Completion::resolve: [1]");
            state.resolved = true;
            state.outcome = Some(outcome);
            state.waker.take()
        };
        self.resolved.notify_all();
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// Handle to the eventual result of one run.
///
/// Can be waited on synchronously ([`wait`](Self::wait)) or awaited as a
/// [`Future`]. Dropping it does not cancel the run.
#[must_use = "a run's outcome is only observable through its future"]
#[derive(Debug)]
pub struct RunFuture<P> {
    object_id: ObjectId,
    completion: Arc<Completion<P>>,
}

impl<P> RunFuture<P> {
    pub(crate) fn new(object_id: ObjectId, completion: Arc<Completion<P>>) -> Self {
        Self {
            object_id,
            completion,
        }
    }

    /// Correlation tag of the run, also carried by its [`RunResult`].
    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    /// Whether the run has finished and its outcome was not taken yet.
    pub fn is_ready(&self) -> bool {
        lock(&self.completion.state).outcome.is_some()
    }

    /// Block until the run finishes.
    ///
    /// # Errors
    /// The run's [`ExecutionError`](crate::error::ExecutionError), or
    /// [`Cancelled`](crate::error::SchedulingError::Cancelled) if it never
    /// started.
    ///
    /// # Panics
    /// If the outcome was already taken with [`try_take`](Self::try_take).
    pub fn wait(self) -> RunOutcome<P> {
        let mut state = lock(&self.completion.state);
        while !state.resolved {
            state = wait(&self.completion.resolved, state);
        }
        state.outcome.take().expect("RunFuture::wait: [1]")
    }

    /// Block for at most `timeout`; `None` if the run is still going.
    ///
    /// # Errors
    /// Same as [`wait`](Self::wait).
    #[cfg(not(feature = "loom"))]
    pub fn wait_timeout(&self, timeout: std::time::Duration) -> Option<RunOutcome<P>> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = lock(&self.completion.state);
        while !state.resolved {
            let left = deadline.saturating_duration_since(std::time::Instant::now());
            if left.is_zero() {
                return None;
            }
            state = crate::sync::wait_timeout(&self.completion.resolved, state, left);
        }
        state.outcome.take()
    }

    /// Take the outcome if the run has finished.
    pub fn try_take(&self) -> Option<RunOutcome<P>> {
        lock(&self.completion.state).outcome.take()
    }
}

impl<P> Future for RunFuture<P> {
    type Output = RunOutcome<P>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = lock(&self.completion.state);
        if let Some(outcome) = state.outcome.take() {
            return Poll::Ready(outcome);
        }
        assert!(!state.resolved, "RunFuture::poll: polled after completion");
        match &mut state.waker {
            Some(waker) => waker.clone_from(cx.waker()),
            None => state.waker = Some(cx.waker().clone()),
        }
        Poll::Pending
    }
}

/// Sink outputs of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult<P> {
    object_id: ObjectId,
    outputs: Vec<(NodeId, P)>,
}

impl<P> RunResult<P> {
    pub(crate) fn new(object_id: ObjectId, mut outputs: Vec<(NodeId, P)>) -> Self {
        outputs.sort_unstable_by_key(|(node, _)| *node);
        Self { object_id, outputs }
    }

    /// Correlation tag of the run.
    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    /// Output published by sink `node`.
    pub fn output(&self, node: NodeId) -> Option<&P> {
        self.outputs
            .binary_search_by_key(&node, |(id, _)| *id)
            .ok()
            .map(|idx| &self.outputs[idx].1)
    }

    /// Every sink output, ordered by node id.
    pub fn outputs(&self) -> &[(NodeId, P)] {
        &self.outputs
    }

    /// Take the sink outputs, ordered by node id.
    pub fn into_outputs(self) -> Vec<(NodeId, P)> {
        self.outputs
    }
}
