use crate::{graph::GraphError, payload::PayloadCopyError, types::NodeId};
use thiserror::Error;

/// Invalid [`ExecutorConfig`](crate::config::ExecutorConfig) values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// The work-stealing pool needs at least one worker.
    #[error("worker count must be at least 1")]
    ZeroWorkers,
    /// At least one run must be able to be in flight.
    #[error("pipeline depth must be at least 1")]
    ZeroPipelineDepth,
    /// Pipeline slots are indexed by `u16`.
    #[error("pipeline depth {0} exceeds {max}", max = u16::MAX)]
    PipelineDepthTooLarge(usize),
}

/// Failures surfaced to the caller of `run`, `bind` or `unbind`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SchedulingError {
    /// The executor has been shut down.
    #[error("executor is shut down")]
    ExecutorShutDown,
    /// The run was still waiting for a pipeline slot when the executor shut
    /// down.
    #[error("run was cancelled before it started")]
    Cancelled,
    /// All pipeline slots are busy and the backlog is full.
    #[error("run backlog is full ({capacity} pending runs)")]
    RunQueueOverflow {
        /// Configured backlog capacity.
        capacity: usize,
    },
    /// No graph is bound to the executor.
    #[error("no graph is bound to the executor")]
    NotBound,
    /// A graph is already bound to the executor.
    #[error("a graph is already bound to the executor")]
    AlreadyBound,
    /// A source node without a callback was given no payload.
    #[error("input node {0} has no callback and received no payload")]
    MissingInput(NodeId),
    /// A payload was given to a node that has predecessors.
    #[error("node {0} is not an input node")]
    UnexpectedInput(NodeId),
    /// Two payloads were given to the same input node.
    #[error("input node {0} received more than one payload")]
    DuplicateInput(NodeId),
    /// Failed to spawn a thread.
    #[error("failed to spawn thread `{name}`: {message}")]
    Spawn {
        /// Name of the thread.
        name: String,
        /// OS error message.
        message: String,
    },
}

/// Failures contained to the run whose node produced them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ExecutionError {
    /// The node callback returned an error.
    #[error("node {node} failed: {message}")]
    WorkFnFailed {
        /// The failing node.
        node: NodeId,
        /// Rendered callback error.
        message: String,
    },
    /// The node callback panicked.
    #[error("node {node} panicked: {message}")]
    WorkFnPanicked {
        /// The panicking node.
        node: NodeId,
        /// Panic message, if it was a string.
        message: String,
    },
    /// A fan-out copy of the node's output could not be made.
    #[error("node {node} could not copy its output: {source}")]
    PayloadCopyFailed {
        /// The producing node.
        node: NodeId,
        /// Copy failure reported by the payload.
        #[source]
        source: PayloadCopyError,
    },
    /// A callback-less node had nothing to forward.
    #[error("pass-through node {0} received no input")]
    NoInput(NodeId),
}

/// Crate-level error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Invalid graph structure or graph mutation.
    #[error(transparent)]
    Graph(#[from] GraphError),
    /// The run could not be scheduled or was cancelled.
    #[error(transparent)]
    Scheduling(#[from] SchedulingError),
    /// A node of the run failed.
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    /// Invalid executor configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Crate-level result alias.
pub type Result<T, E = Error> = core::result::Result<T, E>;
