//! Pipelined dataflow task-graph executor.
//!
//! A [`Graph`](graph::Graph) is a DAG of nodes, each holding an optional
//! callback that turns one payload per predecessor into one output payload.
//! Bound to a scheduler, the graph can execute several runs at once: up to
//! `pipeline_depth` runs are in flight, each in its own status slot, and the
//! data of different runs is kept apart by tagging every payload with the
//! run's [`ObjectId`](types::ObjectId).
//!
//! Key modules:
//! - `config`: the `Config` trait binding the payload type, and
//!   `ExecutorConfig` runtime settings.
//! - `graph`: graph construction, validation and freezing; `Node` also
//!   offers a manual push/pop harness.
//! - `pool`: the fixed-capacity buffer pool carrying data along each edge.
//! - `executor`: the `Scheduler` contract with a work-stealing `Executor`
//!   and a thread-per-node `DedicatedExecutor`, plus `RunFuture`/`RunResult`.
//! - `profiler`: snapshots of nodes and runs and a background sampler.
//!
//! Quick start:
//! 1. Implement `Config` with your payload type (see `payload::Payload`).
//! 2. Build a `Graph` with `add_source`/`add_node` and `precede`.
//! 3. Create an `Executor`, `bind` the graph and call `run` with one payload
//!    per input node; wait on or `.await` the returned `RunFuture`.
//!
//! Within one run a node executes only after all its predecessors have
//! published their output for that run. A failing or panicking callback fails
//! its own run only; the executor and the graph stay usable.

/// Public interface to configure graphs and executors.
///
/// Exposes the `Config` trait, which binds the payload type of a concrete
/// instantiation, and `ExecutorConfig` with the scheduler's runtime knobs.
pub mod config;
/// Error types of every layer and the crate-level `Error`.
pub mod error;
/// Schedulers that execute a bound graph.
///
/// Contains the `Scheduler` trait, the work-stealing `Executor` (worker
/// deques, injection queue, parking), the thread-per-node
/// `DedicatedExecutor`, and the per-run status tracking behind `RunFuture`.
pub mod executor;
/// The computation graph: node arena, edges, validation and freezing.
pub mod graph;
/// The `Payload` trait for data moved between nodes.
pub mod payload;
/// Fixed-capacity buffer pools with blocking backpressure.
pub mod pool;
/// Read-only snapshots and periodic sampling of a bound graph.
pub mod profiler;
mod sync;
/// Core types shared across the crate (ids, aliases).
pub mod types;
mod utils;
/// The node callback trait.
pub mod work;

pub use crate::{
    config::{Config, ExecutorConfig},
    error::{Error, Result},
    executor::{DedicatedExecutor, Executor, RunFuture, RunResult, Scheduler},
    graph::Graph,
    types::NodeId,
};
