#![allow(dead_code)]

use crossbeam_channel::{Receiver, Sender};
use pipegraph::{
    config::{Config, ExecutorConfig},
    error::{Error, ExecutionError, SchedulingError},
    executor::Scheduler,
    graph::{Graph, GraphError},
    payload::{Payload, PayloadCopyError},
    profiler::{GraphSnapshot, ProfilerMode},
    types::{NodeId, WorkResult},
};
use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};
use tracing_subscriber::EnvFilter;

pub struct Ints;

impl Config for Ints {
    type Payload = i64;
}

/// Payload whose copies fail for 0 and panic for 13.
#[derive(Debug, PartialEq)]
pub struct Touchy(pub i64);

impl Payload for Touchy {
    fn try_copy(&self) -> Result<Self, PayloadCopyError> {
        match self.0 {
            0 => Err(PayloadCopyError::new("zero is not copyable")),
            13 => panic!("copying 13"),
            x => Ok(Touchy(x)),
        }
    }
}

pub struct Touchies;

impl Config for Touchies {
    type Payload = Touchy;
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn cfg(pipeline_depth: usize) -> ExecutorConfig {
    ExecutorConfig::new()
        .with_pipeline_depth(pipeline_depth)
        .with_thread_name("test")
}

/// `a -> b -> c` with `b = x + 1`, `c = x * 2`.
pub fn chain_graph() -> (Graph<Ints>, [NodeId; 3]) {
    let mut graph = Graph::new();
    let a = graph.add_source("a").unwrap();
    let b = graph.add_node("b", |x| Ok(x[0] + 1)).unwrap();
    let c = graph.add_node("c", |x| Ok(x[0] * 2)).unwrap();
    graph.precede(a, b).unwrap();
    graph.precede(b, c).unwrap();
    (graph, [a, b, c])
}

/// Chain whose middle node takes one token from the returned sender per
/// execution.
pub fn gated_chain() -> (Graph<Ints>, [NodeId; 3], Sender<()>) {
    let (open, gate): (Sender<()>, Receiver<()>) = crossbeam_channel::unbounded();
    let mut graph = Graph::new();
    let a = graph.add_source("a").unwrap();
    let b = graph
        .add_node("b", move |x| {
            gate.recv()?;
            Ok(x[0] + 1)
        })
        .unwrap();
    let c = graph.add_node("c", |x| Ok(x[0] * 2)).unwrap();
    graph.precede(a, b).unwrap();
    graph.precede(b, c).unwrap();
    (graph, [a, b, c], open)
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..2000 {
        if cond() {
            return;
        }
        thread::sleep(Duration::from_millis(1));
    }
    panic!("timed out waiting for {what}");
}

pub fn single_run<S: Scheduler<Ints>>(make: impl Fn(ExecutorConfig) -> S) {
    init_tracing();
    let (graph, [a, _, c]) = chain_graph();
    let mut scheduler = make(cfg(2));
    scheduler.bind(graph).unwrap();
    let result = scheduler.run([(a, 10)]).unwrap().wait().unwrap();
    assert_eq!(result.output(c), Some(&22));
    assert_eq!(result.outputs().len(), 1);
}

pub fn pipelined_runs_keep_their_object_ids<S: Scheduler<Ints>>(
    make: impl Fn(ExecutorConfig) -> S,
) {
    init_tracing();
    let (graph, [a, _, c]) = chain_graph();
    let mut scheduler = make(cfg(2));
    scheduler.bind(graph).unwrap();
    let first = scheduler.run([(a, 10)]).unwrap();
    let second = scheduler.run([(a, 20)]).unwrap();
    let (first_id, second_id) = (first.object_id(), second.object_id());
    assert_ne!(first_id, second_id);

    let second = second.wait().unwrap();
    let first = first.wait().unwrap();
    assert_eq!((first.object_id(), first.output(c)), (first_id, Some(&22)));
    assert_eq!((second.object_id(), second.output(c)), (second_id, Some(&42)));
}

pub fn diamond_fan_out<S: Scheduler<Ints>>(make: impl Fn(ExecutorConfig) -> S) {
    init_tracing();
    let mut graph = Graph::<Ints>::new();
    let a = graph.add_source("a").unwrap();
    let b = graph.add_node("b", |x| Ok(x[0] + 1)).unwrap();
    let c = graph.add_node("c", |x| Ok(x[0] * 10)).unwrap();
    let d = graph.add_node("d", |x| Ok(x[0] * 1000 + x[1])).unwrap();
    graph.precede(a, b).unwrap();
    graph.precede(a, c).unwrap();
    graph.precede(b, d).unwrap();
    graph.precede(c, d).unwrap();

    let mut scheduler = make(cfg(3));
    scheduler.bind(graph).unwrap();
    let runs: Vec<_> = (1..=6)
        .map(|x| (x, scheduler.run([(a, x)]).unwrap()))
        .collect();
    for (x, run) in runs {
        let result = run.wait().unwrap();
        // Predecessor order is edge registration order: b first, then c.
        assert_eq!(result.output(d), Some(&((x + 1) * 1000 + x * 10)));
    }
}

pub fn dependency_order_within_a_run<S: Scheduler<Ints>>(make: impl Fn(ExecutorConfig) -> S) {
    init_tracing();
    let clock = Arc::new(AtomicU64::new(1));
    let stamp = |clock: &Arc<AtomicU64>| {
        let clock = Arc::clone(clock);
        move |x: &[i64]| -> WorkResult<i64> {
            let now = i64::try_from(clock.fetch_add(1, Ordering::SeqCst))?;
            if x.iter().any(|&before| before >= now) {
                return Err("executed before a predecessor".into());
            }
            Ok(now)
        }
    };
    let mut graph = Graph::<Ints>::new();
    let a = graph.add_node("a", stamp(&clock)).unwrap();
    let b = graph.add_node("b", stamp(&clock)).unwrap();
    let c = graph.add_node("c", stamp(&clock)).unwrap();
    let d = graph.add_node("d", stamp(&clock)).unwrap();
    graph.precede(a, b).unwrap();
    graph.precede(a, c).unwrap();
    graph.precede(b, d).unwrap();
    graph.precede(c, d).unwrap();

    let mut scheduler = make(cfg(4));
    scheduler.bind(graph).unwrap();
    let runs: Vec<_> = (0..16)
        .map(|_| scheduler.run(std::iter::empty()).unwrap())
        .collect();
    for run in runs {
        let stamp_d = *run.wait().unwrap().output(d).unwrap();
        assert!(stamp_d >= 4);
    }
    assert_eq!(clock.load(Ordering::SeqCst), 1 + 16 * 4);
}

pub fn many_runs_awaited_in_reverse<S: Scheduler<Ints>>(make: impl Fn(ExecutorConfig) -> S) {
    init_tracing();
    let (graph, [a, _, c]) = chain_graph();
    let mut scheduler = make(cfg(4));
    scheduler.bind(graph).unwrap();
    let runs: Vec<_> = (0..4i64)
        .map(|x| (x, scheduler.run([(a, x * 100)]).unwrap()))
        .collect();
    let ids: Vec<_> = runs.iter().map(|(_, run)| run.object_id()).collect();
    assert!(ids.windows(2).all(|w| w[0] < w[1]));
    for (x, run) in runs.into_iter().rev() {
        let id = run.object_id();
        let result = run.wait().unwrap();
        assert_eq!(result.object_id(), id);
        assert_eq!(result.output(c), Some(&((x * 100 + 1) * 2)));
    }
}

pub fn backpressure_holds_second_run<S: Scheduler<Ints>>(make: impl Fn(ExecutorConfig) -> S) {
    init_tracing();
    let (graph, [a, b, c], open) = gated_chain();
    let mut scheduler = make(cfg(1));
    scheduler.bind(graph).unwrap();
    let first = scheduler.run([(a, 1)]).unwrap();
    let second = scheduler.run([(a, 2)]).unwrap();

    let snapshot = || scheduler.snapshot().unwrap();
    wait_until("first run to enter b", || {
        snapshot().nodes[a.index()].run_count == 1
    });
    thread::sleep(Duration::from_millis(20));
    let view = snapshot();
    assert_eq!(view.nodes[a.index()].run_count, 1, "second run started early");
    assert_eq!(view.nodes[b.index()].run_count, 0);
    assert_eq!(view.backlog, 1);
    assert_eq!(view.runs.len(), 1);
    assert_eq!(view.runs[0].object_id, first.object_id());

    open.send(()).unwrap();
    open.send(()).unwrap();
    assert_eq!(first.wait().unwrap().output(c), Some(&4));
    assert_eq!(second.wait().unwrap().output(c), Some(&6));
}

pub fn failure_is_contained_to_its_run<S: Scheduler<Ints>>(make: impl Fn(ExecutorConfig) -> S) {
    init_tracing();
    let mut graph = Graph::<Ints>::new();
    let a = graph.add_source("a").unwrap();
    let b = graph
        .add_node("b", |x| match x[0] {
            x if x < 0 => Err(format!("negative input {x}").into()),
            13 => panic!("unlucky"),
            x => Ok(x),
        })
        .unwrap();
    let c = graph.add_node("c", |x| Ok(x[0] + 1)).unwrap();
    let d = graph.add_node("d", |x| Ok(x[0] - 1)).unwrap();
    graph.precede(a, b).unwrap();
    graph.precede(b, c).unwrap();
    graph.precede(b, d).unwrap();

    let mut scheduler = make(cfg(3));
    scheduler.bind(graph).unwrap();
    for _ in 0..3 {
        let failed = scheduler.run([(a, -5)]).unwrap();
        let panicked = scheduler.run([(a, 13)]).unwrap();
        let fine = scheduler.run([(a, 7)]).unwrap();
        assert_eq!(
            failed.wait(),
            Err(Error::Execution(ExecutionError::WorkFnFailed {
                node: b,
                message: "negative input -5".to_owned(),
            }))
        );
        assert_eq!(
            panicked.wait(),
            Err(Error::Execution(ExecutionError::WorkFnPanicked {
                node: b,
                message: "unlucky".to_owned(),
            }))
        );
        let fine = fine.wait().unwrap();
        assert_eq!(fine.outputs(), [(c, 8), (d, 6)]);
    }
    // Nothing leaked: every slot drained.
    scheduler.wait_idle();
    let view = scheduler.snapshot().unwrap();
    assert!(view.runs.is_empty());
    assert!(view.nodes.iter().all(|n| n.queue_depths.iter().all(|&q| q == 0)));
    assert_eq!(view.nodes[c.index()].run_count, 9);
}

/// Alternating failing and healthy runs, one slot at a time, so a failure
/// recorded late would land on the next run.
pub fn failures_resolve_their_own_run<S: Scheduler<Ints>>(make: impl Fn(ExecutorConfig) -> S) {
    init_tracing();
    let mut graph = Graph::<Ints>::new();
    let a = graph.add_source("a").unwrap();
    let b = graph
        .add_node("b", |x| {
            if x[0] < 0 {
                Err("negative".into())
            } else {
                Ok(x[0])
            }
        })
        .unwrap();
    let c = graph.add_node("c", |x| Ok(x[0] * 3)).unwrap();
    graph.precede(a, b).unwrap();
    graph.precede(b, c).unwrap();

    let mut scheduler = make(cfg(1));
    scheduler.bind(graph).unwrap();
    for i in 0..300 {
        let failed = scheduler.run([(a, -1)]).unwrap();
        let fine = scheduler.run([(a, i)]).unwrap();
        assert_eq!(
            failed.wait(),
            Err(Error::Execution(ExecutionError::WorkFnFailed {
                node: b,
                message: "negative".to_owned(),
            }))
        );
        assert_eq!(fine.wait().unwrap().output(c), Some(&(i * 3)));
    }
    scheduler.shutdown();
}

pub fn copy_failure_is_contained_to_its_run<S: Scheduler<Touchies>>(
    make: impl Fn(ExecutorConfig) -> S,
) {
    init_tracing();
    // `a` fans out to `b` and `c`, which needs one copy per run.
    let mut graph = Graph::<Touchies>::new();
    let a = graph.add_source("a").unwrap();
    let b = graph.add_node("b", |x| Ok(Touchy(x[0].0 + 1))).unwrap();
    let c = graph.add_node("c", |x| Ok(Touchy(x[0].0 * 2))).unwrap();
    let d = graph
        .add_node("d", |x| Ok(Touchy(x[0].0 + x[1].0)))
        .unwrap();
    graph.precede(a, b).unwrap();
    graph.precede(a, c).unwrap();
    graph.precede(b, d).unwrap();
    graph.precede(c, d).unwrap();

    let mut scheduler = make(cfg(2));
    scheduler.bind(graph).unwrap();
    for _ in 0..3 {
        let refused = scheduler.run([(a, Touchy(0))]).unwrap();
        let panicked = scheduler.run([(a, Touchy(13))]).unwrap();
        let fine = scheduler.run([(a, Touchy(4))]).unwrap();
        match refused.wait() {
            Err(Error::Execution(ExecutionError::PayloadCopyFailed { node, source })) => {
                assert_eq!(node, a);
                assert_eq!(source.reason(), "zero is not copyable");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        match panicked.wait() {
            Err(Error::Execution(ExecutionError::PayloadCopyFailed { node, source })) => {
                assert_eq!(node, a);
                assert!(source.reason().contains("copying 13"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(fine.wait().unwrap().output(d), Some(&Touchy(13)));
    }
    scheduler.wait_idle();
    let view = scheduler.snapshot().unwrap();
    assert!(view.runs.is_empty());
    assert!(view.nodes.iter().all(|n| n.queue_depths.iter().all(|&q| q == 0)));
    assert!(view.nodes.iter().all(|n| n.staged_inputs == 0));
    assert_eq!(view.nodes[d.index()].run_count, 9);
    // Workers survived the panics.
    let after = scheduler.run([(a, Touchy(1))]).unwrap();
    assert_eq!(after.wait().unwrap().output(d), Some(&Touchy(4)));
    scheduler.shutdown();
}

pub fn full_backlog_overflows<S: Scheduler<Ints>>(make: impl Fn(ExecutorConfig) -> S) {
    init_tracing();
    let (graph, [a, _, c], open) = gated_chain();
    let mut scheduler = make(cfg(1).with_backlog_capacity(0));
    scheduler.bind(graph).unwrap();
    let first = scheduler.run([(a, 1)]).unwrap();
    assert_eq!(
        scheduler.run([(a, 2)]).unwrap_err(),
        Error::Scheduling(SchedulingError::RunQueueOverflow { capacity: 0 })
    );
    open.send(()).unwrap();
    assert_eq!(first.wait().unwrap().output(c), Some(&4));
    open.send(()).unwrap();
    assert_eq!(
        scheduler.run([(a, 3)]).unwrap().wait().unwrap().output(c),
        Some(&8)
    );
}

pub fn shutdown_cancels_backlog<S: Scheduler<Ints>>(make: impl Fn(ExecutorConfig) -> S) {
    init_tracing();
    let (graph, [a, _, c], open) = gated_chain();
    let mut scheduler = make(cfg(1));
    scheduler.bind(graph).unwrap();
    let running = scheduler.run([(a, 1)]).unwrap();
    let queued: Vec<_> = (2..4)
        .map(|x| scheduler.run([(a, x)]).unwrap())
        .collect();
    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        open.send(()).unwrap();
    });
    scheduler.shutdown();
    releaser.join().unwrap();

    assert_eq!(running.wait().unwrap().output(c), Some(&4));
    for run in queued {
        assert_eq!(run.wait(), Err(SchedulingError::Cancelled.into()));
    }
    assert_eq!(
        scheduler.run([(a, 5)]).unwrap_err(),
        SchedulingError::ExecutorShutDown.into()
    );
    scheduler.shutdown();
    let graph = scheduler.unbind().unwrap();
    assert_eq!(
        scheduler.bind(graph).unwrap_err(),
        SchedulingError::ExecutorShutDown.into()
    );
}

pub fn unbind_and_rebind<S: Scheduler<Ints>>(make: impl Fn(ExecutorConfig) -> S) {
    init_tracing();
    let (graph, [a, _, c]) = chain_graph();
    let mut scheduler = make(cfg(2));
    assert_eq!(
        scheduler.unbind().unwrap_err(),
        SchedulingError::NotBound.into()
    );
    scheduler.bind(graph).unwrap();
    assert_eq!(
        scheduler.bind(Graph::new()).unwrap_err(),
        SchedulingError::AlreadyBound.into()
    );
    let pending = scheduler.run([(a, 1)]).unwrap();
    let mut graph = scheduler.unbind().unwrap();
    assert_eq!(pending.wait().unwrap().output(c), Some(&4));
    assert!(!graph.is_frozen());
    assert!(scheduler.graph().is_none());

    let d = graph.add_node("d", |x| Ok(x[0] - 1)).unwrap();
    graph.precede(c, d).unwrap();
    scheduler.bind(graph).unwrap();
    assert!(scheduler.graph().unwrap().is_frozen());
    let result = scheduler.run([(a, 1)]).unwrap().wait().unwrap();
    assert_eq!(result.object_id(), 0);
    assert_eq!(result.output(d), Some(&3));
    assert_eq!(result.output(c), None);
}

pub fn futures_can_be_awaited<S: Scheduler<Ints>>(make: impl Fn(ExecutorConfig) -> S) {
    init_tracing();
    let (graph, [a, _, c]) = chain_graph();
    let mut scheduler = make(cfg(2));
    scheduler.bind(graph).unwrap();
    let first = scheduler.run([(a, 10)]).unwrap();
    let second = scheduler.run([(a, 20)]).unwrap();
    let (first, second) = futures::executor::block_on(futures::future::join(first, second));
    assert_eq!(first.unwrap().output(c), Some(&22));
    assert_eq!(second.unwrap().output(c), Some(&42));
}

pub fn run_validates_inputs<S: Scheduler<Ints>>(make: impl Fn(ExecutorConfig) -> S) {
    init_tracing();
    let mut graph = Graph::<Ints>::new();
    let a = graph.add_source("a").unwrap();
    let g = graph.add_node("g", |_| Ok(100)).unwrap();
    let s = graph.add_node("s", |x| Ok(x[0] + x[1])).unwrap();
    graph.precede(a, s).unwrap();
    graph.precede(g, s).unwrap();

    let mut scheduler = make(cfg(2));
    assert_eq!(
        scheduler.run([(a, 1)]).unwrap_err(),
        SchedulingError::NotBound.into()
    );
    scheduler.bind(graph).unwrap();
    assert_eq!(
        scheduler.run([]).unwrap_err(),
        SchedulingError::MissingInput(a).into()
    );
    assert_eq!(
        scheduler.run([(a, 1), (a, 2)]).unwrap_err(),
        SchedulingError::DuplicateInput(a).into()
    );
    assert_eq!(
        scheduler.run([(a, 1), (s, 2)]).unwrap_err(),
        SchedulingError::UnexpectedInput(s).into()
    );
    let ghost = NodeId::from(99);
    assert_eq!(
        scheduler.run([(ghost, 1)]).unwrap_err(),
        GraphError::UnknownNode(ghost).into()
    );
    // Rejected submissions consume no object id.
    let result = scheduler.run([(a, 1)]).unwrap().wait().unwrap();
    assert_eq!(result.object_id(), 0);
    assert_eq!(result.output(s), Some(&101));
}

pub fn profiler_samples_the_bound_graph<S: Scheduler<Ints>>(
    make: impl Fn(ExecutorConfig) -> S,
    profiler: impl Fn(
        &S,
        Box<dyn FnMut(&GraphSnapshot) + Send>,
    ) -> pipegraph::Result<pipegraph::profiler::Profiler>,
) {
    init_tracing();
    let (graph, [a, b, _]) = chain_graph();
    let mut scheduler = make(cfg(2));
    scheduler.bind(graph).unwrap();
    for x in 0..5 {
        scheduler.run([(a, x)]).unwrap().wait().unwrap();
    }
    let samples = Arc::new(Mutex::new(Vec::new()));
    let sink = {
        let samples = Arc::clone(&samples);
        Box::new(move |s: &GraphSnapshot| samples.lock().unwrap().push(s.clone()))
    };
    let profiler = profiler(&scheduler, sink).unwrap();
    wait_until("a sample", || !samples.lock().unwrap().is_empty());

    let sample = samples.lock().unwrap()[0].clone();
    assert_eq!(sample.nodes.len(), 3);
    assert_eq!(sample.nodes[b.index()].name, "b");
    assert_eq!(sample.nodes[b.index()].run_count, 5);
    assert_eq!(sample.nodes[b.index()].timing.unwrap().count, 5);
    assert_eq!(sample.nodes[a.index()].timing, None);
    assert!(sample.runs.is_empty());

    // Unbinding drops the source; the profiler notices and exits.
    scheduler.unbind().unwrap();
    wait_until("profiler exit", || profiler.is_finished());
    profiler.stop();
}

pub const PROFILER_MODE: ProfilerMode = ProfilerMode::ALL;
pub const PROFILER_INTERVAL: Duration = Duration::from_millis(2);
