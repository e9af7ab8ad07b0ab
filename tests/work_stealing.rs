#![allow(missing_docs)]
#![cfg(not(feature = "loom"))]

mod common;

use common::Ints;
use pipegraph::{
    config::ExecutorConfig,
    error::{ConfigError, Error},
    executor::{Executor, Scheduler},
    graph::Graph,
};

fn executor(cfg: ExecutorConfig) -> Executor<Ints> {
    Executor::with_config(cfg.with_worker_count(4)).unwrap()
}

fn single_worker(cfg: ExecutorConfig) -> Executor<Ints> {
    Executor::with_config(cfg.with_worker_count(1).with_rng_seed(1)).unwrap()
}

#[test]
fn single_run() {
    common::single_run(executor);
    common::single_run(single_worker);
}

#[test]
fn pipelined_runs_keep_their_object_ids() {
    common::pipelined_runs_keep_their_object_ids(executor);
}

#[test]
fn diamond_fan_out() {
    common::diamond_fan_out(executor);
    common::diamond_fan_out(single_worker);
}

#[test]
fn dependency_order_within_a_run() {
    common::dependency_order_within_a_run(executor);
}

#[test]
fn many_runs_awaited_in_reverse() {
    common::many_runs_awaited_in_reverse(executor);
}

#[test]
fn backpressure_holds_second_run() {
    common::backpressure_holds_second_run(executor);
}

#[test]
fn failure_is_contained_to_its_run() {
    common::failure_is_contained_to_its_run(executor);
}

#[test]
fn failures_resolve_their_own_run() {
    common::failures_resolve_their_own_run(executor);
}

#[test]
fn copy_failure_is_contained_to_its_run() {
    common::copy_failure_is_contained_to_its_run(|cfg: ExecutorConfig| {
        Executor::<common::Touchies>::with_config(cfg.with_worker_count(2)).unwrap()
    });
}

#[test]
fn full_backlog_overflows() {
    common::full_backlog_overflows(executor);
}

#[test]
fn shutdown_cancels_backlog() {
    common::shutdown_cancels_backlog(executor);
}

#[test]
fn unbind_and_rebind() {
    common::unbind_and_rebind(executor);
}

#[test]
fn futures_can_be_awaited() {
    common::futures_can_be_awaited(executor);
}

#[test]
fn run_validates_inputs() {
    common::run_validates_inputs(executor);
}

#[test]
fn profiler_samples_the_bound_graph() {
    common::profiler_samples_the_bound_graph(executor, |executor, sink| {
        executor.profiler(common::PROFILER_INTERVAL, common::PROFILER_MODE, sink)
    });
}

#[test]
fn rejects_invalid_config() {
    assert!(matches!(
        Executor::<Ints>::new(0, 2),
        Err(Error::Config(ConfigError::ZeroWorkers))
    ));
    assert!(matches!(
        Executor::<Ints>::new(2, 0),
        Err(Error::Config(ConfigError::ZeroPipelineDepth))
    ));
}

#[test]
fn sustained_load_on_a_wide_graph() {
    common::init_tracing();
    // One source fanning out to 16 workers merged by one sink.
    let mut graph = Graph::<Ints>::new();
    let src = graph.add_source("src").unwrap();
    let sink = graph
        .add_node("sink", |x: &[i64]| Ok(x.iter().sum()))
        .unwrap();
    for i in 0..16i64 {
        let mid = graph
            .add_node(format!("mid{i}"), move |x: &[i64]| Ok(x[0] * i))
            .unwrap();
        graph.precede(src, mid).unwrap();
        graph.precede(mid, sink).unwrap();
    }
    let mut executor = executor(ExecutorConfig::new().with_pipeline_depth(8));
    executor.bind(graph).unwrap();
    let runs: Vec<_> = (0..200i64)
        .map(|x| (x, executor.run([(src, x)]).unwrap()))
        .collect();
    for (x, run) in runs {
        assert_eq!(run.wait().unwrap().output(sink), Some(&(x * 120)));
    }
    let view = executor.snapshot().unwrap();
    assert!(view.nodes.iter().all(|n| n.run_count == 200));
    assert!(view.nodes.iter().all(|n| n.starved == 0));
}
