//! Execution graph construction benchmark
//!
//! Benchmarks the critical path for every workflow run before any task
//! fires: topological leveling plus cycle detection over a chain-shaped
//! and a fan-out-shaped task list.

use std::collections::BTreeMap;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use waypoint_engine::graph::build_graph;
use waypoint_engine::model::{StepBody, WorkflowTaskStep};

fn task(id: &str, depends_on: Vec<&str>) -> WorkflowTaskStep {
    WorkflowTaskStep {
        id: id.to_string(),
        depends_on: depends_on.into_iter().map(str::to_string).collect(),
        timeout: None,
        retry: None,
        condition: None,
        for_each: None,
        body: StepBody::TaskRef {
            task_ref: "noop".to_string(),
            input: BTreeMap::new(),
        },
    }
}

/// A strictly sequential chain: `t0 -> t1 -> ... -> tN`.
fn chain(n: usize) -> Vec<WorkflowTaskStep> {
    (0..n)
        .map(|i| {
            let id = format!("t{i}");
            let depends_on = if i == 0 { vec![] } else { vec![format!("t{}", i - 1)] };
            WorkflowTaskStep {
                id,
                depends_on,
                timeout: None,
                retry: None,
                condition: None,
                for_each: None,
                body: StepBody::TaskRef {
                    task_ref: "noop".to_string(),
                    input: BTreeMap::new(),
                },
            }
        })
        .collect()
}

/// A single root fanning out to `n` independent leaves, all joined by one
/// sink task — the shape that actually exercises `parallel_groups`.
fn fan_out_join(n: usize) -> Vec<WorkflowTaskStep> {
    let mut tasks = vec![task("root", vec![])];
    let leaf_ids: Vec<String> = (0..n).map(|i| format!("leaf{i}")).collect();
    for leaf in &leaf_ids {
        tasks.push(task(leaf, vec!["root"]));
    }
    let leaf_refs: Vec<&str> = leaf_ids.iter().map(String::as_str).collect();
    tasks.push(task("sink", leaf_refs));
    tasks
}

fn bench_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("graph/chain");
    for size in [10, 100, 1000] {
        group.throughput(Throughput::Elements(size as u64));
        let tasks = chain(size);
        group.bench_with_input(BenchmarkId::new("tasks", size), &tasks, |b, tasks| {
            b.iter(|| {
                let result = build_graph(tasks);
                assert!(result.is_valid);
            });
        });
    }
    group.finish();
}

fn bench_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("graph/fan_out_join");
    for size in [10, 100, 1000] {
        group.throughput(Throughput::Elements(size as u64));
        let tasks = fan_out_join(size);
        group.bench_with_input(BenchmarkId::new("leaves", size), &tasks, |b, tasks| {
            b.iter(|| {
                let result = build_graph(tasks);
                assert!(result.is_valid);
                assert_eq!(result.graph.as_ref().unwrap().parallel_groups[0].task_ids.len(), size);
            });
        });
    }
    group.finish();
}

fn bench_cyclic_detection(c: &mut Criterion) {
    let mut group = c.benchmark_group("graph/cycle_detection");
    for size in [10, 100, 1000] {
        group.throughput(Throughput::Elements(size as u64));
        let mut tasks = chain(size);
        // Close the chain into a cycle: the first task also depends on the
        // last, so the forward chain and this edge form a loop.
        let last = tasks.last().unwrap().id.clone();
        tasks[0].depends_on.push(last);
        group.bench_with_input(BenchmarkId::new("tasks", size), &tasks, |b, tasks| {
            b.iter(|| {
                let result = build_graph(tasks);
                assert!(!result.is_valid);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_chain, bench_fan_out, bench_cyclic_detection);
criterion_main!(benches);
