use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;

use trellis_core::{Definition, Graph, Json, Path, Transform};

/// A chain of `depth` computed nodes over one variable.
fn chain(depth: usize) -> (Definition, Definition) {
    let input = Definition::variable(0);
    let mut current = input.clone();
    for _ in 0..depth {
        current = Definition::map(current, |n| json!(n.as_i64().unwrap_or(0) + 1));
    }
    (input, current)
}

/// `width` computed nodes fanning out of one variable, summed at the bottom.
fn fan(width: usize) -> (Definition, Definition) {
    let input = Definition::variable(0);
    let branches = (0..width as i64)
        .map(|offset| Definition::map(input.clone(), move |n| json!(n.as_i64().unwrap_or(0) + offset)))
        .collect();
    let sum = Definition::computed(branches, |values| {
        Ok(Definition::value(values.iter().filter_map(Json::as_i64).sum::<i64>()))
    });
    (input, sum)
}

fn bench_cold_resolve(c: &mut Criterion) {
    let mut group = c.benchmark_group("cold_resolve");
    for depth in [8usize, 24] {
        group.throughput(Throughput::Elements(depth as u64));
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, &depth| {
            b.iter(|| {
                let graph = Graph::new(Definition::tree(Vec::<(String, Definition)>::new()));
                let (_, output) = chain(depth);
                black_box(graph.get(output).unwrap());
            });
        });
    }
    group.finish();
}

fn bench_cached_subscribe(c: &mut Criterion) {
    let graph = Graph::new(Definition::tree(Vec::<(String, Definition)>::new()));
    let (_, output) = chain(24);
    let _held = graph.subscribe(output.clone(), |_| {}).unwrap();

    c.bench_function("cached_subscribe", |b| {
        b.iter(|| {
            let subscription = graph.subscribe(output.clone(), |result| {
                black_box(result);
            });
            black_box(subscription.unwrap());
        });
    });
}

fn bench_propagation(c: &mut Criterion) {
    let mut group = c.benchmark_group("propagation");
    for width in [8usize, 64] {
        let graph = Graph::new(Definition::tree(Vec::<(String, Definition)>::new()));
        let (input, output) = fan(width);
        let _subscription = graph
            .subscribe(output, |result| {
                black_box(result);
            })
            .unwrap();
        let mut next = 0i64;

        group.throughput(Throughput::Elements(width as u64));
        group.bench_with_input(BenchmarkId::new("fan", width), &width, |b, _| {
            b.iter(|| {
                next += 1;
                graph.set(input.clone(), next).unwrap();
            });
        });
    }
    group.finish();
}

fn bench_items(c: &mut Criterion) {
    let todos: Vec<Definition> = (0..256)
        .map(|i| Definition::variable(json!({ "id": i, "done": i % 3 == 0 })))
        .collect();
    let first = todos[0].clone();
    let graph = Graph::new(Definition::tree([("todos", Definition::array(todos))]));
    let query = Path::root().get("todos").items(vec![
        Transform::where_eq("done", &true).unwrap(),
        Transform::Take(10),
    ]);
    let _subscription = graph
        .subscribe(query, |result| {
            black_box(result);
        })
        .unwrap();
    let mut done = false;

    c.bench_function("items_update", |b| {
        b.iter(|| {
            done = !done;
            graph.set(first.clone(), json!({ "id": 0, "done": done })).unwrap();
        });
    });
}

criterion_group!(
    benches,
    bench_cold_resolve,
    bench_cached_subscribe,
    bench_propagation,
    bench_items
);
criterion_main!(benches);
