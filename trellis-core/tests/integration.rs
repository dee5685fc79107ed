//! Integration Tests for the Graph Engine
//!
//! These tests drive a [`Graph`] through its public API only: subscriptions,
//! one-shot reads, mutations and inspection.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::json;

use trellis_core::source::{from_fn, from_future};
use trellis_core::{
    ContextId, Deferred, Definition, ErrorCode, ErrorInfo, Graph, GraphConfig, GraphError,
    GraphResult, Interrupt, Json, Location, Node, NodeKind, Operation, OperationKind, Outcome, Path,
    Registry, ResolveCx, ScopeId, Subscription, Transform,
};

/// Collects every result an observer receives.
#[derive(Clone, Default)]
struct Recorder {
    seen: Arc<Mutex<Vec<GraphResult>>>,
}

impl Recorder {
    fn observer(&self) -> impl Fn(&GraphResult) + Send + Sync + 'static {
        let seen = Arc::clone(&self.seen);
        move |result: &GraphResult| seen.lock().unwrap().push(result.clone())
    }

    fn results(&self) -> Vec<GraphResult> {
        self.seen.lock().unwrap().clone()
    }

    fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    fn last(&self) -> Option<GraphResult> {
        self.seen.lock().unwrap().last().cloned()
    }
}

fn value(json: Json) -> GraphResult {
    GraphResult::Value(json)
}

/// A computed node over `input` that upper-cases strings.
fn upper_case(input: Definition) -> Definition {
    Definition::map(input, |value| {
        json!(format!("VALUE:{}", value.as_str().unwrap_or_default().to_uppercase()))
    })
}

/// A computed node that bumps `counter` every time it runs.
fn counted(input: Definition, counter: &Arc<AtomicUsize>) -> Definition {
    let counter = Arc::clone(counter);
    Definition::map(input, move |value| {
        counter.fetch_add(1, Ordering::SeqCst);
        value.clone()
    })
}

fn empty_root() -> Definition {
    Definition::tree(Vec::<(String, Definition)>::new())
}

// ----------------------------------------------------------------------------
// Caching
// ----------------------------------------------------------------------------

/// Equal requests share one cached action.
#[test]
fn repeated_subscriptions_hit_the_cache() {
    let runs = Arc::new(AtomicUsize::new(0));
    let graph = Graph::new(empty_root());
    let query = counted(Definition::value(3), &runs);

    let first = Recorder::default();
    let _a = graph.subscribe(query.clone(), first.observer()).unwrap();
    let before = graph.stats();

    let second = Recorder::default();
    let _b = graph.subscribe(query, second.observer()).unwrap();
    let after = graph.stats();

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(after.cache_hits > before.cache_hits);
    assert_eq!(after.resolutions, before.resolutions);

    // The second subscriber is replayed the cached result
    assert_eq!(second.results(), vec![value(json!(3))]);
}

/// Subscribing to the same source many times connects it once and cleans
/// it up once, after the last subscription goes away.
#[test]
fn shared_source_is_cleaned_up_after_last_release() {
    let connects = Arc::new(AtomicUsize::new(0));
    let cleanups = Arc::new(AtomicUsize::new(0));
    let source = {
        let connects = Arc::clone(&connects);
        let cleanups = Arc::clone(&cleanups);
        from_fn(move |emitter| {
            connects.fetch_add(1, Ordering::SeqCst);
            emitter.emit(Definition::value("ready"));
            let cleanups = Arc::clone(&cleanups);
            Box::new(move || {
                cleanups.fetch_add(1, Ordering::SeqCst);
            })
        })
    };

    let graph = Graph::new(empty_root());
    let recorder = Recorder::default();
    let subscriptions: Vec<_> = (0..3)
        .map(|_| graph.subscribe(source.clone(), recorder.observer()).unwrap())
        .collect();

    assert_eq!(connects.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.results(), vec![value(json!("ready")); 3]);

    for subscription in &subscriptions[..2] {
        subscription.dispose();
        assert_eq!(cleanups.load(Ordering::SeqCst), 0);
    }
    subscriptions[2].dispose();
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);

    // Disposing twice is harmless
    subscriptions[2].dispose();
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    assert!(graph.inspect().unwrap().cache.actions.is_empty());
}

/// Side-effecting operations never enter the request index.
#[test]
fn set_is_never_cached() {
    let name = Definition::variable("first");
    let graph = Graph::new(Definition::tree([("name", name.clone())]));

    let before = graph.stats();
    graph.set(name.clone(), "second").unwrap();
    graph.set(name.clone(), "second").unwrap();
    let after = graph.stats();

    assert_eq!(after.one_shots - before.one_shots, 2);
    let snapshot = graph.inspect().unwrap();
    assert!(snapshot
        .cache
        .actions
        .iter()
        .all(|action| action.kind != OperationKind::Set));
    assert_eq!(graph.get(name).unwrap(), value(json!("second")));
}

// ----------------------------------------------------------------------------
// Propagation
// ----------------------------------------------------------------------------

/// A diamond re-runs its bottom node once per change and notifies once.
#[test]
fn diamond_recomputes_once() {
    let runs = Arc::new(AtomicUsize::new(0));
    let a = Definition::variable(1);
    let b = Definition::map(a.clone(), |n| json!(n.as_i64().unwrap_or(0) + 1));
    let c = Definition::map(a.clone(), |n| json!(n.as_i64().unwrap_or(0) * 2));
    let d = {
        let runs = Arc::clone(&runs);
        Definition::computed(vec![b, c], move |values| {
            runs.fetch_add(1, Ordering::SeqCst);
            let sum: i64 = values.iter().filter_map(Json::as_i64).sum();
            Ok(Definition::value(sum))
        })
    };

    let graph = Graph::new(empty_root());
    let recorder = Recorder::default();
    let _subscription = graph.subscribe(d, recorder.observer()).unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    graph.set(a, 5).unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(recorder.results(), vec![value(json!(4)), value(json!(16))]);
}

/// Updating a variable notifies its subscriber once; later subscribers
/// reuse the updated cache entry.
#[test]
fn variable_update_notifies_once() {
    let name = Definition::variable("first");
    let graph = Graph::new(Definition::tree([("name", name)]));
    let query = Definition::reference(["name"]);

    let recorder = Recorder::default();
    let _subscription = graph.subscribe(query.clone(), recorder.observer()).unwrap();
    assert_eq!(recorder.results(), vec![value(json!("first"))]);

    graph.set(query.clone(), "second").unwrap();
    assert_eq!(
        recorder.results(),
        vec![value(json!("first")), value(json!("second"))]
    );

    let before = graph.stats();
    let late = Recorder::default();
    let _late = graph.subscribe(query, late.observer()).unwrap();
    let after = graph.stats();

    assert_eq!(late.results(), vec![value(json!("second"))]);
    assert!(after.cache_hits > before.cache_hits);
    assert_eq!(after.resolutions, before.resolutions);
    assert_eq!(recorder.count(), 2);
}

/// Changes that leave a result equal produce no notification.
#[test]
fn unchanged_results_are_not_delivered() {
    let count = Definition::variable(1);
    let graph = Graph::new(empty_root());
    let parity = Definition::map(count.clone(), |n| json!(n.as_i64().unwrap_or(0) % 2 == 0));

    let recorder = Recorder::default();
    let _subscription = graph.subscribe(parity, recorder.observer()).unwrap();
    graph.set(count.clone(), 3).unwrap();
    assert_eq!(recorder.count(), 1);

    graph.set(count, 4).unwrap();
    assert_eq!(recorder.last(), Some(value(json!(true))));
}

/// Reset restores the initial value.
#[test]
fn reset_restores_initial_value() {
    let count = Definition::variable(7);
    let graph = Graph::new(Definition::tree([("count", count)]));
    let path = Path::root().get("count");

    graph.set(path.clone(), 9).unwrap();
    assert_eq!(graph.get(path.clone()).unwrap(), value(json!(9)));
    graph.reset(path.clone()).unwrap();
    assert_eq!(graph.get(path).unwrap(), value(json!(7)));
}

/// Invalidating a node re-runs computations reading outside state.
#[test]
fn invalidate_reruns_cached_actions() {
    let outside = Arc::new(AtomicUsize::new(1));
    let reading = {
        let outside = Arc::clone(&outside);
        Definition::computed(Vec::new(), move |_| {
            Ok(Definition::value(outside.load(Ordering::SeqCst)))
        })
    };

    let graph = Graph::new(empty_root());
    let recorder = Recorder::default();
    let _subscription = graph.subscribe(reading.clone(), recorder.observer()).unwrap();

    outside.store(2, Ordering::SeqCst);
    graph.invalidate(reading).unwrap();

    assert_eq!(recorder.results(), vec![value(json!(1)), value(json!(2))]);
    let snapshot = graph.inspect().unwrap();
    assert!(snapshot.cache.actions.iter().any(|action| action.resolutions == 2));
}

/// Writes made by an observer while a pass delivers are applied by a
/// follow-up pass.
#[test]
fn observers_can_write_during_delivery() {
    let a = Definition::variable(1);
    let b = Definition::variable(0);
    let graph = Graph::new(empty_root());

    let mirror = Recorder::default();
    let _mirror = graph.subscribe(b.clone(), mirror.observer()).unwrap();

    let writer = {
        let graph = graph.clone();
        move |result: &GraphResult| {
            if let GraphResult::Value(doubled) = result {
                graph.set(b.clone(), doubled.clone()).unwrap();
            }
        }
    };
    let doubled = Definition::map(a.clone(), |n| json!(n.as_i64().unwrap_or(0) * 2));
    let _writer = graph.subscribe(doubled, writer).unwrap();
    assert_eq!(mirror.last(), Some(value(json!(2))));

    graph.set(a, 5).unwrap();

    assert_eq!(
        mirror.results(),
        vec![value(json!(0)), value(json!(2)), value(json!(10))]
    );
}

/// An observer may dispose another subscription of the same action; the
/// disposed one is not called again, not even later in the same pass.
#[test]
fn observers_can_dispose_other_subscriptions() {
    let count = Definition::variable(1);
    let graph = Graph::new(empty_root());

    let slot: Arc<Mutex<Option<Subscription>>> = Arc::default();
    let disposer = {
        let slot = Arc::clone(&slot);
        move |result: &GraphResult| {
            if *result == GraphResult::Value(json!(2)) {
                let taken = slot.lock().unwrap().take();
                if let Some(subscription) = taken {
                    subscription.dispose();
                }
            }
        }
    };
    let _disposer = graph.subscribe(count.clone(), disposer).unwrap();

    let victim = Recorder::default();
    *slot.lock().unwrap() = Some(graph.subscribe(count.clone(), victim.observer()).unwrap());

    graph.set(count.clone(), 2).unwrap();
    graph.set(count, 3).unwrap();

    assert_eq!(victim.results(), vec![value(json!(1))]);
    assert_eq!(graph.inspect().unwrap().subscriptions.len(), 1);
}

// ----------------------------------------------------------------------------
// Resolution
// ----------------------------------------------------------------------------

/// A static child resolves in one hop; a computed child through an
/// evaluate chain whose intermediate nodes stay cached.
#[test]
fn static_and_dynamic_children() {
    let graph = Graph::new(Definition::tree([
        ("static", Definition::value("foo")),
        ("dynamic", upper_case(Definition::value("bar"))),
    ]));

    let fixed = Recorder::default();
    let _fixed = graph
        .subscribe(Path::root().get("static"), fixed.observer())
        .unwrap();
    assert_eq!(fixed.results(), vec![value(json!("foo"))]);

    let edges = graph.inspect().unwrap().edges();
    assert!(edges
        .iter()
        .any(|edge| edge.operation == OperationKind::GetChild));

    let computed = Recorder::default();
    let _computed = graph
        .subscribe(Path::root().get("dynamic"), computed.observer())
        .unwrap();
    assert_eq!(computed.results(), vec![value(json!("VALUE:BAR"))]);

    let snapshot = graph.inspect().unwrap();
    let computed_nodes: Vec<_> = snapshot
        .cache
        .nodes
        .iter()
        .filter(|node| node.kind == NodeKind::Computed)
        .map(|node| node.id)
        .collect();
    assert_eq!(computed_nodes.len(), 1);
    assert!(snapshot
        .edges()
        .iter()
        .any(|edge| edge.from == computed_nodes[0] && edge.operation == OperationKind::Evaluate));
}

/// Variables read through references compute like static values.
#[test]
fn variables_compute_like_values() {
    let graph = Graph::new(Definition::tree([("name", Definition::variable("bar"))]));
    assert_eq!(
        graph.get(upper_case(Definition::reference(["name"]))).unwrap(),
        value(json!("VALUE:BAR"))
    );
}

/// Trees are addressed as nodes; arrays and values as JSON.
#[test]
fn results_by_node_kind() {
    let graph = Graph::new(Definition::tree([
        (
            "user",
            Definition::tree([("name", Definition::value("ada"))]),
        ),
        (
            "tags",
            Definition::array([Definition::value("a"), Definition::variable("b")]),
        ),
        ("missing", Definition::nil()),
    ]));

    assert!(matches!(
        graph.get(Path::root().get("user")).unwrap(),
        GraphResult::Node {
            kind: NodeKind::Tree,
            ..
        }
    ));
    assert_eq!(
        graph.get(Path::root().get("user").get("name")).unwrap(),
        value(json!("ada"))
    );
    assert_eq!(
        graph.get(Path::root().get("tags")).unwrap(),
        value(json!(["a", "b"]))
    );
    assert_eq!(
        graph.get(Path::root().get("tags").get(1usize)).unwrap(),
        value(json!("b"))
    );
    assert_eq!(graph.get(Path::root().get("missing")).unwrap(), value(Json::Null));
}

/// Unknown children are data errors carrying the query path.
#[test]
fn invalid_key_reports_path() {
    let graph = Graph::new(Definition::tree([("user", empty_root())]));
    let result = graph.get(Path::root().get("user").get("email")).unwrap();
    let info = result.as_error().unwrap();
    assert_eq!(info.code, ErrorCode::InvalidKey);
    assert!(info.message.contains("email"));
    assert!(info.path.is_some());
}

/// Mutually referring paths fail instead of looping.
#[test]
fn reference_cycles_fail() {
    let graph = Graph::new(Definition::tree([
        ("a", Definition::reference(["b"])),
        ("b", Definition::reference(["a"])),
    ]));
    let result = graph.get(Definition::reference(["a"])).unwrap();
    assert_eq!(result.as_error().map(|info| info.code), Some(ErrorCode::Cyclic));
}

/// Nesting deeper than the configured limit fails the resolution.
#[test]
fn depth_limit_is_enforced() {
    let graph = Graph::with_config(empty_root(), GraphConfig::default().with_max_depth(3));
    let mut chain = Definition::value(0);
    for _ in 0..10 {
        chain = Definition::map(chain, |n| json!(n.as_i64().unwrap_or(0) + 1));
    }
    let result = graph.get(chain).unwrap();
    assert_eq!(
        result.as_error().map(|info| info.code),
        Some(ErrorCode::DepthExceeded)
    );

    let roomy = Graph::new(empty_root());
    let mut chain = Definition::value(0);
    for _ in 0..10 {
        chain = Definition::map(chain, |n| json!(n.as_i64().unwrap_or(0) + 1));
    }
    assert_eq!(roomy.get(chain).unwrap(), value(json!(10)));
}

/// With the default configuration a long chain fails with
/// `depth_exceeded` instead of exhausting the thread's stack.
#[test]
fn default_depth_limit_bounds_long_chains() {
    let graph = Graph::new(empty_root());
    let mut chain = Definition::value(0);
    for _ in 0..100 {
        chain = Definition::map(chain, |n| json!(n.as_i64().unwrap_or(0) + 1));
    }
    let result = graph.get(chain).unwrap();
    assert_eq!(
        result.as_error().map(|info| info.code),
        Some(ErrorCode::DepthExceeded)
    );
}

/// A panicking computation becomes an error node.
#[test]
fn panics_become_errors() {
    let graph = Graph::new(empty_root());
    let exploding = Definition::computed(Vec::new(), |_| panic!("kaboom"));
    let result = graph.get(exploding).unwrap();
    let info = result.as_error().unwrap();
    assert_eq!(info.code, ErrorCode::Panic);
    assert_eq!(info.message, "kaboom");

    // The graph is still usable
    assert_eq!(graph.get(Definition::value(1)).unwrap(), value(json!(1)));
}

static ERROR_HANDLER_CALLS: AtomicUsize = AtomicUsize::new(0);

fn counting_error_handler(_cx: &mut ResolveCx<'_>, node: &Node, _operation: &Operation) -> Outcome {
    ERROR_HANDLER_CALLS.fetch_add(1, Ordering::SeqCst);
    Err(Interrupt::Error(ErrorInfo::resolution(format!("handled {}", node.id()))))
}

/// Error nodes answer every operation with themselves; no handler runs.
#[test]
fn error_nodes_short_circuit() {
    let registry = Registry::standard()
        .with(NodeKind::Error, OperationKind::Resolve, counting_error_handler)
        .with(NodeKind::Error, OperationKind::GetChild, counting_error_handler);
    let graph = Graph::with_registry(empty_root(), GraphConfig::default(), registry);
    let failure = Definition::error(ErrorInfo::resolution("boom"));

    let direct = graph.get(failure.clone()).unwrap();
    let child = graph.get(Definition::get(failure, "field")).unwrap();

    assert_eq!(direct.as_error().map(|info| info.message.as_str()), Some("boom"));
    assert_eq!(child.as_error().map(|info| info.message.as_str()), Some("boom"));
    assert_eq!(ERROR_HANDLER_CALLS.load(Ordering::SeqCst), 0);
}

/// Unsupported pairs produce a descriptive error.
#[test]
fn unsupported_operations_fail() {
    let graph = Graph::new(empty_root());
    let result = graph.call(Definition::value(1), vec![json!(1)]).unwrap();
    let info = result.as_error().unwrap();
    assert_eq!(info.code, ErrorCode::Unsupported);
    assert!(info.message.contains("value"));
}

/// Actions run their body and resolve what it returns.
#[test]
fn call_invokes_actions() {
    let double = Definition::action(|args| {
        let n = args.first().and_then(Json::as_i64).ok_or("expected a number")?;
        Ok(Definition::value(n * 2))
    });
    let graph = Graph::new(Definition::tree([("double", double)]));

    assert_eq!(
        graph.call(Path::root().get("double"), vec![json!(21)]).unwrap(),
        value(json!(42))
    );
    assert_eq!(
        graph
            .call(Path::root().get("double"), Vec::new())
            .unwrap()
            .as_error()
            .map(|info| info.message.clone()),
        Some("expected a number".to_string())
    );
}

/// Query sets combine their fields into one result.
#[test]
fn query_sets_combine_fields() {
    let graph = Graph::new(Definition::tree([("count", Definition::variable(2))]));
    let query = Definition::query_set([
        ("count", Definition::reference(["count"])),
        ("label", Definition::value("items")),
    ]);

    assert_eq!(
        graph.get(query.clone()).unwrap(),
        value(json!({ "count": 2, "label": "items" }))
    );
    assert_eq!(
        graph.get(Definition::get(query, "count")).unwrap(),
        value(json!(2))
    );
}

// ----------------------------------------------------------------------------
// Collections
// ----------------------------------------------------------------------------

fn todos() -> (Definition, Definition) {
    let second = Definition::variable(json!({ "title": "b", "done": false }));
    let list = Definition::array([
        Definition::value(json!({ "title": "a", "done": true })),
        second.clone(),
        Definition::value(json!({ "title": "c", "done": true })),
    ]);
    (list, second)
}

/// Transforms filter, map and slice collections.
#[test]
fn items_apply_transforms() {
    let (list, _) = todos();
    let graph = Graph::new(Definition::tree([("todos", list)]));
    let titles = Transform::map(|todo| todo["title"].clone());

    let done = Path::root().get("todos").items(vec![
        Transform::where_eq("done", &true).unwrap(),
        titles.clone(),
    ]);
    assert_eq!(graph.get(done).unwrap(), value(json!(["a", "c"])));

    let open = Path::root().get("todos").items(vec![
        Transform::filter(|todo| todo["done"] == json!(false)),
        titles.clone(),
    ]);
    assert_eq!(graph.get(open).unwrap(), value(json!(["b"])));

    let page = Path::root()
        .get("todos")
        .items(vec![Transform::Skip(1), Transform::Take(1), titles]);
    assert_eq!(graph.get(page).unwrap(), value(json!(["b"])));
}

/// Collections react to changes of their items.
#[test]
fn items_follow_item_updates() {
    let (list, second) = todos();
    let graph = Graph::new(Definition::tree([("todos", list)]));
    let done = Path::root().get("todos").items(vec![
        Transform::where_eq("done", &true).unwrap(),
        Transform::map(|todo| todo["title"].clone()),
    ]);

    let recorder = Recorder::default();
    let _subscription = graph.subscribe(done, recorder.observer()).unwrap();
    graph
        .set(second, json!({ "title": "b", "done": true }))
        .unwrap();

    assert_eq!(
        recorder.results(),
        vec![value(json!(["a", "c"])), value(json!(["a", "b", "c"]))]
    );
}

/// Listing nil gives an empty collection.
#[test]
fn nil_lists_as_empty() {
    let graph = Graph::new(Definition::tree([("nothing", Definition::nil())]));
    let items = Path::root().get("nothing").items(Vec::new());
    assert_eq!(graph.get(items).unwrap(), value(json!([])));
}

// ----------------------------------------------------------------------------
// Pending and errors
// ----------------------------------------------------------------------------

/// Fallbacks stand in while a source is pending.
#[test]
fn if_pending_falls_back_until_ready() {
    let deferred = Deferred::new();
    let source = deferred.definition();
    let graph = Graph::new(empty_root());
    let query = Path::from_definition(source).or_pending(Definition::value("loading"));

    let recorder = Recorder::default();
    let _subscription = graph.subscribe(query, recorder.observer()).unwrap();
    deferred.resolve(Definition::value("loaded"));

    assert_eq!(
        recorder.results(),
        vec![value(json!("loading")), value(json!("loaded"))]
    );
}

/// Errors can be recovered from.
#[test]
fn catch_error_recovers() {
    let graph = Graph::new(empty_root());
    let query = Definition::catch_error(
        Definition::error(ErrorInfo::resolution("offline")),
        |info| Definition::value(format!("recovered: {}", info.message)),
    );
    assert_eq!(graph.get(query).unwrap(), value(json!("recovered: offline")));

    let healthy = Definition::catch_error(Definition::value(1), |_| Definition::value(0));
    assert_eq!(graph.get(healthy).unwrap(), value(json!(1)));
}

/// Errors flow through computations unchanged.
#[test]
fn errors_propagate_through_computations() {
    let graph = Graph::new(empty_root());
    let failing = Definition::computed(Vec::new(), |_| Err(ErrorInfo::resolution("nope")));
    let result = graph.get(upper_case(failing)).unwrap();
    assert_eq!(result.as_error().map(|info| info.message.as_str()), Some("nope"));
}

// ----------------------------------------------------------------------------
// Sources
// ----------------------------------------------------------------------------

/// A deferred source is pending until resolved and cancelled on release.
#[test]
fn deferred_source_lifecycle() {
    let deferred = Deferred::new();
    let source = deferred.definition();
    let graph = Graph::new(empty_root());

    let recorder = Recorder::default();
    let subscription = graph.subscribe(source.clone(), recorder.observer()).unwrap();
    assert_eq!(recorder.results(), vec![GraphResult::Pending]);
    assert!(deferred.is_connected());

    deferred.resolve(Definition::value(5));
    assert_eq!(recorder.last(), Some(value(json!(5))));

    deferred.reject("gone");
    assert_eq!(
        recorder.last().and_then(|result| result.as_error().map(|info| info.message.clone())),
        Some("gone".to_string())
    );

    subscription.dispose();
    assert_eq!(deferred.connections(), 1);
    assert_eq!(deferred.cancellations(), 1);
    assert!(!deferred.is_connected());
}

/// Future-backed sources settle on the tokio runtime.
#[tokio::test]
async fn future_source_settles() {
    let graph = Graph::new(Definition::tree([("base", Definition::value(40))]));
    let fetched = from_future(|| async {
        tokio::task::yield_now().await;
        Ok(Definition::value(2))
    });
    let total = Definition::computed(
        vec![Definition::reference(["base"]), fetched],
        |values| {
            let sum: i64 = values.iter().filter_map(Json::as_i64).sum();
            Ok(Definition::value(sum))
        },
    );

    assert_eq!(graph.get(total.clone()).unwrap(), GraphResult::Pending);
    assert_eq!(graph.settle(total).await.unwrap(), value(json!(42)));
}

/// Sets a flag when dropped.
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Disposing a pending future-backed source aborts its task.
#[tokio::test]
async fn disposing_future_source_aborts_task() {
    let dropped = Arc::new(AtomicBool::new(false));
    let never = {
        let dropped = Arc::clone(&dropped);
        from_future(move || {
            let flag = DropFlag(Arc::clone(&dropped));
            async move {
                let _flag = flag;
                std::future::pending::<()>().await;
                Ok(Definition::value(0))
            }
        })
    };

    let graph = Graph::new(empty_root());
    let recorder = Recorder::default();
    let subscription = graph.subscribe(never, recorder.observer()).unwrap();
    assert_eq!(recorder.results(), vec![GraphResult::Pending]);
    assert!(!dropped.load(Ordering::SeqCst));

    subscription.dispose();
    for _ in 0..16 {
        if dropped.load(Ordering::SeqCst) {
            break;
        }
        tokio::task::yield_now().await;
    }

    assert!(dropped.load(Ordering::SeqCst));
    assert!(graph.inspect().unwrap().cache.actions.is_empty());
    assert_eq!(recorder.count(), 1);
}

// ----------------------------------------------------------------------------
// Scopes and contexts
// ----------------------------------------------------------------------------

/// Forked contexts have their own variable values.
#[test]
fn contexts_isolate_variables() {
    let graph = Graph::new(Definition::tree([("count", Definition::variable(0))]));
    let context = graph.fork_context().unwrap();
    let forked = graph.at(Location::new(ScopeId::ROOT, context)).unwrap();
    let count = Definition::reference(["count"]);

    forked.set(count.clone(), 5).unwrap();

    assert_eq!(graph.get(count.clone()).unwrap(), value(json!(0)));
    assert_eq!(forked.get(count).unwrap(), value(json!(5)));
    assert_ne!(context, ContextId::ROOT);
}

// ----------------------------------------------------------------------------
// Inspection and lifecycle
// ----------------------------------------------------------------------------

/// The dependency forest folds the root into its tree.
#[test]
fn forest_tracks_held_nodes() {
    let graph = Graph::new(empty_root());
    let _root = graph.resolve(Definition::root(), Operation::resolve()).unwrap();

    let forest = graph.inspect().unwrap().forest();
    assert_eq!(forest.len(), 1);
    assert!(forest[0].edges.is_empty());

    let foo = graph.resolve(Definition::value("foo"), Operation::resolve()).unwrap();
    assert_eq!(foo.result().unwrap(), value(json!("foo")));
    assert_eq!(graph.inspect().unwrap().forest().len(), 2);

    foo.release();
    assert_eq!(graph.inspect().unwrap().forest().len(), 1);
}

/// Snapshots serialise in both formats.
#[test]
fn snapshot_lists_subscriptions() {
    let graph = Graph::new(Definition::tree([("name", Definition::variable("ada"))]));
    let recorder = Recorder::default();
    let _subscription = graph
        .subscribe(Path::root().get("name"), recorder.observer())
        .unwrap();

    let snapshot = graph.inspect().unwrap();
    let json: Json = serde_json::from_str(&snapshot.to_json().unwrap()).unwrap();
    assert_eq!(json["subscriptions"].as_array().map(Vec::len), Some(1));
    assert!(json["nodeTypes"].as_array().is_some_and(|kinds| !kinds.is_empty()));
    assert!(!json["cache"]["actions"].as_array().unwrap().is_empty());

    let decoded: Json = rmp_serde::from_slice(&snapshot.to_msgpack().unwrap()).unwrap();
    assert_eq!(decoded["subscriptions"], json["subscriptions"]);
}

/// Disposal tears everything down and makes later calls fail.
#[test]
fn dispose_runs_cleanups() {
    let deferred = Deferred::new();
    let graph = Graph::new(empty_root());
    let recorder = Recorder::default();
    let subscription = graph
        .subscribe(deferred.definition(), recorder.observer())
        .unwrap();

    graph.dispose();

    assert_eq!(deferred.cancellations(), 1);
    assert!(graph.get(Definition::value(1)).is_err());

    // Emissions and disposals after teardown are ignored
    deferred.resolve(Definition::value(1));
    subscription.dispose();
    assert_eq!(recorder.count(), 1);
}

/// Handles outliving their graph report disposal.
#[test]
fn handles_fail_after_dispose() {
    let graph = Graph::new(Definition::tree([("name", Definition::variable("ada"))]));
    let handle = graph
        .resolve(Path::root().get("name"), Operation::resolve())
        .unwrap();
    assert_eq!(handle.result().unwrap(), value(json!("ada")));

    graph.dispose();

    assert!(matches!(handle.subscribe(|_| {}), Err(GraphError::Disposed)));
    assert_eq!(handle.result(), Err(GraphError::Disposed));
}
