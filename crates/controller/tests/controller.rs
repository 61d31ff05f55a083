#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use k8s_openapi::api::core::v1::{Endpoints, Service, ServiceSpec};
use kube::api::ObjectMeta;
use metrics::{Counter, Gauge, Histogram, Key, KeyName, Metadata, SharedString, Unit};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use warden_controller::{reconciler_fn, Aggregator, ControllerConfig, ControllerError, Reconciler, ResourceController};
use warden_core::{BackoffPolicy, Object, ResourceKey};
use warden_kubehub::{MemorySource, SourceError};
use warden_store::WatchCache;

fn svc(ns: &str, name: &str, type_: &str) -> Service {
    Service {
        metadata: ObjectMeta { name: Some(name.into()), namespace: Some(ns.into()), ..Default::default() },
        spec: Some(ServiceSpec { type_: Some(type_.into()), ..Default::default() }),
        ..Default::default()
    }
}

fn endpoints(ns: &str, name: &str) -> Endpoints {
    Endpoints {
        metadata: ObjectMeta { name: Some(name.into()), namespace: Some(ns.into()), ..Default::default() },
        ..Default::default()
    }
}

fn cfg() -> ControllerConfig {
    ControllerConfig {
        resync_period: None,
        sync_timeout: Duration::from_secs(5),
        retry_backoff: BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(10)),
        watch_backoff: BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(100)),
        ..ControllerConfig::default()
    }
}

/// Counter totals by metric name; gauges and histograms are ignored.
#[derive(Default)]
struct Counters(Mutex<HashMap<String, Arc<AtomicU64>>>);

impl Counters {
    fn total(&self, name: &str) -> u64 { self.0.lock().unwrap().get(name).map_or(0, |c| c.load(Ordering::SeqCst)) }
}

impl metrics::Recorder for Counters {
    fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
        let c = self.0.lock().unwrap().entry(key.name().to_string()).or_default().clone();
        Counter::from_arc(c)
    }

    fn register_gauge(&self, _: &Key, _: &Metadata<'_>) -> Gauge { Gauge::noop() }

    fn register_histogram(&self, _: &Key, _: &Metadata<'_>) -> Histogram { Histogram::noop() }
}

/// Runs `f` on a paused current-thread runtime with `counters` as the metrics recorder.
fn with_counters<F: std::future::Future>(counters: &Counters, f: F) -> F::Output {
    metrics::with_local_recorder(counters, || {
        tokio::runtime::Builder::new_current_thread().enable_all().start_paused(true).build().expect("runtime").block_on(f)
    })
}

async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..2000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met in time");
}

#[derive(Debug, Clone)]
struct Call {
    key: String,
    at: Instant,
    present: bool,
    synced: bool,
}

/// Records every reconciliation; fails or panics on request.
#[derive(Clone, Default)]
struct Recorder {
    calls: Arc<Mutex<Vec<Call>>>,
    succeeded: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
    fail_first: usize,
    panic_first: bool,
    delay: Duration,
}

impl Recorder {
    fn calls(&self) -> Vec<Call> { self.calls.lock().unwrap().clone() }
    fn succeeded(&self) -> usize { self.succeeded.load(Ordering::SeqCst) }
    fn max_active(&self) -> usize { self.max_active.load(Ordering::SeqCst) }
}

#[async_trait::async_trait]
impl<K: Object> Reconciler<K> for Recorder {
    async fn reconcile(&self, key: &ResourceKey, cache: &WatchCache<K>) -> anyhow::Result<()> {
        let n = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(Call { key: key.to_string(), at: Instant::now(), present: cache.get(key).is_some(), synced: cache.has_synced() });
            calls.len()
        };
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        if self.panic_first && n == 1 {
            panic!("reconcile blew up");
        }
        if n <= self.fail_first {
            anyhow::bail!("attempt {} failed", n);
        }
        self.succeeded.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn service_lifecycle_reconciles_three_times() {
    let src = MemorySource::<Service>::new("services");
    let rec = Recorder::default();
    let ctrl = ResourceController::new("services", src.clone(), rec.clone(), cfg());
    let cache = ctrl.cache().clone();
    let stop = CancellationToken::new();
    let run = tokio::spawn(ctrl.run(2, stop.clone()));
    eventually(|| src.open_watches() == 1).await;

    src.apply(svc("ns1", "svc-a", "ClusterIP"));
    eventually(|| rec.succeeded() == 1).await;
    src.apply(svc("ns1", "svc-a", "NodePort"));
    eventually(|| rec.succeeded() == 2).await;

    // Deleted while the watch is down: the relist reports it as a tombstone.
    src.fail_watches(SourceError::Transport("connection reset".into()));
    src.delete("ns1/svc-a");
    eventually(|| rec.succeeded() == 3).await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    let calls = rec.calls();
    assert_eq!(calls.len(), 3);
    assert!(calls.iter().all(|c| c.key == "ns1/svc-a"));
    assert_eq!(calls.iter().map(|c| c.present).collect::<Vec<_>>(), vec![true, true, false]);
    assert_eq!(rec.max_active(), 1);
    assert!(cache.get_by_key("ns1/svc-a").is_none());

    stop.cancel();
    run.await.expect("joined").expect("clean shutdown");
}

#[tokio::test(start_paused = true)]
async fn workers_start_only_after_cache_sync() {
    let src = MemorySource::with_objects("services", vec![svc("ns1", "a", "ClusterIP"), svc("ns1", "b", "ClusterIP")]);
    src.fail_next_lists(3);
    let rec = Recorder::default();
    let ctrl = ResourceController::new("services", src.clone(), rec.clone(), cfg());
    let stop = CancellationToken::new();
    let run = tokio::spawn(ctrl.run(2, stop.clone()));

    eventually(|| rec.succeeded() == 2).await;
    assert_eq!(src.list_calls(), 4);
    let calls = rec.calls();
    assert!(calls.iter().all(|c| c.synced), "reconcile ran before sync: {:?}", calls);
    let mut keys: Vec<_> = calls.into_iter().map(|c| c.key).collect();
    keys.sort();
    assert_eq!(keys, vec!["ns1/a", "ns1/b"]);

    stop.cancel();
    run.await.expect("joined").expect("clean shutdown");
}

#[test]
fn failures_retry_with_backoff_up_to_ceiling() {
    let counters = Counters::default();
    with_counters(&counters, async {
        let src = MemorySource::with_objects("services", vec![svc("ns1", "svc-a", "ClusterIP")]);
        let rec = Recorder { fail_first: usize::MAX, ..Recorder::default() };
        let ctrl = ResourceController::new("services", src, rec.clone(), ControllerConfig { max_retries: 3, ..cfg() });
        let queue = Arc::clone(ctrl.queue());
        let stop = CancellationToken::new();
        let run = tokio::spawn(ctrl.run(1, stop.clone()));

        eventually(|| rec.calls().len() == 4).await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        let calls = rec.calls();
        assert_eq!(calls.len(), 4, "one attempt plus three retries");
        for (i, pair) in calls.windows(2).enumerate() {
            let gap = pair[1].at - pair[0].at;
            assert!(gap >= Duration::from_millis(100 << i), "retry {} after {:?}", i + 1, gap);
        }

        let key = ResourceKey::parse("ns1/svc-a").expect("key");
        assert_eq!(queue.num_requeues(&key), 0, "terminal failure forgets the key");
        assert_eq!((queue.len(), queue.delayed()), (0, 0));

        stop.cancel();
        run.await.expect("joined").expect("clean shutdown");
    });
    assert_eq!(counters.total("reconcile_terminal_failures_total"), 1, "terminal failure reported exactly once");
    assert_eq!(counters.total("queue_retries_total"), 3);
}

#[tokio::test(start_paused = true)]
async fn zero_queue_rate_still_retries_and_stops() {
    let src = MemorySource::with_objects("services", vec![svc("ns1", "svc-a", "ClusterIP")]);
    let rec = Recorder { fail_first: usize::MAX, ..Recorder::default() };
    let cfg = ControllerConfig { max_retries: 3, queue_qps: 0.0, queue_burst: 1, ..cfg() };
    let ctrl = ResourceController::new("services", src, rec.clone(), cfg);
    let queue = Arc::clone(ctrl.queue());
    let stop = CancellationToken::new();
    let run = tokio::spawn(ctrl.run(1, stop.clone()));

    eventually(|| rec.calls().len() == 4).await;
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(rec.calls().len(), 4);
    assert_eq!(queue.processing(), 0);

    stop.cancel();
    tokio::time::timeout(Duration::from_secs(5), run).await.expect("stops").expect("joined").expect("clean shutdown");
}

#[tokio::test(start_paused = true)]
async fn transient_failure_recovers_and_resets_backoff() {
    let src = MemorySource::with_objects("services", vec![svc("ns1", "svc-a", "ClusterIP")]);
    let rec = Recorder { fail_first: 2, ..Recorder::default() };
    let ctrl = ResourceController::new("services", src, rec.clone(), cfg());
    let queue = Arc::clone(ctrl.queue());
    let stop = CancellationToken::new();
    let run = tokio::spawn(ctrl.run(1, stop.clone()));

    eventually(|| rec.succeeded() == 1).await;
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(rec.calls().len(), 3);
    assert_eq!(queue.num_requeues(&ResourceKey::parse("ns1/svc-a").expect("key")), 0);

    stop.cancel();
    run.await.expect("joined").expect("clean shutdown");
}

#[tokio::test(start_paused = true)]
async fn panicking_reconcile_is_retried() {
    let src = MemorySource::with_objects("services", vec![svc("ns1", "svc-a", "ClusterIP")]);
    let rec = Recorder { panic_first: true, ..Recorder::default() };
    let ctrl = ResourceController::new("services", src, rec.clone(), cfg());
    let stop = CancellationToken::new();
    let run = tokio::spawn(ctrl.run(1, stop.clone()));

    eventually(|| rec.succeeded() == 1).await;
    assert_eq!(rec.calls().len(), 2);

    stop.cancel();
    run.await.expect("joined").expect("clean shutdown");
}

#[tokio::test(start_paused = true)]
async fn resync_of_unchanged_objects_does_not_reconcile() {
    let src = MemorySource::with_objects("services", vec![svc("ns1", "svc-a", "ClusterIP")]);
    let rec = Recorder::default();
    let ctrl = ResourceController::new("services", src, rec.clone(), ControllerConfig { resync_period: Some(Duration::from_secs(1)), ..cfg() });
    let stop = CancellationToken::new();
    let run = tokio::spawn(ctrl.run(1, stop.clone()));

    eventually(|| rec.succeeded() == 1).await;
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(rec.calls().len(), 1);

    stop.cancel();
    run.await.expect("joined").expect("clean shutdown");
}

#[tokio::test(start_paused = true)]
async fn stop_waits_for_in_flight_reconcile() {
    let src = MemorySource::with_objects("services", vec![svc("ns1", "svc-a", "ClusterIP")]);
    let rec = Recorder { delay: Duration::from_millis(200), ..Recorder::default() };
    let ctrl = ResourceController::new("services", src, rec.clone(), cfg());
    let stop = CancellationToken::new();
    let run = tokio::spawn(ctrl.run(1, stop.clone()));

    eventually(|| rec.calls().len() == 1).await;
    assert_eq!(rec.succeeded(), 0);
    stop.cancel();
    run.await.expect("joined").expect("clean shutdown");
    assert_eq!(rec.succeeded(), 1, "in-flight reconcile must finish before run returns");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_key_is_never_reconciled_concurrently() {
    let src = MemorySource::<Service>::new("services");
    let rec = Recorder { delay: Duration::from_millis(20), ..Recorder::default() };
    let ctrl = ResourceController::new("services", src.clone(), rec.clone(), cfg());
    let stop = CancellationToken::new();
    let run = tokio::spawn(ctrl.run(4, stop.clone()));
    eventually(|| src.open_watches() == 1).await;

    for i in 0..20 {
        src.apply(svc("ns1", "svc-a", if i % 2 == 0 { "ClusterIP" } else { "NodePort" }));
        tokio::time::sleep(Duration::from_millis(3)).await;
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    let n = rec.calls().len();
    assert!(n >= 2 && n <= 20, "reconciled {} times", n);
    assert_eq!(rec.max_active(), 1);

    stop.cancel();
    run.await.expect("joined").expect("clean shutdown");
}

#[tokio::test(start_paused = true)]
async fn sync_timeout_is_an_error() {
    let src = MemorySource::<Service>::new("services");
    src.fail_next_lists(u32::MAX);
    let ctrl = ResourceController::new("services", src, Recorder::default(), cfg());
    let err = ctrl.run(1, CancellationToken::new()).await.expect_err("must time out");
    assert!(matches!(err, ControllerError::SyncTimeout { ref controller, .. } if controller == "services"), "{}", err);
}

#[tokio::test(start_paused = true)]
async fn aggregator_opens_barrier_and_stops_together() {
    let services = MemorySource::with_objects("services", vec![svc("ns1", "svc-a", "ClusterIP")]);
    let eps = MemorySource::with_objects("endpoints", vec![endpoints("ns1", "svc-a")]);
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    let eps_reconciler = reconciler_fn(move |key: ResourceKey, cache: WatchCache<Endpoints>| {
        let counter = Arc::clone(&counter);
        async move {
            if cache.get(&key).is_some() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            Ok::<(), anyhow::Error>(())
        }
    });
    let rec = Recorder::default();

    let agg = Aggregator::new()
        .with(ResourceController::new("services", services, rec.clone(), cfg()), 2)
        .with(ResourceController::new("endpoints", eps, eps_reconciler, cfg()), 2);
    let barrier = agg.barrier();
    assert_eq!(barrier.expected(), 2);
    let stop = CancellationToken::new();
    let run = tokio::spawn(agg.run(stop.clone()));

    tokio::time::timeout(Duration::from_secs(5), barrier.wait()).await.expect("all caches synced");
    eventually(|| rec.succeeded() == 1 && seen.load(Ordering::SeqCst) == 1).await;

    stop.cancel();
    run.await.expect("joined").expect("clean shutdown");
}

#[tokio::test(start_paused = true)]
async fn aggregator_stops_everything_when_one_controller_cannot_sync() {
    let services = MemorySource::with_objects("services", vec![svc("ns1", "svc-a", "ClusterIP")]);
    let eps = MemorySource::<Endpoints>::new("endpoints");
    eps.fail_next_lists(u32::MAX);

    let mut agg = Aggregator::new();
    agg.add(ResourceController::new("services", services, Recorder::default(), cfg()), 1);
    agg.add(ResourceController::new("endpoints", eps, Recorder::default(), cfg()), 1);
    let barrier = agg.barrier();
    let stop = CancellationToken::new();

    let err = agg.run(stop.clone()).await.expect_err("sync timeout is fatal");
    assert!(stop.is_cancelled(), "siblings must be told to stop");
    assert!(!barrier.is_open());
    assert_eq!(barrier.arrived(), 1);
    let cause = err.downcast_ref::<ControllerError>().expect("controller error");
    assert!(matches!(cause, ControllerError::SyncTimeout { controller, .. } if controller == "endpoints"));
}
