use async_trait::async_trait;
use dispatch_q::{
    DeadLetterReason, Dispatcher, MemoryStore, MetricsSink, QueueHandler, QueueKey, QueuePayload,
    QueueResult, QueueStore,
};
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn dispatcher(store: Arc<MemoryStore>, workers: usize) -> Dispatcher {
    Dispatcher::builder()
        .store(store)
        .workers(workers)
        .poll_interval(Duration::from_millis(5))
        .max_poll_interval(Duration::from_millis(20))
        .build()
        .await
        .unwrap()
}

#[derive(Default)]
struct CountingMetrics {
    counters: Mutex<HashMap<String, u64>>,
}

impl CountingMetrics {
    fn get(&self, name: &str) -> u64 {
        self.counters.lock().unwrap().get(name).copied().unwrap_or(0)
    }
}

impl MetricsSink for CountingMetrics {
    fn inc_counter(&self, name: &str, value: u64) {
        *self.counters.lock().unwrap().entry(name.to_string()).or_default() += value;
    }
}

/// Records every attempt and answers according to `succeed_on_retry`.
struct Recording {
    topic: &'static str,
    group: &'static str,
    succeed_on_retry: Option<u32>,
    attempts: Mutex<Vec<(String, u32)>>,
}

impl Recording {
    fn new(topic: &'static str, group: &'static str, succeed_on_retry: Option<u32>) -> Arc<Self> {
        Arc::new(Self {
            topic,
            group,
            succeed_on_retry,
            attempts: Mutex::new(Vec::new()),
        })
    }

    fn attempts(&self) -> Vec<(String, u32)> {
        self.attempts.lock().unwrap().clone()
    }

    fn count(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }
}

#[async_trait]
impl QueueHandler for Recording {
    async fn execute(&self, payload: &QueuePayload) -> QueueResult {
        assert_eq!(payload.topic, self.topic, "job routed to the wrong handler");
        assert_eq!(payload.group, self.group, "job routed to the wrong handler");
        self.attempts
            .lock()
            .unwrap()
            .push((payload.id.clone(), payload.retry));
        match self.succeed_on_retry {
            Some(retry) if payload.retry >= retry => QueueResult::ok("ok"),
            _ => QueueResult::fail("rejected"),
        }
    }
}

struct PanicsFirst {
    calls: AtomicUsize,
}

#[async_trait]
impl QueueHandler for PanicsFirst {
    async fn execute(&self, _payload: &QueuePayload) -> QueueResult {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("first call explodes");
        }
        QueueResult::ok("recovered")
    }
}

struct AlwaysPanics;

#[async_trait]
impl QueueHandler for AlwaysPanics {
    async fn execute(&self, _payload: &QueuePayload) -> QueueResult {
        panic!("always explodes");
    }
}

#[tokio::test]
async fn successful_jobs_never_take_the_fallback_lane() {
    let store = Arc::new(MemoryStore::new());
    let metrics = Arc::new(CountingMetrics::default());
    let mut dispatcher = dispatcher(store, 2).await;
    dispatcher.with_metrics(metrics.clone());
    let handler = Recording::new("A", "", Some(0));
    dispatcher.register_handler("A", "", handler.clone()).unwrap();

    for i in 0..10 {
        let mut job = dispatcher.payload("A", json!({ "n": i }));
        dispatcher.enqueue(&mut job).await.unwrap();
    }
    let handle = dispatcher.start().await.unwrap();
    assert!(wait_until(Duration::from_secs(5), || async { handler.count() == 10 }).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.shutdown().await;

    assert!(handler.attempts().iter().all(|(_, retry)| *retry == 0));
    assert_eq!(handler.count(), 10);
    assert_eq!(metrics.get("job_completed"), 10);
    assert_eq!(metrics.get("job_retry"), 0);
}

#[tokio::test]
async fn failing_job_is_retried_up_to_its_budget_then_dead_lettered() {
    let store = Arc::new(MemoryStore::new());
    let mut dispatcher = dispatcher(store, 2).await;
    let handler = Recording::new("A", "", None);
    dispatcher.register_handler("A", "", handler.clone()).unwrap();

    let mut job = dispatcher.payload("A", json!("x")).max_retry(2);
    dispatcher.enqueue(&mut job).await.unwrap();
    let handle = dispatcher.start().await.unwrap();

    let queue = dispatcher.queue().clone();
    assert!(
        wait_until(Duration::from_secs(5), || async {
            queue.dead_letter_len("A", "").await.unwrap() == 1
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.shutdown().await;

    let retries: Vec<u32> = handler.attempts().into_iter().map(|(_, r)| r).collect();
    assert_eq!(retries, vec![0, 1, 2]);

    let entry = queue.pop_dead_letter("A", "").await.unwrap().unwrap();
    assert_eq!(entry.reason, DeadLetterReason::RetriesExhausted);
    assert_eq!(entry.key, "Queue_A");
    assert_eq!(entry.payload.unwrap().id, job.id);
}

#[tokio::test]
async fn grouped_job_succeeding_first_time_runs_once() {
    let store = Arc::new(MemoryStore::new());
    let mut dispatcher = dispatcher(store.clone(), 2).await;
    let handler = Recording::new("B", "G", Some(0));
    dispatcher.register_handler("B", "G", handler.clone()).unwrap();

    let mut job = dispatcher.payload("B", json!({})).group("G").max_retry(3);
    dispatcher.enqueue(&mut job).await.unwrap();
    assert_eq!(store.entries("Queue_B::G").await.len(), 1);

    let handle = dispatcher.start().await.unwrap();
    assert!(wait_until(Duration::from_secs(5), || async { handler.count() == 1 }).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.shutdown().await;

    assert_eq!(handler.attempts(), vec![(job.id.clone(), 0)]);
    assert!(store.entries("Queue_B::G").await.is_empty());
}

#[tokio::test]
async fn every_job_runs_exactly_once_on_its_own_handler() {
    let store = Arc::new(MemoryStore::new());
    let mut dispatcher = dispatcher(store, 4).await;
    let handlers = [
        Recording::new("orders", "eu", Some(0)),
        Recording::new("orders", "us", Some(0)),
        Recording::new("mail", "", Some(0)),
    ];
    for handler in &handlers {
        dispatcher
            .register_handler(handler.topic, handler.group, handler.clone())
            .unwrap();
    }

    let mut expected: Vec<Vec<String>> = vec![Vec::new(); handlers.len()];
    for i in 0..100 {
        let slot = i % handlers.len();
        let handler = &handlers[slot];
        let mut job = dispatcher
            .payload(handler.topic, json!({ "n": i }))
            .group(handler.group);
        dispatcher.enqueue(&mut job).await.unwrap();
        expected[slot].push(job.id);
    }

    let handle = dispatcher.start().await.unwrap();
    assert!(
        wait_until(Duration::from_secs(10), || async {
            handlers.iter().map(|h| h.count()).sum::<usize>() == 100
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.shutdown().await;

    for (handler, expected) in handlers.iter().zip(expected) {
        let mut seen: Vec<String> = handler.attempts().into_iter().map(|(id, _)| id).collect();
        let mut expected = expected;
        seen.sort();
        expected.sort();
        assert_eq!(seen, expected);
    }
}

#[tokio::test]
async fn unroutable_job_is_dead_lettered_and_pool_keeps_running() {
    let store = Arc::new(MemoryStore::new());
    let metrics = Arc::new(CountingMetrics::default());
    let mut dispatcher = dispatcher(store.clone(), 2).await;
    dispatcher.with_metrics(metrics.clone());
    let handler = Recording::new("A", "", Some(0));
    dispatcher.register_handler("A", "", handler.clone()).unwrap();

    let stray = QueuePayload::new("X", json!("lost"));
    store
        .push_back(
            QueueKey::new("A", "").as_str(),
            serde_json::to_string(&stray).unwrap(),
        )
        .await
        .unwrap();
    let mut job = dispatcher.payload("A", json!("after"));
    dispatcher.enqueue(&mut job).await.unwrap();

    let handle = dispatcher.start().await.unwrap();
    assert!(wait_until(Duration::from_secs(5), || async { handler.count() == 1 }).await);
    handle.shutdown().await;

    assert_eq!(metrics.get("job_unroutable"), 1);
    let queue = dispatcher.queue();
    assert_eq!(queue.dead_letter_len("X", "").await.unwrap(), 0);
    let entry = queue.pop_dead_letter("A", "").await.unwrap().unwrap();
    assert_eq!(entry.reason, DeadLetterReason::Unroutable);
    assert_eq!(entry.key, "Queue_A");
    assert_eq!(entry.payload.unwrap().topic, "X");
}

#[tokio::test]
async fn handler_panic_is_recovered_and_retried() {
    let store = Arc::new(MemoryStore::new());
    let mut dispatcher = dispatcher(store, 1).await;
    let traces = Arc::new(Mutex::new(Vec::<String>::new()));
    {
        let traces = traces.clone();
        dispatcher.register_on_recovery(move |trace| traces.lock().unwrap().push(trace.to_string()));
    }
    let handler = Arc::new(PanicsFirst {
        calls: AtomicUsize::new(0),
    });
    dispatcher.register_handler("P", "", handler.clone()).unwrap();
    let after = Recording::new("A", "", Some(0));
    dispatcher.register_handler("A", "", after.clone()).unwrap();

    let mut job = dispatcher.payload("P", json!(null));
    dispatcher.enqueue(&mut job).await.unwrap();
    let mut next = dispatcher.payload("A", json!(null));
    dispatcher.enqueue(&mut next).await.unwrap();

    let handle = dispatcher.start().await.unwrap();
    assert!(
        wait_until(Duration::from_secs(5), || async {
            handler.calls.load(Ordering::SeqCst) == 2 && after.count() == 1
        })
        .await
    );
    handle.shutdown().await;

    let traces = traces.lock().unwrap();
    assert_eq!(traces.len(), 1);
    assert!(traces[0].contains("panicked at"), "{}", traces[0]);
    assert_eq!(dispatcher.queue().dead_letter_len("P", "").await.unwrap(), 0);
}

#[tokio::test]
async fn repeated_panic_dead_letters_the_job() {
    let store = Arc::new(MemoryStore::new());
    let metrics = Arc::new(CountingMetrics::default());
    let mut dispatcher = dispatcher(store, 2).await;
    dispatcher.with_metrics(metrics.clone());
    let recovered = Arc::new(AtomicUsize::new(0));
    {
        let recovered = recovered.clone();
        dispatcher.register_on_recovery(move |_| {
            recovered.fetch_add(1, Ordering::SeqCst);
        });
    }
    dispatcher.register_handler("P", "", Arc::new(AlwaysPanics)).unwrap();

    let mut job = dispatcher.payload("P", json!(null)).max_retry(5);
    dispatcher.enqueue(&mut job).await.unwrap();
    let handle = dispatcher.start().await.unwrap();

    let queue = dispatcher.queue().clone();
    assert!(
        wait_until(Duration::from_secs(5), || async {
            queue.dead_letter_len("P", "").await.unwrap() == 1
        })
        .await
    );
    handle.shutdown().await;

    assert_eq!(recovered.load(Ordering::SeqCst), 2);
    assert_eq!(metrics.get("job_fault"), 2);
    let entry = queue.pop_dead_letter("P", "").await.unwrap().unwrap();
    assert_eq!(entry.reason, DeadLetterReason::Fault);
    assert_eq!(entry.message, "always explodes");
}

#[tokio::test]
async fn poisoned_entry_is_dead_lettered_without_blocking_the_queue() {
    let store = Arc::new(MemoryStore::new());
    let mut dispatcher = dispatcher(store.clone(), 2).await;
    let handler = Recording::new("A", "", Some(0));
    dispatcher.register_handler("A", "", handler.clone()).unwrap();

    store
        .push_back("Queue_A", "{not json".to_string())
        .await
        .unwrap();
    let mut job = dispatcher.payload("A", json!(1));
    dispatcher.enqueue(&mut job).await.unwrap();

    let handle = dispatcher.start().await.unwrap();
    assert!(wait_until(Duration::from_secs(5), || async { handler.count() == 1 }).await);
    handle.shutdown().await;

    let entry = dispatcher
        .queue()
        .pop_dead_letter("A", "")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.reason, DeadLetterReason::Poisoned);
    assert_eq!(entry.raw.as_deref(), Some("{not json"));
}

#[tokio::test]
async fn unavailable_store_does_not_stop_the_dispatcher() {
    let store = Arc::new(MemoryStore::new());
    let mut dispatcher = dispatcher(store.clone(), 2).await;
    let handler = Recording::new("A", "", Some(0));
    dispatcher.register_handler("A", "", handler.clone()).unwrap();

    store.set_unavailable(true);
    let handle = dispatcher.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    store.set_unavailable(false);

    let mut job = dispatcher.payload("A", json!(1));
    dispatcher.enqueue(&mut job).await.unwrap();
    assert!(wait_until(Duration::from_secs(5), || async { handler.count() == 1 }).await);
    handle.shutdown().await;
}

/// Panics the first time a completion is recorded, outside any handler.
#[derive(Default)]
struct PanicsOnFirstCompletion {
    tripped: AtomicBool,
    inner: CountingMetrics,
}

impl MetricsSink for PanicsOnFirstCompletion {
    fn inc_counter(&self, name: &str, value: u64) {
        if name == "job_completed" && !self.tripped.swap(true, Ordering::SeqCst) {
            panic!("metrics backend failure");
        }
        self.inner.inc_counter(name, value);
    }
}

#[tokio::test]
async fn crashed_worker_is_replaced_and_pool_keeps_serving() {
    let store = Arc::new(MemoryStore::new());
    let metrics = Arc::new(PanicsOnFirstCompletion::default());
    let mut dispatcher = dispatcher(store, 1).await;
    dispatcher.with_metrics(metrics.clone());
    let handler = Recording::new("A", "", Some(0));
    dispatcher.register_handler("A", "", handler.clone()).unwrap();

    for i in 0..3 {
        let mut job = dispatcher.payload("A", json!(i));
        dispatcher.enqueue(&mut job).await.unwrap();
    }
    let handle = dispatcher.start().await.unwrap();
    assert!(wait_until(Duration::from_secs(5), || async { handler.count() == 3 }).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.shutdown().await;

    assert!(metrics.tripped.load(Ordering::SeqCst));
    assert_eq!(metrics.inner.get("worker_restarted"), 1);
    assert_eq!(metrics.inner.get("job_completed"), 2);
    assert_eq!(handler.count(), 3);
}

#[tokio::test]
async fn retries_are_not_starved_by_a_busy_fast_lane() {
    let store = Arc::new(MemoryStore::new());
    let mut dispatcher = dispatcher(store, 1).await;
    let handler = Recording::new("A", "", None);
    dispatcher.register_handler("A", "", handler.clone()).unwrap();

    for i in 0..10 {
        let mut job = dispatcher.payload("A", json!(i)).max_retry(1);
        dispatcher.enqueue(&mut job).await.unwrap();
    }
    let handle = dispatcher.start().await.unwrap();

    let queue = dispatcher.queue().clone();
    assert!(
        wait_until(Duration::from_secs(5), || async {
            queue.dead_letter_len("A", "").await.unwrap() == 10
        })
        .await
    );
    handle.shutdown().await;

    let attempts = handler.attempts();
    assert_eq!(attempts.len(), 20);
    let first_retry = attempts.iter().position(|(_, retry)| *retry == 1).unwrap();
    let last_first_attempt = attempts.iter().rposition(|(_, retry)| *retry == 0).unwrap();
    assert!(
        first_retry < last_first_attempt,
        "retries only ran after every first attempt: {attempts:?}"
    );
    assert!(first_retry <= 3, "first retry ran at position {first_retry}");
}

#[tokio::test]
async fn jobs_pushed_while_running_run_exactly_once() {
    let store = Arc::new(MemoryStore::new());
    let mut dispatcher = dispatcher(store, 4).await;
    let handlers = [
        Recording::new("orders", "eu", Some(0)),
        Recording::new("orders", "us", Some(0)),
        Recording::new("mail", "", Some(0)),
    ];
    for handler in &handlers {
        dispatcher
            .register_handler(handler.topic, handler.group, handler.clone())
            .unwrap();
    }
    let handle = dispatcher.start().await.unwrap();

    let mut producers = Vec::new();
    for producer in 0..4usize {
        let queue = dispatcher.queue().clone();
        let targets: Vec<(&'static str, &'static str)> =
            handlers.iter().map(|h| (h.topic, h.group)).collect();
        producers.push(tokio::spawn(async move {
            let mut pushed: Vec<(usize, String)> = Vec::new();
            for i in 0..25usize {
                let slot = (producer + i) % targets.len();
                let (topic, group) = targets[slot];
                let mut job = QueuePayload::new(topic, json!({ "producer": producer, "n": i }))
                    .group(group);
                queue.push(&mut job).await.unwrap();
                pushed.push((slot, job.id));
                tokio::task::yield_now().await;
            }
            pushed
        }));
    }

    let mut expected: Vec<Vec<String>> = vec![Vec::new(); handlers.len()];
    for producer in producers {
        for (slot, id) in producer.await.unwrap() {
            expected[slot].push(id);
        }
    }

    assert!(
        wait_until(Duration::from_secs(10), || async {
            handlers.iter().map(|h| h.count()).sum::<usize>() == 100
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.shutdown().await;

    for (handler, mut expected) in handlers.iter().zip(expected) {
        let mut seen: Vec<String> = handler.attempts().into_iter().map(|(id, _)| id).collect();
        seen.sort();
        expected.sort();
        assert_eq!(seen, expected);
    }
}
