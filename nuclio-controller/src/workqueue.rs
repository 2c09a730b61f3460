use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt::Debug,
    marker::PhantomData,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use futures::{Stream, StreamExt, future::join_all, stream::BoxStream};
use kube::{Api, Resource, ResourceExt};
use kube_runtime::{
    WatchStreamExt,
    reflector::{self, ObjectRef, Store, store::Writer},
    watcher::{self, Event},
};
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram, Meter},
};
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, Notify};

use crate::{
    configuration::RateLimiterConfig,
    errors::ControllerError,
    utils::{metric_name, object_key, split_key},
};

const WORK_QUEUE_RECONCILER: &str = "work_queue_reconciler";

/// Reacts to changes of objects of kind `K`.
#[async_trait]
pub(crate) trait ChangeHandler<K: Send + Sync + 'static>: Send + Sync + 'static {
    /// Called with the latest cached version of an object which exists.
    async fn create_or_update(&self, object: Arc<K>) -> Result<(), ControllerError>;

    /// Called once an object is no longer present in the cache.
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), ControllerError>;
}

/// Source of list and watch events for objects of kind `K`.
pub(crate) trait ListWatcher<K>: Send + Sync + 'static {
    fn list_watch(&self) -> BoxStream<'static, watcher::Result<Event<K>>>;
}

impl<K> ListWatcher<K> for Api<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    fn list_watch(&self) -> BoxStream<'static, watcher::Result<Event<K>>> {
        watcher::watcher(self.clone(), watcher::Config::default())
            .default_backoff()
            .boxed()
    }
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    /// Keys waiting to be processed, including keys re-added while being processed.
    dirty: HashSet<String>,
    processing: HashSet<String>,
    failures: HashMap<String, u32>,
    shutting_down: bool,
}

/// Deduplicating, rate limited queue of object keys.
///
/// A key is never handed out to more than one worker at a time, a key added
/// while it is being processed is queued again once [`WorkQueue::done`] is
/// called for it.
pub(crate) struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    rate_limiter: RateLimiterConfig,
}

impl WorkQueue {
    pub(crate) fn new(rate_limiter: RateLimiterConfig) -> Self {
        Self {
            state: Default::default(),
            notify: Notify::new(),
            rate_limiter,
        }
    }

    pub(crate) async fn add(&self, key: String) {
        let mut state = self.state.lock().await;
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.notify.notify_one();
    }

    /// Wait for the next key, `None` once the queue is shut down and drained.
    pub(crate) async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock().await;
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    if !state.queue.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub(crate) async fn done(&self, key: &str) {
        let mut state = self.state.lock().await;
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    pub(crate) async fn forget(&self, key: &str) {
        self.state.lock().await.failures.remove(key);
    }

    pub(crate) async fn num_requeues(&self, key: &str) -> u32 {
        self.state
            .lock()
            .await
            .failures
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    fn backoff(&self, failures: u32) -> Duration {
        2u32.checked_pow(failures)
            .and_then(|factor| self.rate_limiter.base_delay.checked_mul(factor))
            .map(|d| d.min(self.rate_limiter.max_delay))
            .unwrap_or(self.rate_limiter.max_delay)
    }

    /// Add the key again after an exponentially growing delay.
    pub(crate) async fn add_rate_limited(self: &Arc<Self>, key: String) {
        let delay = {
            let mut state = self.state.lock().await;
            let failures = state.failures.entry(key.clone()).or_insert(0);
            let delay = self.backoff(*failures);
            *failures += 1;
            delay
        };
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key).await;
        });
    }

    pub(crate) async fn len(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    pub(crate) async fn shut_down(&self) {
        self.state.lock().await.shutting_down = true;
        self.notify.notify_waiters();
    }
}

fn key_of<K: Resource>(object: &K) -> String {
    object_key(&object.namespace().unwrap_or_default(), &object.name_any())
}

/// Feeds a [`ChangeHandler`] from a list-watch stream through a [`WorkQueue`]
/// processed by a fixed number of workers.
pub(crate) struct WorkQueueReconciler<K, H> {
    name: &'static str,
    handler: Arc<H>,
    workers: usize,
    resync_interval: Duration,
    rate_limiter: RateLimiterConfig,
    reconcile_count: Counter<u64>,
    reconcile_errors: Counter<u64>,
    reconcile_duration: Histogram<u64>,
    _kind: PhantomData<fn() -> K>,
}

impl<K, H> WorkQueueReconciler<K, H>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Send + Sync + 'static,
    H: ChangeHandler<K>,
{
    pub(crate) fn new(
        name: &'static str,
        handler: Arc<H>,
        workers: usize,
        resync_interval: Duration,
        rate_limiter: RateLimiterConfig,
    ) -> Self {
        let meter: Meter = global::meter(WORK_QUEUE_RECONCILER);
        let reconcile_count = meter
            .u64_counter(metric_name("reconcile_count"))
            .with_description("Count of reconcile invocations")
            .build();
        let reconcile_errors = meter
            .u64_counter(metric_name("reconcile_errors"))
            .with_description("Count of failed reconcile invocations")
            .build();
        let reconcile_duration = meter
            .u64_histogram(metric_name("reconcile_duration_ms"))
            .with_description("Reconcile duration in milliseconds")
            .with_unit("ms")
            .build();
        Self {
            name,
            handler,
            workers: workers.max(1),
            resync_interval,
            rate_limiter,
            reconcile_count,
            reconcile_errors,
            reconcile_duration,
            _kind: PhantomData,
        }
    }

    /// Run until the list-watch stream ends and all queued keys are processed.
    pub(crate) async fn run<L: ListWatcher<K>>(self, list_watcher: L) {
        let writer: Writer<K> = Default::default();
        let store = writer.as_reader();
        let queue = Arc::new(WorkQueue::new(self.rate_limiter.clone()));
        let events = reflector::reflector(writer, list_watcher.list_watch());
        info!("starting {} with {} workers", self.name, self.workers);
        let dispatcher = self.dispatch(events, &queue);
        let workers = join_all((0..self.workers).map(|id| self.worker(id, &queue, &store)));
        let resync = self.resync(&queue, &store);
        tokio::select! {
            _ = async { futures::join!(dispatcher, workers) } => (),
            _ = resync => (),
        }
        info!("{} stopped", self.name);
    }

    async fn dispatch(
        &self,
        events: impl Stream<Item = watcher::Result<Event<K>>>,
        queue: &WorkQueue,
    ) {
        let mut known: HashSet<String> = Default::default();
        let mut listed: HashSet<String> = Default::default();
        futures::pin_mut!(events);
        while let Some(event) = events.next().await {
            match event {
                Ok(Event::Apply(object)) => {
                    let key = key_of(&object);
                    known.insert(key.clone());
                    queue.add(key).await;
                }
                Ok(Event::Delete(object)) => {
                    let key = key_of(&object);
                    known.remove(&key);
                    queue.add(key).await;
                }
                Ok(Event::Init) => listed.clear(),
                Ok(Event::InitApply(object)) => {
                    listed.insert(key_of(&object));
                }
                Ok(Event::InitDone) => {
                    // keys which vanished during a re-list are enqueued too, so that their
                    // deletion is observed
                    for key in known.union(&listed) {
                        queue.add(key.clone()).await;
                    }
                    known = std::mem::take(&mut listed);
                }
                Err(e) => warn!("{} watch error: {}", self.name, e),
            }
        }
        queue.shut_down().await;
    }

    async fn resync(&self, queue: &WorkQueue, store: &Store<K>) {
        if self.resync_interval.is_zero() {
            return futures::future::pending().await;
        }
        let mut interval = tokio::time::interval(self.resync_interval);
        interval.tick().await;
        loop {
            interval.tick().await;
            let objects = store.state();
            debug!("{} resync of {} objects", self.name, objects.len());
            for object in objects {
                queue.add(key_of(object.as_ref())).await;
            }
        }
    }

    async fn worker(&self, id: usize, queue: &Arc<WorkQueue>, store: &Store<K>) {
        while let Some(key) = queue.get().await {
            let start = Instant::now();
            let result = self.process(&key, store).await;
            let attributes = [KeyValue::new("queue", self.name)];
            self.reconcile_count.add(1, &attributes);
            self.reconcile_duration
                .record(start.elapsed().as_millis() as u64, &attributes);
            match result {
                Ok(()) => queue.forget(&key).await,
                Err(e) => {
                    self.reconcile_errors.add(1, &attributes);
                    if queue.num_requeues(&key).await < self.rate_limiter.max_retries {
                        warn!("{} failed to process {}, will retry: {}", self.name, key, e);
                        queue.add_rate_limited(key.clone()).await;
                    } else {
                        error!(
                            "{} failed to process {}. No retries left. Giving up: {}",
                            self.name, key, e
                        );
                        queue.forget(&key).await;
                    }
                }
            }
            queue.done(&key).await;
        }
        debug!("{} worker {} stopped", self.name, id);
    }

    async fn process(&self, key: &str, store: &Store<K>) -> Result<(), ControllerError> {
        let (namespace, name) = split_key(key);
        let mut object_ref = ObjectRef::<K>::new(&name);
        if !namespace.is_empty() {
            object_ref = object_ref.within(&namespace);
        }
        match store.get(&object_ref) {
            Some(object) => self.handler.create_or_update(object).await,
            None => self.handler.delete(&namespace, &name).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn rate_limiter(base_ms: u64, max_ms: u64) -> RateLimiterConfig {
        RateLimiterConfig {
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
            max_retries: 3,
        }
    }

    fn config_map(name: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    struct StaticWatcher(std::sync::Mutex<Option<BoxStream<'static, watcher::Result<Event<ConfigMap>>>>>);

    impl StaticWatcher {
        fn new(events: Vec<Event<ConfigMap>>, keep_open: bool) -> Self {
            let events = stream::iter(events.into_iter().map(Ok)).then(|e| async move {
                tokio::time::sleep(Duration::from_millis(2)).await;
                e
            });
            let stream = if keep_open {
                events.chain(stream::pending()).boxed()
            } else {
                events.boxed()
            };
            Self(std::sync::Mutex::new(Some(stream)))
        }
    }

    impl ListWatcher<ConfigMap> for StaticWatcher {
        fn list_watch(&self) -> BoxStream<'static, watcher::Result<Event<ConfigMap>>> {
            self.0
                .lock()
                .unwrap()
                .take()
                .unwrap_or_else(|| stream::empty().boxed())
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        calls: std::sync::Mutex<Vec<String>>,
        in_flight: std::sync::Mutex<HashMap<String, usize>>,
        max_in_flight: AtomicUsize,
        delay: Duration,
        fail: bool,
    }

    impl RecordingHandler {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        async fn record(&self, call: String, key: String) -> Result<(), ControllerError> {
            {
                let mut in_flight = self.in_flight.lock().unwrap();
                let n = in_flight.entry(key.clone()).or_insert(0);
                *n += 1;
                self.max_in_flight.fetch_max(*n, Ordering::SeqCst);
                self.calls.lock().unwrap().push(call);
            }
            tokio::time::sleep(self.delay).await;
            *self.in_flight.lock().unwrap().get_mut(&key).unwrap() -= 1;
            if self.fail {
                Err(ControllerError::Timeout("failed".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl ChangeHandler<ConfigMap> for RecordingHandler {
        async fn create_or_update(&self, object: Arc<ConfigMap>) -> Result<(), ControllerError> {
            let key = key_of(object.as_ref());
            self.record(format!("update {}", key), key).await
        }

        async fn delete(&self, namespace: &str, name: &str) -> Result<(), ControllerError> {
            let key = object_key(namespace, name);
            self.record(format!("delete {}", key), key).await
        }
    }

    fn reconciler(
        handler: &Arc<RecordingHandler>,
        resync_interval: Duration,
    ) -> WorkQueueReconciler<ConfigMap, RecordingHandler> {
        WorkQueueReconciler::new(
            "test",
            handler.clone(),
            4,
            resync_interval,
            rate_limiter(1, 10),
        )
    }

    #[tokio::test]
    async fn queue_deduplicates_keys() {
        let queue = WorkQueue::new(rate_limiter(1, 10));
        queue.add("ns/a".to_string()).await;
        queue.add("ns/a".to_string()).await;
        queue.add("ns/b".to_string()).await;
        assert_eq!(2, queue.len().await);
        assert_eq!(Some("ns/a".to_string()), queue.get().await);
        // re-added while processing, handed out again only after done
        queue.add("ns/a".to_string()).await;
        assert_eq!(Some("ns/b".to_string()), queue.get().await);
        assert_eq!(0, queue.len().await);
        queue.done("ns/a").await;
        assert_eq!(Some("ns/a".to_string()), queue.get().await);
        queue.done("ns/a").await;
        queue.done("ns/b").await;
        queue.shut_down().await;
        assert_eq!(None, queue.get().await);
    }

    #[tokio::test]
    async fn queue_drains_after_shutdown() {
        let queue = WorkQueue::new(rate_limiter(1, 10));
        queue.add("ns/a".to_string()).await;
        queue.add("ns/b".to_string()).await;
        queue.shut_down().await;
        queue.add("ns/c".to_string()).await;
        assert_eq!(Some("ns/a".to_string()), queue.get().await);
        assert_eq!(Some("ns/b".to_string()), queue.get().await);
        assert_eq!(None, queue.get().await);
    }

    #[tokio::test]
    async fn exponential_backoff() {
        let queue = Arc::new(WorkQueue::new(rate_limiter(10, 40)));
        assert_eq!(Duration::from_millis(10), queue.backoff(0));
        assert_eq!(Duration::from_millis(20), queue.backoff(1));
        assert_eq!(Duration::from_millis(40), queue.backoff(2));
        assert_eq!(Duration::from_millis(40), queue.backoff(3));
        assert_eq!(Duration::from_millis(40), queue.backoff(64));

        queue.add_rate_limited("ns/a".to_string()).await;
        assert_eq!(1, queue.num_requeues("ns/a").await);
        assert_eq!(0, queue.len().await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(1, queue.len().await);
        queue.forget("ns/a").await;
        assert_eq!(0, queue.num_requeues("ns/a").await);
    }

    #[tokio::test]
    async fn waiting_worker_is_woken() {
        let queue = Arc::new(WorkQueue::new(rate_limiter(1, 10)));
        let getter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.add("ns/a".to_string()).await;
        let key = tokio::time::timeout(Duration::from_secs(1), getter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(Some("ns/a".to_string()), key);
    }

    #[tokio::test]
    async fn same_key_is_never_processed_concurrently() {
        let handler = Arc::new(RecordingHandler {
            delay: Duration::from_millis(15),
            ..Default::default()
        });
        let mut events = vec![];
        for _ in 0..10 {
            events.push(Event::Apply(config_map("a")));
            events.push(Event::Apply(config_map("b")));
        }
        let watcher = StaticWatcher::new(events, false);
        tokio::time::timeout(
            Duration::from_secs(5),
            reconciler(&handler, Duration::ZERO).run(watcher),
        )
        .await
        .unwrap();
        assert_eq!(1, handler.max_in_flight.load(Ordering::SeqCst));
        let calls = handler.calls();
        assert!(calls.contains(&"update ns/a".to_string()));
        assert!(calls.contains(&"update ns/b".to_string()));
        // coalescing keeps the number of passes below the number of events
        assert!(calls.len() < 20);
    }

    #[tokio::test]
    async fn deleted_objects_invoke_delete() {
        let handler = Arc::new(RecordingHandler::default());
        let watcher = StaticWatcher::new(
            vec![Event::Apply(config_map("a")), Event::Delete(config_map("a"))],
            false,
        );
        tokio::time::timeout(
            Duration::from_secs(5),
            reconciler(&handler, Duration::ZERO).run(watcher),
        )
        .await
        .unwrap();
        assert_eq!(Some(&"delete ns/a".to_string()), handler.calls().last());
    }

    #[tokio::test]
    async fn initial_list_is_enqueued() {
        let handler = Arc::new(RecordingHandler::default());
        let watcher = StaticWatcher::new(
            vec![
                Event::Init,
                Event::InitApply(config_map("a")),
                Event::InitApply(config_map("b")),
                Event::InitDone,
            ],
            false,
        );
        tokio::time::timeout(
            Duration::from_secs(5),
            reconciler(&handler, Duration::ZERO).run(watcher),
        )
        .await
        .unwrap();
        let mut calls = handler.calls();
        calls.sort();
        assert_eq!(vec!["update ns/a", "update ns/b"], calls);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let handler = Arc::new(RecordingHandler {
            fail: true,
            ..Default::default()
        });
        let watcher = StaticWatcher::new(vec![Event::Apply(config_map("a"))], true);
        let result = tokio::time::timeout(
            Duration::from_millis(500),
            reconciler(&handler, Duration::ZERO).run(watcher),
        )
        .await;
        assert!(result.is_err());
        // the initial attempt plus three retries
        assert_eq!(4, handler.calls().len());
    }

    #[tokio::test]
    async fn resync_enqueues_cached_objects() {
        let handler = Arc::new(RecordingHandler::default());
        let watcher = StaticWatcher::new(vec![Event::Apply(config_map("a"))], true);
        let _ = tokio::time::timeout(
            Duration::from_millis(300),
            reconciler(&handler, Duration::from_millis(40)).run(watcher),
        )
        .await;
        assert!(handler.calls().len() >= 3);
    }
}
