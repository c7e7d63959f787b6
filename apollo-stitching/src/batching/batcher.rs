use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tower::BoxError;

use crate::configuration::BatchingOptions;

/// Loads a batch of keys, answering one result per key, in order.
pub(crate) type LoadFn<K, V> =
    Arc<dyn Fn(Vec<K>) -> BoxFuture<'static, Vec<Result<V, BoxError>>> + Send + Sync>;

type Waiter<K, V> = (K, oneshot::Sender<Result<V, BoxError>>);

struct Queue<K, V> {
    waiters: Vec<Waiter<K, V>>,
    scheduled: bool,
}

type SharedQueue<K, V> = Arc<Mutex<Queue<K, V>>>;

/// Collects the keys loaded during one scheduling tick (or batching window) and
/// loads them together.
///
/// The first key of a batch leads it: its own future yields until a turn passes
/// without new keys (or sleeps for the window), then drains the queue and runs the
/// load. The flush stays in the caller's task, so the keys of sibling futures
/// polled by the same task join the batch whatever the runtime flavor.
pub(crate) struct Batcher<K, V> {
    name: String,
    queue: SharedQueue<K, V>,
    options: BatchingOptions,
    load: LoadFn<K, V>,
}

impl<K, V> fmt::Debug for Batcher<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batcher")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish()
    }
}

impl<K, V> Batcher<K, V>
where
    K: Send + 'static,
    V: Send + 'static,
{
    pub(crate) fn new(name: impl Into<String>, options: BatchingOptions, load: LoadFn<K, V>) -> Self {
        Self {
            name: name.into(),
            queue: Arc::new(Mutex::new(Queue {
                waiters: Vec::new(),
                scheduled: false,
            })),
            options,
            load,
        }
    }

    pub(crate) async fn load(&self, key: K) -> Result<V, BoxError> {
        let (sender, receiver) = oneshot::channel();
        let leads = {
            let mut queue = self.queue.lock();
            queue.waiters.push((key, sender));
            !std::mem::replace(&mut queue.scheduled, true)
        };
        if leads {
            let mut lead = Lead {
                name: self.name.clone(),
                queue: Some(self.queue.clone()),
                options: self.options.clone(),
                load: self.load.clone(),
            };
            lead.wait_for_tick().await;
            lead.flush().await;
        }
        receiver
            .await
            .map_err(|_| format!("batch for '{}' was dropped", self.name))?
    }
}

/// The pending flush of a batch, owned by the future of its first key.
///
/// Dropping it before it flushed (the leading caller went away) hands the queued
/// keys to a spawned task so that the other callers still get their results.
struct Lead<K, V>
where
    K: Send + 'static,
    V: Send + 'static,
{
    name: String,
    queue: Option<SharedQueue<K, V>>,
    options: BatchingOptions,
    load: LoadFn<K, V>,
}

impl<K, V> Lead<K, V>
where
    K: Send + 'static,
    V: Send + 'static,
{
    async fn wait_for_tick(&self) {
        let Some(queue) = &self.queue else {
            return;
        };
        if let Some(window) = self.options.window {
            tokio::time::sleep(window).await;
            return;
        }
        let mut queued = 0;
        loop {
            tokio::task::yield_now().await;
            let now = queue.lock().waiters.len();
            if now == queued {
                break;
            }
            queued = now;
        }
    }

    async fn flush(&mut self) {
        if let Some(queue) = self.queue.take() {
            run(self.name.clone(), drain(&queue), self.options.clone(), self.load.clone()).await;
        }
    }
}

impl<K, V> Drop for Lead<K, V>
where
    K: Send + 'static,
    V: Send + 'static,
{
    fn drop(&mut self) {
        let Some(queue) = self.queue.take() else {
            return;
        };
        let waiters = drain(&queue);
        if waiters.is_empty() {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(run(self.name.clone(), waiters, self.options.clone(), self.load.clone()));
        }
    }
}

fn drain<K, V>(queue: &SharedQueue<K, V>) -> Vec<Waiter<K, V>> {
    let mut queue = queue.lock();
    queue.scheduled = false;
    std::mem::take(&mut queue.waiters)
}

async fn run<K, V>(name: String, waiters: Vec<Waiter<K, V>>, options: BatchingOptions, load: LoadFn<K, V>)
where
    K: Send + 'static,
    V: Send + 'static,
{
    let size = options.max_batch_size.unwrap_or(usize::MAX).max(1);
    let mut chunks = Vec::new();
    let mut waiters = waiters.into_iter().peekable();
    while waiters.peek().is_some() {
        chunks.push(waiters.by_ref().take(size).collect::<Vec<_>>());
    }
    tracing::debug!(batcher = %name, batch.count = chunks.len(), "flushing batches");

    join_all(chunks.into_iter().map(|chunk| {
        let load = load.clone();
        let name = name.clone();
        async move {
            let (keys, senders): (Vec<K>, Vec<_>) = chunk.into_iter().unzip();
            let expected = keys.len();
            tracing::debug!(batcher = %name, batch.size = expected, "loading batch");
            let mut results = load(keys).await.into_iter();
            for sender in senders {
                let result = results.next().unwrap_or_else(|| {
                    Err(format!("batch for '{name}' answered fewer than {expected} results").into())
                });
                // the caller may have gone away
                let _ = sender.send(result);
            }
        }
    }))
    .await;
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use futures::FutureExt;

    use super::*;

    fn doubling(calls: Arc<AtomicUsize>, sizes: Arc<Mutex<Vec<usize>>>) -> LoadFn<usize, usize> {
        Arc::new(move |keys: Vec<usize>| {
            calls.fetch_add(1, Ordering::SeqCst);
            sizes.lock().push(keys.len());
            async move { keys.into_iter().map(|key| Ok(key * 2)).collect() }.boxed()
        })
    }

    #[tokio::test]
    async fn coalesces_keys_of_one_tick() {
        let calls = Arc::new(AtomicUsize::new(0));
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let batcher = Batcher::new("test", BatchingOptions::default(), doubling(calls.clone(), sizes));
        let results = join_all((0..5).map(|key| batcher.load(key))).await;
        let results: Vec<usize> = results.into_iter().map(Result::unwrap).collect();
        assert_eq!(results, vec![0, 2, 4, 6, 8]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        batcher.load(10).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn splits_batches_larger_than_the_maximum() {
        let calls = Arc::new(AtomicUsize::new(0));
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let options = BatchingOptions {
            max_batch_size: Some(2),
            window: Some(Duration::from_millis(1)),
        };
        let batcher = Batcher::new("test", options, doubling(calls.clone(), sizes.clone()));
        let results = join_all((0..5).map(|key| batcher.load(key))).await;
        assert!(results.iter().all(Result::is_ok));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(*sizes.lock(), vec![2, 2, 1]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn coalesces_keys_of_one_tick_on_worker_threads() {
        for _ in 0..50 {
            let calls = Arc::new(AtomicUsize::new(0));
            let sizes = Arc::new(Mutex::new(Vec::new()));
            let batcher = Batcher::new("test", BatchingOptions::default(), doubling(calls.clone(), sizes.clone()));
            let results = join_all((0..5).map(|key| batcher.load(key))).await;
            assert!(results.iter().all(Result::is_ok));
            assert_eq!(calls.load(Ordering::SeqCst), 1);
            assert_eq!(*sizes.lock(), vec![5]);
        }
    }

    #[tokio::test]
    async fn keys_arriving_one_turn_late_join_the_batch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let batcher = Batcher::new("test", BatchingOptions::default(), doubling(calls.clone(), sizes.clone()));
        let results = join_all((0..4).map(|key| {
            let batcher = &batcher;
            async move {
                if key > 0 {
                    tokio::task::yield_now().await;
                }
                batcher.load(key).await
            }
        }))
        .await;
        assert!(results.iter().all(Result::is_ok));
        assert_eq!(*sizes.lock(), vec![4]);
    }

    #[tokio::test]
    async fn queued_keys_are_loaded_when_the_first_caller_goes_away() {
        let calls = Arc::new(AtomicUsize::new(0));
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let batcher = Batcher::new("test", BatchingOptions::default(), doubling(calls.clone(), sizes.clone()));
        let mut first = batcher.load(1).boxed();
        assert!(futures::poll!(&mut first).is_pending());
        let mut second = batcher.load(2).boxed();
        assert!(futures::poll!(&mut second).is_pending());
        drop(first);

        assert_eq!(second.await.unwrap(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*sizes.lock(), vec![2]);
    }
}
