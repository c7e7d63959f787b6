//! A key/value store whose readers can wait for a value that has not arrived yet.
//!
//! The [`Receiver`](crate::receiver::Receiver) writes incremental payloads into one
//! of these, keyed by dot-joined response paths (`myFoo.child.0.bar`), while the
//! gateway reads paths in whatever order its own resolution reaches them.

use std::collections::HashMap;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::ExpectantStoreError;
use crate::json_ext::Value;

/// Values that may be lists. List items are stored under their own `key.index` keys.
pub trait ListItems: Clone {
    fn list_items(&self) -> Option<Vec<Self>>;
}

impl ListItems for Value {
    fn list_items(&self) -> Option<Vec<Self>> {
        self.as_array().cloned()
    }
}

type Waiter<T> = oneshot::Sender<Result<T, ExpectantStoreError>>;

struct Entries<T> {
    values: HashMap<String, T>,
    waiters: HashMap<String, Vec<Waiter<T>>>,
    closed: bool,
}

impl<T> Default for Entries<T> {
    fn default() -> Self {
        Self {
            values: HashMap::new(),
            waiters: HashMap::new(),
            closed: false,
        }
    }
}

pub struct ExpectantStore<T> {
    entries: Mutex<Entries<T>>,
}

impl<T> Default for ExpectantStore<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
        }
    }
}

impl<T> ExpectantStore<T>
where
    T: ListItems + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under `key`, and each list item under `key.index`, recursively.
    ///
    /// Pending requests for any of those keys are resolved. A later `set` of the same key
    /// replaces the stored value.
    pub fn set(&self, key: impl Into<String>, value: T) {
        let mut pending = vec![(key.into(), value)];
        let mut settled = Vec::new();
        {
            let mut entries = self.entries.lock();
            while let Some((key, value)) = pending.pop() {
                if let Some(items) = value.list_items() {
                    pending.extend(
                        items
                            .into_iter()
                            .enumerate()
                            .map(|(index, item)| (format!("{key}.{index}"), item)),
                    );
                }
                if let Some(waiters) = entries.waiters.remove(&key) {
                    settled.push((waiters, value.clone()));
                }
                entries.values.insert(key, value);
            }
        }
        for (waiters, value) in settled {
            for waiter in waiters {
                // the requesting side may have given up
                let _ = waiter.send(Ok(value.clone()));
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<T> {
        self.entries.lock().values.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().values.contains_key(key)
    }

    /// Returns the value stored under `key`, waiting for it if necessary.
    ///
    /// The returned future is immediately ready when the value is already known. It
    /// fails if the store is cleared before the value arrives.
    pub fn request(&self, key: impl Into<String>) -> BoxFuture<'static, Result<T, ExpectantStoreError>> {
        let key = key.into();
        let receiver = {
            let mut entries = self.entries.lock();
            if let Some(value) = entries.values.get(&key) {
                return futures::future::ready(Ok(value.clone())).boxed();
            }
            if entries.closed {
                return futures::future::ready(Err(ExpectantStoreError::NeverProvided(key)))
                    .boxed();
            }
            let (sender, receiver) = oneshot::channel();
            entries.waiters.entry(key.clone()).or_default().push(sender);
            receiver
        };
        async move {
            receiver
                .await
                .unwrap_or(Err(ExpectantStoreError::NeverProvided(key)))
        }
        .boxed()
    }

    /// Marks the store complete: no further values will arrive.
    ///
    /// Stored values stay readable. Pending requests, and later requests for keys that
    /// were never set, fail.
    pub fn close(&self) {
        let waiters = {
            let mut entries = self.entries.lock();
            entries.closed = true;
            std::mem::take(&mut entries.waiters)
        };
        for (key, waiters) in waiters {
            for waiter in waiters {
                let _ = waiter.send(Err(ExpectantStoreError::NeverProvided(key.clone())));
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.entries.lock().closed
    }

    /// Rejects every pending request and empties the store.
    pub fn clear(&self) {
        let (waiters, count) = {
            let mut entries = self.entries.lock();
            let count = entries.values.len();
            entries.values.clear();
            (std::mem::take(&mut entries.waiters), count)
        };
        tracing::trace!(
            values = count,
            pending = waiters.len(),
            "clearing expectant store"
        );
        for (key, waiters) in waiters {
            for waiter in waiters {
                let _ = waiter.send(Err(ExpectantStoreError::NeverProvided(key.clone())));
            }
        }
    }
}
