//! Provide a [`Context`] scoped to one request against the stitched schema.
//!
//! Every delegation made while answering a client request shares the same
//! [`Context`]. Batching executors, key loaders and the set of already reported
//! errors are keyed by it, so two client requests never coalesce.

use std::ops::Deref;
use std::ops::DerefMut;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tower::BoxError;
use uuid::Uuid;

use crate::json_ext::Value;

/// Holds [`Context`] entries.
pub type Entries = Arc<DashMap<String, Value>>;

/// Typed, non serializable request data.
pub type Extensions = http::Extensions;

/// Context for one request against the stitched schema.
#[derive(Clone, Debug)]
pub struct Context {
    id: String,
    entries: Entries,
    extensions: ExtensionsMutex,
}

impl Context {
    pub fn new() -> Self {
        Context {
            id: Uuid::new_v4().to_string(),
            entries: Default::default(),
            extensions: Default::default(),
        }
    }

    /// Unique id of this context; two clones share it.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the typed extensions of this context.
    pub fn extensions(&self) -> &ExtensionsMutex {
        &self.extensions
    }

    /// Returns the extension of type `T`, inserting `T::default()` first if there is none.
    ///
    /// `T` is expected to be a cheap handle (usually wrapping an `Arc`) since it is cloned out
    /// of the lock.
    pub(crate) fn extension_or_default<T>(&self) -> T
    where
        T: Default + Clone + Send + Sync + 'static,
    {
        self.extensions.with_lock(|mut lock| {
            if let Some(existing) = lock.get::<T>() {
                return existing.clone();
            }
            let value = T::default();
            lock.insert(value.clone());
            value
        })
    }

    pub fn get<K, V>(&self, key: K) -> Result<Option<V>, BoxError>
    where
        K: Into<String>,
        V: for<'de> serde::Deserialize<'de>,
    {
        self.entries
            .get(&key.into())
            .map(|v| serde_json_bytes::from_value(v.value().clone()))
            .transpose()
            .map_err(|e| e.into())
    }

    pub fn insert<K, V>(&self, key: K, value: V) -> Result<Option<V>, BoxError>
    where
        K: Into<String>,
        V: for<'de> serde::Deserialize<'de> + Serialize,
    {
        match serde_json_bytes::to_value(value) {
            Ok(value) => self
                .entries
                .insert(key.into(), value)
                .map(|v| serde_json_bytes::from_value(v))
                .transpose()
                .map_err(|e| e.into()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn contains_key<K>(&self, key: K) -> bool
    where
        K: Into<String>,
    {
        self.entries.contains_key(&key.into())
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// The [`Extensions`] of a [`Context`], locked for each access.
#[derive(Default, Clone, Debug)]
pub struct ExtensionsMutex {
    extensions: Arc<parking_lot::Mutex<Extensions>>,
}

impl ExtensionsMutex {
    /// Locks the extensions for interaction.
    ///
    /// The lock will be dropped once the closure completes.
    pub fn with_lock<'a, T, F: FnOnce(ExtensionsGuard<'a>) -> T>(&'a self, func: F) -> T {
        func(ExtensionsGuard {
            guard: self.extensions.lock(),
        })
    }
}

pub struct ExtensionsGuard<'a> {
    guard: parking_lot::MutexGuard<'a, Extensions>,
}

impl Deref for ExtensionsGuard<'_> {
    type Target = Extensions;

    fn deref(&self) -> &Extensions {
        &self.guard
    }
}

impl DerefMut for ExtensionsGuard<'_> {
    fn deref_mut(&mut self) -> &mut Extensions {
        &mut self.guard
    }
}
