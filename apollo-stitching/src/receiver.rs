//! Incremental delivery from a subschema.
//!
//! When a delegated request uses `@defer` or `@stream`, the subschema answers with
//! an initial payload followed by patches. The [`Receiver`] hands the initial value
//! to the gateway right away and keeps consuming the patches in the background,
//! writing them into an [`ExpectantStore`] keyed by response path. Objects of the
//! initial value carry a [`ReceiverHandle`] through which the gateway asks for the
//! fields that had not arrived yet.

use std::fmt;
use std::sync::Arc;

use futures::StreamExt;
use futures::stream;
use futures::stream::BoxStream;

use crate::delegate::DelegationContext;
use crate::error::DelegationError;
use crate::expectant_store::ExpectantStore;
use crate::graphql::IncrementalResponse;
use crate::graphql::ResponseStream;
use crate::json_ext::Path;
use crate::json_ext::PathElement;
use crate::merge::ExternalValue;
use crate::merge::check_result_and_handle_errors;
use crate::merge::merge_data_and_errors;
use crate::transform::IncrementalLabels;
use crate::transform::Transformer;

fn join_key(path: &str, key: impl fmt::Display) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

/// Response keys selected directly by `selections`, looking through inline fragments.
fn top_level_keys(selections: &[apollo_compiler::ast::Selection], keys: &mut Vec<String>) {
    for selection in selections {
        match selection {
            apollo_compiler::ast::Selection::Field(field) => {
                keys.push(crate::selection::response_key(field).to_string())
            }
            apollo_compiler::ast::Selection::InlineFragment(inline) => {
                top_level_keys(&inline.selection_set, keys)
            }
            apollo_compiler::ast::Selection::FragmentSpread(_) => {}
        }
    }
}

/// Consumes the incremental payloads of one delegation.
pub(crate) struct Receiver {
    delegation: DelegationContext,
    labels: IncrementalLabels,
    store: ExpectantStore<ExternalValue>,
}

impl fmt::Debug for Receiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("field_name", &self.delegation.field_name)
            .field("closed", &self.store.is_closed())
            .finish()
    }
}

impl Receiver {
    /// Waits for the initial payload and returns the value of the delegated field.
    ///
    /// The remaining payloads are consumed by a background task.
    pub(crate) async fn start(
        mut responses: ResponseStream,
        transformer: Transformer,
    ) -> Result<ExternalValue, DelegationError> {
        let field_name = transformer.delegation().field_name.clone();
        let mut initial = None;
        while let Some(response) = responses.next().await {
            let has_data = response
                .data
                .as_ref()
                .and_then(|data| data.get(field_name.as_str()))
                .is_some_and(|data| !data.is_null());
            if has_data || !response.errors.is_empty() || response.has_next != Some(true) {
                initial = Some(response);
                break;
            }
        }
        let Some(response) = initial else {
            return Ok(ExternalValue::Null);
        };

        let has_next = response.has_next == Some(true);
        let response = transformer.transform_result(response)?;
        let delegation = transformer.delegation().clone();
        let mut value = check_result_and_handle_errors(response, &delegation).await;
        let receiver = Arc::new(Receiver {
            delegation,
            labels: transformer.incremental_labels(),
            store: ExpectantStore::new(),
        });
        receiver.store_tree(field_name.clone(), &value);
        if has_next {
            tokio::spawn(receiver.clone().pump(responses));
        } else {
            receiver.store.close();
        }
        ReceiverHandle {
            receiver,
            path: String::new(),
        }
        .attach(&mut value, &field_name);
        Ok(value)
    }

    /// Stores `value` under `key`, and each of its fields and items under their own
    /// keys.
    fn store_tree(&self, key: String, value: &ExternalValue) {
        match value {
            ExternalValue::Object(object) => {
                for (field, child) in &object.fields {
                    self.store_tree(join_key(&key, field), child);
                }
            }
            ExternalValue::List(items) => {
                for (index, item) in items.iter().enumerate() {
                    self.store_tree(join_key(&key, index), item);
                }
            }
            _ => {}
        }
        self.store.set(key, value.clone());
    }

    async fn pump(self: Arc<Self>, mut responses: ResponseStream) {
        while let Some(response) = responses.next().await {
            let has_next = response.has_next;
            for part in response.into_incremental_parts() {
                if let Err(error) = self.apply(part) {
                    tracing::error!(%error, field = self.delegation.field_name.as_str(), "dropping incremental payload");
                }
            }
            if has_next == Some(false) {
                break;
            }
        }
        // let the continuations of the last payload run before closing
        tokio::task::yield_now().await;
        self.store.close();
        tracing::trace!(field = self.delegation.field_name.as_str(), "incremental delivery complete");
    }

    fn apply(&self, part: IncrementalResponse) -> Result<(), DelegationError> {
        let Some(path) = part.path.clone() else {
            return Ok(());
        };
        if path.get(0).and_then(PathElement::as_key) != Some(self.delegation.field_name.as_str()) {
            tracing::debug!(%path, "ignoring payload for another field");
            return Ok(());
        }
        match part.items {
            Some(_) => self.apply_items(path, part),
            None => self.apply_data(path, part),
        }
    }

    /// Merges a `@defer` payload into the object at `path`.
    fn apply_data(&self, path: Path, part: IncrementalResponse) -> Result<(), DelegationError> {
        let parent_key = path.cache_key();
        let Some(ExternalValue::Object(mut parent)) = self.store.get(&parent_key) else {
            return Err(DelegationError::ParentNotAvailable(parent_key));
        };
        let data = part
            .data
            .map(ExternalValue::from_value)
            .unwrap_or_default();
        let mut merged = merge_data_and_errors(
            data,
            part.errors,
            Some(&self.delegation.info.path),
            self.delegation.on_located_error.as_ref(),
            path.len(),
        );
        let mut keys = Vec::new();
        if let Some(selections) = part.label.as_deref().and_then(|label| self.labels.get(label)) {
            top_level_keys(selections, &mut keys);
        }
        if let ExternalValue::Object(object) = &mut merged.data {
            object.unpathed_errors.extend(merged.unpathed_errors);
            for key in &keys {
                object.fields.entry(key.clone()).or_insert(ExternalValue::Null);
            }
            keys = object.fields.keys().cloned().collect();
        }

        let located = self.delegation.info.path.join(path.skip(1));
        parent.merge_result(merged.data, &self.delegation.subschema, &keys, &located);
        for key in &keys {
            if let Some(value) = parent.fields.get(key) {
                self.store_tree(join_key(&parent_key, key), value);
            }
        }
        self.store.set(parent_key, ExternalValue::Object(parent));
        Ok(())
    }

    /// Appends the items of a `@stream` payload to the list at `path`'s parent.
    fn apply_items(&self, path: Path, part: IncrementalResponse) -> Result<(), DelegationError> {
        let (Some(list_path), Some(PathElement::Index(start))) = (path.parent(), path.last()) else {
            return Err(DelegationError::ParentNotAvailable(path.cache_key()));
        };
        let list_key = list_path.cache_key();
        let Some(ExternalValue::List(mut list)) = self.store.get(&list_key) else {
            return Err(DelegationError::ParentNotAvailable(list_key));
        };

        let position = path.len() - 1;
        for (offset, item) in part.items.unwrap_or_default().into_iter().enumerate() {
            let index = start + offset;
            let errors = part
                .errors
                .iter()
                .filter(|error| {
                    error.path.as_ref().and_then(|path| path.get(position)) == Some(&PathElement::Index(index))
                })
                .cloned()
                .collect();
            let merged = merge_data_and_errors(
                ExternalValue::from_value(item),
                errors,
                Some(&self.delegation.info.path),
                self.delegation.on_located_error.as_ref(),
                path.len(),
            );
            let mut value = merged.data;
            if let ExternalValue::Object(object) = &mut value {
                object.unpathed_errors.extend(merged.unpathed_errors);
            }
            if index >= list.len() {
                list.resize(index + 1, ExternalValue::Null);
            }
            list[index] = value.clone();
            self.store_tree(join_key(&list_key, index), &value);
        }
        self.store.set(list_key, ExternalValue::List(list));
        Ok(())
    }
}

/// Where an object of an incrementally delivered value sits in its [`Receiver`].
#[derive(Clone)]
pub struct ReceiverHandle {
    receiver: Arc<Receiver>,
    path: String,
}

impl fmt::Debug for ReceiverHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceiverHandle")
            .field("path", &self.path)
            .finish()
    }
}

impl ReceiverHandle {
    /// The field `key` of this object, waiting for it if it has not arrived yet.
    pub async fn request(&self, key: &str) -> Result<ExternalValue, DelegationError> {
        match self.receiver.store.get(&self.path) {
            Some(ExternalValue::Object(parent)) => {
                if let Some(value) = parent.fields.get(key) {
                    return Ok(value.clone());
                }
            }
            Some(_) => return Ok(ExternalValue::Null),
            None => return Err(DelegationError::ParentNotAvailable(self.path.clone())),
        }
        Ok(self.receiver.store.request(join_key(&self.path, key)).await?)
    }

    /// The streamed list `key` of this object, item by item: the items known now,
    /// then every item as it arrives, until the delivery completes.
    ///
    /// Dropping the stream stops this consumer only. A field that is not a list
    /// streams no items.
    pub async fn request_stream(&self, key: &str) -> Result<BoxStream<'static, ExternalValue>, DelegationError> {
        let known = match self.request(key).await? {
            ExternalValue::List(items) => items,
            _ => Vec::new(),
        };
        let receiver = self.receiver.clone();
        let list_key = join_key(&self.path, key);
        let arriving = stream::unfold(known.len(), move |index| {
            let item = receiver.store.request(join_key(&list_key, index));
            async move { item.await.ok().map(|item| (item, index + 1)) }
        });
        Ok(stream::iter(known).chain(arriving).boxed())
    }

    /// Gives the objects of `value`, the field `key` of this object, their own handles.
    pub fn attach(&self, value: &mut ExternalValue, key: &str) {
        self.attach_at(value, join_key(&self.path, key));
    }

    fn attach_at(&self, value: &mut ExternalValue, path: String) {
        match value {
            ExternalValue::Object(object) => {
                object.receiver = Some(ReceiverHandle {
                    receiver: self.receiver.clone(),
                    path,
                });
            }
            ExternalValue::List(items) => {
                for (index, item) in items.iter_mut().enumerate() {
                    self.attach_at(item, join_key(&path, index));
                }
            }
            _ => {}
        }
    }
}
