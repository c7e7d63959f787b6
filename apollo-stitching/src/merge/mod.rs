//! Results of delegations, as the gateway sees them.
//!
//! A subschema answers with plain JSON and a list of errors. The gateway turns
//! that into an [`ExternalValue`] tree: errors are moved onto the values they
//! blame, and every object remembers which subschema produced it (and each of
//! its fields) so that later merge passes know where to fetch missing fields from.

mod errors;
mod resolve;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use derivative::Derivative;
use indexmap::IndexMap;

pub use self::errors::MergedExecutionResult;
pub(crate) use self::errors::ReportedErrors;
pub use self::errors::merge_data_and_errors;
pub use self::errors::report_unpathed_errors_via_null;
pub(crate) use self::resolve::check_result_and_handle_errors;
pub use self::resolve::default_merged_resolver;
pub use self::resolve::resolve_external_value;
use crate::expectant_store::ListItems;
use crate::graphql::Error;
use crate::json_ext::Object;
use crate::json_ext::Path;
use crate::json_ext::Value;
use crate::receiver::ReceiverHandle;
use crate::selection::TYPENAME;
use crate::subschema::Subschema;

/// A value returned by a subschema, with errors inlined where they belong.
#[derive(Clone, Debug, Default)]
pub enum ExternalValue {
    #[default]
    Null,
    /// A scalar or enum value.
    Leaf(Value),
    List(Vec<ExternalValue>),
    Object(Box<ExternalObject>),
    /// The error to report for this value, which is `null` in the response.
    Error(Error),
}

impl ExternalValue {
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Null => ExternalValue::Null,
            Value::Array(items) => {
                ExternalValue::List(items.into_iter().map(ExternalValue::from_value).collect())
            }
            Value::Object(object) => ExternalValue::Object(Box::new(ExternalObject::from_object(object))),
            leaf => ExternalValue::Leaf(leaf),
        }
    }

    /// The JSON form of the value. Errors become `null`.
    pub fn to_value(&self) -> Value {
        match self {
            ExternalValue::Null | ExternalValue::Error(_) => Value::Null,
            ExternalValue::Leaf(value) => value.clone(),
            ExternalValue::List(items) => Value::Array(items.iter().map(ExternalValue::to_value).collect()),
            ExternalValue::Object(object) => object.to_value(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ExternalValue::Null)
    }

    pub fn as_object(&self) -> Option<&ExternalObject> {
        match self {
            ExternalValue::Object(object) => Some(object),
            _ => None,
        }
    }

    pub fn as_object_mut(&mut self) -> Option<&mut ExternalObject> {
        match self {
            ExternalValue::Object(object) => Some(object),
            _ => None,
        }
    }

    /// The value at `path`, relative to this one.
    pub fn get_path(&self, path: &Path) -> Option<&ExternalValue> {
        let mut current = self;
        for element in path.iter() {
            current = match (element, current) {
                (crate::json_ext::PathElement::Key(key), ExternalValue::Object(object)) => {
                    object.fields.get(key.as_str())?
                }
                (crate::json_ext::PathElement::Index(index), ExternalValue::List(items)) => {
                    items.get(*index)?
                }
                _ => return None,
            };
        }
        Some(current)
    }

    /// Merges `other` into this value: objects key by key, lists of the same length item
    /// by item. A `null` never replaces a known value.
    pub(crate) fn deep_merge(&mut self, other: ExternalValue) {
        match (self, other) {
            (ExternalValue::Object(target), ExternalValue::Object(source)) => {
                let source = *source;
                target.unpathed_errors.extend(source.unpathed_errors);
                for (key, value) in source.fields {
                    match target.fields.get_mut(&key) {
                        Some(existing) => existing.deep_merge(value),
                        None => {
                            target.fields.insert(key, value);
                        }
                    }
                }
            }
            (ExternalValue::List(target), ExternalValue::List(source))
                if target.len() == source.len() =>
            {
                for (existing, value) in target.iter_mut().zip(source) {
                    existing.deep_merge(value);
                }
            }
            (_, ExternalValue::Null) => {}
            (target, source) => *target = source,
        }
    }
}

impl From<Value> for ExternalValue {
    fn from(value: Value) -> Self {
        ExternalValue::from_value(value)
    }
}

impl ListItems for ExternalValue {
    fn list_items(&self) -> Option<Vec<Self>> {
        match self {
            ExternalValue::List(items) => Some(items.clone()),
            _ => None,
        }
    }
}

/// An object returned by a subschema, keyed by response key.
#[derive(Clone, Default, Derivative)]
#[derivative(Debug)]
pub struct ExternalObject {
    pub fields: IndexMap<String, ExternalValue>,
    /// The subschema the object was fetched from.
    #[derivative(Debug(format_with = "fmt_subschema"))]
    pub(crate) subschema: Option<Arc<Subschema>>,
    /// Subschemas of the fields merged in from other subschemas.
    #[derivative(Debug = "ignore")]
    pub(crate) field_subschemas: HashMap<String, Arc<Subschema>>,
    /// Errors of the delegation no field of the object can be blamed for.
    pub(crate) unpathed_errors: Vec<Error>,
    #[derivative(Debug = "ignore")]
    pub(crate) receiver: Option<ReceiverHandle>,
}

fn fmt_subschema(subschema: &Option<Arc<Subschema>>, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match subschema {
        Some(subschema) => write!(f, "Some({})", subschema.name()),
        None => write!(f, "None"),
    }
}

impl ExternalObject {
    pub fn from_object(object: Object) -> Self {
        Self {
            fields: object
                .into_iter()
                .map(|(key, value)| (key.as_str().to_string(), ExternalValue::from_value(value)))
                .collect(),
            ..Default::default()
        }
    }

    pub fn get(&self, key: &str) -> Option<&ExternalValue> {
        self.fields.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: ExternalValue) -> Option<ExternalValue> {
        self.fields.insert(key.into(), value)
    }

    /// The `__typename` selected on the object, if any.
    pub fn typename(&self) -> Option<&str> {
        match self.fields.get(TYPENAME) {
            Some(ExternalValue::Leaf(Value::String(name))) => Some(name.as_str()),
            _ => None,
        }
    }

    pub fn subschema(&self) -> Option<&Arc<Subschema>> {
        self.subschema.as_ref()
    }

    /// The subschema that produced `key`.
    pub fn field_subschema(&self, key: &str) -> Option<&Arc<Subschema>> {
        self.field_subschemas.get(key).or(self.subschema.as_ref())
    }

    pub fn unpathed_errors(&self) -> &[Error] {
        &self.unpathed_errors
    }

    pub(crate) fn is_annotated(&self) -> bool {
        self.subschema.is_some()
    }

    pub(crate) fn annotate(&mut self, subschema: Arc<Subschema>, unpathed_errors: Vec<Error>) {
        self.subschema = Some(subschema);
        self.unpathed_errors = unpathed_errors;
    }

    pub fn to_value(&self) -> Value {
        Value::Object(
            self.fields
                .iter()
                .map(|(key, value)| (key.as_str().into(), value.to_value()))
                .collect(),
        )
    }

    /// Merges the result of fetching `keys` of this object from `subschema`.
    ///
    /// A failed fetch (an error or `null`) is recorded on each of the `keys`, located at
    /// `path` joined with the key.
    pub(crate) fn merge_result(
        &mut self,
        result: ExternalValue,
        subschema: &Arc<Subschema>,
        keys: &[String],
        path: &Path,
    ) {
        match result {
            ExternalValue::Object(source) => {
                let source = *source;
                self.unpathed_errors.extend(source.unpathed_errors);
                for (key, value) in source.fields {
                    let provenance = source
                        .field_subschemas
                        .get(&key)
                        .or(source.subschema.as_ref())
                        .unwrap_or(subschema)
                        .clone();
                    self.field_subschemas.insert(key.clone(), provenance);
                    match self.fields.get_mut(&key) {
                        Some(existing) => existing.deep_merge(value),
                        None => {
                            self.fields.insert(key, value);
                        }
                    }
                }
            }
            ExternalValue::Error(error) => {
                for key in keys {
                    self.field_subschemas.insert(key.clone(), subschema.clone());
                    self.fields.insert(
                        key.clone(),
                        ExternalValue::Error(error.relocated(Some(path.with(key.as_str())))),
                    );
                }
            }
            _ => {
                for key in keys {
                    self.field_subschemas.insert(key.clone(), subschema.clone());
                    self.fields.entry(key.clone()).or_insert(ExternalValue::Null);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json_bytes::json;

    use super::*;

    #[test]
    fn deep_merge_keeps_known_values() {
        let mut target = ExternalValue::from_value(json!({ "a": { "b": 1 }, "list": [{ "x": 1 }], "c": 3 }));
        target.deep_merge(ExternalValue::from_value(
            json!({ "a": { "d": 2 }, "list": [{ "y": 2 }], "c": null }),
        ));
        assert_eq!(
            target.to_value(),
            json!({ "a": { "b": 1, "d": 2 }, "list": [{ "x": 1, "y": 2 }], "c": 3 })
        );
    }

    #[test]
    fn lists_of_different_lengths_are_replaced() {
        let mut target = ExternalValue::from_value(json!([1, 2]));
        target.deep_merge(ExternalValue::from_value(json!([3])));
        assert_eq!(target.to_value(), json!([3]));
    }

    #[test]
    fn get_path_walks_objects_and_lists() {
        let value = ExternalValue::from_value(json!({ "a": [{ "b": "found" }] }));
        assert_eq!(
            value.get_path(&Path::from("a/0/b")).map(ExternalValue::to_value),
            Some(json!("found"))
        );
        assert!(value.get_path(&Path::from("a/1")).is_none());
    }

    #[test]
    fn typename_is_read_from_fields() {
        let value = ExternalValue::from_value(json!({ "__typename": "Book", "title": "Dune" }));
        assert_eq!(value.as_object().and_then(ExternalObject::typename), Some("Book"));
    }
}
