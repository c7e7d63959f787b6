//! JSON helpers shared by the stitching engine.
//!
//! Response data is handled as [`serde_json_bytes::Value`] throughout, the same
//! representation subschema executors return.

use std::fmt;

use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;
use serde_json_bytes::ByteString;
use serde_json_bytes::Map;
pub use serde_json_bytes::Value;

/// A JSON object.
pub type Object = Map<ByteString, Value>;

/// Ensures the value is an object, returning it or an error describing what was found.
macro_rules! ensure_object {
    ($value:expr) => {{
        match $value {
            $crate::json_ext::Value::Object(o) => Ok(o),
            other => Err(format!("expected an object, found {other}")),
        }
    }};
}

/// Removes `$key` from `$object`, checking it against the `$pattern`.
///
/// Evaluates to `Ok(None)` when the key is absent or null.
macro_rules! extract_key_value_from_object {
    ($object:expr, $key:literal, $pattern:pat => $var:ident) => {{
        match $object.remove($key) {
            Some($pattern) => Ok(Some($var)),
            None | Some($crate::json_ext::Value::Null) => Ok(None),
            Some(other) => Err(format!(
                "invalid type for key '{}': {}",
                $key,
                other
            )),
        }
    }};
    ($object:expr, $key:literal) => {{
        match $object.remove($key) {
            None | Some($crate::json_ext::Value::Null) => None,
            Some(value) => Some(value),
        }
    }};
}

pub(crate) use ensure_object;
pub(crate) use extract_key_value_from_object;

/// One segment of a response [`Path`].
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum PathElement {
    /// A list index.
    Index(usize),

    /// An object key (a response key, so possibly an alias).
    Key(String),
}

impl PathElement {
    pub fn as_key(&self) -> Option<&str> {
        match self {
            PathElement::Key(key) => Some(key.as_str()),
            PathElement::Index(_) => None,
        }
    }
}

impl fmt::Display for PathElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathElement::Index(index) => write!(f, "{index}"),
            PathElement::Key(key) => write!(f, "{key}"),
        }
    }
}

impl Serialize for PathElement {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            PathElement::Index(index) => serializer.serialize_u64(*index as u64),
            PathElement::Key(key) => serializer.serialize_str(key),
        }
    }
}

impl<'de> Deserialize<'de> for PathElement {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Index(usize),
            Key(String),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Index(index) => PathElement::Index(index),
            Raw::Key(key) => PathElement::Key(key),
        })
    }
}

impl From<&str> for PathElement {
    fn from(key: &str) -> Self {
        PathElement::Key(key.to_string())
    }
}

impl From<String> for PathElement {
    fn from(key: String) -> Self {
        PathElement::Key(key)
    }
}

impl From<usize> for PathElement {
    fn from(index: usize) -> Self {
        PathElement::Index(index)
    }
}

/// A path into response data, as found in GraphQL error `path` entries.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Path(pub Vec<PathElement>);

impl Path {
    pub fn empty() -> Path {
        Path(Vec::new())
    }

    pub fn from_slice<T: Into<PathElement> + Clone>(elements: &[T]) -> Path {
        Path(elements.iter().cloned().map(Into::into).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PathElement> {
        self.0.iter()
    }

    pub fn get(&self, index: usize) -> Option<&PathElement> {
        self.0.get(index)
    }

    pub fn last(&self) -> Option<&PathElement> {
        self.0.last()
    }

    pub fn push(&mut self, element: impl Into<PathElement>) {
        self.0.push(element.into())
    }

    /// Returns a copy of this path with `element` appended.
    pub fn with(&self, element: impl Into<PathElement>) -> Path {
        let mut path = self.clone();
        path.push(element);
        path
    }

    /// Returns a new path made of `self` followed by `other`.
    pub fn join(&self, other: impl AsRef<[PathElement]>) -> Path {
        let mut path = self.0.clone();
        path.extend(other.as_ref().iter().cloned());
        Path(path)
    }

    pub fn parent(&self) -> Option<Path> {
        if self.is_empty() {
            None
        } else {
            Some(Path(self.0[..self.0.len() - 1].to_vec()))
        }
    }

    pub fn starts_with(&self, other: &Path) -> bool {
        self.0.starts_with(&other.0)
    }

    /// The elements after the first `count` ones.
    pub fn skip(&self, count: usize) -> Path {
        Path(self.0.iter().skip(count).cloned().collect())
    }

    /// Dot-joined form used as a cache key, e.g. `myFoo.child.0.bar`.
    pub fn cache_key(&self) -> String {
        let mut key = String::new();
        for (index, element) in self.0.iter().enumerate() {
            if index > 0 {
                key.push('.');
            }
            key.push_str(&element.to_string());
        }
        key
    }
}

impl AsRef<[PathElement]> for Path {
    fn as_ref(&self) -> &[PathElement] {
        &self.0
    }
}

impl<T> From<T> for Path
where
    T: AsRef<str>,
{
    /// Parses a slash separated path such as `/foo/0/bar`. Numeric segments become indices.
    fn from(s: T) -> Self {
        Path(
            s.as_ref()
                .split('/')
                .filter(|segment| !segment.is_empty())
                .map(|segment| match segment.parse::<usize>() {
                    Ok(index) => PathElement::Index(index),
                    Err(_) => PathElement::Key(segment.to_string()),
                })
                .collect(),
        )
    }
}

impl FromIterator<PathElement> for Path {
    fn from_iter<I: IntoIterator<Item = PathElement>>(iter: I) -> Self {
        Path(iter.into_iter().collect())
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for element in self.iter() {
            write!(f, "/{element}")?;
        }
        Ok(())
    }
}

/// Extension trait for [`serde_json_bytes::Value`].
pub trait ValueExt {
    /// Deep merge `other` into `self`. Objects merge key by key, lists merge index by
    /// index, any other non-null value in `other` replaces the one in `self`.
    fn deep_merge(&mut self, other: Self);

    /// Returns the value found at `path`, if any.
    fn get_path(&self, path: &Path) -> Option<&Value>;

    /// Returns a mutable reference to the value at `path`, if any.
    fn get_path_mut(&mut self, path: &Path) -> Option<&mut Value>;

    fn is_null_or_absent(value: Option<&Self>) -> bool;
}

impl ValueExt for Value {
    fn deep_merge(&mut self, other: Self) {
        match (self, other) {
            (Value::Object(a), Value::Object(b)) => {
                for (key, value) in b.into_iter() {
                    match a.get_mut(key.as_str()) {
                        Some(existing) => existing.deep_merge(value),
                        None => {
                            a.insert(key, value);
                        }
                    }
                }
            }
            (Value::Array(a), Value::Array(mut b)) => {
                for (index, value) in b.drain(..).enumerate() {
                    match a.get_mut(index) {
                        Some(existing) => existing.deep_merge(value),
                        None => a.push(value),
                    }
                }
            }
            (_, Value::Null) => {}
            (a, b) => {
                *a = b;
            }
        }
    }

    fn get_path(&self, path: &Path) -> Option<&Value> {
        let mut current = self;
        for element in path.iter() {
            current = match (element, current) {
                (PathElement::Key(key), Value::Object(object)) => object.get(key.as_str())?,
                (PathElement::Index(index), Value::Array(array)) => array.get(*index)?,
                _ => return None,
            };
        }
        Some(current)
    }

    fn get_path_mut(&mut self, path: &Path) -> Option<&mut Value> {
        let mut current = self;
        for element in path.iter() {
            current = match (element, current) {
                (PathElement::Key(key), Value::Object(object)) => object.get_mut(key.as_str())?,
                (PathElement::Index(index), Value::Array(array)) => array.get_mut(*index)?,
                _ => return None,
            };
        }
        Some(current)
    }

    fn is_null_or_absent(value: Option<&Self>) -> bool {
        matches!(value, None | Some(Value::Null))
    }
}
