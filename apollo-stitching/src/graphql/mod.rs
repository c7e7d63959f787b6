//! Types related to GraphQL requests, responses, etc.

mod request;
mod response;

use std::fmt;
use std::pin::Pin;

use futures::Stream;
pub use request::Request;
pub use response::IncrementalResponse;
pub use response::Response;
use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::ByteString;
use serde_json_bytes::Map as JsonMap;
use serde_json_bytes::Value;
use uuid::Uuid;

use crate::json_ext::Object;
use crate::json_ext::Path;
use crate::json_ext::ensure_object;
use crate::json_ext::extract_key_value_from_object;

/// An asynchronous [`Stream`] of GraphQL [`Response`]s.
///
/// A subschema answering a document that uses `@defer` or `@stream` sends an
/// initial response followed by incremental ones. A subscription sends one
/// response per event.
pub type ResponseStream = Pin<Box<dyn Stream<Item = Response> + Send>>;

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
#[serde(rename_all = "camelCase")]
/// The error location
pub struct Location {
    /// The line number
    pub line: u32,
    /// The column number
    pub column: u32,
}

/// A [GraphQL error](https://spec.graphql.org/October2021/#sec-Errors)
/// as may be found in the `errors` field of a GraphQL [`Response`].
///
/// Every error carries an identifier which survives cloning and relocation. The
/// stitching engine uses it to report an error shared by several merged
/// objects only once.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
#[non_exhaustive]
pub struct Error {
    /// The error message.
    pub message: String,

    /// The locations of the error in the GraphQL document of the originating request.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<Location>,

    /// If this is a field error, the JSON path to that field in [`Response::data`]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<Path>,

    /// The optional GraphQL extensions for this error.
    #[serde(skip_serializing_if = "Object::is_empty")]
    pub extensions: Object,

    #[serde(skip_serializing)]
    apollo_id: Uuid,
}

impl Default for Error {
    fn default() -> Self {
        Self {
            message: String::new(),
            locations: Vec::new(),
            path: None,
            extensions: Object::new(),
            apollo_id: Uuid::new_v4(),
        }
    }
}

#[buildstructor::buildstructor]
impl Error {
    /// Returns a builder that builds a GraphQL [`Error`] from its components.
    ///
    /// Builder methods:
    ///
    /// * `.message(impl Into<`[`String`]`>)`
    ///   Required.
    ///
    /// * `.location(impl Into<`[`Location`]`>)` / `.locations(..)`
    ///   Optional.
    ///
    /// * `.path(impl Into<`[`Path`]`>)`
    ///   Optional.
    ///
    /// * `.extension(impl Into<`[`ByteString`]`>, impl Into<`[`Value`]`>)` / `.extensions(..)`
    ///   Optional.
    ///
    /// * `.extension_code(impl Into<`[`String`]`>)`
    ///   Optional. Sets `extensions.code` unless it is already present.
    ///
    /// * `.apollo_id(impl Into<`[`Uuid`]`>)`
    ///   Optional. Generated when absent.
    #[builder(visibility = "pub")]
    fn new(
        message: String,
        locations: Vec<Location>,
        path: Option<Path>,
        extension_code: Option<String>,
        // Skip the `Object` type alias in order to use buildstructor's map special-casing
        mut extensions: JsonMap<ByteString, Value>,
        apollo_id: Option<Uuid>,
    ) -> Self {
        if let Some(code) = extension_code {
            extensions
                .entry("code")
                .or_insert(Value::String(ByteString::from(code)));
        }
        Self {
            message,
            locations,
            path,
            extensions,
            apollo_id: apollo_id.unwrap_or_else(Uuid::new_v4),
        }
    }

    /// Parses an entry of a subschema response's `errors` array.
    pub(crate) fn from_value(value: Value) -> Result<Error, String> {
        let mut object = ensure_object!(value)?;

        let extensions =
            extract_key_value_from_object!(object, "extensions", Value::Object(o) => o)?
                .unwrap_or_default();
        let message = extract_key_value_from_object!(object, "message", Value::String(s) => s)?
            .map(|s| s.as_str().to_string())
            .ok_or_else(|| "missing required `message` property within error".to_string())?;
        let locations = extract_key_value_from_object!(object, "locations")
            .map(serde_json_bytes::from_value)
            .transpose()
            .map_err(|err| format!("invalid `locations` within error: {err}"))?
            .unwrap_or_default();
        let path = extract_key_value_from_object!(object, "path")
            .map(serde_json_bytes::from_value)
            .transpose()
            .map_err(|err| format!("invalid `path` within error: {err}"))?;

        Ok(Self::new(message, locations, path, None, extensions, None))
    }

    /// Extract the error code from [`Error::extensions`] as a String if it is set.
    pub fn extension_code(&self) -> Option<String> {
        self.extensions.get("code").and_then(|c| match c {
            Value::String(s) => Some(s.as_str().to_owned()),
            Value::Number(n) => Some(n.to_string()),
            Value::Null | Value::Array(_) | Value::Object(_) | Value::Bool(_) => None,
        })
    }

    /// Retrieve the internal unique ID for this error
    pub fn apollo_id(&self) -> Uuid {
        self.apollo_id
    }

    /// Returns a duplicate of the error where [`self.apollo_id`][Self::apollo_id] is now the given ID
    pub fn with_apollo_id(&self, id: Uuid) -> Self {
        let mut new_err = self.clone();
        new_err.apollo_id = id;
        new_err
    }

    /// Returns the same error (same identity) located at `path`.
    pub fn relocated(&self, path: Option<Path>) -> Self {
        let mut new_err = self.clone();
        new_err.path = path;
        new_err
    }

    #[cfg(test)]
    /// Returns a duplicate of the error where [`self.apollo_id`] is `Uuid::nil()`. Used for
    /// comparing errors in tests where you cannot control the randomly generated Uuid
    pub fn with_null_id(&self) -> Self {
        self.with_apollo_id(Uuid::nil())
    }
}

/// Displays (only) the error message.
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.message.fmt(f)
    }
}

/// Trait used to get extension type from an error
pub(crate) trait ErrorExtension
where
    Self: Sized,
{
    fn extension_code(&self) -> String;
}

#[cfg(test)]
mod tests {
    use serde_json_bytes::json as bjson;

    use super::*;

    #[test]
    fn builder_sets_code_and_identity() {
        let error = Error::builder()
            .message("boom")
            .path(Path::from("a/0/b"))
            .extension_code("SOME_CODE")
            .build();
        assert_eq!(error.extension_code().as_deref(), Some("SOME_CODE"));
        let moved = error.relocated(Some(Path::from("x")));
        assert_eq!(moved.apollo_id(), error.apollo_id());
        assert_eq!(moved.path, Some(Path::from("x")));
        assert_ne!(Error::builder().message("boom").build().apollo_id(), error.apollo_id());
    }

    #[test]
    fn error_from_value() {
        let error = Error::from_value(bjson!({
            "message": "Name for character with ID 1002 could not be fetched.",
            "locations": [{ "line": 6, "column": 7 }],
            "path": ["hero", "heroFriends", 1, "name"],
            "extensions": { "error-extension": 5 }
        }))
        .unwrap();
        assert_eq!(
            error.with_null_id(),
            Error::builder()
                .message("Name for character with ID 1002 could not be fetched.")
                .location(Location { line: 6, column: 7 })
                .path(Path::from("hero/heroFriends/1/name"))
                .extension("error-extension", 5)
                .build()
                .with_null_id()
        );
    }

    #[test]
    fn error_without_message_is_rejected() {
        assert!(Error::from_value(bjson!({ "path": ["a"] })).is_err());
    }
}
