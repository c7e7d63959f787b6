#![allow(missing_docs)]
use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::ByteString;
use serde_json_bytes::Map;

use crate::error::FetchError;
use crate::graphql::Error;
use crate::json_ext::Object;
use crate::json_ext::Path;
use crate::json_ext::Value;
use crate::json_ext::ensure_object;
use crate::json_ext::extract_key_value_from_object;

/// A GraphQL response.
///
/// Used both for what subschemas send back and for what the stitched schema
/// returns. Incremental responses carry `has_next` and either the legacy
/// `path`/`label`/`data` patch fields or an `incremental` array.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct Response {
    /// The label that was passed to the defer or stream directive for this patch.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub label: Option<String>,

    /// The response data.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<Value>,

    /// The path that the data should be merged at.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub path: Option<Path>,

    /// The optional graphql errors encountered.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub errors: Vec<Error>,

    /// The optional graphql extensions.
    #[serde(skip_serializing_if = "Object::is_empty", default)]
    pub extensions: Object,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub has_next: Option<bool>,

    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub incremental: Vec<IncrementalResponse>,
}

#[buildstructor::buildstructor]
impl Response {
    /// Constructor
    #[builder(visibility = "pub")]
    fn new(
        label: Option<String>,
        data: Option<Value>,
        path: Option<Path>,
        errors: Vec<Error>,
        extensions: Map<ByteString, Value>,
        has_next: Option<bool>,
        incremental: Vec<IncrementalResponse>,
    ) -> Self {
        Self {
            label,
            data,
            path,
            errors,
            extensions,
            has_next,
            incremental,
        }
    }

    /// If path is None, this is a primary response.
    pub fn is_primary(&self) -> bool {
        self.path.is_none()
    }

    pub fn append_errors(&mut self, errors: &mut Vec<Error>) {
        self.errors.append(errors)
    }

    /// Splits the response into its incremental parts.
    ///
    /// A legacy patch (`path` set on the response itself) becomes a single part, and
    /// so do the entries of the `incremental` array.
    pub fn into_incremental_parts(self) -> Vec<IncrementalResponse> {
        let mut parts = Vec::new();
        if let Some(path) = self.path {
            parts.push(IncrementalResponse {
                label: self.label,
                data: self.data,
                items: None,
                path: Some(path),
                errors: self.errors,
                extensions: self.extensions,
            });
        }
        parts.extend(self.incremental);
        parts
    }

    /// Create a [`Response`] from a subschema's JSON answer.
    ///
    /// This will return an error (identifying the faulty subschema) if the input is invalid.
    pub fn from_value(service_name: &str, value: Value) -> Result<Response, FetchError> {
        let malformed = |reason: String| FetchError::SubrequestMalformedResponse {
            service: service_name.to_string(),
            reason,
        };
        let mut object = ensure_object!(value).map_err(malformed)?;

        let data = object.remove("data");
        let errors = extract_key_value_from_object!(object, "errors", Value::Array(v) => v)
            .map_err(malformed)?
            .into_iter()
            .flatten()
            .map(|v| Error::from_value(v).map_err(malformed))
            .collect::<Result<Vec<Error>, FetchError>>()?;
        let extensions =
            extract_key_value_from_object!(object, "extensions", Value::Object(o) => o)
                .map_err(malformed)?
                .unwrap_or_default();
        let label = extract_key_value_from_object!(object, "label", Value::String(s) => s)
            .map_err(malformed)?
            .map(|s| s.as_str().to_string());
        let path = extract_key_value_from_object!(object, "path")
            .map(serde_json_bytes::from_value)
            .transpose()
            .map_err(|err| malformed(err.to_string()))?;
        let has_next = extract_key_value_from_object!(object, "hasNext", Value::Bool(b) => b)
            .map_err(malformed)?;
        let incremental = extract_key_value_from_object!(object, "incremental", Value::Array(a) => a)
            .map_err(malformed)?
            .into_iter()
            .flatten()
            .map(serde_json_bytes::from_value)
            .collect::<Result<Vec<IncrementalResponse>, _>>()
            .map_err(|err| malformed(err.to_string()))?;

        // If the data entry in the response is not present, the errors entry in the response
        // must not be empty.
        if data.is_none() && errors.is_empty() && path.is_none() && incremental.is_empty() {
            return Err(malformed(
                "graphql response without data must contain at least one error".to_string(),
            ));
        }

        Ok(Response {
            label,
            data,
            path,
            errors,
            extensions,
            has_next,
            incremental,
        })
    }
}

/// A graphql incremental response.
/// Used with `@defer` and `@stream`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct IncrementalResponse {
    /// The label that was passed to the defer or stream directive for this patch.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub label: Option<String>,

    /// The response data, for `@defer` payloads.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<Value>,

    /// The list items, for `@stream` payloads.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub items: Option<Vec<Value>>,

    /// The path that the data should be merged at.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub path: Option<Path>,

    /// The optional graphql errors encountered.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub errors: Vec<Error>,

    /// The optional graphql extensions.
    #[serde(skip_serializing_if = "Object::is_empty", default)]
    pub extensions: Object,
}

#[buildstructor::buildstructor]
impl IncrementalResponse {
    /// Constructor
    #[builder(visibility = "pub")]
    fn new(
        label: Option<String>,
        data: Option<Value>,
        items: Option<Vec<Value>>,
        path: Option<Path>,
        errors: Vec<Error>,
        extensions: Map<ByteString, Value>,
    ) -> Self {
        Self {
            label,
            data,
            items,
            path,
            errors,
            extensions,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json_bytes::json as bjson;

    use super::*;

    #[test]
    fn test_response_from_value() {
        let response = Response::from_value(
            "products",
            bjson!({
              "errors": [
                {
                  "message": "Name for character with ID 1002 could not be fetched.",
                  "locations": [{ "line": 6, "column": 7 }],
                  "path": ["hero", "heroFriends", 1, "name"]
                }
              ],
              "data": { "hero": { "name": "R2-D2" } },
              "hasNext": true
            }),
        )
        .unwrap();
        assert_eq!(response.data, Some(bjson!({ "hero": { "name": "R2-D2" } })));
        assert_eq!(response.errors.len(), 1);
        assert_eq!(
            response.errors[0].path,
            Some(Path::from("hero/heroFriends/1/name"))
        );
        assert_eq!(response.has_next, Some(true));
    }

    #[test]
    fn test_response_without_data_or_errors_is_malformed() {
        let error = Response::from_value("products", bjson!({})).unwrap_err();
        assert_eq!(
            error.to_string(),
            "service 'products' response was malformed: graphql response without data must contain at least one error"
        );
    }

    #[test]
    fn test_incremental_parts() {
        let response = Response::from_value(
            "products",
            bjson!({
                "hasNext": false,
                "incremental": [
                    { "data": { "bar": 1 }, "path": ["foo"], "label": "a" },
                    { "items": [{ "x": 1 }], "path": ["foo", "list", 2] }
                ]
            }),
        )
        .unwrap();
        let parts = response.into_incremental_parts();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].label.as_deref(), Some("a"));
        assert_eq!(parts[1].items, Some(vec![bjson!({ "x": 1 })]));
        assert_eq!(parts[1].path, Some(Path::from("foo/list/2")));
    }
}
