use derivative::Derivative;
use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::ByteString;
use serde_json_bytes::Map as JsonMap;
use serde_json_bytes::Value;

use crate::json_ext::Object;

/// A client request against a [`StitchedSchema`](crate::StitchedSchema).
///
/// The document is validated against the composed schema, never against a
/// subschema: each delegation builds its own request from the selected operation.
#[derive(Clone, Derivative, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
#[derivative(Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct Request {
    /// The document, possibly holding several operations and fragments.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub query: Option<String>,

    /// Which operation of `query` to execute. Required when it holds more than one.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub operation_name: Option<String>,

    /// Values of the operation's variables. Missing ones take their declared
    /// default, and delegations receive the coerced set.
    #[serde(
        skip_serializing_if = "Object::is_empty",
        default,
        deserialize_with = "null_as_default"
    )]
    pub variables: Object,

    /// Client extensions. They stay on the gateway and are not sent to subschemas.
    #[serde(skip_serializing_if = "Object::is_empty", default)]
    pub extensions: Object,
}

// clients commonly send `"variables": null`
fn null_as_default<'de, D, T: Default + Deserialize<'de>>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

#[buildstructor::buildstructor]
impl Request {
    #[builder(visibility = "pub")]
    fn new(
        query: Option<String>,
        operation_name: Option<String>,
        // the map type itself, so that buildstructor generates `.variable(k, v)`
        variables: JsonMap<ByteString, Value>,
        extensions: JsonMap<ByteString, Value>,
    ) -> Self {
        Self {
            query,
            operation_name,
            variables,
            extensions,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn reads_a_client_payload() {
        let request: Request = serde_json::from_value(json!({
            "query": "query A($id: ID!) { user(id: $id) { name } } query B { me { name } }",
            "operationName": "A",
            "variables": { "id": "1" },
        }))
        .unwrap();
        assert_eq!(
            request,
            Request::builder()
                .query("query A($id: ID!) { user(id: $id) { name } } query B { me { name } }")
                .operation_name("A")
                .variable("id", "1")
                .build()
        );
        assert!(request.extensions.is_empty());
    }

    #[test]
    fn null_variables_are_empty() {
        let request: Request =
            serde_json::from_value(json!({ "query": "{ me { name } }", "variables": null })).unwrap();
        assert!(request.variables.is_empty());
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({ "query": "{ me { name } }" })
        );
    }
}
