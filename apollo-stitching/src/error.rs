//! Stitching errors.
use displaydoc::Display;
use serde::Serialize;
use thiserror::Error;

pub use crate::configuration::ConfigurationError;
pub use crate::graphql::Error;
use crate::graphql::ErrorExtension;
use crate::graphql::Response;
use crate::json_ext::Path;
use crate::json_ext::Value;

/// Errors raised while talking to a subschema.
///
/// These are never returned to callers of the stitched schema as such. They are
/// converted to a GraphQL [`struct@Error`] and relocated like any other upstream error.
#[derive(Error, Display, Debug, Clone, Serialize, Eq, PartialEq)]
#[serde(untagged)]
#[ignore_extra_doc_attributes]
#[non_exhaustive]
pub enum FetchError {
    /// service '{service}' response was malformed: {reason}
    SubrequestMalformedResponse {
        /// The service that responded with the malformed response.
        service: String,

        /// The reason the serialization failed.
        reason: String,
    },

    /// fetch failed from '{service}': {reason}
    ///
    /// the executor itself failed, as opposed to a GraphQL error in its response
    SubrequestExecutionError {
        /// The service that failed.
        service: String,

        /// The reason the fetch failed.
        reason: String,
    },

    /// Batching error for '{service}': {reason}
    SubrequestBatchingError {
        /// The service for which batch processing failed.
        service: String,

        /// The reason batch processing failed.
        reason: String,
    },

    /// service '{service}' does not support subscriptions
    SubscriptionNotSupported {
        /// The service without a subscriber.
        service: String,
    },
}

impl FetchError {
    /// Convert the fetch error to a GraphQL error.
    pub fn to_graphql_error(&self, path: Option<Path>) -> Error {
        let mut value: Value = serde_json_bytes::to_value(self).unwrap_or_default();
        let mut extensions = value.as_object_mut().map(std::mem::take).unwrap_or_default();
        extensions
            .entry("code")
            .or_insert_with(|| self.extension_code().into());
        // `reason` is already part of the message
        extensions.remove("reason");

        Error::builder()
            .message(self.to_string())
            .and_path(path)
            .extensions(extensions)
            .build()
    }

    /// Convert the error to an appropriate response.
    pub fn to_response(&self) -> Response {
        Response::builder()
            .errors(vec![self.to_graphql_error(None)])
            .build()
    }
}

impl ErrorExtension for FetchError {
    fn extension_code(&self) -> String {
        match self {
            FetchError::SubrequestMalformedResponse { .. } => "SUBREQUEST_MALFORMED_RESPONSE",
            FetchError::SubrequestExecutionError { .. } => "SUBREQUEST_EXECUTION_ERROR",
            FetchError::SubrequestBatchingError { .. } => "SUBREQUEST_BATCHING_ERROR",
            FetchError::SubscriptionNotSupported { .. } => "SUBSCRIPTION_NOT_SUPPORTED",
        }
        .to_string()
    }
}

/// Errors raised while setting up or running a delegation.
///
/// Except for [`DelegationError::Fetch`], these point at a misconfigured stitched
/// schema or an upstream that broke its incremental delivery promises, and are
/// not recovered from.
#[derive(Error, Display, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DelegationError {
    /// subschema '{subschema}' has no {operation} root type
    MissingRootType {
        subschema: String,
        operation: String,
    },

    /// field '{field}' does not exist on type '{type_name}' in subschema '{subschema}'
    MissingRootField {
        subschema: String,
        type_name: String,
        field: String,
    },

    /// type '{type_name}' referenced by fragment '{fragment}' does not exist in the composed schema
    UnknownFragmentType { fragment: String, type_name: String },

    /// unable to resolve type '{0}': the composed schema does not define it
    UnresolvableType(String),

    /// invalid GraphQL document: {0}
    InvalidDocument(String),

    /// Parent with key "{0}" not available.
    ParentNotAvailable(String),

    /// delegation to subschema '{0}' requires the resolve info of the delegating field
    MissingResolveInfo(String),

    /// transform failed: {0}
    Transform(String),

    /// {0}
    Store(#[from] ExpectantStoreError),

    /// {0}
    Fetch(#[from] FetchError),
}

impl DelegationError {
    /// Convert the delegation error to a GraphQL error located at `path`.
    pub fn to_graphql_error(&self, path: Option<Path>) -> Error {
        match self {
            DelegationError::Fetch(fetch) => fetch.to_graphql_error(path),
            other => Error::builder()
                .message(other.to_string())
                .and_path(path)
                .extension_code(other.extension_code())
                .build(),
        }
    }
}

impl ErrorExtension for DelegationError {
    fn extension_code(&self) -> String {
        match self {
            DelegationError::MissingRootType { .. } => "MISSING_ROOT_TYPE".to_string(),
            DelegationError::MissingRootField { .. } => "MISSING_ROOT_FIELD".to_string(),
            DelegationError::UnknownFragmentType { .. } => "UNKNOWN_FRAGMENT_TYPE".to_string(),
            DelegationError::UnresolvableType(_) => "UNRESOLVABLE_TYPE".to_string(),
            DelegationError::InvalidDocument(_) => "INVALID_DOCUMENT".to_string(),
            DelegationError::ParentNotAvailable(_) => "PARENT_NOT_AVAILABLE".to_string(),
            DelegationError::MissingResolveInfo(_) => "MISSING_RESOLVE_INFO".to_string(),
            DelegationError::Transform(_) => "TRANSFORM_FAILED".to_string(),
            DelegationError::Store(_) => "INCREMENTAL_PAYLOAD_MISSING".to_string(),
            DelegationError::Fetch(fetch) => fetch.extension_code(),
        }
    }
}

/// Errors of the [`ExpectantStore`](crate::expectant_store::ExpectantStore).
#[derive(Error, Display, Debug, Clone, PartialEq, Eq)]
pub enum ExpectantStoreError {
    /// "{0}" requested, but never provided
    NeverProvided(String),
}

/// Errors found while building a stitched schema.
#[derive(Error, Display, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum StitchingError {
    /// invalid schema for '{name}': {reason}
    InvalidSchema { name: String, reason: String },

    /// subschema name '{0}' is used more than once
    DuplicateSubschema(String),

    /// merged type '{type_name}' is not defined by subschema '{subschema}'
    UnknownMergedType {
        subschema: String,
        type_name: String,
    },

    /// invalid selection set for '{type_name}' in subschema '{subschema}': {reason}
    InvalidSelectionSet {
        subschema: String,
        type_name: String,
        reason: String,
    },

    /// selection set for '{type_name}' in subschema '{subschema}' references unknown type '{unknown}'
    UnknownSelectionSetType {
        subschema: String,
        type_name: String,
        unknown: String,
    },

    /// merged type '{type_name}' in subschema '{subschema}' declares a selection set but no way to fetch it
    MissingMergedTypeResolver {
        subschema: String,
        type_name: String,
    },

    /// subschema '{0}' is not part of the configuration
    UnknownSubschema(String),

    /// {0}
    Configuration(#[from] ConfigurationError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_error_to_graphql_error() {
        let error = FetchError::SubrequestExecutionError {
            service: "products".to_string(),
            reason: "connection refused".to_string(),
        }
        .to_graphql_error(Some(Path::from("topProducts")));
        assert_eq!(error.message, "fetch failed from 'products': connection refused");
        assert_eq!(error.path, Some(Path::from("topProducts")));
        assert_eq!(
            error.extension_code().as_deref(),
            Some("SUBREQUEST_EXECUTION_ERROR")
        );
        assert_eq!(
            error.extensions.get("service"),
            Some(&Value::String("products".into()))
        );
    }

    #[test]
    fn store_error_message() {
        let error: DelegationError = ExpectantStoreError::NeverProvided("myFoo.bar".to_string()).into();
        assert_eq!(error.to_string(), "\"myFoo.bar\" requested, but never provided");
    }

    #[test]
    fn parent_not_available_message() {
        assert_eq!(
            DelegationError::ParentNotAvailable("myFoo.child".to_string()).to_string(),
            "Parent with key \"myFoo.child\" not available."
        );
    }
}
