//! Declarative configuration of a stitched schema.
//!
//! Everything here can also be set programmatically on
//! [`SubschemaConfig`](crate::subschema::SubschemaConfig). The YAML form covers
//! the common cases: batching and key based type merging.
//!
//! ```yaml
//! subschemas:
//!   products:
//!     batch: true
//!     batching:
//!       max_batch_size: 50
//!       window: 1ms
//!     merge:
//!       Product:
//!         selection_set: "{ upc }"
//!         field_name: productsByUpcs
//!         key_field: upc
//!         keys_arg: upcs
//! ```

use std::str::FromStr;
use std::time::Duration;

use displaydoc::Display;
use indexmap::IndexMap;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error, Display, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigurationError {
    /// could not deserialize configuration: {0}
    Deserialize(String),

    /// invalid configuration for '{subschema}': {reason}
    Invalid { subschema: String, reason: String },
}

/// The configuration of a stitched schema.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct Configuration {
    /// Per subschema settings, keyed by subschema name.
    pub subschemas: IndexMap<String, SubschemaConfiguration>,
}

impl Configuration {
    /// Checks the cross-field rules serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        for (subschema, config) in &self.subschemas {
            let invalid = |reason: String| ConfigurationError::Invalid {
                subschema: subschema.clone(),
                reason,
            };
            if config.batching.max_batch_size == Some(0) {
                return Err(invalid("batching.max_batch_size must be at least 1".to_string()));
            }
            for (type_name, merged) in &config.merge {
                merged
                    .resolver()
                    .validate()
                    .map_err(|reason| invalid(format!("merge.{type_name}: {reason}")))?;
                for (index, entry_point) in merged.entry_points.iter().enumerate() {
                    entry_point.resolver().validate().map_err(|reason| {
                        invalid(format!("merge.{type_name}.entry_points[{index}]: {reason}"))
                    })?;
                    if entry_point.selection_set.is_none() {
                        return Err(invalid(format!(
                            "merge.{type_name}.entry_points[{index}]: selection_set is required"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// The JSON schema of the configuration, for editor support.
    pub fn json_schema() -> String {
        let schema = schemars::schema_for!(Configuration);
        serde_json::to_string_pretty(&schema).unwrap_or_default()
    }
}

/// Parse configuration from a string in YAML syntax
impl FromStr for Configuration {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let configuration: Configuration = serde_yaml::from_str(s)
            .map_err(|error| ConfigurationError::Deserialize(error.to_string()))?;
        configuration.validate()?;
        Ok(configuration)
    }
}

/// Settings for one subschema.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct SubschemaConfiguration {
    /// Coalesce the requests made to this subschema while answering one client request.
    pub batch: bool,

    /// Batching options, used when `batch` is enabled.
    pub batching: BatchingOptions,

    /// Type merging configuration, keyed by type name.
    pub merge: IndexMap<String, MergedTypeConfiguration>,
}

/// Options of the batching executor.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct BatchingOptions {
    /// Maximum number of requests merged into a single document.
    pub max_batch_size: Option<usize>,

    /// Extra time to wait for more requests before sending a batch. Without it a batch
    /// holds the requests made during one scheduling tick.
    #[serde(with = "humantime_serde")]
    #[schemars(with = "Option<String>", default)]
    pub window: Option<Duration>,
}

/// How the gateway fetches a merged type from a subschema.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct MergedTypeConfiguration {
    /// Fields the gateway must know before it can fetch this type from the subschema,
    /// e.g. `{ id }`.
    pub selection_set: Option<String>,

    /// Root query field returning the type.
    pub field_name: Option<String>,

    /// Field of the known object used as key. Defaults to the whole object.
    pub key_field: Option<String>,

    /// Argument receiving a single key.
    pub key_arg: Option<String>,

    /// Argument receiving the list of keys of a batch.
    pub keys_arg: Option<String>,

    /// Prefer this subschema when a field of the type is available from several.
    pub canonical: bool,

    /// Per field settings.
    pub fields: IndexMap<String, MergedFieldConfiguration>,

    /// Alternative ways of fetching the type, each with its own key requirements.
    pub entry_points: Vec<EntryPointConfiguration>,
}

impl MergedTypeConfiguration {
    pub fn resolver(&self) -> MergedTypeResolverConfiguration {
        MergedTypeResolverConfiguration {
            field_name: self.field_name.clone(),
            key_field: self.key_field.clone(),
            key_arg: self.key_arg.clone(),
            keys_arg: self.keys_arg.clone(),
        }
    }
}

/// Root field used to fetch a merged type and how its arguments are built.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MergedTypeResolverConfiguration {
    pub field_name: Option<String>,
    pub key_field: Option<String>,
    pub key_arg: Option<String>,
    pub keys_arg: Option<String>,
}

impl MergedTypeResolverConfiguration {
    fn validate(&self) -> Result<(), String> {
        match (&self.field_name, &self.key_arg, &self.keys_arg) {
            (_, Some(_), Some(_)) => Err("key_arg and keys_arg are mutually exclusive".to_string()),
            (None, Some(_), _) | (None, _, Some(_)) => {
                Err("key_arg and keys_arg require field_name".to_string())
            }
            (Some(_), None, None) => {
                Err("field_name requires one of key_arg or keys_arg".to_string())
            }
            _ => Ok(()),
        }
    }
}

/// Settings for one field of a merged type.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct MergedFieldConfiguration {
    /// Fields of the parent object this field needs from other subschemas.
    pub selection_set: Option<String>,

    /// The field is computed from `selection_set` and never proxied from this subschema
    /// before its requirements are known.
    pub computed: bool,
}

/// An alternative way of fetching a merged type.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct EntryPointConfiguration {
    /// Fields the gateway must know to use this entry point.
    pub selection_set: Option<String>,

    /// Root query field returning the type.
    pub field_name: Option<String>,

    /// Field of the known object used as key. Defaults to the whole object.
    pub key_field: Option<String>,

    /// Argument receiving a single key.
    pub key_arg: Option<String>,

    /// Argument receiving the list of keys of a batch.
    pub keys_arg: Option<String>,
}

impl EntryPointConfiguration {
    pub fn resolver(&self) -> MergedTypeResolverConfiguration {
        MergedTypeResolverConfiguration {
            field_name: self.field_name.clone(),
            key_field: self.key_field.clone(),
            key_arg: self.key_arg.clone(),
            keys_arg: self.keys_arg.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_yaml() {
        let configuration = Configuration::from_str(
            r#"
subschemas:
  products:
    batch: true
    batching:
      max_batch_size: 50
      window: 2ms
    merge:
      Product:
        selection_set: "{ upc }"
        field_name: productsByUpcs
        key_field: upc
        keys_arg: upcs
        fields:
          shippingEstimate:
            selection_set: "{ price weight }"
            computed: true
"#,
        )
        .unwrap();
        let products = &configuration.subschemas["products"];
        assert!(products.batch);
        assert_eq!(products.batching.max_batch_size, Some(50));
        assert_eq!(products.batching.window, Some(Duration::from_millis(2)));
        let product = &products.merge["Product"];
        assert_eq!(product.selection_set.as_deref(), Some("{ upc }"));
        assert_eq!(product.keys_arg.as_deref(), Some("upcs"));
        assert!(product.fields["shippingEstimate"].computed);
    }

    #[test]
    fn rejects_unknown_fields() {
        let error = Configuration::from_str("subschemas:\n  a:\n    bacth: true\n").unwrap_err();
        assert!(matches!(error, ConfigurationError::Deserialize(_)));
    }

    #[test]
    fn rejects_conflicting_key_arguments() {
        let error = Configuration::from_str(
            r#"
subschemas:
  a:
    merge:
      Foo:
        selection_set: "{ id }"
        field_name: foo
        key_arg: id
        keys_arg: ids
"#,
        )
        .unwrap_err();
        assert_eq!(
            error.to_string(),
            "invalid configuration for 'a': merge.Foo: key_arg and keys_arg are mutually exclusive"
        );
    }

    #[test]
    fn generates_json_schema() {
        let schema = Configuration::json_schema();
        assert!(schema.contains("max_batch_size"));
        assert!(schema.contains("entry_points"));
    }
}
