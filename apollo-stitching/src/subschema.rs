//! Subschemas and their merge configuration.

use std::fmt;
use std::sync::Arc;

use apollo_compiler::Schema;
use apollo_compiler::ast;
use apollo_compiler::validation::Valid;
use derivative::Derivative;
use futures::future::BoxFuture;
use indexmap::IndexMap;
use serde_json_bytes::ByteString;

use crate::configuration::BatchingOptions;
use crate::configuration::MergedTypeConfiguration;
use crate::configuration::MergedTypeResolverConfiguration;
use crate::configuration::SubschemaConfiguration;
use crate::context::Context;
use crate::error::StitchingError;
use crate::executor::Executor;
use crate::executor::Subscriber;
use crate::json_ext::Object;
use crate::json_ext::Value;
use crate::local::LocalSchema;
use crate::merge::ExternalObject;
use crate::merge::ExternalValue;
use crate::resolve_info::ResolveInfo;
use crate::transform::Transform;

const INCREMENTAL_DIRECTIVES: &[(&str, &str)] = &[
    (
        "defer",
        "directive @defer(label: String, if: Boolean! = true) on FRAGMENT_SPREAD | INLINE_FRAGMENT",
    ),
    (
        "stream",
        "directive @stream(label: String, initialCount: Int = 0, if: Boolean! = true) on FIELD",
    ),
];

/// Parses and validates a schema, declaring `@defer` and `@stream` when `sdl` does not.
pub(crate) fn parse_schema(name: &str, sdl: &str) -> Result<Arc<Valid<Schema>>, StitchingError> {
    let invalid = |reason: String| StitchingError::InvalidSchema {
        name: name.to_string(),
        reason,
    };
    let document = ast::Document::parse(sdl, format!("{name}.graphql"))
        .map_err(|invalid_document| invalid(invalid_document.errors.to_string()))?;
    let mut source = sdl.to_string();
    for (directive, definition) in INCREMENTAL_DIRECTIVES {
        let declared = document.definitions.iter().any(|definition| {
            matches!(definition, ast::Definition::DirectiveDefinition(d) if d.name.as_str() == *directive)
        });
        if !declared {
            source.push('\n');
            source.push_str(definition);
        }
    }
    Schema::parse_and_validate(source, format!("{name}.graphql"))
        .map(Arc::new)
        .map_err(|with_errors| invalid(with_errors.errors.to_string()))
}

/// Identifies a subschema within one stitched schema, in registration order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubschemaId(pub(crate) usize);

impl fmt::Display for SubschemaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Builds the arguments of a merged type's root field from a known object.
pub type ArgsFn = Arc<dyn Fn(&Value) -> Object + Send + Sync>;
/// Extracts the batching key of a known object.
pub type KeyFn = Arc<dyn Fn(&Value) -> Value + Send + Sync>;
/// Builds the arguments of a merged type's root field from a batch of keys.
pub type ArgsFromKeysFn = Arc<dyn Fn(&[Value]) -> Object + Send + Sync>;
/// Maps the result list of a batched fetch back to the keys, one value per key.
pub type ValuesFromResultsFn =
    Arc<dyn Fn(Vec<ExternalValue>, &[Value]) -> Vec<ExternalValue> + Send + Sync>;

/// What a custom merged type resolver receives.
#[derive(Clone, Debug)]
pub struct MergedTypeResolverRequest {
    /// The object known so far.
    pub object: ExternalObject,
    pub context: Context,
    pub info: ResolveInfo,
    pub subschema: Arc<Subschema>,
    /// Fields to fetch, as selected on the merged type.
    pub selection_set: Vec<ast::Selection>,
}

/// Fetches the fields of a merged type from a subschema.
pub type MergedTypeResolverFn =
    Arc<dyn Fn(MergedTypeResolverRequest) -> BoxFuture<'static, ExternalValue> + Send + Sync>;

/// Settings for one field of a merged type.
#[derive(Clone, Debug, Default)]
pub struct MergedFieldConfig {
    /// Fields of the parent object this field needs, e.g. `{ price weight }`.
    pub selection_set: Option<String>,
    pub computed: bool,
    pub canonical: bool,
}

/// How the gateway fetches a merged type from one subschema.
#[derive(Clone, Default, Derivative)]
#[derivative(Debug)]
pub struct MergedTypeConfig {
    pub selection_set: Option<String>,
    pub field_name: Option<String>,
    #[derivative(Debug = "ignore")]
    pub args: Option<ArgsFn>,
    #[derivative(Debug = "ignore")]
    pub key: Option<KeyFn>,
    #[derivative(Debug = "ignore")]
    pub args_from_keys: Option<ArgsFromKeysFn>,
    #[derivative(Debug = "ignore")]
    pub values_from_results: Option<ValuesFromResultsFn>,
    #[derivative(Debug = "ignore")]
    pub resolve: Option<MergedTypeResolverFn>,
    pub fields: IndexMap<String, MergedFieldConfig>,
    pub entry_points: Vec<MergedTypeConfig>,
    pub canonical: bool,
}

impl MergedTypeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_selection_set(mut self, selection_set: impl Into<String>) -> Self {
        self.selection_set = Some(selection_set.into());
        self
    }

    pub fn with_field_name(mut self, field_name: impl Into<String>) -> Self {
        self.field_name = Some(field_name.into());
        self
    }

    pub fn with_args<F>(mut self, args: F) -> Self
    where
        F: Fn(&Value) -> Object + Send + Sync + 'static,
    {
        self.args = Some(Arc::new(args));
        self
    }

    pub fn with_key<F>(mut self, key: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        self.key = Some(Arc::new(key));
        self
    }

    pub fn with_args_from_keys<F>(mut self, args_from_keys: F) -> Self
    where
        F: Fn(&[Value]) -> Object + Send + Sync + 'static,
    {
        self.args_from_keys = Some(Arc::new(args_from_keys));
        self
    }

    pub fn with_values_from_results<F>(mut self, values_from_results: F) -> Self
    where
        F: Fn(Vec<ExternalValue>, &[Value]) -> Vec<ExternalValue> + Send + Sync + 'static,
    {
        self.values_from_results = Some(Arc::new(values_from_results));
        self
    }

    pub fn with_resolve<F>(mut self, resolve: F) -> Self
    where
        F: Fn(MergedTypeResolverRequest) -> BoxFuture<'static, ExternalValue> + Send + Sync + 'static,
    {
        self.resolve = Some(Arc::new(resolve));
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, field: MergedFieldConfig) -> Self {
        self.fields.insert(name.into(), field);
        self
    }

    /// Declares a field computed from `selection_set`.
    pub fn with_computed_field(
        self,
        name: impl Into<String>,
        selection_set: impl Into<String>,
    ) -> Self {
        self.with_field(
            name,
            MergedFieldConfig {
                selection_set: Some(selection_set.into()),
                computed: true,
                canonical: false,
            },
        )
    }

    pub fn with_entry_point(mut self, entry_point: MergedTypeConfig) -> Self {
        self.entry_points.push(entry_point);
        self
    }

    pub fn canonical(mut self) -> Self {
        self.canonical = true;
        self
    }

    /// Whether this configuration can fetch the type at all.
    pub(crate) fn has_resolver(&self) -> bool {
        self.resolve.is_some()
            || (self.field_name.is_some()
                && (self.args.is_some() || self.args_from_keys.is_some()))
    }

    fn apply_resolver_configuration(&mut self, resolver: &MergedTypeResolverConfiguration) {
        if self.field_name.is_none() {
            self.field_name = resolver.field_name.clone();
        }
        let key_field = resolver.key_field.clone();
        let key_of = move |object: &Value| match &key_field {
            Some(key_field) => object
                .as_object()
                .and_then(|object| object.get(key_field.as_str()))
                .cloned()
                .unwrap_or(Value::Null),
            None => object.clone(),
        };
        if let Some(key_arg) = resolver.key_arg.clone() {
            if self.args.is_none() {
                let key_of = key_of.clone();
                self.args = Some(Arc::new(move |object: &Value| {
                    let mut args = Object::new();
                    args.insert(ByteString::from(key_arg.as_str()), key_of(object));
                    args
                }));
            }
        }
        if let Some(keys_arg) = resolver.keys_arg.clone() {
            if self.key.is_none() {
                self.key = Some(Arc::new(key_of));
            }
            if self.args_from_keys.is_none() {
                self.args_from_keys = Some(Arc::new(move |keys: &[Value]| {
                    let mut args = Object::new();
                    args.insert(ByteString::from(keys_arg.as_str()), Value::Array(keys.to_vec()));
                    args
                }));
            }
        }
    }

    /// Applies a declarative configuration. Values already set here take precedence.
    pub fn apply_configuration(&mut self, configuration: &MergedTypeConfiguration) {
        if self.selection_set.is_none() {
            self.selection_set = configuration.selection_set.clone();
        }
        self.canonical |= configuration.canonical;
        self.apply_resolver_configuration(&configuration.resolver());
        for (name, field) in &configuration.fields {
            let entry = self.fields.entry(name.clone()).or_default();
            if entry.selection_set.is_none() {
                entry.selection_set = field.selection_set.clone();
            }
            entry.computed |= field.computed;
        }
        for entry_point in &configuration.entry_points {
            let mut config = MergedTypeConfig {
                selection_set: entry_point.selection_set.clone(),
                ..Default::default()
            };
            config.apply_resolver_configuration(&entry_point.resolver());
            self.entry_points.push(config);
        }
    }
}

/// A subschema as configured by the user.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct SubschemaConfig {
    pub(crate) name: String,
    #[derivative(Debug = "ignore")]
    pub(crate) schema: Arc<Valid<Schema>>,
    #[derivative(Debug = "ignore")]
    pub(crate) local: Option<LocalSchema>,
    #[derivative(Debug = "ignore")]
    pub(crate) executor: Option<Arc<dyn Executor>>,
    #[derivative(Debug = "ignore")]
    pub(crate) subscriber: Option<Arc<dyn Subscriber>>,
    #[derivative(Debug = "ignore")]
    pub(crate) transforms: Vec<Arc<dyn Transform>>,
    pub(crate) batch: bool,
    pub(crate) batching: BatchingOptions,
    pub(crate) merge: IndexMap<String, MergedTypeConfig>,
}

impl SubschemaConfig {
    /// A subschema defined by `sdl`, executed remotely through an [`Executor`].
    pub fn new(name: impl Into<String>, sdl: &str) -> Result<Self, StitchingError> {
        let name = name.into();
        let schema = parse_schema(&name, sdl)?;
        Ok(Self::from_schema(name, schema))
    }

    pub fn from_schema(name: impl Into<String>, schema: Arc<Valid<Schema>>) -> Self {
        Self {
            name: name.into(),
            schema,
            local: None,
            executor: None,
            subscriber: None,
            transforms: Vec::new(),
            batch: false,
            batching: BatchingOptions::default(),
            merge: IndexMap::new(),
        }
    }

    /// A subschema executed in-process.
    pub fn local(name: impl Into<String>, local: LocalSchema) -> Self {
        let mut config = Self::from_schema(name, local.schema().clone());
        config.local = Some(local);
        config
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn with_subscriber(mut self, subscriber: Arc<dyn Subscriber>) -> Self {
        self.subscriber = Some(subscriber);
        self
    }

    pub fn with_transform(mut self, transform: Arc<dyn Transform>) -> Self {
        self.transforms.push(transform);
        self
    }

    pub fn with_batching(mut self, options: BatchingOptions) -> Self {
        self.batch = true;
        self.batching = options;
        self
    }

    pub fn with_merged_type(mut self, type_name: impl Into<String>, config: MergedTypeConfig) -> Self {
        self.merge.insert(type_name.into(), config);
        self
    }

    /// Applies the declarative settings of this subschema.
    pub fn with_configuration(mut self, configuration: &SubschemaConfiguration) -> Self {
        if configuration.batch {
            self.batch = true;
            self.batching = configuration.batching.clone();
        }
        for (type_name, merged) in &configuration.merge {
            self.merge
                .entry(type_name.clone())
                .or_default()
                .apply_configuration(merged);
        }
        self
    }
}

/// A subschema of a stitched schema.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Subschema {
    pub(crate) id: SubschemaId,
    pub(crate) name: String,
    #[derivative(Debug = "ignore")]
    pub(crate) schema: Arc<Valid<Schema>>,
    #[derivative(Debug = "ignore")]
    pub(crate) transformed_schema: Arc<Valid<Schema>>,
    #[derivative(Debug = "ignore")]
    pub(crate) executor: Arc<dyn Executor>,
    #[derivative(Debug = "ignore")]
    pub(crate) subscriber: Option<Arc<dyn Subscriber>>,
    #[derivative(Debug = "ignore")]
    pub(crate) transforms: Vec<Arc<dyn Transform>>,
    pub(crate) batch: bool,
    pub(crate) batching: BatchingOptions,
    pub(crate) merge: IndexMap<String, MergedTypeConfig>,
}

impl Subschema {
    pub(crate) fn new(id: SubschemaId, config: SubschemaConfig) -> Result<Self, StitchingError> {
        let mut transformed_schema = config.schema.clone();
        for transform in &config.transforms {
            transformed_schema = transform.transform_schema(transformed_schema).map_err(|error| {
                StitchingError::InvalidSchema {
                    name: config.name.clone(),
                    reason: format!("transform '{}' failed: {error}", transform.name()),
                }
            })?;
        }
        for (type_name, merged) in &config.merge {
            if !transformed_schema.types.contains_key(type_name.as_str()) {
                return Err(StitchingError::UnknownMergedType {
                    subschema: config.name.clone(),
                    type_name: type_name.clone(),
                });
            }
            if merged.selection_set.is_some() && !merged.has_resolver() {
                return Err(StitchingError::MissingMergedTypeResolver {
                    subschema: config.name.clone(),
                    type_name: type_name.clone(),
                });
            }
        }

        let local = config
            .local
            .unwrap_or_else(|| LocalSchema::new(config.schema.clone()));
        let executor = config
            .executor
            .unwrap_or_else(|| Arc::new(local.clone()) as Arc<dyn Executor>);
        let subscriber = config
            .subscriber
            .or_else(|| Some(Arc::new(local) as Arc<dyn Subscriber>));

        Ok(Self {
            id,
            name: config.name,
            schema: config.schema,
            transformed_schema,
            executor,
            subscriber,
            transforms: config.transforms,
            batch: config.batch,
            batching: config.batching,
            merge: config.merge,
        })
    }

    pub fn id(&self) -> SubschemaId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The schema requests are sent to.
    pub fn schema(&self) -> &Arc<Valid<Schema>> {
        &self.schema
    }

    /// The schema as exposed to the gateway, after the subschema transforms.
    pub fn transformed_schema(&self) -> &Arc<Valid<Schema>> {
        &self.transformed_schema
    }

    /// Computed fields of `type_name`, which this subschema only resolves once their
    /// requirements are known.
    pub(crate) fn computed_fields(&self, type_name: &str) -> impl Iterator<Item = &str> {
        self.merge
            .get(type_name)
            .into_iter()
            .flat_map(|merged| merged.fields.iter())
            .filter(|(_, field)| field.computed)
            .map(|(name, _)| name.as_str())
    }
}
