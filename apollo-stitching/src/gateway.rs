//! The stitched schema: the composed schema clients query, answered by delegating
//! to subschemas.
//!
//! Root fields are delegated to the subschema owning them. Their results are
//! completed over [`ExternalValue`]s: each field reads its value from its parent
//! with [`default_merged_resolver`], which also pulls deferred and streamed fields
//! through the receiver of the delegation.

use std::sync::Arc;

use apollo_compiler::ExecutableDocument;
use apollo_compiler::Name;
use apollo_compiler::Node;
use apollo_compiler::Schema;
use apollo_compiler::ast;
use apollo_compiler::validation::Valid;
use futures::FutureExt;
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::future::join_all;
use futures::stream;
use itertools::Itertools;
use parking_lot::Mutex;
use tracing::Instrument;

use crate::configuration::Configuration;
use crate::context::Context;
use crate::delegate::DelegationOptions;
use crate::delegate::delegate_subscription;
use crate::delegate::delegate_to_schema;
use crate::error::StitchingError;
use crate::executor::OperationKind;
use crate::graphql::Error;
use crate::graphql::Location;
use crate::graphql::Request;
use crate::graphql::Response;
use crate::graphql::ResponseStream;
use crate::json_ext::Object;
use crate::json_ext::Path;
use crate::json_ext::Value;
use crate::local::coerce_variables;
use crate::merge::ExternalValue;
use crate::merge::default_merged_resolver;
use crate::resolve_info::OperationInfo;
use crate::resolve_info::ResolveInfo;
use crate::selection::TYPENAME;
use crate::selection::collect_fields;
use crate::selection::collect_subfields;
use crate::selection::fragments_of;
use crate::selection::is_abstract;
use crate::selection::is_leaf;
use crate::selection::response_key;
use crate::stitching_info::StitchingInfo;
use crate::subschema::Subschema;
use crate::subschema::SubschemaConfig;
use crate::subschema::SubschemaId;
use crate::subschema::parse_schema;

/// A composed schema and the subschemas answering it.
#[derive(Clone)]
pub struct StitchedSchema {
    schema: Arc<Valid<Schema>>,
    stitching_info: Arc<StitchingInfo>,
}

impl std::fmt::Debug for StitchedSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StitchedSchema")
            .field(
                "subschemas",
                &self
                    .stitching_info
                    .subschemas()
                    .iter()
                    .map(|subschema| subschema.name())
                    .join(", "),
            )
            .finish()
    }
}

#[buildstructor::buildstructor]
impl StitchedSchema {
    /// Builder methods:
    ///
    /// * `.schema(impl Into<String>)`
    ///   Required. The SDL of the composed schema.
    ///
    /// * `.subschema(SubschemaConfig)` / `.subschemas(..)`
    ///   Required. Names must be unique.
    ///
    /// * `.configuration(Configuration)`
    ///   Optional. Applied on top of the programmatic configuration of the
    ///   subschemas it names.
    #[builder(visibility = "pub")]
    fn new(
        schema: String,
        subschemas: Vec<SubschemaConfig>,
        configuration: Option<Configuration>,
    ) -> Result<Self, StitchingError> {
        let configuration = configuration.unwrap_or_default();
        configuration.validate()?;
        if let Some(unknown) = configuration
            .subschemas
            .keys()
            .find(|name| !subschemas.iter().any(|config| config.name() == name.as_str()))
        {
            return Err(StitchingError::UnknownSubschema(unknown.clone()));
        }

        let mut built: Vec<Arc<Subschema>> = Vec::with_capacity(subschemas.len());
        for (index, mut config) in subschemas.into_iter().enumerate() {
            if built.iter().any(|subschema| subschema.name() == config.name()) {
                return Err(StitchingError::DuplicateSubschema(config.name().to_string()));
            }
            if let Some(settings) = configuration.subschemas.get(config.name()) {
                config = config.with_configuration(settings);
            }
            built.push(Arc::new(Subschema::new(SubschemaId(index), config)?));
        }

        let schema = parse_schema("gateway", &schema)?;
        let stitching_info = Arc::new(StitchingInfo::new(&schema, built)?);
        tracing::debug!(
            subschemas = stitching_info.subschemas().len(),
            merged_types = stitching_info.merged_types.len(),
            "stitched schema built"
        );
        Ok(Self {
            schema,
            stitching_info,
        })
    }
}

/// A client operation, validated against the composed schema.
struct PreparedOperation {
    operation: Arc<OperationInfo>,
    kind: OperationKind,
    root_type: Name,
}

fn request_error(message: impl Into<String>) -> Response {
    Response::builder()
        .error(Error::builder().message(message).build())
        .build()
}

impl StitchedSchema {
    pub fn schema(&self) -> &Arc<Valid<Schema>> {
        &self.schema
    }

    pub fn stitching_info(&self) -> &Arc<StitchingInfo> {
        &self.stitching_info
    }

    fn prepare(&self, request: &Request) -> Result<PreparedOperation, Response> {
        let Some(query) = request.query.as_deref() else {
            return Err(request_error("Must provide query string."));
        };
        if let Err(invalid) = ExecutableDocument::parse_and_validate(&self.schema, query, "query.graphql") {
            let errors = invalid
                .errors
                .iter()
                .map(|diagnostic| {
                    let error = diagnostic.to_json();
                    Error::builder()
                        .message(error.message)
                        .locations(
                            error
                                .locations
                                .into_iter()
                                .map(|location| Location {
                                    line: location.line as u32,
                                    column: location.column as u32,
                                })
                                .collect::<Vec<_>>(),
                        )
                        .extension_code("GRAPHQL_VALIDATION_FAILED")
                        .build()
                })
                .collect::<Vec<_>>();
            return Err(Response::builder().errors(errors).build());
        }
        let document = ast::Document::parse(query, "query.graphql")
            .map_err(|invalid| request_error(invalid.errors.to_string()))?;

        let operations: Vec<&Node<ast::OperationDefinition>> = document
            .definitions
            .iter()
            .filter_map(|definition| match definition {
                ast::Definition::OperationDefinition(operation) => Some(operation),
                _ => None,
            })
            .collect();
        let operation = match request.operation_name.as_deref() {
            Some(name) => operations
                .into_iter()
                .find(|operation| operation.name.as_ref().is_some_and(|n| n.as_str() == name))
                .ok_or_else(|| request_error(format!("Unknown operation named \"{name}\".")))?,
            None if operations.len() == 1 => operations[0],
            None => {
                return Err(request_error(
                    "Must provide operation name if query contains multiple operations.",
                ));
            }
        }
        .clone();

        let kind = OperationKind::from(operation.operation_type);
        let root_type = self
            .schema
            .root_operation(operation.operation_type)
            .cloned()
            .ok_or_else(|| request_error(format!("Schema is not configured for {kind}s.")))?;
        let variables = coerce_variables(&operation, &request.variables);
        let operation = OperationInfo::new(
            self.schema.clone(),
            operation,
            fragments_of(&document),
            variables,
        )
        .with_stitching_info(self.stitching_info.clone());
        Ok(PreparedOperation {
            operation: Arc::new(operation),
            kind,
            root_type,
        })
    }

    /// The root fields selected by `prepared`, with their infos.
    fn root_fields(&self, prepared: &PreparedOperation) -> Vec<(String, Option<ResolveInfo>)> {
        let operation = &prepared.operation;
        collect_fields(
            &self.schema,
            &operation.fragments,
            &operation.variables,
            prepared.root_type.as_str(),
            &operation.operation.selection_set,
        )
        .into_iter()
        .map(|(key, field_nodes)| {
            let info = field_nodes.first().cloned().and_then(|first| {
                let definition = self
                    .schema
                    .type_field(prepared.root_type.as_str(), first.name.as_str())
                    .ok()?;
                Some(ResolveInfo {
                    field_name: first.name.clone(),
                    response_key: response_key(&first).clone(),
                    return_type: definition.ty.clone(),
                    parent_type: prepared.root_type.clone(),
                    path: Path::empty().with(key.as_str()),
                    operation: operation.clone(),
                    field_nodes,
                })
            });
            (key, info)
        })
        .collect()
    }

    /// Executes a query or a mutation.
    pub async fn execute(&self, request: Request, context: Context) -> Response {
        let prepared = match self.prepare(&request) {
            Ok(prepared) => prepared,
            Err(response) => return response,
        };
        if prepared.kind == OperationKind::Subscription {
            return request_error("Subscriptions must be executed with subscribe.");
        }
        let span = tracing::info_span!("execute", "operation.kind" = %prepared.kind);
        let completion = Completion {
            context,
            errors: Arc::new(Mutex::new(Vec::new())),
        };

        async {
            let fields = self.root_fields(&prepared);
            let results: Vec<(String, Result<Value, NullBubble>)> = match prepared.kind {
                OperationKind::Mutation => {
                    let mut results = Vec::with_capacity(fields.len());
                    for (key, info) in fields {
                        let value = self.resolve_root_field(&prepared, &completion, info).await;
                        results.push((key, value));
                    }
                    results
                }
                _ => {
                    join_all(fields.into_iter().map(|(key, info)| {
                        self.resolve_root_field(&prepared, &completion, info)
                            .map(move |value| (key, value))
                    }))
                    .await
                }
            };

            let mut data = Object::new();
            let mut bubbled = false;
            for (key, value) in results {
                match value {
                    Ok(value) => {
                        data.insert(key.as_str(), value);
                    }
                    Err(NullBubble) => bubbled = true,
                }
            }
            Response::builder()
                .data(if bubbled { Value::Null } else { Value::Object(data) })
                .errors(completion.take_errors())
                .build()
        }
        .instrument(span)
        .await
    }

    async fn resolve_root_field(
        &self,
        prepared: &PreparedOperation,
        completion: &Completion,
        info: Option<ResolveInfo>,
    ) -> Result<Value, NullBubble> {
        let Some(info) = info else {
            return Ok(Value::String(prepared.root_type.as_str().into()));
        };
        let Some(owner) = self
            .stitching_info
            .root_field_owner(prepared.kind, info.field_name.as_str())
            .cloned()
        else {
            completion.push(
                Error::builder()
                    .message(format!(
                        "No subschema provides the {} field \"{}\".",
                        prepared.kind, info.field_name
                    ))
                    .build(),
                &info.path,
            );
            return bubble(&info.return_type);
        };
        let value = delegate_to_schema(
            DelegationOptions::builder()
                .subschema(owner)
                .context(completion.context.clone())
                .info(info.clone())
                .build(),
        )
        .await;
        completion
            .clone()
            .complete_value(info.return_type.clone(), value, info)
            .await
    }

    /// Subscribes to a subscription operation. Each event of the owning subschema
    /// is completed into one response.
    pub async fn subscribe(&self, request: Request, context: Context) -> ResponseStream {
        let prepared = match self.prepare(&request) {
            Ok(prepared) => prepared,
            Err(response) => return Box::pin(stream::once(async move { response })),
        };
        if prepared.kind != OperationKind::Subscription {
            let response = request_error("Queries and mutations must be executed with execute.");
            return Box::pin(stream::once(async move { response }));
        }
        let Some((key, Some(info))) = self.root_fields(&prepared).into_iter().next() else {
            let response = request_error("Subscriptions must select one field.");
            return Box::pin(stream::once(async move { response }));
        };
        let Some(owner) = self
            .stitching_info
            .root_field_owner(prepared.kind, info.field_name.as_str())
            .cloned()
        else {
            let response = request_error(format!(
                "No subschema provides the subscription field \"{}\".",
                info.field_name
            ));
            return Box::pin(stream::once(async move { response }));
        };

        let options = DelegationOptions::builder()
            .subschema(owner)
            .context(context.clone())
            .info(info.clone())
            .build();
        let events = match delegate_subscription(options).await {
            Ok(events) => events,
            Err(error) => {
                let response = Response::builder()
                    .error(error.to_graphql_error(Some(info.path.clone())))
                    .build();
                return Box::pin(stream::once(async move { response }));
            }
        };
        Box::pin(events.then(move |value| {
            let completion = Completion {
                context: context.clone(),
                errors: Arc::new(Mutex::new(Vec::new())),
            };
            let info = info.clone();
            let key = key.clone();
            async move {
                let completed = completion
                    .clone()
                    .complete_value(info.return_type.clone(), value, info)
                    .await;
                let data = match completed {
                    Ok(value) => {
                        let mut data = Object::new();
                        data.insert(key.as_str(), value);
                        Value::Object(data)
                    }
                    Err(NullBubble) => Value::Null,
                };
                Response::builder()
                    .data(data)
                    .errors(completion.take_errors())
                    .build()
            }
        }))
    }
}

/// A null propagated to the nearest nullable parent.
struct NullBubble;

fn bubble(ty: &ast::Type) -> Result<Value, NullBubble> {
    if ty.is_non_null() {
        Err(NullBubble)
    } else {
        Ok(Value::Null)
    }
}

/// Errors collected while completing one response.
#[derive(Clone)]
struct Completion {
    context: Context,
    errors: Arc<Mutex<Vec<Error>>>,
}

impl Completion {
    fn push(&self, error: Error, path: &Path) {
        let error = if error.path.is_none() {
            error.relocated(Some(path.clone()))
        } else {
            error
        };
        self.errors.lock().push(error);
    }

    fn field_error(&self, message: String, ty: &ast::Type, path: &Path) -> Result<Value, NullBubble> {
        self.push(Error::builder().message(message).build(), path);
        bubble(ty)
    }

    fn take_errors(&self) -> Vec<Error> {
        std::mem::take(&mut *self.errors.lock())
    }

    fn complete_value(
        self,
        ty: ast::Type,
        value: ExternalValue,
        info: ResolveInfo,
    ) -> BoxFuture<'static, Result<Value, NullBubble>> {
        async move {
            let path = info.path.clone();
            let items = match value {
                ExternalValue::Error(error) => {
                    self.push(error, &path);
                    return bubble(&ty);
                }
                ExternalValue::Null if ty.is_non_null() => {
                    return self.field_error(
                        format!(
                            "Cannot return null for non-nullable field {}.{}.",
                            info.parent_type, info.field_name
                        ),
                        &ty,
                        &path,
                    );
                }
                ExternalValue::Null => return Ok(Value::Null),
                ExternalValue::List(items) if ty.is_list() => items,
                _ if ty.is_list() => {
                    return self.field_error(
                        format!("Expected a list for field {}.{}.", info.parent_type, info.field_name),
                        &ty,
                        &path,
                    );
                }
                value => return self.complete_named(ty, value, info).await,
            };

            let item_type = ty.item_type().clone();
            let completed = join_all(items.into_iter().enumerate().map(|(index, item)| {
                self.clone()
                    .complete_value(item_type.clone(), item, info.at_index(index))
            }))
            .await;
            let mut values = Vec::with_capacity(completed.len());
            for item in completed {
                match item {
                    Ok(value) => values.push(value),
                    Err(NullBubble) if !item_type.is_non_null() => values.push(Value::Null),
                    Err(NullBubble) => return bubble(&ty),
                }
            }
            Ok(Value::Array(values))
        }
        .boxed()
    }

    async fn complete_named(
        self,
        ty: ast::Type,
        value: ExternalValue,
        info: ResolveInfo,
    ) -> Result<Value, NullBubble> {
        let schema = info.schema();
        let type_name = ty.inner_named_type();
        if is_leaf(schema, type_name.as_str()) {
            return Ok(value.to_value());
        }
        let ExternalValue::Object(object) = value else {
            return self.field_error(
                format!("Expected an object for field {}.{}.", info.parent_type, info.field_name),
                &ty,
                &info.path,
            );
        };

        let runtime_type: Name = if is_abstract(schema, type_name.as_str()) {
            match object.typename().and_then(|typename| Name::new(typename).ok()) {
                Some(runtime) if schema.get_object(runtime.as_str()).is_some() => runtime,
                _ => {
                    return self.field_error(
                        format!("Abstract type \"{type_name}\" must resolve to an Object type at runtime"),
                        &ty,
                        &info.path,
                    );
                }
            }
        } else {
            type_name.clone()
        };

        let fields = collect_subfields(
            schema,
            info.fragments(),
            info.variables(),
            runtime_type.as_str(),
            &info.field_nodes,
        );
        let completed = join_all(fields.into_iter().map(|(key, field_nodes)| {
            let completion = self.clone();
            let object = &object;
            let info = &info;
            let runtime_type = &runtime_type;
            async move {
                let Some(first) = field_nodes.first() else {
                    return (key, Ok(Value::Null));
                };
                if first.name.as_str() == TYPENAME {
                    return (key, Ok(Value::String(runtime_type.as_str().into())));
                }
                let Ok(definition) = info.schema().type_field(runtime_type.as_str(), first.name.as_str()) else {
                    return (key, Ok(Value::Null));
                };
                let ty = definition.ty.clone();
                let path = info.path.with(key.as_str());
                let Some(child) = info.child(runtime_type.clone(), field_nodes, ty.clone(), path) else {
                    return (key, Ok(Value::Null));
                };
                let value = default_merged_resolver(object, &completion.context, &child).await;
                let completed = completion.complete_value(ty.clone(), value, child).await;
                let completed = match completed {
                    Err(NullBubble) if !ty.is_non_null() => Ok(Value::Null),
                    other => other,
                };
                (key, completed)
            }
        }))
        .await;

        let mut output = Object::new();
        for (key, value) in completed {
            match value {
                Ok(value) => {
                    output.insert(key.as_str(), value);
                }
                Err(NullBubble) => return bubble(&ty),
            }
        }
        Ok(Value::Object(output))
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use serde_json_bytes::ByteString;
    use serde_json_bytes::json as bjson;

    use super::*;
    use crate::configuration::SubschemaConfiguration;
    use crate::local::LocalSchema;
    use crate::subschema::MergedTypeConfig;

    const GATEWAY: &str = r#"
        type Query { user(id: ID!): User me: User! viewer: User }
        type Mutation { rename(id: ID!, name: String!): User }
        type Subscription { userRenamed: User }
        type User { id: ID! name: String karma: Int }
    "#;

    fn users() -> SubschemaConfig {
        let local = LocalSchema::parse(
            "users",
            r#"
            type Query { user(id: ID!): User me: User! viewer: User }
            type Mutation { rename(id: ID!, name: String!): User }
            type Subscription { userRenamed: User }
            type User { id: ID! name: String }
            "#,
        )
        .unwrap()
        .with_resolver("Query", "user", |_, args, _| {
            Ok(bjson!({ "id": args.get("id").cloned().unwrap_or_default(), "name": "Ada" }))
        })
        .with_resolver("Query", "me", |_, _, _| Ok(Value::Null))
        .with_resolver("Query", "viewer", |_, _, context| {
            let viewer: Option<String> = context.get("viewer.id").map_err(|error| {
                Error::builder().message(error.to_string()).build()
            })?;
            Ok(viewer.map_or(Value::Null, |id| bjson!({ "id": id, "name": "Ada" })))
        })
        .with_resolver("Mutation", "rename", |_, args, _| {
            Ok(bjson!({ "id": args.get("id").cloned().unwrap_or_default(), "name": args.get("name").cloned().unwrap_or_default() }))
        })
        .with_resolver("Subscription", "userRenamed", |_, _, _| {
            Ok(bjson!([{ "id": "1", "name": "Ada" }, { "id": "2", "name": "Grace" }]))
        });
        SubschemaConfig::local("users", local).with_merged_type(
            "User",
            MergedTypeConfig::new()
                .with_selection_set("{ id }")
                .with_field_name("user")
                .with_args(|object| {
                    let mut args = Object::new();
                    args.insert(ByteString::from("id"), object["id"].clone());
                    args
                }),
        )
    }

    fn karma() -> SubschemaConfig {
        let local = LocalSchema::parse(
            "karma",
            "type Query { karmaOf(id: ID!): User } type User { id: ID! karma: Int }",
        )
        .unwrap()
        .with_resolver("Query", "karmaOf", |_, args, _| {
            Ok(bjson!({ "id": args.get("id").cloned().unwrap_or_default(), "karma": 42 }))
        });
        SubschemaConfig::local("karma", local).with_merged_type(
            "User",
            MergedTypeConfig::new()
                .with_selection_set("{ id }")
                .with_field_name("karmaOf")
                .with_args(|object| {
                    let mut args = Object::new();
                    args.insert(ByteString::from("id"), object["id"].clone());
                    args
                }),
        )
    }

    fn stitched() -> StitchedSchema {
        StitchedSchema::builder()
            .schema(GATEWAY)
            .subschema(users())
            .subschema(karma())
            .build()
            .unwrap()
    }

    fn request(query: &str) -> Request {
        Request::builder().query(query).build()
    }

    #[test]
    fn duplicate_subschema_names_are_rejected() {
        let error = StitchedSchema::builder()
            .schema(GATEWAY)
            .subschema(users())
            .subschema(users())
            .build()
            .unwrap_err();
        assert_eq!(error, StitchingError::DuplicateSubschema("users".to_string()));
    }

    #[test]
    fn configuration_must_name_known_subschemas() {
        let mut configuration = Configuration::default();
        configuration
            .subschemas
            .insert("reviews".to_string(), SubschemaConfiguration::default());
        let error = StitchedSchema::builder()
            .schema(GATEWAY)
            .subschema(users())
            .configuration(configuration)
            .build()
            .unwrap_err();
        assert_eq!(error, StitchingError::UnknownSubschema("reviews".to_string()));
    }

    #[tokio::test]
    async fn merges_fields_of_several_subschemas() {
        let response = stitched()
            .execute(request(r#"{ user(id: "1") { __typename id name karma } }"#), Context::new())
            .await;
        assert!(response.errors.is_empty(), "{:?}", response.errors);
        assert_eq!(
            response.data,
            Some(bjson!({ "user": { "__typename": "User", "id": "1", "name": "Ada", "karma": 42 } }))
        );
    }

    #[tokio::test]
    async fn subschemas_see_the_entries_of_the_client_context() {
        let context = Context::new();
        context.insert("viewer.id", "7".to_string()).unwrap();
        let response = stitched()
            .execute(request("{ viewer { id name karma } }"), context)
            .await;
        assert!(response.errors.is_empty(), "{:?}", response.errors);
        assert_eq!(
            response.data,
            Some(bjson!({ "viewer": { "id": "7", "name": "Ada", "karma": 42 } }))
        );

        let anonymous = stitched()
            .execute(request("{ viewer { id } }"), Context::new())
            .await;
        assert_eq!(anonymous.data, Some(bjson!({ "viewer": null })));
    }

    #[tokio::test]
    async fn invalid_documents_are_rejected() {
        let response = stitched()
            .execute(request("{ user(id: 1) { nope } }"), Context::new())
            .await;
        assert_eq!(response.data, None);
        assert!(!response.errors.is_empty());
        assert_eq!(
            response.errors[0].extension_code().as_deref(),
            Some("GRAPHQL_VALIDATION_FAILED")
        );
    }

    #[tokio::test]
    async fn nulls_propagate_to_the_data_root() {
        let response = stitched()
            .execute(request(r#"{ me { id } user(id: "1") { id } }"#), Context::new())
            .await;
        assert_eq!(response.data, Some(Value::Null));
        assert_eq!(response.errors.len(), 1);
        assert_eq!(response.errors[0].path, Some(Path::from("me")));
    }

    #[tokio::test]
    async fn mutations_are_delegated() {
        let response = stitched()
            .execute(
                request(r#"mutation { rename(id: "1", name: "Grace") { name karma } }"#),
                Context::new(),
            )
            .await;
        assert_eq!(
            response.data,
            Some(bjson!({ "rename": { "name": "Grace", "karma": 42 } }))
        );
    }

    #[tokio::test]
    async fn subscriptions_deliver_one_response_per_event() {
        let responses: Vec<Response> = stitched()
            .subscribe(request("subscription { userRenamed { name karma } }"), Context::new())
            .await
            .collect()
            .await;
        let data: Vec<Value> = responses.into_iter().filter_map(|response| response.data).collect();
        assert_eq!(
            data,
            vec![
                bjson!({ "userRenamed": { "name": "Ada", "karma": 42 } }),
                bjson!({ "userRenamed": { "name": "Grace", "karma": 42 } }),
            ]
        );
    }
}
