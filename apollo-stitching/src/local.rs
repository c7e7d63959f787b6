//! In-process execution of a GraphQL document against a local schema.
//!
//! [`LocalSchema`] is the executor used for subschemas that do not bring their
//! own. Root fields are answered by resolvers registered per `(type, field)`;
//! every other field reads the property of the same name on its parent object,
//! unless a resolver is registered for it too.

use std::collections::HashMap;
use std::sync::Arc;

use apollo_compiler::Schema;
use apollo_compiler::ast;
use apollo_compiler::validation::Valid;
use async_trait::async_trait;
use futures::stream;
use tower::BoxError;

use crate::context::Context;
use crate::error::StitchingError;
use crate::executor::ExecutionRequest;
use crate::executor::Executor;
use crate::executor::OperationKind;
use crate::executor::Subscriber;
use crate::graphql::Error;
use crate::graphql::Response;
use crate::graphql::ResponseStream;
use crate::json_ext::Object;
use crate::json_ext::Path;
use crate::json_ext::Value;
use crate::selection::Fragments;
use crate::selection::TYPENAME;
use crate::selection::collect_fields;
use crate::selection::fragments_of;
use crate::selection::is_abstract;
use crate::selection::is_leaf;
use crate::selection::value_to_json;
use crate::subschema::parse_schema;

/// Resolves one field: `(parent, arguments, context) -> value`.
pub type FieldResolver =
    Arc<dyn Fn(&Value, &Object, &Context) -> Result<Value, Error> + Send + Sync>;

/// A schema executed in-process.
#[derive(Clone)]
pub struct LocalSchema {
    schema: Arc<Valid<Schema>>,
    resolvers: HashMap<(String, String), FieldResolver>,
}

/// A null propagated to the nearest nullable parent.
struct NullBubble;

impl LocalSchema {
    pub fn new(schema: Arc<Valid<Schema>>) -> Self {
        Self {
            schema,
            resolvers: HashMap::new(),
        }
    }

    /// Parses and validates `sdl`.
    pub fn parse(name: &str, sdl: &str) -> Result<Self, StitchingError> {
        Ok(Self::new(parse_schema(name, sdl)?))
    }

    pub fn schema(&self) -> &Arc<Valid<Schema>> {
        &self.schema
    }

    /// Registers the resolver of `type_name.field_name`.
    pub fn with_resolver<F>(mut self, type_name: &str, field_name: &str, resolver: F) -> Self
    where
        F: Fn(&Value, &Object, &Context) -> Result<Value, Error> + Send + Sync + 'static,
    {
        self.resolvers.insert(
            (type_name.to_string(), field_name.to_string()),
            Arc::new(resolver),
        );
        self
    }

    /// Executes `request` synchronously.
    pub fn execute_sync(&self, request: &ExecutionRequest) -> Response {
        let Some(operation) = request.operation() else {
            return error_response("no operation found in the document");
        };
        let kind = OperationKind::from(operation.operation_type);
        let Some(root_type) = self.schema.root_operation(operation.operation_type) else {
            return error_response(&format!("schema has no {kind} root type"));
        };
        let execution = Execution {
            schema: &self.schema,
            resolvers: &self.resolvers,
            fragments: fragments_of(&request.document),
            variables: coerce_variables(operation, &request.variables),
            context: &request.context,
            errors: Vec::new(),
        };
        execution.run(root_type.as_str(), &operation.selection_set, &Value::Null)
    }
}

fn error_response(message: &str) -> Response {
    Response::builder()
        .error(Error::builder().message(message).build())
        .build()
}

/// Applies the defaults of the operation's variable definitions.
pub(crate) fn coerce_variables(operation: &ast::OperationDefinition, provided: &Object) -> Object {
    let mut variables = provided.clone();
    for definition in &operation.variables {
        if variables.contains_key(definition.name.as_str()) {
            continue;
        }
        if let Some(default) = &definition.default_value {
            variables.insert(
                definition.name.as_str(),
                value_to_json(default, &Object::new()),
            );
        }
    }
    variables
}

struct Execution<'a> {
    schema: &'a Schema,
    resolvers: &'a HashMap<(String, String), FieldResolver>,
    fragments: Fragments,
    variables: Object,
    context: &'a Context,
    errors: Vec<Error>,
}

impl Execution<'_> {
    fn run(mut self, root_type: &str, selections: &[ast::Selection], root: &Value) -> Response {
        let data = match self.execute_selection_set(root_type, selections, root, &Path::empty()) {
            Ok(data) => Value::Object(data),
            Err(NullBubble) => Value::Null,
        };
        Response::builder()
            .data(data)
            .errors(self.errors)
            .build()
    }

    fn execute_selection_set(
        &mut self,
        type_name: &str,
        selections: &[ast::Selection],
        parent: &Value,
        path: &Path,
    ) -> Result<Object, NullBubble> {
        let fields = collect_fields(
            self.schema,
            &self.fragments,
            &self.variables,
            type_name,
            selections,
        );
        let mut output = Object::new();
        for (response_key, field_nodes) in fields {
            let field = &field_nodes[0];
            let field_path = path.with(response_key.as_str());
            if field.name.as_str() == TYPENAME {
                output.insert(response_key, Value::String(type_name.into()));
                continue;
            }
            let Ok(definition) = self.schema.type_field(type_name, field.name.as_str()) else {
                self.errors.push(
                    Error::builder()
                        .message(format!(
                            "Cannot query field \"{}\" on type \"{type_name}\".",
                            field.name
                        ))
                        .path(field_path)
                        .build(),
                );
                output.insert(response_key, Value::Null);
                continue;
            };
            let ty = definition.ty.clone();
            let arguments = self.arguments(field, &definition.arguments);
            let resolved = match self
                .resolvers
                .get(&(type_name.to_string(), field.name.to_string()))
            {
                Some(resolver) => resolver(parent, &arguments, self.context),
                None => Ok(parent
                    .as_object()
                    .and_then(|object| object.get(field.name.as_str()))
                    .cloned()
                    .unwrap_or(Value::Null)),
            };
            let completed = match resolved {
                Ok(value) => {
                    let subselections: Vec<ast::Selection> = field_nodes
                        .iter()
                        .flat_map(|node| node.selection_set.iter().cloned())
                        .collect();
                    self.complete_value(&ty, &subselections, value, &field_path)
                }
                Err(mut error) => {
                    if error.path.is_none() {
                        error.path = Some(field_path.clone());
                    }
                    self.errors.push(error);
                    if ty.is_non_null() {
                        Err(NullBubble)
                    } else {
                        Ok(Value::Null)
                    }
                }
            };
            match completed {
                Ok(value) => {
                    output.insert(response_key, value);
                }
                Err(NullBubble) if !ty.is_non_null() => {
                    output.insert(response_key, Value::Null);
                }
                Err(NullBubble) => return Err(NullBubble),
            }
        }
        Ok(output)
    }

    fn arguments(
        &self,
        field: &ast::Field,
        definitions: &[apollo_compiler::Node<ast::InputValueDefinition>],
    ) -> Object {
        let mut arguments = Object::new();
        for definition in definitions {
            let provided = field
                .arguments
                .iter()
                .find(|argument| argument.name == definition.name);
            match provided {
                Some(argument) => {
                    if let ast::Value::Variable(name) = argument.value.as_ref() {
                        if !self.variables.contains_key(name.as_str()) {
                            continue;
                        }
                    }
                    arguments.insert(
                        definition.name.as_str(),
                        value_to_json(&argument.value, &self.variables),
                    );
                }
                None => {
                    if let Some(default) = &definition.default_value {
                        arguments.insert(
                            definition.name.as_str(),
                            value_to_json(default, &Object::new()),
                        );
                    }
                }
            }
        }
        arguments
    }

    fn complete_value(
        &mut self,
        ty: &ast::Type,
        selections: &[ast::Selection],
        value: Value,
        path: &Path,
    ) -> Result<Value, NullBubble> {
        if value.is_null() {
            if ty.is_non_null() {
                self.errors.push(
                    Error::builder()
                        .message(format!(
                            "Cannot return null for non-nullable field at {path}."
                        ))
                        .path(path.clone())
                        .build(),
                );
                return Err(NullBubble);
            }
            return Ok(Value::Null);
        }

        if ty.is_list() {
            let Value::Array(items) = value else {
                return self.field_error("Expected a list", ty, path);
            };
            let item_type = ty.item_type();
            let mut completed = Vec::with_capacity(items.len());
            for (index, item) in items.into_iter().enumerate() {
                match self.complete_value(item_type, selections, item, &path.with(index)) {
                    Ok(value) => completed.push(value),
                    Err(NullBubble) if !item_type.is_non_null() => completed.push(Value::Null),
                    Err(NullBubble) => return self.bubble(ty),
                }
            }
            return Ok(Value::Array(completed));
        }

        let type_name = ty.inner_named_type().as_str();
        if is_leaf(self.schema, type_name) {
            return Ok(value);
        }

        let runtime_type = if is_abstract(self.schema, type_name) {
            match value
                .as_object()
                .and_then(|object| object.get(TYPENAME))
                .and_then(|typename| typename.as_str())
            {
                Some(runtime) => runtime.to_string(),
                None => {
                    return self.field_error(
                        &format!(
                            "Abstract type \"{type_name}\" must resolve to an Object type at runtime"
                        ),
                        ty,
                        path,
                    );
                }
            }
        } else {
            type_name.to_string()
        };
        match self.execute_selection_set(&runtime_type, selections, &value, path) {
            Ok(object) => Ok(Value::Object(object)),
            Err(NullBubble) => self.bubble(ty),
        }
    }

    fn field_error(
        &mut self,
        message: &str,
        ty: &ast::Type,
        path: &Path,
    ) -> Result<Value, NullBubble> {
        self.errors.push(
            Error::builder()
                .message(message)
                .path(path.clone())
                .build(),
        );
        self.bubble(ty)
    }

    fn bubble(&self, ty: &ast::Type) -> Result<Value, NullBubble> {
        if ty.is_non_null() {
            Err(NullBubble)
        } else {
            Ok(Value::Null)
        }
    }
}

#[async_trait]
impl Executor for LocalSchema {
    async fn execute(&self, request: ExecutionRequest) -> Result<Response, BoxError> {
        Ok(self.execute_sync(&request))
    }
}

/// Subscription root resolvers return the list of events to deliver.
#[async_trait]
impl Subscriber for LocalSchema {
    async fn subscribe(&self, request: ExecutionRequest) -> Result<ResponseStream, BoxError> {
        let operation = request
            .operation()
            .ok_or("no operation found in the document")?
            .clone();
        let root_type = self
            .schema
            .root_operation(ast::OperationType::Subscription)
            .ok_or("schema has no subscription root type")?
            .clone();
        let variables = coerce_variables(&operation, &request.variables);
        let fragments = fragments_of(&request.document);
        let fields = collect_fields(
            &self.schema,
            &fragments,
            &variables,
            root_type.as_str(),
            &operation.selection_set,
        );
        let (response_key, field_nodes) = fields
            .into_iter()
            .next()
            .ok_or("subscription selects no field")?;
        let field = field_nodes[0].clone();
        let resolver = self
            .resolvers
            .get(&(root_type.to_string(), field.name.to_string()))
            .ok_or_else(|| format!("no resolver for subscription field '{}'", field.name))?;
        let definition = self
            .schema
            .type_field(root_type.as_str(), field.name.as_str())
            .map_err(|_| format!("no subscription field '{}'", field.name))?;

        let probe = Execution {
            schema: &self.schema,
            resolvers: &self.resolvers,
            fragments: fragments.clone(),
            variables: variables.clone(),
            context: &request.context,
            errors: Vec::new(),
        };
        let arguments = probe.arguments(&field, &definition.arguments);
        let events = match resolver(&Value::Null, &arguments, &request.context) {
            Ok(Value::Array(events)) => events,
            Ok(other) => vec![other],
            Err(error) => {
                return Ok(Box::pin(stream::once(async move {
                    Response::builder().error(error).build()
                })));
            }
        };

        let ty = definition.ty.clone();
        let responses: Vec<Response> = events
            .into_iter()
            .map(|event| {
                let mut execution = Execution {
                    schema: &self.schema,
                    resolvers: &self.resolvers,
                    fragments: fragments.clone(),
                    variables: variables.clone(),
                    context: &request.context,
                    errors: Vec::new(),
                };
                let path = Path::empty().with(response_key.as_str());
                let data = match execution.complete_value(&ty, &field.selection_set, event, &path) {
                    Ok(value) => {
                        let mut data = Object::new();
                        data.insert(response_key.as_str(), value);
                        Value::Object(data)
                    }
                    Err(NullBubble) => Value::Null,
                };
                Response::builder()
                    .data(data)
                    .errors(execution.errors)
                    .build()
            })
            .collect();
        Ok(Box::pin(stream::iter(responses)))
    }
}
