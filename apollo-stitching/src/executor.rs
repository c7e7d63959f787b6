//! The contracts through which the stitching engine reaches subschemas.
//!
//! An [`Executor`] answers queries and mutations, a [`Subscriber`] answers
//! subscriptions. Both may be remote (wrapping an HTTP client, say) or local, see
//! [`LocalSchema`](crate::local::LocalSchema).

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use apollo_compiler::Node;
use apollo_compiler::ast;
use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;
use serde::Deserialize;
use serde::Serialize;
use tower::BoxError;

use crate::context::Context;
use crate::graphql;
use crate::graphql::Response;
use crate::graphql::ResponseStream;
use crate::json_ext::Object;
use crate::json_ext::Value;
use crate::resolve_info::ResolveInfo;
use crate::selection::DEFER_DIRECTIVE_NAME;
use crate::selection::STREAM_DIRECTIVE_NAME;
use crate::selection::has_directive;

/// GraphQL operation type.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub enum OperationKind {
    #[default]
    Query,
    Mutation,
    Subscription,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl OperationKind {
    pub(crate) const fn default_type_name(&self) -> &'static str {
        match self {
            OperationKind::Query => "Query",
            OperationKind::Mutation => "Mutation",
            OperationKind::Subscription => "Subscription",
        }
    }

    pub(crate) const fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Query => "query",
            OperationKind::Mutation => "mutation",
            OperationKind::Subscription => "subscription",
        }
    }
}

impl From<OperationKind> for ast::OperationType {
    fn from(value: OperationKind) -> Self {
        match value {
            OperationKind::Query => ast::OperationType::Query,
            OperationKind::Mutation => ast::OperationType::Mutation,
            OperationKind::Subscription => ast::OperationType::Subscription,
        }
    }
}

impl From<ast::OperationType> for OperationKind {
    fn from(value: ast::OperationType) -> Self {
        match value {
            ast::OperationType::Query => OperationKind::Query,
            ast::OperationType::Mutation => OperationKind::Mutation,
            ast::OperationType::Subscription => OperationKind::Subscription,
        }
    }
}

/// A request sent to a subschema.
///
/// Transforms never edit a request in place: each one consumes the request and
/// returns a rewritten one.
#[derive(Clone, Debug)]
pub struct ExecutionRequest {
    pub document: ast::Document,
    pub operation_name: Option<String>,
    pub operation_kind: OperationKind,
    pub variables: Object,
    pub extensions: Object,
    pub context: Context,
    pub info: Option<Arc<ResolveInfo>>,
}

impl ExecutionRequest {
    pub fn new(document: ast::Document, operation_kind: OperationKind, context: Context) -> Self {
        Self {
            document,
            operation_name: None,
            operation_kind,
            variables: Object::new(),
            extensions: Object::new(),
            context,
            info: None,
        }
    }

    /// The document, printed.
    pub fn query(&self) -> String {
        self.document.to_string()
    }

    /// The operation to execute: the one named `operation_name`, or the first one.
    pub fn operation(&self) -> Option<&Node<ast::OperationDefinition>> {
        let mut operations = self.document.definitions.iter().filter_map(|definition| {
            match definition {
                ast::Definition::OperationDefinition(operation) => Some(operation),
                _ => None,
            }
        });
        match &self.operation_name {
            Some(name) => operations.find(|operation| {
                operation
                    .name
                    .as_ref()
                    .is_some_and(|operation_name| operation_name.as_str() == name)
            }),
            None => operations.next(),
        }
    }

    /// Whether the document uses `@defer` or `@stream`.
    pub fn has_incremental_directives(&self) -> bool {
        fn in_selections(selections: &[ast::Selection]) -> bool {
            selections.iter().any(|selection| match selection {
                ast::Selection::Field(field) => {
                    has_directive(&field.directives, STREAM_DIRECTIVE_NAME)
                        || in_selections(&field.selection_set)
                }
                ast::Selection::InlineFragment(inline) => {
                    has_directive(&inline.directives, DEFER_DIRECTIVE_NAME)
                        || in_selections(&inline.selection_set)
                }
                ast::Selection::FragmentSpread(spread) => {
                    has_directive(&spread.directives, DEFER_DIRECTIVE_NAME)
                }
            })
        }

        self.document
            .definitions
            .iter()
            .any(|definition| match definition {
                ast::Definition::OperationDefinition(operation) => {
                    in_selections(&operation.selection_set)
                }
                ast::Definition::FragmentDefinition(fragment) => {
                    in_selections(&fragment.selection_set)
                }
                _ => false,
            })
    }

    /// The request as it would travel over the wire.
    pub fn to_graphql_request(&self) -> graphql::Request {
        graphql::Request::builder()
            .query(self.query())
            .and_operation_name(self.operation_name.clone())
            .variables(self.variables.clone())
            .extensions(self.extensions.clone())
            .build()
    }
}

/// Answers queries and mutations for a subschema.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, request: ExecutionRequest) -> Result<Response, BoxError>;

    /// Executes a request whose document uses `@defer` or `@stream`.
    ///
    /// The first response of the stream is the initial payload. Executors without
    /// incremental delivery answer with their complete response.
    async fn execute_incremental(
        &self,
        request: ExecutionRequest,
    ) -> Result<ResponseStream, BoxError> {
        let response = self.execute(request).await?;
        Ok(Box::pin(stream::once(async move { response })))
    }
}

/// Answers subscriptions for a subschema, with one response per event.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn subscribe(&self, request: ExecutionRequest) -> Result<ResponseStream, BoxError>;
}

struct ExecutorFn<F>(F);

#[async_trait]
impl<F, Fut> Executor for ExecutorFn<F>
where
    F: Fn(ExecutionRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Response, BoxError>> + Send + 'static,
{
    async fn execute(&self, request: ExecutionRequest) -> Result<Response, BoxError> {
        (self.0)(request).await
    }
}

/// Makes an [`Executor`] out of an async function.
pub fn executor_fn<F, Fut>(f: F) -> Arc<dyn Executor>
where
    F: Fn(ExecutionRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, BoxError>> + Send + 'static,
{
    Arc::new(ExecutorFn(f))
}

struct SubscriberFn<F>(F);

#[async_trait]
impl<F, Fut> Subscriber for SubscriberFn<F>
where
    F: Fn(ExecutionRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ResponseStream, BoxError>> + Send + 'static,
{
    async fn subscribe(&self, request: ExecutionRequest) -> Result<ResponseStream, BoxError> {
        (self.0)(request).await
    }
}

/// Makes a [`Subscriber`] out of an async function.
pub fn subscriber_fn<F, Fut>(f: F) -> Arc<dyn Subscriber>
where
    F: Fn(ExecutionRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ResponseStream, BoxError>> + Send + 'static,
{
    Arc::new(SubscriberFn(f))
}

/// Normalizes a document so that formatting does not matter when matching mocks.
fn normalize(query: &str) -> String {
    match ast::Document::parse(query, "mock.graphql") {
        Ok(document) => document.serialize().no_indent().to_string(),
        Err(_) => query.to_string(),
    }
}

/// An [`Executor`] answering canned responses, keyed by query.
///
/// Queries are matched after normalization, so whitespace does not matter. Every
/// request is recorded and counted.
#[derive(Default)]
pub struct MockExecutor {
    responses: HashMap<String, Vec<Value>>,
    requests: Mutex<Vec<graphql::Request>>,
    calls: AtomicUsize,
}

#[buildstructor::buildstructor]
impl MockExecutor {
    /// Builder methods:
    ///
    /// * `.response(query, json)`: the JSON answer to `query`.
    /// * `.incremental_response(query, payloads)`: the initial and subsequent payloads
    ///   answered to `query` by [`Executor::execute_incremental`].
    #[builder(visibility = "pub")]
    fn new(responses: HashMap<String, Value>, incremental_responses: HashMap<String, Vec<Value>>) -> Self {
        let mut canned: HashMap<String, Vec<Value>> = responses
            .into_iter()
            .map(|(query, response)| (normalize(&query), vec![response]))
            .collect();
        canned.extend(
            incremental_responses
                .into_iter()
                .map(|(query, payloads)| (normalize(&query), payloads)),
        );
        Self {
            responses: canned,
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of requests received so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The requests received so far.
    pub fn requests(&self) -> Vec<graphql::Request> {
        self.requests.lock().clone()
    }

    fn payloads(&self, request: &ExecutionRequest) -> Result<Vec<Response>, BoxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let query = request.document.serialize().no_indent().to_string();
        self.requests.lock().push(request.to_graphql_request());
        let Some(payloads) = self.responses.get(&query) else {
            return Ok(vec![
                Response::builder()
                    .error(
                        graphql::Error::builder()
                            .message(format!("couldn't find mock for query {query}"))
                            .build(),
                    )
                    .build(),
            ]);
        };
        payloads
            .iter()
            .map(|payload| Ok(Response::from_value("mock", payload.clone())?))
            .collect()
    }
}

#[async_trait]
impl Executor for MockExecutor {
    async fn execute(&self, request: ExecutionRequest) -> Result<Response, BoxError> {
        self.payloads(&request)?
            .into_iter()
            .next()
            .ok_or_else(|| "empty mock response".into())
    }

    async fn execute_incremental(
        &self,
        request: ExecutionRequest,
    ) -> Result<ResponseStream, BoxError> {
        Ok(Box::pin(stream::iter(self.payloads(&request)?)))
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use serde_json_bytes::json as bjson;

    use super::*;

    fn request(query: &str) -> ExecutionRequest {
        ExecutionRequest::new(
            ast::Document::parse(query, "query.graphql").unwrap(),
            OperationKind::Query,
            Context::new(),
        )
    }

    #[tokio::test]
    async fn mock_matches_normalized_queries() {
        let mock = MockExecutor::builder()
            .response("{ me { id } }", bjson!({ "data": { "me": { "id": "1" } } }))
            .build();
        let response = mock.execute(request("{\n  me {\n    id\n  }\n}")).await.unwrap();
        assert_eq!(response.data, Some(bjson!({ "me": { "id": "1" } })));

        let missing = mock.execute(request("{ you { id } }")).await.unwrap();
        assert!(missing.errors[0].message.starts_with("couldn't find mock"));
        assert_eq!(mock.calls(), 2);
    }

    #[tokio::test]
    async fn default_incremental_execution_is_a_single_response() {
        let executor = executor_fn(|_request| async {
            Ok(Response::builder().data(bjson!({ "a": 1 })).build())
        });
        let responses: Vec<Response> = executor
            .execute_incremental(request("{ a }"))
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(responses.len(), 1);
    }

    #[test]
    fn detects_incremental_directives() {
        assert!(request("{ a { ... @defer { b } } }").has_incremental_directives());
        assert!(request("{ a @stream(initialCount: 0) }").has_incremental_directives());
        assert!(!request("{ a @include(if: true) }").has_incremental_directives());
    }

    #[test]
    fn selects_the_named_operation() {
        let mut request = request("query A { a } query B { b }");
        request.operation_name = Some("B".to_string());
        let operation = request.operation().unwrap();
        assert_eq!(operation.name.as_ref().unwrap().as_str(), "B");
    }
}
