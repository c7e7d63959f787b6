//! Coalescing of the requests sent to a subschema while answering one client
//! request.
//!
//! Requests submitted during one tick are grouped into runs of the same operation
//! kind. Each run is merged into one document, sent once, and its result split
//! back to the original requests.

mod batcher;
mod merge;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::join_all;
use parking_lot::Mutex;
use tower::BoxError;
use tracing::Instrument;

pub(crate) use self::batcher::Batcher;
pub(crate) use self::batcher::LoadFn;
pub(crate) use self::merge::merge_requests;
pub(crate) use self::merge::split_result;
use crate::context::Context;
use crate::error::FetchError;
use crate::executor::ExecutionRequest;
use crate::executor::Executor;
use crate::graphql::Response;
use crate::subschema::Subschema;
use crate::subschema::SubschemaId;

/// An [`Executor`] batching the requests sent to one subschema.
pub(crate) struct BatchingExecutor {
    batcher: Batcher<ExecutionRequest, Response>,
}

#[async_trait]
impl Executor for BatchingExecutor {
    async fn execute(&self, request: ExecutionRequest) -> Result<Response, BoxError> {
        self.batcher.load(request).await
    }
}

/// Splits `requests` into maximal runs of the same operation kind.
fn contiguous_runs(requests: Vec<ExecutionRequest>) -> Vec<Vec<ExecutionRequest>> {
    let mut runs: Vec<Vec<ExecutionRequest>> = Vec::new();
    for request in requests {
        match runs.last_mut() {
            Some(run) if run[0].operation_kind == request.operation_kind => run.push(request),
            _ => runs.push(vec![request]),
        }
    }
    runs
}

async fn execute_run(
    subschema: Arc<Subschema>,
    requests: Vec<ExecutionRequest>,
) -> Vec<Result<Response, BoxError>> {
    let count = requests.len();
    if count == 1 {
        let request = requests.into_iter().next();
        return match request {
            Some(request) => vec![subschema.executor.execute(request).await],
            None => Vec::new(),
        };
    }
    let failed = |reason: String| -> Vec<Result<Response, BoxError>> {
        (0..count)
            .map(|_| {
                Err(FetchError::SubrequestBatchingError {
                    service: subschema.name().to_string(),
                    reason: reason.clone(),
                }
                .into())
            })
            .collect()
    };
    let merged = match merge_requests(&requests) {
        Ok(merged) => merged,
        Err(error) => return failed(error.to_string()),
    };
    tracing::debug!(
        subschema = subschema.name(),
        batch.size = count,
        query = %merged.document.serialize().no_indent(),
        "sending batch"
    );
    match subschema.executor.execute(merged).await {
        Ok(response) => split_result(response, count).into_iter().map(Ok).collect(),
        Err(error) => failed(error.to_string()),
    }
}

fn batching_load(subschema: Arc<Subschema>) -> LoadFn<ExecutionRequest, Response> {
    Arc::new(move |requests: Vec<ExecutionRequest>| {
        let subschema = subschema.clone();
        let span = tracing::info_span!("batch", "subschema" = subschema.name(), "batch.size" = requests.len());
        async move {
            let runs = contiguous_runs(requests);
            join_all(runs.into_iter().map(|run| execute_run(subschema.clone(), run)))
                .await
                .into_iter()
                .flatten()
                .collect()
        }
        .instrument(span)
        .boxed()
    })
}

/// Batching executors of one client request, per subschema.
#[derive(Clone, Default)]
struct BatchingExecutors(Arc<Mutex<HashMap<SubschemaId, Arc<BatchingExecutor>>>>);

/// The batching executor of `subschema` for the client request of `context`.
///
/// Every call with the same context and subschema returns the same executor, so
/// requests of one client request are coalesced and requests of two client
/// requests never are.
pub(crate) fn batching_executor(context: &Context, subschema: &Arc<Subschema>) -> Arc<dyn Executor> {
    let executors = context.extension_or_default::<BatchingExecutors>();
    let executor = executors
        .0
        .lock()
        .entry(subschema.id())
        .or_insert_with(|| {
            Arc::new(BatchingExecutor {
                batcher: Batcher::new(
                    subschema.name(),
                    subschema.batching.clone(),
                    batching_load(subschema.clone()),
                ),
            })
        })
        .clone();
    executor
}

#[cfg(test)]
mod tests {
    use apollo_compiler::ast;
    use serde_json_bytes::json;

    use super::*;
    use crate::configuration::BatchingOptions;
    use crate::executor::MockExecutor;
    use crate::executor::OperationKind;
    use crate::subschema::SubschemaConfig;

    const SDL: &str = "type Query { user(id: ID!): User } type Mutation { rename(id: ID!): User } type User { id: ID! name: String }";

    fn request(query: &str, kind: OperationKind, context: &Context) -> ExecutionRequest {
        let document = ast::Document::parse(query, "request.graphql").unwrap();
        ExecutionRequest::new(document, kind, context.clone())
    }

    #[test]
    fn runs_never_mix_operation_kinds() {
        let context = Context::new();
        let runs = contiguous_runs(vec![
            request("{ a: user(id: 1) { id } }", OperationKind::Query, &context),
            request("{ b: user(id: 2) { id } }", OperationKind::Query, &context),
            request("mutation { rename(id: 1) { id } }", OperationKind::Mutation, &context),
            request("{ c: user(id: 3) { id } }", OperationKind::Query, &context),
        ]);
        let sizes: Vec<usize> = runs.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 1, 1]);
    }

    #[tokio::test]
    async fn one_executor_per_context_and_subschema() {
        let mock = Arc::new(
            MockExecutor::builder()
                .response(
                    "{ _0_user: user(id: 1) { name } _1_user: user(id: 2) { name } }",
                    json!({ "data": { "_0_user": { "name": "Ada" }, "_1_user": { "name": "Grace" } } }),
                )
                .build(),
        );
        let config = SubschemaConfig::new("users", SDL)
            .unwrap()
            .with_executor(mock.clone())
            .with_batching(BatchingOptions::default());
        let subschema = Arc::new(Subschema::new(SubschemaId(0), config).unwrap());
        let context = Context::new();
        let executor = batching_executor(&context, &subschema);
        assert!(Arc::ptr_eq(&executor, &batching_executor(&context, &subschema)));
        assert!(!Arc::ptr_eq(&executor, &batching_executor(&Context::new(), &subschema)));

        let (first, second) = futures::join!(
            executor.execute(request("{ user(id: 1) { name } }", OperationKind::Query, &context)),
            executor.execute(request("{ user(id: 2) { name } }", OperationKind::Query, &context)),
        );
        assert_eq!(first.unwrap().data, Some(json!({ "user": { "name": "Ada" } })));
        assert_eq!(second.unwrap().data, Some(json!({ "user": { "name": "Grace" } })));
        assert_eq!(mock.calls(), 1);
    }
}
