//! Delegation of a field of the stitched schema to a subschema.
//!
//! A delegation builds a request from the field being resolved, runs it through
//! the [`Transformer`] pipeline, sends it to the subschema (directly, through the
//! batching executor, or through the subscriber) and turns the response back into
//! an [`ExternalValue`] for the gateway.

mod request;

use std::sync::Arc;

use apollo_compiler::Schema;
use apollo_compiler::ast;
use apollo_compiler::validation::Valid;
use derivative::Derivative;
use futures::FutureExt;
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use tracing::Instrument;

pub(crate) use self::request::create_request;
use crate::batching::batching_executor;
use crate::context::Context;
use crate::error::DelegationError;
use crate::error::FetchError;
use crate::executor::OperationKind;
use crate::graphql::Error;
use crate::json_ext::Object;
use crate::merge::ExternalValue;
use crate::merge::check_result_and_handle_errors;
use crate::receiver::Receiver;
use crate::resolve_info::ResolveInfo;
use crate::stitching_info::StitchingInfo;
use crate::subschema::Subschema;
use crate::transform::Transform;
use crate::transform::Transformer;

/// Rewrites an error of a delegation before it is located in the stitched response.
pub type OnLocatedError = Arc<dyn Fn(&Error) -> Error + Send + Sync>;

/// Everything one delegation needs, fixed once the delegation starts.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct DelegationContext {
    #[derivative(Debug = "ignore")]
    pub subschema: Arc<Subschema>,
    /// The schema requests are sent to.
    #[derivative(Debug = "ignore")]
    pub target_schema: Arc<Valid<Schema>>,
    /// The target schema as the gateway sees it, after the subschema transforms.
    #[derivative(Debug = "ignore")]
    pub transformed_schema: Arc<Valid<Schema>>,
    pub operation: OperationKind,
    /// The root field of the subschema to delegate to.
    pub field_name: String,
    /// Arguments replacing those of the delegating field.
    pub args: Option<Object>,
    pub context: Context,
    pub info: ResolveInfo,
    pub return_type: ast::Type,
    #[derivative(Debug = "ignore")]
    pub on_located_error: Option<OnLocatedError>,
    /// Subschema transforms followed by the transforms of this delegation.
    #[derivative(Debug = "ignore")]
    pub transforms: Vec<Arc<dyn Transform>>,
    /// Whether the result is returned as fetched, without merging other subschemas in.
    pub skip_type_merging: bool,
    #[derivative(Debug = "ignore")]
    pub stitching_info: Option<Arc<StitchingInfo>>,
}

/// What to delegate, and where.
///
/// Only the subschema, the context and the info of the delegating field are
/// required: by default the delegating field is proxied to the root field of the
/// same name and operation type.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct DelegationOptions {
    #[derivative(Debug = "ignore")]
    subschema: Arc<Subschema>,
    context: Context,
    info: ResolveInfo,
    operation: Option<OperationKind>,
    field_name: Option<String>,
    args: Option<Object>,
    return_type: Option<ast::Type>,
    selection_set: Option<Vec<ast::Selection>>,
    #[derivative(Debug = "ignore")]
    transforms: Vec<Arc<dyn Transform>>,
    skip_type_merging: bool,
    #[derivative(Debug = "ignore")]
    on_located_error: Option<OnLocatedError>,
}

#[buildstructor::buildstructor]
impl DelegationOptions {
    /// Builder methods:
    ///
    /// * `.subschema(Arc<Subschema>)`, `.context(Context)`, `.info(ResolveInfo)`
    ///   Required.
    ///
    /// * `.operation(OperationKind)`
    ///   Optional. Defaults to the operation type of the delegating field's parent.
    ///
    /// * `.field_name(impl Into<String>)`, `.return_type(ast::Type)`
    ///   Optional. Default to those of the delegating field.
    ///
    /// * `.args(Object)`
    ///   Optional. Replaces the arguments of the delegating field.
    ///
    /// * `.selection_set(Vec<ast::Selection>)`
    ///   Optional. Replaces the selections of the delegating field.
    ///
    /// * `.transform(Arc<dyn Transform>)` / `.transforms(..)`
    ///   Optional. Run after the transforms of the subschema.
    ///
    /// * `.skip_type_merging(bool)`, `.on_located_error(OnLocatedError)`
    ///   Optional.
    #[builder(visibility = "pub")]
    #[allow(clippy::too_many_arguments)]
    fn new(
        subschema: Arc<Subschema>,
        context: Context,
        info: ResolveInfo,
        operation: Option<OperationKind>,
        field_name: Option<String>,
        args: Option<Object>,
        return_type: Option<ast::Type>,
        selection_set: Option<Vec<ast::Selection>>,
        transforms: Vec<Arc<dyn Transform>>,
        skip_type_merging: Option<bool>,
        on_located_error: Option<OnLocatedError>,
    ) -> Self {
        Self {
            subschema,
            context,
            info,
            operation,
            field_name,
            args,
            return_type,
            selection_set,
            transforms,
            skip_type_merging: skip_type_merging.unwrap_or_default(),
            on_located_error,
        }
    }
}

/// The operation type of the root type `info`'s field belongs to.
fn delegating_operation(info: &ResolveInfo) -> OperationKind {
    let schema = info.schema();
    [OperationKind::Mutation, OperationKind::Subscription]
        .into_iter()
        .find(|kind| schema.root_operation((*kind).into()) == Some(&info.parent_type))
        .unwrap_or(OperationKind::Query)
}

impl DelegationContext {
    /// Fills in the defaults of `options`. Returns the explicit selection set, if any.
    fn new(options: DelegationOptions) -> (Self, Option<Vec<ast::Selection>>) {
        let DelegationOptions {
            subschema,
            context,
            info,
            operation,
            field_name,
            args,
            return_type,
            selection_set,
            transforms,
            skip_type_merging,
            on_located_error,
        } = options;
        let operation = operation.unwrap_or_else(|| delegating_operation(&info));
        let field_name = field_name.unwrap_or_else(|| info.field_name.to_string());
        let return_type = return_type.unwrap_or_else(|| info.return_type.clone());
        let stitching_info = info.stitching_info().cloned();
        let mut all_transforms = subschema.transforms.clone();
        all_transforms.extend(transforms);
        let delegation = Self {
            target_schema: subschema.schema().clone(),
            transformed_schema: subschema.transformed_schema().clone(),
            subschema,
            operation,
            field_name,
            args,
            context,
            info,
            return_type,
            on_located_error,
            transforms: all_transforms,
            skip_type_merging,
            stitching_info,
        };
        (delegation, selection_set)
    }
}

fn execution_error(subschema: &Subschema, error: impl std::fmt::Display) -> DelegationError {
    FetchError::SubrequestExecutionError {
        service: subschema.name().to_string(),
        reason: error.to_string(),
    }
    .into()
}

/// Delegates a query or mutation field.
///
/// Configuration problems (a root field the subschema does not have, say) are
/// returned as errors. Errors of the subschema are part of the returned value.
pub async fn delegate(options: DelegationOptions) -> Result<ExternalValue, DelegationError> {
    let (delegation, selection_set) = DelegationContext::new(options);
    let request = create_request(&delegation, selection_set)?;
    let mut transformer = Transformer::new(delegation.clone());
    let request = transformer.transform_request(request)?;
    let subschema = delegation.subschema.clone();
    tracing::debug!(
        subschema = subschema.name(),
        field = delegation.field_name.as_str(),
        query = %request.document.serialize().no_indent(),
        "delegating"
    );

    if request.has_incremental_directives() {
        let responses = subschema
            .executor
            .execute_incremental(request)
            .await
            .map_err(|error| execution_error(&subschema, error))?;
        return Receiver::start(responses, transformer).await;
    }

    let response = if subschema.batch {
        batching_executor(&delegation.context, &subschema)
            .execute(request)
            .await
    } else {
        subschema.executor.execute(request).await
    }
    .map_err(|error| execution_error(&subschema, error))?;
    let response = transformer.transform_result(response)?;
    Ok(check_result_and_handle_errors(response, &delegation).await)
}

/// Delegates a field, reporting any failure as an error located at the field.
pub fn delegate_to_schema(options: DelegationOptions) -> BoxFuture<'static, ExternalValue> {
    let path = options.info.path.clone();
    let span = tracing::info_span!(
        "delegate",
        "subschema" = options.subschema.name(),
        "path" = %path,
    );
    async move {
        match delegate(options).await {
            Ok(value) => value,
            Err(error) => {
                tracing::error!(%error, "delegation failed");
                ExternalValue::Error(error.to_graphql_error(Some(path)))
            }
        }
    }
    .instrument(span)
    .boxed()
}

/// Delegates a subscription field. Each event of the subschema is one value.
pub async fn delegate_subscription(
    options: DelegationOptions,
) -> Result<BoxStream<'static, ExternalValue>, DelegationError> {
    let (delegation, selection_set) = DelegationContext::new(options);
    let subschema = delegation.subschema.clone();
    let Some(subscriber) = subschema.subscriber.clone() else {
        return Err(FetchError::SubscriptionNotSupported {
            service: subschema.name().to_string(),
        }
        .into());
    };
    let request = create_request(&delegation, selection_set)?;
    let mut transformer = Transformer::new(delegation.clone());
    let request = transformer.transform_request(request)?;
    let events = subscriber
        .subscribe(request)
        .await
        .map_err(|error| execution_error(&subschema, error))?;

    let transformer = Arc::new(transformer);
    Ok(events
        .then(move |response| {
            let transformer = transformer.clone();
            async move {
                let delegation = transformer.delegation();
                match transformer.transform_result(response) {
                    Ok(response) => check_result_and_handle_errors(response, delegation).await,
                    Err(error) => {
                        ExternalValue::Error(error.to_graphql_error(Some(delegation.info.path.clone())))
                    }
                }
            }
        })
        .boxed())
}

#[cfg(test)]
pub(crate) mod test_support {
    use apollo_compiler::Name;
    use apollo_compiler::Node;
    use apollo_compiler::ast;
    use serde_json_bytes::ByteString;

    use super::*;
    use crate::json_ext::Path;
    use crate::resolve_info::OperationInfo;
    use crate::selection::fragments_of;
    use crate::selection::response_key;
    use crate::subschema::MergedTypeConfig;
    use crate::subschema::SubschemaConfig;
    use crate::subschema::SubschemaId;
    use crate::subschema::parse_schema;

    /// The info of the root field answering `response_key` in `query`.
    pub(crate) fn root_field_info(
        gateway: Arc<Valid<Schema>>,
        stitching_info: Option<Arc<StitchingInfo>>,
        query: &str,
        response_key_name: &str,
    ) -> ResolveInfo {
        let document = ast::Document::parse(query, "query.graphql").unwrap();
        let operation: Node<ast::OperationDefinition> = document
            .definitions
            .iter()
            .find_map(|definition| match definition {
                ast::Definition::OperationDefinition(operation) => Some(operation.clone()),
                _ => None,
            })
            .unwrap();
        let field_nodes: Vec<Node<ast::Field>> = operation
            .selection_set
            .iter()
            .filter_map(|selection| match selection {
                ast::Selection::Field(field) if response_key(field) == response_key_name => {
                    Some(field.clone())
                }
                _ => None,
            })
            .collect();
        let first = field_nodes[0].clone();
        let parent_type: Name = gateway
            .root_operation(operation.operation_type)
            .cloned()
            .unwrap();
        let return_type = gateway
            .type_field(parent_type.as_str(), first.name.as_str())
            .map(|definition| definition.ty.clone())
            .unwrap();
        let mut operation_info =
            OperationInfo::new(gateway, operation, fragments_of(&document), Object::new());
        if let Some(stitching_info) = stitching_info {
            operation_info = operation_info.with_stitching_info(stitching_info);
        }
        ResolveInfo {
            field_name: first.name.clone(),
            response_key: response_key(&first).clone(),
            field_nodes,
            return_type,
            parent_type,
            path: Path::from(response_key_name),
            operation: Arc::new(operation_info),
        }
    }

    /// A delegation of `field_name` to a subschema named `subschema`, outside of any
    /// stitched schema.
    pub(crate) fn delegation_context(
        gateway_sdl: &str,
        subschema_sdl: &str,
        query: &str,
        field_name: &str,
    ) -> DelegationContext {
        let gateway = parse_schema("gateway", gateway_sdl).unwrap();
        let subschema = Subschema::new(
            SubschemaId(0),
            SubschemaConfig::new("subschema", subschema_sdl).unwrap(),
        )
        .unwrap();
        let info = root_field_info(gateway, None, query, field_name);
        let options = DelegationOptions::builder()
            .subschema(Arc::new(subschema))
            .context(Context::new())
            .info(info)
            .build();
        DelegationContext::new(options).0
    }

    pub(crate) const STITCHED_GATEWAY: &str = r#"
        type Query { product(upc: ID!): Product }
        type Product { upc: ID! name: String reviews: [String] }
    "#;

    /// Two subschemas merging `Product` on `{ upc }`: `products` answers `product(upc:)`,
    /// `reviews` answers `_products(upcs:)`.
    pub(crate) fn stitched_subschemas() -> Vec<Arc<Subschema>> {
        let products = SubschemaConfig::new(
            "products",
            "type Query { product(upc: ID!): Product } type Product { upc: ID! name: String }",
        )
        .unwrap()
        .with_merged_type(
            "Product",
            MergedTypeConfig::new()
                .with_selection_set("{ upc }")
                .with_field_name("product")
                .with_args(|object| {
                    let mut args = Object::new();
                    args.insert(ByteString::from("upc"), object["upc"].clone());
                    args
                }),
        );
        let reviews = SubschemaConfig::new(
            "reviews",
            "type Query { _products(upcs: [ID!]!): [Product] } type Product { upc: ID! reviews: [String] }",
        )
        .unwrap()
        .with_merged_type(
            "Product",
            MergedTypeConfig::new()
                .with_selection_set("{ upc }")
                .with_field_name("_products")
                .with_key(|object| object["upc"].clone())
                .with_args_from_keys(|keys| {
                    let mut args = Object::new();
                    args.insert(
                        ByteString::from("upcs"),
                        crate::json_ext::Value::Array(keys.to_vec()),
                    );
                    args
                }),
        );
        vec![
            Arc::new(Subschema::new(SubschemaId(0), products).unwrap()),
            Arc::new(Subschema::new(SubschemaId(1), reviews).unwrap()),
        ]
    }

    /// A delegation of `field_name` to `products`, within a stitched schema.
    pub(crate) fn stitched_delegation_context(query: &str, field_name: &str) -> DelegationContext {
        let gateway = parse_schema("gateway", STITCHED_GATEWAY).unwrap();
        let subschemas = stitched_subschemas();
        let stitching_info = Arc::new(StitchingInfo::new(&gateway, subschemas.clone()).unwrap());
        let info = root_field_info(gateway, Some(stitching_info), query, field_name);
        let options = DelegationOptions::builder()
            .subschema(subschemas[0].clone())
            .context(Context::new())
            .info(info)
            .build();
        DelegationContext::new(options).0
    }
}
