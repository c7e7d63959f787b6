use std::sync::Arc;

use apollo_compiler::Name;
use apollo_compiler::ast;
use futures::FutureExt;
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::future::join_all;

use crate::context::Context;
use crate::delegate::DelegationContext;
use crate::error::DelegationError;
use crate::graphql::Error;
use crate::graphql::Response;
use crate::merge::ExternalObject;
use crate::merge::ExternalValue;
use crate::merge::merge_data_and_errors;
use crate::merge::report_unpathed_errors_via_null;
use crate::planner::merge_fields;
use crate::receiver::ReceiverHandle;
use crate::resolve_info::ResolveInfo;
use crate::selection::STREAM_DIRECTIVE_NAME;
use crate::selection::has_directive;
use crate::selection::is_abstract;
use crate::subschema::Subschema;

/// Turns the response of a delegation into the value of the delegating field.
pub(crate) fn check_result_and_handle_errors(
    response: Response,
    delegation: &DelegationContext,
) -> BoxFuture<'static, ExternalValue> {
    let data = response
        .data
        .as_ref()
        .and_then(|data| data.as_object())
        .and_then(|data| data.get(delegation.field_name.as_str()))
        .cloned()
        .map(ExternalValue::from_value)
        .unwrap_or_default();
    let merged = merge_data_and_errors(
        data,
        response.errors,
        Some(&delegation.info.path),
        delegation.on_located_error.as_ref(),
        1,
    );
    resolve_external_value(
        merged.data,
        merged.unpathed_errors,
        delegation.subschema.clone(),
        delegation.context.clone(),
        delegation.info.clone(),
        delegation.return_type.clone(),
        delegation.skip_type_merging,
    )
}

/// Completes a value fetched from `subschema` for a field returning `return_type`.
///
/// Objects are annotated with their subschema and the unpathed errors of the
/// delegation. Unless `skip_type_merging` is set, objects of merged types then get
/// the fields `info` selects that `subschema` could not provide, from the other
/// subschemas.
pub fn resolve_external_value(
    value: ExternalValue,
    unpathed_errors: Vec<Error>,
    subschema: Arc<Subschema>,
    context: Context,
    info: ResolveInfo,
    return_type: ast::Type,
    skip_type_merging: bool,
) -> BoxFuture<'static, ExternalValue> {
    async move {
        match value {
            ExternalValue::Null => report_unpathed_errors_via_null(&unpathed_errors, &context),
            ExternalValue::List(items) if return_type.is_list() => {
                let item_type = return_type.item_type().clone();
                let items = items.into_iter().enumerate().map(|(index, item)| {
                    resolve_external_value(
                        item,
                        unpathed_errors.clone(),
                        subschema.clone(),
                        context.clone(),
                        info.at_index(index),
                        item_type.clone(),
                        skip_type_merging,
                    )
                });
                ExternalValue::List(join_all(items).await)
            }
            ExternalValue::Object(object) => {
                resolve_external_object(
                    *object,
                    unpathed_errors,
                    subschema,
                    context,
                    info,
                    return_type,
                    skip_type_merging,
                )
                .await
            }
            other => other,
        }
    }
    .boxed()
}

async fn resolve_external_object(
    mut object: ExternalObject,
    unpathed_errors: Vec<Error>,
    subschema: Arc<Subschema>,
    context: Context,
    info: ResolveInfo,
    return_type: ast::Type,
    skip_type_merging: bool,
) -> ExternalValue {
    if !object.is_annotated() {
        object.annotate(subschema.clone(), unpathed_errors);
    }
    if skip_type_merging {
        return ExternalValue::Object(Box::new(object));
    }
    let Some(stitching_info) = info.stitching_info().cloned() else {
        return ExternalValue::Object(Box::new(object));
    };

    let named = return_type.inner_named_type();
    let type_name = if is_abstract(info.schema(), named.as_str()) {
        let resolved = object
            .typename()
            .filter(|typename| info.schema().types.contains_key(*typename))
            .and_then(|typename| Name::new(typename).ok());
        match resolved {
            Some(type_name) => type_name,
            None => {
                let typename = object.typename().unwrap_or_default().to_string();
                return ExternalValue::Error(
                    DelegationError::UnresolvableType(typename).to_graphql_error(Some(info.path.clone())),
                );
            }
        }
    } else {
        named.clone()
    };

    let has_targets = stitching_info
        .merged_type(type_name.as_str())
        .and_then(|merged| merged.target_subschemas.get(&subschema.id()))
        .is_some_and(|targets| !targets.is_empty());
    if !has_targets {
        return ExternalValue::Object(Box::new(object));
    }
    let merged = merge_fields(stitching_info, type_name, object, subschema, context, info).await;
    ExternalValue::Object(Box::new(merged))
}

/// The whole streamed list `key`, once its last item arrived.
async fn streamed_list(receiver: &ReceiverHandle, key: &str) -> Result<ExternalValue, DelegationError> {
    match receiver.request(key).await? {
        ExternalValue::List(_) => Ok(ExternalValue::List(
            receiver.request_stream(key).await?.collect().await,
        )),
        other => Ok(other),
    }
}

/// Resolves the field described by `info` on an object returned by a subschema.
///
/// The field is read from the object, or from the incremental delivery the object is
/// part of when it has not arrived yet, then completed with [`resolve_external_value`].
pub fn default_merged_resolver(
    parent: &ExternalObject,
    context: &Context,
    info: &ResolveInfo,
) -> BoxFuture<'static, ExternalValue> {
    let key = info.response_key.to_string();
    let data = parent.fields.get(&key).cloned();
    let subschema = parent.field_subschema(&key).cloned();
    let unpathed_errors = parent.unpathed_errors.clone();
    let receiver = parent.receiver.clone();
    let streamed = info
        .field_nodes
        .iter()
        .any(|field| has_directive(&field.directives, STREAM_DIRECTIVE_NAME));
    let context = context.clone();
    let info = info.clone();

    async move {
        let Some(subschema) = subschema else {
            return data.unwrap_or_default();
        };
        let data = match (data, &receiver) {
            (Some(_), Some(receiver)) if streamed => streamed_list(receiver, &key).await,
            (None, Some(receiver)) => receiver.request(&key).await,
            (data, _) => Ok(data.unwrap_or_default()),
        };
        let data = match data {
            Ok(data) => data,
            Err(error) => return ExternalValue::Error(error.to_graphql_error(Some(info.path.clone()))),
        };
        let return_type = info.return_type.clone();
        let mut resolved = resolve_external_value(
            data,
            unpathed_errors,
            subschema,
            context,
            info,
            return_type,
            false,
        )
        .await;
        if let Some(receiver) = receiver {
            receiver.attach(&mut resolved, &key);
        }
        resolved
    }
    .boxed()
}
