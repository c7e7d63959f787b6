//! Delegation by key, batched.
//!
//! Objects of a merged type fetched from a subschema through a list field (say
//! `productsByUpcs(upcs: [ID!]!): [Product]`) are loaded together: the keys
//! requested during one tick for the same field and selections are deduplicated
//! and sent in a single delegation, then the results are dispatched back per key.

use std::collections::HashMap;
use std::sync::Arc;

use apollo_compiler::ast;
use derivative::Derivative;
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;

use crate::batching::Batcher;
use crate::batching::LoadFn;
use crate::context::Context;
use crate::delegate::DelegationOptions;
use crate::delegate::OnLocatedError;
use crate::delegate::delegate_to_schema;
use crate::error::FetchError;
use crate::executor::OperationKind;
use crate::graphql::Error;
use crate::json_ext::Path;
use crate::json_ext::PathElement;
use crate::json_ext::Value;
use crate::merge::ExternalValue;
use crate::resolve_info::ResolveInfo;
use crate::selection::print_selection_set;
use crate::subschema::ArgsFromKeysFn;
use crate::subschema::Subschema;
use crate::subschema::SubschemaId;
use crate::subschema::ValuesFromResultsFn;

/// A key to load through a batched list field.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct BatchDelegateOptions {
    #[derivative(Debug = "ignore")]
    subschema: Arc<Subschema>,
    context: Context,
    info: ResolveInfo,
    operation: Option<OperationKind>,
    field_name: String,
    key: Value,
    #[derivative(Debug = "ignore")]
    args_from_keys: ArgsFromKeysFn,
    #[derivative(Debug = "ignore")]
    values_from_results: Option<ValuesFromResultsFn>,
    /// The list type of the batched field.
    return_type: ast::Type,
    selection_set: Option<Vec<ast::Selection>>,
}

#[buildstructor::buildstructor]
impl BatchDelegateOptions {
    /// Builder methods:
    ///
    /// * `.subschema(Arc<Subschema>)`, `.context(Context)`, `.info(ResolveInfo)`
    ///   Required.
    ///
    /// * `.field_name(impl Into<String>)`, `.key(Value)`, `.args_from_keys(ArgsFromKeysFn)`
    ///   Required. The list field, the key of this object and how to build the
    ///   arguments of the field from all the keys of a batch.
    ///
    /// * `.return_type(ast::Type)`
    ///   Required. The list type of the field.
    ///
    /// * `.values_from_results(ValuesFromResultsFn)`
    ///   Optional. Defaults to matching results and keys by position.
    ///
    /// * `.selection_set(Vec<ast::Selection>)`, `.operation(OperationKind)`
    ///   Optional.
    #[builder(visibility = "pub")]
    #[allow(clippy::too_many_arguments)]
    fn new(
        subschema: Arc<Subschema>,
        context: Context,
        info: ResolveInfo,
        operation: Option<OperationKind>,
        field_name: String,
        key: Value,
        args_from_keys: ArgsFromKeysFn,
        values_from_results: Option<ValuesFromResultsFn>,
        return_type: ast::Type,
        selection_set: Option<Vec<ast::Selection>>,
    ) -> Self {
        Self {
            subschema,
            context,
            info,
            operation,
            field_name,
            key,
            args_from_keys,
            values_from_results,
            return_type,
            selection_set,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct LoaderKey {
    subschema: SubschemaId,
    field_name: String,
    selection_set: String,
    return_type: String,
}

type Loader = Batcher<Value, ExternalValue>;

/// Key loaders of one client request, with the path of the field that created
/// each of them.
#[derive(Clone, Default)]
struct BatchLoaders(Arc<Mutex<HashMap<LoaderKey, (Arc<Loader>, Path)>>>);

/// Drops the list index following the root field, so that errors of a batched
/// fetch are located like errors of a single fetch.
fn drop_batch_index() -> OnLocatedError {
    Arc::new(|error: &Error| {
        let path = error.path.as_ref().map(|path| match path.get(1) {
            Some(PathElement::Index(_)) => path
                .iter()
                .take(1)
                .chain(path.iter().skip(2))
                .cloned()
                .collect(),
            _ => path.clone(),
        });
        error.relocated(path)
    })
}

/// Moves the errors of a value loaded at `from` to the key's own path `to`.
///
/// A batch is delegated with the info of the field that created its loader, so the
/// errors of every other key start out located under that field.
fn relocate_errors(value: &mut ExternalValue, from: &Path, to: &Path) {
    match value {
        ExternalValue::Error(error) => {
            if let Some(path) = error.path.as_ref().filter(|path| path.starts_with(from)) {
                let relocated = to.join(path.skip(from.len()));
                *error = error.relocated(Some(relocated));
            }
        }
        ExternalValue::List(items) => items
            .iter_mut()
            .for_each(|item| relocate_errors(item, from, to)),
        ExternalValue::Object(object) => object
            .fields
            .values_mut()
            .for_each(|field| relocate_errors(field, from, to)),
        ExternalValue::Null | ExternalValue::Leaf(_) => {}
    }
}

/// Positions of `keys` once deduplicated, and the deduplicated keys.
fn dedupe(keys: Vec<Value>) -> (Vec<usize>, Vec<Value>) {
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut unique = Vec::new();
    let positions = keys
        .into_iter()
        .map(|key| {
            let id = serde_json::to_string(&key).unwrap_or_default();
            *seen.entry(id).or_insert_with(|| {
                unique.push(key);
                unique.len() - 1
            })
        })
        .collect();
    (positions, unique)
}

fn load_keys(options: &BatchDelegateOptions) -> LoadFn<Value, ExternalValue> {
    let options = options.clone();
    Arc::new(move |keys: Vec<Value>| {
        let options = options.clone();
        async move {
            let (positions, unique) = dedupe(keys);
            let args = (options.args_from_keys)(&unique);
            tracing::debug!(
                subschema = options.subschema.name(),
                field = options.field_name.as_str(),
                batch.size = unique.len(),
                "loading keys"
            );
            let result = delegate_to_schema(
                DelegationOptions::builder()
                    .subschema(options.subschema.clone())
                    .context(options.context.clone())
                    .info(options.info.clone())
                    .and_operation(options.operation)
                    .field_name(options.field_name.clone())
                    .args(args)
                    .return_type(options.return_type.clone())
                    .and_selection_set(options.selection_set.clone())
                    .skip_type_merging(true)
                    .on_located_error(drop_batch_index())
                    .build(),
            )
            .await;

            let values = match result {
                ExternalValue::List(items) => match &options.values_from_results {
                    Some(values_from_results) => values_from_results(items, &unique),
                    None => items,
                },
                other => vec![other; unique.len()],
            };
            positions
                .into_iter()
                .map(|position| Ok(values.get(position).cloned().unwrap_or_default()))
                .collect()
        }
        .boxed()
    })
}

/// Loads the value of `options.key`, batched with the other keys requested for the
/// same field and selections during the same tick.
pub fn batch_delegate_to_schema(options: BatchDelegateOptions) -> BoxFuture<'static, ExternalValue> {
    let loader_key = LoaderKey {
        subschema: options.subschema.id(),
        field_name: options.field_name.clone(),
        selection_set: options
            .selection_set
            .as_deref()
            .map(print_selection_set)
            .unwrap_or_default(),
        return_type: options.return_type.to_string(),
    };
    let loaders = options.context.extension_or_default::<BatchLoaders>();
    let (loader, batch_path) = loaders
        .0
        .lock()
        .entry(loader_key)
        .or_insert_with(|| {
            let loader = Arc::new(Batcher::new(
                format!("{}.{}", options.subschema.name(), options.field_name),
                options.subschema.batching.clone(),
                load_keys(&options),
            ));
            (loader, options.info.path.clone())
        })
        .clone();
    let service = options.subschema.name().to_string();
    let path = options.info.path.clone();
    let key = options.key;
    async move {
        match loader.load(key).await {
            Ok(mut value) => {
                if batch_path != path {
                    relocate_errors(&mut value, &batch_path, &path);
                }
                value
            }
            Err(error) => ExternalValue::Error(
                FetchError::SubrequestBatchingError {
                    service,
                    reason: error.to_string(),
                }
                .to_graphql_error(Some(path)),
            ),
        }
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use serde_json_bytes::json;

    use super::*;

    #[test]
    fn keys_are_deduplicated_in_order() {
        let (positions, unique) = dedupe(vec![json!("1"), json!("2"), json!("1"), json!({ "id": 3 })]);
        assert_eq!(positions, vec![0, 1, 0, 2]);
        assert_eq!(unique, vec![json!("1"), json!("2"), json!({ "id": 3 })]);
    }

    #[test]
    fn errors_move_to_the_path_of_their_key() {
        let error = Error::builder()
            .message("no price")
            .path(Path::from("user/reviews/0/product/price"))
            .build();
        let id = error.apollo_id();
        let mut object = crate::merge::ExternalObject::default();
        object.insert("price", ExternalValue::Error(error));
        let mut value = ExternalValue::Object(Box::new(object));
        relocate_errors(
            &mut value,
            &Path::from("user/reviews/0/product"),
            &Path::from("user/reviews/2/product"),
        );
        let Some(ExternalValue::Error(moved)) = value.as_object().and_then(|object| object.get("price")) else {
            panic!("expected an error");
        };
        assert_eq!(moved.path, Some(Path::from("user/reviews/2/product/price")));
        assert_eq!(moved.apollo_id(), id);
    }

    #[test]
    fn batch_indices_are_dropped_from_error_paths() {
        let hook = drop_batch_index();
        let error = Error::builder()
            .message("boom")
            .path(Path::from("productsByUpcs/2/price"))
            .build();
        assert_eq!(hook(&error).path, Some(Path::from("productsByUpcs/price")));
        let error = Error::builder().message("boom").path(Path::from("product/price")).build();
        assert_eq!(hook(&error).path, Some(Path::from("product/price")));
    }
}
