use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::context::Context;
use crate::delegate::OnLocatedError;
use crate::graphql::Error;
use crate::json_ext::Path;
use crate::json_ext::PathElement;
use crate::merge::ExternalValue;

/// Data of a delegation, with located errors moved into it.
#[derive(Clone, Debug, Default)]
pub struct MergedExecutionResult {
    pub data: ExternalValue,
    /// Errors that could not be matched with a value of `data`.
    pub unpathed_errors: Vec<Error>,
}

/// Moves `errors` onto the values of `data` they point at.
///
/// Error paths are relative to the subschema response, so `index` is the position
/// of the segment matching the keys of `data`: `1` for the data of a root field.
/// When `data` is `null` the errors become the value itself, located at `path`
/// (followed by what the error's own path has past its root field).
pub fn merge_data_and_errors(
    data: ExternalValue,
    errors: Vec<Error>,
    path: Option<&Path>,
    on_located_error: Option<&OnLocatedError>,
    index: usize,
) -> MergedExecutionResult {
    if matches!(data, ExternalValue::Null) {
        let mut errors = errors;
        return match errors.len() {
            0 => MergedExecutionResult::default(),
            1 => {
                let error = errors.remove(0);
                let error = match on_located_error {
                    Some(hook) => hook(&error),
                    None => error,
                };
                let relocated = match (path, &error.path) {
                    (None, _) => error.path.clone(),
                    (Some(path), None) => Some(path.clone()),
                    (Some(path), Some(own)) => Some(path.join(own.skip(1))),
                };
                MergedExecutionResult {
                    data: ExternalValue::Error(error.relocated(relocated)),
                    unpathed_errors: Vec::new(),
                }
            }
            _ => {
                let message = errors
                    .iter()
                    .map(|error| error.message.as_str())
                    .collect::<Vec<_>>()
                    .join(", \n");
                MergedExecutionResult {
                    data: ExternalValue::Error(
                        Error::builder().message(message).and_path(path.cloned()).build(),
                    ),
                    unpathed_errors: Vec::new(),
                }
            }
        };
    }
    if errors.is_empty() {
        return MergedExecutionResult {
            data,
            unpathed_errors: Vec::new(),
        };
    }

    let mut data = data;
    let mut unpathed_errors = Vec::new();
    let mut by_segment: Vec<(PathElement, Vec<Error>)> = Vec::new();
    for error in errors {
        let segment = error.path.as_ref().and_then(|path| path.get(index)).cloned();
        match segment {
            Some(segment) => match by_segment.iter_mut().find(|(existing, _)| *existing == segment) {
                Some((_, errors)) => errors.push(error),
                None => by_segment.push((segment, vec![error])),
            },
            None => unpathed_errors.push(error),
        }
    }

    for (segment, errors) in by_segment {
        let child = match (&segment, &mut data) {
            (PathElement::Key(key), ExternalValue::Object(object)) => object.fields.get_mut(key.as_str()),
            (PathElement::Index(position), ExternalValue::List(items)) => items.get_mut(*position),
            _ => None,
        };
        match child {
            Some(child) => {
                let merged = merge_data_and_errors(
                    std::mem::take(child),
                    errors,
                    path,
                    on_located_error,
                    index + 1,
                );
                *child = merged.data;
                unpathed_errors.extend(merged.unpathed_errors);
            }
            None => unpathed_errors.extend(errors),
        }
    }

    MergedExecutionResult {
        data,
        unpathed_errors,
    }
}

/// Identities of the unpathed errors already reported for one client request.
#[derive(Clone, Debug, Default)]
pub(crate) struct ReportedErrors(Arc<Mutex<HashSet<Uuid>>>);

impl ReportedErrors {
    /// Returns `true` the first time `error` is seen.
    fn report(&self, error: &Error) -> bool {
        self.0.lock().insert(error.apollo_id())
    }
}

/// The value of a field whose data is `null`, given the unpathed errors of its parent.
///
/// Each error is reported once per client request, by the first field reaching it.
/// Later fields, and fields of objects without errors, are simply `null`.
pub fn report_unpathed_errors_via_null(errors: &[Error], context: &Context) -> ExternalValue {
    if errors.is_empty() {
        return ExternalValue::Null;
    }
    let reported = context.extension_or_default::<ReportedErrors>();
    let mut unreported: Vec<Error> = errors
        .iter()
        .filter(|error| reported.report(error))
        .cloned()
        .collect();
    match unreported.len() {
        0 => ExternalValue::Null,
        1 => ExternalValue::Error(unreported.remove(0)),
        _ => {
            let message = unreported
                .iter()
                .map(|error| error.message.as_str())
                .collect::<Vec<_>>()
                .join(", \n");
            ExternalValue::Error(Error::builder().message(message).build())
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json_bytes::json;

    use super::*;

    fn error(message: &str, path: &str) -> Error {
        Error::builder().message(message).path(Path::from(path)).build()
    }

    #[test]
    fn null_data_with_one_error_becomes_the_value() {
        let merged = merge_data_and_errors(
            ExternalValue::Null,
            vec![error("boom", "user/name")],
            Some(&Path::from("me/friend")),
            None,
            1,
        );
        let ExternalValue::Error(located) = merged.data else {
            panic!("expected an error, got {:?}", merged.data);
        };
        assert_eq!(located.message, "boom");
        assert_eq!(located.path, Some(Path::from("me/friend/name")));
        assert!(merged.unpathed_errors.is_empty());
    }

    #[test]
    fn null_data_with_several_errors_aggregates_them() {
        let merged = merge_data_and_errors(
            ExternalValue::Null,
            vec![error("first", "user"), error("second", "user")],
            Some(&Path::from("me")),
            None,
            1,
        );
        let ExternalValue::Error(aggregate) = merged.data else {
            panic!("expected an error");
        };
        assert_eq!(aggregate.message, "first, \nsecond");
        assert_eq!(aggregate.path, Some(Path::from("me")));
    }

    #[test]
    fn errors_land_on_the_values_they_blame() {
        let data = ExternalValue::from_value(json!({ "name": null, "friends": [{ "id": 1 }, null] }));
        let merged = merge_data_and_errors(
            data,
            vec![
                error("no name", "user/name"),
                error("no friend", "user/friends/1"),
                error("somewhere", "user/missing"),
                Error::builder().message("nowhere").build(),
            ],
            Some(&Path::empty()),
            None,
            1,
        );
        let object = merged.data.as_object().unwrap();
        assert!(matches!(object.get("name"), Some(ExternalValue::Error(e)) if e.path == Some(Path::from("name"))));
        assert!(matches!(
            merged.data.get_path(&Path::from("friends/1")),
            Some(ExternalValue::Error(e)) if e.path == Some(Path::from("friends/1"))
        ));
        let unpathed: Vec<_> = merged.unpathed_errors.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(unpathed, vec!["nowhere", "somewhere"]);
    }

    #[test]
    fn on_located_error_rewrites_the_error() {
        let hook: OnLocatedError = Arc::new(|error: &Error| {
            let path = error.path.as_ref().map(|path| {
                path.iter()
                    .filter(|element| matches!(element, PathElement::Key(_)))
                    .cloned()
                    .collect()
            });
            error.relocated(path)
        });
        let merged = merge_data_and_errors(
            ExternalValue::Null,
            vec![error("boom", "users/3/name")],
            Some(&Path::from("product")),
            Some(&hook),
            1,
        );
        let ExternalValue::Error(located) = merged.data else {
            panic!("expected an error");
        };
        assert_eq!(located.path, Some(Path::from("product/name")));
    }

    #[test]
    fn unpathed_errors_are_reported_once() {
        let context = Context::new();
        let shared = Error::builder().message("shared").build();
        let first = report_unpathed_errors_via_null(&[shared.clone()], &context);
        let second = report_unpathed_errors_via_null(&[shared.clone()], &context);
        assert!(matches!(first, ExternalValue::Error(e) if e.message == "shared"));
        assert!(second.is_null());
        assert!(matches!(
            report_unpathed_errors_via_null(&[shared], &Context::new()),
            ExternalValue::Error(_)
        ));
    }
}
