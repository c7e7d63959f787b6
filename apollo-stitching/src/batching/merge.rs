//! Merging requests into one document, and splitting the combined result back.
//!
//! Every request of a batch gets a `_<index>_` prefix. It is added to the response
//! keys of the root fields, the variables and the fragments of the request, so that
//! the merged document is valid and its result can be demultiplexed.

use apollo_compiler::Name;
use apollo_compiler::Node;
use apollo_compiler::ast;
use indexmap::IndexSet;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json_bytes::ByteString;
use tower::BoxError;

use crate::executor::ExecutionRequest;
use crate::graphql::Response;
use crate::json_ext::Object;
use crate::json_ext::Path;
use crate::json_ext::PathElement;
use crate::json_ext::Value;
use crate::selection::Fragments;
use crate::selection::collect_fragment_spreads;
use crate::selection::fragments_of;
use crate::selection::response_key;

static PREFIXED_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^_(\d+)_(.*)$").expect("valid regex"));

fn prefixed(index: usize, name: &str) -> String {
    format!("_{index}_{name}")
}

/// Splits a prefixed key into the index of its request and the original key.
fn parse_key(key: &str) -> Option<(usize, &str)> {
    let captures = PREFIXED_KEY.captures(key)?;
    let index = captures.get(1)?.as_str().parse().ok()?;
    Some((index, captures.get(2)?.as_str()))
}

struct Prefixer<'a> {
    index: usize,
    fragments: &'a Fragments,
}

impl Prefixer<'_> {
    fn rename(&self, name: &Name) -> Result<Name, BoxError> {
        Ok(Name::new(&prefixed(self.index, name))?)
    }

    fn value(&self, value: &Node<ast::Value>) -> Result<Node<ast::Value>, BoxError> {
        Ok(match value.as_ref() {
            ast::Value::Variable(name) => Node::new(ast::Value::Variable(self.rename(name)?)),
            ast::Value::List(items) => Node::new(ast::Value::List(
                items
                    .iter()
                    .map(|item| self.value(item))
                    .collect::<Result<_, _>>()?,
            )),
            ast::Value::Object(fields) => Node::new(ast::Value::Object(
                fields
                    .iter()
                    .map(|(name, value)| Ok((name.clone(), self.value(value)?)))
                    .collect::<Result<_, BoxError>>()?,
            )),
            _ => value.clone(),
        })
    }

    fn arguments(
        &self,
        arguments: &[Node<ast::Argument>],
    ) -> Result<Vec<Node<ast::Argument>>, BoxError> {
        arguments
            .iter()
            .map(|argument| {
                Ok(Node::new(ast::Argument {
                    name: argument.name.clone(),
                    value: self.value(&argument.value)?,
                }))
            })
            .collect()
    }

    fn directives(&self, directives: &ast::DirectiveList) -> Result<ast::DirectiveList, BoxError> {
        directives
            .iter()
            .map(|directive| {
                let mut directive = directive.clone();
                let arguments = self.arguments(&directive.arguments)?;
                directive.make_mut().arguments = arguments;
                Ok(directive)
            })
            .collect::<Result<Vec<_>, BoxError>>()
            .map(ast::DirectiveList)
    }

    /// Prefixes `selections`. At the root, fragment spreads are inlined so that
    /// every root field can be aliased.
    fn selections(
        &self,
        selections: &[ast::Selection],
        root: bool,
    ) -> Result<Vec<ast::Selection>, BoxError> {
        selections
            .iter()
            .map(|selection| {
                Ok(match selection {
                    ast::Selection::Field(field) => {
                        let mut rewritten = field.clone();
                        let node = rewritten.make_mut();
                        if root {
                            node.alias = Some(self.rename(response_key(field))?);
                        }
                        node.arguments = self.arguments(&field.arguments)?;
                        node.directives = self.directives(&field.directives)?;
                        node.selection_set = self.selections(&field.selection_set, false)?;
                        ast::Selection::Field(rewritten)
                    }
                    ast::Selection::InlineFragment(inline) => {
                        let mut rewritten = inline.clone();
                        let node = rewritten.make_mut();
                        node.directives = self.directives(&inline.directives)?;
                        node.selection_set = self.selections(&inline.selection_set, root)?;
                        ast::Selection::InlineFragment(rewritten)
                    }
                    ast::Selection::FragmentSpread(spread) if root => {
                        let fragment = self.fragments.get(&spread.fragment_name).ok_or_else(|| {
                            format!("unknown fragment '{}'", spread.fragment_name)
                        })?;
                        ast::Selection::InlineFragment(Node::new(ast::InlineFragment {
                            type_condition: Some(fragment.type_condition.clone()),
                            directives: self.directives(&spread.directives)?,
                            selection_set: self.selections(&fragment.selection_set, true)?,
                        }))
                    }
                    ast::Selection::FragmentSpread(spread) => {
                        ast::Selection::FragmentSpread(Node::new(ast::FragmentSpread {
                            fragment_name: self.rename(&spread.fragment_name)?,
                            directives: self.directives(&spread.directives)?,
                        }))
                    }
                })
            })
            .collect()
    }
}

/// Merges `requests` into a single request.
///
/// The requests must share an operation kind. The merged request carries the
/// context of the first one.
pub(crate) fn merge_requests(requests: &[ExecutionRequest]) -> Result<ExecutionRequest, BoxError> {
    let first = requests.first().ok_or("cannot merge an empty batch")?;
    let mut variable_definitions = Vec::new();
    let mut selection_set = Vec::new();
    let mut fragment_definitions = Vec::new();
    let mut variables = Object::new();
    let mut extensions = Object::new();

    for (index, request) in requests.iter().enumerate() {
        let operation = request
            .operation()
            .ok_or_else(|| format!("request {index} of the batch has no operation"))?;
        let fragments = fragments_of(&request.document);
        let prefixer = Prefixer {
            index,
            fragments: &fragments,
        };

        for definition in &operation.variables {
            let mut definition = definition.clone();
            let node = definition.make_mut();
            node.name = prefixer.rename(&node.name)?;
            variable_definitions.push(definition);
        }
        let root_selections = prefixer.selections(&operation.selection_set, true)?;

        // fragments still spread once root spreads are inlined
        let mut nested = IndexSet::new();
        collect_fragment_spreads(&root_selections, &mut nested);
        let mut cursor = 0;
        while let Some(name) = nested.get_index(cursor).cloned() {
            let original = parse_key(name.as_str())
                .and_then(|(_, original)| fragments.get(original));
            if let Some(fragment) = original {
                let mut renamed = IndexSet::new();
                collect_fragment_spreads(&fragment.selection_set, &mut renamed);
                for spread in renamed {
                    nested.insert(prefixer.rename(&spread)?);
                }
                let mut definition = fragment.clone();
                let node = definition.make_mut();
                node.name = name.clone();
                node.directives = prefixer.directives(&fragment.directives)?;
                node.selection_set = prefixer.selections(&fragment.selection_set, false)?;
                fragment_definitions.push(ast::Definition::FragmentDefinition(definition));
            }
            cursor += 1;
        }
        selection_set.extend(root_selections);

        for (name, value) in request.variables.iter() {
            variables.insert(ByteString::from(prefixed(index, name.as_str())), value.clone());
        }
        for (name, value) in request.extensions.iter() {
            extensions.insert(name.clone(), value.clone());
        }
    }

    let mut document = ast::Document::new();
    document
        .definitions
        .push(ast::Definition::OperationDefinition(Node::new(
            ast::OperationDefinition {
                operation_type: first.operation_kind.into(),
                name: None,
                variables: variable_definitions,
                directives: ast::DirectiveList::default(),
                selection_set,
            },
        )));
    document.definitions.extend(fragment_definitions);

    let mut merged = ExecutionRequest::new(document, first.operation_kind, first.context.clone());
    merged.variables = variables;
    merged.extensions = extensions;
    Ok(merged)
}

/// Splits the result of a merged request into one response per original request.
///
/// Errors located under a prefixed root key go to their request, with the prefix
/// removed. Other errors go to every request.
pub(crate) fn split_result(response: Response, count: usize) -> Vec<Response> {
    let mut data: Vec<Option<Object>> = match &response.data {
        Some(Value::Object(_)) => vec![Some(Object::new()); count],
        _ => vec![None; count],
    };
    if let Some(Value::Object(object)) = response.data {
        for (key, value) in object {
            let Some((index, original)) = parse_key(key.as_str()) else {
                continue;
            };
            if let Some(Some(data)) = data.get_mut(index) {
                data.insert(ByteString::from(original), value);
            }
        }
    }

    let mut errors = vec![Vec::new(); count];
    for error in response.errors {
        let located = error.path.as_ref().and_then(|path| {
            let (index, original) = parse_key(path.get(0)?.as_key()?)?;
            let relocated: Path = std::iter::once(PathElement::Key(original.to_string()))
                .chain(path.iter().skip(1).cloned())
                .collect();
            Some((index, relocated))
        });
        match located {
            Some((index, path)) if index < count => errors[index].push(error.relocated(Some(path))),
            _ => errors.iter_mut().for_each(|errors| errors.push(error.clone())),
        }
    }

    data.into_iter()
        .zip(errors)
        .map(|(data, errors)| {
            Response::builder()
                .and_data(data.map(Value::Object))
                .errors(errors)
                .extensions(response.extensions.clone())
                .build()
        })
        .collect()
}
