//! A type-tracking rewrite of every selection set of a document.

use apollo_compiler::Name;
use apollo_compiler::Node;
use apollo_compiler::Schema;
use apollo_compiler::ast;

/// Where the root fields of the operations get their type from.
#[derive(Clone, Copy)]
pub(crate) enum RootFields<'a> {
    /// From the schema's root operation types.
    Schema,
    /// Every root field returns this type, as when typing a delegated request
    /// with the gateway schema.
    Returning(&'a Name),
}

/// Rewrites the selection sets of `document`, innermost first.
///
/// `visit` receives the parent type of each selection set, or `None` when the
/// schema does not know it, and returns the replacement selections.
pub(crate) fn rewrite_selection_sets<F>(
    document: &ast::Document,
    schema: &Schema,
    root_fields: RootFields<'_>,
    mut visit: F,
) -> ast::Document
where
    F: FnMut(Option<&Name>, Vec<ast::Selection>) -> Vec<ast::Selection>,
{
    let mut rewritten = document.clone();
    for definition in rewritten.definitions.iter_mut() {
        match definition {
            ast::Definition::OperationDefinition(operation) => {
                let root_type = schema.root_operation(operation.operation_type).cloned();
                let operation = operation.make_mut();
                operation.selection_set = match root_fields {
                    RootFields::Schema => rewrite(
                        schema,
                        root_type.as_ref(),
                        &operation.selection_set,
                        &mut visit,
                    ),
                    RootFields::Returning(returning) => {
                        let root_fields = operation
                            .selection_set
                            .iter()
                            .map(|selection| match selection {
                                ast::Selection::Field(field) if !field.selection_set.is_empty() => {
                                    let mut field = field.clone();
                                    let node = field.make_mut();
                                    node.selection_set =
                                        rewrite(schema, Some(returning), &node.selection_set, &mut visit);
                                    ast::Selection::Field(field)
                                }
                                other => other.clone(),
                            })
                            .collect();
                        visit(root_type.as_ref(), root_fields)
                    }
                };
            }
            ast::Definition::FragmentDefinition(fragment) => {
                let type_condition = schema
                    .types
                    .contains_key(&fragment.type_condition)
                    .then(|| fragment.type_condition.clone());
                let fragment = fragment.make_mut();
                fragment.selection_set = rewrite(
                    schema,
                    type_condition.as_ref(),
                    &fragment.selection_set,
                    &mut visit,
                );
            }
            _ => {}
        }
    }
    rewritten
}

fn rewrite(
    schema: &Schema,
    parent: Option<&Name>,
    selections: &[ast::Selection],
    visit: &mut dyn FnMut(Option<&Name>, Vec<ast::Selection>) -> Vec<ast::Selection>,
) -> Vec<ast::Selection> {
    let rewritten = selections
        .iter()
        .map(|selection| match selection {
            ast::Selection::Field(field) if !field.selection_set.is_empty() => {
                let field_type = parent
                    .and_then(|parent| schema.type_field(parent.as_str(), field.name.as_str()).ok())
                    .map(|definition| definition.ty.inner_named_type().clone());
                let mut field = field.clone();
                let node = field.make_mut();
                node.selection_set = rewrite(schema, field_type.as_ref(), &node.selection_set, visit);
                ast::Selection::Field(field)
            }
            ast::Selection::InlineFragment(inline) => {
                let condition = match &inline.type_condition {
                    Some(condition) => schema
                        .types
                        .contains_key(condition)
                        .then(|| condition.clone()),
                    None => parent.cloned(),
                };
                let mut inline = inline.clone();
                let node = inline.make_mut();
                node.selection_set = rewrite(schema, condition.as_ref(), &node.selection_set, visit);
                ast::Selection::InlineFragment(inline)
            }
            other => other.clone(),
        })
        .collect();
    visit(parent, rewritten)
}

/// Returns a field selection with the given selection set.
pub(crate) fn with_selection_set(
    field: &Node<ast::Field>,
    selection_set: Vec<ast::Selection>,
) -> ast::Selection {
    let mut field = field.clone();
    field.make_mut().selection_set = selection_set;
    ast::Selection::Field(field)
}

/// An inline fragment on `type_condition`.
pub(crate) fn inline_fragment(
    type_condition: Name,
    selection_set: Vec<ast::Selection>,
) -> ast::Selection {
    ast::Selection::InlineFragment(Node::new(ast::InlineFragment {
        type_condition: Some(type_condition),
        directives: ast::DirectiveList::default(),
        selection_set,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selection::typename_field;

    #[test]
    fn visits_every_selection_set_with_its_parent_type() {
        let schema = Schema::parse_and_validate(
            "type Query { user: User } type User { id: ID friends: [User] }",
            "schema.graphql",
        )
        .unwrap();
        let document = ast::Document::parse(
            "{ user { friends { id } ... on User { id } } } fragment F on User { id }",
            "query.graphql",
        )
        .unwrap();
        let mut parents = Vec::new();
        let rewritten = rewrite_selection_sets(&document, &schema, RootFields::Schema, |parent, mut selections| {
            parents.push(parent.map(|name| name.to_string()));
            selections.push(typename_field());
            selections
        });
        assert_eq!(
            parents,
            vec![
                Some("User".to_string()),
                Some("User".to_string()),
                Some("User".to_string()),
                Some("Query".to_string()),
                Some("User".to_string()),
            ]
        );
        assert_eq!(rewritten.to_string().matches("__typename").count(), 5);
    }
}
