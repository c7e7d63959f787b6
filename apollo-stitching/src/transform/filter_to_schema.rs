use std::collections::HashSet;

use apollo_compiler::Name;
use apollo_compiler::Node;
use apollo_compiler::Schema;
use apollo_compiler::ast;
use indexmap::IndexMap;
use indexmap::IndexSet;

use crate::delegate::DelegationContext;
use crate::error::DelegationError;
use crate::executor::ExecutionRequest;
use crate::executor::OperationKind;
use crate::selection::collect_fragment_spreads;
use crate::selection::collect_variables;
use crate::selection::is_composite;
use crate::selection::is_typename;
use crate::selection::typename_field;
use crate::selection::types_overlap;
use crate::transform::Transform;
use crate::transform::TransformationContext;

/// Drops everything the target schema does not define: fields, arguments,
/// fragments whose type condition cannot apply, and then the variables and
/// fragment definitions no longer referenced.
#[derive(Clone, Copy, Debug, Default)]
pub struct FilterToSchema;

impl Transform for FilterToSchema {
    fn name(&self) -> &'static str {
        "filter_to_schema"
    }

    fn transform_request(
        &self,
        mut request: ExecutionRequest,
        delegation: &DelegationContext,
        _context: &mut TransformationContext,
    ) -> Result<ExecutionRequest, DelegationError> {
        let computed = if delegation.skip_type_merging {
            HashSet::new()
        } else {
            delegation
                .subschema
                .merge
                .iter()
                .flat_map(|(type_name, merged)| {
                    merged
                        .fields
                        .iter()
                        .filter(|(_, field)| field.computed)
                        .map(move |(field, _)| (type_name.clone(), field.clone()))
                })
                .collect()
        };
        let filter = Filter {
            schema: &delegation.target_schema,
            subschema: &delegation.subschema.name,
            computed,
        };
        let (document, used_variables) = filter.filter_document(&request.document)?;
        request.document = document;
        request
            .variables
            .retain(|name, _| used_variables.contains(name.as_str()));
        Ok(request)
    }
}

struct Filter<'a> {
    schema: &'a Schema,
    subschema: &'a str,
    /// `(type, field)` pairs the subschema only resolves as a merge target.
    computed: HashSet<(String, String)>,
}

impl Filter<'_> {
    fn filter_document(
        &self,
        document: &ast::Document,
    ) -> Result<(ast::Document, IndexSet<Name>), DelegationError> {
        let valid_fragments: IndexMap<Name, Name> = document
            .definitions
            .iter()
            .filter_map(|definition| match definition {
                ast::Definition::FragmentDefinition(fragment)
                    if self.schema.types.contains_key(&fragment.type_condition) =>
                {
                    Some((fragment.name.clone(), fragment.type_condition.clone()))
                }
                _ => None,
            })
            .collect();

        let mut operations = Vec::new();
        let mut fragments = IndexMap::new();
        for definition in &document.definitions {
            match definition {
                ast::Definition::OperationDefinition(operation) => {
                    let kind = OperationKind::from(operation.operation_type);
                    let root_type = self
                        .schema
                        .root_operation(operation.operation_type)
                        .cloned()
                        .ok_or_else(|| DelegationError::MissingRootType {
                            subschema: self.subschema.to_string(),
                            operation: kind.to_string(),
                        })?;
                    for selection in &operation.selection_set {
                        if let ast::Selection::Field(field) = selection {
                            if !is_typename(field)
                                && self
                                    .schema
                                    .type_field(root_type.as_str(), field.name.as_str())
                                    .is_err()
                            {
                                return Err(DelegationError::MissingRootField {
                                    subschema: self.subschema.to_string(),
                                    type_name: root_type.to_string(),
                                    field: field.name.to_string(),
                                });
                            }
                        }
                    }
                    let mut operation = operation.clone();
                    let node = operation.make_mut();
                    node.selection_set =
                        self.filter_selection_set(&root_type, &node.selection_set, &valid_fragments, true);
                    operations.push(operation);
                }
                ast::Definition::FragmentDefinition(fragment)
                    if valid_fragments.contains_key(&fragment.name) =>
                {
                    let mut fragment = fragment.clone();
                    let node = fragment.make_mut();
                    let selection_set = self.filter_selection_set(
                        &node.type_condition,
                        &node.selection_set,
                        &valid_fragments,
                        false,
                    );
                    node.selection_set = if selection_set.is_empty() {
                        vec![typename_field()]
                    } else {
                        selection_set
                    };
                    fragments.insert(node.name.clone(), fragment);
                }
                _ => {}
            }
        }

        // fragments only referenced from dropped selections go too, transitively
        let mut used_fragments = IndexSet::new();
        for operation in &operations {
            collect_fragment_spreads(&operation.selection_set, &mut used_fragments);
        }
        let mut index = 0;
        while index < used_fragments.len() {
            if let Some(fragment) = used_fragments
                .get_index(index)
                .and_then(|name| fragments.get(name))
            {
                let mut nested = IndexSet::new();
                collect_fragment_spreads(&fragment.selection_set, &mut nested);
                used_fragments.extend(nested);
            }
            index += 1;
        }

        let mut filtered = ast::Document::new();
        let mut all_used_variables = IndexSet::new();
        for mut operation in operations {
            let mut used_variables = IndexSet::new();
            collect_variables(&operation.selection_set, &mut used_variables);
            for name in &used_fragments {
                if let Some(fragment) = fragments.get(name) {
                    collect_variables(&fragment.selection_set, &mut used_variables);
                }
            }
            operation
                .make_mut()
                .variables
                .retain(|definition| used_variables.contains(&definition.name));
            all_used_variables.extend(used_variables);
            filtered
                .definitions
                .push(ast::Definition::OperationDefinition(operation));
        }
        for (name, fragment) in fragments {
            if used_fragments.contains(&name) {
                filtered
                    .definitions
                    .push(ast::Definition::FragmentDefinition(fragment));
            }
        }
        Ok((filtered, all_used_variables))
    }

    fn filter_selection_set(
        &self,
        parent: &Name,
        selections: &[ast::Selection],
        fragments: &IndexMap<Name, Name>,
        root: bool,
    ) -> Vec<ast::Selection> {
        let mut filtered = Vec::with_capacity(selections.len());
        for selection in selections {
            match selection {
                ast::Selection::Field(field) => {
                    if is_typename(field) {
                        filtered.push(selection.clone());
                        continue;
                    }
                    if self
                        .computed
                        .contains(&(parent.to_string(), field.name.to_string()))
                    {
                        continue;
                    }
                    let Ok(definition) = self.schema.type_field(parent.as_str(), field.name.as_str())
                    else {
                        continue;
                    };
                    let mut field = field.clone();
                    let node = field.make_mut();
                    node.arguments.retain(|argument| {
                        definition
                            .arguments
                            .iter()
                            .any(|defined| defined.name == argument.name)
                    });
                    node.directives = self.filter_directives(&node.directives);
                    let field_type = definition.ty.inner_named_type();
                    if is_composite(self.schema, field_type.as_str()) {
                        let selection_set =
                            self.filter_selection_set(field_type, &node.selection_set, fragments, false);
                        if selection_set.is_empty() {
                            if !root {
                                continue;
                            }
                            node.selection_set = vec![typename_field()];
                        } else {
                            node.selection_set = selection_set;
                        }
                    } else {
                        node.selection_set.clear();
                    }
                    filtered.push(ast::Selection::Field(field));
                }
                ast::Selection::InlineFragment(inline) => {
                    let condition = match &inline.type_condition {
                        Some(condition) => {
                            if !self.schema.types.contains_key(condition)
                                || !types_overlap(self.schema, condition.as_str(), parent.as_str())
                            {
                                continue;
                            }
                            condition
                        }
                        None => parent,
                    };
                    let selection_set =
                        self.filter_selection_set(condition, &inline.selection_set, fragments, false);
                    let mut inline = inline.clone();
                    let node = inline.make_mut();
                    node.directives = self.filter_directives(&node.directives);
                    node.selection_set = if selection_set.is_empty() {
                        vec![typename_field()]
                    } else {
                        selection_set
                    };
                    filtered.push(ast::Selection::InlineFragment(inline));
                }
                ast::Selection::FragmentSpread(spread) => {
                    let applies = fragments.get(&spread.fragment_name).is_some_and(|condition| {
                        types_overlap(self.schema, condition.as_str(), parent.as_str())
                    });
                    if applies {
                        let mut spread = spread.clone();
                        let node = spread.make_mut();
                        node.directives = self.filter_directives(&node.directives);
                        filtered.push(ast::Selection::FragmentSpread(spread));
                    }
                }
            }
        }
        filtered
    }

    fn filter_directives(&self, directives: &ast::DirectiveList) -> ast::DirectiveList {
        ast::DirectiveList(
            directives
                .iter()
                .filter(|directive| {
                    self.schema
                        .directive_definitions
                        .contains_key(&directive.name)
                })
                .cloned()
                .collect::<Vec<Node<ast::Directive>>>(),
        )
    }
}

#[cfg(test)]
mod tests {
    use serde_json_bytes::json as bjson;

    use super::*;
    use crate::delegate::test_support::delegation_context;

    const GATEWAY: &str = r#"
        type Query { user(id: ID!): User }
        type User { id: ID! name: String email: String posts(first: Int): [Post] friends: [User] }
        type Post { title: String body: String }
    "#;

    const SUBSCHEMA: &str = r#"
        type Query { user(id: ID!): User }
        type User { id: ID! name: String posts: [Post] }
        type Post { body: String }
    "#;

    fn filter(query: &str, variables: crate::json_ext::Value) -> ExecutionRequest {
        let delegation = delegation_context(GATEWAY, SUBSCHEMA, query, "user");
        let mut request = ExecutionRequest::new(
            ast::Document::parse(query, "query.graphql").unwrap(),
            OperationKind::Query,
            delegation.context.clone(),
        );
        request.variables = variables.as_object().cloned().unwrap_or_default();
        FilterToSchema
            .transform_request(request, &delegation, &mut TransformationContext::default())
            .unwrap()
    }

    #[test]
    fn drops_unknown_fields_arguments_and_empty_selections() {
        let request = filter(
            "query($id: ID!, $first: Int) { user(id: $id) { id email posts(first: $first) { title } } }",
            bjson!({ "id": "1", "first": 2 }),
        );
        let printed = request.document.serialize().no_indent().to_string();
        assert!(printed.contains("user(id: $id) { id }"), "{printed}");
        assert!(!printed.contains("$first"), "{printed}");
        assert_eq!(crate::json_ext::Value::Object(request.variables), bjson!({ "id": "1" }));
    }

    #[test]
    fn drops_unused_fragments_transitively() {
        let request = filter(
            "{ user(id: 1) { id friends { ...A } } } fragment A on User { id ...B } fragment B on User { name }",
            bjson!({}),
        );
        let printed = request.document.serialize().no_indent().to_string();
        assert!(!printed.contains("fragment A"), "{printed}");
        assert!(!printed.contains("fragment B"), "{printed}");
        assert!(printed.contains("user(id: 1) { id }"), "{printed}");
    }

    #[test]
    fn is_idempotent_on_valid_documents() {
        let query = "query($id: ID!) { user(id: $id) { id name posts { body } } }";
        let once = filter(query, bjson!({ "id": "1" }));
        let twice = filter(&once.document.to_string(), bjson!({ "id": "1" }));
        assert_eq!(once.document.to_string(), twice.document.to_string());
        assert_eq!(
            once.document.to_string(),
            ast::Document::parse(query, "query.graphql").unwrap().to_string()
        );
    }

    #[test]
    fn missing_root_fields_are_configuration_errors() {
        let delegation = delegation_context(GATEWAY, SUBSCHEMA, "{ user(id: 1) { id } }", "user");
        let request = ExecutionRequest::new(
            ast::Document::parse("{ users { id } }", "query.graphql").unwrap(),
            OperationKind::Query,
            delegation.context.clone(),
        );
        let error = FilterToSchema
            .transform_request(request, &delegation, &mut TransformationContext::default())
            .unwrap_err();
        assert_eq!(
            error.to_string(),
            "field 'users' does not exist on type 'Query' in subschema 'subschema'"
        );
    }
}
