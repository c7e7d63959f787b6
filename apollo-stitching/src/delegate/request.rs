use std::sync::Arc;

use apollo_compiler::Name;
use apollo_compiler::Node;
use apollo_compiler::ast;

use crate::delegate::DelegationContext;
use crate::error::DelegationError;
use crate::executor::ExecutionRequest;

/// Builds the request delegating `delegation.field_name` to its subschema.
///
/// Without an explicit `selection_set`, the delegating field is proxied: its
/// arguments (with the defaults of the stitched schema filled in) and selections are
/// forwarded as they are. The variables and fragments of the client operation are
/// forwarded too, and pruned later by the transforms.
pub(crate) fn create_request(
    delegation: &DelegationContext,
    selection_set: Option<Vec<ast::Selection>>,
) -> Result<ExecutionRequest, DelegationError> {
    let info = &delegation.info;
    let field_name = Name::new(&delegation.field_name).map_err(|_| {
        DelegationError::InvalidDocument(format!(
            "'{}' is not a valid field name",
            delegation.field_name
        ))
    })?;

    let (arguments, selections) = match selection_set {
        Some(selections) => (Vec::new(), selections),
        None => {
            let mut arguments: Vec<Node<ast::Argument>> = info
                .field_nodes
                .first()
                .map(|field| field.arguments.clone())
                .unwrap_or_default();
            if let Ok(definition) = info
                .schema()
                .type_field(info.parent_type.as_str(), info.field_name.as_str())
            {
                for argument in &definition.arguments {
                    let provided = arguments
                        .iter()
                        .any(|provided| provided.name == argument.name);
                    if let (false, Some(default)) = (provided, &argument.default_value) {
                        arguments.push(Node::new(ast::Argument {
                            name: argument.name.clone(),
                            value: default.clone(),
                        }));
                    }
                }
            }
            let selections = info
                .field_nodes
                .iter()
                .flat_map(|field| field.selection_set.iter().cloned())
                .collect();
            (arguments, selections)
        }
    };

    let client_operation = &info.operation.operation;
    let root_field = ast::Selection::Field(Node::new(ast::Field {
        alias: None,
        name: field_name,
        arguments,
        directives: ast::DirectiveList::default(),
        selection_set: selections,
    }));
    let mut document = ast::Document::new();
    document
        .definitions
        .push(ast::Definition::OperationDefinition(Node::new(
            ast::OperationDefinition {
                operation_type: delegation.operation.into(),
                name: client_operation.name.clone(),
                variables: client_operation.variables.clone(),
                directives: ast::DirectiveList::default(),
                selection_set: vec![root_field],
            },
        )));
    document.definitions.extend(
        info.fragments()
            .values()
            .cloned()
            .map(ast::Definition::FragmentDefinition),
    );

    let mut request = ExecutionRequest::new(document, delegation.operation, delegation.context.clone());
    request.operation_name = client_operation.name.as_ref().map(|name| name.to_string());
    request.variables = info.variables().clone();
    request.info = Some(Arc::new(info.clone()));
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegate::test_support::delegation_context;

    #[test]
    fn proxies_the_delegating_field() {
        let sdl = "type Query { user(id: ID!, active: Boolean = true): User } type User { id: ID! name: String }";
        let query = "query Me($id: ID!) { me: user(id: $id) { ...Name } } fragment Name on User { name }";
        let delegation = delegation_context(sdl, sdl, query, "me");
        let request = create_request(&delegation, None).unwrap();
        let printed = request.document.serialize().no_indent().to_string();
        assert!(
            printed.contains("query Me($id: ID!) { user(id: $id, active: true) { ...Name } }"),
            "{printed}"
        );
        assert!(printed.contains("fragment Name on User { name }"), "{printed}");
        assert_eq!(request.operation_name.as_deref(), Some("Me"));
    }

    #[test]
    fn explicit_selection_sets_replace_the_field_selections() {
        let sdl = "type Query { user(id: ID!): User } type User { id: ID! name: String }";
        let delegation = delegation_context(sdl, sdl, "{ user(id: 1) { name } }", "user");
        let selections = crate::selection::parse_selection_set("{ id }").unwrap();
        let request = create_request(&delegation, Some(selections)).unwrap();
        let printed = request.document.serialize().no_indent().to_string();
        assert!(printed.contains("{ user { id } }"), "{printed}");
        assert!(!printed.contains("name"), "{printed}");
    }
}
