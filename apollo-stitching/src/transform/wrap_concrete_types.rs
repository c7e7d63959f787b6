use apollo_compiler::ast;

use crate::delegate::DelegationContext;
use crate::error::DelegationError;
use crate::executor::ExecutionRequest;
use crate::selection::is_abstract;
use crate::selection::is_leaf;
use crate::selection::possible_types;
use crate::transform::Transform;
use crate::transform::TransformationContext;
use crate::transform::visitor::inline_fragment;
use crate::transform::visitor::with_selection_set;

/// Narrows root fields returning an abstract type in the target schema to the
/// concrete type the delegating field returns.
///
/// `userById: User` in the gateway may be fetched through `node(id:): Node` in a
/// subschema, in which case the selections apply to `... on User`.
#[derive(Clone, Copy, Debug, Default)]
pub struct WrapConcreteTypes;

impl Transform for WrapConcreteTypes {
    fn name(&self) -> &'static str {
        "wrap_concrete_types"
    }

    fn transform_request(
        &self,
        mut request: ExecutionRequest,
        delegation: &DelegationContext,
        _context: &mut TransformationContext,
    ) -> Result<ExecutionRequest, DelegationError> {
        let returned = delegation.return_type.inner_named_type().clone();
        let target = &delegation.target_schema;
        if is_leaf(target, returned.as_str()) || is_abstract(target, returned.as_str()) {
            return Ok(request);
        }
        for definition in request.document.definitions.iter_mut() {
            let ast::Definition::OperationDefinition(operation) = definition else {
                continue;
            };
            let Some(root_type) = target.root_operation(operation.operation_type).cloned() else {
                continue;
            };
            let operation = operation.make_mut();
            for selection in operation.selection_set.iter_mut() {
                let ast::Selection::Field(field) = selection else {
                    continue;
                };
                let Ok(definition) = target.type_field(root_type.as_str(), field.name.as_str()) else {
                    continue;
                };
                let field_type = definition.ty.inner_named_type();
                if field.selection_set.is_empty()
                    || field_type == &returned
                    || !is_abstract(target, field_type.as_str())
                    || !possible_types(target, field_type.as_str()).contains(&returned)
                {
                    continue;
                }
                let wrapped = vec![inline_fragment(
                    returned.clone(),
                    field.selection_set.clone(),
                )];
                let replacement = with_selection_set(field, wrapped);
                *selection = replacement;
            }
        }
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegate::test_support::delegation_context;
    use crate::executor::OperationKind;

    #[test]
    fn wraps_selections_of_abstract_root_fields() {
        let gateway = "type Query { user(id: ID!): User } type User { id: ID! name: String }";
        let subschema = "type Query { node(id: ID!): Node } interface Node { id: ID! } type User implements Node { id: ID! name: String }";
        let delegation = delegation_context(gateway, subschema, "{ user(id: 1) { name } }", "user");
        let request = ExecutionRequest::new(
            ast::Document::parse("{ node(id: 1) { name } }", "query.graphql").unwrap(),
            OperationKind::Query,
            delegation.context.clone(),
        );
        let request = WrapConcreteTypes
            .transform_request(request, &delegation, &mut TransformationContext::default())
            .unwrap();
        assert!(
            request
                .document
                .serialize()
                .no_indent()
                .to_string()
                .contains("node(id: 1) { ... on User { name } }")
        );
    }
}
