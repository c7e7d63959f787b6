use apollo_compiler::Name;
use apollo_compiler::Node;
use apollo_compiler::ast;
use indexmap::IndexSet;

use crate::delegate::DelegationContext;
use crate::error::DelegationError;
use crate::executor::ExecutionRequest;
use crate::transform::Transform;
use crate::transform::TransformationContext;

/// Passes the arguments given to a delegation as operation variables of the
/// root fields, replacing the arguments those fields had.
#[derive(Clone, Copy, Debug, Default)]
pub struct AddArgumentsAsVariables;

impl Transform for AddArgumentsAsVariables {
    fn name(&self) -> &'static str {
        "add_arguments_as_variables"
    }

    fn transform_request(
        &self,
        mut request: ExecutionRequest,
        delegation: &DelegationContext,
        _context: &mut TransformationContext,
    ) -> Result<ExecutionRequest, DelegationError> {
        let Some(args) = &delegation.args else {
            return Ok(request);
        };
        let schema = &delegation.target_schema;
        let mut generated = 0;
        for definition in request.document.definitions.iter_mut() {
            let ast::Definition::OperationDefinition(operation) = definition else {
                continue;
            };
            let Some(root_type) = schema.root_operation(operation.operation_type).cloned() else {
                continue;
            };
            let operation = operation.make_mut();
            let mut taken: IndexSet<Name> = operation
                .variables
                .iter()
                .map(|variable| variable.name.clone())
                .collect();
            let mut new_variables = Vec::new();
            for selection in operation.selection_set.iter_mut() {
                let ast::Selection::Field(field) = selection else {
                    continue;
                };
                let Ok(field_definition) = schema.type_field(root_type.as_str(), field.name.as_str())
                else {
                    continue;
                };
                let field = field.make_mut();
                for argument_definition in &field_definition.arguments {
                    let Some(value) = args.get(argument_definition.name.as_str()) else {
                        continue;
                    };
                    let variable_name = loop {
                        let candidate = format!("_v{generated}_{}", argument_definition.name);
                        generated += 1;
                        if let Ok(name) = Name::new(&candidate) {
                            if !taken.contains(&name) {
                                break name;
                            }
                        }
                    };
                    taken.insert(variable_name.clone());
                    field
                        .arguments
                        .retain(|argument| argument.name != argument_definition.name);
                    field.arguments.push(Node::new(ast::Argument {
                        name: argument_definition.name.clone(),
                        value: Node::new(ast::Value::Variable(variable_name.clone())),
                    }));
                    new_variables.push(Node::new(ast::VariableDefinition {
                        name: variable_name.clone(),
                        ty: argument_definition.ty.clone(),
                        default_value: None,
                        directives: ast::DirectiveList::default(),
                    }));
                    request
                        .variables
                        .insert(variable_name.as_str(), value.clone());
                }
            }
            operation.variables.extend(new_variables);
        }
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use serde_json_bytes::json as bjson;

    use super::*;
    use crate::delegate::test_support::delegation_context;
    use crate::executor::OperationKind;
    use crate::json_ext::Value;

    const SDL: &str = "type Query { user(id: ID!, active: Boolean): User } type User { id: ID! }";

    #[test]
    fn replaces_arguments_with_new_variables() {
        let query = "query($_v0_id: ID) { user(id: \"old\", active: true) { id } }";
        let mut delegation = delegation_context(SDL, SDL, query, "user");
        delegation.args = Some(bjson!({ "id": "42" }).as_object().cloned().unwrap());
        let request = ExecutionRequest::new(
            ast::Document::parse(query, "query.graphql").unwrap(),
            OperationKind::Query,
            delegation.context.clone(),
        );
        let request = AddArgumentsAsVariables
            .transform_request(request, &delegation, &mut TransformationContext::default())
            .unwrap();
        let printed = request.document.serialize().no_indent().to_string();
        assert!(printed.contains("$_v1_id: ID!"), "{printed}");
        assert!(printed.contains("user(active: true, id: $_v1_id)"), "{printed}");
        assert_eq!(Value::Object(request.variables), bjson!({ "_v1_id": "42" }));
    }
}
