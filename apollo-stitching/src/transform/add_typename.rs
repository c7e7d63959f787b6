use crate::delegate::DelegationContext;
use crate::error::DelegationError;
use crate::executor::ExecutionRequest;
use crate::selection::is_abstract;
use crate::selection::is_typename;
use crate::selection::typename_field;
use crate::transform::Transform;
use crate::transform::TransformationContext;
use crate::transform::visitor::RootFields;
use crate::transform::visitor::rewrite_selection_sets;

/// Selects `__typename` wherever the target schema returns an abstract type, so
/// results can be resolved to their concrete type.
#[derive(Clone, Copy, Debug, Default)]
pub struct AddTypenameToAbstract;

impl Transform for AddTypenameToAbstract {
    fn name(&self) -> &'static str {
        "add_typename_to_abstract"
    }

    fn transform_request(
        &self,
        mut request: ExecutionRequest,
        delegation: &DelegationContext,
        _context: &mut TransformationContext,
    ) -> Result<ExecutionRequest, DelegationError> {
        let schema = &delegation.target_schema;
        request.document = rewrite_selection_sets(
            &request.document,
            schema,
            RootFields::Schema,
            |parent, mut selections| {
                let abstract_parent = parent.is_some_and(|parent| is_abstract(schema, parent.as_str()));
                let has_typename = selections.iter().any(|selection| {
                    matches!(selection, apollo_compiler::ast::Selection::Field(field) if is_typename(field))
                });
                if abstract_parent && !has_typename {
                    selections.push(typename_field());
                }
                selections
            },
        );
        Ok(request)
    }
}
