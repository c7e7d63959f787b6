use apollo_compiler::ast;

use crate::delegate::DelegationContext;
use crate::error::DelegationError;
use crate::executor::ExecutionRequest;
use crate::selection::response_key;
use crate::transform::Transform;
use crate::transform::TransformationContext;
use crate::transform::visitor::RootFields;
use crate::transform::visitor::rewrite_selection_sets;

/// Adds the fields the gateway needs to merge a type: the key selections of
/// merged types and the requirements of fields computed from other fields.
#[derive(Clone, Copy, Debug, Default)]
pub struct AddSelectionSets;

impl Transform for AddSelectionSets {
    fn name(&self) -> &'static str {
        "add_selection_sets"
    }

    fn transform_request(
        &self,
        mut request: ExecutionRequest,
        delegation: &DelegationContext,
        _context: &mut TransformationContext,
    ) -> Result<ExecutionRequest, DelegationError> {
        let Some(stitching_info) = &delegation.stitching_info else {
            return Ok(request);
        };
        let returned = delegation.return_type.inner_named_type().clone();
        request.document = rewrite_selection_sets(
            &request.document,
            delegation.info.schema(),
            RootFields::Returning(&returned),
            |parent, mut selections| {
                let Some(parent) = parent else {
                    return selections;
                };
                let mut additions = Vec::new();
                if let Some(by_type) = stitching_info.selection_sets_by_type.get(parent) {
                    additions.extend(by_type.iter().cloned());
                }
                if let Some(by_field) = stitching_info.selection_sets_by_field.get(parent) {
                    for selection in &selections {
                        if let ast::Selection::Field(field) = selection {
                            if let Some(required) = by_field.get(&field.name) {
                                additions.extend(required.iter().cloned());
                            }
                        }
                    }
                }
                for addition in additions {
                    if !is_selected(&selections, &addition) {
                        selections.push(addition);
                    }
                }
                selections
            },
        );
        Ok(request)
    }
}

/// Whether a leaf field addition is already selected under the same response key.
fn is_selected(selections: &[ast::Selection], addition: &ast::Selection) -> bool {
    let ast::Selection::Field(added) = addition else {
        return false;
    };
    if !added.selection_set.is_empty() {
        return false;
    }
    selections.iter().any(|selection| {
        matches!(selection, ast::Selection::Field(field)
            if response_key(field) == response_key(added)
                && field.name == added.name
                && field.arguments == added.arguments)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegate::test_support::stitched_delegation_context;
    use crate::executor::OperationKind;

    #[test]
    fn adds_key_fields_of_merged_types() {
        let delegation = stitched_delegation_context("{ product(upc: 1) { name } }", "product");
        let request = ExecutionRequest::new(
            ast::Document::parse("{ product(upc: 1) { name } }", "query.graphql").unwrap(),
            OperationKind::Query,
            delegation.context.clone(),
        );
        let request = AddSelectionSets
            .transform_request(request, &delegation, &mut TransformationContext::default())
            .unwrap();
        let printed = request.document.serialize().no_indent().to_string();
        assert!(printed.contains("product(upc: 1) { name upc __typename }"), "{printed}");
    }
}
