//! Information about the field being resolved on the stitched schema.

use std::sync::Arc;

use apollo_compiler::Name;
use apollo_compiler::Node;
use apollo_compiler::Schema;
use apollo_compiler::ast;
use apollo_compiler::validation::Valid;
use derivative::Derivative;

use crate::json_ext::Object;
use crate::json_ext::Path;
use crate::selection::Fragments;
use crate::stitching_info::StitchingInfo;

/// The client operation being executed on the stitched schema.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct OperationInfo {
    #[derivative(Debug = "ignore")]
    pub(crate) schema: Arc<Valid<Schema>>,
    #[derivative(Debug = "ignore")]
    pub(crate) stitching_info: Option<Arc<StitchingInfo>>,
    pub(crate) operation: Node<ast::OperationDefinition>,
    pub(crate) fragments: Fragments,
    pub(crate) variables: Object,
}

impl OperationInfo {
    pub fn new(
        schema: Arc<Valid<Schema>>,
        operation: Node<ast::OperationDefinition>,
        fragments: Fragments,
        variables: Object,
    ) -> Self {
        Self {
            schema,
            stitching_info: None,
            operation,
            fragments,
            variables,
        }
    }

    pub(crate) fn with_stitching_info(mut self, stitching_info: Arc<StitchingInfo>) -> Self {
        self.stitching_info = Some(stitching_info);
        self
    }

    pub fn schema(&self) -> &Valid<Schema> {
        &self.schema
    }

    pub fn variables(&self) -> &Object {
        &self.variables
    }
}

/// The field being resolved, with its position in the response.
///
/// Every delegation starts from one of these: it names the root field to delegate,
/// the selections to forward and where the result lands in the stitched response.
#[derive(Clone, Debug)]
pub struct ResolveInfo {
    pub field_name: Name,
    pub response_key: Name,
    pub field_nodes: Vec<Node<ast::Field>>,
    pub return_type: ast::Type,
    pub parent_type: Name,
    pub path: Path,
    pub operation: Arc<OperationInfo>,
}

impl ResolveInfo {
    /// The info of a field selected under this one.
    pub(crate) fn child(
        &self,
        parent_type: Name,
        field_nodes: Vec<Node<ast::Field>>,
        return_type: ast::Type,
        path: Path,
    ) -> Option<ResolveInfo> {
        let first = field_nodes.first()?;
        Some(ResolveInfo {
            field_name: first.name.clone(),
            response_key: first.alias.clone().unwrap_or_else(|| first.name.clone()),
            field_nodes,
            return_type,
            parent_type,
            path,
            operation: self.operation.clone(),
        })
    }

    /// The same field, for the list item at `index`.
    pub(crate) fn at_index(&self, index: usize) -> ResolveInfo {
        let mut info = self.clone();
        info.path.push(index);
        info
    }

    pub fn schema(&self) -> &Valid<Schema> {
        &self.operation.schema
    }

    pub fn stitching_info(&self) -> Option<&Arc<StitchingInfo>> {
        self.operation.stitching_info.as_ref()
    }

    pub fn fragments(&self) -> &Fragments {
        &self.operation.fragments
    }

    pub fn variables(&self) -> &Object {
        &self.operation.variables
    }
}
