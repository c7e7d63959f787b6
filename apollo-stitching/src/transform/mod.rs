//! Request and result transforms applied around each delegation.
//!
//! A delegation runs the request side of every transform in order, sends the
//! result to the subschema, then runs the result side in reverse order.

use std::sync::Arc;

use apollo_compiler::Schema;
use apollo_compiler::validation::Valid;
use tower::BoxError;

use crate::context::Extensions;
use crate::delegate::DelegationContext;
use crate::error::DelegationError;
use crate::executor::ExecutionRequest;
use crate::graphql::Response;

mod add_arguments_as_variables;
mod add_selection_sets;
mod add_typename;
mod expand_abstract_types;
mod filter_to_schema;
mod label_incremental;
pub(crate) mod visitor;
mod wrap_concrete_types;

pub use add_arguments_as_variables::AddArgumentsAsVariables;
pub use add_selection_sets::AddSelectionSets;
pub use add_typename::AddTypenameToAbstract;
pub use expand_abstract_types::ExpandAbstractTypes;
pub use filter_to_schema::FilterToSchema;
pub use label_incremental::IncrementalLabels;
pub use label_incremental::LabelIncrementalDirectives;
pub use wrap_concrete_types::WrapConcreteTypes;

/// A rewrite of the requests sent to, and the results received from, a subschema.
///
/// Every method defaults to the identity.
pub trait Transform: Send + Sync {
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Rewrites the subschema's schema as exposed to the gateway.
    fn transform_schema(&self, schema: Arc<Valid<Schema>>) -> Result<Arc<Valid<Schema>>, BoxError> {
        Ok(schema)
    }

    fn transform_request(
        &self,
        request: ExecutionRequest,
        _delegation: &DelegationContext,
        _context: &mut TransformationContext,
    ) -> Result<ExecutionRequest, DelegationError> {
        Ok(request)
    }

    fn transform_result(
        &self,
        response: Response,
        _delegation: &DelegationContext,
        _context: &TransformationContext,
    ) -> Result<Response, DelegationError> {
        Ok(response)
    }
}

/// State a transform keeps between the request and result sides of one delegation.
#[derive(Debug, Default)]
pub struct TransformationContext {
    extensions: Extensions,
}

impl TransformationContext {
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.extensions.get::<T>()
    }

    pub fn get_mut<T: Send + Sync + 'static>(&mut self) -> Option<&mut T> {
        self.extensions.get_mut::<T>()
    }

    pub fn insert<T: Clone + Send + Sync + 'static>(&mut self, value: T) -> Option<T> {
        self.extensions.insert(value)
    }
}

/// Runs the transforms of one delegation.
pub struct Transformer {
    delegation: DelegationContext,
    transforms: Vec<(Arc<dyn Transform>, TransformationContext)>,
}

impl Transformer {
    /// Builds the default pipeline for `delegation`.
    pub fn new(delegation: DelegationContext) -> Self {
        let mut transforms: Vec<Arc<dyn Transform>> = Vec::new();
        if delegation.stitching_info.is_some() {
            transforms.push(Arc::new(ExpandAbstractTypes));
            transforms.push(Arc::new(AddSelectionSets));
            transforms.push(Arc::new(WrapConcreteTypes));
        } else {
            transforms.push(Arc::new(WrapConcreteTypes));
            transforms.push(Arc::new(ExpandAbstractTypes));
        }
        transforms.extend(delegation.transforms.iter().rev().cloned());
        if delegation.args.is_some() {
            transforms.push(Arc::new(AddArgumentsAsVariables));
        }
        transforms.push(Arc::new(FilterToSchema));
        transforms.push(Arc::new(AddTypenameToAbstract));
        transforms.push(Arc::new(LabelIncrementalDirectives));

        Self {
            delegation,
            transforms: transforms
                .into_iter()
                .map(|transform| (transform, TransformationContext::default()))
                .collect(),
        }
    }

    pub fn delegation(&self) -> &DelegationContext {
        &self.delegation
    }

    pub fn transform_request(
        &mut self,
        mut request: ExecutionRequest,
    ) -> Result<ExecutionRequest, DelegationError> {
        for (transform, context) in self.transforms.iter_mut() {
            tracing::trace!(transform = transform.name(), "transforming request");
            request = transform.transform_request(request, &self.delegation, context)?;
        }
        Ok(request)
    }

    pub fn transform_result(&self, mut response: Response) -> Result<Response, DelegationError> {
        for (transform, context) in self.transforms.iter().rev() {
            response = transform.transform_result(response, &self.delegation, context)?;
        }
        Ok(response)
    }

    /// The `@defer` and `@stream` labels sent to the subschema.
    pub fn incremental_labels(&self) -> IncrementalLabels {
        self.transforms
            .iter()
            .find_map(|(_, context)| context.get::<IncrementalLabels>())
            .cloned()
            .unwrap_or_default()
    }
}
