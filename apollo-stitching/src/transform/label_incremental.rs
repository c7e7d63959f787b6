use std::collections::HashMap;

use apollo_compiler::Node;
use apollo_compiler::ast;
use apollo_compiler::name;

use crate::delegate::DelegationContext;
use crate::error::DelegationError;
use crate::executor::ExecutionRequest;
use crate::selection::DEFER_DIRECTIVE_NAME;
use crate::selection::Fragments;
use crate::selection::STREAM_DIRECTIVE_NAME;
use crate::selection::fragments_of;
use crate::transform::Transform;
use crate::transform::TransformationContext;

/// The selections behind each `@defer`/`@stream` label sent to a subschema.
#[derive(Clone, Debug, Default)]
pub struct IncrementalLabels {
    labels: HashMap<String, Vec<ast::Selection>>,
}

impl IncrementalLabels {
    /// The selections of the deferred fragment, or of the streamed field, labelled `label`.
    pub fn get(&self, label: &str) -> Option<&[ast::Selection]> {
        self.labels.get(label).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Gives every `@defer` and `@stream` of the request a unique label, so the
/// incremental payloads can be matched with what they answer.
///
/// Missing labels are numbered, existing ones get a `_` prefix so the two can't
/// collide.
#[derive(Clone, Copy, Debug, Default)]
pub struct LabelIncrementalDirectives;

struct Labeler<'a> {
    fragments: &'a Fragments,
    next: usize,
    labels: IncrementalLabels,
}

impl Labeler<'_> {
    fn label(&mut self, directives: &mut ast::DirectiveList, directive_name: &str) -> Option<String> {
        let directive = directives
            .0
            .iter_mut()
            .find(|directive| directive.name.as_str() == directive_name)?;
        let directive = directive.make_mut();
        let existing = directive
            .arguments
            .iter()
            .position(|argument| argument.name.as_str() == "label");
        let label = match existing.map(|index| directive.arguments[index].value.as_ref()) {
            Some(ast::Value::String(label)) => format!("_{label}"),
            _ => {
                let label = self.next.to_string();
                self.next += 1;
                label
            }
        };
        let argument = Node::new(ast::Argument {
            name: name!("label"),
            value: Node::new(ast::Value::String(label.clone())),
        });
        match existing {
            Some(index) => directive.arguments[index] = argument,
            None => directive.arguments.push(argument),
        }
        Some(label)
    }

    fn visit(&mut self, selections: &mut [ast::Selection]) {
        for selection in selections.iter_mut() {
            match selection {
                ast::Selection::Field(field) => {
                    let field = field.make_mut();
                    if let Some(label) = self.label(&mut field.directives, STREAM_DIRECTIVE_NAME) {
                        self.labels
                            .labels
                            .insert(label, field.selection_set.clone());
                    }
                    self.visit(&mut field.selection_set);
                }
                ast::Selection::InlineFragment(inline) => {
                    let inline = inline.make_mut();
                    self.visit(&mut inline.selection_set);
                    if let Some(label) = self.label(&mut inline.directives, DEFER_DIRECTIVE_NAME) {
                        self.labels
                            .labels
                            .insert(label, inline.selection_set.clone());
                    }
                }
                ast::Selection::FragmentSpread(spread) => {
                    let fragment_selections = self
                        .fragments
                        .get(&spread.fragment_name)
                        .map(|fragment| fragment.selection_set.clone())
                        .unwrap_or_default();
                    let spread = spread.make_mut();
                    if let Some(label) = self.label(&mut spread.directives, DEFER_DIRECTIVE_NAME) {
                        self.labels.labels.insert(label, fragment_selections);
                    }
                }
            }
        }
    }
}

impl Transform for LabelIncrementalDirectives {
    fn name(&self) -> &'static str {
        "label_incremental_directives"
    }

    fn transform_request(
        &self,
        mut request: ExecutionRequest,
        _delegation: &DelegationContext,
        context: &mut TransformationContext,
    ) -> Result<ExecutionRequest, DelegationError> {
        if !request.has_incremental_directives() {
            return Ok(request);
        }
        let fragments = fragments_of(&request.document);
        let mut labeler = Labeler {
            fragments: &fragments,
            next: 0,
            labels: IncrementalLabels::default(),
        };
        for definition in request.document.definitions.iter_mut() {
            match definition {
                ast::Definition::OperationDefinition(operation) => {
                    labeler.visit(&mut operation.make_mut().selection_set)
                }
                ast::Definition::FragmentDefinition(fragment) => {
                    labeler.visit(&mut fragment.make_mut().selection_set)
                }
                _ => {}
            }
        }
        tracing::debug!(labels = labeler.labels.len(), "labelled incremental directives");
        context.insert(labeler.labels);
        Ok(request)
    }
}
