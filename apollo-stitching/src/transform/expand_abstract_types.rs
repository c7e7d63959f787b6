use std::collections::HashMap;
use std::collections::HashSet;

use apollo_compiler::Name;
use apollo_compiler::Node;
use apollo_compiler::Schema;
use apollo_compiler::ast;
use apollo_compiler::schema::ExtendedType;
use indexmap::IndexMap;

use crate::delegate::DelegationContext;
use crate::error::DelegationError;
use crate::executor::ExecutionRequest;
use crate::selection::fragments_of;
use crate::selection::is_abstract;
use crate::selection::is_typename;
use crate::selection::possible_types;
use crate::selection::typename_field;
use crate::transform::Transform;
use crate::transform::TransformationContext;
use crate::transform::visitor::RootFields;
use crate::transform::visitor::inline_fragment;
use crate::transform::visitor::rewrite_selection_sets;

/// Replaces fragments on abstract types the target schema does not have (or has
/// as an object type) with one fragment per implementation it does have.
///
/// Fields added to an interface by the gateway only are selected through
/// fragments on each implementation as well.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExpandAbstractTypes;

struct AbstractTypeMaps {
    /// Gateway abstract types, with the implementations known to the target.
    possible_types: IndexMap<Name, Vec<Name>>,
    /// Fields of gateway interfaces the target's interface does not declare.
    interface_extensions: HashMap<Name, HashSet<Name>>,
}

impl AbstractTypeMaps {
    fn new(gateway: &Schema, target: &Schema) -> Self {
        let mut possible = IndexMap::new();
        let mut interface_extensions = HashMap::new();
        for (name, ty) in &gateway.types {
            if !is_abstract(gateway, name.as_str()) {
                continue;
            }
            match (ty, target.types.get(name)) {
                (ExtendedType::Interface(gateway_interface), Some(ExtendedType::Interface(target_interface))) => {
                    let extensions: HashSet<Name> = gateway_interface
                        .fields
                        .keys()
                        .filter(|field| !target_interface.fields.contains_key(*field))
                        .cloned()
                        .collect();
                    if !extensions.is_empty() {
                        interface_extensions.insert(name.clone(), extensions);
                    }
                }
                (_, Some(ExtendedType::Interface(_) | ExtendedType::Union(_))) => {}
                _ => {
                    let implementations = possible_types(gateway, name.as_str())
                        .into_iter()
                        .filter(|implementation| target.types.contains_key(implementation))
                        .collect();
                    possible.insert(name.clone(), implementations);
                }
            }
        }
        Self {
            possible_types: possible,
            interface_extensions,
        }
    }
}

fn expanded_fragment_name(fragment: &Name, possible_type: &Name) -> Option<Name> {
    Name::new(&format!("{fragment}_{possible_type}")).ok()
}

impl Transform for ExpandAbstractTypes {
    fn name(&self) -> &'static str {
        "expand_abstract_types"
    }

    fn transform_request(
        &self,
        mut request: ExecutionRequest,
        delegation: &DelegationContext,
        _context: &mut TransformationContext,
    ) -> Result<ExecutionRequest, DelegationError> {
        let gateway = delegation.info.schema();
        let target = &delegation.transformed_schema;
        let fragments = fragments_of(&request.document);
        for fragment in fragments.values() {
            if !gateway.types.contains_key(&fragment.type_condition) {
                return Err(DelegationError::UnknownFragmentType {
                    fragment: fragment.name.to_string(),
                    type_name: fragment.type_condition.to_string(),
                });
            }
        }

        let maps = AbstractTypeMaps::new(gateway, target);
        if maps.possible_types.is_empty() && maps.interface_extensions.is_empty() {
            return Ok(request);
        }
        let fragment_conditions: HashMap<Name, Name> = fragments
            .iter()
            .map(|(name, fragment)| (name.clone(), fragment.type_condition.clone()))
            .collect();

        let returned = delegation.return_type.inner_named_type().clone();
        let mut document = rewrite_selection_sets(
            &request.document,
            gateway,
            RootFields::Returning(&returned),
            |parent, selections| expand_selections(gateway, &maps, &fragment_conditions, parent, selections),
        );

        let mut expanded_fragments = Vec::new();
        for definition in &document.definitions {
            let ast::Definition::FragmentDefinition(fragment) = definition else {
                continue;
            };
            let Some(implementations) = maps.possible_types.get(&fragment.type_condition) else {
                continue;
            };
            for implementation in implementations {
                let Some(name) = expanded_fragment_name(&fragment.name, implementation) else {
                    continue;
                };
                expanded_fragments.push(ast::Definition::FragmentDefinition(Node::new(
                    ast::FragmentDefinition {
                        name,
                        type_condition: implementation.clone(),
                        directives: fragment.directives.clone(),
                        selection_set: fragment.selection_set.clone(),
                    },
                )));
            }
        }
        document.definitions.extend(expanded_fragments);
        request.document = document;
        Ok(request)
    }
}

fn expand_selections(
    gateway: &Schema,
    maps: &AbstractTypeMaps,
    fragment_conditions: &HashMap<Name, Name>,
    parent: Option<&Name>,
    selections: Vec<ast::Selection>,
) -> Vec<ast::Selection> {
    let mut expanded = Vec::with_capacity(selections.len());
    let mut added = Vec::new();
    for selection in selections {
        match &selection {
            ast::Selection::InlineFragment(inline) => {
                if let Some(implementations) = inline
                    .type_condition
                    .as_ref()
                    .and_then(|condition| maps.possible_types.get(condition))
                {
                    for implementation in implementations {
                        added.push(ast::Selection::InlineFragment(Node::new(ast::InlineFragment {
                            type_condition: Some(implementation.clone()),
                            directives: inline.directives.clone(),
                            selection_set: inline.selection_set.clone(),
                        })));
                    }
                }
            }
            ast::Selection::FragmentSpread(spread) => {
                if let Some(implementations) = fragment_conditions
                    .get(&spread.fragment_name)
                    .and_then(|condition| maps.possible_types.get(condition))
                {
                    for implementation in implementations {
                        if let Some(fragment_name) =
                            expanded_fragment_name(&spread.fragment_name, implementation)
                        {
                            added.push(ast::Selection::FragmentSpread(Node::new(ast::FragmentSpread {
                                fragment_name,
                                directives: spread.directives.clone(),
                            })));
                        }
                    }
                }
            }
            ast::Selection::Field(_) => {}
        }
        expanded.push(selection);
    }
    expanded.extend(added);

    let Some(parent) = parent else {
        return expanded;
    };

    if let Some(extensions) = maps.interface_extensions.get(parent) {
        let (extension_fields, mut kept): (Vec<_>, Vec<_>) =
            expanded.into_iter().partition(|selection| {
                matches!(selection, ast::Selection::Field(field) if extensions.contains(&field.name))
            });
        if !extension_fields.is_empty() {
            for implementation in possible_types(gateway, parent.as_str()) {
                kept.push(inline_fragment(implementation, extension_fields.clone()));
            }
            if !has_typename(&kept) {
                kept.push(typename_field());
            }
        }
        expanded = kept;
    }

    if maps.possible_types.contains_key(parent) && !has_typename(&expanded) {
        expanded.push(typename_field());
    }
    expanded
}

fn has_typename(selections: &[ast::Selection]) -> bool {
    selections
        .iter()
        .any(|selection| matches!(selection, ast::Selection::Field(field) if is_typename(field)))
}
