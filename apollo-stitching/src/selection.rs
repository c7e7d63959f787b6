//! Selection set helpers over the `apollo-compiler` AST.
//!
//! Field collection follows the GraphQL `CollectFields` algorithm: fragments are
//! expanded when their type condition applies, `@skip`/`@include` are honored and
//! fields are grouped by response key.

use apollo_compiler::Name;
use apollo_compiler::Node;
use apollo_compiler::Schema;
use apollo_compiler::ast;
use apollo_compiler::name;
use apollo_compiler::schema::ExtendedType;
use indexmap::IndexMap;
use indexmap::IndexSet;

use crate::json_ext::Object;
use crate::json_ext::Value;

pub(crate) const TYPENAME: &str = "__typename";
pub(crate) const DEFER_DIRECTIVE_NAME: &str = "defer";
pub(crate) const STREAM_DIRECTIVE_NAME: &str = "stream";

/// Fragment definitions of a document, by name.
pub(crate) type Fragments = IndexMap<Name, Node<ast::FragmentDefinition>>;

/// Fields grouped by response key, in document order.
pub(crate) type CollectedFields = IndexMap<String, Vec<Node<ast::Field>>>;

pub(crate) fn fragments_of(document: &ast::Document) -> Fragments {
    document
        .definitions
        .iter()
        .filter_map(|definition| match definition {
            ast::Definition::FragmentDefinition(fragment) => {
                Some((fragment.name.clone(), fragment.clone()))
            }
            _ => None,
        })
        .collect()
}

pub(crate) fn response_key(field: &ast::Field) -> &Name {
    field.alias.as_ref().unwrap_or(&field.name)
}

pub(crate) fn is_typename(field: &ast::Field) -> bool {
    field.name.as_str() == TYPENAME
}

/// Builds a `__typename` field selection.
pub(crate) fn typename_field() -> ast::Selection {
    ast::Selection::Field(Node::new(ast::Field {
        alias: None,
        name: name!("__typename"),
        arguments: Vec::new(),
        directives: ast::DirectiveList::default(),
        selection_set: Vec::new(),
    }))
}

pub(crate) fn has_directive(directives: &ast::DirectiveList, name: &str) -> bool {
    directives.iter().any(|directive| directive.name.as_str() == name)
}

pub(crate) fn directive_argument<'a>(
    directive: &'a ast::Directive,
    name: &str,
) -> Option<&'a Node<ast::Value>> {
    directive
        .arguments
        .iter()
        .find(|argument| argument.name.as_str() == name)
        .map(|argument| &argument.value)
}

/// Evaluates `@skip` and `@include` against the operation variables.
pub(crate) fn should_include(directives: &ast::DirectiveList, variables: &Object) -> bool {
    let condition = |directive_name: &str| {
        directives
            .iter()
            .find(|directive| directive.name.as_str() == directive_name)
            .and_then(|directive| directive_argument(directive, "if"))
            .map(|value| match value.as_ref() {
                ast::Value::Boolean(b) => *b,
                ast::Value::Variable(name) => {
                    matches!(variables.get(name.as_str()), Some(Value::Bool(true)))
                }
                _ => false,
            })
    };
    if condition("skip") == Some(true) {
        return false;
    }
    condition("include") != Some(false)
}

pub(crate) fn is_abstract(schema: &Schema, type_name: &str) -> bool {
    matches!(
        schema.types.get(type_name),
        Some(ExtendedType::Interface(_)) | Some(ExtendedType::Union(_))
    )
}

pub(crate) fn is_composite(schema: &Schema, type_name: &str) -> bool {
    matches!(
        schema.types.get(type_name),
        Some(ExtendedType::Object(_))
            | Some(ExtendedType::Interface(_))
            | Some(ExtendedType::Union(_))
    )
}

pub(crate) fn is_leaf(schema: &Schema, type_name: &str) -> bool {
    matches!(
        schema.types.get(type_name),
        Some(ExtendedType::Scalar(_)) | Some(ExtendedType::Enum(_))
    )
}

/// Whether `object` implements the interface `interface` in `schema`.
pub(crate) fn implements(schema: &Schema, object: &str, interface: &str) -> bool {
    match schema.types.get(object) {
        Some(ExtendedType::Object(def)) => def
            .implements_interfaces
            .iter()
            .any(|implemented| implemented.name.as_str() == interface),
        Some(ExtendedType::Interface(def)) => def
            .implements_interfaces
            .iter()
            .any(|implemented| implemented.name.as_str() == interface),
        _ => false,
    }
}

/// The object types a value of `type_name` may have at runtime.
pub(crate) fn possible_types(schema: &Schema, type_name: &str) -> Vec<Name> {
    match schema.types.get(type_name) {
        Some(ExtendedType::Object(def)) => vec![def.name.clone()],
        Some(ExtendedType::Union(def)) => def
            .members
            .iter()
            .map(|member| member.name.clone())
            .collect(),
        Some(ExtendedType::Interface(_)) => schema
            .types
            .iter()
            .filter_map(|(name, ty)| match ty {
                ExtendedType::Object(_) if implements(schema, name, type_name) => {
                    Some(name.clone())
                }
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Whether an object of type `concrete` (or any possible type of it) may match `condition`.
pub(crate) fn types_overlap(schema: &Schema, condition: &str, concrete: &str) -> bool {
    if condition == concrete {
        return true;
    }
    let conditions: IndexSet<Name> = possible_types(schema, condition).into_iter().collect();
    possible_types(schema, concrete)
        .iter()
        .any(|possible| conditions.contains(possible))
}

/// Whether a fragment with type condition `condition` applies to an object of type `type_name`.
pub(crate) fn does_fragment_condition_match(
    schema: &Schema,
    condition: Option<&str>,
    type_name: &str,
) -> bool {
    match condition {
        None => true,
        Some(condition) if condition == type_name => true,
        Some(condition) => {
            is_abstract(schema, condition)
                && possible_types(schema, condition)
                    .iter()
                    .any(|possible| possible.as_str() == type_name)
        }
    }
}

/// Groups the fields selected on an object of type `type_name` by response key.
pub(crate) fn collect_fields(
    schema: &Schema,
    fragments: &Fragments,
    variables: &Object,
    type_name: &str,
    selections: &[ast::Selection],
) -> CollectedFields {
    let mut fields = CollectedFields::new();
    let mut visited = IndexSet::new();
    collect_fields_into(
        schema,
        fragments,
        variables,
        type_name,
        selections,
        &mut fields,
        &mut visited,
    );
    fields
}

fn collect_fields_into(
    schema: &Schema,
    fragments: &Fragments,
    variables: &Object,
    type_name: &str,
    selections: &[ast::Selection],
    fields: &mut CollectedFields,
    visited: &mut IndexSet<Name>,
) {
    for selection in selections {
        match selection {
            ast::Selection::Field(field) => {
                if !should_include(&field.directives, variables) {
                    continue;
                }
                fields
                    .entry(response_key(field).to_string())
                    .or_default()
                    .push(field.clone());
            }
            ast::Selection::InlineFragment(inline) => {
                if !should_include(&inline.directives, variables)
                    || !does_fragment_condition_match(
                        schema,
                        inline.type_condition.as_ref().map(|name| name.as_str()),
                        type_name,
                    )
                {
                    continue;
                }
                collect_fields_into(
                    schema,
                    fragments,
                    variables,
                    type_name,
                    &inline.selection_set,
                    fields,
                    visited,
                );
            }
            ast::Selection::FragmentSpread(spread) => {
                if !should_include(&spread.directives, variables)
                    || !visited.insert(spread.fragment_name.clone())
                {
                    continue;
                }
                let Some(fragment) = fragments.get(&spread.fragment_name) else {
                    continue;
                };
                if !does_fragment_condition_match(
                    schema,
                    Some(fragment.type_condition.as_str()),
                    type_name,
                ) {
                    continue;
                }
                collect_fields_into(
                    schema,
                    fragments,
                    variables,
                    type_name,
                    &fragment.selection_set,
                    fields,
                    visited,
                );
            }
        }
    }
}

/// Collects the sub-fields of all `field_nodes`, as selected on an object of type `type_name`.
pub(crate) fn collect_subfields(
    schema: &Schema,
    fragments: &Fragments,
    variables: &Object,
    type_name: &str,
    field_nodes: &[Node<ast::Field>],
) -> CollectedFields {
    let mut fields = CollectedFields::new();
    let mut visited = IndexSet::new();
    for node in field_nodes {
        collect_fields_into(
            schema,
            fragments,
            variables,
            type_name,
            &node.selection_set,
            &mut fields,
            &mut visited,
        );
    }
    fields
}

/// Parses a selection set such as `{ id name }`. The braces are optional.
pub fn parse_selection_set(source: &str) -> Result<Vec<ast::Selection>, String> {
    let trimmed = source.trim();
    let query = if trimmed.starts_with('{') {
        trimmed.to_string()
    } else {
        format!("{{ {trimmed} }}")
    };
    let document = ast::Document::parse(query, "selection_set.graphql")
        .map_err(|invalid| invalid.errors.to_string())?;
    document
        .definitions
        .into_iter()
        .find_map(|definition| match definition {
            ast::Definition::OperationDefinition(operation) => {
                Some(operation.selection_set.clone())
            }
            _ => None,
        })
        .ok_or_else(|| format!("'{source}' is not a selection set"))
}

/// Prints a selection set on a single line, e.g. `{ id name }`.
pub(crate) fn print_selection_set(selections: &[ast::Selection]) -> String {
    let mut document = ast::Document::new();
    document
        .definitions
        .push(ast::Definition::OperationDefinition(Node::new(
            ast::OperationDefinition {
                operation_type: ast::OperationType::Query,
                name: None,
                variables: Vec::new(),
                directives: ast::DirectiveList::default(),
                selection_set: selections.to_vec(),
            },
        )));
    document.serialize().no_indent().to_string()
}

/// Whether every field of `selections` is available on `type_name`, in at least one of
/// the `schemas`, including nested selections.
pub(crate) fn types_contain_selection_set(
    schemas: &[&Schema],
    type_name: &str,
    selections: &[ast::Selection],
) -> bool {
    selections.iter().all(|selection| match selection {
        ast::Selection::Field(field) => {
            if is_typename(field) {
                return true;
            }
            let owners: Vec<(&Schema, Name)> = schemas
                .iter()
                .filter_map(|schema| {
                    schema
                        .type_field(type_name, field.name.as_str())
                        .ok()
                        .map(|def| (*schema, def.ty.inner_named_type().clone()))
                })
                .collect();
            if owners.is_empty() {
                return false;
            }
            if field.selection_set.is_empty() {
                return true;
            }
            let field_type = owners[0].1.clone();
            let nested: Vec<&Schema> = owners.iter().map(|(schema, _)| *schema).collect();
            types_contain_selection_set(&nested, field_type.as_str(), &field.selection_set)
        }
        ast::Selection::InlineFragment(inline) => {
            let condition = inline
                .type_condition
                .as_ref()
                .map(|name| name.as_str())
                .unwrap_or(type_name);
            types_contain_selection_set(schemas, condition, &inline.selection_set)
        }
        // key selection sets never contain named fragments
        ast::Selection::FragmentSpread(_) => false,
    })
}

/// Every type name referenced by the type conditions of `selections`.
pub(crate) fn referenced_type_conditions(selections: &[ast::Selection]) -> Vec<Name> {
    let mut names = Vec::new();
    for selection in selections {
        match selection {
            ast::Selection::Field(field) => {
                names.extend(referenced_type_conditions(&field.selection_set))
            }
            ast::Selection::InlineFragment(inline) => {
                names.extend(inline.type_condition.iter().cloned());
                names.extend(referenced_type_conditions(&inline.selection_set));
            }
            ast::Selection::FragmentSpread(_) => {}
        }
    }
    names
}

/// Converts an AST input value to JSON, substituting variables.
pub(crate) fn value_to_json(value: &ast::Value, variables: &Object) -> Value {
    match value {
        ast::Value::Null => Value::Null,
        ast::Value::Enum(name) => Value::String(name.as_str().into()),
        ast::Value::Variable(name) => variables
            .get(name.as_str())
            .cloned()
            .unwrap_or(Value::Null),
        ast::Value::String(s) => Value::String(s.as_str().into()),
        ast::Value::Float(f) => f
            .as_str()
            .parse::<serde_json::Number>()
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ast::Value::Int(i) => i
            .as_str()
            .parse::<serde_json::Number>()
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ast::Value::Boolean(b) => Value::Bool(*b),
        ast::Value::List(items) => Value::Array(
            items
                .iter()
                .map(|item| value_to_json(item, variables))
                .collect(),
        ),
        ast::Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(name, value)| (name.as_str().into(), value_to_json(value, variables)))
                .collect(),
        ),
    }
}

/// Variables referenced anywhere in `selections`, including directive arguments.
pub(crate) fn collect_variables(selections: &[ast::Selection], used: &mut IndexSet<Name>) {
    fn from_value(value: &ast::Value, used: &mut IndexSet<Name>) {
        match value {
            ast::Value::Variable(name) => {
                used.insert(name.clone());
            }
            ast::Value::List(items) => items.iter().for_each(|item| from_value(item, used)),
            ast::Value::Object(fields) => {
                fields.iter().for_each(|(_, value)| from_value(value, used))
            }
            _ => {}
        }
    }
    fn from_directives(directives: &ast::DirectiveList, used: &mut IndexSet<Name>) {
        for directive in directives.iter() {
            for argument in &directive.arguments {
                from_value(&argument.value, used);
            }
        }
    }

    for selection in selections {
        match selection {
            ast::Selection::Field(field) => {
                for argument in &field.arguments {
                    from_value(&argument.value, used);
                }
                from_directives(&field.directives, used);
                collect_variables(&field.selection_set, used);
            }
            ast::Selection::InlineFragment(inline) => {
                from_directives(&inline.directives, used);
                collect_variables(&inline.selection_set, used);
            }
            ast::Selection::FragmentSpread(spread) => from_directives(&spread.directives, used),
        }
    }
}

/// Names of the fragments spread anywhere in `selections`.
pub(crate) fn collect_fragment_spreads(selections: &[ast::Selection], used: &mut IndexSet<Name>) {
    for selection in selections {
        match selection {
            ast::Selection::Field(field) => collect_fragment_spreads(&field.selection_set, used),
            ast::Selection::InlineFragment(inline) => {
                collect_fragment_spreads(&inline.selection_set, used)
            }
            ast::Selection::FragmentSpread(spread) => {
                used.insert(spread.fragment_name.clone());
            }
        }
    }
}
