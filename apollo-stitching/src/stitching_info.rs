//! Request independent metadata of a stitched schema.
//!
//! Built once from the gateway schema and its subschemas: which subschema owns
//! each root field, which selections must always be requested for merged types
//! and, per merged type, which subschemas can provide which fields.

use std::collections::HashMap;
use std::sync::Arc;

use apollo_compiler::Name;
use apollo_compiler::Schema;
use apollo_compiler::ast;
use apollo_compiler::schema::ExtendedType;
use derivative::Derivative;
use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::error::StitchingError;
use crate::executor::OperationKind;
use crate::json_ext::Value;
use crate::selection::parse_selection_set;
use crate::selection::print_selection_set;
use crate::selection::referenced_type_conditions;
use crate::selection::typename_field;
use crate::selection::types_contain_selection_set;
use crate::subschema::ArgsFn;
use crate::subschema::ArgsFromKeysFn;
use crate::subschema::KeyFn;
use crate::subschema::MergedTypeConfig;
use crate::subschema::MergedTypeResolverFn;
use crate::subschema::Subschema;
use crate::subschema::SubschemaId;
use crate::subschema::ValuesFromResultsFn;

/// How a merged type is fetched from one subschema.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub(crate) enum MergedResolver {
    Custom(#[derivative(Debug = "ignore")] MergedTypeResolverFn),
    /// One root field call per known object.
    Single {
        field_name: String,
        #[derivative(Debug = "ignore")]
        args: ArgsFn,
    },
    /// One root field call for all the keys collected during a tick.
    Batched {
        field_name: String,
        #[derivative(Debug = "ignore")]
        key: KeyFn,
        #[derivative(Debug = "ignore")]
        args_from_keys: ArgsFromKeysFn,
        #[derivative(Debug = "ignore")]
        values_from_results: Option<ValuesFromResultsFn>,
    },
}

impl MergedResolver {
    fn from_config(config: &MergedTypeConfig) -> Option<Self> {
        if let Some(resolve) = &config.resolve {
            return Some(MergedResolver::Custom(resolve.clone()));
        }
        let field_name = config.field_name.clone()?;
        if let Some(args_from_keys) = &config.args_from_keys {
            let key: KeyFn = match &config.key {
                Some(key) => key.clone(),
                None => Arc::new(|object: &Value| object.clone()),
            };
            return Some(MergedResolver::Batched {
                field_name,
                key,
                args_from_keys: args_from_keys.clone(),
                values_from_results: config.values_from_results.clone(),
            });
        }
        config.args.as_ref().map(|args| MergedResolver::Single {
            field_name,
            args: args.clone(),
        })
    }
}

/// One way of fetching a merged type from a subschema: the main configuration or
/// one of its entry points.
#[derive(Clone, Debug)]
pub(crate) struct MergeEntry {
    /// Fields the gateway must know before using this entry.
    pub(crate) selection_set: Option<Vec<ast::Selection>>,
    pub(crate) resolver: MergedResolver,
}

/// Static metadata of a type merged across subschemas.
#[derive(Debug)]
pub struct MergedTypeInfo {
    pub(crate) type_name: Name,
    /// Subschemas defining the type, in registration order.
    pub(crate) subschemas: Vec<SubschemaId>,
    /// For each source subschema, the other subschemas the type can be fetched from.
    pub(crate) target_subschemas: HashMap<SubschemaId, Vec<SubschemaId>>,
    /// Fields provided by exactly one subschema.
    pub(crate) unique_fields: HashMap<Name, SubschemaId>,
    /// Fields provided by several subschemas, in registration order.
    pub(crate) non_unique_fields: HashMap<Name, Vec<SubschemaId>>,
    pub(crate) entries: HashMap<SubschemaId, Vec<MergeEntry>>,
    /// Requirements of individual fields, per subschema resolving them.
    pub(crate) field_selection_sets: HashMap<SubschemaId, HashMap<Name, Vec<ast::Selection>>>,
    /// Whether `.0`'s fields of the type are enough to use `.1`'s main entry.
    pub(crate) contains: HashMap<(SubschemaId, SubschemaId), bool>,
    pub(crate) canonical: Option<SubschemaId>,
    pub(crate) canonical_fields: HashMap<Name, SubschemaId>,
}

impl MergedTypeInfo {
    pub fn type_name(&self) -> &Name {
        &self.type_name
    }

    /// Whether a single subschema provides `field`.
    pub fn is_unique_field(&self, field: &str) -> bool {
        self.unique_fields.contains_key(field)
    }
}

/// A memoized delegation plan: stages of `(target, entry, indices of the fields to fetch)`.
pub(crate) type CachedPlan = Vec<Vec<(SubschemaId, usize, Vec<usize>)>>;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct PlanKey {
    pub(crate) type_name: Name,
    pub(crate) source: SubschemaId,
    /// `(response key, field name, printed sub-selections)` of the fields to fetch.
    pub(crate) fields: Vec<(String, Name, String)>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct ContainsKey {
    pub(crate) type_name: Name,
    pub(crate) sources: Vec<SubschemaId>,
    pub(crate) selection_set: String,
}

/// Metadata of a stitched schema. Lives as long as the schema.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct StitchingInfo {
    #[derivative(Debug = "ignore")]
    pub(crate) subschemas: Vec<Arc<Subschema>>,
    pub(crate) selection_sets_by_type: HashMap<Name, Vec<ast::Selection>>,
    pub(crate) selection_sets_by_field: HashMap<Name, HashMap<Name, Vec<ast::Selection>>>,
    pub(crate) merged_types: HashMap<Name, MergedTypeInfo>,
    pub(crate) root_fields: HashMap<(OperationKind, Name), SubschemaId>,
    #[derivative(Debug = "ignore")]
    pub(crate) plans: Mutex<HashMap<PlanKey, Arc<CachedPlan>>>,
    #[derivative(Debug = "ignore")]
    pub(crate) contains_cache: Mutex<HashMap<ContainsKey, bool>>,
}

impl StitchingInfo {
    pub(crate) fn new(
        gateway: &Schema,
        subschemas: Vec<Arc<Subschema>>,
    ) -> Result<Self, StitchingError> {
        let mut root_fields = HashMap::new();
        for subschema in &subschemas {
            for kind in [
                OperationKind::Query,
                OperationKind::Mutation,
                OperationKind::Subscription,
            ] {
                let schema = subschema.transformed_schema();
                let Some(root_type) = schema.root_operation(kind.into()) else {
                    continue;
                };
                if let Some(ExtendedType::Object(root)) = schema.types.get(root_type) {
                    for field in root.fields.keys() {
                        root_fields
                            .entry((kind, field.clone()))
                            .or_insert(subschema.id());
                    }
                }
            }
        }

        let mut selection_sets_by_type: HashMap<Name, Vec<ast::Selection>> = HashMap::new();
        let mut selection_sets_by_field: HashMap<Name, HashMap<Name, Vec<ast::Selection>>> =
            HashMap::new();
        let mut merged_types = HashMap::new();

        for (type_name, ty) in &gateway.types {
            if !matches!(ty, ExtendedType::Object(_)) || ty.is_built_in() {
                continue;
            }
            let candidates: Vec<&Arc<Subschema>> = subschemas
                .iter()
                .filter(|subschema| {
                    matches!(
                        subschema.transformed_schema().types.get(type_name),
                        Some(ExtendedType::Object(_))
                    )
                })
                .collect();

            for subschema in &candidates {
                if let Some(config) = subschema.merge.get(type_name.as_str()) {
                    for (field, field_config) in &config.fields {
                        let Some(source) = &field_config.selection_set else {
                            continue;
                        };
                        let selections = parse_checked(gateway, subschema, type_name, source)?;
                        let field = Name::new(field).map_err(|_| StitchingError::InvalidSelectionSet {
                            subschema: subschema.name().to_string(),
                            type_name: type_name.to_string(),
                            reason: format!("'{field}' is not a valid field name"),
                        })?;
                        selection_sets_by_field
                            .entry(type_name.clone())
                            .or_default()
                            .insert(field, selections);
                    }
                }
            }

            if candidates.len() < 2 {
                continue;
            }
            let info = Self::merged_type_info(gateway, type_name, &candidates)?;
            if info.entries.is_empty() {
                continue;
            }

            let mut by_type: Vec<ast::Selection> = Vec::new();
            let mut printed = Vec::new();
            for subschema in &info.subschemas {
                for entry in info.entries.get(subschema).into_iter().flatten() {
                    for selection in entry.selection_set.iter().flatten() {
                        let key = print_selection_set(std::slice::from_ref(selection));
                        if !printed.contains(&key) {
                            printed.push(key);
                            by_type.push(selection.clone());
                        }
                    }
                }
            }
            by_type.push(typename_field());
            selection_sets_by_type.insert(type_name.clone(), by_type);
            merged_types.insert(type_name.clone(), info);
        }

        tracing::debug!(
            subschemas = subschemas.len(),
            merged_types = merged_types.len(),
            root_fields = root_fields.len(),
            "built stitching info"
        );

        Ok(Self {
            subschemas,
            selection_sets_by_type,
            selection_sets_by_field,
            merged_types,
            root_fields,
            plans: Mutex::new(HashMap::new()),
            contains_cache: Mutex::new(HashMap::new()),
        })
    }

    fn merged_type_info(
        gateway: &Schema,
        type_name: &Name,
        candidates: &[&Arc<Subschema>],
    ) -> Result<MergedTypeInfo, StitchingError> {
        let mut entries: HashMap<SubschemaId, Vec<MergeEntry>> = HashMap::new();
        let mut field_selection_sets: HashMap<SubschemaId, HashMap<Name, Vec<ast::Selection>>> =
            HashMap::new();
        let mut canonical = None;
        let mut canonical_fields = HashMap::new();
        let mut providers: IndexMap<Name, Vec<SubschemaId>> = IndexMap::new();

        for subschema in candidates {
            if let Some(ExtendedType::Object(object)) =
                subschema.transformed_schema().types.get(type_name)
            {
                for field in object.fields.keys() {
                    providers.entry(field.clone()).or_default().push(subschema.id());
                }
            }
            let Some(config) = subschema.merge.get(type_name.as_str()) else {
                continue;
            };
            if config.canonical && canonical.is_none() {
                canonical = Some(subschema.id());
            }
            for (field, field_config) in &config.fields {
                let Ok(field_name) = Name::new(field) else {
                    continue;
                };
                if field_config.canonical {
                    canonical_fields.entry(field_name.clone()).or_insert(subschema.id());
                }
                if let Some(source) = &field_config.selection_set {
                    field_selection_sets
                        .entry(subschema.id())
                        .or_default()
                        .insert(field_name, parse_checked(gateway, subschema, type_name, source)?);
                }
            }

            let mut subschema_entries = Vec::new();
            for entry_config in std::iter::once(config).chain(config.entry_points.iter()) {
                let Some(resolver) = MergedResolver::from_config(entry_config) else {
                    continue;
                };
                let selection_set = entry_config
                    .selection_set
                    .as_deref()
                    .map(|source| parse_checked(gateway, subschema, type_name, source))
                    .transpose()?;
                subschema_entries.push(MergeEntry {
                    selection_set,
                    resolver,
                });
            }
            if !subschema_entries.is_empty() {
                entries.insert(subschema.id(), subschema_entries);
            }
        }

        let subschemas: Vec<SubschemaId> = candidates.iter().map(|subschema| subschema.id()).collect();
        let target_subschemas = subschemas
            .iter()
            .map(|source| {
                let targets = subschemas
                    .iter()
                    .filter(|target| *target != source && entries.contains_key(*target))
                    .copied()
                    .collect();
                (*source, targets)
            })
            .collect();

        let mut unique_fields = HashMap::new();
        let mut non_unique_fields = HashMap::new();
        for (field, owners) in providers {
            if owners.len() == 1 {
                unique_fields.insert(field, owners[0]);
            } else {
                non_unique_fields.insert(field, owners);
            }
        }

        let mut contains = HashMap::new();
        for source in candidates {
            for target in candidates {
                if source.id() == target.id() {
                    continue;
                }
                let Some(selection_set) = entries
                    .get(&target.id())
                    .and_then(|entries| entries.first())
                    .and_then(|entry| entry.selection_set.as_ref())
                else {
                    continue;
                };
                let schema: &Schema = source.transformed_schema();
                contains.insert(
                    (source.id(), target.id()),
                    types_contain_selection_set(
                        &[schema],
                        type_name.as_str(),
                        selection_set,
                    ),
                );
            }
        }

        Ok(MergedTypeInfo {
            type_name: type_name.clone(),
            subschemas,
            target_subschemas,
            unique_fields,
            non_unique_fields,
            entries,
            field_selection_sets,
            contains,
            canonical,
            canonical_fields,
        })
    }

    pub fn subschema(&self, id: SubschemaId) -> Option<&Arc<Subschema>> {
        self.subschemas.get(id.0)
    }

    pub fn subschemas(&self) -> &[Arc<Subschema>] {
        &self.subschemas
    }

    pub fn merged_type(&self, type_name: &str) -> Option<&MergedTypeInfo> {
        self.merged_types.get(type_name)
    }

    /// The subschema answering the root field `field` of `kind` operations.
    pub fn root_field_owner(&self, kind: OperationKind, field: &str) -> Option<&Arc<Subschema>> {
        let field = Name::new(field).ok()?;
        self.root_fields
            .get(&(kind, field))
            .and_then(|id| self.subschema(*id))
    }
}

/// Parses a merge selection set, checking every type it mentions exists in the gateway.
fn parse_checked(
    gateway: &Schema,
    subschema: &Subschema,
    type_name: &Name,
    source: &str,
) -> Result<Vec<ast::Selection>, StitchingError> {
    let selections =
        parse_selection_set(source).map_err(|reason| StitchingError::InvalidSelectionSet {
            subschema: subschema.name().to_string(),
            type_name: type_name.to_string(),
            reason,
        })?;
    if let Some(unknown) = referenced_type_conditions(&selections)
        .into_iter()
        .find(|condition| !gateway.types.contains_key(condition))
    {
        return Err(StitchingError::UnknownSelectionSetType {
            subschema: subschema.name().to_string(),
            type_name: type_name.to_string(),
            unknown: unknown.to_string(),
        });
    }
    Ok(selections)
}

#[cfg(test)]
mod tests {
    use serde_json_bytes::ByteString;

    use super::*;
    use crate::json_ext::Object;
    use crate::subschema::SubschemaConfig;
    use crate::subschema::parse_schema;

    const GATEWAY: &str = r#"
        type Query { product(upc: ID!): Product reviews: [Review] }
        type Product { upc: ID! name: String price: Int reviews: [Review] shippingEstimate: Int }
        type Review { id: ID! body: String product: Product }
    "#;

    fn subschemas(review_selection_set: &str) -> Result<Vec<Arc<Subschema>>, StitchingError> {
        let products = SubschemaConfig::new(
            "products",
            "type Query { product(upc: ID!): Product } type Product { upc: ID! name: String price: Int }",
        )?
        .with_merged_type(
            "Product",
            MergedTypeConfig::new()
                .with_selection_set("{ upc }")
                .with_field_name("product")
                .with_args(|object| {
                    let mut args = Object::new();
                    args.insert(ByteString::from("upc"), object["upc"].clone());
                    args
                }),
        );
        let reviews = SubschemaConfig::new(
            "reviews",
            "type Query { reviews: [Review] productsByUpcs(upcs: [ID!]!): [Product] } \
             type Product { upc: ID! reviews: [Review] shippingEstimate: Int } \
             type Review { id: ID! body: String product: Product }",
        )?
        .with_merged_type(
            "Product",
            MergedTypeConfig::new()
                .with_selection_set(review_selection_set)
                .with_field_name("productsByUpcs")
                .with_key(|object| object["upc"].clone())
                .with_args_from_keys(|keys| {
                    let mut args = Object::new();
                    args.insert(ByteString::from("upcs"), Value::Array(keys.to_vec()));
                    args
                })
                .with_computed_field("shippingEstimate", "{ price }"),
        );
        Ok(vec![
            Arc::new(Subschema::new(SubschemaId(0), products)?),
            Arc::new(Subschema::new(SubschemaId(1), reviews)?),
        ])
    }

    #[test]
    fn records_merged_types_and_root_fields() {
        let gateway = parse_schema("gateway", GATEWAY).unwrap();
        let info = StitchingInfo::new(&gateway, subschemas("{ upc }").unwrap()).unwrap();

        assert_eq!(
            info.root_field_owner(OperationKind::Query, "reviews").map(|s| s.name()),
            Some("reviews")
        );
        assert_eq!(
            info.root_field_owner(OperationKind::Query, "product").map(|s| s.name()),
            Some("products")
        );

        let product = info.merged_type("Product").unwrap();
        assert_eq!(product.unique_fields.get("name"), Some(&SubschemaId(0)));
        assert_eq!(product.unique_fields.get("reviews"), Some(&SubschemaId(1)));
        assert_eq!(
            product.non_unique_fields.get("upc"),
            Some(&vec![SubschemaId(0), SubschemaId(1)])
        );
        assert_eq!(
            product.target_subschemas.get(&SubschemaId(0)),
            Some(&vec![SubschemaId(1)])
        );
        assert_eq!(product.contains.get(&(SubschemaId(0), SubschemaId(1))), Some(&true));
        assert!(info.merged_type("Review").is_none());

        assert_eq!(
            print_selection_set(&info.selection_sets_by_type["Product"]),
            "{ upc __typename }"
        );
        assert_eq!(
            print_selection_set(&info.selection_sets_by_field["Product"]["shippingEstimate"]),
            "{ price }"
        );
    }

    #[test]
    fn rejects_selection_sets_with_unknown_types() {
        let gateway = parse_schema("gateway", GATEWAY).unwrap();
        let error = StitchingInfo::new(&gateway, subschemas("{ upc ... on Missing { id } }").unwrap())
            .unwrap_err();
        assert_eq!(
            error.to_string(),
            "selection set for 'Product' in subschema 'reviews' references unknown type 'Missing'"
        );
    }
}
