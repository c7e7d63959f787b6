//! Fetches the fields of a merged type that the subschema an object came from
//! cannot provide.
//!
//! The fields are planned in stages. A stage fetches from every subschema whose
//! key selections are already known, concurrently; the next stage can then use the
//! subschemas that needed what the previous one fetched.

use std::sync::Arc;

use apollo_compiler::Name;
use apollo_compiler::Node;
use apollo_compiler::ast;
use apollo_compiler::schema::ExtendedType;
use futures::FutureExt;
use futures::future::BoxFuture;
use futures::future::join_all;
use indexmap::IndexMap;
use tracing::Instrument;

use crate::batch_delegate::BatchDelegateOptions;
use crate::batch_delegate::batch_delegate_to_schema;
use crate::context::Context;
use crate::delegate::DelegationOptions;
use crate::delegate::delegate_to_schema;
use crate::executor::OperationKind;
use crate::merge::ExternalObject;
use crate::merge::ExternalValue;
use crate::resolve_info::ResolveInfo;
use crate::selection::collect_fields;
use crate::selection::collect_subfields;
use crate::selection::is_typename;
use crate::selection::print_selection_set;
use crate::selection::types_contain_selection_set;
use crate::stitching_info::CachedPlan;
use crate::stitching_info::ContainsKey;
use crate::stitching_info::MergedResolver;
use crate::stitching_info::MergedTypeInfo;
use crate::stitching_info::PlanKey;
use crate::stitching_info::StitchingInfo;
use crate::subschema::MergedTypeResolverRequest;
use crate::subschema::Subschema;
use crate::subschema::SubschemaId;

/// A field of the merged type to fetch, with all the nodes selecting it.
#[derive(Clone, Debug)]
pub(crate) struct PlannedField {
    pub(crate) key: String,
    pub(crate) name: Name,
    pub(crate) nodes: Vec<Node<ast::Field>>,
}

/// The fields selected by `info` on `type_name` that `source` cannot provide, along
/// with the fields computed fields need.
pub(crate) fn fields_not_in_subschema(
    stitching_info: &StitchingInfo,
    info: &ResolveInfo,
    type_name: &Name,
    source: &Subschema,
) -> Vec<PlannedField> {
    let gateway = info.schema();
    let selected = collect_subfields(
        gateway,
        info.fragments(),
        info.variables(),
        type_name.as_str(),
        &info.field_nodes,
    );
    let source_fields = match source.transformed_schema().types.get(type_name) {
        Some(ExtendedType::Object(object)) => Some(&object.fields),
        _ => None,
    };
    let computed: Vec<&str> = source.computed_fields(type_name.as_str()).collect();
    let missing = |name: &Name| {
        !source_fields.is_some_and(|fields| fields.contains_key(name))
            || computed.contains(&name.as_str())
    };

    let mut fields: IndexMap<String, PlannedField> = IndexMap::new();
    for (key, nodes) in selected {
        let Some(first) = nodes.first() else {
            continue;
        };
        if is_typename(first) {
            continue;
        }
        let name = first.name.clone();
        if missing(&name) {
            fields.insert(
                key.clone(),
                PlannedField {
                    key,
                    name: name.clone(),
                    nodes: nodes.clone(),
                },
            );
        }
        let Some(required) = stitching_info
            .selection_sets_by_field
            .get(type_name)
            .and_then(|by_field| by_field.get(&name))
        else {
            continue;
        };
        let required = collect_fields(
            gateway,
            info.fragments(),
            info.variables(),
            type_name.as_str(),
            required,
        );
        for (key, nodes) in required {
            let Some(first) = nodes.first() else {
                continue;
            };
            if is_typename(first) || !missing(&first.name) || fields.contains_key(&key) {
                continue;
            }
            fields.insert(
                key.clone(),
                PlannedField {
                    key,
                    name: first.name.clone(),
                    nodes,
                },
            );
        }
    }
    fields.into_values().collect()
}

/// One stage of a plan, and what is left for the next one.
#[derive(Debug, Default)]
struct DelegationStage {
    /// Target subschema, merge entry to use and indices of the fields to fetch.
    delegations: IndexMap<SubschemaId, (usize, Vec<usize>)>,
    proxiable: Vec<SubschemaId>,
    non_proxiable: Vec<SubschemaId>,
    unproxiable: Vec<usize>,
}

struct Planner<'a> {
    stitching_info: &'a StitchingInfo,
    merged: &'a MergedTypeInfo,
    fields: &'a [PlannedField],
}

impl Planner<'_> {
    /// Whether the type's fields in the `sources` subschemas are enough for `selections`.
    fn sources_contain(&self, sources: &[SubschemaId], selections: &[ast::Selection]) -> bool {
        let key = ContainsKey {
            type_name: self.merged.type_name.clone(),
            sources: sources.to_vec(),
            selection_set: print_selection_set(selections),
        };
        if let Some(contains) = self.stitching_info.contains_cache.lock().get(&key) {
            return *contains;
        }
        let schemas: Vec<&apollo_compiler::Schema> = sources
            .iter()
            .filter_map(|id| self.stitching_info.subschema(*id))
            .map(|subschema| -> &apollo_compiler::Schema { subschema.transformed_schema() })
            .collect();
        let contains =
            types_contain_selection_set(&schemas, self.merged.type_name.as_str(), selections);
        self.stitching_info.contains_cache.lock().insert(key, contains);
        contains
    }

    /// The merge entry of `target` usable from `sources` for `field_indices`, if any.
    fn usable_entry(
        &self,
        sources: &[SubschemaId],
        target: SubschemaId,
        field_indices: &[usize],
    ) -> Option<usize> {
        let entries = self.merged.entries.get(&target)?;
        let entry = entries.iter().enumerate().position(|(index, entry)| match &entry.selection_set {
            None => true,
            Some(selections) => match sources {
                // the main entry of a single source is precomputed
                [source] if index == 0 => self
                    .merged
                    .contains
                    .get(&(*source, target))
                    .copied()
                    .unwrap_or_else(|| self.sources_contain(sources, selections)),
                _ => self.sources_contain(sources, selections),
            },
        })?;
        let requirements_known = match self.merged.field_selection_sets.get(&target) {
            None => true,
            Some(by_field) => field_indices.iter().all(|index| {
                by_field
                    .get(&self.fields[*index].name)
                    .is_none_or(|required| self.sources_contain(sources, required))
            }),
        };
        requirements_known.then_some(entry)
    }

    fn calculate_stage(
        &self,
        sources: &[SubschemaId],
        targets: &[SubschemaId],
        field_indices: &[usize],
    ) -> DelegationStage {
        let mut stage = DelegationStage::default();
        let mut entries = IndexMap::new();
        for target in targets {
            match self.usable_entry(sources, *target, field_indices) {
                Some(entry) => {
                    stage.proxiable.push(*target);
                    entries.insert(*target, entry);
                }
                None => stage.non_proxiable.push(*target),
            }
        }

        for index in field_indices.iter().copied() {
            let name = &self.fields[index].name;
            let chosen = if let Some(owner) = self.merged.unique_fields.get(name) {
                stage.proxiable.contains(owner).then_some(*owner)
            } else if let Some(owners) = self.merged.non_unique_fields.get(name) {
                let candidates: Vec<SubschemaId> = owners
                    .iter()
                    .filter(|owner| stage.proxiable.contains(owner))
                    .copied()
                    .collect();
                let canonical = self
                    .merged
                    .canonical_fields
                    .get(name)
                    .or(self.merged.canonical.as_ref());
                candidates
                    .iter()
                    .find(|candidate| stage.delegations.contains_key(*candidate))
                    .or_else(|| candidates.iter().find(|candidate| Some(*candidate) == canonical))
                    .or_else(|| candidates.first())
                    .copied()
            } else {
                None
            };
            match chosen {
                Some(target) => {
                    let entry = entries.get(&target).copied().unwrap_or_default();
                    stage
                        .delegations
                        .entry(target)
                        .or_insert_with(|| (entry, Vec::new()))
                        .1
                        .push(index);
                }
                None => stage.unproxiable.push(index),
            }
        }
        stage
    }

    fn plan(&self, source: SubschemaId) -> CachedPlan {
        let Some(targets) = self.merged.target_subschemas.get(&source) else {
            return Vec::new();
        };
        let mut plan = Vec::new();
        let mut sources = vec![source];
        let all_fields: Vec<usize> = (0..self.fields.len()).collect();
        let mut stage = self.calculate_stage(&sources, targets, &all_fields);
        while !stage.delegations.is_empty() {
            plan.push(
                stage
                    .delegations
                    .iter()
                    .map(|(target, (entry, indices))| (*target, *entry, indices.clone()))
                    .collect(),
            );
            sources.extend(stage.proxiable.iter().copied());
            sources.sort();
            sources.dedup();
            stage = self.calculate_stage(&sources, &stage.non_proxiable, &stage.unproxiable);
        }
        if !stage.unproxiable.is_empty() {
            tracing::debug!(
                type_name = %self.merged.type_name,
                fields = ?stage
                    .unproxiable
                    .iter()
                    .map(|index| self.fields[*index].key.as_str())
                    .collect::<Vec<_>>(),
                "no subschema can provide these fields"
            );
        }
        plan
    }
}

/// The stages fetching `fields` of an object of `merged`'s type coming from `source`.
pub(crate) fn delegation_plan(
    stitching_info: &StitchingInfo,
    merged: &MergedTypeInfo,
    source: SubschemaId,
    fields: &[PlannedField],
) -> Arc<CachedPlan> {
    let key = PlanKey {
        type_name: merged.type_name.clone(),
        source,
        fields: fields
            .iter()
            .map(|field| {
                let selections: Vec<ast::Selection> =
                    field.nodes.iter().cloned().map(ast::Selection::Field).collect();
                (field.key.clone(), field.name.clone(), print_selection_set(&selections))
            })
            .collect(),
    };
    if let Some(plan) = stitching_info.plans.lock().get(&key) {
        return plan.clone();
    }
    let plan = Arc::new(
        Planner {
            stitching_info,
            merged,
            fields,
        }
        .plan(source),
    );
    stitching_info.plans.lock().insert(key, plan.clone());
    plan
}

/// Fetches `request.selection_set` of a merged object from `request.subschema`.
fn resolve_merged_type(
    resolver: MergedResolver,
    request: MergedTypeResolverRequest,
    type_name: &Name,
) -> BoxFuture<'static, ExternalValue> {
    match resolver {
        MergedResolver::Custom(resolve) => resolve(request),
        MergedResolver::Single { field_name, args } => {
            let args = args(&request.object.to_value());
            delegate_to_schema(
                DelegationOptions::builder()
                    .subschema(request.subschema)
                    .context(request.context)
                    .info(request.info)
                    .operation(OperationKind::Query)
                    .field_name(field_name)
                    .args(args)
                    .return_type(ast::Type::Named(type_name.clone()))
                    .selection_set(request.selection_set)
                    .skip_type_merging(true)
                    .build(),
            )
        }
        MergedResolver::Batched {
            field_name,
            key,
            args_from_keys,
            values_from_results,
        } => batch_delegate_to_schema(
            BatchDelegateOptions::builder()
                .subschema(request.subschema)
                .context(request.context)
                .info(request.info)
                .field_name(field_name)
                .key(key(&request.object.to_value()))
                .args_from_keys(args_from_keys)
                .and_values_from_results(values_from_results)
                .return_type(ast::Type::List(Box::new(ast::Type::Named(type_name.clone()))))
                .selection_set(request.selection_set)
                .build(),
        ),
    }
}

/// Merges into `object` the fields `info` selects that `source` does not provide.
pub(crate) fn merge_fields(
    stitching_info: Arc<StitchingInfo>,
    type_name: Name,
    object: ExternalObject,
    source: Arc<Subschema>,
    context: Context,
    info: ResolveInfo,
) -> BoxFuture<'static, ExternalObject> {
    let span = tracing::debug_span!("merge_fields", type_name = %type_name, path = %info.path);
    async move {
        let Some(merged) = stitching_info.merged_type(type_name.as_str()) else {
            return object;
        };
        let fields = fields_not_in_subschema(&stitching_info, &info, &type_name, &source);
        if fields.is_empty() {
            return object;
        }
        let plan = delegation_plan(&stitching_info, merged, source.id(), &fields);

        let mut object = object;
        for stage in plan.iter() {
            let fetches: Vec<_> = stage
                .iter()
                .filter_map(|(target, entry, indices)| {
                    let subschema = stitching_info.subschema(*target)?.clone();
                    let resolver = merged.entries.get(target)?.get(*entry)?.resolver.clone();
                    let keys: Vec<String> =
                        indices.iter().map(|index| fields[*index].key.clone()).collect();
                    let selection_set = indices
                        .iter()
                        .flat_map(|index| fields[*index].nodes.iter().cloned())
                        .map(ast::Selection::Field)
                        .collect();
                    tracing::debug!(subschema = subschema.name(), fields = ?keys, "fetching merged fields");
                    let fetch = resolve_merged_type(
                        resolver,
                        MergedTypeResolverRequest {
                            object: object.clone(),
                            context: context.clone(),
                            info: info.clone(),
                            subschema: subschema.clone(),
                            selection_set,
                        },
                        &type_name,
                    );
                    Some(async move { (subschema, keys, fetch.await) })
                })
                .collect();
            for (subschema, keys, result) in join_all(fetches).await {
                object.merge_result(result, &subschema, &keys, &info.path);
            }
        }
        object
    }
    .instrument(span)
    .boxed()
}

#[cfg(test)]
mod tests {
    use apollo_compiler::Schema;
    use apollo_compiler::validation::Valid;
    use serde_json_bytes::ByteString;

    use super::*;
    use crate::delegate::test_support::root_field_info;
    use crate::json_ext::Object;
    use crate::subschema::MergedTypeConfig;
    use crate::subschema::SubschemaConfig;
    use crate::subschema::parse_schema;

    const GATEWAY: &str = r#"
        type Query { product(upc: ID!): Product }
        type Product { upc: ID! name: String weight: Int price: Int estimate: Int }
    "#;

    fn by_upc(field_name: &str) -> MergedTypeConfig {
        MergedTypeConfig::new()
            .with_selection_set("{ upc }")
            .with_field_name(field_name)
            .with_args(|object| {
                let mut args = Object::new();
                args.insert(ByteString::from("upc"), object["upc"].clone());
                args
            })
    }

    fn stitching_info(canonical_shipping: bool) -> (Arc<Valid<Schema>>, Arc<StitchingInfo>) {
        let gateway = parse_schema("gateway", GATEWAY).unwrap();
        let products = SubschemaConfig::new(
            "products",
            "type Query { product(upc: ID!): Product } type Product { upc: ID! name: String }",
        )
        .unwrap()
        .with_merged_type("Product", by_upc("product"));
        let inventory = SubschemaConfig::new(
            "inventory",
            "type Query { inventoryProduct(upc: ID!): Product } type Product { upc: ID! weight: Int price: Int }",
        )
        .unwrap()
        .with_merged_type("Product", by_upc("inventoryProduct"));
        let mut shipping_config =
            by_upc("shippingProduct").with_computed_field("estimate", "{ weight }");
        if canonical_shipping {
            shipping_config = shipping_config.canonical();
        }
        let shipping = SubschemaConfig::new(
            "shipping",
            "type Query { shippingProduct(upc: ID!): Product } type Product { upc: ID! price: Int estimate: Int }",
        )
        .unwrap()
        .with_merged_type("Product", shipping_config);
        let subschemas = vec![
            Arc::new(Subschema::new(SubschemaId(0), products).unwrap()),
            Arc::new(Subschema::new(SubschemaId(1), inventory).unwrap()),
            Arc::new(Subschema::new(SubschemaId(2), shipping).unwrap()),
        ];
        let info = StitchingInfo::new(&gateway, subschemas).unwrap();
        (gateway, Arc::new(info))
    }

    fn planned_fields(
        gateway: Arc<Valid<Schema>>,
        stitching_info: &Arc<StitchingInfo>,
        query: &str,
    ) -> Vec<PlannedField> {
        let info = root_field_info(gateway, Some(stitching_info.clone()), query, "product");
        let source = stitching_info.subschema(SubschemaId(0)).unwrap().clone();
        fields_not_in_subschema(stitching_info, &info, &apollo_compiler::name!("Product"), &source)
    }

    /// The plan from the products subschema, as subschema and field names.
    fn plan_for(query: &str, canonical_shipping: bool) -> Vec<Vec<(String, Vec<String>)>> {
        let (gateway, stitching_info) = stitching_info(canonical_shipping);
        let fields = planned_fields(gateway, &stitching_info, query);
        let merged = stitching_info.merged_type("Product").unwrap();
        let plan = delegation_plan(&stitching_info, merged, SubschemaId(0), &fields);
        plan.iter()
            .map(|stage| {
                stage
                    .iter()
                    .map(|(target, _, indices)| {
                        (
                            stitching_info.subschema(*target).unwrap().name().to_string(),
                            indices.iter().map(|index| fields[*index].key.clone()).collect(),
                        )
                    })
                    .collect()
            })
            .collect()
    }

    fn stage(subschema: &str, fields: &[&str]) -> Vec<(String, Vec<String>)> {
        vec![(
            subschema.to_string(),
            fields.iter().map(|field| field.to_string()).collect(),
        )]
    }

    #[test]
    fn computed_fields_wait_for_their_requirements() {
        let plan = plan_for("{ product(upc: 1) { name estimate } }", false);
        assert_eq!(plan, vec![stage("inventory", &["weight"]), stage("shipping", &["estimate"])]);
    }

    #[test]
    fn fields_the_source_has_are_not_fetched() {
        assert!(plan_for("{ product(upc: 1) { upc name } }", false).is_empty());
    }

    #[test]
    fn shared_fields_go_to_the_first_registered_subschema() {
        let plan = plan_for("{ product(upc: 1) { price } }", false);
        assert_eq!(plan, vec![stage("inventory", &["price"])]);
    }

    #[test]
    fn shared_fields_prefer_the_canonical_subschema() {
        let plan = plan_for("{ product(upc: 1) { price } }", true);
        assert_eq!(plan, vec![stage("shipping", &["price"])]);
    }

    #[test]
    fn shared_fields_join_a_subschema_already_in_the_stage() {
        let plan = plan_for("{ product(upc: 1) { weight price } }", true);
        assert_eq!(plan, vec![stage("inventory", &["weight", "price"])]);
    }

    #[test]
    fn plans_are_memoized() {
        let (gateway, stitching_info) = stitching_info(false);
        let fields = planned_fields(gateway, &stitching_info, "{ product(upc: 1) { weight } }");
        let merged = stitching_info.merged_type("Product").unwrap();
        let first = delegation_plan(&stitching_info, merged, SubschemaId(0), &fields);
        let second = delegation_plan(&stitching_info, merged, SubschemaId(0), &fields);
        assert!(Arc::ptr_eq(&first, &second));
    }
}
