use std::collections::{BTreeMap, BTreeSet, VecDeque};

use reqwest::Url;

use crate::GraphQLRequest;
use crate::capability::TypeRef;
use crate::composed_schema::{ComposedObject, ComposedSchema};
use crate::error::PlanningError;
use crate::operation::{FieldSelection, InputValue, NormalizedOperation, OperationKind, normalize};
use crate::query_plan::{
    EntityBinding, ExecutionPlan, FLATTEN, FetchField, InputBinding, NodeId, PlanNode,
    ShapeField, merge_field, write_selection,
};
use crate::schema_registry::Supergraph;

pub trait QueryPlanner: Send + Sync {
    fn plan(
        &self,
        request: &GraphQLRequest,
        supergraph: &Supergraph,
    ) -> Result<ExecutionPlan, PlanningError>;
}

/// Splits client operations into per-subgraph sub-requests joined through
/// entity representations.
#[derive(Clone, Copy, Debug, Default)]
pub struct FederatedQueryPlanner;

impl FederatedQueryPlanner {
    pub fn new() -> Self {
        FederatedQueryPlanner
    }
}

impl QueryPlanner for FederatedQueryPlanner {
    fn plan(
        &self,
        request: &GraphQLRequest,
        supergraph: &Supergraph,
    ) -> Result<ExecutionPlan, PlanningError> {
        let operation = normalize(request)?;
        let schema = &supergraph.schema;
        let root_type = operation.kind.root_type();
        let root = schema.object(root_type).ok_or_else(|| {
            PlanningError::validation(
                format!("Schema is not configured to execute {} operation.", operation.kind),
                &[],
            )
        })?;

        let shape = build_shape(schema, root, &operation.selection, &mut Vec::new())?;

        let mut builder = PlanBuilder {
            supergraph,
            schema,
            nodes: Vec::new(),
        };
        builder.plan_root(operation.kind, root_type, &shape)?;
        let nodes = builder.finish(&operation);

        tracing::debug!(
            operation = operation.name.as_deref().unwrap_or("<anonymous>"),
            nodes = nodes.len(),
            "planned operation"
        );
        Ok(ExecutionPlan {
            kind: operation.kind,
            root_type: root_type.to_string(),
            nodes,
            shape,
        })
    }
}

fn build_shape(
    schema: &ComposedSchema,
    parent: &ComposedObject,
    fields: &[FieldSelection],
    path: &mut Vec<String>,
) -> Result<Vec<ShapeField>, PlanningError> {
    let mut shape = Vec::with_capacity(fields.len());
    for field in fields {
        path.push(field.response_key().to_string());
        shape.push(shape_field(schema, parent, field, path)?);
        path.pop();
    }
    Ok(shape)
}

fn shape_field(
    schema: &ComposedSchema,
    parent: &ComposedObject,
    field: &FieldSelection,
    path: &mut Vec<String>,
) -> Result<ShapeField, PlanningError> {
    for condition in &field.type_conditions {
        if !schema.is_known_type(condition) {
            return Err(PlanningError::validation(
                format!("Unknown type \"{condition}\"."),
                path,
            ));
        }
        if *condition != parent.name {
            return Err(PlanningError::validation(
                format!(
                    "Fragment cannot be spread here as objects of type \"{}\" can never be of \
                     type \"{condition}\".",
                    parent.name
                ),
                path,
            ));
        }
    }

    let shape = |ty: TypeRef, selection: Vec<ShapeField>| ShapeField {
        response_key: field.response_key().to_string(),
        field_name: field.name.clone(),
        alias: field.alias.clone(),
        arguments: field.arguments.clone(),
        parent_type: parent.name.clone(),
        ty,
        selection,
    };

    match field.name.as_str() {
        "__typename" => {
            if !field.selection.is_empty() {
                return Err(PlanningError::validation(
                    "Field \"__typename\" must not have a selection since type \"String!\" has \
                     no subfields.",
                    path,
                ));
            }
            return Ok(shape(TypeRef::non_null(TypeRef::named("String")), Vec::new()));
        }
        "__schema" | "__type" => {
            return Err(PlanningError::validation(
                "Introspection is not supported by this gateway.",
                path,
            ));
        }
        _ => {}
    }

    let Some(definition) = parent.fields.get(&field.name) else {
        return Err(PlanningError::validation(
            format!("Cannot query field \"{}\" on type \"{}\".", field.name, parent.name),
            path,
        ));
    };

    for (argument, _) in &field.arguments {
        if !definition.arguments.iter().any(|def| &def.name == argument) {
            return Err(PlanningError::validation(
                format!(
                    "Unknown argument \"{argument}\" on field \"{}.{}\".",
                    parent.name, field.name
                ),
                path,
            ));
        }
    }
    for argument in definition.arguments.iter().filter(|def| def.is_required()) {
        let provided = field
            .arguments
            .iter()
            .find(|(name, _)| name == &argument.name)
            .is_some_and(|(_, value)| !value.is_null());
        if !provided {
            return Err(PlanningError::validation(
                format!(
                    "Field \"{}.{}\" argument \"{}\" of type \"{}\" is required, but it was not \
                     provided.",
                    parent.name, field.name, argument.name, argument.ty
                ),
                path,
            ));
        }
    }

    let named = definition.ty.name();
    match schema.object(named) {
        Some(object) => {
            if field.selection.is_empty() {
                return Err(PlanningError::validation(
                    format!(
                        "Field \"{}\" of type \"{}\" must have a selection of subfields. Did you \
                         mean \"{} {{ ... }}\"?",
                        field.name, definition.ty, field.name
                    ),
                    path,
                ));
            }
            let selection = build_shape(schema, object, &field.selection, path)?;
            Ok(shape(definition.ty.clone(), selection))
        }
        None => {
            if !field.selection.is_empty() {
                return Err(PlanningError::validation(
                    format!(
                        "Field \"{}\" must not have a selection since type \"{}\" has no \
                         subfields.",
                        field.name, definition.ty
                    ),
                    path,
                ));
            }
            Ok(shape(definition.ty.clone(), Vec::new()))
        }
    }
}

struct NodeDraft {
    subgraph: String,
    endpoint: Url,
    path: Vec<String>,
    depends_on: BTreeSet<NodeId>,
    input: InputBinding,
    selection: Vec<FetchField>,
    anchor_field: String,
}

/// A set of entity fields resolved by one subgraph in a single jump.
struct EntityGroup<'f> {
    subgraph: String,
    fields: Vec<&'f ShapeField>,
    /// Fields fetched only because a sibling group requires them.
    extra: Vec<String>,
    required: BTreeSet<String>,
    after: BTreeSet<usize>,
}

impl<'f> EntityGroup<'f> {
    fn new(subgraph: &str) -> Self {
        EntityGroup {
            subgraph: subgraph.to_string(),
            fields: Vec::new(),
            extra: Vec::new(),
            required: BTreeSet::new(),
            after: BTreeSet::new(),
        }
    }

    fn field_names(&self) -> Vec<String> {
        self.fields
            .iter()
            .map(|field| field.field_name.clone())
            .chain(self.extra.iter().cloned())
            .collect()
    }

    fn anchor_field(&self) -> String {
        self.fields
            .first()
            .map(|field| field.response_key.clone())
            .or_else(|| self.extra.first().cloned())
            .unwrap_or_default()
    }
}

struct PlanBuilder<'s> {
    supergraph: &'s Supergraph,
    schema: &'s ComposedSchema,
    nodes: Vec<NodeDraft>,
}

impl<'s> PlanBuilder<'s> {
    fn plan_root(
        &mut self,
        kind: OperationKind,
        root_type: &str,
        shape: &[ShapeField],
    ) -> Result<(), PlanningError> {
        let mut groups: Vec<(String, Vec<&ShapeField>)> = Vec::new();
        for field in shape {
            if field.field_name == "__typename" {
                continue;
            }
            let owner = self.owner(root_type, &field.field_name)?;
            let reuse = match kind {
                OperationKind::Query => groups.iter().position(|(subgraph, _)| subgraph == owner),
                // Mutation fields run in document order, so only a contiguous
                // run of one subgraph shares a request.
                OperationKind::Mutation => groups
                    .last()
                    .filter(|(subgraph, _)| subgraph == owner)
                    .map(|_| groups.len() - 1),
            };
            match reuse {
                Some(index) => groups[index].1.push(field),
                None => groups.push((owner.to_string(), vec![field])),
            }
        }

        let mut previous: Option<NodeId> = None;
        for (subgraph, fields) in groups {
            let depends_on = match (kind, previous) {
                (OperationKind::Mutation, Some(previous)) => BTreeSet::from([previous]),
                _ => BTreeSet::new(),
            };
            let anchor_field = fields
                .first()
                .map(|field| field.response_key.clone())
                .unwrap_or_default();
            let endpoint = self.endpoint(&subgraph, root_type, &anchor_field)?;
            let id = self.add_node(NodeDraft {
                subgraph: subgraph.clone(),
                endpoint,
                path: Vec::new(),
                depends_on,
                input: InputBinding::Root,
                selection: Vec::new(),
                anchor_field,
            });
            let owned: Vec<ShapeField> = fields.into_iter().cloned().collect();
            let selection = self.plan_selection(id, &subgraph, root_type, &owned, &[], &[])?;
            self.nodes[id].selection = selection;
            previous = Some(id);
        }
        Ok(())
    }

    fn add_node(&mut self, draft: NodeDraft) -> NodeId {
        self.nodes.push(draft);
        self.nodes.len() - 1
    }

    fn endpoint(&self, subgraph: &str, type_name: &str, field: &str) -> Result<Url, PlanningError> {
        self.supergraph
            .subgraphs
            .get(subgraph)
            .map(|descriptor| descriptor.endpoint.clone())
            .ok_or_else(|| PlanningError::SchemaDrift {
                type_name: type_name.to_string(),
                field: field.to_string(),
            })
    }

    fn owner(&self, type_name: &str, field: &str) -> Result<&'s str, PlanningError> {
        self.schema
            .ownership()
            .owner(type_name, field)
            .ok_or_else(|| PlanningError::SchemaDrift {
                type_name: type_name.to_string(),
                field: field.to_string(),
            })
    }

    /// Plans `fields` of `parent_type` for the node `node` running on
    /// `subgraph`. Returns the part of the selection that subgraph resolves
    /// itself; everything else becomes dependent entity nodes.
    fn plan_selection(
        &mut self,
        node: NodeId,
        subgraph: &str,
        parent_type: &str,
        fields: &[ShapeField],
        rel_path: &[String],
        abs_path: &[String],
    ) -> Result<Vec<FetchField>, PlanningError> {
        let mut local = Vec::new();
        let mut foreign = Vec::new();

        for field in fields {
            if field.field_name == "__typename" {
                continue;
            }
            if self.owner(parent_type, &field.field_name)? != subgraph {
                foreign.push(field);
                continue;
            }

            let child_rel = child_path(rel_path, field);
            let child_abs = child_path(abs_path, field);
            let selection = if field.selection.is_empty() {
                Vec::new()
            } else {
                self.plan_selection(
                    node,
                    subgraph,
                    field.ty.name(),
                    &field.selection,
                    &child_rel,
                    &child_abs,
                )?
            };
            let fetch = FetchField {
                alias: field.alias.clone(),
                name: field.field_name.clone(),
                arguments: field.arguments.clone(),
                selection,
            };
            merge_field(&mut local, fetch, abs_path)?;
        }

        if !foreign.is_empty() {
            self.plan_entity_jumps(
                node,
                subgraph,
                parent_type,
                &foreign,
                rel_path,
                abs_path,
                &mut local,
            )?;
        }
        if local.is_empty() {
            local.push(FetchField::leaf("__typename"));
        }
        Ok(local)
    }

    #[allow(clippy::too_many_arguments)]
    fn plan_entity_jumps(
        &mut self,
        origin: NodeId,
        origin_subgraph: &str,
        type_name: &str,
        foreign: &[&ShapeField],
        rel_path: &[String],
        abs_path: &[String],
        local: &mut Vec<FetchField>,
    ) -> Result<(), PlanningError> {
        let ownership = self.schema.ownership();
        let entity = ownership.entity(type_name);
        let reachable = |field: &str, owner: &str| -> Result<(), PlanningError> {
            match entity {
                Some(entity) if entity.can_reference(origin_subgraph, owner) => Ok(()),
                _ => Err(PlanningError::UnreachableField {
                    type_name: type_name.to_string(),
                    field: field.to_string(),
                    from: origin_subgraph.to_string(),
                    owner: owner.to_string(),
                }),
            }
        };

        let mut groups: Vec<EntityGroup<'_>> = Vec::new();
        for &field in foreign {
            let owner = self.owner(type_name, &field.field_name)?;
            reachable(&field.field_name, owner)?;
            let index = group_index(&mut groups, owner);
            groups[index].fields.push(field);
        }

        // Close over @requires: each required field comes from the origin
        // when it owns it, otherwise from a sibling group fetched first.
        let mut pending: VecDeque<usize> = (0..groups.len()).collect();
        while let Some(index) = pending.pop_front() {
            for field_name in groups[index].field_names() {
                for required in ownership.requires(type_name, &field_name) {
                    groups[index].required.insert(required.clone());
                    let owner = self.owner(type_name, required)?;
                    if owner == origin_subgraph {
                        merge_field(local, FetchField::leaf(required.as_str()), abs_path)?;
                        continue;
                    }
                    if owner == groups[index].subgraph {
                        continue;
                    }
                    reachable(required, owner)?;
                    let provider = group_index(&mut groups, owner);
                    let provider_group = &mut groups[provider];
                    let already = provider_group
                        .field_names()
                        .iter()
                        .any(|name| name == required);
                    if !already {
                        provider_group.extra.push(required.clone());
                        pending.push_back(provider);
                    }
                    groups[index].after.insert(provider);
                }
            }
        }

        let order = topological_order(&groups).map_err(|cycle| PlanningError::DependencyCycle {
            type_name: type_name.to_string(),
            subgraphs: cycle,
        })?;

        let Some(entity) = entity else {
            return Ok(());
        };
        for group in &groups {
            if let Some(target) = entity.participant(&group.subgraph) {
                for key in &target.key {
                    merge_field(local, FetchField::leaf(key.as_str()), abs_path)?;
                }
            }
        }

        let mut node_of_group: BTreeMap<usize, NodeId> = BTreeMap::new();
        for index in order {
            let group = &groups[index];
            let key_fields = entity
                .participant(&group.subgraph)
                .map(|participant| participant.key.clone())
                .unwrap_or_default();
            let mut depends_on = BTreeSet::from([origin]);
            depends_on.extend(group.after.iter().filter_map(|g| node_of_group.get(g)));
            let anchor_field = group.anchor_field();

            let endpoint = self.endpoint(&group.subgraph, type_name, &anchor_field)?;
            let id = self.add_node(NodeDraft {
                subgraph: group.subgraph.clone(),
                endpoint,
                path: abs_path.to_vec(),
                depends_on,
                input: InputBinding::Entities(EntityBinding {
                    origin,
                    path: rel_path.to_vec(),
                    type_name: type_name.to_string(),
                    key_fields,
                    required_fields: group.required.iter().cloned().collect(),
                }),
                selection: Vec::new(),
                anchor_field,
            });
            node_of_group.insert(index, id);

            let fields: Vec<ShapeField> = group.fields.iter().map(|&field| field.clone()).collect();
            let mut selection = if fields.is_empty() {
                Vec::new()
            } else {
                self.plan_selection(id, &group.subgraph, type_name, &fields, &[], abs_path)?
            };
            for extra in &group.extra {
                merge_field(&mut selection, FetchField::leaf(extra.as_str()), abs_path)?;
            }
            if selection.is_empty() {
                selection.push(FetchField::leaf("__typename"));
            }
            self.nodes[id].selection = selection;
        }
        Ok(())
    }

    fn finish(self, operation: &NormalizedOperation) -> Vec<PlanNode> {
        self.nodes
            .into_iter()
            .enumerate()
            .map(|(id, draft)| {
                let mut used = BTreeSet::new();
                for field in &draft.selection {
                    field.collect_variables(&mut used);
                }
                let variables: Vec<_> = operation
                    .variable_definitions
                    .iter()
                    .filter(|definition| used.contains(&definition.name))
                    .collect();

                let operation_name = operation
                    .name
                    .as_ref()
                    .map(|name| format!("{name}__{}__{id}", draft.subgraph));
                let mut definitions: Vec<String> =
                    variables.iter().map(ToString::to_string).collect();
                let mut selection = String::new();
                // Writing into a String cannot fail.
                let _ = write_selection(&draft.selection, &mut selection);

                let (kind, body) = match &draft.input {
                    InputBinding::Root => (operation.kind, selection),
                    InputBinding::Entities(binding) => {
                        definitions.insert(0, "$representations: [_Any!]!".to_string());
                        let entities = format!(
                            "{{ _entities(representations: {}) {{ ... on {} {selection} }} }}",
                            InputValue::Variable("representations".to_string()),
                            binding.type_name
                        );
                        (OperationKind::Query, entities)
                    }
                };

                let response_keys = draft
                    .selection
                    .iter()
                    .map(|field| field.response_key().to_string())
                    .collect();

                let mut text = kind.to_string();
                if let Some(name) = &operation_name {
                    text.push(' ');
                    text.push_str(name);
                }
                if !definitions.is_empty() {
                    text.push('(');
                    text.push_str(&definitions.join(", "));
                    text.push(')');
                }
                text.push(' ');
                text.push_str(&body);

                PlanNode {
                    id,
                    subgraph: draft.subgraph,
                    endpoint: draft.endpoint,
                    path: draft.path,
                    operation: text,
                    operation_name,
                    variable_usages: variables.iter().map(|v| v.name.clone()).collect(),
                    depends_on: draft.depends_on,
                    input: draft.input,
                    anchor_field: draft.anchor_field,
                    response_keys,
                }
            })
            .collect()
    }
}

fn group_index(groups: &mut Vec<EntityGroup<'_>>, subgraph: &str) -> usize {
    match groups.iter().position(|group| group.subgraph == subgraph) {
        Some(index) => index,
        None => {
            groups.push(EntityGroup::new(subgraph));
            groups.len() - 1
        }
    }
}

/// Kahn's algorithm over the groups' `after` edges. Ties keep first-appearance
/// order. On a cycle, returns the subgraphs left unordered.
fn topological_order(groups: &[EntityGroup<'_>]) -> Result<Vec<usize>, Vec<String>> {
    let mut remaining: Vec<usize> = groups.iter().map(|group| group.after.len()).collect();
    let mut order = Vec::with_capacity(groups.len());
    let mut done = vec![false; groups.len()];

    while order.len() < groups.len() {
        let Some(next) = (0..groups.len()).find(|&index| !done[index] && remaining[index] == 0)
        else {
            let mut cycle: Vec<String> = (0..groups.len())
                .filter(|&index| !done[index])
                .map(|index| groups[index].subgraph.clone())
                .collect();
            cycle.sort();
            return Err(cycle);
        };
        done[next] = true;
        order.push(next);
        for (index, group) in groups.iter().enumerate() {
            if group.after.contains(&next) {
                remaining[index] -= 1;
            }
        }
    }
    Ok(order)
}

fn child_path(path: &[String], field: &ShapeField) -> Vec<String> {
    let mut child = path.to_vec();
    child.push(field.response_key.clone());
    child.extend(std::iter::repeat_n(FLATTEN.to_string(), field.ty.list_depth()));
    child
}
