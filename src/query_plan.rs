use std::collections::BTreeSet;
use std::fmt::Write;

use reqwest::Url;

use crate::capability::TypeRef;
use crate::error::PlanningError;
use crate::operation::{InputValue, OperationKind};

/// Path segment standing for "every element of the list at this point".
pub const FLATTEN: &str = "@";

pub type NodeId = usize;

/// A field of the client selection, validated against the composed schema.
/// The stitcher walks this tree to rebuild the response.
#[derive(Clone, Debug, PartialEq)]
pub struct ShapeField {
    pub response_key: String,
    pub field_name: String,
    pub alias: Option<String>,
    pub arguments: Vec<(String, InputValue)>,
    pub parent_type: String,
    pub ty: TypeRef,
    pub selection: Vec<ShapeField>,
}

/// A field of a subgraph sub-request.
#[derive(Clone, Debug, PartialEq)]
pub struct FetchField {
    pub alias: Option<String>,
    pub name: String,
    pub arguments: Vec<(String, InputValue)>,
    pub selection: Vec<FetchField>,
}

impl FetchField {
    pub fn leaf(name: impl Into<String>) -> Self {
        FetchField {
            alias: None,
            name: name.into(),
            arguments: Vec::new(),
            selection: Vec::new(),
        }
    }

    pub fn response_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    pub(crate) fn collect_variables(&self, into: &mut BTreeSet<String>) {
        for (_, value) in &self.arguments {
            value.collect_variables(into);
        }
        for child in &self.selection {
            child.collect_variables(into);
        }
    }

    fn write_to(&self, out: &mut String) -> std::fmt::Result {
        if let Some(alias) = &self.alias {
            write!(out, "{alias}: ")?;
        }
        out.push_str(&self.name);
        if !self.arguments.is_empty() {
            out.push('(');
            for (index, (name, value)) in self.arguments.iter().enumerate() {
                if index > 0 {
                    out.push_str(", ");
                }
                write!(out, "{name}: {value}")?;
            }
            out.push(')');
        }
        if !self.selection.is_empty() {
            out.push(' ');
            write_selection(&self.selection, out)?;
        }
        Ok(())
    }
}

pub(crate) fn write_selection(fields: &[FetchField], out: &mut String) -> std::fmt::Result {
    out.push('{');
    for field in fields {
        out.push(' ');
        field.write_to(out)?;
    }
    out.push_str(" }");
    Ok(())
}

/// Adds `field` to `selection`, merging it into an existing field with the
/// same response key.
pub(crate) fn merge_field(
    selection: &mut Vec<FetchField>,
    field: FetchField,
    path: &[String],
) -> Result<(), PlanningError> {
    let Some(existing) = selection
        .iter_mut()
        .find(|existing| existing.response_key() == field.response_key())
    else {
        selection.push(field);
        return Ok(());
    };

    if existing.name != field.name || existing.arguments != field.arguments {
        let mut field_path = path.to_vec();
        field_path.push(field.response_key().to_string());
        return Err(PlanningError::validation(
            format!(
                "Alias \"{}\" hides field \"{}\" which is needed to join entities across \
                 subgraphs; choose a different alias.",
                field.response_key(),
                field.name
            ),
            &field_path,
        ));
    }

    let mut child_path = path.to_vec();
    child_path.push(field.response_key().to_string());
    for child in field.selection {
        merge_field(&mut existing.selection, child, &child_path)?;
    }
    Ok(())
}

/// How a node obtains its input.
#[derive(Clone, Debug, PartialEq)]
pub enum InputBinding {
    /// The node queries the subgraph's root fields directly.
    Root,
    /// The node resolves entities whose representations are collected from
    /// another node's output.
    Entities(EntityBinding),
}

#[derive(Clone, Debug, PartialEq)]
pub struct EntityBinding {
    pub origin: NodeId,
    /// Where the entities sit inside each object the origin node returned.
    pub path: Vec<String>,
    pub type_name: String,
    pub key_fields: Vec<String>,
    /// Fields the target's resolvers require in addition to the key.
    pub required_fields: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PlanNode {
    pub id: NodeId,
    pub subgraph: String,
    pub endpoint: Url,
    /// Response path, from the root, where this node's data lands.
    pub path: Vec<String>,
    pub operation: String,
    pub operation_name: Option<String>,
    pub variable_usages: Vec<String>,
    pub depends_on: BTreeSet<NodeId>,
    pub input: InputBinding,
    /// Response key of the first field the node resolves; failures of the
    /// node are reported at this field.
    pub anchor_field: String,
    /// Response keys of the top-level fields the node fetches, relative to
    /// each object it resolves.
    pub response_keys: Vec<String>,
}

impl PlanNode {
    pub fn entity_binding(&self) -> Option<&EntityBinding> {
        match &self.input {
            InputBinding::Root => None,
            InputBinding::Entities(binding) => Some(binding),
        }
    }
}

/// Nodes are stored in a topological order: every dependency of a node has a
/// smaller id than the node itself.
#[derive(Clone, Debug, PartialEq)]
pub struct ExecutionPlan {
    pub kind: OperationKind,
    pub root_type: String,
    pub nodes: Vec<PlanNode>,
    pub shape: Vec<ShapeField>,
}

impl ExecutionPlan {
    pub fn node(&self, id: NodeId) -> Option<&PlanNode> {
        self.nodes.get(id)
    }

    pub fn roots(&self) -> impl Iterator<Item = &PlanNode> {
        self.nodes.iter().filter(|node| node.depends_on.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn selection_prints_as_graphql() {
        let fields = vec![
            FetchField {
                alias: Some("primary".to_string()),
                name: "customer".to_string(),
                arguments: vec![("id".to_string(), InputValue::Variable("id".to_string()))],
                selection: vec![FetchField::leaf("name"), FetchField::leaf("id")],
            },
            FetchField::leaf("__typename"),
        ];
        let mut out = String::new();
        write_selection(&fields, &mut out).unwrap();
        assert_eq!(out, "{ primary: customer(id: $id) { name id } __typename }");
    }

    #[test]
    fn merging_unions_nested_selections() {
        let mut selection = vec![FetchField {
            selection: vec![FetchField::leaf("name")],
            ..FetchField::leaf("customer")
        }];
        let addition = FetchField {
            selection: vec![FetchField::leaf("id"), FetchField::leaf("name")],
            ..FetchField::leaf("customer")
        };
        merge_field(&mut selection, addition, &[]).unwrap();

        assert_eq!(selection.len(), 1);
        let keys: Vec<&str> = selection[0].selection.iter().map(FetchField::response_key).collect();
        assert_eq!(keys, vec!["name", "id"]);
    }

    #[test]
    fn alias_hiding_a_join_field_is_rejected() {
        let mut selection = vec![FetchField {
            alias: Some("id".to_string()),
            ..FetchField::leaf("name")
        }];
        let err = merge_field(&mut selection, FetchField::leaf("id"), &["customer".to_string()])
            .unwrap_err();
        assert!(matches!(
            err,
            PlanningError::Validation { ref path, .. } if path == &["customer", "id"]
        ));
    }
}
