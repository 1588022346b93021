use std::collections::{BTreeSet, HashMap};
use std::fmt;

use graphql_parser::query::{
    Definition, Directive, FragmentDefinition, OperationDefinition, Selection, SelectionSet,
    TypeCondition, Value, parse_query,
};
use serde_json::{Map, Value as JsonValue};

use crate::GraphQLRequest;
use crate::capability::TypeRef;
use crate::error::PlanningError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationKind {
    Query,
    Mutation,
}

impl OperationKind {
    pub fn root_type(&self) -> &'static str {
        match self {
            OperationKind::Query => "Query",
            OperationKind::Mutation => "Mutation",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Query => f.write_str("query"),
            OperationKind::Mutation => f.write_str("mutation"),
        }
    }
}

/// An argument or variable default as written in the client document.
#[derive(Clone, Debug, PartialEq)]
pub enum InputValue {
    Variable(String),
    Int(i64),
    Float(f64),
    String(String),
    Boolean(bool),
    Null,
    Enum(String),
    List(Vec<InputValue>),
    Object(Vec<(String, InputValue)>),
}

impl InputValue {
    fn from_ast(value: &Value<'_, String>) -> Self {
        match value {
            Value::Variable(name) => InputValue::Variable(name.clone()),
            Value::Int(number) => InputValue::Int(number.as_i64().unwrap_or_default()),
            Value::Float(number) => InputValue::Float(*number),
            Value::String(string) => InputValue::String(string.clone()),
            Value::Boolean(boolean) => InputValue::Boolean(*boolean),
            Value::Null => InputValue::Null,
            Value::Enum(name) => InputValue::Enum(name.clone()),
            Value::List(items) => {
                InputValue::List(items.iter().map(InputValue::from_ast).collect())
            }
            Value::Object(fields) => InputValue::Object(
                fields
                    .iter()
                    .map(|(name, value)| (name.clone(), InputValue::from_ast(value)))
                    .collect(),
            ),
        }
    }

    pub fn collect_variables(&self, into: &mut BTreeSet<String>) {
        match self {
            InputValue::Variable(name) => {
                into.insert(name.clone());
            }
            InputValue::List(items) => {
                for item in items {
                    item.collect_variables(into);
                }
            }
            InputValue::Object(fields) => {
                for (_, value) in fields {
                    value.collect_variables(into);
                }
            }
            _ => {}
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, InputValue::Null)
    }
}

impl fmt::Display for InputValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputValue::Variable(name) => write!(f, "${name}"),
            InputValue::Int(number) => write!(f, "{number}"),
            InputValue::Float(number) => write!(f, "{number:?}"),
            InputValue::String(string) => {
                // JSON string escaping is valid GraphQL string escaping.
                let escaped = serde_json::to_string(string).map_err(|_| fmt::Error)?;
                f.write_str(&escaped)
            }
            InputValue::Boolean(boolean) => write!(f, "{boolean}"),
            InputValue::Null => f.write_str("null"),
            InputValue::Enum(name) => f.write_str(name),
            InputValue::List(items) => {
                f.write_str("[")?;
                for (index, item) in items.iter().enumerate() {
                    if index > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            InputValue::Object(fields) => {
                f.write_str("{")?;
                for (index, (name, value)) in fields.iter().enumerate() {
                    if index > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{name}: {value}")?;
                }
                f.write_str("}")
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct VariableDefinition {
    pub name: String,
    pub ty: TypeRef,
    pub default_value: Option<InputValue>,
}

impl fmt::Display for VariableDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}: {}", self.name, self.ty)?;
        if let Some(default) = &self.default_value {
            write!(f, " = {default}")?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldSelection {
    pub alias: Option<String>,
    pub name: String,
    pub arguments: Vec<(String, InputValue)>,
    /// Type conditions of the fragments this field was selected through,
    /// one per occurrence that had one.
    pub type_conditions: Vec<String>,
    pub selection: Vec<FieldSelection>,
}

impl FieldSelection {
    pub fn response_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct NormalizedOperation {
    pub kind: OperationKind,
    pub name: Option<String>,
    pub variable_definitions: Vec<VariableDefinition>,
    pub selection: Vec<FieldSelection>,
}

impl NormalizedOperation {
    pub fn variable(&self, name: &str) -> Option<&VariableDefinition> {
        self.variable_definitions
            .iter()
            .find(|definition| definition.name == name)
    }
}

pub fn normalize(request: &GraphQLRequest) -> Result<NormalizedOperation, PlanningError> {
    let document = parse_query::<String>(&request.query)
        .map_err(|e| PlanningError::Parse(format!("Syntax Error: {e}")))?;

    let mut fragments = HashMap::new();
    let mut operations = Vec::new();
    for definition in &document.definitions {
        match definition {
            Definition::Operation(operation) => operations.push(operation),
            Definition::Fragment(fragment) => {
                if fragments.insert(fragment.name.as_str(), fragment).is_some() {
                    return Err(PlanningError::validation(
                        format!("There can be only one fragment named \"{}\".", fragment.name),
                        &[],
                    ));
                }
            }
        }
    }

    let operation = select_operation(&operations, request.operation_name.as_deref())?;
    let (kind, name, variable_definitions, selection_set) = match operation {
        OperationDefinition::SelectionSet(set) => (OperationKind::Query, None, &[][..], set),
        OperationDefinition::Query(query) => (
            OperationKind::Query,
            query.name.clone(),
            query.variable_definitions.as_slice(),
            &query.selection_set,
        ),
        OperationDefinition::Mutation(mutation) => (
            OperationKind::Mutation,
            mutation.name.clone(),
            mutation.variable_definitions.as_slice(),
            &mutation.selection_set,
        ),
        OperationDefinition::Subscription(_) => {
            return Err(PlanningError::validation(
                "Subscriptions are not supported by this gateway.",
                &[],
            ));
        }
    };

    let variable_definitions: Vec<VariableDefinition> = variable_definitions
        .iter()
        .map(|definition| VariableDefinition {
            name: definition.name.clone(),
            ty: TypeRef::from_ast(&definition.var_type),
            default_value: definition.default_value.as_ref().map(InputValue::from_ast),
        })
        .collect();

    let empty = Map::new();
    let provided = request.variables.as_ref().unwrap_or(&empty);
    for definition in &variable_definitions {
        let missing = provided.get(&definition.name).is_none_or(JsonValue::is_null);
        if definition.ty.is_non_null() && definition.default_value.is_none() && missing {
            return Err(PlanningError::validation(
                format!(
                    "Variable \"${}\" of required type \"{}\" was not provided.",
                    definition.name, definition.ty
                ),
                &[],
            ));
        }
    }

    let normalizer = Normalizer {
        fragments,
        provided,
        variables: &variable_definitions,
    };
    let mut fields = Vec::new();
    normalizer.collect(selection_set, None, &mut Vec::new(), &mut fields)?;
    let selection = merge_fields(fields, &[])?;

    Ok(NormalizedOperation {
        kind,
        name,
        variable_definitions,
        selection,
    })
}

fn select_operation<'d, 'a>(
    operations: &[&'d OperationDefinition<'a, String>],
    requested: Option<&str>,
) -> Result<&'d OperationDefinition<'a, String>, PlanningError> {
    let name_of = |operation: &OperationDefinition<'a, String>| match operation {
        OperationDefinition::SelectionSet(_) => None,
        OperationDefinition::Query(query) => query.name.clone(),
        OperationDefinition::Mutation(mutation) => mutation.name.clone(),
        OperationDefinition::Subscription(subscription) => subscription.name.clone(),
    };

    match (requested, operations) {
        (Some(requested), _) => operations
            .iter()
            .copied()
            .find(|operation| name_of(operation).as_deref() == Some(requested))
            .ok_or_else(|| {
                PlanningError::validation(format!("Unknown operation named \"{requested}\"."), &[])
            }),
        (None, [single]) => Ok(*single),
        (None, []) => Err(PlanningError::validation("Must provide an operation.", &[])),
        (None, _) => Err(PlanningError::validation(
            "Must provide operation name if query contains multiple operations.",
            &[],
        )),
    }
}

struct Normalizer<'q, 'a> {
    fragments: HashMap<&'q str, &'q FragmentDefinition<'a, String>>,
    provided: &'q Map<String, JsonValue>,
    variables: &'q [VariableDefinition],
}

impl<'q, 'a> Normalizer<'q, 'a> {
    fn collect(
        &self,
        set: &'q SelectionSet<'a, String>,
        type_condition: Option<&'q str>,
        spreading: &mut Vec<&'q str>,
        out: &mut Vec<FieldSelection>,
    ) -> Result<(), PlanningError> {
        for item in &set.items {
            match item {
                Selection::Field(field) => {
                    if !self.included(&field.directives)? {
                        continue;
                    }
                    let mut arguments = Vec::with_capacity(field.arguments.len());
                    for (name, value) in &field.arguments {
                        let value = InputValue::from_ast(value);
                        self.check_defined(&value)?;
                        arguments.push((name.clone(), value));
                    }
                    let mut children = Vec::new();
                    self.collect(&field.selection_set, None, spreading, &mut children)?;
                    out.push(FieldSelection {
                        alias: field.alias.clone(),
                        name: field.name.clone(),
                        arguments,
                        type_conditions: type_condition.into_iter().map(str::to_string).collect(),
                        selection: children,
                    });
                }
                Selection::FragmentSpread(spread) => {
                    if !self.included(&spread.directives)? {
                        continue;
                    }
                    let name = spread.fragment_name.as_str();
                    let Some(&fragment) = self.fragments.get(name) else {
                        return Err(PlanningError::validation(
                            format!("Unknown fragment \"{name}\"."),
                            &[],
                        ));
                    };
                    if spreading.contains(&name) {
                        return Err(PlanningError::validation(
                            format!("Cannot spread fragment \"{name}\" within itself."),
                            &[],
                        ));
                    }
                    let TypeCondition::On(condition) = &fragment.type_condition;
                    let condition = Some(condition.as_str());
                    spreading.push(name);
                    self.collect(&fragment.selection_set, condition, spreading, out)?;
                    spreading.pop();
                }
                Selection::InlineFragment(inline) => {
                    if !self.included(&inline.directives)? {
                        continue;
                    }
                    let condition = match &inline.type_condition {
                        Some(TypeCondition::On(condition)) => Some(condition.as_str()),
                        None => type_condition,
                    };
                    self.collect(&inline.selection_set, condition, spreading, out)?;
                }
            }
        }
        Ok(())
    }

    fn check_defined(&self, value: &InputValue) -> Result<(), PlanningError> {
        let mut used = BTreeSet::new();
        value.collect_variables(&mut used);
        match used
            .iter()
            .find(|name| !self.variables.iter().any(|definition| &definition.name == *name))
        {
            Some(name) => Err(PlanningError::validation(
                format!("Variable \"${name}\" is not defined."),
                &[],
            )),
            None => Ok(()),
        }
    }

    /// Evaluates `@skip` and `@include`.
    fn included(&self, directives: &[Directive<'a, String>]) -> Result<bool, PlanningError> {
        for directive in directives {
            let expected = match directive.name.as_str() {
                "skip" => false,
                "include" => true,
                _ => continue,
            };
            let condition = directive
                .arguments
                .iter()
                .find(|(name, _)| name == "if")
                .map(|(_, value)| self.boolean(value))
                .transpose()?
                .flatten()
                .ok_or_else(|| {
                    PlanningError::validation(
                        format!(
                            "Directive \"@{}\" argument \"if\" of type \"Boolean!\" is required.",
                            directive.name
                        ),
                        &[],
                    )
                })?;
            if condition != expected {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn boolean(&self, value: &Value<'a, String>) -> Result<Option<bool>, PlanningError> {
        match value {
            Value::Boolean(flag) => Ok(Some(*flag)),
            Value::Variable(name) => {
                let Some(definition) = self.variables.iter().find(|d| &d.name == name) else {
                    return Err(PlanningError::validation(
                        format!("Variable \"${name}\" is not defined."),
                        &[],
                    ));
                };
                let provided = self.provided.get(name).and_then(JsonValue::as_bool);
                let default = match &definition.default_value {
                    Some(InputValue::Boolean(flag)) => Some(*flag),
                    _ => None,
                };
                Ok(provided.or(default))
            }
            _ => Ok(None),
        }
    }
}

/// Merges fields sharing a response key, keeping first-appearance order.
pub(crate) fn merge_fields(
    fields: Vec<FieldSelection>,
    path: &[String],
) -> Result<Vec<FieldSelection>, PlanningError> {
    let mut merged: Vec<FieldSelection> = Vec::with_capacity(fields.len());
    let mut positions: HashMap<String, usize> = HashMap::new();

    for field in fields {
        let key = field.response_key().to_string();
        let Some(position) = positions.get(&key).copied() else {
            positions.insert(key, merged.len());
            merged.push(field);
            continue;
        };

        let existing = &mut merged[position];
        let mut field_path = path.to_vec();
        field_path.push(key.clone());
        if existing.name != field.name {
            return Err(PlanningError::validation(
                format!(
                    "Fields \"{key}\" conflict because \"{}\" and \"{}\" are different fields. \
                     Use different aliases on the fields to fetch both if this was intentional.",
                    existing.name, field.name
                ),
                &field_path,
            ));
        }
        if existing.arguments != field.arguments {
            return Err(PlanningError::validation(
                format!(
                    "Fields \"{key}\" conflict because they have differing arguments. \
                     Use different aliases on the fields to fetch both if this was intentional."
                ),
                &field_path,
            ));
        }
        for condition in field.type_conditions {
            if !existing.type_conditions.contains(&condition) {
                existing.type_conditions.push(condition);
            }
        }
        existing.selection.extend(field.selection);
    }

    for field in &mut merged {
        if field.selection.is_empty() {
            continue;
        }
        let mut field_path = path.to_vec();
        field_path.push(field.response_key().to_string());
        let selection = std::mem::take(&mut field.selection);
        field.selection = merge_fields(selection, &field_path)?;
    }
    Ok(merged)
}
