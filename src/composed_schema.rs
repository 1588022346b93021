use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;

use crate::capability::{
    ArgumentDef, BUILTIN_SCALARS, EntityRole, EnumDef, InputObjectDef, TypeRef,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComposedField {
    pub name: String,
    pub arguments: Vec<ArgumentDef>,
    pub ty: TypeRef,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComposedObject {
    pub name: String,
    pub fields: BTreeMap<String, ComposedField>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ComposedType {
    Object(ComposedObject),
    InputObject(InputObjectDef),
    Enum(EnumDef),
    Scalar(String),
}

/// How one subgraph takes part in an entity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntityParticipant {
    pub role: EntityRole,
    /// The key this subgraph's entity resolver expects in a representation.
    pub key: Vec<String>,
    /// Every field the subgraph declares on the entity, owned or referenced.
    /// A subgraph can only hand out representations built from these.
    pub declared_fields: BTreeSet<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntityOwnership {
    pub base: String,
    pub extenders: BTreeSet<String>,
    pub participants: BTreeMap<String, EntityParticipant>,
}

impl EntityOwnership {
    pub fn participant(&self, subgraph: &str) -> Option<&EntityParticipant> {
        self.participants.get(subgraph)
    }

    /// Whether `subgraph` can build representations that `target` accepts.
    pub fn can_reference(&self, subgraph: &str, target: &str) -> bool {
        match (self.participants.get(subgraph), self.participants.get(target)) {
            (Some(origin), Some(target)) => target
                .key
                .iter()
                .all(|field| origin.declared_fields.contains(field)),
            _ => false,
        }
    }
}

/// Which subgraph resolves which field, and who takes part in each entity.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OwnershipIndex {
    pub(crate) fields: BTreeMap<(String, String), String>,
    pub(crate) requires: BTreeMap<(String, String), Vec<String>>,
    pub(crate) entities: BTreeMap<String, EntityOwnership>,
}

impl OwnershipIndex {
    pub fn owner(&self, type_name: &str, field: &str) -> Option<&str> {
        self.fields
            .get(&(type_name.to_string(), field.to_string()))
            .map(String::as_str)
    }

    pub fn requires(&self, type_name: &str, field: &str) -> &[String] {
        self.requires
            .get(&(type_name.to_string(), field.to_string()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn entity(&self, type_name: &str) -> Option<&EntityOwnership> {
        self.entities.get(type_name)
    }

    pub fn entities(&self) -> impl Iterator<Item = (&str, &EntityOwnership)> {
        self.entities.iter().map(|(name, entity)| (name.as_str(), entity))
    }

    /// Subgraphs that own at least one field.
    pub fn subgraphs(&self) -> BTreeSet<&str> {
        self.fields.values().map(String::as_str).collect()
    }
}

/// The merged public schema plus its ownership index. Immutable once built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComposedSchema {
    types: BTreeMap<String, ComposedType>,
    pub(crate) ownership: OwnershipIndex,
    sdl: String,
}

impl ComposedSchema {
    pub(crate) fn new(types: BTreeMap<String, ComposedType>, ownership: OwnershipIndex) -> Self {
        let sdl = print_sdl(&types);
        ComposedSchema {
            types,
            ownership,
            sdl,
        }
    }

    /// The public schema in SDL form. Types, fields, arguments and enum
    /// values are printed in lexical order.
    pub fn sdl(&self) -> &str {
        &self.sdl
    }

    pub fn ownership(&self) -> &OwnershipIndex {
        &self.ownership
    }

    pub fn types(&self) -> impl Iterator<Item = &ComposedType> {
        self.types.values()
    }

    pub fn get_type(&self, name: &str) -> Option<&ComposedType> {
        self.types.get(name)
    }

    pub fn object(&self, name: &str) -> Option<&ComposedObject> {
        match self.types.get(name) {
            Some(ComposedType::Object(object)) => Some(object),
            _ => None,
        }
    }

    pub fn query_type(&self) -> Option<&ComposedObject> {
        self.object("Query")
    }

    pub fn mutation_type(&self) -> Option<&ComposedObject> {
        self.object("Mutation")
    }

    pub fn is_known_type(&self, name: &str) -> bool {
        BUILTIN_SCALARS.contains(&name) || self.types.contains_key(name)
    }

    /// Whether values of `name` need a sub-selection.
    pub fn is_composite(&self, name: &str) -> bool {
        matches!(self.types.get(name), Some(ComposedType::Object(_)))
    }
}

fn print_sdl(types: &BTreeMap<String, ComposedType>) -> String {
    let mut sdl = String::new();
    for (index, composed) in types.values().enumerate() {
        if index > 0 {
            sdl.push('\n');
        }
        // Writing into a String cannot fail.
        let _ = match composed {
            ComposedType::Object(object) => print_object(&mut sdl, object),
            ComposedType::InputObject(input) => print_input_object(&mut sdl, input),
            ComposedType::Enum(enum_type) => print_enum(&mut sdl, enum_type),
            ComposedType::Scalar(name) => writeln!(sdl, "scalar {name}"),
        };
    }
    sdl
}

fn print_object(sdl: &mut String, object: &ComposedObject) -> std::fmt::Result {
    writeln!(sdl, "type {} {{", object.name)?;
    for field in object.fields.values() {
        write!(sdl, "  {}", field.name)?;
        if !field.arguments.is_empty() {
            let mut arguments: Vec<&ArgumentDef> = field.arguments.iter().collect();
            arguments.sort_by(|a, b| a.name.cmp(&b.name));
            let printed: Vec<String> = arguments.into_iter().map(print_argument).collect();
            write!(sdl, "({})", printed.join(", "))?;
        }
        writeln!(sdl, ": {}", field.ty)?;
    }
    writeln!(sdl, "}}")
}

fn print_input_object(sdl: &mut String, input: &InputObjectDef) -> std::fmt::Result {
    writeln!(sdl, "input {} {{", input.name)?;
    for field in input.fields.values() {
        writeln!(sdl, "  {}", print_argument(field))?;
    }
    writeln!(sdl, "}}")
}

fn print_enum(sdl: &mut String, enum_type: &EnumDef) -> std::fmt::Result {
    writeln!(sdl, "enum {} {{", enum_type.name)?;
    for value in &enum_type.values {
        writeln!(sdl, "  {value}")?;
    }
    writeln!(sdl, "}}")
}

fn print_argument(argument: &ArgumentDef) -> String {
    match &argument.default_value {
        Some(default) => format!("{}: {} = {default}", argument.name, argument.ty),
        None => format!("{}: {}", argument.name, argument.ty),
    }
}
