use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use graphql_parser::schema::{
    Definition, Directive, EnumType, Field, InputObjectType, InputValue, ObjectType, Text,
    Type, TypeDefinition, TypeExtension, Value, parse_schema,
};

use crate::error::CapabilityError;

pub const BUILTIN_SCALARS: [&str; 5] = ["Boolean", "Float", "ID", "Int", "String"];

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TypeRef {
    Named(String),
    List(Box<TypeRef>),
    NonNull(Box<TypeRef>),
}

impl TypeRef {
    pub fn named(name: impl Into<String>) -> Self {
        TypeRef::Named(name.into())
    }

    pub fn non_null(inner: TypeRef) -> Self {
        TypeRef::NonNull(Box::new(inner))
    }

    pub fn list(inner: TypeRef) -> Self {
        TypeRef::List(Box::new(inner))
    }

    /// The innermost named type.
    pub fn name(&self) -> &str {
        match self {
            TypeRef::Named(name) => name,
            TypeRef::List(inner) | TypeRef::NonNull(inner) => inner.name(),
        }
    }

    pub fn is_non_null(&self) -> bool {
        matches!(self, TypeRef::NonNull(_))
    }

    /// Number of list wrappers between the field and its named type.
    pub fn list_depth(&self) -> usize {
        match self {
            TypeRef::Named(_) => 0,
            TypeRef::NonNull(inner) => inner.list_depth(),
            TypeRef::List(inner) => 1 + inner.list_depth(),
        }
    }

    pub(crate) fn from_ast<'a, T: Text<'a>>(ty: &Type<'a, T>) -> Self {
        match ty {
            Type::NamedType(name) => TypeRef::Named(name.as_ref().to_string()),
            Type::ListType(inner) => TypeRef::list(TypeRef::from_ast(inner)),
            Type::NonNullType(inner) => TypeRef::non_null(TypeRef::from_ast(inner)),
        }
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeRef::Named(name) => f.write_str(name),
            TypeRef::List(inner) => write!(f, "[{inner}]"),
            TypeRef::NonNull(inner) => write!(f, "{inner}!"),
        }
    }
}

/// An argument of a field, or a field of an input object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArgumentDef {
    pub name: String,
    pub ty: TypeRef,
    /// Default value, kept in its GraphQL literal form.
    pub default_value: Option<String>,
}

impl ArgumentDef {
    pub fn is_required(&self) -> bool {
        self.ty.is_non_null() && self.default_value.is_none()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldResolution {
    /// The subgraph can resolve this field.
    Owned,
    /// The subgraph only references the field (`@external`, or a key field of
    /// an entity it extends).
    External,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldDef {
    pub name: String,
    pub arguments: Vec<ArgumentDef>,
    pub ty: TypeRef,
    pub resolution: FieldResolution,
    /// Entity fields this field needs in its representation (`@requires`).
    pub requires: Vec<String>,
}

impl FieldDef {
    pub fn is_owned(&self) -> bool {
        self.resolution == FieldResolution::Owned
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectDef {
    pub name: String,
    pub fields: BTreeMap<String, FieldDef>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InputObjectDef {
    pub name: String,
    pub fields: BTreeMap<String, ArgumentDef>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnumDef {
    pub name: String,
    pub values: BTreeSet<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TypeDef {
    Object(ObjectDef),
    InputObject(InputObjectDef),
    Enum(EnumDef),
    Scalar(String),
}

impl TypeDef {
    pub fn name(&self) -> &str {
        match self {
            TypeDef::Object(object) => &object.name,
            TypeDef::InputObject(input) => &input.name,
            TypeDef::Enum(enum_type) => &enum_type.name,
            TypeDef::Scalar(name) => name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TypeDef::Object(_) => "object type",
            TypeDef::InputObject(_) => "input object",
            TypeDef::Enum(_) => "enum",
            TypeDef::Scalar(_) => "scalar",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntityRole {
    /// Declares the entity and provides its canonical lookup resolver.
    Base,
    /// Contributes extra fields keyed by the entity's identity.
    Extension,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntityKey {
    pub type_name: String,
    pub fields: Vec<String>,
    pub role: EntityRole,
}

/// Everything one subgraph declares it can resolve.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CapabilitySet {
    pub types: BTreeMap<String, TypeDef>,
    pub entities: BTreeMap<String, EntityKey>,
}

impl CapabilitySet {
    pub fn from_sdl(subgraph: &str, sdl: &str) -> Result<Self, CapabilityError> {
        let document = parse_schema::<String>(sdl).map_err(|e| CapabilityError::Parse {
            subgraph: subgraph.to_string(),
            reason: e.to_string(),
        })?;

        let mut builder = CapabilityBuilder::new(subgraph);
        for definition in &document.definitions {
            match definition {
                Definition::SchemaDefinition(_) | Definition::DirectiveDefinition(_) => {}
                Definition::TypeDefinition(typedef) => builder.add_definition(typedef)?,
                Definition::TypeExtension(extension) => builder.add_extension(extension)?,
            }
        }
        builder.finish()
    }

    pub fn object(&self, name: &str) -> Option<&ObjectDef> {
        match self.types.get(name) {
            Some(TypeDef::Object(object)) => Some(object),
            _ => None,
        }
    }
}

/// Names federation tooling injects into subgraph SDL; they never reach the
/// composed schema.
fn is_federation_plumbing(name: &str) -> bool {
    name.starts_with('_')
        || name.starts_with("link__")
        || name.starts_with("federation__")
        || name == "FieldSet"
}

struct KeyDeclaration {
    fields: Vec<String>,
    role: EntityRole,
}

struct CapabilityBuilder<'s> {
    subgraph: &'s str,
    types: BTreeMap<String, TypeDef>,
    keys: BTreeMap<String, KeyDeclaration>,
}

impl<'s> CapabilityBuilder<'s> {
    fn new(subgraph: &'s str) -> Self {
        CapabilityBuilder {
            subgraph,
            types: BTreeMap::new(),
            keys: BTreeMap::new(),
        }
    }

    fn add_definition(
        &mut self,
        typedef: &TypeDefinition<'_, String>,
    ) -> Result<(), CapabilityError> {
        match typedef {
            TypeDefinition::Object(object) => self.add_object(object),
            TypeDefinition::InputObject(input) => self.add_input_object(input),
            TypeDefinition::Enum(enum_type) => self.add_enum(enum_type),
            TypeDefinition::Scalar(scalar) => {
                if !is_federation_plumbing(&scalar.name) {
                    self.types
                        .entry(scalar.name.clone())
                        .or_insert_with(|| TypeDef::Scalar(scalar.name.clone()));
                }
                Ok(())
            }
            TypeDefinition::Interface(iface) => {
                Err(unsupported(self.subgraph, "interface", &iface.name))
            }
            TypeDefinition::Union(union_type) => {
                if is_federation_plumbing(&union_type.name) {
                    Ok(())
                } else {
                    Err(unsupported(self.subgraph, "union", &union_type.name))
                }
            }
        }
    }

    fn add_extension(
        &mut self,
        extension: &TypeExtension<'_, String>,
    ) -> Result<(), CapabilityError> {
        match extension {
            TypeExtension::Object(object) => self.merge_object(
                &object.name,
                &object.directives,
                &object.fields,
                true,
            ),
            TypeExtension::InputObject(input) => {
                self.merge_input_fields(&input.name, &input.fields);
                Ok(())
            }
            TypeExtension::Enum(enum_type) => {
                self.merge_enum_values(
                    &enum_type.name,
                    enum_type.values.iter().map(|value| value.name.clone()),
                );
                Ok(())
            }
            TypeExtension::Scalar(_) => Ok(()),
            TypeExtension::Interface(iface) => {
                Err(unsupported(self.subgraph, "interface", &iface.name))
            }
            TypeExtension::Union(union_type) => {
                Err(unsupported(self.subgraph, "union", &union_type.name))
            }
        }
    }

    fn add_object(&mut self, object: &ObjectType<'_, String>) -> Result<(), CapabilityError> {
        let extends = object
            .directives
            .iter()
            .any(|directive| directive.name == "extends");
        self.merge_object(&object.name, &object.directives, &object.fields, extends)
    }

    fn merge_object(
        &mut self,
        name: &str,
        directives: &[Directive<'_, String>],
        fields: &[Field<'_, String>],
        is_extension: bool,
    ) -> Result<(), CapabilityError> {
        if is_federation_plumbing(name) {
            return Ok(());
        }
        let subgraph = self.subgraph;

        if let Some(key_fields) = self.key_fields(name, directives)? {
            let role = if is_extension {
                EntityRole::Extension
            } else {
                EntityRole::Base
            };
            match self.keys.get(name) {
                // A base declaration wins over an extension of the same type.
                Some(existing) if existing.role == EntityRole::Base => {}
                _ => {
                    self.keys.insert(
                        name.to_string(),
                        KeyDeclaration {
                            fields: key_fields,
                            role,
                        },
                    );
                }
            }
        }

        let mut converted = Vec::with_capacity(fields.len());
        for field in fields {
            if is_federation_plumbing(&field.name) {
                continue;
            }
            converted.push(self.convert_field(name, field)?);
        }

        let entry = self.types.entry(name.to_string()).or_insert_with(|| {
            TypeDef::Object(ObjectDef {
                name: name.to_string(),
                fields: BTreeMap::new(),
            })
        });
        let TypeDef::Object(object) = entry else {
            return Err(unsupported(subgraph, "conflicting definition for", name));
        };
        for field in converted {
            object.fields.entry(field.name.clone()).or_insert(field);
        }
        Ok(())
    }

    fn key_fields(
        &self,
        type_name: &str,
        directives: &[Directive<'_, String>],
    ) -> Result<Option<Vec<String>>, CapabilityError> {
        let Some(key) = directives.iter().find(|directive| directive.name == "key") else {
            return Ok(None);
        };
        let subgraph = self.subgraph;
        let fields = string_argument(key, "fields").ok_or_else(|| {
            invalid_directive(subgraph, type_name, "key", "missing `fields` argument")
        })?;
        let fields = parse_field_set(fields)
            .map_err(|reason| invalid_directive(subgraph, type_name, "key", reason))?;
        Ok(Some(fields))
    }

    fn convert_field(
        &self,
        type_name: &str,
        field: &Field<'_, String>,
    ) -> Result<FieldDef, CapabilityError> {
        let subgraph = self.subgraph;
        let mut resolution = FieldResolution::Owned;
        let mut requires = Vec::new();
        for directive in &field.directives {
            match directive.name.as_str() {
                "external" => resolution = FieldResolution::External,
                "requires" => {
                    let fields = string_argument(directive, "fields").ok_or_else(|| {
                        invalid_directive(subgraph, type_name, "requires", "missing `fields`")
                    })?;
                    requires = parse_field_set(fields).map_err(|reason| {
                        invalid_directive(subgraph, type_name, "requires", reason)
                    })?;
                }
                _ => {}
            }
        }

        Ok(FieldDef {
            name: field.name.clone(),
            arguments: field.arguments.iter().map(convert_input_value).collect(),
            ty: TypeRef::from_ast(&field.field_type),
            resolution,
            requires,
        })
    }

    fn add_input_object(
        &mut self,
        input: &InputObjectType<'_, String>,
    ) -> Result<(), CapabilityError> {
        self.merge_input_fields(&input.name, &input.fields);
        Ok(())
    }

    fn merge_input_fields(&mut self, name: &str, fields: &[InputValue<'_, String>]) {
        let entry = self.types.entry(name.to_string()).or_insert_with(|| {
            TypeDef::InputObject(InputObjectDef {
                name: name.to_string(),
                fields: BTreeMap::new(),
            })
        });
        if let TypeDef::InputObject(input) = entry {
            for field in fields {
                input
                    .fields
                    .entry(field.name.clone())
                    .or_insert_with(|| convert_input_value(field));
            }
        }
    }

    fn add_enum(&mut self, enum_type: &EnumType<'_, String>) -> Result<(), CapabilityError> {
        self.merge_enum_values(
            &enum_type.name,
            enum_type.values.iter().map(|value| value.name.clone()),
        );
        Ok(())
    }

    fn merge_enum_values(&mut self, name: &str, values: impl Iterator<Item = String>) {
        if is_federation_plumbing(name) {
            return;
        }
        let entry = self.types.entry(name.to_string()).or_insert_with(|| {
            TypeDef::Enum(EnumDef {
                name: name.to_string(),
                values: BTreeSet::new(),
            })
        });
        if let TypeDef::Enum(enum_type) = entry {
            enum_type.values.extend(values);
        }
    }

    fn finish(mut self) -> Result<CapabilitySet, CapabilityError> {
        let subgraph = self.subgraph;
        let mut entities = BTreeMap::new();

        for (type_name, key) in std::mem::take(&mut self.keys) {
            let Some(TypeDef::Object(object)) = self.types.get_mut(&type_name) else {
                let reason = "@key on a non-object type";
                return Err(invalid_directive(subgraph, &type_name, "key", reason));
            };

            for key_field in &key.fields {
                let Some(field) = object.fields.get_mut(key_field) else {
                    let reason = format!("key field \"{key_field}\" is not declared");
                    return Err(invalid_directive(subgraph, &type_name, "key", reason));
                };
                // An extension only references the identity, it never owns it.
                if key.role == EntityRole::Extension {
                    field.resolution = FieldResolution::External;
                }
            }

            entities.insert(
                type_name.clone(),
                EntityKey {
                    type_name,
                    fields: key.fields,
                    role: key.role,
                },
            );
        }

        for typedef in self.types.values() {
            let TypeDef::Object(object) = typedef else {
                continue;
            };
            for field in object.fields.values() {
                if field.requires.is_empty() {
                    continue;
                }
                if !entities.contains_key(&object.name) {
                    return Err(invalid_directive(
                        subgraph,
                        &object.name,
                        "requires",
                        "only entity fields may declare requirements",
                    ));
                }
                if let Some(missing) = field
                    .requires
                    .iter()
                    .find(|required| !object.fields.contains_key(*required))
                {
                    let reason = format!(
                        "field \"{}\" requires undeclared field \"{missing}\"",
                        field.name
                    );
                    return Err(invalid_directive(subgraph, &object.name, "requires", reason));
                }
            }
        }

        Ok(CapabilitySet {
            types: self.types,
            entities,
        })
    }
}

fn unsupported(subgraph: &str, kind: &'static str, name: &str) -> CapabilityError {
    CapabilityError::Unsupported {
        subgraph: subgraph.to_string(),
        kind,
        name: name.to_string(),
    }
}

fn invalid_directive(
    subgraph: &str,
    type_name: &str,
    directive: &'static str,
    reason: impl Into<String>,
) -> CapabilityError {
    CapabilityError::InvalidDirective {
        subgraph: subgraph.to_string(),
        type_name: type_name.to_string(),
        directive,
        reason: reason.into(),
    }
}

fn string_argument<'d>(directive: &'d Directive<'_, String>, name: &str) -> Option<&'d str> {
    directive
        .arguments
        .iter()
        .find(|(argument, _)| argument == name)
        .and_then(|(_, value)| match value {
            Value::String(fields) => Some(fields.as_str()),
            _ => None,
        })
}

/// Parses a flat field set such as `"id"` or `"sku region"`. Nested
/// selections are not supported.
fn parse_field_set(fields: &str) -> Result<Vec<String>, String> {
    if fields.contains('{') {
        return Err(format!("nested field set \"{fields}\" is not supported"));
    }
    let parsed: Vec<String> = fields.split_whitespace().map(str::to_string).collect();
    if parsed.is_empty() {
        return Err("empty field set".to_string());
    }
    Ok(parsed)
}

fn convert_input_value(value: &InputValue<'_, String>) -> ArgumentDef {
    ArgumentDef {
        name: value.name.clone(),
        ty: TypeRef::from_ast(&value.value_type),
        default_value: value.default_value.as_ref().map(print_literal),
    }
}

fn print_literal(value: &Value<'_, String>) -> String {
    match value {
        Value::Variable(name) => format!("${name}"),
        Value::Int(number) => number
            .as_i64()
            .map(|n| n.to_string())
            .unwrap_or_default(),
        Value::Float(number) => number.to_string(),
        Value::String(string) => format!("{string:?}"),
        Value::Boolean(boolean) => boolean.to_string(),
        Value::Null => "null".to_string(),
        Value::Enum(name) => name.clone(),
        Value::List(items) => {
            let items: Vec<String> = items.iter().map(print_literal).collect();
            format!("[{}]", items.join(", "))
        }
        Value::Object(fields) => {
            let fields: Vec<String> = fields
                .iter()
                .map(|(name, value)| format!("{name}: {}", print_literal(value)))
                .collect();
            format!("{{{}}}", fields.join(", "))
        }
    }
}
