use std::collections::{BTreeMap, BTreeSet};

use crate::capability::{
    BUILTIN_SCALARS, CapabilitySet, EntityRole, EnumDef, FieldDef, InputObjectDef, TypeDef,
};
use crate::composed_schema::{
    ComposedField, ComposedObject, ComposedSchema, ComposedType, EntityOwnership,
    EntityParticipant, OwnershipIndex,
};
use crate::error::CompositionError;

type Subgraphs<'a> = BTreeMap<&'a str, &'a CapabilitySet>;

pub fn compose<'a, I>(capabilities: I) -> Result<ComposedSchema, CompositionError>
where
    I: IntoIterator<Item = (&'a String, &'a CapabilitySet)>,
{
    let subgraphs: Subgraphs<'a> = capabilities
        .into_iter()
        .map(|(name, set)| (name.as_str(), set))
        .collect();

    let entities = compose_entities(&subgraphs)?;
    let mut types = union_types(&subgraphs)?;
    let (fields, requires) = assign_field_owners(&subgraphs, &mut types)?;

    types.retain(|_, composed| match composed {
        ComposedType::Object(object) => !object.fields.is_empty(),
        _ => true,
    });
    check_references(&types, &fields, &subgraphs)?;

    Ok(ComposedSchema::new(
        types,
        OwnershipIndex {
            fields,
            requires,
            entities,
        },
    ))
}

fn compose_entities(
    subgraphs: &Subgraphs<'_>,
) -> Result<BTreeMap<String, EntityOwnership>, CompositionError> {
    let mut declarations: BTreeMap<&str, Vec<(&str, &CapabilitySet)>> = BTreeMap::new();
    for (&subgraph, set) in subgraphs {
        for type_name in set.entities.keys() {
            declarations
                .entry(type_name.as_str())
                .or_default()
                .push((subgraph, set));
        }
    }

    let mut entities = BTreeMap::new();
    for (type_name, declared_by) in declarations {
        let bases: Vec<String> = declared_by
            .iter()
            .filter(|(_, set)| set.entities[type_name].role == EntityRole::Base)
            .map(|(subgraph, _)| subgraph.to_string())
            .collect();
        if bases.len() > 1 {
            return Err(CompositionError::DuplicateOwnership {
                type_name: type_name.to_string(),
                field: None,
                subgraphs: bases,
            });
        }
        let Some(base) = bases.into_iter().next() else {
            return Err(CompositionError::MissingOwner {
                type_name: type_name.to_string(),
                field: None,
                subgraphs: declared_by.iter().map(|(name, _)| name.to_string()).collect(),
            });
        };

        // Resolving entity fields without a key would leave them unreachable.
        for (&subgraph, set) in subgraphs {
            if set.entities.contains_key(type_name) {
                continue;
            }
            let owns_fields = set
                .object(type_name)
                .is_some_and(|object| object.fields.values().any(FieldDef::is_owned));
            if owns_fields {
                let mut claimants = vec![base.clone(), subgraph.to_string()];
                claimants.sort();
                return Err(CompositionError::DuplicateOwnership {
                    type_name: type_name.to_string(),
                    field: None,
                    subgraphs: claimants,
                });
            }
        }

        let mut extenders = BTreeSet::new();
        let mut participants = BTreeMap::new();
        for (subgraph, set) in declared_by {
            let key = &set.entities[type_name];
            if key.role == EntityRole::Extension {
                extenders.insert(subgraph.to_string());
            }
            let declared_fields = set
                .object(type_name)
                .map(|object| object.fields.keys().cloned().collect())
                .unwrap_or_default();
            participants.insert(
                subgraph.to_string(),
                EntityParticipant {
                    role: key.role,
                    key: key.fields.clone(),
                    declared_fields,
                },
            );
        }

        entities.insert(
            type_name.to_string(),
            EntityOwnership {
                base,
                extenders,
                participants,
            },
        );
    }
    Ok(entities)
}

/// Creates one composed entry per type name. Object fields are filled in
/// later by ownership assignment; enums and input objects are merged here.
fn union_types(
    subgraphs: &Subgraphs<'_>,
) -> Result<BTreeMap<String, ComposedType>, CompositionError> {
    let mut types: BTreeMap<String, ComposedType> = BTreeMap::new();
    let mut first_declared_by: BTreeMap<&str, &str> = BTreeMap::new();

    for (&subgraph, set) in subgraphs {
        for (name, typedef) in &set.types {
            let first = *first_declared_by.entry(name.as_str()).or_insert(subgraph);
            let conflict = |field: Option<&str>| CompositionError::DuplicateOwnership {
                type_name: name.clone(),
                field: field.map(str::to_string),
                subgraphs: vec![first.to_string(), subgraph.to_string()],
            };

            let Some(existing) = types.get_mut(name) else {
                types.insert(name.clone(), fresh_type(typedef));
                continue;
            };
            match (existing, typedef) {
                (ComposedType::Object(_), TypeDef::Object(_))
                | (ComposedType::Scalar(_), TypeDef::Scalar(_)) => {}
                (ComposedType::Enum(composed), TypeDef::Enum(declared)) => {
                    composed.values.extend(declared.values.iter().cloned());
                }
                (ComposedType::InputObject(composed), TypeDef::InputObject(declared)) => {
                    for (field_name, field) in &declared.fields {
                        match composed.fields.get(field_name) {
                            Some(existing) if existing.ty != field.ty => {
                                return Err(conflict(Some(field_name)));
                            }
                            Some(_) => {}
                            None => {
                                composed.fields.insert(field_name.clone(), field.clone());
                            }
                        }
                    }
                }
                _ => return Err(conflict(None)),
            }
        }
    }
    Ok(types)
}

fn fresh_type(typedef: &TypeDef) -> ComposedType {
    match typedef {
        TypeDef::Object(object) => ComposedType::Object(ComposedObject {
            name: object.name.clone(),
            fields: BTreeMap::new(),
        }),
        TypeDef::InputObject(input) => ComposedType::InputObject(InputObjectDef {
            name: input.name.clone(),
            fields: input.fields.clone(),
        }),
        TypeDef::Enum(enum_type) => ComposedType::Enum(EnumDef {
            name: enum_type.name.clone(),
            values: enum_type.values.clone(),
        }),
        TypeDef::Scalar(name) => ComposedType::Scalar(name.clone()),
    }
}

type FieldOwners = BTreeMap<(String, String), String>;
type FieldRequirements = BTreeMap<(String, String), Vec<String>>;

fn assign_field_owners(
    subgraphs: &Subgraphs<'_>,
    types: &mut BTreeMap<String, ComposedType>,
) -> Result<(FieldOwners, FieldRequirements), CompositionError> {
    let mut claims: BTreeMap<(&str, &str), Vec<(&str, &FieldDef)>> = BTreeMap::new();
    for (&subgraph, set) in subgraphs {
        for typedef in set.types.values() {
            let TypeDef::Object(object) = typedef else {
                continue;
            };
            for field in object.fields.values() {
                claims
                    .entry((object.name.as_str(), field.name.as_str()))
                    .or_default()
                    .push((subgraph, field));
            }
        }
    }

    let mut owners = FieldOwners::new();
    let mut requires = FieldRequirements::new();
    for ((type_name, field_name), claimants) in claims {
        let owned: Vec<&(&str, &FieldDef)> =
            claimants.iter().filter(|(_, field)| field.is_owned()).collect();

        let (owner, definition) = match owned.as_slice() {
            [single] => **single,
            [] => {
                return Err(CompositionError::MissingOwner {
                    type_name: type_name.to_string(),
                    field: Some(field_name.to_string()),
                    subgraphs: claimants.iter().map(|(name, _)| name.to_string()).collect(),
                });
            }
            _ => {
                return Err(CompositionError::DuplicateOwnership {
                    type_name: type_name.to_string(),
                    field: Some(field_name.to_string()),
                    subgraphs: owned.iter().map(|(name, _)| name.to_string()).collect(),
                });
            }
        };

        let key = (type_name.to_string(), field_name.to_string());
        owners.insert(key.clone(), owner.to_string());
        if !definition.requires.is_empty() {
            requires.insert(key, definition.requires.clone());
        }
        if let Some(ComposedType::Object(object)) = types.get_mut(type_name) {
            object.fields.insert(
                field_name.to_string(),
                ComposedField {
                    name: field_name.to_string(),
                    arguments: definition.arguments.clone(),
                    ty: definition.ty.clone(),
                },
            );
        }
    }
    Ok((owners, requires))
}

fn check_references(
    types: &BTreeMap<String, ComposedType>,
    owners: &FieldOwners,
    subgraphs: &Subgraphs<'_>,
) -> Result<(), CompositionError> {
    let is_known = |name: &str| BUILTIN_SCALARS.contains(&name) || types.contains_key(name);

    for composed in types.values() {
        match composed {
            ComposedType::Object(object) => {
                for field in object.fields.values() {
                    let referenced = std::iter::once(field.ty.name())
                        .chain(field.arguments.iter().map(|argument| argument.ty.name()));
                    for name in referenced {
                        if is_known(name) {
                            continue;
                        }
                        let owner = owners
                            .get(&(object.name.clone(), field.name.clone()))
                            .cloned()
                            .unwrap_or_default();
                        return Err(CompositionError::UnresolvedReference {
                            type_name: object.name.clone(),
                            field: Some(field.name.clone()),
                            referenced: name.to_string(),
                            subgraph: owner,
                        });
                    }
                }
            }
            ComposedType::InputObject(input) => {
                for field in input.fields.values() {
                    if is_known(field.ty.name()) {
                        continue;
                    }
                    let declared_by = subgraphs
                        .iter()
                        .find(|(_, set)| set.types.contains_key(&input.name))
                        .map(|(name, _)| name.to_string())
                        .unwrap_or_default();
                    return Err(CompositionError::UnresolvedReference {
                        type_name: input.name.clone(),
                        field: Some(field.name.clone()),
                        referenced: field.ty.name().to_string(),
                        subgraph: declared_by,
                    });
                }
            }
            ComposedType::Enum(_) | ComposedType::Scalar(_) => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CompositionErrorKind;
    use crate::test_fixtures::{self, capabilities_of};
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    #[test]
    fn composition_is_independent_of_poll_order() {
        let capabilities = test_fixtures::capabilities();
        let expected = compose(&capabilities).unwrap();

        let orders: [&[&str]; 3] = [
            &["support", "orders", "billing", "customer"],
            &["billing", "customer", "support", "orders"],
            &["orders", "support", "customer", "billing"],
        ];
        for order in orders {
            let mut shuffled = HashMap::new();
            for name in order {
                shuffled.insert(name.to_string(), capabilities[*name].clone());
            }
            let composed = compose(&shuffled).unwrap();
            assert_eq!(composed.sdl(), expected.sdl());
            assert_eq!(composed, expected);
        }
    }

    #[test]
    fn composed_sdl_is_lexically_ordered_and_free_of_federation_plumbing() {
        let composed = compose(&test_fixtures::capabilities()).unwrap();
        let sdl = composed.sdl();

        assert!(sdl.contains(
            "type Customer {\n  creditScore: Int\n  email: String\n  id: ID!\n  invoices: [Invoice!]!\n"
        ));
        assert!(sdl.contains(
            "  searchCustomers(limit: Int = 10, segment: CustomerSegment): [Customer!]!\n"
        ));
        assert!(!sdl.contains("@key"));
        assert!(!sdl.contains("_Service"));
        assert!(!sdl.contains("_Any"));

        let declared: Vec<&str> = sdl
            .lines()
            .filter(|line| !line.is_empty() && !line.starts_with([' ', '}']))
            .filter_map(|line| line.split_whitespace().nth(1))
            .collect();
        let mut sorted = declared.clone();
        sorted.sort();
        assert_eq!(declared.len(), 10);
        assert_eq!(declared, sorted);
    }

    #[test]
    fn ownership_index_records_base_and_extenders() {
        let composed = compose(&test_fixtures::capabilities()).unwrap();
        let ownership = composed.ownership();

        assert_eq!(ownership.owner("Customer", "name"), Some("customer"));
        assert_eq!(ownership.owner("Customer", "id"), Some("customer"));
        assert_eq!(ownership.owner("Customer", "creditScore"), Some("billing"));
        assert_eq!(ownership.owner("Customer", "orders"), Some("orders"));
        assert_eq!(ownership.owner("Query", "order"), Some("orders"));
        assert_eq!(ownership.requires("Customer", "supportTier"), ["email".to_string()]);

        let customer = ownership.entity("Customer").unwrap();
        assert_eq!(customer.base, "customer");
        assert_eq!(
            customer.extenders.iter().map(String::as_str).collect::<Vec<_>>(),
            vec!["billing", "orders", "support"]
        );
        assert!(customer.can_reference("orders", "billing"));
        assert!(customer.participant("support").unwrap().declared_fields.contains("email"));
    }

    #[test]
    fn enums_are_merged_by_value() {
        let capabilities = capabilities_of(&[
            ("a", "type Query { a: Color } enum Color { RED }"),
            ("b", "type Query { b: Color } enum Color { BLUE RED }"),
        ]);
        let composed = compose(&capabilities).unwrap();
        let Some(ComposedType::Enum(color)) = composed.get_type("Color") else {
            panic!("Color should compose to an enum");
        };
        assert_eq!(color.values.len(), 2);
    }

    #[test]
    fn two_base_owners_are_duplicate_ownership() {
        let capabilities = capabilities_of(&[
            ("customer", r#"type Customer @key(fields: "id") { id: ID! name: String }"#),
            ("crm", r#"type Customer @key(fields: "id") { id: ID! tier: String }"#),
        ]);
        let err = compose(&capabilities).unwrap_err();

        assert_eq!(err.kind(), CompositionErrorKind::DuplicateOwnership);
        assert_eq!(
            err,
            CompositionError::DuplicateOwnership {
                type_name: "Customer".to_string(),
                field: None,
                subgraphs: vec!["crm".to_string(), "customer".to_string()],
            }
        );
        assert!(err.to_string().starts_with("duplicate-ownership"));
    }

    #[test]
    fn value_type_field_collision_is_duplicate_ownership() {
        let capabilities = capabilities_of(&[
            ("a", "type Query { a: Money } type Money { amount: Float currency: String }"),
            ("b", "type Query { b: Money } type Money { amount: Float }"),
        ]);
        let err = compose(&capabilities).unwrap_err();
        assert_eq!(
            err,
            CompositionError::DuplicateOwnership {
                type_name: "Money".to_string(),
                field: Some("amount".to_string()),
                subgraphs: vec!["a".to_string(), "b".to_string()],
            }
        );
    }

    #[test]
    fn external_declaration_defers_to_the_owner() {
        let capabilities = capabilities_of(&[
            ("a", "type Query { a: Money } type Money { amount: Float currency: String }"),
            ("b", "type Query { b: Money } type Money { amount: Float @external }"),
        ]);
        let composed = compose(&capabilities).unwrap();
        assert_eq!(composed.ownership().owner("Money", "amount"), Some("a"));
    }

    #[test]
    fn extension_without_base_is_missing_owner() {
        let capabilities = capabilities_of(&[(
            "billing",
            r#"extend type Customer @key(fields: "id") { id: ID! creditScore: Int }"#,
        )]);
        let err = compose(&capabilities).unwrap_err();
        assert_eq!(err.kind(), CompositionErrorKind::MissingOwner);
    }

    #[test]
    fn field_referenced_only_externally_is_missing_owner() {
        let capabilities = capabilities_of(&[
            ("customer", test_fixtures::CUSTOMER_SDL),
            (
                "billing",
                r#"
                extend type Customer @key(fields: "id") {
                  id: ID! @external
                  loyaltyPoints: Int @external
                  creditScore: Int @requires(fields: "loyaltyPoints")
                }
                "#,
            ),
        ]);
        let err = compose(&capabilities).unwrap_err();
        assert_eq!(
            err,
            CompositionError::MissingOwner {
                type_name: "Customer".to_string(),
                field: Some("loyaltyPoints".to_string()),
                subgraphs: vec!["billing".to_string()],
            }
        );
    }

    #[test]
    fn keyless_entity_declaration_is_duplicate_ownership() {
        let capabilities = capabilities_of(&[
            ("customer", test_fixtures::CUSTOMER_SDL),
            ("crm", "type Query { vip: Customer } type Customer { vipSince: String }"),
        ]);
        let err = compose(&capabilities).unwrap_err();
        assert_eq!(err.kind(), CompositionErrorKind::DuplicateOwnership);
    }

    #[test]
    fn unknown_return_type_is_unresolved_reference() {
        let capabilities =
            capabilities_of(&[("orders", "type Query { shipment(id: ID!): Shipment }")]);
        let err = compose(&capabilities).unwrap_err();
        assert_eq!(
            err,
            CompositionError::UnresolvedReference {
                type_name: "Query".to_string(),
                field: Some("shipment".to_string()),
                referenced: "Shipment".to_string(),
                subgraph: "orders".to_string(),
            }
        );
    }

    #[test]
    fn unknown_argument_type_is_unresolved_reference() {
        let capabilities = capabilities_of(&[(
            "orders",
            "type Query { orders(filter: OrderFilter): Int }",
        )]);
        let err = compose(&capabilities).unwrap_err();
        assert_eq!(err.kind(), CompositionErrorKind::UnresolvedReference);
    }

    #[test]
    fn kind_mismatch_is_duplicate_ownership() {
        let capabilities = capabilities_of(&[
            ("a", "type Query { a: Status } enum Status { OK }"),
            ("b", "type Query { b: Status } type Status { code: Int }"),
        ]);
        let err = compose(&capabilities).unwrap_err();
        assert_eq!(err.kind(), CompositionErrorKind::DuplicateOwnership);
    }
}
