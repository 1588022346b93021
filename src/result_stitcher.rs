use serde_json::{Map, Value};

use crate::capability::TypeRef;
use crate::query_executor::PartialResult;
use crate::query_plan::{ExecutionPlan, ShapeField};
use crate::{GraphQLError, PathSegment, ResponsePath};

/// Merges node results into the response the client asked for.
///
/// Fields come back in client selection order with join-only fields
/// removed. A null in a non-null position nulls the nearest nullable
/// ancestor. Unless an error at or above the null's path, or a field a
/// failed node left unresolved, accounts for it, a `NON_NULL_VIOLATION`
/// error is added at its path. Errors keep node order.
pub fn stitch(plan: &ExecutionPlan, mut results: Vec<PartialResult>) -> (Value, Vec<GraphQLError>) {
    results.sort_by_key(|result| result.node);

    let mut merged = Value::Object(Map::new());
    let mut errors = Vec::new();
    let mut unresolved = Vec::new();
    for result in results {
        errors.extend(result.errors);
        unresolved.extend(result.unresolved);
        match result.data {
            Some(Value::Array(entities)) => {
                for (target, entity) in result.targets.iter().zip(entities) {
                    let slot = value_at_mut(&mut merged, target).filter(|slot| slot.is_object());
                    if let Some(slot) = slot {
                        deep_merge(slot, entity);
                    }
                }
            }
            Some(data) => deep_merge(&mut merged, data),
            None => {}
        }
    }

    let mut completer = Completer { errors, unresolved };
    let data = match &merged {
        Value::Object(root) => completer
            .complete_object(&plan.shape, root, &mut Vec::new())
            .map(Value::Object)
            .unwrap_or(Value::Null),
        _ => Value::Null,
    };
    (data, completer.errors)
}

fn value_at_mut<'v>(root: &'v mut Value, path: &[PathSegment]) -> Option<&'v mut Value> {
    path.iter().try_fold(root, |value, segment| match segment {
        PathSegment::Key(key) => value.get_mut(key.as_str()),
        PathSegment::Index(index) => value.get_mut(*index),
    })
}

/// Objects merge key by key and equal-length lists element by element.
/// Anything else keeps the value already present.
fn deep_merge(target: &mut Value, source: Value) {
    match (target, source) {
        (Value::Object(target), Value::Object(source)) => {
            for (key, value) in source {
                match target.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (Value::Array(target), Value::Array(source)) if target.len() == source.len() => {
            for (existing, value) in target.iter_mut().zip(source) {
                deep_merge(existing, value);
            }
        }
        _ => {}
    }
}

struct Completer {
    errors: Vec<GraphQLError>,
    unresolved: Vec<ResponsePath>,
}

impl Completer {
    /// `None` means a non-null child was null and this object must be
    /// nulled in turn.
    fn complete_object(
        &mut self,
        fields: &[ShapeField],
        object: &Map<String, Value>,
        path: &mut ResponsePath,
    ) -> Option<Map<String, Value>> {
        let mut completed = Map::new();
        for field in fields {
            path.push(PathSegment::Key(field.response_key.clone()));
            let value = if field.field_name == "__typename" {
                Some(Value::String(field.parent_type.clone()))
            } else {
                self.complete_value(field, &field.ty, object.get(&field.response_key), path)
            };
            path.pop();
            completed.insert(field.response_key.clone(), value?);
        }
        Some(completed)
    }

    fn complete_value(
        &mut self,
        field: &ShapeField,
        ty: &TypeRef,
        value: Option<&Value>,
        path: &mut ResponsePath,
    ) -> Option<Value> {
        match ty {
            TypeRef::NonNull(inner) => match self.complete_nullable(field, inner, value, path)? {
                Value::Null => {
                    self.non_null_violation(field, path);
                    None
                }
                completed => Some(completed),
            },
            _ => Some(self.complete_nullable(field, ty, value, path).unwrap_or(Value::Null)),
        }
    }

    /// `None` means a non-null descendant was null and already reported;
    /// the null keeps bubbling without another error.
    fn complete_nullable(
        &mut self,
        field: &ShapeField,
        ty: &TypeRef,
        value: Option<&Value>,
        path: &mut ResponsePath,
    ) -> Option<Value> {
        let Some(value) = value.filter(|value| !value.is_null()) else {
            return Some(Value::Null);
        };
        match ty {
            TypeRef::List(item_type) => {
                let Value::Array(items) = value else {
                    return Some(Value::Null);
                };
                let mut completed = Vec::with_capacity(items.len());
                for (index, item) in items.iter().enumerate() {
                    path.push(PathSegment::Index(index));
                    let item = self.complete_value(field, item_type, Some(item), path);
                    path.pop();
                    completed.push(item?);
                }
                Some(Value::Array(completed))
            }
            TypeRef::NonNull(inner) => self.complete_nullable(field, inner, Some(value), path),
            TypeRef::Named(_) if field.selection.is_empty() => Some(value.clone()),
            TypeRef::Named(_) => match value {
                Value::Object(object) => self
                    .complete_object(&field.selection, object, path)
                    .map(Value::Object),
                _ => Some(Value::Null),
            },
        }
    }

    fn non_null_violation(&mut self, field: &ShapeField, path: &ResponsePath) {
        let explained = self
            .errors
            .iter()
            .filter_map(|error| error.path.as_ref())
            .chain(&self.unresolved)
            .any(|reported| path.starts_with(reported));
        if explained {
            return;
        }
        self.errors.push(
            GraphQLError::new(format!(
                "Cannot return null for non-nullable field {}.{}.",
                field.parent_type, field.field_name
            ))
            .with_path(path.clone())
            .with_code("NON_NULL_VIOLATION"),
        );
    }
}
