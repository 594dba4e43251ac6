//! Reductions of JSON documents
//!
//! Positions are named by JSON pointers (RFC 6901), so every change
//! description points at the exact spot that was touched. Documents are
//! visited in pre-order: a container comes before its contents, which makes
//! the bigger reductions come first.

use serde_json::Value;

use crate::successor::{Successor, SuccessorGenerator, SuccessorIter};

/// Escape an object key for use in a JSON pointer
fn escape(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

/// All nodes of `value` with their pointers, in pre-order
fn nodes(value: &Value) -> Vec<(String, &Value)> {
    fn walk<'v>(value: &'v Value, pointer: String, out: &mut Vec<(String, &'v Value)>) {
        out.push((pointer.clone(), value));
        match value {
            Value::Array(items) => {
                for (index, item) in items.iter().enumerate() {
                    walk(item, format!("{}/{}", pointer, index), out);
                }
            }
            Value::Object(map) => {
                for (key, item) in map {
                    walk(item, format!("{}/{}", pointer, escape(key)), out);
                }
            }
            _ => {}
        }
    }

    let mut out = Vec::new();
    walk(value, String::new(), &mut out);
    out
}

#[derive(Debug, Clone)]
enum Edit {
    RemoveElement(usize),
    RemoveField(String),
    Replace(Value),
}

/// Planned edit at a pointer
#[derive(Debug, Clone)]
struct Slot {
    pointer: String,
    edit: Edit,
}

impl Slot {
    fn describe(&self) -> String {
        match &self.edit {
            Edit::RemoveElement(index) => format!("remove element {}/{}", self.pointer, index),
            Edit::RemoveField(key) => format!("remove field {}/{}", self.pointer, escape(key)),
            Edit::Replace(value) => format!("replace {} with {}", display_pointer(&self.pointer), value),
        }
    }

    fn apply(&self, state: &Value) -> Option<Successor<Value>> {
        let mut next = state.clone();
        let target = next.pointer_mut(&self.pointer)?;
        match (&self.edit, target) {
            (Edit::RemoveElement(index), Value::Array(items)) if *index < items.len() => {
                items.remove(*index);
            }
            (Edit::RemoveField(key), Value::Object(map)) => {
                map.remove(key)?;
            }
            (Edit::Replace(value), target) => *target = value.clone(),
            _ => return None,
        }
        Some(Successor::new(next, self.describe()))
    }
}

fn display_pointer(pointer: &str) -> &str {
    if pointer.is_empty() {
        "/"
    } else {
        pointer
    }
}

fn successors_from(state: &Value, slots: Vec<Slot>) -> SuccessorIter<'_, Value> {
    Box::new(slots.into_iter().filter_map(move |slot| slot.apply(state)))
}

/// Removes one array element at a time
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoveArrayElements;

impl SuccessorGenerator<Value> for RemoveArrayElements {
    fn name(&self) -> &str {
        "remove array elements"
    }

    fn successors<'a>(&'a self, state: &'a Value) -> SuccessorIter<'a, Value> {
        let slots = nodes(state)
            .into_iter()
            .filter_map(|(pointer, node)| node.as_array().map(|items| (pointer, items.len())))
            .flat_map(|(pointer, len)| {
                (0..len).map(move |index| Slot {
                    pointer: pointer.clone(),
                    edit: Edit::RemoveElement(index),
                })
            })
            .collect();
        successors_from(state, slots)
    }
}

/// Removes one object field at a time
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoveObjectFields;

impl SuccessorGenerator<Value> for RemoveObjectFields {
    fn name(&self) -> &str {
        "remove object fields"
    }

    fn successors<'a>(&'a self, state: &'a Value) -> SuccessorIter<'a, Value> {
        let slots = nodes(state)
            .into_iter()
            .filter_map(|(pointer, node)| {
                node.as_object().map(|map| {
                    map.keys()
                        .map(|key| Slot {
                            pointer: pointer.clone(),
                            edit: Edit::RemoveField(key.clone()),
                        })
                        .collect::<Vec<_>>()
                })
            })
            .flatten()
            .collect();
        successors_from(state, slots)
    }
}

/// Replaces scalars with the simplest value of their type.
///
/// Strings become `""`, numbers `0` and `true` becomes `false`. Scalars that
/// are already simplest and `null` are left alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimplifyScalars;

fn simplest(value: &Value) -> Option<Value> {
    match value {
        Value::String(s) if !s.is_empty() => Some(Value::String(String::new())),
        Value::Number(n) if n.as_f64() != Some(0.0) => Some(Value::from(0)),
        Value::Bool(true) => Some(Value::Bool(false)),
        _ => None,
    }
}

impl SuccessorGenerator<Value> for SimplifyScalars {
    fn name(&self) -> &str {
        "simplify scalars"
    }

    fn successors<'a>(&'a self, state: &'a Value) -> SuccessorIter<'a, Value> {
        let slots = nodes(state)
            .into_iter()
            .filter_map(|(pointer, node)| {
                simplest(node).map(|value| Slot {
                    pointer,
                    edit: Edit::Replace(value),
                })
            })
            .collect();
        successors_from(state, slots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn changes<G: SuccessorGenerator<Value>>(generator: &G, state: &Value) -> Vec<String> {
        generator.successors(state).map(|s| s.change).collect()
    }

    #[test]
    fn test_remove_array_elements_pre_order() {
        let state = json!([[1, 2], 3]);
        let successors: Vec<_> = RemoveArrayElements.successors(&state).collect();

        let states: Vec<_> = successors.iter().map(|s| s.state.clone()).collect();
        assert_eq!(states, vec![json!([3]), json!([[1, 2]]), json!([[2], 3]), json!([[1], 3])]);
        assert_eq!(successors[2].change, "remove element /0/0");
        assert_eq!(state, json!([[1, 2], 3]));
    }

    #[test]
    fn test_remove_object_fields() {
        let state = json!({"a": 1, "b": {"c": true}});
        let successors: Vec<_> = RemoveObjectFields.successors(&state).collect();

        assert_eq!(successors.len(), 3);
        assert_eq!(successors[0].state, json!({"b": {"c": true}}));
        assert_eq!(successors[1].state, json!({"a": 1}));
        assert_eq!(successors[2].state, json!({"a": 1, "b": {}}));
        assert_eq!(successors[2].change, "remove field /b/c");
    }

    #[test]
    fn test_pointer_escaping() {
        let state = json!({"a/b": {"c~d": 1}});
        let changes = changes(&RemoveObjectFields, &state);
        assert_eq!(changes, vec!["remove field /a~1b", "remove field /a~1b/c~0d"]);

        let successors: Vec<_> = RemoveObjectFields.successors(&state).collect();
        assert_eq!(successors[1].state, json!({"a/b": {}}));
    }

    #[test]
    fn test_simplify_scalars() {
        let state = json!({"name": "x", "n": 5, "ok": true, "done": false, "none": null, "zero": 0, "empty": ""});
        let successors: Vec<_> = SimplifyScalars.successors(&state).collect();

        assert_eq!(successors.len(), 3);
        let changed: Vec<_> = successors.iter().map(|s| s.change.as_str()).collect();
        assert!(changed.contains(&"replace /name with \"\""));
        assert!(changed.contains(&"replace /n with 0"));
        assert!(changed.contains(&"replace /ok with false"));
    }

    #[test]
    fn test_simplify_root_scalar() {
        let successors: Vec<_> = SimplifyScalars.successors(&json!(42)).collect();
        assert_eq!(successors.len(), 1);
        assert_eq!(successors[0].state, json!(0));
        assert_eq!(successors[0].change, "replace / with 0");
    }

    #[test]
    fn test_minimal_documents_have_no_successors() {
        for state in [json!([]), json!({}), json!(null), json!(""), json!(0)] {
            assert_eq!(RemoveArrayElements.successors(&state).count(), 0);
            assert_eq!(RemoveObjectFields.successors(&state).count(), 0);
            assert_eq!(SimplifyScalars.successors(&state).count(), 0);
        }
    }

    #[test]
    fn test_enumeration_is_restartable() {
        let state = json!({"a": [1, 2, 3]});
        assert_eq!(
            changes(&RemoveArrayElements, &state),
            changes(&RemoveArrayElements, &state)
        );
    }
}
