//! Collects known fields from arbitrarily nested events.
//!
//! Upstream stages wrap their payloads differently (state machine outputs,
//! parallel branch arrays, raw invocation events), so fields are looked up
//! by name wherever they occur instead of at a fixed path.
//!
//! Traversal is pre-order in document order and the first occurrence of a
//! field wins. A captured value is not searched any further, so a nested
//! `type` inside a captured report cannot shadow the request's own `type`.

use serde_json::{Map, Value};

static NULL: Value = Value::Null;

/// Value reported for a wanted field that never occurs in the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fallback {
    Null,
    EmptyArray,
    EmptyObject,
}

impl Fallback {
    fn value(self) -> Value {
        match self {
            Fallback::Null => Value::Null,
            Fallback::EmptyArray => Value::Array(Vec::new()),
            Fallback::EmptyObject => Value::Object(Map::new()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Field {
    pub name: &'static str,
    pub fallback: Fallback,
}

impl Field {
    pub const fn null(name: &'static str) -> Self {
        Self {
            name,
            fallback: Fallback::Null,
        }
    }

    pub const fn array(name: &'static str) -> Self {
        Self {
            name,
            fallback: Fallback::EmptyArray,
        }
    }

    pub const fn object(name: &'static str) -> Self {
        Self {
            name,
            fallback: Fallback::EmptyObject,
        }
    }
}

/// Fixed-shape result of [`extract_fields`]: one entry per wanted field, in
/// the order the fields were requested.
#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    values: Map<String, Value>,
}

impl Extracted {
    pub fn get(&self, name: &str) -> &Value {
        self.values.get(name).unwrap_or(&NULL)
    }

    /// The field as a string, if it was found and is one.
    pub fn str(&self, name: &str) -> Option<&str> {
        self.get(name).as_str()
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.values
    }
}

/// Walk `node` and capture the first value recorded under each wanted name.
pub fn extract_fields(node: &Value, wanted: &[Field]) -> Extracted {
    let mut found = Map::new();
    collect(node, wanted, &mut found);
    let values = wanted
        .iter()
        .map(|field| {
            let value = found
                .remove(field.name)
                .unwrap_or_else(|| field.fallback.value());
            (field.name.to_string(), value)
        })
        .collect();
    Extracted { values }
}

fn collect(node: &Value, wanted: &[Field], found: &mut Map<String, Value>) {
    if found.len() == wanted.len() {
        return;
    }
    match node {
        Value::Object(map) => {
            for (key, value) in map {
                if wanted.iter().any(|f| f.name == key) {
                    if !found.contains_key(key) {
                        found.insert(key.clone(), value.clone());
                    }
                } else {
                    collect(value, wanted, found);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect(item, wanted, found);
            }
        }
        _ => {}
    }
}
