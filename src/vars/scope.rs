// src/vars/scope.rs

use std::collections::BTreeMap;

/// A typed variable value.
///
/// Taskfile variables keep their YAML type until the final template expansion
/// stringifies them; booleans and numbers matter for `requires` emptiness
/// checks and for `for` loops over lists.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Bool(bool),
    Int(i64),
    Float(f64),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Convert a parsed YAML value into a [`Value`].
    ///
    /// Null becomes the empty string; tagged values collapse to their inner
    /// representation.
    pub fn from_yaml(v: serde_yaml::Value) -> Value {
        match v {
            serde_yaml::Value::Null => Value::Str(String::new()),
            serde_yaml::Value::Bool(b) => Value::Bool(b),
            serde_yaml::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_yaml::Value::String(s) => Value::Str(s),
            serde_yaml::Value::Sequence(seq) => {
                Value::List(seq.into_iter().map(Value::from_yaml).collect())
            }
            serde_yaml::Value::Mapping(map) => {
                let mut out = BTreeMap::new();
                for (k, v) in map {
                    if let serde_yaml::Value::String(k) = k {
                        out.insert(k, Value::from_yaml(v));
                    }
                }
                Value::Map(out)
            }
            serde_yaml::Value::Tagged(t) => Value::from_yaml(t.value),
        }
    }

    /// Render the value as a string for template substitution.
    ///
    /// Lists join with single spaces; maps render as space-separated `k=v`
    /// pairs in key order.
    pub fn render(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::List(items) => items
                .iter()
                .map(Value::render)
                .collect::<Vec<_>>()
                .join(" "),
            Value::Map(map) => map
                .iter()
                .map(|(k, v)| format!("{}={}", k, v.render()))
                .collect::<Vec<_>>()
                .join(" "),
        }
    }

    /// Emptiness for `requires` checks: empty string, empty list or empty map.
    pub fn is_empty(&self) -> bool {
        match self {
            Value::Str(s) => s.is_empty(),
            Value::List(items) => items.is_empty(),
            Value::Map(map) => map.is_empty(),
            _ => false,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

/// Ordered, layered variable environment.
///
/// Layers are pushed outermost first (process env, dotenv, file globals, ...)
/// and reads walk from the innermost layer outward, so later layers shadow
/// earlier ones. Writes only ever touch the top (innermost) layer.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    layers: Vec<BTreeMap<String, Value>>,
}

impl Scope {
    pub fn new() -> Self {
        Self { layers: vec![BTreeMap::new()] }
    }

    /// Start a new innermost layer.
    pub fn push_layer(&mut self) {
        self.layers.push(BTreeMap::new());
    }

    /// Drop the innermost layer. The outermost layer is never removed.
    pub fn pop_layer(&mut self) {
        if self.layers.len() > 1 {
            self.layers.pop();
        }
    }

    /// Bind a name in the innermost layer.
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        if let Some(top) = self.layers.last_mut() {
            top.insert(name.into(), value);
        }
    }

    /// Look a name up, innermost layer first.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.layers.iter().rev().find_map(|layer| layer.get(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Collapse all layers into a single map, inner bindings winning.
    ///
    /// Used for the final template expansion and for building command
    /// environments; lookups during resolution stay layered.
    pub fn flatten(&self) -> BTreeMap<String, Value> {
        let mut out = BTreeMap::new();
        for layer in &self.layers {
            for (k, v) in layer {
                out.insert(k.clone(), v.clone());
            }
        }
        out
    }
}
