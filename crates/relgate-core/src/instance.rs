use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// A runtime Null on either side makes both == and != evaluate to false;
// only an explicit null literal in a predicate is a null check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    String(String),
    Id(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn id(id: impl Into<String>) -> Self {
        Value::Id(id.into())
    }

    pub fn string(s: impl Into<String>) -> Self {
        Value::String(s.into())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::String(s) => write!(f, "{s}"),
            Value::Id(id) => write!(f, "{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceRef {
    pub entity_type: String,
    pub id: String,
}

impl InstanceRef {
    pub fn new(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for InstanceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.id)
    }
}

// A snapshot of one entity row at decision time. The engine never mutates
// an instance; updates are modelled as a second "future" snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub entity_type: String,
    pub id: String,
    pub fields: HashMap<String, Value>,
}

impl Instance {
    pub fn new(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            id: id.into(),
            fields: HashMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    // The reserved name "id" always resolves to the row identity, whether
    // or not a field of that name was stored.
    pub fn field(&self, name: &str) -> Option<Value> {
        if name == "id" {
            return Some(Value::Id(self.id.clone()));
        }
        self.fields.get(name).cloned()
    }

    pub fn instance_ref(&self) -> InstanceRef {
        InstanceRef::new(&self.entity_type, &self.id)
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.id)
    }
}

// The actor a decision runs for; None throughout the engine means
// anonymous.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub claims: HashMap<String, Value>,
}

impl Principal {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            claims: HashMap::new(),
        }
    }

    pub fn with_claim(mut self, name: impl Into<String>, value: Value) -> Self {
        self.claims.insert(name.into(), value);
        self
    }

    pub fn identity(&self) -> Value {
        Value::Id(self.id.clone())
    }

    pub fn claim(&self, name: &str) -> Option<Value> {
        if name == "id" {
            return Some(self.identity());
        }
        self.claims.get(name).cloned()
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "principal:{}", self.id)
    }
}
