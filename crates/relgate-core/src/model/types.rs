use std::fmt;

use serde::Serialize;

use super::expr::Predicate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
}

impl Operation {
    pub const ALL: [Operation; 4] = [
        Operation::Create,
        Operation::Read,
        Operation::Update,
        Operation::Delete,
    ];
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::Create => "create",
            Operation::Read => "read",
            Operation::Update => "update",
            Operation::Delete => "delete",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    Allow,
    Deny,
}

impl fmt::Display for Polarity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Polarity::Allow => "allow",
            Polarity::Deny => "deny",
        };
        write!(f, "{s}")
    }
}

// Comparisons are checked against these when the model is built, not at
// evaluation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Int,
    Bool,
    Id,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FieldType::String => "string",
            FieldType::Int => "int",
            FieldType::Bool => "bool",
            FieldType::Id => "id",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    One,
    Many,
}

// Override rules replace the model-level verdict for this field only.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    pub name: String,
    pub ty: FieldType,
    pub overrides: Vec<Rule>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelationDef {
    pub name: String,
    pub target: String,
    pub cardinality: Cardinality,
}

// One @@allow/@@deny declaration; a single rule may govern several
// operations.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub operations: Vec<Operation>,
    pub polarity: Polarity,
    pub predicate: Predicate,
}

impl Rule {
    pub fn allow(operations: impl Into<Vec<Operation>>, predicate: Predicate) -> Self {
        Self {
            operations: operations.into(),
            polarity: Polarity::Allow,
            predicate,
        }
    }

    pub fn deny(operations: impl Into<Vec<Operation>>, predicate: Predicate) -> Self {
        Self {
            operations: operations.into(),
            polarity: Polarity::Deny,
            predicate,
        }
    }
}

// `extends` links a concrete type to its base; rules declared on the base
// are inherited by every type extending it. `discriminator` is set on the
// base type and names the field holding each row's concrete type name.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityDef {
    pub name: String,
    pub fields: Vec<FieldDef>,
    pub relations: Vec<RelationDef>,
    pub rules: Vec<Rule>,
    pub extends: Option<String>,
    pub discriminator: Option<String>,
}

impl EntityDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            relations: Vec::new(),
            rules: Vec::new(),
            extends: None,
            discriminator: None,
        }
    }

    pub fn field(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.fields.push(FieldDef {
            name: name.into(),
            ty,
            overrides: Vec::new(),
        });
        self
    }

    pub fn field_rule(mut self, field: &str, rule: Rule) -> Self {
        if let Some(def) = self.fields.iter_mut().find(|f| f.name == field) {
            def.overrides.push(rule);
        }
        self
    }

    pub fn relation_one(mut self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.relations.push(RelationDef {
            name: name.into(),
            target: target.into(),
            cardinality: Cardinality::One,
        });
        self
    }

    pub fn relation_many(mut self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.relations.push(RelationDef {
            name: name.into(),
            target: target.into(),
            cardinality: Cardinality::Many,
        });
        self
    }

    pub fn rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn extends(mut self, base: impl Into<String>) -> Self {
        self.extends = Some(base.into());
        self
    }

    pub fn discriminator(mut self, field: impl Into<String>) -> Self {
        self.discriminator = Some(field.into());
        self
    }
}
