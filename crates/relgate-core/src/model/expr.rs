use crate::instance::Value;

use super::types::Operation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
}

// One side of a comparison. Field rebinds with the instance at each
// traversal level; FutureField is the post-update snapshot and only valid
// in update rules at the root level; Auth/AuthClaim resolve to Null when
// the principal or claim is absent; RelatedId walks a to-one path and a
// broken link anywhere yields Null.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueExpr {
    Literal(Value),
    Field(String),
    FutureField(String),
    Auth,
    AuthClaim(String),
    RelatedId(Vec<String>),
}

impl ValueExpr {
    pub fn lit(value: Value) -> Self {
        ValueExpr::Literal(value)
    }

    pub fn null() -> Self {
        ValueExpr::Literal(Value::Null)
    }

    pub fn field(name: impl Into<String>) -> Self {
        ValueExpr::Field(name.into())
    }

    pub fn future_field(name: impl Into<String>) -> Self {
        ValueExpr::FutureField(name.into())
    }

    pub fn auth() -> Self {
        ValueExpr::Auth
    }

    pub fn auth_claim(name: impl Into<String>) -> Self {
        ValueExpr::AuthClaim(name.into())
    }

    pub fn related_id<S: Into<String>>(path: impl IntoIterator<Item = S>) -> Self {
        ValueExpr::RelatedId(path.into_iter().map(Into::into).collect())
    }
}

// The body of an @@allow/@@deny rule. Exists is false over an empty
// collection, ForAll is true. Related rebinds to a to-one target and a
// null target is false. Check delegates to the target entity's own rule
// set, for read when no operation is given.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Const(bool),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
    Compare {
        op: CompareOp,
        left: ValueExpr,
        right: ValueExpr,
    },
    Exists {
        relation: String,
        predicate: Box<Predicate>,
    },
    ForAll {
        relation: String,
        predicate: Box<Predicate>,
    },
    Related {
        relation: String,
        predicate: Box<Predicate>,
    },
    Check {
        relation: String,
        operation: Option<Operation>,
    },
}

impl Predicate {
    pub fn and(parts: impl Into<Vec<Predicate>>) -> Self {
        Predicate::And(parts.into())
    }

    pub fn or(parts: impl Into<Vec<Predicate>>) -> Self {
        Predicate::Or(parts.into())
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(inner: Predicate) -> Self {
        Predicate::Not(Box::new(inner))
    }

    pub fn eq(left: ValueExpr, right: ValueExpr) -> Self {
        Predicate::Compare {
            op: CompareOp::Eq,
            left,
            right,
        }
    }

    pub fn ne(left: ValueExpr, right: ValueExpr) -> Self {
        Predicate::Compare {
            op: CompareOp::Ne,
            left,
            right,
        }
    }

    pub fn exists(relation: impl Into<String>, predicate: Predicate) -> Self {
        Predicate::Exists {
            relation: relation.into(),
            predicate: Box::new(predicate),
        }
    }

    pub fn for_all(relation: impl Into<String>, predicate: Predicate) -> Self {
        Predicate::ForAll {
            relation: relation.into(),
            predicate: Box::new(predicate),
        }
    }

    pub fn related(relation: impl Into<String>, predicate: Predicate) -> Self {
        Predicate::Related {
            relation: relation.into(),
            predicate: Box::new(predicate),
        }
    }

    pub fn check(relation: impl Into<String>) -> Self {
        Predicate::Check {
            relation: relation.into(),
            operation: None,
        }
    }

    pub fn check_op(relation: impl Into<String>, operation: Operation) -> Self {
        Predicate::Check {
            relation: relation.into(),
            operation: Some(operation),
        }
    }
}
