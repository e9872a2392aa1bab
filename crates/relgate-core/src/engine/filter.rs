use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::instance::{Principal, Value};
use crate::model::expr::{CompareOp, Predicate, ValueExpr};
use crate::model::types::{FieldType, Operation, Polarity};
use crate::model::{PolicyModel, SchemaError};

// A storage-pushable predicate over rows of one entity type. The
// *Related variants are the sub-query analogue of the evaluator's
// traversal branches (AllRelated is vacuously true when no related row
// exists); `id` in a Compare refers to the row identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Filter {
    Any,
    Empty,
    Compare {
        field: String,
        op: CompareOp,
        value: Value,
    },
    IsNull {
        field: String,
    },
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    SomeRelated { relation: String, filter: Box<Filter> },
    AllRelated { relation: String, filter: Box<Filter> },
    OneRelated { relation: String, filter: Box<Filter> },
}

// NotFilterable is a recoverable signal, not a fault: the caller falls
// back to fetch-then-decide.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FilterError {
    #[error("predicate is not expressible as a push-down filter: {reason}")]
    NotFilterable { reason: String },

    #[error(transparent)]
    Schema(#[from] SchemaError),
}

fn not_filterable(reason: &str) -> FilterError {
    FilterError::NotFilterable {
        reason: reason.to_string(),
    }
}

// Compiles a (entity, operation, principal) rule set into one reusable
// push-down filter, for collection reads where deciding every candidate
// row one by one is not tractable.
pub struct FilterCompiler {
    model: Arc<PolicyModel>,
}

impl FilterCompiler {
    pub fn new(model: Arc<PolicyModel>) -> Self {
        Self { model }
    }

    // Allow rules are OR-ed, deny rules negated and AND-ed on top; no
    // allow rule at all compiles to Empty (default-deny).
    pub fn compile(
        &self,
        entity_type: &str,
        operation: Operation,
        principal: Option<&Principal>,
    ) -> Result<Filter, FilterError> {
        // A delegating base type routes each row through its discriminator
        // exactly as decide() does: one variant per concrete type, keyed on
        // the discriminator value, each under the concrete rule set. A
        // single base-wide filter would miss subtype deny rules.
        if let Some((disc, ty)) = self.model.discriminator_field(entity_type) {
            let disc = disc.to_string();
            let mut variants = vec![entity_type.to_string()];
            variants.extend(
                self.model
                    .subtypes_of(entity_type)
                    .into_iter()
                    .map(str::to_string),
            );
            let mut parts = Vec::new();
            for name in variants {
                let tag = match ty {
                    FieldType::Id => Value::Id(name.clone()),
                    _ => Value::String(name.clone()),
                };
                let rules = self.compile_rules(&name, operation, principal)?;
                parts.push(and_all(vec![
                    Filter::Compare {
                        field: disc.clone(),
                        op: CompareOp::Eq,
                        value: tag,
                    },
                    rules,
                ]));
            }
            return Ok(or_all(parts));
        }

        self.compile_rules(entity_type, operation, principal)
    }

    fn compile_rules(
        &self,
        entity_type: &str,
        operation: Operation,
        principal: Option<&Principal>,
    ) -> Result<Filter, FilterError> {
        let rules = self.model.resolve_rules(entity_type, operation)?;

        let mut allows = Vec::new();
        let mut denies = Vec::new();
        for rule in rules {
            match rule.polarity {
                Polarity::Allow => allows.push(rule),
                Polarity::Deny => denies.push(rule),
            }
        }
        if allows.is_empty() {
            return Ok(Filter::Empty);
        }

        let mut parts = Vec::new();
        for rule in denies {
            let compiled = self.compile_predicate(entity_type, &rule.predicate, principal)?;
            parts.push(not_f(compiled));
        }
        let allowed = or_all(
            allows
                .into_iter()
                .map(|rule| self.compile_predicate(entity_type, &rule.predicate, principal))
                .collect::<Result<Vec<_>, _>>()?,
        );
        parts.push(allowed);

        let filter = and_all(parts);
        tracing::debug!(
            target: "policy",
            event = "compile_filter",
            entity = entity_type,
            operation = %operation,
            "compiled push-down filter"
        );
        Ok(filter)
    }

    fn compile_predicate(
        &self,
        entity: &str,
        predicate: &Predicate,
        principal: Option<&Principal>,
    ) -> Result<Filter, FilterError> {
        match predicate {
            Predicate::Const(true) => Ok(Filter::Any),
            Predicate::Const(false) => Ok(Filter::Empty),
            Predicate::And(parts) => Ok(and_all(
                parts
                    .iter()
                    .map(|p| self.compile_predicate(entity, p, principal))
                    .collect::<Result<Vec<_>, _>>()?,
            )),
            Predicate::Or(parts) => Ok(or_all(
                parts
                    .iter()
                    .map(|p| self.compile_predicate(entity, p, principal))
                    .collect::<Result<Vec<_>, _>>()?,
            )),
            Predicate::Not(inner) => {
                Ok(not_f(self.compile_predicate(entity, inner, principal)?))
            }
            Predicate::Compare { op, left, right } => {
                self.compile_compare(*op, left, right, principal)
            }
            Predicate::Exists {
                relation,
                predicate,
            } => {
                let target = self.relation_target(entity, relation)?;
                let inner = self.compile_predicate(&target, predicate, principal)?;
                Ok(some_related(relation, inner))
            }
            Predicate::ForAll {
                relation,
                predicate,
            } => {
                let target = self.relation_target(entity, relation)?;
                let inner = self.compile_predicate(&target, predicate, principal)?;
                Ok(all_related(relation, inner))
            }
            Predicate::Related {
                relation,
                predicate,
            } => {
                let target = self.relation_target(entity, relation)?;
                let inner = self.compile_predicate(&target, predicate, principal)?;
                Ok(one_related(relation, inner))
            }
            Predicate::Check {
                relation,
                operation,
            } => {
                let target = self.relation_target(entity, relation)?;
                let sub = self.compile(&target, operation.unwrap_or(Operation::Read), principal)?;
                Ok(one_related(relation, sub))
            }
        }
    }

    fn compile_compare(
        &self,
        op: CompareOp,
        left: &ValueExpr,
        right: &ValueExpr,
        principal: Option<&Principal>,
    ) -> Result<Filter, FilterError> {
        let left_null_lit = matches!(left, ValueExpr::Literal(Value::Null));
        let right_null_lit = matches!(right, ValueExpr::Literal(Value::Null));
        if left_null_lit || right_null_lit {
            if left_null_lit && right_null_lit {
                return Ok(constant(op == CompareOp::Eq));
            }
            let other = if left_null_lit { right } else { left };
            return self.compile_null_check(op, other, principal);
        }

        let lhs = operand(left, principal)?;
        let rhs = operand(right, principal)?;
        match (lhs, rhs) {
            (Operand::Literal(a), Operand::Literal(b)) => {
                if a.is_null() || b.is_null() {
                    return Ok(Filter::Empty);
                }
                Ok(constant(match op {
                    CompareOp::Eq => a == b,
                    CompareOp::Ne => a != b,
                }))
            }
            (Operand::Field(field), Operand::Literal(value))
            | (Operand::Literal(value), Operand::Field(field)) => {
                if value.is_null() {
                    return Ok(Filter::Empty);
                }
                Ok(Filter::Compare { field, op, value })
            }
            (Operand::Path(path), Operand::Literal(value))
            | (Operand::Literal(value), Operand::Path(path)) => {
                if value.is_null() {
                    return Ok(Filter::Empty);
                }
                Ok(nest_path(
                    &path,
                    Filter::Compare {
                        field: "id".to_string(),
                        op,
                        value,
                    },
                ))
            }
            _ => Err(not_filterable("comparison of two row-dependent values")),
        }
    }

    // An explicit null literal is a null check: field == null pushes down
    // as is-null, a relation path as (non-)existence of the target.
    fn compile_null_check(
        &self,
        op: CompareOp,
        other: &ValueExpr,
        principal: Option<&Principal>,
    ) -> Result<Filter, FilterError> {
        let checked = match operand(other, principal)? {
            Operand::Field(field) => not_f(Filter::IsNull { field }),
            Operand::Path(path) => nest_path(&path, Filter::Any),
            Operand::Literal(value) => constant(!value.is_null()),
        };
        // `checked` is "the value is present"; Eq against null is its
        // negation.
        Ok(match op {
            CompareOp::Eq => not_f(checked),
            CompareOp::Ne => checked,
        })
    }

    fn relation_target(&self, entity: &str, relation: &str) -> Result<String, FilterError> {
        self.model
            .relation(entity, relation)
            .map(|rel| rel.target.clone())
            .ok_or_else(|| {
                FilterError::Schema(SchemaError::UnknownRelation {
                    entity: entity.to_string(),
                    relation: relation.to_string(),
                })
            })
    }
}

enum Operand {
    Field(String),
    Path(Vec<String>),
    Literal(Value),
}

fn operand(expr: &ValueExpr, principal: Option<&Principal>) -> Result<Operand, FilterError> {
    match expr {
        ValueExpr::Literal(value) => Ok(Operand::Literal(value.clone())),
        ValueExpr::Field(name) => Ok(Operand::Field(name.clone())),
        ValueExpr::FutureField(_) => Err(not_filterable(
            "future() has no meaning outside an update decision",
        )),
        ValueExpr::Auth => Ok(Operand::Literal(
            principal.map(Principal::identity).unwrap_or(Value::Null),
        )),
        ValueExpr::AuthClaim(name) => Ok(Operand::Literal(
            principal.and_then(|p| p.claim(name)).unwrap_or(Value::Null),
        )),
        ValueExpr::RelatedId(path) => Ok(Operand::Path(path.clone())),
    }
}

fn constant(matches: bool) -> Filter {
    if matches { Filter::Any } else { Filter::Empty }
}

fn nest_path(path: &[String], innermost: Filter) -> Filter {
    path.iter()
        .rev()
        .fold(innermost, |inner, segment| one_related(segment, inner))
}

fn and_all(parts: Vec<Filter>) -> Filter {
    let mut kept = Vec::new();
    for part in parts {
        match part {
            Filter::Any => {}
            Filter::Empty => return Filter::Empty,
            other => kept.push(other),
        }
    }
    match kept.len() {
        0 => Filter::Any,
        1 => kept.into_iter().next().unwrap(),
        _ => Filter::And(kept),
    }
}

fn or_all(parts: Vec<Filter>) -> Filter {
    let mut kept = Vec::new();
    for part in parts {
        match part {
            Filter::Empty => {}
            Filter::Any => return Filter::Any,
            other => kept.push(other),
        }
    }
    match kept.len() {
        0 => Filter::Empty,
        1 => kept.into_iter().next().unwrap(),
        _ => Filter::Or(kept),
    }
}

fn not_f(inner: Filter) -> Filter {
    match inner {
        Filter::Any => Filter::Empty,
        Filter::Empty => Filter::Any,
        Filter::Not(inner) => *inner,
        other => Filter::Not(Box::new(other)),
    }
}

fn some_related(relation: &str, inner: Filter) -> Filter {
    match inner {
        Filter::Empty => Filter::Empty,
        inner => Filter::SomeRelated {
            relation: relation.to_string(),
            filter: Box::new(inner),
        },
    }
}

fn all_related(relation: &str, inner: Filter) -> Filter {
    match inner {
        Filter::Any => Filter::Any,
        inner => Filter::AllRelated {
            relation: relation.to_string(),
            filter: Box::new(inner),
        },
    }
}

fn one_related(relation: &str, inner: Filter) -> Filter {
    match inner {
        Filter::Empty => Filter::Empty,
        inner => Filter::OneRelated {
            relation: relation.to_string(),
            filter: Box::new(inner),
        },
    }
}
