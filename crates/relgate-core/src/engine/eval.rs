use std::future::Future;
use std::pin::Pin;

use crate::instance::{Instance, Principal, Value};
use crate::model::expr::{CompareOp, Predicate, ValueExpr};
use crate::model::types::{Operation, Polarity};
use crate::model::{PolicyModel, ResolvedRule, SchemaError};

use super::cache::FetchCache;
use super::{EngineConfig, EngineError, GraphAccessor};

// Rebuilt at every traversal level: the current instance rebinds, the
// future snapshot does not cross relation boundaries, the principal is
// threaded through.
pub(crate) struct EvalContext<'a> {
    pub(crate) instance: &'a Instance,
    pub(crate) future: Option<&'a Instance>,
    pub(crate) principal: Option<&'a Principal>,
}

// Recursive descent over an immutable predicate tree; no state across
// calls beyond the per-decision fetch cache.
pub(crate) struct Evaluator<'e, A> {
    pub(crate) cache: &'e FetchCache<'e, A>,
    pub(crate) model: &'e PolicyModel,
    pub(crate) config: &'e EngineConfig,
}

impl<'e, A: GraphAccessor> Evaluator<'e, A> {
    pub(crate) fn eval<'a>(
        &'a self,
        predicate: &'a Predicate,
        ctx: &'a EvalContext<'a>,
        depth: usize,
    ) -> Pin<Box<dyn Future<Output = Result<bool, EngineError>> + Send + 'a>> {
        Box::pin(async move {
            if depth > self.config.max_depth {
                return Err(EngineError::MaxDepthExceeded(depth));
            }

            match predicate {
                Predicate::Const(b) => Ok(*b),
                Predicate::And(parts) => {
                    for part in parts {
                        if !self.eval(part, ctx, depth).await? {
                            return Ok(false);
                        }
                    }
                    Ok(true)
                }
                Predicate::Or(parts) => {
                    for part in parts {
                        if self.eval(part, ctx, depth).await? {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }
                Predicate::Not(inner) => Ok(!self.eval(inner, ctx, depth).await?),
                Predicate::Compare { op, left, right } => self.compare(*op, left, right, ctx).await,
                Predicate::Exists {
                    relation,
                    predicate,
                } => {
                    let related = self
                        .cache
                        .related_many(&ctx.instance.instance_ref(), relation)
                        .await?;
                    for item in &related {
                        let inner = EvalContext {
                            instance: item,
                            future: None,
                            principal: ctx.principal,
                        };
                        if self.eval(predicate, &inner, depth + 1).await? {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }
                Predicate::ForAll {
                    relation,
                    predicate,
                } => {
                    let related = self
                        .cache
                        .related_many(&ctx.instance.instance_ref(), relation)
                        .await?;
                    for item in &related {
                        let inner = EvalContext {
                            instance: item,
                            future: None,
                            principal: ctx.principal,
                        };
                        if !self.eval(predicate, &inner, depth + 1).await? {
                            return Ok(false);
                        }
                    }
                    Ok(true)
                }
                Predicate::Related {
                    relation,
                    predicate,
                } => {
                    let target = self
                        .cache
                        .related_one(&ctx.instance.instance_ref(), relation)
                        .await?;
                    // Null to-one target never throws, it just fails the match.
                    match target {
                        None => Ok(false),
                        Some(target) => {
                            let inner = EvalContext {
                                instance: &target,
                                future: None,
                                principal: ctx.principal,
                            };
                            self.eval(predicate, &inner, depth + 1).await
                        }
                    }
                }
                Predicate::Check {
                    relation,
                    operation,
                } => {
                    let target = self
                        .cache
                        .related_one(&ctx.instance.instance_ref(), relation)
                        .await?;
                    match target {
                        None => Ok(false),
                        Some(target) => {
                            let op = operation.unwrap_or(Operation::Read);
                            self.check_entity(&target, op, ctx.principal, depth + 1).await
                        }
                    }
                }
            }
        })
    }

    async fn compare(
        &self,
        op: CompareOp,
        left: &ValueExpr,
        right: &ValueExpr,
        ctx: &EvalContext<'_>,
    ) -> Result<bool, EngineError> {
        let left_null_lit = matches!(left, ValueExpr::Literal(Value::Null));
        let right_null_lit = matches!(right, ValueExpr::Literal(Value::Null));

        // An explicit null literal makes the comparison a null check.
        if left_null_lit || right_null_lit {
            let is_null = if left_null_lit && right_null_lit {
                true
            } else {
                let other = if left_null_lit { right } else { left };
                self.resolve(other, ctx).await?.is_null()
            };
            return Ok(match op {
                CompareOp::Eq => is_null,
                CompareOp::Ne => !is_null,
            });
        }

        let lhs = self.resolve(left, ctx).await?;
        let rhs = self.resolve(right, ctx).await?;
        // A runtime null matches nothing: an anonymous principal fails both
        // == and != against an identity.
        if lhs.is_null() || rhs.is_null() {
            return Ok(false);
        }
        Ok(match op {
            CompareOp::Eq => lhs == rhs,
            CompareOp::Ne => lhs != rhs,
        })
    }

    async fn resolve(
        &self,
        expr: &ValueExpr,
        ctx: &EvalContext<'_>,
    ) -> Result<Value, EngineError> {
        match expr {
            ValueExpr::Literal(value) => Ok(value.clone()),
            ValueExpr::Field(name) => {
                ctx.instance
                    .field(name)
                    .ok_or_else(|| missing_field(ctx.instance, name))
            }
            ValueExpr::FutureField(name) => {
                let future = ctx.future.ok_or(EngineError::FutureUnavailable)?;
                future.field(name).ok_or_else(|| missing_field(future, name))
            }
            ValueExpr::Auth => Ok(ctx
                .principal
                .map(Principal::identity)
                .unwrap_or(Value::Null)),
            ValueExpr::AuthClaim(name) => Ok(ctx
                .principal
                .and_then(|p| p.claim(name))
                .unwrap_or(Value::Null)),
            ValueExpr::RelatedId(path) => {
                let mut cur = ctx.instance.instance_ref();
                for segment in path {
                    match self.cache.related_one(&cur, segment).await? {
                        Some(next) => cur = next.instance_ref(),
                        None => return Ok(Value::Null),
                    }
                }
                Ok(Value::Id(cur.id))
            }
        }
    }

    // Fold the target entity's own resolved rule set for the operation
    // into a single boolean, deny rules first.
    pub(crate) async fn check_entity(
        &self,
        target: &Instance,
        operation: Operation,
        principal: Option<&Principal>,
        depth: usize,
    ) -> Result<bool, EngineError> {
        let concrete = self.model.concrete_of(&target.entity_type, target)?;
        let rules = self.model.resolve_rules(concrete, operation)?;
        let ctx = EvalContext {
            instance: target,
            future: None,
            principal,
        };
        self.rules_allow(rules, &ctx, depth).await
    }

    async fn rules_allow(
        &self,
        rules: &[ResolvedRule],
        ctx: &EvalContext<'_>,
        depth: usize,
    ) -> Result<bool, EngineError> {
        for rule in rules.iter().filter(|r| r.polarity == Polarity::Deny) {
            if self.eval(&rule.predicate, ctx, depth).await? {
                return Ok(false);
            }
        }
        for rule in rules.iter().filter(|r| r.polarity == Polarity::Allow) {
            if self.eval(&rule.predicate, ctx, depth).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

fn missing_field(instance: &Instance, field: &str) -> EngineError {
    SchemaError::MissingField {
        entity: instance.entity_type.clone(),
        field: field.to_string(),
    }
    .into()
}
