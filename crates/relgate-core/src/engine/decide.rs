use std::sync::Arc;

use serde::Serialize;

use crate::instance::{Instance, Principal};
use crate::model::types::{Operation, Polarity};
use crate::model::{PolicyModel, ResolvedRule};

use super::cache::FetchCache;
use super::eval::{EvalContext, Evaluator};
use super::{EngineConfig, EngineError, GraphAccessor};

// `instance` is the current row for read/update/delete and the proposed
// row for create; `future` is the proposed post-update snapshot, only
// meaningful for update.
#[derive(Debug, Clone)]
pub struct AccessRequest {
    pub operation: Operation,
    pub entity_type: String,
    pub instance: Instance,
    pub future: Option<Instance>,
    pub principal: Option<Principal>,
}

// Rule labels name the declaring entity (or entity.field) and the rule's
// declaration index. NoAllowRule is the default-deny outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "rule")]
pub enum Reason {
    AllowedBy(String),
    DeniedBy(String),
    NoAllowRule,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleTrace {
    pub rule: String,
    pub polarity: Polarity,
    pub matched: bool,
}

// Carries enough of a trace for audit logs even when the outward-facing
// message stays opaque.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub allowed: bool,
    pub reason: Reason,
    pub trace: Vec<RuleTrace>,
}

// Stateless per call; safe to share across tasks.
pub struct DecisionEngine<A: GraphAccessor> {
    accessor: Arc<A>,
    model: Arc<PolicyModel>,
    config: EngineConfig,
}

impl<A: GraphAccessor> DecisionEngine<A> {
    pub fn new(accessor: Arc<A>, model: Arc<PolicyModel>, config: EngineConfig) -> Self {
        Self {
            accessor,
            model,
            config,
        }
    }

    pub fn model(&self) -> &Arc<PolicyModel> {
        &self.model
    }

    // Deny rules first (any match wins), then allow rules, default-deny
    // when nothing matches.
    pub async fn decide(&self, request: &AccessRequest) -> Result<Decision, EngineError> {
        let concrete = self
            .model
            .concrete_of(&request.entity_type, &request.instance)?;
        let rules = self.model.resolve_rules(concrete, request.operation)?;

        let decision = self.fold_rules(rules, request).await?;
        tracing::debug!(
            target: "policy",
            event = "decide",
            entity = concrete,
            operation = %request.operation,
            allowed = decision.allowed,
            "access decision"
        );
        Ok(decision)
    }

    // When override rules exist for (field, operation) their verdict
    // replaces the model-level one for this field only.
    pub async fn decide_field(
        &self,
        request: &AccessRequest,
        field: &str,
    ) -> Result<Decision, EngineError> {
        let model_decision = self.decide(request).await?;
        if !model_decision.allowed {
            return Ok(model_decision);
        }

        let concrete = self
            .model
            .concrete_of(&request.entity_type, &request.instance)?;
        let overrides = self.model.field_rules(concrete, field, request.operation)?;
        if overrides.is_empty() {
            return Ok(model_decision);
        }

        let decision = self.fold_rules(overrides, request).await?;
        tracing::debug!(
            target: "policy",
            event = "decide_field",
            entity = concrete,
            field = field,
            operation = %request.operation,
            allowed = decision.allowed,
            "field access decision"
        );
        Ok(decision)
    }

    async fn fold_rules(
        &self,
        rules: &[ResolvedRule],
        request: &AccessRequest,
    ) -> Result<Decision, EngineError> {
        let cache = FetchCache::new(&*self.accessor);
        let evaluator = Evaluator {
            cache: &cache,
            model: &self.model,
            config: &self.config,
        };
        let ctx = EvalContext {
            instance: &request.instance,
            future: request.future.as_ref(),
            principal: request.principal.as_ref(),
        };

        let mut trace = Vec::new();
        let mut denied_by: Option<String> = None;
        for rule in rules.iter().filter(|r| r.polarity == Polarity::Deny) {
            let matched = evaluator.eval(&rule.predicate, &ctx, 0).await?;
            trace.push(RuleTrace {
                rule: rule.label.clone(),
                polarity: rule.polarity,
                matched,
            });
            if matched && denied_by.is_none() {
                denied_by = Some(rule.label.clone());
                if !self.config.full_trace {
                    break;
                }
            }
        }
        if let Some(label) = denied_by {
            return Ok(Decision {
                allowed: false,
                reason: Reason::DeniedBy(label),
                trace,
            });
        }

        let mut allowed_by: Option<String> = None;
        for rule in rules.iter().filter(|r| r.polarity == Polarity::Allow) {
            let matched = evaluator.eval(&rule.predicate, &ctx, 0).await?;
            trace.push(RuleTrace {
                rule: rule.label.clone(),
                polarity: rule.polarity,
                matched,
            });
            if matched && allowed_by.is_none() {
                allowed_by = Some(rule.label.clone());
                if !self.config.full_trace {
                    break;
                }
            }
        }
        Ok(match allowed_by {
            Some(label) => Decision {
                allowed: true,
                reason: Reason::AllowedBy(label),
                trace,
            },
            None => Decision {
                allowed: false,
                reason: Reason::NoAllowRule,
                trace,
            },
        })
    }
}
