mod cache;
mod decide;
mod eval;
mod filter;

pub use decide::{AccessRequest, Decision, DecisionEngine, Reason, RuleTrace};
pub use filter::{Filter, FilterCompiler, FilterError};

use std::future::Future;

use crate::instance::{Instance, InstanceRef};
use crate::model::SchemaError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccessError {
    #[error("graph accessor error: {0}")]
    Internal(String),
}

// Callers must treat any error as a denied operation; an evaluation
// failure is never coerced to allow.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Access(#[from] AccessError),

    #[error("max traversal depth exceeded: {0}")]
    MaxDepthExceeded(usize),

    #[error("future() referenced outside an update decision")]
    FutureUnavailable,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_depth: usize,
    // Evaluate every rule even after the outcome is known, so the trace
    // covers the full rule set.
    pub full_trace: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_depth: 16,
            full_trace: false,
        }
    }
}

// The storage boundary. Implementations must be deterministic for a given
// snapshot and side-effect-free from the engine's viewpoint; timeouts
// belong in a wrapping accessor.
pub trait GraphAccessor: Send + Sync {
    fn related_one(
        &self,
        from: &InstanceRef,
        relation: &str,
    ) -> impl Future<Output = Result<Option<Instance>, AccessError>> + Send;

    fn related_many(
        &self,
        from: &InstanceRef,
        relation: &str,
    ) -> impl Future<Output = Result<Vec<Instance>, AccessError>> + Send;
}
