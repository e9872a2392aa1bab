pub mod engine;
pub mod instance;
pub mod model;

pub use engine::{
    AccessError, AccessRequest, Decision, DecisionEngine, EngineConfig, EngineError, Filter,
    FilterCompiler, FilterError, GraphAccessor, Reason, RuleTrace,
};
pub use instance::{Instance, InstanceRef, Principal, Value};
pub use model::expr::{CompareOp, Predicate, ValueExpr};
pub use model::types::{
    Cardinality, EntityDef, FieldDef, FieldType, Operation, Polarity, RelationDef, Rule,
};
pub use model::{PolicyModel, ResolvedRule, SchemaError};
