mod build;
pub mod expr;
pub mod types;

pub use build::{PolicyModel, ResolvedRule, SchemaError};
