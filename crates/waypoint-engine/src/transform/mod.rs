//! Transform pipeline (spec §4.4 "transform tasks", §4.12)

pub mod equivalence;
pub mod operators;

pub use equivalence::{check_pair, EquivalenceCheck, Safety};
pub use operators::{execute_pipeline, AggOp, CompareOp, Operator, TransformError};
