pub mod classifier;
pub mod params;

pub use classifier::{
    classify, max_param_index, parse_statements, returning_columns, split_statements,
    ClassifiedStatement, DeallocateTarget, ReturningColumn, StatementKind,
};
pub use params::{substitute_params, BindValue};
