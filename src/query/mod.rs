// Query module - handles HQL parsing, evaluation and bulk mutation
pub mod bulk;
pub mod executor;
pub mod parser;

pub use executor::{QueryExecutor, QueryOutput};
pub use parser::QueryBuilder;
