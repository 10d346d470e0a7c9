// EntityDB - an in-memory entity-relationship engine with unit-of-work
// sessions and an HQL-style query language.
// This is the library root that exposes the public API.

pub mod error;
pub mod query;
pub mod session;
pub mod storage;

// Re-export commonly used types for convenience
pub use error::{Error, Result};
pub use query::{QueryBuilder, QueryExecutor, QueryOutput};
pub use session::entity::{Entity, EntityHandle};
pub use session::{Session, SessionFactory, Transaction};
pub use storage::store::EntityStore;
pub use storage::{EntityDescriptor, FieldType, Record, Registry, Value};
