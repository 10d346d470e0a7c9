// Bulk mutations
// Set-based UPDATE and DELETE that bypass the session's object graph and
// work directly on the store. Both run in two phases: collect the matching
// records and compute every new value against the pre-image, then apply.
// Any evaluation failure aborts before the first write, so a statement
// either changes all matching records or none.

use super::executor::{Binding, Bindings, QueryExecutor};
use super::parser::{DeleteStatement, UpdateStatement};
use crate::error::{Error, Result};
use crate::storage::{EntityStore, Record};

/// Apply a set-based update. Returns the number of records changed.
pub fn bulk_update(store: &mut EntityStore, statement: &UpdateStatement) -> Result<usize> {
    let registry = store.registry().clone();
    let descriptor = registry.descriptor(&statement.entity)?;
    // Evaluate against the pre-image so assignments like
    // `salary = salary * 1.1` read the old value even mid-statement
    let snapshot = store.clone();
    let executor = QueryExecutor::new(&registry, &snapshot);

    let mut staged: Vec<(u64, Record)> = Vec::new();
    for (key, record) in snapshot.scan(&statement.entity)? {
        let mut bindings = Bindings::new();
        bindings.insert(
            statement.alias.clone(),
            Binding {
                entity: statement.entity.clone(),
                key,
                record: record.clone(),
            },
        );
        let frames = [&bindings];

        if let Some(filter) = &statement.filter {
            if !executor.eval_predicate(filter, &frames)? {
                continue;
            }
        }

        let mut updated = record.clone();
        for (field, expr) in &statement.assignments {
            let index = descriptor.field_index(field).ok_or_else(|| {
                Error::validation(format!("{} has no field {}", statement.entity, field))
            })?;
            let value = executor
                .eval_scalar(expr, &frames)
                .map_err(as_validation)?;
            let field_def = &descriptor.fields[index];
            updated.values[index] = value.widen_to(&field_def.field_type);
        }
        descriptor.validate_record(&updated).map_err(as_validation)?;
        staged.push((key, updated));
    }

    let changed = staged.len();
    for (key, record) in staged {
        store.replace(&statement.entity, key, record)?;
    }
    Ok(changed)
}

/// Apply a set-based delete. Returns the number of records removed.
/// Deletion never cascades and never touches referencing records; rows that
/// pointed at a deleted key keep a dangling reference.
pub fn bulk_delete(store: &mut EntityStore, statement: &DeleteStatement) -> Result<usize> {
    let registry = store.registry().clone();
    let snapshot = store.clone();
    let executor = QueryExecutor::new(&registry, &snapshot);

    let mut doomed: Vec<u64> = Vec::new();
    for (key, record) in snapshot.scan(&statement.entity)? {
        let matched = match &statement.filter {
            Some(filter) => {
                let mut bindings = Bindings::new();
                bindings.insert(
                    statement.alias.clone(),
                    Binding {
                        entity: statement.entity.clone(),
                        key,
                        record: record.clone(),
                    },
                );
                executor.eval_predicate(filter, &[&bindings])?
            }
            None => true,
        };
        if matched {
            doomed.push(key);
        }
    }

    let removed = doomed.len();
    for key in doomed {
        store.delete(&statement.entity, key)?;
    }
    Ok(removed)
}

/// Evaluation failures inside a mutation are the caller's data problem,
/// not a syntax problem.
fn as_validation(error: Error) -> Error {
    match error {
        Error::QuerySyntax(message) => Error::Validation(message),
        other => other,
    }
}
