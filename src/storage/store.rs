// Entity store - the authoritative record collection
// One table per entity type, keyed by surrogate key. Records live in a
// BTreeMap, which gives key-ordered scans without a separate index; result
// lists therefore come back in a stable, deterministic order.

use super::{EntityDescriptor, Record, Registry};
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Storage for a single entity type.
#[derive(Debug, Clone)]
pub struct EntityTable {
    descriptor: EntityDescriptor,
    rows: BTreeMap<u64, Record>,
    /// The next surrogate key to assign (identity generation, starts at 1).
    next_key: u64,
}

impl EntityTable {
    fn new(descriptor: EntityDescriptor) -> Self {
        Self {
            descriptor,
            rows: BTreeMap::new(),
            next_key: 1,
        }
    }

    pub fn descriptor(&self) -> &EntityDescriptor {
        &self.descriptor
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// The shared record store. Mutated only inside a session commit or a bulk
/// mutation; every mutation is whole-record, so a scan never observes a
/// half-written row.
#[derive(Debug, Clone)]
pub struct EntityStore {
    registry: Arc<Registry>,
    tables: BTreeMap<String, EntityTable>,
}

impl EntityStore {
    /// Create an empty store with one table per registered entity type.
    pub fn new(registry: Arc<Registry>) -> Self {
        let tables = registry
            .entity_names()
            .map(|name| {
                let descriptor = registry
                    .descriptor(name)
                    .expect("registry lists the name it just returned")
                    .clone();
                (name.to_string(), EntityTable::new(descriptor))
            })
            .collect();
        Self { registry, tables }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    fn table(&self, entity: &str) -> Result<&EntityTable> {
        self.tables
            .get(entity)
            .ok_or_else(|| Error::syntax(format!("unknown entity: {}", entity)))
    }

    fn table_mut(&mut self, entity: &str) -> Result<&mut EntityTable> {
        self.tables
            .get_mut(entity)
            .ok_or_else(|| Error::syntax(format!("unknown entity: {}", entity)))
    }

    /// Insert a record, assigning the next unused key for the type.
    /// Fails only when the record does not match the entity's descriptor.
    pub fn insert(&mut self, entity: &str, record: Record) -> Result<u64> {
        let table = self.table_mut(entity)?;
        table.descriptor.validate_record(&record)?;

        let key = table.next_key;
        table.next_key += 1;
        table.rows.insert(key, record);
        Ok(key)
    }

    /// The key the next insert into this table will receive. Sessions use
    /// this to give uncommitted entities provisional keys in query views.
    pub fn peek_next_key(&self, entity: &str) -> Result<u64> {
        Ok(self.table(entity)?.next_key)
    }

    /// Look up a record by key.
    pub fn get(&self, entity: &str, key: u64) -> Result<Option<&Record>> {
        Ok(self.table(entity)?.rows.get(&key))
    }

    pub fn contains(&self, entity: &str, key: u64) -> Result<bool> {
        Ok(self.table(entity)?.rows.contains_key(&key))
    }

    /// Key-ordered scan over all live records of a type. Restartable: each
    /// call starts a fresh iteration.
    pub fn scan(&self, entity: &str) -> Result<impl Iterator<Item = (u64, &Record)>> {
        Ok(self.table(entity)?.rows.iter().map(|(k, r)| (*k, r)))
    }

    /// Apply an in-place mutation to one record. The mutation runs against a
    /// copy which replaces the stored record only after it re-validates, so a
    /// bad mutation leaves the row untouched.
    pub fn update<F>(&mut self, entity: &str, key: u64, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut Record),
    {
        let table = self.table_mut(entity)?;
        let row = table
            .rows
            .get(&key)
            .ok_or_else(|| Error::not_found(entity, key))?;

        let mut updated = row.clone();
        mutate(&mut updated);
        table.descriptor.validate_record(&updated)?;
        table.rows.insert(key, updated);
        Ok(())
    }

    /// Replace a record wholesale (used by session commits for updates).
    pub fn replace(&mut self, entity: &str, key: u64, record: Record) -> Result<()> {
        let table = self.table_mut(entity)?;
        if !table.rows.contains_key(&key) {
            return Err(Error::not_found(entity, key));
        }
        table.descriptor.validate_record(&record)?;
        table.rows.insert(key, record);
        Ok(())
    }

    /// Remove a record. Never cascades: rows referencing the deleted key keep
    /// their (now dangling) reference, mirroring the manual relationship
    /// bookkeeping this engine models.
    pub fn delete(&mut self, entity: &str, key: u64) -> Result<()> {
        let table = self.table_mut(entity)?;
        if table.rows.remove(&key).is_none() {
            return Err(Error::not_found(entity, key));
        }
        Ok(())
    }

    /// Number of live records of a type.
    pub fn count(&self, entity: &str) -> Result<usize> {
        Ok(self.table(entity)?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Registry, Value};

    fn store() -> EntityStore {
        EntityStore::new(Arc::new(Registry::employee_department()))
    }

    fn employee(name: &str, salary: f64) -> Record {
        Record::new(vec![Value::text(name), Value::float(salary), Value::Null])
    }

    #[test]
    fn test_insert_assigns_sequential_keys() {
        let mut store = store();
        let k1 = store.insert("Employee", employee("Ann", 50.0)).unwrap();
        let k2 = store.insert("Employee", employee("Bob", 60.0)).unwrap();
        assert_eq!((k1, k2), (1, 2));
        assert_eq!(store.count("Employee").unwrap(), 2);
    }

    #[test]
    fn test_get_miss_is_none_but_update_miss_is_not_found() {
        let mut store = store();
        assert!(store.get("Employee", 99).unwrap().is_none());

        let err = store
            .update("Employee", 99, |r| r.values[0] = Value::text("x"))
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { key: 99, .. }));

        let err = store.delete("Employee", 99).unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn test_scan_is_key_ordered_and_restartable() {
        let mut store = store();
        for (name, salary) in [("Ann", 1.0), ("Bob", 2.0), ("Cid", 3.0)] {
            store.insert("Employee", employee(name, salary)).unwrap();
        }
        store.delete("Employee", 2).unwrap();

        let keys: Vec<u64> = store.scan("Employee").unwrap().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![1, 3]);
        // A second scan starts over
        let keys_again: Vec<u64> = store.scan("Employee").unwrap().map(|(k, _)| k).collect();
        assert_eq!(keys, keys_again);
    }

    #[test]
    fn test_deleted_keys_are_not_reused() {
        let mut store = store();
        let k1 = store.insert("Employee", employee("Ann", 1.0)).unwrap();
        store.delete("Employee", k1).unwrap();
        let k2 = store.insert("Employee", employee("Bob", 2.0)).unwrap();
        assert!(k2 > k1);
    }

    #[test]
    fn test_bad_update_leaves_row_untouched() {
        let mut store = store();
        let key = store.insert("Employee", employee("Ann", 50.0)).unwrap();

        let err = store
            .update("Employee", key, |r| r.values[1] = Value::text("broken"))
            .unwrap_err();
        assert!(matches!(err, Error::IntegrityViolation(_)));

        let row = store.get("Employee", key).unwrap().unwrap();
        assert_eq!(row.values[1], Value::float(50.0));
    }

    #[test]
    fn test_unknown_entity_is_syntax_error() {
        let store = store();
        assert!(matches!(
            store.count("Invoice"),
            Err(Error::QuerySyntax(_))
        ));
    }
}
