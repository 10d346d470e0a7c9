// Session module - the unit of work
// A session buffers saves against the shared entity store and applies them in
// one atomic commit. The commit walks the object graph from every saved root,
// follows cascade-eligible collections, and resolves foreign keys from the
// graph as it stands at commit time - so callers may wire relationships after
// calling save, the way the classic cascading-save pattern allows.
//
// Multiple sessions can share one store; the store's write lock serializes
// commits, so another session sees either none or all of a batch.

pub mod entity;

use crate::error::{Error, Result};
use crate::query::executor::{QueryExecutor, QueryOutput, StoreView};
use crate::query::parser::{QueryBuilder, SelectQuery, Statement};
use crate::query::bulk;
use crate::storage::store::EntityStore;
use crate::storage::{Record, Registry, Value};
use entity::{handle_id, Entity, EntityHandle, LinkState};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Builds sessions over one shared store. The registry (entity metadata) is
/// fixed at construction, mirroring up-front entity registration.
pub struct SessionFactory {
    registry: Arc<Registry>,
    store: Arc<RwLock<EntityStore>>,
    next_session_id: AtomicU64,
}

impl SessionFactory {
    pub fn new(registry: Registry) -> Self {
        let registry = Arc::new(registry);
        let store = Arc::new(RwLock::new(EntityStore::new(registry.clone())));
        Self {
            registry,
            store,
            next_session_id: AtomicU64::new(1),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The shared store, for direct bulk mutation or inspection.
    pub fn store(&self) -> &Arc<RwLock<EntityStore>> {
        &self.store
    }

    /// Open a new session. Sessions are single-threaded; open one per unit of
    /// work.
    pub fn open_session(&self) -> Session {
        Session {
            registry: self.registry.clone(),
            store: self.store.clone(),
            session_id: self.next_session_id.fetch_add(1, Ordering::Relaxed),
            pending: Vec::new(),
            active_txn: None,
            next_txn_id: 1,
            closed: false,
        }
    }
}

/// Token returned by `begin_transaction` and consumed by `commit`. Owning the
/// token is the only way to commit, so a committed transaction cannot be
/// committed twice. The token carries the issuing session's id, so a token
/// from one session never commits another session's batch.
#[derive(Debug)]
pub struct Transaction {
    session: u64,
    id: u64,
}

/// What a buffered entity needs at flush time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingOp {
    Insert,
    Update,
}

struct BatchEntry {
    handle: EntityHandle,
    op: PendingOp,
}

/// A unit-of-work session over the shared entity store.
pub struct Session {
    registry: Arc<Registry>,
    store: Arc<RwLock<EntityStore>>,
    session_id: u64,
    pending: Vec<EntityHandle>,
    active_txn: Option<u64>,
    next_txn_id: u64,
    closed: bool,
}

impl Session {
    /// The entity metadata this session was opened with.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(Error::SessionClosed)
        } else {
            Ok(())
        }
    }

    fn read_store(&self) -> RwLockReadGuard<'_, EntityStore> {
        self.store.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_store(&self) -> RwLockWriteGuard<'_, EntityStore> {
        self.store.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an entity for persistence. Transient instances (no key) are
    /// inserted at commit; instances that already have a key are updated.
    /// Registering the same instance twice is a no-op.
    pub fn save(&mut self, handle: &EntityHandle) -> Result<()> {
        self.ensure_open()?;
        // Unknown types fail here, not at commit
        self.registry.descriptor(handle.borrow().entity_type())?;

        if !self
            .pending
            .iter()
            .any(|p| handle_id(p) == handle_id(handle))
        {
            self.pending.push(handle.clone());
        }
        Ok(())
    }

    /// Start a transaction. Only one can be active per session.
    pub fn begin_transaction(&mut self) -> Result<Transaction> {
        self.ensure_open()?;
        if self.active_txn.is_some() {
            return Err(Error::validation("a transaction is already active"));
        }
        let id = self.next_txn_id;
        self.next_txn_id += 1;
        self.active_txn = Some(id);
        Ok(Transaction {
            session: self.session_id,
            id,
        })
    }

    /// Flush every buffered create/update atomically. On any failure the
    /// store is left exactly as it was, the buffer is kept, and the error
    /// says what went wrong; the session stays usable for a fresh
    /// transaction.
    pub fn commit(&mut self, txn: Transaction) -> Result<()> {
        self.ensure_open()?;
        match self.active_txn {
            Some(id) if txn.session == self.session_id && id == txn.id => {}
            _ => return Err(Error::validation("no matching active transaction")),
        }
        self.active_txn = None;

        let batch = self.collect_batch()?;
        let mut guard = self.write_store();

        // Apply the whole batch to a scratch copy; swap it in only when every
        // operation has succeeded. A failed commit never leaves partial
        // writes behind.
        let mut staged = guard.clone();
        let assigned = apply_batch(&self.registry, &mut staged, &batch)?;
        *guard = staged;
        drop(guard);

        // Write the freshly assigned keys back onto the instances
        for entry in &batch {
            if entry.op == PendingOp::Insert {
                if let Some(&key) = assigned.get(&handle_id(&entry.handle)) {
                    entry.handle.borrow_mut().assign_key(key);
                }
            }
        }
        self.pending.clear();
        Ok(())
    }

    /// Discard any uncommitted work and close the session. Idempotent: a
    /// second close (e.g. from an error path after a successful close) does
    /// nothing.
    pub fn close(&mut self) {
        self.pending.clear();
        self.active_txn = None;
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Build a query without running it, so pagination can be applied:
    /// `session.build_query("FROM Employee")?.page(2, 3)?`.
    pub fn build_query(&self, hql: &str) -> Result<SelectQuery> {
        self.ensure_open()?;
        match QueryBuilder::new(&self.registry).build(hql)? {
            Statement::Select(query) => Ok(query),
            _ => Err(Error::syntax(
                "not a select query; use execute_update for mutations",
            )),
        }
    }

    /// Run a built query against this session's view of the store: committed
    /// records overlaid with the session's own uncommitted changes.
    pub fn select(&self, query: &SelectQuery) -> Result<QueryOutput> {
        self.ensure_open()?;
        let view = self.snapshot()?;
        QueryExecutor::new(&self.registry, &view).run(query)
    }

    /// Parse and run a select in one step.
    pub fn execute_query(&self, hql: &str) -> Result<QueryOutput> {
        let query = self.build_query(hql)?;
        self.select(&query)
    }

    /// Execute a set-based UPDATE or DELETE directly against the store,
    /// bypassing the session buffer, and return the affected count.
    pub fn execute_update(&self, hql: &str) -> Result<usize> {
        self.ensure_open()?;
        match QueryBuilder::new(&self.registry).build(hql)? {
            Statement::Update(update) => bulk::bulk_update(&mut self.write_store(), &update),
            Statement::Delete(delete) => bulk::bulk_delete(&mut self.write_store(), &delete),
            Statement::Select(_) => Err(Error::syntax(
                "not a mutation; use execute_query for selects",
            )),
        }
    }

    /// Explicitly load a to-one relationship from the store. The result is
    /// cached on the instance for the rest of the session, so only the first
    /// access touches the store.
    pub fn load_link(&self, handle: &EntityHandle, field: &str) -> Result<Option<EntityHandle>> {
        self.ensure_open()?;
        if let LinkState::Set(cached) = handle.borrow().link(field) {
            return Ok(cached);
        }

        let entity_type = handle.borrow().entity_type().to_string();
        let descriptor = self.registry.descriptor(&entity_type)?;
        let target = descriptor
            .many_to_one_target(field)
            .ok_or_else(|| Error::syntax(format!("{} has no relation {}", entity_type, field)))?
            .to_string();
        let target_desc = self.registry.descriptor(&target)?;

        let loaded = match handle.borrow().get(field) {
            Some(Value::Key(key)) => {
                let store = self.read_store();
                let record = store
                    .get(&target, key)?
                    .ok_or_else(|| Error::not_found(&target, key))?;
                Some(Entity::from_record(target_desc, key, record))
            }
            _ => None,
        };
        handle.borrow_mut().cache_link(field, loaded.clone());
        Ok(loaded)
    }

    /// Explicitly load a one-to-many collection from the store (all target
    /// records whose mapped-by field points at this instance). Cached on the
    /// instance after the first load. A transient parent has no persistent
    /// children, so the result is empty.
    pub fn load_children(&self, handle: &EntityHandle, relation: &str) -> Result<Vec<EntityHandle>> {
        self.ensure_open()?;
        if let Some(cached) = handle.borrow().children(relation) {
            return Ok(cached);
        }

        let entity_type = handle.borrow().entity_type().to_string();
        let descriptor = self.registry.descriptor(&entity_type)?;
        let (target, mapped_by, _) = descriptor.one_to_many_relation(relation).ok_or_else(|| {
            Error::syntax(format!("{} has no collection {}", entity_type, relation))
        })?;
        let (target, mapped_by) = (target.to_string(), mapped_by.to_string());
        let target_desc = self.registry.descriptor(&target)?;
        let fk_index = target_desc.field_index(&mapped_by).ok_or_else(|| {
            Error::syntax(format!("{} has no field {}", target, mapped_by))
        })?;

        let Some(parent_key) = handle.borrow().key() else {
            return Ok(Vec::new());
        };

        let store = self.read_store();
        let children: Vec<EntityHandle> = store
            .scan(&target)?
            .filter(|(_, record)| record.values[fk_index] == Value::Key(parent_key))
            .map(|(key, record)| Entity::from_record(target_desc, key, record))
            .collect();
        drop(store);

        handle
            .borrow_mut()
            .cache_children(relation, children.clone());
        Ok(children)
    }

    /// The batch a flush would apply right now: every saved root plus every
    /// instance reachable through cascade-enabled collections, breadth-first,
    /// deduplicated by instance identity.
    fn collect_batch(&self) -> Result<Vec<BatchEntry>> {
        let mut batch = Vec::new();
        let mut visited: HashSet<usize> = HashSet::new();
        let mut queue: VecDeque<EntityHandle> = self.pending.iter().cloned().collect();

        while let Some(handle) = queue.pop_front() {
            if !visited.insert(handle_id(&handle)) {
                continue;
            }
            let entity_type = handle.borrow().entity_type().to_string();
            let descriptor = self.registry.descriptor(&entity_type)?;

            let op = if handle.borrow().key().is_some() {
                PendingOp::Update
            } else {
                PendingOp::Insert
            };

            for relation in &descriptor.relations {
                if let crate::storage::Relation::OneToMany {
                    name,
                    target,
                    cascade: true,
                    ..
                } = relation
                {
                    if let Some(children) = handle.borrow().children(name) {
                        for child in children {
                            let child_type = child.borrow().entity_type().to_string();
                            if child_type != *target {
                                return Err(Error::integrity(format!(
                                    "{}.{} holds a {}, expected {}",
                                    entity_type, name, child_type, target
                                )));
                            }
                            queue.push_back(child);
                        }
                    }
                }
            }

            batch.push(BatchEntry { handle, op });
        }
        Ok(batch)
    }

    /// Materialize this session's readable view: the committed store with
    /// the pending batch overlaid. Uncommitted inserts appear under
    /// provisional keys (the store's next keys in batch order); the final
    /// keys are fixed at commit.
    fn snapshot(&self) -> Result<SessionView> {
        let store = self.read_store();

        let mut tables: BTreeMap<String, BTreeMap<u64, Record>> = BTreeMap::new();
        for name in self.registry.entity_names() {
            let rows = store.scan(name)?.map(|(k, r)| (k, r.clone())).collect();
            tables.insert(name.to_string(), rows);
        }

        let batch = self.collect_batch()?;

        // First pass: hand out provisional keys so links between pending
        // instances resolve regardless of batch order.
        let mut next_keys: HashMap<String, u64> = HashMap::new();
        let mut assigned: HashMap<usize, u64> = HashMap::new();
        for entry in &batch {
            if entry.op == PendingOp::Insert {
                let entity_type = entry.handle.borrow().entity_type().to_string();
                let next = match next_keys.get(&entity_type) {
                    Some(&n) => n,
                    None => store.peek_next_key(&entity_type)?,
                };
                assigned.insert(handle_id(&entry.handle), next);
                next_keys.insert(entity_type, next + 1);
            }
        }
        drop(store);

        // Second pass: render records and overlay them
        for entry in &batch {
            let entity_type = entry.handle.borrow().entity_type().to_string();
            let descriptor = self.registry.descriptor(&entity_type)?;
            let record = entry.handle.borrow().to_record(descriptor, |target| {
                resolve_target_key(target, &assigned)
            })?;
            let key = match entry.op {
                PendingOp::Insert => assigned[&handle_id(&entry.handle)],
                PendingOp::Update => entry
                    .handle
                    .borrow()
                    .key()
                    .expect("update entries always carry a key"),
            };
            if let Some(rows) = tables.get_mut(&entity_type) {
                rows.insert(key, record);
            }
        }

        Ok(SessionView { tables })
    }
}

/// Key for a link target: already persistent, or provisionally/finally
/// assigned within the current batch. Anything else is a reference to an
/// instance the flush cannot reach.
fn resolve_target_key(target: &EntityHandle, assigned: &HashMap<usize, u64>) -> Result<u64> {
    if let Some(&key) = assigned.get(&handle_id(target)) {
        return Ok(key);
    }
    target.borrow().key().ok_or_else(|| {
        Error::integrity(format!(
            "reference to unsaved transient {} instance",
            target.borrow().entity_type()
        ))
    })
}

/// Apply a batch to `staged`, assigning real keys. Entries are applied in
/// dependency order: an instance waits until every in-batch instance it links
/// to has its key. Returns the keys assigned to inserted instances.
fn apply_batch(
    registry: &Registry,
    staged: &mut EntityStore,
    batch: &[BatchEntry],
) -> Result<HashMap<usize, u64>> {
    let in_batch: HashSet<usize> = batch.iter().map(|e| handle_id(&e.handle)).collect();
    let mut assigned: HashMap<usize, u64> = HashMap::new();
    let mut remaining: Vec<&BatchEntry> = batch.iter().collect();

    while !remaining.is_empty() {
        let mut deferred: Vec<&BatchEntry> = Vec::new();
        let mut progress = false;

        for entry in remaining {
            if !links_resolvable(entry, &assigned, &in_batch)? {
                deferred.push(entry);
                continue;
            }
            apply_entry(registry, staged, entry, &mut assigned)?;
            progress = true;
        }

        if !progress && !deferred.is_empty() {
            return Err(Error::integrity(
                "circular references between transient instances in one batch",
            ));
        }
        remaining = deferred;
    }
    Ok(assigned)
}

/// Whether every explicitly set link of this entry can be turned into a key
/// right now. In-batch targets that are not yet keyed mean "wait"; targets
/// outside the batch with no key are a hard integrity failure.
fn links_resolvable(
    entry: &BatchEntry,
    assigned: &HashMap<usize, u64>,
    in_batch: &HashSet<usize>,
) -> Result<bool> {
    for (_, target) in entry.handle.borrow().set_links() {
        let Some(target) = target else { continue };
        let id = handle_id(&target);
        if target.borrow().key().is_some() || assigned.contains_key(&id) {
            continue;
        }
        if in_batch.contains(&id) {
            return Ok(false); // will be keyed later in this flush
        }
        return Err(Error::integrity(format!(
            "reference to unsaved transient {} instance",
            target.borrow().entity_type()
        )));
    }
    Ok(true)
}

fn apply_entry(
    registry: &Registry,
    staged: &mut EntityStore,
    entry: &BatchEntry,
    assigned: &mut HashMap<usize, u64>,
) -> Result<()> {
    let entity_type = entry.handle.borrow().entity_type().to_string();
    let descriptor = registry.descriptor(&entity_type)?;

    let record = entry
        .handle
        .borrow()
        .to_record(descriptor, |target| resolve_target_key(target, assigned))?;

    // Referential check: every foreign key (explicit link or raw value) must
    // point at a record that exists in the staged store
    for (index, field) in descriptor.fields.iter().enumerate() {
        if let (Value::Key(fk), Some(target)) = (
            &record.values[index],
            descriptor.many_to_one_target(&field.name),
        ) {
            if !staged.contains(target, *fk)? {
                return Err(Error::integrity(format!(
                    "{}.{} references missing {} {}",
                    entity_type, field.name, target, fk
                )));
            }
        }
    }

    match entry.op {
        PendingOp::Insert => {
            let key = staged.insert(&entity_type, record)?;
            assigned.insert(handle_id(&entry.handle), key);
        }
        PendingOp::Update => {
            let key = entry
                .handle
                .borrow()
                .key()
                .expect("update entries always carry a key");
            staged.replace(&entity_type, key, record).map_err(|e| match e {
                // The instance has a key but the row is gone (e.g. bulk
                // deleted since it was loaded)
                Error::NotFound { entity, key } => {
                    Error::integrity(format!("update of missing {} {}", entity, key))
                }
                other => other,
            })?;
        }
    }
    Ok(())
}

/// A session's readable view of the store: committed rows plus the session's
/// own pending changes, per entity, in key order.
pub struct SessionView {
    tables: BTreeMap<String, BTreeMap<u64, Record>>,
}

impl StoreView for SessionView {
    fn scan(&self, entity: &str) -> Result<Vec<(u64, Record)>> {
        let rows = self
            .tables
            .get(entity)
            .ok_or_else(|| Error::syntax(format!("unknown entity: {}", entity)))?;
        Ok(rows.iter().map(|(k, r)| (*k, r.clone())).collect())
    }

    fn get(&self, entity: &str, key: u64) -> Result<Option<Record>> {
        let rows = self
            .tables
            .get(entity)
            .ok_or_else(|| Error::syntax(format!("unknown entity: {}", entity)))?;
        Ok(rows.get(&key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Value;

    fn factory() -> SessionFactory {
        SessionFactory::new(Registry::employee_department())
    }

    fn employee(name: &str, salary: f64) -> EntityHandle {
        Entity::new("Employee")
            .set("name", Value::text(name))
            .set("salary", Value::float(salary))
            .into_handle()
    }

    fn department(name: &str) -> EntityHandle {
        Entity::new("Department")
            .set("name", Value::text(name))
            .into_handle()
    }

    /// The cascading-save walkthrough: save only the departments, wire the
    /// employee side afterwards, and everything lands with consistent keys.
    #[test]
    fn test_cascade_save_persists_employees_with_foreign_keys() {
        let factory = factory();
        let mut session = factory.open_session();

        let e1 = employee("Rohit", 98.5);
        let e2 = employee("Pavan", 45.5);
        let dept = department("IT");
        dept.borrow_mut()
            .set_children("employees", vec![e1.clone(), e2.clone()]);
        session.save(&dept).unwrap();

        // Relationship set AFTER save; resolved at commit
        e1.borrow_mut().set_link("department", Some(dept.clone()));
        e2.borrow_mut().set_link("department", Some(dept.clone()));

        let txn = session.begin_transaction().unwrap();
        session.commit(txn).unwrap();

        let dept_key = dept.borrow().key().unwrap();
        assert_eq!(dept_key, 1);
        assert_eq!(e1.borrow().key(), Some(1));
        assert_eq!(e2.borrow().key(), Some(2));

        let store = factory.store().read().unwrap();
        let fks: Vec<Value> = store
            .scan("Employee")
            .unwrap()
            .map(|(_, r)| r.values[2].clone())
            .collect();
        assert_eq!(fks, vec![Value::Key(dept_key), Value::Key(dept_key)]);
    }

    #[test]
    fn test_failed_commit_rolls_back_whole_batch() {
        let factory = factory();
        let mut session = factory.open_session();

        let good = employee("Ann", 50.0);
        let bad = employee("Bob", 60.0);
        // Raw dangling foreign key, no link set
        bad.borrow_mut().put("department", Value::Key(99));

        session.save(&good).unwrap();
        session.save(&bad).unwrap();

        let txn = session.begin_transaction().unwrap();
        let err = session.commit(txn).unwrap_err();
        assert!(matches!(err, Error::IntegrityViolation(_)));

        // Nothing was persisted, not even the good one
        let store = factory.store().read().unwrap();
        assert_eq!(store.count("Employee").unwrap(), 0);
        assert_eq!(good.borrow().key(), None);
        drop(store);

        // The session stays usable for a fresh transaction after recovery
        bad.borrow_mut().put("department", Value::Null);
        let txn = session.begin_transaction().unwrap();
        session.commit(txn).unwrap();
        assert_eq!(
            factory.store().read().unwrap().count("Employee").unwrap(),
            2
        );
    }

    #[test]
    fn test_link_to_unsaved_transient_is_integrity_violation() {
        let factory = factory();
        let mut session = factory.open_session();

        let emp = employee("Ann", 50.0);
        let dept = department("IT"); // never saved, no cascade reaches it
        emp.borrow_mut().set_link("department", Some(dept));
        session.save(&emp).unwrap();

        let txn = session.begin_transaction().unwrap();
        let err = session.commit(txn).unwrap_err();
        assert!(matches!(err, Error::IntegrityViolation(_)));
    }

    #[test]
    fn test_save_is_insert_then_update() {
        let factory = factory();
        let mut session = factory.open_session();

        let emp = employee("Ann", 50.0);
        session.save(&emp).unwrap();
        let txn = session.begin_transaction().unwrap();
        session.commit(txn).unwrap();
        let key = emp.borrow().key().unwrap();

        // Re-registering a keyed instance updates in place
        emp.borrow_mut().put("name", Value::text("Anne"));
        session.save(&emp).unwrap();
        let txn = session.begin_transaction().unwrap();
        session.commit(txn).unwrap();

        let store = factory.store().read().unwrap();
        assert_eq!(store.count("Employee").unwrap(), 1);
        let record = store.get("Employee", key).unwrap().unwrap();
        assert_eq!(record.values[0], Value::text("Anne"));
    }

    #[test]
    fn test_read_your_own_writes_and_isolation() {
        let factory = factory();
        let mut session = factory.open_session();
        let other = factory.open_session();

        let dept = department("IT");
        dept.borrow_mut()
            .set_children("employees", vec![employee("Ann", 50.0), employee("Bob", 60.0)]);
        session.save(&dept).unwrap();

        // This session sees its own uncommitted cascade...
        let mine = session.execute_query("FROM Employee").unwrap();
        assert_eq!(mine.len(), 2);

        // ...the other session sees nothing until commit
        let theirs = other.execute_query("FROM Employee").unwrap();
        assert_eq!(theirs.len(), 0);

        let txn = session.begin_transaction().unwrap();
        session.commit(txn).unwrap();
        assert_eq!(other.execute_query("FROM Employee").unwrap().len(), 2);
    }

    #[test]
    fn test_double_close_is_harmless_and_ops_fail_after() {
        let factory = factory();
        let mut session = factory.open_session();
        session.close();
        session.close(); // caller's success path and finally-block both close

        assert!(matches!(
            session.save(&employee("Ann", 1.0)),
            Err(Error::SessionClosed)
        ));
        assert!(matches!(
            session.execute_query("FROM Employee"),
            Err(Error::SessionClosed)
        ));
        assert!(matches!(
            session.begin_transaction(),
            Err(Error::SessionClosed)
        ));
    }

    #[test]
    fn test_close_discards_uncommitted_changes() {
        let factory = factory();
        let mut session = factory.open_session();
        session.save(&employee("Ann", 1.0)).unwrap();
        session.close();

        let other = factory.open_session();
        assert_eq!(other.execute_query("FROM Employee").unwrap().len(), 0);
    }

    #[test]
    fn test_commit_token_from_other_session_is_rejected() {
        let factory = factory();
        let mut s1 = factory.open_session();
        let mut s2 = factory.open_session();
        let txn = s1.begin_transaction().unwrap();
        // s2 never began a transaction
        assert!(matches!(s2.commit(txn), Err(Error::Validation(_))));
    }

    #[test]
    fn test_foreign_token_with_colliding_id_is_rejected() {
        let factory = factory();
        let mut s1 = factory.open_session();
        let mut s2 = factory.open_session();

        // Both sessions hold their first transaction, so the per-session
        // counters collide; the tokens must still not be interchangeable
        let txn1 = s1.begin_transaction().unwrap();
        let txn2 = s2.begin_transaction().unwrap();

        s2.save(&employee("Ann", 50.0)).unwrap();
        assert!(matches!(s2.commit(txn1), Err(Error::Validation(_))));
        // The rejected commit wrote nothing
        assert_eq!(
            factory.store().read().unwrap().count("Employee").unwrap(),
            0
        );

        // The session's own token still commits
        s2.commit(txn2).unwrap();
        assert_eq!(
            factory.store().read().unwrap().count("Employee").unwrap(),
            1
        );
    }

    #[test]
    fn test_lazy_link_load_is_cached() {
        let factory = factory();
        let mut session = factory.open_session();

        let dept = department("HR");
        let emp = employee("Cid", 68.5);
        dept.borrow_mut().set_children("employees", vec![emp.clone()]);
        emp.borrow_mut().set_link("department", Some(dept.clone()));
        session.save(&dept).unwrap();
        let txn = session.begin_transaction().unwrap();
        session.commit(txn).unwrap();

        // Reload the employee fresh from the store, then walk the link
        let fresh = {
            let store = factory.store().read().unwrap();
            let record = store.get("Employee", 1).unwrap().unwrap().clone();
            Entity::from_record(
                factory.registry().descriptor("Employee").unwrap(),
                1,
                &record,
            )
        };
        let loaded = session.load_link(&fresh, "department").unwrap().unwrap();
        assert_eq!(loaded.borrow().get("name"), Some(Value::text("HR")));

        // And the inverse collection
        let children = session.load_children(&loaded, "employees").unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].borrow().get("name"), Some(Value::text("Cid")));
    }

    #[test]
    fn test_employee_without_department_loads_none() {
        let factory = factory();
        let mut session = factory.open_session();
        let emp = employee("Solo", 20.0);
        session.save(&emp).unwrap();
        let txn = session.begin_transaction().unwrap();
        session.commit(txn).unwrap();

        assert!(session.load_link(&emp, "department").unwrap().is_none());
    }
}
