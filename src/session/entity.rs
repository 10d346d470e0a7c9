// Entity instances
// The in-memory objects a caller builds, wires together and hands to
// `Session::save`. An instance is transient until its first flush assigns a
// key. Relationship sides are kept by hand: setting an employee's department
// does not add the employee to the department's collection, and vice versa -
// only cascade rules decide what a flush reaches.

use crate::error::{Error, Result};
use crate::storage::{EntityDescriptor, FieldType, Record, Value};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

/// Shared handle to an entity instance. Sessions are single-threaded, so
/// plain `Rc<RefCell<..>>` is the right ownership model for a mutable object
/// graph with shared references.
pub type EntityHandle = Rc<RefCell<Entity>>;

/// Cached state of a to-one link.
/// `Set` records an explicit `set_link` (or a lazy load); until then the link
/// is unresolved and the raw foreign-key value in `values` is authoritative.
#[derive(Debug, Clone)]
pub enum LinkState {
    Unresolved,
    Set(Option<EntityHandle>),
}

/// An entity instance: typed field values plus relationship slots.
#[derive(Debug)]
pub struct Entity {
    entity_type: String,
    key: Option<u64>,
    values: BTreeMap<String, Value>,
    /// To-one links by foreign-key field name.
    links: BTreeMap<String, LinkState>,
    /// One-to-many collections by relation name; None until set or loaded.
    children: BTreeMap<String, Vec<EntityHandle>>,
}

impl Entity {
    /// Create a transient instance of the given type.
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            key: None,
            values: BTreeMap::new(),
            links: BTreeMap::new(),
            children: BTreeMap::new(),
        }
    }

    /// Set a field value (builder style).
    pub fn set(mut self, field: impl Into<String>, value: Value) -> Self {
        self.values.insert(field.into(), value);
        self
    }

    /// Wrap into the shared handle callers pass around.
    pub fn into_handle(self) -> EntityHandle {
        Rc::new(RefCell::new(self))
    }

    /// Rebuild an instance from a stored record (used by lazy loading).
    pub(crate) fn from_record(
        descriptor: &EntityDescriptor,
        key: u64,
        record: &Record,
    ) -> EntityHandle {
        let mut entity = Entity::new(descriptor.name.clone());
        entity.key = Some(key);
        for (field, value) in descriptor.fields.iter().zip(&record.values) {
            entity.values.insert(field.name.clone(), value.clone());
        }
        entity.into_handle()
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    /// The surrogate key, present once the instance has been flushed.
    pub fn key(&self) -> Option<u64> {
        self.key
    }

    pub(crate) fn assign_key(&mut self, key: u64) {
        self.key = Some(key);
    }

    /// Read a field value.
    pub fn get(&self, field: &str) -> Option<Value> {
        self.values.get(field).cloned()
    }

    /// Write a field value on an existing instance.
    pub fn put(&mut self, field: impl Into<String>, value: Value) {
        self.values.insert(field.into(), value);
    }

    /// Point a to-one link at another instance (or clear it with None).
    /// The target does not need a key yet; foreign keys are resolved from the
    /// graph as it stands at flush time, not at call time.
    pub fn set_link(&mut self, field: impl Into<String>, target: Option<EntityHandle>) {
        self.links.insert(field.into(), LinkState::Set(target));
    }

    /// Current state of a to-one link.
    pub fn link(&self, field: &str) -> LinkState {
        self.links
            .get(field)
            .cloned()
            .unwrap_or(LinkState::Unresolved)
    }

    pub(crate) fn cache_link(&mut self, field: impl Into<String>, target: Option<EntityHandle>) {
        self.links.insert(field.into(), LinkState::Set(target));
    }

    /// Every explicitly set to-one link, as (field, target) pairs. Flush uses
    /// this to decide when an instance's references are resolvable.
    pub(crate) fn set_links(&self) -> Vec<(String, Option<EntityHandle>)> {
        self.links
            .iter()
            .filter_map(|(field, state)| match state {
                LinkState::Set(target) => Some((field.clone(), target.clone())),
                LinkState::Unresolved => None,
            })
            .collect()
    }

    /// Replace a one-to-many collection.
    pub fn set_children(&mut self, relation: impl Into<String>, children: Vec<EntityHandle>) {
        self.children.insert(relation.into(), children);
    }

    /// The current collection for a relation, if one has been set or loaded.
    pub fn children(&self, relation: &str) -> Option<Vec<EntityHandle>> {
        self.children.get(relation).cloned()
    }

    pub(crate) fn cache_children(
        &mut self,
        relation: impl Into<String>,
        children: Vec<EntityHandle>,
    ) {
        self.children.insert(relation.into(), children);
    }

    /// Render this instance into a record, resolving each foreign-key field
    /// through `resolve_link`: explicitly set links win, otherwise the raw
    /// stored value is kept. `resolve_link` receives the link target and maps
    /// it to a key (flush passes in its batch key assignments here).
    pub(crate) fn to_record<F>(
        &self,
        descriptor: &EntityDescriptor,
        mut resolve_link: F,
    ) -> Result<Record>
    where
        F: FnMut(&EntityHandle) -> Result<u64>,
    {
        let mut values = Vec::with_capacity(descriptor.fields.len());
        for field in &descriptor.fields {
            let is_fk = field.field_type == FieldType::Key
                && descriptor.many_to_one_target(&field.name).is_some();
            let value = if is_fk {
                match self.link(&field.name) {
                    LinkState::Set(Some(target)) => Value::Key(resolve_link(&target)?),
                    LinkState::Set(None) => Value::Null,
                    LinkState::Unresolved => self.values.get(&field.name).cloned().unwrap_or(Value::Null),
                }
            } else {
                match self.values.get(&field.name) {
                    Some(v) => v.widen_to(&field.field_type),
                    None if field.nullable => Value::Null,
                    None => {
                        return Err(Error::integrity(format!(
                            "{}.{} has no value and is not nullable",
                            self.entity_type, field.name
                        )));
                    }
                }
            };
            values.push(value);
        }
        Ok(Record::new(values))
    }
}

/// Pointer identity of a handle, used to deduplicate graph walks.
pub(crate) fn handle_id(handle: &EntityHandle) -> usize {
    Rc::as_ptr(handle) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Registry;

    #[test]
    fn test_to_record_uses_set_link_over_raw_value() {
        let registry = Registry::employee_department();
        let desc = registry.descriptor("Employee").unwrap();

        let dept = Entity::new("Department")
            .set("name", Value::text("IT"))
            .into_handle();
        dept.borrow_mut().assign_key(7);

        let emp = Entity::new("Employee")
            .set("name", Value::text("Ann"))
            .set("salary", Value::float(50.0))
            .set("department", Value::Key(3)) // stale raw value
            .into_handle();
        emp.borrow_mut().set_link("department", Some(dept));

        let record = emp
            .borrow()
            .to_record(desc, |target| {
                target
                    .borrow()
                    .key()
                    .ok_or_else(|| Error::integrity("unkeyed"))
            })
            .unwrap();
        assert_eq!(record.values[2], Value::Key(7));
    }

    #[test]
    fn test_to_record_keeps_raw_fk_when_link_unresolved() {
        let registry = Registry::employee_department();
        let desc = registry.descriptor("Employee").unwrap();

        let emp = Entity::new("Employee")
            .set("name", Value::text("Ann"))
            .set("salary", Value::float(50.0))
            .set("department", Value::Key(3));
        let record = emp
            .to_record(desc, |_| unreachable!("no links were set"))
            .unwrap();
        assert_eq!(record.values[2], Value::Key(3));
    }

    #[test]
    fn test_to_record_missing_required_field() {
        let registry = Registry::employee_department();
        let desc = registry.descriptor("Employee").unwrap();

        let emp = Entity::new("Employee").set("name", Value::text("Ann"));
        let err = emp.to_record(desc, |_| unreachable!()).unwrap_err();
        assert!(matches!(err, Error::IntegrityViolation(_)));
    }

    #[test]
    fn test_integer_salary_widens_to_decimal() {
        let registry = Registry::employee_department();
        let desc = registry.descriptor("Employee").unwrap();

        let emp = Entity::new("Employee")
            .set("name", Value::text("Ann"))
            .set("salary", Value::Integer(45500));
        let record = emp.to_record(desc, |_| unreachable!()).unwrap();
        assert_eq!(record.values[1], Value::float(45500.0));
    }
}
