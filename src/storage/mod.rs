// Storage module - entity metadata and the record store
// Everything the engine knows about an entity type is declared here as plain
// data (name, fields, key field, relationships) and handed to the session
// factory up front. There is no runtime reflection - the descriptors play the
// role annotations play in a classic ORM.

pub mod store;

pub use store::EntityStore;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Scale factor for the fixed-point decimal representation.
/// Decimals are stored in thousandths so values stay `Eq` + `Hash` and can be
/// used as group-by keys (floats can't).
pub const FLOAT_SCALE: i64 = 1000;

/// A single stored value.
/// `Float` is a fixed-point decimal in thousandths: `98.5` is `Float(98500)`.
/// `Key` carries surrogate keys and foreign keys.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Value {
    Null,
    Integer(i64),
    Float(i64),
    Text(String),
    Boolean(bool),
    Key(u64),
}

impl Value {
    /// Build a `Float` from an `f64`, rounding to thousandths.
    pub fn float(value: f64) -> Self {
        Value::Float((value * FLOAT_SCALE as f64).round() as i64)
    }

    /// Build a `Text` value.
    pub fn text(value: impl Into<String>) -> Self {
        Value::Text(value.into())
    }

    /// Read a numeric value back as an `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f as f64 / FLOAT_SCALE as f64),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Compare two values (used for filters and BETWEEN ranges).
    /// Integers and decimals coerce to each other, so `salary > 70000` works
    /// against a decimal column. Any other cross-type comparison yields None.
    pub fn compare(&self, other: &Value) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (Value::Integer(a), Value::Integer(b)) => Some(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => Some(a.cmp(b)),
            (Value::Integer(a), Value::Float(b)) => Some((a * FLOAT_SCALE).cmp(b)),
            (Value::Float(a), Value::Integer(b)) => Some(a.cmp(&(b * FLOAT_SCALE))),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
            (Value::Key(a), Value::Key(b)) => Some(a.cmp(b)),
            // Key literals arrive as plain integers in query text
            (Value::Key(a), Value::Integer(b)) => Some((*a as i128).cmp(&(*b as i128))),
            (Value::Integer(a), Value::Key(b)) => Some((*a as i128).cmp(&(*b as i128))),
            _ => None,
        }
    }

    /// Numeric arithmetic with the same integer/decimal coercion as `compare`.
    /// Decimal products and quotients are rescaled so the fixed-point
    /// representation stays in thousandths. Returns None for non-numeric
    /// operands (including Null) - the caller decides whether that is an
    /// error.
    pub fn arith(&self, op: ArithOp, other: &Value) -> Option<Value> {
        match (self, other) {
            (Value::Integer(a), Value::Integer(b)) => Some(match op {
                ArithOp::Add => Value::Integer(a + b),
                ArithOp::Sub => Value::Integer(a - b),
                ArithOp::Mul => Value::Integer(a * b),
                ArithOp::Div => {
                    if *b == 0 {
                        return None;
                    }
                    Value::Integer(a / b)
                }
            }),
            (Value::Float(_), _) | (_, Value::Float(_)) => {
                let a = self.to_scaled()?;
                let b = other.to_scaled()?;
                Some(match op {
                    ArithOp::Add => Value::Float(a + b),
                    ArithOp::Sub => Value::Float(a - b),
                    ArithOp::Mul => Value::Float(a * b / FLOAT_SCALE),
                    ArithOp::Div => {
                        if b == 0 {
                            return None;
                        }
                        Value::Float(a * FLOAT_SCALE / b)
                    }
                })
            }
            _ => None,
        }
    }

    /// Scaled fixed-point representation of a numeric value.
    fn to_scaled(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(i * FLOAT_SCALE),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Whether this value can live in a field of the given type.
    /// Integers are accepted into decimal fields (and widened on the way in).
    pub fn matches_type(&self, field_type: &FieldType) -> bool {
        matches!(
            (self, field_type),
            (Value::Integer(_), FieldType::Integer)
                | (Value::Integer(_), FieldType::Float)
                | (Value::Float(_), FieldType::Float)
                | (Value::Text(_), FieldType::Text)
                | (Value::Boolean(_), FieldType::Boolean)
                | (Value::Key(_), FieldType::Key)
        )
    }

    /// Widen a value to its field type (integer literal into decimal field).
    pub fn widen_to(&self, field_type: &FieldType) -> Value {
        match (self, field_type) {
            (Value::Integer(i), FieldType::Float) => Value::Float(i * FLOAT_SCALE),
            _ => self.clone(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", *v as f64 / FLOAT_SCALE as f64),
            Value::Text(s) => write!(f, "{}", s),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Key(k) => write!(f, "{}", k),
        }
    }
}

/// Arithmetic operators supported in assignments and projections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// The field types an entity can declare.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Integer,
    Float,
    Text,
    Boolean,
    /// A surrogate-key reference to another entity (foreign key column).
    Key,
}

/// A single field declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    pub nullable: bool,
}

/// A declared relationship between two entity types.
///
/// `ManyToOne` is the owning side: it is backed by a nullable `Key` field on
/// the record. `OneToMany` is the inverse side: it is not a column at all,
/// just the knowledge that the target entity points back via `mapped_by`.
/// When `cascade` is set, saving the parent also saves every child in its
/// collection. The two sides are NOT auto-synchronized; the caller keeps them
/// consistent, exactly like the mapped-by pattern this models.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Relation {
    ManyToOne {
        /// Name of the key-typed field holding the reference.
        field: String,
        /// Target entity type.
        target: String,
    },
    OneToMany {
        /// Collection name on the parent (e.g. "employees").
        name: String,
        /// Target entity type.
        target: String,
        /// The many-to-one field on the target that points back.
        mapped_by: String,
        /// Cascade saves from parent to children.
        cascade: bool,
    },
}

/// Declarative metadata for one entity type.
/// The surrogate key is not listed in `fields`; it is generated by the store
/// and addressed through `key_field` in queries (`e.id`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityDescriptor {
    pub name: String,
    pub key_field: String,
    pub fields: Vec<FieldDef>,
    pub relations: Vec<Relation>,
}

impl EntityDescriptor {
    /// Start a descriptor with no fields. `key_field` defaults to "id".
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_field: "id".to_string(),
            fields: Vec::new(),
            relations: Vec::new(),
        }
    }

    /// Add a plain data field.
    pub fn field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.push(FieldDef {
            name: name.into(),
            field_type,
            nullable: false,
        });
        self
    }

    /// Add a nullable data field.
    pub fn nullable_field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.push(FieldDef {
            name: name.into(),
            field_type,
            nullable: true,
        });
        self
    }

    /// Declare a many-to-one relationship. This adds the backing foreign-key
    /// field (nullable, key-typed) as well as the relation entry.
    pub fn many_to_one(mut self, field: impl Into<String>, target: impl Into<String>) -> Self {
        let field = field.into();
        self.fields.push(FieldDef {
            name: field.clone(),
            field_type: FieldType::Key,
            nullable: true,
        });
        self.relations.push(Relation::ManyToOne {
            field,
            target: target.into(),
        });
        self
    }

    /// Declare a one-to-many inverse collection.
    pub fn one_to_many(
        mut self,
        name: impl Into<String>,
        target: impl Into<String>,
        mapped_by: impl Into<String>,
        cascade: bool,
    ) -> Self {
        self.relations.push(Relation::OneToMany {
            name: name.into(),
            target: target.into(),
            mapped_by: mapped_by.into(),
            cascade,
        });
        self
    }

    /// Find the index of a field by name.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Look up a field definition by name.
    pub fn field_def(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// The many-to-one relation backed by `field`, if any.
    pub fn many_to_one_target(&self, field: &str) -> Option<&str> {
        self.relations.iter().find_map(|r| match r {
            Relation::ManyToOne { field: f, target } if f == field => Some(target.as_str()),
            _ => None,
        })
    }

    /// The one-to-many relation with the given collection name, if any.
    /// Returns (target, mapped_by, cascade).
    pub fn one_to_many_relation(&self, name: &str) -> Option<(&str, &str, bool)> {
        self.relations.iter().find_map(|r| match r {
            Relation::OneToMany {
                name: n,
                target,
                mapped_by,
                cascade,
            } if n == name => Some((target.as_str(), mapped_by.as_str(), *cascade)),
            _ => None,
        })
    }

    /// Validate a record against this descriptor: right arity, every value
    /// either Null-in-a-nullable-field or of the declared type.
    pub fn validate_record(&self, record: &Record) -> Result<()> {
        if record.values.len() != self.fields.len() {
            return Err(Error::integrity(format!(
                "{}: expected {} values, got {}",
                self.name,
                self.fields.len(),
                record.values.len()
            )));
        }
        for (field, value) in self.fields.iter().zip(&record.values) {
            match value {
                Value::Null if field.nullable => {}
                Value::Null => {
                    return Err(Error::integrity(format!(
                        "{}.{} is not nullable",
                        self.name, field.name
                    )));
                }
                v if v.matches_type(&field.field_type) => {}
                v => {
                    return Err(Error::integrity(format!(
                        "{}.{}: value {} does not match type {:?}",
                        self.name, field.name, v, field.field_type
                    )));
                }
            }
        }
        Ok(())
    }
}

/// A stored record: one value per descriptor field, in declaration order.
/// The surrogate key lives outside the record, as the map key in the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    pub values: Vec<Value>,
}

impl Record {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }
}

/// The set of entity types the engine knows about.
/// Built in code or loaded from a JSON schema document; handed to the
/// session factory at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Registry {
    entities: BTreeMap<String, EntityDescriptor>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity descriptor, replacing any previous one by name.
    pub fn register(&mut self, descriptor: EntityDescriptor) {
        self.entities.insert(descriptor.name.clone(), descriptor);
    }

    /// Look up a descriptor; unknown names are a query-build error.
    pub fn descriptor(&self, name: &str) -> Result<&EntityDescriptor> {
        self.entities
            .get(name)
            .ok_or_else(|| Error::syntax(format!("unknown entity: {}", name)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entities.contains_key(name)
    }

    /// Iterate over all registered entity names.
    pub fn entity_names(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }

    /// Load a registry from a JSON schema document.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::validation(format!("invalid schema document: {}", e)))
    }

    /// The sample schema used by the CLI and the tests: employees with an
    /// optional department, departments with a cascading employee collection.
    pub fn employee_department() -> Self {
        let mut registry = Self::new();
        registry.register(
            EntityDescriptor::new("Employee")
                .field("name", FieldType::Text)
                .field("salary", FieldType::Float)
                .many_to_one("department", "Department"),
        );
        registry.register(
            EntityDescriptor::new("Department")
                .field("name", FieldType::Text)
                .one_to_many("employees", "Employee", "department", true),
        );
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_coercion_in_compare() {
        // 70000 as an integer literal against a decimal column
        let salary = Value::float(70000.0);
        assert_eq!(
            salary.compare(&Value::Integer(70000)),
            Some(std::cmp::Ordering::Equal)
        );
        assert_eq!(
            Value::Integer(80000).compare(&salary),
            Some(std::cmp::Ordering::Greater)
        );
        // Cross-type comparisons that make no sense yield None
        assert_eq!(Value::text("a").compare(&Value::Integer(1)), None);
    }

    #[test]
    fn test_decimal_multiplication_rescales() {
        let salary = Value::float(100.0);
        let raised = salary.arith(ArithOp::Mul, &Value::float(1.1)).unwrap();
        assert_eq!(raised, Value::float(110.0));
    }

    #[test]
    fn test_arith_on_null_is_none() {
        assert_eq!(Value::Null.arith(ArithOp::Mul, &Value::float(1.1)), None);
    }

    #[test]
    fn test_descriptor_field_lookup() {
        let registry = Registry::employee_department();
        let emp = registry.descriptor("Employee").unwrap();
        assert_eq!(emp.field_index("salary"), Some(1));
        assert_eq!(emp.many_to_one_target("department"), Some("Department"));
        assert!(emp.field_def("department").unwrap().nullable);

        let dep = registry.descriptor("Department").unwrap();
        let (target, mapped_by, cascade) = dep.one_to_many_relation("employees").unwrap();
        assert_eq!(
            (target, mapped_by, cascade),
            ("Employee", "department", true)
        );
    }

    #[test]
    fn test_unknown_entity_is_syntax_error() {
        let registry = Registry::employee_department();
        assert!(matches!(
            registry.descriptor("Invoice"),
            Err(crate::error::Error::QuerySyntax(_))
        ));
    }

    #[test]
    fn test_validate_record_rejects_wrong_type() {
        let registry = Registry::employee_department();
        let emp = registry.descriptor("Employee").unwrap();

        let ok = Record::new(vec![Value::text("Ann"), Value::float(50.0), Value::Null]);
        assert!(emp.validate_record(&ok).is_ok());

        let bad = Record::new(vec![Value::text("Ann"), Value::text("oops"), Value::Null]);
        assert!(emp.validate_record(&bad).is_err());

        let not_nullable = Record::new(vec![Value::Null, Value::float(1.0), Value::Null]);
        assert!(emp.validate_record(&not_nullable).is_err());
    }

    #[test]
    fn test_registry_from_json() {
        let json = r#"{
            "entities": {
                "Employee": {
                    "name": "Employee",
                    "key_field": "id",
                    "fields": [
                        { "name": "name", "field_type": "text", "nullable": false },
                        { "name": "salary", "field_type": "float", "nullable": false },
                        { "name": "department", "field_type": "key", "nullable": true }
                    ],
                    "relations": [
                        { "kind": "many_to_one", "field": "department", "target": "Department" }
                    ]
                },
                "Department": {
                    "name": "Department",
                    "key_field": "id",
                    "fields": [
                        { "name": "name", "field_type": "text", "nullable": false }
                    ],
                    "relations": [
                        { "kind": "one_to_many", "name": "employees", "target": "Employee",
                          "mapped_by": "department", "cascade": true }
                    ]
                }
            }
        }"#;
        let registry = Registry::from_json(json).unwrap();
        assert!(registry.contains("Employee"));
        assert_eq!(
            registry
                .descriptor("Employee")
                .unwrap()
                .many_to_one_target("department"),
            Some("Department")
        );
    }
}
