// Query executor
// Evaluates validated select queries against a store view. The pipeline is
// scan -> join -> filter -> project/aggregate -> page, all over whole-record
// bindings, so the same evaluator serves session snapshots and the shared
// store alike.

use super::parser::{
    CmpOp, JoinStep, Predicate, Projection, ScalarExpr, SelectExpr, SelectQuery,
};
use crate::error::{Error, Result};
use crate::storage::{EntityStore, Record, Registry, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Read access to a set of entity tables. The shared store implements this
/// directly; sessions implement it over a snapshot overlaid with their own
/// uncommitted writes.
pub trait StoreView {
    /// All live records of a type, in key order.
    fn scan(&self, entity: &str) -> Result<Vec<(u64, Record)>>;
    /// One record by key; `None` when absent.
    fn get(&self, entity: &str, key: u64) -> Result<Option<Record>>;
}

impl StoreView for EntityStore {
    fn scan(&self, entity: &str) -> Result<Vec<(u64, Record)>> {
        Ok(EntityStore::scan(self, entity)?
            .map(|(k, r)| (k, r.clone()))
            .collect())
    }

    fn get(&self, entity: &str, key: u64) -> Result<Option<Record>> {
        Ok(EntityStore::get(self, entity, key)?.cloned())
    }
}

/// One alias bound to a concrete record.
#[derive(Debug, Clone)]
pub(crate) struct Binding {
    pub entity: String,
    pub key: u64,
    pub record: Record,
}

/// All alias bindings for one result row.
pub(crate) type Bindings = BTreeMap<String, Binding>;

/// Evaluates select queries against a registry and a store view.
pub struct QueryExecutor<'a> {
    registry: &'a Registry,
    view: &'a dyn StoreView,
}

impl<'a> QueryExecutor<'a> {
    pub fn new(registry: &'a Registry, view: &'a dyn StoreView) -> Self {
        Self { registry, view }
    }

    /// Run a query to completion.
    pub fn run(&self, query: &SelectQuery) -> Result<QueryOutput> {
        self.run_with(query, &[])
    }

    fn run_with(&self, query: &SelectQuery, outer: &[&Bindings]) -> Result<QueryOutput> {
        let rows = self.bind_rows(query, outer)?;

        let aggregated = !query.group_by.is_empty()
            || matches!(&query.projection, Projection::Tuple(items)
                if items.iter().any(|i| matches!(i, SelectExpr::CountStar | SelectExpr::Count(_))));

        let mut output = if aggregated {
            self.aggregate(query, &rows, outer)?
        } else {
            self.project(query, &rows, outer)?
        };

        if let Some(page) = query.page {
            let skip = (page.page_number - 1) * page.page_size;
            match &mut output {
                QueryOutput::Entities { rows, .. } => {
                    *rows = rows
                        .drain(..)
                        .skip(skip)
                        .take(page.page_size)
                        .collect();
                }
                QueryOutput::Tuples { rows, .. } => {
                    *rows = rows
                        .drain(..)
                        .skip(skip)
                        .take(page.page_size)
                        .collect();
                }
            }
        }
        Ok(output)
    }

    /// Scan the root entity, apply joins and the filter. Inner join
    /// semantics: a null or dangling relationship drops the row.
    fn bind_rows(&self, query: &SelectQuery, outer: &[&Bindings]) -> Result<Vec<Bindings>> {
        let mut rows: Vec<Bindings> = Vec::new();
        for (key, record) in self.view.scan(&query.entity)? {
            let mut bindings = Bindings::new();
            bindings.insert(
                query.alias.clone(),
                Binding {
                    entity: query.entity.clone(),
                    key,
                    record,
                },
            );
            rows.push(bindings);
        }

        for step in &query.joins {
            rows = self.apply_join(step, rows)?;
        }

        if let Some(filter) = &query.filter {
            let mut kept = Vec::with_capacity(rows.len());
            for row in rows {
                let mut frames: Vec<&Bindings> = outer.to_vec();
                frames.push(&row);
                if self.eval_predicate(filter, &frames)? {
                    kept.push(row);
                }
            }
            rows = kept;
        }
        Ok(rows)
    }

    fn apply_join(&self, step: &JoinStep, rows: Vec<Bindings>) -> Result<Vec<Bindings>> {
        let mut joined = Vec::with_capacity(rows.len());
        for mut row in rows {
            let source = row.get(&step.source_alias).ok_or_else(|| {
                Error::syntax(format!("unknown alias: {}", step.source_alias))
            })?;
            let descriptor = self.registry.descriptor(&source.entity)?;
            let index = descriptor.field_index(&step.field).ok_or_else(|| {
                Error::syntax(format!("{} has no field {}", source.entity, step.field))
            })?;
            let target_key = match source.record.values[index] {
                Value::Key(k) => k,
                _ => continue, // null link: inner join drops the row
            };
            match self.view.get(&step.target_entity, target_key)? {
                Some(record) => {
                    row.insert(
                        step.alias.clone(),
                        Binding {
                            entity: step.target_entity.clone(),
                            key: target_key,
                            record,
                        },
                    );
                    joined.push(row);
                }
                None => {} // dangling reference: dropped, like the null case
            }
        }
        Ok(joined)
    }

    fn project(
        &self,
        query: &SelectQuery,
        rows: &[Bindings],
        outer: &[&Bindings],
    ) -> Result<QueryOutput> {
        match &query.projection {
            Projection::Entity(alias) => {
                let entity = self.entity_of_alias(query, alias)?;
                let descriptor = self.registry.descriptor(&entity)?;
                let mut columns = vec![descriptor.key_field.clone()];
                columns.extend(descriptor.fields.iter().map(|f| f.name.clone()));

                let mut out = Vec::with_capacity(rows.len());
                for row in rows {
                    let binding = row
                        .get(alias)
                        .ok_or_else(|| Error::syntax(format!("unknown alias: {}", alias)))?;
                    out.push((binding.key, binding.record.clone()));
                }
                Ok(QueryOutput::Entities {
                    entity,
                    columns,
                    rows: out,
                })
            }
            Projection::Tuple(items) => {
                let columns = tuple_columns(items);
                let mut out = Vec::with_capacity(rows.len());
                for row in rows {
                    let mut frames: Vec<&Bindings> = outer.to_vec();
                    frames.push(row);
                    let mut tuple = Vec::with_capacity(items.len());
                    for item in items {
                        match item {
                            SelectExpr::Scalar(expr) => {
                                tuple.push(self.eval_scalar(expr, &frames)?)
                            }
                            _ => {
                                return Err(Error::syntax(
                                    "COUNT requires aggregation",
                                ));
                            }
                        }
                    }
                    out.push(tuple);
                }
                Ok(QueryOutput::Tuples { columns, rows: out })
            }
        }
    }

    /// Group rows and evaluate aggregate projections. Groups come out in
    /// first-seen order, which is key order of the underlying scan.
    fn aggregate(
        &self,
        query: &SelectQuery,
        rows: &[Bindings],
        outer: &[&Bindings],
    ) -> Result<QueryOutput> {
        let items = match &query.projection {
            Projection::Tuple(items) => items,
            Projection::Entity(_) => {
                return Err(Error::syntax(
                    "GROUP BY requires projected expressions, not a whole entity",
                ));
            }
        };

        let mut group_keys: Vec<Vec<Value>> = Vec::new();
        let mut groups: Vec<Vec<&Bindings>> = Vec::new();
        for row in rows {
            let mut frames: Vec<&Bindings> = outer.to_vec();
            frames.push(row);
            let key = query
                .group_by
                .iter()
                .map(|e| self.eval_scalar(e, &frames))
                .collect::<Result<Vec<_>>>()?;
            match group_keys.iter().position(|k| *k == key) {
                Some(i) => groups[i].push(row),
                None => {
                    group_keys.push(key);
                    groups.push(vec![row]);
                }
            }
        }
        // A global aggregate over no rows still yields one row (count 0)
        if groups.is_empty() && query.group_by.is_empty() {
            group_keys.push(Vec::new());
            groups.push(Vec::new());
        }

        let columns = tuple_columns(items);
        let mut out = Vec::with_capacity(groups.len());
        for group in &groups {
            let mut tuple = Vec::with_capacity(items.len());
            for item in items {
                let value = match item {
                    SelectExpr::CountStar => Value::Integer(group.len() as i64),
                    SelectExpr::Count(expr) => {
                        let mut count = 0i64;
                        for &row in group {
                            let mut frames: Vec<&Bindings> = outer.to_vec();
                            frames.push(row);
                            if self.eval_scalar(expr, &frames)? != Value::Null {
                                count += 1;
                            }
                        }
                        Value::Integer(count)
                    }
                    SelectExpr::Scalar(expr) => {
                        // The builder only accepts grouped expressions here,
                        // so every row of the group yields the same value;
                        // the first row stands in for all of them.
                        match group.first() {
                            Some(&row) => {
                                let mut frames: Vec<&Bindings> = outer.to_vec();
                                frames.push(row);
                                self.eval_scalar(expr, &frames)?
                            }
                            None => Value::Null,
                        }
                    }
                };
                tuple.push(value);
            }
            out.push(tuple);
        }
        Ok(QueryOutput::Tuples { columns, rows: out })
    }

    fn entity_of_alias(&self, query: &SelectQuery, alias: &str) -> Result<String> {
        if alias == query.alias {
            return Ok(query.entity.clone());
        }
        query
            .joins
            .iter()
            .find(|j| j.alias == alias)
            .map(|j| j.target_entity.clone())
            .ok_or_else(|| Error::syntax(format!("unknown alias: {}", alias)))
    }

    /// True when the subquery yields at least one row for the given outer
    /// bindings.
    fn exists(&self, query: &SelectQuery, outer: &[&Bindings]) -> Result<bool> {
        Ok(!self.bind_rows(query, outer)?.is_empty())
    }

    pub(crate) fn eval_predicate(
        &self,
        predicate: &Predicate,
        frames: &[&Bindings],
    ) -> Result<bool> {
        match predicate {
            Predicate::Cmp { op, lhs, rhs } => {
                let lhs = self.eval_scalar(lhs, frames)?;
                let rhs = self.eval_scalar(rhs, frames)?;
                // Null or incomparable operands never match
                Ok(match lhs.compare(&rhs) {
                    Some(ordering) => match op {
                        CmpOp::Eq => ordering == Ordering::Equal,
                        CmpOp::NotEq => ordering != Ordering::Equal,
                        CmpOp::Lt => ordering == Ordering::Less,
                        CmpOp::LtEq => ordering != Ordering::Greater,
                        CmpOp::Gt => ordering == Ordering::Greater,
                        CmpOp::GtEq => ordering != Ordering::Less,
                    },
                    None => false,
                })
            }
            Predicate::Between {
                expr,
                low,
                high,
                negated,
            } => {
                let value = self.eval_scalar(expr, frames)?;
                let low = self.eval_scalar(low, frames)?;
                let high = self.eval_scalar(high, frames)?;
                match (value.compare(&low), value.compare(&high)) {
                    (Some(lo), Some(hi)) => {
                        let inside = lo != Ordering::Less && hi != Ordering::Greater;
                        Ok(inside != *negated)
                    }
                    _ => Ok(false),
                }
            }
            Predicate::IsNull { expr, negated } => {
                let is_null = self.eval_scalar(expr, frames)? == Value::Null;
                Ok(is_null != *negated)
            }
            Predicate::And(lhs, rhs) => {
                Ok(self.eval_predicate(lhs, frames)? && self.eval_predicate(rhs, frames)?)
            }
            Predicate::Or(lhs, rhs) => {
                Ok(self.eval_predicate(lhs, frames)? || self.eval_predicate(rhs, frames)?)
            }
            Predicate::Not(inner) => Ok(!self.eval_predicate(inner, frames)?),
            Predicate::Exists { negated, query } => {
                Ok(self.exists(query, frames)? != *negated)
            }
        }
    }

    pub(crate) fn eval_scalar(&self, expr: &ScalarExpr, frames: &[&Bindings]) -> Result<Value> {
        match expr {
            ScalarExpr::Field { alias, field } => {
                let binding = lookup(frames, alias)?;
                let descriptor = self.registry.descriptor(&binding.entity)?;
                let index = descriptor.field_index(field).ok_or_else(|| {
                    Error::syntax(format!("{} has no field {}", binding.entity, field))
                })?;
                Ok(binding.record.values[index].clone())
            }
            ScalarExpr::KeyOf(alias) => Ok(Value::Key(lookup(frames, alias)?.key)),
            ScalarExpr::Literal(value) => Ok(value.clone()),
            ScalarExpr::Arith { op, lhs, rhs } => {
                let lhs = self.eval_scalar(lhs, frames)?;
                let rhs = self.eval_scalar(rhs, frames)?;
                lhs.arith(*op, &rhs).ok_or_else(|| {
                    Error::validation(format!(
                        "cannot compute {} {:?} {}",
                        lhs, op, rhs
                    ))
                })
            }
            ScalarExpr::Case {
                branches,
                otherwise,
            } => {
                for (condition, result) in branches {
                    if self.eval_predicate(condition, frames)? {
                        return self.eval_scalar(result, frames);
                    }
                }
                self.eval_scalar(otherwise, frames)
            }
        }
    }
}

/// Find an alias binding, innermost frame first.
fn lookup<'b>(frames: &[&'b Bindings], alias: &str) -> Result<&'b Binding> {
    frames
        .iter()
        .rev()
        .find_map(|bindings| bindings.get(alias))
        .ok_or_else(|| Error::syntax(format!("unknown alias: {}", alias)))
}

fn tuple_columns(items: &[SelectExpr]) -> Vec<String> {
    items
        .iter()
        .map(|item| match item {
            SelectExpr::Scalar(ScalarExpr::Field { field, .. }) => field.clone(),
            SelectExpr::Scalar(ScalarExpr::KeyOf(alias)) => alias.clone(),
            SelectExpr::Scalar(ScalarExpr::Case { .. }) => "case".to_string(),
            SelectExpr::Scalar(_) => "expr".to_string(),
            SelectExpr::CountStar | SelectExpr::Count(_) => "count".to_string(),
        })
        .collect()
}

/// The result of a select query.
#[derive(Debug, Clone)]
pub enum QueryOutput {
    /// Whole-entity results, keyed records of one type.
    Entities {
        entity: String,
        columns: Vec<String>,
        rows: Vec<(u64, Record)>,
    },
    /// Projected tuple results.
    Tuples {
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
    },
}

impl QueryOutput {
    pub fn len(&self) -> usize {
        match self {
            QueryOutput::Entities { rows, .. } => rows.len(),
            QueryOutput::Tuples { rows, .. } => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The single value of a single-row, single-column result, the way a
    /// COUNT query is usually consumed.
    pub fn unique_result(&self) -> Result<Value> {
        match self {
            QueryOutput::Tuples { rows, .. } if rows.len() == 1 && rows[0].len() == 1 => {
                Ok(rows[0][0].clone())
            }
            QueryOutput::Tuples { rows, .. } => Err(Error::validation(format!(
                "expected exactly one value, got {} rows",
                rows.len()
            ))),
            QueryOutput::Entities { .. } => Err(Error::validation(
                "expected a scalar result, got entities",
            )),
        }
    }

    /// Render as a bordered text table.
    pub fn format(&self) -> String {
        let (columns, rows) = match self {
            QueryOutput::Entities { columns, rows, .. } => {
                let rendered = rows
                    .iter()
                    .map(|(key, record)| {
                        let mut cells = vec![key.to_string()];
                        cells.extend(record.values.iter().map(|v| v.to_string()));
                        cells
                    })
                    .collect::<Vec<_>>();
                (columns.clone(), rendered)
            }
            QueryOutput::Tuples { columns, rows } => {
                let rendered = rows
                    .iter()
                    .map(|row| row.iter().map(|v| v.to_string()).collect::<Vec<_>>())
                    .collect::<Vec<_>>();
                (columns.clone(), rendered)
            }
        };

        let mut widths: Vec<usize> = columns.iter().map(|c| c.len()).collect();
        for row in &rows {
            for (i, cell) in row.iter().enumerate() {
                if cell.len() > widths[i] {
                    widths[i] = cell.len();
                }
            }
        }

        let separator = {
            let mut line = String::from("+");
            for width in &widths {
                line.push_str(&"-".repeat(width + 2));
                line.push('+');
            }
            line
        };
        let render_row = |cells: &[String]| {
            let mut line = String::from("|");
            for (cell, width) in cells.iter().zip(&widths) {
                line.push_str(&format!(" {:<width$} |", cell, width = width));
            }
            line
        };

        let mut out = String::new();
        out.push_str(&separator);
        out.push('\n');
        out.push_str(&render_row(&columns));
        out.push('\n');
        out.push_str(&separator);
        out.push('\n');
        for row in &rows {
            out.push_str(&render_row(row));
            out.push('\n');
        }
        out.push_str(&separator);
        out.push_str(&format!("\n{} row(s)\n", rows.len()));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::parser::QueryBuilder;
    use std::sync::Arc;

    fn seeded_store() -> EntityStore {
        let registry = Arc::new(Registry::employee_department());
        let mut store = EntityStore::new(registry);
        let it = store
            .insert("Department", Record::new(vec![Value::text("IT")]))
            .unwrap();
        let hr = store
            .insert("Department", Record::new(vec![Value::text("HR")]))
            .unwrap();
        for (name, salary, dept) in [
            ("Ann", 80_000.0, Some(it)),
            ("Bob", 60_000.0, Some(it)),
            ("Cid", 20_000.0, Some(hr)),
            ("Dee", 70_000.0, None),
        ] {
            let dept = dept.map(Value::Key).unwrap_or(Value::Null);
            store
                .insert(
                    "Employee",
                    Record::new(vec![Value::text(name), Value::float(salary), dept]),
                )
                .unwrap();
        }
        store
    }

    fn run(store: &EntityStore, hql: &str) -> QueryOutput {
        let registry = store.registry().clone();
        let query = QueryBuilder::new(&registry).build_select(hql).unwrap();
        QueryExecutor::new(&registry, store).run(&query).unwrap()
    }

    fn tuples(output: QueryOutput) -> Vec<Vec<Value>> {
        match output {
            QueryOutput::Tuples { rows, .. } => rows,
            other => panic!("expected tuples, got {:?}", other),
        }
    }

    #[test]
    fn test_entity_scan_in_key_order() {
        let store = seeded_store();
        match run(&store, "FROM Employee") {
            QueryOutput::Entities { entity, rows, .. } => {
                assert_eq!(entity, "Employee");
                let keys: Vec<u64> = rows.iter().map(|(k, _)| *k).collect();
                assert_eq!(keys, vec![1, 2, 3, 4]);
            }
            other => panic!("expected entities, got {:?}", other),
        }
    }

    #[test]
    fn test_filter_and_projection() {
        let store = seeded_store();
        let rows = tuples(run(
            &store,
            "SELECT e.name FROM Employee e WHERE e.salary > 60000",
        ));
        assert_eq!(
            rows,
            vec![vec![Value::text("Ann")], vec![Value::text("Dee")]]
        );
    }

    #[test]
    fn test_inner_join_drops_null_links() {
        let store = seeded_store();
        let rows = tuples(run(
            &store,
            "SELECT e.name, d.name FROM Employee e JOIN e.department d",
        ));
        // Dee has no department and is dropped
        assert_eq!(
            rows,
            vec![
                vec![Value::text("Ann"), Value::text("IT")],
                vec![Value::text("Bob"), Value::text("IT")],
                vec![Value::text("Cid"), Value::text("HR")],
            ]
        );
    }

    #[test]
    fn test_count_star_and_count_field() {
        let store = seeded_store();
        let count = run(&store, "SELECT COUNT(*) FROM Employee e")
            .unique_result()
            .unwrap();
        assert_eq!(count, Value::Integer(4));

        // COUNT over the nullable relationship field skips nulls
        let count = run(&store, "SELECT COUNT(e.department) FROM Employee e")
            .unique_result()
            .unwrap();
        assert_eq!(count, Value::Integer(3));
    }

    #[test]
    fn test_count_over_empty_scan_is_zero() {
        let registry = Arc::new(Registry::employee_department());
        let store = EntityStore::new(registry);
        let count = run(&store, "SELECT COUNT(e) FROM Employee e")
            .unique_result()
            .unwrap();
        assert_eq!(count, Value::Integer(0));
    }

    #[test]
    fn test_group_by_department() {
        let store = seeded_store();
        let rows = tuples(run(
            &store,
            "SELECT d.name, COUNT(e) FROM Employee e JOIN e.department d GROUP BY d.name",
        ));
        assert_eq!(
            rows,
            vec![
                vec![Value::text("IT"), Value::Integer(2)],
                vec![Value::text("HR"), Value::Integer(1)],
            ]
        );
    }

    #[test]
    fn test_case_expression_buckets() {
        let store = seeded_store();
        let rows = tuples(run(
            &store,
            "SELECT e.name, \
             CASE WHEN e.salary > 70000 THEN 'High' \
                  WHEN e.salary BETWEEN 50000 AND 70000 THEN 'Medium' \
                  ELSE 'Low' END \
             FROM Employee e",
        ));
        assert_eq!(
            rows,
            vec![
                vec![Value::text("Ann"), Value::text("High")],
                vec![Value::text("Bob"), Value::text("Medium")],
                vec![Value::text("Cid"), Value::text("Low")],
                vec![Value::text("Dee"), Value::text("Medium")],
            ]
        );
    }

    #[test]
    fn test_not_exists_is_correlated() {
        let store = seeded_store();
        // Employees whose department link does not resolve to a department
        match run(
            &store,
            "SELECT e FROM Employee e \
             WHERE NOT EXISTS (SELECT d FROM Department d WHERE d = e.department)",
        ) {
            QueryOutput::Entities { rows, .. } => {
                assert_eq!(rows.len(), 1);
                assert_eq!(rows[0].1.values[0], Value::text("Dee"));
            }
            other => panic!("expected entities, got {:?}", other),
        }
    }

    #[test]
    fn test_pagination_windows() {
        let registry = Arc::new(Registry::employee_department());
        let mut store = EntityStore::new(registry);
        for i in 1..=7 {
            store
                .insert(
                    "Employee",
                    Record::new(vec![
                        Value::text(format!("e{}", i)),
                        Value::float(1000.0 * i as f64),
                        Value::Null,
                    ]),
                )
                .unwrap();
        }

        let registry = store.registry().clone();
        let query = QueryBuilder::new(&registry)
            .build_select("FROM Employee")
            .unwrap();

        let page2 = QueryExecutor::new(&registry, &store)
            .run(&query.clone().page(2, 3).unwrap())
            .unwrap();
        match page2 {
            QueryOutput::Entities { rows, .. } => {
                let keys: Vec<u64> = rows.iter().map(|(k, _)| *k).collect();
                assert_eq!(keys, vec![4, 5, 6]);
            }
            other => panic!("expected entities, got {:?}", other),
        }

        // Last, partial page
        let page3 = QueryExecutor::new(&registry, &store)
            .run(&query.clone().page(3, 3).unwrap())
            .unwrap();
        assert_eq!(page3.len(), 1);

        // Past the end: empty, not an error
        let page9 = QueryExecutor::new(&registry, &store)
            .run(&query.page(9, 3).unwrap())
            .unwrap();
        assert!(page9.is_empty());
    }

    #[test]
    fn test_unique_result_rejects_many_rows() {
        let store = seeded_store();
        let output = run(&store, "SELECT e.name FROM Employee e");
        assert!(matches!(
            output.unique_result(),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_format_renders_bordered_table() {
        let store = seeded_store();
        let text = run(&store, "SELECT e.name FROM Employee e WHERE e.salary > 75000").format();
        assert!(text.contains("| name |"));
        assert!(text.contains("| Ann  |"));
        assert!(text.contains("1 row(s)"));
    }
}
