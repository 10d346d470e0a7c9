// HQL parser
// Converts HQL-style query strings into validated query trees. We use the
// sqlparser crate for the raw grammar and translate its AST against the
// entity registry, so unknown entities, fields and aliases fail when the
// query is BUILT, not when it runs.
//
// The accepted language is the entity-oriented HQL subset:
//   FROM Employee
//   SELECT e.name, d.name FROM Employee e JOIN e.department d
//   SELECT COUNT(e) FROM Employee e
//   SELECT d.name, COUNT(e) ... GROUP BY d.name
//   SELECT ... CASE WHEN ... THEN ... ELSE ... END ...
//   ... WHERE NOT EXISTS (SELECT d FROM Department d WHERE d = e.department)
//   UPDATE Employee e SET e.salary = e.salary * 1.1
//   DELETE Employee WHERE id = 2
// Joins traverse declared relationships (JOIN e.department d); there is no
// ON clause. A bare `FROM X` and the FROM-less DELETE are normalized into
// plain SQL before parsing.

use crate::error::{Error, Result};
use crate::storage::{ArithOp, Registry, Value};
use sqlparser::ast::{
    self, BinaryOperator, Expr, FunctionArg, FunctionArgExpr, FunctionArguments, GroupByExpr,
    SelectItem, SetExpr, TableFactor, UnaryOperator, Value as SqlValue,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

/// A parsed, registry-validated statement.
#[derive(Debug, Clone)]
pub enum Statement {
    Select(SelectQuery),
    Update(UpdateStatement),
    Delete(DeleteStatement),
}

/// A validated select query, ready for evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectQuery {
    /// Root entity and its alias.
    pub entity: String,
    pub alias: String,
    /// Relationship joins, in application order.
    pub joins: Vec<JoinStep>,
    pub projection: Projection,
    pub filter: Option<Predicate>,
    pub group_by: Vec<ScalarExpr>,
    pub page: Option<PageSpec>,
}

impl SelectQuery {
    /// Restrict the result to one page. Page numbers are 1-based:
    /// `skip = (page_number - 1) * page_size`, `take = page_size`.
    /// A page number or size below 1 is rejected rather than clamped.
    pub fn page(mut self, page_number: usize, page_size: usize) -> Result<Self> {
        if page_number < 1 {
            return Err(Error::syntax("page number must be >= 1"));
        }
        if page_size < 1 {
            return Err(Error::syntax("page size must be >= 1"));
        }
        self.page = Some(PageSpec {
            page_number,
            page_size,
        });
        Ok(self)
    }
}

/// One relationship traversal: bind `alias` to the record reached from
/// `source_alias` through the many-to-one `field`. Inner semantics: rows
/// whose link is null (or dangling) are dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinStep {
    pub source_alias: String,
    pub field: String,
    pub target_entity: String,
    pub alias: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    /// Whole entities of the given alias (`FROM Employee`, `SELECT e ...`).
    Entity(String),
    /// An ordered list of projected expressions.
    Tuple(Vec<SelectExpr>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectExpr {
    Scalar(ScalarExpr),
    /// COUNT(*): number of rows in the group.
    CountStar,
    /// COUNT(expr): rows where expr is non-null. COUNT(alias) arrives here
    /// as a count over the alias key.
    Count(ScalarExpr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScalarExpr {
    /// A field of a bound alias.
    Field { alias: String, field: String },
    /// An alias used as a value: the bound row's surrogate key.
    KeyOf(String),
    Literal(Value),
    Arith {
        op: ArithOp,
        lhs: Box<ScalarExpr>,
        rhs: Box<ScalarExpr>,
    },
    /// Searched CASE: branches tried top to bottom, first match wins.
    Case {
        branches: Vec<(Predicate, ScalarExpr)>,
        otherwise: Box<ScalarExpr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Cmp {
        op: CmpOp,
        lhs: ScalarExpr,
        rhs: ScalarExpr,
    },
    /// Inclusive on both ends, like SQL BETWEEN.
    Between {
        expr: ScalarExpr,
        low: ScalarExpr,
        high: ScalarExpr,
        negated: bool,
    },
    IsNull {
        expr: ScalarExpr,
        negated: bool,
    },
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
    Not(Box<Predicate>),
    /// Correlated existence check, evaluated per outer row.
    Exists {
        negated: bool,
        query: Box<SelectQuery>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageSpec {
    pub page_number: usize,
    pub page_size: usize,
}

/// A validated set-based update.
#[derive(Debug, Clone)]
pub struct UpdateStatement {
    pub entity: String,
    pub alias: String,
    /// (field name, value expression); the expression may read the record's
    /// own prior field values.
    pub assignments: Vec<(String, ScalarExpr)>,
    pub filter: Option<Predicate>,
}

/// A validated set-based delete.
#[derive(Debug, Clone)]
pub struct DeleteStatement {
    pub entity: String,
    pub alias: String,
    pub filter: Option<Predicate>,
}

/// Alias scope used during translation. Each select adds a frame; subqueries
/// see their own frame first, then the outer frames (correlation).
struct Scope<'a> {
    registry: &'a Registry,
    /// Innermost frame last. Each entry is (alias, entity).
    frames: Vec<Vec<(String, String)>>,
}

impl<'a> Scope<'a> {
    /// The entity bound to an alias, searching inner frames first.
    fn entity_of(&self, alias: &str) -> Option<&str> {
        self.frames.iter().rev().find_map(|frame| {
            frame
                .iter()
                .find(|(a, _)| a == alias)
                .map(|(_, e)| e.as_str())
        })
    }

    /// Resolve an unqualified identifier to the single in-scope alias that
    /// declares it, either as a field or as the key field.
    fn resolve_unqualified(&self, name: &str) -> Result<ScalarExpr> {
        for frame in self.frames.iter().rev() {
            let mut matches: Vec<ScalarExpr> = Vec::new();
            for (alias, entity) in frame {
                let descriptor = self.registry.descriptor(entity)?;
                if descriptor.key_field == name {
                    matches.push(ScalarExpr::KeyOf(alias.clone()));
                } else if descriptor.field_index(name).is_some() {
                    matches.push(ScalarExpr::Field {
                        alias: alias.clone(),
                        field: name.to_string(),
                    });
                }
            }
            match matches.len() {
                0 => continue,
                1 => return Ok(matches.remove(0)),
                _ => return Err(Error::syntax(format!("ambiguous field: {}", name))),
            }
        }
        Err(Error::syntax(format!("unknown field: {}", name)))
    }
}

/// Parses HQL text and validates it against the registry.
pub struct QueryBuilder<'a> {
    registry: &'a Registry,
}

impl<'a> QueryBuilder<'a> {
    pub fn new(registry: &'a Registry) -> Self {
        Self { registry }
    }

    /// Parse an HQL string into a validated statement.
    pub fn build(&self, hql: &str) -> Result<Statement> {
        let sql = normalize_hql(hql);
        let dialect = GenericDialect {};
        let ast = Parser::parse_sql(&dialect, &sql)
            .map_err(|e| Error::syntax(format!("parse error: {}", e)))?;

        if ast.len() != 1 {
            return Err(Error::syntax("expected exactly one statement"));
        }

        match &ast[0] {
            ast::Statement::Query(query) => {
                let mut scope = Scope {
                    registry: self.registry,
                    frames: Vec::new(),
                };
                Ok(Statement::Select(self.translate_query(query, &mut scope)?))
            }
            ast::Statement::Update {
                table,
                assignments,
                selection,
                ..
            } => self
                .translate_update(table, assignments, selection)
                .map(Statement::Update)
                .map_err(as_validation),
            ast::Statement::Delete(delete) => self
                .translate_delete(delete)
                .map(Statement::Delete)
                .map_err(as_validation),
            _ => Err(Error::syntax("unsupported statement")),
        }
    }

    /// Build and insist on a select.
    pub fn build_select(&self, hql: &str) -> Result<SelectQuery> {
        match self.build(hql)? {
            Statement::Select(query) => Ok(query),
            _ => Err(Error::syntax("expected a select query")),
        }
    }

    fn translate_query(&self, query: &ast::Query, scope: &mut Scope) -> Result<SelectQuery> {
        if query.order_by.is_some() {
            return Err(Error::syntax(
                "ORDER BY is not supported; results follow key order",
            ));
        }
        if query.limit.is_some() || query.offset.is_some() {
            return Err(Error::syntax(
                "LIMIT/OFFSET are not supported; use page(page_number, page_size)",
            ));
        }
        let select = match query.body.as_ref() {
            SetExpr::Select(select) => select,
            _ => return Err(Error::syntax("unsupported query form")),
        };

        if select.from.len() != 1 {
            return Err(Error::syntax("expected exactly one root entity"));
        }
        let from = &select.from[0];
        let (entity, alias) = self.root_entity(&from.relation)?;

        scope.frames.push(vec![(alias.clone(), entity.clone())]);
        let result = self.translate_select_body(select, from, &entity, &alias, scope);
        scope.frames.pop();
        result
    }

    fn translate_select_body(
        &self,
        select: &ast::Select,
        from: &ast::TableWithJoins,
        entity: &str,
        alias: &str,
        scope: &mut Scope,
    ) -> Result<SelectQuery> {
        let mut joins = Vec::new();
        for join in &from.joins {
            let step = self.translate_join(join, scope)?;
            let frame = scope
                .frames
                .last_mut()
                .ok_or_else(|| Error::syntax("no alias scope"))?;
            frame.push((step.alias.clone(), step.target_entity.clone()));
            joins.push(step);
        }

        let filter = match &select.selection {
            Some(expr) => Some(self.translate_predicate(expr, scope, &mut joins)?),
            None => None,
        };

        let group_by = match &select.group_by {
            GroupByExpr::Expressions(exprs, _) => exprs
                .iter()
                .map(|e| self.translate_scalar(e, scope, &mut joins))
                .collect::<Result<Vec<_>>>()?,
            _ => return Err(Error::syntax("unsupported GROUP BY form")),
        };

        let projection = self.translate_projection(&select.projection, alias, scope, &mut joins)?;

        // An aggregate without GROUP BY collapses to one row, so it cannot
        // be mixed with per-row expressions
        if group_by.is_empty() {
            if let Projection::Tuple(items) = &projection {
                let has_count = items
                    .iter()
                    .any(|i| matches!(i, SelectExpr::CountStar | SelectExpr::Count(_)));
                if has_count && items.len() > 1 {
                    return Err(Error::syntax(
                        "COUNT without GROUP BY must be the only projected expression",
                    ));
                }
            }
        } else {
            // Under GROUP BY every non-aggregate projection must be one of
            // the grouped expressions, otherwise its per-group value would
            // be ambiguous
            match &projection {
                Projection::Tuple(items) => {
                    for item in items {
                        if let SelectExpr::Scalar(expr) = item {
                            if !group_by.contains(expr) {
                                return Err(Error::syntax(
                                    "projected expressions must appear in GROUP BY or be aggregates",
                                ));
                            }
                        }
                    }
                }
                Projection::Entity(_) => {
                    return Err(Error::syntax(
                        "GROUP BY requires projected expressions, not a whole entity",
                    ));
                }
            }
        }

        Ok(SelectQuery {
            entity: entity.to_string(),
            alias: alias.to_string(),
            joins,
            projection,
            filter,
            group_by,
            page: None,
        })
    }

    /// Root of the FROM clause: a bare entity name with an optional alias.
    fn root_entity(&self, relation: &TableFactor) -> Result<(String, String)> {
        match relation {
            TableFactor::Table { name, alias, .. } => {
                if name.0.len() != 1 {
                    return Err(Error::syntax(format!(
                        "expected an entity name, got {}",
                        name
                    )));
                }
                let entity = name.0[0].value.clone();
                self.registry.descriptor(&entity)?;
                let alias = alias
                    .as_ref()
                    .map(|a| a.name.value.clone())
                    .unwrap_or_else(|| entity.clone());
                Ok((entity, alias))
            }
            _ => Err(Error::syntax("unsupported FROM clause")),
        }
    }

    /// `JOIN e.department d`: a relationship path, no ON clause.
    fn translate_join(&self, join: &ast::Join, scope: &Scope) -> Result<JoinStep> {
        match &join.join_operator {
            ast::JoinOperator::Inner(ast::JoinConstraint::None) => {}
            ast::JoinOperator::Inner(_) => {
                return Err(Error::syntax("relationship joins take no ON/USING clause"));
            }
            _ => return Err(Error::syntax("only inner relationship joins are supported")),
        }
        match &join.relation {
            TableFactor::Table { name, alias, .. } => {
                if name.0.len() != 2 {
                    return Err(Error::syntax(
                        "joins must traverse a relationship path (alias.field)",
                    ));
                }
                let source_alias = name.0[0].value.clone();
                let field = name.0[1].value.clone();
                let source_entity = scope
                    .entity_of(&source_alias)
                    .ok_or_else(|| Error::syntax(format!("unknown alias: {}", source_alias)))?
                    .to_string();
                let descriptor = self.registry.descriptor(&source_entity)?;
                let target = descriptor.many_to_one_target(&field).ok_or_else(|| {
                    Error::syntax(format!(
                        "{} has no many-to-one relationship {}",
                        source_entity, field
                    ))
                })?;
                let alias = alias
                    .as_ref()
                    .map(|a| a.name.value.clone())
                    .unwrap_or_else(|| field.clone());
                Ok(JoinStep {
                    source_alias,
                    field,
                    target_entity: target.to_string(),
                    alias,
                })
            }
            _ => Err(Error::syntax("unsupported join form")),
        }
    }

    fn translate_projection(
        &self,
        items: &[SelectItem],
        root_alias: &str,
        scope: &mut Scope,
        joins: &mut Vec<JoinStep>,
    ) -> Result<Projection> {
        // Whole-entity projections: `SELECT *` and `SELECT e`
        if items.len() == 1 {
            match &items[0] {
                SelectItem::Wildcard(_) => {
                    return Ok(Projection::Entity(root_alias.to_string()));
                }
                SelectItem::UnnamedExpr(Expr::Identifier(ident))
                    if scope.entity_of(&ident.value).is_some() =>
                {
                    return Ok(Projection::Entity(ident.value.clone()));
                }
                _ => {}
            }
        }

        let mut exprs = Vec::with_capacity(items.len());
        for item in items {
            let expr = match item {
                SelectItem::UnnamedExpr(expr) => expr,
                SelectItem::ExprWithAlias { expr, .. } => expr,
                _ => return Err(Error::syntax("unsupported projection item")),
            };
            exprs.push(self.translate_select_expr(expr, scope, joins)?);
        }
        Ok(Projection::Tuple(exprs))
    }

    /// A projected expression: COUNT(...) or a scalar.
    fn translate_select_expr(
        &self,
        expr: &Expr,
        scope: &mut Scope,
        joins: &mut Vec<JoinStep>,
    ) -> Result<SelectExpr> {
        if let Expr::Function(func) = expr {
            let name = func.name.to_string().to_lowercase();
            if name != "count" {
                return Err(Error::syntax(format!("unsupported function: {}", name)));
            }
            let args = match &func.args {
                FunctionArguments::List(list) => &list.args,
                _ => return Err(Error::syntax("COUNT takes exactly one argument")),
            };
            if args.len() != 1 {
                return Err(Error::syntax("COUNT takes exactly one argument"));
            }
            return match &args[0] {
                FunctionArg::Unnamed(FunctionArgExpr::Wildcard) => Ok(SelectExpr::CountStar),
                FunctionArg::Unnamed(FunctionArgExpr::Expr(inner)) => Ok(SelectExpr::Count(
                    self.translate_scalar(inner, scope, joins)?,
                )),
                _ => Err(Error::syntax("unsupported COUNT argument")),
            };
        }
        Ok(SelectExpr::Scalar(self.translate_scalar(
            expr, scope, joins,
        )?))
    }

    fn translate_predicate(
        &self,
        expr: &Expr,
        scope: &mut Scope,
        joins: &mut Vec<JoinStep>,
    ) -> Result<Predicate> {
        match expr {
            Expr::BinaryOp { left, op, right } => match op {
                BinaryOperator::And => Ok(Predicate::And(
                    Box::new(self.translate_predicate(left, scope, joins)?),
                    Box::new(self.translate_predicate(right, scope, joins)?),
                )),
                BinaryOperator::Or => Ok(Predicate::Or(
                    Box::new(self.translate_predicate(left, scope, joins)?),
                    Box::new(self.translate_predicate(right, scope, joins)?),
                )),
                _ => {
                    let op = match op {
                        BinaryOperator::Eq => CmpOp::Eq,
                        BinaryOperator::NotEq => CmpOp::NotEq,
                        BinaryOperator::Lt => CmpOp::Lt,
                        BinaryOperator::LtEq => CmpOp::LtEq,
                        BinaryOperator::Gt => CmpOp::Gt,
                        BinaryOperator::GtEq => CmpOp::GtEq,
                        other => {
                            return Err(Error::syntax(format!(
                                "unsupported operator: {:?}",
                                other
                            )));
                        }
                    };
                    Ok(Predicate::Cmp {
                        op,
                        lhs: self.translate_scalar(left, scope, joins)?,
                        rhs: self.translate_scalar(right, scope, joins)?,
                    })
                }
            },
            Expr::UnaryOp {
                op: UnaryOperator::Not,
                expr,
            } => Ok(Predicate::Not(Box::new(
                self.translate_predicate(expr, scope, joins)?,
            ))),
            Expr::Nested(inner) => self.translate_predicate(inner, scope, joins),
            Expr::Between {
                expr,
                negated,
                low,
                high,
            } => Ok(Predicate::Between {
                expr: self.translate_scalar(expr, scope, joins)?,
                low: self.translate_scalar(low, scope, joins)?,
                high: self.translate_scalar(high, scope, joins)?,
                negated: *negated,
            }),
            Expr::IsNull(inner) => Ok(Predicate::IsNull {
                expr: self.translate_scalar(inner, scope, joins)?,
                negated: false,
            }),
            Expr::IsNotNull(inner) => Ok(Predicate::IsNull {
                expr: self.translate_scalar(inner, scope, joins)?,
                negated: true,
            }),
            Expr::Exists { subquery, negated } => {
                let inner = self.translate_query(subquery, scope)?;
                Ok(Predicate::Exists {
                    negated: *negated,
                    query: Box::new(inner),
                })
            }
            other => Err(Error::syntax(format!("unsupported predicate: {:?}", other))),
        }
    }

    fn translate_scalar(
        &self,
        expr: &Expr,
        scope: &mut Scope,
        joins: &mut Vec<JoinStep>,
    ) -> Result<ScalarExpr> {
        match expr {
            Expr::Identifier(ident) => {
                // An alias by itself evaluates to the row's key
                if scope.entity_of(&ident.value).is_some() {
                    return Ok(ScalarExpr::KeyOf(ident.value.clone()));
                }
                scope.resolve_unqualified(&ident.value)
            }
            Expr::CompoundIdentifier(parts) => self.translate_path(parts, scope, joins),
            Expr::Value(value) => Ok(ScalarExpr::Literal(translate_value(value)?)),
            Expr::Nested(inner) => self.translate_scalar(inner, scope, joins),
            Expr::BinaryOp { left, op, right } => {
                let op = match op {
                    BinaryOperator::Plus => ArithOp::Add,
                    BinaryOperator::Minus => ArithOp::Sub,
                    BinaryOperator::Multiply => ArithOp::Mul,
                    BinaryOperator::Divide => ArithOp::Div,
                    other => {
                        return Err(Error::syntax(format!(
                            "unsupported expression operator: {:?}",
                            other
                        )));
                    }
                };
                Ok(ScalarExpr::Arith {
                    op,
                    lhs: Box::new(self.translate_scalar(left, scope, joins)?),
                    rhs: Box::new(self.translate_scalar(right, scope, joins)?),
                })
            }
            Expr::Case {
                operand: None,
                conditions,
                results,
                else_result,
            } => {
                let mut branches = Vec::with_capacity(conditions.len());
                for (condition, result) in conditions.iter().zip(results) {
                    branches.push((
                        self.translate_predicate(condition, scope, joins)?,
                        self.translate_scalar(result, scope, joins)?,
                    ));
                }
                let otherwise = match else_result {
                    Some(expr) => self.translate_scalar(expr, scope, joins)?,
                    None => ScalarExpr::Literal(Value::Null),
                };
                Ok(ScalarExpr::Case {
                    branches,
                    otherwise: Box::new(otherwise),
                })
            }
            Expr::Case {
                operand: Some(_), ..
            } => Err(Error::syntax(
                "only searched CASE (CASE WHEN ...) is supported",
            )),
            other => Err(Error::syntax(format!(
                "unsupported expression: {:?}",
                other
            ))),
        }
    }

    /// `alias.field`, or a longer to-one path like `e.department.name`.
    /// Longer paths desugar into implicit inner joins, so dereferencing a
    /// null relationship drops the row, as join semantics require.
    fn translate_path(
        &self,
        parts: &[ast::Ident],
        scope: &mut Scope,
        joins: &mut Vec<JoinStep>,
    ) -> Result<ScalarExpr> {
        if parts.len() < 2 {
            return Err(Error::syntax("expected alias.field"));
        }
        let mut alias = parts[0].value.clone();
        let mut entity = scope
            .entity_of(&alias)
            .ok_or_else(|| Error::syntax(format!("unknown alias: {}", alias)))?
            .to_string();

        // Walk intermediate segments through many-to-one relationships
        for part in &parts[1..parts.len() - 1] {
            let descriptor = self.registry.descriptor(&entity)?;
            let target = descriptor
                .many_to_one_target(&part.value)
                .ok_or_else(|| {
                    Error::syntax(format!(
                        "{} has no many-to-one relationship {}",
                        entity, part.value
                    ))
                })?
                .to_string();

            // Reuse an existing join over the same path
            let existing = joins
                .iter()
                .find(|j| j.source_alias == alias && j.field == part.value)
                .map(|j| j.alias.clone());
            let next_alias = match existing {
                Some(a) => a,
                None => {
                    let synth = format!("{}__{}", alias, part.value);
                    joins.push(JoinStep {
                        source_alias: alias.clone(),
                        field: part.value.clone(),
                        target_entity: target.clone(),
                        alias: synth.clone(),
                    });
                    if let Some(frame) = scope.frames.last_mut() {
                        frame.push((synth.clone(), target.clone()));
                    }
                    synth
                }
            };
            alias = next_alias;
            entity = target;
        }

        let field = &parts[parts.len() - 1].value;
        let descriptor = self.registry.descriptor(&entity)?;
        if *field == descriptor.key_field {
            return Ok(ScalarExpr::KeyOf(alias));
        }
        if descriptor.field_index(field).is_none() {
            return Err(Error::syntax(format!("{} has no field {}", entity, field)));
        }
        Ok(ScalarExpr::Field {
            alias,
            field: field.clone(),
        })
    }

    fn translate_update(
        &self,
        table: &ast::TableWithJoins,
        assignments: &[ast::Assignment],
        selection: &Option<Expr>,
    ) -> Result<UpdateStatement> {
        let (entity, alias) = self.root_entity(&table.relation)?;
        let descriptor = self.registry.descriptor(&entity)?;
        let mut scope = Scope {
            registry: self.registry,
            frames: vec![vec![(alias.clone(), entity.clone())]],
        };
        let mut joins = Vec::new();

        let mut translated = Vec::with_capacity(assignments.len());
        for assignment in assignments {
            let field = match &assignment.target {
                ast::AssignmentTarget::ColumnName(name) => match name.0.as_slice() {
                    [field] => field.value.clone(),
                    [qualifier, field] if qualifier.value == alias => field.value.clone(),
                    _ => return Err(Error::syntax("unsupported assignment target")),
                },
                _ => return Err(Error::syntax("unsupported assignment target")),
            };
            if field == descriptor.key_field {
                return Err(Error::syntax("keys are immutable"));
            }
            let field_def = descriptor
                .field_def(&field)
                .ok_or_else(|| Error::syntax(format!("{} has no field {}", entity, field)))?;

            let value = self.translate_scalar(&assignment.value, &mut scope, &mut joins)?;
            // Literal assignments can be type-checked right here
            if let ScalarExpr::Literal(literal) = &value {
                let widened = literal.widen_to(&field_def.field_type);
                if !matches!(literal, Value::Null)
                    && !widened.matches_type(&field_def.field_type)
                {
                    return Err(Error::syntax(format!(
                        "cannot assign {} to {}.{}",
                        literal, entity, field
                    )));
                }
            }
            translated.push((field, value));
        }

        let filter = match selection {
            Some(expr) => Some(self.translate_predicate(expr, &mut scope, &mut joins)?),
            None => None,
        };
        if !joins.is_empty() {
            return Err(Error::syntax(
                "update statements may only reference fields of the updated entity",
            ));
        }

        Ok(UpdateStatement {
            entity,
            alias,
            assignments: translated,
            filter,
        })
    }

    fn translate_delete(&self, delete: &ast::Delete) -> Result<DeleteStatement> {
        let tables = match &delete.from {
            ast::FromTable::WithFromKeyword(tables) | ast::FromTable::WithoutKeyword(tables) => {
                tables
            }
        };
        if tables.len() != 1 {
            return Err(Error::syntax("expected exactly one entity to delete from"));
        }
        let (entity, alias) = self.root_entity(&tables[0].relation)?;
        let mut scope = Scope {
            registry: self.registry,
            frames: vec![vec![(alias.clone(), entity.clone())]],
        };
        let mut joins = Vec::new();
        let filter = match &delete.selection {
            Some(expr) => Some(self.translate_predicate(expr, &mut scope, &mut joins)?),
            None => None,
        };
        if !joins.is_empty() {
            return Err(Error::syntax(
                "delete statements may only reference fields of the deleted entity",
            ));
        }
        Ok(DeleteStatement {
            entity,
            alias,
            filter,
        })
    }
}

/// Mutation statements report bad expressions as validation errors.
fn as_validation(error: Error) -> Error {
    match error {
        Error::QuerySyntax(message) => Error::Validation(message),
        other => other,
    }
}

/// Smooth over the HQL-isms sqlparser's SQL grammar rejects.
fn normalize_hql(hql: &str) -> String {
    let trimmed = hql.trim();
    let lower = trimmed.to_lowercase();
    if lower.starts_with("from ") {
        return format!("SELECT * {}", trimmed);
    }
    if lower.starts_with("delete ") && !lower.starts_with("delete from ") {
        return format!("DELETE FROM {}", &trimmed[7..]);
    }
    trimmed.to_string()
}

/// Translate a literal, following the fixed-point decimal convention.
fn translate_value(value: &SqlValue) -> Result<Value> {
    match value {
        SqlValue::Number(n, _) => {
            if n.contains('.') {
                let parsed: f64 = n
                    .parse()
                    .map_err(|_| Error::syntax(format!("bad number: {}", n)))?;
                Ok(Value::float(parsed))
            } else {
                n.parse()
                    .map(Value::Integer)
                    .map_err(|_| Error::syntax(format!("bad number: {}", n)))
            }
        }
        SqlValue::SingleQuotedString(s) | SqlValue::DoubleQuotedString(s) => {
            Ok(Value::Text(s.clone()))
        }
        SqlValue::Boolean(b) => Ok(Value::Boolean(*b)),
        SqlValue::Null => Ok(Value::Null),
        other => Err(Error::syntax(format!("unsupported literal: {:?}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Registry {
        Registry::employee_department()
    }

    #[test]
    fn test_bare_from_is_an_entity_query() {
        let registry = registry();
        let query = QueryBuilder::new(&registry)
            .build_select("FROM Employee")
            .unwrap();
        assert_eq!(query.entity, "Employee");
        assert!(matches!(query.projection, Projection::Entity(_)));
    }

    #[test]
    fn test_relationship_join_resolves_target() {
        let registry = registry();
        let query = QueryBuilder::new(&registry)
            .build_select("SELECT e.name, d.name FROM Employee e JOIN e.department d")
            .unwrap();
        assert_eq!(query.joins.len(), 1);
        assert_eq!(query.joins[0].target_entity, "Department");
        match &query.projection {
            Projection::Tuple(items) => assert_eq!(items.len(), 2),
            other => panic!("expected tuple projection, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_field_fails_at_build_time() {
        let registry = registry();
        let err = QueryBuilder::new(&registry)
            .build("SELECT e.wages FROM Employee e")
            .unwrap_err();
        assert!(matches!(err, Error::QuerySyntax(_)));

        let err = QueryBuilder::new(&registry)
            .build("FROM Invoice")
            .unwrap_err();
        assert!(matches!(err, Error::QuerySyntax(_)));
    }

    #[test]
    fn test_unknown_join_relationship_fails() {
        let registry = registry();
        let err = QueryBuilder::new(&registry)
            .build("SELECT e.name FROM Employee e JOIN e.manager m")
            .unwrap_err();
        assert!(matches!(err, Error::QuerySyntax(_)));
    }

    #[test]
    fn test_page_validation() {
        let registry = registry();
        let query = QueryBuilder::new(&registry)
            .build_select("FROM Employee")
            .unwrap();
        assert!(query.clone().page(0, 5).is_err());
        assert!(query.clone().page(1, 0).is_err());
        let paged = query.page(2, 3).unwrap();
        let spec = paged.page.unwrap();
        assert_eq!((spec.page_number, spec.page_size), (2, 3));
    }

    #[test]
    fn test_hql_delete_without_from_is_accepted() {
        let registry = registry();
        let statement = QueryBuilder::new(&registry)
            .build("delete Employee where id = 2")
            .unwrap();
        match statement {
            Statement::Delete(delete) => {
                assert_eq!(delete.entity, "Employee");
                assert!(delete.filter.is_some());
            }
            other => panic!("expected delete, got {:?}", other),
        }
    }

    #[test]
    fn test_update_with_self_referencing_assignment() {
        let registry = registry();
        let statement = QueryBuilder::new(&registry)
            .build("update Employee e set e.salary = e.salary * 1.1")
            .unwrap();
        match statement {
            Statement::Update(update) => {
                assert_eq!(update.assignments.len(), 1);
                assert_eq!(update.assignments[0].0, "salary");
                assert!(matches!(
                    update.assignments[0].1,
                    ScalarExpr::Arith {
                        op: ArithOp::Mul,
                        ..
                    }
                ));
                assert!(update.filter.is_none());
            }
            other => panic!("expected update, got {:?}", other),
        }
    }

    #[test]
    fn test_bad_mutation_expression_is_validation_error() {
        let registry = registry();
        let err = QueryBuilder::new(&registry)
            .build("update Employee set wages = 1")
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let err = QueryBuilder::new(&registry)
            .build("update Employee set name = 42")
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_correlated_exists_sees_outer_alias() {
        let registry = registry();
        let query = QueryBuilder::new(&registry)
            .build_select(
                "SELECT e FROM Employee e \
                 WHERE NOT EXISTS (SELECT d FROM Department d WHERE d = e.department)",
            )
            .unwrap();
        match query.filter {
            Some(Predicate::Exists { negated: true, .. }) => {}
            other => panic!("expected NOT EXISTS, got {:?}", other),
        }
    }

    #[test]
    fn test_case_branches_preserve_order() {
        let registry = registry();
        let query = QueryBuilder::new(&registry)
            .build_select(
                "SELECT e.name, \
                 CASE WHEN e.salary > 70000 THEN 'High' \
                      WHEN e.salary BETWEEN 50000 AND 70000 THEN 'Medium' \
                      ELSE 'Low' END \
                 FROM Employee e",
            )
            .unwrap();
        let Projection::Tuple(items) = &query.projection else {
            panic!("expected tuple projection");
        };
        let SelectExpr::Scalar(ScalarExpr::Case { branches, .. }) = &items[1] else {
            panic!("expected CASE expression");
        };
        assert_eq!(branches.len(), 2);
        assert!(matches!(
            branches[0].0,
            Predicate::Cmp { op: CmpOp::Gt, .. }
        ));
        assert!(matches!(branches[1].0, Predicate::Between { .. }));
    }

    #[test]
    fn test_implicit_to_one_path_adds_join() {
        let registry = registry();
        let query = QueryBuilder::new(&registry)
            .build_select("SELECT e.name, e.department.name FROM Employee e")
            .unwrap();
        assert_eq!(query.joins.len(), 1);
        assert_eq!(query.joins[0].field, "department");
    }

    #[test]
    fn test_non_grouped_projection_is_rejected() {
        let registry = registry();
        // e.name is not grouped, so its per-group value would be ambiguous
        let err = QueryBuilder::new(&registry)
            .build("SELECT e.name, COUNT(e) FROM Employee e GROUP BY e.salary")
            .unwrap_err();
        assert!(matches!(err, Error::QuerySyntax(_)));

        // Projecting the grouped expression itself is fine
        let query = QueryBuilder::new(&registry)
            .build_select("SELECT e.name, COUNT(e) FROM Employee e GROUP BY e.name")
            .unwrap();
        assert_eq!(query.group_by.len(), 1);
    }

    #[test]
    fn test_count_mixed_with_fields_needs_group_by() {
        let registry = registry();
        let err = QueryBuilder::new(&registry)
            .build("SELECT e.name, COUNT(e) FROM Employee e")
            .unwrap_err();
        assert!(matches!(err, Error::QuerySyntax(_)));
    }
}
