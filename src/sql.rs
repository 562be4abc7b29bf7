use std::str::FromStr;

use sqlparser::ast::{
    self, AssignmentTarget, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement,
    TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::{
    AllocationChanges, CategoryChanges, MaintenanceChanges, MaintenanceFilter, NewUser,
    ProjectChanges, ResourceChanges, UserChanges,
};
use crate::model::*;

/// Which allocations a SELECT asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationSelector {
    All,
    Id(Ulid),
    Resource(Ulid),
    Project(Ulid),
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertCategory {
        id: Ulid,
        name: String,
        description: Option<String>,
    },
    UpdateCategory {
        id: Ulid,
        changes: CategoryChanges,
    },
    DeleteCategory {
        id: Ulid,
    },
    SelectCategories,
    InsertResource {
        id: Ulid,
        name: String,
        category_id: Option<Ulid>,
        status: Option<ResourceStatus>,
        description: Option<String>,
    },
    UpdateResource {
        id: Ulid,
        changes: ResourceChanges,
    },
    DeleteResource {
        id: Ulid,
    },
    SelectResources {
        id: Option<Ulid>,
    },
    InsertProject {
        id: Ulid,
        name: String,
        manager: Option<String>,
        status: Option<ProjectStatus>,
        description: Option<String>,
    },
    UpdateProject {
        id: Ulid,
        changes: ProjectChanges,
    },
    DeleteProject {
        id: Ulid,
    },
    SelectProjects {
        id: Option<Ulid>,
    },
    InsertUser {
        id: Ulid,
        user: NewUser,
    },
    UpdateUser {
        id: Ulid,
        changes: UserChanges,
    },
    SelectUsers,
    InsertAllocation {
        id: Ulid,
        resource_id: Ulid,
        project_id: Ulid,
        start: Ms,
        end: Ms,
        note: Option<String>,
    },
    UpdateAllocation {
        id: Ulid,
        changes: AllocationChanges,
    },
    CancelAllocation {
        id: Ulid,
    },
    DeleteAllocation {
        id: Ulid,
    },
    SelectAllocations {
        selector: AllocationSelector,
    },
    CheckConflict {
        resource_id: Ulid,
        start: Ms,
        end: Ms,
    },
    InsertMaintenance {
        id: Ulid,
        resource_id: Ulid,
        start: Ms,
        end: Ms,
        kind: Option<MaintenanceKind>,
        reason: Option<String>,
    },
    UpdateMaintenance {
        id: Ulid,
        changes: MaintenanceChanges,
    },
    DeleteMaintenance {
        id: Ulid,
    },
    SelectMaintenance {
        id: Option<Ulid>,
        filter: MaintenanceFilter,
    },
    SelectSchedule {
        resource_id: Ulid,
        start: Ms,
        end: Ms,
    },
}

impl Command {
    /// Reads only; everything else mutates state.
    pub fn is_read(&self) -> bool {
        matches!(
            self,
            Command::SelectCategories
                | Command::SelectResources { .. }
                | Command::SelectProjects { .. }
                | Command::SelectUsers
                | Command::SelectAllocations { .. }
                | Command::CheckConflict { .. }
                | Command::SelectMaintenance { .. }
                | Command::SelectSchedule { .. }
        )
    }
}

/// Column order assumed by an INSERT without a column list.
fn default_columns(table: &str) -> Option<&'static [&'static str]> {
    Some(match table {
        "categories" => &["id", "name", "description"],
        "resources" => &["id", "name", "category_id", "status", "description"],
        "projects" => &["id", "name", "manager", "status", "description"],
        "users" => &["id", "username", "password", "role", "status"],
        "allocations" => &["id", "resource_id", "project_id", "start", "end", "note"],
        "maintenance_windows" => &["id", "resource_id", "start", "end", "kind", "reason"],
        _ => return None,
    })
}

/// `type` is accepted for the maintenance kind column.
fn canonical_column(table: &str, column: String) -> String {
    if table == "maintenance_windows" && column == "type" {
        "kind".into()
    } else {
        column
    }
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// One VALUES row addressed by column name.
struct Row<'a> {
    columns: Vec<String>,
    values: &'a [Expr],
}

impl<'a> Row<'a> {
    fn get(&self, column: &str) -> Option<&'a Expr> {
        let values = self.values;
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| values.get(i))
    }

    fn required(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(column))
    }

    /// Caller-supplied id, or a fresh one when the column is omitted.
    fn id(&self) -> Result<Ulid, SqlError> {
        match self.get("id") {
            Some(expr) => parse_ulid(expr),
            None => Ok(Ulid::new()),
        }
    }

    fn ulid(&self, column: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid(self.required(column)?)
    }

    fn opt_ulid(&self, column: &str) -> Result<Option<Ulid>, SqlError> {
        self.get(column).map_or(Ok(None), parse_ulid_or_null)
    }

    fn i64(&self, column: &'static str) -> Result<i64, SqlError> {
        parse_i64(self.required(column)?)
    }

    fn text(&self, column: &'static str) -> Result<String, SqlError> {
        parse_text(self.required(column)?)
    }

    fn opt_text(&self, column: &str) -> Result<Option<String>, SqlError> {
        self.get(column).map_or(Ok(None), parse_text_or_null)
    }

    fn opt_label<T>(&self, column: &str) -> Result<Option<T>, SqlError>
    where
        T: FromStr<Err = UnknownVariant>,
    {
        match self.opt_text(column)? {
            Some(label) => Ok(Some(parse_label(&label)?)),
            None => Ok(None),
        }
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let defaults = default_columns(&table).ok_or_else(|| SqlError::UnknownTable(table.clone()))?;
    let values = extract_insert_values(insert)?;

    let columns: Vec<String> = if insert.columns.is_empty() {
        defaults.iter().map(|c| c.to_string()).collect()
    } else {
        insert
            .columns
            .iter()
            .map(|c| canonical_column(&table, c.value.to_lowercase()))
            .collect()
    };
    if let Some(unknown) = columns.iter().find(|c| !defaults.contains(&c.as_str())) {
        return Err(SqlError::UnknownColumn(unknown.clone()));
    }
    if values.len() != columns.len() {
        return Err(SqlError::WrongArity(columns.len(), values.len()));
    }
    let row = Row { columns, values };

    match table.as_str() {
        "categories" => Ok(Command::InsertCategory {
            id: row.id()?,
            name: row.text("name")?,
            description: row.opt_text("description")?,
        }),
        "resources" => Ok(Command::InsertResource {
            id: row.id()?,
            name: row.text("name")?,
            category_id: row.opt_ulid("category_id")?,
            status: row.opt_label("status")?,
            description: row.opt_text("description")?,
        }),
        "projects" => Ok(Command::InsertProject {
            id: row.id()?,
            name: row.text("name")?,
            manager: row.opt_text("manager")?,
            status: row.opt_label("status")?,
            description: row.opt_text("description")?,
        }),
        "users" => Ok(Command::InsertUser {
            id: row.id()?,
            user: NewUser {
                username: row.text("username")?,
                password: row.text("password")?,
                role: row.opt_label("role")?,
                status: row.opt_label("status")?,
            },
        }),
        "allocations" => Ok(Command::InsertAllocation {
            id: row.id()?,
            resource_id: row.ulid("resource_id")?,
            project_id: row.ulid("project_id")?,
            start: row.i64("start")?,
            end: row.i64("end")?,
            note: row.opt_text("note")?,
        }),
        "maintenance_windows" => Ok(Command::InsertMaintenance {
            id: row.id()?,
            resource_id: row.ulid("resource_id")?,
            start: row.i64("start")?,
            end: row.i64("end")?,
            kind: row.opt_label("kind")?,
            reason: row.opt_text("reason")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    let id = extract_where_id(selection)?;

    let mut set: Vec<(String, &Expr)> = Vec::with_capacity(assignments.len());
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name)
                .ok_or_else(|| SqlError::Parse("empty column name".into()))?,
            AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            }
        };
        set.push((canonical_column(&table, column), &assignment.value));
    }
    if set.is_empty() {
        return Err(SqlError::Parse("UPDATE without SET".into()));
    }

    match table.as_str() {
        "categories" => {
            let mut changes = CategoryChanges::default();
            for (column, value) in set {
                match column.as_str() {
                    "name" => changes.name = Some(parse_text(value)?),
                    "description" => changes.description = Some(parse_text_or_null(value)?),
                    _ => return Err(SqlError::UnknownColumn(column)),
                }
            }
            Ok(Command::UpdateCategory { id, changes })
        }
        "resources" => {
            let mut changes = ResourceChanges::default();
            for (column, value) in set {
                match column.as_str() {
                    "name" => changes.name = Some(parse_text(value)?),
                    "category_id" => changes.category_id = Some(parse_ulid_or_null(value)?),
                    "status" => changes.status = Some(parse_label(&parse_text(value)?)?),
                    "description" => changes.description = Some(parse_text_or_null(value)?),
                    _ => return Err(SqlError::UnknownColumn(column)),
                }
            }
            Ok(Command::UpdateResource { id, changes })
        }
        "projects" => {
            let mut changes = ProjectChanges::default();
            for (column, value) in set {
                match column.as_str() {
                    "name" => changes.name = Some(parse_text(value)?),
                    "manager" => changes.manager = Some(parse_text_or_null(value)?),
                    "status" => changes.status = Some(parse_label(&parse_text(value)?)?),
                    "description" => changes.description = Some(parse_text_or_null(value)?),
                    _ => return Err(SqlError::UnknownColumn(column)),
                }
            }
            Ok(Command::UpdateProject { id, changes })
        }
        "users" => {
            let mut changes = UserChanges::default();
            for (column, value) in set {
                match column.as_str() {
                    "username" => changes.username = Some(parse_text(value)?),
                    "password" => changes.password = Some(parse_text(value)?),
                    "role" => changes.role = Some(parse_label(&parse_text(value)?)?),
                    "status" => changes.status = Some(parse_label(&parse_text(value)?)?),
                    _ => return Err(SqlError::UnknownColumn(column)),
                }
            }
            Ok(Command::UpdateUser { id, changes })
        }
        "allocations" => parse_allocation_update(id, set),
        "maintenance_windows" => {
            let mut changes = MaintenanceChanges::default();
            for (column, value) in set {
                match column.as_str() {
                    "resource_id" => changes.resource_id = Some(parse_ulid(value)?),
                    "start" => changes.start = Some(parse_i64(value)?),
                    "end" => changes.end = Some(parse_i64(value)?),
                    "kind" => changes.kind = Some(parse_label(&parse_text(value)?)?),
                    "reason" => changes.reason = Some(parse_text_or_null(value)?),
                    _ => return Err(SqlError::UnknownColumn(column)),
                }
            }
            Ok(Command::UpdateMaintenance { id, changes })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `SET status = 'cancelled'` alone is a cancellation; status takes no other
/// value and does not mix with field edits.
fn parse_allocation_update(id: Ulid, set: Vec<(String, &Expr)>) -> Result<Command, SqlError> {
    if let Some((_, value)) = set.iter().find(|(column, _)| column == "status") {
        let status: AllocationStatus = parse_label(&parse_text(value)?)?;
        if status != AllocationStatus::Cancelled {
            return Err(SqlError::InvalidValue(format!(
                "allocation status can only be set to cancelled, got {status}"
            )));
        }
        if set.len() > 1 {
            return Err(SqlError::Unsupported(
                "cancelling cannot be combined with other changes".into(),
            ));
        }
        return Ok(Command::CancelAllocation { id });
    }

    let mut changes = AllocationChanges::default();
    for (column, value) in set {
        match column.as_str() {
            "resource_id" => changes.resource_id = Some(parse_ulid(value)?),
            "project_id" => changes.project_id = Some(parse_ulid(value)?),
            "start" => changes.start = Some(parse_i64(value)?),
            "end" => changes.end = Some(parse_i64(value)?),
            "note" => changes.note = Some(parse_text_or_null(value)?),
            _ => return Err(SqlError::UnknownColumn(column)),
        }
    }
    Ok(Command::UpdateAllocation { id, changes })
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "categories" => Ok(Command::DeleteCategory { id }),
        "resources" => Ok(Command::DeleteResource { id }),
        "projects" => Ok(Command::DeleteProject { id }),
        "allocations" => Ok(Command::DeleteAllocation { id }),
        "maintenance_windows" => Ok(Command::DeleteMaintenance { id }),
        "users" => Err(SqlError::Unsupported("users are disabled, not deleted".into())),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

/// `column op value` conjuncts of a WHERE clause.
#[derive(Default)]
struct Filters<'a> {
    terms: Vec<(String, BinaryOperator, &'a Expr)>,
}

impl<'a> Filters<'a> {
    fn collect(&mut self, expr: &'a Expr) -> Result<(), SqlError> {
        match expr {
            Expr::BinaryOp {
                left,
                op: BinaryOperator::And,
                right,
            } => {
                self.collect(left)?;
                self.collect(right)
            }
            Expr::BinaryOp { left, op, right } => {
                let column = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter {expr}")))?;
                self.terms.push((column, op.clone(), right.as_ref()));
                Ok(())
            }
            Expr::Nested(inner) => self.collect(inner),
            other => Err(SqlError::Unsupported(format!("filter {other}"))),
        }
    }

    fn find(&self, column: &str, ops: &[BinaryOperator]) -> Option<&'a Expr> {
        self.terms
            .iter()
            .find(|(c, op, _)| c == column && ops.contains(op))
            .map(|(_, _, value)| *value)
    }

    fn eq_ulid(&self, column: &str) -> Result<Option<Ulid>, SqlError> {
        self.find(column, &[BinaryOperator::Eq])
            .map(parse_ulid)
            .transpose()
    }

    fn lower_bound(&self, column: &str) -> Result<Option<Ms>, SqlError> {
        self.find(column, &[BinaryOperator::GtEq, BinaryOperator::Eq])
            .map(parse_i64)
            .transpose()
    }

    fn upper_bound(&self, column: &str) -> Result<Option<Ms>, SqlError> {
        self.find(column, &[BinaryOperator::LtEq, BinaryOperator::Eq])
            .map(parse_i64)
            .transpose()
    }

    /// `resource_id = .. AND start >= .. AND "end" <= ..`, all three required.
    fn resource_window(&self) -> Result<(Ulid, Ms, Ms), SqlError> {
        Ok((
            self.eq_ulid("resource_id")?
                .ok_or(SqlError::MissingFilter("resource_id"))?,
            self.lower_bound("start")?
                .ok_or(SqlError::MissingFilter("start"))?,
            self.upper_bound("end")?.ok_or(SqlError::MissingFilter("end"))?,
        ))
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        filters.collect(selection)?;
    }

    match table.as_str() {
        "categories" => Ok(Command::SelectCategories),
        "resources" => Ok(Command::SelectResources {
            id: filters.eq_ulid("id")?,
        }),
        "projects" => Ok(Command::SelectProjects {
            id: filters.eq_ulid("id")?,
        }),
        "users" => Ok(Command::SelectUsers),
        "allocations" => {
            let selector = if let Some(id) = filters.eq_ulid("id")? {
                AllocationSelector::Id(id)
            } else if let Some(rid) = filters.eq_ulid("resource_id")? {
                AllocationSelector::Resource(rid)
            } else if let Some(pid) = filters.eq_ulid("project_id")? {
                AllocationSelector::Project(pid)
            } else {
                AllocationSelector::All
            };
            Ok(Command::SelectAllocations { selector })
        }
        "conflicts" => {
            let (resource_id, start, end) = filters.resource_window()?;
            Ok(Command::CheckConflict {
                resource_id,
                start,
                end,
            })
        }
        "maintenance_windows" => Ok(Command::SelectMaintenance {
            id: filters.eq_ulid("id")?,
            filter: MaintenanceFilter {
                resource_id: filters.eq_ulid("resource_id")?,
                start: filters.lower_bound("start")?,
                end: filters.upper_bound("end")?,
            },
        }),
        "schedule" => {
            let (resource_id, start, end) = filters.resource_window()?;
            Ok(Command::SelectSchedule {
                resource_id,
                start,
                end,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<&[Expr], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [row] => Ok(row.as_slice()),
            [] => Err(SqlError::Parse("empty VALUES".into())),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid(right),
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::InvalidValue(format!("bad ULID {s:?}: {e}")))
        }
        Some(value) => Err(SqlError::InvalidValue(format!("expected ULID string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if is_null(expr) {
        Ok(None)
    } else {
        parse_ulid(expr).map(Some)
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::InvalidValue(format!("bad integer {s:?}: {e}"))),
            _ => Err(SqlError::InvalidValue(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        parse_i64(expr)?
            .checked_neg()
            .ok_or_else(|| SqlError::InvalidValue(format!("integer out of range: -{expr}")))
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(Value::Null) => Err(SqlError::InvalidValue("unexpected NULL".into())),
        Some(value) => Err(SqlError::InvalidValue(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_text_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        Ok(None)
    } else {
        parse_text(expr).map(Some)
    }
}

fn parse_label<T>(label: &str) -> Result<T, SqlError>
where
    T: FromStr<Err = UnknownVariant>,
{
    label.parse().map_err(|e: UnknownVariant| SqlError::InvalidValue(e.to_string()))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    WrongArity(usize, usize),
    MissingColumn(&'static str),
    MissingFilter(&'static str),
    /// Well-formed SQL carrying a value the field cannot hold.
    InvalidValue(String),
}

impl SqlError {
    /// Statement understood but its fields are missing or malformed.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            SqlError::MissingColumn(_) | SqlError::MissingFilter(_) | SqlError::InvalidValue(_)
        )
    }
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::WrongArity(expected, got) => {
                write!(f, "expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::InvalidValue(s) => write!(f, "invalid value: {s}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const RID: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";
    const PID: &str = "01BX5ZZKBKACTAV9WEVGEMMVS0";

    fn ulid(s: &str) -> Ulid {
        Ulid::from_string(s).unwrap()
    }

    #[test]
    fn parse_insert_allocation() {
        let sql = format!(
            r#"INSERT INTO allocations (id, resource_id, project_id, start, "end", note) VALUES ('{ID}', '{RID}', '{PID}', 1000, 2000, 'rehearsal')"#
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertAllocation {
                id: ulid(ID),
                resource_id: ulid(RID),
                project_id: ulid(PID),
                start: 1000,
                end: 2000,
                note: Some("rehearsal".into()),
            }
        );
    }

    #[test]
    fn parse_insert_allocation_positional_and_generated_id() {
        let sql = format!("INSERT INTO allocations VALUES ('{ID}', '{RID}', '{PID}', 1000, 2000, NULL)");
        match parse_sql(&sql).unwrap() {
            Command::InsertAllocation { id, note, .. } => {
                assert_eq!(id, ulid(ID));
                assert_eq!(note, None);
            }
            other => panic!("expected InsertAllocation, got {other:?}"),
        }

        let sql = format!(
            r#"INSERT INTO allocations (resource_id, project_id, start, "end") VALUES ('{RID}', '{PID}', 1000, 2000)"#
        );
        assert!(matches!(parse_sql(&sql).unwrap(), Command::InsertAllocation { .. }));
    }

    #[test]
    fn parse_insert_missing_column_is_validation() {
        let sql = format!(r#"INSERT INTO allocations (id, resource_id, start, "end") VALUES ('{ID}', '{RID}', 1, 2)"#);
        let err = parse_sql(&sql).unwrap_err();
        assert!(matches!(err, SqlError::MissingColumn("project_id")));
        assert!(err.is_validation());
    }

    #[test]
    fn parse_insert_rejects_unknown_column_and_arity() {
        let sql = format!("INSERT INTO projects (id, name, budget) VALUES ('{ID}', 'x', 10)");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownColumn(c)) if c == "budget"));
        let sql = format!("INSERT INTO projects (id, name) VALUES ('{ID}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::WrongArity(2, 1))));
    }

    #[test]
    fn parse_insert_maintenance_with_type_alias() {
        let sql = format!(
            r#"INSERT INTO maintenance_windows (id, resource_id, start, "end", "type", reason) VALUES ('{ID}', '{RID}', 10, 20, 'SOFT', 'filters')"#
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertMaintenance {
                id: ulid(ID),
                resource_id: ulid(RID),
                start: 10,
                end: 20,
                kind: Some(MaintenanceKind::Soft),
                reason: Some("filters".into()),
            }
        );
    }

    #[test]
    fn parse_insert_bad_label_is_validation() {
        let sql = format!(r#"INSERT INTO maintenance_windows (id, resource_id, start, "end", kind) VALUES ('{ID}', '{RID}', 10, 20, 'sometimes')"#);
        let err = parse_sql(&sql).unwrap_err();
        assert!(err.is_validation(), "{err}");
        assert!(err.to_string().contains("maintenance type"));
    }

    #[test]
    fn parse_insert_catalog_rows() {
        let sql = format!("INSERT INTO resources (id, name, status) VALUES ('{ID}', 'Lathe', 'retired')");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertResource {
                id: ulid(ID),
                name: "Lathe".into(),
                category_id: None,
                status: Some(ResourceStatus::Retired),
                description: None,
            }
        );

        let sql = format!("INSERT INTO users (id, username, password, role) VALUES ('{ID}', 'kim', 'pw', 'ADMIN')");
        match parse_sql(&sql).unwrap() {
            Command::InsertUser { user, .. } => {
                assert_eq!(user.username, "kim");
                assert_eq!(user.role, Some(Role::Admin));
                assert_eq!(user.status, None);
            }
            other => panic!("expected InsertUser, got {other:?}"),
        }
    }

    #[test]
    fn parse_update_allocation_fields() {
        let sql = format!(r#"UPDATE allocations SET start = 5, "end" = 9, note = NULL WHERE id = '{ID}'"#);
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpdateAllocation {
                id: ulid(ID),
                changes: AllocationChanges {
                    start: Some(5),
                    end: Some(9),
                    note: Some(None),
                    ..Default::default()
                },
            }
        );
    }

    #[test]
    fn parse_cancel_allocation() {
        let sql = format!("UPDATE allocations SET status = 'CANCELLED' WHERE id = '{ID}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::CancelAllocation { id: ulid(ID) });

        let sql = format!("UPDATE allocations SET status = 'completed' WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::InvalidValue(_))));

        let sql = format!("UPDATE allocations SET status = 'cancelled', start = 1 WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_update_requires_where_id() {
        assert!(matches!(
            parse_sql("UPDATE projects SET name = 'x'"),
            Err(SqlError::MissingFilter("id"))
        ));
        let sql = format!("UPDATE projects SET budget = 1 WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownColumn(_))));
    }

    #[test]
    fn parse_update_maintenance_and_catalog() {
        let sql = format!("UPDATE maintenance_windows SET kind = 'hard', reason = NULL WHERE id = '{ID}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpdateMaintenance {
                id: ulid(ID),
                changes: MaintenanceChanges {
                    kind: Some(MaintenanceKind::Hard),
                    reason: Some(None),
                    ..Default::default()
                },
            }
        );

        let sql = format!("UPDATE users SET status = 'disabled' WHERE id = '{ID}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpdateUser {
                id: ulid(ID),
                changes: UserChanges {
                    status: Some(UserStatus::Disabled),
                    ..Default::default()
                },
            }
        );

        let sql = format!("UPDATE resources SET category_id = NULL WHERE id = '{ID}'");
        match parse_sql(&sql).unwrap() {
            Command::UpdateResource { changes, .. } => assert_eq!(changes.category_id, Some(None)),
            other => panic!("expected UpdateResource, got {other:?}"),
        }
    }

    #[test]
    fn parse_deletes() {
        for (table, expected) in [
            ("allocations", Command::DeleteAllocation { id: ulid(ID) }),
            ("maintenance_windows", Command::DeleteMaintenance { id: ulid(ID) }),
            ("resources", Command::DeleteResource { id: ulid(ID) }),
            ("projects", Command::DeleteProject { id: ulid(ID) }),
            ("categories", Command::DeleteCategory { id: ulid(ID) }),
        ] {
            let sql = format!("DELETE FROM {table} WHERE id = '{ID}'");
            assert_eq!(parse_sql(&sql).unwrap(), expected);
        }
        assert!(parse_sql(&format!("DELETE FROM users WHERE id = '{ID}'")).is_err());
    }

    #[test]
    fn parse_select_allocations_selectors() {
        assert_eq!(
            parse_sql("SELECT * FROM allocations").unwrap(),
            Command::SelectAllocations { selector: AllocationSelector::All }
        );
        let sql = format!("SELECT * FROM allocations WHERE resource_id = '{RID}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectAllocations { selector: AllocationSelector::Resource(ulid(RID)) }
        );
        let sql = format!("SELECT * FROM allocations WHERE project_id = '{PID}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectAllocations { selector: AllocationSelector::Project(ulid(PID)) }
        );
        let sql = format!("SELECT * FROM allocations WHERE id = '{ID}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectAllocations { selector: AllocationSelector::Id(ulid(ID)) }
        );
    }

    #[test]
    fn parse_select_conflicts() {
        let sql = format!(r#"SELECT * FROM conflicts WHERE resource_id = '{RID}' AND start >= 1000 AND "end" <= 2000"#);
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::CheckConflict { resource_id: ulid(RID), start: 1000, end: 2000 }
        );
        let sql = format!("SELECT * FROM conflicts WHERE resource_id = '{RID}' AND start >= 1000");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingFilter("end"))));
    }

    #[test]
    fn parse_select_schedule() {
        let sql = format!(r#"SELECT * FROM schedule WHERE (resource_id = '{RID}') AND start = 5 AND "end" = 10"#);
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectSchedule { resource_id: ulid(RID), start: 5, end: 10 }
        );
    }

    #[test]
    fn parse_select_maintenance_filters() {
        assert_eq!(
            parse_sql("SELECT * FROM maintenance_windows").unwrap(),
            Command::SelectMaintenance { id: None, filter: MaintenanceFilter::default() }
        );
        let sql = format!(r#"SELECT * FROM maintenance_windows WHERE resource_id = '{RID}' AND start >= -5 AND "end" <= 10"#);
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectMaintenance {
                id: None,
                filter: MaintenanceFilter {
                    resource_id: Some(ulid(RID)),
                    start: Some(-5),
                    end: Some(10),
                },
            }
        );
    }

    #[test]
    fn parse_catalog_selects() {
        assert_eq!(parse_sql("SELECT * FROM users").unwrap(), Command::SelectUsers);
        assert_eq!(parse_sql("select id, name from categories").unwrap(), Command::SelectCategories);
        let sql = format!("SELECT * FROM resources WHERE id = '{ID}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::SelectResources { id: Some(ulid(ID)) });
    }

    #[test]
    fn bad_ulid_is_validation() {
        let err = parse_sql("DELETE FROM allocations WHERE id = 'not-a-ulid'").unwrap_err();
        assert!(err.is_validation(), "{err}");
    }

    #[test]
    fn read_classification() {
        assert!(parse_sql("SELECT * FROM allocations").unwrap().is_read());
        let sql = format!("DELETE FROM allocations WHERE id = '{ID}'");
        assert!(!parse_sql(&sql).unwrap().is_read());
    }

    #[test]
    fn parse_unknown_table_and_empty() {
        assert!(matches!(
            parse_sql(&format!("INSERT INTO foobar (id) VALUES ('{ID}')")),
            Err(SqlError::UnknownTable(_))
        ));
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
        assert!(matches!(parse_sql("SELEC nonsense"), Err(SqlError::Parse(_))));
    }

    #[test]
    fn negated_integer_out_of_range_is_invalid() {
        let sql = format!(
            r#"SELECT * FROM schedule WHERE resource_id = '{RID}' AND start >= -'-9223372036854775808' AND "end" <= 10"#
        );
        let err = parse_sql(&sql).unwrap_err();
        assert!(matches!(err, SqlError::InvalidValue(_)));
        assert!(err.is_validation());

        let sql = format!(
            r#"SELECT * FROM schedule WHERE resource_id = '{RID}' AND start >= -9223372036854775807 AND "end" <= 10"#
        );
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::SelectSchedule { start: -9_223_372_036_854_775_807, .. }
        ));
    }
}
