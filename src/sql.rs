use std::collections::HashMap;

use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;
use crate::time::parse_timestamp;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertResource {
        id: ResourceId,
        kind: ResourceKind,
        capacity: u32,
        zone: String,
    },
    RetireResource {
        id: ResourceId,
    },
    MarkClean {
        id: ResourceId,
    },
    InsertReservation(ReservationDraft),
    AssignResource {
        id: Ulid,
        resource_id: ResourceId,
    },
    CheckIn {
        id: Ulid,
    },
    CheckOut {
        id: Ulid,
    },
    CancelReservation {
        id: Ulid,
    },
    UpdateReservation {
        id: Ulid,
        patch: ReservationPatch,
    },
    SelectReservation {
        id: Ulid,
    },
    SelectReservations(ReservationFilter),
    SearchReservations {
        term: String,
    },
    SelectResources {
        kind: Option<ResourceKind>,
    },
    SelectSuggestions {
        kind: ResourceKind,
        span: Span,
        min_capacity: u32,
    },
    SelectAvailability {
        resource_id: ResourceId,
        span: Span,
    },
    SelectOccupancy {
        kind: ResourceKind,
        at: Option<Ms>,
    },
    SelectBoard {
        kind: Option<ResourceKind>,
        at: Option<Ms>,
    },
    SelectArrivals {
        span: Span,
    },
    SelectDepartures {
        span: Span,
    },
    SelectDashboard {
        at: Option<Ms>,
    },
}

/// Column order used when an INSERT omits its column list.
const RESOURCE_COLUMNS: [&str; 4] = ["id", "kind", "capacity", "zone"];
const RESERVATION_COLUMNS: [&str; 12] = [
    "guest_name",
    "contact",
    "resource_id",
    "start_at",
    "end_at",
    "party_size",
    "id_number",
    "designation",
    "department",
    "purpose",
    "notes",
    "correlation_id",
];

/// Parse a single statement. Batches belong to [`parse_statements`].
pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let mut commands = parse_statements(sql)?;
    if commands.len() > 1 {
        return Err(SqlError::Unsupported(format!(
            "{} statements where one was expected",
            commands.len()
        )));
    }
    commands.pop().ok_or(SqlError::Empty)
}

/// Parse every statement of a simple-query batch. Nothing is returned unless
/// all of them parse.
pub fn parse_statements(sql: &str) -> Result<Vec<Command>, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    stmts.iter().map(parse_statement).collect()
}

fn parse_statement(stmt: &Statement) -> Result<Command, SqlError> {
    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Lowercased name of the table a statement targets, for metrics labels.
pub fn target_table(sql: &str) -> Option<String> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).ok()?;
    match stmts.first()? {
        Statement::Insert(insert) => insert_table_name(insert).ok(),
        Statement::Delete(delete) => delete_table_name(delete).ok(),
        Statement::Update { table, .. } => table_factor_name(&table.relation).ok(),
        Statement::Query(query) => match query.body.as_ref() {
            SetExpr::Select(s) => s.from.first().and_then(|t| table_factor_name(&t.relation).ok()),
            _ => None,
        },
        _ => None,
    }
}

// ── INSERT ────────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = extract_all_insert_rows(insert)?;
    if rows.len() != 1 {
        return Err(SqlError::Unsupported(format!("{} rows in one INSERT", rows.len())));
    }
    let row = rows.into_iter().next().unwrap_or_default();

    match table.as_str() {
        "resources" => {
            let values = named_values(insert, row, &RESOURCE_COLUMNS)?;
            let id = values.get("id").ok_or(SqlError::MissingColumn("id"))?;
            let kind = values.get("kind").ok_or(SqlError::MissingColumn("kind"))?;
            let capacity = values.get("capacity").ok_or(SqlError::MissingColumn("capacity"))?;
            Ok(Command::InsertResource {
                id: parse_label(id)?,
                kind: parse_kind(kind)?,
                capacity: parse_u32(capacity)?,
                zone: values.get("zone").map(parse_text_or_null).transpose()?.flatten().unwrap_or_default(),
            })
        }
        "reservations" => {
            let values = named_values(insert, row, &RESERVATION_COLUMNS)?;
            let required = |col: &'static str| values.get(col).ok_or(SqlError::MissingColumn(col));
            let optional_text = |col: &'static str| -> Result<Option<String>, SqlError> {
                Ok(values.get(col).map(parse_text_or_null).transpose()?.flatten())
            };

            let guest = Guest {
                name: parse_text(required("guest_name")?)?,
                contact: parse_text(required("contact")?)?,
                id_number: optional_text("id_number")?,
                designation: optional_text("designation")?,
                department: optional_text("department")?,
            };
            let span = Span::new(parse_ms(required("start_at")?)?, parse_ms(required("end_at")?)?);
            let party_size = match values.get("party_size") {
                Some(expr) => parse_u32(expr)?,
                None => 1,
            };
            let resource_id = match values.get("resource_id") {
                Some(expr) => parse_label_or_null(expr)?,
                None => None,
            };
            let correlation_id = match values.get("correlation_id") {
                Some(expr) => parse_ulid_or_null(expr)?,
                None => None,
            };
            Ok(Command::InsertReservation(ReservationDraft {
                guest,
                resource_id,
                span,
                party_size,
                purpose: optional_text("purpose")?,
                notes: optional_text("notes")?,
                correlation_id,
            }))
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Pairs a VALUES row with its column names; positional rows follow `default_columns`.
fn named_values(
    insert: &ast::Insert,
    row: Vec<Expr>,
    default_columns: &[&str],
) -> Result<HashMap<String, Expr>, SqlError> {
    let columns: Vec<String> = if insert.columns.is_empty() {
        default_columns.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if row.len() > columns.len() || (!insert.columns.is_empty() && row.len() != columns.len()) {
        return Err(SqlError::WrongArity(columns.len(), row.len()));
    }
    let mut values = HashMap::with_capacity(row.len());
    for (column, expr) in columns.into_iter().zip(row) {
        if !default_columns.contains(&column.as_str()) {
            return Err(SqlError::UnknownColumn(column));
        }
        values.insert(column, expr);
    }
    Ok(values)
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "resources" => Ok(Command::RetireResource { id: parse_label(&id)? }),
        "reservations" => Ok(Command::CancelReservation { id: parse_ulid(&id)? }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let id = extract_where_id(selection)?;

    let mut set = HashMap::with_capacity(assignments.len());
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => {
                object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))?
            }
            AssignmentTarget::Tuple(_) => return Err(SqlError::Unsupported("tuple assignment".into())),
        };
        set.insert(column, assignment.value.clone());
    }

    match table.as_str() {
        "resources" => parse_resource_update(parse_label(&id)?, &set),
        "reservations" => parse_reservation_update(parse_ulid(&id)?, set),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_resource_update(id: ResourceId, set: &HashMap<String, Expr>) -> Result<Command, SqlError> {
    if set.len() != 1 {
        return Err(SqlError::Unsupported("resources accept one flag per UPDATE".into()));
    }
    if let Some(expr) = set.get("needs_cleaning") {
        return match parse_bool(expr)? {
            false => Ok(Command::MarkClean { id }),
            true => Err(SqlError::Unsupported("needs_cleaning is only set by check-out".into())),
        };
    }
    if let Some(expr) = set.get("retired") {
        return match parse_bool(expr)? {
            true => Ok(Command::RetireResource { id }),
            false => Err(SqlError::Unsupported("retired resources cannot be reactivated".into())),
        };
    }
    let column = set.keys().next().cloned().unwrap_or_default();
    Err(SqlError::UnknownColumn(column))
}

fn parse_reservation_update(id: Ulid, mut set: HashMap<String, Expr>) -> Result<Command, SqlError> {
    if let Some(expr) = set.remove("status") {
        let status: Status = parse_text(&expr)?.parse().map_err(SqlError::Parse)?;
        let resource_id = set.remove("resource_id");
        if let Some(extra) = set.keys().next() {
            return Err(SqlError::Unsupported(format!("status change with {extra}")));
        }
        return match (status, resource_id) {
            (Status::Confirmed, Some(rid)) => Ok(Command::AssignResource {
                id,
                resource_id: parse_label(&rid)?,
            }),
            (Status::Confirmed, None) => Err(SqlError::MissingColumn("resource_id")),
            (_, Some(_)) => Err(SqlError::Unsupported(format!("resource_id with status {status}"))),
            (Status::CheckedIn, None) => Ok(Command::CheckIn { id }),
            (Status::CheckedOut, None) => Ok(Command::CheckOut { id }),
            (Status::Cancelled, None) => Ok(Command::CancelReservation { id }),
            (Status::Pending, None) => Err(SqlError::Unsupported("status cannot return to pending".into())),
        };
    }

    let mut patch = ReservationPatch::default();
    let mut start = None;
    let mut end = None;
    for (column, expr) in set {
        match column.as_str() {
            "guest_name" => patch.guest_name = Some(parse_text(&expr)?),
            "contact" => patch.contact = Some(parse_text(&expr)?),
            "resource_id" => patch.resource_id = Some(parse_label(&expr)?),
            "start_at" => start = Some(parse_ms(&expr)?),
            "end_at" => end = Some(parse_ms(&expr)?),
            "party_size" => patch.party_size = Some(parse_u32(&expr)?),
            "purpose" => patch.purpose = Some(parse_text(&expr)?),
            "notes" => patch.notes = Some(parse_text(&expr)?),
            _ => return Err(SqlError::UnknownColumn(column)),
        }
    }
    patch.span = match (start, end) {
        (Some(start), Some(end)) => Some(Span::new(start, end)),
        (None, None) => None,
        (Some(_), None) => return Err(SqlError::MissingColumn("end_at")),
        (None, Some(_)) => return Err(SqlError::MissingColumn("start_at")),
    };
    Ok(Command::UpdateReservation { id, patch })
}

// ── SELECT ────────────────────────────────────────────────────

/// Conjunctive WHERE clause split by comparison operator.
#[derive(Default)]
struct Filters {
    eq: HashMap<String, Expr>,
    gt_eq: HashMap<String, Expr>,
    lt_eq: HashMap<String, Expr>,
}

impl Filters {
    fn required_eq(&self, col: &'static str) -> Result<&Expr, SqlError> {
        self.eq.get(col).ok_or(SqlError::MissingFilter(col))
    }

    /// `start_at >= a AND end_at <= b` as a span.
    fn window(&self) -> Result<Span, SqlError> {
        let start = self.gt_eq.get("start_at").ok_or(SqlError::MissingFilter("start_at"))?;
        let end = self.lt_eq.get("end_at").ok_or(SqlError::MissingFilter("end_at"))?;
        Ok(Span::new(parse_ms(start)?, parse_ms(end)?))
    }

    fn optional_window(&self) -> Result<Option<Span>, SqlError> {
        if self.gt_eq.contains_key("start_at") || self.lt_eq.contains_key("end_at") {
            return self.window().map(Some);
        }
        Ok(None)
    }

    fn kind(&self) -> Result<Option<ResourceKind>, SqlError> {
        self.eq.get("kind").map(parse_kind).transpose()
    }

    fn as_of(&self) -> Result<Option<Ms>, SqlError> {
        self.eq.get("as_of").map(parse_ms).transpose()
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
        collect_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "reservations" => parse_reservation_select(&filters),
        "resources" => Ok(Command::SelectResources { kind: filters.kind()? }),
        "suggestions" => Ok(Command::SelectSuggestions {
            kind: parse_kind(filters.required_eq("kind")?)?,
            span: filters.window()?,
            min_capacity: filters.eq.get("min_capacity").map(parse_u32).transpose()?.unwrap_or(1),
        }),
        "availability" => Ok(Command::SelectAvailability {
            resource_id: parse_label(filters.required_eq("resource_id")?)?,
            span: filters.window()?,
        }),
        "occupancy" => Ok(Command::SelectOccupancy {
            kind: parse_kind(filters.required_eq("kind")?)?,
            at: filters.as_of()?,
        }),
        "board" => Ok(Command::SelectBoard {
            kind: filters.kind()?,
            at: filters.as_of()?,
        }),
        "arrivals" => Ok(Command::SelectArrivals { span: filters.window()? }),
        "departures" => Ok(Command::SelectDepartures { span: filters.window()? }),
        "dashboard" => Ok(Command::SelectDashboard { at: filters.as_of()? }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_reservation_select(filters: &Filters) -> Result<Command, SqlError> {
    if let Some(id) = filters.eq.get("id") {
        return Ok(Command::SelectReservation { id: parse_ulid(id)? });
    }
    if let Some(term) = filters.eq.get("search") {
        return Ok(Command::SearchReservations { term: parse_text(term)? });
    }
    let status = filters
        .eq
        .get("status")
        .map(|e| parse_text(e)?.parse::<Status>().map_err(SqlError::Parse))
        .transpose()?;
    Ok(Command::SelectReservations(ReservationFilter {
        status,
        resource_id: filters.eq.get("resource_id").map(parse_label).transpose()?,
        window: filters.optional_window()?,
    }))
}

fn collect_filters(expr: &Expr, filters: &mut Filters) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, filters)?,
        Expr::BinaryOp { left, op, right } => {
            let target = match op {
                ast::BinaryOperator::And => {
                    collect_filters(left, filters)?;
                    return collect_filters(right, filters);
                }
                ast::BinaryOperator::Eq => &mut filters.eq,
                ast::BinaryOperator::GtEq => &mut filters.gt_eq,
                ast::BinaryOperator::LtEq => &mut filters.lt_eq,
                other => return Err(SqlError::Unsupported(format!("operator {other}"))),
            };
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            target.insert(col, right.as_ref().clone());
        }
        other => return Err(SqlError::Unsupported(format!("filter {other}"))),
    }
    Ok(())
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

fn extract_all_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows.clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Expr, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => Ok(right.as_ref().clone()),
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

fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_text_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_text(expr).map(Some)
}

/// Resource labels may be written as strings or bare numbers (`201`).
fn parse_label(expr: &Expr) -> Result<ResourceId, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(other) => Err(SqlError::Parse(format!("expected resource id, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_label_or_null(expr: &Expr) -> Result<Option<ResourceId>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_label(expr).map(Some)
}

fn parse_kind(expr: &Expr) -> Result<ResourceKind, SqlError> {
    parse_text(expr)?.parse().map_err(SqlError::Parse)
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_text(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_ulid(expr).map(Some)
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

/// Integer milliseconds or any timestamp string `parse_timestamp` accepts.
fn parse_ms(expr: &Expr) -> Result<Ms, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            parse_timestamp(s).ok_or_else(|| SqlError::Parse(format!("bad timestamp: {s:?}")))
        }
        _ => parse_i64_expr(expr),
    }
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("unknown column: {0}")]
    UnknownColumn(String),
    #[error("expected {0} values, got {1}")]
    WrongArity(usize, usize),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}

impl SqlError {
    pub fn sqlstate(&self) -> &'static str {
        match self {
            SqlError::Parse(_) | SqlError::Empty => "42601",
            SqlError::Unsupported(_) => "0A000",
            SqlError::UnknownTable(_) => "42P01",
            SqlError::UnknownColumn(_) => "42703",
            SqlError::WrongArity(..) | SqlError::MissingColumn(_) | SqlError::MissingFilter(_) => "42601",
        }
    }
}
