use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertApartment {
        id: Ulid,
        max_capacity: u32,
        /// Explicit occupancy tiers, e.g. `'1,2,4'`. `None` sells only `max_capacity`.
        enabled_capacities: Option<Vec<u32>>,
        capabilities: Capabilities,
        name: Option<String>,
    },
    UpdateCapabilities {
        id: Ulid,
        allow_full: Option<bool>,
        allow_bedroom: Option<bool>,
        allow_bed: Option<bool>,
    },
    DeleteApartment {
        id: Ulid,
    },
    InsertBedroom {
        id: Ulid,
        apartment_id: Ulid,
        base_capacity: u32,
        max_capacity: u32,
        allow_extra_beds: bool,
        pricing_mode: PricingMode,
    },
    InsertBed {
        id: Ulid,
        bedroom_id: Ulid,
        label: String,
        bed_type: Option<String>,
        monthly_price: u64,
        deposit: u64,
        capacity: u32,
    },
    InsertReservation {
        id: Ulid,
        apartment_id: Ulid,
        granularity: Granularity,
        target_id: Ulid,
        holder_id: String,
    },
    CancelReservation {
        id: Ulid,
    },
    SelectApartments,
    SelectBedrooms {
        apartment_id: Ulid,
    },
    SelectBeds {
        apartment_id: Ulid,
    },
    SelectReservations {
        apartment_id: Ulid,
    },
    SelectAvailability {
        apartment_id: Ulid,
    },
    SelectAvailabilitySummary {
        apartment_id: Ulid,
    },
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

/// One VALUES row, addressed by column name when the INSERT lists columns
/// and by position otherwise.
struct Row<'a> {
    table: &'static str,
    columns: Vec<String>,
    values: &'a [Expr],
}

impl<'a> Row<'a> {
    fn get(&self, column: &str, position: usize) -> Option<&'a Expr> {
        if self.columns.is_empty() {
            self.values.get(position)
        } else {
            let idx = self.columns.iter().position(|c| c == column)?;
            self.values.get(idx)
        }
    }

    fn required(&self, column: &'static str, position: usize) -> Result<&'a Expr, SqlError> {
        self.get(column, position)
            .ok_or(SqlError::MissingColumn(self.table, column))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;
    let columns: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();
    if !columns.is_empty() && columns.len() != values.len() {
        return Err(SqlError::Parse(format!(
            "{} columns but {} values",
            columns.len(),
            values.len()
        )));
    }

    match table.as_str() {
        "apartments" => {
            let row = Row { table: "apartments", columns, values };
            let flag = |col: &'static str, pos: usize| -> Result<bool, SqlError> {
                row.get(col, pos).map(parse_bool).transpose().map(|b| b.unwrap_or(true))
            };
            Ok(Command::InsertApartment {
                id: parse_ulid(row.required("id", 0)?)?,
                max_capacity: parse_u32(row.required("max_capacity", 1)?)?,
                capabilities: Capabilities {
                    allow_full_reservation: flag("allow_full", 2)?,
                    allow_bedroom_reservation: flag("allow_bedroom", 3)?,
                    allow_bed_reservation: flag("allow_bed", 4)?,
                },
                name: row.get("name", 5).map(parse_string_or_null).transpose()?.flatten(),
                enabled_capacities: row
                    .get("enabled_capacities", 6)
                    .map(parse_string_or_null)
                    .transpose()?
                    .flatten()
                    .map(|list| parse_capacity_list(&list))
                    .transpose()?,
            })
        }
        "bedrooms" => {
            let row = Row { table: "bedrooms", columns, values };
            let base_capacity = parse_u32(row.required("base_capacity", 2)?)?;
            Ok(Command::InsertBedroom {
                id: parse_ulid(row.required("id", 0)?)?,
                apartment_id: parse_ulid(row.required("apartment_id", 1)?)?,
                base_capacity,
                max_capacity: row
                    .get("max_capacity", 3)
                    .map(parse_u32)
                    .transpose()?
                    .unwrap_or(base_capacity),
                allow_extra_beds: row.get("allow_extra_beds", 4).map(parse_bool).transpose()?.unwrap_or(false),
                pricing_mode: match row.get("pricing_mode", 5) {
                    Some(expr) => {
                        let s = parse_string(expr)?;
                        PricingMode::parse(&s).ok_or(SqlError::Parse(format!("bad pricing_mode: {s}")))?
                    }
                    None => PricingMode::Both,
                },
            })
        }
        "beds" => {
            let row = Row { table: "beds", columns, values };
            Ok(Command::InsertBed {
                id: parse_ulid(row.required("id", 0)?)?,
                bedroom_id: parse_ulid(row.required("bedroom_id", 1)?)?,
                label: parse_string(row.required("label", 2)?)?,
                bed_type: row.get("bed_type", 3).map(parse_string_or_null).transpose()?.flatten(),
                monthly_price: row.get("monthly_price", 4).map(parse_u64).transpose()?.unwrap_or(0),
                deposit: row.get("deposit", 5).map(parse_u64).transpose()?.unwrap_or(0),
                capacity: row.get("capacity", 6).map(parse_u32).transpose()?.unwrap_or(1),
            })
        }
        "reservations" => {
            let row = Row { table: "reservations", columns, values };
            let g = parse_string(row.required("granularity", 2)?)?;
            Ok(Command::InsertReservation {
                id: parse_ulid(row.required("id", 0)?)?,
                apartment_id: parse_ulid(row.required("apartment_id", 1)?)?,
                granularity: Granularity::parse(&g).ok_or(SqlError::Parse(format!("bad granularity: {g}")))?,
                target_id: parse_ulid(row.required("target_id", 3)?)?,
                holder_id: parse_string(row.required("holder_id", 4)?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let name = table_factor_name(&table.relation)?;
    if name != "apartments" {
        return Err(SqlError::UnknownTable(name));
    }
    let id = extract_where_eq(selection, "id")?;

    let (mut allow_full, mut allow_bedroom, mut allow_bed) = (None, None, None);
    for a in assignments {
        let col = match &a.target {
            AssignmentTarget::ColumnName(n) => object_name_last(n),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        let value = Some(parse_bool(&a.value)?);
        match col.as_str() {
            "allow_full" => allow_full = value,
            "allow_bedroom" => allow_bedroom = value,
            "allow_bed" => allow_bed = value,
            other => return Err(SqlError::Unsupported(format!("cannot update column {other}"))),
        }
    }
    Ok(Command::UpdateCapabilities {
        id,
        allow_full,
        allow_bedroom,
        allow_bed,
    })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_eq(&delete.selection, "id")?;

    match table.as_str() {
        "apartments" => Ok(Command::DeleteApartment { id }),
        "reservations" => Ok(Command::CancelReservation { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    let apartment_id = || extract_where_eq(&select.selection, "apartment_id");
    match table.as_str() {
        "apartments" => Ok(Command::SelectApartments),
        "bedrooms" => Ok(Command::SelectBedrooms { apartment_id: apartment_id()? }),
        "beds" => Ok(Command::SelectBeds { apartment_id: apartment_id()? }),
        "reservations" => Ok(Command::SelectReservations { apartment_id: apartment_id()? }),
        "availability" => Ok(Command::SelectAvailability { apartment_id: apartment_id()? }),
        "availability_summary" => Ok(Command::SelectAvailabilitySummary { apartment_id: apartment_id()? }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Find `column = <ulid>` anywhere in an AND chain.
fn find_eq(expr: &Expr, column: &str) -> Result<Option<Ulid>, SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => Ok(match find_eq(left, column)? {
            Some(id) => Some(id),
            None => find_eq(right, column)?,
        }),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some(column) => Ok(Some(parse_ulid(right)?)),
        Expr::Nested(inner) => find_eq(inner, column),
        _ => Ok(None),
    }
}

fn extract_where_eq(selection: &Option<Expr>, column: &'static str) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter(column))?;
    find_eq(sel, column)?.ok_or(SqlError::MissingFilter(column))
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
        TableObject::TableName(name) => object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into())),
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into())),
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

/// The single VALUES row of an INSERT. Multi-row inserts are rejected so a
/// statement maps to exactly one transaction.
fn extract_insert_values(insert: &ast::Insert) -> Result<&[Expr], SqlError> {
    let body = insert.source.as_ref().ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [row] => Ok(row.as_slice()),
            [] => Err(SqlError::Parse("empty VALUES".into())),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
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

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string(expr).map(Some),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => {
            s.parse().map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        None => match expr {
            Expr::UnaryOp {
                op: ast::UnaryOperator::Minus,
                expr,
            } => Ok(-parse_i64(expr)?),
            _ => Err(SqlError::Parse(format!("expected value, got {expr}"))),
        },
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

/// Comma-separated tiers such as `1,2,4`. Empty entries are rejected.
fn parse_capacity_list(list: &str) -> Result<Vec<u32>, SqlError> {
    list.split(',')
        .map(|part| {
            let part = part.trim();
            part.parse::<u32>()
                .map_err(|_| SqlError::Parse(format!("invalid capacity tier {part:?}")))
        })
        .collect()
}

fn parse_u64(expr: &Expr) -> Result<u64, SqlError> {
    let v = parse_i64(expr)?;
    u64::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    MissingColumn(&'static str, &'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::MissingColumn(t, c) => write!(f, "{t}: missing value for {c}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
