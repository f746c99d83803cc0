use std::str::FromStr;

use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    SelectBusinessUnit,
    UpdateBusinessUnit { changes: UnitChanges },
    InsertService { input: NewService, returning: bool },
    UpdateService { id: Ulid, patch: ServicePatch },
    DeleteService { id: Ulid },
    SelectServices { available_only: bool },
    InsertAppointment { input: NewAppointment, returning: bool },
    UpdateAppointment { id: Ulid, patch: AppointmentPatch },
    SetAppointmentStatus { id: Ulid, status: AppointmentStatus },
    SetPaymentStatus { id: Ulid, update: PaymentUpdate },
    DeleteAppointment { id: Ulid },
    SelectAppointments { filter: AppointmentFilter },
    InsertPayout { input: NewPayout, returning: bool },
    SelectPayouts,
    SelectBalance,
    SelectSummary,
}

const SERVICE_COLUMNS: &[&str] = &["id", "title", "category", "price", "is_available"];
const APPOINTMENT_COLUMNS: &[&str] = &[
    "id",
    "service_id",
    "client_name",
    "client_phone",
    "client_email",
    "start_at",
    "end_at",
    "total_price",
];
const PAYOUT_COLUMNS: &[&str] = &["amount", "comment", "requested_by"];
const APPOINTMENT_DETAIL_COLUMNS: &[&str] = &[
    "service_id",
    "client_name",
    "client_phone",
    "client_email",
    "start_at",
    "end_at",
    "total_price",
];
const PAYMENT_COLUMNS: &[&str] = &[
    "payment_status",
    "paid_amount",
    "payment_id",
    "payment_provider",
    "payment_meta",
];
const UNIT_COLUMNS: &[&str] = &[
    "name",
    "currency",
    "payout_method",
    "payout_provider",
    "payout_mode",
    "payout_provider_key",
    "payout_provider_secret",
    "payout_webhook_secret",
    "payout_account",
    "payout_name",
    "payout_bank",
    "payout_bik",
    "payout_inn",
    "payout_kpp",
    "payout_provider_extra",
];

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

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let row = match table.as_str() {
        "services" => Columns::from_insert(insert, SERVICE_COLUMNS)?,
        "appointments" => Columns::from_insert(insert, APPOINTMENT_COLUMNS)?,
        "payouts" => Columns::from_insert(insert, PAYOUT_COLUMNS)?,
        _ => return Err(SqlError::UnknownTable(table)),
    };

    let returning = wants_returning(insert)?;
    match table.as_str() {
        "services" => Ok(Command::InsertService {
            input: NewService {
                id: row.ulid_or_new("id")?,
                title: parse_text(row.require("title")?)?,
                category: row.opt_text("category")?,
                price: parse_decimal(row.require("price")?)?,
                available: row.get("is_available").map(parse_bool).transpose()?.unwrap_or(true),
            },
            returning,
        }),
        "appointments" => Ok(Command::InsertAppointment {
            input: NewAppointment {
                id: row.ulid_or_new("id")?,
                service_id: parse_ulid(row.require("service_id")?)?,
                client: Client {
                    name: parse_text(row.require("client_name")?)?,
                    phone: parse_text(row.require("client_phone")?)?,
                    email: row.opt_text("client_email")?,
                },
                start: parse_i64(row.require("start_at")?)?,
                end: parse_i64(row.require("end_at")?)?,
                total_price: row.opt_decimal("total_price")?,
            },
            returning,
        }),
        _ => Ok(Command::InsertPayout {
            input: NewPayout {
                amount: parse_decimal(row.require("amount")?)?,
                comment: row.opt_text("comment")?,
                requested_by: row.opt_text("requested_by")?,
            },
            returning,
        }),
    }
}

/// Only `RETURNING *` is supported; the whole stored row comes back.
fn wants_returning(insert: &ast::Insert) -> Result<bool, SqlError> {
    match insert.returning.as_deref() {
        None => Ok(false),
        Some([ast::SelectItem::Wildcard(_)]) => Ok(true),
        Some(items) => Err(SqlError::Unsupported(format!(
            "RETURNING {}",
            items
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        ))),
    }
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table_name = table_factor_name(&table.relation)?;
    let set = Columns::from_assignments(assignments)?;

    match table_name.as_str() {
        "business_unit" => {
            set.only(UNIT_COLUMNS)?;
            Ok(Command::UpdateBusinessUnit {
                changes: UnitChanges {
                    name: set.opt_text("name")?,
                    currency: set.opt_text("currency")?,
                    payout_method: set
                        .opt_text("payout_method")?
                        .map(|m| {
                            PayoutMethod::from_label(&m)
                                .ok_or_else(|| SqlError::Parse(format!("bad payout_method: {m}")))
                        })
                        .transpose()?,
                    payout_provider: set.opt_text("payout_provider")?,
                    payout_mode: set
                        .opt_text("payout_mode")?
                        .map(|m| {
                            PayoutMode::from_label(&m)
                                .ok_or_else(|| SqlError::Parse(format!("bad payout_mode: {m}")))
                        })
                        .transpose()?,
                    provider_key: set.opt_text("payout_provider_key")?,
                    provider_secret: set.opt_text("payout_provider_secret")?,
                    webhook_secret: set.opt_text("payout_webhook_secret")?,
                    account: set.opt_text("payout_account")?,
                    recipient_name: set.opt_text("payout_name")?,
                    bank: set.opt_text("payout_bank")?,
                    bik: set.opt_text("payout_bik")?,
                    inn: set.opt_text("payout_inn")?,
                    kpp: set.opt_text("payout_kpp")?,
                    provider_extra: set.opt_text("payout_provider_extra")?,
                },
            })
        }
        "services" => {
            let id = extract_where_id(selection)?;
            set.only(&["title", "category", "price", "is_available"])?;
            Ok(Command::UpdateService {
                id,
                patch: ServicePatch {
                    title: set.opt_text("title")?,
                    category: set.opt_text("category")?,
                    price: set.opt_decimal("price")?,
                    available: set.get("is_available").map(parse_bool).transpose()?,
                },
            })
        }
        "appointments" => {
            let id = extract_where_id(selection)?;
            parse_appointment_update(id, &set)
        }
        _ => Err(SqlError::UnknownTable(table_name)),
    }
}

/// One UPDATE touches one concern: lifecycle status, payment, or details.
fn parse_appointment_update(id: Ulid, set: &Columns<'_>) -> Result<Command, SqlError> {
    if let Some(expr) = set.get("status") {
        set.only(&["status"])?;
        let label = parse_text(expr)?;
        let status = AppointmentStatus::from_label(&label)
            .ok_or_else(|| SqlError::Parse(format!("bad status: {label}")))?;
        return Ok(Command::SetAppointmentStatus { id, status });
    }
    if let Some(expr) = set.get("payment_status") {
        set.only(PAYMENT_COLUMNS)?;
        let label = parse_text(expr)?;
        let status = PaymentStatus::from_label(&label)
            .ok_or_else(|| SqlError::Parse(format!("bad payment_status: {label}")))?;
        let meta = set
            .opt_text("payment_meta")?
            .map(|text| {
                serde_json::from_str(&text)
                    .map_err(|e| SqlError::Parse(format!("payment_meta is not JSON: {e}")))
            })
            .transpose()?;
        return Ok(Command::SetPaymentStatus {
            id,
            update: PaymentUpdate {
                status,
                amount: set.opt_decimal("paid_amount")?,
                reference: set.opt_text("payment_id")?,
                provider: set.opt_text("payment_provider")?,
                meta,
            },
        });
    }
    set.only(APPOINTMENT_DETAIL_COLUMNS)?;
    Ok(Command::UpdateAppointment {
        id,
        patch: AppointmentPatch {
            service_id: set.get("service_id").map(parse_ulid).transpose()?,
            client_name: set.opt_text("client_name")?,
            client_phone: set.opt_text("client_phone")?,
            client_email: set.opt_text("client_email")?,
            start: set.get("start_at").map(parse_i64).transpose()?,
            end: set.get("end_at").map(parse_i64).transpose()?,
            total_price: set.opt_decimal("total_price")?,
        },
    })
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "services" => Ok(Command::DeleteService { id }),
        "appointments" => Ok(Command::DeleteAppointment { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    let mut predicates = Vec::new();
    if let Some(selection) = &select.selection {
        collect_predicates(selection, &mut predicates)?;
    }

    match table.as_str() {
        "business_unit" => Ok(Command::SelectBusinessUnit),
        "payouts" => Ok(Command::SelectPayouts),
        "balance" => Ok(Command::SelectBalance),
        "summary" => Ok(Command::SelectSummary),
        "services" => {
            let mut available_only = false;
            for (col, op, value) in &predicates {
                match (col.as_str(), op) {
                    ("is_available", ast::BinaryOperator::Eq) => available_only = parse_bool(value)?,
                    _ => return Err(SqlError::UnsupportedFilter(col.clone())),
                }
            }
            Ok(Command::SelectServices { available_only })
        }
        "appointments" => {
            let mut filter = AppointmentFilter::default();
            for (col, op, value) in &predicates {
                match (col.as_str(), op) {
                    ("service_id", ast::BinaryOperator::Eq) => {
                        filter.service_id = Some(parse_ulid(value)?)
                    }
                    ("status", ast::BinaryOperator::Eq) => {
                        let label = parse_text(value)?;
                        filter.status = Some(
                            AppointmentStatus::from_label(&label)
                                .ok_or_else(|| SqlError::Parse(format!("bad status: {label}")))?,
                        );
                    }
                    ("start_at", ast::BinaryOperator::GtEq) => {
                        filter.starts_from = Some(parse_i64(value)?)
                    }
                    ("end_at", ast::BinaryOperator::LtEq) => {
                        filter.ends_before = Some(parse_i64(value)?)
                    }
                    _ => return Err(SqlError::UnsupportedFilter(col.clone())),
                }
            }
            Ok(Command::SelectAppointments { filter })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten `a AND b AND ...` into `(column, operator, value)` triples.
fn collect_predicates<'a>(
    expr: &'a Expr,
    out: &mut Vec<(String, ast::BinaryOperator, &'a Expr)>,
) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_predicates(left, out)?;
            collect_predicates(right, out)
        }
        Expr::BinaryOp { left, op, right } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
            out.push((col, op.clone(), right.as_ref()));
            Ok(())
        }
        Expr::Nested(inner) => collect_predicates(inner, out),
        other => Err(SqlError::Unsupported(format!("WHERE {other}"))),
    }
}

// ── Column maps ───────────────────────────────────────────────

/// Column name → value expression, for one INSERT row or one SET list.
struct Columns<'a>(Vec<(String, &'a Expr)>);

impl<'a> Columns<'a> {
    /// Named columns when given; otherwise values map positionally onto
    /// the table's column order.
    fn from_insert(insert: &'a ast::Insert, table_columns: &[&str]) -> Result<Self, SqlError> {
        let values = extract_insert_values(insert)?;
        let names: Vec<String> = if insert.columns.is_empty() {
            table_columns.iter().map(|c| c.to_string()).collect()
        } else {
            insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
        };
        if values.len() != names.len() && !insert.columns.is_empty() {
            return Err(SqlError::WrongArity(names.len(), values.len()));
        }
        if values.len() > table_columns.len() {
            return Err(SqlError::WrongArity(table_columns.len(), values.len()));
        }
        let cols = Columns(names.into_iter().zip(values.iter()).collect());
        cols.only(table_columns)?;
        Ok(cols)
    }

    fn from_assignments(assignments: &'a [ast::Assignment]) -> Result<Self, SqlError> {
        let mut cols = Vec::with_capacity(assignments.len());
        for a in assignments {
            let name = match &a.target {
                AssignmentTarget::ColumnName(name) => object_name_last(name),
                AssignmentTarget::Tuple(_) => None,
            }
            .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
            cols.push((name, &a.value));
        }
        if cols.is_empty() {
            return Err(SqlError::Parse("UPDATE without SET".into()));
        }
        Ok(Columns(cols))
    }

    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.0.iter().find(|(c, _)| c == column).map(|(_, e)| *e)
    }

    fn require(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(column))
    }

    fn only(&self, allowed: &[&str]) -> Result<(), SqlError> {
        match self.0.iter().find(|(c, _)| !allowed.contains(&c.as_str())) {
            Some((c, _)) => Err(SqlError::UnknownColumn(c.clone())),
            None => Ok(()),
        }
    }

    fn opt_text(&self, column: &str) -> Result<Option<String>, SqlError> {
        self.get(column).map(parse_text_or_null).transpose().map(Option::flatten)
    }

    fn opt_decimal(&self, column: &str) -> Result<Option<Money>, SqlError> {
        self.get(column)
            .map(parse_decimal_or_null)
            .transpose()
            .map(Option::flatten)
    }

    fn ulid_or_new(&self, column: &str) -> Result<Ulid, SqlError> {
        match self.get(column) {
            Some(expr) if !is_null(expr) => parse_ulid(expr),
            _ => Ok(Ulid::new()),
        }
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
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
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
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.as_slice()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    match selection.as_ref() {
        Some(Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        }) if expr_column_name(left).as_deref() == Some("id") => parse_ulid(right),
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
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64(expr)?);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .trim()
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_decimal(expr: &Expr) -> Result<Money, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_decimal(expr)?);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => Money::from_str(s.trim())
            .map_err(|e| SqlError::Parse(format!("bad decimal {s:?}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected decimal, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_decimal_or_null(expr: &Expr) -> Result<Option<Money>, SqlError> {
    if is_null(expr) {
        Ok(None)
    } else {
        parse_decimal(expr).map(Some)
    }
}

fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::DoubleQuotedString(s)) => Ok(s.clone()),
        Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
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

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
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
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("expected {0} values, got {1}")]
    WrongArity(usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("unsupported filter on column: {0}")]
    UnsupportedFilter(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const SID: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

    #[test]
    fn parse_insert_service_named() {
        let sql = format!(
            "INSERT INTO services (id, title, category, price, is_available) VALUES ('{ID}', 'Room 12', 'Comfort', 4500.50, false)"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertService { input: s, .. } => {
                assert_eq!(s.id.to_string(), ID);
                assert_eq!(s.title, "Room 12");
                assert_eq!(s.category.as_deref(), Some("Comfort"));
                assert_eq!(s.price, dec!(4500.50));
                assert!(!s.available);
            }
            cmd => panic!("expected InsertService, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_service_defaults() {
        let sql = "INSERT INTO services (title, price) VALUES ('Massage', '3000')";
        match parse_sql(sql).unwrap() {
            Command::InsertService { input: s, .. } => {
                assert_eq!(s.category, None);
                assert_eq!(s.price, dec!(3000));
                assert!(s.available);
            }
            cmd => panic!("expected InsertService, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_appointment() {
        let sql = format!(
            "INSERT INTO appointments (service_id, client_name, client_phone, start_at, end_at) VALUES ('{SID}', 'Anna', '+79990000000', 36000000, 39600000)"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertAppointment { input: a, .. } => {
                assert_eq!(a.service_id.to_string(), SID);
                assert_eq!(a.client.name, "Anna");
                assert_eq!(a.client.email, None);
                assert_eq!((a.start, a.end), (36_000_000, 39_600_000));
                assert_eq!(a.total_price, None);
            }
            cmd => panic!("expected InsertAppointment, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_appointment_positional() {
        let sql = format!(
            "INSERT INTO appointments VALUES ('{ID}', '{SID}', 'Ivan', '123', 'ivan@example.com', 0, 1000, 99.90)"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertAppointment { input: a, .. } => {
                assert_eq!(a.id.to_string(), ID);
                assert_eq!(a.client.email.as_deref(), Some("ivan@example.com"));
                assert_eq!(a.total_price, Some(dec!(99.90)));
            }
            cmd => panic!("expected InsertAppointment, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_appointment_missing_column() {
        let sql = format!(
            "INSERT INTO appointments (service_id, client_name, start_at, end_at) VALUES ('{SID}', 'Anna', 0, 1)"
        );
        assert!(matches!(
            parse_sql(&sql),
            Err(SqlError::MissingColumn("client_phone"))
        ));
    }

    #[test]
    fn parse_insert_unknown_column() {
        let sql = "INSERT INTO payouts (amount, colour) VALUES (10, 'red')";
        assert!(matches!(parse_sql(sql), Err(SqlError::UnknownColumn(c)) if c == "colour"));
    }

    #[test]
    fn parse_insert_payout() {
        let sql = "INSERT INTO payouts (amount, comment) VALUES (3000, 'weekly')";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::InsertPayout {
                input: NewPayout {
                    amount: dec!(3000),
                    comment: Some("weekly".into()),
                    requested_by: None,
                },
                returning: false,
            }
        );
    }

    #[test]
    fn parse_insert_returning() {
        let sql = format!(
            "INSERT INTO appointments (service_id, client_name, client_phone, start_at, end_at) VALUES ('{SID}', 'Anna', '1', 0, 1) RETURNING *"
        );
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::InsertAppointment { returning: true, .. }
        ));
        assert!(matches!(
            parse_sql("INSERT INTO payouts (amount) VALUES (10) RETURNING *").unwrap(),
            Command::InsertPayout { returning: true, .. }
        ));
        assert!(matches!(
            parse_sql("INSERT INTO payouts (amount) VALUES (10) RETURNING id, status"),
            Err(SqlError::Unsupported(_))
        ));
    }

    #[test]
    fn parse_negative_amount_survives_parsing() {
        let sql = "INSERT INTO payouts (amount) VALUES (-5)";
        match parse_sql(sql).unwrap() {
            Command::InsertPayout { input: p, .. } => assert_eq!(p.amount, dec!(-5)),
            cmd => panic!("expected InsertPayout, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_update_status() {
        let sql = format!("UPDATE appointments SET status = 'cancelled' WHERE id = '{ID}'");
        match parse_sql(&sql).unwrap() {
            Command::SetAppointmentStatus { id, status } => {
                assert_eq!(id.to_string(), ID);
                assert_eq!(status, AppointmentStatus::Cancelled);
            }
            cmd => panic!("expected SetAppointmentStatus, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_update_status_mixed_with_details_errors() {
        let sql = format!("UPDATE appointments SET status = 'confirmed', start_at = 5 WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownColumn(_))));
    }

    #[test]
    fn parse_update_payment() {
        let sql = format!(
            r#"UPDATE appointments SET payment_status = 'paid', paid_amount = 1500, payment_id = 'pi_1', payment_meta = '{{"card":"4242"}}' WHERE id = '{ID}'"#
        );
        match parse_sql(&sql).unwrap() {
            Command::SetPaymentStatus { update, .. } => {
                assert_eq!(update.status, PaymentStatus::Paid);
                assert_eq!(update.amount, Some(dec!(1500)));
                assert_eq!(update.reference.as_deref(), Some("pi_1"));
                assert_eq!(update.meta, Some(serde_json::json!({"card": "4242"})));
            }
            cmd => panic!("expected SetPaymentStatus, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_update_appointment_details() {
        let sql = format!(
            "UPDATE appointments SET start_at = 1000, end_at = 2000, service_id = '{SID}' WHERE id = '{ID}'"
        );
        match parse_sql(&sql).unwrap() {
            Command::UpdateAppointment { patch, .. } => {
                assert_eq!(patch.start, Some(1000));
                assert_eq!(patch.end, Some(2000));
                assert_eq!(patch.service_id.map(|s| s.to_string()).as_deref(), Some(SID));
                assert_eq!(patch.client_name, None);
            }
            cmd => panic!("expected UpdateAppointment, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_update_requires_where_id() {
        let sql = "UPDATE appointments SET status = 'confirmed'";
        assert!(matches!(parse_sql(sql), Err(SqlError::MissingFilter("id"))));
    }

    #[test]
    fn parse_update_business_unit() {
        let sql = "UPDATE business_unit SET payout_provider = 'yookassa', payout_mode = 'live', payout_method = 'sbp'";
        match parse_sql(sql).unwrap() {
            Command::UpdateBusinessUnit { changes } => {
                assert_eq!(changes.payout_provider.as_deref(), Some("yookassa"));
                assert_eq!(changes.payout_mode, Some(PayoutMode::Live));
                assert_eq!(changes.payout_method, Some(PayoutMethod::Sbp));
                assert!(!changes.touches_profile());
            }
            cmd => panic!("expected UpdateBusinessUnit, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_update_business_unit_bad_mode() {
        let sql = "UPDATE business_unit SET payout_mode = 'sandbox'";
        assert!(parse_sql(sql).is_err());
    }

    #[test]
    fn parse_update_service() {
        let sql = format!("UPDATE services SET price = 1200, is_available = false WHERE id = '{ID}'");
        match parse_sql(&sql).unwrap() {
            Command::UpdateService { patch, .. } => {
                assert_eq!(patch.price, Some(dec!(1200)));
                assert_eq!(patch.available, Some(false));
                assert_eq!(patch.title, None);
            }
            cmd => panic!("expected UpdateService, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_deletes() {
        let sql = format!("DELETE FROM services WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&sql).unwrap(), Command::DeleteService { .. }));
        let sql = format!("DELETE FROM appointments WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&sql).unwrap(), Command::DeleteAppointment { .. }));
        let sql = format!("DELETE FROM payouts WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn parse_select_appointments_with_filters() {
        let sql = format!(
            "SELECT * FROM appointments WHERE service_id = '{SID}' AND status = 'confirmed' AND start_at >= 1000 AND end_at <= 2000"
        );
        match parse_sql(&sql).unwrap() {
            Command::SelectAppointments { filter } => {
                assert_eq!(filter.service_id.map(|s| s.to_string()).as_deref(), Some(SID));
                assert_eq!(filter.status, Some(AppointmentStatus::Confirmed));
                assert_eq!(filter.starts_from, Some(1000));
                assert_eq!(filter.ends_before, Some(2000));
            }
            cmd => panic!("expected SelectAppointments, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_select_unsupported_filter() {
        let sql = "SELECT * FROM appointments WHERE client_name = 'Anna'";
        assert!(matches!(parse_sql(sql), Err(SqlError::UnsupportedFilter(_))));
    }

    #[test]
    fn parse_select_read_models() {
        assert_eq!(parse_sql("SELECT * FROM balance").unwrap(), Command::SelectBalance);
        assert_eq!(parse_sql("SELECT * FROM summary").unwrap(), Command::SelectSummary);
        assert_eq!(parse_sql("SELECT * FROM payouts").unwrap(), Command::SelectPayouts);
        assert_eq!(
            parse_sql("SELECT * FROM business_unit").unwrap(),
            Command::SelectBusinessUnit
        );
        assert_eq!(
            parse_sql("SELECT * FROM services WHERE is_available = true").unwrap(),
            Command::SelectServices { available_only: true }
        );
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = format!("INSERT INTO rooms (id) VALUES ('{ID}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn parse_multi_row_insert_unsupported() {
        let sql = "INSERT INTO payouts (amount) VALUES (1), (2)";
        assert!(matches!(parse_sql(sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
