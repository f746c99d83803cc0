use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::SharedPasswordAuth;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;

pub struct SlotledgerHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<SlotledgerQueryParser>,
}

impl SlotledgerHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(SlotledgerQueryParser),
        }
    }

    /// The connection's database name selects the tenant.
    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("tenant error: {e}")))
    }

    async fn run(&self, engine: &Engine, query: &str) -> PgWireResult<Vec<Response>> {
        let started = Instant::now();
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);
        let result = self.execute_command(engine, cmd).await;

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::SelectBusinessUnit => {
                let unit = engine.business_unit().await;
                Ok(vec![rows_response(
                    business_unit_schema(),
                    &[unit],
                    encode_business_unit,
                )])
            }
            Command::UpdateBusinessUnit { changes } => {
                engine.apply_unit_changes(changes).await.map_err(engine_err)?;
                Ok(vec![tag("UPDATE", 1)])
            }
            Command::InsertService { input, returning } => {
                let service = engine.create_service(input).await.map_err(engine_err)?;
                Ok(vec![inserted(returning, services_schema(), service, encode_service)])
            }
            Command::UpdateService { id, patch } => {
                engine.update_service(id, patch).await.map_err(engine_err)?;
                Ok(vec![tag("UPDATE", 1)])
            }
            Command::DeleteService { id } => {
                engine.delete_service(id).await.map_err(engine_err)?;
                Ok(vec![tag("DELETE", 1)])
            }
            Command::SelectServices { available_only } => {
                let services = engine.services_of(available_only).await;
                Ok(vec![rows_response(services_schema(), &services, encode_service)])
            }
            Command::InsertAppointment { input, returning } => {
                let appointment = engine.create_appointment(input).await.map_err(engine_err)?;
                Ok(vec![inserted(
                    returning,
                    appointments_schema(),
                    appointment,
                    encode_appointment,
                )])
            }
            Command::UpdateAppointment { id, patch } => {
                engine.update_appointment(id, patch).await.map_err(engine_err)?;
                Ok(vec![tag("UPDATE", 1)])
            }
            Command::SetAppointmentStatus { id, status } => {
                engine
                    .set_appointment_status(id, status)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![tag("UPDATE", 1)])
            }
            Command::SetPaymentStatus { id, update } => {
                engine.set_payment_status(id, update).await.map_err(engine_err)?;
                Ok(vec![tag("UPDATE", 1)])
            }
            Command::DeleteAppointment { id } => {
                engine.delete_appointment(id).await.map_err(engine_err)?;
                Ok(vec![tag("DELETE", 1)])
            }
            Command::SelectAppointments { filter } => {
                let appointments = engine.list_appointments(&filter).await;
                Ok(vec![rows_response(
                    appointments_schema(),
                    &appointments,
                    encode_appointment,
                )])
            }
            Command::InsertPayout { input, returning } => {
                let payout = engine.request_payout(input).await.map_err(engine_err)?;
                Ok(vec![inserted(returning, payouts_schema(), payout, encode_payout)])
            }
            Command::SelectPayouts => {
                let payouts = engine.list_payouts().await;
                Ok(vec![rows_response(payouts_schema(), &payouts, encode_payout)])
            }
            Command::SelectBalance => {
                let balance = engine.compute_balance().await;
                let currency = engine.business_unit().await.currency;
                Ok(vec![rows_response(
                    balance_schema(),
                    &[(balance, currency)],
                    encode_balance,
                )])
            }
            Command::SelectSummary => {
                let summary = engine.summary().await;
                Ok(vec![rows_response(summary_schema(), &[summary], encode_summary)])
            }
        }
    }
}

fn tag(command: &str, rows: usize) -> Response {
    Response::Execution(Tag::new(command).with_rows(rows))
}

/// `INSERT 1`, or the stored row for `INSERT ... RETURNING *`.
fn inserted<T>(
    returning: bool,
    schema: Vec<FieldInfo>,
    row: T,
    encode: fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    if returning {
        rows_response(schema, &[row], encode)
    } else {
        tag("INSERT", 1)
    }
}

// ── Row schemas ──────────────────────────────────────────────────

fn field(name: &str, datatype: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, datatype, FieldFormat::Text)
}

fn business_unit_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("slug", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("currency", Type::VARCHAR),
        field("payout_method", Type::VARCHAR),
        field("payout_provider", Type::VARCHAR),
        field("payout_mode", Type::VARCHAR),
        field("payout_account", Type::VARCHAR),
        field("payout_name", Type::VARCHAR),
        field("payout_bank", Type::VARCHAR),
        field("payout_bik", Type::VARCHAR),
        field("payout_inn", Type::VARCHAR),
        field("payout_kpp", Type::VARCHAR),
        field("payout_provider_extra", Type::VARCHAR),
        field("webhook_secret_set", Type::BOOL),
        field("created_at", Type::INT8),
    ]
}

fn services_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("title", Type::VARCHAR),
        field("category", Type::VARCHAR),
        field("price", Type::NUMERIC),
        field("is_available", Type::BOOL),
    ]
}

fn appointments_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("service_id", Type::VARCHAR),
        field("client_name", Type::VARCHAR),
        field("client_phone", Type::VARCHAR),
        field("client_email", Type::VARCHAR),
        field("start_at", Type::INT8),
        field("end_at", Type::INT8),
        field("total_price", Type::NUMERIC),
        field("status", Type::VARCHAR),
        field("payment_status", Type::VARCHAR),
        field("payment_provider", Type::VARCHAR),
        field("payment_id", Type::VARCHAR),
        field("paid_amount", Type::NUMERIC),
        field("paid_at", Type::INT8),
        field("payment_meta", Type::VARCHAR),
        field("created_at", Type::INT8),
    ]
}

fn payouts_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("amount", Type::NUMERIC),
        field("fee", Type::NUMERIC),
        field("amount_after_fee", Type::NUMERIC),
        field("currency", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("provider", Type::VARCHAR),
        field("provider_payout_id", Type::VARCHAR),
        field("comment", Type::VARCHAR),
        field("requested_by", Type::VARCHAR),
        field("meta", Type::VARCHAR),
        field("created_at", Type::INT8),
        field("processed_at", Type::INT8),
    ]
}

fn balance_schema() -> Vec<FieldInfo> {
    vec![
        field("paid_total", Type::NUMERIC),
        field("reserved", Type::NUMERIC),
        field("paid_out", Type::NUMERIC),
        field("available", Type::NUMERIC),
        field("currency", Type::VARCHAR),
    ]
}

fn summary_schema() -> Vec<FieldInfo> {
    vec![
        field("total_appointments", Type::INT8),
        field("active_appointments", Type::INT8),
        field("confirmed_revenue", Type::NUMERIC),
        field("services", Type::INT8),
        field("occupancy_rate", Type::NUMERIC),
        field("revenue_by_month", Type::VARCHAR),
        field("weekday_bookings", Type::VARCHAR),
        field("top_services", Type::VARCHAR),
    ]
}

/// Result schema of a SELECT or an `INSERT ... RETURNING`, found by table
/// name so that statements with unbound `$n` placeholders can still be
/// described.
fn schema_for(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    let lower = lower.trim_start();
    let marker = if lower.starts_with("select") {
        " from "
    } else if lower.starts_with("insert") && lower.contains(" returning ") {
        " into "
    } else {
        return vec![];
    };
    let Some(table) = lower
        .split(marker)
        .nth(1)
        .and_then(|rest| rest.split_whitespace().next())
    else {
        return vec![];
    };
    match table.trim_end_matches(';').split('(').next().unwrap_or_default() {
        "business_unit" => business_unit_schema(),
        "services" => services_schema(),
        "appointments" => appointments_schema(),
        "payouts" => payouts_schema(),
        "balance" => balance_schema(),
        "summary" => summary_schema(),
        _ => vec![],
    }
}

// ── Row encoding ─────────────────────────────────────────────────

fn rows_response<T>(
    schema: Vec<FieldInfo>,
    items: &[T],
    encode: fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn encode_business_unit(enc: &mut DataRowEncoder, unit: &BusinessUnit) -> PgWireResult<()> {
    enc.encode_field(&unit.id.to_string())?;
    enc.encode_field(&unit.slug)?;
    enc.encode_field(&unit.name)?;
    enc.encode_field(&unit.currency)?;
    enc.encode_field(&unit.payout.method.as_str())?;
    enc.encode_field(&unit.payout.provider)?;
    enc.encode_field(&unit.payout.mode.as_str())?;
    enc.encode_field(&unit.payout.account)?;
    let recipient = &unit.payout.recipient;
    enc.encode_field(&recipient.name)?;
    enc.encode_field(&recipient.bank)?;
    enc.encode_field(&recipient.bik)?;
    enc.encode_field(&recipient.inn)?;
    enc.encode_field(&recipient.kpp)?;
    enc.encode_field(&unit.payout.provider_extra)?;
    enc.encode_field(&!unit.payout.webhook_secret.is_empty())?;
    enc.encode_field(&unit.created_at)
}

fn encode_service(enc: &mut DataRowEncoder, s: &Service) -> PgWireResult<()> {
    enc.encode_field(&s.id.to_string())?;
    enc.encode_field(&s.title)?;
    enc.encode_field(&s.category)?;
    enc.encode_field(&s.price.to_string())?;
    enc.encode_field(&s.available)
}

fn encode_appointment(enc: &mut DataRowEncoder, a: &Appointment) -> PgWireResult<()> {
    enc.encode_field(&a.id.to_string())?;
    enc.encode_field(&a.service_id.to_string())?;
    enc.encode_field(&a.client.name)?;
    enc.encode_field(&a.client.phone)?;
    enc.encode_field(&a.client.email)?;
    enc.encode_field(&a.span.start)?;
    enc.encode_field(&a.span.end)?;
    enc.encode_field(&a.total_price.to_string())?;
    enc.encode_field(&a.status.as_str())?;
    enc.encode_field(&a.payment.status.as_str())?;
    enc.encode_field(&a.payment.provider)?;
    enc.encode_field(&a.payment.reference)?;
    enc.encode_field(&a.payment.paid_amount.map(|m| m.to_string()))?;
    enc.encode_field(&a.payment.paid_at)?;
    enc.encode_field(&meta_to_text(&a.payment.meta))?;
    enc.encode_field(&a.created_at)
}

fn encode_payout(enc: &mut DataRowEncoder, p: &PayoutRequest) -> PgWireResult<()> {
    enc.encode_field(&p.id.to_string())?;
    enc.encode_field(&p.amount.to_string())?;
    enc.encode_field(&p.fee.to_string())?;
    enc.encode_field(&p.amount_after_fee().to_string())?;
    enc.encode_field(&p.currency)?;
    enc.encode_field(&p.status.as_str())?;
    enc.encode_field(&p.provider)?;
    enc.encode_field(&p.provider_payout_id)?;
    enc.encode_field(&p.comment)?;
    enc.encode_field(&p.requested_by)?;
    enc.encode_field(&meta_to_text(&p.meta))?;
    enc.encode_field(&p.created_at)?;
    enc.encode_field(&p.processed_at)
}

fn encode_balance(enc: &mut DataRowEncoder, row: &(Balance, String)) -> PgWireResult<()> {
    let (b, currency) = row;
    enc.encode_field(&b.paid_total.to_string())?;
    enc.encode_field(&b.reserved.to_string())?;
    enc.encode_field(&b.paid_out.to_string())?;
    enc.encode_field(&b.available.to_string())?;
    enc.encode_field(currency)
}

fn encode_summary(enc: &mut DataRowEncoder, s: &Summary) -> PgWireResult<()> {
    enc.encode_field(&(s.total_appointments as i64))?;
    enc.encode_field(&(s.active_appointments as i64))?;
    enc.encode_field(&s.confirmed_revenue.to_string())?;
    enc.encode_field(&(s.services as i64))?;
    enc.encode_field(&s.occupancy_rate.to_string())?;
    enc.encode_field(&json_text(&s.revenue_by_month)?)?;
    enc.encode_field(&json_text(&s.weekday_bookings)?)?;
    enc.encode_field(&json_text(&s.top_services)?)
}

fn json_text<T: serde::Serialize>(value: &T) -> PgWireResult<String> {
    serde_json::to_string(value).map_err(|e| PgWireError::ApiError(Box::new(e)))
}

#[async_trait]
impl SimpleQueryHandler for SlotledgerHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        self.run(&engine, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotledgerQueryParser;

#[async_trait]
impl QueryParser for SlotledgerQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(schema_for(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotledgerHandler {
    type Statement = String;
    type QueryParser = SlotledgerQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        self.run(&engine, &sql)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| user_error("XX000", "statement produced no response".into()))
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            schema_for(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(schema_for(
            &target.statement.statement,
        )))
    }
}

/// `$N` placeholders outside quoted literals and identifiers, as
/// `(byte range, N)` in statement order.
fn placeholders(sql: &str) -> Vec<(std::ops::Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if let Some(q) = quote {
            // A doubled quote is an escaped quote and keeps the literal open.
            if b == q {
                if bytes.get(i + 1) == Some(&q) {
                    i += 1;
                } else {
                    quote = None;
                }
            }
            i += 1;
            continue;
        }
        match b {
            b'\'' | b'"' => {
                quote = Some(b);
                i += 1;
            }
            b'$' => {
                let start = i;
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if let Ok(n) = sql[start + 1..i].parse::<usize>() {
                    found.push((start..i, n));
                }
            }
            _ => i += 1,
        }
    }
    found
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Replace each placeholder with its bound value (text format) in a single
/// pass over the statement. Values are quoted literals and never rescanned.
fn bind_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut copied = 0;
    for (range, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
            continue;
        };
        result.push_str(&sql[copied..range.start]);
        match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                result.push('\'');
                result.push_str(&text.replace('\'', "''"));
                result.push('\'');
            }
            None => result.push_str("NULL"),
        }
        copied = range.end;
    }
    result.push_str(&sql[copied..]);
    result
}

fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters)
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotledgerFactory {
    handler: Arc<SlotledgerHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<SharedPasswordAuth, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl SlotledgerFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        Self {
            handler: Arc::new(SlotledgerHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                SharedPasswordAuth::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotledgerFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = SlotledgerFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation(_) | EngineError::WebhookMapping(_) => "22023",
        EngineError::Conflict { .. } => "23P01",
        EngineError::NotFound(..) => "02000",
        EngineError::AlreadyExists(..) => "23505",
        EngineError::InsufficientBalance { .. } | EngineError::InvalidTransition { .. } => "55000",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::Wal(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
