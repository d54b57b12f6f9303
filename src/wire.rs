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
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo, QueryResponse,
    Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::data::DataRow;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use ulid::Ulid;

use crate::auth::NestbookAuthSource;
use crate::engine::{ConflictReason, Engine, EngineError, ReserveRequest};
use crate::model::*;
use crate::observability as obs;
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;

pub struct NestbookHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<NestbookQueryParser>,
}

impl NestbookHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(NestbookQueryParser),
        }
    }

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

    /// Parse, run and time one statement.
    async fn run(&self, engine: &Engine, sql: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = obs::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(obs::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(obs::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            Command::InsertApartment {
                id,
                max_capacity,
                enabled_capacities,
                capabilities,
                name,
            } => {
                let tiers = enabled_capacities.unwrap_or_else(|| vec![max_capacity]);
                engine
                    .create_apartment(id, name, max_capacity, tiers, capabilities)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateCapabilities {
                id,
                allow_full,
                allow_bedroom,
                allow_bed,
            } => {
                let current = engine.get_inventory(id).map_err(engine_err)?.capabilities;
                let next = Capabilities {
                    allow_full_reservation: allow_full.unwrap_or(current.allow_full_reservation),
                    allow_bedroom_reservation: allow_bedroom.unwrap_or(current.allow_bedroom_reservation),
                    allow_bed_reservation: allow_bed.unwrap_or(current.allow_bed_reservation),
                };
                engine.set_capabilities(id, next).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteApartment { id } => {
                engine.delete_apartment(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertBedroom {
                id,
                apartment_id,
                base_capacity,
                max_capacity,
                allow_extra_beds,
                pricing_mode,
            } => {
                engine
                    .add_bedroom(id, apartment_id, base_capacity, max_capacity, allow_extra_beds, pricing_mode)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertBed {
                id,
                bedroom_id,
                label,
                bed_type,
                monthly_price,
                deposit,
                capacity,
            } => {
                engine
                    .add_bed(id, bedroom_id, label, bed_type, monthly_price, deposit, capacity)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertReservation {
                id,
                apartment_id,
                granularity,
                target_id,
                holder_id,
            } => {
                let req = ReserveRequest {
                    id,
                    apartment_id,
                    granularity,
                    target_id,
                    holder_id,
                };
                engine.attempt_reserve(req).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::CancelReservation { id } => {
                engine.cancel_reservation(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectApartments => {
                let schema = Arc::new(apartments_schema());
                let rows = engine
                    .list_apartments()
                    .into_iter()
                    .map(|a| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&a.id.to_string())?;
                        encoder.encode_field(&a.name)?;
                        encoder.encode_field(&i64::from(a.max_capacity))?;
                        encoder.encode_field(&a.capabilities.allow_full_reservation)?;
                        encoder.encode_field(&a.capabilities.allow_bedroom_reservation)?;
                        encoder.encode_field(&a.capabilities.allow_bed_reservation)?;
                        encoder.encode_field(&(a.bedrooms as i64))?;
                        encoder.encode_field(&(a.beds as i64))?;
                        encoder.encode_field(&(a.active_reservations as i64))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(query_response(schema, rows))
            }
            Command::SelectBedrooms { apartment_id } => {
                let apt = engine.get_inventory(apartment_id).map_err(engine_err)?;
                let schema = Arc::new(bedrooms_schema());
                let apt_str = apt.id.to_string();
                let rows = apt
                    .bedrooms
                    .iter()
                    .map(|room| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&room.id.to_string())?;
                        encoder.encode_field(&apt_str)?;
                        encoder.encode_field(&i64::from(room.base_capacity))?;
                        encoder.encode_field(&i64::from(room.max_capacity))?;
                        encoder.encode_field(&room.allow_extra_beds)?;
                        encoder.encode_field(&room.pricing_mode.as_str())?;
                        encoder.encode_field(&(room.beds.len() as i64))?;
                        encoder.encode_field(&room.is_furnished())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(query_response(schema, rows))
            }
            Command::SelectBeds { apartment_id } => {
                let apt = engine.get_inventory(apartment_id).map_err(engine_err)?;
                let schema = Arc::new(beds_schema());
                let rows = apt
                    .bedrooms
                    .iter()
                    .flat_map(|room| room.beds.iter().map(move |bed| (room.id, bed)))
                    .map(|(room_id, bed)| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&bed.id.to_string())?;
                        encoder.encode_field(&room_id.to_string())?;
                        encoder.encode_field(&bed.label)?;
                        encoder.encode_field(&bed.bed_type)?;
                        encoder.encode_field(&money(bed.monthly_price))?;
                        encoder.encode_field(&money(bed.deposit))?;
                        encoder.encode_field(&i64::from(bed.capacity))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(query_response(schema, rows))
            }
            Command::SelectReservations { apartment_id } => {
                let reservations = engine.get_reservations(apartment_id).await.map_err(engine_err)?;
                let schema = Arc::new(reservations_schema());
                let rows = reservations
                    .iter()
                    .map(|r| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&r.id.to_string())?;
                        encoder.encode_field(&r.apartment_id.to_string())?;
                        encoder.encode_field(&r.granularity.as_str())?;
                        encoder.encode_field(&r.target_id.to_string())?;
                        encoder.encode_field(&r.holder_id)?;
                        encoder.encode_field(&r.status.as_str())?;
                        encoder.encode_field(&r.created_at)?;
                        encoder.encode_field(&r.cancelled_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(query_response(schema, rows))
            }
            Command::SelectAvailability { apartment_id } => {
                let (snap, view) = engine.get_availability_detail(apartment_id).map_err(engine_err)?;
                let schema = Arc::new(availability_schema());
                let apt_str = apartment_id.to_string();

                let mut units: Vec<(Ulid, Granularity, Option<Ulid>, bool, Option<ConflictReason>)> =
                    vec![(apartment_id, Granularity::Apartment, None, view.apartment_reservable, view.apartment_block)];
                for room in &snap.apartment.bedrooms {
                    let ok = view.can_reserve_bedroom.get(&room.id).copied().unwrap_or(false);
                    let block = view.bedroom_blocks.get(&room.id).copied();
                    units.push((room.id, Granularity::Bedroom, Some(apartment_id), ok, block));
                    for bed in &room.beds {
                        let ok = view.can_reserve_bed.get(&bed.id).copied().unwrap_or(false);
                        let block = view.bed_blocks.get(&bed.id).copied();
                        units.push((bed.id, Granularity::Bed, Some(room.id), ok, block));
                    }
                }

                let rows = units
                    .into_iter()
                    .map(|(unit_id, granularity, parent_id, available, block)| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&apt_str)?;
                        encoder.encode_field(&unit_id.to_string())?;
                        encoder.encode_field(&granularity.as_str())?;
                        encoder.encode_field(&parent_id.map(|p| p.to_string()))?;
                        encoder.encode_field(&available)?;
                        encoder.encode_field(&block.map(|b| b.as_str()))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(query_response(schema, rows))
            }
            Command::SelectAvailabilitySummary { apartment_id } => {
                let view = engine.get_availability(apartment_id).map_err(engine_err)?;
                let schema = Arc::new(availability_summary_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&apartment_id.to_string())?;
                encoder.encode_field(&view.listed)?;
                encoder.encode_field(&view.apartment_reservable)?;
                encoder.encode_field(&view.is_apartment_locked)?;
                encoder.encode_field(&view.has_any_bed_reserved)?;
                encoder.encode_field(&view.has_any_bedroom_reserved)?;
                encoder.encode_field(&(view.available_bedrooms_count as i64))?;
                encoder.encode_field(&(view.total_bedrooms_count as i64))?;
                encoder.encode_field(&(view.available_beds_count as i64))?;
                encoder.encode_field(&(view.total_beds_count as i64))?;
                encoder.encode_field(&view.reason)?;
                encoder.encode_field(&view.has_integrity_violation())?;
                Ok(query_response(schema, vec![Ok(encoder.take_row())]))
            }
        }
    }
}

fn query_response(schema: Arc<Vec<FieldInfo>>, rows: Vec<PgWireResult<DataRow>>) -> Response {
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

/// Minor units rendered as a fixed two-decimal string, e.g. `45000` → `"450.00"`.
fn money(minor: u64) -> String {
    format!("{}.{:02}", minor / 100, minor % 100)
}

// ── Result schemas ───────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn apartments_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("max_capacity", Type::INT8),
        field("allow_full", Type::BOOL),
        field("allow_bedroom", Type::BOOL),
        field("allow_bed", Type::BOOL),
        field("bedrooms", Type::INT8),
        field("beds", Type::INT8),
        field("active_reservations", Type::INT8),
    ]
}

fn bedrooms_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("apartment_id", Type::VARCHAR),
        field("base_capacity", Type::INT8),
        field("max_capacity", Type::INT8),
        field("allow_extra_beds", Type::BOOL),
        field("pricing_mode", Type::VARCHAR),
        field("beds", Type::INT8),
        field("furnished", Type::BOOL),
    ]
}

fn beds_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("bedroom_id", Type::VARCHAR),
        field("label", Type::VARCHAR),
        field("bed_type", Type::VARCHAR),
        field("monthly_price", Type::VARCHAR),
        field("deposit", Type::VARCHAR),
        field("capacity", Type::INT8),
    ]
}

fn reservations_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("apartment_id", Type::VARCHAR),
        field("granularity", Type::VARCHAR),
        field("target_id", Type::VARCHAR),
        field("holder_id", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("created_at", Type::INT8),
        field("cancelled_at", Type::INT8),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        field("apartment_id", Type::VARCHAR),
        field("unit_id", Type::VARCHAR),
        field("granularity", Type::VARCHAR),
        field("parent_id", Type::VARCHAR),
        field("available", Type::BOOL),
        field("reason", Type::VARCHAR),
    ]
}

fn availability_summary_schema() -> Vec<FieldInfo> {
    vec![
        field("apartment_id", Type::VARCHAR),
        field("listed", Type::BOOL),
        field("apartment_reservable", Type::BOOL),
        field("is_apartment_locked", Type::BOOL),
        field("has_any_bed_reserved", Type::BOOL),
        field("has_any_bedroom_reserved", Type::BOOL),
        field("available_bedrooms", Type::INT8),
        field("total_bedrooms", Type::INT8),
        field("available_beds", Type::INT8),
        field("total_beds", Type::INT8),
        field("reason", Type::VARCHAR),
        field("integrity_violation", Type::BOOL),
    ]
}

/// Result columns for a statement, decided from its FROM table. Works on the
/// raw text so statements with `$n` placeholders can be described.
fn result_schema(stmt: &str) -> Vec<FieldInfo> {
    let mut tokens = stmt.split_whitespace();
    let is_select = tokens
        .next()
        .is_some_and(|t| t.eq_ignore_ascii_case("select"));
    if !is_select {
        return vec![];
    }
    let table = tokens
        .skip_while(|t| !t.eq_ignore_ascii_case("from"))
        .nth(1)
        .map(|t| t.trim_end_matches(';').to_lowercase());
    match table.as_deref() {
        Some("apartments") => apartments_schema(),
        Some("bedrooms") => bedrooms_schema(),
        Some("beds") => beds_schema(),
        Some("reservations") => reservations_schema(),
        Some("availability") => availability_schema(),
        Some("availability_summary") => availability_summary_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for NestbookHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        Ok(vec![self.run(&engine, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct NestbookQueryParser;

#[async_trait]
impl QueryParser for NestbookQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(&self, stmt: &String, _column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for NestbookHandler {
    type Statement = String;
    type QueryParser = NestbookQueryParser;

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
        self.run(&engine, &sql).await
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
        Ok(DescribeStatementResponse::new(param_types, result_schema(&target.statement)))
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
        Ok(DescribePortalResponse::new(result_schema(&target.statement.statement)))
    }
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Inline bound text parameters as quoted literals. Highest index first so
/// `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut sql = portal.statement.statement.clone();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        sql = sql.replace(&format!("${}", i + 1), &value);
    }
    sql
}

// ── Factory ──────────────────────────────────────────────────────

pub struct NestbookFactory {
    handler: Arc<NestbookHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<NestbookAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl NestbookFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        Self {
            handler: Arc::new(NestbookHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                NestbookAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for NestbookFactory {
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
    let factory = Arc::new(NestbookFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Error mapping ────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

/// SQLSTATE for an engine error. Conflicts are exclusion violations, which
/// clients treat as "pick another unit", not as a server fault.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Conflict(_) => "23P01",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::NotFound(_) => "P0002",
        EngineError::Invalid(_) => "22023",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::HasActiveReservations(_) => "55006",
        EngineError::Timeout => "57014",
        EngineError::Transient(_) => "40001",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
