use std::fmt::Debug;
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
    Response,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::data::DataRow;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::debug;

use crate::auth::InnkeepAuthSource;
use crate::engine::{now_ms, Engine, EngineError};
use crate::facility::FacilityManager;
use crate::model::*;
use crate::observability::{self, command_label};
use crate::sql::{self, Command, SqlError};

pub struct InnkeepHandler {
    facilities: Arc<FacilityManager>,
    query_parser: Arc<InnkeepQueryParser>,
}

impl InnkeepHandler {
    pub fn new(facilities: Arc<FacilityManager>) -> Self {
        Self {
            facilities,
            query_parser: Arc::new(InnkeepQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.facilities.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("facility error: {e}"),
            )))
        })
    }

    /// Execute one parsed command and record its metrics.
    async fn run(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = execute_command(engine, cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    /// Run a batch in order. A failure ends the batch: the statements before it
    /// stay applied and their results are returned ahead of the error.
    async fn run_batch(&self, engine: &Engine, commands: Vec<Command>) -> PgWireResult<Vec<Response>> {
        let mut responses = Vec::with_capacity(commands.len());
        for cmd in commands {
            match self.run(engine, cmd).await {
                Ok(response) => responses.push(response),
                Err(e) if responses.is_empty() => return Err(e),
                Err(PgWireError::UserError(info)) => {
                    responses.push(Response::Error(info));
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(responses)
    }
}

fn count_invalid<T>(parsed: Result<T, SqlError>) -> PgWireResult<T> {
    parsed.map_err(|e| {
        metrics::counter!(observability::QUERIES_TOTAL, "command" => "invalid", "status" => "error").increment(1);
        sql_err(e)
    })
}

async fn execute_command(engine: &Engine, cmd: Command) -> PgWireResult<Response> {
    match cmd {
        Command::InsertResource { id, kind, capacity, zone } => {
            let id = engine
                .register_resource(Resource::new(id, kind, capacity, zone))
                .await
                .map_err(engine_err)?;
            let resource = engine.get_resource(&id).await.map_err(engine_err)?;
            resource_rows(vec![resource])
        }
        Command::RetireResource { id } => {
            let resource = engine.retire_resource(&id).await.map_err(engine_err)?;
            resource_rows(vec![resource])
        }
        Command::MarkClean { id } => {
            let resource = engine.mark_clean(&id).await.map_err(engine_err)?;
            resource_rows(vec![resource])
        }
        Command::InsertReservation(draft) => {
            let reservation = engine.create_reservation(draft).await.map_err(engine_err)?;
            reservation_rows(vec![reservation])
        }
        Command::AssignResource { id, resource_id } => {
            let reservation = engine.assign_resource(id, &resource_id).await.map_err(engine_err)?;
            reservation_rows(vec![reservation])
        }
        Command::CheckIn { id } => reservation_rows(vec![engine.check_in(id).await.map_err(engine_err)?]),
        Command::CheckOut { id } => reservation_rows(vec![engine.check_out(id).await.map_err(engine_err)?]),
        Command::CancelReservation { id } => reservation_rows(vec![engine.cancel(id).await.map_err(engine_err)?]),
        Command::UpdateReservation { id, patch } => {
            let reservation = engine.update(id, patch).await.map_err(engine_err)?;
            reservation_rows(vec![reservation])
        }
        Command::SelectReservation { id } => {
            reservation_rows(vec![engine.get_reservation(id).map_err(engine_err)?])
        }
        Command::SelectReservations(filter) => {
            reservation_rows(engine.list_reservations(&filter).map_err(engine_err)?)
        }
        Command::SearchReservations { term } => reservation_rows(engine.search(&term).map_err(engine_err)?),
        Command::SelectResources { kind } => resource_rows(engine.list_resources(kind).await),
        Command::SelectSuggestions { kind, span, min_capacity } => {
            let suggestions = engine
                .suggest_resources(kind, span, min_capacity)
                .await
                .map_err(engine_err)?;
            resource_rows(suggestions)
        }
        Command::SelectAvailability { resource_id, span } => {
            let slots = engine.free_windows(&resource_id, span).await.map_err(engine_err)?;
            let schema = Arc::new(availability_schema());
            let rows: Vec<PgWireResult<_>> = slots
                .into_iter()
                .map(|slot| {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&resource_id)?;
                    encoder.encode_field(&slot.start)?;
                    encoder.encode_field(&slot.end)?;
                    Ok(encoder.take_row())
                })
                .collect();
            Ok(query_response(schema, rows))
        }
        Command::SelectOccupancy { kind, at } => {
            let at = at.unwrap_or_else(now_ms);
            let rate = engine.occupancy_rate(kind, at).await;
            let schema = Arc::new(occupancy_schema());
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&kind.to_string())?;
            encoder.encode_field(&at)?;
            encoder.encode_field(&rate)?;
            Ok(query_response(schema, vec![Ok(encoder.take_row())]))
        }
        Command::SelectBoard { kind, at } => {
            let board = engine.resource_board(kind, at.unwrap_or_else(now_ms)).await;
            let schema = Arc::new(board_schema());
            let rows: Vec<PgWireResult<_>> = board
                .into_iter()
                .map(|entry| {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&entry.resource.id)?;
                    encoder.encode_field(&entry.resource.kind.to_string())?;
                    encoder.encode_field(&entry.resource.zone)?;
                    encoder.encode_field(&i64::from(entry.resource.capacity))?;
                    encoder.encode_field(&entry.state.as_str().to_string())?;
                    encoder.encode_field(&entry.reservation_id.map(|id| id.to_string()))?;
                    encoder.encode_field(&entry.guest_name)?;
                    Ok(encoder.take_row())
                })
                .collect();
            Ok(query_response(schema, rows))
        }
        Command::SelectArrivals { span } => {
            reservation_rows(engine.arrivals_in_window(span.start, span.end).map_err(engine_err)?)
        }
        Command::SelectDepartures { span } => {
            reservation_rows(engine.departures_in_window(span.start, span.end).map_err(engine_err)?)
        }
        Command::SelectDashboard { at } => {
            let summary = engine
                .dashboard_summary(at.unwrap_or_else(now_ms))
                .await
                .map_err(engine_err)?;
            let schema = Arc::new(dashboard_schema());
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&summary.at)?;
            encoder.encode_field(&summary.room_occupancy)?;
            encoder.encode_field(&summary.hall_occupancy)?;
            for status in Status::ALL {
                encoder.encode_field(&(summary.counts.get(status) as i64))?;
            }
            encoder.encode_field(&(summary.arrivals.len() as i64))?;
            encoder.encode_field(&(summary.departures.len() as i64))?;
            Ok(query_response(schema, vec![Ok(encoder.take_row())]))
        }
    }
}

fn query_response(schema: Arc<Vec<FieldInfo>>, rows: Vec<PgWireResult<DataRow>>) -> Response {
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn reservation_rows(reservations: Vec<Reservation>) -> PgWireResult<Response> {
    let schema = Arc::new(reservation_schema());
    let rows: Vec<PgWireResult<_>> = reservations
        .into_iter()
        .map(|r| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&r.guest.name)?;
            encoder.encode_field(&r.guest.contact)?;
            encoder.encode_field(&r.resource_id)?;
            encoder.encode_field(&r.span.start)?;
            encoder.encode_field(&r.span.end)?;
            encoder.encode_field(&i64::from(r.party_size))?;
            encoder.encode_field(&r.status.to_string())?;
            encoder.encode_field(&r.guest.id_number)?;
            encoder.encode_field(&r.guest.designation)?;
            encoder.encode_field(&r.guest.department)?;
            encoder.encode_field(&r.purpose)?;
            encoder.encode_field(&r.notes)?;
            encoder.encode_field(&r.correlation_id.map(|id| id.to_string()))?;
            encoder.encode_field(&r.created_at)?;
            encoder.encode_field(&r.updated_at)?;
            encoder.encode_field(&r.checked_in_at)?;
            encoder.encode_field(&r.checked_out_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(query_response(schema, rows))
}

fn resource_rows(resources: Vec<Resource>) -> PgWireResult<Response> {
    let schema = Arc::new(resource_schema());
    let rows: Vec<PgWireResult<_>> = resources
        .into_iter()
        .map(|r| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id)?;
            encoder.encode_field(&r.kind.to_string())?;
            encoder.encode_field(&i64::from(r.capacity))?;
            encoder.encode_field(&r.zone)?;
            encoder.encode_field(&r.retired)?;
            encoder.encode_field(&r.needs_cleaning)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(query_response(schema, rows))
}

// ── Schemas ──────────────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("guest_name", Type::VARCHAR),
        field("contact", Type::VARCHAR),
        field("resource_id", Type::VARCHAR),
        field("start_at", Type::INT8),
        field("end_at", Type::INT8),
        field("party_size", Type::INT8),
        field("status", Type::VARCHAR),
        field("id_number", Type::VARCHAR),
        field("designation", Type::VARCHAR),
        field("department", Type::VARCHAR),
        field("purpose", Type::VARCHAR),
        field("notes", Type::VARCHAR),
        field("correlation_id", Type::VARCHAR),
        field("created_at", Type::INT8),
        field("updated_at", Type::INT8),
        field("checked_in_at", Type::INT8),
        field("checked_out_at", Type::INT8),
    ]
}

fn resource_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("kind", Type::VARCHAR),
        field("capacity", Type::INT8),
        field("zone", Type::VARCHAR),
        field("retired", Type::BOOL),
        field("needs_cleaning", Type::BOOL),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        field("resource_id", Type::VARCHAR),
        field("start_at", Type::INT8),
        field("end_at", Type::INT8),
    ]
}

fn occupancy_schema() -> Vec<FieldInfo> {
    vec![
        field("kind", Type::VARCHAR),
        field("as_of", Type::INT8),
        field("rate", Type::FLOAT8),
    ]
}

fn board_schema() -> Vec<FieldInfo> {
    vec![
        field("resource_id", Type::VARCHAR),
        field("kind", Type::VARCHAR),
        field("zone", Type::VARCHAR),
        field("capacity", Type::INT8),
        field("state", Type::VARCHAR),
        field("reservation_id", Type::VARCHAR),
        field("guest_name", Type::VARCHAR),
    ]
}

fn dashboard_schema() -> Vec<FieldInfo> {
    vec![
        field("as_of", Type::INT8),
        field("room_occupancy", Type::FLOAT8),
        field("hall_occupancy", Type::FLOAT8),
        field("pending", Type::INT8),
        field("confirmed", Type::INT8),
        field("checked_in", Type::INT8),
        field("checked_out", Type::INT8),
        field("cancelled", Type::INT8),
        field("arrivals", Type::INT8),
        field("departures", Type::INT8),
    ]
}

/// Row shape a statement produces, judged from its target table.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    match sql::target_table(sql).as_deref() {
        Some("reservations" | "arrivals" | "departures") => reservation_schema(),
        Some("resources" | "suggestions") => resource_schema(),
        Some("availability") => availability_schema(),
        Some("occupancy") => occupancy_schema(),
        Some("board") => board_schema(),
        Some("dashboard") => dashboard_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for InnkeepHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let commands = count_invalid(sql::parse_statements(query))?;
        self.run_batch(&engine, commands).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct InnkeepQueryParser;

#[async_trait]
impl QueryParser for InnkeepQueryParser {
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
impl ExtendedQueryHandler for InnkeepHandler {
    type Statement = String;
    type QueryParser = InnkeepQueryParser;

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
        let cmd = count_invalid(sql::parse_sql(&sql))?;
        self.run(&engine, cmd).await
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

/// Byte range and index of every `$N` placeholder outside string literals.
fn placeholders(sql: &str) -> Vec<(usize, usize, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut in_literal = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => {
                in_literal = !in_literal;
                i += 1;
            }
            b'$' if !in_literal => {
                let start = i;
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if let Ok(n) = sql[start + 1..i].parse::<usize>() {
                    found.push((start, i, n));
                }
            }
            _ => i += 1,
        }
    }
    found
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, _, n)| n).max().unwrap_or(0)
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let values: Vec<Option<String>> = portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .collect();
    substitute(&portal.statement.statement, &values)
}

/// Single pass over the statement text. Bound values are copied in as quoted
/// literals and never scanned again.
fn substitute(sql: &str, params: &[Option<String>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    for (start, end, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
            continue;
        };
        out.push_str(&sql[copied..start]);
        match param {
            Some(text) => {
                out.push('\'');
                out.push_str(&text.replace('\'', "''"));
                out.push('\'');
            }
            None => out.push_str("NULL"),
        }
        copied = end;
    }
    out.push_str(&sql[copied..]);
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct InnkeepFactory {
    handler: Arc<InnkeepHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<InnkeepAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl InnkeepFactory {
    pub fn new(facilities: Arc<FacilityManager>, user: String, password: String) -> Self {
        let auth_source = InnkeepAuthSource::new(user, password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(InnkeepHandler::new(facilities)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(auth_source, param_provider)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for InnkeepFactory {
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
    factory: Arc<InnkeepFactory>,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn engine_err(e: EngineError) -> PgWireError {
    if let EngineError::Conflict { .. } = e {
        debug!("rejected: {e}");
    }
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        e.sqlstate().into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        e.sqlstate().into(),
        e.to_string(),
    )))
}
