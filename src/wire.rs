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

use crate::auth::RideHoldAuthSource;
use crate::engine::EngineError;
use crate::model::*;
use crate::observability::{self, command_label};
use crate::service::RideHoldService;
use crate::sql::{self, Command, SqlError};

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    service: Arc<RideHoldService>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(RideHoldFactory::new(service, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

pub struct RideHoldHandler {
    service: Arc<RideHoldService>,
    query_parser: Arc<RideHoldQueryParser>,
}

fn insert_tag(rows: usize) -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(rows))
}

impl RideHoldHandler {
    pub fn new(service: Arc<RideHoldService>) -> Self {
        Self {
            service,
            query_parser: Arc::new(RideHoldQueryParser),
        }
    }

    async fn run_command(&self, cmd: Command) -> PgWireResult<Vec<Response>> {
        let label = command_label(&cmd);
        let start = Instant::now();
        let result = self.execute_command(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Vec<Response>> {
        let service = &self.service;
        match cmd {
            Command::InsertRide {
                ride_id,
                duration_minutes,
            } => {
                service
                    .engine
                    .configure_ride(&ride_id, duration_minutes)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![insert_tag(1)])
            }
            Command::SelectRides => {
                let schema = Arc::new(rides_schema());
                let rows: Vec<PgWireResult<_>> = service
                    .engine
                    .list_rides()
                    .into_iter()
                    .map(|ride| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&ride.ride_id)?;
                        encoder.encode_field(&ride.duration_minutes)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::InsertHold {
                ride_id,
                date,
                time,
                ttl_minutes,
            } => {
                service
                    .coordinator
                    .place_hold(&ride_id, date.as_deref(), time.as_deref(), ttl_minutes)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![insert_tag(1)])
            }
            Command::InsertBooking {
                ride_id,
                date,
                time,
            } => {
                let promotion = service
                    .coordinator
                    .finalize_booking(&ride_id, date.as_deref(), time.as_deref())
                    .await
                    .map_err(engine_err)?;
                // Zero rows tells the caller the booking already existed.
                let rows = match promotion {
                    Promotion::Promoted => 1,
                    Promotion::AlreadyBooked => 0,
                };
                Ok(vec![insert_tag(rows)])
            }
            Command::InsertBookingRecord { record } => {
                service.ledger.record(record).map_err(engine_err)?;
                Ok(vec![insert_tag(1)])
            }
            Command::SelectAvailability { ride_id, date } => {
                let starts = service
                    .coordinator
                    .check_availability(&ride_id, &date)
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(availability_schema());
                let rows: Vec<PgWireResult<_>> = starts
                    .into_iter()
                    .map(|time| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&ride_id)?;
                        encoder.encode_field(&date)?;
                        encoder.encode_field(&time)?;
                        Ok(encoder.take_row())
                    })
                    .collect();

                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectSlots { ride_id, date } => {
                let records = service
                    .coordinator
                    .live_records(&ride_id, &date)
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(slots_schema());
                let rows: Vec<PgWireResult<_>> = records
                    .into_iter()
                    .map(|record| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&record.key())?;
                        encoder.encode_field(&record.slot.ride_id)?;
                        encoder.encode_field(&record.slot.date)?;
                        encoder.encode_field(&record.slot.time)?;
                        encoder.encode_field(&record.status.label().to_string())?;
                        encoder.encode_field(&record.hold_expires_at())?;
                        encoder.encode_field(&record.created_at)?;
                        encoder.encode_field(&record.id.to_string())?;
                        Ok(encoder.take_row())
                    })
                    .collect();

                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
        }
    }
}

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        text_field("ride_id", Type::VARCHAR),
        text_field("date", Type::VARCHAR),
        text_field("time", Type::VARCHAR),
    ]
}

fn rides_schema() -> Vec<FieldInfo> {
    vec![
        text_field("ride_id", Type::VARCHAR),
        text_field("duration_minutes", Type::INT4),
    ]
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![
        text_field("key", Type::VARCHAR),
        text_field("ride_id", Type::VARCHAR),
        text_field("date", Type::VARCHAR),
        text_field("time", Type::VARCHAR),
        text_field("status", Type::VARCHAR),
        text_field("hold_expires_at", Type::INT8),
        text_field("created_at", Type::INT8),
        text_field("id", Type::VARCHAR),
    ]
}

/// Row shape a statement will produce, judged from its text (it may still carry `$n` placeholders).
fn result_schema(stmt: &str) -> Vec<FieldInfo> {
    let mut words = stmt.split_whitespace();
    if !words.next().is_some_and(|w| w.eq_ignore_ascii_case("SELECT")) {
        return vec![];
    }
    let table = words
        .skip_while(|w| !w.eq_ignore_ascii_case("FROM"))
        .nth(1)
        .map(|t| t.trim_matches(|c| c == '"' || c == ';').to_lowercase());
    match table.as_deref() {
        Some("availability") => availability_schema(),
        Some("slots") => slots_schema(),
        Some("rides") => rides_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for RideHoldHandler {
    async fn do_query<C>(
        &self,
        _client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        self.run_command(cmd).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct RideHoldQueryParser;

#[async_trait]
impl QueryParser for RideHoldQueryParser {
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
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for RideHoldHandler {
    type Statement = String;
    type QueryParser = RideHoldQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let mut responses = self.run_command(cmd).await?;
        Ok(responses.remove(0))
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
            result_schema(&target.statement),
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
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
            {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let params: Vec<Option<&[u8]>> = portal.parameters.iter().map(|p| p.as_deref()).collect();
    bind_params(&portal.statement.statement, &params)
}

/// One left-to-right pass, so text inside a bound value is never rescanned.
/// Placeholders without a bound value are left as written.
fn bind_params(sql: &str, params: &[Option<&[u8]>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut rest = sql;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let digits = after.bytes().take_while(u8::is_ascii_digit).count();
        let bound = after[..digits]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| params.get(i));
        match bound {
            Some(Some(bytes)) => {
                let text = String::from_utf8_lossy(bytes);
                out.push('\'');
                out.push_str(&text.replace('\'', "''"));
                out.push('\'');
            }
            Some(None) => out.push_str("NULL"),
            None => out.push_str(&rest[pos..pos + 1 + digits]),
        }
        rest = &after[digits..];
    }
    out.push_str(rest);
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct RideHoldFactory {
    handler: Arc<RideHoldHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<RideHoldAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl RideHoldFactory {
    pub fn new(service: Arc<RideHoldService>, password: String) -> Self {
        let auth_source = RideHoldAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(RideHoldHandler::new(service)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for RideHoldFactory {
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

// ── Error mapping ────────────────────────────────────────────────

/// SQLSTATE for each engine error.
pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::InvalidInput(_) => "22023",
        EngineError::Conflict(_) => "23505",
        EngineError::HoldLost(_) => "P0002",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) | EngineError::Unavailable(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    if e.is_storage_fault() {
        tracing::error!("storage fault: {e}");
    } else if e.is_client_fault() {
        tracing::debug!("rejected request: {e}");
    }
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
