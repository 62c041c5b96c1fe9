use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo, QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::display;
use crate::engine::{Engine, EngineError};
use crate::model::EventFilter;
use crate::observability;
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;
use crate::tz::TzError;

pub struct TzLedgerHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<TzLedgerQueryParser>,
}

impl TzLedgerHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(TzLedgerQueryParser),
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
    async fn run(&self, engine: &Engine, sql: &str, format: &Format) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd, format).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command, format: &Format) -> PgWireResult<Response> {
        match cmd {
            Command::InsertProfile { id, name, timezone } => {
                engine
                    .create_profile(id, &name, timezone.as_deref())
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateProfile { id, patch } => {
                engine.update_profile(id, patch).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::InsertEvent { id, draft } => {
                engine.create_event(id, draft).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateEvent { id, patch } => {
                let outcome = engine.update_event(id, patch).await.map_err(engine_err)?;
                // UPDATE 0 tells the client nothing changed and no log entry was written.
                let rows = usize::from(outcome.changed);
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(rows)))
            }
            Command::SelectProfiles => {
                let schema = Arc::new(profiles_schema(format));
                let rows: Vec<PgWireResult<_>> = engine
                    .list_profiles()
                    .iter()
                    .map(|p| {
                        let view = display::profile_view(p).map_err(tz_err)?;
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&view.id)?;
                        encoder.encode_field(&view.name)?;
                        encoder.encode_field(&view.timezone)?;
                        encoder.encode_field(&view.created_at)?;
                        encoder.encode_field(&view.updated_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectEvents {
                id,
                profile_id,
                timezone,
            } => {
                let events = match id {
                    Some(id) => match engine.get_event(&id).await {
                        Ok(e) if profile_id.is_none_or(|p| e.has_profile(&p)) => vec![e],
                        Ok(_) | Err(EngineError::NotFound(_)) => vec![],
                        Err(e) => return Err(engine_err(e)),
                    },
                    None => engine.list_events(&EventFilter { profile_id }).await,
                };

                let zone = timezone.as_deref();
                let schema = Arc::new(events_schema(zone.is_some(), format));
                let mut rows: Vec<PgWireResult<_>> = Vec::with_capacity(events.len());
                for event in &events {
                    let view = display::event_view(event, zone).map_err(tz_err)?;
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&view.id)?;
                    encoder.encode_field(&view.timezone)?;
                    encoder.encode_field(&view.start)?;
                    encoder.encode_field(&view.end)?;
                    encoder.encode_field(&view.profiles)?;
                    encoder.encode_field(&view.created_at)?;
                    encoder.encode_field(&view.updated_at)?;
                    if let Some(local) = &view.local {
                        encoder.encode_field(&local.start_date)?;
                        encoder.encode_field(&local.start_time)?;
                        encoder.encode_field(&local.end_date)?;
                        encoder.encode_field(&local.end_time)?;
                    }
                    rows.push(Ok(encoder.take_row()));
                }
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectEventLogs { event_id, timezone } => {
                let logs = engine.event_logs(&event_id).await.map_err(engine_err)?;
                let log_rows = display::log_rows(&event_id, &logs, timezone.as_deref()).map_err(tz_err)?;

                let schema = Arc::new(event_logs_schema(format));
                let rows: Vec<PgWireResult<_>> = log_rows
                    .into_iter()
                    .map(|row| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&row.event_id)?;
                        encoder.encode_field(&row.seq)?;
                        encoder.encode_field(&row.changed_at)?;
                        encoder.encode_field(&row.field.to_string())?;
                        encoder.encode_field(&row.from)?;
                        encoder.encode_field(&row.to)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
        }
    }
}

// ── Result schemas ───────────────────────────────────────────────

fn schema(columns: &[(&str, Type)], format: &Format) -> Vec<FieldInfo> {
    columns
        .iter()
        .enumerate()
        .map(|(idx, (name, ty))| FieldInfo::new((*name).into(), None, None, ty.clone(), format.format_for(idx)))
        .collect()
}

fn profiles_schema(format: &Format) -> Vec<FieldInfo> {
    schema(
        &[
            ("id", Type::VARCHAR),
            ("name", Type::VARCHAR),
            ("timezone", Type::VARCHAR),
            ("created_at", Type::VARCHAR),
            ("updated_at", Type::VARCHAR),
        ],
        format,
    )
}

/// Zoned results carry the wall-clock columns as well.
fn events_schema(zoned: bool, format: &Format) -> Vec<FieldInfo> {
    let mut columns = vec![
        ("id", Type::VARCHAR),
        ("timezone", Type::VARCHAR),
        ("start", Type::VARCHAR),
        ("end", Type::VARCHAR),
        ("profiles", Type::VARCHAR),
        ("created_at", Type::VARCHAR),
        ("updated_at", Type::VARCHAR),
    ];
    if zoned {
        columns.extend([
            ("start_date", Type::VARCHAR),
            ("start_time", Type::VARCHAR),
            ("end_date", Type::VARCHAR),
            ("end_time", Type::VARCHAR),
        ]);
    }
    schema(&columns, format)
}

fn event_logs_schema(format: &Format) -> Vec<FieldInfo> {
    schema(
        &[
            ("event_id", Type::VARCHAR),
            ("seq", Type::INT8),
            ("changed_at", Type::VARCHAR),
            ("field", Type::VARCHAR),
            ("from", Type::VARCHAR),
            ("to", Type::VARCHAR),
        ],
        format,
    )
}

/// Result columns for a statement that may still contain `$n` placeholders.
fn describe_schema(sql: &str, format: &Format) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if !upper.trim_start().starts_with("SELECT") {
        return vec![];
    }
    if upper.contains("EVENT_LOGS") {
        event_logs_schema(format)
    } else if upper.contains("EVENTS") {
        events_schema(upper.contains("TIMEZONE"), format)
    } else if upper.contains("PROFILES") {
        profiles_schema(format)
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for TzLedgerHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let response = self.run(&engine, query, &Format::UnifiedText).await?;
        Ok(vec![response])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct TzLedgerQueryParser;

#[async_trait]
impl QueryParser for TzLedgerQueryParser {
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

    fn get_result_schema(&self, stmt: &String, column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(describe_schema(stmt, column_format.unwrap_or(&Format::UnifiedText)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for TzLedgerHandler {
    type Statement = String;
    type QueryParser = TzLedgerQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(&self, client: &mut C, portal: &Portal<Self::Statement>, _max_rows: usize) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let sql = bind_params(&portal.statement.statement, &portal.parameters);
        self.run(&engine, &sql, &portal.result_column_format).await
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
            describe_schema(&target.statement, &Format::UnifiedText),
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
        Ok(DescribePortalResponse::new(describe_schema(
            &target.statement.statement,
            &target.result_column_format,
        )))
    }
}

/// Copy `sql` in one pass, handing every `$n` placeholder outside quoted
/// text to `on_param`. Text written by `on_param` is never rescanned.
fn scan_placeholders(sql: &str, mut on_param: impl FnMut(usize, &mut String)) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.char_indices().peekable();
    let mut quote: Option<char> = None;

    while let Some((i, c)) = chars.next() {
        if let Some(q) = quote {
            out.push(c);
            // A doubled quote closes and immediately reopens.
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => {
                quote = Some(c);
                out.push(c);
            }
            '$' => {
                let start = i + 1;
                let mut end = start;
                while let Some(&(j, d)) = chars.peek() {
                    if !d.is_ascii_digit() {
                        break;
                    }
                    end = j + 1;
                    chars.next();
                }
                match sql[start..end].parse::<usize>() {
                    Ok(n) => on_param(n, &mut out),
                    Err(_) => out.push_str(&sql[i..end]),
                }
            }
            _ => out.push(c),
        }
    }
    out
}

/// Highest `$n` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    let mut max = 0;
    scan_placeholders(sql, |n, _| max = max.max(n));
    max
}

/// Inline bound text parameters as quoted literals. Placeholders with no
/// bound value are left as written.
fn bind_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    scan_placeholders(sql, |n, out| match n.checked_sub(1).and_then(|i| params.get(i)) {
        Some(Some(bytes)) => {
            out.push('\'');
            out.push_str(&String::from_utf8_lossy(bytes.as_ref()).replace('\'', "''"));
            out.push('\'');
        }
        Some(None) => out.push_str("NULL"),
        None => {
            out.push('$');
            out.push_str(&n.to_string());
        }
    })
}

// ── Authentication ───────────────────────────────────────────────

/// Every user shares one cleartext password.
#[derive(Debug)]
pub struct SharedPasswordAuthSource {
    password: String,
}

impl SharedPasswordAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for SharedPasswordAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

// ── Factory ──────────────────────────────────────────────────────

pub struct TzLedgerFactory {
    handler: Arc<TzLedgerHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<SharedPasswordAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl TzLedgerFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        Self {
            handler: Arc::new(TzLedgerHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                SharedPasswordAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for TzLedgerFactory {
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
) -> std::io::Result<()> {
    let factory = Arc::new(TzLedgerFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

/// SQLSTATE for each engine error class.
fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation(_) => "22023",
        EngineError::NotFound(_) | EngineError::ProfileNotFound(_) => "P0002",
        EngineError::AlreadyExists(_) | EngineError::Conflict(_) => "23505",
        EngineError::InvalidRange { .. } => "22008",
        EngineError::InvalidZone(_) | EngineError::InvalidDateTime(_) => "22007",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    if let EngineError::WalError(msg) = &e {
        tracing::error!("storage failure: {msg}");
    }
    user_error(engine_sqlstate(&e), e.to_string())
}

fn tz_err(e: TzError) -> PgWireError {
    engine_err(e.into())
}

fn sql_sqlstate(e: &SqlError) -> &'static str {
    match e {
        SqlError::Parse(_) | SqlError::Empty | SqlError::Unsupported(_) => "42601",
        SqlError::UnknownTable(_) => "42P01",
        SqlError::UnknownColumn(_) => "42703",
        SqlError::MissingColumn(_) | SqlError::WrongArity(..) | SqlError::MissingFilter(_) => "22023",
    }
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error(sql_sqlstate(&e), e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn count_params_finds_highest() {
        assert_eq!(count_params("SELECT * FROM profiles"), 0);
        assert_eq!(count_params("UPDATE events SET start = $2 WHERE id = $1"), 2);
        assert_eq!(count_params("SELECT $10, $3"), 10);
        assert_eq!(count_params("SELECT * FROM profiles WHERE name = 'costs $9'"), 0);
    }

    #[test]
    fn bound_values_are_not_rescanned() {
        let params = [Some(b"01ARZ3NDEKTSV4RRFFQ69G5FAV".as_slice()), Some(b"Pay $1 now".as_slice())];
        assert_eq!(
            bind_params("INSERT INTO profiles (id, name) VALUES ($1, $2)", &params),
            "INSERT INTO profiles (id, name) VALUES ('01ARZ3NDEKTSV4RRFFQ69G5FAV', 'Pay $1 now')"
        );
    }

    #[test]
    fn bind_quotes_values_and_skips_literals() {
        let params = [Some(b"O'Brien".as_slice()), None];
        assert_eq!(
            bind_params("UPDATE profiles SET name = $1, timezone = $2 WHERE id = 'x$1'", &params),
            "UPDATE profiles SET name = 'O''Brien', timezone = NULL WHERE id = 'x$1'"
        );
        let params = [Some(b"a".as_slice()); 10];
        assert_eq!(bind_params("SELECT $10, $1, $11", &params), "SELECT 'a', 'a', $11");
    }

    #[test]
    fn sqlstates_by_class() {
        let id = Ulid::new();
        assert_eq!(engine_sqlstate(&EngineError::NotFound(id)), "P0002");
        assert_eq!(engine_sqlstate(&EngineError::ProfileNotFound(vec![id])), "P0002");
        assert_eq!(engine_sqlstate(&EngineError::Conflict("Alice".into())), "23505");
        assert_eq!(engine_sqlstate(&EngineError::InvalidRange { start: 2, end: 1 }), "22008");
        assert_eq!(engine_sqlstate(&EngineError::InvalidZone("X".into())), "22007");
        assert_eq!(engine_sqlstate(&EngineError::Validation("x".into())), "22023");
        assert_eq!(sql_sqlstate(&SqlError::Empty), "42601");
        assert_eq!(sql_sqlstate(&SqlError::MissingFilter("id")), "22023");
    }

    #[test]
    fn describe_picks_schema_by_table() {
        let f = Format::UnifiedText;
        assert_eq!(describe_schema("SELECT * FROM profiles", &f).len(), 5);
        assert_eq!(describe_schema("SELECT * FROM events WHERE id = $1", &f).len(), 7);
        assert_eq!(describe_schema("SELECT * FROM events WHERE timezone = $1", &f).len(), 11);
        assert_eq!(describe_schema("SELECT * FROM event_logs WHERE event_id = $1", &f).len(), 6);
        assert!(describe_schema("UPDATE events SET start = $1 WHERE id = $2", &f).is_empty());
    }
}
