use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
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
use tracing::{debug, warn};

use crate::auth::SlotwiseAuthSource;
use crate::engine::{BookingOutcome, BookingRequest, Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, DurationSpec, ResultKind};
use crate::tenant::TenantManager;
use crate::time::format_clock;

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(SlotwiseFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

pub struct SlotwiseHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<SlotwiseQueryParser>,
}

impl SlotwiseHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(SlotwiseQueryParser),
        }
    }

    fn tenant_of<C: ClientInfo>(client: &C) -> String {
        client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string())
    }

    /// Parse, execute and record metrics for one statement.
    async fn run(&self, tenant: &str, query: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        debug!(%tenant, command = label, "executing");

        let started = Instant::now();
        let result = self.execute_command(tenant, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn resolve_engine(&self, tenant: &str) -> PgWireResult<Arc<Engine>> {
        self.tenant_manager.get_or_create(tenant).await.map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    async fn execute_command(&self, tenant: &str, cmd: Command) -> PgWireResult<Response> {
        let engine = self.resolve_engine(tenant).await?;
        let schema = Arc::new(schema_for(cmd.result_kind()));
        match cmd {
            Command::SelectAvailability { date, duration } => {
                let duration = resolve_duration(&engine, duration).await;
                let slots = engine
                    .available_slots(date, duration)
                    .await
                    .map_err(engine_err)?;
                slot_rows(schema, &slots)
            }
            Command::SelectFirstAvailable { date, duration } => {
                let duration = resolve_duration(&engine, duration).await;
                let slot = engine
                    .first_available_slot(date, duration)
                    .await
                    .map_err(engine_err)?;
                slot_rows(schema, slot.as_slice())
            }
            Command::SelectBookable {
                date,
                start,
                duration,
            } => {
                let duration = resolve_duration(&engine, duration).await;
                let verdict = engine
                    .is_bookable(date, start, duration)
                    .await
                    .map_err(engine_err)?;
                let mut encoder = DataRowEncoder::new(schema.clone());
                match &verdict {
                    Bookability::Bookable => {
                        encoder.encode_field(&true)?;
                        encoder.encode_field(&None::<String>)?;
                        encoder.encode_field(&None::<String>)?;
                    }
                    Bookability::Rejected(reason) => {
                        let conflict_with = match reason {
                            Rejection::Conflict { span, label } => Some(format!("{span} {label}")),
                            _ => None,
                        };
                        encoder.encode_field(&false)?;
                        encoder.encode_field(&Some(reason.code()))?;
                        encoder.encode_field(&conflict_with)?;
                    }
                }
                let rows = vec![Ok(encoder.take_row())];
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectAlternatives {
                date,
                start,
                duration,
            } => {
                let duration = resolve_duration(&engine, duration).await;
                let found = engine
                    .find_alternatives(date, start, duration)
                    .await
                    .map_err(engine_err)?;
                let rows: Vec<PgWireResult<_>> = found
                    .labelled()
                    .into_iter()
                    .map(|(kind, slot)| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&kind)?;
                        encoder.encode_field(&slot.date.to_string())?;
                        encoder.encode_field(&format_clock(slot.start))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectOccupied { date } => {
                let ranges = engine.occupied(date).await;
                let rows: Vec<PgWireResult<_>> = ranges
                    .iter()
                    .map(|range| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&range.date.to_string())?;
                        encoder.encode_field(&format_clock(range.span.start))?;
                        encoder.encode_field(&format_clock(range.span.end))?;
                        encoder.encode_field(&range.label)?;
                        encoder.encode_field(&range.source.to_string())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectContext => {
                let text = engine.render_context().await;
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&text)?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::InsertCommitment {
                date,
                start,
                duration,
                label,
            } => {
                let duration = resolve_duration(&engine, duration).await;
                let outcome = engine
                    .book(BookingRequest {
                        date,
                        start,
                        duration,
                        label,
                    })
                    .await
                    .map_err(engine_err)?;
                match outcome {
                    // Like INSERT .. RETURNING: the new id comes back as a row.
                    BookingOutcome::Confirmed { id, slot } => {
                                let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&id.to_string())?;
                        encoder.encode_field(&slot.date.to_string())?;
                        encoder.encode_field(&format_clock(slot.start))?;
                        let rows = vec![Ok(encoder.take_row())];
                        Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
                    }
                    BookingOutcome::Rejected {
                        reason,
                        alternatives,
                    } => Err(rejection_err(&reason, &alternatives)),
                }
            }
            Command::DeleteCommitment { id } => {
                engine.cancel(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InvalidateCache { reason } => {
                self.tenant_manager.invalidate(engine.tenant(), reason);
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
        }
    }
}

async fn resolve_duration(engine: &Engine, spec: DurationSpec) -> Minutes {
    match spec {
        DurationSpec::Minutes(minutes) => minutes,
        DurationSpec::Default => engine.duration_for(None).await,
        DurationSpec::Product(id) => engine.duration_for(Some(&id)).await,
    }
}

fn slot_rows(schema: Arc<Vec<FieldInfo>>, slots: &[Slot]) -> PgWireResult<Response> {
    let rows: Vec<PgWireResult<_>> = slots
        .iter()
        .map(|slot| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&slot.date.to_string())?;
            encoder.encode_field(&format_clock(slot.start))?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

// ── Schemas ──────────────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn slot_schema() -> Vec<FieldInfo> {
    vec![text_field("date"), text_field("start")]
}

fn bookable_schema() -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("bookable".into(), None, None, Type::BOOL, FieldFormat::Text),
        text_field("reason"),
        text_field("conflict_with"),
    ]
}

fn alternatives_schema() -> Vec<FieldInfo> {
    vec![text_field("kind"), text_field("date"), text_field("start")]
}

fn occupied_schema() -> Vec<FieldInfo> {
    vec![
        text_field("date"),
        text_field("start"),
        text_field("end"),
        text_field("label"),
        text_field("source"),
    ]
}

fn context_schema() -> Vec<FieldInfo> {
    vec![FieldInfo::new("context".into(), None, None, Type::TEXT, FieldFormat::Text)]
}

fn insert_schema() -> Vec<FieldInfo> {
    vec![text_field("id"), text_field("date"), text_field("start")]
}

fn schema_for(kind: ResultKind) -> Vec<FieldInfo> {
    match kind {
        ResultKind::Slots => slot_schema(),
        ResultKind::Bookable => bookable_schema(),
        ResultKind::Alternatives => alternatives_schema(),
        ResultKind::Occupied => occupied_schema(),
        ResultKind::Context => context_schema(),
        ResultKind::Inserted => insert_schema(),
        ResultKind::NoRows => vec![],
    }
}

/// Result columns of a statement, judged from its parsed target table.
/// Unparseable statements describe no columns; executing them reports the error.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    sql::result_kind(sql).map(schema_for).unwrap_or_default()
}

#[async_trait]
impl SimpleQueryHandler for SlotwiseHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(&Self::tenant_of(client), query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotwiseQueryParser;

#[async_trait]
impl QueryParser for SlotwiseQueryParser {
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
impl ExtendedQueryHandler for SlotwiseHandler {
    type Statement = String;
    type QueryParser = SlotwiseQueryParser;

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
        let sql = substitute_params(portal);
        self.run(&Self::tenant_of(client), &sql).await
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

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Highest index first so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotwiseFactory {
    handler: Arc<SlotwiseHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<SlotwiseAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl SlotwiseFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = SlotwiseAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SlotwiseHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotwiseFactory {
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

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

fn engine_err(e: EngineError) -> PgWireError {
    let code = match &e {
        EngineError::InvalidRequest(_) => "22023",
        EngineError::NotFound(_) | EngineError::NoAlternativeFound { .. } => "P0002",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::ConfigUnavailable(_) | EngineError::SourceUnavailable(..) => "58000",
        EngineError::WalError(_) => "58030",
    };
    if code.starts_with('5') {
        warn!(error = %e, "query failed");
    }
    user_error(code, e.to_string())
}

/// A booking that didn't fit: exclusion violation, alternatives in the message.
fn rejection_err(reason: &Rejection, alternatives: &Alternatives) -> PgWireError {
    let mut message = format!("slot unavailable: {reason}");
    let suggestions: Vec<String> = alternatives
        .labelled()
        .into_iter()
        .map(|(kind, slot)| format!("{kind} {slot}"))
        .collect();
    if !suggestions.is_empty() {
        message.push_str("; alternatives: ");
        message.push_str(&suggestions.join(", "));
    }
    user_error("23P01", message)
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn counts_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM context"), 0);
        assert_eq!(
            count_params("SELECT * FROM bookable WHERE date = $1 AND start = $2"),
            2
        );
        assert_eq!(count_params("SELECT $10, $2"), 10);
        assert_eq!(count_params("SELECT '$'"), 0);
    }

    #[test]
    fn schema_follows_target_table() {
        let names = |sql: &str| -> Vec<String> {
            result_schema(sql).iter().map(|f| f.name().to_string()).collect()
        };
        assert_eq!(
            names("SELECT * FROM first_available WHERE date = $1"),
            vec!["date", "start"]
        );
        assert_eq!(
            names("select * from bookable where date = $1 and start = $2"),
            vec!["bookable", "reason", "conflict_with"]
        );
        assert_eq!(names("SELECT * FROM context"), vec!["context"]);
        assert_eq!(
            names("INSERT INTO commitments VALUES ($1, $2)"),
            vec!["id", "date", "start"]
        );
        assert!(names("DELETE FROM cache").is_empty());
        assert_eq!(
            names("SELECT * FROM occupied WHERE date = $1 AND product = 'availability'"),
            vec!["date", "start", "end", "label", "source"]
        );
        assert!(names("SELECT * FROM availability_log").is_empty());
    }

    #[test]
    fn rejection_message_lists_alternatives() {
        let date = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
        let alternatives = Alternatives {
            same_day_before: Some(Slot::new(date, 540)),
            same_day_after: Some(Slot::new(date, 660)),
            ..Default::default()
        };
        let err = rejection_err(
            &Rejection::Conflict {
                span: Span::new(600, 660),
                label: "Ana".into(),
            },
            &alternatives,
        );
        let text = format!("{err:?}");
        assert!(text.contains("23P01"));
        assert!(text.contains("same_day_before 2026-10-19 09:00"));
        assert!(text.contains("same_day_after 2026-10-19 11:00"));
    }

    #[test]
    fn engine_errors_map_to_sqlstate() {
        let text = format!("{:?}", engine_err(EngineError::InvalidRequest("bad")));
        assert!(text.contains("22023"));
        let text = format!("{:?}", engine_err(EngineError::LimitExceeded("too many")));
        assert!(text.contains("54000"));
    }
}
