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
    QueryResponse, Response,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::LoanstatAuthSource;
use crate::engine::{now_ms, ReportEngine, ReportError};
use crate::limits::AGGREGATE_SERIES;
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command};

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<ReportEngine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(LoanstatFactory::new(engine, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

pub struct LoanstatHandler {
    engine: Arc<ReportEngine>,
    query_parser: Arc<LoanstatQueryParser>,
}

impl LoanstatHandler {
    pub fn new(engine: Arc<ReportEngine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(LoanstatQueryParser),
        }
    }

    async fn run_query(&self, query: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let start = Instant::now();
        let result = self.execute_command(cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let schema = Arc::new(schema_for(&cmd));
        let engine = &self.engine;
        let rows: Vec<PgWireResult<_>> = match cmd {
            Command::SelectSummary => {
                let summary = engine.summary().await.map_err(report_err)?;
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&summary.avg_borrowing_duration)?;
                encoder.encode_field(&summary.late_return_rate)?;
                vec![Ok(encoder.take_row())]
            }
            Command::SelectOccupancy {
                granularity,
                equipment,
                at,
            } => {
                let series = engine
                    .occupancy(granularity, at.unwrap_or_else(now_ms))
                    .await
                    .map_err(report_err)?;
                let selected: Vec<(&str, &[Bucket])> = match &equipment {
                    Some(name) => series
                        .series(name)
                        .map(|buckets| {
                            let display = series
                                .equipment
                                .keys()
                                .find(|k| equipment_key(k) == equipment_key(name))
                                .map_or(AGGREGATE_SERIES, |k| k.as_str());
                            vec![(display, buckets)]
                        })
                        .unwrap_or_default(),
                    None => std::iter::once((AGGREGATE_SERIES, series.aggregate.as_slice()))
                        .chain(series.equipment.iter().map(|(k, v)| (k.as_str(), v.as_slice())))
                        .collect(),
                };
                selected
                    .into_iter()
                    .flat_map(|(name, buckets)| buckets.iter().map(move |b| (name, b)))
                    .map(|(name, bucket)| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&name.to_string())?;
                        encoder.encode_field(&granularity.to_string())?;
                        encoder.encode_field(&(bucket.index as i64))?;
                        encoder.encode_field(&bucket.label)?;
                        encoder.encode_field(&(bucket.borrowed as i64))?;
                        encoder.encode_field(&(bucket.capacity as i64))?;
                        encoder.encode_field(&bucket.availability_percent)?;
                        encoder.encode_field(&bucket.health.as_str().to_string())?;
                        Ok(encoder.take_row())
                    })
                    .collect()
            }
            Command::SelectMostBorrowed => {
                let rankings = engine.rankings(now_ms()).await.map_err(report_err)?;
                borrow_rows(&schema, rankings.most_borrowed)
            }
            Command::SelectLeastBorrowed => {
                let rankings = engine.rankings(now_ms()).await.map_err(report_err)?;
                borrow_rows(&schema, rankings.least_borrowed)
            }
            Command::SelectRunOutFrequency { at } => {
                let rankings = engine
                    .rankings(at.unwrap_or_else(now_ms))
                    .await
                    .map_err(report_err)?;
                rankings
                    .run_out_frequency
                    .into_iter()
                    .map(|e| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&e.equipment_type)?;
                        encoder.encode_field(&(e.run_out_count as i64))?;
                        encoder.encode_field(&(e.capacity as i64))?;
                        encoder.encode_field(&e.percentage)?;
                        encoder.encode_field(&(e.currently_borrowed as i64))?;
                        encoder.encode_field(&e.utilization_rate)?;
                        Ok(encoder.take_row())
                    })
                    .collect()
            }
            Command::SelectRecentTransactions { kind } => {
                let feed = engine.recent_transactions().await.map_err(report_err)?;
                feed.into_iter()
                    .filter(|entry| kind.is_none_or(|k| entry.kind == k))
                    .map(|entry| {
                        let t = &entry.transaction;
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&entry.kind.as_str().to_string())?;
                        encoder.encode_field(&t.id.to_string())?;
                        encoder.encode_field(&t.borrower_id)?;
                        encoder.encode_field(&t.borrower_name)?;
                        encoder.encode_field(&t.equipment_type)?;
                        encoder.encode_field(&(t.out_quantity as i64))?;
                        encoder.encode_field(&t.out_at)?;
                        encoder.encode_field(&t.in_quantity.map(|q| q as i64))?;
                        encoder.encode_field(&t.in_at)?;
                        encoder.encode_field(&t.status.as_str().to_string())?;
                        encoder.encode_field(&t.effective_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect()
            }
            Command::SelectReport { at } => {
                let report = engine
                    .generate_report(at.unwrap_or_else(now_ms))
                    .await
                    .map_err(report_err)?;
                let json = serde_json::to_string(&report).map_err(|e| {
                    PgWireError::UserError(Box::new(ErrorInfo::new(
                        "ERROR".into(),
                        "P0001".into(),
                        format!("report encoding failed: {e}"),
                    )))
                })?;
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&json)?;
                vec![Ok(encoder.take_row())]
            }
        };

        Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
    }
}

fn borrow_rows(
    schema: &Arc<Vec<FieldInfo>>,
    counts: Vec<BorrowCount>,
) -> Vec<PgWireResult<pgwire::messages::data::DataRow>> {
    counts
        .into_iter()
        .map(|c| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&c.equipment_type)?;
            encoder.encode_field(&(c.borrow_count as i64))?;
            encoder.encode_field(&c.percentage)?;
            Ok(encoder.take_row())
        })
        .collect()
}

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn schema_for(cmd: &Command) -> Vec<FieldInfo> {
    match cmd {
        Command::SelectSummary => vec![
            field("avg_borrowing_duration", Type::FLOAT8),
            field("late_return_rate", Type::FLOAT8),
        ],
        Command::SelectOccupancy { .. } => vec![
            field("equipment", Type::VARCHAR),
            field("granularity", Type::VARCHAR),
            field("bucket", Type::INT8),
            field("label", Type::VARCHAR),
            field("borrowed", Type::INT8),
            field("capacity", Type::INT8),
            field("availability_percent", Type::FLOAT8),
            field("health", Type::VARCHAR),
        ],
        Command::SelectMostBorrowed | Command::SelectLeastBorrowed => vec![
            field("equipment", Type::VARCHAR),
            field("borrow_count", Type::INT8),
            field("percentage", Type::FLOAT8),
        ],
        Command::SelectRunOutFrequency { .. } => vec![
            field("equipment", Type::VARCHAR),
            field("run_out_count", Type::INT8),
            field("capacity", Type::INT8),
            field("percentage", Type::FLOAT8),
            field("currently_borrowed", Type::INT8),
            field("utilization_rate", Type::FLOAT8),
        ],
        Command::SelectRecentTransactions { .. } => vec![
            field("kind", Type::VARCHAR),
            field("id", Type::VARCHAR),
            field("borrower_id", Type::VARCHAR),
            field("borrower_name", Type::VARCHAR),
            field("equipment", Type::VARCHAR),
            field("out_quantity", Type::INT8),
            field("out_at", Type::INT8),
            field("in_quantity", Type::INT8),
            field("in_at", Type::INT8),
            field("status", Type::VARCHAR),
            field("effective_at", Type::INT8),
        ],
        Command::SelectReport { .. } => vec![field("report", Type::VARCHAR)],
    }
}

/// Result columns for a statement, or none when it does not parse.
fn schema_for_sql(sql: &str) -> Vec<FieldInfo> {
    sql::parse_sql(sql)
        .map(|cmd| schema_for(&cmd))
        .unwrap_or_default()
}

#[async_trait]
impl SimpleQueryHandler for LoanstatHandler {
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
        Ok(vec![self.run_query(query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct LoanstatQueryParser;

#[async_trait]
impl QueryParser for LoanstatQueryParser {
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
        Ok(schema_for_sql(&blank_params(stmt)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for LoanstatHandler {
    type Statement = String;
    type QueryParser = LoanstatQueryParser;

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
        self.run_query(&sql).await
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
            schema_for_sql(&blank_params(&target.statement)),
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
        Ok(DescribePortalResponse::new(schema_for_sql(&substitute_params(
            target,
        ))))
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

/// Replace placeholders with a neutral literal so the statement parses for
/// schema inference before parameters are bound.
fn blank_params(sql: &str) -> String {
    let mut result = sql.to_string();
    for i in (1..=count_params(sql)).rev() {
        result = result.replace(&format!("${i}"), "'day'");
    }
    result
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
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

pub struct LoanstatFactory {
    handler: Arc<LoanstatHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<LoanstatAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl LoanstatFactory {
    pub fn new(engine: Arc<ReportEngine>, password: String) -> Self {
        let auth_source = LoanstatAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(LoanstatHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for LoanstatFactory {
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

fn report_sqlstate(e: &ReportError) -> &'static str {
    match e {
        ReportError::StoreUnavailable(_) => "08006",
        _ => "P0001",
    }
}

fn report_err(e: ReportError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        report_sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
