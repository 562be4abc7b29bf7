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

use crate::auth::{self, BerthAuthSource, PermissionDenied};
use crate::engine::{ConflictReport, Engine, EngineError};
use crate::limits::MAX_QUERY_PARAMS;
use crate::model::*;
use crate::observability;
use crate::sql::{self, AllocationSelector, Command, SqlError};

pub struct BerthHandler {
    engine: Arc<Engine>,
    query_parser: Arc<BerthQueryParser>,
}

impl BerthHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(BerthQueryParser),
        }
    }

    /// The logged-in caller, looked up again on every statement so a disabled
    /// account loses access without reconnecting.
    fn session_user<C: ClientInfo>(&self, client: &C) -> PgWireResult<AuthUser> {
        let username = client.metadata().get("user").cloned().unwrap_or_default();
        self.engine.authenticate(&username).ok_or_else(|| {
            metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
            user_error("28000", format!("no active session for user \"{username}\""))
        })
    }

    async fn run<C: ClientInfo>(&self, client: &C, query: &str) -> PgWireResult<Vec<Response>> {
        let user = self.session_user(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        auth::authorize(&user, &cmd).map_err(permission_err)?;

        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Vec<Response>> {
        let engine = &self.engine;
        match cmd {
            // ── Catalog ──────────────────────────────────────────
            Command::InsertCategory {
                id,
                name,
                description,
            } => {
                engine
                    .create_category(id, name, description)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateCategory { id, changes } => {
                engine.update_category(id, changes).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteCategory { id } => {
                engine.delete_category(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectCategories => Ok(vec![rows_response(
                category_schema(),
                &engine.list_categories(),
                encode_category,
            )]),
            Command::InsertResource {
                id,
                name,
                category_id,
                status,
                description,
            } => {
                engine
                    .create_resource(id, name, category_id, status, description)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateResource { id, changes } => {
                engine.update_resource(id, changes).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteResource { id } => {
                engine.delete_resource(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectResources { id } => {
                let resources = match id {
                    Some(id) => vec![engine.get_resource_record(id).await.map_err(engine_err)?],
                    None => engine.list_resources().await,
                };
                Ok(vec![rows_response(resource_schema(), &resources, encode_resource)])
            }
            Command::InsertProject {
                id,
                name,
                manager,
                status,
                description,
            } => {
                engine
                    .create_project(id, name, manager, status, description)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateProject { id, changes } => {
                engine.update_project(id, changes).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteProject { id } => {
                engine.delete_project(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectProjects { id } => {
                let projects = match id {
                    Some(id) => vec![engine.get_project(id).map_err(engine_err)?],
                    None => engine.list_projects(),
                };
                Ok(vec![rows_response(project_schema(), &projects, encode_project)])
            }
            Command::InsertUser { id, user } => {
                engine.create_user(id, user).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateUser { id, changes } => {
                engine.update_user(id, changes).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::SelectUsers => Ok(vec![rows_response(
                user_schema(),
                &engine.list_users(),
                encode_user,
            )]),

            // ── Allocations ──────────────────────────────────────
            Command::InsertAllocation {
                id,
                resource_id,
                project_id,
                start,
                end,
                note,
            } => {
                let outcome = engine
                    .create_allocation(id, resource_id, project_id, start, end, note)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![rows_response(
                    grant_schema(),
                    &[(outcome.allocation, outcome.severity)],
                    encode_grant,
                )])
            }
            Command::UpdateAllocation { id, changes } => {
                let outcome = engine
                    .update_allocation(id, changes)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![rows_response(
                    grant_schema(),
                    &[(outcome.allocation, outcome.severity)],
                    encode_grant,
                )])
            }
            Command::CancelAllocation { id } => {
                let allocation = engine.cancel_allocation(id).await.map_err(engine_err)?;
                Ok(vec![rows_response(
                    grant_schema(),
                    &[(allocation, Severity::None)],
                    encode_grant,
                )])
            }
            Command::DeleteAllocation { id } => {
                let deleted = engine.delete_allocation(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(
                    Tag::new("DELETE").with_rows(usize::from(deleted)),
                )])
            }
            Command::SelectAllocations { selector } => {
                let allocations = match selector {
                    AllocationSelector::All => engine.list_allocations().await,
                    AllocationSelector::Id(id) => {
                        vec![engine.get_allocation(id).await.map_err(engine_err)?]
                    }
                    AllocationSelector::Resource(rid) => {
                        engine.list_allocations_by_resource(rid).await
                    }
                    AllocationSelector::Project(pid) => {
                        engine.list_allocations_by_project(pid).await
                    }
                };
                Ok(vec![rows_response(
                    allocation_schema(),
                    &allocations,
                    encode_allocation,
                )])
            }
            Command::CheckConflict {
                resource_id,
                start,
                end,
            } => {
                let report = engine
                    .check_conflict(resource_id, start, end)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![rows_response(conflict_schema(), &[report], encode_conflict)])
            }

            // ── Maintenance ──────────────────────────────────────
            Command::InsertMaintenance {
                id,
                resource_id,
                start,
                end,
                kind,
                reason,
            } => {
                engine
                    .create_maintenance(id, resource_id, start, end, kind, reason)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateMaintenance { id, changes } => {
                engine
                    .update_maintenance(id, changes)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteMaintenance { id } => {
                let deleted = engine.delete_maintenance(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(
                    Tag::new("DELETE").with_rows(usize::from(deleted)),
                )])
            }
            Command::SelectMaintenance { id, filter } => {
                let windows = match id {
                    Some(id) => vec![engine.get_maintenance(id).await.map_err(engine_err)?],
                    None => engine.list_maintenance(filter).await.map_err(engine_err)?,
                };
                Ok(vec![rows_response(
                    maintenance_schema(),
                    &windows,
                    encode_maintenance,
                )])
            }

            // ── Schedule ─────────────────────────────────────────
            Command::SelectSchedule {
                resource_id,
                start,
                end,
            } => {
                let items = engine
                    .get_schedule(resource_id, start, end)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![rows_response(schedule_schema(), &items, encode_schedule_item)])
            }
        }
    }
}

// ── Result sets ──────────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn allocation_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("resource_id"),
        text_field("project_id"),
        int8_field("start"),
        int8_field("end"),
        text_field("status"),
        text_field("note"),
        int8_field("created_at"),
        int8_field("updated_at"),
    ]
}

/// Allocation row plus the severity it was admitted with.
fn grant_schema() -> Vec<FieldInfo> {
    let mut fields = allocation_schema();
    fields.push(text_field("severity"));
    fields
}

fn maintenance_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("resource_id"),
        int8_field("start"),
        int8_field("end"),
        text_field("kind"),
        text_field("reason"),
        int8_field("created_at"),
        int8_field("updated_at"),
    ]
}

fn conflict_schema() -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("has_conflict".into(), None, None, Type::BOOL, FieldFormat::Text),
        text_field("severity"),
        text_field("message"),
    ]
}

fn schedule_schema() -> Vec<FieldInfo> {
    vec![
        text_field("kind"),
        text_field("severity"),
        int8_field("start"),
        int8_field("end"),
        text_field("label"),
        text_field("reference_id"),
    ]
}

fn resource_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("name"),
        text_field("category_id"),
        text_field("status"),
        text_field("description"),
        int8_field("created_at"),
        int8_field("updated_at"),
    ]
}

fn project_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("name"),
        text_field("manager"),
        text_field("status"),
        text_field("description"),
        int8_field("created_at"),
        int8_field("updated_at"),
    ]
}

fn category_schema() -> Vec<FieldInfo> {
    vec![text_field("id"), text_field("name"), text_field("description")]
}

fn user_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("username"),
        text_field("role"),
        text_field("status"),
    ]
}

/// Schema a statement will produce, decided from its verb and target table
/// so it can be described before its parameters are bound.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_ascii_uppercase();
    let words: Vec<&str> = upper
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .collect();
    let Some(verb) = words.first().copied() else {
        return vec![];
    };
    let target = words
        .windows(2)
        .find(|pair| matches!(pair[0], "FROM" | "INTO" | "UPDATE"))
        .map(|pair| pair[1]);

    match (verb, target) {
        ("SELECT", Some("ALLOCATIONS")) => allocation_schema(),
        ("INSERT" | "UPDATE", Some("ALLOCATIONS")) => grant_schema(),
        ("SELECT", Some("MAINTENANCE_WINDOWS")) => maintenance_schema(),
        ("SELECT", Some("CONFLICTS")) => conflict_schema(),
        ("SELECT", Some("SCHEDULE")) => schedule_schema(),
        ("SELECT", Some("RESOURCES")) => resource_schema(),
        ("SELECT", Some("PROJECTS")) => project_schema(),
        ("SELECT", Some("CATEGORIES")) => category_schema(),
        ("SELECT", Some("USERS")) => user_schema(),
        _ => vec![],
    }
}

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

fn encode_allocation(encoder: &mut DataRowEncoder, a: &Allocation) -> PgWireResult<()> {
    encoder.encode_field(&a.id.to_string())?;
    encoder.encode_field(&a.resource_id.to_string())?;
    encoder.encode_field(&a.project_id.to_string())?;
    encoder.encode_field(&a.span.start)?;
    encoder.encode_field(&a.span.end)?;
    encoder.encode_field(&a.status.to_string())?;
    encoder.encode_field(&a.note)?;
    encoder.encode_field(&a.created_at)?;
    encoder.encode_field(&a.updated_at)?;
    Ok(())
}

fn encode_grant(
    encoder: &mut DataRowEncoder,
    (allocation, severity): &(Allocation, Severity),
) -> PgWireResult<()> {
    encode_allocation(encoder, allocation)?;
    encoder.encode_field(&severity.to_string())?;
    Ok(())
}

fn encode_maintenance(encoder: &mut DataRowEncoder, w: &MaintenanceWindow) -> PgWireResult<()> {
    encoder.encode_field(&w.id.to_string())?;
    encoder.encode_field(&w.resource_id.to_string())?;
    encoder.encode_field(&w.span.start)?;
    encoder.encode_field(&w.span.end)?;
    encoder.encode_field(&w.kind.to_string())?;
    encoder.encode_field(&w.reason)?;
    encoder.encode_field(&w.created_at)?;
    encoder.encode_field(&w.updated_at)?;
    Ok(())
}

fn encode_conflict(encoder: &mut DataRowEncoder, report: &ConflictReport) -> PgWireResult<()> {
    encoder.encode_field(&report.has_conflict)?;
    encoder.encode_field(&report.severity.to_string())?;
    encoder.encode_field(&report.message)?;
    Ok(())
}

fn encode_schedule_item(encoder: &mut DataRowEncoder, item: &ScheduleItem) -> PgWireResult<()> {
    encoder.encode_field(&item.kind.as_str().to_string())?;
    encoder.encode_field(&item.severity.to_string())?;
    encoder.encode_field(&item.span.start)?;
    encoder.encode_field(&item.span.end)?;
    encoder.encode_field(&item.label)?;
    encoder.encode_field(&item.reference_id.to_string())?;
    Ok(())
}

fn encode_resource(encoder: &mut DataRowEncoder, r: &Resource) -> PgWireResult<()> {
    encoder.encode_field(&r.id.to_string())?;
    encoder.encode_field(&r.name)?;
    encoder.encode_field(&r.category_id.map(|c| c.to_string()))?;
    encoder.encode_field(&r.status.to_string())?;
    encoder.encode_field(&r.description)?;
    encoder.encode_field(&r.created_at)?;
    encoder.encode_field(&r.updated_at)?;
    Ok(())
}

fn encode_project(encoder: &mut DataRowEncoder, p: &Project) -> PgWireResult<()> {
    encoder.encode_field(&p.id.to_string())?;
    encoder.encode_field(&p.name)?;
    encoder.encode_field(&p.manager)?;
    encoder.encode_field(&p.status.to_string())?;
    encoder.encode_field(&p.description)?;
    encoder.encode_field(&p.created_at)?;
    encoder.encode_field(&p.updated_at)?;
    Ok(())
}

fn encode_category(encoder: &mut DataRowEncoder, c: &Category) -> PgWireResult<()> {
    encoder.encode_field(&c.id.to_string())?;
    encoder.encode_field(&c.name)?;
    encoder.encode_field(&c.description)?;
    Ok(())
}

fn encode_user(encoder: &mut DataRowEncoder, u: &User) -> PgWireResult<()> {
    encoder.encode_field(&u.id.to_string())?;
    encoder.encode_field(&u.username)?;
    encoder.encode_field(&u.role.to_string())?;
    encoder.encode_field(&u.status.to_string())?;
    Ok(())
}

// ── Simple Query Protocol ────────────────────────────────────────

#[async_trait]
impl SimpleQueryHandler for BerthHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.run(client, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct BerthQueryParser;

#[async_trait]
impl QueryParser for BerthQueryParser {
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
        parameter_types(stmt)
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
impl ExtendedQueryHandler for BerthHandler {
    type Statement = String;
    type QueryParser = BerthQueryParser;

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
        let mut responses = self.run(client, &sql).await?;
        if responses.is_empty() {
            return Ok(Response::EmptyQuery);
        }
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
        let param_types = parameter_types(&target.statement)?;
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
        i += 1;
        if bytes[i - 1] != b'$' {
            continue;
        }
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

/// Every parameter is bound as text. Placeholders past `MAX_QUERY_PARAMS` are refused.
fn parameter_types(sql: &str) -> PgWireResult<Vec<Type>> {
    let n = count_params(sql);
    if n > MAX_QUERY_PARAMS {
        return Err(user_error(
            "54000",
            format!("parameter ${n} exceeds the limit of {MAX_QUERY_PARAMS}"),
        ));
    }
    Ok(vec![Type::VARCHAR; n])
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Highest index first so `$1` never clobbers the prefix of `$10`.
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

pub struct BerthFactory {
    handler: Arc<BerthHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<BerthAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl BerthFactory {
    pub fn new(engine: Arc<Engine>) -> Self {
        let auth_source = BerthAuthSource::new(engine.clone());
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(BerthHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for BerthFactory {
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
    engine: Arc<Engine>,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(BerthFactory::new(engine));
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

fn engine_error_code(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation(_) => "22023",
        EngineError::NotFound { .. } => "P0002",
        EngineError::Conflict { .. } => "23P01",
        EngineError::Constraint(_) => "23000",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "XX000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    if let EngineError::WalError(msg) = &e {
        tracing::error!("storage failure: {msg}");
    }
    user_error(engine_error_code(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = if e.is_validation() { "22023" } else { "42601" };
    user_error(code, e.to_string())
}

fn permission_err(e: PermissionDenied) -> PgWireError {
    tracing::info!("{e}");
    user_error("42501", e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn names(fields: &[FieldInfo]) -> Vec<String> {
        fields.iter().map(|f| f.name().to_string()).collect()
    }

    #[test]
    fn count_params_finds_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM allocations"), 0);
        assert_eq!(count_params("SELECT * FROM allocations WHERE id = $1"), 1);
        assert_eq!(
            count_params(r#"INSERT INTO allocations VALUES ($1, $2, $3, $10, $4, $5)"#),
            10
        );
        assert_eq!(count_params("SELECT '$'"), 0);
    }

    #[test]
    fn parameter_types_are_capped() {
        assert_eq!(parameter_types("SELECT * FROM allocations WHERE id = $2").unwrap().len(), 2);
        let at_limit = format!("SELECT * FROM allocations WHERE id = ${MAX_QUERY_PARAMS}");
        assert_eq!(parameter_types(&at_limit).unwrap().len(), MAX_QUERY_PARAMS);
        match parameter_types("SELECT * FROM allocations WHERE id = $4000000000") {
            Err(PgWireError::UserError(info)) => assert_eq!(info.code, "54000"),
            Err(other) => panic!("expected a user error, got {other}"),
            Ok(types) => panic!("expected refusal, got {} parameter types", types.len()),
        }
    }

    #[test]
    fn result_schema_follows_target_table() {
        assert_eq!(
            names(&result_schema("INSERT INTO allocations (id) VALUES ($1)"))
                .last()
                .map(String::as_str),
            Some("severity")
        );
        assert_eq!(
            names(&result_schema("select * from conflicts where resource_id = $1")),
            vec!["has_conflict", "severity", "message"]
        );
        assert_eq!(
            names(&result_schema("SELECT * FROM allocations WHERE resource_id = $1")).len(),
            9
        );
        assert_eq!(
            names(&result_schema("SELECT * FROM users")),
            vec!["id", "username", "role", "status"]
        );
        assert!(result_schema("DELETE FROM allocations WHERE id = $1").is_empty());
        assert!(result_schema("INSERT INTO projects (name) VALUES ('x')").is_empty());
        assert!(result_schema("").is_empty());
    }

    #[test]
    fn engine_errors_map_to_sqlstate() {
        let id = Ulid::new();
        let cases = [
            (EngineError::Validation("x".into()), "22023"),
            (EngineError::not_found("resource", id), "P0002"),
            (
                EngineError::Conflict {
                    resource_id: id,
                    span: Span::new(0, 1),
                },
                "23P01",
            ),
            (EngineError::Constraint("x".into()), "23000"),
            (EngineError::AlreadyExists(id), "23505"),
            (EngineError::LimitExceeded("x"), "54000"),
            (EngineError::WalError("x".into()), "XX000"),
        ];
        for (err, code) in cases {
            assert_eq!(engine_error_code(&err), code, "{err}");
        }
    }
}
