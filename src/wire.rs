use std::collections::HashMap;
use std::fmt::Debug;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use async_trait::async_trait;
use futures::{Sink, SinkExt, stream};
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
use pgwire::messages::response::NotificationResponse;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::warn;

use crate::auth::AppointdAuthSource;
use crate::engine::{CalendarEntry, ConflictSource, Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Call, Command, Shape};
use crate::tenant::TenantManager;

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    auth: AppointdAuthSource,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(AppointdFactory::new(tenant_manager, auth));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

/// Per-connection handler. The tenant is the connection's database name and
/// the actor recorded on writes is its user name.
pub struct AppointdHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<AppointdQueryParser>,
    /// LISTEN subscriptions by channel name.
    listeners: Mutex<HashMap<String, broadcast::Receiver<Signal>>>,
}

impl AppointdHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(AppointdQueryParser),
            listeners: Mutex::new(HashMap::new()),
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

    fn listeners(&self) -> MutexGuard<'_, HashMap<String, broadcast::Receiver<Signal>>> {
        self.listeners.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Parse, execute and account one statement, then flush pending
    /// notifications to the client.
    async fn run<C>(&self, client: &mut C, query: &str, format: Option<&Format>) -> PgWireResult<Response>
    where
        C: ClientInfo + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let actor = client.metadata().get("user").cloned();
        let cmd = match sql::parse_sql(query) {
            Ok(cmd) => cmd,
            Err(e) => {
                metrics::counter!(observability::QUERIES_TOTAL, "command" => "unparsed", "status" => "error")
                    .increment(1);
                return Err(sql_err(e));
            }
        };

        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(&engine, cmd, actor, format).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);

        self.deliver_notifications(client).await?;
        result
    }

    async fn deliver_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        let pending = {
            let mut listeners = self.listeners();
            let mut pending = Vec::new();
            for (channel, receiver) in listeners.iter_mut() {
                loop {
                    match receiver.try_recv() {
                        Ok(signal) => pending.push((channel.clone(), signal)),
                        Err(TryRecvError::Lagged(skipped)) => {
                            warn!(channel = %channel, skipped, "listener fell behind, notifications dropped");
                        }
                        Err(TryRecvError::Empty | TryRecvError::Closed) => break,
                    }
                }
            }
            pending
        };

        let pid = std::process::id() as i32;
        for (channel, signal) in pending {
            let payload = serde_json::to_string(&signal).map_err(|e| PgWireError::ApiError(Box::new(e)))?;
            client
                .send(PgWireBackendMessage::NotificationResponse(NotificationResponse::new(
                    pid, channel, payload,
                )))
                .await?;
        }
        Ok(())
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        cmd: Command,
        actor: Option<String>,
        format: Option<&Format>,
    ) -> PgWireResult<Response> {
        let shape = cmd.shape();
        match cmd {
            Command::InsertStaff { id, name } => {
                engine.register_staff(id, name).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteStaff { id } => {
                engine.deactivate_staff(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertService(service) => {
                engine.define_service(service).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteService { id } => {
                engine.retire_service(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertException(request) => {
                engine
                    .create_exception(request, actor)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteException { id } => {
                engine.delete_exception(id, actor).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertAppointment(request) => {
                let count = request.lines.len();
                engine
                    .create_appointment(request, actor)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(count)))
            }
            Command::DeleteAppointment { id } => {
                engine.delete_appointment(id, actor).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::Call(call) => self.execute_call(engine, call, actor, format).await,
            Command::SelectStaff => {
                let staff = engine.list_staff().await.map_err(engine_err)?;
                Ok(rows(shape, format, &staff, staff_row))
            }
            Command::SelectServices => Ok(rows(shape, format, &engine.list_services(), service_row)),
            Command::SelectExceptions {
                staff_id,
                include_deleted,
            } => {
                let exceptions = engine
                    .list_exceptions(staff_id, include_deleted)
                    .await
                    .map_err(engine_err)?;
                Ok(rows(shape, format, &exceptions, exception_row))
            }
            Command::SelectAppointments { id, filter } => {
                let appointments = match id {
                    Some(id) => engine
                        .get_appointment(id)
                        .ok()
                        .filter(|a| filter.matches(a))
                        .into_iter()
                        .collect(),
                    None => engine.list_appointments(&filter),
                };
                Ok(rows(shape, format, &appointments, appointment_row))
            }
            Command::SelectCompletions {
                appointment_id,
                history,
            } => {
                let completions = if history {
                    engine.completion_history(appointment_id)
                } else {
                    match engine.get_completion(appointment_id) {
                        Ok(completion) => vec![completion],
                        Err(EngineError::NotFound(..)) => Vec::new(),
                        Err(e) => return Err(engine_err(e)),
                    }
                };
                Ok(rows(shape, format, &completions, completion_row))
            }
            Command::SelectAvailability { staff_id, window } => {
                let free = engine.free_time(staff_id, window).await.map_err(engine_err)?;
                Ok(rows(shape, format, &free, |e, span| span_row(e, staff_id, span)))
            }
            Command::SelectUnavailability { staff_id, window } => {
                let intervals = engine
                    .unavailable_intervals(staff_id, window)
                    .await
                    .map_err(engine_err)?;
                Ok(rows(shape, format, &intervals, |e, u| {
                    e.encode_field(&staff_id.to_string())?;
                    e.encode_field(&u.exception_id.to_string())?;
                    e.encode_field(&u.kind.as_str())?;
                    e.encode_field(&u.span.start)?;
                    e.encode_field(&u.span.end)
                }))
            }
            Command::SelectCalendar { staff_id, window } => {
                let entries = engine.calendar(staff_id, window).await.map_err(engine_err)?;
                Ok(rows(shape, format, &entries, |e, entry| calendar_row(e, staff_id, entry)))
            }
            Command::SelectSlots {
                staff_id,
                service_id,
                window,
                step,
            } => {
                let slots = engine
                    .find_open_slots(staff_id, service_id, window, step)
                    .await
                    .map_err(engine_err)?;
                Ok(rows(shape, format, &slots, |e, slot| {
                    e.encode_field(&staff_id.to_string())?;
                    e.encode_field(&service_id.to_string())?;
                    e.encode_field(&slot.start)?;
                    e.encode_field(&slot.end)
                }))
            }
            Command::SelectConflicts {
                staff_id,
                service_id,
                start,
                end,
                exclude,
            } => {
                let conflict = engine
                    .check_window(staff_id, service_id, start, end, exclude)
                    .await
                    .map_err(engine_err)?;
                Ok(rows(shape, format, [conflict], |e, conflict| {
                    let with = conflict.map(|c| match c.with {
                        ConflictSource::Appointment { id, window } => ("appointment", id, window),
                        ConflictSource::Exception { id, kind, window } => (kind.as_str(), id, window),
                    });
                    e.encode_field(&staff_id.to_string())?;
                    e.encode_field(&with.is_some())?;
                    e.encode_field(&with.map(|(source, _, _)| source.to_string()))?;
                    e.encode_field(&with.map(|(_, id, _)| id.to_string()))?;
                    e.encode_field(&with.map(|(_, _, window)| window.start))?;
                    e.encode_field(&with.map(|(_, _, window)| window.end))
                }))
            }
            Command::Listen { channel } => {
                let hub = engine.notify.clone();
                self.listeners()
                    .entry(channel)
                    .or_insert_with_key(|channel| hub.subscribe(channel));
                Ok(Response::Execution(Tag::new("LISTEN")))
            }
            Command::Unlisten { channel } => {
                self.listeners().remove(&channel);
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
            Command::UnlistenAll => {
                self.listeners().clear();
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
        }
    }

    async fn execute_call(
        &self,
        engine: &Engine,
        call: Call,
        actor: Option<String>,
        format: Option<&Format>,
    ) -> PgWireResult<Response> {
        let appointment = match call {
            Call::Confirm { id } => engine.confirm_appointment(id, actor).await,
            Call::Start { id } => engine.start_appointment(id, actor).await,
            Call::Cancel { id, reason } => engine.cancel_appointment(id, &reason, actor).await,
            Call::Reschedule {
                id,
                new_id,
                start,
                end,
                staff_id,
            } => {
                engine
                    .reschedule_appointment(id, new_id, start, end, staff_id, actor)
                    .await
            }
            Call::MarkNoShow { id } => engine.mark_no_show(id, actor).await,
            Call::Complete { id } => engine.complete_appointment(id, actor).await,
            Call::EvaluateCompletion { id } => engine.evaluate_completion(id, actor).await,
            Call::RecordDeposit { id } => engine.record_deposit(id, actor).await,
            Call::ProviderConfirmation {
                id,
                price_charged,
                method,
            } => {
                let completion = engine
                    .record_provider_confirmation(id, price_charged, method, actor)
                    .await
                    .map_err(engine_err)?;
                return Ok(rows(Shape::Completions, format, [completion], |e, c| completion_row(e, &c)));
            }
            Call::ClientConfirmation { id } => {
                let completion = engine
                    .record_client_confirmation(id, actor)
                    .await
                    .map_err(engine_err)?;
                return Ok(rows(Shape::Completions, format, [completion], |e, c| completion_row(e, &c)));
            }
            Call::VoidCompletion { id } => {
                let completion = engine.void_completion(id, actor).await.map_err(engine_err)?;
                return Ok(rows(Shape::Completions, format, [completion], |e, c| completion_row(e, &c)));
            }
            Call::TimeoutCheck { id } => {
                let signals = engine.timeout_check(id).await.map_err(engine_err)?;
                return Ok(rows(Shape::Signals, format, &signals, signal_row));
            }
            Call::UpdateStaff { id, name, active } => {
                let staff = engine.update_staff(id, name, active).await.map_err(engine_err)?;
                return Ok(rows(Shape::Staff, format, [staff], |e, s| staff_row(e, &s)));
            }
            Call::UpdateException(request) => {
                let exception = engine
                    .update_exception(request, actor)
                    .await
                    .map_err(engine_err)?;
                return Ok(rows(Shape::Exceptions, format, [exception], |e, x| exception_row(e, &x)));
            }
        };
        let appointment = appointment.map_err(engine_err)?;
        Ok(rows(Shape::Appointments, format, [appointment], |e, a| appointment_row(e, &a)))
    }
}

// ── Result rows ──────────────────────────────────────────────────

fn column(name: &str, datatype: Type, format: Option<&Format>, idx: usize) -> FieldInfo {
    let field_format = format.map_or(FieldFormat::Text, |f| f.format_for(idx));
    FieldInfo::new(name.into(), None, None, datatype, field_format)
}

fn schema(shape: Shape, format: Option<&Format>) -> Vec<FieldInfo> {
    let columns: &[(&str, Type)] = match shape {
        Shape::None => &[],
        Shape::Staff => &[("id", Type::VARCHAR), ("name", Type::VARCHAR), ("active", Type::BOOL)],
        Shape::Services => &[
            ("id", Type::VARCHAR),
            ("name", Type::VARCHAR),
            ("duration", Type::INT8),
            ("prep_minutes", Type::INT8),
            ("cleanup_minutes", Type::INT8),
            ("price", Type::INT8),
            ("deposit", Type::INT8),
            ("active", Type::BOOL),
        ],
        Shape::Exceptions => &[
            ("id", Type::VARCHAR),
            ("staff_id", Type::VARCHAR),
            ("kind", Type::VARCHAR),
            ("start", Type::INT8),
            ("end", Type::INT8),
            ("full_day", Type::BOOL),
            ("recurrence_rule", Type::VARCHAR),
            ("notes", Type::VARCHAR),
            ("deleted_at", Type::INT8),
        ],
        Shape::Appointments => &[
            ("id", Type::VARCHAR),
            ("client_id", Type::VARCHAR),
            ("staff_id", Type::VARCHAR),
            ("status", Type::VARCHAR),
            ("start", Type::INT8),
            ("end", Type::INT8),
            ("lines", Type::INT8),
            ("total_price", Type::INT8),
            ("deposit_amount", Type::INT8),
            ("deposit_paid", Type::BOOL),
            ("previous_appointment_id", Type::VARCHAR),
            ("rescheduled_to", Type::VARCHAR),
            ("cancellation_reason", Type::VARCHAR),
            ("notes", Type::VARCHAR),
            ("deleted_at", Type::INT8),
        ],
        Shape::Completions => &[
            ("id", Type::VARCHAR),
            ("appointment_id", Type::VARCHAR),
            ("price_charged", Type::INT8),
            ("payment_method", Type::VARCHAR),
            ("provider_confirmed", Type::BOOL),
            ("client_confirmed", Type::BOOL),
            ("completion_date", Type::INT8),
            ("completion_due_sent_at", Type::INT8),
            ("reminder_sent_at", Type::INT8),
            ("deleted_at", Type::INT8),
        ],
        Shape::Availability => &[("staff_id", Type::VARCHAR), ("start", Type::INT8), ("end", Type::INT8)],
        Shape::Unavailability => &[
            ("staff_id", Type::VARCHAR),
            ("exception_id", Type::VARCHAR),
            ("kind", Type::VARCHAR),
            ("start", Type::INT8),
            ("end", Type::INT8),
        ],
        Shape::Calendar => &[
            ("staff_id", Type::VARCHAR),
            ("entry", Type::VARCHAR),
            ("ref_id", Type::VARCHAR),
            ("status", Type::VARCHAR),
            ("start", Type::INT8),
            ("end", Type::INT8),
            ("effective_start", Type::INT8),
            ("effective_end", Type::INT8),
        ],
        Shape::Slots => &[
            ("staff_id", Type::VARCHAR),
            ("service_id", Type::VARCHAR),
            ("start", Type::INT8),
            ("end", Type::INT8),
        ],
        Shape::Conflicts => &[
            ("staff_id", Type::VARCHAR),
            ("conflict", Type::BOOL),
            ("source", Type::VARCHAR),
            ("conflicting_id", Type::VARCHAR),
            ("start", Type::INT8),
            ("end", Type::INT8),
        ],
        Shape::Signals => &[
            ("kind", Type::VARCHAR),
            ("appointment_id", Type::VARCHAR),
            ("payload", Type::VARCHAR),
        ],
    };
    columns
        .iter()
        .enumerate()
        .map(|(idx, (name, datatype))| column(name, datatype.clone(), format, idx))
        .collect()
}

fn rows<T>(
    shape: Shape,
    format: Option<&Format>,
    items: impl IntoIterator<Item = T>,
    encode: impl Fn(&mut DataRowEncoder, T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema(shape, format));
    let rows: Vec<PgWireResult<_>> = items
        .into_iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn staff_row(e: &mut DataRowEncoder, staff: &StaffInfo) -> PgWireResult<()> {
    e.encode_field(&staff.id.to_string())?;
    e.encode_field(&staff.name)?;
    e.encode_field(&staff.active)
}

fn service_row(e: &mut DataRowEncoder, service: &ServiceDefinition) -> PgWireResult<()> {
    e.encode_field(&service.id.to_string())?;
    e.encode_field(&service.name)?;
    e.encode_field(&service.duration)?;
    e.encode_field(&service.prep_minutes)?;
    e.encode_field(&service.cleanup_minutes)?;
    e.encode_field(&service.price)?;
    e.encode_field(&service.deposit)?;
    e.encode_field(&service.active)
}

fn exception_row(e: &mut DataRowEncoder, exception: &AvailabilityException) -> PgWireResult<()> {
    e.encode_field(&exception.id.to_string())?;
    e.encode_field(&exception.staff_id.to_string())?;
    e.encode_field(&exception.kind.as_str())?;
    e.encode_field(&exception.span.start)?;
    e.encode_field(&exception.span.end)?;
    e.encode_field(&exception.full_day)?;
    e.encode_field(&exception.recurrence_rule)?;
    e.encode_field(&exception.notes)?;
    e.encode_field(&exception.audit.deleted_at)
}

fn appointment_row(e: &mut DataRowEncoder, a: &Appointment) -> PgWireResult<()> {
    e.encode_field(&a.id.to_string())?;
    e.encode_field(&a.client_id.to_string())?;
    e.encode_field(&a.staff_id.to_string())?;
    e.encode_field(&a.status.as_str())?;
    e.encode_field(&a.span.start)?;
    e.encode_field(&a.span.end)?;
    e.encode_field(&(a.lines.len() as i64))?;
    e.encode_field(&a.total_price)?;
    e.encode_field(&a.deposit_amount)?;
    e.encode_field(&a.deposit_paid)?;
    e.encode_field(&a.previous_appointment_id.map(|id| id.to_string()))?;
    e.encode_field(&a.rescheduled_to.map(|id| id.to_string()))?;
    e.encode_field(&a.cancellation_reason)?;
    e.encode_field(&a.notes)?;
    e.encode_field(&a.audit.deleted_at)
}

fn completion_row(e: &mut DataRowEncoder, c: &ServiceCompletion) -> PgWireResult<()> {
    e.encode_field(&c.id.to_string())?;
    e.encode_field(&c.appointment_id.to_string())?;
    e.encode_field(&c.price_charged)?;
    e.encode_field(&c.payment_method.as_ref().map(|m| m.as_str().to_string()))?;
    e.encode_field(&c.provider_confirmed)?;
    e.encode_field(&c.client_confirmed)?;
    e.encode_field(&c.completion_date)?;
    e.encode_field(&c.completion_due_sent_at)?;
    e.encode_field(&c.reminder_sent_at)?;
    e.encode_field(&c.audit.deleted_at)
}

fn span_row(e: &mut DataRowEncoder, staff_id: ulid::Ulid, span: &Span) -> PgWireResult<()> {
    e.encode_field(&staff_id.to_string())?;
    e.encode_field(&span.start)?;
    e.encode_field(&span.end)
}

fn calendar_row(e: &mut DataRowEncoder, staff_id: ulid::Ulid, entry: &CalendarEntry) -> PgWireResult<()> {
    e.encode_field(&staff_id.to_string())?;
    match entry {
        CalendarEntry::Appointment {
            appointment_id,
            status,
            span,
            effective,
            ..
        } => {
            e.encode_field(&"appointment")?;
            e.encode_field(&appointment_id.to_string())?;
            e.encode_field(&Some(status.as_str()))?;
            e.encode_field(&span.start)?;
            e.encode_field(&span.end)?;
            e.encode_field(&effective.start)?;
            e.encode_field(&effective.end)
        }
        CalendarEntry::Unavailable(u) => {
            e.encode_field(&u.kind.as_str())?;
            e.encode_field(&u.exception_id.to_string())?;
            e.encode_field(&None::<&str>)?;
            e.encode_field(&u.span.start)?;
            e.encode_field(&u.span.end)?;
            e.encode_field(&u.span.start)?;
            e.encode_field(&u.span.end)
        }
    }
}

fn signal_row(e: &mut DataRowEncoder, signal: &Signal) -> PgWireResult<()> {
    let payload = serde_json::to_string(signal).map_err(|err| PgWireError::ApiError(Box::new(err)))?;
    e.encode_field(&signal.kind())?;
    e.encode_field(&signal.appointment_id().to_string())?;
    e.encode_field(&payload)
}

// ── Simple Query Protocol ────────────────────────────────────────

#[async_trait]
impl SimpleQueryHandler for AppointdHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(client, query, None).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct AppointdQueryParser;

#[async_trait]
impl QueryParser for AppointdQueryParser {
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
        Ok(schema(sql::result_shape(stmt), column_format))
    }
}

#[async_trait]
impl ExtendedQueryHandler for AppointdHandler {
    type Statement = String;
    type QueryParser = AppointdQueryParser;

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
        self.run(client, &sql, Some(&portal.result_column_format)).await
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
        let fields = schema(sql::result_shape(&target.statement), None);
        Ok(DescribeStatementResponse::new(param_types, fields))
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
        let shape = sql::result_shape(&target.statement.statement);
        Ok(DescribePortalResponse::new(schema(shape, Some(&target.result_column_format))))
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
            if let Ok(n) = sql[start..i].parse::<usize>() {
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
    let mut result = portal.statement.statement.to_string();
    // Highest index first so $1 does not clobber the prefix of $10.
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

pub struct AppointdFactory {
    handler: Arc<AppointdHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<AppointdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl AppointdFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, auth: AppointdAuthSource) -> Self {
        Self {
            handler: Arc::new(AppointdHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth,
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for AppointdFactory {
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
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

/// SQLSTATE per engine error kind.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation(_) => "22023",
        EngineError::Conflict(_) => "23P01",
        EngineError::InvalidTransition { .. } => "55000",
        EngineError::NotFound(..) => "02000",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::ConcurrencyConflict { .. } => "40001",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::Storage(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
