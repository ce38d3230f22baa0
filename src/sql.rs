use sqlparser::ast::{
    self, Expr, FromTable, FunctionArg, FunctionArgExpr, FunctionArguments, ObjectNamePart,
    SelectItem, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::engine::{AppointmentFilter, NewAppointment, NewException, NewLine};
use crate::model::*;
use crate::notify::APPOINTMENTS_CHANNEL;

/// Slot step used when a `slots` query does not name one.
pub const DEFAULT_SLOT_STEP_MS: Ms = 15 * MINUTE;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertStaff {
        id: Ulid,
        name: Option<String>,
    },
    /// Deactivates; staff members are never removed.
    DeleteStaff {
        id: Ulid,
    },
    /// Create or replace a catalog entry.
    InsertService(ServiceDefinition),
    /// Retires the service.
    DeleteService {
        id: Ulid,
    },
    InsertException(NewException),
    DeleteException {
        id: Ulid,
    },
    /// One row per service line.
    InsertAppointment(NewAppointment),
    DeleteAppointment {
        id: Ulid,
    },
    Call(Call),
    SelectStaff,
    SelectServices,
    SelectExceptions {
        staff_id: Ulid,
        include_deleted: bool,
    },
    SelectAppointments {
        id: Option<Ulid>,
        filter: AppointmentFilter,
    },
    SelectCompletions {
        appointment_id: Ulid,
        history: bool,
    },
    SelectAvailability {
        staff_id: Ulid,
        window: Span,
    },
    SelectUnavailability {
        staff_id: Ulid,
        window: Span,
    },
    SelectCalendar {
        staff_id: Ulid,
        window: Span,
    },
    SelectSlots {
        staff_id: Ulid,
        service_id: Ulid,
        window: Span,
        step: Ms,
    },
    SelectConflicts {
        staff_id: Ulid,
        service_id: Ulid,
        start: Ms,
        end: Option<Ms>,
        exclude: Option<Ulid>,
    },
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
}

/// `SELECT function(...)` operations.
#[derive(Debug, PartialEq)]
pub enum Call {
    Confirm { id: Ulid },
    Start { id: Ulid },
    Cancel { id: Ulid, reason: String },
    Reschedule {
        id: Ulid,
        new_id: Ulid,
        start: Ms,
        end: Ms,
        staff_id: Option<Ulid>,
    },
    MarkNoShow { id: Ulid },
    Complete { id: Ulid },
    ProviderConfirmation {
        id: Ulid,
        price_charged: Cents,
        method: PaymentMethod,
    },
    ClientConfirmation { id: Ulid },
    EvaluateCompletion { id: Ulid },
    RecordDeposit { id: Ulid },
    VoidCompletion { id: Ulid },
    TimeoutCheck { id: Ulid },
    UpdateStaff {
        id: Ulid,
        name: Option<String>,
        active: bool,
    },
    UpdateException(NewException),
}

impl Call {
    pub fn name(&self) -> &'static str {
        match self {
            Call::Confirm { .. } => "confirm_appointment",
            Call::Start { .. } => "start_appointment",
            Call::Cancel { .. } => "cancel_appointment",
            Call::Reschedule { .. } => "reschedule_appointment",
            Call::MarkNoShow { .. } => "mark_no_show",
            Call::Complete { .. } => "complete_appointment",
            Call::ProviderConfirmation { .. } => "record_provider_confirmation",
            Call::ClientConfirmation { .. } => "record_client_confirmation",
            Call::EvaluateCompletion { .. } => "evaluate_completion",
            Call::RecordDeposit { .. } => "record_deposit",
            Call::VoidCompletion { .. } => "void_completion",
            Call::TimeoutCheck { .. } => "timeout_check",
            Call::UpdateStaff { .. } => "update_staff",
            Call::UpdateException(_) => "update_exception",
        }
    }
}

/// The row layout a statement answers with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    /// Command tag only.
    None,
    Staff,
    Services,
    Exceptions,
    Appointments,
    Completions,
    Availability,
    Unavailability,
    Calendar,
    Slots,
    Conflicts,
    Signals,
}

impl Shape {
    fn for_table(table: &str) -> Shape {
        match table {
            "staff" => Shape::Staff,
            "services" => Shape::Services,
            "exceptions" => Shape::Exceptions,
            "appointments" => Shape::Appointments,
            "completions" => Shape::Completions,
            "availability" => Shape::Availability,
            "unavailability" => Shape::Unavailability,
            "calendar" => Shape::Calendar,
            "slots" => Shape::Slots,
            "conflicts" => Shape::Conflicts,
            _ => Shape::None,
        }
    }

    fn for_function(function: &str) -> Shape {
        match function {
            "record_provider_confirmation" | "record_client_confirmation" | "void_completion" => {
                Shape::Completions
            }
            "timeout_check" => Shape::Signals,
            "update_staff" => Shape::Staff,
            "update_exception" => Shape::Exceptions,
            "confirm_appointment" | "start_appointment" | "cancel_appointment"
            | "reschedule_appointment" | "mark_no_show" | "complete_appointment"
            | "evaluate_completion" | "record_deposit" => Shape::Appointments,
            _ => Shape::None,
        }
    }
}

impl Command {
    pub fn shape(&self) -> Shape {
        match self {
            Command::Call(call) => Shape::for_function(call.name()),
            Command::SelectStaff => Shape::Staff,
            Command::SelectServices => Shape::Services,
            Command::SelectExceptions { .. } => Shape::Exceptions,
            Command::SelectAppointments { .. } => Shape::Appointments,
            Command::SelectCompletions { .. } => Shape::Completions,
            Command::SelectAvailability { .. } => Shape::Availability,
            Command::SelectUnavailability { .. } => Shape::Unavailability,
            Command::SelectCalendar { .. } => Shape::Calendar,
            Command::SelectSlots { .. } => Shape::Slots,
            Command::SelectConflicts { .. } => Shape::Conflicts,
            Command::InsertStaff { .. }
            | Command::DeleteStaff { .. }
            | Command::InsertService(_)
            | Command::DeleteService { .. }
            | Command::InsertException(_)
            | Command::DeleteException { .. }
            | Command::InsertAppointment(_)
            | Command::DeleteAppointment { .. }
            | Command::Listen { .. }
            | Command::Unlisten { .. }
            | Command::UnlistenAll => Shape::None,
        }
    }
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    if trimmed.is_empty() {
        return Err(SqlError::Empty);
    }
    if let Some(rest) = strip_keyword(trimmed, "UNLISTEN") {
        if rest == "*" {
            return Ok(Command::UnlistenAll);
        }
        return Ok(Command::Unlisten { channel: parse_channel(rest)? });
    }
    if let Some(rest) = strip_keyword(trimmed, "LISTEN") {
        return Ok(Command::Listen { channel: parse_channel(rest)? });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    match stmts.first() {
        None => Err(SqlError::Empty),
        Some(Statement::Insert(insert)) => parse_insert(insert),
        Some(Statement::Delete(delete)) => parse_delete(delete),
        Some(Statement::Query(query)) => parse_select(query),
        Some(other) => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Result layout of a statement without interpreting its values, for
/// describing prepared statements whose parameters are not bound yet.
pub fn result_shape(sql: &str) -> Shape {
    let Ok(stmts) = Parser::parse_sql(&PostgreSqlDialect {}, sql) else {
        return Shape::None;
    };
    let Some(Statement::Query(query)) = stmts.first() else {
        return Shape::None;
    };
    let SetExpr::Select(select) = query.body.as_ref() else {
        return Shape::None;
    };
    match select.from.first() {
        Some(from) => table_factor_name(&from.relation)
            .map(|table| Shape::for_table(&table))
            .unwrap_or(Shape::None),
        None => select_function(select)
            .and_then(|func| object_name_last(&func.name))
            .map(|name| Shape::for_function(&name))
            .unwrap_or(Shape::None),
    }
}

fn strip_keyword<'a>(sql: &'a str, keyword: &str) -> Option<&'a str> {
    let head = sql.get(..keyword.len())?;
    let rest = &sql[keyword.len()..];
    (head.eq_ignore_ascii_case(keyword) && rest.starts_with(char::is_whitespace))
        .then(|| rest.trim())
}

/// `appointments` or `staff_<ulid>`, case-insensitive, optionally quoted.
fn parse_channel(raw: &str) -> Result<String, SqlError> {
    let channel = raw.trim_matches('"').to_ascii_lowercase();
    if channel == APPOINTMENTS_CHANNEL {
        return Ok(channel);
    }
    match channel.strip_prefix("staff_") {
        Some(id) if Ulid::from_string(id).is_ok() => Ok(channel),
        _ => Err(SqlError::Channel(raw.to_string())),
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// Column order assumed when an INSERT names no columns.
fn default_columns(table: &str) -> Option<&'static [&'static str]> {
    Some(match table {
        "staff" => &["id", "name"],
        "services" => &["id", "name", "duration", "prep_minutes", "cleanup_minutes", "price", "deposit"],
        "exceptions" => &["id", "staff_id", "kind", "start", "end", "full_day", "recurrence_rule", "notes"],
        "appointments" => &["id", "client_id", "staff_id", "service_id", "start", "end", "price"],
        _ => return None,
    })
}

/// One VALUES row addressed by column name.
struct Row<'a> {
    table: &'static str,
    columns: &'a [String],
    values: &'a [Expr],
}

impl<'a> Row<'a> {
    fn get(&self, column: &str) -> Option<&'a Expr> {
        let position = self.columns.iter().position(|c| c == column)?;
        self.values.get(position)
    }

    fn required(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn {
            table: self.table,
            column,
        })
    }

    fn ulid(&self, column: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid(self.required(column)?)
    }

    fn opt_ulid(&self, column: &str) -> Result<Option<Ulid>, SqlError> {
        self.get(column).map_or(Ok(None), parse_opt_ulid)
    }

    fn i64(&self, column: &'static str) -> Result<i64, SqlError> {
        parse_i64(self.required(column)?)
    }

    fn opt_i64(&self, column: &str) -> Result<Option<i64>, SqlError> {
        self.get(column).map_or(Ok(None), parse_opt_i64)
    }

    fn opt_string(&self, column: &str) -> Result<Option<String>, SqlError> {
        self.get(column).map_or(Ok(None), parse_opt_string)
    }

    fn bool_or(&self, column: &str, default: bool) -> Result<bool, SqlError> {
        self.get(column).map_or(Ok(default), parse_bool)
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let Some(defaults) = default_columns(&table) else {
        return Err(SqlError::UnknownTable(table));
    };
    let columns: Vec<String> = if insert.columns.is_empty() {
        defaults.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    let rows = extract_insert_rows(insert)?;
    let row = |values, table| Row {
        table,
        columns: &columns,
        values,
    };

    match table.as_str() {
        "staff" => {
            let r = row(single_row(rows, "staff")?, "staff");
            Ok(Command::InsertStaff {
                id: r.ulid("id")?,
                name: r.opt_string("name")?,
            })
        }
        "services" => {
            let r = row(single_row(rows, "services")?, "services");
            Ok(Command::InsertService(ServiceDefinition {
                id: r.ulid("id")?,
                name: r.opt_string("name")?,
                duration: r.i64("duration")?,
                prep_minutes: r.opt_i64("prep_minutes")?.unwrap_or(0),
                cleanup_minutes: r.opt_i64("cleanup_minutes")?.unwrap_or(0),
                price: r.opt_i64("price")?.unwrap_or(0),
                deposit: r.opt_i64("deposit")?.unwrap_or(0),
                active: true,
            }))
        }
        "exceptions" => {
            let r = row(single_row(rows, "exceptions")?, "exceptions");
            Ok(Command::InsertException(NewException {
                id: r.ulid("id")?,
                staff_id: r.ulid("staff_id")?,
                kind: parse_kind(r.required("kind")?)?,
                start: r.i64("start")?,
                end: r.i64("end")?,
                full_day: r.bool_or("full_day", false)?,
                recurrence_rule: r.opt_string("recurrence_rule")?,
                notes: r.opt_string("notes")?,
            }))
        }
        "appointments" => {
            let rows: Vec<Row<'_>> = rows.iter().map(|v| row(v.as_slice(), "appointments")).collect();
            parse_appointment_rows(&rows)
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn single_row<'a>(rows: &'a [Vec<Expr>], table: &'static str) -> Result<&'a [Expr], SqlError> {
    match rows {
        [row] => Ok(row.as_slice()),
        _ => Err(SqlError::Unsupported(format!("multi-row INSERT into {table}"))),
    }
}

/// Rows of one appointment must agree on `id`, `client_id` and `staff_id`;
/// appointment-level columns are read from the first row.
fn parse_appointment_rows(rows: &[Row<'_>]) -> Result<Command, SqlError> {
    let first = rows
        .first()
        .ok_or_else(|| SqlError::Parse("empty VALUES".into()))?;
    let id = first.ulid("id")?;
    let client_id = first.ulid("client_id")?;
    let staff_id = first.ulid("staff_id")?;

    let mut lines = Vec::with_capacity(rows.len());
    for (i, r) in rows.iter().enumerate() {
        if r.ulid("id")? != id || r.ulid("client_id")? != client_id || r.ulid("staff_id")? != staff_id {
            return Err(SqlError::Parse(format!(
                "row {i}: every row of one appointment needs the same id, client_id and staff_id"
            )));
        }
        lines.push(NewLine {
            service_id: r.ulid("service_id")?,
            staff_id: r.opt_ulid("line_staff_id")?,
            start: r.i64("start")?,
            end: r.opt_i64("end")?,
            price: r.opt_i64("price")?,
        });
    }

    Ok(Command::InsertAppointment(NewAppointment {
        id,
        client_id,
        staff_id,
        lines,
        deposit_amount: first.opt_i64("deposit")?,
        notes: first.opt_string("notes")?,
        recurrence_rule: first.opt_string("recurrence_rule")?,
    }))
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "staff" => Ok(Command::DeleteStaff { id }),
        "services" => Ok(Command::DeleteService { id }),
        "exceptions" => Ok(Command::DeleteException { id }),
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
        let func = select_function(select)
            .ok_or_else(|| SqlError::Parse("SELECT without FROM must call a function".into()))?;
        return parse_call(func).map(Command::Call);
    };
    let table = table_factor_name(&from.relation)?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters)?;
    }
    let f = Filters(filters);

    match table.as_str() {
        "staff" => Ok(Command::SelectStaff),
        "services" => Ok(Command::SelectServices),
        "exceptions" => Ok(Command::SelectExceptions {
            staff_id: f.required_ulid("staff_id")?,
            include_deleted: f.flag("include_deleted")?,
        }),
        "appointments" => Ok(Command::SelectAppointments {
            id: f.opt_ulid("id")?,
            filter: AppointmentFilter {
                staff_id: f.opt_ulid("staff_id")?,
                client_id: f.opt_ulid("client_id")?,
                status: f
                    .eq("status")
                    .map(|expr| {
                        let s = parse_string(expr)?;
                        AppointmentStatus::parse(&s)
                            .ok_or_else(|| SqlError::Parse(format!("unknown status: {s}")))
                    })
                    .transpose()?,
                window: f.opt_window()?,
                include_deleted: f.flag("include_deleted")?,
            },
        }),
        "completions" => Ok(Command::SelectCompletions {
            appointment_id: f.required_ulid("appointment_id")?,
            history: f.flag("include_voided")?,
        }),
        "availability" => Ok(Command::SelectAvailability {
            staff_id: f.required_ulid("staff_id")?,
            window: f.window()?,
        }),
        "unavailability" => Ok(Command::SelectUnavailability {
            staff_id: f.required_ulid("staff_id")?,
            window: f.window()?,
        }),
        "calendar" => Ok(Command::SelectCalendar {
            staff_id: f.required_ulid("staff_id")?,
            window: f.window()?,
        }),
        "slots" => Ok(Command::SelectSlots {
            staff_id: f.required_ulid("staff_id")?,
            service_id: f.required_ulid("service_id")?,
            window: f.window()?,
            step: f.eq("step").map(parse_i64).transpose()?.unwrap_or(DEFAULT_SLOT_STEP_MS),
        }),
        "conflicts" => Ok(Command::SelectConflicts {
            staff_id: f.required_ulid("staff_id")?,
            service_id: f.required_ulid("service_id")?,
            start: f
                .eq("start")
                .or_else(|| f.bound("start", Cmp::Ge))
                .map(parse_i64)
                .transpose()?
                .ok_or(SqlError::MissingFilter("start"))?,
            end: f
                .eq("end")
                .or_else(|| f.bound("end", Cmp::Le))
                .map(parse_opt_i64)
                .transpose()?
                .flatten(),
            exclude: f.opt_ulid("exclude")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cmp {
    Eq,
    Ge,
    Le,
}

/// `column <op> value` conjuncts of a WHERE clause.
struct Filters<'a>(Vec<(String, Cmp, &'a Expr)>);

impl<'a> Filters<'a> {
    fn bound(&self, column: &str, cmp: Cmp) -> Option<&'a Expr> {
        self.0
            .iter()
            .find(|(c, op, _)| c == column && *op == cmp)
            .map(|(_, _, expr)| *expr)
    }

    fn eq(&self, column: &str) -> Option<&'a Expr> {
        self.bound(column, Cmp::Eq)
    }

    fn opt_ulid(&self, column: &str) -> Result<Option<Ulid>, SqlError> {
        self.eq(column).map(parse_ulid).transpose()
    }

    fn required_ulid(&self, column: &'static str) -> Result<Ulid, SqlError> {
        self.opt_ulid(column)?.ok_or(SqlError::MissingFilter(column))
    }

    fn flag(&self, column: &str) -> Result<bool, SqlError> {
        self.eq(column).map_or(Ok(false), parse_bool)
    }

    /// `start >= a AND "end" <= b`.
    fn opt_window(&self) -> Result<Option<Span>, SqlError> {
        let start = self.bound("start", Cmp::Ge).map(parse_i64).transpose()?;
        let end = self.bound("end", Cmp::Le).map(parse_i64).transpose()?;
        match (start, end) {
            (None, None) => Ok(None),
            (Some(start), Some(end)) => Span::checked(start, end)
                .map(Some)
                .ok_or(SqlError::EmptyWindow { start, end }),
            (None, Some(_)) => Err(SqlError::MissingFilter("start")),
            (Some(_), None) => Err(SqlError::MissingFilter("end")),
        }
    }

    fn window(&self) -> Result<Span, SqlError> {
        self.opt_window()?.ok_or(SqlError::MissingFilter("start"))
    }
}

fn collect_filters<'a>(expr: &'a Expr, out: &mut Vec<(String, Cmp, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, out),
        Expr::BinaryOp { left, op, right } => {
            let cmp = match op {
                ast::BinaryOperator::And => {
                    collect_filters(left, out)?;
                    return collect_filters(right, out);
                }
                ast::BinaryOperator::Eq => Cmp::Eq,
                ast::BinaryOperator::GtEq => Cmp::Ge,
                ast::BinaryOperator::LtEq => Cmp::Le,
                other => return Err(SqlError::Unsupported(format!("operator {other} in WHERE"))),
            };
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push((column, cmp, right.as_ref()));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("WHERE {other}"))),
    }
}

// ── Function calls ────────────────────────────────────────────

fn select_function(select: &ast::Select) -> Option<&ast::Function> {
    match select.projection.first()? {
        SelectItem::UnnamedExpr(Expr::Function(func))
        | SelectItem::ExprWithAlias { expr: Expr::Function(func), .. } => Some(func),
        _ => None,
    }
}

/// Positional arguments of one call.
struct Args<'a> {
    function: String,
    exprs: Vec<&'a Expr>,
}

impl<'a> Args<'a> {
    fn get(&self, position: usize) -> Result<&'a Expr, SqlError> {
        self.exprs
            .get(position)
            .copied()
            .ok_or_else(|| SqlError::MissingArgument {
                function: self.function.clone(),
                position: position + 1,
            })
    }

    fn opt(&self, position: usize) -> Option<&'a Expr> {
        self.exprs.get(position).copied()
    }

    fn id(&self) -> Result<Ulid, SqlError> {
        parse_ulid(self.get(0)?)
    }
}

fn parse_call(func: &ast::Function) -> Result<Call, SqlError> {
    let function = object_name_last(&func.name)
        .ok_or_else(|| SqlError::Parse("empty function name".into()))?;
    let exprs = match &func.args {
        FunctionArguments::None => Vec::new(),
        FunctionArguments::List(list) => list
            .args
            .iter()
            .map(|arg| match arg {
                FunctionArg::Unnamed(FunctionArgExpr::Expr(expr)) => Ok(expr),
                _ => Err(SqlError::Unsupported(format!("argument {arg} to {function}"))),
            })
            .collect::<Result<_, _>>()?,
        _ => return Err(SqlError::Unsupported(format!("arguments to {function}"))),
    };
    let args = Args { function, exprs };

    let call = match args.function.as_str() {
        "confirm_appointment" => Call::Confirm { id: args.id()? },
        "start_appointment" => Call::Start { id: args.id()? },
        "cancel_appointment" => Call::Cancel {
            id: args.id()?,
            reason: parse_string(args.get(1)?)?,
        },
        "reschedule_appointment" => Call::Reschedule {
            id: args.id()?,
            new_id: parse_ulid(args.get(1)?)?,
            start: parse_i64(args.get(2)?)?,
            end: parse_i64(args.get(3)?)?,
            staff_id: args.opt(4).map_or(Ok(None), parse_opt_ulid)?,
        },
        "mark_no_show" => Call::MarkNoShow { id: args.id()? },
        "complete_appointment" => Call::Complete { id: args.id()? },
        "record_provider_confirmation" => Call::ProviderConfirmation {
            id: args.id()?,
            price_charged: parse_i64(args.get(1)?)?,
            method: PaymentMethod::parse(&parse_string(args.get(2)?)?),
        },
        "record_client_confirmation" => Call::ClientConfirmation { id: args.id()? },
        "evaluate_completion" => Call::EvaluateCompletion { id: args.id()? },
        "record_deposit" => Call::RecordDeposit { id: args.id()? },
        "void_completion" => Call::VoidCompletion { id: args.id()? },
        "timeout_check" => Call::TimeoutCheck { id: args.id()? },
        "update_staff" => Call::UpdateStaff {
            id: args.id()?,
            name: parse_opt_string(args.get(1)?)?,
            active: parse_bool(args.get(2)?)?,
        },
        "update_exception" => Call::UpdateException(NewException {
            id: args.id()?,
            staff_id: parse_ulid(args.get(1)?)?,
            kind: parse_kind(args.get(2)?)?,
            start: parse_i64(args.get(3)?)?,
            end: parse_i64(args.get(4)?)?,
            full_day: args.opt(5).map_or(Ok(false), parse_bool)?,
            recurrence_rule: args.opt(6).map_or(Ok(None), parse_opt_string)?,
            notes: args.opt(7).map_or(Ok(None), parse_opt_string)?,
        }),
        other => return Err(SqlError::UnknownFunction(other.to_string())),
    };
    Ok(call)
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
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
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

fn extract_insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) if values.rows.is_empty() => {
            Err(SqlError::Parse("empty VALUES".into()))
        }
        SetExpr::Values(values) => Ok(values.rows.as_slice()),
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid(right),
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
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_opt_ulid(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if is_null(expr) { Ok(None) } else { parse_ulid(expr).map(Some) }
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
        Some(Value::Number(s, _) | Value::SingleQuotedString(s)) => s
            .trim()
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_opt_i64(expr: &Expr) -> Result<Option<i64>, SqlError> {
    if is_null(expr) { Ok(None) } else { parse_i64(expr).map(Some) }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_opt_string(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) { Ok(None) } else { parse_string(expr).map(Some) }
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

fn parse_kind(expr: &Expr) -> Result<ExceptionKind, SqlError> {
    let s = parse_string(expr)?;
    ExceptionKind::parse(&s).ok_or_else(|| SqlError::Parse(format!("unknown exception kind: {s}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("unknown function: {0}")]
    UnknownFunction(String),
    #[error("{table}: missing column {column}")]
    MissingColumn {
        table: &'static str,
        column: &'static str,
    },
    #[error("{function}: missing argument {position}")]
    MissingArgument { function: String, position: usize },
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("empty window: start {start} is not before end {end}")]
    EmptyWindow { start: Ms, end: Ms },
    #[error("invalid channel {0:?}: expected appointments or staff_<id>")]
    Channel(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const B: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";
    const C: &str = "01BX5ZZKBKACTAV9WEVGEMMVS0";

    fn ulid(s: &str) -> Ulid {
        Ulid::from_string(s).unwrap()
    }

    #[test]
    fn parse_insert_staff() {
        let cmd = parse_sql(&format!("INSERT INTO staff (id, name) VALUES ('{A}', 'Dana')")).unwrap();
        assert_eq!(
            cmd,
            Command::InsertStaff {
                id: ulid(A),
                name: Some("Dana".into())
            }
        );

        let cmd = parse_sql(&format!("INSERT INTO staff (id) VALUES ('{A}')")).unwrap();
        assert_eq!(cmd, Command::InsertStaff { id: ulid(A), name: None });
    }

    #[test]
    fn parse_insert_service_defaults() {
        let sql = format!("INSERT INTO services (id, duration, cleanup_minutes, price) VALUES ('{A}', 3600000, 10, 4500)");
        match parse_sql(&sql).unwrap() {
            Command::InsertService(service) => {
                assert_eq!(service.duration, HOUR);
                assert_eq!(service.prep_minutes, 0);
                assert_eq!(service.cleanup_minutes, 10);
                assert_eq!(service.price, 4500);
                assert_eq!(service.deposit, 0);
                assert!(service.active);
            }
            cmd => panic!("expected InsertService, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_service_missing_duration() {
        let err = parse_sql(&format!("INSERT INTO services (id, price) VALUES ('{A}', 10)")).unwrap_err();
        assert!(matches!(
            err,
            SqlError::MissingColumn {
                column: "duration",
                ..
            }
        ));
    }

    #[test]
    fn parse_insert_exception_positional() {
        let sql = format!(
            "INSERT INTO exceptions VALUES ('{A}', '{B}', 'holiday', 1000, 2000, true, NULL, 'closed')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertException(e) => {
                assert_eq!(e.id, ulid(A));
                assert_eq!(e.staff_id, ulid(B));
                assert_eq!(e.kind, ExceptionKind::Holiday);
                assert_eq!((e.start, e.end), (1000, 2000));
                assert!(e.full_day);
                assert_eq!(e.recurrence_rule, None);
                assert_eq!(e.notes.as_deref(), Some("closed"));
            }
            cmd => panic!("expected InsertException, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_exception_bad_kind() {
        let sql = format!(
            r#"INSERT INTO exceptions (id, staff_id, kind, start, "end") VALUES ('{A}', '{B}', 'nap', 1000, 2000)"#
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_insert_single_line_appointment() {
        let sql = format!(
            r#"INSERT INTO appointments (id, client_id, staff_id, service_id, start, "end") VALUES ('{A}', '{B}', '{C}', '{A}', 1000, 2000)"#
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertAppointment(a) => {
                assert_eq!(a.id, ulid(A));
                assert_eq!(a.client_id, ulid(B));
                assert_eq!(a.staff_id, ulid(C));
                assert_eq!(a.lines.len(), 1);
                assert_eq!(a.lines[0].start, 1000);
                assert_eq!(a.lines[0].end, Some(2000));
                assert_eq!(a.lines[0].price, None);
                assert_eq!(a.lines[0].staff_id, None);
                assert_eq!(a.deposit_amount, None);
            }
            cmd => panic!("expected InsertAppointment, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_multi_line_appointment() {
        let sql = format!(
            "INSERT INTO appointments (id, client_id, staff_id, service_id, start, price, line_staff_id, deposit) VALUES \
             ('{A}', '{B}', '{C}', '{A}', 1000, 500, NULL, 200), \
             ('{A}', '{B}', '{C}', '{B}', 5000, -1, '{A}', NULL)"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertAppointment(a) => {
                assert_eq!(a.lines.len(), 2);
                assert_eq!(a.lines[0].end, None);
                assert_eq!(a.lines[1].service_id, ulid(B));
                assert_eq!(a.lines[1].staff_id, Some(ulid(A)));
                assert_eq!(a.lines[1].price, Some(-1));
                assert_eq!(a.deposit_amount, Some(200));
            }
            cmd => panic!("expected InsertAppointment, got {cmd:?}"),
        }
    }

    #[test]
    fn appointment_rows_must_agree() {
        let sql = format!(
            "INSERT INTO appointments (id, client_id, staff_id, service_id, start) VALUES \
             ('{A}', '{B}', '{C}', '{A}', 1000), ('{B}', '{B}', '{C}', '{A}', 5000)"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn multi_row_staff_rejected() {
        let sql = format!("INSERT INTO staff (id) VALUES ('{A}'), ('{B}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_deletes() {
        let id = ulid(A);
        assert_eq!(
            parse_sql(&format!("DELETE FROM staff WHERE id = '{A}'")).unwrap(),
            Command::DeleteStaff { id }
        );
        assert_eq!(
            parse_sql(&format!("DELETE FROM services WHERE id = '{A}'")).unwrap(),
            Command::DeleteService { id }
        );
        assert_eq!(
            parse_sql(&format!("DELETE FROM exceptions WHERE id = '{A}'")).unwrap(),
            Command::DeleteException { id }
        );
        assert_eq!(
            parse_sql(&format!("DELETE FROM appointments WHERE id = '{A}'")).unwrap(),
            Command::DeleteAppointment { id }
        );
        assert!(matches!(
            parse_sql("DELETE FROM appointments"),
            Err(SqlError::MissingFilter("id"))
        ));
    }

    #[test]
    fn parse_select_appointments_filters() {
        let sql = format!(
            r#"SELECT * FROM appointments WHERE staff_id = '{A}' AND status = 'confirmed' AND start >= 1000 AND "end" <= 2000"#
        );
        match parse_sql(&sql).unwrap() {
            Command::SelectAppointments { id, filter } => {
                assert_eq!(id, None);
                assert_eq!(filter.staff_id, Some(ulid(A)));
                assert_eq!(filter.client_id, None);
                assert_eq!(filter.status, Some(AppointmentStatus::Confirmed));
                assert_eq!(filter.window, Some(Span::new(1000, 2000)));
                assert!(!filter.include_deleted);
            }
            cmd => panic!("expected SelectAppointments, got {cmd:?}"),
        }

        let all = parse_sql("SELECT * FROM appointments").unwrap();
        assert_eq!(
            all,
            Command::SelectAppointments {
                id: None,
                filter: AppointmentFilter::default()
            }
        );
    }

    #[test]
    fn half_open_window_rejected() {
        let sql = format!("SELECT * FROM calendar WHERE staff_id = '{A}' AND start >= 1000");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingFilter("end"))));

        let sql = format!(r#"SELECT * FROM calendar WHERE staff_id = '{A}' AND start >= 2000 AND "end" <= 1000"#);
        assert!(matches!(parse_sql(&sql), Err(SqlError::EmptyWindow { .. })));
    }

    #[test]
    fn parse_select_staff_windows() {
        let window = Span::new(1000, 2000);
        let staff_id = ulid(A);
        let filter = format!(r#"WHERE staff_id = '{A}' AND start >= 1000 AND "end" <= 2000"#);
        assert_eq!(
            parse_sql(&format!("SELECT * FROM availability {filter}")).unwrap(),
            Command::SelectAvailability { staff_id, window }
        );
        assert_eq!(
            parse_sql(&format!("SELECT * FROM unavailability {filter}")).unwrap(),
            Command::SelectUnavailability { staff_id, window }
        );
        assert_eq!(
            parse_sql(&format!("SELECT * FROM calendar {filter}")).unwrap(),
            Command::SelectCalendar { staff_id, window }
        );
    }

    #[test]
    fn parse_select_slots_default_step() {
        let sql = format!(
            r#"SELECT * FROM slots WHERE staff_id = '{A}' AND service_id = '{B}' AND start >= 1000 AND "end" <= 2000"#
        );
        match parse_sql(&sql).unwrap() {
            Command::SelectSlots { step, window, .. } => {
                assert_eq!(step, DEFAULT_SLOT_STEP_MS);
                assert_eq!(window, Span::new(1000, 2000));
            }
            cmd => panic!("expected SelectSlots, got {cmd:?}"),
        }
        let with_step = format!("{sql} AND step = 1800000");
        assert!(matches!(
            parse_sql(&with_step).unwrap(),
            Command::SelectSlots { step: 1_800_000, .. }
        ));
    }

    #[test]
    fn parse_select_conflicts() {
        let sql = format!(
            "SELECT * FROM conflicts WHERE staff_id = '{A}' AND service_id = '{B}' AND start = 1000 AND exclude = '{C}'"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectConflicts {
                staff_id: ulid(A),
                service_id: ulid(B),
                start: 1000,
                end: None,
                exclude: Some(ulid(C)),
            }
        );
    }

    #[test]
    fn parse_select_completions() {
        let sql = format!("SELECT * FROM completions WHERE appointment_id = '{A}' AND include_voided = true");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectCompletions {
                appointment_id: ulid(A),
                history: true
            }
        );
    }

    #[test]
    fn parse_calls() {
        assert_eq!(
            parse_sql(&format!("SELECT confirm_appointment('{A}')")).unwrap(),
            Command::Call(Call::Confirm { id: ulid(A) })
        );
        assert_eq!(
            parse_sql(&format!("SELECT cancel_appointment('{A}', 'client asked')")).unwrap(),
            Command::Call(Call::Cancel {
                id: ulid(A),
                reason: "client asked".into()
            })
        );
        assert_eq!(
            parse_sql(&format!("SELECT reschedule_appointment('{A}', '{B}', 1000, 2000)")).unwrap(),
            Command::Call(Call::Reschedule {
                id: ulid(A),
                new_id: ulid(B),
                start: 1000,
                end: 2000,
                staff_id: None,
            })
        );
        assert_eq!(
            parse_sql(&format!("SELECT record_provider_confirmation('{A}', 4200, 'card')")).unwrap(),
            Command::Call(Call::ProviderConfirmation {
                id: ulid(A),
                price_charged: 4200,
                method: PaymentMethod::Card,
            })
        );
        assert_eq!(
            parse_sql(&format!("SELECT update_staff('{A}', NULL, false)")).unwrap(),
            Command::Call(Call::UpdateStaff {
                id: ulid(A),
                name: None,
                active: false
            })
        );
    }

    #[test]
    fn call_argument_errors() {
        assert!(matches!(
            parse_sql(&format!("SELECT cancel_appointment('{A}')")),
            Err(SqlError::MissingArgument { position: 2, .. })
        ));
        assert!(matches!(
            parse_sql(&format!("SELECT teleport('{A}')")),
            Err(SqlError::UnknownFunction(name)) if name == "teleport"
        ));
    }

    #[test]
    fn parse_listen_channels() {
        assert_eq!(
            parse_sql("LISTEN appointments").unwrap(),
            Command::Listen {
                channel: "appointments".into()
            }
        );
        assert_eq!(
            parse_sql(&format!("listen staff_{A};")).unwrap(),
            Command::Listen {
                channel: format!("staff_{}", A.to_lowercase())
            }
        );
        assert!(matches!(parse_sql("LISTEN resource_x"), Err(SqlError::Channel(_))));
        assert_eq!(
            parse_sql(&format!("UNLISTEN staff_{A}")).unwrap(),
            Command::Unlisten {
                channel: format!("staff_{}", A.to_lowercase())
            }
        );
        assert_eq!(parse_sql("UNLISTEN *").unwrap(), Command::UnlistenAll);
    }

    #[test]
    fn shapes_of_unbound_statements() {
        assert_eq!(
            result_shape("SELECT * FROM appointments WHERE staff_id = $1"),
            Shape::Appointments
        );
        assert_eq!(result_shape("SELECT void_completion($1)"), Shape::Completions);
        assert_eq!(result_shape("SELECT timeout_check($1)"), Shape::Signals);
        assert_eq!(result_shape("INSERT INTO staff (id) VALUES ($1)"), Shape::None);
        assert_eq!(
            parse_sql(&format!("SELECT start_appointment('{A}')")).unwrap().shape(),
            Shape::Appointments
        );
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = format!("INSERT INTO resources (id) VALUES ('{A}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
        assert!(matches!(parse_sql(" ; "), Err(SqlError::Empty)));
    }
}
