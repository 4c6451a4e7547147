use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::StartupHandler;
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
use tokio::net::TcpStream;
use tracing::debug;
use ulid::Ulid;

use crate::engine::{Availability, Engine, EngineError};
use crate::model::*;
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::sql::{self, BookingFilter, Command, SqlError};

pub struct TriplineHandler {
    engine: Arc<Engine>,
    query_parser: Arc<TriplineQueryParser>,
}

impl TriplineHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(TriplineQueryParser),
        }
    }

    /// Parse, execute and record metrics for one statement.
    async fn run(&self, query: &str) -> PgWireResult<Response> {
        let cmd = match sql::parse_sql(query) {
            Ok(cmd) => cmd,
            Err(e) => {
                metrics::counter!(QUERIES_TOTAL, "command" => "unparsed", "status" => "error")
                    .increment(1);
                debug!("rejected statement: {e}");
                return Err(sql_err(e));
            }
        };
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertVehicle { vehicle } => {
                engine.add_vehicle(vehicle).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::UpdateVehicle { id, update } => {
                engine.update_vehicle(id, update).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteVehicle { id, confirmed } => {
                engine.delete_vehicle(id, confirmed).await.map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::InsertDriver { driver } => {
                engine.add_driver(driver).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::UpdateDriver { id, update } => {
                engine.update_driver(id, update).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::InsertRoute { route } => {
                engine.add_route(route).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertPassenger { passenger } => {
                engine.add_passenger(passenger).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertTrip {
                id,
                vehicle_id,
                route_id,
                departure,
                arrival,
            } => {
                engine
                    .schedule_trip(id, vehicle_id, route_id, departure, arrival)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::DeleteTrip { id } => {
                engine.cancel_trip(id).await.map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::InsertBookings {
                trip_id,
                passenger_ids,
            } => {
                let report = engine
                    .book_trip(trip_id, passenger_ids)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(booking_outcome_schema());
                let mut rows = Vec::with_capacity(report.booked.len() + report.skipped.len());
                for booking in &report.booked {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&booking.passenger_id.to_string())?;
                    encoder.encode_field(&Some(booking.id.to_string()))?;
                    encoder.encode_field(&"booked")?;
                    rows.push(Ok(encoder.take_row()));
                }
                for (passenger_id, reason) in &report.skipped {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&passenger_id.to_string())?;
                    encoder.encode_field(&None::<String>)?;
                    encoder.encode_field(&reason.as_str())?;
                    rows.push(Ok(encoder.take_row()));
                }
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::DeleteBooking { id } => {
                engine.cancel_booking(id).await.map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::InsertAllocation {
                trip_id,
                driver_id,
                confirmed,
            } => {
                engine
                    .allocate_driver(trip_id, driver_id, confirmed)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::DeleteAllocation { trip_id, confirmed } => {
                engine
                    .deallocate_driver(trip_id, confirmed)
                    .await
                    .map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::SelectVehicles => {
                let vehicles = engine.list_vehicles().await;
                vehicle_rows(&vehicles)
            }
            Command::SelectDrivers { status } => {
                let drivers = match status {
                    Some(DriverStatus::Available) => engine.available_drivers().await,
                    Some(wanted) => {
                        let mut all = engine.list_drivers().await;
                        all.retain(|d| d.status == wanted);
                        all
                    }
                    None => engine.list_drivers().await,
                };
                driver_rows(&drivers)
            }
            Command::SelectTrips => {
                let trips = engine.list_trips().await;
                trip_rows(&trips)
            }
            Command::SelectBookings { filter } => {
                let bookings = match filter {
                    BookingFilter::Passenger(id) => engine.bookings_by_passenger(id).await,
                    BookingFilter::Trip(id) => engine.bookings_by_trip(id).await,
                }
                .map_err(engine_err)?;
                booking_rows(&bookings)
            }
            Command::SelectSeats { trip_id } => {
                let available = engine.available_seats(trip_id).await.map_err(engine_err)?;
                let schema = Arc::new(seats_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&trip_id.to_string())?;
                encoder.encode_field(&i64::from(available))?;
                Ok(Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(vec![Ok(encoder.take_row())]),
                )))
            }
            Command::SelectVehicleAvailability {
                vehicle_id,
                departure,
                arrival,
            } => {
                let verdict = engine
                    .check_vehicle_availability(vehicle_id, departure, arrival)
                    .await
                    .map_err(engine_err)?;
                availability_row(vehicle_id, departure, arrival, verdict)
            }
            Command::SelectDriverAvailability {
                driver_id,
                departure,
                arrival,
            } => {
                let verdict = engine
                    .check_driver_availability(driver_id, departure, arrival)
                    .await
                    .map_err(engine_err)?;
                availability_row(driver_id, departure, arrival, verdict)
            }
            Command::Reconcile => {
                let report = engine.run_reconciliation().await;
                let schema = Arc::new(reconcile_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&(report.vehicles_checked as i64))?;
                encoder.encode_field(&(report.drivers_checked as i64))?;
                encoder.encode_field(&(report.vehicles_changed as i64))?;
                encoder.encode_field(&(report.drivers_changed as i64))?;
                encoder.encode_field(&(report.failures as i64))?;
                Ok(Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(vec![Ok(encoder.take_row())]),
                )))
            }
        }
    }
}

fn inserted(rows: usize) -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(rows))
}

fn deleted(rows: usize) -> Response {
    Response::Execution(Tag::new("DELETE").with_rows(rows))
}

// ── Result sets ──────────────────────────────────────────────────

fn text(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn vehicle_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("model"),
        int8("capacity"),
        text("type"),
        text("status"),
    ]
}

fn driver_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("name"),
        int8("age"),
        text("gender"),
        text("license"),
        text("contact"),
        text("address"),
        text("status"),
    ]
}

fn trip_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("vehicle_id"),
        text("driver_id"),
        text("route_id"),
        int8("departure"),
        int8("arrival"),
        text("status"),
        text("trip_type"),
        int8("max_passengers"),
    ]
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("trip_id"),
        text("passenger_id"),
        int8("booked_at"),
        text("status"),
    ]
}

fn booking_outcome_schema() -> Vec<FieldInfo> {
    vec![text("passenger_id"), text("booking_id"), text("outcome")]
}

fn seats_schema() -> Vec<FieldInfo> {
    vec![text("trip_id"), int8("available")]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        text("resource_id"),
        int8("departure"),
        int8("arrival"),
        text("verdict"),
        text("conflict_trip_id"),
        int8("conflict_departure"),
        int8("conflict_arrival"),
    ]
}

fn reconcile_schema() -> Vec<FieldInfo> {
    vec![
        int8("vehicles_checked"),
        int8("drivers_checked"),
        int8("vehicles_changed"),
        int8("drivers_changed"),
        int8("failures"),
    ]
}

fn vehicle_rows(vehicles: &[Vehicle]) -> PgWireResult<Response> {
    let schema = Arc::new(vehicle_schema());
    let mut rows = Vec::with_capacity(vehicles.len());
    for v in vehicles {
        let mut encoder = DataRowEncoder::new(schema.clone());
        encoder.encode_field(&v.id.to_string())?;
        encoder.encode_field(&v.model)?;
        encoder.encode_field(&i64::from(v.capacity))?;
        encoder.encode_field(&v.vehicle_type)?;
        encoder.encode_field(&v.status.as_str())?;
        rows.push(Ok(encoder.take_row()));
    }
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn driver_rows(drivers: &[Driver]) -> PgWireResult<Response> {
    let schema = Arc::new(driver_schema());
    let mut rows = Vec::with_capacity(drivers.len());
    for d in drivers {
        let mut encoder = DataRowEncoder::new(schema.clone());
        encoder.encode_field(&d.id.to_string())?;
        encoder.encode_field(&d.name)?;
        encoder.encode_field(&i64::from(d.age))?;
        encoder.encode_field(&d.gender)?;
        encoder.encode_field(&d.license_number)?;
        encoder.encode_field(&d.contact)?;
        encoder.encode_field(&d.address)?;
        encoder.encode_field(&d.status.as_str())?;
        rows.push(Ok(encoder.take_row()));
    }
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn trip_rows(trips: &[Trip]) -> PgWireResult<Response> {
    let schema = Arc::new(trip_schema());
    let mut rows = Vec::with_capacity(trips.len());
    for t in trips {
        let mut encoder = DataRowEncoder::new(schema.clone());
        encoder.encode_field(&t.id.to_string())?;
        encoder.encode_field(&t.vehicle_id.map(|id| id.to_string()))?;
        encoder.encode_field(&t.driver_id.map(|id| id.to_string()))?;
        encoder.encode_field(&t.route_id.to_string())?;
        encoder.encode_field(&t.window.departure)?;
        encoder.encode_field(&t.window.arrival)?;
        encoder.encode_field(&t.status.as_str())?;
        encoder.encode_field(&t.trip_type)?;
        encoder.encode_field(&i64::from(t.max_passengers))?;
        rows.push(Ok(encoder.take_row()));
    }
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn booking_rows(bookings: &[Booking]) -> PgWireResult<Response> {
    let schema = Arc::new(booking_schema());
    let mut rows = Vec::with_capacity(bookings.len());
    for b in bookings {
        let mut encoder = DataRowEncoder::new(schema.clone());
        encoder.encode_field(&b.id.to_string())?;
        encoder.encode_field(&b.trip_id.to_string())?;
        encoder.encode_field(&b.passenger_id.to_string())?;
        encoder.encode_field(&b.booked_at)?;
        encoder.encode_field(&b.status.as_str())?;
        rows.push(Ok(encoder.take_row()));
    }
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn availability_row(
    resource_id: Ulid,
    departure: Ms,
    arrival: Ms,
    verdict: Availability,
) -> PgWireResult<Response> {
    let schema = Arc::new(availability_schema());
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&resource_id.to_string())?;
    encoder.encode_field(&departure)?;
    encoder.encode_field(&arrival)?;
    match verdict {
        Availability::Accepted => {
            encoder.encode_field(&"accepted")?;
            encoder.encode_field(&None::<String>)?;
            encoder.encode_field(&None::<i64>)?;
            encoder.encode_field(&None::<i64>)?;
        }
        Availability::Conflict { trip_id, window } => {
            encoder.encode_field(&"conflict")?;
            encoder.encode_field(&Some(trip_id.to_string()))?;
            encoder.encode_field(&Some(window.departure))?;
            encoder.encode_field(&Some(window.arrival))?;
        }
    }
    Ok(Response::Query(QueryResponse::new(
        schema,
        stream::iter(vec![Ok(encoder.take_row())]),
    )))
}

/// Result columns a statement will produce, judged from its target table. Used to answer
/// Describe before parameters are bound.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    let mut words = lower
        .split(|c: char| c.is_whitespace() || c == '(' || c == ';' || c == ',')
        .filter(|w| !w.is_empty());
    match words.next() {
        Some("select") => {}
        Some("insert") => {
            return match words.nth(1).map(|t| t.trim_matches('"')) {
                Some("bookings") => booking_outcome_schema(),
                _ => vec![],
            };
        }
        _ => return vec![],
    }
    let table = words
        .skip_while(|w| *w != "from")
        .nth(1)
        .map(|t| t.trim_matches('"').to_string());
    match table.as_deref() {
        Some("vehicles") => vehicle_schema(),
        Some("drivers") => driver_schema(),
        Some("trips") => trip_schema(),
        Some("bookings") => booking_schema(),
        Some("seats") => seats_schema(),
        Some("vehicle_availability" | "driver_availability") => availability_schema(),
        Some("reconcile") => reconcile_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for TriplineHandler {
    async fn do_query<C>(&self, _client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct TriplineQueryParser;

#[async_trait]
impl QueryParser for TriplineQueryParser {
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
        Ok(vec![Type::VARCHAR; highest_placeholder(stmt)])
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
impl ExtendedQueryHandler for TriplineHandler {
    type Statement = String;
    type QueryParser = TriplineQueryParser;

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
        let sql = bind_parameters(portal);
        self.run(&sql).await
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
        let param_types = vec![Type::VARCHAR; highest_placeholder(&target.statement)];
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

/// Highest `$N` placeholder number in the statement.
fn highest_placeholder(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0;
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

fn bind_parameters(portal: &Portal<String>) -> String {
    let params: Vec<Option<&[u8]>> = portal.parameters.iter().map(|p| p.as_deref()).collect();
    inline_parameters(&portal.statement.statement, &params)
}

/// Inline text-format parameters as quoted literals in one left-to-right pass over the
/// statement, so text inside a bound value is never read as a placeholder. `$N` inside a
/// quoted literal of the statement, or past the last parameter, is left alone.
fn inline_parameters(sql: &str, params: &[Option<&[u8]>]) -> String {
    let mut bound = String::with_capacity(sql.len());
    let mut in_quotes = false;
    let mut chars = sql.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c == '\'' {
            in_quotes = !in_quotes;
        }
        if c != '$' || in_quotes {
            bound.push(c);
            continue;
        }
        let start = i + 1;
        let mut end = start;
        while let Some(&(j, d)) = chars.peek() {
            if !d.is_ascii_digit() {
                break;
            }
            end = j + 1;
            chars.next();
        }
        let param = sql[start..end]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|n| params.get(n));
        match param {
            Some(Some(raw)) => {
                bound.push('\'');
                bound.push_str(&String::from_utf8_lossy(raw).replace('\'', "''"));
                bound.push('\'');
            }
            Some(None) => bound.push_str("NULL"),
            None => bound.push_str(&sql[i..end]),
        }
    }
    bound
}

// ── Factory ──────────────────────────────────────────────────────

pub struct TriplineFactory {
    handler: Arc<TriplineHandler>,
    noop: Arc<NoopHandler>,
}

impl TriplineFactory {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            handler: Arc::new(TriplineHandler::new(engine)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for TriplineFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.noop.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(socket: TcpStream, engine: Arc<Engine>) -> std::io::Result<()> {
    pgwire::tokio::process_socket(socket, None, TriplineFactory::new(engine)).await
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "P0001".into(),
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
