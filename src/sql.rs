use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::{DriverUpdate, VehicleUpdate};
use crate::model::*;

const VEHICLE_COLUMNS: &[&str] = &["id", "model", "capacity", "type", "status"];
const DRIVER_COLUMNS: &[&str] = &[
    "id", "name", "age", "gender", "license", "contact", "address", "status",
];
const ROUTE_COLUMNS: &[&str] = &["id", "start", "end", "distance"];
const PASSENGER_COLUMNS: &[&str] = &["id", "first_name", "gender", "age", "email", "phone"];
const TRIP_COLUMNS: &[&str] = &["id", "vehicle_id", "route_id", "departure", "arrival"];
const BOOKING_COLUMNS: &[&str] = &["trip_id", "passenger_id"];
const ALLOCATION_COLUMNS: &[&str] = &["trip_id", "driver_id", "confirmed"];

/// Which bookings a `SELECT * FROM bookings` asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingFilter {
    Passenger(Ulid),
    Trip(Ulid),
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertVehicle {
        vehicle: Vehicle,
    },
    UpdateVehicle {
        id: Ulid,
        update: VehicleUpdate,
    },
    DeleteVehicle {
        id: Ulid,
        confirmed: bool,
    },
    InsertDriver {
        driver: Driver,
    },
    UpdateDriver {
        id: Ulid,
        update: DriverUpdate,
    },
    InsertRoute {
        route: Route,
    },
    InsertPassenger {
        passenger: Passenger,
    },
    InsertTrip {
        id: Ulid,
        vehicle_id: Ulid,
        route_id: Ulid,
        departure: Ms,
        arrival: Ms,
    },
    DeleteTrip {
        id: Ulid,
    },
    InsertBookings {
        trip_id: Ulid,
        passenger_ids: Vec<Ulid>,
    },
    DeleteBooking {
        id: Ulid,
    },
    InsertAllocation {
        trip_id: Ulid,
        driver_id: Ulid,
        confirmed: bool,
    },
    DeleteAllocation {
        trip_id: Ulid,
        confirmed: bool,
    },
    SelectVehicles,
    SelectDrivers {
        status: Option<DriverStatus>,
    },
    SelectTrips,
    SelectBookings {
        filter: BookingFilter,
    },
    SelectSeats {
        trip_id: Ulid,
    },
    SelectVehicleAvailability {
        vehicle_id: Ulid,
        departure: Ms,
        arrival: Ms,
    },
    SelectDriverAvailability {
        driver_id: Ulid,
        departure: Ms,
        arrival: Ms,
    },
    Reconcile,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// One VALUES tuple keyed by column name.
struct Row<'a> {
    table: &'static str,
    cells: Vec<(String, &'a Expr)>,
}

impl<'a> Row<'a> {
    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.cells
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, expr)| *expr)
    }

    fn require(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column)
            .ok_or(SqlError::MissingColumn(self.table, column))
    }
}

/// Pair every VALUES tuple with the column list, or with `known` when the list is omitted.
fn insert_rows<'a>(
    insert: &'a ast::Insert,
    table: &'static str,
    known: &[&str],
) -> Result<Vec<Row<'a>>, SqlError> {
    let columns: Vec<String> = if insert.columns.is_empty() {
        known.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if let Some(unknown) = columns.iter().find(|c| !known.contains(&c.as_str())) {
        return Err(SqlError::UnknownColumn(table, unknown.clone()));
    }

    let source = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let values = match source.body.as_ref() {
        SetExpr::Values(values) if !values.rows.is_empty() => values,
        SetExpr::Values(_) => return Err(SqlError::Parse("empty VALUES".into())),
        _ => return Err(SqlError::Parse("expected VALUES".into())),
    };

    values
        .rows
        .iter()
        .map(|row| {
            if row.len() != columns.len() {
                return Err(SqlError::WrongArity(table, columns.len(), row.len()));
            }
            Ok(Row {
                table,
                cells: columns.iter().cloned().zip(row.iter()).collect(),
            })
        })
        .collect()
}

fn single_row<'a>(
    insert: &'a ast::Insert,
    table: &'static str,
    known: &[&str],
) -> Result<Row<'a>, SqlError> {
    let mut rows = insert_rows(insert, table, known)?;
    if rows.len() != 1 {
        return Err(SqlError::Unsupported(format!(
            "multi-row INSERT into {table}"
        )));
    }
    Ok(rows.remove(0))
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    match table.as_str() {
        "vehicles" => {
            let row = single_row(insert, "vehicles", VEHICLE_COLUMNS)?;
            let status = match row.get("status") {
                Some(expr) => parse_vehicle_status(expr)?,
                None => VehicleStatus::Available,
            };
            Ok(Command::InsertVehicle {
                vehicle: Vehicle {
                    id: parse_ulid(row.require("id")?)?,
                    model: parse_text(row.require("model")?)?,
                    capacity: parse_u32(row.require("capacity")?)?,
                    vehicle_type: parse_text(row.require("type")?)?,
                    status,
                },
            })
        }
        "drivers" => {
            let row = single_row(insert, "drivers", DRIVER_COLUMNS)?;
            let status = match row.get("status") {
                Some(expr) => parse_driver_status(expr)?,
                None => DriverStatus::Available,
            };
            Ok(Command::InsertDriver {
                driver: Driver {
                    id: parse_ulid(row.require("id")?)?,
                    name: parse_text(row.require("name")?)?,
                    age: parse_u32(row.require("age")?)?,
                    gender: parse_text(row.require("gender")?)?,
                    license_number: parse_text(row.require("license")?)?,
                    contact: parse_text(row.require("contact")?)?,
                    address: parse_text(row.require("address")?)?,
                    status,
                },
            })
        }
        "routes" => {
            let row = single_row(insert, "routes", ROUTE_COLUMNS)?;
            Ok(Command::InsertRoute {
                route: Route {
                    id: parse_ulid(row.require("id")?)?,
                    start: parse_text(row.require("start")?)?,
                    end: parse_text(row.require("end")?)?,
                    distance: parse_f64(row.require("distance")?)?,
                },
            })
        }
        "passengers" => {
            let row = single_row(insert, "passengers", PASSENGER_COLUMNS)?;
            Ok(Command::InsertPassenger {
                passenger: Passenger {
                    id: parse_ulid(row.require("id")?)?,
                    first_name: parse_text(row.require("first_name")?)?,
                    gender: parse_text(row.require("gender")?)?,
                    age: parse_u32(row.require("age")?)?,
                    email: parse_text(row.require("email")?)?,
                    phone: parse_text(row.require("phone")?)?,
                },
            })
        }
        "trips" => {
            let row = single_row(insert, "trips", TRIP_COLUMNS)?;
            Ok(Command::InsertTrip {
                id: parse_ulid(row.require("id")?)?,
                vehicle_id: parse_ulid(row.require("vehicle_id")?)?,
                route_id: parse_ulid(row.require("route_id")?)?,
                departure: parse_i64(row.require("departure")?)?,
                arrival: parse_i64(row.require("arrival")?)?,
            })
        }
        "bookings" => {
            let rows = insert_rows(insert, "bookings", BOOKING_COLUMNS)?;
            let mut trip_id = None;
            let mut passenger_ids = Vec::with_capacity(rows.len());
            for (i, row) in rows.iter().enumerate() {
                let at_row = |e: SqlError| SqlError::Parse(format!("row {i}: {e}"));
                let tid = parse_ulid(row.require("trip_id")?).map_err(at_row)?;
                match trip_id {
                    None => trip_id = Some(tid),
                    Some(first) if first != tid => {
                        return Err(SqlError::Unsupported(
                            "bookings for more than one trip in one statement".into(),
                        ));
                    }
                    Some(_) => {}
                }
                passenger_ids.push(parse_ulid(row.require("passenger_id")?).map_err(at_row)?);
            }
            Ok(Command::InsertBookings {
                trip_id: trip_id.ok_or(SqlError::Parse("empty VALUES".into()))?,
                passenger_ids,
            })
        }
        "allocations" => {
            let row = single_row(insert, "allocations", ALLOCATION_COLUMNS)?;
            let confirmed = match row.get("confirmed") {
                Some(expr) => parse_bool(expr)?,
                None => false,
            };
            Ok(Command::InsertAllocation {
                trip_id: parse_ulid(row.require("trip_id")?)?,
                driver_id: parse_ulid(row.require("driver_id")?)?,
                confirmed,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let name = table_factor_name(&table.relation)?;
    let (table, allowed) = filter_columns(UPDATE_FILTERS, &name)?;
    let filters = Filters::from_selection(selection, table, allowed)?;
    let id = parse_ulid(filters.require("id")?)?;

    let mut sets = Vec::with_capacity(assignments.len());
    for a in assignments {
        let column = match &a.target {
            AssignmentTarget::ColumnName(col) => object_name_last(col)
                .ok_or_else(|| SqlError::Parse("empty column name".into()))?,
            AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            }
        };
        sets.push((column, &a.value));
    }

    match table {
        "vehicles" => {
            let mut update = VehicleUpdate::default();
            for (column, value) in sets {
                match column.as_str() {
                    "model" => update.model = Some(parse_text(value)?),
                    "capacity" => update.capacity = Some(parse_u32(value)?),
                    "type" => update.vehicle_type = Some(parse_text(value)?),
                    "status" | "id" => return Err(SqlError::ReadOnlyColumn("vehicles", column)),
                    _ => return Err(SqlError::UnknownColumn("vehicles", column)),
                }
            }
            Ok(Command::UpdateVehicle { id, update })
        }
        "drivers" => {
            let mut update = DriverUpdate::default();
            for (column, value) in sets {
                match column.as_str() {
                    "name" => update.name = Some(parse_text(value)?),
                    "age" => update.age = Some(parse_u32(value)?),
                    "gender" => update.gender = Some(parse_text(value)?),
                    "license" => update.license_number = Some(parse_text(value)?),
                    "contact" => update.contact = Some(parse_text(value)?),
                    "address" => update.address = Some(parse_text(value)?),
                    "status" => update.status = Some(parse_driver_status(value)?),
                    "id" => return Err(SqlError::ReadOnlyColumn("drivers", column)),
                    _ => return Err(SqlError::UnknownColumn("drivers", column)),
                }
            }
            Ok(Command::UpdateDriver { id, update })
        }
        _ => Err(SqlError::UnknownTable(name)),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let name = delete_table_name(delete)?;
    let (table, allowed) = filter_columns(DELETE_FILTERS, &name)?;
    let filters = Filters::from_selection(&delete.selection, table, allowed)?;
    let confirmed = match filters.get("confirmed") {
        Some(expr) => parse_bool(expr)?,
        None => false,
    };

    match table {
        "vehicles" => Ok(Command::DeleteVehicle {
            id: parse_ulid(filters.require("id")?)?,
            confirmed,
        }),
        "trips" => Ok(Command::DeleteTrip {
            id: parse_ulid(filters.require("id")?)?,
        }),
        "bookings" => Ok(Command::DeleteBooking {
            id: parse_ulid(filters.require("id")?)?,
        }),
        "allocations" => Ok(Command::DeleteAllocation {
            trip_id: parse_ulid(filters.require("trip_id")?)?,
            confirmed,
        }),
        _ => Err(SqlError::UnknownTable(name)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let name = table_factor_name(&from.relation)?;
    let (table, allowed) = filter_columns(SELECT_FILTERS, &name)?;
    let filters = Filters::from_selection(&select.selection, table, allowed)?;

    match table {
        "vehicles" => Ok(Command::SelectVehicles),
        "trips" => Ok(Command::SelectTrips),
        "drivers" => Ok(Command::SelectDrivers {
            status: filters.get("status").map(parse_driver_status).transpose()?,
        }),
        "bookings" => {
            let filter = match (filters.get("passenger_id"), filters.get("trip_id")) {
                (Some(expr), None) => BookingFilter::Passenger(parse_ulid(expr)?),
                (None, Some(expr)) => BookingFilter::Trip(parse_ulid(expr)?),
                (Some(_), Some(_)) => {
                    return Err(SqlError::Unsupported(
                        "bookings filter on both passenger_id and trip_id".into(),
                    ));
                }
                (None, None) => return Err(SqlError::MissingFilter("passenger_id or trip_id")),
            };
            Ok(Command::SelectBookings { filter })
        }
        "seats" => Ok(Command::SelectSeats {
            trip_id: parse_ulid(filters.require("trip_id")?)?,
        }),
        "vehicle_availability" => Ok(Command::SelectVehicleAvailability {
            vehicle_id: parse_ulid(filters.require("vehicle_id")?)?,
            departure: parse_i64(filters.require("departure")?)?,
            arrival: parse_i64(filters.require("arrival")?)?,
        }),
        "driver_availability" => Ok(Command::SelectDriverAvailability {
            driver_id: parse_ulid(filters.require("driver_id")?)?,
            departure: parse_i64(filters.require("departure")?)?,
            arrival: parse_i64(filters.require("arrival")?)?,
        }),
        "reconcile" => Ok(Command::Reconcile),
        _ => Err(SqlError::UnknownTable(name)),
    }
}

// ── WHERE ─────────────────────────────────────────────────────

type FilterColumns = &'static [(&'static str, &'static [&'static str])];

/// Columns each table accepts in the WHERE clause of an UPDATE.
const UPDATE_FILTERS: FilterColumns = &[("vehicles", &["id"]), ("drivers", &["id"])];

const DELETE_FILTERS: FilterColumns = &[
    ("vehicles", &["id", "confirmed"]),
    ("trips", &["id"]),
    ("bookings", &["id"]),
    ("allocations", &["trip_id", "confirmed"]),
];

const SELECT_FILTERS: FilterColumns = &[
    ("vehicles", &[]),
    ("trips", &[]),
    ("drivers", &["status"]),
    ("bookings", &["passenger_id", "trip_id"]),
    ("seats", &["trip_id"]),
    ("vehicle_availability", &["vehicle_id", "departure", "arrival"]),
    ("driver_availability", &["driver_id", "departure", "arrival"]),
    ("reconcile", &[]),
];

fn filter_columns(
    tables: FilterColumns,
    name: &str,
) -> Result<(&'static str, &'static [&'static str]), SqlError> {
    tables
        .iter()
        .find(|(table, _)| *table == name)
        .copied()
        .ok_or_else(|| SqlError::UnknownTable(name.to_string()))
}

/// `col = value` terms of a WHERE clause joined by AND, each naming a column the table
/// accepts, at most once. Anything else is refused so a filter is never silently dropped.
struct Filters<'a> {
    terms: Vec<(String, &'a Expr)>,
}

impl<'a> Filters<'a> {
    fn from_selection(
        selection: &'a Option<Expr>,
        table: &'static str,
        allowed: &[&str],
    ) -> Result<Self, SqlError> {
        let mut terms = Vec::new();
        if let Some(expr) = selection {
            collect_equalities(expr, &mut terms)?;
        }
        for (i, (column, _)) in terms.iter().enumerate() {
            if !allowed.contains(&column.as_str()) {
                return Err(SqlError::UnknownColumn(table, column.clone()));
            }
            if terms[..i].iter().any(|(earlier, _)| earlier == column) {
                return Err(SqlError::Unsupported(format!("repeated filter on {column}")));
            }
        }
        Ok(Self { terms })
    }

    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.terms
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, expr)| *expr)
    }

    fn require(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingFilter(column))
    }
}

fn collect_equalities<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_equalities(inner, out),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_equalities(left, out)?;
            collect_equalities(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push((column, &**right));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
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
    let tables = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
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

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        let v = parse_i64(expr)?;
        return v
            .checked_neg()
            .ok_or_else(|| SqlError::Parse(format!("integer -({v}) out of range")));
    }
    match extract_value(expr) {
        Some(Value::Number(s, _) | Value::SingleQuotedString(s)) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_f64(expr: &Expr) -> Result<f64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_f64(expr)?);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _) | Value::SingleQuotedString(s)) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad number {s}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "yes" | "1" => Ok(true),
            "false" | "f" | "no" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_vehicle_status(expr: &Expr) -> Result<VehicleStatus, SqlError> {
    let s = parse_text(expr)?;
    VehicleStatus::parse(&s).ok_or(SqlError::InvalidValue("status", s))
}

fn parse_driver_status(expr: &Expr) -> Result<DriverStatus, SqlError> {
    let s = parse_text(expr)?;
    DriverStatus::parse(&s).ok_or(SqlError::InvalidValue("status", s))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, PartialEq)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    MissingColumn(&'static str, &'static str),
    ReadOnlyColumn(&'static str, String),
    InvalidValue(&'static str, String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "{t}: unknown column {c}"),
            SqlError::MissingColumn(t, c) => write!(f, "{t}: missing column {c}"),
            SqlError::ReadOnlyColumn(t, c) => write!(f, "{t}: column {c} cannot be set"),
            SqlError::InvalidValue(c, v) => write!(f, "invalid {c}: {v}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const B: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

    fn ulid(s: &str) -> Ulid {
        Ulid::from_string(s).unwrap()
    }

    #[test]
    fn insert_vehicle_defaults_status() {
        let sql = format!("INSERT INTO vehicles (id, model, capacity, type) VALUES ('{A}', 'Volvo 9700', 48, 'Bus')");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertVehicle {
                vehicle: Vehicle {
                    id: ulid(A),
                    model: "Volvo 9700".into(),
                    capacity: 48,
                    vehicle_type: "Bus".into(),
                    status: VehicleStatus::Available,
                }
            }
        );
    }

    #[test]
    fn insert_vehicle_rejects_bad_status() {
        let sql = format!(
            "INSERT INTO vehicles (id, model, capacity, type, status) VALUES ('{A}', 'Van', 8, 'Van', 'Resting')"
        );
        assert_eq!(
            parse_sql(&sql),
            Err(SqlError::InvalidValue("status", "Resting".into()))
        );
    }

    #[test]
    fn insert_without_column_list_uses_table_order() {
        let sql = format!("INSERT INTO routes VALUES ('{A}', 'Harbor', 'Airport', 12.5)");
        match parse_sql(&sql).unwrap() {
            Command::InsertRoute { route } => {
                assert_eq!(route.start, "Harbor");
                assert_eq!(route.end, "Airport");
                assert_eq!(route.distance, 12.5);
            }
            other => panic!("expected InsertRoute, got {other:?}"),
        }
    }

    #[test]
    fn insert_driver_and_passenger() {
        let sql = format!(
            "INSERT INTO drivers (id, name, age, gender, license, contact, address) \
             VALUES ('{A}', 'Ana', 41, 'F', 'L-77', '555-0100', '1 Depot Rd')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertDriver { driver } => {
                assert_eq!(driver.license_number, "L-77");
                assert_eq!(driver.status, DriverStatus::Available);
            }
            other => panic!("expected InsertDriver, got {other:?}"),
        }

        let sql = format!(
            "INSERT INTO passengers (id, first_name, gender, age, email, phone) \
             VALUES ('{B}', 'Bo', 'M', 30, 'bo@example.com', '555-0199')"
        );
        assert!(matches!(parse_sql(&sql).unwrap(), Command::InsertPassenger { .. }));
    }

    #[test]
    fn insert_trip() {
        let sql = format!(
            "INSERT INTO trips (id, vehicle_id, route_id, departure, arrival) VALUES ('{A}', '{B}', '{B}', 1000, 2000)"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertTrip {
                id: ulid(A),
                vehicle_id: ulid(B),
                route_id: ulid(B),
                departure: 1000,
                arrival: 2000,
            }
        );
    }

    #[test]
    fn insert_bookings_groups_passengers() {
        let sql = format!(
            "INSERT INTO bookings (trip_id, passenger_id) VALUES ('{A}', '{B}'), ('{A}', '{A}')"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertBookings {
                trip_id: ulid(A),
                passenger_ids: vec![ulid(B), ulid(A)],
            }
        );
    }

    #[test]
    fn insert_bookings_single_trip_only() {
        let sql = format!(
            "INSERT INTO bookings (trip_id, passenger_id) VALUES ('{A}', '{B}'), ('{B}', '{B}')"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn insert_allocation_confirmation() {
        let sql = format!("INSERT INTO allocations (trip_id, driver_id) VALUES ('{A}', '{B}')");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertAllocation {
                trip_id: ulid(A),
                driver_id: ulid(B),
                confirmed: false,
            }
        );
        let sql = format!(
            "INSERT INTO allocations (trip_id, driver_id, confirmed) VALUES ('{A}', '{B}', true)"
        );
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::InsertAllocation { confirmed: true, .. }
        ));
    }

    #[test]
    fn insert_errors() {
        let sql = format!("INSERT INTO vehicles (id, model) VALUES ('{A}', 'Van')");
        assert_eq!(parse_sql(&sql), Err(SqlError::MissingColumn("vehicles", "capacity")));

        let sql = format!("INSERT INTO vehicles (id, colour) VALUES ('{A}', 'red')");
        assert_eq!(
            parse_sql(&sql),
            Err(SqlError::UnknownColumn("vehicles", "colour".into()))
        );

        let sql = format!("INSERT INTO trips (id, vehicle_id) VALUES ('{A}')");
        assert_eq!(parse_sql(&sql), Err(SqlError::WrongArity("trips", 2, 1)));

        let sql = format!("INSERT INTO foobar (id) VALUES ('{A}')");
        assert_eq!(parse_sql(&sql), Err(SqlError::UnknownTable("foobar".into())));

        let sql = "INSERT INTO trips (id) VALUES ('not-a-ulid')";
        assert!(matches!(parse_sql(sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn update_vehicle_refuses_status() {
        let sql = format!("UPDATE vehicles SET capacity = 12, model = 'Setra' WHERE id = '{A}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpdateVehicle {
                id: ulid(A),
                update: VehicleUpdate {
                    model: Some("Setra".into()),
                    capacity: Some(12),
                    vehicle_type: None,
                },
            }
        );

        let sql = format!("UPDATE vehicles SET status = 'Available' WHERE id = '{A}'");
        assert_eq!(
            parse_sql(&sql),
            Err(SqlError::ReadOnlyColumn("vehicles", "status".into()))
        );

        assert_eq!(
            parse_sql("UPDATE vehicles SET capacity = 3"),
            Err(SqlError::MissingFilter("id"))
        );
    }

    #[test]
    fn update_driver_status() {
        let sql = format!("UPDATE drivers SET status = 'Resting', contact = 'x' WHERE id = '{A}'");
        match parse_sql(&sql).unwrap() {
            Command::UpdateDriver { id, update } => {
                assert_eq!(id, ulid(A));
                assert_eq!(update.status, Some(DriverStatus::Resting));
                assert_eq!(update.contact, Some("x".into()));
            }
            other => panic!("expected UpdateDriver, got {other:?}"),
        }
        let sql = format!("UPDATE drivers SET status = 'Asleep' WHERE id = '{A}'");
        assert_eq!(
            parse_sql(&sql),
            Err(SqlError::InvalidValue("status", "Asleep".into()))
        );
    }

    #[test]
    fn deletes() {
        let sql = format!("DELETE FROM vehicles WHERE id = '{A}' AND confirmed = true");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::DeleteVehicle {
                id: ulid(A),
                confirmed: true,
            }
        );
        let sql = format!("DELETE FROM vehicles WHERE id = '{A}'");
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::DeleteVehicle { confirmed: false, .. }
        ));
        let sql = format!("DELETE FROM trips WHERE id = '{A}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::DeleteTrip { id: ulid(A) });
        let sql = format!("DELETE FROM bookings WHERE id = '{A}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::DeleteBooking { id: ulid(A) });
        let sql = format!("DELETE FROM allocations WHERE trip_id = '{A}' AND confirmed = true");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::DeleteAllocation {
                trip_id: ulid(A),
                confirmed: true,
            }
        );
    }

    #[test]
    fn delete_refuses_non_equality_filters() {
        let sql = format!("DELETE FROM trips WHERE id = '{A}' OR id = '{B}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
        assert_eq!(
            parse_sql("DELETE FROM trips"),
            Err(SqlError::MissingFilter("id"))
        );
    }

    #[test]
    fn filters_outside_the_table_are_refused() {
        assert_eq!(
            parse_sql(&format!("SELECT * FROM trips WHERE vehicle_id = '{A}'")),
            Err(SqlError::UnknownColumn("trips", "vehicle_id".into()))
        );
        assert_eq!(
            parse_sql(&format!("DELETE FROM trips WHERE id = '{A}' AND vehicle_id = '{B}'")),
            Err(SqlError::UnknownColumn("trips", "vehicle_id".into()))
        );
        assert_eq!(
            parse_sql(&format!("UPDATE drivers SET age = 40 WHERE id = '{A}' AND name = 'Ines'")),
            Err(SqlError::UnknownColumn("drivers", "name".into()))
        );
        assert_eq!(
            parse_sql("SELECT * FROM reconcile WHERE dry_run = true"),
            Err(SqlError::UnknownColumn("reconcile", "dry_run".into()))
        );
        assert!(matches!(
            parse_sql(&format!("DELETE FROM bookings WHERE id = '{A}' AND id = '{B}'")),
            Err(SqlError::Unsupported(_))
        ));
        assert!(matches!(
            parse_sql(&format!(
                "SELECT * FROM bookings WHERE passenger_id = '{A}' AND trip_id = '{B}'"
            )),
            Err(SqlError::Unsupported(_))
        ));
    }

    #[test]
    fn negating_the_smallest_integer_is_a_parse_error() {
        let sql = format!(
            "SELECT * FROM vehicle_availability WHERE vehicle_id = '{A}' \
             AND departure = -'-9223372036854775808' AND arrival = 1"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Parse(_))));

        let sql = format!(
            "SELECT * FROM vehicle_availability WHERE vehicle_id = '{A}' \
             AND departure = -'-5' AND arrival = 7"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectVehicleAvailability {
                vehicle_id: ulid(A),
                departure: 5,
                arrival: 7,
            }
        );
    }

    #[test]
    fn selects() {
        assert_eq!(parse_sql("SELECT * FROM vehicles").unwrap(), Command::SelectVehicles);
        assert_eq!(parse_sql("SELECT * FROM trips").unwrap(), Command::SelectTrips);
        assert_eq!(parse_sql("SELECT * FROM reconcile").unwrap(), Command::Reconcile);
        assert_eq!(
            parse_sql("SELECT * FROM drivers").unwrap(),
            Command::SelectDrivers { status: None }
        );
        assert_eq!(
            parse_sql("SELECT * FROM drivers WHERE status = 'Available'").unwrap(),
            Command::SelectDrivers {
                status: Some(DriverStatus::Available)
            }
        );
        assert_eq!(
            parse_sql(&format!("SELECT * FROM bookings WHERE passenger_id = '{A}'")).unwrap(),
            Command::SelectBookings {
                filter: BookingFilter::Passenger(ulid(A))
            }
        );
        assert_eq!(
            parse_sql(&format!("SELECT * FROM bookings WHERE trip_id = '{B}'")).unwrap(),
            Command::SelectBookings {
                filter: BookingFilter::Trip(ulid(B))
            }
        );
        assert_eq!(
            parse_sql("SELECT * FROM bookings"),
            Err(SqlError::MissingFilter("passenger_id or trip_id"))
        );
        assert_eq!(
            parse_sql(&format!("SELECT * FROM seats WHERE trip_id = '{A}'")).unwrap(),
            Command::SelectSeats { trip_id: ulid(A) }
        );
    }

    #[test]
    fn select_availability() {
        let sql = format!(
            "SELECT * FROM vehicle_availability WHERE vehicle_id = '{A}' AND departure = 1000 AND arrival = 2000"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectVehicleAvailability {
                vehicle_id: ulid(A),
                departure: 1000,
                arrival: 2000,
            }
        );
        let sql = format!("SELECT * FROM driver_availability WHERE driver_id = '{A}' AND departure = 1000");
        assert_eq!(parse_sql(&sql), Err(SqlError::MissingFilter("arrival")));
    }

    #[test]
    fn parse_empty_errors() {
        assert_eq!(parse_sql(""), Err(SqlError::Empty));
        assert!(matches!(parse_sql("CREATE TABLE t (a int)"), Err(SqlError::Unsupported(_))));
    }
}
