use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Client, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use tripline::engine::Engine;
use tripline::wire;

/// 2099-01-01T10:00:00Z, far enough out that bookings are always open.
const T0: i64 = 4_070_944_800_000;
const HOUR: i64 = 3_600_000;
const DAY: i64 = 24 * HOUR;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("tripline_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(Engine::new(dir.join("tripline.wal")).unwrap());

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = engine.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine).await;
            });
        }
    });

    addr
}

async fn connect(addr: SocketAddr) -> Client {
    let mut config = tokio_postgres::Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("tripline")
        .user("dispatcher");
    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap_or_else(|e| panic!("{sql}: {e}"))
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

async fn exec(client: &Client, sql: &str) {
    client
        .simple_query(sql)
        .await
        .unwrap_or_else(|e| panic!("{sql}: {e}"));
}

async fn sqlstate(client: &Client, sql: &str) -> String {
    let err = client
        .simple_query(sql)
        .await
        .expect_err("statement should fail");
    err.code().map(|c| c.code().to_string()).unwrap_or_default()
}

struct Fleet {
    vehicle: Ulid,
    route: Ulid,
    driver: Ulid,
    passengers: Vec<Ulid>,
}

async fn seed(client: &Client, capacity: u32) -> Fleet {
    let fleet = Fleet {
        vehicle: Ulid::new(),
        route: Ulid::new(),
        driver: Ulid::new(),
        passengers: (0..3).map(|_| Ulid::new()).collect(),
    };
    exec(
        client,
        &format!(
            "INSERT INTO vehicles (id, model, capacity, type) VALUES ('{}', 'Sprinter', {capacity}, 'Van')",
            fleet.vehicle
        ),
    )
    .await;
    exec(
        client,
        &format!(
            "INSERT INTO routes (id, start, \"end\", distance) VALUES ('{}', 'Depot', 'Airport', 31.5)",
            fleet.route
        ),
    )
    .await;
    exec(
        client,
        &format!(
            "INSERT INTO drivers (id, name, age, gender, license, contact, address) \
             VALUES ('{}', 'Ines', 44, 'F', 'DL-2041', '555-0142', '9 Garage St')",
            fleet.driver
        ),
    )
    .await;
    for (i, p) in fleet.passengers.iter().enumerate() {
        exec(
            client,
            &format!(
                "INSERT INTO passengers (id, first_name, gender, age, email, phone) \
                 VALUES ('{p}', 'Rider{i}', 'M', 30, 'rider{i}@example.com', '555-01{i:02}')"
            ),
        )
        .await;
    }
    fleet
}

async fn schedule(client: &Client, fleet: &Fleet, departure: i64, arrival: i64) -> Ulid {
    let id = Ulid::new();
    exec(
        client,
        &format!(
            "INSERT INTO trips (id, vehicle_id, route_id, departure, arrival) VALUES ('{id}', '{}', '{}', {departure}, {arrival})",
            fleet.vehicle, fleet.route
        ),
    )
    .await;
    id
}

async fn seats(client: &Client, trip: Ulid) -> String {
    let result = rows(client, &format!("SELECT * FROM seats WHERE trip_id = '{trip}'")).await;
    result[0].get("available").unwrap().to_string()
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn schedule_and_book_session() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let fleet = seed(&client, 2).await;

    let trip = schedule(&client, &fleet, T0, T0 + 2 * HOUR).await;
    assert_eq!(seats(&client, trip).await, "2");

    // Inside the three-day rest buffer.
    let clash = format!(
        "INSERT INTO trips (id, vehicle_id, route_id, departure, arrival) VALUES ('{}', '{}', '{}', {}, {})",
        Ulid::new(),
        fleet.vehicle,
        fleet.route,
        T0 + DAY,
        T0 + DAY + HOUR
    );
    assert_eq!(sqlstate(&client, &clash).await, "P0001");
    schedule(&client, &fleet, T0 + 4 * DAY, T0 + 5 * DAY).await;

    // Three passengers on two seats: nobody is booked.
    let [p0, p1, p2] = [fleet.passengers[0], fleet.passengers[1], fleet.passengers[2]];
    let too_many = format!(
        "INSERT INTO bookings (trip_id, passenger_id) VALUES ('{trip}', '{p0}'), ('{trip}', '{p1}'), ('{trip}', '{p2}')"
    );
    assert_eq!(sqlstate(&client, &too_many).await, "P0001");
    assert_eq!(seats(&client, trip).await, "2");

    let booked = rows(
        &client,
        &format!("INSERT INTO bookings (trip_id, passenger_id) VALUES ('{trip}', '{p0}'), ('{trip}', '{p1}')"),
    )
    .await;
    assert_eq!(booked.len(), 2);
    assert!(booked.iter().all(|r| r.get("outcome") == Some("booked")));
    assert_eq!(seats(&client, trip).await, "0");

    let mine = rows(&client, &format!("SELECT * FROM bookings WHERE passenger_id = '{p0}'")).await;
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].get("trip_id"), Some(trip.to_string().as_str()));
    assert_eq!(mine[0].get("status"), Some("Booked"));
    let booking_id = mine[0].get("id").unwrap().to_string();

    // Extended protocol with a bound parameter.
    let cancelled = client
        .execute("DELETE FROM bookings WHERE id = $1", &[&booking_id])
        .await
        .unwrap();
    assert_eq!(cancelled, 1);
    assert_eq!(seats(&client, trip).await, "1");

    let rebooked = rows(
        &client,
        &format!("INSERT INTO bookings (trip_id, passenger_id) VALUES ('{trip}', '{p0}')"),
    )
    .await;
    assert_eq!(rebooked[0].get("outcome"), Some("booked"));

    let on_trip = rows(&client, &format!("SELECT * FROM bookings WHERE trip_id = '{trip}'")).await;
    let active = on_trip.iter().filter(|r| r.get("status") == Some("Booked")).count();
    assert_eq!(active, 2);
}

#[tokio::test]
async fn driver_allocation_and_cancellation() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let fleet = seed(&client, 4).await;
    let trip = schedule(&client, &fleet, T0, T0 + 3 * HOUR).await;

    exec(
        &client,
        &format!("INSERT INTO allocations (trip_id, driver_id) VALUES ('{trip}', '{}')", fleet.driver),
    )
    .await;
    let trips = rows(&client, "SELECT * FROM trips").await;
    assert_eq!(trips[0].get("driver_id"), Some(fleet.driver.to_string().as_str()));

    let verdict = rows(
        &client,
        &format!(
            "SELECT * FROM driver_availability WHERE driver_id = '{}' AND departure = {} AND arrival = {}",
            fleet.driver,
            T0 + HOUR,
            T0 + 2 * HOUR
        ),
    )
    .await;
    assert_eq!(verdict[0].get("verdict"), Some("conflict"));
    assert_eq!(verdict[0].get("conflict_trip_id"), Some(trip.to_string().as_str()));

    // Removing a driver needs confirmation.
    let unconfirmed = format!("DELETE FROM allocations WHERE trip_id = '{trip}'");
    assert_eq!(sqlstate(&client, &unconfirmed).await, "P0001");

    exec(&client, &format!("DELETE FROM trips WHERE id = '{trip}'")).await;
    let trips = rows(&client, "SELECT * FROM trips").await;
    assert_eq!(trips[0].get("status"), Some("Cancelled"));
    let vehicles = rows(&client, "SELECT * FROM vehicles").await;
    assert_eq!(vehicles[0].get("status"), Some("Available"));

    let verdict = rows(
        &client,
        &format!(
            "SELECT * FROM vehicle_availability WHERE vehicle_id = '{}' AND departure = {} AND arrival = {}",
            fleet.vehicle,
            T0,
            T0 + HOUR
        ),
    )
    .await;
    assert_eq!(verdict[0].get("verdict"), Some("accepted"));
}

#[tokio::test]
async fn reconcile_and_driver_listing() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let fleet = seed(&client, 4).await;

    exec(
        &client,
        &format!("UPDATE drivers SET status = 'Resting' WHERE id = '{}'", fleet.driver),
    )
    .await;
    assert!(rows(&client, "SELECT * FROM drivers WHERE status = 'Available'").await.is_empty());

    let report = rows(&client, "SELECT * FROM reconcile").await;
    assert_eq!(report[0].get("vehicles_checked"), Some("1"));
    assert_eq!(report[0].get("drivers_checked"), Some("1"));
    assert_eq!(report[0].get("drivers_changed"), Some("1"));
    assert_eq!(report[0].get("failures"), Some("0"));

    let available = rows(&client, "SELECT * FROM drivers WHERE status = 'Available'").await;
    assert_eq!(available.len(), 1);
    assert_eq!(available[0].get("license"), Some("DL-2041"));
}

#[tokio::test]
async fn errors_carry_sqlstate() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let fleet = seed(&client, 4).await;

    assert_eq!(sqlstate(&client, "SELEKT nonsense").await, "42601");
    assert_eq!(sqlstate(&client, "SELECT * FROM hangars").await, "42601");
    assert_eq!(
        sqlstate(
            &client,
            &format!("UPDATE vehicles SET status = 'Maintenance' WHERE id = '{}'", fleet.vehicle)
        )
        .await,
        "42601"
    );
    assert_eq!(
        sqlstate(&client, &format!("SELECT * FROM seats WHERE trip_id = '{}'", Ulid::new())).await,
        "P0001"
    );
    assert_eq!(
        sqlstate(&client, &format!("DELETE FROM vehicles WHERE id = '{}'", fleet.vehicle)).await,
        "P0001"
    );

    exec(
        &client,
        &format!("DELETE FROM vehicles WHERE id = '{}' AND confirmed = true", fleet.vehicle),
    )
    .await;
    assert!(rows(&client, "SELECT * FROM vehicles").await.is_empty());
}
