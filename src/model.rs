use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. Every timestamp in the engine uses this.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// A trip's `[departure, arrival]` window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub departure: Ms,
    pub arrival: Ms,
}

impl Window {
    pub fn new(departure: Ms, arrival: Ms) -> Self {
        debug_assert!(departure < arrival, "Window departure must be before arrival");
        Self { departure, arrival }
    }

    pub fn duration_ms(&self) -> Ms {
        self.arrival - self.departure
    }

    /// Both edges inclusive.
    pub fn contains_instant(&self, t: Ms) -> bool {
        self.departure <= t && t <= self.arrival
    }
}

// ── Status labels ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VehicleStatus {
    Available,
    OnTrip,
    Maintenance,
}

impl VehicleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VehicleStatus::Available => "Available",
            VehicleStatus::OnTrip => "On Trip",
            VehicleStatus::Maintenance => "Maintenance",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "Available" => Some(VehicleStatus::Available),
            "On Trip" => Some(VehicleStatus::OnTrip),
            "Maintenance" => Some(VehicleStatus::Maintenance),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DriverStatus {
    Available,
    OnTrip,
    Resting,
}

impl DriverStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverStatus::Available => "Available",
            DriverStatus::OnTrip => "On Trip",
            DriverStatus::Resting => "Resting",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "Available" => Some(DriverStatus::Available),
            "On Trip" => Some(DriverStatus::OnTrip),
            "Resting" => Some(DriverStatus::Resting),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TripStatus {
    Scheduled,
    Cancelled,
}

impl TripStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TripStatus::Scheduled => "Scheduled",
            TripStatus::Cancelled => "Cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Booked,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Booked => "Booked",
            BookingStatus::Cancelled => "Cancelled",
        }
    }
}

// ── Records ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vehicle {
    pub id: Ulid,
    pub model: String,
    /// Seat count. Snapshotted into `Trip::max_passengers` when a trip is scheduled.
    pub capacity: u32,
    pub vehicle_type: String,
    pub status: VehicleStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Driver {
    pub id: Ulid,
    pub name: String,
    pub age: u32,
    pub gender: String,
    pub license_number: String,
    pub contact: String,
    pub address: String,
    pub status: DriverStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub id: Ulid,
    pub start: String,
    pub end: String,
    pub distance: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Passenger {
    pub id: Ulid,
    pub first_name: String,
    pub gender: String,
    pub age: u32,
    pub email: String,
    pub phone: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trip {
    pub id: Ulid,
    /// `None` once the vehicle has been deleted.
    pub vehicle_id: Option<Ulid>,
    pub route_id: Ulid,
    pub driver_id: Option<Ulid>,
    pub window: Window,
    pub status: TripStatus,
    pub trip_type: String,
    pub max_passengers: u32,
}

impl Trip {
    pub fn is_scheduled(&self) -> bool {
        self.status == TripStatus::Scheduled
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub passenger_id: Ulid,
    pub trip_id: Ulid,
    pub booked_at: Ms,
    pub status: BookingStatus,
}

impl Booking {
    pub fn is_booked(&self) -> bool {
        self.status == BookingStatus::Booked
    }
}

// ── Timelines ────────────────────────────────────────────────────

/// One Scheduled trip occupying a vehicle or driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Commitment {
    pub trip_id: Ulid,
    pub window: Window,
}

/// Commitments of a single vehicle or driver, sorted by `window.departure`.
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    commitments: Vec<Commitment>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.commitments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commitments.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Commitment> {
        self.commitments.iter()
    }

    pub fn contains(&self, trip_id: &Ulid) -> bool {
        self.commitments.iter().any(|c| c.trip_id == *trip_id)
    }

    /// Insert maintaining sort order by departure. Re-inserting a trip replaces it.
    pub fn insert(&mut self, commitment: Commitment) {
        self.remove(&commitment.trip_id);
        let pos = self
            .commitments
            .binary_search_by_key(&commitment.window.departure, |c| c.window.departure)
            .unwrap_or_else(|e| e);
        self.commitments.insert(pos, commitment);
    }

    pub fn remove(&mut self, trip_id: &Ulid) -> Option<Commitment> {
        let pos = self.commitments.iter().position(|c| c.trip_id == *trip_id)?;
        Some(self.commitments.remove(pos))
    }

    /// Commitments departing at or before `latest_departure`.
    /// Uses binary search to skip everything that departs later.
    pub fn departing_by(&self, latest_departure: Ms) -> impl Iterator<Item = &Commitment> {
        let right_bound = self
            .commitments
            .partition_point(|c| c.window.departure <= latest_departure);
        self.commitments[..right_bound].iter()
    }
}

#[derive(Debug, Clone)]
pub struct VehicleState {
    pub vehicle: Vehicle,
    pub timeline: Timeline,
}

impl VehicleState {
    pub fn new(vehicle: Vehicle) -> Self {
        Self {
            vehicle,
            timeline: Timeline::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DriverState {
    pub driver: Driver,
    pub timeline: Timeline,
}

impl DriverState {
    pub fn new(driver: Driver) -> Self {
        Self {
            driver,
            timeline: Timeline::new(),
        }
    }
}

/// A trip together with its full booking history (booked and cancelled).
#[derive(Debug, Clone)]
pub struct TripState {
    pub trip: Trip,
    pub bookings: Vec<Booking>,
}

impl TripState {
    pub fn new(trip: Trip) -> Self {
        Self {
            trip,
            bookings: Vec::new(),
        }
    }

    pub fn booked_count(&self) -> u32 {
        self.bookings.iter().filter(|b| b.is_booked()).count() as u32
    }

    pub fn available_seats(&self) -> u32 {
        self.trip.max_passengers.saturating_sub(self.booked_count())
    }

    pub fn holds_booking(&self, passenger_id: &Ulid) -> bool {
        self.bookings
            .iter()
            .any(|b| b.is_booked() && b.passenger_id == *passenger_id)
    }

    pub fn booking_mut(&mut self, id: &Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == *id)
    }
}

/// WAL record format. Flat, with no nesting beyond the record structs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    VehicleAdded {
        vehicle: Vehicle,
    },
    VehicleUpdated {
        id: Ulid,
        model: String,
        capacity: u32,
        vehicle_type: String,
    },
    VehicleStatusChanged {
        id: Ulid,
        status: VehicleStatus,
    },
    VehicleDeleted {
        id: Ulid,
    },
    DriverAdded {
        driver: Driver,
    },
    DriverUpdated {
        driver: Driver,
    },
    DriverStatusChanged {
        id: Ulid,
        status: DriverStatus,
    },
    RouteAdded {
        route: Route,
    },
    PassengerAdded {
        passenger: Passenger,
    },
    TripScheduled {
        trip: Trip,
    },
    TripCancelled {
        id: Ulid,
        vehicle_id: Option<Ulid>,
        driver_id: Option<Ulid>,
    },
    DriverAllocated {
        trip_id: Ulid,
        driver_id: Ulid,
        previous: Option<Ulid>,
        window: Window,
    },
    DriverDeallocated {
        trip_id: Ulid,
        driver_id: Ulid,
    },
    BookingCreated {
        booking: Booking,
    },
    BookingCancelled {
        id: Ulid,
        trip_id: Ulid,
    },
}

// ── Operation result types ───────────────────────────────────────

/// Why a passenger in a booking request was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    UnknownPassenger,
    AlreadyBooked,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::UnknownPassenger => "unknown_passenger",
            SkipReason::AlreadyBooked => "already_booked",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BookingReport {
    pub trip_id: Ulid,
    pub booked: Vec<Booking>,
    pub skipped: Vec<(Ulid, SkipReason)>,
}

impl BookingReport {
    pub fn booked_count(&self) -> usize {
        self.booked.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReconcileReport {
    pub vehicles_checked: usize,
    pub drivers_checked: usize,
    pub vehicles_changed: usize,
    pub drivers_changed: usize,
    pub failures: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commitment(departure: Ms, arrival: Ms) -> Commitment {
        Commitment {
            trip_id: Ulid::new(),
            window: Window::new(departure, arrival),
        }
    }

    #[test]
    fn window_basics() {
        let w = Window::new(100, 200);
        assert_eq!(w.duration_ms(), 100);
        assert!(w.contains_instant(100));
        assert!(w.contains_instant(200)); // closed on both edges
        assert!(!w.contains_instant(201));
        assert!(!w.contains_instant(99));
    }

    #[test]
    fn status_labels_roundtrip() {
        for s in [VehicleStatus::Available, VehicleStatus::OnTrip, VehicleStatus::Maintenance] {
            assert_eq!(VehicleStatus::parse(s.as_str()), Some(s));
        }
        for s in [DriverStatus::Available, DriverStatus::OnTrip, DriverStatus::Resting] {
            assert_eq!(DriverStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(VehicleStatus::parse("Resting"), None);
        assert_eq!(DriverStatus::parse("Maintenance"), None);
        assert_eq!(VehicleStatus::parse(" On Trip "), Some(VehicleStatus::OnTrip));
    }

    #[test]
    fn timeline_ordering() {
        let mut t = Timeline::new();
        t.insert(commitment(300, 400));
        t.insert(commitment(100, 200));
        t.insert(commitment(200, 300));
        let starts: Vec<Ms> = t.iter().map(|c| c.window.departure).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn timeline_reinsert_replaces() {
        let mut t = Timeline::new();
        let c = commitment(100, 200);
        t.insert(c);
        t.insert(Commitment {
            trip_id: c.trip_id,
            window: Window::new(500, 600),
        });
        assert_eq!(t.len(), 1);
        assert_eq!(t.iter().next().unwrap().window, Window::new(500, 600));
    }

    #[test]
    fn timeline_remove() {
        let mut t = Timeline::new();
        let ids: Vec<Commitment> = (0..3).map(|i| commitment(i * 100, i * 100 + 50)).collect();
        for c in &ids {
            t.insert(*c);
        }
        assert_eq!(t.remove(&ids[1].trip_id), Some(ids[1]));
        assert_eq!(t.len(), 2);
        assert!(t.contains(&ids[0].trip_id));
        assert!(!t.contains(&ids[1].trip_id));
        assert!(t.remove(&Ulid::new()).is_none());
    }

    #[test]
    fn departing_by_skips_later_commitments() {
        let mut t = Timeline::new();
        t.insert(commitment(100, 200));
        t.insert(commitment(450, 600));
        t.insert(commitment(1000, 1100));

        let hits: Vec<_> = t.departing_by(450).collect();
        assert_eq!(hits.len(), 2); // boundary is inclusive

        let hits: Vec<_> = t.departing_by(99).collect();
        assert!(hits.is_empty());
    }

    #[test]
    fn trip_state_seat_accounting() {
        let trip = Trip {
            id: Ulid::new(),
            vehicle_id: Some(Ulid::new()),
            route_id: Ulid::new(),
            driver_id: None,
            window: Window::new(0, 100),
            status: TripStatus::Scheduled,
            trip_type: "Freight".into(),
            max_passengers: 3,
        };
        let mut ts = TripState::new(trip);
        let pax = Ulid::new();
        ts.bookings.push(Booking {
            id: Ulid::new(),
            passenger_id: pax,
            trip_id: ts.trip.id,
            booked_at: 0,
            status: BookingStatus::Booked,
        });
        ts.bookings.push(Booking {
            id: Ulid::new(),
            passenger_id: Ulid::new(),
            trip_id: ts.trip.id,
            booked_at: 0,
            status: BookingStatus::Cancelled,
        });
        assert_eq!(ts.booked_count(), 1);
        assert_eq!(ts.available_seats(), 2);
        assert!(ts.holds_booking(&pax));
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::VehicleAdded {
            vehicle: Vehicle {
                id: Ulid::new(),
                model: "Volvo 9700".into(),
                capacity: 48,
                vehicle_type: "Bus".into(),
                status: VehicleStatus::Available,
            },
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
