mod availability;
mod error;
mod fleet;
mod ledger;
mod lifecycle;
mod overlap;
mod queries;
mod status;

pub use availability::{check_timeline, find_conflict, Availability};
pub use error::{EngineError, Entity, ResourceRef};
pub use fleet::{DriverUpdate, VehicleUpdate};
pub use ledger::BOOKING_CUTOFF_MS;
pub use overlap::{effective_window, overlaps, phase_at, Phase, REST_BUFFER_MS};
pub use status::{derive_driver_status, derive_vehicle_status};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedVehicleState = Arc<RwLock<VehicleState>>;
pub type SharedDriverState = Arc<RwLock<DriverState>>;
pub type SharedTripState = Arc<RwLock<TripState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    /// Events of one operation. They are written and flushed together.
    Append {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    /// Start recording appends so the next `Compact` can carry them over.
    BeginCompact {
        response: oneshot::Sender<()>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type AppendBatch = Vec<(Vec<Event>, oneshot::Sender<io::Result<()>>)>;

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
///
/// Between `BeginCompact` and `Compact` every flushed event is also kept in `tail`
/// and written after the snapshot, so appends racing the snapshot survive the swap.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    let mut tail: Option<Vec<Event>> = None;
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { events, response } => {
                let mut batch = vec![(events, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { events, response }) => {
                            batch.push((events, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                flush_and_respond(&mut wal, &mut batch, &mut tail);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other, &mut tail);
                }
            }
            other => handle_non_append(&mut wal, other, &mut tail),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut AppendBatch, tail: &mut Option<Vec<Event>>) {
    let event_count: usize = batch.iter().map(|(events, _)| events.len()).sum();
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(event_count as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for {event_count} events: {e}");
    }
    for (events, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => {
                if let Some(recorded) = tail.as_mut() {
                    recorded.extend(events);
                }
                Ok(())
            }
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &AppendBatch) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    'frames: for (events, _) in batch {
        for event in events {
            if let Err(e) = wal.append_buffered(event) {
                append_err = Some(e);
                break 'frames;
            }
        }
    }
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand, tail: &mut Option<Vec<Event>>) {
    match cmd {
        WalCommand::BeginCompact { response } => {
            *tail = Some(Vec::new());
            let _ = response.send(());
        }
        WalCommand::Compact { mut events, response } => {
            if let Some(recorded) = tail.take() {
                events.extend(recorded);
            }
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

// ── Event application (caller holds the relevant lock) ───

fn apply_to_vehicle(vs: &mut VehicleState, event: &Event) {
    match event {
        Event::VehicleUpdated {
            model,
            capacity,
            vehicle_type,
            ..
        } => {
            vs.vehicle.model = model.clone();
            vs.vehicle.capacity = *capacity;
            vs.vehicle.vehicle_type = vehicle_type.clone();
        }
        Event::VehicleStatusChanged { status, .. } => vs.vehicle.status = *status,
        Event::TripScheduled { trip } if trip.is_scheduled() => {
            vs.timeline.insert(Commitment {
                trip_id: trip.id,
                window: trip.window,
            });
        }
        Event::TripCancelled { id, .. } => {
            vs.timeline.remove(id);
            vs.vehicle.status = VehicleStatus::Available;
        }
        _ => {}
    }
}

fn apply_to_driver(ds: &mut DriverState, event: &Event) {
    match event {
        Event::DriverUpdated { driver } => ds.driver = driver.clone(),
        Event::DriverStatusChanged { status, .. } => ds.driver.status = *status,
        Event::TripScheduled { trip } if trip.is_scheduled() => {
            ds.timeline.insert(Commitment {
                trip_id: trip.id,
                window: trip.window,
            });
        }
        Event::TripCancelled { id, .. } => {
            ds.timeline.remove(id);
        }
        Event::DriverAllocated {
            trip_id,
            driver_id,
            window,
            ..
        } => {
            if *driver_id == ds.driver.id {
                ds.timeline.insert(Commitment {
                    trip_id: *trip_id,
                    window: *window,
                });
            } else {
                // Replaced driver releases the commitment.
                ds.timeline.remove(trip_id);
            }
        }
        Event::DriverDeallocated { trip_id, .. } => {
            ds.timeline.remove(trip_id);
        }
        _ => {}
    }
}

fn apply_to_trip(ts: &mut TripState, event: &Event) {
    match event {
        Event::TripCancelled { .. } => ts.trip.status = TripStatus::Cancelled,
        Event::DriverAllocated { driver_id, .. } => ts.trip.driver_id = Some(*driver_id),
        Event::DriverDeallocated { .. } => ts.trip.driver_id = None,
        Event::VehicleDeleted { id } => {
            if ts.trip.vehicle_id == Some(*id) {
                ts.trip.vehicle_id = None;
            }
        }
        Event::BookingCreated { booking } => {
            ts.bookings.retain(|b| b.id != booking.id);
            ts.bookings.push(booking.clone());
        }
        Event::BookingCancelled { id, .. } => {
            if let Some(b) = ts.booking_mut(id) {
                b.status = BookingStatus::Cancelled;
            }
        }
        _ => {}
    }
}

pub struct Engine {
    vehicles: DashMap<Ulid, SharedVehicleState>,
    drivers: DashMap<Ulid, SharedDriverState>,
    trips: DashMap<Ulid, SharedTripState>,
    routes: DashMap<Ulid, Route>,
    passengers: DashMap<Ulid, Passenger>,
    /// Reverse lookup: booking id → trip id
    booking_to_trip: DashMap<Ulid, Ulid>,
    /// Passenger → every booking they ever made.
    passenger_bookings: DashMap<Ulid, Vec<Ulid>>,
    /// Vehicle → every trip referencing it, cancelled ones included.
    vehicle_trips: DashMap<Ulid, Vec<Ulid>>,
    wal_tx: mpsc::Sender<WalCommand>,
    /// One compaction at a time: the writer keeps a single recording of appends.
    compaction: Mutex<()>,
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            vehicles: DashMap::new(),
            drivers: DashMap::new(),
            trips: DashMap::new(),
            routes: DashMap::new(),
            passengers: DashMap::new(),
            booking_to_trip: DashMap::new(),
            passenger_bookings: DashMap::new(),
            vehicle_trips: DashMap::new(),
            wal_tx,
            compaction: Mutex::new(()),
        };

        for event in &events {
            engine.replay_event(event);
        }
        if !events.is_empty() {
            tracing::info!(
                "replayed {} events: {} vehicles, {} drivers, {} trips",
                events.len(),
                engine.vehicles.len(),
                engine.drivers.len(),
                engine.trips.len()
            );
        }

        Ok(engine)
    }

    /// Rebuild state from one logged event. We're the sole owner of every Arc at this
    /// point, so try_write always succeeds instantly. Never use blocking_write here:
    /// this runs inside an async context.
    fn replay_event(&self, event: &Event) {
        match event {
            Event::VehicleAdded { vehicle } => {
                self.vehicles
                    .insert(vehicle.id, Arc::new(RwLock::new(VehicleState::new(vehicle.clone()))));
            }
            Event::VehicleUpdated { id, .. } | Event::VehicleStatusChanged { id, .. } => {
                self.replay_vehicle(id, event);
            }
            Event::VehicleDeleted { id } => {
                for trip_id in self.trips_for_vehicle(id) {
                    self.replay_trip(&trip_id, event);
                }
                self.vehicles.remove(id);
                self.vehicle_trips.remove(id);
            }
            Event::DriverAdded { driver } => {
                self.drivers
                    .insert(driver.id, Arc::new(RwLock::new(DriverState::new(driver.clone()))));
            }
            Event::DriverUpdated { driver } => self.replay_driver(&driver.id, event),
            Event::DriverStatusChanged { id, .. } => self.replay_driver(id, event),
            Event::RouteAdded { route } => {
                self.routes.insert(route.id, route.clone());
            }
            Event::PassengerAdded { passenger } => {
                self.passengers.insert(passenger.id, passenger.clone());
            }
            Event::TripScheduled { trip } => {
                if let Some(vid) = trip.vehicle_id {
                    self.replay_vehicle(&vid, event);
                }
                if let Some(did) = trip.driver_id {
                    self.replay_driver(&did, event);
                }
                self.insert_trip(trip.clone());
            }
            Event::TripCancelled {
                id,
                vehicle_id,
                driver_id,
            } => {
                self.replay_trip(id, event);
                if let Some(vid) = vehicle_id {
                    self.replay_vehicle(vid, event);
                }
                if let Some(did) = driver_id {
                    self.replay_driver(did, event);
                }
            }
            Event::DriverAllocated {
                trip_id,
                driver_id,
                previous,
                ..
            } => {
                self.replay_trip(trip_id, event);
                self.replay_driver(driver_id, event);
                if let Some(prev) = previous {
                    self.replay_driver(prev, event);
                }
            }
            Event::DriverDeallocated { trip_id, driver_id } => {
                self.replay_trip(trip_id, event);
                self.replay_driver(driver_id, event);
            }
            Event::BookingCreated { booking } => {
                self.replay_trip(&booking.trip_id, event);
                self.index_booking(booking);
            }
            Event::BookingCancelled { trip_id, .. } => self.replay_trip(trip_id, event),
        }
    }

    fn replay_vehicle(&self, id: &Ulid, event: &Event) {
        if let Some(entry) = self.vehicles.get(id) {
            let mut guard = entry.try_write().expect("replay: uncontended write");
            apply_to_vehicle(&mut guard, event);
        }
    }

    fn replay_driver(&self, id: &Ulid, event: &Event) {
        if let Some(entry) = self.drivers.get(id) {
            let mut guard = entry.try_write().expect("replay: uncontended write");
            apply_to_driver(&mut guard, event);
        }
    }

    fn replay_trip(&self, id: &Ulid, event: &Event) {
        if let Some(entry) = self.trips.get(id) {
            let mut guard = entry.try_write().expect("replay: uncontended write");
            apply_to_trip(&mut guard, event);
        }
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append_all(vec![event.clone()]).await
    }

    /// Write several events in one flush. On error none of them may be applied.
    async fn wal_append_all(&self, events: Vec<Event>) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    // ── Lookups ──────────────────────────────────────────────

    pub fn get_vehicle_state(&self, id: &Ulid) -> Option<SharedVehicleState> {
        self.vehicles.get(id).map(|e| e.value().clone())
    }

    pub fn get_driver_state(&self, id: &Ulid) -> Option<SharedDriverState> {
        self.drivers.get(id).map(|e| e.value().clone())
    }

    pub fn get_trip_state(&self, id: &Ulid) -> Option<SharedTripState> {
        self.trips.get(id).map(|e| e.value().clone())
    }

    pub fn get_trip_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_trip.get(booking_id).map(|e| *e.value())
    }

    fn trips_for_vehicle(&self, vehicle_id: &Ulid) -> Vec<Ulid> {
        self.vehicle_trips
            .get(vehicle_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    /// Replay path: a later TripScheduled for the same id replaces the earlier one.
    fn insert_trip(&self, trip: Trip) {
        if let Some(vid) = trip.vehicle_id {
            self.index_vehicle_trip(vid, trip.id);
        }
        self.trips
            .insert(trip.id, Arc::new(RwLock::new(TripState::new(trip))));
    }

    fn index_vehicle_trip(&self, vehicle_id: Ulid, trip_id: Ulid) {
        let mut ids = self.vehicle_trips.entry(vehicle_id).or_default();
        if !ids.contains(&trip_id) {
            ids.push(trip_id);
        }
    }

    /// Claim `trip.id` before its event is logged. The returned guard keeps the new trip
    /// locked until the caller has finished writing it. Fails if the id is taken.
    async fn reserve_trip(
        &self,
        trip: Trip,
    ) -> Result<OwnedRwLockWriteGuard<TripState>, EngineError> {
        let (id, vehicle_id) = (trip.id, trip.vehicle_id);
        let state = Arc::new(RwLock::new(TripState::new(trip)));
        // Nobody else can see this lock yet.
        let guard = state.clone().write_owned().await;
        match self.trips.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(state);
            }
        }
        if let Some(vid) = vehicle_id {
            self.index_vehicle_trip(vid, id);
        }
        Ok(guard)
    }

    /// Undo `reserve_trip` after the event failed to reach the log. Anyone already
    /// waiting on the trip sees it cancelled.
    fn release_trip(&self, mut guard: OwnedRwLockWriteGuard<TripState>) {
        let id = guard.trip.id;
        guard.trip.status = TripStatus::Cancelled;
        if let Some(vid) = guard.trip.vehicle_id {
            if let Some(mut ids) = self.vehicle_trips.get_mut(&vid) {
                ids.retain(|t| *t != id);
            }
        }
        self.trips.remove(&id);
    }

    fn index_booking(&self, booking: &Booking) {
        self.booking_to_trip.insert(booking.id, booking.trip_id);
        let mut ids = self.passenger_bookings.entry(booking.passenger_id).or_default();
        if !ids.contains(&booking.id) {
            ids.push(booking.id);
        }
    }

    // ── Lock acquisition (order: trip → vehicle → driver) ───

    async fn lock_trip(&self, id: &Ulid) -> Result<OwnedRwLockWriteGuard<TripState>, EngineError> {
        let ts = self
            .get_trip_state(id)
            .ok_or(EngineError::not_found(Entity::Trip, *id))?;
        Ok(ts.write_owned().await)
    }

    async fn lock_vehicle(
        &self,
        id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<VehicleState>, EngineError> {
        let vs = self
            .get_vehicle_state(id)
            .ok_or(EngineError::not_found(Entity::Vehicle, *id))?;
        let guard = vs.write_owned().await;
        // Deleted while we were waiting for the lock.
        if !self.vehicles.contains_key(id) {
            return Err(EngineError::not_found(Entity::Vehicle, *id));
        }
        Ok(guard)
    }

    async fn lock_driver(
        &self,
        id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<DriverState>, EngineError> {
        let ds = self
            .get_driver_state(id)
            .ok_or(EngineError::not_found(Entity::Driver, *id))?;
        Ok(ds.write_owned().await)
    }

    /// Lookup booking → trip, acquire the trip's write lock.
    async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<TripState>, EngineError> {
        let trip_id = self
            .get_trip_for_booking(booking_id)
            .ok_or(EngineError::not_found(Entity::Booking, *booking_id))?;
        self.lock_trip(&trip_id).await
    }

    // ── Compaction ───────────────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate the current state.
    ///
    /// Writers are not paused. Events flushed while the snapshot is taken are recorded by
    /// the writer and appended after the snapshot; replaying them over state that already
    /// contains them is harmless.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _running = self.compaction.lock().await;
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::BeginCompact { response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?;

        let mut events = Vec::new();

        // Clone the Arcs out first: no DashMap shard guard may be held across an await.
        let vehicle_states: Vec<SharedVehicleState> =
            self.vehicles.iter().map(|e| e.value().clone()).collect();
        for vs in vehicle_states {
            let guard = vs.read().await;
            events.push(Event::VehicleAdded {
                vehicle: guard.vehicle.clone(),
            });
        }
        let driver_states: Vec<SharedDriverState> =
            self.drivers.iter().map(|e| e.value().clone()).collect();
        for ds in driver_states {
            let guard = ds.read().await;
            events.push(Event::DriverAdded {
                driver: guard.driver.clone(),
            });
        }
        for entry in self.routes.iter() {
            events.push(Event::RouteAdded {
                route: entry.value().clone(),
            });
        }
        for entry in self.passengers.iter() {
            events.push(Event::PassengerAdded {
                passenger: entry.value().clone(),
            });
        }
        let trip_states: Vec<SharedTripState> =
            self.trips.iter().map(|e| e.value().clone()).collect();
        for ts in trip_states {
            let guard = ts.read().await;
            // Reserved but never logged.
            if !self.trips.contains_key(&guard.trip.id) {
                continue;
            }
            events.push(Event::TripScheduled {
                trip: guard.trip.clone(),
            });
            for booking in &guard.bookings {
                events.push(Event::BookingCreated {
                    booking: booking.clone(),
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
