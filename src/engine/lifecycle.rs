use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::ensure_free;
use super::error::{Entity, ResourceRef};
use super::overlap::validate_window;
use super::{apply_to_driver, apply_to_trip, apply_to_vehicle, Engine, EngineError};

/// Trip type stamped on every scheduled trip.
pub const DEFAULT_TRIP_TYPE: &str = "Freight";

/// How often `delete_vehicle` re-snapshots the trip index before giving up.
const DELETE_VEHICLE_ATTEMPTS: usize = 8;

fn count_conflict(result: &Result<(), EngineError>) {
    if let Err(EngineError::Conflict { resource, .. }) = result {
        let label = match resource {
            ResourceRef::Vehicle(_) => "vehicle",
            ResourceRef::Driver(_) => "driver",
        };
        metrics::counter!(crate::observability::CONFLICTS_TOTAL, "resource" => label).increment(1);
    }
}

impl Engine {
    /// Create a Scheduled trip on `vehicle_id` over `[departure, arrival]`.
    ///
    /// The vehicle's write lock is held from the overlap check to the timeline insert. The
    /// trip id is claimed before the event is logged, so a duplicate id never reaches the
    /// log or a timeline.
    pub async fn schedule_trip(
        &self,
        id: Ulid,
        vehicle_id: Ulid,
        route_id: Ulid,
        departure: Ms,
        arrival: Ms,
    ) -> Result<Trip, EngineError> {
        if self.trips.len() >= MAX_RECORDS_PER_KIND {
            return Err(EngineError::LimitExceeded("too many trips"));
        }
        if self.trips.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let window = validate_window(departure, arrival)?;
        let mut vguard = self.lock_vehicle(&vehicle_id).await?;
        if !self.routes.contains_key(&route_id) {
            return Err(EngineError::not_found(Entity::Route, route_id));
        }
        if vguard.timeline.len() >= MAX_COMMITMENTS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many trips on vehicle"));
        }
        let free = ensure_free(&vguard.timeline, ResourceRef::Vehicle(vehicle_id), &window, None);
        count_conflict(&free);
        free?;

        let trip = Trip {
            id,
            vehicle_id: Some(vehicle_id),
            route_id,
            driver_id: None,
            window,
            status: TripStatus::Scheduled,
            trip_type: DEFAULT_TRIP_TYPE.to_string(),
            max_passengers: vguard.vehicle.capacity,
        };
        // Two schedules of one id on different vehicles only meet here.
        let tguard = self.reserve_trip(trip.clone()).await?;
        let event = Event::TripScheduled { trip: trip.clone() };
        if let Err(e) = self.wal_append(&event).await {
            self.release_trip(tguard);
            return Err(e);
        }
        apply_to_vehicle(&mut vguard, &event);
        drop(tguard);

        metrics::counter!(crate::observability::TRIPS_SCHEDULED_TOTAL).increment(1);
        info!(
            "trip {id} scheduled on vehicle {vehicle_id} [{departure}, {arrival}]"
        );
        Ok(trip)
    }

    /// Cancel a trip. Its commitments are released and the vehicle is marked Available at
    /// once; the driver's status is left for the reconciler.
    pub async fn cancel_trip(&self, id: Ulid) -> Result<Trip, EngineError> {
        let mut tguard = self.lock_trip(&id).await?;
        if !tguard.trip.is_scheduled() {
            return Err(EngineError::AlreadyCancelled(id));
        }
        let vehicle_id = tguard.trip.vehicle_id;
        let driver_id = tguard.trip.driver_id;

        let mut vguard = match vehicle_id.and_then(|v| self.get_vehicle_state(&v)) {
            Some(vs) => Some(vs.write_owned().await),
            None => None,
        };
        let mut dguard = match driver_id.and_then(|d| self.get_driver_state(&d)) {
            Some(ds) => Some(ds.write_owned().await),
            None => None,
        };

        let event = Event::TripCancelled {
            id,
            vehicle_id,
            driver_id,
        };
        self.wal_append(&event).await?;
        apply_to_trip(&mut tguard, &event);
        if let Some(g) = vguard.as_mut() {
            apply_to_vehicle(g, &event);
        }
        if let Some(g) = dguard.as_mut() {
            apply_to_driver(g, &event);
        }

        info!("trip {id} cancelled");
        Ok(tguard.trip.clone())
    }

    /// Assign `driver_id` to a trip. Replacing an existing driver needs `confirmed`.
    pub async fn allocate_driver(
        &self,
        trip_id: Ulid,
        driver_id: Ulid,
        confirmed: bool,
    ) -> Result<Trip, EngineError> {
        let mut tguard = self.lock_trip(&trip_id).await?;
        if !tguard.trip.is_scheduled() {
            return Err(EngineError::AlreadyCancelled(trip_id));
        }
        let new_state = self
            .get_driver_state(&driver_id)
            .ok_or(EngineError::not_found(Entity::Driver, driver_id))?;
        let previous = tguard.trip.driver_id;
        if previous == Some(driver_id) {
            return Ok(tguard.trip.clone());
        }
        if previous.is_some() && !confirmed {
            return Err(EngineError::NotConfirmed("replacing the assigned driver"));
        }

        // Same-kind locks in ascending id order.
        let prev_state = previous.and_then(|p| self.get_driver_state(&p));
        let (mut new_guard, mut prev_guard) = match (previous, prev_state) {
            (Some(prev), Some(ps)) if prev < driver_id => {
                let pg = ps.write_owned().await;
                (new_state.write_owned().await, Some(pg))
            }
            (_, Some(ps)) => {
                let ng = new_state.write_owned().await;
                (ng, Some(ps.write_owned().await))
            }
            (_, None) => (new_state.write_owned().await, None),
        };

        let window = tguard.trip.window;
        if new_guard.timeline.len() >= MAX_COMMITMENTS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many trips on driver"));
        }
        let free = ensure_free(
            &new_guard.timeline,
            ResourceRef::Driver(driver_id),
            &window,
            Some(trip_id),
        );
        count_conflict(&free);
        free?;

        let event = Event::DriverAllocated {
            trip_id,
            driver_id,
            previous,
            window,
        };
        self.wal_append(&event).await?;
        apply_to_trip(&mut tguard, &event);
        apply_to_driver(&mut new_guard, &event);
        if let Some(g) = prev_guard.as_mut() {
            apply_to_driver(g, &event);
        }

        match previous {
            Some(prev) => info!("trip {trip_id}: driver {prev} replaced by {driver_id}"),
            None => info!("trip {trip_id}: driver {driver_id} allocated"),
        }
        Ok(tguard.trip.clone())
    }

    /// Remove the trip's driver. Always needs `confirmed`.
    pub async fn deallocate_driver(
        &self,
        trip_id: Ulid,
        confirmed: bool,
    ) -> Result<Trip, EngineError> {
        let mut tguard = self.lock_trip(&trip_id).await?;
        if !tguard.trip.is_scheduled() {
            return Err(EngineError::AlreadyCancelled(trip_id));
        }
        let driver_id = tguard
            .trip
            .driver_id
            .ok_or_else(|| EngineError::invalid("driver_id", "trip has no driver assigned"))?;
        if !confirmed {
            return Err(EngineError::NotConfirmed("deallocating the driver"));
        }
        let mut dguard = match self.get_driver_state(&driver_id) {
            Some(ds) => Some(ds.write_owned().await),
            None => None,
        };

        let event = Event::DriverDeallocated { trip_id, driver_id };
        self.wal_append(&event).await?;
        apply_to_trip(&mut tguard, &event);
        if let Some(g) = dguard.as_mut() {
            apply_to_driver(g, &event);
        }

        info!("trip {trip_id}: driver {driver_id} deallocated");
        Ok(tguard.trip.clone())
    }

    /// Remove a vehicle. Trips that referenced it keep their bookings and driver but lose
    /// the vehicle reference. Returns how many trips were detached.
    pub async fn delete_vehicle(&self, id: Ulid, confirmed: bool) -> Result<usize, EngineError> {
        if !self.vehicles.contains_key(&id) {
            return Err(EngineError::not_found(Entity::Vehicle, id));
        }
        if !confirmed {
            return Err(EngineError::NotConfirmed("deleting a vehicle"));
        }

        for _ in 0..DELETE_VEHICLE_ATTEMPTS {
            let snapshot = self.trips_for_vehicle(&id);
            let mut ordered = snapshot.clone();
            ordered.sort();

            let mut trip_guards = Vec::with_capacity(ordered.len());
            for trip_id in &ordered {
                if let Some(ts) = self.get_trip_state(trip_id) {
                    trip_guards.push(ts.write_owned().await);
                }
            }
            let vguard = self.lock_vehicle(&id).await?;
            if self.trips_for_vehicle(&id) != snapshot {
                // A trip was scheduled in between; take the locks again.
                continue;
            }

            let event = Event::VehicleDeleted { id };
            self.wal_append(&event).await?;
            for g in trip_guards.iter_mut() {
                apply_to_trip(g, &event);
            }
            self.vehicles.remove(&id);
            self.vehicle_trips.remove(&id);
            drop(vguard);

            info!("vehicle {id} deleted, {} trips detached", ordered.len());
            return Ok(ordered.len());
        }

        warn!("vehicle {id} delete gave up after {DELETE_VEHICLE_ATTEMPTS} attempts");
        Err(EngineError::LimitExceeded("vehicle is too busy to delete"))
    }
}
