use ulid::Ulid;

use crate::model::*;

use super::error::Entity;
use super::{Engine, EngineError, SharedDriverState, SharedTripState, SharedVehicleState};

impl Engine {
    pub async fn get_vehicle(&self, id: Ulid) -> Result<Vehicle, EngineError> {
        let vs = self
            .get_vehicle_state(&id)
            .ok_or(EngineError::not_found(Entity::Vehicle, id))?;
        let guard = vs.read().await;
        Ok(guard.vehicle.clone())
    }

    pub async fn get_driver(&self, id: Ulid) -> Result<Driver, EngineError> {
        let ds = self
            .get_driver_state(&id)
            .ok_or(EngineError::not_found(Entity::Driver, id))?;
        let guard = ds.read().await;
        Ok(guard.driver.clone())
    }

    pub async fn get_trip(&self, id: Ulid) -> Result<Trip, EngineError> {
        let ts = self
            .get_trip_state(&id)
            .ok_or(EngineError::not_found(Entity::Trip, id))?;
        let guard = ts.read().await;
        Ok(guard.trip.clone())
    }

    /// All vehicles, ordered by id.
    pub async fn list_vehicles(&self) -> Vec<Vehicle> {
        let states: Vec<SharedVehicleState> =
            self.vehicles.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(states.len());
        for vs in states {
            out.push(vs.read().await.vehicle.clone());
        }
        out.sort_by_key(|v| v.id);
        out
    }

    /// All drivers, ordered by id.
    pub async fn list_drivers(&self) -> Vec<Driver> {
        let states: Vec<SharedDriverState> =
            self.drivers.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(states.len());
        for ds in states {
            out.push(ds.read().await.driver.clone());
        }
        out.sort_by_key(|d| d.id);
        out
    }

    /// Drivers whose stored status is Available. Reflects the last reconciliation pass.
    pub async fn available_drivers(&self) -> Vec<Driver> {
        let mut drivers = self.list_drivers().await;
        drivers.retain(|d| d.status == DriverStatus::Available);
        drivers
    }

    /// All trips, cancelled ones included, ordered by departure.
    pub async fn list_trips(&self) -> Vec<Trip> {
        let states: Vec<SharedTripState> = self.trips.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(states.len());
        for ts in states {
            out.push(ts.read().await.trip.clone());
        }
        out.sort_by_key(|t| (t.window.departure, t.id));
        out
    }

    /// Every booking a passenger has made, cancelled ones included, oldest first.
    pub async fn bookings_by_passenger(&self, passenger_id: Ulid) -> Result<Vec<Booking>, EngineError> {
        if !self.passengers.contains_key(&passenger_id) {
            return Err(EngineError::not_found(Entity::Passenger, passenger_id));
        }
        let booking_ids = self
            .passenger_bookings
            .get(&passenger_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();

        let mut out = Vec::with_capacity(booking_ids.len());
        for booking_id in booking_ids {
            let Some(ts) = self
                .get_trip_for_booking(&booking_id)
                .and_then(|trip_id| self.get_trip_state(&trip_id))
            else {
                continue;
            };
            let guard = ts.read().await;
            if let Some(b) = guard.bookings.iter().find(|b| b.id == booking_id) {
                out.push(b.clone());
            }
        }
        out.sort_by_key(|b| (b.booked_at, b.id));
        Ok(out)
    }

    /// Every booking on a trip, cancelled ones included, oldest first.
    pub async fn bookings_by_trip(&self, trip_id: Ulid) -> Result<Vec<Booking>, EngineError> {
        let ts = self
            .get_trip_state(&trip_id)
            .ok_or(EngineError::not_found(Entity::Trip, trip_id))?;
        let guard = ts.read().await;
        let mut out = guard.bookings.clone();
        out.sort_by_key(|b| (b.booked_at, b.id));
        Ok(out)
    }
}
