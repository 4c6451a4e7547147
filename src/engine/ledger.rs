use std::collections::HashSet;

use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::error::Entity;
use super::overlap::now_ms;
use super::{apply_to_trip, Engine, EngineError};

/// Bookings close this long before departure.
pub const BOOKING_CUTOFF_MS: Ms = DAY_MS;

impl Engine {
    /// Seats still free on a trip: `max_passengers` minus active bookings.
    pub async fn available_seats(&self, trip_id: Ulid) -> Result<u32, EngineError> {
        let ts = self
            .get_trip_state(&trip_id)
            .ok_or(EngineError::not_found(Entity::Trip, trip_id))?;
        let guard = ts.read().await;
        Ok(guard.available_seats())
    }

    /// Book a group of passengers onto one trip.
    ///
    /// Capacity is checked against the whole request before anyone is booked. Passengers
    /// that are unknown or already hold a seat are skipped and reported; the rest are
    /// booked in request order and logged in a single write.
    pub async fn book_trip(
        &self,
        trip_id: Ulid,
        passenger_ids: Vec<Ulid>,
    ) -> Result<BookingReport, EngineError> {
        self.book_trip_at(trip_id, passenger_ids, now_ms()).await
    }

    pub(crate) async fn book_trip_at(
        &self,
        trip_id: Ulid,
        passenger_ids: Vec<Ulid>,
        now: Ms,
    ) -> Result<BookingReport, EngineError> {
        if passenger_ids.is_empty() {
            return Err(EngineError::invalid("passenger_ids", "at least one passenger is required"));
        }
        if passenger_ids.len() > MAX_PASSENGERS_PER_BOOKING {
            return Err(EngineError::LimitExceeded("too many passengers in one booking"));
        }

        // Held until every booking is written, so concurrent requests cannot oversell.
        let mut guard = self.lock_trip(&trip_id).await?;
        if guard.trip.vehicle_id.is_none() {
            return Err(EngineError::invalid("vehicle_id", "trip has no vehicle assigned"));
        }
        if !guard.trip.is_scheduled() {
            return Err(EngineError::AlreadyCancelled(trip_id));
        }
        if now > guard.trip.window.departure - BOOKING_CUTOFF_MS {
            return Err(EngineError::BookingClosed { trip_id });
        }
        let requested = passenger_ids.len() as u32;
        let available = guard.available_seats();
        if requested > available {
            return Err(EngineError::CapacityExceeded {
                trip_id,
                requested,
                available,
            });
        }

        let mut report = BookingReport {
            trip_id,
            ..Default::default()
        };
        let mut seen = HashSet::new();
        let mut events = Vec::with_capacity(passenger_ids.len());
        for passenger_id in passenger_ids {
            if !self.passengers.contains_key(&passenger_id) {
                report.skipped.push((passenger_id, SkipReason::UnknownPassenger));
                continue;
            }
            if !seen.insert(passenger_id) || guard.holds_booking(&passenger_id) {
                report.skipped.push((passenger_id, SkipReason::AlreadyBooked));
                continue;
            }

            let booking = Booking {
                id: Ulid::new(),
                passenger_id,
                trip_id,
                booked_at: now,
                status: BookingStatus::Booked,
            };
            events.push(Event::BookingCreated {
                booking: booking.clone(),
            });
            report.booked.push(booking);
        }

        // All or nothing: a failed write leaves the trip untouched.
        if !events.is_empty() {
            self.wal_append_all(events.clone()).await?;
        }
        for event in &events {
            apply_to_trip(&mut guard, event);
        }
        for booking in &report.booked {
            self.index_booking(booking);
        }

        for (passenger_id, reason) in &report.skipped {
            debug!("trip {trip_id}: skipped passenger {passenger_id} ({})", reason.as_str());
            metrics::counter!(crate::observability::BOOKINGS_SKIPPED_TOTAL, "reason" => reason.as_str())
                .increment(1);
        }
        metrics::counter!(crate::observability::BOOKINGS_CREATED_TOTAL)
            .increment(report.booked.len() as u64);
        info!(
            "trip {trip_id}: booked {} passengers, skipped {}",
            report.booked.len(),
            report.skipped.len()
        );
        Ok(report)
    }

    /// Cancel one booking, freeing its seat.
    pub async fn cancel_booking(&self, booking_id: Ulid) -> Result<Booking, EngineError> {
        let mut guard = self.resolve_booking_write(&booking_id).await?;
        let trip_id = guard.trip.id;
        let booking = guard
            .bookings
            .iter()
            .find(|b| b.id == booking_id)
            .ok_or(EngineError::not_found(Entity::Booking, booking_id))?;
        if !booking.is_booked() {
            return Err(EngineError::AlreadyCancelled(booking_id));
        }

        let event = Event::BookingCancelled {
            id: booking_id,
            trip_id,
        };
        self.wal_append(&event).await?;
        apply_to_trip(&mut guard, &event);
        info!("booking {booking_id} on trip {trip_id} cancelled");
        guard
            .bookings
            .iter()
            .find(|b| b.id == booking_id)
            .cloned()
            .ok_or(EngineError::not_found(Entity::Booking, booking_id))
    }
}
