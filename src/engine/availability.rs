use ulid::Ulid;

use crate::model::*;

use super::error::{Entity, ResourceRef};
use super::overlap::{effective_window, overlaps, validate_window, REST_BUFFER_MS};
use super::{Engine, EngineError};

/// Outcome of asking whether a vehicle or driver can take on a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Accepted,
    /// First commitment found that blocks the window, with its effective window
    /// (arrival already inflated by the rest buffer).
    Conflict { trip_id: Ulid, window: Window },
}

/// First commitment on `timeline` that conflicts with `candidate`.
///
/// Only commitments departing at or before `candidate.arrival` can conflict, so the scan is
/// bounded by a binary search. `ignore` skips the trip being re-assigned.
pub fn find_conflict<'a>(
    timeline: &'a Timeline,
    candidate: &Window,
    ignore: Option<Ulid>,
    rest_buffer: Ms,
) -> Option<&'a Commitment> {
    timeline
        .departing_by(candidate.arrival)
        .filter(|c| Some(c.trip_id) != ignore)
        .find(|c| overlaps(&c.window, candidate, rest_buffer))
}

pub fn check_timeline(timeline: &Timeline, candidate: &Window, ignore: Option<Ulid>) -> Availability {
    match find_conflict(timeline, candidate, ignore, REST_BUFFER_MS) {
        Some(c) => Availability::Conflict {
            trip_id: c.trip_id,
            window: effective_window(&c.window, REST_BUFFER_MS),
        },
        None => Availability::Accepted,
    }
}

/// Map a conflict to the error the lifecycle operations surface.
pub(crate) fn ensure_free(
    timeline: &Timeline,
    resource: ResourceRef,
    candidate: &Window,
    ignore: Option<Ulid>,
) -> Result<(), EngineError> {
    match check_timeline(timeline, candidate, ignore) {
        Availability::Accepted => Ok(()),
        Availability::Conflict { trip_id, window } => Err(EngineError::Conflict {
            resource,
            trip_id,
            window,
        }),
    }
}

impl Engine {
    /// Read-only availability check for a vehicle. Scheduling re-runs the same check under
    /// the vehicle's write lock.
    pub async fn check_vehicle_availability(
        &self,
        vehicle_id: Ulid,
        departure: Ms,
        arrival: Ms,
    ) -> Result<Availability, EngineError> {
        let vs = self
            .get_vehicle_state(&vehicle_id)
            .ok_or(EngineError::not_found(Entity::Vehicle, vehicle_id))?;
        let window = validate_window(departure, arrival)?;
        let guard = vs.read().await;
        Ok(check_timeline(&guard.timeline, &window, None))
    }

    /// Read-only availability check for a driver.
    pub async fn check_driver_availability(
        &self,
        driver_id: Ulid,
        departure: Ms,
        arrival: Ms,
    ) -> Result<Availability, EngineError> {
        let ds = self
            .get_driver_state(&driver_id)
            .ok_or(EngineError::not_found(Entity::Driver, driver_id))?;
        let window = validate_window(departure, arrival)?;
        let guard = ds.read().await;
        Ok(check_timeline(&guard.timeline, &window, None))
    }
}
