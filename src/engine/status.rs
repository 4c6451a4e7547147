use tracing::{debug, info, warn};

use crate::model::*;

use super::overlap::{now_ms, phase_at, Phase, REST_BUFFER_MS};
use super::{
    apply_to_driver, apply_to_vehicle, Engine, EngineError, SharedDriverState, SharedVehicleState,
};

/// Status a vehicle should carry at `now`, given its Scheduled commitments.
///
/// A trip in progress wins outright. Otherwise any trip still inside its rest buffer puts the
/// vehicle in Maintenance.
pub fn derive_vehicle_status(timeline: &Timeline, now: Ms) -> VehicleStatus {
    let mut status = VehicleStatus::Available;
    for c in timeline.departing_by(now) {
        match phase_at(&c.window, now, REST_BUFFER_MS) {
            Phase::Active => return VehicleStatus::OnTrip,
            Phase::Resting => status = VehicleStatus::Maintenance,
            Phase::Clear => {}
        }
    }
    status
}

/// Same rule as [`derive_vehicle_status`], with Resting in place of Maintenance.
pub fn derive_driver_status(timeline: &Timeline, now: Ms) -> DriverStatus {
    let mut status = DriverStatus::Available;
    for c in timeline.departing_by(now) {
        match phase_at(&c.window, now, REST_BUFFER_MS) {
            Phase::Active => return DriverStatus::OnTrip,
            Phase::Resting => status = DriverStatus::Resting,
            Phase::Clear => {}
        }
    }
    status
}

impl Engine {
    /// Recompute every vehicle and driver status from its trips.
    pub async fn run_reconciliation(&self) -> ReconcileReport {
        self.reconcile_at(now_ms()).await
    }

    pub(crate) async fn reconcile_at(&self, now: Ms) -> ReconcileReport {
        let start = std::time::Instant::now();
        let mut report = ReconcileReport::default();

        let vehicles: Vec<SharedVehicleState> =
            self.vehicles.iter().map(|e| e.value().clone()).collect();
        for vs in vehicles {
            report.vehicles_checked += 1;
            match self.reconcile_vehicle(&vs, now).await {
                Ok(true) => report.vehicles_changed += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!("reconcile: vehicle update failed: {e}");
                    report.failures += 1;
                }
            }
        }

        let drivers: Vec<SharedDriverState> =
            self.drivers.iter().map(|e| e.value().clone()).collect();
        for ds in drivers {
            report.drivers_checked += 1;
            match self.reconcile_driver(&ds, now).await {
                Ok(true) => report.drivers_changed += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!("reconcile: driver update failed: {e}");
                    report.failures += 1;
                }
            }
        }

        metrics::counter!(crate::observability::RECONCILE_RUNS_TOTAL).increment(1);
        metrics::counter!(crate::observability::RECONCILE_CHANGES_TOTAL, "kind" => "vehicle")
            .increment(report.vehicles_changed as u64);
        metrics::counter!(crate::observability::RECONCILE_CHANGES_TOTAL, "kind" => "driver")
            .increment(report.drivers_changed as u64);
        metrics::counter!(crate::observability::RECONCILE_FAILURES_TOTAL)
            .increment(report.failures as u64);
        metrics::histogram!(crate::observability::RECONCILE_DURATION_SECONDS)
            .record(start.elapsed().as_secs_f64());

        info!(
            "reconciled {} vehicles ({} changed), {} drivers ({} changed), {} failures",
            report.vehicles_checked,
            report.vehicles_changed,
            report.drivers_checked,
            report.drivers_changed,
            report.failures
        );
        report
    }

    async fn reconcile_vehicle(
        &self,
        vs: &SharedVehicleState,
        now: Ms,
    ) -> Result<bool, EngineError> {
        let mut guard = vs.write().await;
        let id = guard.vehicle.id;
        // Removed after the snapshot was taken.
        if !self.vehicles.contains_key(&id) {
            return Ok(false);
        }
        let status = derive_vehicle_status(&guard.timeline, now);
        if status == guard.vehicle.status {
            return Ok(false);
        }
        let event = Event::VehicleStatusChanged { id, status };
        self.wal_append(&event).await?;
        debug!("vehicle {id}: {} -> {}", guard.vehicle.status.as_str(), status.as_str());
        apply_to_vehicle(&mut guard, &event);
        Ok(true)
    }

    async fn reconcile_driver(
        &self,
        ds: &SharedDriverState,
        now: Ms,
    ) -> Result<bool, EngineError> {
        let mut guard = ds.write().await;
        let id = guard.driver.id;
        let status = derive_driver_status(&guard.timeline, now);
        if status == guard.driver.status {
            return Ok(false);
        }
        let event = Event::DriverStatusChanged { id, status };
        self.wal_append(&event).await?;
        debug!("driver {id}: {} -> {}", guard.driver.status.as_str(), status.as_str());
        apply_to_driver(&mut guard, &event);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    const D: Ms = DAY_MS;

    fn timeline(windows: &[(Ms, Ms)]) -> Timeline {
        let mut t = Timeline::new();
        for &(dep, arr) in windows {
            t.insert(Commitment {
                trip_id: Ulid::new(),
                window: Window::new(dep, arr),
            });
        }
        t
    }

    #[test]
    fn idle_vehicle_is_available() {
        assert_eq!(derive_vehicle_status(&Timeline::new(), 5 * D), VehicleStatus::Available);
        let t = timeline(&[(10 * D, 11 * D)]);
        assert_eq!(derive_vehicle_status(&t, 5 * D), VehicleStatus::Available);
    }

    #[test]
    fn in_progress_trip_wins() {
        // An older trip still resting must not mask the trip underway.
        let t = timeline(&[(0, D), (2 * D, 3 * D)]);
        assert_eq!(derive_vehicle_status(&t, 2 * D + 1), VehicleStatus::OnTrip);
        assert_eq!(derive_driver_status(&t, 2 * D + 1), DriverStatus::OnTrip);
    }

    #[test]
    fn rest_buffer_phase() {
        let t = timeline(&[(0, D)]);
        assert_eq!(derive_vehicle_status(&t, D + 1), VehicleStatus::Maintenance);
        assert_eq!(derive_driver_status(&t, D + REST_BUFFER_MS), DriverStatus::Resting);
        assert_eq!(
            derive_driver_status(&t, D + REST_BUFFER_MS + 1),
            DriverStatus::Available
        );
    }

    #[test]
    fn arrival_instant_is_still_on_trip() {
        let t = timeline(&[(0, D)]);
        assert_eq!(derive_vehicle_status(&t, D), VehicleStatus::OnTrip);
        assert_eq!(derive_vehicle_status(&t, 0), VehicleStatus::OnTrip);
    }
}
