use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// Mandatory gap after a trip's arrival before the same vehicle or driver may depart again.
pub const REST_BUFFER_MS: Ms = 3 * DAY_MS;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// True when `candidate` may not be committed alongside `existing`.
///
/// The existing window is inflated by `rest_buffer` on its trailing edge only. Both
/// comparisons are inclusive, so a candidate departing exactly `rest_buffer` after the
/// existing arrival still conflicts.
pub fn overlaps(existing: &Window, candidate: &Window, rest_buffer: Ms) -> bool {
    candidate.departure <= existing.arrival + rest_buffer
        && candidate.arrival >= existing.departure
}

/// `[departure, arrival + rest_buffer]`.
pub fn effective_window(window: &Window, rest_buffer: Ms) -> Window {
    Window::new(window.departure, window.arrival + rest_buffer)
}

/// Where `now` falls relative to a committed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// `now ∈ [departure, arrival]`
    Active,
    /// `now ∈ (arrival, arrival + rest_buffer]`
    Resting,
    Clear,
}

pub fn phase_at(window: &Window, now: Ms, rest_buffer: Ms) -> Phase {
    if window.contains_instant(now) {
        Phase::Active
    } else if window.arrival < now && now <= window.arrival + rest_buffer {
        Phase::Resting
    } else {
        Phase::Clear
    }
}

pub(crate) fn validate_window(departure: Ms, arrival: Ms) -> Result<Window, EngineError> {
    if arrival <= departure {
        return Err(EngineError::invalid("arrival", "arrival must be after departure"));
    }
    if departure < MIN_VALID_TIMESTAMP_MS || arrival > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if arrival - departure > MAX_TRIP_DURATION_MS {
        return Err(EngineError::LimitExceeded("trip too long"));
    }
    Ok(Window::new(departure, arrival))
}

#[cfg(test)]
mod tests {
    use super::*;

    const D: Ms = DAY_MS;

    #[test]
    fn disjoint_far_apart_is_clear() {
        let a = Window::new(0, D);
        let b = Window::new(10 * D, 11 * D);
        assert!(!overlaps(&a, &b, REST_BUFFER_MS));
    }

    #[test]
    fn candidate_inside_rest_buffer_conflicts() {
        let a = Window::new(0, D);
        let b = Window::new(2 * D, 3 * D); // departs 1 day after arrival
        assert!(overlaps(&a, &b, REST_BUFFER_MS));
    }

    #[test]
    fn boundary_is_inclusive() {
        let a = Window::new(0, D);
        // Departs exactly rest_buffer after arrival
        let b = Window::new(D + REST_BUFFER_MS, D + REST_BUFFER_MS + D);
        assert!(overlaps(&a, &b, REST_BUFFER_MS));
        // One millisecond later is fine
        let c = Window::new(D + REST_BUFFER_MS + 1, D + REST_BUFFER_MS + D);
        assert!(!overlaps(&a, &c, REST_BUFFER_MS));
    }

    #[test]
    fn candidate_arriving_at_existing_departure_conflicts() {
        let a = Window::new(10 * D, 11 * D);
        let b = Window::new(8 * D, 10 * D);
        assert!(overlaps(&a, &b, REST_BUFFER_MS));
    }

    #[test]
    fn earlier_candidate_is_not_inflated() {
        // The buffer only trails the existing trip. A candidate ending just before the
        // existing departure is accepted even though its own buffer would reach into it.
        let a = Window::new(10 * D, 11 * D);
        let b = Window::new(8 * D, 10 * D - 1);
        assert!(!overlaps(&a, &b, REST_BUFFER_MS));
        // The reverse direction does catch it.
        assert!(overlaps(&b, &a, REST_BUFFER_MS));
    }

    #[test]
    fn zero_buffer_degenerates_to_closed_overlap() {
        let a = Window::new(100, 200);
        assert!(overlaps(&a, &Window::new(200, 300), 0));
        assert!(!overlaps(&a, &Window::new(201, 300), 0));
    }

    #[test]
    fn effective_window_inflates_trailing_edge() {
        let w = effective_window(&Window::new(100, 200), 50);
        assert_eq!(w, Window::new(100, 250));
    }

    #[test]
    fn phases() {
        let w = Window::new(10 * D, 11 * D);
        assert_eq!(phase_at(&w, 10 * D, REST_BUFFER_MS), Phase::Active);
        assert_eq!(phase_at(&w, 11 * D, REST_BUFFER_MS), Phase::Active);
        assert_eq!(phase_at(&w, 11 * D + 1, REST_BUFFER_MS), Phase::Resting);
        assert_eq!(phase_at(&w, 14 * D, REST_BUFFER_MS), Phase::Resting);
        assert_eq!(phase_at(&w, 14 * D + 1, REST_BUFFER_MS), Phase::Clear);
        assert_eq!(phase_at(&w, 9 * D, REST_BUFFER_MS), Phase::Clear);
    }

    #[test]
    fn validate_window_rejects_inverted_and_empty() {
        let dep = MIN_VALID_TIMESTAMP_MS + D;
        assert!(matches!(
            validate_window(dep, dep),
            Err(EngineError::InvalidInput { field: "arrival", .. })
        ));
        assert!(matches!(
            validate_window(dep, dep - 1),
            Err(EngineError::InvalidInput { .. })
        ));
        assert_eq!(validate_window(dep, dep + 1).unwrap(), Window::new(dep, dep + 1));
    }

    #[test]
    fn validate_window_limits() {
        assert!(matches!(
            validate_window(0, 1000),
            Err(EngineError::LimitExceeded("timestamp out of range"))
        ));
        let dep = MIN_VALID_TIMESTAMP_MS;
        assert!(matches!(
            validate_window(dep, dep + MAX_TRIP_DURATION_MS + 1),
            Err(EngineError::LimitExceeded("trip too long"))
        ));
    }
}
