use ulid::Ulid;

use crate::model::Window;

/// Kind of record an id refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Vehicle,
    Driver,
    Route,
    Passenger,
    Trip,
    Booking,
}

impl Entity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Entity::Vehicle => "vehicle",
            Entity::Driver => "driver",
            Entity::Route => "route",
            Entity::Passenger => "passenger",
            Entity::Trip => "trip",
            Entity::Booking => "booking",
        }
    }
}

/// The vehicle or driver whose timeline rejected a commitment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceRef {
    Vehicle(Ulid),
    Driver(Ulid),
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceRef::Vehicle(id) => write!(f, "vehicle {id}"),
            ResourceRef::Driver(id) => write!(f, "driver {id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    NotFound {
        entity: Entity,
        id: Ulid,
    },
    AlreadyExists(Ulid),
    InvalidInput {
        field: &'static str,
        reason: String,
    },
    Conflict {
        resource: ResourceRef,
        trip_id: Ulid,
        window: Window,
    },
    CapacityExceeded {
        trip_id: Ulid,
        requested: u32,
        available: u32,
    },
    BookingClosed {
        trip_id: Ulid,
    },
    AlreadyCancelled(Ulid),
    NotConfirmed(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    pub(crate) fn not_found(entity: Entity, id: Ulid) -> Self {
        EngineError::NotFound { entity, id }
    }

    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        EngineError::InvalidInput {
            field,
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound { entity, id } => write!(f, "{} not found: {id}", entity.as_str()),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::InvalidInput { field, reason } => {
                write!(f, "invalid {field}: {reason}")
            }
            EngineError::Conflict {
                resource,
                trip_id,
                window,
            } => write!(
                f,
                "{resource} is not available between {} and {} due to trip {trip_id}",
                window.departure, window.arrival
            ),
            EngineError::CapacityExceeded {
                trip_id,
                requested,
                available,
            } => write!(
                f,
                "trip {trip_id}: only {available} seats available, cannot book {requested}"
            ),
            EngineError::BookingClosed { trip_id } => {
                write!(f, "bookings are closed for trip {trip_id}")
            }
            EngineError::AlreadyCancelled(id) => write!(f, "already cancelled: {id}"),
            EngineError::NotConfirmed(action) => write!(f, "{action} requires confirmation"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
