use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::error::Entity;
use super::{apply_to_driver, apply_to_vehicle, Engine, EngineError};

/// Fields an operator may change on a vehicle. Status is derived and not editable here.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VehicleUpdate {
    pub model: Option<String>,
    pub capacity: Option<u32>,
    pub vehicle_type: Option<String>,
}

impl VehicleUpdate {
    pub fn is_empty(&self) -> bool {
        self.model.is_none() && self.capacity.is_none() && self.vehicle_type.is_none()
    }
}

/// Fields an operator may change on a driver. A status written here only lasts until the
/// next reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DriverUpdate {
    pub name: Option<String>,
    pub age: Option<u32>,
    pub gender: Option<String>,
    pub license_number: Option<String>,
    pub contact: Option<String>,
    pub address: Option<String>,
    pub status: Option<DriverStatus>,
}

impl DriverUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.age.is_none()
            && self.gender.is_none()
            && self.license_number.is_none()
            && self.contact.is_none()
            && self.address.is_none()
            && self.status.is_none()
    }
}

fn require_text(field: &'static str, value: &str) -> Result<String, EngineError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(EngineError::invalid(field, "required and cannot be empty"));
    }
    if trimmed.len() > MAX_TEXT_LEN {
        return Err(EngineError::LimitExceeded("text field too long"));
    }
    Ok(trimmed.to_string())
}

fn require_capacity(capacity: u32) -> Result<u32, EngineError> {
    if capacity == 0 {
        return Err(EngineError::invalid("capacity", "must be greater than 0"));
    }
    Ok(capacity)
}

impl Engine {
    pub async fn add_vehicle(&self, vehicle: Vehicle) -> Result<(), EngineError> {
        if self.vehicles.len() >= MAX_RECORDS_PER_KIND {
            return Err(EngineError::LimitExceeded("too many vehicles"));
        }
        if self.vehicles.contains_key(&vehicle.id) {
            return Err(EngineError::AlreadyExists(vehicle.id));
        }
        let vehicle = Vehicle {
            model: require_text("model", &vehicle.model)?,
            capacity: require_capacity(vehicle.capacity)?,
            vehicle_type: require_text("type", &vehicle.vehicle_type)?,
            ..vehicle
        };

        let event = Event::VehicleAdded {
            vehicle: vehicle.clone(),
        };
        self.wal_append(&event).await?;
        info!("vehicle {} added ({}, {} seats)", vehicle.id, vehicle.model, vehicle.capacity);
        self.vehicles
            .insert(vehicle.id, Arc::new(RwLock::new(VehicleState::new(vehicle))));
        Ok(())
    }

    /// Changes model, capacity or type. Trips already scheduled keep the capacity they
    /// snapshotted.
    pub async fn update_vehicle(
        &self,
        id: Ulid,
        update: VehicleUpdate,
    ) -> Result<Vehicle, EngineError> {
        let mut guard = self.lock_vehicle(&id).await?;
        if update.is_empty() {
            return Err(EngineError::invalid("update", "no fields to update"));
        }
        let current = &guard.vehicle;
        let model = match update.model {
            Some(m) => require_text("model", &m)?,
            None => current.model.clone(),
        };
        let capacity = match update.capacity {
            Some(c) => require_capacity(c)?,
            None => current.capacity,
        };
        let vehicle_type = match update.vehicle_type {
            Some(t) => require_text("type", &t)?,
            None => current.vehicle_type.clone(),
        };

        let event = Event::VehicleUpdated {
            id,
            model,
            capacity,
            vehicle_type,
        };
        self.wal_append(&event).await?;
        apply_to_vehicle(&mut guard, &event);
        Ok(guard.vehicle.clone())
    }

    pub async fn add_driver(&self, driver: Driver) -> Result<(), EngineError> {
        if self.drivers.len() >= MAX_RECORDS_PER_KIND {
            return Err(EngineError::LimitExceeded("too many drivers"));
        }
        if self.drivers.contains_key(&driver.id) {
            return Err(EngineError::AlreadyExists(driver.id));
        }
        let driver = Driver {
            name: require_text("name", &driver.name)?,
            gender: require_text("gender", &driver.gender)?,
            license_number: require_text("license_number", &driver.license_number)?,
            contact: require_text("contact", &driver.contact)?,
            address: require_text("address", &driver.address)?,
            ..driver
        };

        let event = Event::DriverAdded {
            driver: driver.clone(),
        };
        self.wal_append(&event).await?;
        info!("driver {} added ({})", driver.id, driver.name);
        self.drivers
            .insert(driver.id, Arc::new(RwLock::new(DriverState::new(driver))));
        Ok(())
    }

    pub async fn update_driver(
        &self,
        id: Ulid,
        update: DriverUpdate,
    ) -> Result<Driver, EngineError> {
        let mut guard = self.lock_driver(&id).await?;
        if update.is_empty() {
            return Err(EngineError::invalid("update", "no fields to update"));
        }
        let mut driver = guard.driver.clone();
        if let Some(name) = update.name {
            driver.name = require_text("name", &name)?;
        }
        if let Some(age) = update.age {
            driver.age = age;
        }
        if let Some(gender) = update.gender {
            driver.gender = require_text("gender", &gender)?;
        }
        if let Some(license) = update.license_number {
            driver.license_number = require_text("license_number", &license)?;
        }
        if let Some(contact) = update.contact {
            driver.contact = require_text("contact", &contact)?;
        }
        if let Some(address) = update.address {
            driver.address = require_text("address", &address)?;
        }
        if let Some(status) = update.status {
            driver.status = status;
        }

        let event = Event::DriverUpdated { driver };
        self.wal_append(&event).await?;
        apply_to_driver(&mut guard, &event);
        Ok(guard.driver.clone())
    }

    pub async fn add_route(&self, route: Route) -> Result<(), EngineError> {
        if self.routes.len() >= MAX_RECORDS_PER_KIND {
            return Err(EngineError::LimitExceeded("too many routes"));
        }
        if self.routes.contains_key(&route.id) {
            return Err(EngineError::AlreadyExists(route.id));
        }
        if !route.distance.is_finite() || route.distance < 0.0 {
            return Err(EngineError::invalid("distance", "must be a non-negative number"));
        }
        let route = Route {
            start: require_text("start", &route.start)?,
            end: require_text("end", &route.end)?,
            ..route
        };

        let event = Event::RouteAdded {
            route: route.clone(),
        };
        self.wal_append(&event).await?;
        self.routes.insert(route.id, route);
        Ok(())
    }

    pub async fn add_passenger(&self, passenger: Passenger) -> Result<(), EngineError> {
        if self.passengers.len() >= MAX_RECORDS_PER_KIND {
            return Err(EngineError::LimitExceeded("too many passengers"));
        }
        if self.passengers.contains_key(&passenger.id) {
            return Err(EngineError::AlreadyExists(passenger.id));
        }
        let passenger = Passenger {
            first_name: require_text("first_name", &passenger.first_name)?,
            gender: require_text("gender", &passenger.gender)?,
            email: require_text("email", &passenger.email)?,
            phone: require_text("phone", &passenger.phone)?,
            ..passenger
        };

        let event = Event::PassengerAdded {
            passenger: passenger.clone(),
        };
        self.wal_append(&event).await?;
        self.passengers.insert(passenger.id, passenger);
        Ok(())
    }

    pub fn get_route(&self, id: &Ulid) -> Result<Route, EngineError> {
        self.routes
            .get(id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::not_found(Entity::Route, *id))
    }

    pub fn get_passenger(&self, id: &Ulid) -> Result<Passenger, EngineError> {
        self.passengers
            .get(id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::not_found(Entity::Passenger, *id))
    }
}
