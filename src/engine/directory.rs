use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::*;

use super::EngineError;

/// Registered vehicles and the one active request each may hold.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleDirectory {
    vehicles: BTreeMap<VehicleId, Vehicle>,
}

impl VehicleDirectory {
    pub fn register(&mut self, vehicle: Vehicle) -> Result<(), EngineError> {
        if self.vehicles.contains_key(&vehicle.id) {
            return Err(EngineError::AlreadyExists(vehicle.id));
        }
        self.vehicles.insert(vehicle.id.clone(), vehicle);
        Ok(())
    }

    pub fn get(&self, id: &VehicleId) -> Option<&Vehicle> {
        self.vehicles.get(id)
    }

    pub fn vehicle_exists(&self, id: &VehicleId) -> bool {
        self.vehicles.contains_key(id)
    }

    pub fn active_request(&self, id: &VehicleId) -> Option<RequestId> {
        self.vehicles.get(id).and_then(|v| v.active_request)
    }

    pub fn set_active_request(
        &mut self,
        id: &VehicleId,
        request: Option<RequestId>,
    ) -> Result<(), EngineError> {
        let vehicle = self
            .vehicles
            .get_mut(id)
            .ok_or_else(|| EngineError::vehicle_not_found(id))?;
        vehicle.active_request = request;
        Ok(())
    }

    /// Unchecked link write for undo plans, which only stage links of
    /// registered vehicles.
    pub(super) fn restore_link(&mut self, id: &VehicleId, request: Option<RequestId>) {
        if let Some(vehicle) = self.vehicles.get_mut(id) {
            vehicle.active_request = request;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Vehicle> {
        self.vehicles.values()
    }

    pub fn len(&self) -> usize {
        self.vehicles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vehicles.is_empty()
    }
}
