use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::model::*;

use super::directory::VehicleDirectory;
use super::ledger::Ledger;
use super::pool::SlotPool;
use super::undo::{plan_undo, UndoPlan};
use super::EngineError;

/// Everything a facility persists: slots, requests, vehicles, ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub pool: SlotPool,
    pub requests: BTreeMap<RequestId, Request>,
    pub vehicles: VehicleDirectory,
    pub ledger: Ledger,
}

impl State {
    pub fn new(layout: PoolLayout) -> Self {
        Self {
            pool: SlotPool::new(layout),
            requests: BTreeMap::new(),
            vehicles: VehicleDirectory::default(),
            ledger: Ledger::default(),
        }
    }

    pub fn request(&self, id: &RequestId) -> Result<&Request, EngineError> {
        self.requests
            .get(id)
            .ok_or(EngineError::request_not_found(*id))
    }

    fn request_mut(&mut self, id: &RequestId) -> Result<&mut Request, EngineError> {
        self.requests
            .get_mut(id)
            .ok_or(EngineError::request_not_found(*id))
    }

    /// Apply an event; the caller holds the lock. Events are
    /// validated by their planners before they are logged, so on the live
    /// path this cannot fail; on replay a failure means the log is damaged.
    ///
    /// Returns the zones whose slots or requests changed.
    pub fn apply(&mut self, event: &Event) -> Result<Vec<ZoneId>, EngineError> {
        match event {
            Event::PoolInitialized { layout, .. } => {
                *self = State::new(layout.clone());
                Ok(layout.zones.clone())
            }
            Event::Snapshot(snapshot) => {
                *self = (**snapshot).clone();
                Ok(self.pool.zones().to_vec())
            }
            Event::VehicleRegistered {
                vehicle_id,
                preferred_zone,
                at,
            } => {
                self.vehicles.register(Vehicle {
                    id: vehicle_id.clone(),
                    preferred_zone: preferred_zone.clone(),
                    registered_at: *at,
                    active_request: None,
                })?;
                Ok(Vec::new())
            }
            Event::RequestCreated {
                request_id,
                vehicle_id,
                zone,
                at,
            } => {
                self.vehicles.set_active_request(vehicle_id, Some(*request_id))?;
                self.requests.insert(
                    *request_id,
                    Request::new(*request_id, vehicle_id.clone(), zone.clone(), *at),
                );
                Ok(vec![zone.clone()])
            }
            Event::RequestAllocated {
                request_id,
                slot_id,
                cross_zone,
                at,
            } => {
                let request = self
                    .requests
                    .get_mut(request_id)
                    .ok_or(EngineError::request_not_found(*request_id))?;
                self.pool.mark_occupied(slot_id, &request.vehicle_id)?;
                let previous_state = request.state;
                request.state = RequestState::Allocated;
                request.allocated_slot = Some(slot_id.clone());
                request.cross_zone = *cross_zone;
                request.allocated_at = Some(*at);
                let zones = touched_zones(request);
                self.ledger.record(
                    *request_id,
                    Compensation::Allocation {
                        slot_id: slot_id.clone(),
                        previous_state,
                    },
                    *at,
                );
                Ok(zones)
            }
            Event::RequestOccupied { request_id, at } => {
                let request = self.request_mut(request_id)?;
                let slot_id = held_slot(request)?;
                let from = request.state;
                request.state = RequestState::Occupied;
                request.occupied_at = Some(*at);
                let zones = touched_zones(request);
                self.ledger.record(
                    *request_id,
                    Compensation::StateChange {
                        from,
                        to: RequestState::Occupied,
                        slot_id,
                    },
                    *at,
                );
                Ok(zones)
            }
            Event::RequestReleased {
                request_id,
                duration_minutes,
                at,
            } => {
                let request = self
                    .requests
                    .get_mut(request_id)
                    .ok_or(EngineError::request_not_found(*request_id))?;
                let slot_id = held_slot(request)?;
                self.pool.mark_available(&slot_id)?;
                self.vehicles.set_active_request(&request.vehicle_id, None)?;
                let from = request.state;
                request.state = RequestState::Released;
                request.released_at = Some(*at);
                request.duration_minutes = *duration_minutes;
                let zones = touched_zones(request);
                self.ledger.record(
                    *request_id,
                    Compensation::StateChange {
                        from,
                        to: RequestState::Released,
                        slot_id,
                    },
                    *at,
                );
                Ok(zones)
            }
            Event::RequestCancelled { request_id, at } => {
                let request = self
                    .requests
                    .get_mut(request_id)
                    .ok_or(EngineError::request_not_found(*request_id))?;
                let zones = touched_zones(request);
                let slot_id = request.allocated_slot.take();
                if let Some(slot_id) = &slot_id {
                    self.pool.mark_available(slot_id)?;
                }
                self.vehicles.set_active_request(&request.vehicle_id, None)?;
                let previous_state = request.state;
                let cross_zone = std::mem::take(&mut request.cross_zone);
                request.state = RequestState::Cancelled;
                request.cancelled_at = Some(*at);
                self.ledger.record(
                    *request_id,
                    Compensation::Cancellation {
                        previous_state,
                        slot_id,
                        cross_zone,
                    },
                    *at,
                );
                Ok(zones)
            }
            Event::UndoCommitted { count, .. } => {
                let plan = plan_undo(self, *count, usize::MAX)?;
                Ok(self.commit_undo(plan))
            }
        }
    }

    /// Write a fully validated undo plan. The staged values are the final
    /// ones, so they are assigned as-is; a slot handed from one vehicle back
    /// to another in the same batch needs no intermediate free.
    pub(super) fn commit_undo(&mut self, plan: UndoPlan) -> Vec<ZoneId> {
        let mut zones = BTreeSet::new();

        for (slot_id, occupant) in plan.occupants {
            zones.insert(slot_id.zone.clone());
            self.pool.restore_occupant(&slot_id, occupant);
        }
        for (vehicle_id, link) in &plan.links {
            self.vehicles.restore_link(vehicle_id, *link);
        }
        for request in plan.requests.into_values() {
            zones.extend(touched_zones(&request));
            self.requests.insert(request.id, request);
        }
        self.ledger.truncate_latest(plan.count);

        zones.into_iter().collect()
    }

    /// Every observable invariant violation, as human-readable lines.
    pub fn audit(&self) -> Vec<String> {
        let mut violations = Vec::new();

        for request in self.requests.values() {
            let id = request.id;
            if request.allocated_slot.is_some() != request.state.holds_slot() {
                violations.push(format!(
                    "request {id} in {} has allocated slot {:?}",
                    request.state, request.allocated_slot
                ));
            }
            match &request.allocated_slot {
                Some(slot_id) => {
                    if request.cross_zone && slot_id.zone == request.requested_zone {
                        violations.push(format!("request {id} marked cross-zone inside its own zone"));
                    }
                    if matches!(request.state, RequestState::Allocated | RequestState::Occupied) {
                        let occupant = self.pool.get(slot_id).and_then(|s| s.occupant.as_ref());
                        if occupant != Some(&request.vehicle_id) {
                            violations.push(format!(
                                "request {id} holds {slot_id} but the slot is held by {occupant:?}"
                            ));
                        }
                    }
                }
                None if request.cross_zone => {
                    violations.push(format!("request {id} marked cross-zone without a slot"));
                }
                None => {}
            }
            if request.is_active() && self.vehicles.active_request(&request.vehicle_id) != Some(id) {
                violations.push(format!(
                    "active request {id} is not linked from vehicle {}",
                    request.vehicle_id
                ));
            }
        }

        for vehicle in self.vehicles.iter() {
            let active = self
                .requests
                .values()
                .filter(|r| r.vehicle_id == vehicle.id && r.is_active())
                .count();
            if active > 1 {
                violations.push(format!("vehicle {} has {active} active requests", vehicle.id));
            }
            if let Some(rid) = vehicle.active_request
                && !self.requests.get(&rid).is_some_and(|r| r.is_active())
            {
                violations.push(format!(
                    "vehicle {} linked to request {rid} which is not active",
                    vehicle.id
                ));
            }
        }

        for slot in self.pool.iter() {
            if let Some(occupant) = &slot.occupant {
                let held = self.requests.values().any(|r| {
                    r.vehicle_id == *occupant
                        && r.allocated_slot.as_ref() == Some(&slot.id)
                        && matches!(r.state, RequestState::Allocated | RequestState::Occupied)
                });
                if !held {
                    violations.push(format!(
                        "slot {} occupied by {occupant} without a matching request",
                        slot.id
                    ));
                }
            }
        }

        violations
    }
}

fn held_slot(request: &Request) -> Result<SlotId, EngineError> {
    request
        .allocated_slot
        .clone()
        .ok_or(EngineError::InvalidTransition {
            request_id: request.id,
            expected: &[RequestState::Allocated, RequestState::Occupied],
            actual: request.state,
        })
}

fn touched_zones(request: &Request) -> Vec<ZoneId> {
    let mut zones = vec![request.requested_zone.clone()];
    if let Some(slot_id) = &request.allocated_slot
        && slot_id.zone != request.requested_zone
    {
        zones.push(slot_id.zone.clone());
    }
    zones
}
