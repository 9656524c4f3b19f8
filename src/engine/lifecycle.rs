use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::planner::plan_placement;
use super::state::State;
use super::{Engine, EngineError};

const MS_PER_MINUTE: Ms = 60_000;

fn require_state(request: &Request, expected: &'static [RequestState]) -> Result<(), EngineError> {
    if !expected.contains(&request.state) {
        return Err(EngineError::InvalidTransition {
            request_id: request.id,
            expected,
            actual: request.state,
        });
    }
    Ok(())
}

fn check_zone(state: &State, zone: &ZoneId) -> Result<(), EngineError> {
    if !state.pool.has_zone(zone) {
        return Err(EngineError::InvalidArgument(format!("unknown zone {zone}")));
    }
    Ok(())
}

// ── Planners: validate against current state and describe the change ──

pub(super) fn plan_register(
    state: &State,
    vehicle_id: &VehicleId,
    preferred_zone: &ZoneId,
    now: Ms,
) -> Result<Event, EngineError> {
    if vehicle_id.as_str().is_empty() {
        return Err(EngineError::InvalidArgument("vehicle id is empty".into()));
    }
    if vehicle_id.as_str().len() > MAX_VEHICLE_ID_LEN {
        return Err(EngineError::LimitExceeded("vehicle id too long"));
    }
    if state.vehicles.len() >= MAX_VEHICLES {
        return Err(EngineError::LimitExceeded("too many vehicles"));
    }
    check_zone(state, preferred_zone)?;
    if state.vehicles.vehicle_exists(vehicle_id) {
        return Err(EngineError::AlreadyExists(vehicle_id.clone()));
    }
    Ok(Event::VehicleRegistered {
        vehicle_id: vehicle_id.clone(),
        preferred_zone: preferred_zone.clone(),
        at: now,
    })
}

pub(super) fn plan_create(
    state: &State,
    request_id: RequestId,
    vehicle_id: &VehicleId,
    zone: &ZoneId,
    now: Ms,
) -> Result<Event, EngineError> {
    check_zone(state, zone)?;
    if !state.vehicles.vehicle_exists(vehicle_id) {
        return Err(EngineError::vehicle_not_found(vehicle_id));
    }
    if let Some(active) = state.vehicles.active_request(vehicle_id) {
        return Err(EngineError::DuplicateActive {
            vehicle_id: vehicle_id.clone(),
            request_id: active,
        });
    }
    if state.requests.len() >= MAX_REQUESTS {
        return Err(EngineError::LimitExceeded("too many requests"));
    }
    Ok(Event::RequestCreated {
        request_id,
        vehicle_id: vehicle_id.clone(),
        zone: zone.clone(),
        at: now,
    })
}

pub(super) fn plan_allocate(state: &State, request_id: RequestId, now: Ms) -> Result<Event, EngineError> {
    let request = state.request(&request_id)?;
    require_state(request, &[RequestState::Requested])?;
    let placement = plan_placement(&state.pool, &request.requested_zone)?;
    Ok(Event::RequestAllocated {
        request_id,
        slot_id: placement.slot_id,
        cross_zone: placement.cross_zone,
        at: now,
    })
}

pub(super) fn plan_occupy(state: &State, request_id: RequestId, now: Ms) -> Result<Event, EngineError> {
    let request = state.request(&request_id)?;
    require_state(request, &[RequestState::Allocated])?;
    Ok(Event::RequestOccupied { request_id, at: now })
}

pub(super) fn plan_release(state: &State, request_id: RequestId, now: Ms) -> Result<Event, EngineError> {
    let request = state.request(&request_id)?;
    require_state(request, &[RequestState::Occupied])?;
    let occupied_at = request.occupied_at.unwrap_or(now);
    Ok(Event::RequestReleased {
        request_id,
        duration_minutes: whole_minutes(occupied_at, now),
        at: now,
    })
}

pub(super) fn plan_cancel(state: &State, request_id: RequestId, now: Ms) -> Result<Event, EngineError> {
    let request = state.request(&request_id)?;
    require_state(request, &[RequestState::Requested, RequestState::Allocated])?;
    Ok(Event::RequestCancelled { request_id, at: now })
}

/// Floor of the elapsed minutes; a clock that stepped backwards yields zero.
pub(super) fn whole_minutes(from: Ms, to: Ms) -> u64 {
    ((to - from).max(0) / MS_PER_MINUTE) as u64
}

// ── Engine surface ──────────────────────────────────────────────

impl Engine {
    pub async fn register_vehicle(
        &self,
        vehicle_id: &VehicleId,
        preferred_zone: &ZoneId,
    ) -> Result<Vehicle, EngineError> {
        let guard = self
            .commit("register_vehicle", |state, now| {
                plan_register(state, vehicle_id, preferred_zone, now)
            })
            .await?;
        info!("registered vehicle {vehicle_id} (prefers zone {preferred_zone})");
        guard
            .vehicles
            .get(vehicle_id)
            .cloned()
            .ok_or_else(|| EngineError::vehicle_not_found(vehicle_id))
    }

    /// Open a claim for `vehicle_id`. Fails with `NotFound` for an unknown
    /// vehicle and `DuplicateActive` if the vehicle already has a live request.
    pub async fn create_request(
        &self,
        vehicle_id: &VehicleId,
        zone: &ZoneId,
    ) -> Result<Request, EngineError> {
        let request_id = Ulid::new();
        let guard = self
            .commit("create_request", |state, now| {
                plan_create(state, request_id, vehicle_id, zone, now)
            })
            .await?;
        info!("request {request_id} created for {vehicle_id} in zone {zone}");
        guard.request(&request_id).cloned()
    }

    pub async fn allocate(&self, request_id: RequestId) -> Result<Request, EngineError> {
        let guard = self
            .commit("allocate", |state, now| plan_allocate(state, request_id, now))
            .await?;
        let request = guard.request(&request_id)?.clone();
        drop(guard);
        if let Some(slot_id) = &request.allocated_slot {
            if request.cross_zone {
                metrics::counter!(crate::observability::CROSS_ZONE_ALLOCATIONS_TOTAL).increment(1);
                info!(
                    "request {request_id} allocated {slot_id} outside requested zone {}",
                    request.requested_zone
                );
            } else {
                info!("request {request_id} allocated {slot_id}");
            }
        }
        Ok(request)
    }

    pub async fn occupy(&self, request_id: RequestId) -> Result<Request, EngineError> {
        let guard = self
            .commit("occupy", |state, now| plan_occupy(state, request_id, now))
            .await?;
        info!("request {request_id} occupied");
        guard.request(&request_id).cloned()
    }

    pub async fn release(&self, request_id: RequestId) -> Result<Request, EngineError> {
        let guard = self
            .commit("release", |state, now| plan_release(state, request_id, now))
            .await?;
        let request = guard.request(&request_id)?.clone();
        info!(
            "request {request_id} released after {} minutes",
            request.duration_minutes
        );
        Ok(request)
    }

    pub async fn cancel(&self, request_id: RequestId) -> Result<Request, EngineError> {
        let guard = self
            .commit("cancel", |state, now| plan_cancel(state, request_id, now))
            .await?;
        info!("request {request_id} cancelled");
        guard.request(&request_id).cloned()
    }
}
