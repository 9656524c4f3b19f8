use std::collections::BTreeMap;
use std::time::Instant;

use tracing::{info, warn};

use crate::model::*;

use super::state::State;
use super::{Engine, EngineError};

/// The complete effect of a batch undo, computed against an overlay and not
/// yet written. Holding one means every inversion in the batch applies.
#[derive(Debug)]
pub(super) struct UndoPlan {
    pub count: usize,
    pub undone: Vec<UndoneEntry>,
    pub occupants: BTreeMap<SlotId, Option<VehicleId>>,
    pub requests: BTreeMap<RequestId, Request>,
    pub links: BTreeMap<VehicleId, Option<RequestId>>,
}

/// Copy-on-write view over `State`. Inversions read through to the base and
/// write only to the overlay, so a failed batch leaves nothing behind.
struct Staging<'a> {
    base: &'a State,
    occupants: BTreeMap<SlotId, Option<VehicleId>>,
    requests: BTreeMap<RequestId, Request>,
    links: BTreeMap<VehicleId, Option<RequestId>>,
}

impl<'a> Staging<'a> {
    fn new(base: &'a State) -> Self {
        Self {
            base,
            occupants: BTreeMap::new(),
            requests: BTreeMap::new(),
            links: BTreeMap::new(),
        }
    }

    fn request(&self, id: &RequestId) -> Result<Request, String> {
        self.requests
            .get(id)
            .or_else(|| self.base.requests.get(id))
            .cloned()
            .ok_or_else(|| format!("request {id} does not exist"))
    }

    fn occupant(&self, slot_id: &SlotId) -> Result<Option<VehicleId>, String> {
        if let Some(staged) = self.occupants.get(slot_id) {
            return Ok(staged.clone());
        }
        self.base
            .pool
            .get(slot_id)
            .map(|slot| slot.occupant.clone())
            .ok_or_else(|| format!("slot {slot_id} does not exist"))
    }

    fn link(&self, vehicle_id: &VehicleId) -> Result<Option<RequestId>, String> {
        if let Some(staged) = self.links.get(vehicle_id) {
            return Ok(*staged);
        }
        self.base
            .vehicles
            .get(vehicle_id)
            .map(|v| v.active_request)
            .ok_or_else(|| format!("vehicle {vehicle_id} is not registered"))
    }

    /// Give the slot back; it must still be held by `vehicle_id`.
    fn free_slot(&mut self, slot_id: &SlotId, vehicle_id: &VehicleId) -> Result<(), String> {
        match self.occupant(slot_id)? {
            Some(ref holder) if holder == vehicle_id => {
                self.occupants.insert(slot_id.clone(), None);
                Ok(())
            }
            Some(holder) => Err(format!("slot {slot_id} is held by {holder}, not {vehicle_id}")),
            None => Err(format!("slot {slot_id} is not held by {vehicle_id}")),
        }
    }

    /// Take the slot again; it must be free.
    fn retake_slot(&mut self, slot_id: &SlotId, vehicle_id: &VehicleId) -> Result<(), String> {
        if let Some(holder) = self.occupant(slot_id)? {
            return Err(format!("slot {slot_id} has since been taken by {holder}"));
        }
        self.occupants.insert(slot_id.clone(), Some(vehicle_id.clone()));
        Ok(())
    }

    /// Point the vehicle at `request_id`; it must not be linked to another request.
    fn relink(&mut self, vehicle_id: &VehicleId, request_id: RequestId) -> Result<(), String> {
        match self.link(vehicle_id)? {
            Some(other) if other != request_id => Err(format!(
                "vehicle {vehicle_id} has since opened request {other}"
            )),
            _ => {
                self.links.insert(vehicle_id.clone(), Some(request_id));
                Ok(())
            }
        }
    }

    fn invert(&mut self, entry: &LedgerEntry) -> Result<(), String> {
        let mut request = self.request(&entry.request_id)?;

        match &entry.compensation {
            Compensation::Allocation {
                slot_id,
                previous_state,
            } => {
                expect_state(&request, RequestState::Allocated)?;
                if request.allocated_slot.as_ref() != Some(slot_id) {
                    return Err(format!(
                        "request {} holds {:?}, ledger recorded {slot_id}",
                        request.id, request.allocated_slot
                    ));
                }
                self.free_slot(slot_id, &request.vehicle_id)?;
                request.state = *previous_state;
                request.allocated_slot = None;
                request.cross_zone = false;
                request.allocated_at = None;
                if *previous_state == RequestState::Requested {
                    self.relink(&request.vehicle_id, request.id)?;
                }
            }
            Compensation::StateChange { from, to, slot_id } => {
                expect_state(&request, *to)?;
                match to {
                    RequestState::Occupied => {
                        request.occupied_at = None;
                    }
                    RequestState::Released => {
                        self.retake_slot(slot_id, &request.vehicle_id)?;
                        self.relink(&request.vehicle_id, request.id)?;
                        request.released_at = None;
                        request.duration_minutes = 0;
                    }
                    other => return Err(format!("no state change into {other} is invertible")),
                }
                request.state = *from;
            }
            Compensation::Cancellation {
                previous_state,
                slot_id,
                cross_zone,
            } => {
                expect_state(&request, RequestState::Cancelled)?;
                if let Some(slot_id) = slot_id
                    && *previous_state != RequestState::Requested
                {
                    self.retake_slot(slot_id, &request.vehicle_id)?;
                    request.allocated_slot = Some(slot_id.clone());
                    request.cross_zone = *cross_zone;
                }
                self.relink(&request.vehicle_id, request.id)?;
                request.state = *previous_state;
                request.cancelled_at = None;
            }
        }

        self.requests.insert(request.id, request);
        Ok(())
    }
}

fn expect_state(request: &Request, expected: RequestState) -> Result<(), String> {
    if request.state != expected {
        return Err(format!(
            "request {} is {}, expected {expected}",
            request.id, request.state
        ));
    }
    Ok(())
}

/// Invert the `k` most recent ledger entries, most recent first, against an
/// overlay. Either every inversion applies and the full plan is returned, or
/// the first one that does not is reported and the state is untouched.
pub(super) fn plan_undo(state: &State, k: usize, max: usize) -> Result<UndoPlan, EngineError> {
    if k == 0 || k > max {
        return Err(EngineError::InvalidArgument(format!(
            "undo count must be between 1 and {max}, got {k}"
        )));
    }
    let available = state.ledger.len();
    if available < k {
        return Err(EngineError::InsufficientHistory {
            requested: k,
            available,
        });
    }

    let mut staging = Staging::new(state);
    let mut undone = Vec::with_capacity(k);
    for entry in state.ledger.latest(k) {
        staging
            .invert(entry)
            .map_err(|reason| EngineError::InversionConflict {
                seq: entry.seq,
                reason,
            })?;
        undone.push(UndoneEntry {
            seq: entry.seq,
            kind: entry.kind(),
            request_id: entry.request_id,
        });
    }

    Ok(UndoPlan {
        count: k,
        undone,
        occupants: staging.occupants,
        requests: staging.requests,
        links: staging.links,
    })
}

impl Engine {
    /// Revert the `k` most recent recorded mutations as one all-or-nothing batch.
    pub async fn undo_last(&self, k: usize) -> Result<BatchResult, EngineError> {
        let started = Instant::now();
        let max = self.config.max_undo;
        let mut undone = Vec::new();

        let result = self
            .commit("undo", |state, now| {
                let plan = plan_undo(state, k, max)?;
                undone = plan.undone;
                Ok(Event::UndoCommitted { count: k, at: now })
            })
            .await;

        match result {
            Ok(guard) => {
                let remaining = guard.ledger.len();
                drop(guard);
                metrics::histogram!(crate::observability::UNDO_BATCH_SIZE).record(k as f64);
                info!("undid {k} operations in {:?}, {remaining} remain", started.elapsed());
                Ok(BatchResult { undone, remaining })
            }
            Err(e) => {
                warn!("undo of {k} operations rejected: {e}");
                Err(e)
            }
        }
    }
}
