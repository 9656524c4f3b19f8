use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    /// Slots of `zone` in area/number order, or every slot when `zone` is `None`.
    pub async fn list_slots(&self, zone: Option<&ZoneId>) -> Vec<Slot> {
        let state = self.state.read().await;
        match zone {
            Some(zone) => state.pool.in_zone(zone).cloned().collect(),
            None => state.pool.iter().cloned().collect(),
        }
    }

    pub async fn get_slot(&self, id: &SlotId) -> Result<Slot, EngineError> {
        let state = self.state.read().await;
        state
            .pool
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::slot_not_found(id))
    }

    pub async fn get_request(&self, id: RequestId) -> Result<Request, EngineError> {
        let state = self.state.read().await;
        state.request(&id).cloned()
    }

    /// Requests matching `filter`, most recently created first, at most
    /// `limit` (default and ceiling: `MAX_REQUEST_PAGE`).
    pub async fn list_requests(&self, filter: ActivityFilter, limit: Option<usize>) -> Vec<Request> {
        let limit = limit.unwrap_or(MAX_REQUEST_PAGE).min(MAX_REQUEST_PAGE);
        let state = self.state.read().await;
        let mut requests: Vec<Request> = state
            .requests
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        requests.sort_by(|a, b| b.requested_at.cmp(&a.requested_at).then(b.id.cmp(&a.id)));
        requests.truncate(limit);
        requests
    }

    /// The rollback stack: ledger entries most recent first, at most `limit`
    /// (default `DEFAULT_LEDGER_PAGE`, ceiling `MAX_LEDGER_PAGE`).
    pub async fn list_ledger(&self, limit: Option<usize>) -> Vec<LedgerEntry> {
        let limit = limit.unwrap_or(DEFAULT_LEDGER_PAGE).min(MAX_LEDGER_PAGE);
        let state = self.state.read().await;
        state.ledger.latest(limit).cloned().collect()
    }

    /// Registered vehicles, most recently registered first.
    pub async fn list_vehicles(&self) -> Vec<Vehicle> {
        let state = self.state.read().await;
        let mut vehicles: Vec<Vehicle> = state.vehicles.iter().cloned().collect();
        vehicles.sort_by(|a, b| b.registered_at.cmp(&a.registered_at).then(a.id.cmp(&b.id)));
        vehicles
    }

    pub async fn get_vehicle(&self, id: &VehicleId) -> Result<Vehicle, EngineError> {
        let state = self.state.read().await;
        state
            .vehicles
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::vehicle_not_found(id))
    }

    /// Available slots per configured zone, in fallback order.
    pub async fn zone_availability(&self) -> Vec<(ZoneId, usize)> {
        let state = self.state.read().await;
        state
            .pool
            .zones()
            .iter()
            .map(|zone| (zone.clone(), state.pool.available_in_zone(zone)))
            .collect()
    }

    pub async fn health(&self) -> HealthReport {
        let state = self.state.read().await;
        let slots_total = state.pool.len();
        let slots_available = state.pool.available_count();
        HealthReport {
            slots_total,
            slots_available,
            slots_occupied: slots_total - slots_available,
            vehicles: state.vehicles.len(),
            requests: state.requests.len(),
            ledger_entries: state.ledger.len(),
            at: self.clock.now_ms(),
        }
    }

    /// Invariant violations in the current state; empty when consistent.
    pub async fn audit(&self) -> Vec<String> {
        self.state.read().await.audit()
    }
}
