use tracing::debug;

use crate::model::*;

use super::pool::SlotPool;
use super::EngineError;

/// Where a request will be parked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub slot_id: SlotId,
    pub cross_zone: bool,
}

/// Zone-preferred first fit. The requested zone is tried first, then every
/// other zone in the pool's configured order. Pure: the caller marks the slot.
pub fn plan_placement(pool: &SlotPool, requested: &ZoneId) -> Result<Placement, EngineError> {
    if let Some(slot_id) = pool.find_available(requested) {
        return Ok(Placement {
            slot_id,
            cross_zone: false,
        });
    }

    debug!("zone {requested} full, trying fallback zones");
    pool.zones()
        .iter()
        .filter(|zone| *zone != requested)
        .find_map(|zone| pool.find_available(zone))
        .map(|slot_id| Placement {
            slot_id,
            cross_zone: true,
        })
        .ok_or_else(|| EngineError::NoCapacity {
            zone: requested.clone(),
        })
}
