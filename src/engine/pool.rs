use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::*;

use super::EngineError;

/// Every slot of a facility, keyed by id. Slots are created with the pool and
/// never removed; only their occupant changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotPool {
    layout: PoolLayout,
    slots: BTreeMap<SlotId, Slot>,
}

impl SlotPool {
    pub fn new(layout: PoolLayout) -> Self {
        let slots = layout
            .slot_ids()
            .map(|id| (id.clone(), Slot { id, occupant: None }))
            .collect();
        Self { layout, slots }
    }

    pub fn layout(&self) -> &PoolLayout {
        &self.layout
    }

    /// Configured zones, in fallback order.
    pub fn zones(&self) -> &[ZoneId] {
        &self.layout.zones
    }

    pub fn has_zone(&self, zone: &ZoneId) -> bool {
        self.layout.zones.contains(zone)
    }

    pub fn get(&self, id: &SlotId) -> Option<&Slot> {
        self.slots.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Slot> {
        self.slots.values()
    }

    /// Slots of one zone in ascending area/number order.
    pub fn in_zone<'a>(&'a self, zone: &'a ZoneId) -> impl Iterator<Item = &'a Slot> + 'a {
        self.slots
            .range(SlotId::zone_start(zone)..)
            .take_while(move |(id, _)| &id.zone == zone)
            .map(|(_, slot)| slot)
    }

    /// First available slot in `zone` by ascending area/number, so the answer
    /// is reproducible for a given pool state.
    pub fn find_available(&self, zone: &ZoneId) -> Option<SlotId> {
        self.in_zone(zone)
            .find(|slot| slot.is_available())
            .map(|slot| slot.id.clone())
    }

    pub fn mark_occupied(&mut self, id: &SlotId, vehicle: &VehicleId) -> Result<(), EngineError> {
        let slot = self
            .slots
            .get_mut(id)
            .ok_or_else(|| EngineError::slot_not_found(id))?;
        if let Some(occupant) = &slot.occupant {
            return Err(EngineError::InvalidState {
                slot_id: id.clone(),
                occupant: occupant.clone(),
            });
        }
        slot.occupant = Some(vehicle.clone());
        Ok(())
    }

    /// Idempotent: freeing an available slot is a no-op.
    pub fn mark_available(&mut self, id: &SlotId) -> Result<(), EngineError> {
        let slot = self
            .slots
            .get_mut(id)
            .ok_or_else(|| EngineError::slot_not_found(id))?;
        slot.occupant = None;
        Ok(())
    }

    /// Set the occupant outright, bypassing the occupancy guard. Only for
    /// undo plans, whose occupants were already checked against this pool.
    pub(super) fn restore_occupant(&mut self, id: &SlotId, occupant: Option<VehicleId>) {
        if let Some(slot) = self.slots.get_mut(id) {
            slot.occupant = occupant;
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn available_count(&self) -> usize {
        self.slots.values().filter(|s| s.is_available()).count()
    }

    pub fn available_in_zone(&self, zone: &ZoneId) -> usize {
        self.in_zone(zone).filter(|s| s.is_available()).count()
    }
}
