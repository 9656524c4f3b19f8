use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::State;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

pub type RequestId = Ulid;

/// A named partition of the slot pool.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ZoneId(String);

impl ZoneId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Registration plate. Normalized on construction: trimmed, upper-cased.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VehicleId(String);

impl VehicleId {
    pub fn new(raw: &str) -> Self {
        Self(raw.trim().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VehicleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `zone-area-number`, e.g. `A-1-3`. Ordering is zone, then area, then number,
/// which is also the allocation tie-break order within a zone.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotId {
    pub zone: ZoneId,
    pub area: u16,
    pub number: u16,
}

impl SlotId {
    pub fn new(zone: ZoneId, area: u16, number: u16) -> Self {
        Self { zone, area, number }
    }

    /// Lower bound of every slot id in `zone`.
    pub(crate) fn zone_start(zone: &ZoneId) -> Self {
        Self::new(zone.clone(), 0, 0)
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.zone, self.area, self.number)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseSlotIdError(String);

impl fmt::Display for ParseSlotIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid slot id '{}': expected zone-area-number", self.0)
    }
}

impl std::error::Error for ParseSlotIdError {}

impl FromStr for SlotId {
    type Err = ParseSlotIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseSlotIdError(s.to_string());
        let mut parts = s.rsplitn(3, '-');
        let number = parts.next().and_then(|p| p.parse().ok()).ok_or_else(err)?;
        let area = parts.next().and_then(|p| p.parse().ok()).ok_or_else(err)?;
        let zone = parts.next().filter(|z| !z.is_empty()).ok_or_else(err)?;
        Ok(Self::new(ZoneId::new(zone), area, number))
    }
}

/// A single allocatable unit. Availability is derived from the occupant, so
/// `available == false` iff an occupant is recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: SlotId,
    pub occupant: Option<VehicleId>,
}

impl Slot {
    pub fn is_available(&self) -> bool {
        self.occupant.is_none()
    }
}

/// Shape of the pool. `zones` is also the fixed cross-zone fallback order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolLayout {
    pub zones: Vec<ZoneId>,
    pub areas_per_zone: u16,
    pub slots_per_area: u16,
}

impl PoolLayout {
    pub fn slot_ids(&self) -> impl Iterator<Item = SlotId> + '_ {
        self.zones.iter().flat_map(move |zone| {
            (1..=self.areas_per_zone).flat_map(move |area| {
                (1..=self.slots_per_area).map(move |number| SlotId::new(zone.clone(), area, number))
            })
        })
    }

    pub fn capacity(&self) -> usize {
        self.zones.len() * self.areas_per_zone as usize * self.slots_per_area as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestState {
    Requested,
    Allocated,
    Occupied,
    Released,
    Cancelled,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestState::Released | RequestState::Cancelled)
    }

    /// States in which the request carries an allocated slot id.
    pub fn holds_slot(self) -> bool {
        matches!(
            self,
            RequestState::Allocated | RequestState::Occupied | RequestState::Released
        )
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RequestState::Requested => "REQUESTED",
            RequestState::Allocated => "ALLOCATED",
            RequestState::Occupied => "OCCUPIED",
            RequestState::Released => "RELEASED",
            RequestState::Cancelled => "CANCELLED",
        })
    }
}

/// A claim on a slot. Never deleted; terminal requests are the history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub vehicle_id: VehicleId,
    pub requested_zone: ZoneId,
    pub state: RequestState,
    pub allocated_slot: Option<SlotId>,
    pub cross_zone: bool,
    pub requested_at: Ms,
    pub allocated_at: Option<Ms>,
    pub occupied_at: Option<Ms>,
    pub released_at: Option<Ms>,
    pub cancelled_at: Option<Ms>,
    /// Whole minutes between occupation and release. Zero until released.
    pub duration_minutes: u64,
}

impl Request {
    pub fn new(id: RequestId, vehicle_id: VehicleId, requested_zone: ZoneId, requested_at: Ms) -> Self {
        Self {
            id,
            vehicle_id,
            requested_zone,
            state: RequestState::Requested,
            allocated_slot: None,
            cross_zone: false,
            requested_at,
            allocated_at: None,
            occupied_at: None,
            released_at: None,
            cancelled_at: None,
            duration_minutes: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vehicle {
    pub id: VehicleId,
    pub preferred_zone: ZoneId,
    pub registered_at: Ms,
    pub active_request: Option<RequestId>,
}

// ── Ledger ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LedgerKind {
    Allocation,
    StateChange,
    Cancellation,
}

impl fmt::Display for LedgerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LedgerKind::Allocation => "ALLOCATION",
            LedgerKind::StateChange => "STATE_CHANGE",
            LedgerKind::Cancellation => "CANCELLATION",
        })
    }
}

/// What must be restored to invert one recorded mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compensation {
    Allocation {
        slot_id: SlotId,
        previous_state: RequestState,
    },
    StateChange {
        from: RequestState,
        to: RequestState,
        slot_id: SlotId,
    },
    Cancellation {
        previous_state: RequestState,
        /// Slot held at cancellation time, if any.
        slot_id: Option<SlotId>,
        cross_zone: bool,
    },
}

/// One invertible mutation. `seq` starts at 1 and is contiguous: entries are
/// only ever removed from the tail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub seq: u64,
    pub request_id: RequestId,
    pub recorded_at: Ms,
    pub compensation: Compensation,
}

impl LedgerEntry {
    pub fn kind(&self) -> LedgerKind {
        match self.compensation {
            Compensation::Allocation { .. } => LedgerKind::Allocation,
            Compensation::StateChange { .. } => LedgerKind::StateChange,
            Compensation::Cancellation { .. } => LedgerKind::Cancellation,
        }
    }
}

/// The event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    PoolInitialized {
        layout: PoolLayout,
        at: Ms,
    },
    VehicleRegistered {
        vehicle_id: VehicleId,
        preferred_zone: ZoneId,
        at: Ms,
    },
    RequestCreated {
        request_id: RequestId,
        vehicle_id: VehicleId,
        zone: ZoneId,
        at: Ms,
    },
    RequestAllocated {
        request_id: RequestId,
        slot_id: SlotId,
        cross_zone: bool,
        at: Ms,
    },
    RequestOccupied {
        request_id: RequestId,
        at: Ms,
    },
    RequestReleased {
        request_id: RequestId,
        duration_minutes: u64,
        at: Ms,
    },
    RequestCancelled {
        request_id: RequestId,
        at: Ms,
    },
    /// The most recent `count` ledger entries were inverted as one batch.
    UndoCommitted {
        count: usize,
        at: Ms,
    },
    /// Full state, written by compaction.
    Snapshot(Box<State>),
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActivityFilter {
    #[default]
    All,
    Active,
    Inactive,
}

impl ActivityFilter {
    pub fn matches(self, request: &Request) -> bool {
        match self {
            ActivityFilter::All => true,
            ActivityFilter::Active => request.is_active(),
            ActivityFilter::Inactive => !request.is_active(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoneEntry {
    pub seq: u64,
    pub kind: LedgerKind,
    pub request_id: RequestId,
}

/// Outcome of a committed batch undo, in inversion order (most recent first).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchResult {
    pub undone: Vec<UndoneEntry>,
    pub remaining: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub slots_total: usize,
    pub slots_available: usize,
    pub slots_occupied: usize,
    pub vehicles: usize,
    pub requests: usize,
    pub ledger_entries: usize,
    pub at: Ms,
}
