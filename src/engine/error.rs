use std::fmt;

use crate::model::{RequestId, RequestState, SlotId, VehicleId, ZoneId};

/// Identity of something a caller referred to that does not exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityRef {
    Request(RequestId),
    Slot(SlotId),
    Vehicle(VehicleId),
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityRef::Request(id) => write!(f, "request {id}"),
            EntityRef::Slot(id) => write!(f, "slot {id}"),
            EntityRef::Vehicle(id) => write!(f, "vehicle {id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    NotFound(EntityRef),
    AlreadyExists(VehicleId),
    InvalidTransition {
        request_id: RequestId,
        expected: &'static [RequestState],
        actual: RequestState,
    },
    NoCapacity {
        zone: ZoneId,
    },
    DuplicateActive {
        vehicle_id: VehicleId,
        request_id: RequestId,
    },
    /// Slot is already held by another vehicle.
    InvalidState {
        slot_id: SlotId,
        occupant: VehicleId,
    },
    InvalidArgument(String),
    InsufficientHistory {
        requested: usize,
        available: usize,
    },
    /// The ledger entry `seq` could not be inverted; nothing was changed.
    InversionConflict {
        seq: u64,
        reason: String,
    },
    LimitExceeded(&'static str),
    WalError(String),
    /// A logged event could not be applied; the engine no longer accepts mutations.
    Halted(String),
}

impl EngineError {
    pub(crate) fn request_not_found(id: RequestId) -> Self {
        EngineError::NotFound(EntityRef::Request(id))
    }

    pub(crate) fn slot_not_found(id: &SlotId) -> Self {
        EngineError::NotFound(EntityRef::Slot(id.clone()))
    }

    pub(crate) fn vehicle_not_found(id: &VehicleId) -> Self {
        EngineError::NotFound(EntityRef::Vehicle(id.clone()))
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::NotFound(what) => write!(f, "not found: {what}"),
            EngineError::AlreadyExists(id) => write!(f, "vehicle {id} already registered"),
            EngineError::InvalidTransition {
                request_id,
                expected,
                actual,
            } => {
                let expected: Vec<String> = expected.iter().map(|s| s.to_string()).collect();
                write!(
                    f,
                    "invalid transition for request {request_id}: expected {}, actual {actual}",
                    expected.join(" or ")
                )
            }
            EngineError::NoCapacity { zone } => {
                write!(f, "no capacity: no slot available in zone {zone} or any fallback zone")
            }
            EngineError::DuplicateActive {
                vehicle_id,
                request_id,
            } => write!(f, "vehicle {vehicle_id} already has active request {request_id}"),
            EngineError::InvalidState { slot_id, occupant } => {
                write!(f, "slot {slot_id} is already occupied by {occupant}")
            }
            EngineError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            EngineError::InsufficientHistory {
                requested,
                available,
            } => write!(
                f,
                "insufficient history: {requested} operations requested, {available} recorded"
            ),
            EngineError::InversionConflict { seq, reason } => {
                write!(f, "cannot invert ledger entry {seq}: {reason}")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
            EngineError::Halted(reason) => write!(f, "engine halted: {reason}"),
        }
    }
}

impl std::error::Error for EngineError {}
