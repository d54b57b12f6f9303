use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Machine-readable cause for a unit not being reservable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictReason {
    ApartmentLocked,
    BedroomLocked,
    BedTaken,
    CapabilityDisabled,
}

impl ConflictReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictReason::ApartmentLocked => "apartment_locked",
            ConflictReason::BedroomLocked => "bedroom_locked",
            ConflictReason::BedTaken => "bed_taken",
            ConflictReason::CapabilityDisabled => "capability_disabled",
        }
    }

    /// The reason an existing active claim of `granularity` blocks something.
    pub(crate) fn held_by(granularity: Granularity) -> Self {
        match granularity {
            Granularity::Apartment => ConflictReason::ApartmentLocked,
            Granularity::Bedroom => ConflictReason::BedroomLocked,
            Granularity::Bed => ConflictReason::BedTaken,
        }
    }
}

impl std::fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rejected reservation attempt. Expected and user-facing: the caller
/// re-fetches availability and lets the user pick another unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationConflict {
    pub apartment_id: Ulid,
    pub granularity: Granularity,
    pub target_id: Ulid,
    pub reason: ConflictReason,
}

impl std::fmt::Display for ReservationConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} in apartment {} not available: {}",
            self.granularity, self.target_id, self.apartment_id, self.reason
        )
    }
}

/// Input to the transaction manager. `id` is caller-chosen so a retried
/// request is recognised instead of booked twice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReserveRequest {
    pub id: Ulid,
    pub apartment_id: Ulid,
    pub granularity: Granularity,
    pub target_id: Ulid,
    pub holder_id: String,
}

impl ReserveRequest {
    pub fn new(
        apartment_id: Ulid,
        granularity: Granularity,
        target_id: Ulid,
        holder_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Ulid::new(),
            apartment_id,
            granularity,
            target_id,
            holder_id: holder_id.into(),
        }
    }

    /// Same request parameters as an existing reservation.
    pub(crate) fn matches(&self, r: &Reservation) -> bool {
        r.apartment_id == self.apartment_id
            && r.granularity == self.granularity
            && r.target_id == self.target_id
            && r.holder_id == self.holder_id
    }
}

/// Shape checks that need no apartment state.
pub(crate) fn validate_request(req: &ReserveRequest) -> Result<(), EngineError> {
    if req.holder_id.trim().is_empty() {
        return Err(EngineError::Invalid("holder_id must not be empty".into()));
    }
    if req.holder_id.len() > MAX_HOLDER_ID_LEN {
        return Err(EngineError::LimitExceeded("holder_id too long"));
    }
    if req.granularity == Granularity::Apartment && req.target_id != req.apartment_id {
        return Err(EngineError::Invalid(
            "apartment reservations must target the apartment id".into(),
        ));
    }
    Ok(())
}

/// The target must exist inside the apartment at the requested granularity.
pub(crate) fn validate_target(apartment: &Apartment, req: &ReserveRequest) -> Result<(), EngineError> {
    match apartment.unit_granularity(&req.target_id) {
        None => Err(EngineError::NotFound(req.target_id)),
        Some(g) if g != req.granularity => Err(EngineError::Invalid(format!(
            "unit {} is a {g}, not a {}",
            req.target_id, req.granularity
        ))),
        Some(_) => Ok(()),
    }
}

pub(crate) fn validate_capacities(max_capacity: u32, enabled: &[u32]) -> Result<(), EngineError> {
    if max_capacity == 0 {
        return Err(EngineError::Invalid("max_capacity must be at least 1".into()));
    }
    if max_capacity > MAX_CAPACITY {
        return Err(EngineError::LimitExceeded("capacity too large"));
    }
    if enabled.len() > MAX_ENABLED_CAPACITIES {
        return Err(EngineError::LimitExceeded("too many capacity tiers"));
    }
    if let Some(bad) = enabled.iter().find(|c| **c == 0 || **c > max_capacity) {
        return Err(EngineError::Invalid(format!(
            "capacity tier {bad} outside 1..={max_capacity}"
        )));
    }
    Ok(())
}

pub(crate) fn validate_bedroom(base_capacity: u32, max_capacity: u32) -> Result<(), EngineError> {
    if base_capacity == 0 {
        return Err(EngineError::Invalid("base_capacity must be at least 1".into()));
    }
    if max_capacity < base_capacity {
        return Err(EngineError::Invalid(format!(
            "max_capacity {max_capacity} below base_capacity {base_capacity}"
        )));
    }
    if max_capacity > MAX_CAPACITY {
        return Err(EngineError::LimitExceeded("capacity too large"));
    }
    Ok(())
}

/// A new bed may push the room past its base capacity only when extra beds
/// are allowed, and never past its max capacity.
pub(crate) fn validate_bed_fits(room: &Bedroom, capacity: u32) -> Result<(), EngineError> {
    if capacity == 0 {
        return Err(EngineError::Invalid("bed capacity must be at least 1".into()));
    }
    if room.beds.len() >= MAX_BEDS_PER_BEDROOM {
        return Err(EngineError::LimitExceeded("too many beds in bedroom"));
    }
    let total = room.bed_capacity().saturating_add(capacity);
    if total > room.max_capacity {
        return Err(EngineError::Invalid(format!(
            "bed capacity {total} exceeds bedroom max_capacity {}",
            room.max_capacity
        )));
    }
    if total > room.base_capacity && !room.allow_extra_beds {
        return Err(EngineError::Invalid(format!(
            "bedroom {} does not allow extra beds beyond base_capacity {}",
            room.id, room.base_capacity
        )));
    }
    Ok(())
}
