use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

/// Which level of the property a reservation targets, coarsest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Apartment,
    Bedroom,
    Bed,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Apartment => "apartment",
            Granularity::Bedroom => "bedroom",
            Granularity::Bed => "bed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "apartment" => Some(Granularity::Apartment),
            "bedroom" => Some(Granularity::Bedroom),
            "bed" => Some(Granularity::Bed),
            _ => None,
        }
    }
}

impl std::fmt::Display for Granularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a bedroom is sold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PricingMode {
    PerBed,
    PerBedroom,
    Both,
}

impl PricingMode {
    pub fn allows_bedroom_booking(&self) -> bool {
        matches!(self, PricingMode::PerBedroom | PricingMode::Both)
    }

    /// Beds in a `PerBedroom` room are descriptive only.
    pub fn allows_bed_booking(&self) -> bool {
        matches!(self, PricingMode::PerBed | PricingMode::Both)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PricingMode::PerBed => "per_bed",
            PricingMode::PerBedroom => "per_bedroom",
            PricingMode::Both => "both",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "per_bed" => Some(PricingMode::PerBed),
            "per_bedroom" => Some(PricingMode::PerBedroom),
            "both" => Some(PricingMode::Both),
            _ => None,
        }
    }
}

/// Per-apartment switches enabling each reservation granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capabilities {
    pub allow_full_reservation: bool,
    pub allow_bedroom_reservation: bool,
    pub allow_bed_reservation: bool,
}

impl Capabilities {
    pub fn all() -> Self {
        Self {
            allow_full_reservation: true,
            allow_bedroom_reservation: true,
            allow_bed_reservation: true,
        }
    }

    pub fn any(&self) -> bool {
        self.allow_full_reservation || self.allow_bedroom_reservation || self.allow_bed_reservation
    }

    pub fn allows(&self, granularity: Granularity) -> bool {
        match granularity {
            Granularity::Apartment => self.allow_full_reservation,
            Granularity::Bedroom => self.allow_bedroom_reservation,
            Granularity::Bed => self.allow_bed_reservation,
        }
    }
}

/// The finest-grained sellable unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bed {
    pub id: Ulid,
    pub label: String,
    /// Cosmetic (bunk, single, double…). Never enters capacity math.
    pub bed_type: Option<String>,
    /// Minor currency units.
    pub monthly_price: u64,
    pub deposit: u64,
    /// How many occupants this bed contributes to the room.
    pub capacity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bedroom {
    pub id: Ulid,
    pub base_capacity: u32,
    pub max_capacity: u32,
    pub allow_extra_beds: bool,
    pub pricing_mode: PricingMode,
    pub beds: Vec<Bed>,
}

impl Bedroom {
    pub fn new(
        id: Ulid,
        base_capacity: u32,
        max_capacity: u32,
        allow_extra_beds: bool,
        pricing_mode: PricingMode,
    ) -> Self {
        Self {
            id,
            base_capacity,
            max_capacity,
            allow_extra_beds,
            pricing_mode,
            beds: Vec::new(),
        }
    }

    /// Sum of the capacity contributed by every bed in the room.
    pub fn bed_capacity(&self) -> u32 {
        self.beds.iter().map(|b| b.capacity).sum()
    }

    /// Enough beds to seat the base occupancy.
    pub fn is_furnished(&self) -> bool {
        self.bed_capacity() >= self.base_capacity
    }

    pub fn bed(&self, id: &Ulid) -> Option<&Bed> {
        self.beds.iter().find(|b| b.id == *id)
    }
}

/// Top-level sellable unit. Owns its bedrooms, which own their beds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Apartment {
    pub id: Ulid,
    pub name: Option<String>,
    pub max_capacity: u32,
    /// Occupancy tiers the owner sells, each in `1..=max_capacity`.
    pub enabled_capacities: Vec<u32>,
    pub capabilities: Capabilities,
    pub bedrooms: Vec<Bedroom>,
}

impl Apartment {
    pub fn new(
        id: Ulid,
        name: Option<String>,
        max_capacity: u32,
        enabled_capacities: Vec<u32>,
        capabilities: Capabilities,
    ) -> Self {
        Self {
            id,
            name,
            max_capacity,
            enabled_capacities,
            capabilities,
            bedrooms: Vec::new(),
        }
    }

    /// Listed as reservable only when at least one granularity is enabled.
    pub fn is_listed(&self) -> bool {
        self.capabilities.any()
    }

    pub fn bedroom(&self, id: &Ulid) -> Option<&Bedroom> {
        self.bedrooms.iter().find(|r| r.id == *id)
    }

    pub fn bedroom_mut(&mut self, id: &Ulid) -> Option<&mut Bedroom> {
        self.bedrooms.iter_mut().find(|r| r.id == *id)
    }

    /// The bedroom containing a bed.
    pub fn bedroom_of_bed(&self, bed_id: &Ulid) -> Option<&Bedroom> {
        self.bedrooms.iter().find(|r| r.bed(bed_id).is_some())
    }

    /// Granularity of a unit id inside this apartment, if it belongs here.
    pub fn unit_granularity(&self, unit_id: &Ulid) -> Option<Granularity> {
        if *unit_id == self.id {
            Some(Granularity::Apartment)
        } else if self.bedroom(unit_id).is_some() {
            Some(Granularity::Bedroom)
        } else if self.bedroom_of_bed(unit_id).is_some() {
            Some(Granularity::Bed)
        } else {
            None
        }
    }

    pub fn bed_count(&self) -> usize {
        self.bedrooms.iter().map(|r| r.beds.len()).sum()
    }

    /// Every bedroom and bed id, for the unit → apartment index.
    pub fn unit_ids(&self) -> impl Iterator<Item = Ulid> + '_ {
        self.bedrooms
            .iter()
            .flat_map(|r| std::iter::once(r.id).chain(r.beds.iter().map(|b| b.id)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Active,
    Cancelled,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Active => "active",
            ReservationStatus::Cancelled => "cancelled",
        }
    }
}

/// A fact recording that a unit is taken. Only `status` ever changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub apartment_id: Ulid,
    pub granularity: Granularity,
    pub target_id: Ulid,
    pub holder_id: String,
    pub status: ReservationStatus,
    pub created_at: Ms,
    pub cancelled_at: Option<Ms>,
}

impl Reservation {
    pub fn is_active(&self) -> bool {
        self.status == ReservationStatus::Active
    }
}

/// The event types, flat with no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ApartmentCreated {
        id: Ulid,
        name: Option<String>,
        max_capacity: u32,
        enabled_capacities: Vec<u32>,
        capabilities: Capabilities,
    },
    BedroomAdded {
        id: Ulid,
        apartment_id: Ulid,
        base_capacity: u32,
        max_capacity: u32,
        allow_extra_beds: bool,
        pricing_mode: PricingMode,
    },
    BedAdded {
        id: Ulid,
        apartment_id: Ulid,
        bedroom_id: Ulid,
        label: String,
        bed_type: Option<String>,
        monthly_price: u64,
        deposit: u64,
        capacity: u32,
    },
    CapabilitiesChanged {
        apartment_id: Ulid,
        capabilities: Capabilities,
    },
    ApartmentDeleted {
        id: Ulid,
    },
    ReservationCreated {
        id: Ulid,
        apartment_id: Ulid,
        granularity: Granularity,
        target_id: Ulid,
        holder_id: String,
        created_at: Ms,
    },
    ReservationCancelled {
        id: Ulid,
        apartment_id: Ulid,
        cancelled_at: Ms,
    },
}

impl Event {
    /// The apartment this event belongs to.
    pub fn apartment_id(&self) -> Ulid {
        match self {
            Event::ApartmentCreated { id, .. } | Event::ApartmentDeleted { id } => *id,
            Event::BedroomAdded { apartment_id, .. }
            | Event::BedAdded { apartment_id, .. }
            | Event::CapabilitiesChanged { apartment_id, .. }
            | Event::ReservationCreated { apartment_id, .. }
            | Event::ReservationCancelled { apartment_id, .. } => *apartment_id,
        }
    }
}

/// What kind of structurally impossible reservation combination was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityKind {
    /// Apartment-level reservation alongside bedroom/bed reservations.
    ApartmentAndSubUnit,
    /// Bedroom reservation alongside a reservation on one of its beds.
    BedroomAndBed,
    /// More than one active reservation on the same unit.
    DuplicateClaim,
}

/// Outbound events for billing, notification and monitoring collaborators.
/// Sent after commit, fire-and-forget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    ReservationCreated {
        reservation_id: Ulid,
        apartment_id: Ulid,
        granularity: Granularity,
        target_id: Ulid,
        holder_id: String,
    },
    ReservationCancelled {
        reservation_id: Ulid,
        apartment_id: Ulid,
    },
    IntegrityWarning {
        apartment_id: Ulid,
        kind: IntegrityKind,
        reservation_ids: Vec<Ulid>,
    },
}

impl DomainEvent {
    pub fn apartment_id(&self) -> Ulid {
        match self {
            DomainEvent::ReservationCreated { apartment_id, .. }
            | DomainEvent::ReservationCancelled { apartment_id, .. }
            | DomainEvent::IntegrityWarning { apartment_id, .. } => *apartment_id,
        }
    }

    /// JSON payload for downstream consumers.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApartmentInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub max_capacity: u32,
    pub capabilities: Capabilities,
    pub bedrooms: usize,
    pub beds: usize,
    pub active_reservations: usize,
}
