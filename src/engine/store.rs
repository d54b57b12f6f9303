use std::collections::HashMap;

use ulid::Ulid;

use crate::model::*;

use super::availability::{derive_availability, AvailabilityView};
use super::conflict::ConflictReason;

/// Storage-level claim key: one active reservation per `(granularity, unit)`.
type ClaimKey = (Granularity, Ulid);

/// Committed state of one apartment: its inventory plus every reservation
/// ever made against it. Guarded by the apartment's write lock.
#[derive(Debug, Clone)]
pub struct ApartmentState {
    pub apartment: Apartment,
    /// Insertion order, active and cancelled.
    reservations: Vec<Reservation>,
    by_id: HashMap<Ulid, usize>,
    /// Active claims, the unique-index analogue of `(target, granularity) WHERE active`.
    claims: HashMap<ClaimKey, Ulid>,
}

/// Immutable copy published after each commit, so reads never wait on a writer.
#[derive(Debug, Clone)]
pub struct ApartmentSnapshot {
    pub apartment: Apartment,
    pub active: Vec<Reservation>,
}

impl ApartmentSnapshot {
    pub fn availability(&self) -> AvailabilityView {
        derive_availability(&self.apartment, &self.active)
    }
}

impl ApartmentState {
    pub fn new(apartment: Apartment) -> Self {
        Self {
            apartment,
            reservations: Vec::new(),
            by_id: HashMap::new(),
            claims: HashMap::new(),
        }
    }

    pub fn id(&self) -> Ulid {
        self.apartment.id
    }

    pub fn reservations(&self) -> &[Reservation] {
        &self.reservations
    }

    pub fn reservation(&self, id: &Ulid) -> Option<&Reservation> {
        self.by_id.get(id).map(|&i| &self.reservations[i])
    }

    pub fn active_reservations(&self) -> impl Iterator<Item = &Reservation> {
        self.reservations.iter().filter(|r| r.is_active())
    }

    pub fn active_count(&self) -> usize {
        self.active_reservations().count()
    }

    /// Availability derived from the current committed state.
    pub fn availability(&self) -> AvailabilityView {
        derive_availability(&self.apartment, self.active_reservations())
    }

    pub fn snapshot(&self) -> ApartmentSnapshot {
        ApartmentSnapshot {
            apartment: self.apartment.clone(),
            active: self.active_reservations().cloned().collect(),
        }
    }

    /// Storage backstop, independent of the availability view: rejects a new
    /// active claim that would duplicate an existing one or overlap it in the
    /// apartment → bedroom → bed hierarchy. Capability flags are not its concern.
    pub fn check_claim(&self, granularity: Granularity, target_id: Ulid) -> Result<(), ConflictReason> {
        if let Some(g) = [Granularity::Apartment, Granularity::Bedroom, Granularity::Bed]
            .into_iter()
            .find(|g| self.claims.contains_key(&(*g, target_id)))
        {
            return Err(ConflictReason::held_by(g));
        }
        if self.claims.contains_key(&(Granularity::Apartment, self.apartment.id)) {
            return Err(ConflictReason::ApartmentLocked);
        }
        match granularity {
            Granularity::Apartment => {
                if self.claims.keys().any(|(g, _)| *g == Granularity::Bed) {
                    return Err(ConflictReason::BedTaken);
                }
                if !self.claims.is_empty() {
                    return Err(ConflictReason::BedroomLocked);
                }
            }
            Granularity::Bedroom => {
                let taken = self
                    .apartment
                    .bedroom(&target_id)
                    .is_some_and(|room| {
                        room.beds
                            .iter()
                            .any(|b| self.claims.contains_key(&(Granularity::Bed, b.id)))
                    });
                if taken {
                    return Err(ConflictReason::BedTaken);
                }
            }
            Granularity::Bed => {
                if let Some(room) = self.apartment.bedroom_of_bed(&target_id)
                    && self.claims.contains_key(&(Granularity::Bedroom, room.id))
                {
                    return Err(ConflictReason::BedroomLocked);
                }
            }
        }
        Ok(())
    }

    /// Backstop-checked insert.
    pub fn insert_reservation(&mut self, reservation: Reservation) -> Result<(), ConflictReason> {
        self.check_claim(reservation.granularity, reservation.target_id)?;
        self.record(reservation);
        Ok(())
    }

    /// Unchecked insert, used when applying committed or replayed events.
    /// Replayed history is taken as-is so integrity problems stay visible.
    /// A reservation id seen twice (a create frame written again after a
    /// failed flush) is kept once.
    pub(super) fn record(&mut self, reservation: Reservation) {
        if self.by_id.contains_key(&reservation.id) {
            tracing::warn!("reservation {} recorded twice, keeping the first", reservation.id);
            return;
        }
        if reservation.is_active() {
            self.claims
                .entry((reservation.granularity, reservation.target_id))
                .or_insert(reservation.id);
        }
        self.by_id.insert(reservation.id, self.reservations.len());
        self.reservations.push(reservation);
    }

    /// Flip active → cancelled. Returns `None` for an unknown id and
    /// `Some(false)` when it was already cancelled.
    pub(super) fn cancel(&mut self, id: &Ulid, at: Ms) -> Option<bool> {
        let &idx = self.by_id.get(id)?;
        let r = &mut self.reservations[idx];
        if !r.is_active() {
            return Some(false);
        }
        r.status = ReservationStatus::Cancelled;
        r.cancelled_at = Some(at);
        let key = (r.granularity, r.target_id);
        if self.claims.get(&key) == Some(id) {
            // Hand the claim to any other active reservation on the same unit.
            match self
                .reservations
                .iter()
                .find(|other| other.is_active() && (other.granularity, other.target_id) == key)
            {
                Some(other) => {
                    self.claims.insert(key, other.id);
                }
                None => {
                    self.claims.remove(&key);
                }
            }
        }
        Some(true)
    }

    /// Apply an inventory or reservation event (no locking, caller holds the lock).
    pub(super) fn apply_event(&mut self, event: &Event) {
        match event {
            Event::BedroomAdded {
                id,
                base_capacity,
                max_capacity,
                allow_extra_beds,
                pricing_mode,
                ..
            } => {
                self.apartment.bedrooms.push(Bedroom::new(
                    *id,
                    *base_capacity,
                    *max_capacity,
                    *allow_extra_beds,
                    *pricing_mode,
                ));
            }
            Event::BedAdded {
                id,
                bedroom_id,
                label,
                bed_type,
                monthly_price,
                deposit,
                capacity,
                ..
            } => {
                if let Some(room) = self.apartment.bedroom_mut(bedroom_id) {
                    room.beds.push(Bed {
                        id: *id,
                        label: label.clone(),
                        bed_type: bed_type.clone(),
                        monthly_price: *monthly_price,
                        deposit: *deposit,
                        capacity: *capacity,
                    });
                }
            }
            Event::CapabilitiesChanged { capabilities, .. } => {
                self.apartment.capabilities = *capabilities;
            }
            Event::ReservationCreated {
                id,
                apartment_id,
                granularity,
                target_id,
                holder_id,
                created_at,
            } => {
                self.record(Reservation {
                    id: *id,
                    apartment_id: *apartment_id,
                    granularity: *granularity,
                    target_id: *target_id,
                    holder_id: holder_id.clone(),
                    status: ReservationStatus::Active,
                    created_at: *created_at,
                    cancelled_at: None,
                });
            }
            Event::ReservationCancelled { id, cancelled_at, .. } => {
                self.cancel(id, *cancelled_at);
            }
            // ApartmentCreated/Deleted are handled at the DashMap level, not here
            Event::ApartmentCreated { .. } | Event::ApartmentDeleted { .. } => {}
        }
    }

    /// Minimal event sequence that recreates this state (for WAL compaction).
    pub fn to_events(&self) -> Vec<Event> {
        let apt = &self.apartment;
        let mut events = vec![Event::ApartmentCreated {
            id: apt.id,
            name: apt.name.clone(),
            max_capacity: apt.max_capacity,
            enabled_capacities: apt.enabled_capacities.clone(),
            capabilities: apt.capabilities,
        }];
        for room in &apt.bedrooms {
            events.push(Event::BedroomAdded {
                id: room.id,
                apartment_id: apt.id,
                base_capacity: room.base_capacity,
                max_capacity: room.max_capacity,
                allow_extra_beds: room.allow_extra_beds,
                pricing_mode: room.pricing_mode,
            });
            for bed in &room.beds {
                events.push(Event::BedAdded {
                    id: bed.id,
                    apartment_id: apt.id,
                    bedroom_id: room.id,
                    label: bed.label.clone(),
                    bed_type: bed.bed_type.clone(),
                    monthly_price: bed.monthly_price,
                    deposit: bed.deposit,
                    capacity: bed.capacity,
                });
            }
        }
        for r in &self.reservations {
            events.push(Event::ReservationCreated {
                id: r.id,
                apartment_id: r.apartment_id,
                granularity: r.granularity,
                target_id: r.target_id,
                holder_id: r.holder_id.clone(),
                created_at: r.created_at,
            });
            if let Some(cancelled_at) = r.cancelled_at {
                events.push(Event::ReservationCancelled {
                    id: r.id,
                    apartment_id: r.apartment_id,
                    cancelled_at,
                });
            }
        }
        events
    }
}
