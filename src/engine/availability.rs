use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::model::*;

use super::conflict::ConflictReason;

pub const REASON_APARTMENT_LOCKED: &str = "apartment fully reserved";
pub const REASON_BEDS_RESERVED: &str = "beds already reserved";
pub const REASON_BEDROOMS_RESERVED: &str = "bedrooms already reserved";
pub const REASON_FULL_DISABLED: &str = "full reservation disabled";
pub const REASON_UNLISTED: &str = "no reservation capability enabled";

/// A reservation combination the transaction manager should never have let
/// through. Reported, never silently resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityViolation {
    pub kind: IntegrityKind,
    pub reservation_ids: Vec<Ulid>,
}

/// Read-only snapshot of what in one apartment can be reserved right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityView {
    pub apartment_id: Ulid,
    pub listed: bool,
    pub apartment_reservable: bool,
    pub is_apartment_locked: bool,
    pub has_any_bed_reserved: bool,
    pub has_any_bedroom_reserved: bool,
    pub can_reserve_bedroom: BTreeMap<Ulid, bool>,
    pub can_reserve_bed: BTreeMap<Ulid, bool>,
    pub available_bedrooms_count: usize,
    pub total_bedrooms_count: usize,
    pub available_beds_count: usize,
    pub total_beds_count: usize,
    /// Human-readable explanation when the whole apartment can't be booked.
    pub reason: Option<String>,
    pub apartment_block: Option<ConflictReason>,
    pub bedroom_blocks: BTreeMap<Ulid, ConflictReason>,
    pub bed_blocks: BTreeMap<Ulid, ConflictReason>,
    pub integrity: Vec<IntegrityViolation>,
}

impl AvailabilityView {
    /// `Ok` if the unit can be reserved, otherwise the block reason.
    pub fn check(&self, granularity: Granularity, target_id: Ulid) -> Result<(), ConflictReason> {
        let (reservable, block) = match granularity {
            Granularity::Apartment => (
                self.apartment_reservable && target_id == self.apartment_id,
                self.apartment_block,
            ),
            Granularity::Bedroom => (
                self.can_reserve_bedroom.get(&target_id).copied().unwrap_or(false),
                self.bedroom_blocks.get(&target_id).copied(),
            ),
            Granularity::Bed => (
                self.can_reserve_bed.get(&target_id).copied().unwrap_or(false),
                self.bed_blocks.get(&target_id).copied(),
            ),
        };
        if reservable {
            Ok(())
        } else {
            Err(block.unwrap_or(ConflictReason::CapabilityDisabled))
        }
    }

    pub fn is_reservable(&self, granularity: Granularity, target_id: Ulid) -> bool {
        self.check(granularity, target_id).is_ok()
    }

    pub fn has_integrity_violation(&self) -> bool {
        !self.integrity.is_empty()
    }
}

/// Active claims inside one apartment, bucketed by granularity.
#[derive(Default)]
struct Claims {
    apartment: Vec<Ulid>,
    bedrooms: BTreeMap<Ulid, Vec<Ulid>>,
    beds: BTreeMap<Ulid, Vec<Ulid>>,
}

impl Claims {
    fn collect<'a>(apartment: &Apartment, reservations: impl IntoIterator<Item = &'a Reservation>) -> Self {
        let mut claims = Claims::default();
        for r in reservations {
            if !r.is_active() || r.apartment_id != apartment.id {
                continue;
            }
            // Claims on units that aren't part of this apartment are ignored.
            match (r.granularity, apartment.unit_granularity(&r.target_id)) {
                (Granularity::Apartment, Some(Granularity::Apartment)) => claims.apartment.push(r.id),
                (Granularity::Bedroom, Some(Granularity::Bedroom)) => {
                    claims.bedrooms.entry(r.target_id).or_default().push(r.id)
                }
                (Granularity::Bed, Some(Granularity::Bed)) => {
                    claims.beds.entry(r.target_id).or_default().push(r.id)
                }
                _ => {}
            }
        }
        claims
    }

    fn has_sub_unit(&self) -> bool {
        !self.bedrooms.is_empty() || !self.beds.is_empty()
    }

    fn integrity(&self, apartment: &Apartment) -> Vec<IntegrityViolation> {
        let mut out = Vec::new();
        let stacked = std::iter::once(&self.apartment)
            .chain(self.bedrooms.values())
            .chain(self.beds.values())
            .filter(|ids| ids.len() > 1);
        for ids in stacked {
            let mut ids = ids.clone();
            ids.sort();
            out.push(IntegrityViolation {
                kind: IntegrityKind::DuplicateClaim,
                reservation_ids: ids,
            });
        }
        if !self.apartment.is_empty() && self.has_sub_unit() {
            let mut ids: BTreeSet<Ulid> = self.apartment.iter().copied().collect();
            ids.extend(self.bedrooms.values().flatten());
            ids.extend(self.beds.values().flatten());
            out.push(IntegrityViolation {
                kind: IntegrityKind::ApartmentAndSubUnit,
                reservation_ids: ids.into_iter().collect(),
            });
        }
        for room in &apartment.bedrooms {
            let Some(room_claims) = self.bedrooms.get(&room.id) else { continue };
            let bed_claims: Vec<Ulid> = room
                .beds
                .iter()
                .filter_map(|b| self.beds.get(&b.id))
                .flatten()
                .copied()
                .collect();
            if !bed_claims.is_empty() {
                let mut ids: BTreeSet<Ulid> = room_claims.iter().copied().collect();
                ids.extend(bed_claims);
                out.push(IntegrityViolation {
                    kind: IntegrityKind::BedroomAndBed,
                    reservation_ids: ids.into_iter().collect(),
                });
            }
        }
        out
    }
}

/// Derive the availability of every unit in `apartment` from its reservations.
///
/// Pure and deterministic. Cancelled reservations and reservations belonging
/// to other apartments are skipped, so callers may pass the full history.
///
/// Evaluation order (first match wins per unit):
/// 1. An active apartment reservation locks every unit.
/// 2. A reserved bedroom locks itself and all of its beds. Otherwise a bed is
///    blocked by its own reservation, then by disabled capability; a bedroom is
///    blocked by any reserved bed inside it, then by disabled capability.
/// 3. The whole apartment is reservable only when it allows full reservation
///    and nothing inside it is reserved.
pub fn derive_availability<'a>(
    apartment: &Apartment,
    reservations: impl IntoIterator<Item = &'a Reservation>,
) -> AvailabilityView {
    let claims = Claims::collect(apartment, reservations);
    let caps = apartment.capabilities;
    let locked = !claims.apartment.is_empty();

    let mut can_reserve_bedroom = BTreeMap::new();
    let mut can_reserve_bed = BTreeMap::new();
    let mut bedroom_blocks = BTreeMap::new();
    let mut bed_blocks = BTreeMap::new();

    for room in &apartment.bedrooms {
        let room_locked = claims.bedrooms.contains_key(&room.id);
        let mut any_bed_taken = false;

        for bed in &room.beds {
            let block = if locked {
                Some(ConflictReason::ApartmentLocked)
            } else if room_locked {
                Some(ConflictReason::BedroomLocked)
            } else if claims.beds.contains_key(&bed.id) {
                any_bed_taken = true;
                Some(ConflictReason::BedTaken)
            } else if !caps.allows(Granularity::Bed) || !room.pricing_mode.allows_bed_booking() {
                Some(ConflictReason::CapabilityDisabled)
            } else {
                None
            };
            can_reserve_bed.insert(bed.id, block.is_none());
            if let Some(reason) = block {
                bed_blocks.insert(bed.id, reason);
            }
        }

        let block = if locked {
            Some(ConflictReason::ApartmentLocked)
        } else if room_locked {
            Some(ConflictReason::BedroomLocked)
        } else if any_bed_taken {
            Some(ConflictReason::BedTaken)
        } else if !caps.allows(Granularity::Bedroom) || !room.pricing_mode.allows_bedroom_booking() {
            Some(ConflictReason::CapabilityDisabled)
        } else {
            None
        };
        can_reserve_bedroom.insert(room.id, block.is_none());
        if let Some(reason) = block {
            bedroom_blocks.insert(room.id, reason);
        }
    }

    let apartment_block = if locked {
        Some((ConflictReason::ApartmentLocked, REASON_APARTMENT_LOCKED))
    } else if !apartment.is_listed() {
        Some((ConflictReason::CapabilityDisabled, REASON_UNLISTED))
    } else if !caps.allows(Granularity::Apartment) {
        Some((ConflictReason::CapabilityDisabled, REASON_FULL_DISABLED))
    } else if !claims.beds.is_empty() {
        Some((ConflictReason::BedTaken, REASON_BEDS_RESERVED))
    } else if !claims.bedrooms.is_empty() {
        Some((ConflictReason::BedroomLocked, REASON_BEDROOMS_RESERVED))
    } else {
        None
    };

    let available_bedrooms_count = can_reserve_bedroom.values().filter(|v| **v).count();
    let available_beds_count = can_reserve_bed.values().filter(|v| **v).count();

    AvailabilityView {
        apartment_id: apartment.id,
        listed: apartment.is_listed(),
        apartment_reservable: apartment_block.is_none(),
        is_apartment_locked: locked,
        has_any_bed_reserved: !claims.beds.is_empty(),
        has_any_bedroom_reserved: !claims.bedrooms.is_empty(),
        available_bedrooms_count,
        total_bedrooms_count: apartment.bedrooms.len(),
        available_beds_count,
        total_beds_count: apartment.bed_count(),
        reason: apartment_block.map(|(_, r)| r.to_string()),
        apartment_block: apartment_block.map(|(code, _)| code),
        integrity: claims.integrity(apartment),
        can_reserve_bedroom,
        can_reserve_bed,
        bedroom_blocks,
        bed_blocks,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bed(label: &str) -> Bed {
        Bed {
            id: Ulid::new(),
            label: label.into(),
            bed_type: Some("single".into()),
            monthly_price: 50_000,
            deposit: 50_000,
            capacity: 1,
        }
    }

    fn room(beds: usize, mode: PricingMode) -> Bedroom {
        let mut r = Bedroom::new(Ulid::new(), beds.max(1) as u32, beds.max(1) as u32 + 1, true, mode);
        for i in 0..beds {
            r.beds.push(bed(&format!("bed {i}")));
        }
        r
    }

    /// Scenario apartment: R1 with 2 beds, R2 with 1 bed, everything enabled.
    fn two_room_apartment() -> Apartment {
        let mut apt = Apartment::new(Ulid::new(), Some("A".into()), 3, vec![1, 2, 3], Capabilities::all());
        apt.bedrooms.push(room(2, PricingMode::Both));
        apt.bedrooms.push(room(1, PricingMode::Both));
        apt
    }

    fn reservation(apt: &Apartment, granularity: Granularity, target_id: Ulid) -> Reservation {
        Reservation {
            id: Ulid::new(),
            apartment_id: apt.id,
            granularity,
            target_id,
            holder_id: "holder".into(),
            status: ReservationStatus::Active,
            created_at: 0,
            cancelled_at: None,
        }
    }

    fn assert_counts_consistent(view: &AvailabilityView) {
        assert_eq!(
            view.available_beds_count,
            view.can_reserve_bed.values().filter(|v| **v).count()
        );
        assert_eq!(
            view.available_bedrooms_count,
            view.can_reserve_bedroom.values().filter(|v| **v).count()
        );
        for (id, ok) in &view.can_reserve_bed {
            assert_eq!(!ok, view.bed_blocks.contains_key(id));
        }
        for (id, ok) in &view.can_reserve_bedroom {
            assert_eq!(!ok, view.bedroom_blocks.contains_key(id));
        }
    }

    #[test]
    fn empty_apartment_everything_available() {
        let apt = two_room_apartment();
        let view = derive_availability(&apt, &[]);
        assert!(view.apartment_reservable);
        assert!(!view.is_apartment_locked);
        assert_eq!(view.available_bedrooms_count, 2);
        assert_eq!(view.total_bedrooms_count, 2);
        assert_eq!(view.available_beds_count, 3);
        assert_eq!(view.total_beds_count, 3);
        assert_eq!(view.reason, None);
        assert!(view.integrity.is_empty());
        assert_counts_consistent(&view);
    }

    #[test]
    fn bed_reservation_blocks_room_and_apartment() {
        let apt = two_room_apartment();
        let r1 = &apt.bedrooms[0];
        let b1 = r1.beds[0].id;
        let res = [reservation(&apt, Granularity::Bed, b1)];
        let view = derive_availability(&apt, &res);

        assert_eq!(view.can_reserve_bed[&b1], false);
        assert_eq!(view.bed_blocks[&b1], ConflictReason::BedTaken);
        assert_eq!(view.can_reserve_bed[&r1.beds[1].id], true);
        assert_eq!(view.can_reserve_bedroom[&r1.id], false);
        assert_eq!(view.bedroom_blocks[&r1.id], ConflictReason::BedTaken);
        assert_eq!(view.can_reserve_bedroom[&apt.bedrooms[1].id], true);
        assert!(!view.apartment_reservable);
        assert_eq!(view.reason.as_deref(), Some(REASON_BEDS_RESERVED));
        assert_eq!(view.apartment_block, Some(ConflictReason::BedTaken));
        assert!(view.has_any_bed_reserved);
        assert!(!view.has_any_bedroom_reserved);
        assert_counts_consistent(&view);
    }

    #[test]
    fn bedroom_reservation_propagates_to_beds() {
        let apt = two_room_apartment();
        let r1 = &apt.bedrooms[0];
        let res = [reservation(&apt, Granularity::Bedroom, r1.id)];
        let view = derive_availability(&apt, &res);

        for b in &r1.beds {
            assert_eq!(view.can_reserve_bed[&b.id], false);
            assert_eq!(view.bed_blocks[&b.id], ConflictReason::BedroomLocked);
        }
        assert_eq!(view.can_reserve_bedroom[&r1.id], false);
        assert_eq!(view.bedroom_blocks[&r1.id], ConflictReason::BedroomLocked);
        assert_eq!(view.available_beds_count, 1);
        assert_eq!(view.available_bedrooms_count, 1);
        assert_eq!(view.reason.as_deref(), Some(REASON_BEDROOMS_RESERVED));
        assert_eq!(view.apartment_block, Some(ConflictReason::BedroomLocked));
        assert_counts_consistent(&view);
    }

    #[test]
    fn bed_and_bedroom_in_different_rooms() {
        let apt = two_room_apartment();
        let b1 = apt.bedrooms[0].beds[0].id;
        let r2 = &apt.bedrooms[1];
        let res = [
            reservation(&apt, Granularity::Bed, b1),
            reservation(&apt, Granularity::Bedroom, r2.id),
        ];
        let view = derive_availability(&apt, &res);
        assert_eq!(view.can_reserve_bed[&r2.beds[0].id], false);
        assert_eq!(view.available_bedrooms_count, 0);
        assert_eq!(view.available_beds_count, 1);
        assert!(view.has_any_bed_reserved && view.has_any_bedroom_reserved);
        // Beds take precedence in the human-readable reason.
        assert_eq!(view.reason.as_deref(), Some(REASON_BEDS_RESERVED));
        assert!(view.integrity.is_empty());
        assert_counts_consistent(&view);
    }

    #[test]
    fn apartment_lock_blocks_everything() {
        let apt = two_room_apartment();
        let res = [reservation(&apt, Granularity::Apartment, apt.id)];
        let view = derive_availability(&apt, &res);

        assert!(view.is_apartment_locked);
        assert!(!view.apartment_reservable);
        assert_eq!(view.reason.as_deref(), Some(REASON_APARTMENT_LOCKED));
        assert!(view.can_reserve_bedroom.values().all(|v| !v));
        assert!(view.can_reserve_bed.values().all(|v| !v));
        assert!(view.bed_blocks.values().all(|r| *r == ConflictReason::ApartmentLocked));
        assert_eq!(view.available_beds_count, 0);
        assert_eq!(view.available_bedrooms_count, 0);
        assert!(view.integrity.is_empty());
        assert_counts_consistent(&view);
    }

    #[test]
    fn cancelled_reservations_ignored() {
        let apt = two_room_apartment();
        let mut r = reservation(&apt, Granularity::Apartment, apt.id);
        r.status = ReservationStatus::Cancelled;
        r.cancelled_at = Some(10);
        let view = derive_availability(&apt, &[r]);
        assert!(view.apartment_reservable);
        assert_eq!(view.available_beds_count, 3);
    }

    #[test]
    fn other_apartments_ignored() {
        let apt = two_room_apartment();
        let other = two_room_apartment();
        let res = [reservation(&other, Granularity::Apartment, other.id)];
        let view = derive_availability(&apt, &res);
        assert!(view.apartment_reservable);
    }

    #[test]
    fn unknown_target_ignored() {
        let apt = two_room_apartment();
        let res = [reservation(&apt, Granularity::Bed, Ulid::new())];
        let view = derive_availability(&apt, &res);
        assert!(view.apartment_reservable);
        assert!(!view.has_any_bed_reserved);
    }

    #[test]
    fn zero_bed_bedroom_bedroom_level_only() {
        let mut apt = two_room_apartment();
        let empty = room(0, PricingMode::Both);
        let empty_id = empty.id;
        apt.bedrooms.push(empty);
        let view = derive_availability(&apt, &[]);
        assert_eq!(view.can_reserve_bedroom[&empty_id], true);
        assert_eq!(view.total_bedrooms_count, 3);
        assert_eq!(view.total_beds_count, 3);
        assert_counts_consistent(&view);
    }

    #[test]
    fn per_bedroom_beds_not_independently_reservable() {
        let mut apt = two_room_apartment();
        apt.bedrooms[0].pricing_mode = PricingMode::PerBedroom;
        let view = derive_availability(&apt, &[]);
        for b in &apt.bedrooms[0].beds {
            assert_eq!(view.can_reserve_bed[&b.id], false);
            assert_eq!(view.bed_blocks[&b.id], ConflictReason::CapabilityDisabled);
        }
        assert_eq!(view.can_reserve_bedroom[&apt.bedrooms[0].id], true);
        assert_counts_consistent(&view);
    }

    #[test]
    fn per_bed_room_not_reservable_whole() {
        let mut apt = two_room_apartment();
        apt.bedrooms[1].pricing_mode = PricingMode::PerBed;
        let view = derive_availability(&apt, &[]);
        let r2 = apt.bedrooms[1].id;
        assert_eq!(
            view.check(Granularity::Bedroom, r2),
            Err(ConflictReason::CapabilityDisabled)
        );
        assert!(view.is_reservable(Granularity::Bed, apt.bedrooms[1].beds[0].id));
    }

    #[test]
    fn capability_flags_respected() {
        let mut apt = two_room_apartment();
        apt.capabilities.allow_full_reservation = false;
        apt.capabilities.allow_bed_reservation = false;
        let view = derive_availability(&apt, &[]);
        assert!(!view.apartment_reservable);
        assert_eq!(view.reason.as_deref(), Some(REASON_FULL_DISABLED));
        assert_eq!(view.apartment_block, Some(ConflictReason::CapabilityDisabled));
        assert_eq!(view.available_beds_count, 0);
        assert_eq!(view.available_bedrooms_count, 2);
        assert!(view.listed);
    }

    #[test]
    fn unlisted_apartment_reserves_nothing() {
        let mut apt = two_room_apartment();
        apt.capabilities = Capabilities::default();
        let view = derive_availability(&apt, &[]);
        assert!(!view.listed);
        assert_eq!(view.reason.as_deref(), Some(REASON_UNLISTED));
        assert_eq!(view.available_beds_count + view.available_bedrooms_count, 0);
        assert_counts_consistent(&view);
    }

    #[test]
    fn conflicting_history_lock_wins_and_reports() {
        let apt = two_room_apartment();
        let whole = reservation(&apt, Granularity::Apartment, apt.id);
        let bed_res = reservation(&apt, Granularity::Bed, apt.bedrooms[1].beds[0].id);
        let res = [whole.clone(), bed_res.clone()];
        let view = derive_availability(&apt, &res);

        assert!(view.is_apartment_locked);
        assert!(view.can_reserve_bed.values().all(|v| !v));
        assert!(view.has_integrity_violation());
        assert_eq!(view.integrity.len(), 1);
        assert_eq!(view.integrity[0].kind, IntegrityKind::ApartmentAndSubUnit);
        assert!(view.integrity[0].reservation_ids.contains(&whole.id));
        assert!(view.integrity[0].reservation_ids.contains(&bed_res.id));
    }

    #[test]
    fn bedroom_and_bed_in_same_room_reported() {
        let apt = two_room_apartment();
        let r1 = &apt.bedrooms[0];
        let res = [
            reservation(&apt, Granularity::Bedroom, r1.id),
            reservation(&apt, Granularity::Bed, r1.beds[1].id),
        ];
        let view = derive_availability(&apt, &res);
        assert_eq!(view.bedroom_blocks[&r1.id], ConflictReason::BedroomLocked);
        assert_eq!(view.integrity.len(), 1);
        assert_eq!(view.integrity[0].kind, IntegrityKind::BedroomAndBed);
        assert_eq!(view.integrity[0].reservation_ids.len(), 2);
    }

    #[test]
    fn two_claims_on_one_bed_reported() {
        let apt = two_room_apartment();
        let bed = apt.bedrooms[0].beds[0].id;
        let first = reservation(&apt, Granularity::Bed, bed);
        let second = reservation(&apt, Granularity::Bed, bed);
        let view = derive_availability(&apt, [&first, &second]);

        assert_eq!(view.bed_blocks[&bed], ConflictReason::BedTaken);
        assert_eq!(view.integrity.len(), 1);
        assert_eq!(view.integrity[0].kind, IntegrityKind::DuplicateClaim);
        let mut expected = vec![first.id, second.id];
        expected.sort();
        assert_eq!(view.integrity[0].reservation_ids, expected);
    }

    #[test]
    fn check_maps_unknown_units_to_capability_disabled() {
        let apt = two_room_apartment();
        let view = derive_availability(&apt, &[]);
        assert_eq!(
            view.check(Granularity::Bed, Ulid::new()),
            Err(ConflictReason::CapabilityDisabled)
        );
        assert!(view.check(Granularity::Apartment, apt.id).is_ok());
        assert!(view.check(Granularity::Apartment, Ulid::new()).is_err());
    }

    #[test]
    fn derivation_is_deterministic() {
        let apt = two_room_apartment();
        let res = [reservation(&apt, Granularity::Bed, apt.bedrooms[0].beds[1].id)];
        assert_eq!(derive_availability(&apt, &res), derive_availability(&apt, &res));
    }

    #[test]
    fn mutual_exclusion_holds_for_every_single_claim() {
        // Any one sub-unit claim rules out the whole apartment, and the apartment
        // claim rules out every sub-unit.
        let apt = two_room_apartment();
        let mut targets: Vec<(Granularity, Ulid)> = Vec::new();
        for room in &apt.bedrooms {
            targets.push((Granularity::Bedroom, room.id));
            for b in &room.beds {
                targets.push((Granularity::Bed, b.id));
            }
        }
        for (g, id) in targets {
            let view = derive_availability(&apt, &[reservation(&apt, g, id)]);
            assert!(!view.apartment_reservable, "{g} {id} should block the apartment");
            assert_counts_consistent(&view);
        }
    }
}
