use std::sync::Arc;

use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::*;
use crate::observability as obs;

use super::availability::{AvailabilityView, IntegrityViolation};
use super::store::ApartmentSnapshot;
use super::{Engine, EngineError};

impl Engine {
    /// Availability of every unit in an apartment, derived from the last
    /// committed snapshot. Never waits on a writer.
    pub fn get_availability(&self, apartment_id: Ulid) -> Result<AvailabilityView, EngineError> {
        self.get_availability_detail(apartment_id).map(|(_, view)| view)
    }

    /// Availability together with the snapshot it was derived from, for
    /// callers that also need the inventory the view refers to.
    pub fn get_availability_detail(
        &self,
        apartment_id: Ulid,
    ) -> Result<(Arc<ApartmentSnapshot>, AvailabilityView), EngineError> {
        let snap = self
            .get_snapshot(&apartment_id)
            .ok_or(EngineError::NotFound(apartment_id))?;
        let view = snap.availability();
        if view.has_integrity_violation() {
            self.report_integrity(&view);
        }
        Ok((snap, view))
    }

    /// Overlapping active claims in an apartment. Empty when storage is sound.
    pub fn check_integrity(&self, apartment_id: Ulid) -> Result<Vec<IntegrityViolation>, EngineError> {
        Ok(self.get_availability(apartment_id)?.integrity)
    }

    /// Surface overlapping claims to operators. Availability stays blocked
    /// on both sides, nothing is auto-repaired.
    pub(super) fn report_integrity(&self, view: &AvailabilityView) {
        for violation in &view.integrity {
            metrics::counter!(obs::INTEGRITY_WARNINGS_TOTAL).increment(1);
            tracing::error!(
                "integrity violation in apartment {}: {:?} across reservations {:?}",
                view.apartment_id,
                violation.kind,
                violation.reservation_ids
            );
            self.notify.send(&DomainEvent::IntegrityWarning {
                apartment_id: view.apartment_id,
                kind: violation.kind,
                reservation_ids: violation.reservation_ids.clone(),
            });
        }
    }

    /// Committed events for one existing apartment.
    pub fn subscribe(&self, apartment_id: Ulid) -> Result<broadcast::Receiver<DomainEvent>, EngineError> {
        if !self.apartments.contains_key(&apartment_id) {
            return Err(EngineError::NotFound(apartment_id));
        }
        Ok(self.notify.subscribe(apartment_id))
    }

    /// Inventory of one apartment as of the last commit.
    pub fn get_inventory(&self, apartment_id: Ulid) -> Result<Apartment, EngineError> {
        self.get_snapshot(&apartment_id)
            .map(|snap| snap.apartment.clone())
            .ok_or(EngineError::NotFound(apartment_id))
    }

    pub fn list_apartments(&self) -> Vec<ApartmentInfo> {
        let mut out: Vec<ApartmentInfo> = self
            .snapshots
            .iter()
            .map(|entry| {
                let snap = entry.value();
                let apt = &snap.apartment;
                ApartmentInfo {
                    id: apt.id,
                    name: apt.name.clone(),
                    max_capacity: apt.max_capacity,
                    capabilities: apt.capabilities,
                    bedrooms: apt.bedrooms.len(),
                    beds: apt.bed_count(),
                    active_reservations: snap.active.len(),
                }
            })
            .collect();
        out.sort_by_key(|a| a.id);
        out
    }

    /// Full reservation history of an apartment, active and cancelled, in
    /// creation order.
    pub async fn get_reservations(&self, apartment_id: Ulid) -> Result<Vec<Reservation>, EngineError> {
        let rs = self
            .get_apartment(&apartment_id)
            .ok_or(EngineError::NotFound(apartment_id))?;
        let guard = rs.read().await;
        Ok(guard.reservations().to_vec())
    }

    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let apartment_id = self.apartment_for_reservation(&id).ok_or(EngineError::NotFound(id))?;
        let rs = self
            .get_apartment(&apartment_id)
            .ok_or(EngineError::NotFound(id))?;
        let guard = rs.read().await;
        guard.reservation(&id).cloned().ok_or(EngineError::NotFound(id))
    }
}
