use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, OwnedRwLockWriteGuard, RwLock, RwLockReadGuard};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability as obs;

use super::conflict::*;
use super::store::ApartmentState;
use super::{Engine, EngineError, SharedApartmentState, WalCommand};

/// Held for the duration of one write transaction: the shared commit gate
/// (excludes compaction) plus the apartment's exclusive lock.
struct TxScope<'a> {
    _gate: RwLockReadGuard<'a, ()>,
    state: OwnedRwLockWriteGuard<ApartmentState>,
}

impl Engine {
    /// Enter the write scope for one apartment. Gate first, then apartment,
    /// always in that order.
    async fn begin(&self, rs: SharedApartmentState) -> TxScope<'_> {
        let gate = self.commit_gate.read().await;
        let state = rs.write_owned().await;
        TxScope { _gate: gate, state }
    }

    async fn begin_with_timeout(
        &self,
        rs: SharedApartmentState,
        lock_timeout: Option<Duration>,
    ) -> Result<TxScope<'_>, EngineError> {
        match lock_timeout {
            Some(t) => tokio::time::timeout(t, self.begin(rs))
                .await
                .map_err(|_| EngineError::Timeout),
            None => Ok(self.begin(rs).await),
        }
    }

    /// Lookup apartment and enter its write scope. Fails if it was deleted
    /// while we waited.
    async fn begin_apartment(&self, apartment_id: Ulid) -> Result<TxScope<'_>, EngineError> {
        let rs = self
            .get_apartment(&apartment_id)
            .ok_or(EngineError::NotFound(apartment_id))?;
        let tx = self.begin(rs).await;
        if !self.apartments.contains_key(&apartment_id) {
            return Err(EngineError::NotFound(apartment_id));
        }
        Ok(tx)
    }

    /// WAL-append + apply in one call.
    async fn persist_and_apply(&self, st: &mut ApartmentState, event: &Event) -> Result<(), EngineError> {
        self.wal_append_retrying(event).await?;
        self.apply_committed(st, event);
        Ok(())
    }

    fn ensure_unused_id(&self, id: Ulid) -> Result<(), EngineError> {
        if self.apartments.contains_key(&id) || self.unit_index.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        Ok(())
    }

    // ── Inventory ────────────────────────────────────────────

    pub async fn create_apartment(
        &self,
        id: Ulid,
        name: Option<String>,
        max_capacity: u32,
        enabled_capacities: Vec<u32>,
        capabilities: Capabilities,
    ) -> Result<(), EngineError> {
        if self.apartments.len() >= MAX_APARTMENTS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many apartments"));
        }
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN {
                return Err(EngineError::LimitExceeded("apartment name too long"));
            }
        validate_capacities(max_capacity, &enabled_capacities)?;

        let _gate = self.commit_gate.read().await;
        self.ensure_unused_id(id)?;

        let event = Event::ApartmentCreated {
            id,
            name: name.clone(),
            max_capacity,
            enabled_capacities: enabled_capacities.clone(),
            capabilities,
        };
        self.wal_append_retrying(&event).await?;
        let st = ApartmentState::new(Apartment::new(id, name, max_capacity, enabled_capacities, capabilities));
        self.snapshots.insert(id, Arc::new(st.snapshot()));
        self.apartments.insert(id, Arc::new(RwLock::new(st)));
        if !capabilities.any() {
            tracing::warn!("apartment {id} created with no reservation capability; it will not be listed");
        }
        tracing::info!("apartment {id} created");
        Ok(())
    }

    pub async fn add_bedroom(
        &self,
        id: Ulid,
        apartment_id: Ulid,
        base_capacity: u32,
        max_capacity: u32,
        allow_extra_beds: bool,
        pricing_mode: PricingMode,
    ) -> Result<(), EngineError> {
        validate_bedroom(base_capacity, max_capacity)?;
        let mut tx = self.begin_apartment(apartment_id).await?;
        self.ensure_unused_id(id)?;
        if tx.state.apartment.bedrooms.len() >= MAX_BEDROOMS_PER_APARTMENT {
            return Err(EngineError::LimitExceeded("too many bedrooms in apartment"));
        }

        let event = Event::BedroomAdded {
            id,
            apartment_id,
            base_capacity,
            max_capacity,
            allow_extra_beds,
            pricing_mode,
        };
        self.persist_and_apply(&mut tx.state, &event).await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn add_bed(
        &self,
        id: Ulid,
        bedroom_id: Ulid,
        label: String,
        bed_type: Option<String>,
        monthly_price: u64,
        deposit: u64,
        capacity: u32,
    ) -> Result<(), EngineError> {
        if label.len() > MAX_LABEL_LEN || bed_type.as_ref().is_some_and(|t| t.len() > MAX_LABEL_LEN) {
            return Err(EngineError::LimitExceeded("bed label too long"));
        }
        let apartment_id = self
            .apartment_for_unit(&bedroom_id)
            .ok_or(EngineError::NotFound(bedroom_id))?;
        let mut tx = self.begin_apartment(apartment_id).await?;
        self.ensure_unused_id(id)?;
        let room = tx
            .state
            .apartment
            .bedroom(&bedroom_id)
            .ok_or(EngineError::NotFound(bedroom_id))?;
        validate_bed_fits(room, capacity)
            .inspect_err(|e| tracing::warn!("bed {id} rejected for bedroom {bedroom_id}: {e}"))?;
        if tx.state.active_reservations().any(|r| r.target_id == bedroom_id) {
            // The running bedroom contract covers the new bed as well.
            tracing::info!("bed {id} added to reserved bedroom {bedroom_id}; it inherits the bedroom lock");
        }

        let event = Event::BedAdded {
            id,
            apartment_id,
            bedroom_id,
            label,
            bed_type,
            monthly_price,
            deposit,
            capacity,
        };
        self.persist_and_apply(&mut tx.state, &event).await
    }

    /// Toggle reservation granularities. Existing reservations are untouched;
    /// only future attempts see the new flags.
    pub async fn set_capabilities(&self, apartment_id: Ulid, capabilities: Capabilities) -> Result<(), EngineError> {
        let mut tx = self.begin_apartment(apartment_id).await?;
        if tx.state.apartment.capabilities == capabilities {
            return Ok(());
        }
        let event = Event::CapabilitiesChanged { apartment_id, capabilities };
        self.persist_and_apply(&mut tx.state, &event).await
    }

    /// Delete an apartment with all its bedrooms, beds and (cancelled) history.
    pub async fn delete_apartment(&self, id: Ulid) -> Result<(), EngineError> {
        let tx = self.begin_apartment(id).await?;
        if tx.state.active_count() > 0 {
            return Err(EngineError::HasActiveReservations(id));
        }

        let event = Event::ApartmentDeleted { id };
        self.wal_append_retrying(&event).await?;
        for unit in tx.state.apartment.unit_ids() {
            self.unit_index.remove(&unit);
        }
        for r in tx.state.reservations() {
            self.reservation_index.remove(&r.id);
        }
        self.apartments.remove(&id);
        self.snapshots.remove(&id);
        self.notify.remove(&id);
        tracing::info!("apartment {id} deleted");
        Ok(())
    }

    // ── Reservations ─────────────────────────────────────────

    /// The only way to create a reservation. Availability is re-derived
    /// inside the apartment's write scope; the caller's view is never trusted.
    pub async fn attempt_reserve(&self, req: ReserveRequest) -> Result<Reservation, EngineError> {
        self.reserve(req, None).await
    }

    /// Like [`Engine::attempt_reserve`], but gives up with
    /// [`EngineError::Timeout`] if the write scope isn't entered within
    /// `lock_timeout`. Once entered, the commit always runs to completion.
    pub async fn attempt_reserve_with_timeout(
        &self,
        req: ReserveRequest,
        lock_timeout: Duration,
    ) -> Result<Reservation, EngineError> {
        self.reserve(req, Some(lock_timeout)).await
    }

    async fn reserve(&self, req: ReserveRequest, lock_timeout: Option<Duration>) -> Result<Reservation, EngineError> {
        let started = Instant::now();
        let result = self.reserve_in_scope(&req, lock_timeout).await;

        let outcome = match &result {
            Ok(_) => "created",
            Err(EngineError::Conflict(c)) => {
                metrics::counter!(obs::CONFLICTS_TOTAL, "reason" => c.reason.as_str()).increment(1);
                tracing::debug!("reservation {} rejected: {c}", req.id);
                "conflict"
            }
            Err(EngineError::Timeout) => "timeout",
            Err(EngineError::Transient(e)) => {
                tracing::warn!("reservation {} failed after retry: {e}", req.id);
                "transient"
            }
            Err(_) => "rejected",
        };
        metrics::counter!(obs::RESERVATIONS_TOTAL, "outcome" => outcome).increment(1);
        metrics::histogram!(obs::RESERVE_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        result
    }

    async fn reserve_in_scope(
        &self,
        req: &ReserveRequest,
        lock_timeout: Option<Duration>,
    ) -> Result<Reservation, EngineError> {
        validate_request(req)?;
        let rs = self
            .get_apartment(&req.apartment_id)
            .ok_or(EngineError::NotFound(req.apartment_id))?;
        // Units are never removed from a live apartment, so the last snapshot
        // is good enough to reject unknown targets before taking the lock.
        if let Some(snap) = self.get_snapshot(&req.apartment_id) {
            validate_target(&snap.apartment, req)?;
        }

        let mut tx = self.begin_with_timeout(rs, lock_timeout).await?;
        if !self.apartments.contains_key(&req.apartment_id) {
            return Err(EngineError::NotFound(req.apartment_id));
        }
        let st = &mut tx.state;
        validate_target(&st.apartment, req)?;

        if let Some(existing) = st.reservation(&req.id) {
            // A retry of a request that already committed.
            return if existing.is_active() && req.matches(existing) {
                Ok(existing.clone())
            } else {
                Err(EngineError::AlreadyExists(req.id))
            };
        }
        if self.reservation_index.contains_key(&req.id) {
            return Err(EngineError::AlreadyExists(req.id));
        }
        if st.reservations().len() >= MAX_RESERVATIONS_PER_APARTMENT {
            return Err(EngineError::LimitExceeded("too many reservations on apartment"));
        }

        let view = st.availability();
        if view.has_integrity_violation() {
            self.report_integrity(&view);
        }
        view.check(req.granularity, req.target_id).map_err(|reason| {
            EngineError::Conflict(ReservationConflict {
                apartment_id: req.apartment_id,
                granularity: req.granularity,
                target_id: req.target_id,
                reason,
            })
        })?;

        // Storage backstop. Nothing changes under the lock, so a disagreement
        // with the view is a storage fault, not a lost race: surface it as
        // transient without another attempt.
        if let Err(reason) = st.check_claim(req.granularity, req.target_id) {
            tracing::warn!(
                "claim index rejected {} {} ({reason}) after availability check passed",
                req.granularity,
                req.target_id
            );
            return Err(EngineError::Transient(format!("claim index rejected reservation: {reason}")));
        }

        let event = Event::ReservationCreated {
            id: req.id,
            apartment_id: req.apartment_id,
            granularity: req.granularity,
            target_id: req.target_id,
            holder_id: req.holder_id.clone(),
            created_at: now_ms(),
        };
        self.wal_append_retrying(&event).await?;
        self.apply_committed(st, &event);

        let reservation = st
            .reservation(&req.id)
            .cloned()
            .ok_or_else(|| EngineError::Transient("reservation missing after commit".into()))?;
        self.notify.send(&DomainEvent::ReservationCreated {
            reservation_id: reservation.id,
            apartment_id: reservation.apartment_id,
            granularity: reservation.granularity,
            target_id: reservation.target_id,
            holder_id: reservation.holder_id.clone(),
        });
        tracing::info!(
            "reservation {} created: {} {} in apartment {} for {}",
            reservation.id,
            reservation.granularity,
            reservation.target_id,
            reservation.apartment_id,
            reservation.holder_id
        );
        Ok(reservation)
    }

    /// Flip a reservation to cancelled. Cancelling an already-cancelled
    /// reservation succeeds without writing anything.
    pub async fn cancel_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let apartment_id = self.apartment_for_reservation(&id).ok_or(EngineError::NotFound(id))?;
        let mut tx = self.begin_apartment(apartment_id).await?;
        let st = &mut tx.state;
        let current = st.reservation(&id).cloned().ok_or(EngineError::NotFound(id))?;
        if !current.is_active() {
            tracing::debug!("reservation {id} already cancelled");
            return Ok(current);
        }

        let event = Event::ReservationCancelled {
            id,
            apartment_id,
            cancelled_at: now_ms(),
        };
        self.persist_and_apply(st, &event).await?;
        self.notify.send(&DomainEvent::ReservationCancelled {
            reservation_id: id,
            apartment_id,
        });
        metrics::counter!(obs::CANCELLATIONS_TOTAL).increment(1);
        tracing::info!("reservation {id} cancelled");
        st.reservation(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    /// Holds the commit gate exclusively, so no transaction is between its WAL
    /// append and its in-memory apply while the snapshot is taken.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;

        let states: Vec<SharedApartmentState> = self.apartments.iter().map(|e| e.value().clone()).collect();
        let mut events = Vec::new();
        for rs in states {
            let guard = rs.read().await;
            events.extend(guard.to_events());
        }
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        tracing::info!("WAL compacted to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
