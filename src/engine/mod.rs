mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
mod store;
#[cfg(test)]
mod tests;

pub use availability::{derive_availability, AvailabilityView, IntegrityViolation};
pub use conflict::{ConflictReason, ReservationConflict, ReserveRequest};
pub use error::EngineError;
pub use store::{ApartmentSnapshot, ApartmentState};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::limits::MAX_COMMIT_ATTEMPTS;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedApartmentState = Arc<RwLock<ApartmentState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break, // channel empty, flush batch
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let result = wal.append_buffered(&event).and_then(|()| wal.flush_sync());
            let _ = response.send(result);
        }
    }
}

pub struct Engine {
    pub(super) apartments: DashMap<Ulid, SharedApartmentState>,
    /// Last committed snapshot per apartment, read without touching the lock.
    pub(super) snapshots: DashMap<Ulid, Arc<ApartmentSnapshot>>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: reservation id → apartment id
    pub(super) reservation_index: DashMap<Ulid, Ulid>,
    /// Reverse lookup: bedroom/bed id → apartment id
    pub(super) unit_index: DashMap<Ulid, Ulid>,
    /// Shared by every write transaction, taken exclusively by compaction.
    pub(super) commit_gate: RwLock<()>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        // Rebuild plain state first; nothing else can see it yet, so no locks.
        let mut rebuilt: HashMap<Ulid, ApartmentState> = HashMap::new();
        for event in &events {
            match event {
                Event::ApartmentCreated {
                    id,
                    name,
                    max_capacity,
                    enabled_capacities,
                    capabilities,
                } => {
                    let apt = Apartment::new(*id, name.clone(), *max_capacity, enabled_capacities.clone(), *capabilities);
                    rebuilt.insert(*id, ApartmentState::new(apt));
                }
                Event::ApartmentDeleted { id } => {
                    rebuilt.remove(id);
                }
                other => {
                    if let Some(st) = rebuilt.get_mut(&other.apartment_id()) {
                        st.apply_event(other);
                    }
                }
            }
        }

        let engine = Self {
            apartments: DashMap::new(),
            snapshots: DashMap::new(),
            wal_tx,
            notify,
            reservation_index: DashMap::new(),
            unit_index: DashMap::new(),
            commit_gate: RwLock::new(()),
        };
        for (id, st) in rebuilt {
            engine.install(id, st);
        }
        tracing::info!(
            "engine ready: {} apartments, {} events replayed",
            engine.apartments.len(),
            events.len()
        );
        Ok(engine)
    }

    /// Register a fully built apartment state with all indexes.
    fn install(&self, id: Ulid, st: ApartmentState) {
        for unit in st.apartment.unit_ids() {
            self.unit_index.insert(unit, id);
        }
        for r in st.reservations() {
            self.reservation_index.insert(r.id, id);
        }
        self.snapshots.insert(id, Arc::new(st.snapshot()));
        self.apartments.insert(id, Arc::new(RwLock::new(st)));
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL append, retried up to `MAX_COMMIT_ATTEMPTS` in total. A frame
    /// from a failed attempt may still have reached disk; replay keeps the
    /// first copy. The last failure surfaces as transient.
    pub(super) async fn wal_append_retrying(&self, event: &Event) -> Result<(), EngineError> {
        let mut attempt = 1;
        loop {
            match self.wal_append(event).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= MAX_COMMIT_ATTEMPTS => return Err(EngineError::Transient(e.to_string())),
                Err(e) => {
                    tracing::warn!("WAL append failed (attempt {attempt}), retrying: {e}");
                    metrics::counter!(crate::observability::TRANSIENT_RETRIES_TOTAL).increment(1);
                    attempt += 1;
                }
            }
        }
    }

    pub fn get_apartment(&self, id: &Ulid) -> Option<SharedApartmentState> {
        self.apartments.get(id).map(|e| e.value().clone())
    }

    pub fn get_snapshot(&self, id: &Ulid) -> Option<Arc<ApartmentSnapshot>> {
        self.snapshots.get(id).map(|e| e.value().clone())
    }

    pub fn apartment_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_index.get(reservation_id).map(|e| *e.value())
    }

    pub fn apartment_for_unit(&self, unit_id: &Ulid) -> Option<Ulid> {
        self.unit_index.get(unit_id).map(|e| *e.value())
    }

    /// Apply a committed event, update the indexes and publish a fresh snapshot.
    /// Caller holds the apartment's write lock and has already persisted `event`.
    pub(super) fn apply_committed(&self, st: &mut ApartmentState, event: &Event) {
        st.apply_event(event);
        match event {
            Event::BedroomAdded { id, apartment_id, .. } | Event::BedAdded { id, apartment_id, .. } => {
                self.unit_index.insert(*id, *apartment_id);
            }
            Event::ReservationCreated { id, apartment_id, .. } => {
                self.reservation_index.insert(*id, *apartment_id);
            }
            _ => {}
        }
        self.snapshots.insert(st.id(), Arc::new(st.snapshot()));
    }
}
