mod availability;
mod conflict;
mod error;
mod lifecycle;
mod queries;
mod registry;
#[cfg(test)]
mod tests;

pub use availability::{merge_overlapping, subtract_intervals};
pub use conflict::find_conflict;
pub(crate) use conflict::now_ms;
pub use error::EngineError;

use std::io;
use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use tracing::{error, warn};
use ulid::{Generator, Ulid};

use crate::model::*;
use crate::wal::Wal;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;
type ResourceGuard = OwnedRwLockWriteGuard<ResourceState>;

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
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

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// Blocks for the first append, drains whatever else is already queued,
/// then pays for a single fsync on behalf of the whole batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        flush_and_respond(&mut wal, &mut batch);
        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();

    let mut result = Ok(());
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            result = Err(e);
            break;
        }
    }
    // Always flush, even after an append error, so partially buffered
    // bytes are not smuggled into the next batch.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            flush_and_respond(wal, &mut vec![(event, response)]);
        }
    }
}

/// One facility's reservation book: resources, reservations, and the
/// per-resource occupancy index, optionally journaled to a WAL.
pub struct Engine {
    resources: DashMap<ResourceId, SharedResourceState>,
    /// Records are replaced whole, so readers never see half an update.
    reservations: DashMap<Ulid, Reservation>,
    /// Serializes transitions of a single reservation.
    gates: DashMap<Ulid, Arc<Mutex<()>>>,
    /// Makes the registry's uniqueness check and insert one step.
    registry_lock: Mutex<()>,
    /// Shared by every writer; compaction takes it exclusively.
    commit_lock: RwLock<()>,
    id_gen: std::sync::Mutex<Generator>,
    wal_tx: Option<mpsc::Sender<WalCommand>>,
}

impl Engine {
    /// Engine with no journal. State lives and dies with the value.
    pub fn in_memory() -> Self {
        Self {
            resources: DashMap::new(),
            reservations: DashMap::new(),
            gates: DashMap::new(),
            registry_lock: Mutex::new(()),
            commit_lock: RwLock::new(()),
            id_gen: std::sync::Mutex::new(Generator::new()),
            wal_tx: None,
        }
    }

    /// Replay the WAL at `wal_path` (if any) and journal every later write to it.
    /// Must be called inside a tokio runtime; the WAL writer runs as a task.
    pub fn open(wal_path: &Path) -> io::Result<Self> {
        let (wal, events) = Wal::open_and_replay(wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut engine = Self::in_memory();
        engine.wal_tx = Some(wal_tx);
        // Sole owner of every lock here, so try_write always succeeds.
        for event in &events {
            engine.replay(event);
        }
        Ok(engine)
    }

    fn replay(&self, event: &Event) {
        match event {
            Event::ResourceRegistered { id, kind, capacity, zone } => {
                let resource = Resource::new(id.clone(), *kind, *capacity, zone.clone());
                self.insert_resource(resource);
            }
            Event::ResourceRestored { resource } => self.insert_resource(resource.clone()),
            Event::ResourceRetired { id } | Event::ResourceCleaned { id } => {
                let Some(mut guard) = self.resource_state(id).and_then(|rs| rs.try_write_owned().ok()) else {
                    warn!("replay: skipping {event:?} for unknown resource");
                    return;
                };
                apply_resource_event(&mut guard.resource, event);
            }
            other => {
                let Some(id) = other.reservation_id() else { return };
                let prev = self.reservations.get(&id).map(|r| r.value().clone());
                let next = match (other, &prev) {
                    (Event::ReservationCreated { reservation }, _) => reservation.clone(),
                    (_, Some(prev)) => {
                        let mut next = prev.clone();
                        next.apply(other);
                        next
                    }
                    (_, None) => {
                        warn!("replay: skipping event for unknown reservation {id}");
                        return;
                    }
                };
                let mut guards = Vec::new();
                for rid in touched_resources(prev.as_ref(), &next) {
                    match self.resource_state(&rid).and_then(|rs| rs.try_write_owned().ok()) {
                        Some(guard) => guards.push(guard),
                        None => {
                            warn!("replay: reservation {id} references unknown resource {rid}");
                            return;
                        }
                    }
                }
                self.gates.entry(id).or_default();
                self.commit(&mut guards, prev.as_ref(), next);
            }
        }
    }

    fn insert_resource(&self, resource: Resource) {
        let id = resource.id.clone();
        self.resources
            .insert(id, Arc::new(RwLock::new(ResourceState::new(resource))));
    }

    /// Write event to WAL via the background group-commit writer.
    /// In-memory engines accept every append.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let Some(wal_tx) = &self.wal_tx else {
            return Ok(());
        };
        let (tx, rx) = oneshot::channel();
        wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Wal(e.to_string()))
    }

    pub(crate) fn resource_state(&self, id: &str) -> Option<SharedResourceState> {
        self.resources.get(id).map(|e| e.value().clone())
    }

    fn gate(&self, id: Ulid) -> Result<Arc<Mutex<()>>, EngineError> {
        self.gates
            .get(&id)
            .map(|g| g.value().clone())
            .ok_or_else(|| EngineError::reservation_not_found(id))
    }

    /// Acquire write locks in sorted id order to prevent deadlocks.
    async fn lock_resources(&self, mut ids: Vec<ResourceId>) -> Result<Vec<ResourceGuard>, EngineError> {
        ids.sort();
        ids.dedup();
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            let rs = self
                .resource_state(&id)
                .ok_or_else(|| EngineError::resource_not_found(&id))?;
            guards.push(rs.write_owned().await);
        }
        Ok(guards)
    }

    /// Confirm the index agrees with `prev` before anything is journaled.
    fn verify_index(guards: &[ResourceGuard], prev: Option<&Reservation>, next: &Reservation) -> Result<(), EngineError> {
        let mut needed: Vec<(&str, Option<Ulid>)> = Vec::new();
        if let Some(prev) = prev.filter(|p| p.holds()) {
            needed.push((prev.resource_id.as_deref().unwrap_or_default(), Some(prev.id)));
        }
        if next.holds() {
            needed.push((next.resource_id.as_deref().unwrap_or_default(), None));
        }
        for (rid, must_hold) in needed {
            let Some(guard) = guards.iter().find(|g| g.resource.id == rid) else {
                let msg = format!("resource {rid} not locked for reservation {}", next.id);
                error!("{msg}");
                return Err(EngineError::Invariant(msg));
            };
            if let Some(reservation_id) = must_hold
                && !guard.allocations.iter().any(|a| a.reservation_id == reservation_id)
            {
                let msg = format!("reservation {reservation_id} missing from occupancy index of {rid}");
                error!("{msg}");
                return Err(EngineError::Invariant(msg));
            }
        }
        Ok(())
    }

    /// Move `next` into the store and re-seat its allocation. Callers hold
    /// the write locks for every id in `touched_resources(prev, next)`.
    fn commit(&self, guards: &mut [ResourceGuard], prev: Option<&Reservation>, next: Reservation) {
        if let Some(prev) = prev.filter(|p| p.holds()) {
            let rid = prev.resource_id.as_deref().unwrap_or_default();
            match guards.iter_mut().find(|g| g.resource.id == rid) {
                Some(guard) => {
                    if guard.remove_allocation(prev.id).is_none() {
                        error!("reservation {} was not indexed on {rid}", prev.id);
                    }
                    if next.status == Status::CheckedOut {
                        guard.resource.needs_cleaning = true;
                    }
                }
                None => error!("commit without lock on {rid}"),
            }
        }
        if next.holds() {
            let rid = next.resource_id.as_deref().unwrap_or_default();
            match guards.iter_mut().find(|g| g.resource.id == rid) {
                Some(guard) => guard.insert_allocation(Allocation::of(&next)),
                None => error!("commit without lock on {rid}"),
            }
        }
        self.reservations.insert(next.id, next);
    }

    /// Rewrite the WAL with the minimal event set for the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let Some(wal_tx) = &self.wal_tx else {
            return Ok(());
        };
        let _quiesced = self.commit_lock.write().await;

        let mut resource_ids: Vec<ResourceId> = self.resources.iter().map(|e| e.key().clone()).collect();
        resource_ids.sort();
        let mut events = Vec::with_capacity(resource_ids.len() + self.reservations.len());
        for id in &resource_ids {
            if let Some(rs) = self.resource_state(id) {
                let guard = rs.read().await;
                events.push(Event::ResourceRestored {
                    resource: guard.resource.clone(),
                });
            }
        }
        let mut reservations: Vec<Reservation> = self.reservations.iter().map(|e| e.value().clone()).collect();
        reservations.sort_by_key(|r| r.id);
        events.extend(
            reservations
                .into_iter()
                .map(|reservation| Event::ReservationCreated { reservation }),
        );

        let (tx, rx) = oneshot::channel();
        wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Wal(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let Some(wal_tx) = &self.wal_tx else {
            return 0;
        };
        let (tx, rx) = oneshot::channel();
        if wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

fn apply_resource_event(resource: &mut Resource, event: &Event) {
    match event {
        Event::ResourceRetired { .. } => resource.retired = true,
        Event::ResourceCleaned { .. } => resource.needs_cleaning = false,
        _ => {}
    }
}

/// Resources whose occupancy index changes when `prev` becomes `next`.
fn touched_resources(prev: Option<&Reservation>, next: &Reservation) -> Vec<ResourceId> {
    let mut ids: Vec<ResourceId> = prev
        .filter(|p| p.holds())
        .and_then(|p| p.resource_id.clone())
        .into_iter()
        .chain(next.resource_id.clone().filter(|_| next.holds()))
        .collect();
    ids.sort();
    ids.dedup();
    ids
}
