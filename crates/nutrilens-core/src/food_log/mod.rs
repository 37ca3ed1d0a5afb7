mod pending;

pub use pending::PendingQueue;

use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use uuid::Uuid;

use crate::backend::BackendClient;
use crate::error::{NutriLensError, Result};
use crate::model::FoodLogEntry;
use crate::session::SessionStore;

/// Outcome of pushing unsynced entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub pushed: usize,
    pub remaining: usize,
}

/// Locally held food log, newest first.
///
/// Append-only from the caller's side: `append` inserts at the head before
/// the remote write, and a failed remote write leaves the entry in place,
/// flagged unsynced (and queued on disk when a [`PendingQueue`] is attached).
pub struct FoodLogStore {
    entries: RwLock<Vec<FoodLogEntry>>,
    /// Ids with a remote write outstanding. Each entry is posted by at most
    /// one caller at a time.
    in_flight: Mutex<HashSet<Uuid>>,
    backend: BackendClient,
    session: Arc<SessionStore>,
    pending: Option<PendingQueue>,
}

impl FoodLogStore {
    pub fn new(backend: BackendClient, session: Arc<SessionStore>) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            in_flight: Mutex::new(HashSet::new()),
            backend,
            session,
            pending: None,
        }
    }

    /// Attach an on-disk queue and seed the log with whatever it holds.
    pub fn with_pending(mut self, queue: PendingQueue) -> Result<Self> {
        let queued = queue.read_all()?;
        {
            let entries = self.entries.get_mut().unwrap_or_else(|p| p.into_inner());
            for mut entry in queued {
                if !entries.iter().any(|e| e.id == entry.id) {
                    entry.synced = false;
                    entries.push(entry);
                }
            }
            sort_newest_first(entries);
        }
        self.pending = Some(queue);
        Ok(self)
    }

    pub fn entries(&self) -> Vec<FoodLogEntry> {
        self.read().clone()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn unsynced(&self) -> Vec<FoodLogEntry> {
        self.read().iter().filter(|e| !e.synced).cloned().collect()
    }

    /// Replace the local log with the remote list, newest first.
    ///
    /// Entries that are still unsynced locally and absent remotely are kept.
    pub async fn load(&self) -> Result<Vec<FoodLogEntry>> {
        let token = self.token()?;
        let records = self.backend.fetch_food_logs(&token).await?;

        let mut merged: Vec<FoodLogEntry> = records.into_iter().map(FoodLogEntry::from).collect();
        let mut acknowledged = Vec::new();
        for entry in self.all_unsynced()? {
            if merged.iter().any(|m| m.id == entry.id) {
                acknowledged.push(entry.id);
            } else {
                merged.push(entry);
            }
        }
        sort_newest_first(&mut merged);

        *self.write() = merged.clone();
        self.dequeue(&acknowledged);
        tracing::debug!(count = merged.len(), "food log loaded");
        Ok(merged)
    }

    /// Insert at the head, then persist remotely.
    ///
    /// On a remote failure the entry stays in the log, unsynced, and the
    /// error is returned. On success the synced entry is returned.
    pub async fn append(&self, mut entry: FoodLogEntry) -> Result<FoodLogEntry> {
        entry.synced = false;
        let claim = self.claim(entry.id);
        self.write().insert(0, entry.clone());

        let persisted = self.persist(&entry).await;
        drop(claim);
        match persisted {
            Ok(()) => {
                self.mark_synced(entry.id);
                entry.synced = true;
                tracing::info!(id = %entry.id, food = %entry.food_name, "food log appended");
                Ok(entry)
            }
            Err(e) => {
                tracing::warn!(id = %entry.id, error = %e, "remote persist failed, entry kept as unsynced");
                if let Some(queue) = &self.pending {
                    if let Err(qe) = queue.append(&entry) {
                        tracing::warn!(error = %qe, "failed to queue unsynced entry");
                    }
                }
                Err(e)
            }
        }
    }

    /// Retry every unsynced entry, oldest first. Stops at the first
    /// authorization failure, since later attempts would fail the same way.
    ///
    /// Entries whose write is already outstanding (a commit still waiting on
    /// the backend, or a concurrent sync) are skipped.
    pub async fn sync_pending(&self) -> Result<SyncReport> {
        let mut pending = self.all_unsynced()?;
        pending.sort_by(|a, b| a.logged_at.cmp(&b.logged_at));
        let mut claims: Vec<_> = pending.iter().map(|e| self.claim(e.id)).collect();
        let skipped = claims.iter().filter(|c| c.is_none()).count();
        if skipped > 0 {
            tracing::debug!(skipped, "entries already being written, not resent");
        }

        let mut attempted = 0;
        let mut pushed = Vec::new();
        let mut failure = None;
        for (entry, claim) in pending.iter().zip(claims.iter_mut()) {
            if claim.is_none() {
                continue;
            }
            attempted += 1;
            let persisted = self.persist(entry).await;
            claim.take();
            match persisted {
                Ok(()) => {
                    self.mark_synced(entry.id);
                    pushed.push(entry.id);
                }
                Err(e) if e.is_unauthorized() => {
                    failure = Some(e);
                    break;
                }
                Err(e) => {
                    tracing::warn!(id = %entry.id, error = %e, "entry still unsynced");
                }
            }
        }
        self.dequeue(&pushed);

        if let Some(e) = failure {
            return Err(e);
        }
        let report = SyncReport {
            pushed: pushed.len(),
            remaining: attempted - pushed.len(),
        };
        tracing::info!(pushed = report.pushed, remaining = report.remaining, "sync finished");
        Ok(report)
    }

    /// Mark `id` as being written. `None` if another caller already is.
    fn claim(&self, id: Uuid) -> Option<InFlight<'_>> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        in_flight.insert(id).then(|| InFlight {
            set: &self.in_flight,
            id,
        })
    }

    async fn persist(&self, entry: &FoodLogEntry) -> Result<()> {
        let token = self.token()?;
        self.backend.create_food_log(&token, entry).await
    }

    fn token(&self) -> Result<String> {
        self.session
            .current_token()
            .ok_or_else(|| NutriLensError::Unauthorized("not logged in".into()))
    }

    /// Unsynced entries held in memory plus any only present in the queue file.
    fn all_unsynced(&self) -> Result<Vec<FoodLogEntry>> {
        let mut unsynced = self.unsynced();
        if let Some(queue) = &self.pending {
            for mut entry in queue.read_all()? {
                let known = self.read().iter().any(|e| e.id == entry.id && e.synced);
                if !known && !unsynced.iter().any(|e| e.id == entry.id) {
                    entry.synced = false;
                    unsynced.push(entry);
                }
            }
        }
        Ok(unsynced)
    }

    fn mark_synced(&self, id: Uuid) {
        if let Some(e) = self.write().iter_mut().find(|e| e.id == id) {
            e.synced = true;
        }
    }

    fn dequeue(&self, ids: &[Uuid]) {
        if let Some(queue) = &self.pending {
            if let Err(e) = queue.remove(ids) {
                tracing::warn!(error = %e, "failed to prune pending queue");
            }
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<FoodLogEntry>> {
        self.entries.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<FoodLogEntry>> {
        self.entries.write().unwrap_or_else(|p| p.into_inner())
    }
}

/// Releases its id when dropped.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<Uuid>>,
    id: Uuid,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.id);
    }
}

fn sort_newest_first(entries: &mut [FoodLogEntry]) {
    entries.sort_by(|a, b| b.logged_at.cmp(&a.logged_at));
}
