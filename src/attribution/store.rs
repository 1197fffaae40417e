//! Run Store: the single owner of run state.
//!
//! Each run lives in its own slot holding an async write lock and an
//! `Arc<Run>` snapshot cell. Writers for one run serialize on the slot lock;
//! readers clone the current `Arc` and never block on a writer. Different
//! runs never share a lock beyond the map shard lookup.

use std::sync::Arc;

use chrono::{Duration, Utc};
use dashmap::DashMap;
use eventsense_common::{Run, RunId, RunParams, StepRecord};
use parking_lot::RwLock;
use tokio::sync::{Mutex, broadcast};

use super::db::DbHandle;
use super::events::{self, RunEvent};
use crate::errors::StoreError;

const EVENT_CHANNEL_CAPACITY: usize = 256;

struct RunSlot {
    write: Mutex<()>,
    snapshot: RwLock<Arc<Run>>,
}

impl RunSlot {
    fn new(run: Run) -> Self {
        Self {
            write: Mutex::new(()),
            snapshot: RwLock::new(Arc::new(run)),
        }
    }

    fn load(&self) -> Arc<Run> {
        Arc::clone(&self.snapshot.read())
    }
}

struct StoreInner {
    runs: DashMap<RunId, Arc<RunSlot>>,
    db: Option<DbHandle>,
    events: broadcast::Sender<RunEvent>,
}

/// Cloneable handle to the run store. Construct once and pass it around.
#[derive(Clone)]
pub struct RunStore {
    inner: Arc<StoreInner>,
}

impl RunStore {
    /// A store without durability. Runs vanish with the process.
    pub fn in_memory() -> Self {
        Self::with_db(None)
    }

    /// A store persisting every committed update through `db`. Runs already
    /// in the database are loaded.
    pub async fn open(db: DbHandle) -> Result<Self, StoreError> {
        let runs = db
            .call(|db| db.load_runs())
            .await
            .map_err(StoreError::Persistence)?;
        let store = Self::with_db(Some(db));
        for run in runs {
            store
                .inner
                .runs
                .insert(run.run_id.clone(), Arc::new(RunSlot::new(run)));
        }
        tracing::debug!(runs = store.inner.runs.len(), "Loaded persisted runs");
        Ok(store)
    }

    fn with_db(db: Option<DbHandle>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(StoreInner {
                runs: DashMap::new(),
                db,
                events,
            }),
        }
    }

    pub fn is_durable(&self) -> bool {
        self.inner.db.is_some()
    }

    /// Create a queued run with a fresh id and the given step records.
    pub async fn create(
        &self,
        params: RunParams,
        steps: Vec<StepRecord>,
    ) -> Result<Arc<Run>, StoreError> {
        let mut run_id = RunId::generate();
        while self.inner.runs.contains_key(&run_id) {
            run_id = RunId::generate();
        }
        let run = Run::new(run_id.clone(), params, steps);
        run.check_invariants()
            .map_err(|source| StoreError::Invariant {
                run_id: run_id.clone(),
                source,
            })?;
        self.persist(&run).await?;

        let slot = Arc::new(RunSlot::new(run));
        let snapshot = slot.load();
        match self.inner.runs.entry(run_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(StoreError::AlreadyExists { run_id });
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(slot);
            }
        }

        tracing::debug!(run_id = %run_id, ticker = %snapshot.params.ticker, "Run created");
        events::publish(&self.inner.events, RunEvent::diff(None, &snapshot));
        Ok(snapshot)
    }

    /// Snapshot of a run. Never observes a partially applied update.
    pub fn get(&self, run_id: &RunId) -> Option<Arc<Run>> {
        self.inner.runs.get(run_id).map(|slot| slot.load())
    }

    fn slot(&self, run_id: &RunId) -> Result<Arc<RunSlot>, StoreError> {
        self.inner
            .runs
            .get(run_id)
            .map(|slot| Arc::clone(slot.value()))
            .ok_or_else(|| StoreError::NotFound {
                run_id: run_id.clone(),
            })
    }

    /// Apply `mutator` to a private copy of the run and publish it atomically.
    ///
    /// Updates for the same run serialize on the run's write lock. The
    /// mutated copy must satisfy the run invariants and be a legal successor
    /// of the current snapshot; otherwise nothing changes. Terminal runs
    /// reject every update.
    pub async fn update<F>(&self, run_id: &RunId, mutator: F) -> Result<Arc<Run>, StoreError>
    where
        F: FnOnce(&mut Run) -> Result<(), String> + Send,
    {
        let slot = self.slot(run_id)?;
        let _write = slot.write.lock().await;

        let current = slot.load();
        if current.is_terminal() {
            return Err(StoreError::Terminal {
                run_id: run_id.clone(),
            });
        }

        let mut next = (*current).clone();
        mutator(&mut next).map_err(|message| StoreError::Mutation {
            run_id: run_id.clone(),
            message,
        })?;
        next.run_id = current.run_id.clone();
        next.created_at = current.created_at;
        let now = Utc::now();
        next.updated_at = if now > current.updated_at {
            now
        } else {
            current.updated_at + Duration::microseconds(1)
        };

        let invariant = |source| StoreError::Invariant {
            run_id: run_id.clone(),
            source,
        };
        next.check_invariants().map_err(invariant)?;
        current.check_transition(&next).map_err(invariant)?;

        self.persist(&next).await?;

        let next = Arc::new(next);
        *slot.snapshot.write() = Arc::clone(&next);
        events::publish(&self.inner.events, RunEvent::diff(Some(&current), &next));
        Ok(next)
    }

    async fn persist(&self, run: &Run) -> Result<(), StoreError> {
        let Some(db) = &self.inner.db else {
            return Ok(());
        };
        let document = run.clone();
        db.call(move |db| db.upsert_run(&document))
            .await
            .map_err(StoreError::Persistence)
    }

    /// Ids of runs that are queued or running, oldest first.
    pub fn list_active(&self) -> Vec<RunId> {
        let mut active: Vec<Arc<Run>> = self
            .inner
            .runs
            .iter()
            .map(|slot| slot.load())
            .filter(|run| !run.is_terminal())
            .collect();
        active.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.run_id.cmp(&b.run_id))
        });
        active.into_iter().map(|run| run.run_id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.runs.is_empty()
    }

    /// Drop a terminal run from memory and from the database. Called by
    /// whatever retention policy the host applies.
    pub async fn evict(&self, run_id: &RunId) -> Result<(), StoreError> {
        let slot = self.slot(run_id)?;
        let _write = slot.write.lock().await;
        if !slot.load().is_terminal() {
            return Err(StoreError::Active {
                run_id: run_id.clone(),
            });
        }
        if let Some(db) = &self.inner.db {
            let id = run_id.clone();
            db.call(move |db| db.delete_run(&id))
                .await
                .map_err(StoreError::Persistence)?;
        }
        self.inner.runs.remove(run_id);
        tracing::debug!(run_id = %run_id, "Run evicted");
        Ok(())
    }

    /// Receive every event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.inner.events.subscribe()
    }
}
