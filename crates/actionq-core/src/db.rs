//! Durable queue storage using redb.
//!
//! # Table design
//!
//! `PROGRAMS` maps a program id to its JSON-encoded [`ActionQueueItem`].
//! Programs are few and ticks are frequent, so due-ness is decided in memory
//! by the scheduler; keying by id keeps every write a single insert.
//!
//! `PUSH_EVENTS` maps an event id to the unix millis at which it was
//! signalled. Signals are sticky: there is no removal.
//!
//! # Sharing the file
//!
//! redb takes an exclusive lock on the file for as long as a [`Database`] is
//! open. [`SharedQueueDb`] opens it per operation and retries briefly while
//! another process holds it, so `actionq run` and one-shot commands such as
//! `program cancel` can take turns.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use redb::{Database, DatabaseError, ReadableTable, TableDefinition};

use crate::error::{ActionQueueError, Result};
use crate::types::{ActionQueueItem, ActionQueueMap};

// ---------------------------------------------------------------------------
// Table definitions
// ---------------------------------------------------------------------------

const PROGRAMS: TableDefinition<&str, &[u8]> = TableDefinition::new("programs");
const PUSH_EVENTS: TableDefinition<&str, u64> = TableDefinition::new("push_events");

const LOCK_RETRIES: u32 = 50;
const LOCK_BACKOFF: Duration = Duration::from_millis(20);

fn db_err(e: impl std::fmt::Display) -> ActionQueueError {
    ActionQueueError::QueueDb(e.to_string())
}

// ---------------------------------------------------------------------------
// QueueStore
// ---------------------------------------------------------------------------

/// Durable backing for an [`ActionQueue`](crate::queue::ActionQueue).
pub trait QueueStore: Send + Sync {
    /// Insert a program that must not exist yet. Returns false if it does.
    fn insert_new(&self, item: &ActionQueueItem) -> Result<bool>;

    /// Store `item` unless the stored record has been cancelled and `item`
    /// has not. Returns the record that ended up stored.
    fn write_back(&self, item: &ActionQueueItem) -> Result<ActionQueueItem>;

    /// Delete a program record. Returns whether one existed.
    fn remove(&self, program_id: &str) -> Result<bool>;

    /// Every stored program, with `executing` cleared.
    fn load_map(&self) -> Result<ActionQueueMap>;

    /// Clear stale `executing` flags left by a crashed scheduler and persist
    /// the fix. Returns the number of records touched.
    fn startup_recovery(&self) -> Result<u32>;

    /// Record a push event. Returns true if it had not been signalled before.
    fn signal_event(&self, event_id: &str, at: DateTime<Utc>) -> Result<bool>;

    fn signaled_events(&self) -> Result<Vec<String>>;
}

// ---------------------------------------------------------------------------
// ActionQueueDb
// ---------------------------------------------------------------------------

/// An open queue database. Holds the file lock until dropped.
pub struct ActionQueueDb {
    db: Database,
}

impl ActionQueueDb {
    /// Open or create the database at `path`, creating both tables.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(|e| match e {
            DatabaseError::DatabaseAlreadyOpen => {
                ActionQueueError::QueueLocked(path.display().to_string())
            }
            other => db_err(other),
        })?;
        let wt = db.begin_write().map_err(db_err)?;
        wt.open_table(PROGRAMS).map_err(db_err)?;
        wt.open_table(PUSH_EVENTS).map_err(db_err)?;
        wt.commit().map_err(db_err)?;
        Ok(Self { db })
    }

    /// All items, ordered by program id.
    pub fn list_all(&self) -> Result<Vec<ActionQueueItem>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(PROGRAMS).map_err(db_err)?;

        let mut result = Vec::new();
        for entry in table.iter().map_err(db_err)? {
            let (_, v) = entry.map_err(db_err)?;
            result.push(serde_json::from_slice(v.value())?);
        }
        Ok(result)
    }
}

impl QueueStore for ActionQueueDb {
    fn insert_new(&self, item: &ActionQueueItem) -> Result<bool> {
        let value = serde_json::to_vec(item)?;
        let id = item.program.program_id.as_str();
        let wt = self.db.begin_write().map_err(db_err)?;
        let inserted = {
            let mut table = wt.open_table(PROGRAMS).map_err(db_err)?;
            let exists = table.get(id).map_err(db_err)?.is_some();
            if !exists {
                table.insert(id, value.as_slice()).map_err(db_err)?;
            }
            !exists
        };
        wt.commit().map_err(db_err)?;
        Ok(inserted)
    }

    fn write_back(&self, item: &ActionQueueItem) -> Result<ActionQueueItem> {
        let id = item.program.program_id.as_str();
        let wt = self.db.begin_write().map_err(db_err)?;
        let stored = {
            let mut table = wt.open_table(PROGRAMS).map_err(db_err)?;
            let existing: Option<ActionQueueItem> = match table.get(id).map_err(db_err)? {
                Some(v) => Some(serde_json::from_slice(v.value())?),
                None => None,
            };
            let stored = match existing {
                Some(mut theirs) if theirs.state.is_cancelled() && !item.state.is_cancelled() => {
                    theirs.state.executing = false;
                    theirs
                }
                _ => item.clone(),
            };
            let value = serde_json::to_vec(&stored)?;
            table.insert(id, value.as_slice()).map_err(db_err)?;
            stored
        };
        wt.commit().map_err(db_err)?;
        Ok(stored)
    }

    fn remove(&self, program_id: &str) -> Result<bool> {
        let wt = self.db.begin_write().map_err(db_err)?;
        let existed = {
            let mut table = wt.open_table(PROGRAMS).map_err(db_err)?;
            let removed = table.remove(program_id).map_err(db_err)?;
            removed.is_some()
        };
        wt.commit().map_err(db_err)?;
        Ok(existed)
    }

    fn load_map(&self) -> Result<ActionQueueMap> {
        Ok(self
            .list_all()?
            .into_iter()
            .map(|mut item| {
                item.state.executing = false;
                (item.program.program_id.clone(), item)
            })
            .collect())
    }

    fn startup_recovery(&self) -> Result<u32> {
        let wt = self.db.begin_write().map_err(db_err)?;
        let count = {
            let mut table = wt.open_table(PROGRAMS).map_err(db_err)?;
            let mut stale = Vec::new();
            for entry in table.iter().map_err(db_err)? {
                let (_, v) = entry.map_err(db_err)?;
                let mut item: ActionQueueItem = serde_json::from_slice(v.value())?;
                if item.state.executing {
                    item.state.executing = false;
                    stale.push(item);
                }
            }
            for item in &stale {
                let value = serde_json::to_vec(item)?;
                table
                    .insert(item.program.program_id.as_str(), value.as_slice())
                    .map_err(db_err)?;
            }
            stale.len() as u32
        };
        wt.commit().map_err(db_err)?;
        Ok(count)
    }

    fn signal_event(&self, event_id: &str, at: DateTime<Utc>) -> Result<bool> {
        let wt = self.db.begin_write().map_err(db_err)?;
        let fresh = {
            let mut table = wt.open_table(PUSH_EVENTS).map_err(db_err)?;
            let seen = table.get(event_id).map_err(db_err)?.is_some();
            if !seen {
                let ms = at.timestamp_millis().max(0) as u64;
                table.insert(event_id, ms).map_err(db_err)?;
            }
            !seen
        };
        wt.commit().map_err(db_err)?;
        Ok(fresh)
    }

    fn signaled_events(&self) -> Result<Vec<String>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(PUSH_EVENTS).map_err(db_err)?;

        let mut result = Vec::new();
        for entry in table.iter().map_err(db_err)? {
            let (k, _) = entry.map_err(db_err)?;
            result.push(k.value().to_string());
        }
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// SharedQueueDb
// ---------------------------------------------------------------------------

/// A queue database opened per operation and released straight after.
pub struct SharedQueueDb {
    path: PathBuf,
}

impl SharedQueueDb {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> Result<ActionQueueDb> {
        let mut attempt = 0;
        loop {
            match ActionQueueDb::open(&self.path) {
                Err(ActionQueueError::QueueLocked(_)) if attempt < LOCK_RETRIES => {
                    attempt += 1;
                    std::thread::sleep(LOCK_BACKOFF);
                }
                result => return result,
            }
        }
    }
}

impl QueueStore for SharedQueueDb {
    fn insert_new(&self, item: &ActionQueueItem) -> Result<bool> {
        self.open()?.insert_new(item)
    }

    fn write_back(&self, item: &ActionQueueItem) -> Result<ActionQueueItem> {
        self.open()?.write_back(item)
    }

    fn remove(&self, program_id: &str) -> Result<bool> {
        self.open()?.remove(program_id)
    }

    fn load_map(&self) -> Result<ActionQueueMap> {
        self.open()?.load_map()
    }

    fn startup_recovery(&self) -> Result<u32> {
        self.open()?.startup_recovery()
    }

    fn signal_event(&self, event_id: &str, at: DateTime<Utc>) -> Result<bool> {
        self.open()?.signal_event(event_id, at)
    }

    fn signaled_events(&self) -> Result<Vec<String>> {
        self.open()?.signaled_events()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::ActionEffect;
    use crate::types::{ActionOp, ActionProgram, ActionProgramState, WyreBuyOp};
    use tempfile::TempDir;

    fn open_tmp() -> (TempDir, ActionQueueDb) {
        let dir = TempDir::new().unwrap();
        let db = ActionQueueDb::open(&dir.path().join("queue.db")).unwrap();
        (dir, db)
    }

    fn item(id: &str, next: DateTime<Utc>) -> ActionQueueItem {
        let mut state = ActionProgramState::new("local", id, next);
        state.next_execution_time = next;
        ActionQueueItem {
            program: ActionProgram {
                program_id: id.into(),
                action_op: ActionOp::WyreBuy(WyreBuyOp {
                    wallet_id: "w".into(),
                    token_id: None,
                    native_amount: "1".into(),
                }),
                mock_mode: false,
            },
            state,
        }
    }

    #[test]
    fn write_back_replaces_existing_record() {
        let (_dir, db) = open_tmp();
        let now = Utc::now();
        let mut a = item("a", now);
        db.write_back(&a).unwrap();
        a.state.effective = true;
        assert_eq!(db.write_back(&a).unwrap(), a);

        let all = db.list_all().unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].state.effective);
    }

    #[test]
    fn insert_new_refuses_existing_ids() {
        let (_dir, db) = open_tmp();
        let a = item("a", Utc::now());
        assert!(db.insert_new(&a).unwrap());
        assert!(!db.insert_new(&a).unwrap());
        assert_eq!(db.list_all().unwrap().len(), 1);
    }

    #[test]
    fn write_back_keeps_a_stored_cancellation() {
        let (_dir, db) = open_tmp();
        let now = Utc::now();
        let mut cancelled = item("a", now);
        cancelled.state.effect = Some(ActionEffect::cancelled());
        db.insert_new(&cancelled).unwrap();

        let mut step = item("a", now);
        step.state.executing = true;
        step.state.effective = true;
        let stored = db.write_back(&step).unwrap();
        assert!(stored.state.is_cancelled());
        assert!(!stored.state.executing);
        assert!(db.list_all().unwrap()[0].state.is_cancelled());
    }

    #[test]
    fn load_map_resets_executing() {
        let (_dir, db) = open_tmp();
        let mut a = item("a", Utc::now());
        a.state.executing = true;
        db.write_back(&a).unwrap();

        let map = db.load_map().unwrap();
        assert!(!map["a"].state.executing);
        // Stored copy is untouched until recovery runs.
        assert!(db.list_all().unwrap()[0].state.executing);
        assert_eq!(db.startup_recovery().unwrap(), 1);
        assert!(!db.list_all().unwrap()[0].state.executing);
        assert_eq!(db.startup_recovery().unwrap(), 0);
    }

    #[test]
    fn remove_reports_presence() {
        let (_dir, db) = open_tmp();
        db.insert_new(&item("a", Utc::now())).unwrap();
        assert!(db.remove("a").unwrap());
        assert!(!db.remove("a").unwrap());
    }

    #[test]
    fn push_events_are_sticky_and_deduplicated() {
        let (_dir, db) = open_tmp();
        assert!(db.signal_event("kyc-approved", Utc::now()).unwrap());
        assert!(!db.signal_event("kyc-approved", Utc::now()).unwrap());
        assert_eq!(db.signaled_events().unwrap(), vec!["kyc-approved"]);
    }

    #[test]
    fn reopen_keeps_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.db");
        {
            let db = ActionQueueDb::open(&path).unwrap();
            db.insert_new(&item("a", Utc::now())).unwrap();
        }
        let db = ActionQueueDb::open(&path).unwrap();
        assert_eq!(db.list_all().unwrap().len(), 1);
    }

    #[test]
    fn second_open_reports_lock() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.db");
        let _held = ActionQueueDb::open(&path).unwrap();
        let err = ActionQueueDb::open(&path).err().unwrap();
        assert_eq!(err.kind(), "queue_locked");
    }

    #[test]
    fn shared_db_waits_for_the_lock_holder() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.db");
        let held = ActionQueueDb::open(&path).unwrap();
        let release = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            drop(held);
        });

        let shared = SharedQueueDb::new(&path);
        assert!(shared.signal_event("kyc", Utc::now()).unwrap());
        release.join().unwrap();

        // Released after each call, so a plain open succeeds again.
        let db = ActionQueueDb::open(&path).unwrap();
        assert_eq!(db.signaled_events().unwrap(), vec!["kyc"]);
    }
}
