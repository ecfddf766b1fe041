//! Transactional datastore behind the executor.
//!
//! `process` handlers stage writes into a `Transaction` the worker opened;
//! the worker commits or rolls back based on the handler's commit intent.
//! Conflict detection is optimistic: a transaction that began before another
//! commit landed reports `Conflict` and the command is processed again.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle};

/// Schema generation written by `upgrade_schema`.
const CURRENT_SCHEMA_VERSION: u64 = 1;

const SCHEMA_VERSION_KEY: &str = "schema_version";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    Conflict,
}

/// One open transaction. Reads observe the transaction's own staged writes;
/// nothing is visible to other readers until `commit` returns `Committed`.
pub trait Transaction: Send {
    fn get(&self, key: &str) -> Option<String>;
    fn put(&mut self, key: &str, value: &str);
    fn delete(&mut self, key: &str);
    fn write_count(&self) -> usize;
    fn commit(self: Box<Self>) -> anyhow::Result<CommitOutcome>;
    fn rollback(self: Box<Self>);
}

/// Storage engine API consumed by the executor. `get` is the read-only path
/// `peek` uses; `begin` opens the transaction `process` runs inside.
pub trait Datastore: Send + Sync + 'static {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    fn begin(&self) -> Box<dyn Transaction>;
    /// Apply schema migrations. Invoked once when this node first becomes
    /// primary; must be idempotent.
    fn upgrade_schema(&self) -> anyhow::Result<()>;
}

/// Fjall-backed store: one data partition plus a meta partition for the
/// schema version.
pub struct FjallStore {
    keyspace: Keyspace,
    data: PartitionHandle,
    meta: PartitionHandle,
    commit_generation: Arc<AtomicU64>,
}

impl FjallStore {
    pub fn open(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        std::fs::create_dir_all(dir.as_ref()).context("create storage dir")?;
        let keyspace = fjall::Config::new(dir.as_ref())
            .open()
            .context("open fjall keyspace")?;
        let data = keyspace
            .open_partition("data", PartitionCreateOptions::default())
            .context("open data partition")?;
        let meta = keyspace
            .open_partition("meta", PartitionCreateOptions::default())
            .context("open meta partition")?;
        Ok(Self {
            keyspace,
            data,
            meta,
            commit_generation: Arc::new(AtomicU64::new(0)),
        })
    }
}

impl Datastore for FjallStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let value = self.data.get(key).context("read key")?;
        Ok(value.map(|slice| String::from_utf8_lossy(&slice).into_owned()))
    }

    fn begin(&self) -> Box<dyn Transaction> {
        Box::new(FjallTransaction {
            keyspace: self.keyspace.clone(),
            data: self.data.clone(),
            staged: BTreeMap::new(),
            commit_generation: self.commit_generation.clone(),
            start_generation: self.commit_generation.load(Ordering::SeqCst),
        })
    }

    fn upgrade_schema(&self) -> anyhow::Result<()> {
        let existing = self
            .meta
            .get(SCHEMA_VERSION_KEY)
            .context("read schema version")?
            .and_then(|slice| String::from_utf8_lossy(&slice).parse::<u64>().ok())
            .unwrap_or(0);
        if existing >= CURRENT_SCHEMA_VERSION {
            return Ok(());
        }
        self.meta
            .insert(SCHEMA_VERSION_KEY, CURRENT_SCHEMA_VERSION.to_string())
            .context("write schema version")?;
        tracing::info!(
            from = existing,
            to = CURRENT_SCHEMA_VERSION,
            "upgraded datastore schema"
        );
        Ok(())
    }
}

struct FjallTransaction {
    keyspace: Keyspace,
    data: PartitionHandle,
    /// key -> Some(value) for puts, None for deletes.
    staged: BTreeMap<String, Option<String>>,
    commit_generation: Arc<AtomicU64>,
    start_generation: u64,
}

impl Transaction for FjallTransaction {
    fn get(&self, key: &str) -> Option<String> {
        if let Some(staged) = self.staged.get(key) {
            return staged.clone();
        }
        self.data
            .get(key)
            .ok()
            .flatten()
            .map(|slice| String::from_utf8_lossy(&slice).into_owned())
    }

    fn put(&mut self, key: &str, value: &str) {
        self.staged.insert(key.to_string(), Some(value.to_string()));
    }

    fn delete(&mut self, key: &str) {
        self.staged.insert(key.to_string(), None);
    }

    fn write_count(&self) -> usize {
        self.staged.len()
    }

    fn commit(self: Box<Self>) -> anyhow::Result<CommitOutcome> {
        if self.staged.is_empty() {
            return Ok(CommitOutcome::Committed);
        }
        // First committer since our snapshot wins; everyone else retries.
        if self
            .commit_generation
            .compare_exchange(
                self.start_generation,
                self.start_generation + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return Ok(CommitOutcome::Conflict);
        }
        let mut batch = self.keyspace.batch();
        for (key, staged) in &self.staged {
            match staged {
                Some(value) => batch.insert(&self.data, key.as_str(), value.as_str()),
                None => batch.remove(&self.data, key.as_str()),
            }
        }
        batch.commit().context("commit batch")?;
        Ok(CommitOutcome::Committed)
    }

    fn rollback(self: Box<Self>) {
        // Staged writes are dropped with the transaction.
    }
}

/// In-memory store for unit tests, with a hook to force commit conflicts so
/// the bounded re-process retry can be exercised.
#[derive(Default)]
pub struct MemoryStore {
    map: Arc<Mutex<HashMap<String, String>>>,
    commit_generation: Arc<AtomicU64>,
    forced_conflicts: Arc<AtomicUsize>,
    schema_version: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` non-empty commits report `Conflict`.
    pub fn force_conflicts(&self, n: usize) {
        self.forced_conflicts.store(n, Ordering::SeqCst);
    }

    pub fn schema_version(&self) -> u64 {
        self.schema_version.load(Ordering::SeqCst)
    }
}

impl Datastore for MemoryStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.map.lock().unwrap().get(key).cloned())
    }

    fn begin(&self) -> Box<dyn Transaction> {
        Box::new(MemoryTransaction {
            map: self.map.clone(),
            staged: BTreeMap::new(),
            commit_generation: self.commit_generation.clone(),
            start_generation: self.commit_generation.load(Ordering::SeqCst),
            forced_conflicts: self.forced_conflicts.clone(),
        })
    }

    fn upgrade_schema(&self) -> anyhow::Result<()> {
        self.schema_version
            .store(CURRENT_SCHEMA_VERSION, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryTransaction {
    map: Arc<Mutex<HashMap<String, String>>>,
    staged: BTreeMap<String, Option<String>>,
    commit_generation: Arc<AtomicU64>,
    start_generation: u64,
    forced_conflicts: Arc<AtomicUsize>,
}

impl Transaction for MemoryTransaction {
    fn get(&self, key: &str) -> Option<String> {
        if let Some(staged) = self.staged.get(key) {
            return staged.clone();
        }
        self.map.lock().unwrap().get(key).cloned()
    }

    fn put(&mut self, key: &str, value: &str) {
        self.staged.insert(key.to_string(), Some(value.to_string()));
    }

    fn delete(&mut self, key: &str) {
        self.staged.insert(key.to_string(), None);
    }

    fn write_count(&self) -> usize {
        self.staged.len()
    }

    fn commit(self: Box<Self>) -> anyhow::Result<CommitOutcome> {
        if self.staged.is_empty() {
            return Ok(CommitOutcome::Committed);
        }
        if self
            .forced_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Ok(CommitOutcome::Conflict);
        }
        if self
            .commit_generation
            .compare_exchange(
                self.start_generation,
                self.start_generation + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return Ok(CommitOutcome::Conflict);
        }
        let mut map = self.map.lock().unwrap();
        for (key, staged) in self.staged {
            match staged {
                Some(value) => {
                    map.insert(key, value);
                }
                None => {
                    map.remove(&key);
                }
            }
        }
        Ok(CommitOutcome::Committed)
    }

    fn rollback(self: Box<Self>) {}
}
