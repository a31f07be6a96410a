//! In-memory storage for tests and ephemeral sessions.

use crate::error::{CoreError, CoreResult};
use crate::storage::{FetchedRow, PersistAction, StorageDriver};
use crate::transaction::TransactionInfo;
use ormkit_types::{Key, MergeBehavior, Tuple};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

#[derive(Debug, Clone, Default)]
struct StoreData {
    rows: HashMap<Key, Tuple>,
    links: HashMap<(Key, String), Vec<Key>>,
}

impl StoreData {
    fn apply(&mut self, action: &PersistAction) -> CoreResult<()> {
        match action {
            PersistAction::Insert { key, tuple } => {
                if self.rows.contains_key(key) {
                    return Err(CoreError::storage(format!("duplicate key {key}")));
                }
                self.rows.insert(key.clone(), tuple.clone());
            }
            PersistAction::Update { key, tuple } => {
                let row = self
                    .rows
                    .get_mut(key)
                    .ok_or_else(|| CoreError::storage(format!("no row for {key}")))?;
                row.merge(tuple, MergeBehavior::PreferDifference)?;
            }
            PersistAction::Remove { key } => {
                if self.rows.remove(key).is_none() {
                    return Err(CoreError::storage(format!("no row for {key}")));
                }
                self.links.retain(|(owner, _), _| owner != key);
                for items in self.links.values_mut() {
                    items.retain(|item| item != key);
                }
            }
            PersistAction::LinkAdd { owner, field, item } => {
                let items = self.links.entry((owner.clone(), field.clone())).or_default();
                if !items.contains(item) {
                    items.push(item.clone());
                }
            }
            PersistAction::LinkRemove { owner, field, item } => {
                if let Some(items) = self.links.get_mut(&(owner.clone(), field.clone())) {
                    items.retain(|i| i != item);
                }
            }
        }
        Ok(())
    }

    fn fetch(&self, key: &Key) -> Option<FetchedRow> {
        self.rows.get_key_value(key).map(|(k, t)| FetchedRow {
            key: k.clone(),
            tuple: t.clone(),
        })
    }

    fn links(&self, owner: &Key, field: &str) -> Vec<Key> {
        self.links
            .get(&(owner.clone(), field.to_owned()))
            .cloned()
            .unwrap_or_default()
    }
}

/// Shared committed data.
///
/// Cloning yields another handle to the same store, so several drivers (and
/// the test asserting on them) observe one database.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    data: Arc<Mutex<StoreData>>,
}

impl MemoryStorage {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a driver over this store.
    #[must_use]
    pub fn driver(&self) -> MemoryDriver {
        MemoryDriver {
            storage: self.clone(),
            tx: None,
        }
    }

    /// Seeds a committed row.
    pub fn insert_row(&self, key: Key, tuple: Tuple) {
        self.data.lock().rows.insert(key, tuple);
    }

    /// Seeds a committed link.
    pub fn insert_link(&self, owner: Key, field: &str, item: Key) {
        let _ = self.data.lock().apply(&PersistAction::LinkAdd {
            owner,
            field: field.to_owned(),
            item,
        });
    }

    /// Returns a committed row.
    #[must_use]
    pub fn row(&self, key: &Key) -> Option<Tuple> {
        self.data.lock().rows.get(key).cloned()
    }

    /// Returns the committed members of an entity set.
    #[must_use]
    pub fn links(&self, owner: &Key, field: &str) -> Vec<Key> {
        self.data.lock().links(owner, field)
    }

    /// Number of committed rows.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.data.lock().rows.len()
    }
}

#[derive(Debug)]
struct TxWork {
    data: StoreData,
    savepoints: Vec<(String, StoreData)>,
}

/// Driver over a [`MemoryStorage`].
///
/// A transaction works on a private copy of the store that replaces the
/// shared data on commit. Savepoints are stacked copies. Persisting outside
/// a transaction autocommits.
#[derive(Debug)]
pub struct MemoryDriver {
    storage: MemoryStorage,
    tx: Option<TxWork>,
}

impl MemoryDriver {
    /// Returns the underlying store.
    #[must_use]
    pub fn storage(&self) -> &MemoryStorage {
        &self.storage
    }

    /// Returns true while a physical transaction is open.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    fn work(&mut self) -> CoreResult<&mut TxWork> {
        self.tx
            .as_mut()
            .ok_or_else(|| CoreError::storage("no open transaction"))
    }
}

impl StorageDriver for MemoryDriver {
    fn persist(&mut self, actions: &[PersistAction], _for_query: bool) -> CoreResult<()> {
        trace!(count = actions.len(), "memory persist");
        match self.tx.as_mut() {
            Some(work) => actions.iter().try_for_each(|a| work.data.apply(a)),
            None => {
                let mut data = self.storage.data.lock();
                for action in actions {
                    data.apply(action)?;
                }
                Ok(())
            }
        }
    }

    fn fetch_entity_state(&mut self, key: &Key) -> CoreResult<Option<FetchedRow>> {
        Ok(match &self.tx {
            Some(work) => work.data.fetch(key),
            None => self.storage.data.lock().fetch(key),
        })
    }

    fn fetch_entity_set(&mut self, owner: &Key, field: &str) -> CoreResult<Vec<Key>> {
        Ok(match &self.tx {
            Some(work) => work.data.links(owner, field),
            None => self.storage.data.lock().links(owner, field),
        })
    }

    fn begin_transaction(&mut self, _tx: &TransactionInfo) -> CoreResult<()> {
        if self.tx.is_some() {
            return Err(CoreError::storage("transaction already open"));
        }
        self.tx = Some(TxWork {
            data: self.storage.data.lock().clone(),
            savepoints: Vec::new(),
        });
        Ok(())
    }

    fn create_savepoint(&mut self, _tx: &TransactionInfo, name: &str) -> CoreResult<()> {
        let work = self.work()?;
        let snapshot = work.data.clone();
        work.savepoints.push((name.to_owned(), snapshot));
        Ok(())
    }

    fn release_savepoint(&mut self, _tx: &TransactionInfo, name: &str) -> CoreResult<()> {
        let work = self.work()?;
        let index = work
            .savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| CoreError::storage(format!("unknown savepoint {name}")))?;
        work.savepoints.truncate(index);
        Ok(())
    }

    fn rollback_to_savepoint(&mut self, _tx: &TransactionInfo, name: &str) -> CoreResult<()> {
        let work = self.work()?;
        let index = work
            .savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| CoreError::storage(format!("unknown savepoint {name}")))?;
        let (_, snapshot) = work.savepoints.swap_remove(index);
        work.savepoints.truncate(index);
        work.data = snapshot;
        Ok(())
    }

    fn commit_transaction(&mut self, _tx: &TransactionInfo) -> CoreResult<()> {
        let work = self
            .tx
            .take()
            .ok_or_else(|| CoreError::storage("no open transaction"))?;
        *self.storage.data.lock() = work.data;
        Ok(())
    }

    fn rollback_transaction(&mut self, _tx: &TransactionInfo) -> CoreResult<()> {
        self.tx
            .take()
            .map(|_| ())
            .ok_or_else(|| CoreError::storage("no open transaction"))
    }
}
