//! Test fixtures and store helpers.
//!
//! Provides a library-shaped domain model, a store bundling it with
//! in-memory storage, and drivers for failure and ordering tests.

use ormkit_core::{
    CoreError, CoreResult, Domain, DomainConfig, DomainModel, EntityTypeId, FetchedRow, Key, MemoryDriver,
    MemoryStorage, PersistAction, Session, SessionConfig, StorageDriver, TransactionInfo, TypeInfo, Value,
    VersionMode,
};
use parking_lot::Mutex;
use std::sync::{Arc, Once};
use tracing_subscriber::EnvFilter;

/// Author entity: `name` (required), `version` (auto), `books` (paired set).
pub const AUTHOR: EntityTypeId = EntityTypeId::new(1);
/// Book entity: `title`, `author` (reference), `tags` (set).
pub const BOOK: EntityTypeId = EntityTypeId::new(2);
/// Tag entity: `label`.
pub const TAG: EntityTypeId = EntityTypeId::new(3);

/// Builds the library model used across the tests.
pub fn library_model() -> DomainModel {
    DomainModel::new(vec![
        TypeInfo::entity(AUTHOR, "Author")
            .required("name")
            .version("version", VersionMode::Auto)
            .entity_set("books", BOOK, Some("author")),
        TypeInfo::entity(BOOK, "Book")
            .field("title")
            .reference("author", AUTHOR)
            .entity_set("tags", TAG, None),
        TypeInfo::entity(TAG, "Tag").field("label"),
    ])
    .expect("library model is valid")
}

static TRACING: Once = Once::new();

/// Installs a test-friendly subscriber honouring `RUST_LOG`. Safe to call
/// from every test.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// A domain over shared in-memory storage.
///
/// Every session opened here sees the same committed rows.
pub struct TestStore {
    /// Process-wide state for the library model.
    pub domain: Arc<Domain>,
    /// The committed data.
    pub storage: MemoryStorage,
}

impl TestStore {
    /// Creates an empty store with a fresh domain.
    pub fn new() -> Self {
        init_tracing();
        Self {
            domain: Domain::new(library_model(), DomainConfig::default()),
            storage: MemoryStorage::new(),
        }
    }

    /// Opens a session with the default configuration.
    pub fn session(&self) -> Session<MemoryDriver> {
        self.session_with(SessionConfig::default())
    }

    /// Opens a session with `config`.
    pub fn session_with(&self, config: SessionConfig) -> Session<MemoryDriver> {
        self.domain.open_session(self.storage.driver(), config)
    }

    /// Opens a session whose driver fails on demand.
    pub fn failing_session(&self, config: SessionConfig) -> Session<FailingDriver> {
        self.domain
            .open_session(FailingDriver::new(self.storage.driver()), config)
    }

    /// Opens a session whose driver records every persisted action.
    pub fn recording_session(&self) -> (Session<RecordingDriver>, Arc<Mutex<Vec<PersistAction>>>) {
        let driver = RecordingDriver::new(self.storage.driver());
        let log = driver.log();
        (self.domain.open_session(driver, SessionConfig::default()), log)
    }
}

impl Default for TestStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Creates an author named `name`. Needs an open transaction.
pub fn new_author<D: StorageDriver>(session: &mut Session<D>, name: &str) -> CoreResult<Key> {
    let key = session.create_entity(AUTHOR)?.key();
    session.set_field(&key, "name", text(name))?;
    Ok(key)
}

/// Creates a book titled `title`, optionally filed under `author`.
pub fn new_book<D: StorageDriver>(session: &mut Session<D>, title: &str, author: Option<&Key>) -> CoreResult<Key> {
    let key = session.create_entity(BOOK)?.key();
    session.set_field(&key, "title", text(title))?;
    if let Some(author) = author {
        session.add_to_set(author, "books", &key)?;
    }
    Ok(key)
}

/// Shorthand for a text value.
pub fn text(s: &str) -> Value {
    Value::Text(s.to_owned())
}

/// Driver that lets a set number of actions through, then fails.
///
/// Actions are applied one by one, so a failing batch leaves the earlier
/// ones written to the underlying transaction.
#[derive(Debug)]
pub struct FailingDriver {
    inner: MemoryDriver,
    budget: Option<usize>,
}

impl FailingDriver {
    /// Wraps `inner` with no failure armed.
    pub fn new(inner: MemoryDriver) -> Self {
        Self { inner, budget: None }
    }

    /// Fails the persist call that would exceed `count` more actions.
    pub fn fail_after(&mut self, count: usize) {
        self.budget = Some(count);
    }

    /// Disarms the failure.
    pub fn heal(&mut self) {
        self.budget = None;
    }

    /// The wrapped driver.
    pub fn inner(&self) -> &MemoryDriver {
        &self.inner
    }
}

impl StorageDriver for FailingDriver {
    fn persist(&mut self, actions: &[PersistAction], for_query: bool) -> CoreResult<()> {
        for action in actions {
            if let Some(budget) = self.budget.as_mut() {
                if *budget == 0 {
                    return Err(CoreError::storage(format!("injected failure at {}", action.key())));
                }
                *budget -= 1;
            }
            self.inner.persist(std::slice::from_ref(action), for_query)?;
        }
        Ok(())
    }

    fn fetch_entity_state(&mut self, key: &Key) -> CoreResult<Option<FetchedRow>> {
        self.inner.fetch_entity_state(key)
    }

    fn fetch_entity_set(&mut self, owner: &Key, field: &str) -> CoreResult<Vec<Key>> {
        self.inner.fetch_entity_set(owner, field)
    }

    fn begin_transaction(&mut self, tx: &TransactionInfo) -> CoreResult<()> {
        self.inner.begin_transaction(tx)
    }

    fn create_savepoint(&mut self, tx: &TransactionInfo, name: &str) -> CoreResult<()> {
        self.inner.create_savepoint(tx, name)
    }

    fn release_savepoint(&mut self, tx: &TransactionInfo, name: &str) -> CoreResult<()> {
        self.inner.release_savepoint(tx, name)
    }

    fn rollback_to_savepoint(&mut self, tx: &TransactionInfo, name: &str) -> CoreResult<()> {
        self.inner.rollback_to_savepoint(tx, name)
    }

    fn commit_transaction(&mut self, tx: &TransactionInfo) -> CoreResult<()> {
        self.inner.commit_transaction(tx)
    }

    fn rollback_transaction(&mut self, tx: &TransactionInfo) -> CoreResult<()> {
        self.inner.rollback_transaction(tx)
    }
}

/// Driver that keeps a copy of every action it is asked to persist.
#[derive(Debug)]
pub struct RecordingDriver {
    inner: MemoryDriver,
    log: Arc<Mutex<Vec<PersistAction>>>,
}

impl RecordingDriver {
    /// Wraps `inner`.
    pub fn new(inner: MemoryDriver) -> Self {
        Self {
            inner,
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Shared handle to the recorded actions.
    pub fn log(&self) -> Arc<Mutex<Vec<PersistAction>>> {
        Arc::clone(&self.log)
    }
}

impl StorageDriver for RecordingDriver {
    fn persist(&mut self, actions: &[PersistAction], for_query: bool) -> CoreResult<()> {
        self.log.lock().extend_from_slice(actions);
        self.inner.persist(actions, for_query)
    }

    fn fetch_entity_state(&mut self, key: &Key) -> CoreResult<Option<FetchedRow>> {
        self.inner.fetch_entity_state(key)
    }

    fn fetch_entity_set(&mut self, owner: &Key, field: &str) -> CoreResult<Vec<Key>> {
        self.inner.fetch_entity_set(owner, field)
    }

    fn begin_transaction(&mut self, tx: &TransactionInfo) -> CoreResult<()> {
        self.inner.begin_transaction(tx)
    }

    fn create_savepoint(&mut self, tx: &TransactionInfo, name: &str) -> CoreResult<()> {
        self.inner.create_savepoint(tx, name)
    }

    fn release_savepoint(&mut self, tx: &TransactionInfo, name: &str) -> CoreResult<()> {
        self.inner.release_savepoint(tx, name)
    }

    fn rollback_to_savepoint(&mut self, tx: &TransactionInfo, name: &str) -> CoreResult<()> {
        self.inner.rollback_to_savepoint(tx, name)
    }

    fn commit_transaction(&mut self, tx: &TransactionInfo) -> CoreResult<()> {
        self.inner.commit_transaction(tx)
    }

    fn rollback_transaction(&mut self, tx: &TransactionInfo) -> CoreResult<()> {
        self.inner.rollback_transaction(tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_sessions_share_committed_rows() {
        let store = TestStore::new();
        let mut writer = store.session();
        let author = writer.transaction(|s| new_author(s, "Tolkien")).unwrap();

        let mut reader = store.session();
        assert_eq!(reader.get_field(&author, "name").unwrap(), text("Tolkien"));
    }

    #[test]
    fn failing_driver_stops_after_budget() {
        let store = TestStore::new();
        let mut driver = FailingDriver::new(store.storage.driver());
        driver.fail_after(1);
        let a = store.domain.generate_key(TAG, false).unwrap();
        let b = store.domain.generate_key(TAG, false).unwrap();
        let tuple = ormkit_core::Tuple::from_values(vec![text("x")]);
        let actions = vec![
            PersistAction::Insert {
                key: a.clone(),
                tuple: tuple.clone(),
            },
            PersistAction::Insert { key: b.clone(), tuple },
        ];
        assert!(driver.persist(&actions, false).is_err());
        assert!(store.storage.row(&a).is_some());
        assert!(store.storage.row(&b).is_none());
    }
}
