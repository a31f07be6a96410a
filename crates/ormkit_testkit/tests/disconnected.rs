//! Offline editing: attach, local transactions, apply, snapshots.

use ormkit_core::{
    CoreError, DisconnectedConfig, DisconnectedSnapshot, DisconnectedState, Key, MemoryDriver, MergeMode,
    PersistReason, Session, Value, VersionInfo, VersionsUsage,
};
use ormkit_testkit::prelude::*;

fn offline(store: &TestStore) -> Session<MemoryDriver> {
    let mut session = store.session();
    session
        .attach(DisconnectedState::new(DisconnectedConfig::default()).unwrap())
        .unwrap();
    session
}

/// Pulls `key` into the attached state's baseline.
fn load_baseline(session: &mut Session<MemoryDriver>, key: &Key) {
    session.disconnected_mut().unwrap().connect();
    session.fetch(key).unwrap().unwrap();
    session.disconnected_mut().unwrap().disconnect();
}

fn name_slot(store: &TestStore) -> usize {
    store.domain.model().field(AUTHOR, "name").unwrap().slot().unwrap()
}

#[test]
fn edits_stay_local_until_applied() {
    let store = TestStore::new();
    let mut writer = store.session();
    let author = writer.transaction(|s| new_author(s, "Online")).unwrap();

    let mut session = offline(&store);
    load_baseline(&mut session, &author);
    session.set_field(&author, "name", text("Offline")).unwrap();
    session.persist(PersistReason::Manual).unwrap();

    let slot = name_slot(&store);
    assert_eq!(store.storage.row(&author).unwrap().get(slot), Some(&text("Online")));
    let state = session.disconnected().unwrap();
    assert_eq!(state.operations().unwrap().len(), 1);
    let baseline = state.baseline(&author).unwrap().unwrap();
    assert_eq!(baseline.tuple.as_ref().unwrap().get(slot), Some(&text("Online")));

    let mapping = session.apply_disconnected_changes().unwrap();
    assert!(mapping.is_empty());
    assert_eq!(store.storage.row(&author).unwrap().get(slot), Some(&text("Offline")));

    let state = session.disconnected().unwrap();
    assert!(state.operations().unwrap().is_empty());
    assert_eq!(state.versions().get(&author), Some(&VersionInfo::from_values(vec![Value::Int(2)])));
}

#[test]
fn unread_rows_are_missing_while_disconnected() {
    let store = TestStore::new();
    let mut writer = store.session();
    let author = writer.transaction(|s| new_author(s, "Hidden")).unwrap();

    let mut session = offline(&store);
    assert!(session.fetch(&author).unwrap().is_none());
    assert!(matches!(
        session.get_field(&author, "name"),
        Err(CoreError::EntityNotFound { .. })
    ));
}

#[test]
fn new_entities_get_store_keys_on_apply() {
    let store = TestStore::new();
    let mut session = offline(&store);
    let author = session.create_entity(AUTHOR).unwrap();
    let temporary = author.key();
    assert!(temporary.is_temporary());
    session.set_field(&temporary, "name", text("Fresh")).unwrap();
    let book = new_book(&mut session, "First", Some(&temporary)).unwrap();

    let mapping = session.apply_disconnected_changes().unwrap();
    assert_eq!(mapping.len(), 2);
    let fixed = author.key();
    assert_eq!(mapping.resolve(&temporary), fixed);
    assert!(!fixed.is_temporary());

    let stored_book = mapping.resolve(&book);
    assert_eq!(store.storage.links(&fixed, "books"), vec![stored_book.clone()]);
    assert_eq!(session.get_field(&fixed, "name").unwrap(), text("Fresh"));
    assert_eq!(
        session.get_field(&stored_book, "author").unwrap(),
        Value::Ref(fixed.clone())
    );
}

#[test]
fn stale_baseline_is_a_version_conflict() {
    let store = TestStore::new();
    let mut writer = store.session();
    let author = writer.transaction(|s| new_author(s, "Base")).unwrap();

    let mut session = offline(&store);
    load_baseline(&mut session, &author);
    session.set_field(&author, "name", text("Mine")).unwrap();

    writer
        .transaction(|s| s.set_field(&author, "name", text("Theirs")))
        .unwrap();

    let err = session.apply_disconnected_changes().unwrap_err();
    assert!(err.is_version_conflict());
    let slot = name_slot(&store);
    assert_eq!(store.storage.row(&author).unwrap().get(slot), Some(&text("Theirs")));
    assert_eq!(session.disconnected().unwrap().operations().unwrap().len(), 1);
    assert_eq!(session.get_field(&author, "name").unwrap(), text("Mine"));

    // Accept the current row as the new baseline, then retry.
    let current = store.storage.row(&author).unwrap();
    session
        .disconnected_mut()
        .unwrap()
        .register_entity_state(
            &author,
            Some(current),
            VersionInfo::from_values(vec![Value::Int(2)]),
            MergeMode::PreferNew,
        )
        .unwrap();
    session.apply_disconnected_changes().unwrap();
    assert_eq!(store.storage.row(&author).unwrap().get(slot), Some(&text("Mine")));
}

#[test]
fn disabled_validation_overwrites() {
    let store = TestStore::new();
    let mut writer = store.session();
    let author = writer.transaction(|s| new_author(s, "Base")).unwrap();

    let config = DisconnectedConfig::new().versions_usage(VersionsUsage {
        validate: false,
        update: true,
    });
    let mut session = store.session();
    session.attach(DisconnectedState::new(config).unwrap()).unwrap();
    load_baseline(&mut session, &author);
    session.set_field(&author, "name", text("Mine")).unwrap();
    writer
        .transaction(|s| s.set_field(&author, "name", text("Theirs")))
        .unwrap();

    session.apply_disconnected_changes().unwrap();
    let slot = name_slot(&store);
    assert_eq!(store.storage.row(&author).unwrap().get(slot), Some(&text("Mine")));
}

#[test]
fn local_transactions_layer_over_the_state() {
    let store = TestStore::new();
    let mut session = offline(&store);
    let author = new_author(&mut session, "Draft").unwrap();
    session.persist(PersistReason::Manual).unwrap();
    let slot = name_slot(&store);

    let tx = session.begin_transaction().unwrap();
    assert_eq!(session.disconnected().unwrap().transaction_depth(), 1);
    session.set_field(&author, "name", text("Scrapped")).unwrap();
    session.persist(PersistReason::Manual).unwrap();
    session.rollback_transaction(tx).unwrap();

    assert_eq!(session.get_field(&author, "name").unwrap(), text("Draft"));
    let row = session.disconnected().unwrap().row(&author).unwrap().unwrap();
    assert_eq!(row.get(slot), Some(&text("Draft")));

    let tx = session.begin_transaction().unwrap();
    session.set_field(&author, "name", text("Final")).unwrap();
    session.commit_transaction(tx).unwrap();

    let state = session.disconnected().unwrap();
    assert_eq!(state.transaction_depth(), 0);
    assert_eq!(state.row(&author).unwrap().unwrap().get(slot), Some(&text("Final")));
    assert!(state.baseline(&author).unwrap().is_none());
    assert_eq!(store.storage.row_count(), 0);
}

#[test]
fn failed_edits_leave_the_log_applicable() {
    let store = TestStore::new();
    let mut session = offline(&store);
    let author = new_author(&mut session, "Kept").unwrap();
    let recorded = session.disconnected().unwrap().operations().unwrap().len();

    let err = session.create_entity_with_key(&author).unwrap_err();
    assert!(matches!(err, CoreError::IdentityConflict { .. }));
    let values = vec![("name".to_owned(), text("Lost")), ("nope".to_owned(), Value::Int(1))];
    let err = session.initialize_entity(&author, values).unwrap_err();
    assert!(matches!(err, CoreError::UnknownField { .. }));

    assert_eq!(session.get_field(&author, "name").unwrap(), text("Kept"));
    assert_eq!(session.disconnected().unwrap().operations().unwrap().len(), recorded);

    let mapping = session.apply_disconnected_changes().unwrap();
    let stored = mapping.resolve(&author);
    assert_eq!(store.storage.row_count(), 1);
    assert_eq!(session.get_field(&stored, "name").unwrap(), text("Kept"));
}

#[test]
fn cancel_drops_local_changes() {
    let store = TestStore::new();
    let mut writer = store.session();
    let author = writer.transaction(|s| new_author(s, "Kept")).unwrap();

    let mut session = offline(&store);
    load_baseline(&mut session, &author);
    session.set_field(&author, "name", text("Dropped")).unwrap();
    session.create_entity(TAG).unwrap();

    session.cancel_disconnected_changes().unwrap();
    assert_eq!(session.get_field(&author, "name").unwrap(), text("Kept"));
    assert!(session.disconnected().unwrap().operations().unwrap().is_empty());
}

#[test]
fn snapshot_resumes_in_another_session() {
    let store = TestStore::new();
    let mut writer = store.session();
    let author = writer.transaction(|s| new_author(s, "Saved")).unwrap();

    let mut session = offline(&store);
    load_baseline(&mut session, &author);
    session.set_field(&author, "name", text("Travelled")).unwrap();
    let state = session.detach().unwrap();
    assert!(session.disconnected().is_none());

    let bytes = state.snapshot().unwrap().to_cbor().unwrap();
    let snapshot = DisconnectedSnapshot::from_cbor(&bytes).unwrap();
    let restored = DisconnectedState::restore(snapshot, store.domain.model()).unwrap();
    assert_eq!(restored.versions(), state.versions());
    assert_eq!(restored.operations().unwrap().len(), 1);

    let mut resumed = store.session();
    resumed.attach(restored).unwrap();
    assert_eq!(resumed.get_field(&author, "name").unwrap(), text("Travelled"));
    resumed.apply_disconnected_changes().unwrap();

    let slot = name_slot(&store);
    assert_eq!(store.storage.row(&author).unwrap().get(slot), Some(&text("Travelled")));
}

#[test]
fn attach_rules() {
    let store = TestStore::new();
    let mut session = store.session();
    assert!(matches!(session.detach(), Err(CoreError::NotAttached)));
    assert!(matches!(
        session.apply_disconnected_changes(),
        Err(CoreError::NotAttached)
    ));

    let tx = session.begin_transaction().unwrap();
    let state = DisconnectedState::new(DisconnectedConfig::default()).unwrap();
    assert!(session.attach(state).is_err());
    session.rollback_transaction(tx).unwrap();

    let mut session = offline(&store);
    let tx = session.begin_transaction().unwrap();
    assert!(session.detach().is_err());
    session.commit_transaction(tx).unwrap();
    assert!(session.detach().is_ok());
}
