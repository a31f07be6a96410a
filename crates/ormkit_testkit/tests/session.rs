//! Session scenarios against in-memory storage.

use ormkit_core::{CoreError, PersistAction, PersistReason, PersistenceState, SessionConfig, TransactionState};
use ormkit_testkit::prelude::*;
use std::sync::Arc;

#[test]
fn created_author_is_synchronized_after_commit() {
    let store = TestStore::new();
    let mut session = store.session();
    let tx = session.begin_transaction().unwrap();
    let author = new_author(&mut session, "Ursula").unwrap();
    session.commit_transaction(tx).unwrap();

    let state = session.entity_state(&author).unwrap();
    assert_eq!(state.persistence_state(), PersistenceState::Synchronized);
    assert!(store.storage.row(&author).is_some());
    assert!(session.change_registry().is_empty());
}

#[test]
fn nested_rollback_keeps_the_outer_transaction() {
    let store = TestStore::new();
    let mut session = store.session();
    let t1 = session.begin_transaction().unwrap();
    let author = new_author(&mut session, "Before").unwrap();

    let t2 = session.begin_transaction().unwrap();
    session.set_field(&author, "name", text("During")).unwrap();
    session.rollback_transaction(t2).unwrap();

    assert_eq!(session.get_field(&author, "name").unwrap(), text("Before"));
    let active = session.active_transaction().unwrap();
    assert_eq!(active.id(), t1);
    assert_eq!(active.state(), TransactionState::Active);
    assert!(session.transaction_by_id(t2).is_none());

    session.commit_transaction(t1).unwrap();
    let mut reader = store.session();
    assert_eq!(reader.get_field(&author, "name").unwrap(), text("Before"));
}

#[test]
fn failed_flush_restores_every_new_entity() {
    let store = TestStore::new();
    let mut session = store.failing_session(SessionConfig::default());
    let tx = session.begin_transaction().unwrap();
    let mut tags = Vec::new();
    for i in 0..5 {
        let key = session.create_entity(TAG).unwrap().key();
        session.set_field(&key, "label", text(&format!("tag{i}"))).unwrap();
        tags.push(key);
    }

    session.driver_mut().fail_after(3);
    let err = session.persist(PersistReason::Manual).unwrap_err();
    assert!(matches!(err, CoreError::Storage { .. }));

    for (i, key) in tags.iter().enumerate() {
        let state = session.entity_state(key).unwrap();
        assert_eq!(state.persistence_state(), PersistenceState::New);
        assert_eq!(session.get_field(key, "label").unwrap(), text(&format!("tag{i}")));
    }
    assert_eq!(session.change_registry().len(), 5);
    assert!(session.active_transaction().unwrap().is_doomed());

    assert!(session.commit_transaction(tx).is_err());
    assert_eq!(session.transaction_depth(), 0);
    assert_eq!(store.storage.row_count(), 0);
}

#[test]
fn failed_flush_without_transaction_keeps_changes_for_retry() {
    let store = TestStore::new();
    let config = SessionConfig::new().non_transactional_entity_states(true);
    let mut session = store.failing_session(config);
    let tag = session.create_entity(TAG).unwrap().key();
    session.set_field(&tag, "label", text("retry")).unwrap();

    session.driver_mut().fail_after(0);
    assert!(session.persist(PersistReason::Manual).is_err());
    assert_eq!(store.storage.row_count(), 0);

    session.driver_mut().heal();
    session.persist(PersistReason::Manual).unwrap();
    assert!(store.storage.row(&tag).is_some());
    assert!(!session.driver().inner().in_transaction());
}

#[test]
fn flush_orders_inserts_updates_links_removes() {
    let store = TestStore::new();
    let (mut session, log) = store.recording_session();
    let (author, doomed) = session
        .transaction(|s| {
            let author = new_author(s, "Octavia")?;
            let doomed = new_book(s, "Draft", None)?;
            Ok((author, doomed))
        })
        .unwrap();
    log.lock().clear();

    session
        .transaction(|s| {
            s.set_field(&author, "name", text("Octavia E."))?;
            new_book(s, "Kindred", Some(&author))?;
            s.remove_entity(&doomed)
        })
        .unwrap();

    let rank = |action: &PersistAction| match action {
        PersistAction::Insert { .. } => 0,
        PersistAction::Update { .. } => 1,
        PersistAction::LinkAdd { .. } | PersistAction::LinkRemove { .. } => 2,
        PersistAction::Remove { .. } => 3,
    };
    let ranks: Vec<u8> = log.lock().iter().map(rank).collect();
    assert!(ranks.windows(2).all(|w| w[0] <= w[1]), "out of order: {ranks:?}");
    for expected in [0, 1, 2, 3] {
        assert!(ranks.contains(&expected), "missing rank {expected}: {ranks:?}");
    }
    assert!(store.storage.row(&doomed).is_none());
}

#[test]
fn one_wrapper_per_key() {
    let store = TestStore::new();
    let mut writer = store.session();
    let author = writer.transaction(|s| new_author(s, "Iain")).unwrap();

    let mut session = store.session();
    let first = session.fetch(&author).unwrap().unwrap();
    let second = session.fetch(&author).unwrap().unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(session.cached_count(), 1);
}

#[test]
fn refresh_sees_changes_from_other_sessions() {
    let store = TestStore::new();
    let mut writer = store.session();
    let author = writer.transaction(|s| new_author(s, "Old")).unwrap();

    let mut reader = store.session();
    assert_eq!(reader.get_field(&author, "name").unwrap(), text("Old"));

    writer
        .transaction(|s| s.set_field(&author, "name", text("New")))
        .unwrap();
    assert_eq!(reader.get_field(&author, "name").unwrap(), text("Old"));

    reader.refresh(&author).unwrap();
    assert_eq!(reader.get_field(&author, "name").unwrap(), text("New"));
    assert_eq!(reader.get_field(&author, "version").unwrap(), ormkit_core::Value::Int(2));
}

#[test]
fn lazy_keys_are_final_after_commit() {
    let store = TestStore::new();
    let mut session = store.session_with(SessionConfig::new().lazy_key_generation(true));
    let tx = session.begin_transaction().unwrap();
    let author = session.create_entity(AUTHOR).unwrap();
    let book = session.create_entity(BOOK).unwrap();
    assert!(author.key().is_temporary());
    session.set_field(&author.key(), "name", text("Ann")).unwrap();
    session.add_to_set(&author.key(), "books", &book.key()).unwrap();
    session.commit_transaction(tx).unwrap();

    let (author, book) = (author.key(), book.key());
    assert!(!author.is_temporary());
    assert!(!book.is_temporary());
    assert_eq!(store.storage.links(&author, "books"), vec![book.clone()]);
    assert_eq!(
        session.get_field(&book, "author").unwrap(),
        ormkit_core::Value::Ref(author.clone())
    );
    assert!(session.entity_state(&author).is_some());
}

#[test]
fn pinned_entities_block_commit() {
    let store = TestStore::new();
    let mut session = store.session();
    let tx = session.begin_transaction().unwrap();
    let author = new_author(&mut session, "Pinned").unwrap();
    session.pin(&author);

    session.persist(PersistReason::Manual).unwrap();
    assert_eq!(
        session.entity_state(&author).unwrap().persistence_state(),
        PersistenceState::New
    );
    assert!(matches!(
        session.commit_transaction(tx),
        Err(CoreError::PinnedEntities { .. })
    ));
}
