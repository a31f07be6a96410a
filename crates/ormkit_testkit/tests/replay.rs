//! Operation capture, replay and the async surface.

use ormkit_core::{
    CoreError, Operation, OperationCapturer, OperationLog, OperationLogType, PersistReason, SessionConfig,
};
use ormkit_testkit::prelude::*;
use parking_lot::Mutex;
use proptest::prelude::*;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn capture(store: &TestStore, config: SessionConfig, script: &[EditStep]) -> (OperationLog, ScriptKeys) {
    let mut session = store.session_with(config);
    let log = Arc::new(Mutex::new(OperationLog::new()));
    let tx = session.begin_transaction().unwrap();
    let keys = {
        let mut scope = OperationCapturer::attach(&mut session, Arc::clone(&log));
        run_script(&mut *scope, script).unwrap()
    };
    session.commit_transaction(tx).unwrap();
    let captured = log.lock().clone();
    (captured, keys)
}

proptest! {
    #![proptest_config(PropTestConfig::quick().to_proptest_config())]

    #[test]
    fn replay_reproduces_the_source(script in edit_script_strategy(16)) {
        let source = TestStore::new();
        let (log, keys) = capture(&source, SessionConfig::default(), &script);

        let target = TestStore::new();
        let mut session = target.session();
        let tx = session.begin_transaction().unwrap();
        let outcome = log.replay(&mut session).unwrap();
        session.commit_transaction(tx).unwrap();

        prop_assert!(outcome.mapping.is_empty());
        for key in keys.all() {
            prop_assert_eq!(target.storage.row(key), source.storage.row(key));
        }
        for author in &keys.authors {
            prop_assert_eq!(
                target.storage.links(author, "books"),
                source.storage.links(author, "books")
            );
        }
    }

    #[test]
    fn captured_keys_are_final_after_lazy_flush(script in edit_script_strategy(8)) {
        let source = TestStore::new();
        let (log, keys) = capture(&source, SessionConfig::new().lazy_key_generation(true), &script);
        // Books removed before the flush never get a final key.
        for op in log.iter() {
            let settled = op.keys().into_iter().all(|k| !k.is_temporary() || keys.removed.contains(k));
            prop_assert!(settled, "temporary key in {:?}", op);
        }
        prop_assert!(keys.authors.iter().all(|k| k.is_temporary()));
    }
}

#[test]
fn temporary_keys_are_generated_by_the_target() {
    let source = TestStore::new();
    let mut session = source.session_with(SessionConfig::new().lazy_key_generation(true));
    let log = Arc::new(Mutex::new(OperationLog::new()));
    session.begin_transaction().unwrap();
    let author = {
        let mut scope = OperationCapturer::attach(&mut session, Arc::clone(&log));
        new_author(&mut *scope, "Unsaved").unwrap()
    };
    assert!(author.is_temporary());

    let target = TestStore::new();
    let mut replayer = target.session();
    let tx = replayer.begin_transaction().unwrap();
    let outcome = log.lock().replay(&mut replayer).unwrap();
    replayer.commit_transaction(tx).unwrap();

    let stored = outcome.mapping.resolve(&author);
    assert!(!stored.is_temporary());
    assert_eq!(target.storage.row_count(), 1);
    assert_eq!(replayer.get_field(&stored, "name").unwrap(), text("Unsaved"));
}

#[test]
fn outermost_log_skips_nested_writes() {
    let store = TestStore::new();
    let mut session = store.session();
    let author = session.transaction(|s| new_author(s, "A")).unwrap();

    let outermost = Arc::new(Mutex::new(OperationLog::new()));
    let system = Arc::new(Mutex::new(OperationLog::new()));
    session.begin_transaction().unwrap();
    {
        let mut first = OperationCapturer::attach(&mut session, Arc::clone(&outermost));
        let mut second = OperationCapturer::attach_with(
            &mut *first,
            Arc::clone(&system),
            OperationLogType::SystemOperationLog,
        );
        new_book(&mut *second, "B", Some(&author)).unwrap();
    }

    let composite = |log: &OperationLog| log.iter().any(|op| matches!(op, Operation::EntitySetAdd { .. }));
    let paired_write = |log: &OperationLog| {
        log.iter()
            .any(|op| matches!(op, Operation::FieldSet { field, .. } if field == "author"))
    };
    let outermost = outermost.lock();
    let system = system.lock();
    assert!(composite(&outermost));
    assert!(!paired_write(&outermost));
    assert!(!composite(&system));
    assert!(paired_write(&system));
}

#[test]
fn identifiers_follow_replay() {
    let source = TestStore::new();
    let mut session = source.session();
    let log = Arc::new(Mutex::new(OperationLog::new()));
    session.begin_transaction().unwrap();
    let author = {
        let mut scope = OperationCapturer::attach(&mut session, Arc::clone(&log));
        let author = new_author(&mut *scope, "Named").unwrap();
        scope.assign_identifier(&author, "main-author").unwrap();
        author
    };

    let target = TestStore::new();
    let mut replayer = target.session();
    replayer.begin_transaction().unwrap();
    let outcome = log.lock().replay(&mut replayer).unwrap();
    assert_eq!(outcome.identified.get("main-author"), Some(&author));
    assert_eq!(replayer.identified("main-author"), Some(&author));
}

#[tokio::test]
async fn async_commit_stores_rows() {
    let store = TestStore::new();
    let mut session = store.session();
    let cancel = CancellationToken::new();
    let tx = session.begin_transaction_async(&cancel).await.unwrap();
    let author = new_author(&mut session, "Async").unwrap();
    session.commit_transaction_async(tx, &cancel).await.unwrap();
    assert!(store.storage.row(&author).is_some());

    let mut reader = store.session();
    let fetched = reader.fetch_async(&author, &cancel).await.unwrap();
    assert_eq!(fetched.unwrap().key(), author);
}

#[tokio::test]
async fn cancelled_commit_rolls_back() {
    let store = TestStore::new();
    let mut session = store.session();
    let cancel = CancellationToken::new();
    let tx = session.begin_transaction_async(&cancel).await.unwrap();
    new_author(&mut session, "Never").unwrap();

    cancel.cancel();
    let err = session.commit_transaction_async(tx, &cancel).await.unwrap_err();
    assert!(matches!(err, CoreError::Cancelled));
    assert_eq!(session.transaction_depth(), 0);
    assert_eq!(store.storage.row_count(), 0);
}

#[tokio::test]
async fn cancelled_flush_keeps_pending_changes() {
    let store = TestStore::new();
    let mut session = store.session();
    session.begin_transaction().unwrap();
    new_author(&mut session, "Pending").unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = session
        .persist_async(PersistReason::Manual, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Cancelled));
    assert_eq!(session.change_registry().len(), 1);
}

#[tokio::test]
async fn cancelled_replay_stops() {
    let source = TestStore::new();
    let (log, _) = capture(
        &source,
        SessionConfig::default(),
        &[EditStep::AddAuthor { name: "Gone".into() }],
    );

    let target = TestStore::new();
    let mut session = target.session();
    session.begin_transaction().unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = log.replay_async(&mut session, &cancel).await.unwrap_err();
    assert!(matches!(err, CoreError::Cancelled));
    assert!(session.change_registry().is_empty());
}
