//! Replaying a recorded log against another session.

use super::{KeyMapping, Operation, OperationLog};
use crate::error::{CoreError, CoreResult};
use crate::events::{Channel, EventFilter, EventKind, SessionEvent};
use crate::session::Session;
use crate::storage::StorageDriver;
use ormkit_types::Key;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Result of a replay.
#[derive(Debug, Clone, Default)]
pub struct ReplayOutcome {
    /// Recorded keys to the keys they have in the target session.
    pub mapping: KeyMapping,
    /// Identifiers assigned during the replay, with their target keys.
    pub identified: HashMap<String, Key>,
}

impl OperationLog {
    /// Executes every operation against `target`, in order.
    ///
    /// Needs an open transaction on `target`. Operations that already ran
    /// stay applied when a later one fails; the caller's transaction decides.
    pub fn replay<D: StorageDriver>(&self, target: &mut Session<D>) -> CoreResult<ReplayOutcome> {
        self.prepare_replay(target)?;
        for key in self.prefetch_keys() {
            target.fetch(&key)?;
        }
        self.run(target)
    }

    /// Async [`replay`](Self::replay). Only the prefetch reaches the store
    /// asynchronously.
    pub async fn replay_async<D: StorageDriver>(
        &self,
        target: &mut Session<D>,
        cancel: &CancellationToken,
    ) -> CoreResult<ReplayOutcome> {
        self.prepare_replay(target)?;
        for key in self.prefetch_keys() {
            target.fetch_async(&key, cancel).await?;
        }
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        self.run(target)
    }

    fn prepare_replay<D: StorageDriver>(&self, target: &Session<D>) -> CoreResult<()> {
        if target.active_transaction().is_none() {
            return Err(CoreError::TransactionRequired);
        }
        Ok(())
    }

    fn prefetch_keys(&self) -> Vec<Key> {
        let generated: Vec<&Key> = self
            .iter()
            .filter_map(|op| match op {
                Operation::KeyGenerate { key } | Operation::EntityCreate { key } => Some(key),
                _ => None,
            })
            .collect();
        self.touched_keys()
            .into_iter()
            .filter(|k| !k.is_temporary() && !generated.contains(&k))
            .collect()
    }

    fn run<D: StorageDriver>(&self, target: &mut Session<D>) -> CoreResult<ReplayOutcome> {
        let remaps = Arc::new(Mutex::new(Vec::<KeyMapping>::new()));
        let sink = Arc::clone(&remaps);
        let subscription = target.subscribe(
            Channel::System,
            EventFilter::kind(EventKind::KeysRemapped),
            move |event| {
                if let SessionEvent::KeysRemapped { mapping } = event {
                    sink.lock().push(mapping.clone());
                }
            },
        );

        let mut outcome = ReplayOutcome::default();
        let mut result = Ok(());
        for op in self.iter() {
            result = apply(op, target, &mut outcome);
            for applied in remaps.lock().drain(..) {
                outcome.mapping = outcome.mapping.then(&applied);
                for key in outcome.identified.values_mut() {
                    *key = applied.resolve(key);
                }
            }
            if result.is_err() {
                break;
            }
        }
        target.unsubscribe(subscription);
        result?;

        debug!(
            operations = self.len(),
            remapped = outcome.mapping.len(),
            "operation log replayed"
        );
        Ok(outcome)
    }
}

fn apply<D: StorageDriver>(op: &Operation, target: &mut Session<D>, outcome: &mut ReplayOutcome) -> CoreResult<()> {
    match op.remap_keys(&outcome.mapping) {
        Operation::KeyGenerate { key } => {
            if key.is_temporary() {
                let fresh = target.generate_key(key.type_id())?;
                if fresh != key {
                    outcome.mapping.insert(key, fresh);
                }
            }
        }
        Operation::EntityCreate { key } => {
            target.create_entity_with_key(&key)?;
        }
        Operation::EntityInitialize { key, values } => target.initialize_entity(&key, values)?,
        Operation::FieldSet { key, field, value } => target.set_field(&key, &field, value)?,
        Operation::EntityRemove { key } => target.remove_entity(&key)?,
        Operation::EntitySetAdd { owner, field, item } => {
            target.add_to_set(&owner, &field, &item)?;
        }
        Operation::EntitySetRemove { owner, field, item } => {
            target.remove_from_set(&owner, &field, &item)?;
        }
        Operation::EntitySetClear { owner, field } => target.clear_set(&owner, &field)?,
        Operation::IdentifierAssign { key, identifier } => {
            target.assign_identifier(&key, &identifier)?;
            outcome.identified.insert(identifier, key);
        }
    }
    Ok(())
}
