//! Commit-time validation of touched entities.

use super::Session;
use crate::error::{CoreError, CoreResult};
use crate::model::FieldKind;
use crate::storage::StorageDriver;
use ormkit_types::{Key, Value};

impl<D: StorageDriver> Session<D> {
    /// Checks required fields and type validators of every entity the
    /// outermost transaction wrote.
    pub(crate) fn validate_transaction(&self) -> CoreResult<()> {
        let Some(tx) = self.transactions.first() else {
            return Ok(());
        };
        let mut keys: Vec<&Key> = tx.touched().collect();
        keys.sort_by_key(|k| k.to_string());
        for key in keys {
            self.validate_entity(key)?;
        }
        Ok(())
    }

    fn validate_entity(&self, key: &Key) -> CoreResult<()> {
        let Some(state) = self.cache.get(key) else {
            return Ok(());
        };
        if state.is_removed() {
            return Ok(());
        }
        let Some(row) = state.row() else {
            return Ok(());
        };
        let info = self.domain.model().type_info(key.type_id())?;
        for field in info.fields() {
            if field.is_nullable() || !matches!(field.kind(), FieldKind::Scalar | FieldKind::Reference { .. }) {
                continue;
            }
            if matches!(row.get(field.offset()), Some(Value::Null)) {
                return Err(CoreError::validation_failed(
                    key.clone(),
                    format!("field '{}' is required", field.name()),
                ));
            }
        }
        if let Some(hooks) = info.lifecycle() {
            hooks
                .validate(key, &row)
                .map_err(|message| CoreError::validation_failed(key.clone(), message))?;
        }
        Ok(())
    }
}
