//! Transaction and savepoint ledger.
//!
//! A session keeps a stack of [`Transaction`]s. The outermost one maps to a
//! physical driver transaction; nested ones map to savepoints (or, with a
//! disconnected state attached, to registry layers). Each transaction carries
//! a [`LifetimeToken`] that cached states use to detect that the data they
//! were built from was rolled back.

mod lifetime;
mod scope;
mod state;

pub use lifetime::LifetimeToken;
pub use scope::TransactionScope;
pub use state::{IsolationLevel, Transaction, TransactionInfo, TransactionOpenMode, TransactionState};
