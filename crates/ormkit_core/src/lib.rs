//! # ormkit core
//!
//! Client-side persistence engine for ormkit.
//!
//! This crate provides:
//! - An identity map of entity states with change registries
//! - Nested transactions backed by savepoints
//! - A flush pipeline with pinning, lazy key generation and version bumps
//! - Operation capture and replay
//! - A disconnected mode that records edits offline against a baseline and
//!   applies them to a live store later
//!
//! ## Architecture
//!
//! A process-wide [`Domain`] holds the validated [`DomainModel`], key
//! generators and caches. Each [`Session`] is a single-owner unit of work
//! over a [`StorageDriver`]. When a [`DisconnectedState`] is attached, the
//! session reads from and flushes into the state's registry layers instead
//! of the driver.
//!
//! ## Key Invariants
//!
//! - At most one live state per key in a session
//! - Writes to a registry layer never leak into the layers below it
//! - A committed or discarded layer can not be used again
//! - A failed flush leaves every row exactly as it was before the flush

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod disconnected;
mod domain;
mod entity;
mod error;
mod events;
mod keygen;
mod model;
mod operation;
mod registry;
mod session;
mod storage;
mod transaction;
mod types;

pub use config::{DisconnectedConfig, DomainConfig, OperationFilter, SessionConfig, VersionFilter, VersionsUsage};
pub use disconnected::{
    DisconnectedSnapshot, DisconnectedState, LayerSnapshot, MergeMode, RegisteredState, RegistryArena,
    SnapshotRow, SnapshotSet, StateRegistry,
};
pub use domain::{CachedQuery, Domain, QueryCacheKey};
pub use entity::{EntityObject, EntitySetState, EntityState, PersistenceState, Persistent, StructureObject};
pub use error::{CoreError, CoreResult};
pub use events::{Channel, EventBus, EventFilter, EventHandler, EventKind, SessionEvent, SubscriptionId};
pub use keygen::{GuidKeyGenerator, KeyGenerator, SequentialKeyGenerator};
pub use model::{
    DomainModel, FieldInfo, FieldKind, LifecycleHooks, TypeInfo, TypeKind, VersionMode, VersionPolicy,
};
pub use operation::{
    CaptureScope, KeyMapping, Operation, OperationCapturer, OperationLog, OperationLogType, ReplayOutcome,
};
pub use registry::{ChangeRegistry, EntitySetChangeRegistry};
pub use session::{ChangeItem, KeyRemapper, PersistReason, Pinner, PinnerResult, Session};
pub use storage::{FetchedRow, MemoryDriver, MemoryStorage, PersistAction, StorageDriver};
pub use transaction::{
    IsolationLevel, LifetimeToken, Transaction, TransactionInfo, TransactionOpenMode, TransactionScope,
    TransactionState,
};
pub use types::{RegistryId, TransactionId};

pub use ormkit_types::{
    DifferentialTuple, EntityTypeId, Key, MergeBehavior, Tuple, TypeAccuracy, TypeReference, TypesError, Value,
    VersionInfo, VersionSet,
};
