//! # ormkit types
//!
//! Leaf primitives shared by the ormkit persistence engine:
//!
//! - [`Key`]: immutable entity identity with accuracy-aware type comparison
//! - [`Tuple`] and [`DifferentialTuple`]: row buffers with per-slot availability
//! - [`VersionInfo`] and [`VersionSet`]: optimistic-concurrency fingerprints
//! - CBOR helpers for snapshots
//!
//! Nothing here knows about sessions or storage.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod differential;
mod error;
mod key;
mod tuple;
mod value;
mod version;

pub use codec::{from_cbor, to_cbor, Decode, Encode};
pub use differential::DifferentialTuple;
pub use error::{TypesError, TypesResult};
pub use key::{EntityTypeId, Key, TypeAccuracy, TypeReference};
pub use tuple::{MergeBehavior, Tuple};
pub use value::Value;
pub use version::{VersionInfo, VersionSet};
