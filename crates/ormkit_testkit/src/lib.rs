//! # ormkit testkit
//!
//! Test utilities for ormkit.
//!
//! This crate provides:
//! - A small library domain model (authors, books, tags) and store fixtures
//! - Drivers that fail on demand or record what they were sent
//! - Property-based generators for edit scripts
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ormkit_testkit::prelude::*;
//!
//! #[test]
//! fn author_is_stored() {
//!     let store = TestStore::new();
//!     let mut session = store.session();
//!     let author = session.transaction(|s| new_author(s, "Le Guin")).unwrap();
//!     assert!(store.storage.row(&author).is_some());
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use fixtures::*;
pub use generators::*;
