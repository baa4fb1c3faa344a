//! # threaddb Testkit
//!
//! Test utilities for threaddb.
//!
//! This crate provides:
//! - Started test databases over memory or file datastores
//! - A shared [`LoopbackNetwork`] so several databases replicate in-process
//! - Property-based generators for schema-conforming instances
//! - Polling helpers for assertions on background delivery
//!
//! ## Usage
//!
//! ```rust
//! use threaddb_testkit::prelude::*;
//!
//! let db = TestDatabase::memory();
//! let people = db.new_collection("people", person_schema()).unwrap();
//! let ids = people.insert([person("Ada", 36)]).unwrap();
//! assert!(people.has(&ids[0]).unwrap());
//! ```
//!
//! [`LoopbackNetwork`]: threaddb_core::LoopbackNetwork

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
