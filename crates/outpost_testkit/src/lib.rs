//! # Outpost Testkit
//!
//! Test utilities for Outpost.
//!
//! This crate provides:
//! - A clinic-shaped type registry and deterministic seed data
//! - In-process and failure-injecting transports
//! - A multi-node harness with convergence checks
//! - Property-based test generators using proptest
//! - A synthetic id space for chunk planning
//! - Concurrent sync stress runs
//!
//! ## Usage
//!
//! ```rust,ignore
//! use outpost_testkit::prelude::*;
//!
//! #[test]
//! fn node_catches_up() {
//!     let authority = test_authority(1_000);
//!     ClinicSeed::default().seed(&authority);
//!     let node = test_node(&authority, "node-1", ["f0"]);
//!     node.sync().unwrap();
//!     assert_converged(&authority, &node, &["f0"]);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod integration;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::integration::*;
    pub use crate::stress::*;
}

pub use fixtures::*;
pub use generators::*;
pub use integration::*;
pub use stress::*;
