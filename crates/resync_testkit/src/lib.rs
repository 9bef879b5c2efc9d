//! # resync testkit
//!
//! Test utilities for resync.
//!
//! This crate provides:
//! - Harnesses wiring a memory backend, client pool and reconciler
//! - Property-based test generators using proptest
//! - Stress testing utilities for the pool and the reconciler
//!
//! ## Usage
//!
//! ```rust,ignore
//! use resync_testkit::prelude::*;
//!
//! #[test]
//! fn test_with_harness() {
//!     with_harness(3, |h| {
//!         let created = h.reconciler.create("queue", &json!({"name": "support"})).unwrap();
//!         // ... assertions
//!     });
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::stress::*;
}

pub use fixtures::*;
pub use generators::*;
pub use stress::*;
