//! Shared utilities.
//!
//! Digest helpers and the object identifier generator.

pub mod hash;
pub mod object_id;
