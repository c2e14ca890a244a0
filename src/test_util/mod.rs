//! Utilities for testing code based on the engine: an in-memory network that can lose and
//!  duplicate datagrams, and an application that records everything the engine reports.
//!
//! They are used for testing the engine itself, but they are also exported for application
//!  testing, so they are part of the crate's regular (non-#[cfg(test)]) code.

pub mod application;
pub mod memory;
