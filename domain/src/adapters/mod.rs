//! Test-only adapters that live inside the domain crate for convenience.
//!
//! These are intended purely for unit testing and local demos. The real
//! callback delivery adapter lives in the `callback-dispatcher` crate.

pub mod memory_scheduler;
