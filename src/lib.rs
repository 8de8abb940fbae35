//! Roomwatch library
//!
//! Room reservations reconciled against live occupancy. Exposes modules for
//! integration testing and binary reuse.

pub mod domain;
pub mod infra;
pub mod io;
pub mod services;
