//! Rotation DPS simulator: a discrete-event fight engine that records a
//! damage ledger, and a Monte Carlo engine that resamples it.

pub mod action;
pub mod arena;
pub mod config;
pub mod entity;
pub mod error;
pub mod formula;
pub mod montecarlo;
pub mod resolver;
pub mod rotation;
pub mod simulation;
pub mod stats;

#[cfg(feature = "python")]
mod python;

pub use error::{Result, SimError};
