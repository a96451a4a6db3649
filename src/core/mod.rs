//! Core types: errors, configuration, naming, time, and cancellation.

pub mod cancel;
pub mod clock;
pub mod config;
pub mod errors;
pub mod naming;
