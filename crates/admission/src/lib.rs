//! # Cadenza Admission
//!
//! Admission control for the chat surface: decide whether to accept a turn
//! before committing any provider work. Multi-window rate limiting with
//! escalating bans, operator overrides, and a periodic sweep that bounds
//! table memory.

pub mod gate;

pub use gate::{AdmissionDecision, AdmissionGate, GateStats, WindowInfo, WindowTier};
