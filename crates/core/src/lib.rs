//! # Cadenza Core
//!
//! Domain types, traits, and error definitions for the Cadenza chat
//! resilience layer. This crate has **zero framework dependencies** — it
//! defines the domain model that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! The seams between subsystems are traits defined here (`ModelSource`)
//! and closed sum types (`TurnEvent`, `RawModelEvent`). Implementations
//! live in their respective crates, so the admission gate, provider
//! selector, and streaming layer can all be tested against doubles.

pub mod error;
pub mod event;
pub mod identity;
pub mod message;
pub mod phase;
pub mod source;

// Re-export key types at crate root for ergonomics
pub use error::{AdmissionError, Error, Result, SelectorError, SourceError, StreamError};
pub use event::{TurnErrorKind, TurnEvent};
pub use identity::{ClientIdentity, resolve_identity};
pub use message::{ChatMessage, Role, TurnRequest};
pub use phase::{Phase, Priority};
pub use source::{ModelSource, ModelStream, RawModelEvent};
