//! # tender-core
//!
//! Core types, traits, and message contracts shared by the tender ingestion
//! pipeline and the broker-backed task workers.
//!
//! Nothing in here talks to PostgreSQL, the broker, or the filesystem. Those
//! concerns live in `tender-db`, `tender-bus`, and `tender-ingest`, which
//! implement the traits declared in [`traits`].

pub mod defaults;
pub mod error;
pub mod events;
pub mod ingest;
pub mod logging;
pub mod messages;
pub mod models;
pub mod notification;
pub mod outcome;
pub mod traits;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use events::{SessionHandle, SessionHub, UserEvent, UserNotifier};
pub use ingest::*;
pub use messages::*;
pub use models::*;
pub use notification::*;
pub use outcome::{EnqueueErrorKind, EnqueueOutcome};
pub use traits::*;
