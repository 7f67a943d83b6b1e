//! Background coordination for a chat-platform bot: batched event
//! processing, cached per-guild configuration, scheduled channel rotation,
//! voice XP sessions that survive restarts, and connection supervision.
//!
//! [`runtime::Coordinator`] wires everything from a [`config::Settings`]
//! value and the platform collaborators.

pub mod batch;
pub mod cache;
pub mod clock;
pub mod config;
pub mod health;
pub mod notify;
pub mod runtime;
pub mod scheduler;
pub mod store;
pub mod task;
pub mod telemetry;
pub mod voice;

pub use config::Settings;
pub use runtime::{Collaborators, Coordinator};
