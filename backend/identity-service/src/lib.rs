/// Identity Service Library
///
/// Event-sourced user identity: a `User` aggregate records domain events,
/// use cases publish them, and projection handlers apply them to the user
/// store.
///
/// ## Modules
///
/// - `config`: Service configuration
/// - `db`: User repositories (PostgreSQL, in-memory)
/// - `domain`: User aggregate, events and event dispatch
/// - `error`: Error types
/// - `security`: Session tokens
/// - `services`: Use cases, identity providers, projections, event transports
/// - `validators`: Input validation
pub mod config;
pub mod db;
pub mod domain;
pub mod error;
pub mod security;
pub mod services;
pub mod validators;

// Re-export commonly used types
pub use error::{IdentityError, Result};
pub use services::IdentityService;
