//! # courier-core
//!
//! Shared types for the Courier gateway: configuration, errors, message
//! shapes, the agent-execution seam, and the session key resolver.

pub mod config;
pub mod error;
pub mod message;
pub mod session_key;
pub mod traits;

pub use error::CourierError;
