//! # Montaine Core
//!
//! Pure transformation logic for Montaine: path helpers, schema trees, the
//! mapper, the typing DSL, the historizer, write-set application, and the
//! store abstraction.
//!
//! This crate contains no tokio, sqlx, HTTP, or filesystem I/O. Every stage
//! is a function from immutable input to a new value:
//!
//! ```text
//! source ──map──▶ mapped ──type──▶ typed ──prepare──▶ historized ──▶ write-set
//! ```

pub mod coerce;
pub mod error;
pub mod historize;
pub mod mapper;
pub mod models;
pub mod path;
pub mod schema;
pub mod store;
pub mod typer;
pub mod write;

pub use error::{HistorizeError, MappingError, SchemaError, TypingError};
pub use schema::SchemaNode;
