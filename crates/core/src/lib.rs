//! `cylinder-core`: shared primitives for the cylinder tracking pipeline.
//!
//! This crate contains **pure** building blocks (no I/O): tenant/actor
//! identifiers and the error returned when parsing them.

pub mod error;
pub mod id;

pub use error::DomainError;
pub use id::{OperationId, TenantId, UserId};
