//! Core domain types and traits for Keel.
//!
//! This crate contains:
//! - Run identifiers and the error taxonomy
//! - Resource nodes and typed values
//! - Store traits (trigger records, parameters, secrets, run lock)
//! - The applier trait and the run report

pub mod applier;
pub mod error;
pub mod id;
pub mod report;
pub mod resource;
pub mod store;
pub mod value;

pub use error::{Error, Result};
pub use id::RunId;
pub use resource::{BuildSpec, NodeKind, PublishSpec, PublishTarget, ResourceNode};
pub use value::{OutputRef, Outputs, Scalar, Value};
