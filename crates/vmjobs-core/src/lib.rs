//! Shared building blocks for the vmjobs workspace: configuration, job
//! definitions, the error taxonomy used in result documents, and secret
//! redaction for anything that leaves the process.

pub mod config;
pub mod error;
pub mod redact;
pub mod types;

pub use error::{JobError, Result};
pub use types::{JobDefinition, JobKind, Schedule};
