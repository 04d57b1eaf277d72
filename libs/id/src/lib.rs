//! # flotilla-id
//!
//! Typed identifiers for the objects the scheduler reasons about.
//!
//! ## Design Principles
//!
//! - IDs are stable and system-generated; names (job IDs, task group names,
//!   positional allocation names) are user-controlled labels and stay plain
//!   strings.
//! - All IDs have a canonical string representation with strict parsing.
//! - IDs round-trip through serde (`parse` → `format` → `parse`).
//! - IDs are typed so an allocation ID can never be handed to an API that
//!   wants an evaluation ID.
//!
//! ## Format
//!
//! Every ID is `{prefix}_{ulid}`, e.g. `alloc_01HV4Z4NYPLTRS0JTUA8XDME5F`.
//! The ULID payload keeps IDs time-ordered, which gives deterministic
//! tie-breaking wherever sets of allocations are sorted by ID.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for callers that need to construct IDs from raw parts
/// (deterministic test fixtures in particular).
pub use ulid::Ulid;
