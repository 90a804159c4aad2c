//! Domain logic for assigning B2B customer groups from email domains.
//!
//! Everything here is pure: storage and HTTP concerns live in the storage
//! and app crates.

pub mod email;
pub mod legacy;
pub mod logbook;
pub mod policy;
pub mod suggestions;
pub mod types;

pub use email::extract_domain;
pub use types::{AssignmentLogEntry, AssignmentOutcome, Mappings, UserAssignmentState};

/// User meta keys for the per-user bookkeeping fields.
pub mod meta {
    pub const ASSIGNED_GROUP: &str = "_b2b_auto_group_assigned";
    pub const ASSIGNED_AT: &str = "_b2b_auto_group_timestamp";
    pub const SOURCE_DOMAIN: &str = "_b2b_auto_group_domain";
}
