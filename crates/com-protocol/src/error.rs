//! Error types for macros and device profiles

use thiserror::Error;

/// Errors that can occur while building or querying device profiles
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The mandatory `init` probe has no macros
    #[error("profile {0}: init operation must contain at least one macro")]
    EmptyInit(String),

    /// An operation was declared without any macros
    #[error("profile {profile}: operation {operation} has no macros")]
    EmptyOperation { profile: String, operation: String },

    /// Operation name not present in the profile
    #[error("profile {profile} has no operation named {operation}")]
    UnknownOperation { profile: String, operation: String },

    /// Response pattern failed to compile
    #[error("invalid response pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// Two profiles share a name
    #[error("duplicate profile name: {0}")]
    DuplicateProfile(String),
}
