//! Error types and result handling for pg-provision.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate, along with the
//! [`ConfigError`] and [`CredentialError`] sub-taxonomies.
//!
//! # Example
//!
//! ```rust
//! use pg_provision::{Error, Result};
//!
//! fn find_profile() -> Result<()> {
//!     Err(Error::ProfileNotFound {
//!         name: "orders_cdc".to_string(),
//!     })
//! }
//!
//! match find_profile() {
//!     Ok(()) => println!("found"),
//!     Err(Error::ProfileNotFound { name }) => eprintln!("no such profile: {}", name),
//!     Err(e) => eprintln!("other error: {}", e),
//! }
//! ```

use thiserror::Error;

/// The main error type for pg-provision operations.
///
/// Configuration and credential failures keep their own sub-enums so
/// callers can tell a bad document apart from a bad secret without
/// string matching.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration document failed to load or validate.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A connection profile's credentials could not be resolved.
    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    /// PostgreSQL client or protocol error.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// I/O error, typically from reading the configuration file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Unexpected shape in a server reply (e.g. a slot-creation result
    /// without the expected row).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A replication slot name contains characters PostgreSQL rejects.
    #[error("Invalid slot name {name:?}: {message}")]
    InvalidSlotName {
        /// The offending slot name
        name: String,
        /// What made it invalid
        message: String,
    },

    /// A single-profile command named a profile that is not in the
    /// configuration. Reported as a no-op, never a panic.
    #[error("Replication profile '{name}' not found in configuration")]
    ProfileNotFound {
        /// The requested profile name
        name: String,
    },

    /// A connection profile name passed to the library API is not in the
    /// configuration.
    #[error("Connection profile '{name}' not found in configuration")]
    ConnectionNotFound {
        /// The requested connection profile name
        name: String,
    },
}

/// Validation errors for the replication configuration document.
///
/// Always fatal to the validate step; raised before any database or
/// secret-store access.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The document could not be parsed as YAML at all.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// The root of the document is not a mapping.
    #[error("invalid configuration structure: expected a mapping at the root level")]
    InvalidRoot,

    /// A required top-level section is absent or not a list.
    #[error("missing or invalid {section} section")]
    MissingSection {
        /// `CONNECTION_PROFILES` or `REPLICATION_PROFILES`
        section: &'static str,
    },

    /// A section entry is not a mapping.
    #[error("invalid entry in {section} section: expected a mapping")]
    InvalidEntry {
        /// The section the entry belongs to
        section: &'static str,
    },

    /// An entry is missing one or more required keys.
    #[error("missing keys {keys:?} in {section} section")]
    MissingKeys {
        /// The section the entry belongs to
        section: &'static str,
        /// The missing key names, sorted
        keys: Vec<String>,
    },

    /// A field holds a value of the wrong shape (e.g. a list where a
    /// string is required) or an unknown enum spelling.
    #[error("invalid value for '{field}' in {context}: {message}")]
    InvalidValue {
        /// Which entry the field belongs to
        context: String,
        /// Field name as written in the document
        field: String,
        /// What was expected
        message: String,
    },

    /// `publication_ops` contains an operation outside INSERT/UPDATE/DELETE.
    #[error("invalid publication_ops {ops:?} in replication profile '{profile}': must be a subset of [INSERT, UPDATE, DELETE]")]
    InvalidOps {
        /// Profile the ops belong to
        profile: String,
        /// The rejected operation names
        ops: Vec<String>,
    },

    /// `publication_ops` is empty.
    #[error("publication_ops must not be empty in replication profile '{profile}'")]
    EmptyOps {
        /// Profile with the empty ops list
        profile: String,
    },

    /// A conditional required field is absent for the declared type.
    #[error("{publication_type} publication_type requires '{field}' in replication profile '{profile}'")]
    MissingConditionalField {
        /// Profile missing the field
        profile: String,
        /// The declared publication type
        publication_type: &'static str,
        /// The required field name
        field: &'static str,
    },

    /// A filtered profile declared an empty table list.
    #[error("publication_tables must not be empty in replication profile '{profile}'")]
    EmptyTables {
        /// Profile with the empty table list
        profile: String,
    },

    /// A name that must be globally unique appeared twice.
    #[error("duplicate {field} found: {value}")]
    DuplicateName {
        /// Which unique field was violated
        field: &'static str,
        /// The duplicated value
        value: String,
    },

    /// A replication profile references a connection profile that does
    /// not exist.
    #[error("invalid connection_profile '{connection}' in replication profile '{profile}': must match a defined connection profile name")]
    UnknownConnectionProfile {
        /// The referencing replication profile
        profile: String,
        /// The dangling connection name
        connection: String,
    },
}

/// Errors resolving a connection profile to a database credential.
///
/// Fatal to the profile being processed, but never to sibling profiles
/// in a batch run.
#[derive(Error, Debug)]
pub enum CredentialError {
    /// The secret store could not return the secret (transport, auth,
    /// or missing secret).
    #[error("failed to fetch secret '{id}': {message}")]
    SecretFetchFailed {
        /// Secret id that was requested
        id: String,
        /// Underlying failure description
        message: String,
    },

    /// The secret payload was not JSON or lacked required fields.
    #[error("malformed secret payload for '{id}': {message}")]
    MalformedSecret {
        /// Secret id whose payload was rejected
        id: String,
        /// What was wrong with it
        message: String,
    },

    /// The environment variable named by `credential_id` is not set.
    #[error("environment variable '{name}' not set")]
    MissingEnvVar {
        /// The variable name
        name: String,
    },

    /// The environment variable's value is not a usable database URL.
    #[error("environment variable '{name}' does not hold a valid database URL: {message}")]
    MalformedUrl {
        /// The variable name
        name: String,
        /// What was wrong with the value
        message: String,
    },
}

/// A convenient Result type alias for pg-provision operations.
///
/// This is equivalent to `std::result::Result<T, pg_provision::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
