//! Configuration model and validation for replication provisioning.
//!
//! The configuration document is YAML with two list sections,
//! `CONNECTION_PROFILES` and `REPLICATION_PROFILES`. Validation walks the
//! parsed tree once, fails fast on the first structural or semantic
//! violation, and produces an immutable [`ValidatedConfig`] plus any
//! non-fatal warnings. No database or secret-store access happens here.

use crate::error::ConfigError;
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

const CONNECTION_SECTION: &str = "CONNECTION_PROFILES";
const REPLICATION_SECTION: &str = "REPLICATION_PROFILES";

const REQUIRED_CONNECTION_KEYS: &[&str] = &["name", "type", "credential_id"];
const REQUIRED_REPLICATION_KEYS: &[&str] = &[
    "replication_profile_name",
    "connection_profile",
    "publication_name",
    "slot_name",
    "publication_ops",
    "publication_type",
];

/// How the credentials for a connection profile are obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretBackend {
    /// Fetch a JSON secret from AWS Secrets Manager by id.
    AwsSecrets,
    /// Read a database URL from an environment variable.
    EnvSecrets,
}

impl SecretBackend {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "AWS_SECRETS" => Some(Self::AwsSecrets),
            "ENV_SECRETS" => Some(Self::EnvSecrets),
            _ => None,
        }
    }
}

/// A DML operation a publication can publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublicationOp {
    Insert,
    Update,
    Delete,
}

impl PublicationOp {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "INSERT" => Some(Self::Insert),
            "UPDATE" => Some(Self::Update),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }

    /// The spelling used in the publication's `publish` parameter.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

/// What a publication covers.
///
/// The conditional required fields of the document (`publication_schema`,
/// `publication_tables`) become variant payloads, so an invalid
/// combination cannot be represented after validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicationScope {
    /// `FOR ALL TABLES`
    AllTables,
    /// `FOR TABLES IN SCHEMA <schema>`
    Schema(String),
    /// Bare publication with tables attached one by one.
    Filtered(Vec<String>),
}

impl PublicationScope {
    /// The `publication_type` spelling in the document.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::AllTables => "all",
            Self::Schema(_) => "schema",
            Self::Filtered(_) => "filtered",
        }
    }
}

/// Names a way to obtain a credential, not the credential itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionProfile {
    pub name: String,
    pub backend: SecretBackend,
    pub credential_id: String,
}

/// A read-only descriptor of one publication/slot pair to provision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationProfile {
    pub name: String,
    pub connection_profile: String,
    pub publication_name: String,
    pub slot_name: String,
    pub ops: Vec<PublicationOp>,
    pub scope: PublicationScope,
}

impl ReplicationProfile {
    /// The comma-joined value for `WITH (publish = '...')`, in
    /// declaration order.
    pub fn publish_clause(&self) -> String {
        self.ops
            .iter()
            .map(PublicationOp::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// A non-fatal diagnostic collected during validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// The same table is captured by more than one filtered profile.
    OverlappingTable {
        table: String,
        profiles: Vec<String>,
    },
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OverlappingTable { table, profiles } => write!(
                f,
                "table '{}' appears in multiple replication profiles: {}",
                table,
                profiles.join(", ")
            ),
        }
    }
}

/// The validated, immutable configuration.
#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    pub connection_profiles: Vec<ConnectionProfile>,
    pub replication_profiles: Vec<ReplicationProfile>,
    pub warnings: Vec<ConfigWarning>,
}

impl ValidatedConfig {
    /// Loads and validates the configuration document at `path`.
    pub fn from_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let doc: Value = serde_yaml::from_str(&raw).map_err(ConfigError::Parse)?;
        Ok(Self::validate(&doc)?)
    }

    /// Validates a parsed document tree.
    ///
    /// Checks run in a fixed order: root shape, required keys, per-profile
    /// field rules, uniqueness, referential integrity, and finally the
    /// non-fatal filtered-table overlap scan.
    pub fn validate(doc: &Value) -> Result<Self, ConfigError> {
        let root = doc.as_mapping().ok_or(ConfigError::InvalidRoot)?;

        let connections = section_entries(root, CONNECTION_SECTION)?;
        let replications = section_entries(root, REPLICATION_SECTION)?;

        let mut connection_profiles = Vec::with_capacity(connections.len());
        for entry in connections {
            let entry = entry_mapping(entry, CONNECTION_SECTION)?;
            require_keys(entry, REQUIRED_CONNECTION_KEYS, CONNECTION_SECTION)?;
            connection_profiles.push(parse_connection_profile(entry)?);
        }

        let mut replication_profiles = Vec::with_capacity(replications.len());
        for entry in replications {
            let entry = entry_mapping(entry, REPLICATION_SECTION)?;
            require_keys(entry, REQUIRED_REPLICATION_KEYS, REPLICATION_SECTION)?;
            replication_profiles.push(parse_replication_profile(entry)?);
        }

        check_unique(
            "connection profile name",
            connection_profiles.iter().map(|c| c.name.as_str()),
        )?;
        check_unique(
            "replication profile name",
            replication_profiles.iter().map(|p| p.name.as_str()),
        )?;
        check_unique(
            "publication name",
            replication_profiles.iter().map(|p| p.publication_name.as_str()),
        )?;
        check_unique(
            "replication slot name",
            replication_profiles.iter().map(|p| p.slot_name.as_str()),
        )?;

        for profile in &replication_profiles {
            if !connection_profiles
                .iter()
                .any(|c| c.name == profile.connection_profile)
            {
                return Err(ConfigError::UnknownConnectionProfile {
                    profile: profile.name.clone(),
                    connection: profile.connection_profile.clone(),
                });
            }
        }

        let warnings = collect_overlap_warnings(&replication_profiles);

        Ok(Self {
            connection_profiles,
            replication_profiles,
            warnings,
        })
    }

    /// Looks up a connection profile by name.
    pub fn connection(&self, name: &str) -> Option<&ConnectionProfile> {
        self.connection_profiles.iter().find(|c| c.name == name)
    }

    /// Looks up a replication profile by name.
    pub fn replication_profile(&self, name: &str) -> Option<&ReplicationProfile> {
        self.replication_profiles.iter().find(|p| p.name == name)
    }
}

fn section_entries<'a>(
    root: &'a Mapping,
    section: &'static str,
) -> Result<&'a Vec<Value>, ConfigError> {
    root.get(section)
        .and_then(Value::as_sequence)
        .ok_or(ConfigError::MissingSection { section })
}

fn entry_mapping<'a>(entry: &'a Value, section: &'static str) -> Result<&'a Mapping, ConfigError> {
    entry
        .as_mapping()
        .ok_or(ConfigError::InvalidEntry { section })
}

fn require_keys(
    entry: &Mapping,
    required: &[&str],
    section: &'static str,
) -> Result<(), ConfigError> {
    let mut missing: Vec<String> = required
        .iter()
        .filter(|key| !entry.contains_key(**key))
        .map(|key| key.to_string())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        missing.sort();
        Err(ConfigError::MissingKeys {
            section,
            keys: missing,
        })
    }
}

fn str_field<'a>(entry: &'a Mapping, field: &str, context: &str) -> Result<&'a str, ConfigError> {
    entry
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| ConfigError::InvalidValue {
            context: context.to_string(),
            field: field.to_string(),
            message: "expected a string".to_string(),
        })
}

fn parse_connection_profile(entry: &Mapping) -> Result<ConnectionProfile, ConfigError> {
    let name = str_field(entry, "name", "CONNECTION_PROFILES entry")?.to_string();
    let context = format!("connection profile '{}'", name);
    let backend_raw = str_field(entry, "type", &context)?;
    let backend = SecretBackend::parse(backend_raw).ok_or_else(|| ConfigError::InvalidValue {
        context: context.clone(),
        field: "type".to_string(),
        message: "must be one of AWS_SECRETS, ENV_SECRETS".to_string(),
    })?;
    let credential_id = str_field(entry, "credential_id", &context)?.to_string();
    Ok(ConnectionProfile {
        name,
        backend,
        credential_id,
    })
}

fn parse_replication_profile(entry: &Mapping) -> Result<ReplicationProfile, ConfigError> {
    let name = str_field(
        entry,
        "replication_profile_name",
        "REPLICATION_PROFILES entry",
    )?
    .to_string();
    let context = format!("replication profile '{}'", name);

    let connection_profile = str_field(entry, "connection_profile", &context)?.to_string();
    let publication_name = str_field(entry, "publication_name", &context)?.to_string();
    let slot_name = str_field(entry, "slot_name", &context)?.to_string();
    let ops = parse_publication_ops(entry, &name, &context)?;
    let scope = parse_publication_scope(entry, &name, &context)?;

    Ok(ReplicationProfile {
        name,
        connection_profile,
        publication_name,
        slot_name,
        ops,
        scope,
    })
}

fn parse_publication_ops(
    entry: &Mapping,
    profile: &str,
    context: &str,
) -> Result<Vec<PublicationOp>, ConfigError> {
    let raw = entry
        .get("publication_ops")
        .and_then(Value::as_sequence)
        .ok_or_else(|| ConfigError::InvalidValue {
            context: context.to_string(),
            field: "publication_ops".to_string(),
            message: "expected a list of operation names".to_string(),
        })?;

    let mut ops = Vec::new();
    let mut invalid = Vec::new();
    for value in raw {
        let text = value.as_str().ok_or_else(|| ConfigError::InvalidValue {
            context: context.to_string(),
            field: "publication_ops".to_string(),
            message: "expected a list of operation names".to_string(),
        })?;
        match PublicationOp::parse(text) {
            Some(op) if !ops.contains(&op) => ops.push(op),
            Some(_) => {} // duplicate op, set semantics
            None => invalid.push(text.to_string()),
        }
    }

    if !invalid.is_empty() {
        return Err(ConfigError::InvalidOps {
            profile: profile.to_string(),
            ops: invalid,
        });
    }
    if ops.is_empty() {
        return Err(ConfigError::EmptyOps {
            profile: profile.to_string(),
        });
    }
    Ok(ops)
}

fn parse_publication_scope(
    entry: &Mapping,
    profile: &str,
    context: &str,
) -> Result<PublicationScope, ConfigError> {
    let type_raw = str_field(entry, "publication_type", context)?;
    match type_raw {
        "all" => Ok(PublicationScope::AllTables),
        "schema" => {
            if !entry.contains_key("publication_schema") {
                return Err(ConfigError::MissingConditionalField {
                    profile: profile.to_string(),
                    publication_type: "schema",
                    field: "publication_schema",
                });
            }
            let schema = str_field(entry, "publication_schema", context)?;
            Ok(PublicationScope::Schema(schema.to_string()))
        }
        "filtered" => {
            if !entry.contains_key("publication_tables") {
                return Err(ConfigError::MissingConditionalField {
                    profile: profile.to_string(),
                    publication_type: "filtered",
                    field: "publication_tables",
                });
            }
            let raw = entry
                .get("publication_tables")
                .and_then(Value::as_sequence)
                .ok_or_else(|| ConfigError::InvalidValue {
                    context: context.to_string(),
                    field: "publication_tables".to_string(),
                    message: "expected a list of schema-qualified table names".to_string(),
                })?;
            let mut tables = Vec::with_capacity(raw.len());
            for value in raw {
                let table = value.as_str().ok_or_else(|| ConfigError::InvalidValue {
                    context: context.to_string(),
                    field: "publication_tables".to_string(),
                    message: "expected a list of schema-qualified table names".to_string(),
                })?;
                tables.push(table.to_string());
            }
            if tables.is_empty() {
                return Err(ConfigError::EmptyTables {
                    profile: profile.to_string(),
                });
            }
            Ok(PublicationScope::Filtered(tables))
        }
        other => Err(ConfigError::InvalidValue {
            context: context.to_string(),
            field: "publication_type".to_string(),
            message: format!("'{}' must be one of all, schema, filtered", other),
        }),
    }
}

fn check_unique<'a>(
    field: &'static str,
    values: impl Iterator<Item = &'a str>,
) -> Result<(), ConfigError> {
    let mut seen = std::collections::HashSet::new();
    for value in values {
        if !seen.insert(value) {
            return Err(ConfigError::DuplicateName {
                field,
                value: value.to_string(),
            });
        }
    }
    Ok(())
}

fn collect_overlap_warnings(profiles: &[ReplicationProfile]) -> Vec<ConfigWarning> {
    let mut occurrences: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for profile in profiles {
        if let PublicationScope::Filtered(tables) = &profile.scope {
            for table in tables {
                occurrences
                    .entry(table.as_str())
                    .or_default()
                    .push(profile.name.as_str());
            }
        }
    }
    occurrences
        .into_iter()
        .filter(|(_, profiles)| profiles.len() > 1)
        .map(|(table, profiles)| ConfigWarning::OverlappingTable {
            table: table.to_string(),
            profiles: profiles.into_iter().map(String::from).collect(),
        })
        .collect()
}
