//! SQL statement builders.
//!
//! All identifiers are double-quoted with embedded-quote doubling and all
//! string literals are escaped, so configuration-supplied names can never
//! escape into the statement text. Replication slot names are passed as
//! literals to the slot-management functions and additionally validated
//! against the server's slot-name charset.

use crate::config::PublicationScope;
use crate::{Error, Result};

/// Quotes a single identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quotes a possibly schema-qualified table name, splitting on the first `.`.
pub fn quote_qualified(table: &str) -> String {
    match table.split_once('.') {
        Some((schema, name)) => format!("{}.{}", quote_ident(schema), quote_ident(name)),
        None => quote_ident(table),
    }
}

fn escape_literal(value: &str) -> String {
    value.replace('\'', "''")
}

/// Rejects slot names the server would refuse anyway.
///
/// Slot names may only contain lower-case letters, digits, and
/// underscores; checking up front gives a clearer error than the
/// server's and keeps surprising names out of the statement text.
pub fn validate_slot_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidSlotName {
            name: name.to_string(),
            message: "must not be empty".to_string(),
        });
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(Error::InvalidSlotName {
            name: name.to_string(),
            message: "may only contain lower-case letters, digits, and underscores".to_string(),
        });
    }
    Ok(())
}

pub fn create_publication(
    publication: &str,
    publish_ops: &str,
    scope: &PublicationScope,
) -> String {
    let publication = quote_ident(publication);
    let publish = escape_literal(publish_ops);
    match scope {
        PublicationScope::AllTables => format!(
            "CREATE PUBLICATION {} FOR ALL TABLES WITH (publish = '{}')",
            publication, publish
        ),
        PublicationScope::Schema(schema) => format!(
            "CREATE PUBLICATION {} FOR TABLES IN SCHEMA {} WITH (publish = '{}')",
            publication,
            quote_ident(schema),
            publish
        ),
        // Tables are attached afterwards via ALTER PUBLICATION.
        PublicationScope::Filtered(_) => format!(
            "CREATE PUBLICATION {} WITH (publish = '{}')",
            publication, publish
        ),
    }
}

pub fn add_publication_table(publication: &str, table: &str) -> String {
    format!(
        "ALTER PUBLICATION {} ADD TABLE {}",
        quote_ident(publication),
        quote_qualified(table)
    )
}

pub fn create_replication_slot(slot: &str, output_plugin: &str) -> String {
    format!(
        "SELECT slot_name, lsn FROM pg_create_logical_replication_slot('{}', '{}')",
        escape_literal(slot),
        escape_literal(output_plugin)
    )
}

pub fn drop_replication_slot(slot: &str) -> String {
    format!(
        "SELECT pg_drop_replication_slot('{}')",
        escape_literal(slot)
    )
}

pub fn drop_publication(publication: &str) -> String {
    format!("DROP PUBLICATION {}", quote_ident(publication))
}

/// The three grant statements for one schema, in execution order.
pub fn grant_schema_privileges(schema: &str, role: &str) -> [String; 3] {
    let schema = quote_ident(schema);
    let role = quote_ident(role);
    [
        format!("GRANT USAGE ON SCHEMA {} TO {}", schema, role),
        format!(
            "GRANT SELECT, REFERENCES ON ALL TABLES IN SCHEMA {} TO {}",
            schema, role
        ),
        format!(
            "ALTER DEFAULT PRIVILEGES IN SCHEMA {} GRANT SELECT, REFERENCES ON TABLES TO {}",
            schema, role
        ),
    ]
}
