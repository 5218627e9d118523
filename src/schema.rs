//! Schema aggregation across replication profiles.
//!
//! Used by the optional privilege bootstrap to know which schemas the
//! replication role needs access to. Not involved in publication or slot
//! creation itself.

use crate::config::{PublicationScope, ReplicationProfile};
use std::collections::BTreeSet;

/// Derives the set of schemas implicated by the given profiles.
///
/// Schema-scoped profiles contribute their schema; filtered profiles
/// contribute the portion of each table name before the first `.`. A
/// profile spanning all tables contributes nothing, since it covers the
/// whole database by construction. The result is ordered so grant
/// statements run in a stable order.
pub fn derive_schemas(profiles: &[ReplicationProfile]) -> BTreeSet<String> {
    let mut schemas = BTreeSet::new();
    for profile in profiles {
        match &profile.scope {
            PublicationScope::Schema(schema) => {
                schemas.insert(schema.clone());
            }
            PublicationScope::Filtered(tables) => {
                for table in tables {
                    let schema = table.split('.').next().unwrap_or(table);
                    schemas.insert(schema.to_string());
                }
            }
            PublicationScope::AllTables => {}
        }
    }
    schemas
}
