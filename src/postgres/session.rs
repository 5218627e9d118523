//! Database sessions over tokio-postgres.

use super::{
    is_duplicate_object, is_undefined_object, sql, DropOutcome, ObjectOutcome, ProvisionSession,
    SessionFactory, SlotInfo, SlotOutcome, OUTPUT_PLUGIN,
};
use crate::config::PublicationScope;
use crate::credentials::DbCredential;
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::BTreeSet;
use tokio_postgres::{NoTls, SimpleQueryMessage};
use tracing::{debug, error, info, warn};

/// A session serving one profile's create or drop sequence.
///
/// A regular connection suffices: publication DDL runs as plain SQL and
/// slots are managed through `pg_create_logical_replication_slot` /
/// `pg_drop_replication_slot`, so no walsender-mode connection is needed.
#[derive(Debug)]
pub struct PgSession {
    client: tokio_postgres::Client,
    connection_task: tokio::task::JoinHandle<()>,
}

impl PgSession {
    pub async fn connect(credential: &DbCredential) -> Result<Self> {
        // Built field by field so credentials containing URL
        // punctuation need no encoding.
        let mut config = tokio_postgres::Config::new();
        config
            .host(&credential.host)
            .port(credential.port)
            .user(&credential.username)
            .password(&credential.password)
            .dbname(&credential.database);

        let (client, connection) = config.connect(NoTls).await?;
        let connection_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("Connection error: {}", e);
            }
        });

        debug!(
            host = %credential.host,
            port = %credential.port,
            database = %credential.database,
            "Connected to PostgreSQL"
        );

        Ok(Self {
            client,
            connection_task,
        })
    }
}

#[async_trait]
impl ProvisionSession for PgSession {
    async fn create_publication(
        &mut self,
        publication: &str,
        publish_ops: &str,
        scope: &PublicationScope,
    ) -> Result<ObjectOutcome> {
        let statement = sql::create_publication(publication, publish_ops, scope);
        match self.client.simple_query(&statement).await {
            Ok(_) => {
                info!(
                    publication = %publication,
                    publication_type = %scope.type_name(),
                    publish = %publish_ops,
                    "Created publication"
                );
                Ok(ObjectOutcome::Created)
            }
            Err(e) if is_duplicate_object(&e) => {
                info!(publication = %publication, "Publication already exists");
                Ok(ObjectOutcome::AlreadyExists)
            }
            Err(e) => Err(Error::Postgres(e)),
        }
    }

    async fn add_publication_table(
        &mut self,
        publication: &str,
        table: &str,
    ) -> Result<ObjectOutcome> {
        let statement = sql::add_publication_table(publication, table);
        match self.client.simple_query(&statement).await {
            Ok(_) => {
                info!(publication = %publication, table = %table, "Added table to publication");
                Ok(ObjectOutcome::Created)
            }
            Err(e) if is_duplicate_object(&e) => {
                info!(
                    publication = %publication,
                    table = %table,
                    "Table is already in publication"
                );
                Ok(ObjectOutcome::AlreadyExists)
            }
            Err(e) => Err(Error::Postgres(e)),
        }
    }

    async fn create_replication_slot(&mut self, slot: &str) -> Result<SlotOutcome> {
        sql::validate_slot_name(slot)?;
        let statement = sql::create_replication_slot(slot, OUTPUT_PLUGIN);
        match self.client.simple_query(&statement).await {
            Ok(messages) => {
                for message in messages {
                    if let SimpleQueryMessage::Row(row) = message {
                        let info = SlotInfo {
                            slot_name: row.get("slot_name").unwrap_or(slot).to_string(),
                            consistent_point: row.get("lsn").unwrap_or_default().to_string(),
                            // The SQL function does not export a snapshot.
                            snapshot_name: None,
                            output_plugin: OUTPUT_PLUGIN.to_string(),
                        };
                        info!(
                            slot = %info.slot_name,
                            consistent_point = %info.consistent_point,
                            plugin = %info.output_plugin,
                            "Created replication slot"
                        );
                        return Ok(SlotOutcome::Created(info));
                    }
                }
                Err(Error::Protocol(format!(
                    "pg_create_logical_replication_slot for '{}' returned no result row",
                    slot
                )))
            }
            Err(e) if is_duplicate_object(&e) => {
                info!(slot = %slot, "Replication slot already exists");
                Ok(SlotOutcome::AlreadyExists)
            }
            Err(e) => Err(Error::Postgres(e)),
        }
    }

    async fn drop_replication_slot(&mut self, slot: &str) -> Result<DropOutcome> {
        sql::validate_slot_name(slot)?;
        let statement = sql::drop_replication_slot(slot);
        match self.client.simple_query(&statement).await {
            Ok(_) => {
                info!(slot = %slot, "Dropped replication slot");
                Ok(DropOutcome::Dropped)
            }
            Err(e) if is_undefined_object(&e) => {
                warn!(slot = %slot, "Replication slot does not exist");
                Ok(DropOutcome::DidNotExist)
            }
            Err(e) => Err(Error::Postgres(e)),
        }
    }

    async fn drop_publication(&mut self, publication: &str) -> Result<DropOutcome> {
        let statement = sql::drop_publication(publication);
        match self.client.simple_query(&statement).await {
            Ok(_) => {
                info!(publication = %publication, "Dropped publication");
                Ok(DropOutcome::Dropped)
            }
            Err(e) if is_undefined_object(&e) => {
                warn!(publication = %publication, "Publication does not exist");
                Ok(DropOutcome::DidNotExist)
            }
            Err(e) => Err(Error::Postgres(e)),
        }
    }

    async fn grant_schema_privileges(
        &mut self,
        schemas: &BTreeSet<String>,
        role: &str,
    ) -> Result<()> {
        for schema in schemas {
            for statement in sql::grant_schema_privileges(schema, role) {
                self.client.simple_query(&statement).await?;
            }
            info!(schema = %schema, role = %role, "Granted replication privileges");
        }
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        debug!("Closing replication session");
        self.connection_task.abort();
        Ok(())
    }
}

/// Opens [`PgSession`]s against real clusters.
pub struct PgSessionFactory;

#[async_trait]
impl SessionFactory for PgSessionFactory {
    async fn open(&self, credential: &DbCredential) -> Result<Box<dyn ProvisionSession>> {
        Ok(Box::new(PgSession::connect(credential).await?))
    }
}
