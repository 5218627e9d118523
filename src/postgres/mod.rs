//! Database-facing operations for replication provisioning.
//!
//! Create and drop operations return explicit outcome variants instead of
//! swallowing "already exists" / "does not exist" errors, so idempotency
//! semantics stay visible to callers and tests.

pub mod session;
pub mod sql;

pub use session::{PgSession, PgSessionFactory};

use crate::config::PublicationScope;
use crate::credentials::DbCredential;
use crate::Result;
use async_trait::async_trait;
use std::collections::BTreeSet;
use tokio_postgres::error::SqlState;

/// The logical decoding plugin requested for every slot.
pub const OUTPUT_PLUGIN: &str = "pgoutput";

/// Outcome of an idempotent create operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectOutcome {
    Created,
    AlreadyExists,
}

/// Outcome of an idempotent drop operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropOutcome {
    Dropped,
    DidNotExist,
}

/// Outcome of creating a replication slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotOutcome {
    /// The slot was created; the descriptor tells downstream consumers
    /// where to start streaming from.
    Created(SlotInfo),
    AlreadyExists,
}

/// The descriptor of a newly created replication slot.
///
/// `consistent_point` is the LSN a downstream consumer starts streaming
/// from. `snapshot_name` is only populated by creation paths that export
/// a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub slot_name: String,
    pub consistent_point: String,
    pub snapshot_name: Option<String>,
    pub output_plugin: String,
}

/// One profile's worth of database operations.
///
/// Implemented by [`PgSession`] for real clusters and by in-memory fakes
/// in tests. A session serves exactly one profile's create or drop
/// sequence and is closed afterwards.
#[async_trait]
pub trait ProvisionSession: Send {
    async fn create_publication(
        &mut self,
        publication: &str,
        publish_ops: &str,
        scope: &PublicationScope,
    ) -> Result<ObjectOutcome>;

    async fn add_publication_table(
        &mut self,
        publication: &str,
        table: &str,
    ) -> Result<ObjectOutcome>;

    async fn create_replication_slot(&mut self, slot: &str) -> Result<SlotOutcome>;

    async fn drop_replication_slot(&mut self, slot: &str) -> Result<DropOutcome>;

    async fn drop_publication(&mut self, publication: &str) -> Result<DropOutcome>;

    async fn grant_schema_privileges(
        &mut self,
        schemas: &BTreeSet<String>,
        role: &str,
    ) -> Result<()>;

    async fn close(self: Box<Self>) -> Result<()>;
}

/// Opens a session for a resolved credential.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self, credential: &DbCredential) -> Result<Box<dyn ProvisionSession>>;
}

/// True for `42710 duplicate_object` and friends.
///
/// The message fallback covers client-side errors that carry no
/// SQLSTATE.
pub(crate) fn is_duplicate_object(error: &tokio_postgres::Error) -> bool {
    error.code() == Some(&SqlState::DUPLICATE_OBJECT)
        || error.code() == Some(&SqlState::DUPLICATE_TABLE)
        || error.to_string().contains("already exists")
}

/// True for `42704 undefined_object`.
pub(crate) fn is_undefined_object(error: &tokio_postgres::Error) -> bool {
    error.code() == Some(&SqlState::UNDEFINED_OBJECT)
        || error.to_string().contains("does not exist")
}
