//! Per-profile create/drop protocols and batch fan-out.
//!
//! The orchestrator executes one replication profile at a time: resolve
//! credentials, open a session, run the ordered create or drop
//! sequence, close the session. Batch operations walk the
//! profile list in declaration order and keep going past per-profile
//! failures, reporting each outcome separately.

use crate::config::{PublicationScope, ReplicationProfile, ValidatedConfig};
use crate::credentials::CredentialResolver;
use crate::error::ConfigError;
use crate::postgres::{
    DropOutcome, ObjectOutcome, ProvisionSession, SessionFactory, SlotOutcome,
};
use crate::schema::derive_schemas;
use crate::{Error, Result};
use std::sync::Arc;
use tracing::{error, info, warn};

/// What happened while provisioning one profile.
#[derive(Debug)]
pub struct ProvisionReport {
    pub profile: String,
    pub publication: ObjectOutcome,
    /// Per-table attach outcomes, in declaration order. Empty unless the
    /// profile is filtered.
    pub tables: Vec<(String, ObjectOutcome)>,
    pub slot: SlotOutcome,
}

/// What happened while tearing down one profile.
#[derive(Debug)]
pub struct TeardownReport {
    pub profile: String,
    pub slot: DropOutcome,
    pub publication: DropOutcome,
}

/// One entry in a batch result: the profile name and its outcome.
#[derive(Debug)]
pub struct ProfileOutcome<T> {
    pub profile: String,
    pub result: Result<T>,
}

/// Executes the create/drop protocols over validated profiles.
pub struct Orchestrator {
    config: ValidatedConfig,
    resolver: CredentialResolver,
    sessions: Arc<dyn SessionFactory>,
}

impl Orchestrator {
    pub fn new(
        config: ValidatedConfig,
        resolver: CredentialResolver,
        sessions: Arc<dyn SessionFactory>,
    ) -> Self {
        Self {
            config,
            resolver,
            sessions,
        }
    }

    pub fn config(&self) -> &ValidatedConfig {
        &self.config
    }

    async fn open_session(
        &self,
        profile: &ReplicationProfile,
    ) -> Result<Box<dyn ProvisionSession>> {
        let connection = self
            .config
            .connection(&profile.connection_profile)
            .ok_or_else(|| {
                // Unreachable after validation; kept as a real error
                // rather than a panic.
                Error::Config(ConfigError::UnknownConnectionProfile {
                    profile: profile.name.clone(),
                    connection: profile.connection_profile.clone(),
                })
            })?;
        let credential = self.resolver.resolve(connection).await?;
        self.sessions.open(&credential).await
    }

    /// Runs the create protocol for one profile: publication, then table
    /// attachments, then slot. "Already exists" outcomes are non-fatal
    /// and the sequence continues.
    pub async fn process_profile(&self, profile: &ReplicationProfile) -> Result<ProvisionReport> {
        info!(
            profile = %profile.name,
            publication = %profile.publication_name,
            slot = %profile.slot_name,
            "Provisioning replication profile"
        );
        let mut session = self.open_session(profile).await?;
        let result = run_create(session.as_mut(), profile).await;
        close_session(session, &profile.name).await;
        let report = result?;
        info!(profile = %profile.name, "Processed replication profile");
        Ok(report)
    }

    /// Runs the drop protocol for one profile: slot first, then
    /// publication. "Does not exist" outcomes are non-fatal.
    pub async fn drop_profile(&self, profile: &ReplicationProfile) -> Result<TeardownReport> {
        info!(
            profile = %profile.name,
            publication = %profile.publication_name,
            slot = %profile.slot_name,
            "Dropping replication profile"
        );
        let mut session = self.open_session(profile).await?;
        let result = run_drop(session.as_mut(), profile).await;
        close_session(session, &profile.name).await;
        let report = result?;
        info!(profile = %profile.name, "Dropped replication setup for profile");
        Ok(report)
    }

    /// Create protocol for a profile looked up by name.
    pub async fn process_profile_named(&self, name: &str) -> Result<ProvisionReport> {
        let profile = self
            .config
            .replication_profile(name)
            .ok_or_else(|| Error::ProfileNotFound {
                name: name.to_string(),
            })?;
        self.process_profile(profile).await
    }

    /// Drop protocol for a profile looked up by name.
    pub async fn drop_profile_named(&self, name: &str) -> Result<TeardownReport> {
        let profile = self
            .config
            .replication_profile(name)
            .ok_or_else(|| Error::ProfileNotFound {
                name: name.to_string(),
            })?;
        self.drop_profile(profile).await
    }

    /// Provisions every profile in declaration order, continuing past
    /// failures. Each profile gets its own session.
    pub async fn process_all(&self) -> Vec<ProfileOutcome<ProvisionReport>> {
        let mut outcomes = Vec::with_capacity(self.config.replication_profiles.len());
        for profile in &self.config.replication_profiles {
            let result = self.process_profile(profile).await;
            if let Err(e) = &result {
                error!(profile = %profile.name, error = %e, "Failed to provision profile");
            }
            outcomes.push(ProfileOutcome {
                profile: profile.name.clone(),
                result,
            });
        }
        outcomes
    }

    /// Tears down every profile in declaration order, continuing past
    /// failures.
    pub async fn drop_all(&self) -> Vec<ProfileOutcome<TeardownReport>> {
        let mut outcomes = Vec::with_capacity(self.config.replication_profiles.len());
        for profile in &self.config.replication_profiles {
            let result = self.drop_profile(profile).await;
            if let Err(e) = &result {
                error!(profile = %profile.name, error = %e, "Failed to drop profile");
            }
            outcomes.push(ProfileOutcome {
                profile: profile.name.clone(),
                result,
            });
        }
        outcomes
    }

    /// Grants USAGE/SELECT/REFERENCES on every schema implicated by the
    /// configured profiles to `role`, plus matching default privileges
    /// for future tables.
    ///
    /// Not invoked by the batch flows; superusers typically do not need
    /// it. Callers opt in explicitly against one connection profile.
    pub async fn grant_schema_privileges(&self, connection_name: &str, role: &str) -> Result<()> {
        let connection =
            self.config
                .connection(connection_name)
                .ok_or_else(|| Error::ConnectionNotFound {
                    name: connection_name.to_string(),
                })?;
        let schemas = derive_schemas(&self.config.replication_profiles);
        if schemas.is_empty() {
            info!("No schemas to grant privileges on");
            return Ok(());
        }
        let credential = self.resolver.resolve(connection).await?;
        let mut session = self.sessions.open(&credential).await?;
        let result = session.grant_schema_privileges(&schemas, role).await;
        close_session(session, connection_name).await;
        result
    }
}

/// Closes a session, logging instead of failing: a close error must not
/// mask the protocol outcome.
async fn close_session(session: Box<dyn ProvisionSession>, context: &str) {
    if let Err(e) = session.close().await {
        warn!(context = %context, error = %e, "Failed to close session");
    }
}

async fn run_create(
    session: &mut dyn ProvisionSession,
    profile: &ReplicationProfile,
) -> Result<ProvisionReport> {
    let publication = session
        .create_publication(
            &profile.publication_name,
            &profile.publish_clause(),
            &profile.scope,
        )
        .await?;

    let mut tables = Vec::new();
    if let PublicationScope::Filtered(list) = &profile.scope {
        for table in list {
            let outcome = session
                .add_publication_table(&profile.publication_name, table)
                .await?;
            tables.push((table.clone(), outcome));
        }
    }

    // Ordered after publication setup so the slot observes the fully
    // configured publication.
    let slot = session.create_replication_slot(&profile.slot_name).await?;

    Ok(ProvisionReport {
        profile: profile.name.clone(),
        publication,
        tables,
        slot,
    })
}

async fn run_drop(
    session: &mut dyn ProvisionSession,
    profile: &ReplicationProfile,
) -> Result<TeardownReport> {
    let slot = session.drop_replication_slot(&profile.slot_name).await?;
    let publication = session.drop_publication(&profile.publication_name).await?;
    Ok(TeardownReport {
        profile: profile.name.clone(),
        slot,
        publication,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{EnvLookup, SecretStore};
    use crate::error::CredentialError;
    use crate::postgres::{SlotInfo, OUTPUT_PLUGIN};
    use async_trait::async_trait;
    use std::collections::{BTreeMap, BTreeSet, HashMap};
    use std::sync::Mutex;

    #[derive(Default)]
    struct ClusterState {
        publications: BTreeMap<String, BTreeSet<String>>,
        slots: BTreeSet<String>,
        /// Recorded operations, e.g. `create_publication orders_pub publish=INSERT,UPDATE`.
        log: Vec<String>,
    }

    struct FakeSession {
        state: Arc<Mutex<ClusterState>>,
    }

    #[async_trait]
    impl ProvisionSession for FakeSession {
        async fn create_publication(
            &mut self,
            publication: &str,
            publish_ops: &str,
            scope: &PublicationScope,
        ) -> Result<ObjectOutcome> {
            let mut state = self.state.lock().unwrap();
            state.log.push(format!(
                "create_publication {} type={} publish={}",
                publication,
                scope.type_name(),
                publish_ops
            ));
            if state.publications.contains_key(publication) {
                Ok(ObjectOutcome::AlreadyExists)
            } else {
                state.publications.insert(publication.to_string(), BTreeSet::new());
                Ok(ObjectOutcome::Created)
            }
        }

        async fn add_publication_table(
            &mut self,
            publication: &str,
            table: &str,
        ) -> Result<ObjectOutcome> {
            let mut state = self.state.lock().unwrap();
            state
                .log
                .push(format!("add_table {} {}", publication, table));
            let tables = state
                .publications
                .get_mut(publication)
                .expect("publication must exist before tables are attached");
            if tables.insert(table.to_string()) {
                Ok(ObjectOutcome::Created)
            } else {
                Ok(ObjectOutcome::AlreadyExists)
            }
        }

        async fn create_replication_slot(&mut self, slot: &str) -> Result<SlotOutcome> {
            let mut state = self.state.lock().unwrap();
            state.log.push(format!("create_slot {}", slot));
            if state.slots.insert(slot.to_string()) {
                Ok(SlotOutcome::Created(SlotInfo {
                    slot_name: slot.to_string(),
                    consistent_point: "0/16B6E58".to_string(),
                    snapshot_name: Some("00000003-00000002-1".to_string()),
                    output_plugin: OUTPUT_PLUGIN.to_string(),
                }))
            } else {
                Ok(SlotOutcome::AlreadyExists)
            }
        }

        async fn drop_replication_slot(&mut self, slot: &str) -> Result<DropOutcome> {
            let mut state = self.state.lock().unwrap();
            state.log.push(format!("drop_slot {}", slot));
            if state.slots.remove(slot) {
                Ok(DropOutcome::Dropped)
            } else {
                Ok(DropOutcome::DidNotExist)
            }
        }

        async fn drop_publication(&mut self, publication: &str) -> Result<DropOutcome> {
            let mut state = self.state.lock().unwrap();
            state.log.push(format!("drop_publication {}", publication));
            if state.publications.remove(publication).is_some() {
                Ok(DropOutcome::Dropped)
            } else {
                Ok(DropOutcome::DidNotExist)
            }
        }

        async fn grant_schema_privileges(
            &mut self,
            schemas: &BTreeSet<String>,
            role: &str,
        ) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            for schema in schemas {
                state.log.push(format!("grant {} to {}", schema, role));
            }
            Ok(())
        }

        async fn close(self: Box<Self>) -> Result<()> {
            self.state.lock().unwrap().log.push("close".to_string());
            Ok(())
        }
    }

    struct FakeFactory {
        state: Arc<Mutex<ClusterState>>,
    }

    #[async_trait]
    impl SessionFactory for FakeFactory {
        async fn open(
            &self,
            _credential: &crate::credentials::DbCredential,
        ) -> Result<Box<dyn ProvisionSession>> {
            Ok(Box::new(FakeSession {
                state: Arc::clone(&self.state),
            }))
        }
    }

    struct NoSecrets;

    #[async_trait]
    impl SecretStore for NoSecrets {
        async fn fetch(&self, id: &str) -> std::result::Result<String, CredentialError> {
            Err(CredentialError::SecretFetchFailed {
                id: id.to_string(),
                message: "no secret store in tests".to_string(),
            })
        }
    }

    struct StaticEnv(HashMap<String, String>);

    impl EnvLookup for StaticEnv {
        fn var(&self, name: &str) -> Option<String> {
            self.0.get(name).cloned()
        }
    }

    fn orchestrator_with(
        yaml: &str,
        env: &[(&str, &str)],
        sessions: Arc<dyn SessionFactory>,
    ) -> Orchestrator {
        let doc: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
        let config = ValidatedConfig::validate(&doc).unwrap();
        let env = env
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let resolver = CredentialResolver::new(Arc::new(NoSecrets), Arc::new(StaticEnv(env)));
        Orchestrator::new(config, resolver, sessions)
    }

    fn orchestrator(yaml: &str, env: &[(&str, &str)]) -> (Orchestrator, Arc<Mutex<ClusterState>>) {
        let state = Arc::new(Mutex::new(ClusterState::default()));
        let sessions = Arc::new(FakeFactory {
            state: Arc::clone(&state),
        });
        (orchestrator_with(yaml, env, sessions), state)
    }

    const DB_URL: (&str, &str) = ("PRIMARY_DB_URL", "postgres://cdc:pw@localhost:5432/app");

    const FILTERED: &str = r#"
CONNECTION_PROFILES:
  - name: primary
    type: ENV_SECRETS
    credential_id: PRIMARY_DB_URL
REPLICATION_PROFILES:
  - replication_profile_name: users_cdc
    connection_profile: primary
    publication_name: users_pub
    slot_name: users_slot
    publication_ops: [INSERT, UPDATE]
    publication_type: filtered
    publication_tables: [public.users, public.orders]
"#;

    #[tokio::test]
    async fn create_protocol_orders_operations() {
        let (orchestrator, state) = orchestrator(FILTERED, &[DB_URL]);
        let report = orchestrator.process_profile_named("users_cdc").await.unwrap();

        assert_eq!(report.publication, ObjectOutcome::Created);
        assert_eq!(report.tables.len(), 2);
        assert!(matches!(report.slot, SlotOutcome::Created(_)));

        let log = state.lock().unwrap().log.clone();
        assert_eq!(
            log,
            vec![
                "create_publication users_pub type=filtered publish=INSERT,UPDATE",
                "add_table users_pub public.users",
                "add_table users_pub public.orders",
                "create_slot users_slot",
                "close",
            ]
        );
    }

    #[tokio::test]
    async fn create_protocol_is_idempotent() {
        let (orchestrator, state) = orchestrator(FILTERED, &[DB_URL]);
        orchestrator.process_profile_named("users_cdc").await.unwrap();
        let first_state = {
            let state = state.lock().unwrap();
            (state.publications.clone(), state.slots.clone())
        };

        let second = orchestrator.process_profile_named("users_cdc").await.unwrap();
        assert_eq!(second.publication, ObjectOutcome::AlreadyExists);
        assert!(second
            .tables
            .iter()
            .all(|(_, outcome)| *outcome == ObjectOutcome::AlreadyExists));
        assert_eq!(second.slot, SlotOutcome::AlreadyExists);

        let state = state.lock().unwrap();
        assert_eq!((state.publications.clone(), state.slots.clone()), first_state);
    }

    #[tokio::test]
    async fn drop_protocol_is_idempotent() {
        let (orchestrator, _state) = orchestrator(FILTERED, &[DB_URL]);
        let report = orchestrator.drop_profile_named("users_cdc").await.unwrap();
        assert_eq!(report.slot, DropOutcome::DidNotExist);
        assert_eq!(report.publication, DropOutcome::DidNotExist);
    }

    #[tokio::test]
    async fn drop_removes_provisioned_objects() {
        let (orchestrator, state) = orchestrator(FILTERED, &[DB_URL]);
        orchestrator.process_profile_named("users_cdc").await.unwrap();
        let report = orchestrator.drop_profile_named("users_cdc").await.unwrap();
        assert_eq!(report.slot, DropOutcome::Dropped);
        assert_eq!(report.publication, DropOutcome::Dropped);

        let state = state.lock().unwrap();
        assert!(state.publications.is_empty());
        assert!(state.slots.is_empty());

        // Slot is dropped before the publication.
        let slot_pos = state.log.iter().position(|l| l == "drop_slot users_slot");
        let pub_pos = state
            .log
            .iter()
            .position(|l| l == "drop_publication users_pub");
        assert!(slot_pos.unwrap() < pub_pos.unwrap());
    }

    #[tokio::test]
    async fn all_tables_profile_issues_expected_requests() {
        let yaml = r#"
CONNECTION_PROFILES:
  - name: primary
    type: ENV_SECRETS
    credential_id: PRIMARY_DB_URL
REPLICATION_PROFILES:
  - replication_profile_name: everything
    connection_profile: primary
    publication_name: everything_pub
    slot_name: everything_slot
    publication_ops: [INSERT, UPDATE]
    publication_type: all
"#;
        let (orchestrator, state) = orchestrator(yaml, &[DB_URL]);
        let report = orchestrator.process_profile_named("everything").await.unwrap();

        match &report.slot {
            SlotOutcome::Created(info) => {
                assert_eq!(info.slot_name, "everything_slot");
                assert!(!info.consistent_point.is_empty());
                assert_eq!(info.output_plugin, OUTPUT_PLUGIN);
            }
            other => panic!("unexpected slot outcome: {other:?}"),
        }

        let log = state.lock().unwrap().log.clone();
        assert!(log
            .contains(&"create_publication everything_pub type=all publish=INSERT,UPDATE".to_string()));
        assert!(report.tables.is_empty());
    }

    #[tokio::test]
    async fn batch_continues_past_failed_profile() {
        let yaml = r#"
CONNECTION_PROFILES:
  - name: broken
    type: ENV_SECRETS
    credential_id: MISSING_DB_URL
  - name: primary
    type: ENV_SECRETS
    credential_id: PRIMARY_DB_URL
REPLICATION_PROFILES:
  - replication_profile_name: first
    connection_profile: broken
    publication_name: first_pub
    slot_name: first_slot
    publication_ops: [INSERT]
    publication_type: all
  - replication_profile_name: second
    connection_profile: primary
    publication_name: second_pub
    slot_name: second_slot
    publication_ops: [INSERT]
    publication_type: all
"#;
        let (orchestrator, state) = orchestrator(yaml, &[DB_URL]);
        let outcomes = orchestrator.process_all().await;

        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].profile, "first");
        assert!(matches!(
            outcomes[0].result,
            Err(Error::Credential(CredentialError::MissingEnvVar { .. }))
        ));
        assert_eq!(outcomes[1].profile, "second");
        assert!(outcomes[1].result.is_ok());

        let state = state.lock().unwrap();
        assert!(state.slots.contains("second_slot"));
        assert!(!state.slots.contains("first_slot"));
    }

    #[tokio::test]
    async fn unknown_profile_reported_without_database_action() {
        let (orchestrator, state) = orchestrator(FILTERED, &[DB_URL]);
        let err = orchestrator.process_profile_named("missing").await.unwrap_err();
        assert!(matches!(err, Error::ProfileNotFound { name } if name == "missing"));
        assert!(state.lock().unwrap().log.is_empty());
    }

    #[tokio::test]
    async fn grant_privileges_covers_derived_schemas() {
        let yaml = r#"
CONNECTION_PROFILES:
  - name: primary
    type: ENV_SECRETS
    credential_id: PRIMARY_DB_URL
REPLICATION_PROFILES:
  - replication_profile_name: sales_cdc
    connection_profile: primary
    publication_name: sales_pub
    slot_name: sales_slot
    publication_ops: [INSERT]
    publication_type: schema
    publication_schema: sales
  - replication_profile_name: inventory_cdc
    connection_profile: primary
    publication_name: inventory_pub
    slot_name: inventory_slot
    publication_ops: [INSERT]
    publication_type: filtered
    publication_tables: [inventory.items]
"#;
        let (orchestrator, state) = orchestrator(yaml, &[DB_URL]);
        orchestrator
            .grant_schema_privileges("primary", "cdc_reader")
            .await
            .unwrap();

        let log = state.lock().unwrap().log.clone();
        assert!(log.contains(&"grant inventory to cdc_reader".to_string()));
        assert!(log.contains(&"grant sales to cdc_reader".to_string()));
    }

    /// Session whose operations fail, and whose close fails too.
    struct BrokenSession;

    #[async_trait]
    impl ProvisionSession for BrokenSession {
        async fn create_publication(
            &mut self,
            _publication: &str,
            _publish_ops: &str,
            _scope: &PublicationScope,
        ) -> Result<ObjectOutcome> {
            Err(Error::Protocol("publication create failed".to_string()))
        }

        async fn add_publication_table(
            &mut self,
            _publication: &str,
            _table: &str,
        ) -> Result<ObjectOutcome> {
            Err(Error::Protocol("publication create failed".to_string()))
        }

        async fn create_replication_slot(&mut self, _slot: &str) -> Result<SlotOutcome> {
            Err(Error::Protocol("publication create failed".to_string()))
        }

        async fn drop_replication_slot(&mut self, _slot: &str) -> Result<DropOutcome> {
            Err(Error::Protocol("slot drop failed".to_string()))
        }

        async fn drop_publication(&mut self, _publication: &str) -> Result<DropOutcome> {
            Err(Error::Protocol("slot drop failed".to_string()))
        }

        async fn grant_schema_privileges(
            &mut self,
            _schemas: &BTreeSet<String>,
            _role: &str,
        ) -> Result<()> {
            Err(Error::Protocol("grant failed".to_string()))
        }

        async fn close(self: Box<Self>) -> Result<()> {
            Err(Error::Protocol("close failed".to_string()))
        }
    }

    struct BrokenFactory;

    #[async_trait]
    impl SessionFactory for BrokenFactory {
        async fn open(
            &self,
            _credential: &crate::credentials::DbCredential,
        ) -> Result<Box<dyn ProvisionSession>> {
            Ok(Box::new(BrokenSession))
        }
    }

    #[tokio::test]
    async fn close_failure_does_not_mask_operation_error() {
        let orchestrator = orchestrator_with(FILTERED, &[DB_URL], Arc::new(BrokenFactory));
        let err = orchestrator
            .process_profile_named("users_cdc")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("publication create failed"));
        assert!(!err.to_string().contains("close failed"));

        let err = orchestrator
            .drop_profile_named("users_cdc")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("slot drop failed"));
        assert!(!err.to_string().contains("close failed"));
    }

    #[tokio::test]
    async fn warnings_survive_batch_processing() {
        let yaml = r#"
CONNECTION_PROFILES:
  - name: primary
    type: ENV_SECRETS
    credential_id: PRIMARY_DB_URL
REPLICATION_PROFILES:
  - replication_profile_name: first
    connection_profile: primary
    publication_name: first_pub
    slot_name: first_slot
    publication_ops: [INSERT]
    publication_type: filtered
    publication_tables: [public.users]
  - replication_profile_name: second
    connection_profile: primary
    publication_name: second_pub
    slot_name: second_slot
    publication_ops: [UPDATE]
    publication_type: filtered
    publication_tables: [public.users]
"#;
        let (orchestrator, _state) = orchestrator(yaml, &[DB_URL]);
        assert_eq!(orchestrator.config().warnings.len(), 1);

        let outcomes = orchestrator.process_all().await;
        assert!(outcomes.iter().all(|o| o.result.is_ok()));

        // Still available for the end-of-run summary.
        let warnings = &orchestrator.config().warnings;
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].to_string().contains("users"));
    }

    #[tokio::test]
    async fn grant_privileges_unknown_connection_rejected() {
        let (orchestrator, _state) = orchestrator(FILTERED, &[DB_URL]);
        let err = orchestrator
            .grant_schema_privileges("replica", "cdc_reader")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConnectionNotFound { name } if name == "replica"));
    }
}
