use clap::{Parser, Subcommand};
use pg_provision::config::ValidatedConfig;
use pg_provision::credentials::{AwsSecretsStore, CredentialResolver, ProcessEnv};
use pg_provision::orchestrator::{Orchestrator, ProfileOutcome};
use pg_provision::postgres::PgSessionFactory;
use std::fmt::Debug;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "pg-provision")]
#[command(about = "Provision PostgreSQL logical replication publications and slots", long_about = None)]
struct Args {
    #[arg(
        short,
        long,
        value_name = "FILE",
        default_value = "replication.yaml",
        global = true
    )]
    config: PathBuf,

    #[arg(short, long, help = "Enable JSON output for logs", global = true)]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging", global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "snake_case")]
enum Command {
    /// Create publications and replication slots for all profiles
    CreateAll,
    /// Create publication and replication slot for a specific profile
    CreateProfile { profile_name: String },
    /// Drop publications and replication slots for all profiles
    DropAll,
    /// Drop publication and replication slot for a specific profile
    DropProfile { profile_name: String },
    /// Validate the replication configuration file
    ValidateConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);
    dotenvy::dotenv().ok();

    info!("Loading configuration from {:?}", args.config);
    let config = match ValidatedConfig::from_file(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Configuration validation failed: {}", e);
            return ExitCode::FAILURE;
        }
    };
    for warning in &config.warnings {
        warn!("{}", warning);
    }

    if matches!(&args.command, Command::ValidateConfig) {
        info!(
            connection_profiles = config.connection_profiles.len(),
            replication_profiles = config.replication_profiles.len(),
            "Configuration validation successful"
        );
        return ExitCode::SUCCESS;
    }

    let warnings = config.warnings.clone();
    let resolver = CredentialResolver::new(
        Arc::new(AwsSecretsStore::from_env().await),
        Arc::new(ProcessEnv),
    );
    let orchestrator = Orchestrator::new(config, resolver, Arc::new(PgSessionFactory));

    let failed = match args.command {
        Command::CreateAll => {
            info!("Creating publications and replication slots for all profiles");
            summarize(orchestrator.process_all().await)
        }
        Command::CreateProfile { profile_name } => {
            info!(profile = %profile_name, "Creating publication and replication slot");
            report(orchestrator.process_profile_named(&profile_name).await)
        }
        Command::DropAll => {
            info!("Dropping all replication slots and publications");
            summarize(orchestrator.drop_all().await)
        }
        Command::DropProfile { profile_name } => {
            info!(profile = %profile_name, "Dropping publication and replication slot");
            report(orchestrator.drop_profile_named(&profile_name).await)
        }
        Command::ValidateConfig => false,
    };

    // Repeated after the outcomes so they appear in the final summary.
    for warning in &warnings {
        warn!("{}", warning);
    }

    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

/// Logs per-profile outcomes; true if any profile failed.
fn summarize<T: Debug>(outcomes: Vec<ProfileOutcome<T>>) -> bool {
    let mut failed = false;
    for outcome in &outcomes {
        match &outcome.result {
            Ok(result) => info!(profile = %outcome.profile, result = ?result, "Profile succeeded"),
            Err(e) => {
                failed = true;
                error!(profile = %outcome.profile, error = %e, "Profile failed");
            }
        }
    }
    failed
}

fn report<T: Debug>(result: pg_provision::Result<T>) -> bool {
    match result {
        Ok(outcome) => {
            info!(result = ?outcome, "Profile succeeded");
            false
        }
        Err(e) => {
            error!("{}", e);
            true
        }
    }
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("pg_provision=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("pg_provision=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
