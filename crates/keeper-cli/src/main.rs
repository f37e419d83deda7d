mod config;
mod platform;

use anyhow::Context;
use clap::{Parser, Subcommand};
use config::{KeeperConfig, LoggingConfig};
use keeper_broker::{Broker, ProcessExecutor};
use keeper_core::{CallerIdentity, CredentialRef, ExecutionRequest, MetricsSink, ResourceId, SecretBytes};
use keeper_security::{
    AuditLog, CapabilityStore, CapabilityToken, CredentialStore, FileTokenPersistence, Sanitizer,
};
use keeper_session::AccessSessionManager;
use keeper_telemetry::{ResourceSample, ResourceSampler, Telemetry};
use platform::{FsAccessGrant, FsAuthorizer};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const CALLER: &str = "keeper-cli";

#[derive(Parser)]
#[command(name = "keeper", about = "Keeper: capability-scoped backup command broker")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "keeper.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command with access to a path
    Exec {
        /// Resource the command needs
        #[arg(long)]
        path: PathBuf,
        /// Credential owner; the password is read from KEEPER_PASSWORD
        #[arg(long)]
        owner: Option<String>,
        /// Environment variable the password is delivered in
        #[arg(long, default_value = "RESTIC_PASSWORD")]
        secret_env: String,
        /// Timeout in seconds (overrides config)
        #[arg(long)]
        timeout: Option<u64>,
        /// Command and arguments
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Manage capability tokens
    Tokens {
        #[command(subcommand)]
        action: TokenAction,
    },
    /// Print token counts and current resource usage as JSON
    Health,
}

#[derive(Subcommand)]
enum TokenAction {
    /// List persisted tokens
    List,
    /// Revoke a token
    Revoke {
        /// Token id
        id: Uuid,
    },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn open_tokens(config: &KeeperConfig, sink: Arc<dyn MetricsSink>) -> anyhow::Result<CapabilityStore> {
    let persistence = FileTokenPersistence::new(config.data_dir.join("tokens"))?;
    let store = CapabilityStore::open(Arc::new(FsAuthorizer), Arc::new(persistence))?;
    Ok(store.with_metrics(sink))
}

/// Reuse a live token for `resource`, re-mint a stale one, or mint fresh.
fn token_for(store: &CapabilityStore, resource: &ResourceId) -> anyhow::Result<CapabilityToken> {
    if let Some(existing) = store.tokens_for(resource).into_iter().next() {
        match store.resolve(existing.id) {
            Ok(_) => return Ok(existing),
            Err(e) if e.requires_remint() => {
                warn!(token = %existing.id, resource = %resource, "Re-minting stale token");
                return Ok(store.remint(existing.id)?);
            }
            Err(e) => {
                warn!(token = %existing.id, error = %e, "Discarding unusable token");
                store.revoke(existing.id)?;
            }
        }
    }
    Ok(store.mint(resource)?)
}

/// What a one-shot process can truthfully report: persisted token state and
/// current resource usage. Request counters live in the process that served them.
fn health_report(tokens: &CapabilityStore, resources: ResourceSample) -> serde_json::Value {
    let all = tokens.list();
    let stale = all.iter().filter(|t| t.is_stale).count();
    serde_json::json!({
        "tokens": all.len(),
        "stale_tokens": stale,
        "resources": resources,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let config = KeeperConfig::load(&cli.config)?;
    init_tracing(&config.logging);

    let telemetry = Arc::new(Telemetry::new());
    let sink: Arc<dyn MetricsSink> = telemetry.clone();

    match cli.command {
        Commands::Exec {
            path,
            owner,
            secret_env,
            timeout,
            command,
        } => {
            let (program, args) = command
                .split_first()
                .context("no command given after --")?;
            let path = std::fs::canonicalize(&path)
                .with_context(|| format!("Cannot resolve path '{}'", path.display()))?;
            let resource = ResourceId::from(path.as_path());

            let sampler = ResourceSampler::new(&config.data_dir).spawn(
                telemetry.clone(),
                Duration::from_secs(config.telemetry.sample_interval_secs),
            );

            let tokens = Arc::new(open_tokens(&config, sink.clone())?);
            let token = token_for(&tokens, &resource)?;

            let credentials = Arc::new(CredentialStore::new());
            let mut request = ExecutionRequest::new(CallerIdentity::new(CALLER), program.as_str())
                .args(args.iter().cloned())
                .token("target", token.id)
                .timeout(
                    timeout
                        .map(Duration::from_secs)
                        .unwrap_or_else(|| config.broker.default_timeout()),
                );
            if let Some(owner) = &owner {
                let password = std::env::var("KEEPER_PASSWORD")
                    .context("--owner given but KEEPER_PASSWORD is not set")?;
                credentials.store(owner, SecretBytes::from(password.as_str()), None)?;
                request = request.credential(CredentialRef::new(owner.as_str(), secret_env.as_str()));
            }

            let mut builder = Broker::builder(
                tokens.clone(),
                credentials,
                Arc::new(ProcessExecutor::new(config.broker.max_output_bytes)),
            )
            .metrics(sink.clone())
            .sanitizer(Sanitizer::new(256, 16_384, config.broker.max_timeout()));
            let audit = config
                .broker
                .audit
                .then(|| AuditLog::new(config.data_dir.join("audit")));
            if let Some(audit) = &audit {
                builder = builder.audit(audit.clone());
            }
            let broker = builder.build();

            let sessions = AccessSessionManager::new(Arc::new(FsAccessGrant)).with_metrics(sink);
            let access = sessions.scoped(&resource)?;
            info!(resource = %resource, token = %token.id, program = %program, "Executing");

            let outcome = broker.accept(CallerIdentity::new(CALLER)).submit(request).await;
            sampler.abort();
            drop(broker);
            if let Some(audit) = audit {
                audit.shutdown().await;
            }
            access.release()?;

            let result = outcome?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if result.is_success() {
                Ok(ExitCode::SUCCESS)
            } else {
                let code = result.exit_code.and_then(|c| u8::try_from(c).ok()).unwrap_or(1);
                Ok(ExitCode::from(code))
            }
        }
        Commands::Tokens { action } => {
            let tokens = open_tokens(&config, sink)?;
            match action {
                TokenAction::List => {
                    let mut all = tokens.list();
                    if all.is_empty() {
                        println!("No capability tokens.");
                    } else {
                        all.sort_by_key(|t| t.created_at);
                        for t in &all {
                            println!(
                                "{}  {}  accesses={}  stale={}",
                                t.id, t.resource, t.access_count, t.is_stale
                            );
                        }
                        println!("\nTotal: {} token(s)", all.len());
                    }
                }
                TokenAction::Revoke { id } => {
                    tokens.revoke(id)?;
                    println!("Revoked {id}");
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Health => {
            let tokens = open_tokens(&config, sink)?;
            let sample = ResourceSampler::new(&config.data_dir).sample();
            println!("{}", serde_json::to_string_pretty(&health_report(&tokens, sample))?);
            Ok(ExitCode::SUCCESS)
        }
    }
}
