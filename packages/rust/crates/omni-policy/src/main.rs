//! omni-policy CLI: inspect fingerprints, learned statistics, metrics and sequences.
//!
//! Settings come from `packages/conf/policy.yaml` and the user override in
//! `<PRJ_CONFIG_HOME>/omni-dev-fusion/policy.yaml`.
//!
//! Logging: set `RUST_LOG=omni_policy=debug` to see engine events on stderr.

mod cli;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use omni_policy::{
    EngineConfig, LocalPolicyBackend, NoOutcomeMetrics, PolicyBackend, PolicyEngine,
    PolicySettings, load_policy_settings, payload_schema,
};

use crate::cli::{Cli, Command};

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("failed to render output")?;
    println!("{rendered}");
    Ok(())
}

fn open_backend(settings: &PolicySettings, cli: &Cli) -> Result<Arc<dyn PolicyBackend>> {
    let path = cli
        .store
        .clone()
        .unwrap_or_else(|| settings.persistence_path());
    let table_name = settings.table_name();
    match settings.backend_name().as_str() {
        "local" => {
            let backend = LocalPolicyBackend::open(&path, &table_name).with_context(|| {
                format!("failed to open local policy store at {}", path.display())
            })?;
            Ok(Arc::new(backend))
        }
        #[cfg(feature = "valkey")]
        "valkey" => {
            let url = settings
                .persistence
                .valkey_url
                .clone()
                .context("persistence.valkey_url is required for the valkey backend")?;
            let prefix = settings.persistence.key_prefix.clone().unwrap_or_else(|| {
                omni_policy::default_valkey_key_prefix("omni-policy", &path, &table_name)
            });
            Ok(Arc::new(omni_policy::ValkeyPolicyBackend::new(url, prefix)?))
        }
        other => anyhow::bail!("unsupported policy backend `{other}`"),
    }
}

async fn open_engine(cli: &Cli) -> Result<PolicyEngine> {
    let settings = load_policy_settings(cli.conf.as_deref());
    let config = EngineConfig::from_settings(&settings).with_env_overrides();
    let backend = open_backend(&settings, cli)?;
    let engine = PolicyEngine::open(config, backend, Arc::new(NoOutcomeMetrics)).await?;
    Ok(engine)
}

#[derive(Serialize)]
struct FingerprintOutput {
    fingerprint: String,
    keywords: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("omni_policy=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    match &cli.command {
        Command::Fingerprint {
            intent,
            previous_action,
            session_length,
        } => {
            let settings = load_policy_settings(cli.conf.as_deref());
            let config = EngineConfig::from_settings(&settings).with_env_overrides();
            let fingerprinter =
                omni_policy::ContextFingerprinter::new(config.vocabulary, config.leading_tokens);
            let fingerprint =
                fingerprinter.fingerprint(intent, previous_action.as_deref(), *session_length);
            print_json(&FingerprintOutput {
                fingerprint: fingerprint.to_string(),
                keywords: fingerprinter.extract_keywords(intent).into_iter().collect(),
            })
        }
        Command::Stats => {
            let engine = open_engine(&cli).await?;
            print_json(&engine.learning_stats())?;
            engine.shutdown().await?;
            Ok(())
        }
        Command::Sequences { action, limit } => {
            let engine = open_engine(&cli).await?;
            print_json(&engine.get_successful_sequences(action.as_deref(), *limit))?;
            engine.shutdown().await?;
            Ok(())
        }
        Command::Suggest {
            recent,
            candidates,
            top_k,
        } => {
            let engine = open_engine(&cli).await?;
            print_json(&engine.get_sequence_recommendations(recent, candidates, *top_k))?;
            engine.shutdown().await?;
            Ok(())
        }
        Command::Metrics {
            name,
            window_secs,
            limit,
        } => {
            let engine = open_engine(&cli).await?;
            let window = Duration::from_secs(*window_secs);
            print_json(&engine.recent_metrics(name.as_deref(), window, *limit).await?)?;
            engine.shutdown().await?;
            Ok(())
        }
        Command::Schema { kind } => print_json(&payload_schema(*kind)?),
    }
}
