use std::path::PathBuf;

use clap::{Parser, Subcommand};

use omni_policy::PayloadKind;

#[derive(Parser)]
#[command(name = "omni-policy")]
#[command(about = "Inspect the adaptive action-selection engine: fingerprints, learned stats, sequences, schemas.")]
pub(crate) struct Cli {
    /// Override config home (directory holding `omni-dev-fusion/policy.yaml`).
    #[arg(long, global = true)]
    pub(crate) conf: Option<PathBuf>,

    /// Override the local backend directory.
    #[arg(long, global = true)]
    pub(crate) store: Option<PathBuf>,

    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Print the context fingerprint and keywords for an intent.
    Fingerprint {
        /// Free-form intent text.
        #[arg(long)]
        intent: String,

        /// Action executed just before.
        #[arg(long)]
        previous_action: Option<String>,

        /// Actions taken so far in the session.
        #[arg(long, default_value_t = 0)]
        session_length: u64,
    },
    /// Print learning statistics for the configured store.
    Stats,
    /// List successful episodes, best reward first.
    Sequences {
        /// Only episodes containing this action.
        #[arg(long)]
        action: Option<String>,

        /// Maximum episodes to print.
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Suggest next actions from learned sequences.
    Suggest {
        /// Recent actions, oldest first (comma separated).
        #[arg(long, value_delimiter = ',', required = true)]
        recent: Vec<String>,

        /// Candidate next actions (comma separated).
        #[arg(long, value_delimiter = ',', required = true)]
        candidates: Vec<String>,

        /// Maximum suggestions.
        #[arg(long, default_value_t = 5)]
        top_k: usize,
    },
    /// Print persisted learning metrics, newest first.
    Metrics {
        /// Only points of this metric (e.g. `reward`, `td_error`).
        #[arg(long)]
        name: Option<String>,

        /// Look-back window in seconds.
        #[arg(long, default_value_t = 3600)]
        window_secs: u64,

        /// Maximum points to print.
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Print the JSON Schema of a payload (e.g. `episode`, `recommendation`).
    Schema {
        /// Payload kind.
        kind: PayloadKind,
    },
}
