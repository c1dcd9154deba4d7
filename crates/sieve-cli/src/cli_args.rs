use std::path::PathBuf;

use clap::{Parser, Subcommand};
use sieve_types::{ClassificationLevel, DiagnosisStatus};

fn parse_positive_usize(value: &str) -> Result<usize, String> {
    let parsed = value
        .parse::<usize>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_status(value: &str) -> Result<DiagnosisStatus, String> {
    DiagnosisStatus::parse(value).ok_or_else(|| {
        let known: Vec<&str> = DiagnosisStatus::ALL.iter().map(|status| status.as_str()).collect();
        format!("unknown status '{value}'; expected one of {}", known.join(", "))
    })
}

fn parse_level(value: &str) -> Result<ClassificationLevel, String> {
    ClassificationLevel::parse(value).ok_or_else(|| {
        let known: Vec<&str> = ClassificationLevel::ALL
            .iter()
            .map(|level| level.as_str())
            .collect();
        format!("unknown level '{value}'; expected one of {}", known.join(", "))
    })
}

#[derive(Debug, Parser)]
#[command(
    name = "sieve",
    about = "Groups error log records into fingerprinted error groups",
    version
)]
pub(crate) struct Cli {
    #[arg(
        long,
        env = "SIEVE_DB",
        default_value = "sieve.sqlite",
        help = "SQLite database holding log records, error groups and the checkpoint"
    )]
    pub db: PathBuf,

    #[arg(
        long,
        env = "SIEVE_CONFIG",
        help = "Grouper TOML configuration. Defaults apply when omitted."
    )]
    pub config: Option<PathBuf>,

    #[arg(
        long = "checkpoint-file",
        env = "SIEVE_CHECKPOINT_FILE",
        help = "Keep the pass checkpoint in this JSON file instead of the database"
    )]
    pub checkpoint_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Run one grouping pass from the stored checkpoint.
    Run {
        #[arg(long = "batch-size", value_parser = parse_positive_usize)]
        batch_size: Option<usize>,
        #[arg(
            long,
            value_parser = parse_positive_usize,
            help = "Stop after this many records; the next pass resumes from there"
        )]
        limit: Option<usize>,
        #[arg(long, help = "Print the pass report as JSON")]
        json: bool,
    },
    /// Load newline-delimited JSON log records into the database.
    Import { path: PathBuf },
    /// List error groups, highest count first, as JSON lines.
    Groups {
        #[arg(long = "status", value_parser = parse_status)]
        statuses: Vec<DiagnosisStatus>,
        #[arg(long, value_parser = parse_level)]
        level: Option<ClassificationLevel>,
        #[arg(long, value_parser = parse_positive_usize)]
        limit: Option<usize>,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Move a group to a new diagnosis status as an operator.
    SetStatus {
        fingerprint: String,
        #[arg(value_parser = parse_status)]
        status: DiagnosisStatus,
        #[arg(long, env = "SIEVE_ACTOR", default_value = "operator")]
        actor: String,
    },
    /// Assign a group to a user, or clear the assignment.
    Assign {
        fingerprint: String,
        #[arg(long)]
        user: Option<String>,
        #[arg(long, env = "SIEVE_ACTOR", default_value = "operator")]
        actor: String,
    },
    /// Replace a group's comments.
    Comment {
        fingerprint: String,
        comments: String,
        #[arg(long, env = "SIEVE_ACTOR", default_value = "operator")]
        actor: String,
    },
    /// Show the stored checkpoint.
    Checkpoint,
}
