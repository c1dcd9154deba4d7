mod cli_args;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use sieve_grouper::{Grouper, GrouperConfig, PassLock, PassReport};
use sieve_store::{
    CheckpointStore, ErrorGroup, FileCheckpointStore, GroupQuery, GroupStore, LogRecord,
    SqliteSieveStore, StatusActor,
};
use tracing::info;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

use crate::cli_args::{Cli, Command};

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

fn load_config(cli: &Cli) -> Result<GrouperConfig> {
    match &cli.config {
        Some(path) => GrouperConfig::load(path),
        None => Ok(GrouperConfig::default()),
    }
}

fn checkpoint_store(cli: &Cli, store: &Arc<SqliteSieveStore>) -> Arc<dyn CheckpointStore> {
    match &cli.checkpoint_file {
        Some(path) => Arc::new(FileCheckpointStore::new(path)),
        None => store.clone(),
    }
}

/// Parses newline-delimited JSON records. Blank lines are skipped.
fn parse_records(raw: &str, source: &Path) -> Result<Vec<LogRecord>> {
    raw.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str::<LogRecord>(line).with_context(|| {
                format!("invalid log record at {}:{}", source.display(), index + 1)
            })
        })
        .collect()
}

fn render_report(report: &PassReport) -> String {
    let checkpoint = report
        .checkpoint
        .position
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "beginning".to_string());
    let mut lines = vec![
        format!(
            "records={} pages={} already_applied={} groups_created={} groups_updated={}",
            report.records_scanned,
            report.pages_flushed,
            report.pages_already_applied,
            report.groups_created,
            report.groups_updated
        ),
        format!(
            "levels: rule_failure={} logger_pattern={} custom={} unclassified={}",
            report.levels.rule_failure,
            report.levels.logger_pattern,
            report.levels.custom,
            report.levels.unclassified
        ),
        format!(
            "checkpoint={checkpoint} truncated={} caught_up={}",
            report.truncated, report.checkpoint_caught_up
        ),
    ];
    for issue in &report.rule_issues {
        lines.push(format!(
            "skipped rule '{}' ({:?}): {}",
            issue.rule, issue.source, issue.reason
        ));
    }
    lines.join("\n")
}

fn print_group(group: &ErrorGroup) -> Result<()> {
    println!("{}", serde_json::to_string(group).context("serialize error group")?);
    Ok(())
}

async fn run_cli(cli: Cli) -> Result<()> {
    let store = Arc::new(
        SqliteSieveStore::new(&cli.db)
            .with_context(|| format!("open database {}", cli.db.display()))?,
    );

    match &cli.command {
        Command::Run {
            batch_size,
            limit,
            json,
        } => {
            let mut config = load_config(&cli)?;
            if let Some(batch_size) = batch_size {
                config.batch_size = *batch_size;
            }
            if limit.is_some() {
                config.max_records_per_pass = *limit;
            }
            let checkpoints = checkpoint_store(&cli, &store);
            let mut grouper = Grouper::new(store.clone(), store.clone(), checkpoints, config)?
                .with_pass_lock(PassLock::path_for(&cli.db));
            let report = grouper.run_pass().await?;
            if *json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&report).context("serialize pass report")?
                );
            } else {
                println!("{}", render_report(&report));
            }
        }
        Command::Import { path } => {
            let raw = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("read {}", path.display()))?;
            let records = parse_records(&raw, path)?;
            let inserted = store.insert_records(&records)?;
            info!(
                read = records.len(),
                inserted,
                path = %path.display(),
                "imported log records"
            );
            println!("imported {inserted} of {} records", records.len());
        }
        Command::Groups {
            statuses,
            level,
            limit,
            offset,
        } => {
            let query = GroupQuery {
                statuses: (!statuses.is_empty()).then(|| statuses.clone()),
                level: *level,
                limit: *limit,
                offset: *offset,
            };
            for group in store.query_groups(query).await? {
                print_group(&group)?;
            }
        }
        Command::SetStatus {
            fingerprint,
            status,
            actor,
        } => {
            let group = store
                .transition_status(fingerprint, StatusActor::Operator, actor, *status)
                .await?;
            print_group(&group)?;
        }
        Command::Assign {
            fingerprint,
            user,
            actor,
        } => {
            let group = store
                .assign_user(fingerprint, actor, user.as_deref())
                .await?;
            print_group(&group)?;
        }
        Command::Comment {
            fingerprint,
            comments,
            actor,
        } => {
            let group = store.update_comments(fingerprint, actor, comments).await?;
            print_group(&group)?;
        }
        Command::Checkpoint => {
            let checkpoint = checkpoint_store(&cli, &store).load().await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&checkpoint).context("serialize checkpoint")?
            );
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    run_cli(cli).await
}
