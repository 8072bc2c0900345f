//! CLI surface.
//!
//! `rules <path>` and `metadata <path>` are dry-run analyzers; `full
//! <path>` runs the whole pipeline against one source and prints the
//! plan; `run [mode]` drives the configured pipeline (`MODE` env).

use crate::cancel::CancellationToken;
use crate::categories::Categories;
use crate::config::{AppConfig, ClassifierKind, Mode};
use crate::error::{Result, ShoeboxError};
use crate::orchestrator::Orchestrator;
use crate::probe::{MetadataProbe, SystemProbe};
use crate::rules::RulesEngine;
use clap::{Parser, Subcommand};
use shoebox_catalog::{basename, normalize_path, FolderAction};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(
    name = "shoebox",
    about = "Plan a deduplicated, categorized reorganization of messy file collections"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Mirror the full log stream to stderr
    #[arg(long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Evaluate the rules file against every file under a path
    Rules { path: PathBuf },

    /// Probe and print per-file metadata (MIME, document head)
    Metadata { path: PathBuf },

    /// Run the full pipeline against one source path and print the plan
    Full {
        path: PathBuf,

        /// Rules only, no AI calls
        #[arg(long)]
        no_ai: bool,

        /// Write the plan as JSON to this file
        #[arg(long, value_name = "FILE")]
        json: Option<PathBuf>,

        /// Override the AI endpoint spec (url|workers|model)
        #[arg(long, value_name = "URL")]
        ollama_url: Option<String>,

        /// Assert that a folder with this basename was disaggregated
        #[arg(long, value_name = "NAME")]
        expect_disaggregate: Vec<String>,

        /// Assert that a folder with this basename was kept
        #[arg(long, value_name = "NAME")]
        expect_keep: Vec<String>,
    },

    /// Run the configured pipeline (mode defaults to the MODE env var)
    Run { mode: Option<String> },
}

pub async fn dispatch(cli: Cli, mut config: AppConfig) -> Result<()> {
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("shutdown requested, draining workers");
                cancel.cancel();
            }
        });
    }

    match cli.command {
        Some(Commands::Rules { path }) => cmd_rules(&config, &path),
        Some(Commands::Metadata { path }) => cmd_metadata(&path),
        Some(Commands::Full {
            path,
            no_ai,
            json,
            ollama_url,
            expect_disaggregate,
            expect_keep,
        }) => {
            config.sources = vec![normalize_path(&path.to_string_lossy())];
            if no_ai {
                config.classifier_kind = ClassifierKind::Manual;
            }
            if let Some(url) = ollama_url {
                config.ollama_url = vec![url];
            }
            if std::env::var("DB_PATH").is_err() {
                config.db_path = std::env::temp_dir()
                    .join(format!("shoebox-full-{}.sqlite", std::process::id()));
            }
            cmd_full(config, cancel, json, expect_disaggregate, expect_keep).await
        }
        Some(Commands::Run { mode }) => {
            let mode = match mode {
                Some(raw) => Mode::parse(&raw)
                    .ok_or_else(|| ShoeboxError::Config(format!("Unknown mode '{raw}'")))?,
                None => config.mode,
            };
            let probe: Arc<dyn MetadataProbe> = Arc::new(SystemProbe::default());
            let orchestrator = Orchestrator::new(config, probe, cancel)?;
            orchestrator.run(mode).await
        }
        None => {
            use clap::CommandFactory;
            Cli::command().print_long_help().map_err(|e| {
                ShoeboxError::Config(format!("failed to print help: {e}"))
            })?;
            Ok(())
        }
    }
}

fn cmd_rules(config: &AppConfig, path: &PathBuf) -> Result<()> {
    let categories = Categories::from_path(&config.categories_path)?;
    let rules = RulesEngine::load(&config.rules_path, &categories)?;
    let probe = SystemProbe::default();
    let root = normalize_path(&path.to_string_lossy());

    for entry in walk_files(path) {
        let abs = normalize_path(&entry.to_string_lossy());
        let rel = abs.strip_prefix(&root).unwrap_or(&abs).to_string();
        let mime = probe.probe_mime(&entry);
        match rules.classify_file(&rel, &mime, &Default::default()) {
            Some(outcome) => println!(
                "{abs} -> {} (rule #{}, mode {})",
                outcome.category,
                outcome.rule_index,
                outcome.mode.as_str()
            ),
            None => println!("{abs} -> no match"),
        }
    }
    Ok(())
}

fn cmd_metadata(path: &PathBuf) -> Result<()> {
    let probe = SystemProbe::default();
    for entry in walk_files(path) {
        let mime = probe.probe_mime(&entry);
        let head = probe.probe_doc_head(&entry, 120);
        let head = head.replace('\n', " ");
        println!("{} mime={mime} head={head:?}", entry.display());
    }
    Ok(())
}

async fn cmd_full(
    config: AppConfig,
    cancel: CancellationToken,
    json: Option<PathBuf>,
    expect_disaggregate: Vec<String>,
    expect_keep: Vec<String>,
) -> Result<()> {
    let probe: Arc<dyn MetadataProbe> = Arc::new(SystemProbe::default());
    let orchestrator = Orchestrator::new(config, probe, cancel)?;
    orchestrator.run(Mode::All).await?;

    let plan = orchestrator.catalog().plan()?;
    for entry in &plan {
        match &entry.canonical_path {
            Some(canonical) => println!(
                "{} -> {} [{}] (duplicate of {canonical})",
                entry.source_path,
                entry.target_path,
                entry.op.as_str()
            ),
            None => println!(
                "{} -> {} [{}]",
                entry.source_path,
                entry.target_path,
                entry.op.as_str()
            ),
        }
    }
    println!("{} plan entries", plan.len());

    if let Some(json_path) = json {
        let rendered = serde_json::to_string_pretty(&plan)?;
        std::fs::write(&json_path, rendered)?;
        println!("plan written to {}", json_path.display());
    }

    check_expectations(&orchestrator, &expect_keep, &expect_disaggregate)?;
    Ok(())
}

fn check_expectations(
    orchestrator: &Orchestrator,
    expect_keep: &[String],
    expect_disaggregate: &[String],
) -> Result<()> {
    if expect_keep.is_empty() && expect_disaggregate.is_empty() {
        return Ok(());
    }
    let folders = orchestrator.catalog().folders_by_depth()?;
    for name in expect_keep {
        let ok = folders.iter().any(|f| {
            basename(&f.path) == name
                && matches!(
                    f.action,
                    Some(FolderAction::Keep) | Some(FolderAction::KeepExcept)
                )
        });
        if !ok {
            return Err(ShoeboxError::Invariant(format!(
                "expected folder '{name}' to be kept, but it was not"
            )));
        }
    }
    for name in expect_disaggregate {
        let ok = folders.iter().any(|f| {
            basename(&f.path) == name && f.action == Some(FolderAction::Disaggregate)
        });
        if !ok {
            return Err(ShoeboxError::Invariant(format!(
                "expected folder '{name}' to be disaggregated, but it was not"
            )));
        }
    }
    println!("folder action expectations satisfied");
    Ok(())
}

fn walk_files(path: &PathBuf) -> Vec<PathBuf> {
    if path.is_file() {
        return vec![path.clone()];
    }
    let mut out = Vec::new();
    for entry in ignore::WalkBuilder::new(path)
        .follow_links(false)
        .hidden(false)
        .ignore(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .parents(false)
        .build()
        .flatten()
    {
        if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            out.push(entry.into_path());
        }
    }
    out.sort();
    out
}
