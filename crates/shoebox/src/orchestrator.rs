//! Modal pipeline driver.
//!
//! Wires the stages (scan → hash → classify → plan) over the shared
//! catalog. Each stage gets its own writer handle so batched commits are
//! fully drained at stage boundaries.

use crate::ai::AiPool;
use crate::cancel::CancellationToken;
use crate::categories::Categories;
use crate::classify::ClassifierChain;
use crate::config::{AppConfig, ClassifierKind, Mode};
use crate::error::Result;
use crate::hasher::Hasher;
use crate::planner::Planner;
use crate::probe::MetadataProbe;
use crate::rules::RulesEngine;
use crate::scanner::Scanner;
use shoebox_catalog::{Catalog, CatalogWriter};
use std::sync::Arc;
use tracing::info;

pub struct Orchestrator {
    config: AppConfig,
    catalog: Catalog,
    probe: Arc<dyn MetadataProbe>,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        config: AppConfig,
        probe: Arc<dyn MetadataProbe>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let catalog = Catalog::open(&config.db_path)?;
        Ok(Self {
            config,
            catalog,
            probe,
            cancel,
        })
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub async fn run(&self, mode: Mode) -> Result<()> {
        self.config.validate_for_run()?;
        info!(mode = mode.as_str(), sources = ?self.config.sources, "starting");

        let categories = Arc::new(Categories::from_path(&self.config.categories_path)?);
        let rules = Arc::new(RulesEngine::load(&self.config.rules_path, &categories)?);
        info!(rules = rules.len(), "rules compiled");

        // AI availability is checked up front: classify mode with an AI
        // classifier and no reachable endpoint aborts before any work.
        let ai: Option<Arc<AiPool>> = if mode.includes(Mode::Classify)
            && self.config.classifier_kind == ClassifierKind::Ai
        {
            Some(Arc::new(
                AiPool::connect(&self.config, categories.to_compact_json()).await?,
            ))
        } else {
            None
        };

        if mode.includes(Mode::Scan) {
            let handle = CatalogWriter::spawn(&self.catalog, self.config.db_batch_size)?;
            let scanner = Scanner::new(
                self.catalog.clone(),
                handle.writer(),
                Arc::clone(&self.probe),
                self.config.scan_workers,
                self.cancel.clone(),
            );
            let sources = self.config.sources.clone();
            tokio::task::spawn_blocking(move || scanner.scan(&sources))
                .await
                .expect("scan task panicked")?;
            handle.close()?;
        }

        if mode.includes(Mode::Hash) {
            let handle = CatalogWriter::spawn(&self.catalog, self.config.db_batch_size)?;
            let hasher = Hasher::new(
                self.catalog.clone(),
                handle.writer(),
                self.config.hash_workers,
                self.cancel.clone(),
            );
            hasher.run().await?;
            // The writer thread drains once every sender clone is gone.
            drop(hasher);
            handle.close()?;
        }

        if mode.includes(Mode::Classify) {
            let handle = CatalogWriter::spawn(&self.catalog, self.config.db_batch_size)?;
            let chain = ClassifierChain::new(
                self.catalog.clone(),
                handle.writer(),
                Arc::clone(&rules),
                Arc::clone(&categories),
                Arc::clone(&self.probe),
                ai.clone(),
                self.config.clone(),
                self.cancel.clone(),
            )?;
            chain.classify_folders().await?;
            chain.classify_files().await?;
            drop(chain);
            handle.close()?;
            if let Some(pool) = &ai {
                let (input, output) = pool.token_totals();
                info!(input_tokens = input, output_tokens = output, "AI token usage");
            }
        }

        if mode.includes(Mode::Plan) {
            let handle = CatalogWriter::spawn(&self.catalog, self.config.db_batch_size)?;
            let planner = Planner::new(
                self.catalog.clone(),
                handle.writer(),
                Arc::clone(&categories),
                self.config.clone(),
            );
            planner.run()?;
            drop(planner);
            handle.close()?;
        }

        info!(mode = mode.as_str(), "done");
        Ok(())
    }
}
