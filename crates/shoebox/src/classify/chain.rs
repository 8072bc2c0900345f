//! The classification chain: Rules → AI → Default, with strict top-down
//! folder ordering and KEEP inheritance.
//!
//! Folders are processed in ascending depth, path-sorted within a depth
//! band, and each band is committed before the next one starts (the depth
//! barrier). Once a folder is committed KEEP, every descendant is stamped
//! `(keep, inherited)` without ever touching the rules engine or the AI.
//! A second classification of the same folder, or an evaluation of a KEEP
//! descendant, is a fatal invariant error.

use crate::ai::{AiPool, FileClassifyRequest, FolderActionRequest};
use crate::cancel::CancellationToken;
use crate::categories::{Categories, DEFAULT_CATEGORY};
use crate::classify::samples::{build_samples, FolderSample};
use crate::config::AppConfig;
use crate::error::{Result, ShoeboxError};
use crate::probe::MetadataProbe;
use crate::rules::{FolderHint, RuleMode, RulesEngine};
use regex::{Regex, RegexBuilder};
use shoebox_catalog::{
    parent_path, Catalog, CatalogWriter, DecisionSource, FolderAction, WriteOp,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default)]
pub struct FolderChainStats {
    pub classified: u64,
    pub inherited: u64,
    pub rule_final: u64,
    pub ai_decided: u64,
    pub defaults: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FileChainStats {
    pub classified: u64,
    pub rule_final: u64,
    pub ai_decided: u64,
    pub inherited: u64,
    pub defaults: u64,
}

/// One folder queued for the AI stage within a depth band.
struct PendingFolder {
    path: String,
    request: FolderActionRequest,
    hint: Option<FolderAction>,
    rule_category: Option<String>,
    captures: BTreeMap<String, String>,
}

/// One file queued for the AI stage.
struct PendingFile {
    path: String,
    request: FileClassifyRequest,
    fallback_category: String,
    metadata: BTreeMap<String, String>,
}

pub struct ClassifierChain {
    catalog: Catalog,
    writer: CatalogWriter,
    rules: Arc<RulesEngine>,
    categories: Arc<Categories>,
    probe: Arc<dyn MetadataProbe>,
    ai: Option<Arc<AiPool>>,
    config: AppConfig,
    wrapper: Option<Regex>,
    cancel: CancellationToken,
}

impl ClassifierChain {
    pub fn new(
        catalog: Catalog,
        writer: CatalogWriter,
        rules: Arc<RulesEngine>,
        categories: Arc<Categories>,
        probe: Arc<dyn MetadataProbe>,
        ai: Option<Arc<AiPool>>,
        config: AppConfig,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let wrapper = config
            .source_wrapper_regex
            .as_deref()
            .map(|pat| {
                RegexBuilder::new(&format!("^(?:{pat})$"))
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| {
                        ShoeboxError::Config(format!("Invalid SOURCE_WRAPPER_REGEX: {e}"))
                    })
            })
            .transpose()?;
        Ok(Self {
            catalog,
            writer,
            rules,
            categories,
            probe,
            ai,
            config,
            wrapper,
            cancel,
        })
    }

    /// Source-relative path used for rule matching: the longest matching
    /// source root is stripped, then a single wrapper component.
    fn rel(&self, path: &str) -> String {
        let mut best: Option<&str> = None;
        for raw in &self.config.sources {
            let root = raw.trim().trim_end_matches('/');
            if root.is_empty() {
                continue;
            }
            let matches = path == root
                || (path.len() > root.len()
                    && path.starts_with(root)
                    && path.as_bytes()[root.len()] == b'/');
            if matches && best.map_or(true, |b| root.len() > b.len()) {
                best = Some(root);
            }
        }
        let rel = match best {
            Some(root) => &path[root.len()..],
            None => path,
        };
        let mut parts: Vec<&str> = rel.split('/').filter(|s| !s.is_empty()).collect();
        if let (Some(first), Some(wrapper)) = (parts.first(), &self.wrapper) {
            if wrapper.is_match(first) {
                parts.remove(0);
            }
        }
        if parts.is_empty() {
            "/".to_string()
        } else {
            format!("/{}", parts.join("/"))
        }
    }

    // ==================================================================
    // Folder classification
    // ==================================================================

    pub async fn classify_folders(&self) -> Result<FolderChainStats> {
        let start = Instant::now();
        let mut stats = FolderChainStats::default();

        let folders = self.catalog.folders_by_depth()?;
        let files = self.catalog.all_files()?;
        let samples = build_samples(&folders, &files, |p| self.rel(p));

        // Committed actions from a previous run; the chain never
        // re-classifies them.
        let mut decided: BTreeMap<String, FolderAction> = BTreeMap::new();
        for folder in &folders {
            if let Some(action) = folder.action {
                decided.insert(folder.path.clone(), action);
            }
        }

        info!(
            folders = folders.len(),
            already_decided = decided.len(),
            ai = self.ai.is_some(),
            "folder classification start"
        );

        let budget = self.config.classify_budget_secs;
        let mut idx = 0;
        while idx < folders.len() {
            let depth = folders[idx].depth;
            let mut end = idx;
            while end < folders.len() && folders[end].depth == depth {
                end += 1;
            }
            let band: Vec<&shoebox_catalog::FolderRecord> = folders[idx..end].iter().collect();
            self.classify_band(&band, &samples, &mut decided, &mut stats, budget, start)
                .await?;
            // Depth barrier: everything at depth d is committed before any
            // folder at depth d+1 is dispatched.
            self.writer.flush()?;
            idx = end;
        }

        stats.classified =
            stats.inherited + stats.rule_final + stats.ai_decided + stats.defaults;
        info!(
            classified = stats.classified,
            inherited = stats.inherited,
            rule_final = stats.rule_final,
            ai = stats.ai_decided,
            defaults = stats.defaults,
            duration_ms = start.elapsed().as_millis() as u64,
            "folder classification complete"
        );
        Ok(stats)
    }

    async fn classify_band(
        &self,
        band: &[&shoebox_catalog::FolderRecord],
        samples: &BTreeMap<String, FolderSample>,
        decided: &mut BTreeMap<String, FolderAction>,
        stats: &mut FolderChainStats,
        budget_secs: u64,
        started: Instant,
    ) -> Result<()> {
        let mut pending: Vec<PendingFolder> = Vec::new();

        for folder in band {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            if folder.action.is_some() {
                continue;
            }

            // KEEP inheritance: stamped without rules or AI.
            if let Some((ancestor, FolderAction::Keep)) =
                nearest_decided(decided, &folder.path)
            {
                debug!(folder = %folder.path, parent = %ancestor, "inherited keep");
                self.commit(
                    decided,
                    &folder.path,
                    FolderAction::Keep,
                    DecisionSource::Inherited,
                    None,
                    BTreeMap::new(),
                )?;
                stats.inherited += 1;
                continue;
            }

            // Wall-clock budget exhausted: remaining folders fall through
            // to the default.
            if budget_secs > 0 && started.elapsed().as_secs() > budget_secs {
                let (action, source) = self.default_decision(decided, &folder.path);
                self.commit(decided, &folder.path, action, source, None, BTreeMap::new())?;
                stats.defaults += 1;
                continue;
            }

            let Some(sample) = samples.get(&folder.path) else {
                self.commit(
                    decided,
                    &folder.path,
                    FolderAction::Keep,
                    DecisionSource::Default,
                    None,
                    BTreeMap::new(),
                )?;
                stats.defaults += 1;
                continue;
            };
            if sample.total_files == 0 {
                // Nothing inside to redistribute.
                self.commit(
                    decided,
                    &folder.path,
                    FolderAction::Keep,
                    DecisionSource::Default,
                    None,
                    BTreeMap::new(),
                )?;
                stats.defaults += 1;
                continue;
            }

            match self
                .rules
                .folder_hint(sample, self.config.folder_sample_limit)
            {
                FolderHint::Final {
                    action,
                    category,
                    captures,
                    reason,
                } => {
                    debug!(folder = %folder.path, action = %action, reason = %reason, "rule-final");
                    let action = if action == FolderAction::KeepParent {
                        FolderAction::Keep
                    } else {
                        action
                    };
                    self.commit(
                        decided,
                        &folder.path,
                        action,
                        DecisionSource::RuleFinal,
                        category,
                        captures,
                    )?;
                    stats.rule_final += 1;
                }
                FolderHint::Delegate {
                    hint,
                    category,
                    captures,
                    reason,
                } => {
                    if self.ai.is_some() {
                        debug!(folder = %folder.path, ?hint, reason = %reason, "delegating to AI");
                        pending.push(PendingFolder {
                            path: folder.path.clone(),
                            request: FolderActionRequest {
                                payload: sample.payload_json(self.config.folder_sample_limit),
                                hint,
                                rule_category: category.clone(),
                            },
                            hint,
                            rule_category: category,
                            captures,
                        });
                    } else {
                        let (action, source) = match hint {
                            Some(action) => (action, DecisionSource::Default),
                            None => self.default_decision(decided, &folder.path),
                        };
                        self.commit(
                            decided,
                            &folder.path,
                            action,
                            source,
                            category,
                            captures,
                        )?;
                        stats.defaults += 1;
                    }
                }
            }
        }

        if pending.is_empty() {
            return Ok(());
        }
        let pool = self.ai.as_ref().expect("pending implies AI pool");
        let batch_size = self.config.ollama_batch_size.max(1);
        let mut queue = pending;
        while !queue.is_empty() {
            let rest = queue.split_off(queue.len().min(batch_size));
            let batch = std::mem::replace(&mut queue, rest);
            let requests: Vec<FolderActionRequest> =
                batch.iter().map(|p| p.request.clone()).collect();
            let results = pool.decide_folders(requests, &self.cancel).await;
            self.commit_ai_folder_batch(batch, results, decided, stats)?;
        }
        Ok(())
    }

    fn commit_ai_folder_batch(
        &self,
        batch: Vec<PendingFolder>,
        results: Vec<Result<crate::ai::FolderDecision>>,
        decided: &mut BTreeMap<String, FolderAction>,
        stats: &mut FolderChainStats,
    ) -> Result<()> {
        for (item, result) in batch.into_iter().zip(results) {
            match result {
                Ok(decision) => {
                    let source = if item.hint.is_some() {
                        DecisionSource::RuleHintAi
                    } else {
                        DecisionSource::Ai
                    };
                    let category = decision
                        .category
                        .as_deref()
                        .and_then(|c| self.categories.normalize_answer(c))
                        .or(item.rule_category);
                    self.commit(
                        decided,
                        &item.path,
                        decision.action,
                        source,
                        category,
                        item.captures,
                    )?;
                    stats.ai_decided += 1;
                }
                Err(e) => {
                    warn!(folder = %item.path, error = %e, "AI unavailable, using default");
                    let (action, source) = match item.hint {
                        Some(action) => (action, DecisionSource::Default),
                        None => self.default_decision(decided, &item.path),
                    };
                    self.commit(
                        decided,
                        &item.path,
                        action,
                        source,
                        item.rule_category,
                        item.captures,
                    )?;
                    stats.defaults += 1;
                }
            }
        }
        Ok(())
    }

    /// Default when the chain is exhausted: keep under a keep_except
    /// anchor (the anchor preserves structure unless a descendant
    /// explicitly disaggregates), disaggregate everywhere else.
    fn default_decision(
        &self,
        decided: &BTreeMap<String, FolderAction>,
        path: &str,
    ) -> (FolderAction, DecisionSource) {
        match nearest_decided(decided, path) {
            Some((_, FolderAction::KeepExcept)) => {
                (FolderAction::Keep, DecisionSource::Inherited)
            }
            _ => (FolderAction::Disaggregate, DecisionSource::Default),
        }
    }

    fn commit(
        &self,
        decided: &mut BTreeMap<String, FolderAction>,
        path: &str,
        action: FolderAction,
        source: DecisionSource,
        category: Option<String>,
        metadata: BTreeMap<String, String>,
    ) -> Result<()> {
        if decided.contains_key(path) {
            return Err(ShoeboxError::Invariant(format!(
                "folder '{path}' is about to be classified twice"
            )));
        }
        if source != DecisionSource::Inherited {
            if let Some((ancestor, FolderAction::Keep)) = nearest_decided(decided, path) {
                return Err(ShoeboxError::Invariant(format!(
                    "folder '{path}' under KEEP ancestor '{ancestor}' was evaluated"
                )));
            }
        }
        info!(folder = %path, action = %action, source = %source, "folder action decided");
        self.writer.submit(WriteOp::DecideFolder {
            path: path.to_string(),
            action,
            source,
            category,
            metadata,
            decided_at: chrono::Utc::now().timestamp_millis(),
        })?;
        decided.insert(path.to_string(), action);
        Ok(())
    }

    // ==================================================================
    // File classification
    // ==================================================================

    pub async fn classify_files(&self) -> Result<FileChainStats> {
        let start = Instant::now();
        let mut stats = FileChainStats::default();

        let files = self.catalog.files_unclassified(None)?;
        let actions = self.catalog.folder_actions()?;
        let folder_categories: BTreeMap<String, String> = self
            .catalog
            .folders_by_depth()?
            .into_iter()
            .filter_map(|f| f.category.map(|c| (f.path, c)))
            .collect();

        info!(files = files.len(), "file classification start");

        let mut pending: Vec<PendingFile> = Vec::new();
        for file in &files {
            if self.cancel.is_cancelled() {
                break;
            }
            let parent = parent_path(&file.path);
            let parent_action = actions.get(parent).copied();

            // Files inside a kept unit move with it; no evaluation.
            if matches!(
                parent_action,
                Some(FolderAction::Keep) | Some(FolderAction::KeepExcept)
            ) {
                let category = nearest_category(&folder_categories, parent)
                    .unwrap_or(DEFAULT_CATEGORY)
                    .to_string();
                self.commit_file(
                    &file.path,
                    category,
                    DecisionSource::Inherited,
                    None,
                    file.metadata.clone(),
                )?;
                stats.inherited += 1;
                continue;
            }

            let mime = file.mime.as_deref().unwrap_or(crate::probe::OCTET_STREAM);
            let rel = self.rel(&file.path);
            let mut metadata = file.metadata.clone();
            if mime.starts_with("image/") {
                for (key, value) in self.probe.probe_exif(std::path::Path::new(&file.path)) {
                    metadata.entry(key).or_insert(value);
                }
            }

            match self.rules.classify_file(&rel, mime, &metadata) {
                Some(outcome) if outcome.mode == RuleMode::Final => {
                    metadata.extend(outcome.captures);
                    self.commit_file(
                        &file.path,
                        outcome.category,
                        DecisionSource::RuleFinal,
                        None,
                        metadata,
                    )?;
                    stats.rule_final += 1;
                }
                Some(outcome) => {
                    metadata.extend(outcome.captures.clone());
                    if self.ai.is_some() {
                        let sample = self.probe.probe_doc_head(
                            std::path::Path::new(&file.path),
                            self.config.max_content_peek,
                        );
                        pending.push(PendingFile {
                            path: file.path.clone(),
                            request: FileClassifyRequest {
                                name: file.name().to_string(),
                                rel_path: rel,
                                mime: mime.to_string(),
                                sample,
                                rule_hint: Some(outcome.category.clone()),
                                metadata: metadata.clone(),
                            },
                            fallback_category: outcome.category,
                            metadata,
                        });
                    } else {
                        self.commit_file(
                            &file.path,
                            outcome.category,
                            DecisionSource::RuleHintAi,
                            None,
                            metadata,
                        )?;
                        stats.rule_final += 1;
                    }
                }
                None => {
                    let fallback = nearest_category(&folder_categories, parent)
                        .unwrap_or(DEFAULT_CATEGORY)
                        .to_string();
                    if self.ai.is_some() && parent_action == Some(FolderAction::Disaggregate) {
                        let sample = self.probe.probe_doc_head(
                            std::path::Path::new(&file.path),
                            self.config.max_content_peek,
                        );
                        pending.push(PendingFile {
                            path: file.path.clone(),
                            request: FileClassifyRequest {
                                name: file.name().to_string(),
                                rel_path: rel,
                                mime: mime.to_string(),
                                sample,
                                rule_hint: None,
                                metadata: metadata.clone(),
                            },
                            fallback_category: fallback,
                            metadata,
                        });
                    } else {
                        self.commit_file(
                            &file.path,
                            fallback,
                            DecisionSource::Default,
                            None,
                            metadata,
                        )?;
                        stats.defaults += 1;
                    }
                }
            }
        }

        if !pending.is_empty() {
            let pool = self.ai.as_ref().expect("pending implies AI pool");
            let batch_size = self.config.ollama_batch_size.max(1);
            let mut queue = pending;
            while !queue.is_empty() {
                let rest = queue.split_off(queue.len().min(batch_size));
                let batch = std::mem::replace(&mut queue, rest);
                let requests: Vec<FileClassifyRequest> =
                    batch.iter().map(|p| p.request.clone()).collect();
                let results = pool.classify_files(requests, &self.cancel).await;
                for (item, result) in batch.into_iter().zip(results) {
                    match result {
                        Ok(decision) => {
                            let category = decision
                                .category
                                .as_deref()
                                .and_then(|c| self.categories.normalize_answer(c))
                                .unwrap_or(item.fallback_category);
                            self.commit_file(
                                &item.path,
                                category,
                                DecisionSource::Ai,
                                decision.confidence,
                                item.metadata,
                            )?;
                            stats.ai_decided += 1;
                        }
                        Err(e) => {
                            debug!(file = %item.path, error = %e, "AI unavailable, using fallback");
                            self.commit_file(
                                &item.path,
                                item.fallback_category,
                                DecisionSource::Default,
                                None,
                                item.metadata,
                            )?;
                            stats.defaults += 1;
                        }
                    }
                }
            }
        }

        self.writer.flush()?;
        stats.classified = stats.rule_final + stats.ai_decided + stats.inherited + stats.defaults;
        info!(
            classified = stats.classified,
            rule_final = stats.rule_final,
            ai = stats.ai_decided,
            inherited = stats.inherited,
            defaults = stats.defaults,
            duration_ms = start.elapsed().as_millis() as u64,
            "file classification complete"
        );
        Ok(stats)
    }

    fn commit_file(
        &self,
        path: &str,
        category: String,
        source: DecisionSource,
        confidence: Option<f64>,
        metadata: BTreeMap<String, String>,
    ) -> Result<()> {
        debug!(file = %path, category = %category, source = %source, "file classified");
        self.writer.submit(WriteOp::ClassifyFile {
            path: path.to_string(),
            category,
            source,
            confidence,
            metadata,
        })?;
        Ok(())
    }
}

/// Nearest ancestor (excluding `path` itself) with a committed action.
fn nearest_decided<'a>(
    decided: &'a BTreeMap<String, FolderAction>,
    path: &str,
) -> Option<(&'a str, FolderAction)> {
    let mut current = parent_path(path);
    while !current.is_empty() && current != "/" {
        if let Some((key, action)) = decided.get_key_value(current) {
            return Some((key.as_str(), *action));
        }
        current = parent_path(current);
    }
    None
}

/// Category of the nearest folder (starting at `path` itself) that has
/// one.
fn nearest_category<'a>(
    categories: &'a BTreeMap<String, String>,
    path: &str,
) -> Option<&'a str> {
    let mut current = path;
    while !current.is_empty() && current != "/" {
        if let Some(category) = categories.get(current) {
            return Some(category.as_str());
        }
        current = parent_path(current);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nearest_decided_walks_ancestors() {
        let mut decided = BTreeMap::new();
        decided.insert("/a".to_string(), FolderAction::Keep);
        assert_eq!(
            nearest_decided(&decided, "/a/b/c"),
            Some(("/a", FolderAction::Keep))
        );
        assert_eq!(nearest_decided(&decided, "/a"), None);
        assert_eq!(nearest_decided(&decided, "/other"), None);
    }

    #[test]
    fn nearest_category_includes_self() {
        let mut categories = BTreeMap::new();
        categories.insert("/a/b".to_string(), "Photos".to_string());
        assert_eq!(nearest_category(&categories, "/a/b"), Some("Photos"));
        assert_eq!(nearest_category(&categories, "/a/b/c"), Some("Photos"));
        assert_eq!(nearest_category(&categories, "/a"), None);
    }
}
