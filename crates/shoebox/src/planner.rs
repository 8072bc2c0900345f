//! Deterministic plan emission.
//!
//! Consumes the frozen catalog and produces one plan entry per source
//! path: `place` for files redistributed into the category tree,
//! `keep-unit` for folders preserved as units, `skip-duplicate` for
//! redundant copies. Output is sorted by source path, so re-running on an
//! unchanged catalog produces byte-identical output.

use crate::categories::{render_template, Categories, DEFAULT_CATEGORY};
use crate::config::AppConfig;
use crate::error::{Result, ShoeboxError};
use shoebox_catalog::{
    basename, parent_path, Catalog, CatalogWriter, FolderAction, FolderRecord, PlanEntry, PlanOp,
    WriteOp,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default)]
pub struct PlanStats {
    pub placed: u64,
    pub keep_units: u64,
    pub skipped_duplicates: u64,
    pub unplanned: u64,
    pub duration_ms: u64,
}

pub struct Planner {
    catalog: Catalog,
    writer: CatalogWriter,
    categories: Arc<Categories>,
    config: AppConfig,
}

impl Planner {
    pub fn new(
        catalog: Catalog,
        writer: CatalogWriter,
        categories: Arc<Categories>,
        config: AppConfig,
    ) -> Self {
        Self {
            catalog,
            writer,
            categories,
            config,
        }
    }

    pub fn run(&self) -> Result<PlanStats> {
        let start = Instant::now();
        let mut stats = PlanStats::default();

        let folders = self.catalog.folders_by_depth()?;
        let files = self.catalog.all_files()?;
        let actions: BTreeMap<&str, FolderAction> = folders
            .iter()
            .filter_map(|f| f.action.map(|a| (f.path.as_str(), a)))
            .collect();

        // Duplicate folder groups: only the canonical representative is
        // planned, and nothing under a suppressed member is.
        let groups = self.catalog.duplicate_folder_groups()?;
        let mut suppressed: BTreeMap<String, String> = BTreeMap::new();
        for group in &groups {
            let canonical = group.canonical().to_string();
            for member in &group.paths {
                if member != &canonical {
                    suppressed.insert(member.clone(), canonical.clone());
                }
            }
        }

        let mut entries: Vec<PlanEntry> = Vec::new();

        // Folders that contain at least one file somewhere beneath them.
        // Empty subtrees produce no plan entries.
        let mut populated: std::collections::HashSet<String> = std::collections::HashSet::new();
        for file in &files {
            let mut current = parent_path(&file.path).to_string();
            while !current.is_empty() && current != "/" {
                if !populated.insert(current.clone()) {
                    break;
                }
                current = parent_path(&current).to_string();
            }
        }

        // Keep units: folders preserved as one unit, anchored at the
        // topmost keep/keep_except marker.
        let mut unit_targets: HashMap<String, String> = HashMap::new();
        for folder in &folders {
            if !is_unit_root(folder, &actions) || !populated.contains(&folder.path) {
                continue;
            }
            let target = self.unit_target(folder)?;
            unit_targets.insert(folder.path.clone(), target.clone());
            if under_suppressed(&folder.path, &suppressed) {
                continue;
            }
            if suppressed.contains_key(&folder.path) {
                continue; // gets a skip-duplicate entry below
            }
            entries.push(PlanEntry {
                source_path: folder.path.clone(),
                target_path: target,
                op: PlanOp::KeepUnit,
                decision: folder.decision_source.map(|s| s.as_str().to_string()),
                canonical_path: None,
            });
            stats.keep_units += 1;
        }

        // Skip-duplicate entries for redundant folder copies.
        for (member, canonical) in &suppressed {
            if under_suppressed(member, &suppressed) || !populated.contains(member) {
                continue;
            }
            if covering_anchor(parent_path(member), &actions).is_some() {
                // Inside a kept unit: the unit moves as one, nothing to
                // suppress individually.
                continue;
            }
            let target = unit_targets
                .get(canonical)
                .cloned()
                .unwrap_or_else(|| canonical.clone());
            entries.push(PlanEntry {
                source_path: member.clone(),
                target_path: target,
                op: PlanOp::SkipDuplicate,
                decision: None,
                canonical_path: Some(canonical.clone()),
            });
            stats.skipped_duplicates += 1;
        }

        // Place entries for files outside kept units. `all_files` is
        // path-sorted, so suffixing is deterministic.
        let mut claimed: HashMap<String, (String, Option<String>)> = HashMap::new();
        for file in &files {
            if under_suppressed(&file.path, &suppressed) {
                continue;
            }
            let parent = parent_path(&file.path);
            if covering_anchor(parent, &actions).is_some() {
                continue; // moves with its unit
            }
            let Some(category) = file.category.as_deref() else {
                warn!(path = %file.path, "file has no classification, leaving unplanned");
                stats.unplanned += 1;
                continue;
            };
            if !self.categories.is_legal(category) {
                return Err(ShoeboxError::Invariant(format!(
                    "file '{}' classified into unknown category '{category}'",
                    file.path
                )));
            }
            let name = basename(&file.path);
            let desired = self.join_target(category, name);

            match claimed.get(&desired) {
                None => {
                    claimed.insert(desired.clone(), (file.path.clone(), file.content_hash.clone()));
                    entries.push(PlanEntry {
                        source_path: file.path.clone(),
                        target_path: desired,
                        op: PlanOp::Place,
                        decision: file.decision_source.map(|s| s.as_str().to_string()),
                        canonical_path: None,
                    });
                    stats.placed += 1;
                }
                Some((first_source, first_hash)) => {
                    let same_content = first_hash.is_some()
                        && file.content_hash.is_some()
                        && *first_hash == file.content_hash;
                    if same_content {
                        entries.push(PlanEntry {
                            source_path: file.path.clone(),
                            target_path: desired,
                            op: PlanOp::SkipDuplicate,
                            decision: None,
                            canonical_path: Some(first_source.clone()),
                        });
                        stats.skipped_duplicates += 1;
                    } else {
                        let target = self.suffixed_target(category, name, &claimed)?;
                        claimed
                            .insert(target.clone(), (file.path.clone(), file.content_hash.clone()));
                        entries.push(PlanEntry {
                            source_path: file.path.clone(),
                            target_path: target,
                            op: PlanOp::Place,
                            decision: file.decision_source.map(|s| s.as_str().to_string()),
                            canonical_path: None,
                        });
                        stats.placed += 1;
                    }
                }
            }
        }

        entries.sort_by(|a, b| a.source_path.cmp(&b.source_path));

        self.writer.submit(WriteOp::ClearPlan)?;
        for entry in entries {
            self.writer.submit(WriteOp::AddPlanEntry(entry))?;
        }
        self.writer.flush()?;

        stats.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            placed = stats.placed,
            keep_units = stats.keep_units,
            skipped_duplicates = stats.skipped_duplicates,
            unplanned = stats.unplanned,
            duration_ms = stats.duration_ms,
            "plan complete"
        );
        Ok(stats)
    }

    /// Target directory for a kept unit:
    /// `<main_target>/<category>[/<backup_year>[/<backup_month>]]/<basename>`,
    /// or the category's declared template rendered with the folder
    /// metadata (`{suffix}` is the unit basename).
    fn unit_target(&self, folder: &FolderRecord) -> Result<String> {
        let category = folder.category.as_deref().unwrap_or(DEFAULT_CATEGORY);
        if !self.categories.is_legal(category) {
            return Err(ShoeboxError::Invariant(format!(
                "folder '{}' classified into unknown category '{category}'",
                folder.path
            )));
        }
        if let Some(template) = self.categories.template_for(category) {
            let mut context = folder.metadata.clone();
            context.insert("suffix".to_string(), folder.name().to_string());
            if let Some(rendered) = render_template(template, &context) {
                let root = self.config.main_target.trim_end_matches('/');
                return Ok(if root.is_empty() {
                    rendered
                } else {
                    format!("{root}/{rendered}")
                });
            }
        }
        let category = apply_dated_grouping(category, &folder.metadata);
        Ok(self.join_target(&category, folder.name()))
    }

    fn join_target(&self, category: &str, name: &str) -> String {
        let target_root = self.config.main_target.trim_end_matches('/');
        if target_root.is_empty() {
            format!("{category}/{name}")
        } else {
            format!("{target_root}/{category}/{name}")
        }
    }

    /// Deterministic `name (2).ext` suffixing for contested targets.
    fn suffixed_target(
        &self,
        category: &str,
        name: &str,
        claimed: &HashMap<String, (String, Option<String>)>,
    ) -> Result<String> {
        let (stem, ext) = match name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
            _ => (name, None),
        };
        for counter in 2..10_000u32 {
            let candidate_name = match ext {
                Some(ext) => format!("{stem} ({counter}).{ext}"),
                None => format!("{stem} ({counter})"),
            };
            let candidate = self.join_target(category, &candidate_name);
            if !claimed.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
        let first = claimed
            .get(&self.join_target(category, name))
            .map(|(source, _)| source.clone())
            .unwrap_or_default();
        Err(ShoeboxError::PlanConflict {
            target: self.join_target(category, name),
            first,
            second: name.to_string(),
        })
    }
}

/// A folder starts a kept unit when it carries a keep/keep_except action
/// and no ancestor already covers it.
fn is_unit_root(folder: &FolderRecord, actions: &BTreeMap<&str, FolderAction>) -> bool {
    matches!(
        folder.action,
        Some(FolderAction::Keep) | Some(FolderAction::KeepExcept)
    ) && covering_anchor(parent_path(&folder.path), actions).is_none()
}

/// Nearest ancestor decision that settles coverage: keep/keep_except
/// anchors a unit, an explicit disaggregate carves the subtree back out.
fn covering_anchor<'a>(
    start: &str,
    actions: &BTreeMap<&'a str, FolderAction>,
) -> Option<&'a str> {
    let mut current = start;
    while !current.is_empty() && current != "/" {
        match actions.get_key_value(current) {
            Some((path, FolderAction::Keep)) | Some((path, FolderAction::KeepExcept)) => {
                return Some(*path)
            }
            Some((_, FolderAction::Disaggregate)) => return None,
            _ => {}
        }
        current = parent_path(current);
    }
    None
}

fn under_suppressed(path: &str, suppressed: &BTreeMap<String, String>) -> bool {
    suppressed.keys().any(|s| {
        path.len() > s.len() && path.starts_with(s) && path.as_bytes()[s.len()] == b'/'
    })
}

/// Prepend dated-backup components captured on the folder to the category
/// path, unless the template already consumed them.
fn apply_dated_grouping(
    category: &str,
    metadata: &std::collections::BTreeMap<String, String>,
) -> String {
    let Some(year) = metadata.get("backup_year").filter(|y| !y.is_empty()) else {
        return category.to_string();
    };
    let mut out = category.to_string();
    if !category.split('/').any(|seg| seg == year) {
        out = format!("{out}/{year}");
    }
    if let Some(month) = metadata.get("backup_month").filter(|m| !m.is_empty()) {
        if !out.split('/').any(|seg| seg == month.as_str()) {
            out = format!("{out}/{month}");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn covering_anchor_stops_at_disaggregate() {
        let mut actions: BTreeMap<&str, FolderAction> = BTreeMap::new();
        actions.insert("/home/alice", FolderAction::KeepExcept);
        actions.insert("/home/alice/Documents", FolderAction::Disaggregate);
        actions.insert("/home/alice/.config", FolderAction::Keep);

        // Directly under the anchor: covered.
        assert_eq!(covering_anchor("/home/alice", &actions), Some("/home/alice"));
        // Under the carved-out subtree: not covered.
        assert_eq!(covering_anchor("/home/alice/Documents", &actions), None);
        // Under the kept child: covered.
        assert_eq!(
            covering_anchor("/home/alice/.config", &actions),
            Some("/home/alice/.config")
        );
    }

    #[test]
    fn dated_grouping_appends_year_and_month_once() {
        let mut metadata = std::collections::BTreeMap::new();
        metadata.insert("backup_year".to_string(), "2024".to_string());
        assert_eq!(apply_dated_grouping("Photos", &metadata), "Photos/2024");
        assert_eq!(apply_dated_grouping("Photos/2024", &metadata), "Photos/2024");
        metadata.insert("backup_month".to_string(), "03".to_string());
        assert_eq!(apply_dated_grouping("Photos", &metadata), "Photos/2024/03");
    }
}
