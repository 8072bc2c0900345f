//! Ordered classification rules.
//!
//! Rules load from a header-less CSV (`#` comments allowed) with columns
//! `path_regex, mime_glob, category_template, folder_action, mode`.
//! Evaluation is strictly sequential and the first match wins. Named
//! capture groups in the path regex become file metadata and may be
//! substituted into the category template as `{name}`.

use crate::categories::{render_template, Categories, CategoryPath};
use crate::classify::samples::FolderSample;
use crate::error::{Result, ShoeboxError};
use globset::{GlobBuilder, GlobMatcher};
use regex::{Regex, RegexBuilder};
use shoebox_catalog::FolderAction;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::warn;

/// Whether a rule's decision is authoritative or an AI hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleMode {
    /// The rule binds; no AI call
    Final,
    /// The rule result is a hint passed to the AI
    Ai,
}

impl RuleMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Final => "final",
            Self::Ai => "ai",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "final" | "" => Some(Self::Final),
            "ai" => Some(Self::Ai),
            _ => None,
        }
    }
}

/// One loaded rule, immutable after load.
#[derive(Debug, Clone)]
pub struct Rule {
    /// Position in file order; lower index wins
    pub index: usize,
    /// 1-based line number in the rules file
    pub line: usize,
    /// None means match any path
    pub path_pattern: Option<String>,
    /// None means match any MIME type
    pub mime_pattern: Option<String>,
    pub category_template: String,
    pub folder_action: Option<FolderAction>,
    pub mode: RuleMode,
}

struct CompiledRule {
    rule: Rule,
    path_regex: Option<Regex>,
    mime_glob: Option<GlobMatcher>,
}

/// Result of matching a file against the rules.
#[derive(Debug, Clone)]
pub struct RuleMatch<'a> {
    pub rule: &'a Rule,
    /// Named captures from the path regex
    pub captures: BTreeMap<String, String>,
}

/// Outcome of file classification through the rules engine.
#[derive(Debug, Clone)]
pub struct FileRuleOutcome {
    pub rule_index: usize,
    pub mode: RuleMode,
    /// Category with `{name}` placeholders already resolved
    pub category: String,
    pub folder_action: Option<FolderAction>,
    pub captures: BTreeMap<String, String>,
}

/// Folder-level advice from the rules stage of the chain.
#[derive(Debug, Clone)]
pub enum FolderHint {
    /// A rule finalized the decision; the chain commits it as rule-final.
    Final {
        action: FolderAction,
        category: Option<String>,
        captures: BTreeMap<String, String>,
        reason: String,
    },
    /// No binding rule; the AI stage runs with this hint.
    Delegate {
        hint: Option<FolderAction>,
        category: Option<String>,
        captures: BTreeMap<String, String>,
        reason: String,
    },
}

/// The compiled, ordered rule set. Stateless after load.
pub struct RulesEngine {
    rules: Vec<CompiledRule>,
}

impl RulesEngine {
    /// Load and compile rules from a CSV file. Fails fast on malformed
    /// regex, bad glob, unknown action/mode, or an implausible category
    /// prefix. Duplicate (path, mime) patterns only warn.
    pub fn load(path: &Path, categories: &Categories) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ShoeboxError::Config(format!("Rules file not found: {}: {e}", path.display()))
        })?;
        Self::from_csv(&text, categories)
    }

    pub fn from_csv(text: &str, categories: &Categories) -> Result<Self> {
        let mut rules: Vec<CompiledRule> = Vec::new();
        let mut seen_patterns: Vec<(Option<String>, Option<String>)> = Vec::new();

        for (line_idx, raw) in text.lines().enumerate() {
            let line_no = line_idx + 1;
            let line = strip_comment(raw);
            if line.is_empty() {
                continue;
            }
            let row = parse_csv_line(line)
                .map_err(|e| ShoeboxError::Config(format!("rules line {line_no}: {e}")))?;
            let get = |i: usize| row.get(i).map(String::as_str).unwrap_or("").trim();
            let path_pat = get(0);
            let mime_pat = get(1);
            let category_raw = get(2);
            let action_raw = get(3);
            let mode_raw = get(4);

            if category_raw.is_empty() {
                return Err(ShoeboxError::Config(format!(
                    "rules line {line_no}: missing category"
                )));
            }

            let path_pattern = normalize_pattern(path_pat);
            let mime_pattern = normalize_pattern(mime_pat);

            let path_regex = path_pattern
                .as_deref()
                .map(|pat| compile_path_regex(pat, line_no))
                .transpose()?;
            let mime_glob = mime_pattern
                .as_deref()
                .map(|pat| compile_mime_glob(pat, line_no))
                .transpose()?;

            let folder_action = if action_raw.is_empty() {
                None
            } else {
                Some(FolderAction::parse(action_raw).ok_or_else(|| {
                    ShoeboxError::Config(format!(
                        "rules line {line_no}: unknown folder action '{action_raw}'"
                    ))
                })?)
            };
            let mode = RuleMode::parse(mode_raw).ok_or_else(|| {
                ShoeboxError::Config(format!("rules line {line_no}: unknown mode '{mode_raw}'"))
            })?;

            let template = category_raw.trim_matches('/').to_string();
            let static_prefix = template_static_prefix(&template);
            if !static_prefix.is_empty() && !categories.is_plausible_prefix(&static_prefix) {
                return Err(ShoeboxError::Config(format!(
                    "rules line {line_no}: category '{template}' is not under a known category prefix"
                )));
            }

            let key = (path_pattern.clone(), mime_pattern.clone());
            if seen_patterns.contains(&key) {
                warn!(
                    line = line_no,
                    path = path_pat,
                    mime = mime_pat,
                    "unreachable duplicate rule, earlier rule always wins"
                );
            }
            seen_patterns.push(key);

            rules.push(CompiledRule {
                rule: Rule {
                    index: rules.len(),
                    line: line_no,
                    path_pattern,
                    mime_pattern,
                    category_template: template,
                    folder_action,
                    mode,
                },
                path_regex,
                mime_glob,
            });
        }

        Ok(Self { rules })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter().map(|c| &c.rule)
    }

    /// First rule whose path regex and MIME glob both match.
    pub fn match_file(&self, rel_path: &str, mime: &str) -> Option<RuleMatch<'_>> {
        let key = ensure_leading_slash(rel_path);
        for compiled in &self.rules {
            if let Some(glob) = &compiled.mime_glob {
                if !glob.is_match(mime) {
                    continue;
                }
            }
            let mut captures = BTreeMap::new();
            if let Some(regex) = &compiled.path_regex {
                let Some(found) = regex.captures(&key) else {
                    continue;
                };
                for name in regex.capture_names().flatten() {
                    if let Some(m) = found.name(name) {
                        captures.insert(name.to_string(), m.as_str().to_string());
                    }
                }
            }
            return Some(RuleMatch {
                rule: &compiled.rule,
                captures,
            });
        }
        None
    }

    /// Classify a file: first matching rule whose category template fully
    /// resolves from the merged metadata. Rules with unresolvable
    /// placeholders are skipped.
    pub fn classify_file(
        &self,
        rel_path: &str,
        mime: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Option<FileRuleOutcome> {
        let key = ensure_leading_slash(rel_path);
        for compiled in &self.rules {
            if let Some(glob) = &compiled.mime_glob {
                if !glob.is_match(mime) {
                    continue;
                }
            }
            let mut captures = BTreeMap::new();
            if let Some(regex) = &compiled.path_regex {
                let Some(found) = regex.captures(&key) else {
                    continue;
                };
                for name in regex.capture_names().flatten() {
                    if let Some(m) = found.name(name) {
                        captures.insert(name.to_string(), m.as_str().to_string());
                    }
                }
            }
            let mut merged = metadata.clone();
            merged.extend(captures.clone());
            let Some(category) = resolve_category(&compiled.rule.category_template, &merged)
            else {
                continue;
            };
            return Some(FileRuleOutcome {
                rule_index: compiled.rule.index,
                mode: compiled.rule.mode,
                category,
                folder_action: compiled.rule.folder_action,
                captures,
            });
        }
        None
    }

    /// Survey a folder's direct children (bounded sample) and advise the
    /// chain.
    ///
    /// Finalizing signals, in survey order:
    /// - a child matching a `keep_parent` rule marks this folder `keep`;
    /// - a child directory matching a final rule with action `keep`
    ///   preserves this folder as the containing unit;
    /// - a child file matching a final rule that carries a folder action
    ///   adopts that action;
    /// - a rule matching the folder path itself with mode `final`.
    ///
    /// Anything else delegates to the AI stage, with the first ai-mode
    /// rule's action as the hint.
    pub fn folder_hint(&self, sample: &FolderSample, limit: usize) -> FolderHint {
        for child in sample.children.iter().take(limit) {
            let child_path = format!("{}/{}", sample.path.trim_end_matches('/'), child.name);
            if child.is_dir {
                let dir_match = self
                    .match_file(&child_path, "*")
                    .or_else(|| self.match_file(&format!("{child_path}/"), "*"));
                if let Some(m) = dir_match {
                    match m.rule.folder_action {
                        Some(FolderAction::KeepParent) => {
                            return FolderHint::Final {
                                action: FolderAction::Keep,
                                category: resolve_category(
                                    &m.rule.category_template,
                                    &m.captures,
                                ),
                                captures: m.captures,
                                reason: format!("keep_parent:{}", child.name),
                            };
                        }
                        Some(FolderAction::Keep) if m.rule.mode == RuleMode::Final => {
                            return FolderHint::Final {
                                action: FolderAction::Keep,
                                category: resolve_category(
                                    &m.rule.category_template,
                                    &m.captures,
                                ),
                                captures: m.captures,
                                reason: format!("keep_marker:{}", child.name),
                            };
                        }
                        _ => {}
                    }
                }
            } else if let Some(m) = self.match_file(&child_path, &child.mime) {
                if m.rule.folder_action == Some(FolderAction::KeepParent) {
                    return FolderHint::Final {
                        action: FolderAction::Keep,
                        category: resolve_category(&m.rule.category_template, &m.captures),
                        captures: m.captures,
                        reason: format!("keep_parent:{}", child.name),
                    };
                }
                if let Some(action) = m.rule.folder_action {
                    if m.rule.mode == RuleMode::Final {
                        return FolderHint::Final {
                            action,
                            category: resolve_category(&m.rule.category_template, &m.captures),
                            captures: m.captures,
                            reason: "rule:final".to_string(),
                        };
                    }
                }
                if m.rule.mode == RuleMode::Ai {
                    return FolderHint::Delegate {
                        hint: m.rule.folder_action,
                        category: resolve_category(&m.rule.category_template, &m.captures),
                        captures: m.captures,
                        reason: "rule:requires_ai".to_string(),
                    };
                }
            }
        }

        // Explicit rule on the folder path itself.
        let folder_match = self
            .match_file(&sample.path, "")
            .or_else(|| self.match_file(&format!("{}/", sample.path.trim_end_matches('/')), ""));
        if let Some(m) = folder_match {
            let category = resolve_category(&m.rule.category_template, &m.captures);
            if let Some(action) = m.rule.folder_action {
                if m.rule.mode == RuleMode::Final {
                    let action = if action == FolderAction::KeepParent {
                        FolderAction::Keep
                    } else {
                        action
                    };
                    return FolderHint::Final {
                        action,
                        category,
                        captures: m.captures,
                        reason: "rule:folder:final".to_string(),
                    };
                }
            }
            if m.rule.mode == RuleMode::Ai {
                return FolderHint::Delegate {
                    hint: m.rule.folder_action,
                    category,
                    captures: m.captures,
                    reason: "rule:folder:requires_ai".to_string(),
                };
            }
        }

        FolderHint::Delegate {
            hint: None,
            category: None,
            captures: BTreeMap::new(),
            reason: "rule:no_match".to_string(),
        }
    }
}

/// Resolve a category template against metadata.
///
/// A captured `category` (with optional `subcategory`) overrides the
/// template entirely; otherwise every `{name}` must resolve or the result
/// is None.
pub fn resolve_category(
    template: &str,
    metadata: &BTreeMap<String, String>,
) -> Option<String> {
    if let Some(category) = metadata.get("category").filter(|c| !c.is_empty()) {
        let mut path = category.clone();
        if let Some(sub) = metadata.get("subcategory").filter(|s| !s.is_empty()) {
            path = format!("{path}/{sub}");
        }
        return Some(CategoryPath::parse(&path).label());
    }
    render_template(template, metadata).map(|c| CategoryPath::parse(&c).label())
}

fn normalize_pattern(pat: &str) -> Option<String> {
    match pat {
        "" | "*" => None,
        other => Some(other.to_string()),
    }
}

fn compile_path_regex(pattern: &str, line_no: usize) -> Result<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|e| {
            ShoeboxError::Config(format!(
                "rules line {line_no}: invalid path regex '{pattern}': {e}"
            ))
        })
}

fn compile_mime_glob(pattern: &str, line_no: usize) -> Result<GlobMatcher> {
    GlobBuilder::new(pattern)
        .literal_separator(false)
        .case_insensitive(true)
        .build()
        .map(|g| g.compile_matcher())
        .map_err(|e| {
            ShoeboxError::Config(format!(
                "rules line {line_no}: invalid mime glob '{pattern}': {e}"
            ))
        })
}

/// Leading literal segments of a template, up to the first placeholder.
fn template_static_prefix(template: &str) -> String {
    template
        .split('/')
        .take_while(|seg| !seg.contains('{'))
        .collect::<Vec<_>>()
        .join("/")
}

fn ensure_leading_slash(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

fn strip_comment(line: &str) -> &str {
    // A '#' starts a comment unless it sits inside a regex character class;
    // rules files in practice only use it at line start or after a comma.
    let trimmed = line.trim();
    if trimmed.starts_with('#') {
        return "";
    }
    trimmed
}

fn parse_csv_line(line: &str) -> std::result::Result<Vec<String>, csv::Error> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(line.as_bytes());
    let mut out = Vec::new();
    for row in reader.records() {
        let row = row?;
        out = row.iter().map(|s| s.to_string()).collect();
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::samples::{ChildInfo, FolderSample};

    fn categories() -> Categories {
        Categories::from_csv(
            "Documents/Finance\nMedia/Audio\nPhotos\nSystem/Metadata\nSystem/Projects\n",
        )
        .unwrap()
    }

    fn engine(csv: &str) -> RulesEngine {
        RulesEngine::from_csv(csv, &categories()).unwrap()
    }

    #[test]
    fn first_match_wins() {
        let engine = engine(
            "^.*\\.pdf$,*,Documents/Finance,,final\n\
             ^.*invoice.*$,*,Media/Audio,,final\n",
        );
        let m = engine.match_file("/Downloads/invoice.pdf", "application/pdf").unwrap();
        assert_eq!(m.rule.index, 0);
    }

    #[test]
    fn mime_glob_families() {
        let engine = engine("^.*$,image/*,Photos,,final\n");
        assert!(engine.match_file("/x/a.jpg", "image/jpeg").is_some());
        assert!(engine.match_file("/x/a.jpg", "IMAGE/PNG").is_some());
        assert!(engine.match_file("/x/a.mp3", "audio/mpeg").is_none());
    }

    #[test]
    fn named_captures_become_metadata() {
        let engine = engine(r"^.*-(?P<backup_year>\d{4})/.*$,*,Photos/{backup_year},,final" );
        let m = engine
            .match_file("/Wedding-Photos-2024/IMG_0001.jpg", "image/jpeg")
            .unwrap();
        assert_eq!(m.captures.get("backup_year").map(String::as_str), Some("2024"));
    }

    #[test]
    fn unresolvable_template_skips_to_next_rule() {
        let engine = engine(
            "^.*\\.jpg$,*,Photos/{backup_year},,final\n\
             ^.*\\.jpg$,*,Photos,,final\n",
        );
        let outcome = engine
            .classify_file("/misc/a.jpg", "image/jpeg", &BTreeMap::new())
            .unwrap();
        assert_eq!(outcome.rule_index, 1);
        assert_eq!(outcome.category, "Photos");
    }

    #[test]
    fn capture_category_overrides_template() {
        let engine = engine(r"^/(?P<category>[^/]+)/tagged/.*$,*,Photos,,final");
        let outcome = engine
            .classify_file("/Media/tagged/a.bin", "*", &BTreeMap::new())
            .unwrap();
        assert_eq!(outcome.category, "Media");
    }

    #[test]
    fn bad_regex_fails_fast() {
        let result = RulesEngine::from_csv("[unclosed,*,Photos,,final\n", &categories());
        assert!(result.is_err());
    }

    #[test]
    fn unknown_action_fails_fast() {
        let result = RulesEngine::from_csv("^.*$,*,Photos,explode,final\n", &categories());
        assert!(result.is_err());
    }

    #[test]
    fn unknown_category_prefix_fails_fast() {
        let result = RulesEngine::from_csv("^.*$,*,Movies/HD,,final\n", &categories());
        assert!(result.is_err());
    }

    fn sample_with_children(path: &str, children: Vec<ChildInfo>) -> FolderSample {
        let total = children.iter().filter(|c| !c.is_dir).count() as u64;
        FolderSample {
            path: path.to_string(),
            children,
            total_files: total,
        }
    }

    #[test]
    fn folder_hint_keep_parent_marker() {
        let engine = engine("^.*/\\.git(/.*)?$,*,System/Metadata,keep_parent,final\n");
        let sample = sample_with_children(
            "/project",
            vec![
                ChildInfo::dir(".git", 3),
                ChildInfo::file("main.rs", "text/x-rust", 100),
            ],
        );
        match engine.folder_hint(&sample, 48) {
            FolderHint::Final { action, reason, .. } => {
                assert_eq!(action, FolderAction::Keep);
                assert!(reason.starts_with("keep_parent:"));
            }
            other => panic!("expected final keep, got {other:?}"),
        }
    }

    #[test]
    fn folder_hint_final_keep_via_dir_child_rule() {
        let engine = engine("^.*/\\.git/.*$,*,System/Metadata,keep,final\n");
        let sample = sample_with_children(
            "/src/project",
            vec![ChildInfo::dir(".git", 1), ChildInfo::dir("src", 4)],
        );
        match engine.folder_hint(&sample, 48) {
            FolderHint::Final { action, .. } => assert_eq!(action, FolderAction::Keep),
            other => panic!("expected final keep, got {other:?}"),
        }
    }

    #[test]
    fn folder_hint_delegates_with_ai_rule() {
        let engine = engine("^.*Photos.*$,image/*,Photos,keep,ai\n");
        let sample = sample_with_children(
            "/Wedding-Photos-2024",
            vec![ChildInfo::file("IMG_0001.jpg", "image/jpeg", 5000)],
        );
        match engine.folder_hint(&sample, 48) {
            FolderHint::Delegate { hint, .. } => assert_eq!(hint, Some(FolderAction::Keep)),
            other => panic!("expected delegation, got {other:?}"),
        }
    }

    #[test]
    fn folder_hint_no_match_delegates_without_hint() {
        let engine = engine("^.*\\.xyz$,*,Photos,,final\n");
        let sample = sample_with_children(
            "/Misc",
            vec![ChildInfo::file("notes.txt", "text/plain", 10)],
        );
        match engine.folder_hint(&sample, 48) {
            FolderHint::Delegate { hint: None, .. } => {}
            other => panic!("expected empty delegation, got {other:?}"),
        }
    }
}
