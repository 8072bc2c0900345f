//! Record types shared by the catalog and the pipeline.
//!
//! Files and folders flow through the pipeline as these records:
//! the scanner creates them, the hasher and classifier enrich them,
//! and the planner reads the frozen result.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// Folder Actions
// ============================================================================

/// What happens to a folder during reorganization.
///
/// `Keep` preserves the folder as a unit; `KeepExcept` anchors the folder
/// but lets descendants decide for themselves; `Disaggregate` redistributes
/// the contents into category targets. `KeepParent` is a rule-only marker:
/// a child matching a keep_parent rule finalizes the *containing* folder as
/// `Keep`, and the marker itself is never committed on a folder record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FolderAction {
    Keep,
    KeepParent,
    KeepExcept,
    Disaggregate,
}

impl FolderAction {
    pub const ALL: &'static [FolderAction] = &[
        FolderAction::Keep,
        FolderAction::KeepParent,
        FolderAction::KeepExcept,
        FolderAction::Disaggregate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Keep => "keep",
            Self::KeepParent => "keep_parent",
            Self::KeepExcept => "keep_except",
            Self::Disaggregate => "disaggregate",
        }
    }

    /// Parse an action, accepting the legacy aliases that show up in older
    /// rules files ("strip", "unit", "move_as_unit").
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "keep" | "unit" | "move_as_unit" => Some(Self::Keep),
            "keep_parent" | "keepparent" | "parent" => Some(Self::KeepParent),
            "keep_except" | "keepexcept" => Some(Self::KeepExcept),
            "disaggregate" | "strip" => Some(Self::Disaggregate),
            _ => None,
        }
    }

    /// Actions that block descendant evaluation entirely.
    pub fn blocks_children(&self) -> bool {
        matches!(self, Self::Keep)
    }
}

impl std::fmt::Display for FolderAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Decision Sources
// ============================================================================

/// Which stage of the chain decided a classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecisionSource {
    /// A rule with mode `final` bound the decision
    RuleFinal,
    /// A rule hint was adopted after the AI stage could not decide
    RuleHintAi,
    /// The AI classifier decided
    Ai,
    /// Inherited from a KEEP ancestor, no evaluation ran
    Inherited,
    /// Chain exhausted, built-in default applied
    Default,
}

impl DecisionSource {
    pub const ALL: &'static [DecisionSource] = &[
        DecisionSource::RuleFinal,
        DecisionSource::RuleHintAi,
        DecisionSource::Ai,
        DecisionSource::Inherited,
        DecisionSource::Default,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RuleFinal => "rule-final",
            Self::RuleHintAi => "rule-hint-ai",
            Self::Ai => "ai",
            Self::Inherited => "inherited",
            Self::Default => "default",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "rule-final" => Some(Self::RuleFinal),
            "rule-hint-ai" => Some(Self::RuleHintAi),
            "ai" => Some(Self::Ai),
            "inherited" => Some(Self::Inherited),
            "default" => Some(Self::Default),
            _ => None,
        }
    }
}

impl std::fmt::Display for DecisionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// File Records
// ============================================================================

/// Pipeline status of a file record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    /// Discovered by the scanner
    Scanned,
    /// Content hash computed
    Hashed,
    /// Category decided
    Classified,
    /// Plan entry emitted
    Planned,
    /// A recoverable error was recorded on this file
    Error,
}

impl FileStatus {
    pub const ALL: &'static [FileStatus] = &[
        FileStatus::Scanned,
        FileStatus::Hashed,
        FileStatus::Classified,
        FileStatus::Planned,
        FileStatus::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scanned => "scanned",
            Self::Hashed => "hashed",
            Self::Classified => "classified",
            Self::Planned => "planned",
            Self::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "scanned" => Some(Self::Scanned),
            "hashed" => Some(Self::Hashed),
            "classified" => Some(Self::Classified),
            "planned" => Some(Self::Planned),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// A file discovered under a source root.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    /// Absolute, normalized POSIX path
    pub path: String,
    /// File size in bytes
    pub size: u64,
    /// Last modification time (Unix milliseconds)
    pub mtime: i64,
    /// Probed MIME type (None until probed)
    pub mime: Option<String>,
    /// Streaming content hash, computed lazily by the hasher
    pub content_hash: Option<String>,
    /// Decided category path, e.g. "Documents/Finance"
    pub category: Option<String>,
    /// Which stage decided the category
    pub decision_source: Option<DecisionSource>,
    /// Classifier confidence, when the AI reported one
    pub confidence: Option<f64>,
    /// Named captures and probe facts
    pub metadata: BTreeMap<String, String>,
    pub status: FileStatus,
    /// Reason string for recoverable errors
    pub note: Option<String>,
}

impl FileRecord {
    pub fn new(path: impl Into<String>, size: u64, mtime: i64) -> Self {
        Self {
            path: path.into(),
            size,
            mtime,
            mime: None,
            content_hash: None,
            category: None,
            decision_source: None,
            confidence: None,
            metadata: BTreeMap::new(),
            status: FileStatus::Scanned,
            note: None,
        }
    }

    /// Basename of the file path.
    pub fn name(&self) -> &str {
        basename(&self.path)
    }

    /// Containing folder path.
    pub fn parent(&self) -> &str {
        parent_path(&self.path)
    }
}

// ============================================================================
// Folder Records
// ============================================================================

/// A folder discovered under a source root.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderRecord {
    /// Absolute, normalized POSIX path
    pub path: String,
    /// Parent folder path (None for a filesystem root)
    pub parent_path: Option<String>,
    /// Number of `/`-separated components
    pub depth: u32,
    /// Direct child files
    pub file_count: u64,
    /// Direct child folders
    pub subfolder_count: u64,
    /// Directory mtime (Unix milliseconds), used for restartability
    pub mtime: Option<i64>,
    /// Order-independent fingerprint of the contents
    pub aggregate_hash: Option<String>,
    /// Committed folder action (None until classified)
    pub action: Option<FolderAction>,
    pub decision_source: Option<DecisionSource>,
    /// Category path for keep units
    pub category: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl FolderRecord {
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        let depth = path_depth(&path);
        let parent = parent_path(&path);
        Self {
            parent_path: (!parent.is_empty() && parent != path).then(|| parent.to_string()),
            path,
            depth,
            file_count: 0,
            subfolder_count: 0,
            mtime: None,
            aggregate_hash: None,
            action: None,
            decision_source: None,
            category: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        basename(&self.path)
    }

    pub fn is_classified(&self) -> bool {
        self.action.is_some()
    }
}

// ============================================================================
// Plan Entries
// ============================================================================

/// Operation kind of a plan entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlanOp {
    /// Place a single file at the target
    Place,
    /// Suppress a redundant duplicate; `canonical_path` names the survivor
    SkipDuplicate,
    /// Move the folder and all descendants as one unit
    KeepUnit,
}

impl PlanOp {
    pub const ALL: &'static [PlanOp] = &[PlanOp::Place, PlanOp::SkipDuplicate, PlanOp::KeepUnit];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Place => "place",
            Self::SkipDuplicate => "skip-duplicate",
            Self::KeepUnit => "keep-unit",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "place" => Some(Self::Place),
            "skip-duplicate" => Some(Self::SkipDuplicate),
            "keep-unit" => Some(Self::KeepUnit),
            _ => None,
        }
    }
}

/// One line of the reorganization plan: source path → target path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanEntry {
    pub source_path: String,
    pub target_path: String,
    pub op: PlanOp,
    /// Originating decision, e.g. "rule-final" or "ai"
    pub decision: Option<String>,
    /// For skip-duplicate: the canonical member that is actually planned
    pub canonical_path: Option<String>,
}

// ============================================================================
// Duplicate Groups
// ============================================================================

/// Folders (or files) sharing an aggregate hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateGroup {
    pub hash: String,
    /// Member paths, sorted ascending
    pub paths: Vec<String>,
    /// Total byte size covered by one member
    pub bytes: u64,
}

impl DuplicateGroup {
    /// Canonical representative: lexicographically lowest path, ties broken
    /// by shortest.
    pub fn canonical(&self) -> &str {
        self.paths
            .iter()
            .min_by(|a, b| a.cmp(b).then(a.len().cmp(&b.len())))
            .map(String::as_str)
            .unwrap_or_default()
    }
}

// ============================================================================
// Path helpers
// ============================================================================

/// Basename of a normalized POSIX path ("/" → "").
pub fn basename(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or("")
}

/// Parent of a normalized POSIX path ("/a/b" → "/a", "/a" → "/").
pub fn parent_path(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => "/",
        Some(idx) => &trimmed[..idx],
        None => "",
    }
}

/// Number of path components ("/a/b/c" → 3).
pub fn path_depth(path: &str) -> u32 {
    path.split('/').filter(|s| !s.is_empty()).count() as u32
}

/// Normalize a path to POSIX form: forward slashes, no `.`/`..` components,
/// no trailing slash except the root itself.
pub fn normalize_path(path: &str) -> String {
    let replaced = path.replace('\\', "/");
    let absolute = replaced.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for seg in replaced.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return if absolute { "/".to_string() } else { String::new() };
    }
    let joined = parts.join("/");
    if absolute {
        format!("/{}", joined)
    } else {
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folder_action_roundtrip() {
        for action in FolderAction::ALL {
            assert_eq!(FolderAction::parse(action.as_str()), Some(*action));
        }
    }

    #[test]
    fn folder_action_aliases() {
        assert_eq!(FolderAction::parse("strip"), Some(FolderAction::Disaggregate));
        assert_eq!(FolderAction::parse("move_as_unit"), Some(FolderAction::Keep));
        assert_eq!(FolderAction::parse("KEEP_EXCEPT"), Some(FolderAction::KeepExcept));
        assert_eq!(FolderAction::parse("nonsense"), None);
    }

    #[test]
    fn decision_source_roundtrip() {
        for source in DecisionSource::ALL {
            assert_eq!(DecisionSource::parse(source.as_str()), Some(*source));
        }
    }

    #[test]
    fn path_helpers() {
        assert_eq!(basename("/a/b/c.txt"), "c.txt");
        assert_eq!(parent_path("/a/b/c.txt"), "/a/b");
        assert_eq!(parent_path("/a"), "/");
        assert_eq!(path_depth("/a/b/c"), 3);
        assert_eq!(path_depth("/"), 0);
    }

    #[test]
    fn normalize_path_strips_dots_and_slashes() {
        assert_eq!(normalize_path("/a/./b/../c/"), "/a/c");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("a\\b\\c"), "a/b/c");
    }

    #[test]
    fn duplicate_group_canonical_is_lowest_path() {
        let group = DuplicateGroup {
            hash: "h".into(),
            paths: vec!["/Backup2/ProjectA".into(), "/Backup1/ProjectA".into()],
            bytes: 0,
        };
        assert_eq!(group.canonical(), "/Backup1/ProjectA");
    }

    #[test]
    fn folder_record_depth_and_parent() {
        let rec = FolderRecord::new("/src/Downloads");
        assert_eq!(rec.depth, 2);
        assert_eq!(rec.parent_path.as_deref(), Some("/src"));
        assert_eq!(rec.name(), "Downloads");
    }
}
