//! Canonical category tree, loaded from the categories CSV.
//!
//! The file enumerates legal category path prefixes, one per line, with an
//! optional second column holding a rendering template:
//!
//! ```text
//! # category,template
//! Documents/Taxes
//! Photos,Photos/{backup_year}/{suffix}
//! Media/Audio
//! ```
//!
//! Every plan target must sit under one of these prefixes. AI answers are
//! normalized against the tree and fall back to the default category when
//! they do not fit.

use crate::error::{Result, ShoeboxError};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

/// Category for files no stage could place.
pub const DEFAULT_CATEGORY: &str = "Other/Unsorted";

/// A normalized category path such as `Documents/Taxes/2025`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CategoryPath {
    parts: Vec<String>,
}

impl CategoryPath {
    /// Parse from a `/`-separated string, dropping empty and non-printable
    /// segments. An empty input yields the default category.
    pub fn parse(text: &str) -> Self {
        let parts: Vec<String> = text
            .split('/')
            .map(|seg| {
                seg.trim()
                    .chars()
                    .filter(|ch| (' '..='~').contains(ch))
                    .collect::<String>()
            })
            .filter(|seg: &String| !seg.is_empty())
            .collect();
        if parts.is_empty() {
            return Self::parse(DEFAULT_CATEGORY);
        }
        Self { parts }
    }

    pub fn parts(&self) -> &[String] {
        &self.parts
    }

    pub fn label(&self) -> String {
        self.parts.join("/")
    }
}

impl fmt::Display for CategoryPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.parts.join("/"))
    }
}

/// The loaded category tree.
#[derive(Debug, Clone)]
pub struct Categories {
    known: BTreeSet<String>,
    templates: BTreeMap<String, String>,
}

impl Categories {
    /// Load from a CSV file. Missing file is a config error.
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ShoeboxError::Config(format!(
                "Categories file not found: {}: {e}",
                path.display()
            ))
        })?;
        Self::from_csv(&text)
    }

    /// Parse categories CSV content (`#` comments, blank lines ignored).
    pub fn from_csv(text: &str) -> Result<Self> {
        let mut known = BTreeSet::new();
        let mut templates = BTreeMap::new();
        for (line_no, raw) in text.lines().enumerate() {
            let line = strip_comment(raw);
            if line.is_empty() {
                continue;
            }
            let mut reader = csv::ReaderBuilder::new()
                .has_headers(false)
                .flexible(true)
                .from_reader(line.as_bytes());
            for row in reader.records() {
                let row = row.map_err(|e| {
                    ShoeboxError::Config(format!("categories line {}: {e}", line_no + 1))
                })?;
                let category = row.get(0).unwrap_or("").trim();
                if category.is_empty() {
                    continue;
                }
                let path = CategoryPath::parse(category).label();
                if let Some(template) = row.get(1).map(str::trim).filter(|t| !t.is_empty()) {
                    templates.insert(path.clone(), template.to_string());
                }
                known.insert(path);
            }
        }
        if known.is_empty() {
            return Err(ShoeboxError::Config(
                "Categories file defines no categories".to_string(),
            ));
        }
        known.insert(DEFAULT_CATEGORY.to_string());
        Ok(Self { known, templates })
    }

    /// Is this category legal, i.e. equal to or nested under a known
    /// prefix?
    pub fn is_legal(&self, category: &str) -> bool {
        let normalized = CategoryPath::parse(category).label();
        self.known.iter().any(|entry| {
            normalized == *entry || normalized.starts_with(&format!("{entry}/"))
        })
    }

    /// Is this literal prefix plausible for a rule template, i.e. on the
    /// path of some known entry in either direction?
    pub fn is_plausible_prefix(&self, prefix: &str) -> bool {
        let normalized = CategoryPath::parse(prefix).label();
        self.known.iter().any(|entry| {
            normalized == *entry
                || normalized.starts_with(&format!("{entry}/"))
                || entry.starts_with(&format!("{normalized}/"))
        })
    }

    /// Normalize an AI answer into a legal category, if possible.
    pub fn normalize_answer(&self, text: &str) -> Option<String> {
        let candidate = text
            .lines()
            .map(|l| l.trim().trim_matches(|c| c == '"' || c == '\'' || c == '`'))
            .find(|l| !l.is_empty())?;
        let path = CategoryPath::parse(candidate).label();
        self.is_legal(&path).then_some(path)
    }

    /// Rendering template for a category, if one is declared on the
    /// category or any of its ancestors (nearest wins).
    pub fn template_for(&self, category: &str) -> Option<&str> {
        let path = CategoryPath::parse(category);
        let parts = path.parts();
        for end in (1..=parts.len()).rev() {
            let prefix = parts[..end].join("/");
            if let Some(template) = self.templates.get(&prefix) {
                return Some(template.as_str());
            }
        }
        None
    }

    /// All known category prefixes, for the AI prompt.
    pub fn to_compact_json(&self) -> String {
        serde_json::to_string(&self.known.iter().collect::<Vec<_>>()).unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.known.iter().map(String::as_str)
    }
}

/// Substitute `{name}` placeholders from the metadata map. Returns None
/// when any placeholder cannot be resolved.
pub fn render_template(
    template: &str,
    metadata: &BTreeMap<String, String>,
) -> Option<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let end = after.find('}')?;
        let key = &after[..end];
        let value = metadata.get(key)?;
        if value.is_empty() {
            return None;
        }
        out.push_str(value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    let cleaned = out
        .split('/')
        .map(str::trim)
        .filter(|seg| !seg.is_empty())
        .collect::<Vec<_>>()
        .join("/");
    (!cleaned.is_empty()).then_some(cleaned)
}

fn strip_comment(line: &str) -> &str {
    let line = match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    };
    line.trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Categories {
        Categories::from_csv(
            "# comment\n\
             Documents/Taxes\n\
             Documents/Finance\n\
             Photos,Photos/{backup_year}/{suffix}\n\
             Media/Audio\n\
             Media/Videos/Shows\n\
             System/Metadata\n",
        )
        .unwrap()
    }

    #[test]
    fn legal_categories_include_nested_paths() {
        let cats = sample();
        assert!(cats.is_legal("Documents/Taxes"));
        assert!(cats.is_legal("Documents/Taxes/2025/Returns"));
        assert!(cats.is_legal("Photos/2024"));
        assert!(!cats.is_legal("Documents"));
        assert!(!cats.is_legal("Random/Stuff"));
    }

    #[test]
    fn default_category_is_always_legal() {
        let cats = sample();
        assert!(cats.is_legal(DEFAULT_CATEGORY));
    }

    #[test]
    fn plausible_prefix_accepts_partial_paths() {
        let cats = sample();
        assert!(cats.is_plausible_prefix("Media"));
        assert!(cats.is_plausible_prefix("Media/Videos/Shows/Archive"));
        assert!(!cats.is_plausible_prefix("Movies"));
    }

    #[test]
    fn normalize_answer_rejects_unknown() {
        let cats = sample();
        assert_eq!(
            cats.normalize_answer("  Documents/Finance\n"),
            Some("Documents/Finance".to_string())
        );
        assert_eq!(cats.normalize_answer("\"Media/Audio\""), Some("Media/Audio".to_string()));
        assert_eq!(cats.normalize_answer("SomethingElse"), None);
    }

    #[test]
    fn template_lookup_walks_ancestors() {
        let cats = sample();
        assert_eq!(
            cats.template_for("Photos/2024/Hawaii"),
            Some("Photos/{backup_year}/{suffix}")
        );
        assert_eq!(cats.template_for("Media/Audio"), None);
    }

    #[test]
    fn render_template_resolves_or_skips() {
        let mut meta = BTreeMap::new();
        meta.insert("backup_year".to_string(), "2024".to_string());
        assert_eq!(
            render_template("Photos/{backup_year}", &meta),
            Some("Photos/2024".to_string())
        );
        assert_eq!(render_template("Photos/{backup_month}", &meta), None);
        assert_eq!(render_template("Photos/{backup_year}/", &meta), Some("Photos/2024".to_string()));
    }
}
