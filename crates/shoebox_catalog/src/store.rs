//! SQLite-backed catalog store.
//!
//! The catalog is the only shared mutable state in the pipeline. All
//! mutations go through a single writer thread (see [`crate::writer`]);
//! readers open their own connections and observe state up to the last
//! committed batch.

use crate::error::{CatalogError, Result};
use crate::types::{
    DecisionSource, DuplicateGroup, FileRecord, FileStatus, FolderAction, FolderRecord, PlanEntry,
    PlanOp,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Bump when the schema changes incompatibly.
pub const SCHEMA_VERSION: u32 = 1;

/// Catalog schema. All timestamps are Unix milliseconds.
const SCHEMA_SQL: &str = r#"
-- Files: discovered files, enriched by hasher and classifier
CREATE TABLE IF NOT EXISTS files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    path TEXT NOT NULL UNIQUE,
    size INTEGER NOT NULL,
    mtime INTEGER NOT NULL,
    mime TEXT,
    content_hash TEXT,
    category TEXT,
    decision_source TEXT,
    confidence REAL,
    metadata_json TEXT,
    status TEXT NOT NULL DEFAULT 'scanned',
    note TEXT
);
CREATE INDEX IF NOT EXISTS idx_files_hash ON files(content_hash);
CREATE INDEX IF NOT EXISTS idx_files_size ON files(size);

-- Folders: one row per directory, classified exactly once
CREATE TABLE IF NOT EXISTS folders (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    path TEXT NOT NULL UNIQUE,
    parent_path TEXT,
    depth INTEGER NOT NULL,
    file_count INTEGER NOT NULL DEFAULT 0,
    subfolder_count INTEGER NOT NULL DEFAULT 0,
    mtime INTEGER,
    aggregate_hash TEXT,
    byte_size INTEGER NOT NULL DEFAULT 0,
    action TEXT,
    decision_source TEXT,
    category TEXT,
    metadata_json TEXT,
    decided_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_folders_depth ON folders(depth);
CREATE INDEX IF NOT EXISTS idx_folders_hash ON folders(aggregate_hash);

-- Plan: the system's output, one row per source path
CREATE TABLE IF NOT EXISTS plan_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_path TEXT NOT NULL UNIQUE,
    target_path TEXT NOT NULL,
    op TEXT NOT NULL,
    decision TEXT,
    canonical_path TEXT
);

-- Meta: schema versioning
CREATE TABLE IF NOT EXISTS catalog_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Handle to the catalog database. Cheap to clone; each read opens its own
/// connection so readers never contend with the writer thread's handle.
#[derive(Debug, Clone)]
pub struct Catalog {
    path: PathBuf,
}

impl Catalog {
    /// Open (or create) a catalog, ensuring the schema and checking the
    /// version. A version mismatch is a hard failure naming the path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = open_connection(&path)?;
        conn.execute_batch(SCHEMA_SQL)?;

        let found: Option<String> = conn
            .query_row(
                "SELECT value FROM catalog_meta WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        match found {
            Some(ref v) if v.parse::<u32>() == Ok(SCHEMA_VERSION) => {}
            Some(v) => {
                return Err(CatalogError::VersionMismatch {
                    path,
                    found: v,
                    expected: SCHEMA_VERSION,
                })
            }
            None => {
                conn.execute(
                    "INSERT INTO catalog_meta (key, value) VALUES ('schema_version', ?1)",
                    params![SCHEMA_VERSION.to_string()],
                )?;
            }
        }
        tracing::debug!(path = %path.display(), version = SCHEMA_VERSION, "catalog opened");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn connection(&self) -> Result<Connection> {
        open_connection(&self.path)
    }

    // ------------------------------------------------------------------
    // File reads
    // ------------------------------------------------------------------

    pub fn file(&self, path: &str) -> Result<Option<FileRecord>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!("{FILE_SELECT} WHERE path = ?1"))?;
        let record = stmt
            .query_row(params![path], file_from_row)
            .optional()?
            .transpose()?;
        Ok(record)
    }

    /// Files that still need a content hash.
    pub fn files_without_hash(&self) -> Result<Vec<FileRecord>> {
        self.collect_files(
            &format!("{FILE_SELECT} WHERE content_hash IS NULL ORDER BY path"),
            &[],
        )
    }

    /// Files that are hashed but not yet classified, shallowest first so
    /// parent folder decisions land before deep descendants.
    pub fn files_unclassified(&self, limit: Option<u32>) -> Result<Vec<FileRecord>> {
        let mut sql = format!(
            "{FILE_SELECT} WHERE category IS NULL \
             ORDER BY length(path) - length(replace(path, '/', '')), path"
        );
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        self.collect_files(&sql, &[])
    }

    /// All files under a path prefix, sorted by path.
    pub fn files_under(&self, prefix: &str) -> Result<Vec<FileRecord>> {
        let conn = self.connection()?;
        let pattern = format!("{}/%", prefix.trim_end_matches('/'));
        let mut stmt =
            conn.prepare(&format!("{FILE_SELECT} WHERE path LIKE ?1 ORDER BY path"))?;
        let rows = stmt.query_map(params![pattern], file_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }

    pub fn all_files(&self) -> Result<Vec<FileRecord>> {
        self.collect_files(&format!("{FILE_SELECT} ORDER BY path"), &[])
    }

    pub fn file_count(&self) -> Result<u64> {
        let conn = self.connection()?;
        let count: u64 = conn.query_row("SELECT COUNT(*) FROM files", [], |row| row.get(0))?;
        Ok(count)
    }

    fn collect_files(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<FileRecord>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(args, file_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Folder reads
    // ------------------------------------------------------------------

    pub fn folder(&self, path: &str) -> Result<Option<FolderRecord>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!("{FOLDER_SELECT} WHERE path = ?1"))?;
        let record = stmt
            .query_row(params![path], folder_from_row)
            .optional()?
            .transpose()?;
        Ok(record)
    }

    /// All folders ordered by (depth, path) — the classifier chain's
    /// processing order.
    pub fn folders_by_depth(&self) -> Result<Vec<FolderRecord>> {
        self.collect_folders(&format!("{FOLDER_SELECT} ORDER BY depth, path"), &[])
    }

    /// Folders within an inclusive depth range, ordered by (depth, path).
    pub fn folders_in_depth_range(&self, min: u32, max: u32) -> Result<Vec<FolderRecord>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!(
            "{FOLDER_SELECT} WHERE depth >= ?1 AND depth <= ?2 ORDER BY depth, path"
        ))?;
        let rows = stmt.query_map(params![min, max], folder_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }

    /// Paths of all folders committed KEEP. The scanner consults this set
    /// to avoid descending into kept subtrees.
    pub fn keep_set(&self) -> Result<Vec<String>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT path FROM folders WHERE action = 'keep' ORDER BY path",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Committed folder actions keyed by path.
    pub fn folder_actions(&self) -> Result<BTreeMap<String, FolderAction>> {
        let conn = self.connection()?;
        let mut stmt =
            conn.prepare("SELECT path, action FROM folders WHERE action IS NOT NULL")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = BTreeMap::new();
        for row in rows {
            let (path, action) = row?;
            let action = FolderAction::parse(&action)
                .ok_or_else(|| CatalogError::InvalidField(format!("folder action '{action}'")))?;
            out.insert(path, action);
        }
        Ok(out)
    }

    fn collect_folders(
        &self,
        sql: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<FolderRecord>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(args, folder_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Duplicate groups
    // ------------------------------------------------------------------

    /// Folder duplicate groups: aggregate hashes shared by more than one
    /// folder, largest byte footprint first.
    pub fn duplicate_folder_groups(&self) -> Result<Vec<DuplicateGroup>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT aggregate_hash, GROUP_CONCAT(path, char(31)), MAX(byte_size) \
             FROM folders \
             WHERE aggregate_hash IS NOT NULL AND aggregate_hash <> '' \
             GROUP BY aggregate_hash HAVING COUNT(*) > 1",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, u64>(2)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (hash, joined, bytes) = row?;
            let mut paths: Vec<String> = joined.split('\u{1f}').map(str::to_string).collect();
            paths.sort();
            out.push(DuplicateGroup { hash, paths, bytes });
        }
        out.sort_by(|a, b| b.bytes.cmp(&a.bytes).then_with(|| a.hash.cmp(&b.hash)));
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Plan reads
    // ------------------------------------------------------------------

    /// The full plan, sorted by source path ascending (emission order).
    pub fn plan(&self) -> Result<Vec<PlanEntry>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT source_path, target_path, op, decision, canonical_path \
             FROM plan_entries ORDER BY source_path",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (source_path, target_path, op, decision, canonical_path) = row?;
            let op = PlanOp::parse(&op)
                .ok_or_else(|| CatalogError::InvalidField(format!("plan op '{op}'")))?;
            out.push(PlanEntry {
                source_path,
                target_path,
                op,
                decision,
                canonical_path,
            });
        }
        Ok(out)
    }
}

fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.busy_timeout(std::time::Duration::from_secs(30))?;
    Ok(conn)
}

const FILE_SELECT: &str = "SELECT path, size, mtime, mime, content_hash, category, \
     decision_source, confidence, metadata_json, status, note FROM files";

const FOLDER_SELECT: &str = "SELECT path, parent_path, depth, file_count, subfolder_count, \
     mtime, aggregate_hash, action, decision_source, category, metadata_json FROM folders";

fn file_from_row(row: &Row<'_>) -> rusqlite::Result<Result<FileRecord>> {
    let metadata_json: Option<String> = row.get(8)?;
    let status: String = row.get(9)?;
    let decision_source: Option<String> = row.get(6)?;
    Ok(build_file_record(
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        decision_source,
        row.get(7)?,
        metadata_json,
        status,
        row.get(10)?,
    ))
}

#[allow(clippy::too_many_arguments)]
fn build_file_record(
    path: String,
    size: u64,
    mtime: i64,
    mime: Option<String>,
    content_hash: Option<String>,
    category: Option<String>,
    decision_source: Option<String>,
    confidence: Option<f64>,
    metadata_json: Option<String>,
    status: String,
    note: Option<String>,
) -> Result<FileRecord> {
    let decision_source = decision_source
        .map(|s| {
            DecisionSource::parse(&s)
                .ok_or_else(|| CatalogError::InvalidField(format!("decision source '{s}'")))
        })
        .transpose()?;
    let status = FileStatus::parse(&status)
        .ok_or_else(|| CatalogError::InvalidField(format!("file status '{status}'")))?;
    let metadata = parse_metadata(metadata_json)?;
    Ok(FileRecord {
        path,
        size,
        mtime,
        mime,
        content_hash,
        category,
        decision_source,
        confidence,
        metadata,
        status,
        note,
    })
}

fn folder_from_row(row: &Row<'_>) -> rusqlite::Result<Result<FolderRecord>> {
    let action: Option<String> = row.get(7)?;
    let decision_source: Option<String> = row.get(8)?;
    let metadata_json: Option<String> = row.get(10)?;
    Ok(build_folder_record(
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        action,
        decision_source,
        row.get(9)?,
        metadata_json,
    ))
}

#[allow(clippy::too_many_arguments)]
fn build_folder_record(
    path: String,
    parent_path: Option<String>,
    depth: u32,
    file_count: u64,
    subfolder_count: u64,
    mtime: Option<i64>,
    aggregate_hash: Option<String>,
    action: Option<String>,
    decision_source: Option<String>,
    category: Option<String>,
    metadata_json: Option<String>,
) -> Result<FolderRecord> {
    let action = action
        .map(|s| {
            FolderAction::parse(&s)
                .ok_or_else(|| CatalogError::InvalidField(format!("folder action '{s}'")))
        })
        .transpose()?;
    let decision_source = decision_source
        .map(|s| {
            DecisionSource::parse(&s)
                .ok_or_else(|| CatalogError::InvalidField(format!("decision source '{s}'")))
        })
        .transpose()?;
    let metadata = parse_metadata(metadata_json)?;
    Ok(FolderRecord {
        path,
        parent_path,
        depth,
        file_count,
        subfolder_count,
        mtime,
        aggregate_hash,
        action,
        decision_source,
        category,
        metadata,
    })
}

pub(crate) fn parse_metadata(json: Option<String>) -> Result<BTreeMap<String, String>> {
    match json {
        Some(text) if !text.is_empty() => Ok(serde_json::from_str(&text)?),
        _ => Ok(BTreeMap::new()),
    }
}

pub(crate) fn metadata_to_json(metadata: &BTreeMap<String, String>) -> Result<Option<String>> {
    if metadata.is_empty() {
        Ok(None)
    } else {
        Ok(Some(serde_json::to_string(metadata)?))
    }
}
