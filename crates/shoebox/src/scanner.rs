//! Filesystem scanner.
//!
//! Walks each source root with a parallel walker, emitting a FolderRecord
//! per directory and a FileRecord per file. Subtrees of folders already
//! committed KEEP in the catalog are never entered again. Symlinks are not
//! followed, so cycles are impossible and depth is monotonic.

use crate::cancel::CancellationToken;
use crate::error::Result;
use crate::probe::MetadataProbe;
use ignore::{WalkBuilder, WalkState};
use shoebox_catalog::{
    normalize_path, parent_path, Catalog, CatalogWriter, FileRecord, FolderRecord, WriteOp,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default)]
pub struct ScanStats {
    pub dirs_scanned: u64,
    pub files_discovered: u64,
    pub dirs_skipped_keep: u64,
    pub dirs_unchanged: u64,
    pub errors: u64,
    pub duration_ms: u64,
}

pub struct Scanner {
    catalog: Catalog,
    writer: CatalogWriter,
    probe: Arc<dyn MetadataProbe>,
    threads: usize,
    cancel: CancellationToken,
}

impl Scanner {
    pub fn new(
        catalog: Catalog,
        writer: CatalogWriter,
        probe: Arc<dyn MetadataProbe>,
        threads: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            catalog,
            writer,
            probe,
            threads: threads.max(1),
            cancel,
        }
    }

    /// Scan all source roots and update the catalog.
    pub fn scan(&self, sources: &[String]) -> Result<ScanStats> {
        let start = Instant::now();
        let keep_set: Arc<Vec<String>> = Arc::new(self.catalog.keep_set()?);
        let known_dir_mtimes: Arc<HashMap<String, i64>> = Arc::new(
            self.catalog
                .folders_by_depth()?
                .into_iter()
                .filter_map(|f| f.mtime.map(|m| (f.path, m)))
                .collect(),
        );

        let dirs = Arc::new(AtomicU64::new(0));
        let files = Arc::new(AtomicU64::new(0));
        let skipped_keep = Arc::new(AtomicU64::new(0));
        let unchanged = Arc::new(AtomicU64::new(0));
        let errors = Arc::new(AtomicU64::new(0));

        for root in sources {
            let root = root.trim();
            if root.is_empty() {
                continue;
            }
            if !std::path::Path::new(root).is_dir() {
                warn!(root, "source root missing or not a directory, skipping");
                continue;
            }
            info!(root, threads = self.threads, "scan start");

            let walker = WalkBuilder::new(root)
                .follow_links(false)
                .hidden(false)
                .ignore(false)
                .git_ignore(false)
                .git_global(false)
                .git_exclude(false)
                .parents(false)
                .threads(self.threads)
                .build_parallel();

            walker.run(|| {
                let writer = self.writer.clone();
                let probe = Arc::clone(&self.probe);
                let keep_set = Arc::clone(&keep_set);
                let known = Arc::clone(&known_dir_mtimes);
                let cancel = self.cancel.clone();
                let dirs = Arc::clone(&dirs);
                let files = Arc::clone(&files);
                let skipped_keep = Arc::clone(&skipped_keep);
                let unchanged = Arc::clone(&unchanged);
                let errors = Arc::clone(&errors);

                Box::new(move |entry| {
                    if cancel.is_cancelled() {
                        return WalkState::Quit;
                    }
                    let entry = match entry {
                        Ok(entry) => entry,
                        Err(e) => {
                            warn!(error = %e, "walk error");
                            errors.fetch_add(1, Ordering::Relaxed);
                            return WalkState::Continue;
                        }
                    };
                    let Some(file_type) = entry.file_type() else {
                        return WalkState::Continue;
                    };
                    if file_type.is_symlink() {
                        return WalkState::Continue;
                    }

                    let path = normalize_path(&entry.path().to_string_lossy());

                    if file_type.is_dir() {
                        if is_under_keep(&path, &keep_set) {
                            skipped_keep.fetch_add(1, Ordering::Relaxed);
                            return WalkState::Skip;
                        }
                        let mtime = entry
                            .metadata()
                            .ok()
                            .and_then(|m| m.modified().ok())
                            .map(unix_millis);
                        if let (Some(mtime), Some(known_mtime)) =
                            (mtime, known.get(&path))
                        {
                            if mtime == *known_mtime {
                                unchanged.fetch_add(1, Ordering::Relaxed);
                                // Still descend: children may have changed.
                                return WalkState::Continue;
                            }
                        }
                        let mut record = FolderRecord::new(path);
                        record.mtime = mtime;
                        dirs.fetch_add(1, Ordering::Relaxed);
                        if writer.submit(WriteOp::UpsertFolder(record)).is_err() {
                            return WalkState::Quit;
                        }
                        return WalkState::Continue;
                    }

                    if !file_type.is_file() {
                        return WalkState::Continue;
                    }
                    if is_under_keep(&path, &keep_set) {
                        return WalkState::Continue;
                    }
                    let metadata = match entry.metadata() {
                        Ok(m) => m,
                        Err(e) => {
                            warn!(path = %path, error = %e, "stat failed");
                            errors.fetch_add(1, Ordering::Relaxed);
                            return WalkState::Continue;
                        }
                    };
                    let mtime = metadata
                        .modified()
                        .ok()
                        .map(unix_millis)
                        .unwrap_or_default();
                    let mut record = FileRecord::new(path, metadata.len(), mtime);
                    record.mime = Some(probe.probe_mime(entry.path()));
                    files.fetch_add(1, Ordering::Relaxed);
                    if writer.submit(WriteOp::UpsertFile(record)).is_err() {
                        return WalkState::Quit;
                    }
                    WalkState::Continue
                })
            });
        }

        self.writer.flush()?;
        self.recount_children()?;
        self.writer.flush()?;

        let stats = ScanStats {
            dirs_scanned: dirs.load(Ordering::Relaxed),
            files_discovered: files.load(Ordering::Relaxed),
            dirs_skipped_keep: skipped_keep.load(Ordering::Relaxed),
            dirs_unchanged: unchanged.load(Ordering::Relaxed),
            errors: errors.load(Ordering::Relaxed),
            duration_ms: start.elapsed().as_millis() as u64,
        };
        info!(
            dirs = stats.dirs_scanned,
            files = stats.files_discovered,
            skipped_keep = stats.dirs_skipped_keep,
            unchanged = stats.dirs_unchanged,
            errors = stats.errors,
            duration_ms = stats.duration_ms,
            "scan complete"
        );
        Ok(stats)
    }

    /// Second pass: recompute direct child counts from the committed
    /// records.
    fn recount_children(&self) -> Result<()> {
        let folders = self.catalog.folders_by_depth()?;
        let files = self.catalog.all_files()?;

        let mut file_counts: HashMap<&str, u64> = HashMap::new();
        for file in &files {
            *file_counts.entry(parent_path(&file.path)).or_default() += 1;
        }
        let mut folder_counts: HashMap<&str, u64> = HashMap::new();
        for folder in &folders {
            if let Some(parent) = &folder.parent_path {
                *folder_counts.entry(parent.as_str()).or_default() += 1;
            }
        }

        for mut folder in folders.clone() {
            let file_count = file_counts.get(folder.path.as_str()).copied().unwrap_or(0);
            let sub_count = folder_counts.get(folder.path.as_str()).copied().unwrap_or(0);
            if folder.file_count == file_count && folder.subfolder_count == sub_count {
                continue;
            }
            folder.file_count = file_count;
            folder.subfolder_count = sub_count;
            self.writer.submit(WriteOp::UpsertFolder(folder))?;
        }
        Ok(())
    }
}

/// Is `path` a strict descendant of any committed-KEEP folder?
fn is_under_keep(path: &str, keep_set: &[String]) -> bool {
    keep_set.iter().any(|keep| {
        path.len() > keep.len() && path.starts_with(keep) && path.as_bytes()[keep.len()] == b'/'
    })
}

fn unix_millis(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn under_keep_requires_strict_descendant() {
        let keeps = vec!["/src/project".to_string()];
        assert!(is_under_keep("/src/project/.git", &keeps));
        assert!(is_under_keep("/src/project/src/main.rs", &keeps));
        assert!(!is_under_keep("/src/project", &keeps));
        assert!(!is_under_keep("/src/project2/file", &keeps));
    }
}
