//! Content and folder fingerprints.
//!
//! Files get a streaming SHA-256 of their bytes. Folders get an aggregate
//! hash over the sorted `name|child_hash` lines of their direct children,
//! computed depth-descending once all children are hashed. The aggregate
//! depends only on the multiset of child names and hashes, never on
//! filesystem listing order.

use crate::cancel::CancellationToken;
use crate::error::Result;
use sha2::{Digest, Sha256};
use shoebox_catalog::{parent_path, Catalog, CatalogWriter, WriteOp};
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Sentinel aggregate for folders with no children: the digest of zero
/// bytes. Cannot collide with a non-empty aggregate, which always hashes
/// at least one `name|hash` line.
pub fn empty_folder_hash() -> String {
    hex::encode(Sha256::digest([]))
}

/// Streaming SHA-256 of a file's contents.
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Aggregate hash over `(relative_name, child_hash)` pairs, sorted so the
/// result is independent of traversal order.
pub fn aggregate_hash(children: &[(String, String)]) -> String {
    if children.is_empty() {
        return empty_folder_hash();
    }
    let mut lines: Vec<String> = children
        .iter()
        .map(|(name, hash)| format!("{name}|{hash}"))
        .collect();
    lines.sort();
    let mut hasher = Sha256::new();
    for line in &lines {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HashStats {
    pub files_hashed: u64,
    pub folders_hashed: u64,
    pub errors: u64,
    pub duration_ms: u64,
}

/// The hash stage: file hashes on a worker pool, then folder aggregates
/// bottom-up.
pub struct Hasher {
    catalog: Catalog,
    writer: CatalogWriter,
    workers: usize,
    cancel: CancellationToken,
}

impl Hasher {
    pub fn new(
        catalog: Catalog,
        writer: CatalogWriter,
        workers: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            catalog,
            writer,
            workers: workers.max(1),
            cancel,
        }
    }

    pub async fn run(&self) -> Result<HashStats> {
        let start = Instant::now();
        let mut stats = HashStats::default();

        let pending = self.catalog.files_without_hash()?;
        info!(files = pending.len(), workers = self.workers, "hash stage start");

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks: JoinSet<bool> = JoinSet::new();
        for file in pending {
            if self.cancel.is_cancelled() {
                break;
            }
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore closed");
            let writer = self.writer.clone();
            tasks.spawn_blocking(move || {
                let _permit = permit;
                match hash_file(Path::new(&file.path)) {
                    Ok(hash) => {
                        let _ = writer.submit(WriteOp::SetFileHash {
                            path: file.path,
                            hash,
                        });
                        true
                    }
                    Err(e) => {
                        warn!(path = %file.path, error = %e, "hash failed");
                        let _ = writer.submit(WriteOp::MarkFileError {
                            path: file.path,
                            note: format!("hash: {e}"),
                        });
                        false
                    }
                }
            });
        }
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(true) => stats.files_hashed += 1,
                Ok(false) => stats.errors += 1,
                Err(e) => {
                    warn!(error = %e, "hash task panicked");
                    stats.errors += 1;
                }
            }
        }
        self.writer.flush()?;

        stats.folders_hashed = self.aggregate_folders()?;
        self.writer.flush()?;

        stats.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            files = stats.files_hashed,
            folders = stats.folders_hashed,
            errors = stats.errors,
            duration_ms = stats.duration_ms,
            "hash stage complete"
        );
        Ok(stats)
    }

    /// Compute aggregate hashes depth-descending so every child hash is
    /// ready before its parent.
    fn aggregate_folders(&self) -> Result<u64> {
        let folders = self.catalog.folders_by_depth()?;
        let files = self.catalog.all_files()?;

        // Direct child files per folder: (name, content hash, size).
        let mut child_files: HashMap<String, Vec<(String, String, u64)>> = HashMap::new();
        for file in &files {
            let parent = parent_path(&file.path).to_string();
            let name = shoebox_catalog::basename(&file.path).to_string();
            let hash = file.content_hash.clone().unwrap_or_default();
            child_files
                .entry(parent)
                .or_default()
                .push((name, hash, file.size));
        }

        // Direct subfolders per folder.
        let mut child_folders: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, folder) in folders.iter().enumerate() {
            if let Some(parent) = &folder.parent_path {
                child_folders.entry(parent.clone()).or_default().push(idx);
            }
        }

        // path -> (aggregate hash, byte size), filled deepest-first.
        let mut computed: HashMap<String, (String, u64)> = HashMap::new();
        let mut count = 0u64;
        for folder in folders.iter().rev() {
            let mut children: Vec<(String, String)> = Vec::new();
            let mut bytes = 0u64;
            if let Some(entries) = child_files.get(&folder.path) {
                for (name, hash, size) in entries {
                    children.push((name.clone(), hash.clone()));
                    bytes += size;
                }
            }
            for idx in child_folders.get(&folder.path).into_iter().flatten() {
                let sub = &folders[*idx];
                if let Some((hash, sub_bytes)) = computed.get(&sub.path) {
                    children.push((sub.name().to_string(), hash.clone()));
                    bytes += sub_bytes;
                }
            }
            let hash = aggregate_hash(&children);
            computed.insert(folder.path.clone(), (hash.clone(), bytes));
            self.writer.submit(WriteOp::SetFolderHash {
                path: folder.path.clone(),
                hash,
                byte_size: bytes,
            })?;
            count += 1;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_is_order_independent() {
        let forward = aggregate_hash(&[
            ("a.txt".to_string(), "h1".to_string()),
            ("b.txt".to_string(), "h2".to_string()),
        ]);
        let reversed = aggregate_hash(&[
            ("b.txt".to_string(), "h2".to_string()),
            ("a.txt".to_string(), "h1".to_string()),
        ]);
        assert_eq!(forward, reversed);
    }

    #[test]
    fn aggregate_is_rename_sensitive() {
        let original = aggregate_hash(&[("a.txt".to_string(), "h1".to_string())]);
        let renamed = aggregate_hash(&[("renamed.txt".to_string(), "h1".to_string())]);
        assert_ne!(original, renamed);
    }

    #[test]
    fn empty_folder_gets_sentinel() {
        assert_eq!(aggregate_hash(&[]), empty_folder_hash());
        assert_eq!(
            empty_folder_hash(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn file_hash_matches_known_digest() {
        let temp = std::env::temp_dir().join("shoebox_hash_test.bin");
        std::fs::write(&temp, b"hello").unwrap();
        let hash = hash_file(&temp).unwrap();
        std::fs::remove_file(&temp).ok();
        assert_eq!(
            hash,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }
}
