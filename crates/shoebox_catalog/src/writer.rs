//! Single-writer batched mutation path.
//!
//! One dedicated thread owns the write connection and drains a bounded
//! queue. Producers enqueue and block when the queue is full
//! (backpressure). Writes are committed in transactions at batch
//! boundaries, so readers always observe a consistent snapshot up to the
//! last committed batch.

use crate::error::{CatalogError, Result};
use crate::store::{metadata_to_json, Catalog};
use crate::types::{DecisionSource, FileRecord, FolderAction, FolderRecord, PlanEntry};
use rusqlite::params;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// Queue capacity in front of the writer thread.
const QUEUE_DEPTH: usize = 4096;

/// A single mutation accepted by the writer.
#[derive(Debug)]
pub enum WriteOp {
    /// Insert or refresh a scanned file. A changed mtime resets hash and
    /// classification so the file flows through the pipeline again.
    UpsertFile(FileRecord),
    /// Insert or refresh a scanned folder. Never touches a committed
    /// action.
    UpsertFolder(FolderRecord),
    /// Record a computed content hash.
    SetFileHash { path: String, hash: String },
    /// Record a folder aggregate hash and its byte footprint.
    SetFolderHash {
        path: String,
        hash: String,
        byte_size: u64,
    },
    /// Record a file classification outcome.
    ClassifyFile {
        path: String,
        category: String,
        source: DecisionSource,
        confidence: Option<f64>,
        metadata: std::collections::BTreeMap<String, String>,
    },
    /// Commit a folder action. Refuses to overwrite an existing decision.
    DecideFolder {
        path: String,
        action: FolderAction,
        source: DecisionSource,
        category: Option<String>,
        metadata: std::collections::BTreeMap<String, String>,
        decided_at: i64,
    },
    /// Record a recoverable error on a file.
    MarkFileError { path: String, note: String },
    /// Append a plan entry.
    AddPlanEntry(PlanEntry),
    /// Drop all plan entries (start of a plan run).
    ClearPlan,
}

/// Counters reported when the writer shuts down.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriterStats {
    pub ops_applied: u64,
    pub batches_committed: u64,
    /// DecideFolder ops that found an already-committed action
    pub decide_conflicts: u64,
}

/// Handle used by pipeline stages to enqueue mutations.
#[derive(Clone)]
pub struct CatalogWriter {
    tx: SyncSender<Message>,
}

enum Message {
    Op(WriteOp),
    Flush(SyncSender<()>),
}

/// Owner handle: joins the writer thread and returns its stats.
pub struct WriterHandle {
    writer: CatalogWriter,
    join: JoinHandle<Result<WriterStats>>,
}

impl CatalogWriter {
    /// Spawn the writer thread for `catalog`.
    pub fn spawn(catalog: &Catalog, batch_size: usize) -> Result<WriterHandle> {
        let (tx, rx) = sync_channel::<Message>(QUEUE_DEPTH);
        let catalog = catalog.clone();
        let batch_size = batch_size.max(1);
        let join = std::thread::Builder::new()
            .name("catalog-writer".into())
            .spawn(move || writer_loop(catalog, rx, batch_size))
            .map_err(CatalogError::Io)?;
        let writer = CatalogWriter { tx };
        Ok(WriterHandle {
            writer: writer.clone(),
            join,
        })
    }

    /// Enqueue a mutation, blocking when the queue is full.
    pub fn submit(&self, op: WriteOp) -> Result<()> {
        self.tx
            .send(Message::Op(op))
            .map_err(|_| CatalogError::WriterClosed)
    }

    /// Force a commit of everything enqueued so far and wait for it.
    pub fn flush(&self) -> Result<()> {
        let (ack_tx, ack_rx) = sync_channel::<()>(1);
        self.tx
            .send(Message::Flush(ack_tx))
            .map_err(|_| CatalogError::WriterClosed)?;
        ack_rx.recv().map_err(|_| CatalogError::WriterClosed)
    }
}

impl WriterHandle {
    pub fn writer(&self) -> CatalogWriter {
        self.writer.clone()
    }

    /// Drop the sender side, wait for the thread to drain and commit, and
    /// return the writer stats.
    pub fn close(self) -> Result<WriterStats> {
        let WriterHandle { writer, join } = self;
        drop(writer);
        match join.join() {
            Ok(result) => result,
            Err(_) => Err(CatalogError::WriterClosed),
        }
    }
}

fn writer_loop(
    catalog: Catalog,
    rx: Receiver<Message>,
    batch_size: usize,
) -> Result<WriterStats> {
    let mut conn = catalog.connection()?;
    let mut stats = WriterStats::default();
    let mut batch: Vec<WriteOp> = Vec::with_capacity(batch_size);

    loop {
        match rx.recv() {
            Ok(Message::Op(op)) => {
                batch.push(op);
                if batch.len() >= batch_size {
                    commit_batch(&mut conn, &mut batch, &mut stats)?;
                }
            }
            Ok(Message::Flush(ack)) => {
                commit_batch(&mut conn, &mut batch, &mut stats)?;
                let _ = ack.send(());
            }
            Err(_) => {
                // All senders gone: final commit and exit.
                commit_batch(&mut conn, &mut batch, &mut stats)?;
                debug!(
                    ops = stats.ops_applied,
                    batches = stats.batches_committed,
                    "catalog writer drained"
                );
                return Ok(stats);
            }
        }
    }
}

fn commit_batch(
    conn: &mut rusqlite::Connection,
    batch: &mut Vec<WriteOp>,
    stats: &mut WriterStats,
) -> Result<()> {
    if batch.is_empty() {
        return Ok(());
    }
    let tx = conn.transaction()?;
    for op in batch.drain(..) {
        apply_op(&tx, op, stats)?;
        stats.ops_applied += 1;
    }
    tx.commit()?;
    stats.batches_committed += 1;
    Ok(())
}

fn apply_op(tx: &rusqlite::Transaction<'_>, op: WriteOp, stats: &mut WriterStats) -> Result<()> {
    match op {
        WriteOp::UpsertFile(file) => {
            let metadata_json = metadata_to_json(&file.metadata)?;
            tx.execute(
                "INSERT INTO files (path, size, mtime, mime, metadata_json, status) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                 ON CONFLICT(path) DO UPDATE SET \
                   size = excluded.size, \
                   mtime = excluded.mtime, \
                   mime = COALESCE(excluded.mime, files.mime), \
                   content_hash = CASE WHEN files.mtime = excluded.mtime \
                                       THEN files.content_hash ELSE NULL END, \
                   category = CASE WHEN files.mtime = excluded.mtime \
                                   THEN files.category ELSE NULL END, \
                   decision_source = CASE WHEN files.mtime = excluded.mtime \
                                          THEN files.decision_source ELSE NULL END, \
                   status = CASE WHEN files.mtime = excluded.mtime \
                                 THEN files.status ELSE excluded.status END",
                params![
                    file.path,
                    file.size,
                    file.mtime,
                    file.mime,
                    metadata_json,
                    file.status.as_str(),
                ],
            )?;
        }
        WriteOp::UpsertFolder(folder) => {
            let metadata_json = metadata_to_json(&folder.metadata)?;
            tx.execute(
                "INSERT INTO folders \
                   (path, parent_path, depth, file_count, subfolder_count, mtime, metadata_json) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
                 ON CONFLICT(path) DO UPDATE SET \
                   file_count = excluded.file_count, \
                   subfolder_count = excluded.subfolder_count, \
                   mtime = excluded.mtime",
                params![
                    folder.path,
                    folder.parent_path,
                    folder.depth,
                    folder.file_count,
                    folder.subfolder_count,
                    folder.mtime,
                    metadata_json,
                ],
            )?;
        }
        WriteOp::SetFileHash { path, hash } => {
            tx.execute(
                "UPDATE files SET content_hash = ?1, status = 'hashed' WHERE path = ?2",
                params![hash, path],
            )?;
        }
        WriteOp::SetFolderHash {
            path,
            hash,
            byte_size,
        } => {
            tx.execute(
                "UPDATE folders SET aggregate_hash = ?1, byte_size = ?2 WHERE path = ?3",
                params![hash, byte_size, path],
            )?;
        }
        WriteOp::ClassifyFile {
            path,
            category,
            source,
            confidence,
            metadata,
        } => {
            let metadata_json = metadata_to_json(&metadata)?;
            tx.execute(
                "UPDATE files SET category = ?1, decision_source = ?2, confidence = ?3, \
                 metadata_json = COALESCE(?4, metadata_json), status = 'classified' \
                 WHERE path = ?5",
                params![category, source.as_str(), confidence, metadata_json, path],
            )?;
        }
        WriteOp::DecideFolder {
            path,
            action,
            source,
            category,
            metadata,
            decided_at,
        } => {
            let metadata_json = metadata_to_json(&metadata)?;
            let changed = tx.execute(
                "UPDATE folders SET action = ?1, decision_source = ?2, category = ?3, \
                 metadata_json = COALESCE(?4, metadata_json), decided_at = ?5 \
                 WHERE path = ?6 AND action IS NULL",
                params![
                    action.as_str(),
                    source.as_str(),
                    category,
                    metadata_json,
                    decided_at,
                    path
                ],
            )?;
            if changed == 0 {
                stats.decide_conflicts += 1;
                warn!(folder = %path, action = %action, "folder already decided, ignoring");
            }
        }
        WriteOp::MarkFileError { path, note } => {
            tx.execute(
                "UPDATE files SET status = 'error', note = ?1 WHERE path = ?2",
                params![note, path],
            )?;
        }
        WriteOp::AddPlanEntry(entry) => {
            tx.execute(
                "INSERT OR REPLACE INTO plan_entries \
                   (source_path, target_path, op, decision, canonical_path) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    entry.source_path,
                    entry.target_path,
                    entry.op.as_str(),
                    entry.decision,
                    entry.canonical_path,
                ],
            )?;
        }
        WriteOp::ClearPlan => {
            tx.execute("DELETE FROM plan_entries", [])?;
        }
    }
    Ok(())
}
