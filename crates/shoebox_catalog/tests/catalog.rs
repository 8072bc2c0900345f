//! Integration tests for the catalog store.

use shoebox_catalog::{
    Catalog, CatalogError, CatalogWriter, DecisionSource, FileRecord, FolderAction, FolderRecord,
    PlanEntry, PlanOp, WriteOp,
};
use tempfile::TempDir;

struct TestEnv {
    _temp: TempDir,
    pub catalog: Catalog,
}

impl TestEnv {
    fn new() -> Self {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let catalog = Catalog::open(temp.path().join("catalog.sqlite")).unwrap();
        Self {
            _temp: temp,
            catalog,
        }
    }
}

#[test]
fn upsert_and_read_file() {
    let env = TestEnv::new();
    let handle = CatalogWriter::spawn(&env.catalog, 10).unwrap();
    let writer = handle.writer();

    let mut rec = FileRecord::new("/src/Downloads/invoice.pdf", 1234, 1_700_000_000_000);
    rec.mime = Some("application/pdf".into());
    writer.submit(WriteOp::UpsertFile(rec)).unwrap();
    writer.flush().unwrap();

    let loaded = env
        .catalog
        .file("/src/Downloads/invoice.pdf")
        .unwrap()
        .expect("file present");
    assert_eq!(loaded.size, 1234);
    assert_eq!(loaded.mime.as_deref(), Some("application/pdf"));
    assert!(loaded.content_hash.is_none());

    drop(writer);
    handle.close().unwrap();
}

#[test]
fn changed_mtime_resets_hash_and_classification() {
    let env = TestEnv::new();
    let handle = CatalogWriter::spawn(&env.catalog, 10).unwrap();
    let writer = handle.writer();

    let rec = FileRecord::new("/src/a.txt", 10, 1000);
    writer.submit(WriteOp::UpsertFile(rec.clone())).unwrap();
    writer
        .submit(WriteOp::SetFileHash {
            path: "/src/a.txt".into(),
            hash: "abc".into(),
        })
        .unwrap();
    writer
        .submit(WriteOp::ClassifyFile {
            path: "/src/a.txt".into(),
            category: "Documents".into(),
            source: DecisionSource::RuleFinal,
            confidence: None,
            metadata: Default::default(),
        })
        .unwrap();
    writer.flush().unwrap();

    // Same mtime: rescan keeps hash and classification.
    writer.submit(WriteOp::UpsertFile(rec.clone())).unwrap();
    writer.flush().unwrap();
    let loaded = env.catalog.file("/src/a.txt").unwrap().unwrap();
    assert_eq!(loaded.content_hash.as_deref(), Some("abc"));
    assert_eq!(loaded.category.as_deref(), Some("Documents"));

    // New mtime: both reset.
    let mut changed = rec;
    changed.mtime = 2000;
    writer.submit(WriteOp::UpsertFile(changed)).unwrap();
    writer.flush().unwrap();
    let loaded = env.catalog.file("/src/a.txt").unwrap().unwrap();
    assert!(loaded.content_hash.is_none());
    assert!(loaded.category.is_none());

    drop(writer);
    handle.close().unwrap();
}

#[test]
fn folder_decision_is_write_once() {
    let env = TestEnv::new();
    let handle = CatalogWriter::spawn(&env.catalog, 10).unwrap();
    let writer = handle.writer();

    writer
        .submit(WriteOp::UpsertFolder(FolderRecord::new("/src/project")))
        .unwrap();
    writer
        .submit(WriteOp::DecideFolder {
            path: "/src/project".into(),
            action: FolderAction::Keep,
            source: DecisionSource::RuleFinal,
            category: Some("System/Projects".into()),
            metadata: Default::default(),
            decided_at: 1,
        })
        .unwrap();
    // Second decision must be ignored, not overwrite.
    writer
        .submit(WriteOp::DecideFolder {
            path: "/src/project".into(),
            action: FolderAction::Disaggregate,
            source: DecisionSource::Ai,
            category: None,
            metadata: Default::default(),
            decided_at: 2,
        })
        .unwrap();
    writer.flush().unwrap();

    let folder = env.catalog.folder("/src/project").unwrap().unwrap();
    assert_eq!(folder.action, Some(FolderAction::Keep));
    assert_eq!(folder.decision_source, Some(DecisionSource::RuleFinal));

    drop(writer);
    let stats = handle.close().unwrap();
    assert_eq!(stats.decide_conflicts, 1);
}

#[test]
fn keep_set_lists_committed_keeps_only() {
    let env = TestEnv::new();
    let handle = CatalogWriter::spawn(&env.catalog, 10).unwrap();
    let writer = handle.writer();

    for (path, action) in [
        ("/a", Some(FolderAction::Keep)),
        ("/b", Some(FolderAction::Disaggregate)),
        ("/c", None),
    ] {
        writer
            .submit(WriteOp::UpsertFolder(FolderRecord::new(path)))
            .unwrap();
        if let Some(action) = action {
            writer
                .submit(WriteOp::DecideFolder {
                    path: path.into(),
                    action,
                    source: DecisionSource::RuleFinal,
                    category: None,
                    metadata: Default::default(),
                    decided_at: 0,
                })
                .unwrap();
        }
    }
    writer.flush().unwrap();

    assert_eq!(env.catalog.keep_set().unwrap(), vec!["/a".to_string()]);

    drop(writer);
    handle.close().unwrap();
}

#[test]
fn duplicate_folder_groups_require_two_members() {
    let env = TestEnv::new();
    let handle = CatalogWriter::spawn(&env.catalog, 10).unwrap();
    let writer = handle.writer();

    for path in ["/Backup1/ProjectA", "/Backup2/ProjectA", "/Other"] {
        writer
            .submit(WriteOp::UpsertFolder(FolderRecord::new(path)))
            .unwrap();
    }
    for (path, hash) in [
        ("/Backup1/ProjectA", "same"),
        ("/Backup2/ProjectA", "same"),
        ("/Other", "different"),
    ] {
        writer
            .submit(WriteOp::SetFolderHash {
                path: path.into(),
                hash: hash.into(),
                byte_size: 42,
            })
            .unwrap();
    }
    writer.flush().unwrap();

    let groups = env.catalog.duplicate_folder_groups().unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].hash, "same");
    assert_eq!(
        groups[0].paths,
        vec!["/Backup1/ProjectA".to_string(), "/Backup2/ProjectA".to_string()]
    );
    assert_eq!(groups[0].canonical(), "/Backup1/ProjectA");

    drop(writer);
    handle.close().unwrap();
}

#[test]
fn plan_round_trip_sorted_by_source() {
    let env = TestEnv::new();
    let handle = CatalogWriter::spawn(&env.catalog, 10).unwrap();
    let writer = handle.writer();

    writer.submit(WriteOp::ClearPlan).unwrap();
    for (src, dst) in [
        ("/src/z.txt", "Documents/z.txt"),
        ("/src/a.txt", "Documents/a.txt"),
    ] {
        writer
            .submit(WriteOp::AddPlanEntry(PlanEntry {
                source_path: src.into(),
                target_path: dst.into(),
                op: PlanOp::Place,
                decision: Some("rule-final".into()),
                canonical_path: None,
            }))
            .unwrap();
    }
    writer.flush().unwrap();

    let plan = env.catalog.plan().unwrap();
    assert_eq!(plan.len(), 2);
    assert_eq!(plan[0].source_path, "/src/a.txt");
    assert_eq!(plan[1].source_path, "/src/z.txt");

    drop(writer);
    handle.close().unwrap();
}

#[test]
fn version_mismatch_is_fatal() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("catalog.sqlite");
    {
        let _catalog = Catalog::open(&path).unwrap();
    }
    // Corrupt the recorded version.
    let conn = rusqlite::Connection::open(&path).unwrap();
    conn.execute(
        "UPDATE catalog_meta SET value = '999' WHERE key = 'schema_version'",
        [],
    )
    .unwrap();
    drop(conn);

    match Catalog::open(&path) {
        Err(CatalogError::VersionMismatch { found, .. }) => assert_eq!(found, "999"),
        other => panic!("expected version mismatch, got {other:?}"),
    }
}
