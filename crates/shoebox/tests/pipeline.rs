//! End-to-end pipeline tests: scan → hash → classify → plan against real
//! temp directories, with a mock AI endpoint where the chain needs one.

use shoebox::probe::SystemProbe;
use shoebox::{AppConfig, CancellationToken, ClassifierKind, Mode, Orchestrator};
use shoebox_catalog::{normalize_path, DecisionSource, FolderAction, PlanOp};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

struct TestEnv {
    _temp: TempDir,
    pub source_dir: PathBuf,
    pub db_path: PathBuf,
    pub rules_path: PathBuf,
    pub categories_path: PathBuf,
}

const CATEGORIES_CSV: &str = "\
Documents/Finance
Documents/Taxes
Media/Audio
Media/Videos/Shows
Photos
System/Metadata
Other/Unsorted
";

impl TestEnv {
    fn new(rules_csv: &str) -> Self {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let source_dir = temp.path().join("src");
        std::fs::create_dir_all(&source_dir).unwrap();
        let rules_path = temp.path().join("rules.csv");
        std::fs::write(&rules_path, rules_csv).unwrap();
        let categories_path = temp.path().join("categories.csv");
        std::fs::write(&categories_path, CATEGORIES_CSV).unwrap();
        Self {
            db_path: temp.path().join("catalog.sqlite"),
            _temp: temp,
            source_dir,
            rules_path,
            categories_path,
        }
    }

    fn write_file(&self, rel: &str, content: &str) -> PathBuf {
        let path = self.source_dir.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, content).unwrap();
        path
    }

    fn mkdir(&self, rel: &str) {
        std::fs::create_dir_all(self.source_dir.join(rel)).unwrap();
    }

    fn config(&self) -> AppConfig {
        AppConfig {
            sources: vec![normalize_path(&self.source_dir.to_string_lossy())],
            db_path: self.db_path.clone(),
            rules_path: self.rules_path.clone(),
            categories_path: self.categories_path.clone(),
            classifier_kind: ClassifierKind::Manual,
            scan_workers: 2,
            hash_workers: 2,
            db_batch_size: 50,
            ollama_retries: 0,
            ollama_backoff: 1.0,
            ..AppConfig::default()
        }
    }

    fn rel(&self, rel: &str) -> String {
        normalize_path(&self.source_dir.join(rel).to_string_lossy())
    }

    fn root(&self) -> String {
        normalize_path(&self.source_dir.to_string_lossy())
    }

    async fn run(&self, config: AppConfig) -> shoebox::Result<Orchestrator> {
        let orchestrator = Orchestrator::new(
            config,
            Arc::new(SystemProbe {
                use_file_command: false,
            }),
            CancellationToken::new(),
        )?;
        orchestrator.run(Mode::All).await?;
        Ok(orchestrator)
    }
}

// ============================================================================
// Mock AI endpoint (Ollama wire shape)
// ============================================================================

#[derive(Clone)]
enum ChatBehavior {
    /// keep when the folder_name contains the needle, else disaggregate
    KeepMatching(&'static str),
    Disaggregate,
    Http500,
}

async fn spawn_mock_ai(behavior: ChatBehavior) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let behavior = behavior.clone();
            tokio::spawn(async move {
                let Some((path, body)) = read_request(&mut stream).await else {
                    return;
                };
                let (status, payload) = route(&path, &body, &behavior);
                let response = format!(
                    "HTTP/1.1 {status}\r\nContent-Type: application/json\r\n\
                     Content-Length: {}\r\nConnection: close\r\n\r\n{payload}",
                    payload.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    format!("http://{addr}|2|mock-model")
}

async fn read_request(stream: &mut tokio::net::TcpStream) -> Option<(String, String)> {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut tmp).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&tmp[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
    };
    let header = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let path = header
        .lines()
        .next()?
        .split_whitespace()
        .nth(1)?
        .to_string();
    let content_length: usize = header
        .lines()
        .find_map(|line| {
            line.to_ascii_lowercase()
                .strip_prefix("content-length:")
                .map(|v| v.trim().parse().ok())
        })
        .flatten()
        .unwrap_or(0);
    while buf.len() < header_end + 4 + content_length {
        let n = stream.read(&mut tmp).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&tmp[..n]);
    }
    let body = String::from_utf8_lossy(&buf[header_end + 4..]).to_string();
    Some((path, body))
}

fn route(path: &str, body: &str, behavior: &ChatBehavior) -> (&'static str, String) {
    match path {
        "/api/tags" => (
            "200 OK",
            r#"{"models":[{"name":"mock-model"}]}"#.to_string(),
        ),
        "/api/chat" => match behavior {
            ChatBehavior::Http500 => ("500 Internal Server Error", "{}".to_string()),
            ChatBehavior::Disaggregate => ("200 OK", chat_reply("disaggregate")),
            ChatBehavior::KeepMatching(needle) => {
                // The folder payload arrives JSON-escaped inside the chat
                // message content.
                let marker = format!(r#"\"folder_name\":\"{needle}"#);
                let decision = if body.contains(&marker) {
                    "keep"
                } else {
                    "disaggregate"
                };
                ("200 OK", chat_reply(decision))
            }
        },
        // No OpenAI surface: force Ollama detection.
        _ => ("404 Not Found", "{}".to_string()),
    }
}

fn chat_reply(decision: &str) -> String {
    format!(
        "{{\"message\":{{\"content\":\"{{\\\"decision\\\": \\\"{decision}\\\"}}\"}},\
         \"prompt_eval_count\":12,\"eval_count\":4}}"
    )
}

// ============================================================================
// Scenarios
// ============================================================================

/// Rule hint `keep` (mode ai) + AI keep: the folder moves as one unit
/// under the dated photo category.
#[tokio::test]
async fn photo_folder_kept_as_unit_with_backup_year() {
    let env = TestEnv::new(
        "^.*Photos.*-(?P<backup_year>\\d{4})(/.*)?$,*,Photos/{backup_year},keep,ai\n",
    );
    env.write_file("Wedding-Photos-2024/IMG_0001.jpg", "jpegdata");

    let endpoint = spawn_mock_ai(ChatBehavior::KeepMatching("Wedding")).await;
    let mut config = env.config();
    config.classifier_kind = ClassifierKind::Ai;
    config.ollama_url = vec![endpoint];

    let orchestrator = env.run(config).await.unwrap();

    let folder = orchestrator
        .catalog()
        .folder(&env.rel("Wedding-Photos-2024"))
        .unwrap()
        .unwrap();
    assert_eq!(folder.action, Some(FolderAction::Keep));
    assert_eq!(folder.decision_source, Some(DecisionSource::RuleHintAi));
    assert_eq!(folder.category.as_deref(), Some("Photos/2024"));

    let plan = orchestrator.catalog().plan().unwrap();
    let unit = plan.iter().find(|e| e.op == PlanOp::KeepUnit).unwrap();
    assert_eq!(unit.source_path, env.rel("Wedding-Photos-2024"));
    assert_eq!(unit.target_path, "Photos/2024/Wedding-Photos-2024");
    assert!(plan
        .iter()
        .all(|e| e.op != PlanOp::Place || !e.source_path.contains("IMG_0001")));
}

/// Disaggregated downloads: each file lands in its rule category.
#[tokio::test]
async fn downloads_folder_disaggregates_per_file() {
    let env = TestEnv::new(
        "^.*\\.pdf$,*,Documents/Finance,,final\n\
         ^.*\\.mp3$,*,Media/Audio,,final\n",
    );
    env.write_file("Downloads/invoice.pdf", "pdf");
    env.write_file("Downloads/song.mp3", "mp3");

    let endpoint = spawn_mock_ai(ChatBehavior::Disaggregate).await;
    let mut config = env.config();
    config.classifier_kind = ClassifierKind::Ai;
    config.ollama_url = vec![endpoint];

    let orchestrator = env.run(config).await.unwrap();

    let downloads = orchestrator
        .catalog()
        .folder(&env.rel("Downloads"))
        .unwrap()
        .unwrap();
    assert_eq!(downloads.action, Some(FolderAction::Disaggregate));
    assert_eq!(downloads.decision_source, Some(DecisionSource::Ai));

    let plan = orchestrator.catalog().plan().unwrap();
    let targets: Vec<(String, String)> = plan
        .iter()
        .filter(|e| e.op == PlanOp::Place)
        .map(|e| (e.source_path.clone(), e.target_path.clone()))
        .collect();
    assert_eq!(
        targets,
        vec![
            (
                env.rel("Downloads/invoice.pdf"),
                "Documents/Finance/invoice.pdf".to_string()
            ),
            (
                env.rel("Downloads/song.mp3"),
                "Media/Audio/song.mp3".to_string()
            ),
        ]
    );
}

/// A .git marker rule keeps the whole project; every descendant inherits
/// without evaluation and the plan holds exactly one keep-unit entry.
#[tokio::test]
async fn project_marker_keeps_whole_subtree() {
    let env = TestEnv::new("^.*/\\.git/.*$,*,System/Metadata,keep,final\n");
    env.write_file("project/.git/config", "[core]");
    env.write_file("project/src/main.c", "int main(){}");

    let orchestrator = env.run(env.config()).await.unwrap();

    let project = orchestrator
        .catalog()
        .folder(&env.rel("project"))
        .unwrap()
        .unwrap();
    assert_eq!(project.action, Some(FolderAction::Keep));
    assert_eq!(project.decision_source, Some(DecisionSource::RuleFinal));

    for sub in ["project/.git", "project/src"] {
        let folder = orchestrator.catalog().folder(&env.rel(sub)).unwrap().unwrap();
        assert_eq!(folder.action, Some(FolderAction::Keep), "{sub}");
        assert_eq!(folder.decision_source, Some(DecisionSource::Inherited), "{sub}");
    }

    let plan = orchestrator.catalog().plan().unwrap();
    let units: Vec<_> = plan.iter().filter(|e| e.op == PlanOp::KeepUnit).collect();
    assert_eq!(units.len(), 1);
    assert_eq!(units[0].source_path, env.rel("project"));
    assert_eq!(units[0].target_path, "System/Metadata/project");
    assert!(plan.iter().all(|e| e.op != PlanOp::Place));
}

/// Identical subtrees under two backups: one duplicate group, canonical
/// member planned, the other suppressed.
#[tokio::test]
async fn duplicate_subtree_is_suppressed() {
    let env = TestEnv::new("");
    env.write_file("Backup1/ProjectA/file.txt", "same content");
    env.write_file("Backup2/ProjectA/file.txt", "same content");
    env.write_file("Backup2/notes.txt", "keeps the backups distinct");

    let orchestrator = env.run(env.config()).await.unwrap();

    let groups = orchestrator.catalog().duplicate_folder_groups().unwrap();
    let group = groups
        .iter()
        .find(|g| g.paths.contains(&env.rel("Backup1/ProjectA")))
        .expect("ProjectA duplicate group");
    assert_eq!(group.canonical(), env.rel("Backup1/ProjectA"));

    let plan = orchestrator.catalog().plan().unwrap();
    let skip = plan
        .iter()
        .find(|e| e.op == PlanOp::SkipDuplicate && e.source_path == env.rel("Backup2/ProjectA"))
        .expect("skip-duplicate entry");
    assert_eq!(skip.canonical_path.as_deref(), Some(env.rel("Backup1/ProjectA").as_str()));

    // The canonical copy is placed, the duplicate subtree is not.
    assert!(plan
        .iter()
        .any(|e| e.op == PlanOp::Place && e.source_path == env.rel("Backup1/ProjectA/file.txt")));
    assert!(plan
        .iter()
        .all(|e| e.source_path != env.rel("Backup2/ProjectA/file.txt")));
}

/// keep_except anchor: unmatched children stay with the unit, an explicit
/// disaggregate child is carved out and filed per rule.
#[tokio::test]
async fn keep_except_carves_out_disaggregated_child() {
    let env = TestEnv::new(
        "^/alice/Documents(/)?$,*,Documents/Finance,disaggregate,final\n\
         ^/alice(/)?$,*,Other/Unsorted,keep_except,final\n\
         ^.*\\.pdf$,*,Documents/Finance,,final\n",
    );
    env.write_file("alice/.config/settings.ini", "[ui]");
    env.write_file("alice/Documents/report.pdf", "pdf");

    let orchestrator = env.run(env.config()).await.unwrap();

    let alice = orchestrator.catalog().folder(&env.rel("alice")).unwrap().unwrap();
    assert_eq!(alice.action, Some(FolderAction::KeepExcept));

    let config_dir = orchestrator
        .catalog()
        .folder(&env.rel("alice/.config"))
        .unwrap()
        .unwrap();
    assert_eq!(config_dir.action, Some(FolderAction::Keep));
    assert_eq!(config_dir.decision_source, Some(DecisionSource::Inherited));

    let documents = orchestrator
        .catalog()
        .folder(&env.rel("alice/Documents"))
        .unwrap()
        .unwrap();
    assert_eq!(documents.action, Some(FolderAction::Disaggregate));

    let plan = orchestrator.catalog().plan().unwrap();
    assert!(plan
        .iter()
        .any(|e| e.op == PlanOp::KeepUnit && e.source_path == env.rel("alice")));
    assert!(plan.iter().any(|e| e.op == PlanOp::Place
        && e.source_path == env.rel("alice/Documents/report.pdf")
        && e.target_path == "Documents/Finance/report.pdf"));
    assert!(plan
        .iter()
        .all(|e| e.source_path != env.rel("alice/.config/settings.ini")));
}

/// Every AI request fails: all chain invocations fall back to default,
/// the pipeline still completes and plans.
#[tokio::test]
async fn ai_errors_fall_back_to_default() {
    let env = TestEnv::new("");
    env.write_file("Misc/notes.txt", "scribbles");

    let endpoint = spawn_mock_ai(ChatBehavior::Http500).await;
    let mut config = env.config();
    config.classifier_kind = ClassifierKind::Ai;
    config.ollama_url = vec![endpoint];

    let orchestrator = env.run(config).await.unwrap();

    let misc = orchestrator.catalog().folder(&env.rel("Misc")).unwrap().unwrap();
    assert_eq!(misc.action, Some(FolderAction::Disaggregate));
    assert_eq!(misc.decision_source, Some(DecisionSource::Default));

    let plan = orchestrator.catalog().plan().unwrap();
    assert!(plan.iter().any(|e| e.op == PlanOp::Place
        && e.source_path == env.rel("Misc/notes.txt")
        && e.target_path == "Other/Unsorted/notes.txt"));
}

// ============================================================================
// Boundary behaviors
// ============================================================================

#[tokio::test]
async fn empty_source_root_yields_empty_plan() {
    let env = TestEnv::new("");
    let orchestrator = env.run(env.config()).await.unwrap();
    assert!(orchestrator.catalog().plan().unwrap().is_empty());
}

#[tokio::test]
async fn rerun_on_unchanged_tree_is_byte_identical() {
    let env = TestEnv::new(
        "^.*\\.pdf$,*,Documents/Finance,,final\n\
         ^.*/\\.git/.*$,*,System/Metadata,keep,final\n",
    );
    env.write_file("Downloads/invoice.pdf", "pdf");
    env.write_file("project/.git/config", "[core]");
    env.write_file("project/code.c", "c");

    let first = env.run(env.config()).await.unwrap();
    let plan_one = serde_json::to_string(&first.catalog().plan().unwrap()).unwrap();
    drop(first);

    let second = env.run(env.config()).await.unwrap();
    let plan_two = serde_json::to_string(&second.catalog().plan().unwrap()).unwrap();

    assert_eq!(plan_one, plan_two);
}

#[tokio::test]
async fn target_collisions_get_deterministic_suffixes() {
    let env = TestEnv::new("^.*\\.pdf$,*,Documents/Finance,,final\n");
    env.write_file("a/report.pdf", "first body");
    env.write_file("b/report.pdf", "second body");
    env.write_file("c/report.pdf", "first body");
    // Without this, folders a and c would be whole-folder duplicates and
    // c's subtree would be suppressed before file placement runs.
    env.write_file("c/extra.txt", "keeps folder c distinct");

    let orchestrator = env.run(env.config()).await.unwrap();
    let plan = orchestrator.catalog().plan().unwrap();

    let by_source = |rel: &str| {
        plan.iter()
            .find(|e| e.source_path == env.rel(rel))
            .unwrap()
            .clone()
    };
    assert_eq!(by_source("a/report.pdf").target_path, "Documents/Finance/report.pdf");
    assert_eq!(by_source("a/report.pdf").op, PlanOp::Place);
    // Different content: suffixed deterministically.
    assert_eq!(
        by_source("b/report.pdf").target_path,
        "Documents/Finance/report (2).pdf"
    );
    // Identical content at the same target: suppressed, not suffixed.
    let dup = by_source("c/report.pdf");
    assert_eq!(dup.op, PlanOp::SkipDuplicate);
    assert_eq!(dup.canonical_path.as_deref(), Some(env.rel("a/report.pdf").as_str()));
}

#[tokio::test]
async fn unreachable_ai_in_required_mode_is_exit_code_3() {
    let env = TestEnv::new("");
    env.write_file("Misc/notes.txt", "x");

    let mut config = env.config();
    config.classifier_kind = ClassifierKind::Ai;
    config.ollama_url = vec!["http://127.0.0.1:9|1|mock-model".to_string()];

    let orchestrator = Orchestrator::new(
        config,
        Arc::new(SystemProbe {
            use_file_command: false,
        }),
        CancellationToken::new(),
    )
    .unwrap();
    let err = orchestrator.run(Mode::All).await.unwrap_err();
    assert_eq!(err.exit_code(), 3);
}

/// A rescan after classification must not re-enter committed KEEP
/// subtrees.
#[tokio::test]
async fn rescan_skips_committed_keep_subtrees() {
    let env = TestEnv::new("^.*/\\.git/.*$,*,System/Metadata,keep,final\n");
    env.write_file("project/.git/config", "[core]");
    env.write_file("project/src/main.c", "int main(){}");

    let orchestrator = env.run(env.config()).await.unwrap();
    drop(orchestrator);

    // New file inside the kept subtree: a rescan must not pick it up.
    env.write_file("project/src/new_file.c", "// late arrival");
    let orchestrator = env.run(env.config()).await.unwrap();
    assert!(orchestrator
        .catalog()
        .file(&env.rel("project/src/new_file.c"))
        .unwrap()
        .is_none());
}
