//! Runtime configuration, loaded from environment variables.
//!
//! Every knob has a default except `SOURCES` (required for a pipeline run)
//! and `OLLAMA_URL` (required unless `CLASSIFIER=manual`). Validation
//! failures are fatal at startup.

use crate::error::{Result, ShoeboxError};
use std::path::PathBuf;

/// Pipeline stage selector (`MODE` env var or `run <mode>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Scan,
    Hash,
    Classify,
    Plan,
    All,
}

impl Mode {
    pub const ALL: &'static [Mode] = &[Mode::Scan, Mode::Hash, Mode::Classify, Mode::Plan, Mode::All];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scan => "scan",
            Self::Hash => "hash",
            Self::Classify => "classify",
            Self::Plan => "plan",
            Self::All => "all",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "scan" => Some(Self::Scan),
            "hash" => Some(Self::Hash),
            "classify" => Some(Self::Classify),
            "plan" => Some(Self::Plan),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    /// Does this mode include the given stage?
    pub fn includes(&self, stage: Mode) -> bool {
        *self == Mode::All || *self == stage
    }
}

/// Which classifier backs the AI stage of the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifierKind {
    /// Remote AI endpoints from `OLLAMA_URL`
    Ai,
    /// Rules only, no AI calls
    Manual,
}

/// One AI endpoint from the `OLLAMA_URL` spec `url|workers|model`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSpec {
    pub url: String,
    pub workers: usize,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Source roots to analyze
    pub sources: Vec<String>,
    pub db_path: PathBuf,
    /// Root of the canonical target tree in emitted plan paths
    pub main_target: String,
    pub rules_path: PathBuf,
    pub categories_path: PathBuf,
    /// Extra directory names stripped from path prefixes
    pub strip_dirs: Vec<String>,
    /// Pattern matching a single source wrapper component (e.g. "src\d+")
    pub source_wrapper_regex: Option<String>,

    pub scan_workers: usize,
    pub hash_workers: usize,
    pub move_workers: usize,
    pub db_batch_size: usize,
    pub max_content_peek: usize,
    /// Max direct children surveyed per folder for hints and AI payloads
    pub folder_sample_limit: usize,

    pub classifier_kind: ClassifierKind,
    pub ollama_url: Vec<String>,
    pub ollama_workers: usize,
    /// Max folder/file queries dispatched to the AI pool at once
    pub ollama_batch_size: usize,
    pub ollama_timeout_secs: u64,
    /// Retries after the first attempt
    pub ollama_retries: u32,
    pub ollama_backoff: f64,
    pub ollama_throttle_secs: f64,
    /// Wall-clock budget for the classify stage, 0 = unlimited
    pub classify_budget_secs: u64,

    pub mode: Mode,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            db_path: PathBuf::from("catalog.sqlite"),
            main_target: String::new(),
            rules_path: PathBuf::from("rules.csv"),
            categories_path: PathBuf::from("categories.csv"),
            strip_dirs: Vec::new(),
            source_wrapper_regex: Some("src\\d+".to_string()),
            scan_workers: 4,
            hash_workers: 4,
            move_workers: 2,
            db_batch_size: 500,
            max_content_peek: 1024,
            folder_sample_limit: 48,
            classifier_kind: ClassifierKind::Ai,
            ollama_url: Vec::new(),
            ollama_workers: 4,
            ollama_batch_size: 32,
            ollama_timeout_secs: 120,
            ollama_retries: 2,
            ollama_backoff: 1.5,
            ollama_throttle_secs: 0.0,
            classify_budget_secs: 0,
            mode: Mode::All,
        }
    }
}

impl AppConfig {
    /// Build configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let classifier_kind = match env_str("CLASSIFIER", "ollama").to_lowercase().as_str() {
            "manual" => ClassifierKind::Manual,
            _ => ClassifierKind::Ai,
        };
        let mode_raw = env_str("MODE", "all");
        let mode = Mode::parse(&mode_raw)
            .ok_or_else(|| ShoeboxError::Config(format!("Unknown MODE '{mode_raw}'")))?;
        let wrapper = env_str("SOURCE_WRAPPER_REGEX", "src\\d+");

        Ok(Self {
            sources: env_list("SOURCES"),
            db_path: PathBuf::from(env_str("DB_PATH", "catalog.sqlite")),
            main_target: env_str("MAIN_TARGET", ""),
            rules_path: PathBuf::from(env_str("RULES_PATH", "rules.csv")),
            categories_path: PathBuf::from(env_str("CATEGORIES_PATH", "categories.csv")),
            strip_dirs: env_list("STRIP_DIRS"),
            source_wrapper_regex: (!wrapper.is_empty()).then_some(wrapper),
            scan_workers: env_parse("SCAN_WORKERS", defaults.scan_workers)?,
            hash_workers: env_parse("HASH_WORKERS", defaults.hash_workers)?,
            move_workers: env_parse("MOVE_WORKERS", defaults.move_workers)?,
            db_batch_size: env_parse("DB_BATCH_SIZE", defaults.db_batch_size)?,
            max_content_peek: env_parse("MAX_CONTENT_PEEK", defaults.max_content_peek)?,
            folder_sample_limit: env_parse("FOLDER_SAMPLE_LIMIT", defaults.folder_sample_limit)?,
            classifier_kind,
            ollama_url: env_list("OLLAMA_URL"),
            ollama_workers: env_parse("OLLAMA_WORKERS", defaults.ollama_workers)?,
            ollama_batch_size: env_parse("OLLAMA_BATCH_SIZE", defaults.ollama_batch_size)?,
            ollama_timeout_secs: env_parse("OLLAMA_TIMEOUT", defaults.ollama_timeout_secs)?,
            ollama_retries: env_parse("OLLAMA_RETRIES", defaults.ollama_retries)?,
            ollama_backoff: env_parse("OLLAMA_BACKOFF", defaults.ollama_backoff)?,
            ollama_throttle_secs: env_parse(
                "OLLAMA_THROTTLE_SECONDS",
                defaults.ollama_throttle_secs,
            )?,
            classify_budget_secs: env_parse("CLASSIFY_BUDGET_SECONDS", 0)?,
            mode,
        })
    }

    /// Validate the parts required for a pipeline run.
    pub fn validate_for_run(&self) -> Result<()> {
        if self.sources.is_empty() {
            return Err(ShoeboxError::Config(
                "SOURCES must be configured and non-empty".to_string(),
            ));
        }
        if self.classifier_kind == ClassifierKind::Ai && self.ollama_url.is_empty() {
            return Err(ShoeboxError::Config(
                "OLLAMA_URL is required unless CLASSIFIER=manual".to_string(),
            ));
        }
        Ok(())
    }

    /// Parse `OLLAMA_URL` entries into endpoint specs.
    ///
    /// Format: `url|workers|model`, e.g.
    /// `http://localhost:11434|4|gpt-oss:20b`. Workers default to
    /// `OLLAMA_WORKERS`; the model name is required.
    pub fn endpoints(&self) -> Result<Vec<EndpointSpec>> {
        let default_workers = self.ollama_workers.max(1);
        let mut specs = Vec::new();
        for entry in &self.ollama_url {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let mut parts = entry.split('|');
            let url = parts.next().unwrap_or_default().trim().to_string();
            let workers = parts
                .next()
                .and_then(|w| w.trim().parse::<usize>().ok())
                .filter(|w| *w > 0)
                .unwrap_or(default_workers);
            let model = parts.next().map(|m| m.trim().to_string()).unwrap_or_default();
            if model.is_empty() {
                return Err(ShoeboxError::Config(format!(
                    "Model name required in OLLAMA_URL entry '{entry}' \
                     (format: url|workers|model)"
                )));
            }
            let url = if url.starts_with("http://") || url.starts_with("https://") {
                url
            } else {
                format!("http://{url}")
            };
            specs.push(EndpointSpec {
                url: url.trim_end_matches('/').to_string(),
                workers,
                model,
            });
        }
        Ok(specs)
    }
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ShoeboxError::Config(format!("Invalid value for {key}: '{raw}'"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_roundtrip() {
        for mode in Mode::ALL {
            assert_eq!(Mode::parse(mode.as_str()), Some(*mode));
        }
        assert_eq!(Mode::parse("bogus"), None);
    }

    #[test]
    fn endpoint_spec_parsing() {
        let config = AppConfig {
            ollama_url: vec![
                "http://localhost:11434|4|gpt-oss:20b".to_string(),
                "lmstudio:1234||qwen".to_string(),
            ],
            ollama_workers: 2,
            ..AppConfig::default()
        };
        let specs = config.endpoints().unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].url, "http://localhost:11434");
        assert_eq!(specs[0].workers, 4);
        assert_eq!(specs[0].model, "gpt-oss:20b");
        assert_eq!(specs[1].url, "http://lmstudio:1234");
        assert_eq!(specs[1].workers, 2);
    }

    #[test]
    fn endpoint_spec_requires_model() {
        let config = AppConfig {
            ollama_url: vec!["http://localhost:11434|4".to_string()],
            ..AppConfig::default()
        };
        assert!(config.endpoints().is_err());
    }
}
