use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use story_trim_core::segment::{default_rules, Rule};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub trim: TrimConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub segmentation: SegmentationConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/storytrim.sqlite")
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

impl LlmConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_timeout_secs() -> u64 {
    120
}
fn default_max_retries() -> u32 {
    3
}

/// Progressive memory sizing.
#[derive(Debug, Deserialize, Clone)]
pub struct MemoryConfig {
    /// Summaries fed into a trim; also the threshold for full context.
    #[serde(default = "default_summary_limit")]
    pub summary_limit: usize,
    /// Chapters per encyclopedia rollup.
    #[serde(default = "default_encyclopedia_interval")]
    pub encyclopedia_interval: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            summary_limit: default_summary_limit(),
            encyclopedia_interval: default_encyclopedia_interval(),
        }
    }
}

fn default_summary_limit() -> usize {
    5
}
fn default_encyclopedia_interval() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct TrimConfig {
    #[serde(default = "default_replay_chunk_chars")]
    pub replay_chunk_chars: usize,
    #[serde(default = "default_replay_interval_ms")]
    pub replay_interval_ms: u64,
    #[serde(default = "default_chapter_concurrency")]
    pub chapter_concurrency: usize,
    #[serde(default = "default_readiness_threshold")]
    pub readiness_threshold: f64,
    #[serde(default = "default_readiness_tolerance")]
    pub readiness_tolerance: i64,
}

impl Default for TrimConfig {
    fn default() -> Self {
        Self {
            replay_chunk_chars: default_replay_chunk_chars(),
            replay_interval_ms: default_replay_interval_ms(),
            chapter_concurrency: default_chapter_concurrency(),
            readiness_threshold: default_readiness_threshold(),
            readiness_tolerance: default_readiness_tolerance(),
        }
    }
}

impl TrimConfig {
    pub fn replay_interval(&self) -> Duration {
        Duration::from_millis(self.replay_interval_ms)
    }
}

fn default_replay_chunk_chars() -> usize {
    10
}
fn default_replay_interval_ms() -> u64 {
    20
}
fn default_chapter_concurrency() -> usize {
    5
}
fn default_readiness_threshold() -> f64 {
    0.9
}
fn default_readiness_tolerance() -> i64 {
    1
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkersConfig {
    #[serde(default = "default_batch_workers")]
    pub batch_workers: usize,
    #[serde(default = "default_batch_queue")]
    pub batch_queue: usize,
    #[serde(default = "default_background_workers")]
    pub background_workers: usize,
    #[serde(default = "default_background_queue")]
    pub background_queue: usize,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            batch_workers: default_batch_workers(),
            batch_queue: default_batch_queue(),
            background_workers: default_background_workers(),
            background_queue: default_background_queue(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl WorkersConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

fn default_batch_workers() -> usize {
    2
}
fn default_batch_queue() -> usize {
    16
}
fn default_background_workers() -> usize {
    2
}
fn default_background_queue() -> usize {
    64
}
fn default_shutdown_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SegmentationConfig {
    /// Replaces the built-in rule set when non-empty.
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl SegmentationConfig {
    pub fn effective_rules(&self) -> Vec<Rule> {
        if self.rules.is_empty() {
            default_rules()
        } else {
            self.rules.clone()
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.memory.summary_limit < 1 {
        anyhow::bail!("memory.summary_limit must be >= 1");
    }
    if config.memory.encyclopedia_interval < 1 {
        anyhow::bail!("memory.encyclopedia_interval must be >= 1");
    }

    if config.trim.replay_chunk_chars < 1 {
        anyhow::bail!("trim.replay_chunk_chars must be >= 1");
    }
    if config.trim.chapter_concurrency < 1 {
        anyhow::bail!("trim.chapter_concurrency must be >= 1");
    }
    let threshold = config.trim.readiness_threshold;
    if !(threshold > 0.0 && threshold <= 1.0) {
        anyhow::bail!("trim.readiness_threshold must be in (0.0, 1.0]");
    }
    if config.trim.readiness_tolerance < 0 {
        anyhow::bail!("trim.readiness_tolerance must be >= 0");
    }

    let w = &config.workers;
    if w.batch_workers < 1 || w.background_workers < 1 {
        anyhow::bail!("workers.batch_workers and workers.background_workers must be >= 1");
    }
    if w.batch_queue < 1 || w.background_queue < 1 {
        anyhow::bail!("workers.batch_queue and workers.background_queue must be >= 1");
    }

    for rule in &config.segmentation.rules {
        if rule.name.trim().is_empty() {
            anyhow::bail!("segmentation.rules entries need a non-empty name");
        }
    }

    match config.llm.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown llm provider: '{}'. Must be disabled or openai.",
            other
        ),
    }
    if config.llm.is_enabled() && config.llm.model.is_none() {
        anyhow::bail!(
            "llm.model must be specified when provider is '{}'",
            config.llm.provider
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let file = write_config("");
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.llm.provider, "disabled");
        assert_eq!(config.memory.summary_limit, 5);
        assert_eq!(config.memory.encyclopedia_interval, 10);
        assert_eq!(config.trim.chapter_concurrency, 5);
        assert_eq!(config.workers.batch_queue, 16);
        assert_eq!(config.segmentation.effective_rules(), default_rules());
    }

    #[test]
    fn test_custom_rules_replace_defaults() {
        let file = write_config(
            r#"
[[segmentation.rules]]
name = "parts"
pattern = "(?m)^Part [0-9]+.*"
weight = 95
"#,
        );
        let config = load_config(file.path()).unwrap();
        let rules = config.segmentation.effective_rules();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].name, "parts");
        assert_eq!(rules[0].weight, 95);
    }

    #[test]
    fn test_openai_requires_model() {
        let file = write_config("[llm]\nprovider = \"openai\"\n");
        let err = load_config(file.path()).unwrap_err();
        assert!(err.to_string().contains("llm.model"));
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let file = write_config("[llm]\nprovider = \"magic\"\n");
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn test_zero_values_rejected() {
        for body in [
            "[memory]\nsummary_limit = 0\n",
            "[memory]\nencyclopedia_interval = 0\n",
            "[trim]\nchapter_concurrency = 0\n",
            "[trim]\nreplay_chunk_chars = 0\n",
            "[trim]\nreadiness_threshold = 0.0\n",
            "[workers]\nbatch_queue = 0\n",
        ] {
            let file = write_config(body);
            assert!(load_config(file.path()).is_err(), "accepted: {body}");
        }
    }
}
