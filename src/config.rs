use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub operations: OperationsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_bind")]
    pub bind: String,
    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_server_bind(),
            max_request_bytes: default_max_request_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default = "default_classifier_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_classifier_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_classifier_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            endpoint: default_classifier_endpoint(),
            model: default_classifier_model(),
            api_key: None,
            timeout_ms: default_classifier_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_sandbox_root")]
    pub root: PathBuf,
    #[serde(default = "default_logical_prefix")]
    pub logical_prefix: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            root: default_sandbox_root(),
            logical_prefix: default_logical_prefix(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Per-handler deadline; 0 disables it.
    #[serde(default = "default_handler_timeout_ms")]
    pub handler_timeout_ms: u64,
    #[serde(default = "default_serialize_writes")]
    pub serialize_writes: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            handler_timeout_ms: default_handler_timeout_ms(),
            serialize_writes: default_serialize_writes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationsConfig {
    #[serde(default = "default_allowed_script_urls")]
    pub allowed_script_urls: Vec<String>,
    #[serde(default = "default_script_runner")]
    pub script_runner: String,
    #[serde(default = "default_formatter_runner")]
    pub formatter_runner: String,
    #[serde(default = "default_scrape_max_pages")]
    pub scrape_max_pages: usize,
    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for OperationsConfig {
    fn default() -> Self {
        Self {
            allowed_script_urls: default_allowed_script_urls(),
            script_runner: default_script_runner(),
            formatter_runner: default_formatter_runner(),
            scrape_max_pages: default_scrape_max_pages(),
            http_timeout_ms: default_http_timeout_ms(),
            user_agent: default_user_agent(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let mut cfg = if path.exists() {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed reading config file {}", path.display()))?;
            toml::from_str::<Config>(&text)
                .with_context(|| format!("failed parsing TOML config {}", path.display()))?
        } else {
            Self::default()
        };
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_cli_overrides(
        &mut self,
        bind: Option<&str>,
        sandbox_root: Option<&Path>,
        classifier_url: Option<&str>,
    ) -> Result<()> {
        if let Some(bind) = bind {
            self.server.bind = bind.trim().to_owned();
        }
        if let Some(root) = sandbox_root {
            self.sandbox.root = root.to_path_buf();
        }
        if let Some(url) = classifier_url {
            self.classifier.endpoint = url.trim().to_owned();
        }
        self.validate()
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("TASKDESK_RS_BIND") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                self.server.bind = trimmed.to_owned();
            }
        }
        if let Ok(v) = env::var("TASKDESK_RS_MAX_REQUEST_BYTES") {
            if let Ok(n) = v.parse::<usize>() {
                self.server.max_request_bytes = n.max(1024);
            }
        }
        if let Ok(v) = env::var("TASKDESK_RS_CLASSIFIER_URL") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                self.classifier.endpoint = trimmed.to_owned();
            }
        }
        if let Ok(v) = env::var("TASKDESK_RS_CLASSIFIER_MODEL") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                self.classifier.model = trimmed.to_owned();
            }
        }
        if let Ok(v) = env::var("TASKDESK_RS_API_KEY").or_else(|_| env::var("AIPROXY_TOKEN")) {
            let trimmed = v.trim();
            self.classifier.api_key = if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_owned())
            };
        }
        if let Ok(v) = env::var("TASKDESK_RS_CLASSIFIER_TIMEOUT_MS") {
            if let Ok(n) = v.parse::<u64>() {
                self.classifier.timeout_ms = n.max(1_000);
            }
        }
        if let Ok(v) = env::var("TASKDESK_RS_SANDBOX_ROOT") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                self.sandbox.root = PathBuf::from(trimmed);
            }
        }
        if let Ok(v) = env::var("TASKDESK_RS_LOGICAL_PREFIX") {
            self.sandbox.logical_prefix = v.trim().trim_matches('/').to_owned();
        }
        if let Ok(v) = env::var("TASKDESK_RS_HANDLER_TIMEOUT_MS") {
            if let Ok(n) = v.parse::<u64>() {
                self.runtime.handler_timeout_ms = n;
            }
        }
        if let Ok(v) = env::var("TASKDESK_RS_SERIALIZE_WRITES") {
            self.runtime.serialize_writes = parse_bool(&v);
        }
        if let Ok(v) = env::var("TASKDESK_RS_ALLOWED_SCRIPT_URLS") {
            self.operations.allowed_script_urls = split_csv(&v);
        }
        if let Ok(v) = env::var("TASKDESK_RS_SCRIPT_RUNNER") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                self.operations.script_runner = trimmed.to_owned();
            }
        }
        if let Ok(v) = env::var("TASKDESK_RS_FORMATTER_RUNNER") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                self.operations.formatter_runner = trimmed.to_owned();
            }
        }
        if let Ok(v) = env::var("TASKDESK_RS_SCRAPE_MAX_PAGES") {
            if let Ok(n) = v.parse::<usize>() {
                self.operations.scrape_max_pages = n.max(1);
            }
        }
        if let Ok(v) = env::var("TASKDESK_RS_HTTP_TIMEOUT_MS") {
            if let Ok(n) = v.parse::<u64>() {
                self.operations.http_timeout_ms = n.max(500);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.bind.trim().is_empty() {
            anyhow::bail!("server.bind must not be empty");
        }
        if self.server.max_request_bytes == 0 {
            anyhow::bail!("server.max_request_bytes must be > 0");
        }
        if self.classifier.endpoint.trim().is_empty() {
            anyhow::bail!("classifier.endpoint must not be empty");
        }
        if self.classifier.model.trim().is_empty() {
            anyhow::bail!("classifier.model must not be empty");
        }
        if self.classifier.timeout_ms == 0 {
            anyhow::bail!("classifier.timeout_ms must be > 0");
        }
        if self.sandbox.root.as_os_str().is_empty() {
            anyhow::bail!("sandbox.root must not be empty");
        }
        if self.sandbox.logical_prefix.contains('/') || self.sandbox.logical_prefix.contains("..") {
            anyhow::bail!("sandbox.logical_prefix must be a single path component");
        }
        if self.operations.script_runner.trim().is_empty() {
            anyhow::bail!("operations.script_runner must not be empty");
        }
        if self.operations.formatter_runner.trim().is_empty() {
            anyhow::bail!("operations.formatter_runner must not be empty");
        }
        if self.operations.scrape_max_pages == 0 {
            anyhow::bail!("operations.scrape_max_pages must be > 0");
        }
        if self.operations.http_timeout_ms == 0 {
            anyhow::bail!("operations.http_timeout_ms must be > 0");
        }
        for entry in &self.operations.allowed_script_urls {
            let parsed = url::Url::parse(entry).with_context(|| {
                format!("operations.allowed_script_urls entry `{entry}` is not a URL")
            })?;
            if !matches!(parsed.scheme(), "http" | "https") {
                anyhow::bail!(
                    "operations.allowed_script_urls entry `{entry}` must use http or https"
                );
            }
        }
        Ok(())
    }
}

fn split_csv(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

fn parse_bool(s: &str) -> bool {
    matches!(
        s.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn default_server_bind() -> String {
    "127.0.0.1:8000".to_owned()
}

fn default_max_request_bytes() -> usize {
    256 * 1024
}

fn default_classifier_endpoint() -> String {
    "https://aiproxy.sanand.workers.dev/openai/v1/chat/completions".to_owned()
}

fn default_classifier_model() -> String {
    "gpt-4o-mini".to_owned()
}

fn default_classifier_timeout_ms() -> u64 {
    30_000
}

fn default_sandbox_root() -> PathBuf {
    PathBuf::from("./data")
}

fn default_logical_prefix() -> String {
    "data".to_owned()
}

fn default_handler_timeout_ms() -> u64 {
    120_000
}

fn default_serialize_writes() -> bool {
    true
}

fn default_allowed_script_urls() -> Vec<String> {
    vec![
        "https://raw.githubusercontent.com/sanand0/tools-in-data-science-public/tds-2025-01/project-1/datagen.py"
            .to_owned(),
    ]
}

fn default_script_runner() -> String {
    "uv".to_owned()
}

fn default_formatter_runner() -> String {
    "npx".to_owned()
}

fn default_scrape_max_pages() -> usize {
    20
}

fn default_http_timeout_ms() -> u64 {
    15_000
}

fn default_user_agent() -> String {
    format!("taskdesk-agent-rs/{}", env!("CARGO_PKG_VERSION"))
}
