//! Leaf operations. Each handler receives an owned argument record whose
//! paths have already passed the sandbox, and answers with a
//! `{status, message, ...payload}` document.

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde_json::{json, Map, Value};
use tokio::process::Command;

use crate::config::OperationsConfig;
use crate::llm::{truncate_text, ChatClient};
use crate::sandbox::{SandboxGuard, SandboxedPath};

pub mod count_weekday;
pub mod extract_card;
pub mod extract_email;
pub mod fetch_api;
pub mod format_file;
pub mod generate_data;
pub mod markdown_index;
pub mod recent_logs;
pub mod scrape;
pub mod sort_contacts;

pub use count_weekday::CountWeekdayArgs;
pub use extract_card::ExtractCardArgs;
pub use extract_email::ExtractEmailArgs;
pub use fetch_api::FetchApiArgs;
pub use format_file::FormatFileArgs;
pub use generate_data::GenerateDataArgs;
pub use markdown_index::MarkdownIndexArgs;
pub use recent_logs::RecentLogsArgs;
pub use scrape::{DataFormat, ScrapeArgs};
pub use sort_contacts::SortContactsArgs;

/// Shared, read-only state handed to every handler.
pub struct OperationContext {
    pub guard: SandboxGuard,
    pub http: reqwest::Client,
    pub chat: ChatClient,
    pub settings: OperationsConfig,
}

impl OperationContext {
    pub fn new(guard: SandboxGuard, chat: ChatClient, settings: OperationsConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(settings.http_timeout_ms.max(500)))
            .user_agent(settings.user_agent.clone())
            .build()
            .context("failed creating operations HTTP client")?;
        Ok(Self {
            guard,
            http,
            chat,
            settings,
        })
    }
}

/// A fully validated request for exactly one handler.
#[derive(Debug, Clone)]
pub enum OperationCall {
    GenerateData(GenerateDataArgs),
    FormatFile(FormatFileArgs),
    CountWeekday(CountWeekdayArgs),
    SortContacts(SortContactsArgs),
    WriteRecentLogs(RecentLogsArgs),
    IndexMarkdownTitles(MarkdownIndexArgs),
    FetchApiData(FetchApiArgs),
    ScrapeWebsite(ScrapeArgs),
    ExtractEmailSender(ExtractEmailArgs),
    ExtractCardNumber(ExtractCardArgs),
}

impl OperationCall {
    pub async fn execute(self, ctx: &OperationContext) -> Result<Value> {
        match self {
            Self::GenerateData(args) => generate_data::run(ctx, args).await,
            Self::FormatFile(args) => format_file::run(ctx, args).await,
            Self::CountWeekday(args) => count_weekday::run(args).await,
            Self::SortContacts(args) => sort_contacts::run(args).await,
            Self::WriteRecentLogs(args) => recent_logs::run(ctx, args).await,
            Self::IndexMarkdownTitles(args) => markdown_index::run(ctx, args).await,
            Self::FetchApiData(args) => fetch_api::run(ctx, args).await,
            Self::ScrapeWebsite(args) => scrape::run(ctx, args).await,
            Self::ExtractEmailSender(args) => extract_email::run(ctx, args).await,
            Self::ExtractCardNumber(args) => extract_card::run(ctx, args).await,
        }
    }
}

pub(crate) fn succeeded(message: impl Into<String>, fields: Value) -> Value {
    let mut doc = Map::new();
    doc.insert("status".to_owned(), json!("success"));
    doc.insert("message".to_owned(), Value::String(message.into()));
    if let Value::Object(fields) = fields {
        doc.extend(fields);
    }
    Value::Object(doc)
}

pub(crate) fn failed(message: impl Into<String>) -> Value {
    json!({ "status": "error", "message": message.into() })
}

pub(crate) async fn is_file(path: &SandboxedPath) -> bool {
    tokio::fs::metadata(path.as_path())
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}

pub(crate) async fn is_dir(path: &SandboxedPath) -> bool {
    tokio::fs::metadata(path.as_path())
        .await
        .map(|meta| meta.is_dir())
        .unwrap_or(false)
}

pub(crate) async fn write_output(path: &SandboxedPath, contents: impl AsRef<[u8]>) -> Result<()> {
    if let Some(parent) = path.as_path().parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed creating output directory for {path}"))?;
    }
    tokio::fs::write(path.as_path(), contents)
        .await
        .with_context(|| format!("failed writing {path}"))
}

#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl ProcessOutcome {
    /// stdout and stderr combined, truncated for messages.
    pub fn summary(&self, max_len: usize) -> String {
        let aggregated = if self.stderr.trim().is_empty() {
            self.stdout.trim().to_owned()
        } else if self.stdout.trim().is_empty() {
            self.stderr.trim().to_owned()
        } else {
            format!("{}\n{}", self.stdout.trim(), self.stderr.trim())
        };
        truncate_text(&aggregated, max_len)
    }
}

/// Runs `program` with an explicit argv (no shell) in `cwd`.
pub async fn run_process(program: &str, args: &[String], cwd: &Path) -> Result<ProcessOutcome> {
    let started = Instant::now();
    let output = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("failed running `{program}` in {}", cwd.display()))?;

    Ok(ProcessOutcome {
        success: output.status.success(),
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        duration_ms: started.elapsed().as_millis() as u64,
    })
}
