use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use globset::{Glob, GlobMatcher};
use regex::Regex;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{failed, is_dir, succeeded, write_output, OperationContext};
use crate::sandbox::{SandboxGuard, SandboxedPath};

#[derive(Debug, Clone)]
pub struct MarkdownIndexArgs {
    pub directory: SandboxedPath,
    pub output: SandboxedPath,
    pub file_pattern: String,
    pub tag_pattern: String,
}

struct TitleRules {
    h1: Regex,
    any_heading: Regex,
    setext: bool,
}

impl TitleRules {
    fn new(tag_pattern: &str) -> Result<Self> {
        Ok(Self {
            h1: Regex::new(r"(?m)^#[ \t]+(.+?)[ \t#]*$").context("invalid H1 pattern")?,
            any_heading: Regex::new(r"(?m)^#{1,6}[ \t]+(.+?)[ \t#]*$")
                .context("invalid heading pattern")?,
            setext: tag_pattern.trim().starts_with('='),
        })
    }

    fn title(&self, content: &str) -> Option<String> {
        if let Some(found) = self.h1.captures(content) {
            return Some(found[1].trim().to_owned());
        }
        if self.setext {
            if let Some(title) = setext_title(content) {
                return Some(title);
            }
        }
        self.any_heading
            .captures(content)
            .map(|found| found[1].trim().to_owned())
    }
}

fn setext_title(content: &str) -> Option<String> {
    let lines = content.lines().collect::<Vec<_>>();
    lines.windows(2).find_map(|pair| {
        let text = pair[0].trim();
        let underline = pair[1].trim();
        (!text.is_empty() && !underline.is_empty() && underline.chars().all(|ch| ch == '='))
            .then(|| text.to_owned())
    })
}

pub async fn run(ctx: &OperationContext, args: MarkdownIndexArgs) -> Result<Value> {
    if !is_dir(&args.directory).await {
        return Ok(failed(format!(
            "input directory not found at {}",
            args.directory
        )));
    }
    let matcher = match Glob::new(&args.file_pattern) {
        Ok(glob) => glob.compile_matcher(),
        Err(err) => {
            return Ok(failed(format!(
                "invalid file pattern `{}`: {err}",
                args.file_pattern
            )))
        }
    };
    let rules = TitleRules::new(&args.tag_pattern)?;

    let files = collect_markdown_files(&ctx.guard, args.directory.as_path(), &matcher).await?;
    if files.is_empty() {
        return Ok(failed(format!(
            "no markdown files match `{}` in {}",
            args.file_pattern, args.directory
        )));
    }

    let mut index = BTreeMap::new();
    for file in &files {
        let bytes = tokio::fs::read(file.as_path())
            .await
            .with_context(|| format!("failed reading {file}"))?;
        let content = String::from_utf8_lossy(&bytes);
        let title = rules.title(&content).unwrap_or_else(|| {
            file.as_path()
                .file_stem()
                .and_then(|stem| stem.to_str())
                .unwrap_or_default()
                .to_owned()
        });
        index.insert(index_key(args.directory.as_path(), file.as_path()), title);
    }

    let rendered = serde_json::to_string_pretty(&index).context("failed serializing index")?;
    write_output(&args.output, rendered).await?;
    Ok(succeeded(
        format!(
            "indexed {} markdown files into {}",
            index.len(),
            args.output
        ),
        json!({ "files_processed": index.len() }),
    ))
}

/// Walks `root` depth-first, staying inside the sandbox. Directories are keyed
/// by canonical path so a symlink back to an ancestor is listed once.
async fn collect_markdown_files(
    guard: &SandboxGuard,
    root: &Path,
    matcher: &GlobMatcher,
) -> Result<Vec<SandboxedPath>> {
    let mut out = Vec::new();
    let mut visited = HashSet::from([root.to_path_buf()]);
    let mut stack = vec![root.to_path_buf()];

    while let Some(current) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&current)
            .await
            .with_context(|| format!("failed listing directory {}", current.display()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("failed reading entry in {}", current.display()))?
        {
            let path = entry.path();
            let adopted = match guard.adopt(&path) {
                Ok(adopted) => adopted,
                Err(err) => {
                    warn!(path = %path.display(), "skipping entry outside sandbox: {err}");
                    continue;
                }
            };
            let is_dir = tokio::fs::metadata(adopted.as_path())
                .await
                .map(|meta| meta.is_dir())
                .unwrap_or(false);
            if is_dir {
                let dir = PathBuf::from(adopted.as_path());
                if visited.insert(dir.clone()) {
                    stack.push(dir);
                } else {
                    debug!(path = %path.display(), "directory already walked");
                }
                continue;
            }
            if matcher.is_match(entry.file_name()) {
                out.push(adopted);
            }
        }
    }

    out.sort();
    out.dedup();
    Ok(out)
}

fn index_key(root: &Path, file: &Path) -> String {
    file.strip_prefix(root)
        .unwrap_or(file)
        .components()
        .map(|part| part.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
