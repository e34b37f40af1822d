use std::time::SystemTime;

use anyhow::{Context, Result};
use globset::Glob;
use serde_json::{json, Value};
use tracing::warn;

use super::{failed, is_dir, succeeded, write_output, OperationContext};
use crate::sandbox::SandboxedPath;

#[derive(Debug, Clone)]
pub struct RecentLogsArgs {
    pub directory: SandboxedPath,
    pub file_pattern: String,
    pub output: SandboxedPath,
    pub num_files: usize,
    pub lines_per_file: usize,
}

pub async fn run(ctx: &OperationContext, args: RecentLogsArgs) -> Result<Value> {
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

    let mut candidates: Vec<(SystemTime, SandboxedPath)> = Vec::new();
    let mut entries = tokio::fs::read_dir(args.directory.as_path())
        .await
        .with_context(|| format!("failed listing {}", args.directory))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("failed reading entry in {}", args.directory))?
    {
        let name = entry.file_name();
        if !matcher.is_match(&name) {
            continue;
        }
        let path = match ctx.guard.adopt(&entry.path()) {
            Ok(path) => path,
            Err(err) => {
                warn!(path = %entry.path().display(), "skipping log file outside sandbox: {err}");
                continue;
            }
        };
        let meta = tokio::fs::metadata(path.as_path())
            .await
            .with_context(|| format!("failed reading metadata for {path}"))?;
        if !meta.is_file() {
            continue;
        }
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        candidates.push((modified, path));
    }

    if candidates.is_empty() {
        return Ok(failed(format!(
            "no log files match `{}` in {}",
            args.file_pattern, args.directory
        )));
    }

    // Newest first; name breaks ties so equal mtimes stay deterministic.
    candidates.sort_by(|left, right| right.0.cmp(&left.0).then_with(|| left.1.cmp(&right.1)));
    candidates.truncate(args.num_files);

    let mut collected = String::new();
    let mut total_lines = 0_usize;
    for (_, path) in &candidates {
        let bytes = tokio::fs::read(path.as_path())
            .await
            .with_context(|| format!("failed reading {path}"))?;
        let text = String::from_utf8_lossy(&bytes);
        for line in text.lines().take(args.lines_per_file) {
            collected.push_str(line);
            collected.push('\n');
            total_lines += 1;
        }
    }

    write_output(&args.output, collected).await?;
    Ok(succeeded(
        format!(
            "wrote {total_lines} lines from {} files to {}",
            candidates.len(),
            args.output
        ),
        json!({ "files_processed": candidates.len(), "total_lines": total_lines }),
    ))
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use super::*;
    use crate::operations::testing::{context, seed, status};

    fn set_mtime(path: &SandboxedPath, secs: u64) {
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(path.as_path())
            .expect("open for mtime");
        file.set_modified(UNIX_EPOCH + Duration::from_secs(secs))
            .expect("set mtime");
    }

    #[tokio::test]
    async fn takes_first_lines_of_newest_files() {
        let ctx = context("recent-logs");
        let old = seed(&ctx, "logs/old.log", "old first\nold second\n");
        let mid = seed(&ctx, "logs/mid.log", "mid first\nmid second\n");
        let new = seed(&ctx, "logs/new.log", "new first\nnew second\n");
        seed(&ctx, "logs/notes.txt", "not a log\n");
        set_mtime(&old, 1_000);
        set_mtime(&mid, 2_000);
        set_mtime(&new, 3_000);

        let output = ctx.guard.resolve("/data/logs-recent.txt").expect("output");
        let outcome = run(
            &ctx,
            RecentLogsArgs {
                directory: ctx.guard.resolve("/data/logs/").expect("dir"),
                file_pattern: "*.log".to_owned(),
                output: output.clone(),
                num_files: 2,
                lines_per_file: 1,
            },
        )
        .await
        .expect("run");

        assert_eq!(status(&outcome), "success");
        assert_eq!(outcome.get("files_processed"), Some(&json!(2)));
        assert_eq!(outcome.get("total_lines"), Some(&json!(2)));
        let written = std::fs::read_to_string(output.as_path()).expect("read output");
        assert_eq!(written, "new first\nmid first\n");
    }

    #[tokio::test]
    async fn no_matching_files_is_an_error_status() {
        let ctx = context("recent-logs-empty");
        seed(&ctx, "logs/readme.md", "# hi\n");
        let outcome = run(
            &ctx,
            RecentLogsArgs {
                directory: ctx.guard.resolve("logs").expect("dir"),
                file_pattern: "*.log".to_owned(),
                output: ctx.guard.resolve("out.txt").expect("output"),
                num_files: 10,
                lines_per_file: 1,
            },
        )
        .await
        .expect("run");
        assert_eq!(status(&outcome), "error");
    }
}
