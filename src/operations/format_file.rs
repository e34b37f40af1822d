use anyhow::Result;
use serde_json::{json, Value};

use super::{failed, is_file, run_process, succeeded, OperationContext};
use crate::sandbox::SandboxedPath;

#[derive(Debug, Clone)]
pub struct FormatFileArgs {
    pub file: SandboxedPath,
    pub command: Option<String>,
    pub is_prettier: String,
    pub prettier_version: String,
}

pub async fn run(ctx: &OperationContext, args: FormatFileArgs) -> Result<Value> {
    let names_prettier = args
        .command
        .as_deref()
        .is_none_or(|command| command.to_ascii_lowercase().contains("prettier"));
    if !args.is_prettier.trim().eq_ignore_ascii_case("true") || !names_prettier {
        return Ok(failed("the requested command does not use prettier"));
    }
    let version = args.prettier_version.trim();
    if !is_valid_version(version) {
        return Ok(failed(format!("`{version}` is not a valid prettier version")));
    }
    if !is_file(&args.file).await {
        return Ok(failed(format!("file not found at {}", args.file)));
    }

    let argv = vec![
        "--yes".to_owned(),
        format!("prettier@{version}"),
        "--write".to_owned(),
        args.file.as_path().to_string_lossy().to_string(),
    ];
    let runner = &ctx.settings.formatter_runner;
    let outcome = match run_process(runner, &argv, ctx.guard.root()).await {
        Ok(outcome) => outcome,
        Err(err) => return Ok(failed(format!("{err:#}"))),
    };
    if !outcome.success {
        return Ok(failed(format!(
            "error formatting {} using prettier@{version}: {}",
            args.file,
            outcome.summary(400)
        )));
    }

    Ok(succeeded(
        format!(
            "file {} formatted successfully using prettier@{version}",
            args.file
        ),
        json!({ "output": outcome.stdout }),
    ))
}

/// Versions and dist-tags only; the value ends up in an argv slot.
fn is_valid_version(version: &str) -> bool {
    !version.is_empty()
        && version.len() <= 64
        && !version.starts_with('-')
        && version
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_' | '^' | '~'))
}
