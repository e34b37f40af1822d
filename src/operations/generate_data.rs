use anyhow::{Context, Result};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use url::Url;

use super::{failed, run_process, succeeded, write_output, OperationContext};

#[derive(Debug, Clone)]
pub struct GenerateDataArgs {
    pub file_url: String,
    pub argument: String,
    pub command: Option<String>,
    pub is_url_remote: Option<String>,
    pub is_remote_safe: Option<String>,
}

pub async fn run(ctx: &OperationContext, args: GenerateDataArgs) -> Result<Value> {
    let url = match Url::parse(args.file_url.trim()) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => url,
        _ => {
            return Ok(failed(format!(
                "`{}` is not an http(s) URL",
                args.file_url
            )))
        }
    };
    // Trust comes from configuration only; the classifier's claim is logged, not used.
    if !is_allowed(&ctx.settings.allowed_script_urls, &url) {
        warn!(
            url = %url,
            claimed_remote = args.is_url_remote.as_deref().unwrap_or("unset"),
            claimed_safe = args.is_remote_safe.as_deref().unwrap_or("unset"),
            "refusing script from unapproved source"
        );
        return Ok(failed(format!("script URL {url} is not from an approved source")));
    }

    let response = match ctx.http.get(url.clone()).send().await {
        Ok(response) => response,
        Err(err) => return Ok(failed(format!("failed downloading script from {url}: {err}"))),
    };
    if !response.status().is_success() {
        return Ok(failed(format!(
            "failed downloading script from {url}: status {}",
            response.status().as_u16()
        )));
    }
    let body = match response.bytes().await {
        Ok(body) => body,
        Err(err) => return Ok(failed(format!("failed downloading script from {url}: {err}"))),
    };
    let digest = format!("{:x}", Sha256::digest(&body));

    let script = ctx
        .guard
        .resolve(&format!("datagen-{}.py", &digest[..12]))
        .context("failed placing script inside sandbox")?;
    write_output(&script, &body).await?;
    info!(url = %url, sha256 = %digest, command = ?args.command, "running data generation script");

    let argv = vec![
        "run".to_owned(),
        script.as_path().to_string_lossy().to_string(),
        args.argument.clone(),
    ];
    let runner = &ctx.settings.script_runner;
    let outcome = run_process(runner, &argv, ctx.guard.root()).await;
    if let Err(err) = tokio::fs::remove_file(script.as_path()).await {
        warn!(path = %script, "failed removing downloaded script: {err}");
    }

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(err) => return Ok(failed(format!("{err:#}"))),
    };
    info!(
        exit_code = ?outcome.exit_code,
        duration_ms = outcome.duration_ms,
        "data generation script finished"
    );
    if !outcome.success {
        return Ok(failed(format!(
            "script exited with {}: {}",
            outcome
                .exit_code
                .map_or_else(|| "a signal".to_owned(), |code| format!("code {code}")),
            outcome.summary(400)
        )));
    }

    Ok(succeeded(
        format!("ran data generation script with argument {}", args.argument),
        json!({
            "output": outcome.stdout,
            "script_sha256": digest,
            "duration_ms": outcome.duration_ms,
        }),
    ))
}

fn is_allowed(allowlist: &[String], url: &Url) -> bool {
    allowlist
        .iter()
        .filter_map(|entry| Url::parse(entry.trim()).ok())
        .any(|allowed| allowed == *url)
}
