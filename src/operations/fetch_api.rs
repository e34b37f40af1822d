use anyhow::{Context, Result};
use reqwest::Method;
use serde_json::{json, Map, Value};
use url::Url;

use super::{failed, succeeded, write_output, OperationContext};
use crate::llm::truncate_text;
use crate::sandbox::SandboxedPath;

#[derive(Debug, Clone)]
pub struct FetchApiArgs {
    pub url: String,
    pub method: String,
    pub output: SandboxedPath,
    pub headers: Map<String, Value>,
    pub params: Map<String, Value>,
}

pub async fn run(ctx: &OperationContext, args: FetchApiArgs) -> Result<Value> {
    let url = match Url::parse(args.url.trim()) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => url,
        _ => return Ok(failed(format!("`{}` is not an http(s) URL", args.url))),
    };
    let method = match Method::from_bytes(args.method.trim().to_ascii_uppercase().as_bytes()) {
        Ok(method) => method,
        Err(_) => return Ok(failed(format!("`{}` is not an HTTP method", args.method))),
    };

    let mut request = ctx.http.request(method.clone(), url.clone());
    for (name, value) in &args.headers {
        request = request.header(name.as_str(), scalar_text(value));
    }
    if !args.params.is_empty() {
        let query = args
            .params
            .iter()
            .map(|(name, value)| (name.clone(), scalar_text(value)))
            .collect::<Vec<_>>();
        request = request.query(&query);
    }

    let response = match request.send().await {
        Ok(response) => response,
        Err(err) => return Ok(failed(format!("{method} {url} failed: {err}"))),
    };
    let status = response.status();
    let body = match response.text().await {
        Ok(body) => body,
        Err(err) => return Ok(failed(format!("failed reading response from {url}: {err}"))),
    };
    if !status.is_success() {
        return Ok(failed(format!(
            "{method} {url} answered with status {}: {}",
            status.as_u16(),
            truncate_text(&body, 200)
        )));
    }

    let parsed = serde_json::from_str::<Value>(&body).ok();
    let rendered = match &parsed {
        Some(parsed) => {
            serde_json::to_string_pretty(parsed).context("failed rendering API response")?
        }
        None => body,
    };
    write_output(&args.output, &rendered).await?;

    Ok(succeeded(
        format!("saved {method} {url} response to {}", args.output),
        json!({
            "status_code": status.as_u16(),
            "output_file": args.output.relative(),
            "json": parsed.is_some(),
        }),
    ))
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
