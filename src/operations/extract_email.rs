use anyhow::{Context, Result};
use serde_json::{json, Value};

use super::{failed, is_file, succeeded, write_output, OperationContext};
use crate::sandbox::SandboxedPath;

#[derive(Debug, Clone)]
pub struct ExtractEmailArgs {
    pub input: SandboxedPath,
    pub output: SandboxedPath,
    pub instruction: String,
}

pub async fn run(ctx: &OperationContext, args: ExtractEmailArgs) -> Result<Value> {
    if !is_file(&args.input).await {
        return Ok(failed(format!("input file not found at {}", args.input)));
    }
    let bytes = tokio::fs::read(args.input.as_path())
        .await
        .with_context(|| format!("failed reading {}", args.input))?;
    let email_text = String::from_utf8_lossy(&bytes);

    let messages = vec![
        json!({
            "role": "system",
            "content": "You process email text. Answer with the requested value only.",
        }),
        json!({
            "role": "user",
            "content": format!("Given the following text, {}:\n\n{email_text}", args.instruction.trim()),
        }),
    ];
    let answer = match ctx.chat.ask(messages).await {
        Ok(answer) => answer,
        Err(err) => return Ok(failed(format!("language model request failed: {err:#}"))),
    };

    write_output(&args.output, &answer).await?;
    Ok(succeeded(
        format!("result written to {}", args.output),
        json!({ "output_file": args.output.relative() }),
    ))
}
