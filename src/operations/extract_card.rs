use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::{json, Value};

use super::{failed, is_file, succeeded, write_output, OperationContext};
use crate::sandbox::SandboxedPath;

#[derive(Debug, Clone)]
pub struct ExtractCardArgs {
    pub image: SandboxedPath,
    pub output: SandboxedPath,
    pub instruction: String,
}

pub async fn run(ctx: &OperationContext, args: ExtractCardArgs) -> Result<Value> {
    if !is_file(&args.image).await {
        return Ok(failed(format!("input image not found at {}", args.image)));
    }
    let bytes = tokio::fs::read(args.image.as_path())
        .await
        .with_context(|| format!("failed reading {}", args.image))?;
    let data_url = format!(
        "data:{};base64,{}",
        image_mime(&args.image),
        STANDARD.encode(&bytes)
    );

    let messages = vec![json!({
        "role": "user",
        "content": [
            {"type": "text", "text": format!("{} from the given image. Reply with the number only.", args.instruction.trim())},
            {"type": "image_url", "image_url": {"url": data_url}},
        ],
    })];
    let answer = match ctx.chat.ask(messages).await {
        Ok(answer) => answer,
        Err(err) => return Ok(failed(format!("language model request failed: {err:#}"))),
    };

    let digits = answer
        .chars()
        .filter(char::is_ascii_digit)
        .collect::<String>();
    if digits.is_empty() {
        return Ok(failed("the model answer contained no card number"));
    }

    write_output(&args.output, &digits).await?;
    Ok(succeeded(
        format!("card number extracted and written to {}", args.output),
        json!({ "digits": digits, "output_file": args.output.relative() }),
    ))
}

fn image_mime(path: &SandboxedPath) -> &'static str {
    let extension = path
        .as_path()
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "image/png",
    }
}
