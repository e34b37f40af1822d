use anyhow::{Context, Result};
use serde_json::{json, Value};

use super::{failed, is_file, succeeded, write_output};
use crate::sandbox::SandboxedPath;

#[derive(Debug, Clone)]
pub struct SortContactsArgs {
    pub input: SandboxedPath,
    pub output: SandboxedPath,
    pub sort_attributes: Vec<String>,
}

pub async fn run(args: SortContactsArgs) -> Result<Value> {
    if !is_file(&args.input).await {
        return Ok(failed(format!("input file not found at {}", args.input)));
    }
    let text = tokio::fs::read_to_string(args.input.as_path())
        .await
        .with_context(|| format!("failed reading {}", args.input))?;

    let parsed = match serde_json::from_str::<Value>(&text) {
        Ok(parsed) => parsed,
        Err(err) => return Ok(failed(format!("invalid JSON in {}: {err}", args.input))),
    };
    let Value::Array(mut contacts) = parsed else {
        return Ok(failed(format!(
            "{} must contain an array of contacts",
            args.input
        )));
    };
    if let Some(index) = contacts.iter().position(|contact| !contact.is_object()) {
        return Ok(failed(format!("contact at index {index} is not an object")));
    }

    contacts.sort_by_cached_key(|contact| sort_key(contact, &args.sort_attributes));

    let rendered =
        serde_json::to_string_pretty(&contacts).context("failed serializing sorted contacts")?;
    write_output(&args.output, rendered).await?;
    Ok(succeeded(
        format!(
            "sorted {} contacts by {} and wrote the result to {}",
            contacts.len(),
            args.sort_attributes.join(", "),
            args.output
        ),
        json!({ "count": contacts.len() }),
    ))
}

fn sort_key(contact: &Value, attributes: &[String]) -> Vec<String> {
    attributes
        .iter()
        .map(|attribute| match contact.get(attribute) {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(text)) => text.to_lowercase(),
            Some(other) => other.to_string().to_lowercase(),
        })
        .collect()
}
