use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::catalog::{tool_schemas, OperationSpec};
use crate::error::{PipelineError, PipelineErrorCode, PipelineResult};
use crate::llm::ChatClient;

/// One classifier decision: an operation name plus its raw, untrusted
/// arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub operation_name: String,
    pub arguments: Map<String, Value>,
}

impl Plan {
    pub fn new(operation_name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            operation_name: operation_name.into(),
            arguments,
        }
    }
}

#[async_trait]
pub trait PlanResolver: Send + Sync {
    async fn resolve(&self, task: &str, catalog: &[OperationSpec]) -> PipelineResult<Plan>;
}

pub struct ChatCompletionsResolver {
    chat: ChatClient,
}

impl ChatCompletionsResolver {
    pub fn new(chat: ChatClient) -> Self {
        Self { chat }
    }
}

#[async_trait]
impl PlanResolver for ChatCompletionsResolver {
    async fn resolve(&self, task: &str, catalog: &[OperationSpec]) -> PipelineResult<Plan> {
        let messages = vec![json!({ "role": "user", "content": task })];
        let response = self
            .chat
            .complete(messages, &tool_schemas(catalog))
            .await
            .map_err(|err| PipelineError::classification_unavailable(format!("{err:#}")))?;
        let plan = parse_plan(&response, catalog)?;
        debug!(
            operation = %plan.operation_name,
            arguments = plan.arguments.len(),
            "classifier selected operation"
        );
        Ok(plan)
    }
}

/// Extracts the selected operation from a chat-completions response. Accepts
/// `tool_calls` and the legacy `function_call` shape.
pub fn parse_plan(response: &Value, catalog: &[OperationSpec]) -> PipelineResult<Plan> {
    let message = response
        .pointer("/choices/0/message")
        .and_then(Value::as_object)
        .ok_or_else(|| {
            PipelineError::classification_unavailable("classifier response carries no message")
        })?;

    let function = match message.get("tool_calls").and_then(Value::as_array) {
        Some(calls) if !calls.is_empty() => {
            if calls.len() > 1 {
                warn!(
                    tool_calls = calls.len(),
                    "classifier returned several tool calls; using the first"
                );
            }
            calls[0].get("function")
        }
        _ => message.get("function_call"),
    };
    let Some(function) = function.and_then(Value::as_object) else {
        return Err(PipelineError::new(
            PipelineErrorCode::NoOperationSelected,
            "classifier did not select an operation",
        ));
    };

    let name = function
        .get("name")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default();
    if !catalog.iter().any(|spec| spec.name() == name) {
        return Err(PipelineError::unknown_operation(name));
    }

    let arguments = parse_arguments(function.get("arguments"))?;
    Ok(Plan::new(name, arguments))
}

fn parse_arguments(raw: Option<&Value>) -> PipelineResult<Map<String, Value>> {
    let value = match raw {
        None | Some(Value::Null) => return Ok(Map::new()),
        Some(Value::String(text)) if text.trim().is_empty() => return Ok(Map::new()),
        Some(Value::String(text)) => serde_json::from_str::<Value>(text).map_err(|err| {
            PipelineError::classification_unavailable(format!(
                "classifier returned malformed arguments: {err}"
            ))
        })?,
        Some(other) => other.clone(),
    };
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(PipelineError::invalid_argument(
            "operation arguments must be a JSON object",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::catalog;
    use crate::config::ClassifierConfig;
    use crate::llm::testing::serve_once;

    fn resolver_for(base: String) -> ChatCompletionsResolver {
        let chat = ChatClient::new(&ClassifierConfig {
            endpoint: base,
            model: "gpt-4o-mini".to_owned(),
            api_key: Some("tok".to_owned()),
            timeout_ms: 5_000,
        })
        .expect("chat client");
        ChatCompletionsResolver::new(chat)
    }

    fn tool_call_response(name: &str, arguments: &str) -> String {
        json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": name, "arguments": arguments}
                    }]
                }
            }]
        })
        .to_string()
    }

    #[tokio::test]
    async fn resolves_tool_call_into_plan() {
        let body = tool_call_response(
            "count_weekday",
            r#"{"input_file_path":"/data/dates.txt","weekday_to_count":"Wednesday"}"#,
        );
        let (base, captured, server) = serve_once("200 OK", "application/json", body);
        let plan = resolver_for(base)
            .resolve("count wednesdays in /data/dates.txt", catalog())
            .await
            .expect("plan");
        server.join().expect("join server");

        assert_eq!(plan.operation_name, "count_weekday");
        assert_eq!(
            plan.arguments.get("weekday_to_count"),
            Some(&json!("Wednesday"))
        );
        let request_text = captured.lock().expect("lock captured").clone();
        assert!(request_text.contains("\"tool_choice\":\"auto\""));
        assert!(request_text.contains("\"parallel_tool_calls\":false"));
        assert!(request_text.contains("count wednesdays in /data/dates.txt"));
    }

    #[tokio::test]
    async fn upstream_failure_is_classification_unavailable() {
        let (base, _captured, server) = serve_once(
            "503 Service Unavailable",
            "text/plain",
            "overloaded".to_owned(),
        );
        let err = resolver_for(base)
            .resolve("sort contacts", catalog())
            .await
            .expect_err("503");
        server.join().expect("join server");
        assert_eq!(err.code, PipelineErrorCode::ClassificationUnavailable);
        assert!(err.message.contains("status=503"));
    }

    #[tokio::test]
    async fn non_json_body_is_classification_unavailable() {
        let (base, _captured, server) =
            serve_once("200 OK", "text/html", "<html>proxy login</html>".to_owned());
        let err = resolver_for(base)
            .resolve("sort contacts", catalog())
            .await
            .expect_err("html");
        server.join().expect("join server");
        assert_eq!(err.code, PipelineErrorCode::ClassificationUnavailable);
    }

    #[test]
    fn plain_text_answer_selects_nothing() {
        let response = json!({
            "choices": [{"message": {"role": "assistant", "content": "I cannot help with that."}}]
        });
        let err = parse_plan(&response, catalog()).expect_err("no tool");
        assert_eq!(err.code, PipelineErrorCode::NoOperationSelected);
    }

    #[test]
    fn unknown_name_is_rejected() {
        let response: Value =
            serde_json::from_str(&tool_call_response("delete_everything", "{}")).expect("json");
        let err = parse_plan(&response, catalog()).expect_err("unknown");
        assert_eq!(err.code, PipelineErrorCode::UnknownOperation);
        assert!(err.message.contains("delete_everything"));
    }

    #[test]
    fn legacy_function_call_is_accepted() {
        let response = json!({
            "choices": [{"message": {"function_call": {
                "name": "sort_contacts",
                "arguments": "{\"input_file_path\":\"/data/contacts.json\",\"output_file_path\":\"/data/contacts-sorted.json\",\"sort_attributes\":[\"last_name\",\"first_name\"]}"
            }}}]
        });
        let plan = parse_plan(&response, catalog()).expect("plan");
        assert_eq!(plan.operation_name, "sort_contacts");
        assert_eq!(
            plan.arguments.get("sort_attributes"),
            Some(&json!(["last_name", "first_name"]))
        );
    }

    #[test]
    fn malformed_arguments_are_classification_unavailable() {
        let response: Value =
            serde_json::from_str(&tool_call_response("count_weekday", "{\"input_file_path\":"))
                .expect("json");
        let err = parse_plan(&response, catalog()).expect_err("truncated");
        assert_eq!(err.code, PipelineErrorCode::ClassificationUnavailable);

        let response: Value =
            serde_json::from_str(&tool_call_response("count_weekday", "[1,2]")).expect("json");
        let err = parse_plan(&response, catalog()).expect_err("array");
        assert_eq!(err.code, PipelineErrorCode::InvalidArgument);
    }

    #[test]
    fn first_of_several_tool_calls_wins() {
        let response = json!({
            "choices": [{"message": {"tool_calls": [
                {"function": {"name": "format_file", "arguments": "{\"file_path\":\"/data/format.md\"}"}},
                {"function": {"name": "count_weekday", "arguments": "{}"}}
            ]}}]
        });
        let plan = parse_plan(&response, catalog()).expect("plan");
        assert_eq!(plan.operation_name, "format_file");
    }
}
