use serde_json::{Map, Value};

use crate::error::{PipelineError, PipelineErrorCode};

const DEFAULT_SUCCESS_MESSAGE: &str = "operation completed";

/// The one shape every request resolves to.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultEnvelope {
    Success {
        message: String,
        payload: Map<String, Value>,
    },
    Error {
        code: PipelineErrorCode,
        message: String,
    },
}

impl ResultEnvelope {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Success { message, .. } | Self::Error { message, .. } => message,
        }
    }

    pub fn error_code(&self) -> Option<PipelineErrorCode> {
        match self {
            Self::Success { .. } => None,
            Self::Error { code, .. } => Some(*code),
        }
    }

    pub fn payload(&self) -> Option<&Map<String, Value>> {
        match self {
            Self::Success { payload, .. } => Some(payload),
            Self::Error { .. } => None,
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::Success { .. } => 200,
            Self::Error { code, .. } => code.http_status(),
        }
    }

    /// Flat `{status, message, ...payload}` document for the boundary.
    pub fn to_document(&self) -> Value {
        let mut doc = Map::new();
        match self {
            Self::Success { message, payload } => {
                doc.insert("status".to_owned(), Value::from("success"));
                doc.insert("message".to_owned(), Value::from(message.as_str()));
                for (key, value) in payload {
                    if key != "status" && key != "message" {
                        doc.insert(key.clone(), value.clone());
                    }
                }
            }
            Self::Error { message, .. } => {
                doc.insert("status".to_owned(), Value::from("error"));
                doc.insert("message".to_owned(), Value::from(message.as_str()));
            }
        }
        Value::Object(doc)
    }
}

impl From<PipelineError> for ResultEnvelope {
    fn from(err: PipelineError) -> Self {
        Self::Error {
            code: err.code,
            message: err.message,
        }
    }
}

pub fn normalize(outcome: Result<Value, PipelineError>) -> ResultEnvelope {
    let value = match outcome {
        Ok(value) => value,
        Err(err) => return err.into(),
    };

    let Value::Object(mut fields) = value else {
        return malformed();
    };
    let status = fields
        .remove("status")
        .and_then(|status| status.as_str().map(|text| text.trim().to_ascii_lowercase()));
    let message = fields
        .remove("message")
        .and_then(|message| message.as_str().map(ToOwned::to_owned));

    match status.as_deref() {
        Some("success") => ResultEnvelope::Success {
            message: message.unwrap_or_else(|| DEFAULT_SUCCESS_MESSAGE.to_owned()),
            payload: fields,
        },
        Some("error") => ResultEnvelope::Error {
            code: PipelineErrorCode::OperationFailed,
            message: message.unwrap_or_else(|| "operation failed".to_owned()),
        },
        _ => malformed(),
    }
}

fn malformed() -> ResultEnvelope {
    ResultEnvelope::Error {
        code: PipelineErrorCode::HandlerFault,
        message: "handler returned a malformed outcome".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn success_outcome_keeps_payload_fields() {
        let envelope = normalize(Ok(json!({
            "status": "success",
            "message": "counted",
            "count": 4
        })));
        assert!(envelope.is_success());
        assert_eq!(envelope.message(), "counted");
        assert_eq!(
            envelope.payload().and_then(|payload| payload.get("count")),
            Some(&json!(4))
        );
        assert_eq!(
            envelope.to_document(),
            json!({"status": "success", "message": "counted", "count": 4})
        );
    }

    #[test]
    fn error_outcome_drops_payload() {
        let envelope = normalize(Ok(json!({
            "status": "error",
            "message": "input file not found",
            "count": 9
        })));
        assert_eq!(envelope.error_code(), Some(PipelineErrorCode::OperationFailed));
        assert!(envelope.payload().is_none());
        assert_eq!(
            envelope.to_document(),
            json!({"status": "error", "message": "input file not found"})
        );
        assert_eq!(envelope.http_status(), 400);
    }

    #[test]
    fn shapeless_outcomes_become_handler_faults() {
        for value in [
            json!([1, 2, 3]),
            json!("done"),
            json!({"message": "no status"}),
            json!({"status": "maybe"}),
            json!({"status": 1}),
        ] {
            let envelope = normalize(Ok(value.clone()));
            assert_eq!(
                envelope.error_code(),
                Some(PipelineErrorCode::HandlerFault),
                "{value}"
            );
            assert_eq!(envelope.http_status(), 500);
        }
    }

    #[test]
    fn faults_carry_their_message() {
        let envelope = normalize(Err(PipelineError::sandbox_violation("nope")));
        assert_eq!(envelope.error_code(), Some(PipelineErrorCode::SandboxViolation));
        assert_eq!(envelope.message(), "nope");
    }

    #[test]
    fn success_without_message_uses_default() {
        let envelope = normalize(Ok(json!({"status": "SUCCESS"})));
        assert_eq!(envelope.message(), DEFAULT_SUCCESS_MESSAGE);
    }
}
