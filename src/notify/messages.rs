//! JSON messages carried over the notification sockets

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// `{type:"progress", progress, message}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub progress: u8,
    pub message: String,
}

impl ProgressMessage {
    pub fn new(progress: u8, message: impl Into<String>) -> Self {
        Self {
            kind: "progress".to_string(),
            progress: progress.min(100),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// One field the operator is asked to fill in
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Input {
    pub name: String,
    #[serde(rename = "type")]
    pub input_type: String,
    pub placeholder: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
    pub required: bool,
    pub order: u32,
}

impl Input {
    pub fn text(name: &str, placeholder: &str) -> Self {
        Self {
            name: name.to_string(),
            input_type: "text".to_string(),
            placeholder: placeholder.to_string(),
            value: None,
            options: None,
            required: true,
            order: 0,
        }
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }
}

/// A prompt sent to the interactive client; `action` correlates the reply
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionMessage {
    #[serde(rename = "type")]
    pub severity: Severity,
    pub action: String,
    pub title: String,
    pub message: String,
    pub inputs: Vec<Input>,
}

/// `{type:"response", action, data}` sent back by the interactive client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionResponse {
    #[serde(rename = "type")]
    pub kind: String,
    pub action: String,
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
}

impl ActionResponse {
    /// Answers flattened to strings; non-string JSON values keep their JSON text
    pub fn into_answers(self) -> HashMap<String, String> {
        self.data
            .into_iter()
            .map(|(name, value)| {
                let text = match value {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                (name, text)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_wire_format() {
        let json = serde_json::to_value(ProgressMessage::new(40, "Building image")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "progress", "progress": 40, "message": "Building image"})
        );
    }

    #[test]
    fn test_action_wire_format() {
        let msg = ActionMessage {
            severity: Severity::Critical,
            action: "expose".into(),
            title: "Exposed port".into(),
            message: "Which port does the app listen on?".into(),
            inputs: vec![Input::text("port", "3000").with_value("3000")],
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "critical");
        assert_eq!(json["inputs"][0]["type"], "text");
        assert_eq!(json["inputs"][0]["value"], "3000");
        assert!(json["inputs"][0].get("options").is_none());
    }

    #[test]
    fn test_response_answers_are_strings() {
        let response: ActionResponse = serde_json::from_str(
            r#"{"type":"response","action":"expose","data":{"port":8080,"name":"web"}}"#,
        )
        .unwrap();
        let answers = response.into_answers();
        assert_eq!(answers["port"], "8080");
        assert_eq!(answers["name"], "web");
    }
}
