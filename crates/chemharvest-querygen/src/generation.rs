//! Chat-completion requests and answer parsing

use std::time::{Duration, Instant};

use chemharvest_core::stream;
use chemharvest_core::{CallError, CallResult, http_client};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::config::{Config, TEXT_PLACEHOLDER};

/// Outcome of one generation, stored per item in the result sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    pub question: String,
    /// Unparsed model answer
    pub raw_response: String,
    /// Thinking of a reasoning model, when it exposes any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    /// Round-trip time of a synchronous call; 0 for batch responses
    #[serde(default)]
    pub latency_ms: u64,
}

pub fn render_prompt(template: &str, text: &str) -> String {
    template.replace(TEXT_PLACEHOLDER, text)
}

fn question_of(value: &Value) -> Option<String> {
    value
        .get("question")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Split a leading `<think>...</think>` block off a model answer.
///
/// Returns the trimmed thinking (`None` when absent or empty) and the rest of
/// the answer. An unterminated block is left in place.
pub fn split_reasoning(answer: &str) -> (Option<&str>, &str) {
    let Some(inner) = answer.trim_start().strip_prefix("<think>") else {
        return (None, answer);
    };
    let Some(end) = inner.find("</think>") else {
        return (None, answer);
    };
    let thinking = inner[..end].trim();
    let rest = &inner[end + "</think>".len()..];
    ((!thinking.is_empty()).then_some(thinking), rest)
}

/// Pull the `question` field out of a model answer.
///
/// Accepts a bare JSON object, one inside a code fence, or one embedded in
/// surrounding prose (outermost braces). A leading thinking block is skipped
/// so braces inside it are never mistaken for the answer.
pub fn extract_question(answer: &str) -> Option<String> {
    let trimmed = split_reasoning(answer).1.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if let Some(q) = question_of(&value) {
            return Some(q);
        }
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    let value: Value = serde_json::from_str(&trimmed[start..=end]).ok()?;
    question_of(&value)
}

/// Turn a chat-completions response body into a [`Generation`].
///
/// An answer without a parseable `question` is item-fatal: repeating the
/// call is not expected to fix it.
pub fn parse_completion(body: &Value) -> CallResult<Generation> {
    let answer = body
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .ok_or_else(|| CallError::fatal("completion has no message content"))?;
    let (thinking, rest) = split_reasoning(answer);
    let question = extract_question(rest).ok_or_else(|| {
        let preview: String = rest.trim().chars().take(120).collect();
        CallError::fatal(format!("no question in model answer: {preview:?}"))
    })?;
    let reasoning = body
        .pointer("/choices/0/message/reasoning_content")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .or(thinking)
        .map(str::to_string);
    let usage = |key: &str| {
        body.pointer(&format!("/usage/{key}"))
            .and_then(Value::as_u64)
            .unwrap_or(0)
    };
    Ok(Generation {
        question,
        raw_response: answer.to_string(),
        reasoning,
        input_tokens: usage("prompt_tokens"),
        output_tokens: usage("completion_tokens"),
        latency_ms: 0,
    })
}

/// OpenAI-compatible chat-completions client.
#[derive(Debug, Clone)]
pub struct ChatClient {
    api_base: String,
    api_key: Option<String>,
    model: String,
    max_completion_tokens: u32,
    temperature: f64,
    timeout: Duration,
}

impl ChatClient {
    pub fn new(config: &Config) -> Self {
        Self {
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            max_completion_tokens: config.max_completion_tokens,
            temperature: config.temperature,
            timeout: config.sync.call_timeout,
        }
    }

    /// Request body for one prompt; `extra` fields are merged on top.
    pub fn request_body(&self, prompt: &str, extra: &Map<String, Value>) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "max_completion_tokens": self.max_completion_tokens,
            "temperature": self.temperature,
        });
        if let Value::Object(fields) = &mut body {
            for (k, v) in extra {
                fields.insert(k.clone(), v.clone());
            }
        }
        body
    }

    pub(crate) fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}/{}", self.api_base, path.trim_start_matches('/'))
    }

    /// One synchronous completion.
    pub fn complete(&self, prompt: &str) -> CallResult<Generation> {
        let request = self
            .authorize(http_client().post(self.url("chat/completions")))
            .json(&self.request_body(prompt, &Map::new()));
        let start = Instant::now();
        let body = stream::send_json(request, self.timeout)?;
        let mut generation = parse_completion(&body)?;
        generation.latency_ms = start.elapsed().as_millis() as u64;
        Ok(generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn question_from_plain_fenced_and_embedded_json() {
        assert_eq!(
            extract_question(r#"{"question": "What is pKa?"}"#).as_deref(),
            Some("What is pKa?")
        );
        let fenced = "```json\n{\"question\": \"Why?\"}\n```";
        assert_eq!(extract_question(fenced).as_deref(), Some("Why?"));
        let prose = "Sure! Here it is: {\"question\": \"How?\"} Hope that helps.";
        assert_eq!(extract_question(prose).as_deref(), Some("How?"));
    }

    #[test]
    fn answers_without_question_rejected() {
        assert_eq!(extract_question("I cannot help with that."), None);
        assert_eq!(extract_question(r#"{"answer": "x"}"#), None);
        assert_eq!(extract_question(r#"{"question": null}"#), None);
        assert_eq!(extract_question("} {"), None);
    }

    #[test]
    fn thinking_block_skipped_before_extraction() {
        let answer = "<think>The set {a, b} matters here.</think>\n{\"question\": \"What is X?\"}";
        assert_eq!(extract_question(answer).as_deref(), Some("What is X?"));
        assert_eq!(
            split_reasoning(answer),
            (Some("The set {a, b} matters here."), "\n{\"question\": \"What is X?\"}")
        );
        assert_eq!(split_reasoning("  <think> </think>{}"), (None, "{}"));
        // Unterminated thinking is not stripped
        assert_eq!(split_reasoning("<think>{\"question\": 1"), (None, "<think>{\"question\": 1"));
        assert_eq!(extract_question("<think>only thoughts</think>"), None);
    }

    #[test]
    fn completion_reasoning_from_block_or_field() {
        let inline = json!({
            "choices": [{"message": {
                "content": "<think>\nCheck {units}.\n</think>\n{\"question\": \"Q?\"}"
            }}]
        });
        let g = parse_completion(&inline).unwrap();
        assert_eq!(g.question, "Q?");
        assert_eq!(g.reasoning.as_deref(), Some("Check {units}."));
        assert!(g.raw_response.starts_with("<think>"));

        let field = json!({
            "choices": [{"message": {
                "content": "{\"question\": \"Q?\"}",
                "reasoning_content": "Thought about it."
            }}]
        });
        let g = parse_completion(&field).unwrap();
        assert_eq!(g.reasoning.as_deref(), Some("Thought about it."));

        let plain = json!({"choices": [{"message": {"content": "{\"question\": \"Q?\"}"}}]});
        assert_eq!(parse_completion(&plain).unwrap().reasoning, None);
    }

    #[test]
    fn completion_usage_and_fatal_answers() {
        let body = json!({
            "choices": [{"message": {"content": "{\"question\": \"Q?\"}"}}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 5}
        });
        let g = parse_completion(&body).unwrap();
        assert_eq!(g.question, "Q?");
        assert_eq!((g.input_tokens, g.output_tokens), (12, 5));

        let bad = json!({"choices": [{"message": {"content": "no json here"}}]});
        assert!(!parse_completion(&bad).unwrap_err().is_retryable());
    }

    #[test]
    fn prompt_and_extra_params() {
        assert_eq!(render_prompt("Ask about: {text}", "benzene"), "Ask about: benzene");
        let client = ChatClient::new(&Config::default());
        let mut extra = Map::new();
        extra.insert("reasoning_effort".into(), json!("low"));
        let body = client.request_body("hi", &extra);
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["messages"][0]["content"], "hi");
        assert_eq!(body["reasoning_effort"], "low");
    }
}
