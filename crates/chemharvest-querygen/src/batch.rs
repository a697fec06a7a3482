//! OpenAI-style batch API backend
//!
//! Each shard becomes `requests/shard_NNNN.jsonl` (one chat-completions
//! request per line, `custom_id` = item id), uploaded with purpose `batch`
//! and turned into a batch job. Results come back as a JSONL output file
//! whose lines carry the same `custom_id`.

use std::path::PathBuf;
use std::time::Duration;

use chemharvest_core::stream;
use chemharvest_core::{
    BatchBackend, BatchResponse, BatchStatus, CallError, CallResult, ItemId, Shard, http_client,
    write_atomic,
};
use reqwest::multipart::{Form, Part};
use serde_json::{Map, Value, json};

use crate::generation::{ChatClient, Generation, parse_completion};

const ENDPOINT: &str = "/v1/chat/completions";
const COMPLETION_WINDOW: &str = "24h";

/// Batch backend speaking the OpenAI files + batches protocol.
#[derive(Debug, Clone)]
pub struct OpenAiBatch {
    client: ChatClient,
    requests_dir: PathBuf,
    params: Map<String, Value>,
    timeout: Duration,
}

impl OpenAiBatch {
    pub fn new(
        client: ChatClient,
        requests_dir: PathBuf,
        params: Map<String, Value>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            requests_dir,
            params,
            timeout,
        }
    }

    /// Request file contents for a shard of prompts
    pub fn request_lines(&self, shard: &Shard<String>) -> Vec<u8> {
        let mut out = Vec::new();
        for item in &shard.items {
            let line = json!({
                "custom_id": item.id.as_str(),
                "method": "POST",
                "url": ENDPOINT,
                "body": self.client.request_body(&item.payload, &self.params),
            });
            out.extend_from_slice(line.to_string().as_bytes());
            out.push(b'\n');
        }
        out
    }

    fn get_json(&self, path: &str) -> CallResult<Value> {
        let request = self.client.authorize(http_client().get(self.client.url(path)));
        Ok(stream::send_json(request, self.timeout)?)
    }

    fn get_text(&self, path: &str) -> CallResult<String> {
        let request = self.client.authorize(http_client().get(self.client.url(path)));
        Ok(stream::send_text(request, self.timeout)?)
    }

    fn upload(&self, file_name: &str, bytes: Vec<u8>) -> CallResult<String> {
        let form = Form::new()
            .text("purpose", "batch")
            .part("file", Part::bytes(bytes).file_name(file_name.to_string()));
        let request = self
            .client
            .authorize(http_client().post(self.client.url("files")))
            .multipart(form);
        let body = stream::send_json(request, self.timeout)?;
        string_field(&body, "id")
    }

    fn create(&self, input_file_id: &str) -> CallResult<String> {
        let request = self
            .client
            .authorize(http_client().post(self.client.url("batches")))
            .json(&json!({
                "input_file_id": input_file_id,
                "endpoint": ENDPOINT,
                "completion_window": COMPLETION_WINDOW,
            }));
        let body = stream::send_json(request, self.timeout)?;
        string_field(&body, "id")
    }
}

fn string_field(body: &Value, key: &str) -> CallResult<String> {
    body.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| CallError::fatal(format!("response has no '{key}'")))
}

/// Map a remote batch status onto the handle lifecycle.
pub fn map_status(status: &str) -> BatchStatus {
    match status {
        "validating" => BatchStatus::Submitted,
        "completed" => BatchStatus::Succeeded,
        "failed" | "expired" | "cancelled" => BatchStatus::Failed,
        // in_progress, finalizing, cancelling and anything newer
        _ => BatchStatus::Running,
    }
}

/// Decode one line of a batch output or error file.
pub fn parse_output_line(line: &str) -> Option<BatchResponse<Generation>> {
    let value: Value = serde_json::from_str(line).ok()?;
    let id = ItemId::from(value.get("custom_id")?.as_str()?);
    let outcome = match value.get("error").filter(|e| !e.is_null()) {
        Some(err) => Err(err
            .get("message")
            .and_then(Value::as_str)
            .map_or_else(|| err.to_string(), str::to_string)),
        None => {
            let status = value.pointer("/response/status_code").and_then(Value::as_u64);
            let body = value.pointer("/response/body").unwrap_or(&Value::Null);
            match status {
                Some(200) => parse_completion(body).map_err(|e| e.reason().to_string()),
                Some(code) => Err(format!("HTTP {code}: {}", body)),
                None => Err("response without status".to_string()),
            }
        }
    };
    Some(BatchResponse { id, outcome })
}

impl BatchBackend for OpenAiBatch {
    type Payload = String;
    type Output = Generation;

    fn submit(&self, shard: &Shard<String>) -> CallResult<String> {
        let file_name = format!("shard_{:04}.jsonl", shard.shard_id);
        let bytes = self.request_lines(shard);
        std::fs::create_dir_all(&self.requests_dir)
            .and_then(|()| write_atomic(&self.requests_dir.join(&file_name), &bytes))
            .map_err(|e| CallError::fatal(format!("{file_name}: {e}")))?;
        let file_id = self.upload(&file_name, bytes)?;
        log::debug!("{file_name}: uploaded as {file_id}");
        self.create(&file_id)
    }

    fn poll(&self, remote_job_id: &str) -> CallResult<BatchStatus> {
        let body = self.get_json(&format!("batches/{remote_job_id}"))?;
        let status = string_field(&body, "status")?;
        log::debug!("{remote_job_id}: {status}");
        Ok(map_status(&status))
    }

    fn download(&self, remote_job_id: &str) -> CallResult<Vec<BatchResponse<Generation>>> {
        let batch = self.get_json(&format!("batches/{remote_job_id}"))?;
        let mut responses = Vec::new();
        for key in ["output_file_id", "error_file_id"] {
            let Some(file_id) = batch.get(key).and_then(Value::as_str) else {
                continue;
            };
            let text = self.get_text(&format!("files/{file_id}/content"))?;
            let mut unreadable = 0usize;
            for line in text.lines().filter(|l| !l.trim().is_empty()) {
                match parse_output_line(line) {
                    Some(r) => responses.push(r),
                    None => unreadable += 1,
                }
            }
            if unreadable > 0 {
                log::warn!("{remote_job_id}: {unreadable} unreadable lines in {key}");
            }
        }
        Ok(responses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use chemharvest_core::WorkItem;

    #[test]
    fn statuses() {
        assert_eq!(map_status("validating"), BatchStatus::Submitted);
        assert_eq!(map_status("in_progress"), BatchStatus::Running);
        assert_eq!(map_status("finalizing"), BatchStatus::Running);
        assert_eq!(map_status("completed"), BatchStatus::Succeeded);
        assert_eq!(map_status("expired"), BatchStatus::Failed);
    }

    #[test]
    fn request_lines_carry_custom_ids_and_params() {
        let mut params = Map::new();
        params.insert("temperature".into(), json!(1.0));
        let backend = OpenAiBatch::new(
            ChatClient::new(&Config::default()),
            PathBuf::from("requests"),
            params,
            Duration::from_secs(5),
        );
        let shard = Shard {
            shard_id: 3,
            items: vec![
                WorkItem::new("[\"a\"]", "prompt a".to_string()),
                WorkItem::new("[\"b\"]", "prompt b".to_string()),
            ],
        };
        let text = String::from_utf8(backend.request_lines(&shard)).unwrap();
        let lines: Vec<Value> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["custom_id"], "[\"b\"]");
        assert_eq!(lines[0]["url"], ENDPOINT);
        assert_eq!(lines[0]["body"]["temperature"], 1.0);
        assert_eq!(lines[0]["body"]["messages"][0]["content"], "prompt a");
    }

    #[test]
    fn output_lines() {
        let ok = r#"{"custom_id": "x", "response": {"status_code": 200, "body": {"choices": [{"message": {"content": "{\"question\": \"Q\"}"}}]}}, "error": null}"#;
        let r = parse_output_line(ok).unwrap();
        assert_eq!(r.id.as_str(), "x");
        assert_eq!(r.outcome.unwrap().question, "Q");

        let failed = r#"{"custom_id": "y", "response": null, "error": {"code": "server_error", "message": "boom"}}"#;
        assert_eq!(parse_output_line(failed).unwrap().outcome, Err("boom".to_string()));

        let http = r#"{"custom_id": "z", "response": {"status_code": 400, "body": {}}}"#;
        assert!(parse_output_line(http).unwrap().outcome.is_err());

        assert!(parse_output_line("{not json").is_none());
    }
}
