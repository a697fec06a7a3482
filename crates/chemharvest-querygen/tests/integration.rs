//! Query generation against a local mock of an OpenAI-compatible API

use std::time::Duration;

use chemharvest_core::{ItemId, JobConfig, ProgressContext, Shutdown};
use chemharvest_querygen::{Config, collect, run, submit};
use serde_json::{Value, json};
use tempfile::TempDir;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const INPUT: &str = "doc,body\nd1,alpha text\nd2,beta text\nd3,gamma text\n";

fn fast() -> JobConfig {
    JobConfig {
        worker_count: 2,
        request_delay: Duration::ZERO,
        cooldown_time: Duration::from_millis(10),
        max_retries: Some(1),
        call_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

fn config(dir: &TempDir, api_base: String) -> Config {
    let data_path = dir.path().join("input.csv");
    std::fs::write(&data_path, INPUT).unwrap();
    Config {
        data_path,
        root_dir: dir.path().join("job"),
        id_columns: vec!["doc".into()],
        text_column: "body".into(),
        prompt_template: "Ask about: {text}".into(),
        api_base,
        api_key: Some("sk-test".into()),
        sync: fast(),
        batch_calls: fast(),
        ..Default::default()
    }
}

fn completion(content: &str) -> Value {
    json!({
        "choices": [{"message": {"role": "assistant", "content": content}}],
        "usage": {"prompt_tokens": 10, "completion_tokens": 4}
    })
}

fn results(path: &std::path::Path) -> Vec<Vec<String>> {
    let mut reader = csv::Reader::from_path(path).unwrap();
    let mut rows: Vec<Vec<String>> = reader
        .records()
        .map(|r| r.unwrap().iter().map(str::to_string).collect())
        .collect();
    rows.sort();
    rows
}

#[test]
fn sync_run_isolates_unparseable_answers_and_resumes() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let server = rt.block_on(MockServer::start());
    rt.block_on(async {
        for (needle, answer) in [
            ("alpha", r#"{"question": "What is alpha?"}"#),
            ("beta", "I'd rather not."),
            ("gamma", "Sure: {\"question\": \"What is gamma?\"}"),
        ] {
            Mock::given(method("POST"))
                .and(path("/chat/completions"))
                .and(header("authorization", "Bearer sk-test"))
                .and(body_string_contains(needle))
                .respond_with(ResponseTemplate::new(200).set_body_json(completion(answer)))
                .mount(&server)
                .await;
        }
    });

    let dir = TempDir::new().unwrap();
    let cfg = config(&dir, server.uri());
    let summary = run(&cfg, &Shutdown::new(), &ProgressContext::new()).unwrap();
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.item_fatal.len(), 1);
    assert_eq!(summary.item_fatal[0].0, ItemId::composite(&["d2"]));
    assert_eq!(summary.exit_code(), 1);

    assert_eq!(
        results(&cfg.results_csv_path()),
        vec![
            vec!["d1".to_string(), "alpha text".into(), "What is alpha?".into()],
            vec!["d3".to_string(), "gamma text".into(), "What is gamma?".into()],
        ]
    );

    // Only the failed row is attempted again
    let again = run(&cfg, &Shutdown::new(), &ProgressContext::new()).unwrap();
    assert_eq!(again.skipped, 2);
    assert_eq!(again.attempted, 1);
}

#[test]
fn batch_submit_then_collect() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let server = rt.block_on(MockServer::start());

    let output: String = ["d3", "d1", "d2", "stray"]
        .iter()
        .map(|doc| {
            json!({
                "custom_id": ItemId::composite(&[*doc]).as_str(),
                "response": {
                    "status_code": 200,
                    "body": completion(&format!("{{\"question\": \"About {doc}?\"}}"))
                },
                "error": null
            })
            .to_string()
        })
        .collect::<Vec<_>>()
        .join("\n");

    rt.block_on(async {
        Mock::given(method("POST"))
            .and(path("/files"))
            .and(body_string_contains("Ask about: beta text"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "file-in"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/batches"))
            .and(body_string_contains("file-in"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "batch-1"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/batches/batch-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "batch-1",
                "status": "completed",
                "output_file_id": "file-out",
                "error_file_id": null
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/files/file-out/content"))
            .respond_with(ResponseTemplate::new(200).set_body_string(output))
            .mount(&server)
            .await;
    });

    let dir = TempDir::new().unwrap();
    let cfg = config(&dir, server.uri());

    let submitted = submit(&cfg, &Shutdown::new()).unwrap();
    assert_eq!(submitted.succeeded, 3);
    assert!(cfg.requests_dir().join("shard_0000.jsonl").exists());

    // Ids covered by a live handle are not submitted twice
    let resubmitted = submit(&cfg, &Shutdown::new()).unwrap();
    assert_eq!(resubmitted.skipped, 3);
    assert_eq!(resubmitted.attempted, 0);

    let collected = collect(&cfg, &Shutdown::new(), false).unwrap();
    assert_eq!(collected.succeeded, 3);
    assert!(collected.item_fatal.is_empty());

    assert_eq!(
        results(&cfg.results_csv_path()),
        vec![
            vec!["d1".to_string(), "alpha text".into(), "About d1?".into()],
            vec!["d2".to_string(), "beta text".into(), "About d2?".into()],
            vec!["d3".to_string(), "gamma text".into(), "About d3?".into()],
        ]
    );

    rt.block_on(server.verify());
}
