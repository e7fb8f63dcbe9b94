use edge_inference::runner::StaticHardwareProbe;
use edge_inference::{
    Capability, EngineConfig, EngineSettings, InferenceEngine, InferenceRequest, RunnerSettings,
};
use futures::StreamExt;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn engine(dir: &std::path::Path) -> InferenceEngine {
    edge_inference::telemetry::init_test_tracing();
    let settings = EngineSettings::default().with_runner(
        "mock_llm",
        RunnerSettings {
            params: [("token_delay_ms".to_string(), json!(40))].into_iter().collect(),
            ..Default::default()
        },
    );
    InferenceEngine::builder(EngineConfig::with_models_dir(dir.join("models")))
        .probe(Arc::new(StaticHardwareProbe::none()))
        .settings(settings)
        .build()
        .unwrap()
}

#[tokio::test]
async fn uncancelled_stream_emits_five_partials_and_one_final() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());

    let request = InferenceRequest::new("full").with_input("prompt", "one two three four five");
    let results: Vec<_> = engine
        .process_stream(request, Capability::TextGeneration)
        .collect()
        .await;

    assert_eq!(results.len(), 6);
    assert!(results[..5].iter().all(|r| r.partial && r.error.is_none()));
    assert!(!results[5].partial);
    assert_eq!(results[5].text("text"), Some("one two three four five"));
    assert!(!engine.orchestrator().is_tracked("full"));
}

#[tokio::test]
async fn cancel_after_second_partial_stops_the_stream() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());

    let request = InferenceRequest::new("chat-1").with_input("prompt", "one two three four five");
    let mut stream = engine.process_stream(request, Capability::TextGeneration);

    let first = stream.next().await.unwrap();
    let second = stream.next().await.unwrap();
    assert!(first.partial && second.partial);
    assert!(engine.orchestrator().is_tracked("chat-1"));

    assert!(engine.cancel("chat-1"));
    assert!(!engine.orchestrator().is_tracked("chat-1"));

    let rest = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .unwrap();
    assert!(rest.is_none());

    assert!(!engine.cancel("chat-1"));
    assert!(engine.orchestrator().active_requests().is_empty());
}

#[tokio::test]
async fn process_after_cancel_of_other_request_still_completes() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());

    let mut cancelled = engine.process_stream(
        InferenceRequest::new("a").with_input("prompt", "one two three"),
        Capability::TextGeneration,
    );
    cancelled.next().await.unwrap();
    assert!(engine.cancel("a"));

    let result = engine
        .process(
            InferenceRequest::new("b").with_input("prompt", "hello"),
            Capability::TextGeneration,
        )
        .await;
    assert!(result.is_success());
    assert_eq!(result.text("text"), Some("hello"));
}
