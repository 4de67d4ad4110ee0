//! Lock enforcement and retrieval plumbing for the vector surface.

mod common;

use common::*;
use llm_coordinator::injector::ContextInjector;
use llm_coordinator::{
    Defaults, PluginRegistry, VectorCoordinator, VectorOperation, VectorStoreManager,
};
use serde_json::{json, Value};
use std::sync::Arc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn embedding_response() -> Value {
    json!({
        "data": [{ "index": 0, "embedding": [0.1, 0.2, 0.3] }],
        "model": "emb-1",
        "usage": { "prompt_tokens": 2, "total_tokens": 2 },
    })
}

fn search_response() -> Value {
    json!({
        "result": [
            { "id": 1, "score": 0.93, "payload": { "text": "hello from the store" } },
            { "id": 2, "score": 0.41, "payload": { "text": "weak hit" } },
        ],
    })
}

/// Plugin root with stores `a` and `b` (separate mock backends) plus an
/// embedding provider.
async fn vector_fixture() -> (tempfile::TempDir, MockServer, MockServer, MockServer) {
    let store_a = MockServer::start().await;
    let store_b = MockServer::start().await;
    let embedder = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(embedding_response()))
        .mount(&embedder)
        .await;
    for store in [&store_a, &store_b] {
        Mock::given(method("POST"))
            .and(path("/collections/docs/points/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(search_response()))
            .mount(store)
            .await;
    }

    let plugins = tempfile::TempDir::new().unwrap();
    for (id, store) in [("a", &store_a), ("b", &store_b)] {
        write_manifest(
            plugins.path(),
            "vector",
            &format!("{id}.json"),
            json!({
                "id": id,
                "kind": "qdrant-rest",
                "config": { "url": store.uri() },
                "defaultCollection": "docs",
                "embeddingPriority": [{ "provider": "embedder" }],
            }),
        );
    }
    write_manifest(
        plugins.path(),
        "embeddings",
        "embedder.json",
        json!({
            "id": "embedder",
            "kind": "openai-embeddings",
            "endpoint": { "url": format!("{}/v1/embeddings", embedder.uri()) },
            "model": "emb-1",
        }),
    );

    (plugins, store_a, store_b, embedder)
}

#[tokio::test]
async fn test_locks_override_model_arguments() {
    let (plugins, store_a, store_b, _embedder) = vector_fixture().await;
    let registry = Arc::new(PluginRegistry::new(plugins.path()).unwrap());
    let manager = Arc::new(VectorStoreManager::new(registry));

    let config = serde_json::from_value(json!({
        "mode": "tool",
        "stores": ["a", "b"],
        "locks": { "store": "a", "topK": 3 },
    }))
    .unwrap();
    let injector = ContextInjector::new(
        manager.clone(),
        config,
        &["a".to_string(), "b".to_string()],
        Defaults::default().vector,
    )
    .unwrap();

    // The model claims store b, topK 100, and its own filter.
    let result = injector
        .handle_tool_call(json!({
            "query": "q",
            "store": "b",
            "topK": 100,
            "filter": { "must": [{ "key": "lang", "match": { "value": "en" } }] },
        }))
        .await
        .unwrap();

    // Locked store wins: b never queried.
    assert!(store_b.received_requests().await.unwrap().is_empty());
    let requests = store_a.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);

    let payload: Value = serde_json::from_slice(&requests[0].body).unwrap();
    // Locked topK wins over the model's claim; the unlocked filter passes
    // through from the arguments.
    assert_eq!(payload["limit"], 3);
    assert_eq!(
        payload["filter"]["must"][0]["key"],
        json!("lang"),
    );

    let text = result["text"].as_str().unwrap();
    assert!(text.starts_with("Found 2 results:"), "got: {text}");
    assert!(text.contains("(score: 0.930) hello from the store"));
    manager.close().await;
}

#[tokio::test]
async fn test_empty_results_render_the_no_results_message() {
    let (plugins, store_a, _store_b, _embedder) = vector_fixture().await;
    store_a.reset().await;
    Mock::given(method("POST"))
        .and(path("/collections/docs/points/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": [] })))
        .mount(&store_a)
        .await;

    let registry = Arc::new(PluginRegistry::new(plugins.path()).unwrap());
    let manager = Arc::new(VectorStoreManager::new(registry));
    let config = serde_json::from_value(json!({ "mode": "tool", "stores": ["a"] })).unwrap();
    let injector = ContextInjector::new(
        manager.clone(),
        config,
        &["a".to_string()],
        Defaults::default().vector,
    )
    .unwrap();

    let result = injector
        .handle_tool_call(json!({ "query": "nothing here" }))
        .await
        .unwrap();
    assert_eq!(
        result["text"],
        json!("No results found for query: \"nothing here\"")
    );
    manager.close().await;
}

#[tokio::test]
async fn test_search_failure_is_rendered_in_band() {
    let (plugins, store_a, _store_b, _embedder) = vector_fixture().await;
    store_a.reset().await;
    Mock::given(method("POST"))
        .and(path("/collections/docs/points/search"))
        .respond_with(ResponseTemplate::new(500).set_body_string("backend down"))
        .mount(&store_a)
        .await;

    let registry = Arc::new(PluginRegistry::new(plugins.path()).unwrap());
    let manager = Arc::new(VectorStoreManager::new(registry));
    let config = serde_json::from_value(json!({ "mode": "tool", "stores": ["a"] })).unwrap();
    let injector = ContextInjector::new(
        manager.clone(),
        config,
        &["a".to_string()],
        Defaults::default().vector,
    )
    .unwrap();

    let result = injector.handle_tool_call(json!({ "query": "q" })).await.unwrap();
    assert!(result["text"]
        .as_str()
        .unwrap()
        .starts_with("Vector search failed:"));
    manager.close().await;
}

#[tokio::test]
async fn test_vector_coordinator_query_and_upsert() {
    let (plugins, store_a, _store_b, _embedder) = vector_fixture().await;
    Mock::given(method("PUT"))
        .and(path("/collections/docs/points"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": {} })))
        .mount(&store_a)
        .await;

    let registry = Arc::new(PluginRegistry::new(plugins.path()).unwrap());
    let coordinator = VectorCoordinator::new(registry, Defaults::default());

    let upserted = coordinator
        .run(VectorOperation::Upsert {
            store: "a".to_string(),
            collection: None,
            points: vec![serde_json::from_value(json!({
                "id": "doc-1",
                "vector": [0.1, 0.2, 0.3],
                "payload": { "text": "hello" },
            }))
            .unwrap()],
        })
        .await
        .unwrap();
    assert_eq!(upserted["upserted"], 1);

    let queried = coordinator
        .run(VectorOperation::Query {
            store: "a".to_string(),
            collection: None,
            query: Some("hello".to_string()),
            vector: None,
            top_k: Some(2),
            filter: None,
            score_threshold: None,
            embedding_priority: None,
        })
        .await
        .unwrap();
    let results = queried["results"].as_array().unwrap();
    assert_eq!(results.len(), 2);
    assert!(results[0]["score"].as_f64().unwrap() > 0.9);

    coordinator.close().await;
}

#[tokio::test]
async fn test_vector_search_tool_message_is_plain_text_on_the_wire() {
    // The model calls vector_search; the follow-up request's tool message
    // must carry the rendered "Found K results..." text, not the tool's
    // JSON result envelope.
    let (plugins, _store_a, _store_b, _embedder) = vector_fixture().await;
    let llm = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(SequenceResponder::new(vec![
            ResponseTemplate::new(200).set_body_json(chat_tool_call_response(
                "call_1",
                "vector_search",
                json!({ "query": "hello" }),
            )),
            ResponseTemplate::new(200).set_body_json(chat_text_response("answered")),
        ]))
        .mount(&llm)
        .await;
    write_manifest(
        plugins.path(),
        "providers",
        "acme.json",
        provider_manifest("acme", &llm.uri(), "/v1/chat/completions"),
    );
    let router = build_test_router(
        plugins.path(),
        test_config(),
        llm_coordinator::AuthConfig::disabled(),
        Arc::new(llm_coordinator::ModuleToolRegistry::new()),
    );

    let spec = json!({
        "messages": [{ "role": "user", "content": [{ "type": "text", "text": "hi" }] }],
        "llmPriority": [{ "provider": "acme", "model": "acme-large" }],
        "vectorStores": ["a"],
        "vectorContext": { "mode": "tool" },
        "retryDelaysMs": [],
    });
    let (status, body) = response_json(post_json(&router, "/run", &spec).await).await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["content"][0]["text"], "answered");

    let requests = llm.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    let follow_up: Value = serde_json::from_slice(&requests[1].body).unwrap();
    let tool_message = follow_up["messages"]
        .as_array()
        .unwrap()
        .iter()
        .find(|m| m["role"] == "tool")
        .expect("a tool message in the follow-up request");
    let content = tool_message["content"].as_str().unwrap();
    assert!(content.starts_with("Found 2 results:"), "got: {content}");
    assert!(content.contains("(score: 0.930) hello from the store"));
    assert!(
        !content.trim_start().starts_with('{'),
        "tool message leaked a JSON envelope: {content}"
    );

    // The structured results still reach the caller through the records.
    let records = body["data"]["raw"]["toolResults"].as_array().unwrap();
    assert_eq!(records[0]["result"]["results"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_embeddings_run_route() {
    let (plugins, _store_a, _store_b, _embedder) = vector_fixture().await;
    let router = build_test_router(
        plugins.path(),
        test_config(),
        llm_coordinator::AuthConfig::disabled(),
        Arc::new(llm_coordinator::ModuleToolRegistry::new()),
    );

    let body = json!({ "inputs": ["hello"], "stores": ["a"] });
    let (status, response) =
        response_json(post_json(&router, "/vector/embeddings/run", &body).await).await;

    assert_eq!(status, 200);
    assert_eq!(response["data"]["model"], "emb-1");
    assert_eq!(response["data"]["dimensions"], 3);
    assert_eq!(response["data"]["vectors"].as_array().unwrap().len(), 1);
}
