// Unit tests for the context injector's schema and priority plumbing.
//
// UNIT UNDER TEST: injector::ContextInjector (schema/alias/lock surface)
// and VectorStoreManager::resolve_embedding_priority
//
// BUSINESS RESPONSIBILITY:
//   - Locked parameters vanish from the exposed tool schema
//   - Aliases rename parameters without collisions
//   - Embedding priority: explicit list, then agreeing store defaults,
//     else distinguished errors
//
// Retrieval behavior end to end (locks overriding model arguments against
// a live store) is covered in tests/vector_lock_tests.rs.

use crate::defaults::VectorDefaults;
use crate::injector::ContextInjector;
use crate::registry::PluginRegistry;
use crate::spec::VectorContextConfig;
use crate::vector::VectorStoreManager;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn write_store(root: &Path, id: &str, priority: Option<Value>) {
    let dir = root.join("vector");
    std::fs::create_dir_all(&dir).unwrap();
    let mut manifest = json!({
        "id": id,
        "kind": "qdrant-rest",
        "config": { "url": "http://localhost:6333" },
        "defaultCollection": "docs",
    });
    if let Some(priority) = priority {
        manifest["embeddingPriority"] = priority;
    }
    std::fs::write(dir.join(format!("{id}.json")), manifest.to_string()).unwrap();
}

fn manager_with_stores(stores: &[(&str, Option<Value>)]) -> (TempDir, Arc<VectorStoreManager>) {
    let tmp = TempDir::new().unwrap();
    for (id, priority) in stores {
        write_store(tmp.path(), id, priority.clone());
    }
    let registry = Arc::new(PluginRegistry::new(tmp.path()).unwrap());
    let manager = Arc::new(VectorStoreManager::new(registry));
    (tmp, manager)
}

fn config(raw: Value) -> VectorContextConfig {
    serde_json::from_value(raw).unwrap()
}

fn default_priority() -> Value {
    json!([{ "provider": "embedder" }])
}

#[test]
fn test_explicit_priority_wins_over_store_defaults() {
    let (_tmp, manager) = manager_with_stores(&[("a", Some(default_priority()))]);
    let explicit = vec![crate::spec::EmbeddingPriorityEntry {
        provider: "other".to_string(),
        model: None,
    }];
    let resolved = manager
        .resolve_embedding_priority(Some(&explicit), &["a".to_string()])
        .unwrap();
    assert_eq!(resolved[0].provider, "other");
}

#[test]
fn test_agreeing_store_defaults_are_used() {
    let (_tmp, manager) = manager_with_stores(&[
        ("a", Some(default_priority())),
        ("b", Some(default_priority())),
    ]);
    let resolved = manager
        .resolve_embedding_priority(None, &["a".to_string(), "b".to_string()])
        .unwrap();
    assert_eq!(resolved[0].provider, "embedder");
}

#[test]
fn test_disagreeing_store_defaults_fail() {
    let (_tmp, manager) = manager_with_stores(&[
        ("a", Some(default_priority())),
        ("b", Some(json!([{ "provider": "someone-else" }]))),
    ]);
    let err = manager
        .resolve_embedding_priority(None, &["a".to_string(), "b".to_string()])
        .unwrap_err();
    assert!(err
        .to_string()
        .contains("different default embedding priorities"));
}

#[test]
fn test_no_priority_anywhere_fails() {
    let (_tmp, manager) = manager_with_stores(&[("a", None)]);
    let err = manager
        .resolve_embedding_priority(None, &["a".to_string()])
        .unwrap_err();
    assert!(err.to_string().contains("no embedding priority configured"));
}

fn injector(raw_config: Value) -> (TempDir, ContextInjector) {
    let (tmp, manager) = manager_with_stores(&[("a", Some(default_priority()))]);
    let injector = ContextInjector::new(
        manager,
        config(raw_config),
        &["a".to_string()],
        VectorDefaults::default(),
    )
    .unwrap();
    (tmp, injector)
}

#[test]
fn test_locked_parameters_are_omitted_from_schema() {
    let (_tmp, injector) = injector(json!({
        "mode": "tool",
        "locks": { "store": "a", "topK": 3 },
    }));
    let tool = injector.tool();
    let properties = tool.parameters["properties"].as_object().unwrap();

    assert!(properties.contains_key("query"));
    assert!(!properties.contains_key("store"));
    assert!(!properties.contains_key("topK"));
    assert!(properties.contains_key("filter"));
}

#[test]
fn test_aliases_rename_and_hide_parameters() {
    let (_tmp, injector) = injector(json!({
        "mode": "tool",
        "toolSchemaOverrides": {
            "params": { "query": "q", "filter": null },
        },
    }));
    let tool = injector.tool();
    let properties = tool.parameters["properties"].as_object().unwrap();

    assert!(properties.contains_key("q"));
    assert!(!properties.contains_key("query"));
    assert!(!properties.contains_key("filter"));
    assert_eq!(tool.parameters["required"], json!(["q"]));
}

#[test]
fn test_alias_collision_with_canonical_name_is_rejected() {
    let (_tmp, manager) = manager_with_stores(&[("a", Some(default_priority()))]);
    let result = ContextInjector::new(
        manager,
        config(json!({
            "mode": "tool",
            "toolSchemaOverrides": { "params": { "query": "store" } },
        })),
        &["a".to_string()],
        VectorDefaults::default(),
    );
    assert!(result.is_err());
}

#[test]
fn test_duplicate_alias_targets_are_rejected() {
    let (_tmp, manager) = manager_with_stores(&[("a", Some(default_priority()))]);
    let result = ContextInjector::new(
        manager,
        config(json!({
            "mode": "tool",
            "toolSchemaOverrides": {
                "params": { "query": "needle", "collection": "needle" },
            },
        })),
        &["a".to_string()],
        VectorDefaults::default(),
    );
    assert!(result.is_err());
}

#[test]
fn test_unknown_parameter_override_is_rejected() {
    let (_tmp, manager) = manager_with_stores(&[("a", Some(default_priority()))]);
    let result = ContextInjector::new(
        manager,
        config(json!({
            "mode": "tool",
            "toolSchemaOverrides": { "params": { "mystery": "m" } },
        })),
        &["a".to_string()],
        VectorDefaults::default(),
    );
    assert!(result.is_err());
}

#[test]
fn test_vector_context_requires_a_store() {
    let (_tmp, manager) = manager_with_stores(&[("a", Some(default_priority()))]);
    let result = ContextInjector::new(
        manager,
        config(json!({ "mode": "tool" })),
        &[],
        VectorDefaults::default(),
    );
    assert!(result.is_err());
}
