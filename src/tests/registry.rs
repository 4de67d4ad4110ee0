// Unit tests for the plugin registry.
//
// UNIT UNDER TEST: registry::PluginRegistry
//
// BUSINESS RESPONSIBILITY:
//   - Lazy, idempotent per-category manifest loading
//   - Malformed manifests skipped with a warning, never fatal
//   - Overlay-before-root precedence, first declaration wins
//   - ${NAME} header interpolation at load time

use crate::registry::PluginRegistry;
use serde_json::json;
use serial_test::serial;
use std::path::Path;
use tempfile::TempDir;

fn write_manifest(root: &Path, category: &str, file: &str, body: serde_json::Value) {
    let dir = root.join(category);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(file), body.to_string()).unwrap();
}

fn provider_manifest(id: &str) -> serde_json::Value {
    json!({
        "id": id,
        "kind": "openai-chat",
        "endpoint": { "url": "http://localhost/v1/chat/completions" },
    })
}

#[test]
fn test_missing_root_fails_construction() {
    let tmp = TempDir::new().unwrap();
    let missing = tmp.path().join("nope");
    let err = PluginRegistry::new(&missing).unwrap_err();
    assert_eq!(err.code(), "manifest_error");
}

#[test]
fn test_unknown_id_is_a_manifest_error() {
    let tmp = TempDir::new().unwrap();
    let registry = PluginRegistry::new(tmp.path()).unwrap();
    let err = registry.get_provider("ghost").unwrap_err();
    assert_eq!(err.code(), "manifest_error");
}

#[test]
fn test_manifests_load_lazily_and_cache() {
    let tmp = TempDir::new().unwrap();
    write_manifest(tmp.path(), "providers", "acme.json", provider_manifest("acme"));
    let registry = PluginRegistry::new(tmp.path()).unwrap();

    let first = registry.get_provider("acme").unwrap();
    // Changes after the first load are not observed for the registry
    // lifetime.
    write_manifest(tmp.path(), "providers", "late.json", provider_manifest("late"));
    assert!(registry.get_provider("late").is_err());
    let second = registry.get_provider("acme").unwrap();
    assert_eq!(first.id, second.id);
}

#[test]
fn test_malformed_manifest_is_skipped_not_fatal() {
    let tmp = TempDir::new().unwrap();
    write_manifest(tmp.path(), "providers", "good.json", provider_manifest("good"));
    std::fs::write(tmp.path().join("providers/broken.json"), "{ not json").unwrap();

    let registry = PluginRegistry::new(tmp.path()).unwrap();
    assert!(registry.get_provider("good").is_ok());
}

#[test]
fn test_non_json_files_are_ignored() {
    let tmp = TempDir::new().unwrap();
    write_manifest(tmp.path(), "providers", "good.json", provider_manifest("good"));
    std::fs::write(tmp.path().join("providers/readme.md"), "notes").unwrap();
    std::fs::write(tmp.path().join("providers/.hidden.json"), "{}").unwrap();

    let registry = PluginRegistry::new(tmp.path()).unwrap();
    assert!(registry.get_provider("good").is_ok());
}

#[test]
fn test_duplicate_id_keeps_first_declaration() {
    let tmp = TempDir::new().unwrap();
    let mut first = provider_manifest("acme");
    first["endpoint"]["url"] = json!("http://first");
    let mut second = provider_manifest("acme");
    second["endpoint"]["url"] = json!("http://second");
    // Files load in name order.
    write_manifest(tmp.path(), "providers", "a.json", first);
    write_manifest(tmp.path(), "providers", "b.json", second);

    let registry = PluginRegistry::new(tmp.path()).unwrap();
    assert_eq!(registry.get_provider("acme").unwrap().endpoint.url, "http://first");
}

#[test]
fn test_overlay_wins_over_root() {
    let root = TempDir::new().unwrap();
    let overlay = TempDir::new().unwrap();
    let mut base = provider_manifest("acme");
    base["endpoint"]["url"] = json!("http://root");
    let mut over = provider_manifest("acme");
    over["endpoint"]["url"] = json!("http://overlay");
    write_manifest(root.path(), "providers", "acme.json", base);
    write_manifest(overlay.path(), "providers", "acme.json", over);

    let registry = PluginRegistry::with_overlay(root.path(), Some(overlay.path())).unwrap();
    assert_eq!(
        registry.get_provider("acme").unwrap().endpoint.url,
        "http://overlay"
    );
}

#[test]
#[serial]
fn test_env_tokens_interpolate_in_headers() {
    std::env::set_var("COORD_TEST_KEY", "k-123");
    let tmp = TempDir::new().unwrap();
    write_manifest(
        tmp.path(),
        "providers",
        "acme.json",
        json!({
            "id": "acme",
            "kind": "openai-chat",
            "endpoint": {
                "url": "http://localhost/v1/chat/completions",
                "headers": {
                    "authorization": "Bearer ${COORD_TEST_KEY}",
                    "x-missing": "${COORD_TEST_UNSET_VAR}",
                },
            },
        }),
    );

    let registry = PluginRegistry::new(tmp.path()).unwrap();
    let manifest = registry.get_provider("acme").unwrap();
    assert_eq!(manifest.endpoint.headers["authorization"], "Bearer k-123");
    // Unresolved tokens remain literal.
    assert_eq!(manifest.endpoint.headers["x-missing"], "${COORD_TEST_UNSET_VAR}");
    std::env::remove_var("COORD_TEST_KEY");
}

#[test]
fn test_route_files_accept_single_rule_or_array() {
    let tmp = TempDir::new().unwrap();
    write_manifest(
        tmp.path(),
        "processes",
        "one.json",
        json!({
            "match": { "type": "exact", "pattern": "lookup" },
            "invoke": { "kind": "http", "url": "http://localhost/tool" },
        }),
    );
    write_manifest(
        tmp.path(),
        "processes",
        "two.json",
        json!([
            {
                "match": { "type": "prefix", "pattern": "fs_" },
                "invoke": { "kind": "mcp", "server": "fs" },
            },
            {
                "match": { "type": "glob", "pattern": "math.*" },
                "invoke": { "kind": "module", "path": "builtin/math" },
            }
        ]),
    );

    let registry = PluginRegistry::new(tmp.path()).unwrap();
    let routes = registry.get_process_routes().unwrap();
    assert_eq!(routes.len(), 3);
}

#[test]
fn test_unknown_compat_kind_is_a_manifest_error() {
    let tmp = TempDir::new().unwrap();
    let registry = PluginRegistry::new(tmp.path()).unwrap();
    assert_eq!(
        registry.get_compat("martian-chat").unwrap_err().code(),
        "manifest_error"
    );
    assert!(registry.get_compat("openai-chat").is_ok());
    assert!(registry.get_vector_store_compat("qdrant-rest").is_ok());
}
