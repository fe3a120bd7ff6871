//! End-to-end tests: definitions on disk, a mock upstream, real HTTP through
//! the router.

use std::sync::Arc;

use axum_test::TestServer;
use serde_json::{json, Value};
use tempfile::TempDir;
use wiremock::matchers::{body_string, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use declarative_gateway::core::config::{load_definitions, Settings};
use declarative_gateway::engine::registry::OperationRegistry;
use declarative_gateway::gateway::server::build_router;
use declarative_gateway::hooks::HookFactory;
use declarative_gateway::plugins::ticket_validation::AuthorityCache;
use declarative_gateway::plugins::PluginFactory;

fn test_settings(definitions_dir: &TempDir) -> Settings {
    Settings {
        definitions_path: definitions_dir.path().to_path_buf(),
        bind_address: "127.0.0.1:0".parse().unwrap(),
        debug: false,
        cors_origin_pattern: Some(r"https://.*\.example\.com".to_string()),
        ticket_validation: None,
        completion_report_endpoint: None,
    }
}

fn server_for(definitions_dir: &TempDir) -> TestServer {
    let settings = test_settings(definitions_dir);
    let http = reqwest::Client::new();
    let plugins = PluginFactory::with_builtins(
        &settings,
        http.clone(),
        Arc::new(AuthorityCache::new()),
    );
    let hooks = Arc::new(HookFactory::with_builtins(&settings, http.clone()));
    let definitions = load_definitions(&settings.definitions_path);
    let router = build_router(
        &settings,
        definitions,
        Arc::new(OperationRegistry::with_builtins()),
        &plugins,
        hooks,
        http,
    )
    .unwrap();
    TestServer::new(router).unwrap()
}

fn write_definition(dir: &TempDir, name: &str, value: &Value) {
    std::fs::write(
        dir.path().join(name),
        serde_json::to_string_pretty(value).unwrap(),
    )
    .unwrap();
}

#[tokio::test]
async fn health_probe_answers_without_definitions() {
    let dir = TempDir::new().unwrap();
    let server = server_for(&dir);
    let response = server.get("/status").await;
    assert_eq!(response.status_code(), 200);
    assert_eq!(response.json::<Value>(), json!({"status": "ok"}));
}

#[tokio::test]
async fn every_response_carries_hardening_headers_and_request_id() {
    let dir = TempDir::new().unwrap();
    let server = server_for(&dir);
    let response = server.get("/status").await;

    for (name, expected) in [
        ("x-content-type-options", "nosniff"),
        ("x-frame-options", "DENY"),
        ("content-security-policy", "default-src 'none'"),
        ("cache-control", "no-store, no-cache, must-revalidate"),
    ] {
        assert_eq!(response.header(name), expected, "header {name}");
    }
    let request_id = response.header("x-request-id");
    let request_id = request_id.to_str().unwrap();
    assert_eq!(request_id.len(), 6);
    assert!(request_id
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
}

#[tokio::test]
async fn form_post_flows_through_builders_and_generators() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/compute"))
        .and(header(
            "content-type",
            "application/x-www-form-urlencoded",
        ))
        .and(body_string("teststring=v1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw("teststring=v1", "application/x-www-form-urlencoded"),
        )
        .mount(&upstream)
        .await;

    let dir = TempDir::new().unwrap();
    write_definition(
        &dir,
        "compute.json",
        &json!({
            "route": {"path": "/computation", "method": "POST"},
            "requests": [{
                "url": format!("{}/compute", upstream.uri()),
                "method": "POST",
                "builders": [{
                    "builder": "copy",
                    "from": "route.data",
                    "to": "self.data"
                }]
            }],
            "response": {
                "status": 200,
                "json": {},
                "generators": [{
                    "generator": "copy",
                    "from": "requests[0].response.data",
                    "to": "self.json.data"
                }]
            }
        }),
    );

    let server = server_for(&dir);
    let response = server
        .post("/computation")
        .text("teststring=v1")
        .content_type("application/x-www-form-urlencoded")
        .await;

    assert_eq!(response.status_code(), 200);
    assert_eq!(
        response.json::<Value>(),
        json!({"data": {"teststring": "v1"}})
    );
}

#[tokio::test]
async fn dynamic_segments_interpolate_into_upstream_url() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/items/42"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 42})))
        .mount(&upstream)
        .await;

    let dir = TempDir::new().unwrap();
    write_definition(
        &dir,
        "item.json",
        &json!({
            "route": {"path": "/items/{item_id}", "method": "GET"},
            "requests": [{
                "url": format!("{}/items/${{route.dynamic.item_id}}", upstream.uri()),
                "method": "GET"
            }],
            "response": {
                "status": 200,
                "json": {},
                "generators": [{
                    "generator": "copy",
                    "from": "requests[0].response.json",
                    "to": "self.json"
                }]
            }
        }),
    );

    let server = server_for(&dir);
    let response = server.get("/items/42").await;
    assert_eq!(response.status_code(), 200);
    assert_eq!(response.json::<Value>(), json!({"id": 42}));
}

#[tokio::test]
async fn unresolvable_reference_maps_to_configuration_error_envelope() {
    let dir = TempDir::new().unwrap();
    write_definition(
        &dir,
        "broken.json",
        &json!({
            "route": {"path": "/broken", "method": "GET"},
            "response": {
                "status": 200,
                "json": {},
                "generators": [{
                    "generator": "copy",
                    "from": "requests[0].response.json",
                    "to": "self.json"
                }]
            }
        }),
    );

    let server = server_for(&dir);
    let response = server.get("/broken").await;
    assert_eq!(response.status_code(), 500);
    let envelope = response.json::<Value>();
    assert_eq!(envelope["error"], json!("internal_error"));
    assert_eq!(envelope["description"], json!("Gateway route reference error"));
    assert_eq!(envelope["request_id"].as_str().unwrap().len(), 6);
}

#[tokio::test]
async fn response_without_body_facets_is_internal_error() {
    let dir = TempDir::new().unwrap();
    write_definition(
        &dir,
        "empty.json",
        &json!({
            "route": {"path": "/empty", "method": "GET"},
            "response": {"status": 200}
        }),
    );

    let server = server_for(&dir);
    let response = server.get("/empty").await;
    assert_eq!(response.status_code(), 500);
    let envelope = response.json::<Value>();
    assert_eq!(envelope["error"], json!("internal_error"));
    assert_eq!(
        envelope["description"],
        json!("Response does not contain json, data or text.")
    );
}

#[tokio::test]
async fn invalid_json_body_is_rejected_as_bad_request() {
    let dir = TempDir::new().unwrap();
    write_definition(
        &dir,
        "echo.json",
        &json!({
            "route": {"path": "/echo", "method": "POST"},
            "response": {
                "status": 200,
                "json": {},
                "generators": [{
                    "generator": "copy",
                    "from": "route.json",
                    "to": "self.json"
                }]
            }
        }),
    );

    let server = server_for(&dir);
    let response = server
        .post("/echo")
        .text("{not json")
        .content_type("application/json")
        .await;
    assert_eq!(response.status_code(), 400);
    assert_eq!(response.json::<Value>()["error"], json!("bad_request"));
}

#[tokio::test]
async fn query_parameters_are_addressable() {
    let dir = TempDir::new().unwrap();
    write_definition(
        &dir,
        "query.json",
        &json!({
            "route": {"path": "/search", "method": "GET"},
            "response": {
                "status": 200,
                "json": {},
                "generators": [
                    {"generator": "copy", "from": "route.query.q", "to": "self.json.q"},
                    {"generator": "copy", "from": "route.query.tag", "to": "self.json.tags"}
                ]
            }
        }),
    );

    let server = server_for(&dir);
    let response = server
        .get("/search")
        .add_query_param("q", "widget")
        .add_query_param("tag", "a")
        .add_query_param("tag", "b")
        .await;
    assert_eq!(response.status_code(), 200);
    assert_eq!(
        response.json::<Value>(),
        json!({"q": "widget", "tags": ["a", "b"]})
    );
}

#[tokio::test]
async fn cors_plugin_reflects_allowed_origin() {
    let dir = TempDir::new().unwrap();
    write_definition(
        &dir,
        "cors.json",
        &json!({
            "route": {
                "path": "/open",
                "method": "GET",
                "plugins": [{"plugin": "cors"}]
            },
            "response": {"status": 200, "json": {"ok": true}}
        }),
    );

    let server = server_for(&dir);
    let response = server
        .get("/open")
        .add_header(
            http::header::HeaderName::from_static("origin"),
            http::header::HeaderValue::from_static("https://app.example.com"),
        )
        .await;
    assert_eq!(response.status_code(), 200);
    assert_eq!(
        response.header("access-control-allow-origin"),
        "https://app.example.com"
    );

    let denied = server
        .get("/open")
        .add_header(
            http::header::HeaderName::from_static("origin"),
            http::header::HeaderValue::from_static("https://evil.example.org"),
        )
        .await;
    assert_eq!(denied.status_code(), 200);
    assert!(denied.maybe_header("access-control-allow-origin").is_none());
}

#[tokio::test]
async fn constants_and_conditional_operations() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/things"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"count": 3})))
        .mount(&upstream)
        .await;

    let dir = TempDir::new().unwrap();
    write_definition(
        &dir,
        "things.json",
        &json!({
            "constants": {"api_version": "v1"},
            "route": {"path": "/things", "method": "GET"},
            "requests": [{
                "url": format!("{}/${{constants.api_version}}/things", upstream.uri()),
                "method": "GET"
            }],
            "response": {
                "status": 200,
                "json": {"flagged": false},
                "generators": [
                    {
                        "generator": "copy",
                        "from": "requests[0].response.json.count",
                        "to": "self.json.count"
                    },
                    {
                        "generator": "set",
                        "if": "route.query.flag",
                        "self.json.flagged": true
                    }
                ]
            }
        }),
    );

    let server = server_for(&dir);
    // condition absent: the set is skipped silently
    let plain = server.get("/things").await;
    assert_eq!(
        plain.json::<Value>(),
        json!({"count": 3, "flagged": false})
    );
    // condition present: the set runs
    let flagged = server.get("/things").add_query_param("flag", "1").await;
    assert_eq!(
        flagged.json::<Value>(),
        json!({"count": 3, "flagged": true})
    );
}

#[tokio::test]
async fn completion_report_hook_fires_after_response() {
    let authority = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path("/reports/g-77"))
        .and(header("Authorization", "bearer tok-77"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&authority)
        .await;

    let dir = TempDir::new().unwrap();
    write_definition(
        &dir,
        "reported.json",
        &json!({
            "route": {"path": "/reported", "method": "GET"},
            "response": {
                "status": 200,
                "json": {"ok": true},
                // stand-in for what the ticket plugin publishes
                "generators": [{
                    "generator": "set",
                    "route.extra.ticket_validation": {
                        "grant_uuid": "g-77",
                        "gateway_token": "tok-77"
                    }
                }]
            },
            "after_hooks": [{"after_hook": "report_completion"}]
        }),
    );

    let mut settings = test_settings(&dir);
    settings.completion_report_endpoint = Some(format!("{}/reports", authority.uri()));
    let http = reqwest::Client::new();
    let plugins = PluginFactory::with_builtins(
        &settings,
        http.clone(),
        Arc::new(AuthorityCache::new()),
    );
    let hooks = Arc::new(HookFactory::with_builtins(&settings, http.clone()));
    let router = build_router(
        &settings,
        load_definitions(&settings.definitions_path),
        Arc::new(OperationRegistry::with_builtins()),
        &plugins,
        hooks,
        http,
    )
    .unwrap();
    let server = TestServer::new(router).unwrap();

    let response = server.get("/reported").await;
    assert_eq!(response.status_code(), 200);
    // wiremock verifies the expected PATCH on drop
}

#[tokio::test]
async fn unknown_route_is_plain_404() {
    let dir = TempDir::new().unwrap();
    let server = server_for(&dir);
    let response = server.get("/never-declared").await;
    assert_eq!(response.status_code(), 404);
    // even the router-level 404 carries the hardening headers
    assert_eq!(response.header("x-content-type-options"), "nosniff");
}

#[tokio::test]
async fn headers_map_is_available_to_operations() {
    let dir = TempDir::new().unwrap();
    write_definition(
        &dir,
        "hdr.json",
        &json!({
            "route": {"path": "/hdr", "method": "GET"},
            "response": {
                "status": 200,
                "json": {},
                "generators": [{
                    "generator": "copy",
                    "from": "route.headers[\"x-tenant\"]",
                    "to": "self.json.tenant"
                }]
            }
        }),
    );

    let server = server_for(&dir);
    let response = server
        .get("/hdr")
        .add_header(
            http::header::HeaderName::from_static("x-tenant"),
            http::header::HeaderValue::from_static("acme"),
        )
        .await;
    assert_eq!(response.json::<Value>(), json!({"tenant": "acme"}));
}
