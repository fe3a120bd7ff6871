//! # HTTP Server
//!
//! Builds the axum router from the loaded gateway definitions and hosts the
//! outer boundary of every call: facet capture, the plugin chain, the
//! declarative pipeline, response construction, the error envelope and the
//! after hooks. Every response, including errors and the health probe,
//! carries the hardening headers and an `X-Request-Id`.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Host, OriginalUri, Path};
use axum::http::header::{HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Extension, Json, Router};
use rand::Rng;
use serde_json::{json, Map, Value};
use tracing::{error, info, warn};

use crate::core::config::{GatewayDefinition, Settings};
use crate::core::error::{GatewayResult, ServiceError};
use crate::engine::controller::{encode_form, parse_form_body, GatewayController};
use crate::engine::entities::RouteState;
use crate::engine::environment::Environment;
use crate::engine::registry::OperationRegistry;
use crate::hooks::HookFactory;
use crate::plugins::{InboundCall, PluginChain, PluginFactory};

const SECURITY_HEADERS: &[(&str, &str)] = &[
    ("x-content-type-options", "nosniff"),
    ("x-xss-protection", "1; mode=block"),
    ("x-frame-options", "DENY"),
    ("content-security-policy", "default-src 'none'"),
    (
        "strict-transport-security",
        "max-age=31536000; includeSubDomains",
    ),
    ("cache-control", "no-store, no-cache, must-revalidate"),
    ("pragma", "no-cache"),
];

/// Per-call correlation id, attached by the middleware and echoed in the
/// `X-Request-Id` header and the error envelope.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

fn new_request_id() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..6)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Everything one route needs to serve a call, assembled at startup.
struct RouteContext {
    controller: GatewayController,
    chain: PluginChain,
    hooks: Arc<HookFactory>,
    debug: bool,
}

/// Build the router: one handler per loaded definition plus the health probe,
/// all wrapped in the hardening middleware. Plugin resolution happens here,
/// so a definition naming an unknown plugin fails the boot.
pub fn build_router(
    settings: &Settings,
    definitions: Vec<GatewayDefinition>,
    registry: Arc<OperationRegistry>,
    plugins: &PluginFactory,
    hooks: Arc<HookFactory>,
    http: reqwest::Client,
) -> GatewayResult<Router> {
    let mut router = Router::new().route("/status", get(health));

    for definition in definitions {
        let chain = plugins.resolve_chain(&definition.route.plugins)?;
        let axum_path = axum_route_path(&definition.route.path);
        let method = definition.route.method;
        let context = Arc::new(RouteContext {
            controller: GatewayController::new(definition, registry.clone(), http.clone()),
            chain,
            hooks: hooks.clone(),
            debug: settings.debug,
        });

        let handler = move |host: Host,
                            uri: OriginalUri,
                            dynamic: Path<HashMap<String, String>>,
                            request_id: Extension<RequestId>,
                            headers: HeaderMap,
                            body: Bytes| {
            let context = context.clone();
            async move { handle_call(context, host, uri, dynamic, request_id, headers, body).await }
        };

        router = router.route(
            &axum_path,
            match method {
                crate::engine::entities::HttpMethod::Get => get(handler),
                crate::engine::entities::HttpMethod::Post => post(handler),
                crate::engine::entities::HttpMethod::Put => put(handler),
            },
        );
    }

    Ok(router
        .layer(middleware::from_fn(request_boundary))
        .layer(tower_http::trace::TraceLayer::new_for_http()))
}

/// Load the definitions, wire the shared collaborators and serve until
/// shutdown.
pub async fn run(settings: Settings) -> GatewayResult<()> {
    let http = reqwest::Client::new();
    let registry = Arc::new(OperationRegistry::with_builtins());
    let authority = Arc::new(crate::plugins::ticket_validation::AuthorityCache::new());
    let plugins = PluginFactory::with_builtins(&settings, http.clone(), authority);
    let hooks = Arc::new(HookFactory::with_builtins(&settings, http.clone()));

    info!("Loading gateway definitions:");
    let definitions = crate::core::config::load_definitions(&settings.definitions_path);
    if definitions.is_empty() {
        warn!(
            "No gateway definitions loaded from {:?}",
            settings.definitions_path
        );
    }

    let router = build_router(&settings, definitions, registry, &plugins, hooks, http)?;
    let listener = tokio::net::TcpListener::bind(settings.bind_address)
        .await
        .map_err(|e| {
            ServiceError::configuration(format!("Cannot bind {}: {e}", settings.bind_address))
        })?;
    info!("Listening on {}", settings.bind_address);
    axum::serve(listener, router)
        .await
        .map_err(|e| ServiceError::internal(format!("Server error: {e}")))
}

/// Health probe. Stays outside the declarative pipeline and the audit log.
async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

/// Convert a `{name}`-style route pattern to the axum `:name` syntax.
fn axum_route_path(pattern: &str) -> String {
    pattern
        .split('/')
        .map(|segment| {
            match segment
                .strip_prefix('{')
                .and_then(|s| s.strip_suffix('}'))
            {
                Some(name) => format!(":{name}"),
                None => segment.to_string(),
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Middleware: tag the request with an id, then stamp the hardening headers
/// and the id onto whatever response comes back.
async fn request_boundary(mut request: axum::extract::Request, next: Next) -> Response {
    let request_id = new_request_id();
    request
        .extensions_mut()
        .insert(RequestId(request_id.clone()));
    let mut response = next.run(request).await;

    let headers = response.headers_mut();
    for &(name, value) in SECURITY_HEADERS {
        headers.insert(
            HeaderName::from_static(name),
            HeaderValue::from_static(value),
        );
    }
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(HeaderName::from_static("x-request-id"), value);
    }
    response
}

async fn handle_call(
    context: Arc<RouteContext>,
    Host(host): Host,
    OriginalUri(uri): OriginalUri,
    Path(dynamic): Path<HashMap<String, String>>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let started = std::time::Instant::now();
    let definition = context.controller.definition();
    info!(
        request_id,
        "--> {} {}",
        definition.route.method,
        uri.path()
    );

    let mut environment = Environment::new(
        RouteState::new(&definition.route),
        definition.constants.clone(),
        definition.after_hooks.clone(),
    );
    let inbound = InboundCall {
        url: format!("http://{host}{}", uri.path()),
    };

    let response = match capture_facets(&mut environment, &dynamic, &uri, &headers, &body) {
        Ok(()) => match run_pipeline(&context, &mut environment, &inbound).await {
            Ok(response) => response,
            Err(e) => error_response(&mut environment, &e, context.debug, &request_id),
        },
        Err(e) => error_response(&mut environment, &e, context.debug, &request_id),
    };

    // Hooks observe the final error state and never alter the response.
    context.hooks.run_all(&mut environment).await;

    info!(
        request_id,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "<-- {}",
        response.status()
    );
    response
}

/// Capture the inbound call's facets into the route record.
fn capture_facets(
    environment: &mut Environment,
    dynamic: &HashMap<String, String>,
    uri: &axum::http::Uri,
    headers: &HeaderMap,
    body: &Bytes,
) -> GatewayResult<()> {
    let mut header_map = Map::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            header_map.insert(name.to_string(), Value::String(value.to_string()));
        }
    }
    environment.route.headers = Value::Object(header_map);

    environment.route.dynamic = Value::Object(
        dynamic
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    );

    if let Some(query) = uri.query() {
        environment.route.query = parse_form_body(query);
    }

    if !body.is_empty() {
        let text = String::from_utf8(body.to_vec())
            .map_err(|_| ServiceError::bad_request("Request body is not valid UTF-8"))?;
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if content_type.contains("application/json") {
            environment.route.json = serde_json::from_str(&text)
                .map_err(|e| ServiceError::bad_request(format!("Invalid JSON body: {e}")))?;
        } else if content_type.contains("application/x-www-form-urlencoded") {
            environment.route.data = parse_form_body(&text);
        }
        environment.route.text = Value::String(text);
    }
    Ok(())
}

async fn run_pipeline(
    context: &RouteContext,
    environment: &mut Environment,
    inbound: &InboundCall,
) -> GatewayResult<Response> {
    context.chain.before(environment, inbound).await?;
    context.controller.handle(environment).await?;
    context.chain.after(environment).await?;
    build_response(environment)
}

/// Build the outbound HTTP response from the environment's response record.
/// Body precedence: json, then form-encoded data, then raw text; a response
/// record with none of them is a configuration error.
fn build_response(environment: &Environment) -> GatewayResult<Response> {
    let record = environment
        .response
        .as_ref()
        .ok_or_else(|| ServiceError::configuration("No response record after pipeline"))?;

    let status = StatusCode::from_u16(record.status.unwrap_or(200))
        .map_err(|e| ServiceError::configuration(format!("Invalid response status: {e}")))?;

    let (content_type, body) = if !record.json.is_null() {
        (
            "application/json",
            serde_json::to_string(&record.json).map_err(ServiceError::from)?,
        )
    } else if let Value::Object(data) = &record.data {
        ("application/x-www-form-urlencoded", encode_form(data)?)
    } else if let Value::String(text) = &record.text {
        ("text/plain; charset=utf-8", text.clone())
    } else {
        return Err(ServiceError::internal(
            "Response does not contain json, data or text.",
        ));
    };

    let mut response = (status, body).into_response();
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));

    if let Value::Object(declared) = &record.headers {
        for (name, value) in declared {
            // the transfer framing is ours, not the definition's
            if name.eq_ignore_ascii_case(CONTENT_LENGTH.as_str()) {
                continue;
            }
            let (Ok(name), Some(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                value.as_str().and_then(|v| HeaderValue::from_str(v).ok()),
            ) else {
                warn!(header = name, "skipping unrepresentable response header");
                continue;
            };
            response.headers_mut().insert(name, value);
        }
    }
    Ok(response)
}

/// Map a service error to the uniform envelope and record it in the
/// environment for the after hooks. With the debug flag set, internal errors
/// expose their operator detail to the caller.
fn error_response(
    environment: &mut Environment,
    error: &ServiceError,
    debug: bool,
    request_id: &str,
) -> Response {
    error!(request_id, "{}", error.detail().display());
    environment.record_error(error.detail().display());

    let description = if debug {
        error.detail().display()
    } else {
        &error.detail().description
    };
    let envelope = json!({
        "error": error.error_tag(),
        "description": description,
        "request_id": request_id,
    });
    (error.status_code(), Json(envelope)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::entities::{GatewayResponse, HttpMethod, ResponseDefinition, RouteDefinition};

    #[test]
    fn route_pattern_converts_to_axum_syntax() {
        assert_eq!(axum_route_path("/items/{item_id}"), "/items/:item_id");
        assert_eq!(
            axum_route_path("/a/{b}/c/{d}"),
            "/a/:b/c/:d"
        );
        assert_eq!(axum_route_path("/plain/path"), "/plain/path");
    }

    #[test]
    fn request_ids_are_six_lowercase_alphanumerics() {
        for _ in 0..20 {
            let id = new_request_id();
            assert_eq!(id.len(), 6);
            assert!(id
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        }
    }

    fn environment_with_response(response: GatewayResponse) -> Environment {
        let route = RouteState::new(&RouteDefinition {
            path: "/t".to_string(),
            method: HttpMethod::Get,
            plugins: vec![],
        });
        let mut env = Environment::new(route, json!({}), Value::Null);
        env.response = Some(response);
        env
    }

    fn response_record(status: Option<u16>, json: Value, data: Value, text: Value) -> GatewayResponse {
        GatewayResponse::materialize(&ResponseDefinition {
            status,
            headers: Value::Null,
            text,
            json,
            data,
            generators: Value::Null,
        })
    }

    #[test]
    fn json_body_wins_over_data_and_text() {
        let env = environment_with_response(response_record(
            Some(201),
            json!({"a": 1}),
            json!({"b": "2"}),
            json!("raw"),
        ));
        let response = build_response(&env).unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }

    #[test]
    fn data_body_is_form_encoded() {
        let env = environment_with_response(response_record(
            None,
            Value::Null,
            json!({"k": "v"}),
            Value::Null,
        ));
        let response = build_response(&env).unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/x-www-form-urlencoded"
        );
    }

    #[test]
    fn empty_response_record_is_fatal() {
        let env = environment_with_response(response_record(
            Some(200),
            Value::Null,
            Value::Null,
            Value::Null,
        ));
        let err = build_response(&env).unwrap_err();
        assert!(err
            .detail()
            .description
            .contains("does not contain json, data or text"));
    }

    #[test]
    fn declared_content_length_is_stripped() {
        let mut record = response_record(Some(200), json!({"ok": true}), Value::Null, Value::Null);
        record.headers = json!({"Content-Length": "9999", "X-Custom": "yes"});
        let env = environment_with_response(record);
        let response = build_response(&env).unwrap();
        assert_ne!(
            response.headers().get(CONTENT_LENGTH).map(|v| v.to_str().unwrap()),
            Some("9999")
        );
        assert_eq!(response.headers().get("X-Custom").unwrap(), "yes");
    }
}
