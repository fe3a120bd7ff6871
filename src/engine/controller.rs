//! # Gateway Controller
//!
//! Drives one call through the declarative pipeline: for each declared
//! upstream request, materialize and interpolate it, run its builders, make
//! the HTTP call, classify and attach the upstream response, run its
//! processors; then materialize the outbound response and run its generators.
//! Requests run strictly in declaration order, so later requests can
//! reference earlier responses.

use std::sync::Arc;

use reqwest::Method;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::core::config::GatewayDefinition;
use crate::core::error::{GatewayResult, ServiceError};
use crate::engine::entities::{
    GatewayRequest, GatewayResponse, HttpMethod, UpstreamResponse,
};
use crate::engine::environment::Environment;
use crate::engine::operations::Scope;
use crate::engine::registry::{OperationKind, OperationRegistry};

/// One controller per route, built at startup and shared across calls. All
/// per-call state lives in the environment.
pub struct GatewayController {
    definition: GatewayDefinition,
    registry: Arc<OperationRegistry>,
    http: reqwest::Client,
}

impl GatewayController {
    pub fn new(
        definition: GatewayDefinition,
        registry: Arc<OperationRegistry>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            definition,
            registry,
            http,
        }
    }

    pub fn definition(&self) -> &GatewayDefinition {
        &self.definition
    }

    /// Run the declarative pipeline against a freshly captured environment.
    pub async fn handle(&self, environment: &mut Environment) -> GatewayResult<()> {
        for (index, request_definition) in self.definition.requests.iter().enumerate() {
            let scope = Scope::request(index);
            let request = GatewayRequest::materialize(request_definition);
            environment.evaluate_and_add_request(request)?;

            let builders = environment.requests[index].builders.clone();
            self.run_operations(environment, OperationKind::Builder, &scope, &builders)?;

            let upstream = self.call_upstream(&environment.requests[index]).await?;
            info!(
                url = environment.requests[index].url,
                status = upstream.status,
                "upstream call completed"
            );
            environment.requests[index].response = Some(upstream);

            let processors = environment.requests[index].processors.clone();
            self.run_operations(environment, OperationKind::Processor, &scope, &processors)?;
        }

        let response = GatewayResponse::materialize(&self.definition.response);
        environment.evaluate_and_add_response(response)?;

        let generators = environment
            .response
            .as_ref()
            .map(|r| r.generators.clone())
            .unwrap_or(Value::Null);
        self.run_operations(
            environment,
            OperationKind::Generator,
            &Scope::response(),
            &generators,
        )?;
        Ok(())
    }

    fn run_operations(
        &self,
        environment: &mut Environment,
        kind: OperationKind,
        scope: &Scope,
        descriptors: &Value,
    ) -> GatewayResult<()> {
        let descriptors = match descriptors {
            Value::Null => return Ok(()),
            Value::Array(items) => items,
            other => {
                return Err(ServiceError::configuration(format!(
                    "'{}s' must be an array: {other}",
                    kind.key()
                )))
            }
        };
        for descriptor in descriptors {
            let operation = self.registry.resolve(kind, descriptor)?;
            debug!(kind = kind.key(), scope = scope.address(), "running operation");
            operation.run(environment, scope)?;
        }
        Ok(())
    }

    /// Make the upstream call described by the (already interpolated) request
    /// record and classify the response by its Content-Type.
    async fn call_upstream(&self, request: &GatewayRequest) -> GatewayResult<UpstreamResponse> {
        let method = match request.method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
            HttpMethod::Put => Method::PUT,
        };
        let mut outgoing = self.http.request(method, &request.url);

        if let Value::Object(headers) = &request.headers {
            for (name, value) in headers {
                outgoing = outgoing.header(name, header_string(name, value)?);
            }
        }

        // Form data takes precedence over json when a request carries both;
        // raw text is the fallback.
        if let Value::Object(data) = &request.data {
            outgoing = outgoing
                .header("Content-Type", "application/x-www-form-urlencoded")
                .body(encode_form(data)?);
        } else if !request.json.is_null() {
            outgoing = outgoing.json(&request.json);
        } else if let Value::String(text) = &request.text {
            outgoing = outgoing.body(text.clone());
        }

        let received = outgoing.send().await?;
        let status = received.status().as_u16();

        let mut headers = Map::new();
        for (name, value) in received.headers() {
            if let Ok(value) = value.to_str() {
                headers.insert(name.to_string(), Value::String(value.to_string()));
            }
        }
        let content_type = received
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let text = received.text().await?;

        let mut json = Value::Null;
        let mut data = Value::Null;
        if content_type.contains("application/json") {
            json = serde_json::from_str(&text).map_err(|e| {
                ServiceError::internal(format!(
                    "Upstream returned invalid JSON from '{}': {e}",
                    request.url
                ))
            })?;
        } else if content_type.contains("application/x-www-form-urlencoded") {
            data = parse_form_body(&text);
        }

        Ok(UpstreamResponse {
            status,
            headers: Value::Object(headers),
            text,
            json,
            data,
        })
    }
}

fn header_string(name: &str, value: &Value) -> GatewayResult<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(ServiceError::configuration(format!(
            "header '{name}' must be a string or number, got: {other}"
        ))),
    }
}

/// Form-encode a data map. Sequence values repeat the key per element.
pub fn encode_form(data: &Map<String, Value>) -> GatewayResult<String> {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in data {
        match value {
            Value::Array(items) => {
                for item in items {
                    serializer.append_pair(key, &form_scalar(key, item)?);
                }
            }
            scalar => {
                serializer.append_pair(key, &form_scalar(key, scalar)?);
            }
        }
    }
    Ok(serializer.finish())
}

fn form_scalar(key: &str, value: &Value) -> GatewayResult<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(ServiceError::configuration(format!(
            "form field '{key}' must be a scalar or list of scalars, got: {other}"
        ))),
    }
}

/// Parse a form body into a map: single occurrences stay strings, repeated
/// keys collect into a list.
pub fn parse_form_body(body: &str) -> Value {
    let mut map = Map::new();
    for (key, value) in url::form_urlencoded::parse(body.as_bytes()) {
        let value = Value::String(value.into_owned());
        match map.get_mut(key.as_ref()) {
            None => {
                map.insert(key.into_owned(), value);
            }
            Some(Value::Array(items)) => items.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
        }
    }
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::load_definition;
    use serde_json::json;
    use std::path::PathBuf;
    use tempfile::TempDir;
    use wiremock::matchers::{body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn write_definition(dir: &TempDir, value: &Value) -> PathBuf {
        let path = dir.path().join("route.json");
        std::fs::write(&path, serde_json::to_string(value).unwrap()).unwrap();
        path
    }

    fn controller_for(value: &Value) -> GatewayController {
        let dir = TempDir::new().unwrap();
        let definition = load_definition(&write_definition(&dir, value)).unwrap();
        GatewayController::new(
            definition,
            Arc::new(OperationRegistry::with_builtins()),
            reqwest::Client::new(),
        )
    }

    fn environment_for(controller: &GatewayController) -> Environment {
        let route = crate::engine::entities::RouteState::new(&controller.definition().route);
        Environment::new(
            route,
            controller.definition().constants.clone(),
            controller.definition().after_hooks.clone(),
        )
    }

    #[test]
    fn form_body_single_and_repeated_keys() {
        let parsed = parse_form_body("a=1&b=x&b=y&b=z");
        assert_eq!(parsed["a"], json!("1"));
        assert_eq!(parsed["b"], json!(["x", "y", "z"]));
    }

    #[test]
    fn form_encoding_repeats_keys_for_lists() {
        let data = json!({"a": "1", "b": ["x", "y"]});
        let encoded = encode_form(data.as_object().unwrap()).unwrap();
        assert_eq!(encoded, "a=1&b=x&b=y");
    }

    #[test]
    fn non_scalar_form_field_is_fatal() {
        let data = json!({"a": {"nested": true}});
        assert!(encode_form(data.as_object().unwrap()).is_err());
    }

    #[tokio::test]
    async fn pipeline_calls_upstream_and_runs_generators() {
        let upstream = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/items/42"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"id": 42, "name": "widget"})),
            )
            .mount(&upstream)
            .await;

        let controller = controller_for(&json!({
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
                    "from": "requests[0].response.json.name",
                    "to": "self.json.name"
                }]
            }
        }));

        let mut env = environment_for(&controller);
        env.route.dynamic = json!({"item_id": "42"});
        controller.handle(&mut env).await.unwrap();

        assert_eq!(env.get("requests[0].response.status").unwrap(), json!(200));
        assert_eq!(env.get("response.json.name").unwrap(), json!("widget"));
    }

    #[tokio::test]
    async fn builders_shape_the_outgoing_body() {
        let upstream = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/submit"))
            .and(header("content-type", "application/x-www-form-urlencoded"))
            .and(body_string("teststring=v1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .mount(&upstream)
            .await;

        let controller = controller_for(&json!({
            "route": {"path": "/submit", "method": "POST"},
            "requests": [{
                "url": format!("{}/submit", upstream.uri()),
                "method": "POST",
                "builders": [{
                    "builder": "copy",
                    "from": "route.data",
                    "to": "self.data"
                }]
            }],
            "response": {"status": 200, "json": {}}
        }));

        let mut env = environment_for(&controller);
        env.route.data = json!({"teststring": "v1"});
        controller.handle(&mut env).await.unwrap();
        assert_eq!(env.get("requests[0].response.json.ok").unwrap(), json!(true));
    }

    #[tokio::test]
    async fn form_data_wins_over_json_on_the_outgoing_body() {
        let upstream = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/submit"))
            .and(header("content-type", "application/x-www-form-urlencoded"))
            .and(body_string("field=from-data"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .mount(&upstream)
            .await;

        let controller = controller_for(&json!({
            "route": {"path": "/submit", "method": "POST"},
            "requests": [{
                "url": format!("{}/submit", upstream.uri()),
                "method": "POST",
                "json": {"field": "from-json"},
                "data": {"field": "from-data"}
            }],
            "response": {"status": 200, "json": {}}
        }));

        let mut env = environment_for(&controller);
        controller.handle(&mut env).await.unwrap();
        assert_eq!(env.get("requests[0].response.json.ok").unwrap(), json!(true));
    }

    #[tokio::test]
    async fn form_encoded_upstream_response_is_classified_as_data() {
        let upstream = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/form"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw("k=v&k=w", "application/x-www-form-urlencoded"),
            )
            .mount(&upstream)
            .await;

        let controller = controller_for(&json!({
            "route": {"path": "/form", "method": "GET"},
            "requests": [{"url": format!("{}/form", upstream.uri()), "method": "GET"}],
            "response": {"status": 200, "json": {}}
        }));

        let mut env = environment_for(&controller);
        controller.handle(&mut env).await.unwrap();
        assert_eq!(env.get("requests[0].response.data.k").unwrap(), json!(["v", "w"]));
        assert!(env.get("requests[0].response.json.k").is_err());
    }

    #[tokio::test]
    async fn invalid_upstream_json_is_internal_error() {
        let upstream = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bad"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw("{not json", "application/json"),
            )
            .mount(&upstream)
            .await;

        let controller = controller_for(&json!({
            "route": {"path": "/bad", "method": "GET"},
            "requests": [{"url": format!("{}/bad", upstream.uri()), "method": "GET"}],
            "response": {"status": 200, "json": {}}
        }));

        let mut env = environment_for(&controller);
        let err = controller.handle(&mut env).await.unwrap_err();
        assert_eq!(err.error_tag(), "internal_error");
    }

    #[tokio::test]
    async fn xml_upstream_becomes_addressable_json() {
        let upstream = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/legacy"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "<result><status>ok</status><code>7</code></result>",
                "application/xml",
            ))
            .mount(&upstream)
            .await;

        let controller = controller_for(&json!({
            "route": {"path": "/legacy", "method": "GET"},
            "requests": [{
                "url": format!("{}/legacy", upstream.uri()),
                "method": "GET",
                "processors": [{"processor": "xml_to_json"}]
            }],
            "response": {
                "status": 200,
                "json": {},
                "generators": [{
                    "generator": "copy",
                    "from": "requests[0].response.json.result.status",
                    "to": "self.json.status"
                }]
            }
        }));

        let mut env = environment_for(&controller);
        controller.handle(&mut env).await.unwrap();
        assert_eq!(env.get("response.json.status").unwrap(), json!("ok"));
    }

    #[tokio::test]
    async fn later_request_sees_earlier_response() {
        let upstream = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/first"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "t-1"})))
            .mount(&upstream)
            .await;
        Mock::given(method("GET"))
            .and(path("/second"))
            .and(header("Authorization", "bearer t-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"done": true})))
            .mount(&upstream)
            .await;

        let controller = controller_for(&json!({
            "route": {"path": "/chain", "method": "GET"},
            "requests": [
                {"url": format!("{}/first", upstream.uri()), "method": "GET", "name": "auth"},
                {
                    "url": format!("{}/second", upstream.uri()),
                    "method": "GET",
                    "headers": {
                        "Authorization": "bearer ${requests[\"auth\"].response.json.token}"
                    }
                }
            ],
            "response": {"status": 200, "json": {}}
        }));

        let mut env = environment_for(&controller);
        controller.handle(&mut env).await.unwrap();
        assert_eq!(env.get("requests[1].response.json.done").unwrap(), json!(true));
    }
}
