//! CORS plugin: reflects the `Origin` header into
//! `Access-Control-Allow-Origin` when it matches the configured pattern, and
//! attaches the remaining `Access-Control-Allow-*` headers to the response.

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::core::error::{GatewayResult, ServiceError};
use crate::engine::environment::Environment;
use crate::plugins::GatewayPlugin;

const DEFAULT_METHODS: &str = "PUT, GET, POST, PATCH, DELETE, OPTIONS";
const DEFAULT_HEADERS: &str = "Authorization, Origin, Accept, Content-Type, X-Requested-With";

pub struct CorsPlugin {
    origin_pattern: String,
    origin_re: Regex,
    methods: String,
    headers: String,
    credentials: String,
}

impl CorsPlugin {
    /// The origin pattern comes from the descriptor when present, otherwise
    /// from the process settings; a route declaring `cors` with neither is a
    /// configuration error.
    pub fn from_definition(
        definition: &Map<String, Value>,
        settings_pattern: Option<&str>,
    ) -> GatewayResult<Self> {
        let pattern = definition
            .get("origin_pattern")
            .and_then(Value::as_str)
            .or(settings_pattern)
            .ok_or_else(|| {
                ServiceError::configuration(
                    "cors plugin requires an origin pattern (descriptor 'origin_pattern' or \
                     GATEWAY_CORS_ORIGIN_PATTERN)",
                )
            })?;
        let origin_re = Regex::new(pattern).map_err(|e| {
            ServiceError::configuration(format!("invalid cors origin pattern '{pattern}': {e}"))
        })?;
        Ok(Self {
            origin_pattern: pattern.to_string(),
            origin_re,
            methods: string_or(definition, "methods", DEFAULT_METHODS),
            headers: string_or(definition, "headers", DEFAULT_HEADERS),
            credentials: string_or(definition, "credentials", "true"),
        })
    }
}

fn string_or(definition: &Map<String, Value>, key: &str, default: &str) -> String {
    definition
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or(default)
        .to_string()
}

#[async_trait]
impl GatewayPlugin for CorsPlugin {
    fn name(&self) -> &str {
        "cors"
    }

    async fn after(&self, environment: &mut Environment) -> GatewayResult<()> {
        let origin = environment
            .get("route.headers.Origin")
            .or_else(|_| environment.get("route.headers.origin"))
            .ok()
            .and_then(|v| v.as_str().map(str::to_string));

        let Some(response) = environment.response.as_mut() else {
            return Ok(());
        };
        let headers = match &mut response.headers {
            Value::Object(map) => map,
            slot => {
                *slot = json!({});
                slot.as_object_mut().expect("just set to object")
            }
        };

        if let Some(origin) = origin {
            debug!(
                origin,
                pattern = self.origin_pattern,
                "checking request origin against allowed pattern"
            );
            if self
                .origin_re
                .find(&origin)
                .map(|m| m.start() == 0 && m.end() == origin.len())
                .unwrap_or(false)
            {
                headers.insert(
                    "Access-Control-Allow-Origin".to_string(),
                    Value::String(origin),
                );
            }
        }
        headers.insert(
            "Access-Control-Allow-Headers".to_string(),
            Value::String(self.headers.clone()),
        );
        headers.insert(
            "Access-Control-Allow-Methods".to_string(),
            Value::String(self.methods.clone()),
        );
        headers.insert(
            "Access-Control-Allow-Credentials".to_string(),
            Value::String(self.credentials.clone()),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::entities::{
        GatewayResponse, HttpMethod, ResponseDefinition, RouteDefinition, RouteState,
    };

    fn env_with_origin(origin: &str) -> Environment {
        let route = RouteState::new(&RouteDefinition {
            path: "/t".to_string(),
            method: HttpMethod::Get,
            plugins: vec![],
        });
        let mut env = Environment::new(route, json!({}), Value::Null);
        env.route.headers = json!({"Origin": origin});
        env.response = Some(GatewayResponse::materialize(&ResponseDefinition {
            status: Some(200),
            headers: json!({}),
            text: Value::Null,
            json: json!({}),
            data: Value::Null,
            generators: Value::Null,
        }));
        env
    }

    fn plugin(pattern: &str) -> CorsPlugin {
        CorsPlugin::from_definition(&Map::new(), Some(pattern)).unwrap()
    }

    #[tokio::test]
    async fn matching_origin_is_reflected() {
        let mut env = env_with_origin("https://app.example.com");
        plugin(r"https://.*\.example\.com").after(&mut env).await.unwrap();
        assert_eq!(
            env.get("response.headers[\"Access-Control-Allow-Origin\"]").unwrap(),
            json!("https://app.example.com")
        );
    }

    #[tokio::test]
    async fn non_matching_origin_is_not_reflected() {
        let mut env = env_with_origin("https://evil.example.org");
        plugin(r"https://.*\.example\.com").after(&mut env).await.unwrap();
        assert!(env
            .get("response.headers[\"Access-Control-Allow-Origin\"]")
            .is_err());
        // the static allow headers are still attached
        assert!(env
            .get("response.headers[\"Access-Control-Allow-Methods\"]")
            .is_ok());
    }

    #[test]
    fn missing_pattern_is_a_configuration_error() {
        assert!(CorsPlugin::from_definition(&Map::new(), None).is_err());
    }
}
