//! # Configuration Module
//!
//! Two concerns live here:
//!
//! 1. Process settings, read once at startup from `GATEWAY_`-prefixed
//!    environment variables. Missing required variables abort the boot.
//! 2. Gateway definition files: one JSON document per route, discovered
//!    recursively under the configured search path. Include fragments are
//!    merged here, before the typed definitions are built, so the rest of
//!    the engine only ever sees fully resolved definitions.

use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{error, info};

use crate::core::error::{GatewayResult, ServiceError};
use crate::engine::entities::{RequestDefinition, ResponseDefinition, RouteDefinition};

const ENV_PREFIX: &str = "GATEWAY_";

/// Process-wide settings, sourced from the environment at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Directory searched recursively for `*.json` gateway definitions.
    pub definitions_path: PathBuf,
    pub bind_address: SocketAddr,
    /// When set, unclassified errors propagate unmodified for diagnosis
    /// instead of being masked behind a generic internal error.
    pub debug: bool,
    /// Origin pattern for the CORS plugin, when any route declares it.
    pub cors_origin_pattern: Option<String>,
    /// Authority endpoints for the ticket-validation plugin, when configured.
    pub ticket_validation: Option<TicketValidationSettings>,
    /// Endpoint the completion-report after-hook PATCHes, when configured.
    pub completion_report_endpoint: Option<String>,
}

/// Settings for the ticket-validation plugin. All required once any route
/// declares the plugin.
#[derive(Debug, Clone)]
pub struct TicketValidationSettings {
    pub openid_configuration_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub introspection_endpoint: String,
    pub jwks_endpoint: String,
    pub kid: String,
    pub issuer: String,
    pub exp_leeway_seconds: u64,
}

fn required(name: &str) -> GatewayResult<String> {
    let full = format!("{ENV_PREFIX}{name}");
    match env::var(&full) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(ServiceError::configuration(format!(
            "Missing or empty required environment variable: {full}"
        ))),
    }
}

fn optional(name: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}{name}"))
        .ok()
        .filter(|v| !v.is_empty())
}

impl Settings {
    pub fn from_env() -> GatewayResult<Self> {
        let definitions_path = PathBuf::from(required("DEFINITIONS_PATH")?);
        let bind_address = optional("BIND_ADDRESS")
            .unwrap_or_else(|| "0.0.0.0:8080".to_string())
            .parse()
            .map_err(|e| {
                ServiceError::configuration(format!("Invalid {ENV_PREFIX}BIND_ADDRESS: {e}"))
            })?;
        let debug = optional("DEBUG")
            .map(|v| matches!(v.to_lowercase().as_str(), "true" | "y" | "yes" | "1"))
            .unwrap_or(false);

        // The ticket-validation settings are loaded as a block: the first
        // variable being present makes the whole block required.
        let ticket_validation = if optional("TICKET_IDPROVIDER_OPENID_CONFIGURATION").is_some() {
            Some(TicketValidationSettings {
                openid_configuration_url: required("TICKET_IDPROVIDER_OPENID_CONFIGURATION")?,
                client_id: required("TICKET_IDPROVIDER_CLIENT_ID")?,
                client_secret: required("TICKET_IDPROVIDER_SECRET")?,
                introspection_endpoint: required("TICKET_INTROSPECTION_ENDPOINT")?,
                jwks_endpoint: required("TICKET_PUBLIC_SIGNATURE_JWKS_ENDPOINT")?,
                kid: required("TICKET_PUBLIC_SIGNATURE_KID")?,
                issuer: required("TICKET_ISS")?,
                exp_leeway_seconds: optional("TICKET_PUBLIC_SIGNATURE_EXP_LEEWAY_SECONDS")
                    .map(|v| v.parse())
                    .transpose()
                    .map_err(|e| {
                        ServiceError::configuration(format!("Invalid exp leeway: {e}"))
                    })?
                    .unwrap_or(60),
            })
        } else {
            None
        };

        Ok(Self {
            definitions_path,
            bind_address,
            debug,
            cors_origin_pattern: optional("CORS_ORIGIN_PATTERN"),
            ticket_validation,
            completion_report_endpoint: optional("COMPLETION_REPORT_ENDPOINT"),
        })
    }

    /// Log the effective settings at startup; secrets are masked.
    pub fn log(&self) {
        info!("Settings:");
        info!("  * DEFINITIONS_PATH: {:?}", self.definitions_path);
        info!("  * BIND_ADDRESS: {}", self.bind_address);
        info!("  * DEBUG: {}", self.debug);
        if let Some(pattern) = &self.cors_origin_pattern {
            info!("  * CORS_ORIGIN_PATTERN: \"{pattern}\"");
        }
        if let Some(tv) = &self.ticket_validation {
            info!(
                "  * TICKET_IDPROVIDER_OPENID_CONFIGURATION: \"{}\"",
                tv.openid_configuration_url
            );
            info!("  * TICKET_IDPROVIDER_CLIENT_ID: \"{}\"", tv.client_id);
            info!("  * TICKET_IDPROVIDER_SECRET: ****");
            info!(
                "  * TICKET_INTROSPECTION_ENDPOINT: \"{}\"",
                tv.introspection_endpoint
            );
            info!(
                "  * TICKET_PUBLIC_SIGNATURE_JWKS_ENDPOINT: \"{}\"",
                tv.jwks_endpoint
            );
            info!("  * TICKET_PUBLIC_SIGNATURE_KID: \"{}\"", tv.kid);
            info!("  * TICKET_ISS: \"{}\"", tv.issuer);
        }
    }
}

/// One fully resolved gateway definition: includes merged, constants folded.
#[derive(Debug, Clone)]
pub struct GatewayDefinition {
    pub constants: Value,
    pub route: RouteDefinition,
    pub requests: Vec<RequestDefinition>,
    pub response: ResponseDefinition,
    pub after_hooks: Value,
}

/// Reference to a shared include fragment.
#[derive(Debug, Clone, Deserialize)]
struct IncludeRef {
    file: String,
    #[serde(default)]
    arguments: Value,
}

/// Load every definition under `search_path`. A malformed file or one
/// missing `route`/`response` is logged and rejected; the rest still load.
pub fn load_definitions(search_path: &Path) -> Vec<GatewayDefinition> {
    let mut definitions = Vec::new();
    let mut files = Vec::new();
    collect_json_files(search_path, &mut files);
    files.sort();

    for file in files {
        match load_definition(&file) {
            Ok(definition) => {
                info!(
                    "  * Adding route: {} {}",
                    definition.route.method, definition.route.path
                );
                definitions.push(definition);
            }
            Err(e) => {
                error!("Rejecting gateway definition '{}': {e}", file.display());
            }
        }
    }
    definitions
}

fn collect_json_files(dir: &Path, files: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            // Include fragments live in their own directory and are only
            // read when referenced.
            if path.file_name().map(|n| n == "includes").unwrap_or(false) {
                continue;
            }
            collect_json_files(&path, files);
        } else if path.extension().map(|e| e == "json").unwrap_or(false) {
            files.push(path);
        }
    }
}

/// Load and resolve a single gateway definition file.
pub fn load_definition(path: &Path) -> GatewayResult<GatewayDefinition> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ServiceError::configuration(format!("cannot read file: {e}")))?;
    let mut document: Value = serde_json::from_str(&text)
        .map_err(|e| ServiceError::configuration(format!("parsing failed: {e}")))?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));

    let root = document
        .as_object_mut()
        .ok_or_else(|| ServiceError::configuration("definition is not a JSON object"))?;

    let constants = match root.remove("constants") {
        Some(constants) => resolve_constants(constants, base_dir)?,
        None => Value::Object(Map::new()),
    };

    let route_value = root
        .remove("route")
        .ok_or_else(|| ServiceError::configuration("definition does not include a 'route'"))?;
    let route: RouteDefinition = serde_json::from_value(route_value)
        .map_err(|e| ServiceError::configuration(format!("invalid 'route': {e}")))?;

    let mut requests = Vec::new();
    if let Some(request_values) = root.remove("requests") {
        let items = request_values.as_array().cloned().ok_or_else(|| {
            ServiceError::configuration("'requests' must be an array")
        })?;
        for item in items {
            let resolved = resolve_includes(item, base_dir)?;
            let request: RequestDefinition = serde_json::from_value(resolved)
                .map_err(|e| ServiceError::configuration(format!("invalid request: {e}")))?;
            requests.push(request);
        }
    }

    let response_value = root
        .remove("response")
        .ok_or_else(|| ServiceError::configuration("definition does not include a 'response'"))?;
    let response: ResponseDefinition = serde_json::from_value(response_value)
        .map_err(|e| ServiceError::configuration(format!("invalid 'response': {e}")))?;

    let after_hooks = root.remove("after_hooks").unwrap_or(Value::Null);

    Ok(GatewayDefinition {
        constants,
        route,
        requests,
        response,
        after_hooks,
    })
}

/// Fold include fragments into the constants object. Directly declared
/// constants always win over included ones.
fn resolve_constants(constants: Value, base_dir: &Path) -> GatewayResult<Value> {
    let mut direct = constants
        .as_object()
        .cloned()
        .ok_or_else(|| ServiceError::configuration("'constants' must be an object"))?;

    let includes = parse_include_refs(direct.remove("includes"))?;
    let mut merged = Value::Object(Map::new());
    for include in includes {
        let fragment = load_fragment(&include, base_dir)?;
        deep_merge(&mut merged, fragment);
    }
    deep_merge(&mut merged, Value::Object(direct));
    Ok(merged)
}

/// Fold include fragments into a request definition object. The fragment's
/// `${arguments.*}` tokens are substituted first, from the caller-supplied
/// arguments only; every other token is left for runtime interpolation.
/// Directly declared request keys win over included ones.
fn resolve_includes(request: Value, base_dir: &Path) -> GatewayResult<Value> {
    let mut direct = request
        .as_object()
        .cloned()
        .ok_or_else(|| ServiceError::configuration("request definition must be an object"))?;

    let includes = parse_include_refs(direct.remove("includes"))?;
    if includes.is_empty() {
        return Ok(Value::Object(direct));
    }

    let mut merged = Value::Object(Map::new());
    for include in includes {
        let mut fragment = load_fragment(&include, base_dir)?;
        substitute_arguments(&mut fragment, &include.arguments, &include.file)?;
        deep_merge(&mut merged, fragment);
    }
    deep_merge(&mut merged, Value::Object(direct));
    Ok(merged)
}

fn parse_include_refs(value: Option<Value>) -> GatewayResult<Vec<IncludeRef>> {
    match value {
        None => Ok(Vec::new()),
        Some(value) => serde_json::from_value(value)
            .map_err(|e| ServiceError::configuration(format!("invalid 'includes': {e}"))),
    }
}

fn load_fragment(include: &IncludeRef, base_dir: &Path) -> GatewayResult<Value> {
    let path = base_dir.join(&include.file);
    let text = std::fs::read_to_string(&path).map_err(|e| {
        ServiceError::configuration(format!(
            "cannot read include '{}': {e}",
            path.display()
        ))
    })?;
    serde_json::from_str(&text).map_err(|e| {
        ServiceError::configuration(format!(
            "parsing include '{}' failed: {e}",
            path.display()
        ))
    })
}

/// Replace `${arguments.<name>}` tokens in every string leaf of the fragment.
/// A referenced argument that was not supplied is a load-time error.
fn substitute_arguments(value: &mut Value, arguments: &Value, file: &str) -> GatewayResult<()> {
    match value {
        Value::String(s) => {
            while let Some(start) = s.find("${arguments.") {
                let Some(end) = s[start..].find('}') else {
                    return Err(ServiceError::configuration(format!(
                        "unterminated argument token in include '{file}'"
                    )));
                };
                let token = s[start..start + end + 1].to_string();
                let name = &token["${arguments.".len()..token.len() - 1];
                let replacement = lookup_argument(arguments, name).ok_or_else(|| {
                    ServiceError::configuration(format!(
                        "include '{file}' references missing argument '{name}'"
                    ))
                })?;
                *s = s.replace(&token, &replacement);
            }
        }
        Value::Object(map) => {
            for (_, v) in map.iter_mut() {
                substitute_arguments(v, arguments, file)?;
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                substitute_arguments(item, arguments, file)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn lookup_argument(arguments: &Value, name: &str) -> Option<String> {
    let mut node = arguments;
    for part in name.split('.') {
        node = node.get(part)?;
    }
    match node {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Recursively merge `src` into `dest`: objects merge key by key, everything
/// else is overwritten by `src`.
fn deep_merge(dest: &mut Value, src: Value) {
    match (dest, src) {
        (Value::Object(dest_map), Value::Object(src_map)) => {
            for (key, src_value) in src_map {
                match dest_map.get_mut(&key) {
                    Some(dest_value) => deep_merge(dest_value, src_value),
                    None => {
                        dest_map.insert(key, src_value);
                    }
                }
            }
        }
        (dest_slot, src_value) => *dest_slot = src_value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, value: &Value) -> PathBuf {
        let path = dir.path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, serde_json::to_string_pretty(value).unwrap()).unwrap();
        path
    }

    fn minimal_definition() -> Value {
        json!({
            "route": {"path": "/t", "method": "GET"},
            "response": {"status": 200, "json": {"ok": true}}
        })
    }

    #[test]
    fn loads_minimal_definition() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "t.json", &minimal_definition());
        let definition = load_definition(&path).unwrap();
        assert_eq!(definition.route.path, "/t");
        assert_eq!(definition.response.status, Some(200));
        assert!(definition.requests.is_empty());
    }

    #[test]
    fn missing_route_or_response_is_rejected() {
        let dir = TempDir::new().unwrap();
        let no_route = write(&dir, "a.json", &json!({"response": {}}));
        assert!(load_definition(&no_route).is_err());
        let no_response = write(
            &dir,
            "b.json",
            &json!({"route": {"path": "/t", "method": "GET"}}),
        );
        assert!(load_definition(&no_response).is_err());
    }

    #[test]
    fn malformed_json_is_rejected_but_others_still_load() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("bad.json"), "{not json").unwrap();
        write(&dir, "good.json", &minimal_definition());
        let definitions = load_definitions(dir.path());
        assert_eq!(definitions.len(), 1);
    }

    #[test]
    fn direct_constants_win_over_included() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "includes/shared.json",
            &json!({"base_url": "http://included.local", "timeout": 5}),
        );
        let path = write(
            &dir,
            "t.json",
            &json!({
                "constants": {
                    "includes": [{"file": "includes/shared.json"}],
                    "base_url": "http://direct.local"
                },
                "route": {"path": "/t", "method": "GET"},
                "response": {"json": {}}
            }),
        );
        let definition = load_definition(&path).unwrap();
        assert_eq!(definition.constants["base_url"], json!("http://direct.local"));
        assert_eq!(definition.constants["timeout"], json!(5));
    }

    #[test]
    fn request_include_substitutes_arguments() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "includes/call.json",
            &json!({
                "url": "http://${arguments.host}/v1",
                "method": "POST",
                "headers": {"X-Tenant": "${arguments.tenant}"}
            }),
        );
        let path = write(
            &dir,
            "t.json",
            &json!({
                "route": {"path": "/t", "method": "GET"},
                "requests": [{
                    "includes": [{
                        "file": "includes/call.json",
                        "arguments": {"host": "svc.local", "tenant": "acme"}
                    }],
                    "headers": {"Accept": "application/json"}
                }],
                "response": {"json": {}}
            }),
        );
        let definition = load_definition(&path).unwrap();
        let request = &definition.requests[0];
        assert_eq!(request.url, "http://svc.local/v1");
        assert_eq!(request.headers["X-Tenant"], json!("acme"));
        // direct keys merge over the fragment
        assert_eq!(request.headers["Accept"], json!("application/json"));
    }

    #[test]
    fn missing_include_argument_is_fatal() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "includes/call.json",
            &json!({"url": "http://${arguments.host}/v1", "method": "GET"}),
        );
        let path = write(
            &dir,
            "t.json",
            &json!({
                "route": {"path": "/t", "method": "GET"},
                "requests": [{"includes": [{"file": "includes/call.json"}]}],
                "response": {"json": {}}
            }),
        );
        assert!(load_definition(&path).is_err());
    }

    #[test]
    fn runtime_tokens_survive_include_merge() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "includes/call.json",
            &json!({
                "url": "http://${arguments.host}/items/${route.dynamic.id}",
                "method": "GET"
            }),
        );
        let path = write(
            &dir,
            "t.json",
            &json!({
                "route": {"path": "/t/{id}", "method": "GET"},
                "requests": [{
                    "includes": [{"file": "includes/call.json", "arguments": {"host": "h"}}]
                }],
                "response": {"json": {}}
            }),
        );
        let definition = load_definition(&path).unwrap();
        assert_eq!(definition.requests[0].url, "http://h/items/${route.dynamic.id}");
    }
}
