//! # After Hooks
//!
//! Post-response side effects declared per gateway definition under
//! `after_hooks`. Hooks run after the response has been sent (or after error
//! handling produced one), on both success and failure. A failing hook is
//! logged and never alters the already-sent response, nor does it stop the
//! remaining hooks.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, error, info};

use crate::core::config::Settings;
use crate::core::error::{GatewayResult, ServiceError};
use crate::engine::environment::Environment;
use crate::plugins::ticket_validation::EXTRA_KEY;

/// A post-response side effect resolved from an `after_hook` descriptor.
#[async_trait]
pub trait AfterHook: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, environment: &mut Environment) -> GatewayResult<()>;
}

type HookCtor = Box<dyn Fn(&Map<String, Value>) -> GatewayResult<Arc<dyn AfterHook>> + Send + Sync>;

/// Startup-time registry of after-hook implementation names.
pub struct HookFactory {
    entries: HashMap<String, HookCtor>,
}

impl HookFactory {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn with_builtins(settings: &Settings, http: reqwest::Client) -> Self {
        let mut factory = Self::new();

        let endpoint = settings.completion_report_endpoint.clone();
        factory.register("report_completion", move |_definition| {
            let endpoint = endpoint.clone().ok_or_else(|| {
                ServiceError::configuration(
                    "report_completion hook declared but GATEWAY_COMPLETION_REPORT_ENDPOINT \
                     is missing",
                )
            })?;
            Ok(Arc::new(ReportCompletionHook {
                endpoint,
                http: http.clone(),
            }) as Arc<dyn AfterHook>)
        });

        factory
    }

    pub fn register<F>(&mut self, name: &str, ctor: F)
    where
        F: Fn(&Map<String, Value>) -> GatewayResult<Arc<dyn AfterHook>> + Send + Sync + 'static,
    {
        self.entries.insert(name.to_string(), Box::new(ctor));
    }

    /// Instantiate the hook a descriptor names. Unknown names are fatal
    /// configuration errors, surfaced at startup when definitions are vetted.
    pub fn resolve(&self, descriptor: &Value) -> GatewayResult<Arc<dyn AfterHook>> {
        let definition = descriptor.as_object().ok_or_else(|| {
            ServiceError::configuration(format!(
                "after_hook definition must be an object: {descriptor}"
            ))
        })?;
        let name = definition
            .get("after_hook")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ServiceError::configuration(format!(
                    "after_hook definition does not include 'after_hook' key: {descriptor}"
                ))
            })?;
        let ctor = self.entries.get(name).ok_or_else(|| {
            ServiceError::configuration(format!("unknown after_hook implementation '{name}'"))
        })?;
        ctor(definition)
    }

    /// Run every hook the environment declares, in order. Failures are logged
    /// and swallowed; the response already left the building.
    pub async fn run_all(&self, environment: &mut Environment) {
        let descriptors = match &environment.after_hooks {
            Value::Null => return,
            Value::Array(items) => items.clone(),
            other => {
                error!("'after_hooks' must be an array, got: {other}");
                return;
            }
        };
        for descriptor in &descriptors {
            let hook = match self.resolve(descriptor) {
                Ok(hook) => hook,
                Err(e) => {
                    error!("Cannot resolve after_hook {descriptor}: {e}");
                    continue;
                }
            };
            debug!(hook = hook.name(), "running after hook");
            if let Err(e) = hook.run(environment).await {
                error!("After hook '{}' failed: {}", hook.name(), e.detail().display());
            }
        }
    }
}

impl Default for HookFactory {
    fn default() -> Self {
        Self::new()
    }
}

/// Reports the call's outcome back to the ticket authority, closing the loop
/// on single-use request tickets. Requires the ticket-validation plugin to
/// have published its identity claims earlier in the call.
pub struct ReportCompletionHook {
    endpoint: String,
    http: reqwest::Client,
}

impl ReportCompletionHook {
    fn report_body(environment: &Environment) -> Value {
        match environment.error() {
            None => json!({"success": true, "status": "completed"}),
            Some(message) => json!({
                "success": false,
                "status": "completed",
                "additional_info": message,
            }),
        }
    }
}

#[async_trait]
impl AfterHook for ReportCompletionHook {
    fn name(&self) -> &str {
        "report_completion"
    }

    async fn run(&self, environment: &mut Environment) -> GatewayResult<()> {
        let grant_uuid = environment
            .get(&format!("route.extra.{EXTRA_KEY}.grant_uuid"))
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| {
                ServiceError::internal(
                    "Cannot report completion: no grant_uuid in the environment",
                )
            })?;
        let token = environment
            .get(&format!("route.extra.{EXTRA_KEY}.gateway_token"))
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| {
                ServiceError::internal(
                    "Cannot report completion: no gateway token in the environment",
                )
            })?;

        let url = format!("{}/{grant_uuid}", self.endpoint.trim_end_matches('/'));
        let response = self
            .http
            .patch(&url)
            .header("Authorization", format!("bearer {token}"))
            .json(&Self::report_body(environment))
            .send()
            .await
            .map_err(|e| ServiceError::internal(format!("Completion report failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ServiceError::internal(format!(
                "Completion report for grant '{grant_uuid}' returned status {status}"
            )));
        }
        info!(grant_uuid, "reported request completion");
        Ok(())
    }
}
