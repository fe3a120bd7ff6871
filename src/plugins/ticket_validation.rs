//! # Ticket Validation Plugin
//!
//! Gates a route behind an opaque, signed request ticket presented in the
//! `X-Request-Ticket` header. The ticket's signature is verified against a
//! JWKS-published public key, its issuer and audience claims are checked, and
//! the ticket is then introspected with the issuing authority. On success the
//! verified identity claims are published into `route.extra` for downstream
//! operations and after-hooks.
//!
//! Authority state (discovered token endpoint, bearer token, public key) is
//! process-wide and shared across concurrent calls through an injected
//! [`AuthorityCache`]. Writes are optimistic: concurrent refreshes may race
//! but fetch the same externally derived value, so the last write wins and a
//! stale-then-refreshed token only costs one extra round trip.

use std::sync::Arc;

use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use parking_lot::RwLock;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::core::config::TicketValidationSettings;
use crate::core::error::{GatewayResult, ServiceError};
use crate::engine::environment::Environment;
use crate::plugins::{GatewayPlugin, InboundCall};

/// Header carrying the request ticket.
pub const TICKET_HEADER: &str = "X-Request-Ticket";

/// Key under `route.extra` where verified identity claims are published.
pub const EXTRA_KEY: &str = "ticket_validation";

const MAX_INTROSPECTION_ATTEMPTS: u32 = 3;

/// Process-wide cached authority state, shared across concurrent calls.
///
/// The read path never blocks on a refresh; the short-lived locks only guard
/// the pointer swap itself.
#[derive(Default)]
pub struct AuthorityCache {
    token_endpoint: RwLock<Option<String>>,
    access_token: RwLock<Option<String>>,
    verification_key: RwLock<Option<Arc<VerificationKey>>>,
}

/// Decoded JWKS key material plus its declared algorithm.
pub struct VerificationKey {
    key: DecodingKey,
    algorithm: Algorithm,
}

impl AuthorityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token_endpoint(&self) -> Option<String> {
        self.token_endpoint.read().clone()
    }

    pub fn store_token_endpoint(&self, endpoint: String) {
        *self.token_endpoint.write() = Some(endpoint);
    }

    pub fn access_token(&self) -> Option<String> {
        self.access_token.read().clone()
    }

    pub fn store_access_token(&self, token: String) {
        *self.access_token.write() = Some(token);
    }

    fn verification_key(&self) -> Option<Arc<VerificationKey>> {
        self.verification_key.read().clone()
    }

    fn store_verification_key(&self, key: Arc<VerificationKey>) {
        *self.verification_key.write() = Some(key);
    }
}

pub struct TicketValidationPlugin {
    definition: Map<String, Value>,
    settings: TicketValidationSettings,
    http: reqwest::Client,
    authority: Arc<AuthorityCache>,
}

impl TicketValidationPlugin {
    pub fn new(
        definition: Map<String, Value>,
        settings: TicketValidationSettings,
        http: reqwest::Client,
        authority: Arc<AuthorityCache>,
    ) -> Self {
        Self {
            definition,
            settings,
            http,
            authority,
        }
    }

    fn ticket_from_headers(&self, environment: &Environment) -> GatewayResult<String> {
        let headers = environment
            .get("route.headers")
            .map_err(|e| ServiceError::internal_with_log("Cannot read request headers", e.0))?;
        let ticket = headers.as_object().and_then(|map| {
            map.iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(TICKET_HEADER))
                .and_then(|(_, value)| value.as_str())
                .map(str::to_string)
        });
        ticket.ok_or_else(|| {
            ServiceError::authorization(format!(
                "{TICKET_HEADER} field was missing in the HTTP headers."
            ))
        })
    }

    /// One-time JWKS fetch, keyed by the configured kid, cached across calls.
    async fn fetch_verification_key(&self) -> GatewayResult<Arc<VerificationKey>> {
        let response = self
            .http
            .get(&self.settings.jwks_endpoint)
            .send()
            .await
            .map_err(|e| ServiceError::internal(format!("Cannot get JWKS: {e}")))?;
        let jwks: Value = response
            .json()
            .await
            .map_err(|e| ServiceError::internal(format!("JWKS response is not valid JSON: {e}")))?;

        let keys = jwks
            .get("keys")
            .and_then(Value::as_array)
            .ok_or_else(|| ServiceError::internal("JWKS response has no 'keys'"))?;
        let jwk = keys
            .iter()
            .find(|k| k.get("kid").and_then(Value::as_str) == Some(self.settings.kid.as_str()))
            .ok_or_else(|| {
                ServiceError::internal(format!(
                    "JWKS does not contain key id '{}'",
                    self.settings.kid
                ))
            })?;

        let n = jwk
            .get("n")
            .and_then(Value::as_str)
            .ok_or_else(|| ServiceError::internal("JWK is missing 'n'"))?;
        let e = jwk
            .get("e")
            .and_then(Value::as_str)
            .ok_or_else(|| ServiceError::internal("JWK is missing 'e'"))?;
        let key = DecodingKey::from_rsa_components(n, e)
            .map_err(|e| ServiceError::internal(format!("Cannot build public key: {e}")))?;

        let algorithm = match jwk.get("alg").and_then(Value::as_str) {
            None => Algorithm::RS256,
            Some(alg) => alg.parse().map_err(|_| {
                ServiceError::internal(format!("Unsupported JWK algorithm '{alg}'"))
            })?,
        };

        let key = Arc::new(VerificationKey { key, algorithm });
        self.authority.store_verification_key(key.clone());
        Ok(key)
    }

    /// Verify the ticket signature and return its claims. Invalid signatures
    /// and undecodable claims are client errors.
    async fn verify_signature(&self, ticket: &str) -> GatewayResult<Value> {
        let key = match self.authority.verification_key() {
            Some(key) => key,
            None => self.fetch_verification_key().await?,
        };

        let mut validation = Validation::new(key.algorithm);
        validation.leeway = self.settings.exp_leeway_seconds;
        validation.validate_aud = false;

        match decode::<Value>(ticket, &key.key, &validation) {
            Ok(data) => Ok(data.claims),
            Err(e) => match e.kind() {
                jsonwebtoken::errors::ErrorKind::InvalidSignature => Err(
                    ServiceError::bad_request(format!("Invalid signature: {e}")),
                ),
                jsonwebtoken::errors::ErrorKind::Json(_) => Err(ServiceError::bad_request(
                    format!("Error decoding ticket claims: {e}"),
                )),
                _ => Err(ServiceError::bad_request(format!("Invalid ticket: {e}"))),
            },
        }
    }

    fn verify_issuer(&self, claims: &Value) -> GatewayResult<()> {
        let issuer = claims
            .get("iss")
            .and_then(Value::as_str)
            .ok_or_else(|| ServiceError::bad_request("iss claim missing."))?;
        if issuer != self.settings.issuer {
            return Err(ServiceError::authorization(format!(
                "Bad issuer. Expected '{}' but got '{issuer}'",
                self.settings.issuer
            )));
        }
        Ok(())
    }

    /// Check the audience claim against either the configured value or one
    /// derived from the request URL.
    ///
    /// The derived audience is the URL prefix plus the longest common prefix
    /// between the actual request path and the route's declared path pattern.
    /// Dynamic segments have already been substituted with concrete values of
    /// a different length than their placeholder names, so audiences
    /// containing dynamic segments may under- or over-match. Known quirk,
    /// kept as documented behavior.
    fn verify_audience(
        &self,
        claims: &Value,
        environment: &Environment,
        inbound: &InboundCall,
    ) -> GatewayResult<()> {
        let claimed = claims
            .get("aud")
            .and_then(Value::as_str)
            .ok_or_else(|| ServiceError::bad_request("aud claim missing."))?;

        let expected = match self.definition.get("aud").and_then(Value::as_str) {
            Some(aud) => aud.to_string(),
            None => {
                let parts: Vec<&str> = inbound.url.splitn(4, '/').collect();
                let prefix = parts[..parts.len().min(3)].join("/");
                let path = format!("/{}", parts.get(3).unwrap_or(&""));

                let mut aud = prefix;
                for (actual, declared) in path.chars().zip(environment.route.path.chars()) {
                    if actual != declared {
                        break;
                    }
                    aud.push(actual);
                }
                aud.trim_end_matches('/').to_string()
            }
        };

        debug!(ticket_aud = claimed, request_aud = %expected, "checking ticket audience");
        if claimed != expected {
            return Err(ServiceError::forbidden(format!(
                "Wrong audience. Expecting '{expected}' but got '{claimed}'."
            )));
        }
        Ok(())
    }

    /// One-time discovery-document fetch for the token endpoint.
    async fn discover_token_endpoint(&self) -> GatewayResult<String> {
        info!(
            "Fetching openid configuration from '{}'",
            self.settings.openid_configuration_url
        );
        let response = self
            .http
            .get(&self.settings.openid_configuration_url)
            .send()
            .await
            .map_err(|e| {
                ServiceError::internal(format!(
                    "Couldn't connect to the openid-configuration endpoint: {e}"
                ))
            })?;
        let document: Value = response.json().await.map_err(|e| {
            ServiceError::internal(format!("Error parsing OpenId configuration: {e}"))
        })?;
        let endpoint = document
            .get("token_endpoint")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ServiceError::internal("OpenId configuration has no 'token_endpoint'")
            })?
            .to_string();
        self.authority.store_token_endpoint(endpoint.clone());
        Ok(endpoint)
    }

    /// Fetch a fresh bearer token with client credentials and cache it.
    async fn refresh_access_token(&self) -> GatewayResult<String> {
        let endpoint = match self.authority.token_endpoint() {
            Some(endpoint) => endpoint,
            None => self.discover_token_endpoint().await?,
        };

        let response = self
            .http
            .post(&endpoint)
            .basic_auth(&self.settings.client_id, Some(&self.settings.client_secret))
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body("grant_type=client_credentials&scope=gateway")
            .send()
            .await
            .map_err(|e| ServiceError::internal(format!("Cannot get gateway token: {e}")))?;

        let status = response.status();
        debug!(status = status.as_u16(), "token endpoint response");
        if !status.is_success() {
            return Err(ServiceError::internal(format!(
                "Token endpoint returned status {status}"
            )));
        }
        let body: Value = response.json().await.map_err(|_| {
            ServiceError::internal("Did not receive JSON response from token endpoint")
        })?;
        let token = body
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ServiceError::internal("access_token is not present in token endpoint response")
            })?
            .to_string();
        self.authority.store_access_token(token.clone());
        Ok(token)
    }

    /// Introspect the ticket with the issuing authority. A `401` means the
    /// cached bearer token went stale: refresh once and retry, within a
    /// 3-attempt limit. Any other non-200 status is a fatal internal error.
    async fn introspect(&self, ticket: &str, environment: &mut Environment) -> GatewayResult<()> {
        let mut token = match self.authority.access_token() {
            Some(token) => token,
            None => self.refresh_access_token().await?,
        };

        for attempt in 1..=MAX_INTROSPECTION_ATTEMPTS {
            let response = self
                .http
                .post(&self.settings.introspection_endpoint)
                .header("Authorization", format!("bearer {token}"))
                .json(&json!({ "request_ticket": ticket }))
                .send()
                .await
                .map_err(|e| {
                    ServiceError::internal(format!("Connection to the ticket authority failed: {e}"))
                })?;

            let status = response.status();
            if status.as_u16() == 200 {
                let body: Value = response.json().await.map_err(|_| {
                    ServiceError::internal("Introspection response is not valid JSON")
                })?;
                if body.get("active") != Some(&Value::Bool(true)) {
                    let mut message = "Request ticket is not active or valid.".to_string();
                    if let Some(reason) = body.get("reason").and_then(Value::as_str) {
                        message.push_str(&format!(" Reason: '{reason}'"));
                    }
                    return Err(ServiceError::bad_request(message));
                }
                if body.get("grant_uuid").is_some() {
                    let extra = self.identity_claims(&body, &token)?;
                    environment
                        .set(&format!("route.extra.{EXTRA_KEY}"), extra)
                        .map_err(ServiceError::from)?;
                } else {
                    warn!("grant_uuid missing from introspection response");
                }
                return Ok(());
            }

            if status.as_u16() == 401 {
                info!(attempt, "gateway token has expired, refreshing");
                if attempt < MAX_INTROSPECTION_ATTEMPTS {
                    token = self.refresh_access_token().await?;
                }
                continue;
            }

            let text = response.text().await.unwrap_or_default();
            return Err(ServiceError::internal(format!(
                "Introspection response has unknown status code: {}, response: {text}",
                status.as_u16()
            )));
        }
        Err(ServiceError::internal("Could not validate request ticket"))
    }

    /// Shape the introspection response into the identity claims published
    /// under `route.extra`. First occurrence wins for per-country SSNs and
    /// the pairwise id; emails and phone numbers collect in order.
    fn identity_claims(&self, body: &Value, token: &str) -> GatewayResult<Value> {
        let mut extra = json!({
            "grant_uuid": body["grant_uuid"],
            "gateway_token": token,
        });

        let Some(identifiers) = body.get("identifiers").and_then(Value::as_array) else {
            return Ok(extra);
        };

        let mut out = Map::new();
        for identifier in identifiers {
            let id_type = identifier
                .get("id_type")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    ServiceError::internal(
                        "id_type missing in identifier returned by ticket introspection",
                    )
                })?;
            let id = identifier.get("id").cloned().unwrap_or(Value::Null);

            match id_type {
                "ssn" => {
                    let country = identifier
                        .get("country")
                        .and_then(Value::as_str)
                        .ok_or_else(|| {
                            ServiceError::internal(
                                "country missing in identifier returned by ticket introspection",
                            )
                        })?;
                    let ssn = out
                        .entry("ssn".to_string())
                        .or_insert_with(|| json!({}))
                        .as_object_mut()
                        .expect("ssn entry is an object");
                    if ssn.contains_key(country) {
                        warn!("Multiple {country}-ssn pairs detected. Only picking the first one.");
                        continue;
                    }
                    ssn.insert(country.to_string(), id);
                }
                "email" => {
                    out.entry("email".to_string())
                        .or_insert_with(|| json!([]))
                        .as_array_mut()
                        .expect("email entry is an array")
                        .push(id);
                }
                "phone_number" => {
                    out.entry("phone_number".to_string())
                        .or_insert_with(|| json!([]))
                        .as_array_mut()
                        .expect("phone_number entry is an array")
                        .push(id);
                }
                "pairwise" => {
                    if out.contains_key("pairwise") {
                        warn!("Multiple pairwises detected. Only picking the first one.");
                        continue;
                    }
                    out.insert("pairwise".to_string(), id);
                }
                other => {
                    debug!(id_type = other, "ignoring unrecognized identifier type");
                }
            }
        }
        extra["identifiers"] = Value::Object(out);
        Ok(extra)
    }
}

#[async_trait]
impl GatewayPlugin for TicketValidationPlugin {
    fn name(&self) -> &str {
        "ticket_validation"
    }

    async fn before(
        &self,
        environment: &mut Environment,
        inbound: &InboundCall,
    ) -> GatewayResult<()> {
        let ticket = self.ticket_from_headers(environment)?;
        let claims = self.verify_signature(&ticket).await?;
        self.verify_issuer(&claims)?;
        self.verify_audience(&claims, environment, inbound)?;
        self.introspect(&ticket, environment).await
    }
}
