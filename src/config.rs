use std::env;
use std::time::Duration;

use serde::Deserialize;

use crate::error::GatewayError;
use crate::router::{ApiFlavor, Endpoint, Route, RoutingTable, WildcardRoute};

/// Default config file path, overridable with DERECHO_CONFIG.
const DEFAULT_CONFIG_PATH: &str = "derecho.toml";

#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    providers: Vec<ProviderDecl>,
    #[serde(default)]
    models: Vec<ModelDecl>,
    wildcard: Option<WildcardDecl>,
}

#[derive(Debug, Deserialize)]
struct ProviderDecl {
    name: String,
    base_url: Option<String>,
    api_key_env: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelDecl {
    name: String,
    #[serde(default)]
    aliases: Vec<String>,
    token_multiplier: Option<f64>,
    providers: Vec<ModelProviderDecl>,
}

#[derive(Debug, Deserialize)]
struct ModelProviderDecl {
    name: String,
    /// Upstream model name override; defaults to the canonical name.
    model: Option<String>,
    /// Per-endpoint base URL override.
    base_url: Option<String>,
    /// "chat_completions" (default) or "responses".
    api_type: Option<String>,
    /// Fallback endpoints start in the inactive set and are only used in
    /// panic mode or after a health transition activates them.
    #[serde(default)]
    fallback: bool,
}

#[derive(Debug, Deserialize)]
struct WildcardDecl {
    #[serde(default = "default_wildcard_provider")]
    provider: String,
    base_url: String,
    mobile_key_env: Option<String>,
    desktop_key_env: Option<String>,
}

fn default_wildcard_provider() -> String {
    "openrouter".to_string()
}

/// Runtime knobs resolved from the environment with fixed defaults.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen_addr: String,
    pub poll_interval: Duration,
    pub poll_max_interval: Duration,
    pub poll_deadline: Duration,
    pub max_concurrent_pollers: usize,
    pub persist_workers: usize,
    pub persist_buffer: usize,
    pub persist_op_timeout: Duration,
    pub strict_encryption: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            poll_interval: Duration::from_secs(2),
            poll_max_interval: Duration::from_secs(10),
            poll_deadline: Duration::from_secs(30 * 60),
            max_concurrent_pollers: 100,
            persist_workers: 5,
            persist_buffer: 500,
            persist_op_timeout: Duration::from_secs(30),
            strict_encryption: false,
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            listen_addr: env::var("LISTEN_ADDR").unwrap_or(defaults.listen_addr),
            poll_interval: Duration::from_secs(env_u64("POLL_INTERVAL_SECS", 2)),
            poll_max_interval: Duration::from_secs(env_u64("POLL_MAX_INTERVAL_SECS", 10)),
            poll_deadline: Duration::from_secs(env_u64("POLL_DEADLINE_MINS", 30) * 60),
            max_concurrent_pollers: env_u64("MAX_CONCURRENT_POLLERS", 100) as usize,
            persist_workers: env_u64("PERSIST_WORKERS", 5) as usize,
            persist_buffer: env_u64("PERSIST_BUFFER", 500) as usize,
            persist_op_timeout: Duration::from_secs(env_u64("PERSIST_OP_TIMEOUT_SECS", 30)),
            strict_encryption: env_bool("STRICT_ENCRYPTION"),
        }
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    match env::var(name) {
        Ok(v) => v.parse().unwrap_or_else(|_| {
            tracing::warn!("{name}={v} is not a number — using default {default}");
            default
        }),
        Err(_) => default,
    }
}

fn env_bool(name: &str) -> bool {
    env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

pub struct Config {
    pub table: RoutingTable,
    pub runtime: RuntimeConfig,
}

impl Config {
    /// Load the provider/model document from DERECHO_CONFIG (default
    /// `derecho.toml`) and the runtime knobs from the environment.
    /// Configuration errors are fatal.
    pub fn load() -> Result<Self, GatewayError> {
        let path = env::var("DERECHO_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let raw = std::fs::read_to_string(&path).map_err(|e| {
            GatewayError::Configuration(format!("cannot read config {path}: {e}"))
        })?;
        Ok(Self {
            table: build_routing_table(&raw)?,
            runtime: RuntimeConfig::from_env(),
        })
    }
}

/// Parse and validate the TOML provider/model document into a routing table.
pub fn build_routing_table(raw: &str) -> Result<RoutingTable, GatewayError> {
    let file: ConfigFile = toml::from_str(raw)
        .map_err(|e| GatewayError::Configuration(format!("config parse error: {e}")))?;

    let mut providers = std::collections::HashMap::new();
    for decl in &file.providers {
        if decl.name.trim().is_empty() {
            return Err(GatewayError::Configuration(
                "provider with empty name".to_string(),
            ));
        }
        if let Some(ref url) = decl.base_url {
            validate_base_url(&decl.name, url)?;
        }
        let credential = match decl.api_key_env {
            Some(ref var) => match env::var(var) {
                Ok(key) if !key.is_empty() => Some(key),
                _ => {
                    tracing::warn!(
                        provider = %decl.name,
                        env_var = %var,
                        "credential env var unset — endpoints for this provider are skipped"
                    );
                    None
                }
            },
            None => Some(String::new()),
        };
        if providers.insert(decl.name.clone(), (decl, credential)).is_some() {
            return Err(GatewayError::Configuration(format!(
                "duplicate provider name: {}",
                decl.name
            )));
        }
    }

    let mut routes = Vec::new();
    for model in &file.models {
        if model.providers.is_empty() {
            return Err(GatewayError::Configuration(format!(
                "model {} declares no providers",
                model.name
            )));
        }
        let mut endpoints = Vec::new();
        for ep in &model.providers {
            let Some((provider, credential)) = providers.get(&ep.name) else {
                return Err(GatewayError::Configuration(format!(
                    "model {} references unknown provider {}",
                    model.name, ep.name
                )));
            };
            let Some(credential) = credential else {
                // provider declared but credential missing — skip this endpoint
                continue;
            };
            let base_url = match ep.base_url.as_ref().or(provider.base_url.as_ref()) {
                Some(url) => {
                    validate_base_url(&ep.name, url)?;
                    url.clone()
                }
                None => {
                    return Err(GatewayError::Configuration(format!(
                        "model {} endpoint {} has no base_url",
                        model.name, ep.name
                    )));
                }
            };
            let api_flavor = parse_api_flavor(ep.api_type.as_deref())?;
            endpoints.push((
                Endpoint {
                    provider: ep.name.clone(),
                    base_url,
                    credential: credential.clone(),
                    upstream_model: ep.model.clone().unwrap_or_else(|| model.name.clone()),
                    api_flavor,
                },
                !ep.fallback,
            ));
        }
        if endpoints.is_empty() {
            tracing::warn!(
                model = %model.name,
                "all endpoints skipped for missing credentials — model unavailable"
            );
            continue;
        }
        routes.push(Route::new(
            model.name.trim().to_lowercase(),
            model
                .aliases
                .iter()
                .map(|a| a.trim().to_lowercase())
                .collect(),
            model.token_multiplier.unwrap_or(1.0),
            endpoints,
        ));
    }

    let wildcard = match file.wildcard {
        Some(decl) => {
            validate_base_url(&decl.provider, &decl.base_url)?;
            let mobile = decl
                .mobile_key_env
                .as_deref()
                .and_then(|v| env::var(v).ok())
                .unwrap_or_default();
            let desktop = decl
                .desktop_key_env
                .as_deref()
                .and_then(|v| env::var(v).ok())
                .unwrap_or_default();
            if mobile.is_empty() && desktop.is_empty() {
                tracing::warn!("wildcard route declared but both platform keys are empty");
            }
            Some(WildcardRoute {
                provider: decl.provider,
                base_url: decl.base_url,
                mobile_credential: mobile,
                desktop_credential: desktop,
            })
        }
        None => None,
    };

    if routes.is_empty() && wildcard.is_none() {
        tracing::error!("no models configured — every request will fail routing");
    }

    RoutingTable::build(routes, wildcard)
}

fn parse_api_flavor(raw: Option<&str>) -> Result<ApiFlavor, GatewayError> {
    match raw {
        None | Some("chat_completions") => Ok(ApiFlavor::ChatCompletions),
        Some("responses") => Ok(ApiFlavor::Responses),
        Some(other) => Err(GatewayError::Configuration(format!(
            "unknown api_type: {other}"
        ))),
    }
}

/// Base URLs must be http(s) with a non-empty host.
fn validate_base_url(provider: &str, url: &str) -> Result<(), GatewayError> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .ok_or_else(|| {
            GatewayError::Configuration(format!(
                "provider {provider} base_url must be http or https: {url}"
            ))
        })?;
    let host = rest.split('/').next().unwrap_or("");
    if host.is_empty() {
        return Err(GatewayError::Configuration(format!(
            "provider {provider} base_url has no host: {url}"
        )));
    }
    Ok(())
}
