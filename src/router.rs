use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::GatewayError;

/// Which upstream API shape an endpoint speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiFlavor {
    ChatCompletions,
    Responses,
}

impl ApiFlavor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChatCompletions => "chat_completions",
            Self::Responses => "responses",
        }
    }
}

/// A single upstream endpoint declared for a model route.
#[derive(Clone)]
pub struct Endpoint {
    pub provider: String,
    pub base_url: String,
    pub credential: String,
    pub upstream_model: String,
    pub api_flavor: ApiFlavor,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("provider", &self.provider)
            .field("base_url", &self.base_url)
            .field("credential", &"[REDACTED]")
            .field("upstream_model", &self.upstream_model)
            .field("api_flavor", &self.api_flavor.as_str())
            .finish()
    }
}

/// The outcome of a routing decision: everything needed to open an
/// upstream request.
#[derive(Clone)]
pub struct ResolvedEndpoint {
    pub provider: String,
    pub base_url: String,
    pub credential: String,
    pub upstream_model: String,
    pub api_flavor: ApiFlavor,
    pub token_multiplier: f64,
}

impl std::fmt::Debug for ResolvedEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedEndpoint")
            .field("provider", &self.provider)
            .field("base_url", &self.base_url)
            .field("credential", &"[REDACTED]")
            .field("upstream_model", &self.upstream_model)
            .field("api_flavor", &self.api_flavor.as_str())
            .field("token_multiplier", &self.token_multiplier)
            .finish()
    }
}

/// An endpoint plus its mutable health state. `last_transition` guards the
/// dwell time: a slot cannot leave its current state before the dwell
/// duration has elapsed since entering it.
struct EndpointSlot {
    endpoint: Endpoint,
    active: AtomicBool,
    last_transition: Mutex<Instant>,
}

impl EndpointSlot {
    fn new(endpoint: Endpoint, active: bool) -> Self {
        Self {
            endpoint,
            active: AtomicBool::new(active),
            last_transition: Mutex::new(Instant::now()),
        }
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// Flip the health state if it differs and the dwell time has elapsed.
    /// Returns true when the state actually changed.
    fn transition(&self, active: bool, dwell: Duration) -> bool {
        if self.is_active() == active {
            return false;
        }
        let mut at = self
            .last_transition
            .lock()
            .expect("endpoint transition lock poisoned");
        if at.elapsed() < dwell {
            return false;
        }
        self.active.store(active, Ordering::Relaxed);
        *at = Instant::now();
        true
    }
}

/// One model route: a canonical name, its aliases, and the endpoints that
/// serve it. Endpoint selection round-robins over the active set via a
/// shared atomic counter.
pub struct Route {
    pub canonical: String,
    pub aliases: Vec<String>,
    pub token_multiplier: f64,
    slots: Vec<EndpointSlot>,
    rr: AtomicUsize,
}

impl Route {
    pub fn new(
        canonical: impl Into<String>,
        aliases: Vec<String>,
        token_multiplier: f64,
        endpoints: Vec<(Endpoint, bool)>,
    ) -> Self {
        Self {
            canonical: canonical.into(),
            aliases,
            token_multiplier,
            slots: endpoints
                .into_iter()
                .map(|(ep, active)| EndpointSlot::new(ep, active))
                .collect(),
            rr: AtomicUsize::new(0),
        }
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.slots
            .iter()
            .map(|s| s.endpoint.provider.clone())
            .collect()
    }

    /// Pick the next endpoint. Round-robin over active endpoints; when none
    /// are active, panic mode round-robins over the full declared set so the
    /// route never returns "no endpoint" while any endpoint exists.
    fn select(&self) -> Option<ResolvedEndpoint> {
        let active: Vec<&EndpointSlot> = self.slots.iter().filter(|s| s.is_active()).collect();
        let pool: Vec<&EndpointSlot> = if active.is_empty() {
            if !self.slots.is_empty() {
                tracing::warn!(
                    model = %self.canonical,
                    "no active endpoints — panic mode, using full endpoint set"
                );
            }
            self.slots.iter().collect()
        } else {
            active
        };
        if pool.is_empty() {
            return None;
        }
        let idx = self.rr.fetch_add(1, Ordering::Relaxed) % pool.len();
        let slot = pool[idx];
        Some(ResolvedEndpoint {
            provider: slot.endpoint.provider.clone(),
            base_url: slot.endpoint.base_url.clone(),
            credential: slot.endpoint.credential.clone(),
            upstream_model: slot.endpoint.upstream_model.clone(),
            api_flavor: slot.endpoint.api_flavor,
            token_multiplier: self.token_multiplier,
        })
    }
}

/// Fallback route matching any model id that no configured route claims.
/// The credential is chosen per platform at route time.
#[derive(Clone)]
pub struct WildcardRoute {
    pub provider: String,
    pub base_url: String,
    pub mobile_credential: String,
    pub desktop_credential: String,
}

impl WildcardRoute {
    fn credential_for(&self, platform: &str) -> Option<&str> {
        let (first, second) = match platform {
            "desktop" => (&self.desktop_credential, &self.mobile_credential),
            // mobile, and anything unrecognized, prefers the mobile key
            _ => (&self.mobile_credential, &self.desktop_credential),
        };
        if !first.is_empty() {
            Some(first)
        } else if !second.is_empty() {
            Some(second)
        } else {
            None
        }
    }

    fn select(&self, model_id: &str, platform: &str) -> Option<ResolvedEndpoint> {
        let credential = self.credential_for(platform)?;
        Some(ResolvedEndpoint {
            provider: self.provider.clone(),
            base_url: self.base_url.clone(),
            credential: credential.to_string(),
            upstream_model: model_id.to_string(),
            api_flavor: ApiFlavor::ChatCompletions,
            token_multiplier: 1.0,
        })
    }
}

/// Immutable routing table. Swapped wholesale by `ModelRouter::set_routes`;
/// per-route round-robin counters and health flags stay interior-mutable so
/// a swap is the only write path through the outer lock.
pub struct RoutingTable {
    routes: Vec<Arc<Route>>,
    by_canonical: HashMap<String, usize>,
    by_alias: HashMap<String, usize>,
    wildcard: Option<WildcardRoute>,
}

impl RoutingTable {
    pub fn build(
        routes: Vec<Route>,
        wildcard: Option<WildcardRoute>,
    ) -> Result<Self, GatewayError> {
        let mut by_canonical = HashMap::new();
        let mut by_alias = HashMap::new();

        for (i, route) in routes.iter().enumerate() {
            if route.slots.is_empty() {
                return Err(GatewayError::Configuration(format!(
                    "model {} declares no endpoints",
                    route.canonical
                )));
            }
            if by_canonical.insert(route.canonical.clone(), i).is_some() {
                return Err(GatewayError::Configuration(format!(
                    "duplicate model name: {}",
                    route.canonical
                )));
            }
        }
        for (i, route) in routes.iter().enumerate() {
            for alias in &route.aliases {
                if by_canonical.contains_key(alias) || by_alias.insert(alias.clone(), i).is_some()
                {
                    return Err(GatewayError::Configuration(format!(
                        "alias {alias} resolves to more than one model"
                    )));
                }
            }
        }

        Ok(Self {
            routes: routes.into_iter().map(Arc::new).collect(),
            by_canonical,
            by_alias,
            wildcard,
        })
    }

    /// Resolution order: exact canonical, exact alias, longest canonical
    /// prefix (longer wins, ties by declaration order), wildcard.
    fn route(&self, model_id: &str, platform: &str) -> Result<ResolvedEndpoint, GatewayError> {
        let norm = model_id.trim().to_lowercase();
        if norm.is_empty() {
            return Err(GatewayError::UnknownModel(model_id.to_string()));
        }

        if let Some(&i) = self.by_canonical.get(&norm) {
            return self.routes[i]
                .select()
                .ok_or_else(|| GatewayError::UnknownModel(norm.clone()));
        }
        if let Some(&i) = self.by_alias.get(&norm) {
            return self.routes[i]
                .select()
                .ok_or_else(|| GatewayError::UnknownModel(norm.clone()));
        }

        let mut best: Option<(usize, usize)> = None; // (prefix_len, route_idx)
        for (i, route) in self.routes.iter().enumerate() {
            if norm.starts_with(&route.canonical) {
                let len = route.canonical.len();
                // strictly longer wins; equal length keeps declaration order
                if best.map(|(l, _)| len > l).unwrap_or(true) {
                    best = Some((len, i));
                }
            }
        }
        if let Some((_, i)) = best {
            return self.routes[i]
                .select()
                .ok_or_else(|| GatewayError::UnknownModel(norm.clone()));
        }

        if let Some(ref wildcard) = self.wildcard
            && let Some(ep) = wildcard.select(&norm, platform)
        {
            return Ok(ep);
        }

        Err(GatewayError::UnknownModel(norm))
    }

    fn find_route(&self, canonical: &str) -> Option<&Arc<Route>> {
        self.by_canonical
            .get(canonical)
            .map(|&i| &self.routes[i])
    }
}

/// Summary of a configured model, for the model-listing endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub name: String,
    pub aliases: Vec<String>,
    pub providers: Vec<String>,
    pub token_multiplier: f64,
}

/// Maps client model ids to provider endpoints. Reads hold the table lock
/// only long enough to clone the current `Arc`; `set_routes` swaps the whole
/// table and is observed as of the next routing decision.
pub struct ModelRouter {
    table: RwLock<Arc<RoutingTable>>,
}

impl ModelRouter {
    pub fn new(table: RoutingTable) -> Self {
        Self {
            table: RwLock::new(Arc::new(table)),
        }
    }

    fn snapshot(&self) -> Arc<RoutingTable> {
        self.table
            .read()
            .expect("routing table lock poisoned")
            .clone()
    }

    pub fn route(
        &self,
        model_id: &str,
        platform: &str,
    ) -> Result<ResolvedEndpoint, GatewayError> {
        self.snapshot().route(model_id, platform)
    }

    /// Atomically replace the whole routing table.
    pub fn set_routes(&self, table: RoutingTable) {
        let mut guard = self.table.write().expect("routing table lock poisoned");
        *guard = Arc::new(table);
    }

    pub fn list_models(&self) -> Vec<ModelInfo> {
        let table = self.snapshot();
        let mut models: Vec<ModelInfo> = table
            .routes
            .iter()
            .map(|r| ModelInfo {
                name: r.canonical.clone(),
                aliases: r.aliases.clone(),
                providers: r.provider_names(),
                token_multiplier: r.token_multiplier,
            })
            .collect();
        models.sort_by(|a, b| a.name.cmp(&b.name));
        models
    }
}

/// External health evaluator hook. Transitions are guarded by a dwell time
/// so a flapping metrics query cannot bounce an endpoint in and out of the
/// active set.
pub struct HealthController {
    router: Arc<ModelRouter>,
    dwell: Duration,
}

impl HealthController {
    pub fn new(router: Arc<ModelRouter>, dwell: Duration) -> Self {
        Self { router, dwell }
    }

    /// Mark every endpoint of `provider` under the given model route as
    /// active or inactive. Returns the number of endpoints whose state
    /// actually changed.
    pub fn mark(&self, canonical: &str, provider: &str, active: bool) -> usize {
        let table = self.router.snapshot();
        let Some(route) = table.find_route(canonical) else {
            tracing::warn!(model = canonical, "health mark for unknown model");
            return 0;
        };
        let mut changed = 0;
        for slot in &route.slots {
            if slot.endpoint.provider == provider && slot.transition(active, self.dwell) {
                changed += 1;
                tracing::info!(
                    model = canonical,
                    provider,
                    active,
                    "endpoint health transition"
                );
            }
        }
        changed
    }
}
