//! Endpoint registry
//!
//! Maps endpoint names to URL paths and subscription tiers. The registry is
//! static; a request is only emitted for endpoints whose tier is in the
//! user's enabled tier set.

/// Valid subscription tiers.
pub const TIER_NAMES: [&str; 3] = ["classic", "state", "orderflow"];

/// (name, URL path under `<base>/<ticker>/`, tier)
const ENDPOINTS: &[(&str, &str, &str)] = &[
    // Classic subscription
    ("classic_full", "classic/full", "classic"),
    ("classic_zero", "classic/zero", "classic"),
    ("classic_one", "classic/one", "classic"),
    ("classic_full_majors", "classic/full/majors", "classic"),
    ("classic_zero_majors", "classic/zero/majors", "classic"),
    ("classic_one_majors", "classic/one/majors", "classic"),
    ("classic_full_maxchange", "classic/full/maxchange", "classic"),
    ("classic_zero_maxchange", "classic/zero/maxchange", "classic"),
    ("classic_one_maxchange", "classic/one/maxchange", "classic"),
    // State subscription
    ("state_full", "state/full", "state"),
    ("state_zero", "state/zero", "state"),
    ("state_one", "state/one", "state"),
    ("state_full_majors", "state/full/majors", "state"),
    ("state_zero_majors", "state/zero/majors", "state"),
    ("state_one_majors", "state/one/majors", "state"),
    ("state_full_maxchange", "state/full/maxchange", "state"),
    ("state_zero_maxchange", "state/zero/maxchange", "state"),
    ("state_one_maxchange", "state/one/maxchange", "state"),
    // Options profile greeks (state subscription)
    ("delta_zero", "state/delta_zero", "state"),
    ("gamma_zero", "state/gamma_zero", "state"),
    ("delta_one", "state/delta_one", "state"),
    ("gamma_one", "state/gamma_one", "state"),
    // Options profile greeks (orderflow subscription)
    ("charm_zero", "state/charm_zero", "orderflow"),
    ("vanna_zero", "state/vanna_zero", "orderflow"),
    ("charm_one", "state/charm_one", "orderflow"),
    ("vanna_one", "state/vanna_one", "orderflow"),
    // Legacy names kept for configs written by older releases
    ("state_gamma", "state/gamma_zero", "state"),
    ("state_onegamma", "state/gamma_one", "state"),
    ("state_delta", "state/delta_zero", "state"),
    ("state_onedelta", "state/delta_one", "state"),
    ("state_vanna", "state/vanna_zero", "orderflow"),
    ("state_onevanna", "state/vanna_one", "orderflow"),
    ("state_charm", "state/charm_zero", "orderflow"),
    ("state_onecharm", "state/charm_one", "orderflow"),
    // Orderflow subscription
    ("orderflow", "orderflow/orderflow", "orderflow"),
];

/// Chart-display subset per tier: the minimal endpoints that feed the
/// shell's plots.
const CHART_ENDPOINTS: &[(&str, &[&str])] = &[
    ("classic", &["classic_zero", "classic_zero_majors"]),
    ("state", &["gamma_zero"]),
    ("orderflow", &[]),
];

/// URL path for an endpoint, if known.
pub fn endpoint_path(endpoint: &str) -> Option<&'static str> {
    ENDPOINTS
        .iter()
        .find(|(name, _, _)| *name == endpoint)
        .map(|(_, path, _)| *path)
}

/// Subscription tier an endpoint belongs to, if known.
pub fn endpoint_tier(endpoint: &str) -> Option<&'static str> {
    ENDPOINTS
        .iter()
        .find(|(name, _, _)| *name == endpoint)
        .map(|(_, _, tier)| *tier)
}

pub fn is_known_endpoint(endpoint: &str) -> bool {
    endpoint_path(endpoint).is_some()
}

/// Full request URL for an endpoint, or `None` for unknown names.
pub fn endpoint_url(base: &str, ticker: &str, endpoint: &str, api_key: &str) -> Option<String> {
    endpoint_path(endpoint).map(|path| format!("{base}/{ticker}/{path}?key={api_key}"))
}

/// Every endpoint available under the given tiers, registry order, deduped.
pub fn endpoints_for_tiers(tiers: &[String]) -> Vec<String> {
    let mut result = Vec::new();
    for (name, _, tier) in ENDPOINTS {
        if tiers.iter().any(|t| t == tier) && !result.iter().any(|e| e == name) {
            result.push((*name).to_string());
        }
    }
    result
}

/// Only the endpoints needed for chart display under the given tiers.
pub fn chart_endpoints_for_tiers(tiers: &[String]) -> Vec<String> {
    let mut result = Vec::new();
    for tier in tiers {
        if let Some((_, endpoints)) = CHART_ENDPOINTS.iter().find(|(t, _)| t == tier) {
            for endpoint in *endpoints {
                if !result.iter().any(|e| e == endpoint) {
                    result.push((*endpoint).to_string());
                }
            }
        }
    }
    result
}
