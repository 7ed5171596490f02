//! Query validation
//!
//! The planner produces (ticker, endpoints) items; this layer drops any
//! (ticker, endpoint) pair whose endpoint is unknown or whose tier is not in
//! the user's enabled tier set.

use crate::api::endpoints::{endpoint_tier, is_known_endpoint, TIER_NAMES};
use crate::api::Client;
use crate::config::Settings;
use parking_lot::RwLock;
use std::sync::Arc;

/// A single (ticker, endpoint) fetch
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Query {
    pub ticker: String,
    pub endpoint: String,
}

/// A ticker with the endpoints to fetch for it this cycle
#[derive(Debug, Clone)]
pub struct QueryPlanItem {
    pub ticker: String,
    pub endpoints: Vec<String>,
}

/// Holds the client and validates planned queries against the subscription
pub struct QuerySystem {
    settings: Arc<RwLock<Settings>>,
    client: Arc<Client>,
}

impl QuerySystem {
    pub fn new(settings: Arc<RwLock<Settings>>, client: Arc<Client>) -> Self {
        Self { settings, client }
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    /// Drop unknown endpoints and endpoints outside the enabled tiers, then
    /// flatten the plan into individual queries.
    pub fn validate_and_filter(&self, plan: &[QueryPlanItem]) -> Vec<Query> {
        let tiers = self.enabled_tiers();

        let mut validated = Vec::new();
        for item in plan {
            for endpoint in &item.endpoints {
                if !is_known_endpoint(endpoint) {
                    continue;
                }
                match endpoint_tier(endpoint) {
                    Some(tier) if !tiers.iter().any(|t| t == tier) => continue,
                    _ => {}
                }
                validated.push(Query {
                    ticker: item.ticker.clone(),
                    endpoint: endpoint.clone(),
                });
            }
        }
        validated
    }

    /// Enabled tiers, restricted to valid names, defaulting to classic.
    fn enabled_tiers(&self) -> Vec<String> {
        let tiers = self.settings.read().subscription_tiers();
        let filtered: Vec<String> = tiers
            .into_iter()
            .filter(|t| TIER_NAMES.contains(&t.as_str()))
            .collect();
        if filtered.is_empty() {
            vec!["classic".to_string()]
        } else {
            filtered
        }
    }
}
