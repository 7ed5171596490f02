//! Query planning
//!
//! Decides, for a batch of tickers, which endpoints to call this cycle. The
//! plan is rebuilt from settings every time and never persisted.

use crate::api::{endpoints, QueryPlanItem};
use crate::config::Settings;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;

/// Plot names each endpoint feeds. An endpoint is skipped in chart-only mode
/// only when every one of its plots is hidden; endpoints with no declared
/// plots are always kept.
const ENDPOINT_PLOTS: &[(&str, &[&str])] = &[
    ("classic_zero", &["spot", "zero_gamma"]),
    (
        "classic_zero_majors",
        &[
            "major_pos_vol",
            "major_neg_vol",
            "major_positive",
            "major_negative",
            "major_pos_oi",
            "major_neg_oi",
            "major_long_gamma",
            "major_short_gamma",
        ],
    ),
    (
        "gamma_zero",
        &["zero_gamma", "major_long_gamma", "major_short_gamma"],
    ),
];

/// Builds per-cycle query plans from settings and the enabled-ticker set
pub struct QueryPlanner {
    settings: Arc<RwLock<Settings>>,
    enabled_tickers: RwLock<Vec<String>>,
}

impl QueryPlanner {
    pub fn new(settings: Arc<RwLock<Settings>>, enabled_tickers: Vec<String>) -> Self {
        Self {
            settings,
            enabled_tickers: RwLock::new(enabled_tickers),
        }
    }

    pub fn set_enabled_tickers(&self, tickers: Vec<String>) {
        *self.enabled_tickers.write() = tickers;
    }

    /// Endpoints for the current mode, paired with each enabled input
    /// ticker. Tickers not enabled for collection are dropped.
    pub fn build_plan(&self, tickers: &[String]) -> Vec<QueryPlanItem> {
        let (tiers, collect_all, hidden_plots) = {
            let settings = self.settings.read();
            (
                settings.subscription_tiers(),
                settings.collect_all_endpoints,
                settings.hidden_plots.clone(),
            )
        };

        let mut plan_endpoints = if collect_all {
            endpoints::endpoints_for_tiers(&tiers)
        } else {
            endpoints::chart_endpoints_for_tiers(&tiers)
        };
        if !collect_all && !hidden_plots.is_empty() {
            plan_endpoints = filter_by_hidden_plots(plan_endpoints, &hidden_plots);
        }

        let enabled = self.enabled_tickers.read();
        tickers
            .iter()
            .filter(|t| enabled.iter().any(|e| e == *t))
            .map(|ticker| QueryPlanItem {
                ticker: ticker.clone(),
                endpoints: plan_endpoints.clone(),
            })
            .collect()
    }
}

fn filter_by_hidden_plots(endpoints: Vec<String>, hidden_plots: &[String]) -> Vec<String> {
    let hidden: HashSet<&str> = hidden_plots.iter().map(String::as_str).collect();

    endpoints
        .into_iter()
        .filter(|endpoint| {
            match ENDPOINT_PLOTS.iter().find(|(name, _)| name == endpoint) {
                // No declared plots: keep.
                None => true,
                Some((_, plots)) => plots.iter().any(|plot| !hidden.contains(plot)),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planner(settings: Settings, enabled: Vec<&str>) -> QueryPlanner {
        QueryPlanner::new(
            Arc::new(RwLock::new(settings)),
            enabled.into_iter().map(String::from).collect(),
        )
    }

    #[test]
    fn test_chart_only_plan_for_classic() {
        let planner = planner(Settings::default(), vec!["SPX"]);
        let plan = planner.build_plan(&["SPX".to_string()]);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].ticker, "SPX");
        assert_eq!(plan[0].endpoints, vec!["classic_zero", "classic_zero_majors"]);
    }

    #[test]
    fn test_collect_all_plan() {
        let settings = Settings {
            collect_all_endpoints: true,
            ..Default::default()
        };
        let planner = planner(settings, vec!["SPX"]);
        let plan = planner.build_plan(&["SPX".to_string()]);
        assert_eq!(plan[0].endpoints.len(), 9);
    }

    #[test]
    fn test_disabled_ticker_dropped() {
        let planner = planner(Settings::default(), vec!["SPX"]);
        let plan = planner.build_plan(&["NDX".to_string(), "SPX".to_string()]);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].ticker, "SPX");
    }

    #[test]
    fn test_hidden_plots_skip_fully_hidden_endpoint() {
        let settings = Settings {
            hidden_plots: vec!["spot".to_string(), "zero_gamma".to_string()],
            ..Default::default()
        };
        let planner = planner(settings, vec!["SPX"]);
        let plan = planner.build_plan(&["SPX".to_string()]);
        // classic_zero's plots are all hidden; classic_zero_majors survives.
        assert_eq!(plan[0].endpoints, vec!["classic_zero_majors"]);
    }

    #[test]
    fn test_partially_hidden_endpoint_kept() {
        let settings = Settings {
            hidden_plots: vec!["spot".to_string()],
            ..Default::default()
        };
        let planner = planner(settings, vec!["SPX"]);
        let plan = planner.build_plan(&["SPX".to_string()]);
        assert!(plan[0].endpoints.contains(&"classic_zero".to_string()));
    }
}
