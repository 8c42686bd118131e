use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use log::debug;

use crate::config::{FallbackPolicy, LbSubsetConfig, LbType};

use super::host::{Host, HostSet, HostSnapshot};
use super::load_balancer::{HostSelector, LbContext};
use super::stats::ClusterStats;

/// Parsed subset routing configuration of a cluster.
#[derive(Debug, Default)]
pub struct LbSubsetInfo {
    enabled: bool,
    fallback_policy: FallbackPolicy,
    default_subset: BTreeMap<String, String>,
    subset_keys: Vec<BTreeSet<String>>,
}

impl LbSubsetInfo {
    pub fn new(config: &LbSubsetConfig) -> Self {
        let mut subset_keys: Vec<BTreeSet<String>> = config
            .subset_selectors
            .iter()
            .map(|keys| keys.iter().cloned().collect::<BTreeSet<_>>())
            .filter(|keys| !keys.is_empty())
            .collect();
        subset_keys.sort();
        subset_keys.dedup();

        Self {
            enabled: !subset_keys.is_empty(),
            fallback_policy: config.fallback_policy.clone(),
            default_subset: config.default_subset.clone(),
            subset_keys,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn fallback_policy(&self) -> &FallbackPolicy {
        &self.fallback_policy
    }

    pub fn default_subset(&self) -> &BTreeMap<String, String> {
        &self.default_subset
    }

    pub fn subset_keys(&self) -> &[BTreeSet<String>] {
        &self.subset_keys
    }

    /// Whether the criteria keys form one of the configured selectors.
    pub fn has_selector_for(&self, criteria: &BTreeMap<String, String>) -> bool {
        self.subset_keys.iter().any(|keys| {
            keys.len() == criteria.len() && keys.iter().all(|k| criteria.contains_key(k))
        })
    }
}

/// Load balancer that narrows the healthy hosts by request metadata before
/// delegating to a plain selection of the configured type.
pub struct SubsetLoadBalancer {
    lb_type: LbType,
    host_set: Arc<HostSet>,
    stats: ClusterStats,
    subset_info: Arc<LbSubsetInfo>,
    cache: ArcSwapOption<SubsetCache>,
}

/// Subsets of one membership snapshot, built on first use.
struct SubsetCache {
    snapshot: Arc<HostSnapshot>,
    subsets: DashMap<BTreeMap<String, String>, Arc<HostSelector>>,
    fallback: Option<HostSelector>,
}

impl SubsetLoadBalancer {
    pub fn new(
        lb_type: LbType,
        host_set: Arc<HostSet>,
        stats: ClusterStats,
        subset_info: Arc<LbSubsetInfo>,
    ) -> Self {
        Self {
            lb_type,
            host_set,
            stats,
            subset_info,
            cache: ArcSwapOption::empty(),
        }
    }

    pub fn lb_type(&self) -> LbType {
        self.lb_type
    }

    pub fn subset_info(&self) -> &Arc<LbSubsetInfo> {
        &self.subset_info
    }

    pub fn choose_host(&self, ctx: &LbContext) -> Option<Arc<Host>> {
        let cache = self.cache();

        if let Some(criteria) = ctx.metadata_match().filter(|c| !c.is_empty()) {
            if self.subset_info.has_selector_for(criteria) {
                if let Some(host) = self
                    .subset(&cache, criteria)
                    .and_then(|selector| selector.select(ctx.hash_key()))
                {
                    self.stats.lb_subsets_selected.inc();
                    return Some(host);
                }
            }
            debug!("[upstream] [subset lb] no host in subset {criteria:?}, try fallback");
        }

        let host = cache
            .fallback
            .as_ref()
            .and_then(|fallback| fallback.select(ctx.hash_key()));
        if host.is_some() {
            self.stats.lb_subsets_fallback.inc();
        } else {
            self.stats.lb_subsets_none.inc();
        }
        host
    }

    fn cache(&self) -> Arc<SubsetCache> {
        let snapshot = self.host_set.snapshot();
        if let Some(cached) = self.cache.load_full() {
            if Arc::ptr_eq(&cached.snapshot, &snapshot) {
                return cached;
            }
        }

        let fallback = match self.subset_info.fallback_policy() {
            FallbackPolicy::NoFallback => None,
            FallbackPolicy::AnyEndpoint => {
                Some(HostSelector::build(self.lb_type, snapshot.healthy_hosts()))
            }
            FallbackPolicy::DefaultSubset => Some(self.build_selector(
                snapshot.healthy_hosts(),
                self.subset_info.default_subset(),
            )),
        };

        let cached = Arc::new(SubsetCache {
            snapshot,
            subsets: DashMap::new(),
            fallback,
        });
        self.cache.store(Some(cached.clone()));
        cached
    }

    /// Selector of the subset matching `criteria`. Only non-empty subsets are
    /// cached, so the cache is bounded by the metadata the hosts carry.
    fn subset(
        &self,
        cache: &SubsetCache,
        criteria: &BTreeMap<String, String>,
    ) -> Option<Arc<HostSelector>> {
        if let Some(selector) = cache.subsets.get(criteria) {
            return Some(selector.value().clone());
        }

        let selector = self.build_selector(cache.snapshot.healthy_hosts(), criteria);
        if selector.is_empty() {
            return None;
        }

        let selector = Arc::new(selector);
        cache.subsets.insert(criteria.clone(), selector.clone());
        Some(selector)
    }

    fn build_selector(
        &self,
        hosts: &[Arc<Host>],
        criteria: &BTreeMap<String, String>,
    ) -> HostSelector {
        let matched: Vec<Arc<Host>> = hosts
            .iter()
            .filter(|h| h.matches(criteria))
            .cloned()
            .collect();
        HostSelector::build(self.lb_type, &matched)
    }
}
