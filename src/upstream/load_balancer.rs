use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use pingora_load_balancing::{
    selection::{
        consistent::KetamaHashing, BackendIter, BackendSelection, FVNHash, Random, RoundRobin,
    },
    Backend,
};

use crate::config::LbType;

use super::host::{Host, HostSet, HostSnapshot};
use super::stats::ClusterStats;
use super::subset::{LbSubsetInfo, SubsetLoadBalancer};

/// Per request inputs of host selection.
#[derive(Clone, Debug, Default)]
pub struct LbContext {
    hash_key: Vec<u8>,
    metadata_match: Option<BTreeMap<String, String>>,
}

impl LbContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Key used by the hashing algorithms.
    pub fn with_hash_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.hash_key = key.into();
        self
    }

    /// Metadata a host must carry to be picked by a subset load balancer.
    pub fn with_metadata_match(mut self, criteria: BTreeMap<String, String>) -> Self {
        self.metadata_match = Some(criteria);
        self
    }

    pub fn hash_key(&self) -> &[u8] {
        &self.hash_key
    }

    pub fn metadata_match(&self) -> Option<&BTreeMap<String, String>> {
        self.metadata_match.as_ref()
    }
}

/// Load balancer of a cluster, fixed at construction.
pub enum LoadBalancer {
    Plain(PlainLoadBalancer),
    Subset(SubsetLoadBalancer),
}

impl LoadBalancer {
    pub fn new(lb_type: LbType, host_set: Arc<HostSet>) -> Self {
        LoadBalancer::Plain(PlainLoadBalancer::new(lb_type, host_set))
    }

    pub fn new_subset(
        lb_type: LbType,
        host_set: Arc<HostSet>,
        stats: ClusterStats,
        subset_info: Arc<LbSubsetInfo>,
    ) -> Self {
        LoadBalancer::Subset(SubsetLoadBalancer::new(
            lb_type,
            host_set,
            stats,
            subset_info,
        ))
    }

    /// Picks the host for the next request, `None` when nothing is eligible.
    pub fn choose_host(&self, ctx: &LbContext) -> Option<Arc<Host>> {
        match self {
            LoadBalancer::Plain(lb) => lb.choose_host(ctx),
            LoadBalancer::Subset(lb) => lb.choose_host(ctx),
        }
    }

    /// Selection algorithm; for the subset form, the one used inside subsets.
    pub fn lb_type(&self) -> LbType {
        match self {
            LoadBalancer::Plain(lb) => lb.lb_type,
            LoadBalancer::Subset(lb) => lb.lb_type(),
        }
    }

    pub fn is_subset(&self) -> bool {
        matches!(self, LoadBalancer::Subset(_))
    }
}

/// Load balancer over the healthy hosts of a host set.
pub struct PlainLoadBalancer {
    lb_type: LbType,
    host_set: Arc<HostSet>,
    cache: ArcSwapOption<CachedSelector>,
}

struct CachedSelector {
    snapshot: Arc<HostSnapshot>,
    selector: HostSelector,
}

impl PlainLoadBalancer {
    pub fn new(lb_type: LbType, host_set: Arc<HostSet>) -> Self {
        Self {
            lb_type,
            host_set,
            cache: ArcSwapOption::empty(),
        }
    }

    pub fn choose_host(&self, ctx: &LbContext) -> Option<Arc<Host>> {
        self.selector().selector.select(ctx.hash_key())
    }

    /// Selector of the current membership, rebuilt when the snapshot changes.
    fn selector(&self) -> Arc<CachedSelector> {
        let snapshot = self.host_set.snapshot();
        if let Some(cached) = self.cache.load_full() {
            if Arc::ptr_eq(&cached.snapshot, &snapshot) {
                return cached;
            }
        }

        let cached = Arc::new(CachedSelector {
            selector: HostSelector::build(self.lb_type, snapshot.healthy_hosts()),
            snapshot,
        });
        self.cache.store(Some(cached.clone()));
        cached
    }
}

enum Selection {
    RoundRobin(Arc<RoundRobin>),
    Random(Arc<Random>),
    Fnv(Arc<FVNHash>),
    Ketama(Arc<KetamaHashing>),
}

impl Selection {
    fn build(lb_type: LbType, backends: &BTreeSet<Backend>) -> Self {
        match lb_type {
            LbType::RoundRobin => Selection::RoundRobin(Arc::new(RoundRobin::build(backends))),
            LbType::Random => Selection::Random(Arc::new(Random::build(backends))),
            LbType::Fnv => Selection::Fnv(Arc::new(FVNHash::build(backends))),
            LbType::Ketama => Selection::Ketama(Arc::new(KetamaHashing::build(backends))),
        }
    }

    fn select(&self, key: &[u8]) -> Option<Backend> {
        match self {
            Selection::RoundRobin(s) => BackendIter::next(&mut s.iter(key)).cloned(),
            Selection::Random(s) => BackendIter::next(&mut s.iter(key)).cloned(),
            Selection::Fnv(s) => BackendIter::next(&mut s.iter(key)).cloned(),
            Selection::Ketama(s) => BackendIter::next(&mut s.iter(key)).cloned(),
        }
    }
}

/// Selection algorithm bound to a fixed candidate list.
pub(crate) struct HostSelector {
    selection: Selection,
    hosts: HashMap<String, Arc<Host>>,
}

impl HostSelector {
    pub(crate) fn build(lb_type: LbType, hosts: &[Arc<Host>]) -> Self {
        let backends: BTreeSet<Backend> = hosts.iter().map(|h| h.backend().clone()).collect();
        let hosts = hosts
            .iter()
            .map(|h| (h.backend().addr.to_string(), h.clone()))
            .collect();

        Self {
            selection: Selection::build(lb_type, &backends),
            hosts,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub(crate) fn select(&self, key: &[u8]) -> Option<Arc<Host>> {
        if self.is_empty() {
            return None;
        }

        let backend = self.selection.select(key)?;
        self.hosts.get(&backend.addr.to_string()).cloned()
    }
}
