use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter_vec, register_int_gauge_vec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec,
};

static MEMBERSHIP_CHANGE: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "upstream_cluster_membership_change_total",
        "Number of cluster membership changes",
        &["cluster"]
    )
    .unwrap()
});

static MEMBERSHIP: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "upstream_cluster_membership",
        "Current cluster membership by health",
        &["cluster", "health"]
    )
    .unwrap()
});

static HEALTH_CHECK: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "upstream_cluster_health_check_total",
        "Health check probe results per cluster",
        &["cluster", "result"]
    )
    .unwrap()
});

static LB_SUBSET: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "upstream_cluster_lb_subset_total",
        "Subset load balancer selection outcomes",
        &["cluster", "outcome"]
    )
    .unwrap()
});

/// Per cluster statistics sink.
///
/// Handles are bound to the cluster name once, so recording on the request
/// path does not hash label values.
#[derive(Clone)]
pub struct ClusterStats {
    pub membership_change: IntCounter,
    pub membership_total: IntGauge,
    pub membership_healthy: IntGauge,
    pub health_check_success: IntCounter,
    pub health_check_failure: IntCounter,
    pub lb_subsets_selected: IntCounter,
    pub lb_subsets_fallback: IntCounter,
    pub lb_subsets_none: IntCounter,
}

impl ClusterStats {
    pub fn new(cluster: &str) -> Self {
        Self {
            membership_change: MEMBERSHIP_CHANGE.with_label_values(&[cluster]),
            membership_total: MEMBERSHIP.with_label_values(&[cluster, "total"]),
            membership_healthy: MEMBERSHIP.with_label_values(&[cluster, "healthy"]),
            health_check_success: HEALTH_CHECK.with_label_values(&[cluster, "success"]),
            health_check_failure: HEALTH_CHECK.with_label_values(&[cluster, "failure"]),
            lb_subsets_selected: LB_SUBSET.with_label_values(&[cluster, "selected"]),
            lb_subsets_fallback: LB_SUBSET.with_label_values(&[cluster, "fallback"]),
            lb_subsets_none: LB_SUBSET.with_label_values(&[cluster, "none"]),
        }
    }
}
