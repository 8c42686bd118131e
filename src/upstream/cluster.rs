use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use pingora_runtime::Runtime;
use tokio::sync::watch;

use crate::config::{ClusterConfig, ClusterType, LbType};

use super::health_check::{HealthCheckCb, HealthChecker, HealthProbe};
use super::host::{Host, HostSet};
use super::load_balancer::LoadBalancer;
use super::resource::ResourceManager;
use super::stats::ClusterStats;
use super::subset::LbSubsetInfo;
use super::tls::TlsContextManager;

/// Read-only facts about a cluster, shared with connection pools and filters.
pub struct ClusterInfo {
    name: String,
    cluster_type: ClusterType,
    lb_type: LbType,
    conn_buffer_limit_bytes: u32,
    max_requests_per_conn: u32,
    stats: ClusterStats,
    resource_manager: ResourceManager,
    lb_subset_info: Arc<LbSubsetInfo>,
    tls_mng: Option<Arc<TlsContextManager>>,
}

impl ClusterInfo {
    /// Builds the info without a TLS manager; the factory attaches one after.
    pub fn new(config: &ClusterConfig) -> Self {
        Self {
            name: config.name.clone(),
            cluster_type: config.cluster_type,
            lb_type: config.lb_type,
            conn_buffer_limit_bytes: config.conn_buffer_limit_bytes,
            max_requests_per_conn: config.max_request_per_conn,
            stats: ClusterStats::new(&config.name),
            resource_manager: ResourceManager::new(&config.circuit_breakers),
            lb_subset_info: Arc::new(LbSubsetInfo::new(&config.lb_subset_config)),
            tls_mng: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cluster_type(&self) -> ClusterType {
        self.cluster_type
    }

    pub fn lb_type(&self) -> LbType {
        self.lb_type
    }

    pub fn conn_buffer_limit_bytes(&self) -> u32 {
        self.conn_buffer_limit_bytes
    }

    pub fn max_requests_per_conn(&self) -> u32 {
        self.max_requests_per_conn
    }

    pub fn stats(&self) -> &ClusterStats {
        &self.stats
    }

    pub fn resource_manager(&self) -> &ResourceManager {
        &self.resource_manager
    }

    pub fn lb_subset_info(&self) -> &Arc<LbSubsetInfo> {
        &self.lb_subset_info
    }

    /// TLS context of the cluster, `None` when its TLS settings were invalid.
    pub fn tls_mng(&self) -> Option<&Arc<TlsContextManager>> {
        self.tls_mng.as_ref()
    }
}

/// Background health checking owned by a cluster.
struct HealthCheckTask {
    checker: Arc<HealthChecker>,
    runtime: Option<Runtime>,
    watch: Option<watch::Sender<bool>>,
}

impl HealthCheckTask {
    /// Runs the supervised check loop on its own single threaded runtime.
    fn start(checker: Arc<HealthChecker>) -> Self {
        let (watch_tx, watch_rx) = watch::channel(false);
        let name = format!("health check {}", checker.cluster_name());
        let runtime = Runtime::new_no_steal(1, &name);

        let supervised = checker.clone();
        runtime.get_handle().spawn(async move {
            supervised.supervise(watch_rx).await;
        });

        Self {
            checker,
            runtime: Some(runtime),
            watch: Some(watch_tx),
        }
    }
}

impl Drop for HealthCheckTask {
    fn drop(&mut self) {
        if let Some(tx) = self.watch.take() {
            let _ = tx.send(true);
        }

        if let Some(runtime) = self.runtime.take() {
            // a runtime must not be dropped from within an async context
            std::thread::spawn(move || {
                runtime.shutdown_timeout(Duration::from_secs(1));
            });
            info!(
                "[upstream] [cluster] health check of {} shut down",
                self.checker.cluster_name()
            );
        }
    }
}

/// A named group of upstream hosts together with the machinery to pick one.
pub struct Cluster {
    info: Arc<ClusterInfo>,
    host_set: Arc<HostSet>,
    lb_instance: LoadBalancer,
    health_check: Option<HealthCheckTask>,
}

impl Cluster {
    pub fn new(config: ClusterConfig) -> Arc<Self> {
        Self::new_with_probe(config, None)
    }

    /// Same as [`Cluster::new`], with `probe` replacing the one built from the
    /// health check config.
    ///
    /// `probe` is ignored when the config names no health-checked service.
    pub fn new_with_probe(config: ClusterConfig, probe: Option<HealthProbe>) -> Arc<Self> {
        let mut info = ClusterInfo::new(&config);
        let host_set = Arc::new(HostSet::new(info.stats.clone()));

        let lb_instance = if info.lb_subset_info.is_enabled() {
            LoadBalancer::new_subset(
                info.lb_type,
                host_set.clone(),
                info.stats.clone(),
                info.lb_subset_info.clone(),
            )
        } else {
            LoadBalancer::new(info.lb_type, host_set.clone())
        };

        match TlsContextManager::new(&config.tls, &info) {
            Ok(mng) => info.tls_mng = Some(Arc::new(mng)),
            Err(e) => error!(
                "[upstream] [cluster] [new cluster] create tls context manager for {} failed: {}",
                info.name, e
            ),
        }

        let health_check = if config.health_check.is_enabled() {
            let checker = match probe {
                Some(probe) => HealthChecker::with_probe(
                    &info.name,
                    &config.health_check,
                    probe,
                    info.stats.clone(),
                ),
                None => HealthChecker::new(&info.name, &config.health_check, info.stats.clone()),
            };
            Some(Self::wire_health_check(&host_set, Arc::new(checker)))
        } else {
            None
        };

        info!(
            "[upstream] [cluster] [new cluster] cluster {} created, type {:?}, lb {}, subset {}, health check {}",
            info.name,
            info.cluster_type,
            info.lb_type,
            lb_instance.is_subset(),
            health_check.is_some()
        );

        let cluster = Arc::new(Self {
            info: Arc::new(info),
            host_set,
            lb_instance,
            health_check,
        });

        if !config.hosts.is_empty() {
            let hosts = config
                .hosts
                .iter()
                .filter_map(|h| match Host::from_config(h) {
                    Ok(host) => Some(Arc::new(host)),
                    Err(e) => {
                        warn!(
                            "[upstream] [cluster] cluster {} skip static host {}: {}",
                            cluster.info.name, h.address, e
                        );
                        None
                    }
                })
                .collect();
            cluster.update_hosts(hosts);
        }

        cluster
    }

    fn wire_health_check(
        host_set: &Arc<HostSet>,
        checker: Arc<HealthChecker>,
    ) -> HealthCheckTask {
        let weak = Arc::downgrade(host_set);
        checker.add_host_check_complete_cb(Arc::new(move |host, changed_state, _| {
            if !changed_state {
                return;
            }
            if let Some(host_set) = weak.upgrade() {
                host_set.refresh_health_hosts(host);
            }
        }));

        let hook = checker.clone();
        host_set.add_member_update_cb(Arc::new(move |added, removed| {
            hook.on_cluster_member_update(added, removed);
        }));

        HealthCheckTask::start(checker)
    }

    /// Replaces the membership of the cluster.
    pub fn update_hosts(&self, hosts: Vec<Arc<Host>>) {
        debug!(
            "[upstream] [cluster] cluster {} update {} hosts",
            self.info.name,
            hosts.len()
        );
        self.host_set.update_hosts(hosts);
    }

    pub fn remove_hosts(&self, addrs: &[String]) {
        debug!(
            "[upstream] [cluster] cluster {} remove hosts {:?}",
            self.info.name, addrs
        );
        self.host_set.remove_hosts(addrs);
    }

    pub fn info(&self) -> &Arc<ClusterInfo> {
        &self.info
    }

    pub fn host_set(&self) -> &Arc<HostSet> {
        &self.host_set
    }

    pub fn lb_instance(&self) -> &LoadBalancer {
        &self.lb_instance
    }

    /// Registers an extra health transition observer. Does nothing when the
    /// cluster has no health checker.
    pub fn add_health_check_callbacks(&self, cb: HealthCheckCb) {
        if let Some(task) = &self.health_check {
            task.checker.add_host_check_complete_cb(cb);
        }
    }

    pub fn health_checker(&self) -> Option<&Arc<HealthChecker>> {
        self.health_check.as_ref().map(|task| &task.checker)
    }
}

/// Builds a cluster from its configuration.
pub fn new_cluster(config: ClusterConfig) -> Arc<Cluster> {
    Cluster::new(config)
}
