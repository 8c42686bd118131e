use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use futures::future::join_all;
use http::Uri;
use log::{debug, error, info, warn};
use pingora_core::server::ShutdownWatch;
use pingora_error::Error;
use pingora_http::ResponseHeader;
use pingora_load_balancing::health_check::{
    HealthCheck as HealthCheckTrait, HttpHealthCheck, TcpHealthCheck,
};
use rand::Rng;

use crate::config::{ActiveCheckType, HealthCheckConfig};

use super::host::Host;
use super::stats::ClusterStats;

/// Active probe run against one host.
pub type HealthProbe = Box<dyn HealthCheckTrait + Send + Sync + 'static>;

/// Observer invoked after every completed probe with
/// `(host, changed_state, is_healthy)`.
pub type HealthCheckCb = Arc<dyn Fn(&Arc<Host>, bool, bool) + Send + Sync>;

impl From<&HealthCheckConfig> for HealthProbe {
    fn from(value: &HealthCheckConfig) -> Self {
        match value.r#type {
            ActiveCheckType::TCP => {
                let health_check: Box<TcpHealthCheck> = value.into();
                health_check
            }
            ActiveCheckType::HTTP | ActiveCheckType::HTTPS => {
                let health_check: Box<HttpHealthCheck> = value.into();
                health_check
            }
        }
    }
}

impl From<&HealthCheckConfig> for Box<TcpHealthCheck> {
    fn from(value: &HealthCheckConfig) -> Self {
        let mut health_check = TcpHealthCheck::new();
        health_check.peer_template.options.total_connection_timeout =
            Some(Duration::from_secs(value.timeout));
        health_check.consecutive_success = value.healthy_threshold as _;
        health_check.consecutive_failure = value.unhealthy_threshold as _;
        health_check
    }
}

impl From<&HealthCheckConfig> for Box<HttpHealthCheck> {
    fn from(value: &HealthCheckConfig) -> Self {
        let host = value.host.clone().unwrap_or_default();
        let tls = value.r#type == ActiveCheckType::HTTPS;
        let mut health_check = HttpHealthCheck::new(host.as_str(), tls);

        health_check.peer_template.options.total_connection_timeout =
            Some(Duration::from_secs(value.timeout));
        health_check.peer_template.options.verify_cert = value.https_verify_certificate;

        match Uri::builder().path_and_query(value.http_path.as_str()).build() {
            Ok(uri) => health_check.req.set_uri(uri),
            Err(e) => warn!(
                "[upstream] [health check] invalid http_path {}: {}",
                value.http_path, e
            ),
        }

        for header in value.req_headers.iter() {
            let mut parts = header.splitn(2, ':');
            if let (Some(key), Some(value)) = (parts.next(), parts.next()) {
                let _ = health_check
                    .req
                    .insert_header(key.trim().to_string(), value.trim());
            }
        }

        health_check.port_override = value.port;
        health_check.consecutive_success = value.healthy_threshold as _;
        health_check.consecutive_failure = value.unhealthy_threshold as _;

        if !value.http_statuses.is_empty() {
            let http_statuses = value.http_statuses.clone();
            health_check.validator = Some(Box::new(move |header: &ResponseHeader| {
                if http_statuses.contains(&header.status.as_u16()) {
                    Ok(())
                } else {
                    Err(Error::new_str("unexpected health check status"))
                }
            }));
        }

        Box::new(health_check)
    }
}

/// Probe bookkeeping of one tracked host.
struct HostCheckState {
    host: Arc<Host>,
    /// Outcome of the previous probe, `None` until the first one completes.
    last_success: Option<bool>,
    consecutive: usize,
}

/// Active health checker of one cluster.
///
/// Tracks the hosts it is told about through [`on_cluster_member_update`],
/// probes them every interval and flips their health flag once the probe's
/// consecutive threshold is reached.
///
/// [`on_cluster_member_update`]: HealthChecker::on_cluster_member_update
pub struct HealthChecker {
    cluster_name: String,
    config: HealthCheckConfig,
    probe: HealthProbe,
    hosts: DashMap<String, HostCheckState>,
    callbacks: ArcSwap<Vec<HealthCheckCb>>,
    stats: ClusterStats,
}

impl HealthChecker {
    pub fn new(cluster_name: &str, config: &HealthCheckConfig, stats: ClusterStats) -> Self {
        let probe = HealthProbe::from(config);
        Self::with_probe(cluster_name, config, probe, stats)
    }

    pub fn with_probe(
        cluster_name: &str,
        config: &HealthCheckConfig,
        probe: HealthProbe,
        stats: ClusterStats,
    ) -> Self {
        Self {
            cluster_name: cluster_name.to_string(),
            config: config.clone(),
            probe,
            hosts: DashMap::new(),
            callbacks: ArcSwap::from_pointee(Vec::new()),
            stats,
        }
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    pub fn add_host_check_complete_cb(&self, cb: HealthCheckCb) {
        self.callbacks.rcu(|cbs| {
            let mut cbs = Vec::clone(cbs);
            cbs.push(cb.clone());
            cbs
        });
    }

    /// Starts tracking `added` and stops tracking `removed`.
    pub fn on_cluster_member_update(&self, added: &[Arc<Host>], removed: &[Arc<Host>]) {
        for host in removed {
            self.hosts
                .remove_if(host.address(), |_, state| Arc::ptr_eq(&state.host, host));
        }

        for host in added {
            self.hosts.insert(
                host.address().to_string(),
                HostCheckState {
                    host: host.clone(),
                    last_success: None,
                    consecutive: 0,
                },
            );
        }

        debug!(
            "[upstream] [health check] cluster {} tracking {} hosts",
            self.cluster_name,
            self.hosts.len()
        );
    }

    /// Number of hosts currently probed.
    pub fn tracked_hosts(&self) -> usize {
        self.hosts.len()
    }

    /// Probes every tracked host once, concurrently.
    pub async fn run_round(&self) {
        let targets: Vec<Arc<Host>> = self.hosts.iter().map(|s| s.host.clone()).collect();
        let timeout = Duration::from_secs(self.config.timeout);

        let results = join_all(targets.into_iter().map(|host| async move {
            let success = match tokio::time::timeout(timeout, self.probe.check(host.backend()))
                .await
            {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    debug!(
                        "[upstream] [health check] cluster {} host {} failed: {}",
                        self.cluster_name,
                        host.address(),
                        e
                    );
                    false
                }
                Err(_) => {
                    debug!(
                        "[upstream] [health check] cluster {} host {} timed out",
                        self.cluster_name,
                        host.address()
                    );
                    false
                }
            };
            (host, success)
        }))
        .await;

        for (host, success) in results {
            self.record(&host, success);
        }
    }

    fn record(&self, host: &Arc<Host>, success: bool) {
        if success {
            self.stats.health_check_success.inc();
        } else {
            self.stats.health_check_failure.inc();
        }

        let changed_state = {
            let Some(mut state) = self.hosts.get_mut(host.address()) else {
                // untracked while the probe was in flight
                return;
            };
            if !Arc::ptr_eq(&state.host, host) {
                return;
            }

            if state.last_success == Some(success) {
                state.consecutive += 1;
            } else {
                state.last_success = Some(success);
                state.consecutive = 1;
            }

            let threshold = self.probe.health_threshold(success).max(1);
            if state.consecutive >= threshold && host.is_healthy() != success {
                host.set_healthy(success);
                true
            } else {
                false
            }
        };

        if changed_state {
            info!(
                "[upstream] [health check] cluster {} host {} became {}",
                self.cluster_name,
                host.address(),
                if success { "healthy" } else { "unhealthy" }
            );
        }

        let is_healthy = host.is_healthy();
        for cb in self.callbacks.load().iter() {
            cb(host, changed_state, is_healthy);
        }
    }

    fn next_delay(&self) -> Duration {
        let jitter = if self.config.max_jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.config.max_jitter_ms)
        } else {
            0
        };
        Duration::from_secs(self.config.interval) + Duration::from_millis(jitter)
    }

    /// Runs probe rounds until `shutdown` flips to true or its sender is gone.
    ///
    /// The first round starts one interval after the call.
    pub async fn start(&self, mut shutdown: ShutdownWatch) {
        info!(
            "[upstream] [health check] cluster {} start, interval {}s",
            self.cluster_name, self.config.interval
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.next_delay()) => self.run_round().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("[upstream] [health check] cluster {} stopped", self.cluster_name);
    }

    /// Runs [`start`](Self::start) in a task and restarts it after a panic.
    pub async fn supervise(self: Arc<Self>, shutdown: ShutdownWatch) {
        loop {
            let checker = self.clone();
            let watch = shutdown.clone();
            match tokio::spawn(async move { checker.start(watch).await }).await {
                Ok(()) => break,
                Err(e) if e.is_panic() => {
                    error!(
                        "[upstream] [health check] cluster {} loop panicked, restarting: {}",
                        self.cluster_name, e
                    );
                }
                Err(_) => break,
            }
        }
    }
}
