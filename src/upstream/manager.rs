use std::sync::Arc;

use dashmap::DashMap;
use log::{info, warn};
use validator::Validate;

use crate::config::{ClusterConfig, Config};
use crate::config_error;
use crate::core::{ClusterResult, ErrorContext};

use super::cluster::Cluster;
use super::host::Host;

/// Registry of the clusters known to the proxy, keyed by name.
#[derive(Default)]
pub struct ClusterManager {
    clusters: DashMap<String, Arc<Cluster>>,
}

impl ClusterManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a cluster from `config` and installs it under its name.
    ///
    /// When the config carries no static hosts, the membership of the cluster
    /// being replaced is carried over with its health state reset. The new
    /// cluster is published only once its membership is in place.
    pub fn add_or_update_cluster(&self, config: ClusterConfig) -> ClusterResult<Arc<Cluster>> {
        config.validate()?;

        let carry_over = config.hosts.is_empty();
        let name = config.name.clone();
        let cluster = Cluster::new(config);

        if carry_over {
            if let Some(previous) = self.get_cluster(&name) {
                let hosts = previous
                    .host_set()
                    .hosts()
                    .iter()
                    .map(|h| Arc::new(h.renewed()))
                    .collect();
                cluster.update_hosts(hosts);
            }
        }

        if self.clusters.insert(name.clone(), cluster.clone()).is_some() {
            info!("[upstream] [cluster manager] cluster {name} updated");
        } else {
            info!("[upstream] [cluster manager] cluster {name} added");
        }

        Ok(cluster)
    }

    /// Drops the cluster, which stops its health checking once the last
    /// reference is gone.
    pub fn remove_cluster(&self, name: &str) -> Option<Arc<Cluster>> {
        let removed = self.clusters.remove(name).map(|(_, cluster)| cluster);
        if removed.is_some() {
            info!("[upstream] [cluster manager] cluster {name} removed");
        }
        removed
    }

    pub fn get_cluster(&self, name: &str) -> Option<Arc<Cluster>> {
        self.clusters.get(name).map(|c| c.value().clone())
    }

    pub fn update_cluster_hosts(&self, name: &str, hosts: Vec<Arc<Host>>) -> ClusterResult<()> {
        let cluster = self
            .get_cluster(name)
            .ok_or_else(|| config_error!("cluster {} not found", name))?;
        cluster.update_hosts(hosts);
        Ok(())
    }

    pub fn remove_cluster_hosts(&self, name: &str, addrs: &[String]) -> ClusterResult<()> {
        let cluster = self
            .get_cluster(name)
            .ok_or_else(|| config_error!("cluster {} not found", name))?;
        cluster.remove_hosts(addrs);
        Ok(())
    }

    /// Names of the registered clusters, sorted.
    pub fn cluster_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clusters.iter().map(|c| c.key().clone()).collect();
        names.sort();
        names
    }

    /// Reconciles the registry with `config`: every configured cluster is
    /// added or rebuilt, clusters missing from it are dropped.
    pub fn load_clusters(&self, config: &Config) -> ClusterResult<()> {
        config
            .validate()
            .with_context("invalid cluster configuration")?;

        for cluster in &config.clusters {
            self.add_or_update_cluster(cluster.clone())?;
        }

        let stale: Vec<String> = self
            .clusters
            .iter()
            .filter(|c| !config.clusters.iter().any(|conf| &conf.name == c.key()))
            .map(|c| c.key().clone())
            .collect();
        for name in stale {
            warn!("[upstream] [cluster manager] cluster {name} no longer configured");
            self.remove_cluster(&name);
        }

        Ok(())
    }
}
