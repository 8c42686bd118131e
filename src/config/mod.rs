use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;

use log::{debug, trace};
use once_cell::sync::Lazy;
use pingora_error::{ErrorType::*, OrErr, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

static HOST_ADDRESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:(?:\d{1,3}\.){3}\d{1,3}|\[[0-9a-f:]+\]):\d{1,5}$").unwrap()
});

#[derive(Default, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "Config::validate_unique_names"))]
pub struct Config {
    #[validate(nested)]
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
}

// Config file load and validation
impl Config {
    pub fn load_from_yaml<P>(path: P) -> Result<Self>
    where
        P: AsRef<std::path::Path> + std::fmt::Display,
    {
        let conf_str = fs::read_to_string(&path).or_err_with(ReadError, || {
            format!("Unable to read conf file from {path}")
        })?;
        debug!("Conf file read from {path}");
        Self::from_yaml(&conf_str)
    }

    pub fn from_yaml(conf_str: &str) -> Result<Self> {
        trace!("Read conf file: {conf_str}");
        let conf: Config = serde_yaml::from_str(conf_str).or_err_with(ReadError, || {
            format!("Unable to parse yaml conf {conf_str}")
        })?;

        trace!("Loaded conf: {conf:?}");

        conf.validate()
            .or_err_with(FileReadError, || "Conf file valid failed")?;

        Ok(conf)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).or_err(InternalError, "Unable to serialize conf")
    }

    fn validate_unique_names(&self) -> Result<(), ValidationError> {
        let mut seen = HashSet::new();
        for cluster in &self.clusters {
            if !seen.insert(cluster.name.as_str()) {
                let mut err = ValidationError::new("duplicate_cluster_name");
                err.add_param("name".into(), &cluster.name);
                return Err(err);
            }
        }

        Ok(())
    }
}

/// Configuration record of one upstream cluster.
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct ClusterConfig {
    #[validate(length(min = 1))]
    pub name: String,
    #[serde(default)]
    pub cluster_type: ClusterType,
    #[serde(default)]
    pub max_request_per_conn: u32,
    #[serde(default = "ClusterConfig::default_conn_buffer_limit_bytes")]
    pub conn_buffer_limit_bytes: u32,
    #[serde(default)]
    pub lb_type: LbType,
    #[validate(nested)]
    #[serde(default)]
    pub lb_subset_config: LbSubsetConfig,
    #[serde(default)]
    pub circuit_breakers: CircuitBreakers,
    #[serde(default)]
    pub tls: TlsConfig,
    #[validate(nested)]
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[validate(nested)]
    #[serde(default)]
    pub hosts: Vec<HostConfig>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            cluster_type: ClusterType::default(),
            max_request_per_conn: 0,
            conn_buffer_limit_bytes: Self::default_conn_buffer_limit_bytes(),
            lb_type: LbType::default(),
            lb_subset_config: LbSubsetConfig::default(),
            circuit_breakers: CircuitBreakers::default(),
            tls: TlsConfig::default(),
            health_check: HealthCheckConfig::default(),
            hosts: Vec::new(),
        }
    }
}

impl ClusterConfig {
    fn default_conn_buffer_limit_bytes() -> u32 {
        16 * 1024
    }
}

#[derive(Copy, Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterType {
    #[default]
    Simple,
    Static,
    Eds,
}

/// Host selection algorithm of a cluster.
///
/// With subset load balancing enabled this is the algorithm used inside
/// each subset.
#[derive(Copy, Clone, Default, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LbType {
    #[default]
    RoundRobin,
    Random,
    Fnv,
    Ketama,
}

impl fmt::Display for LbType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            LbType::RoundRobin => "roundrobin",
            LbType::Random => "random",
            LbType::Fnv => "fnv",
            LbType::Ketama => "ketama",
        };
        write!(f, "{}", name)
    }
}

#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    #[default]
    NoFallback,
    AnyEndpoint,
    DefaultSubset,
}

#[derive(Clone, Default, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "LbSubsetConfig::validate_default_subset"))]
pub struct LbSubsetConfig {
    #[serde(default)]
    pub fallback_policy: FallbackPolicy,
    #[serde(default)]
    pub default_subset: BTreeMap<String, String>,
    #[serde(default)]
    pub subset_selectors: Vec<Vec<String>>,
}

impl LbSubsetConfig {
    fn validate_default_subset(&self) -> Result<(), ValidationError> {
        if self.fallback_policy == FallbackPolicy::DefaultSubset && self.default_subset.is_empty()
        {
            Err(ValidationError::new("default_subset_required_for_fallback"))
        } else {
            Ok(())
        }
    }
}

#[derive(Clone, Default, Debug, Serialize, Deserialize)]
pub struct CircuitBreakers {
    #[serde(default)]
    pub thresholds: Vec<Thresholds>,
}

impl CircuitBreakers {
    /// Thresholds of the default priority, the only one a cluster enforces.
    pub fn default_thresholds(&self) -> Thresholds {
        self.thresholds.first().cloned().unwrap_or_default()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thresholds {
    #[serde(default = "Thresholds::default_max_connections")]
    pub max_connections: u64,
    #[serde(default = "Thresholds::default_max_pending_requests")]
    pub max_pending_requests: u64,
    #[serde(default = "Thresholds::default_max_requests")]
    pub max_requests: u64,
    #[serde(default = "Thresholds::default_max_retries")]
    pub max_retries: u64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            max_connections: Self::default_max_connections(),
            max_pending_requests: Self::default_max_pending_requests(),
            max_requests: Self::default_max_requests(),
            max_retries: Self::default_max_retries(),
        }
    }
}

impl Thresholds {
    fn default_max_connections() -> u64 {
        1024
    }

    fn default_max_pending_requests() -> u64 {
        1024
    }

    fn default_max_requests() -> u64 {
        1024
    }

    fn default_max_retries() -> u64 {
        3
    }
}

/// Client side TLS settings, PEM encoded.
#[derive(Clone, Default, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub status: bool,
    pub ca_cert: String,
    pub cert_chain: String,
    pub private_key: String,
    pub server_name: String,
    pub insecure_skip: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct HealthCheckConfig {
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub r#type: ActiveCheckType,
    #[validate(range(min = 1))]
    #[serde(default = "HealthCheckConfig::default_timeout")]
    pub timeout: u64,
    #[validate(range(min = 1))]
    #[serde(default = "HealthCheckConfig::default_interval")]
    pub interval: u64,
    #[serde(default)]
    pub max_jitter_ms: u64,
    #[serde(default = "HealthCheckConfig::default_healthy_threshold")]
    pub healthy_threshold: u32,
    #[serde(default = "HealthCheckConfig::default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,
    #[serde(default = "HealthCheckConfig::default_http_path")]
    pub http_path: String,
    pub host: Option<String>,
    pub port: Option<u16>,
    #[serde(default = "HealthCheckConfig::default_https_verify_certificate")]
    pub https_verify_certificate: bool,
    #[serde(default)]
    pub req_headers: Vec<String>,
    #[serde(default = "HealthCheckConfig::default_http_statuses")]
    pub http_statuses: Vec<u16>,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            service_name: String::new(),
            r#type: ActiveCheckType::default(),
            timeout: Self::default_timeout(),
            interval: Self::default_interval(),
            max_jitter_ms: 0,
            healthy_threshold: Self::default_healthy_threshold(),
            unhealthy_threshold: Self::default_unhealthy_threshold(),
            http_path: Self::default_http_path(),
            host: None,
            port: None,
            https_verify_certificate: Self::default_https_verify_certificate(),
            req_headers: Vec::new(),
            http_statuses: Self::default_http_statuses(),
        }
    }
}

impl HealthCheckConfig {
    /// Health checking is on only when a service name is configured.
    pub fn is_enabled(&self) -> bool {
        !self.service_name.is_empty()
    }

    fn default_timeout() -> u64 {
        1
    }

    fn default_interval() -> u64 {
        15
    }

    fn default_healthy_threshold() -> u32 {
        2
    }

    fn default_unhealthy_threshold() -> u32 {
        3
    }

    fn default_http_path() -> String {
        "/".to_string()
    }

    fn default_https_verify_certificate() -> bool {
        true
    }

    fn default_http_statuses() -> Vec<u16> {
        vec![200, 302]
    }
}

#[derive(Copy, Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActiveCheckType {
    #[default]
    TCP,
    HTTP,
    HTTPS,
}

/// Statically configured cluster member.
#[derive(Clone, Debug, Default, Serialize, Deserialize, Validate)]
pub struct HostConfig {
    #[validate(custom(function = "HostConfig::validate_address"))]
    pub address: String,
    #[serde(default)]
    pub hostname: String,
    #[validate(range(min = 1, max = 128))]
    #[serde(default = "HostConfig::default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl HostConfig {
    fn default_weight() -> u32 {
        1
    }

    fn validate_address(address: &str) -> Result<(), ValidationError> {
        if HOST_ADDRESS_RE.is_match(address) {
            Ok(())
        } else {
            let mut err = ValidationError::new("invalid_host_address");
            err.add_param("address".into(), &address.to_string());
            Err(err)
        }
    }
}
