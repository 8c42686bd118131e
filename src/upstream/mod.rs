//! Upstream cluster management: membership, host selection, active health
//! checking, circuit breaking and client TLS of each cluster.

pub mod cluster;
pub mod health_check;
pub mod host;
pub mod load_balancer;
pub mod manager;
pub mod resource;
pub mod stats;
pub mod subset;
pub mod tls;

pub use cluster::{new_cluster, Cluster, ClusterInfo};
pub use health_check::{HealthCheckCb, HealthChecker, HealthProbe};
pub use host::{Host, HostSet, HostSnapshot, MemberUpdateCb};
pub use load_balancer::{LbContext, LoadBalancer};
pub use manager::ClusterManager;
pub use resource::{Resource, ResourceManager};
pub use stats::ClusterStats;
pub use subset::{LbSubsetInfo, SubsetLoadBalancer};
pub use tls::TlsContextManager;
