use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex, MutexGuard, PoisonError,
};

use arc_swap::ArcSwap;
use log::{debug, info};
use pingora_load_balancing::Backend;

use crate::config::HostConfig;
use crate::core::{ClusterError, ClusterResult};

use super::stats::ClusterStats;

pub const MIN_HOST_WEIGHT: u32 = 1;
pub const MAX_HOST_WEIGHT: u32 = 128;

/// One network endpoint of a cluster.
///
/// The health flag is owned by the health checker; everything else is fixed
/// when the host is created by discovery.
pub struct Host {
    address: String,
    hostname: String,
    metadata: BTreeMap<String, String>,
    backend: Backend,
    healthy: AtomicBool,
}

impl Host {
    /// Creates a healthy host from an `ip:port` address.
    ///
    /// `weight` is clamped to `MIN_HOST_WEIGHT..=MAX_HOST_WEIGHT`.
    pub fn new(
        address: &str,
        weight: u32,
        metadata: BTreeMap<String, String>,
    ) -> ClusterResult<Self> {
        let addr: SocketAddr = address
            .parse()
            .map_err(|e| ClusterError::InvalidAddress(format!("{address}: {e}")))?;
        let address = addr.to_string();

        let clamped = weight.clamp(MIN_HOST_WEIGHT, MAX_HOST_WEIGHT);
        if clamped != weight {
            debug!("[upstream] [host] {address} weight {weight} clamped to {clamped}");
        }

        let mut backend = Backend::new(&address)?;
        backend.weight = clamped as usize;

        Ok(Self {
            address,
            hostname: String::new(),
            metadata,
            backend,
            healthy: AtomicBool::new(true),
        })
    }

    pub fn from_config(config: &HostConfig) -> ClusterResult<Self> {
        Ok(Self::new(&config.address, config.weight, config.metadata.clone())?
            .with_hostname(config.hostname.clone()))
    }

    /// Copy of the host with a fresh, healthy state.
    pub fn renewed(&self) -> Self {
        Self {
            address: self.address.clone(),
            hostname: self.hostname.clone(),
            metadata: self.metadata.clone(),
            backend: self.backend.clone(),
            healthy: AtomicBool::new(true),
        }
    }

    pub fn with_hostname(mut self, hostname: String) -> Self {
        self.hostname = hostname;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn weight(&self) -> u32 {
        self.backend.weight as u32
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Sets the health flag and returns the previous value.
    pub fn set_healthy(&self, healthy: bool) -> bool {
        self.healthy.swap(healthy, Ordering::AcqRel)
    }

    /// Whether every `(key, value)` of `criteria` is present in the metadata.
    pub fn matches(&self, criteria: &BTreeMap<String, String>) -> bool {
        criteria
            .iter()
            .all(|(k, v)| self.metadata.get(k).is_some_and(|value| value == v))
    }
}

/// Immutable view of a cluster's membership.
///
/// The healthy list is derived from `hosts` when the snapshot is built, so a
/// reader holding a snapshot always sees both lists in agreement.
#[derive(Default)]
pub struct HostSnapshot {
    hosts: Vec<Arc<Host>>,
    healthy_hosts: Vec<Arc<Host>>,
}

impl HostSnapshot {
    fn new(hosts: Vec<Arc<Host>>) -> Self {
        let healthy_hosts = hosts.iter().filter(|h| h.is_healthy()).cloned().collect();
        Self {
            hosts,
            healthy_hosts,
        }
    }

    pub fn hosts(&self) -> &[Arc<Host>] {
        &self.hosts
    }

    pub fn healthy_hosts(&self) -> &[Arc<Host>] {
        &self.healthy_hosts
    }
}

/// Observer invoked with the `(added, removed)` hosts of a membership change.
pub type MemberUpdateCb = Arc<dyn Fn(&[Arc<Host>], &[Arc<Host>]) + Send + Sync>;

/// Mutable membership of one cluster.
///
/// Readers are lock free. Membership writers are serialized together with
/// their observer calls, so observers see changes in the order they were
/// published. Observers must not mutate the membership themselves.
pub struct HostSet {
    snapshot: ArcSwap<HostSnapshot>,
    writer: Mutex<()>,
    member_update_cbs: ArcSwap<Vec<MemberUpdateCb>>,
    health_refreshes: AtomicU64,
    stats: ClusterStats,
}

impl HostSet {
    pub fn new(stats: ClusterStats) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(HostSnapshot::default()),
            writer: Mutex::new(()),
            member_update_cbs: ArcSwap::from_pointee(Vec::new()),
            health_refreshes: AtomicU64::new(0),
            stats,
        }
    }

    /// Replaces the whole membership.
    pub fn update_hosts(&self, hosts: Vec<Arc<Host>>) {
        let _writer = self.lock_writer();
        let current = Arc::new(HostSnapshot::new(hosts));
        let previous = self.snapshot.swap(current.clone());

        let added = missing_from(&current.hosts, &previous.hosts);
        let removed = missing_from(&previous.hosts, &current.hosts);
        info!(
            "[upstream] [host set] update hosts, total {}, added {}, removed {}",
            current.hosts.len(),
            added.len(),
            removed.len()
        );

        self.after_member_update(&added, &removed);
    }

    /// Removes every host whose address is listed. Unknown addresses are ignored.
    pub fn remove_hosts(&self, addrs: &[String]) {
        let addrs: HashSet<&str> = addrs.iter().map(String::as_str).collect();
        let _writer = self.lock_writer();
        let previous = self.snapshot.rcu(|current| {
            let kept = current
                .hosts
                .iter()
                .filter(|h| !addrs.contains(h.address()))
                .cloned()
                .collect();
            HostSnapshot::new(kept)
        });

        let removed: Vec<Arc<Host>> = previous
            .hosts
            .iter()
            .filter(|h| addrs.contains(h.address()))
            .cloned()
            .collect();
        info!("[upstream] [host set] remove hosts, removed {}", removed.len());

        self.after_member_update(&[], &removed);
    }

    /// Rebuilds the healthy subset after `host` changed its health flag.
    pub fn refresh_health_hosts(&self, host: &Arc<Host>) {
        self.snapshot
            .rcu(|current| HostSnapshot::new(current.hosts.clone()));
        self.health_refreshes.fetch_add(1, Ordering::Relaxed);
        debug!(
            "[upstream] [host set] refresh healthy hosts, host {} healthy {}",
            host.address(),
            host.is_healthy()
        );
        self.record_membership();
    }

    /// Registers an observer called on every `update_hosts`/`remove_hosts`.
    pub fn add_member_update_cb(&self, cb: MemberUpdateCb) {
        self.member_update_cbs.rcu(|cbs| {
            let mut cbs = Vec::clone(cbs);
            cbs.push(cb.clone());
            cbs
        });
    }

    pub fn snapshot(&self) -> Arc<HostSnapshot> {
        self.snapshot.load_full()
    }

    pub fn hosts(&self) -> Vec<Arc<Host>> {
        self.snapshot.load().hosts.clone()
    }

    pub fn healthy_hosts(&self) -> Vec<Arc<Host>> {
        self.snapshot.load().healthy_hosts.clone()
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of healthy subset rebuilds triggered by health transitions.
    pub fn health_refresh_count(&self) -> u64 {
        self.health_refreshes.load(Ordering::Relaxed)
    }

    fn lock_writer(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn after_member_update(&self, added: &[Arc<Host>], removed: &[Arc<Host>]) {
        self.stats.membership_change.inc();
        self.record_membership();

        for cb in self.member_update_cbs.load().iter() {
            cb(added, removed);
        }
    }

    fn record_membership(&self) {
        let snapshot = self.snapshot.load();
        self.stats.membership_total.set(snapshot.hosts.len() as i64);
        self.stats
            .membership_healthy
            .set(snapshot.healthy_hosts.len() as i64);
    }
}

/// Hosts of `from` that are not present in `other`, by identity.
fn missing_from(from: &[Arc<Host>], other: &[Arc<Host>]) -> Vec<Arc<Host>> {
    let other: HashSet<*const Host> = other.iter().map(Arc::as_ptr).collect();
    from.iter()
        .filter(|h| !other.contains(&Arc::as_ptr(h)))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(addr: &str) -> Arc<Host> {
        Arc::new(Host::new(addr, 1, BTreeMap::new()).unwrap())
    }

    fn addresses(hosts: &[Arc<Host>]) -> Vec<String> {
        hosts.iter().map(|h| h.address().to_string()).collect()
    }

    fn host_set() -> HostSet {
        HostSet::new(ClusterStats::new("host-set-test"))
    }

    #[test]
    fn test_host_new() {
        let h = Host::new("10.0.0.1:8080", 3, BTreeMap::new()).unwrap();
        assert_eq!("10.0.0.1:8080", h.address());
        assert_eq!(3, h.weight());
        assert!(h.is_healthy());

        assert!(h.set_healthy(false));
        assert!(!h.is_healthy());

        assert!(matches!(
            Host::new("not-an-address", 1, BTreeMap::new()),
            Err(ClusterError::InvalidAddress(_))
        ));
        assert!(Host::new("10.0.0.1", 1, BTreeMap::new()).is_err());
    }

    #[test]
    fn test_host_weight_clamped() {
        let h = Host::new("10.0.0.1:8080", 0, BTreeMap::new()).unwrap();
        assert_eq!(MIN_HOST_WEIGHT, h.weight());

        let h = Host::new("10.0.0.1:8080", u32::MAX, BTreeMap::new()).unwrap();
        assert_eq!(MAX_HOST_WEIGHT, h.weight());
    }

    #[test]
    fn test_host_matches_metadata() {
        let metadata = BTreeMap::from([
            ("version".to_string(), "v1".to_string()),
            ("zone".to_string(), "a".to_string()),
        ]);
        let h = Host::new("10.0.0.1:8080", 1, metadata).unwrap();

        assert!(h.matches(&BTreeMap::new()));
        assert!(h.matches(&BTreeMap::from([("version".to_string(), "v1".to_string())])));
        assert!(!h.matches(&BTreeMap::from([("version".to_string(), "v2".to_string())])));
        assert!(!h.matches(&BTreeMap::from([("stage".to_string(), "v1".to_string())])));
    }

    #[test]
    fn test_update_hosts_replaces_membership() {
        let set = host_set();
        assert!(set.is_empty());

        let hosts = vec![host("10.0.0.1:8080"), host("10.0.0.2:8080")];
        set.update_hosts(hosts.clone());
        assert_eq!(addresses(&hosts), addresses(&set.hosts()));

        // idempotent
        set.update_hosts(hosts.clone());
        assert_eq!(addresses(&hosts), addresses(&set.hosts()));
        assert_eq!(2, set.healthy_hosts().len());

        set.update_hosts(vec![host("10.0.0.3:8080")]);
        assert_eq!(vec!["10.0.0.3:8080".to_string()], addresses(&set.hosts()));
    }

    #[test]
    fn test_update_hosts_keeps_duplicates() {
        let set = host_set();
        let h = host("10.0.0.1:8080");
        set.update_hosts(vec![h.clone(), h]);
        assert_eq!(2, set.len());
    }

    #[test]
    fn test_remove_hosts() {
        let set = host_set();
        set.update_hosts(vec![host("10.0.0.1:8080"), host("10.0.0.2:8080")]);

        set.remove_hosts(&["10.0.0.1:8080".to_string()]);
        assert_eq!(vec!["10.0.0.2:8080".to_string()], addresses(&set.hosts()));

        // no-op the second time, unknown addresses ignored
        set.remove_hosts(&["10.0.0.1:8080".to_string(), "bogus".to_string()]);
        assert_eq!(vec!["10.0.0.2:8080".to_string()], addresses(&set.hosts()));
    }

    #[test]
    fn test_member_update_callbacks() {
        let set = host_set();
        let events: Arc<Mutex<Vec<(Vec<String>, Vec<String>)>>> = Arc::default();

        for _ in 0..2 {
            let events = events.clone();
            set.add_member_update_cb(Arc::new(move |added, removed| {
                events
                    .lock()
                    .unwrap()
                    .push((addresses(added), addresses(removed)));
            }));
        }

        let h1 = host("10.0.0.1:8080");
        let h2 = host("10.0.0.2:8080");
        set.update_hosts(vec![h1.clone(), h2.clone()]);
        set.update_hosts(vec![h1, h2]);
        set.remove_hosts(&["10.0.0.2:8080".to_string()]);

        let events = events.lock().unwrap();
        // every observer, once per call
        assert_eq!(6, events.len());
        assert_eq!(
            (
                vec!["10.0.0.1:8080".to_string(), "10.0.0.2:8080".to_string()],
                vec![]
            ),
            events[0]
        );
        assert_eq!((vec![], vec![]), events[2]);
        assert_eq!((vec![], vec!["10.0.0.2:8080".to_string()]), events[4]);
    }

    #[test]
    fn test_callback_sees_new_membership() {
        let set = Arc::new(host_set());
        let seen = Arc::new(AtomicU64::new(0));

        let weak = Arc::downgrade(&set);
        let counter = seen.clone();
        set.add_member_update_cb(Arc::new(move |_, _| {
            let set = weak.upgrade().unwrap();
            counter.store(set.len() as u64, Ordering::SeqCst);
        }));

        set.update_hosts(vec![host("10.0.0.1:8080"), host("10.0.0.2:8080")]);
        assert_eq!(2, seen.load(Ordering::SeqCst));
    }

    #[test]
    fn test_refresh_health_hosts() {
        let set = host_set();
        let h1 = host("10.0.0.1:8080");
        let h2 = host("10.0.0.2:8080");
        set.update_hosts(vec![h1.clone(), h2.clone()]);

        h1.set_healthy(false);
        // not visible until the subset is refreshed
        assert_eq!(2, set.healthy_hosts().len());

        set.refresh_health_hosts(&h1);
        assert_eq!(vec!["10.0.0.2:8080".to_string()], addresses(&set.healthy_hosts()));
        assert_eq!(2, set.len());
        assert_eq!(1, set.health_refresh_count());
    }

    #[test]
    fn test_host_renewed() {
        let h = Host::new("10.0.0.1:8080", 5, BTreeMap::new()).unwrap();
        h.set_healthy(false);

        let fresh = h.renewed();
        assert!(fresh.is_healthy());
        assert_eq!(h.address(), fresh.address());
        assert_eq!(5, fresh.weight());
    }

    #[test]
    fn test_observer_follows_concurrent_writers() {
        let set = Arc::new(host_set());
        let tracked: Arc<Mutex<HashSet<String>>> = Arc::default();

        let view = tracked.clone();
        set.add_member_update_cb(Arc::new(move |added, removed| {
            let mut view = view.lock().unwrap();
            for h in removed {
                view.remove(h.address());
            }
            for h in added {
                view.insert(h.address().to_string());
            }
        }));

        let hosts: Vec<_> = (1..=6).map(|i| host(&format!("10.0.0.{i}:80"))).collect();
        let writers: Vec<_> = (0..4)
            .map(|w| {
                let set = set.clone();
                let hosts = hosts.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let start = (w + i) % hosts.len();
                        let end = (start + 1 + i % 3).min(hosts.len());
                        set.update_hosts(hosts[start..end].to_vec());
                        if i % 5 == 0 {
                            set.remove_hosts(&[hosts[start].address().to_string()]);
                        }
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let members: HashSet<String> = addresses(&set.hosts()).into_iter().collect();
        assert_eq!(members, *tracked.lock().unwrap());
    }

    #[test]
    fn test_concurrent_readers_see_consistent_snapshot() {
        let set = Arc::new(host_set());
        let hosts: Vec<_> = (1..=8).map(|i| host(&format!("10.0.0.{i}:80"))).collect();

        let writer = {
            let set = set.clone();
            let hosts = hosts.clone();
            std::thread::spawn(move || {
                for i in 0..200 {
                    set.update_hosts(hosts[..(i % hosts.len()) + 1].to_vec());
                    hosts[i % hosts.len()].set_healthy(i % 2 == 0);
                    set.refresh_health_hosts(&hosts[i % hosts.len()]);
                }
            })
        };

        for _ in 0..2000 {
            let snapshot = set.snapshot();
            let all: HashSet<*const Host> = snapshot.hosts().iter().map(Arc::as_ptr).collect();
            assert!(snapshot
                .healthy_hosts()
                .iter()
                .all(|h| all.contains(&Arc::as_ptr(h))));
        }

        writer.join().unwrap();
    }
}
