use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::CircuitBreakers;

/// One circuit breaker counter bounded by a fixed maximum.
#[derive(Debug)]
pub struct Resource {
    max: u64,
    current: AtomicU64,
}

impl Resource {
    pub fn new(max: u64) -> Self {
        Self {
            max,
            current: AtomicU64::new(0),
        }
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    pub fn can_create(&self) -> bool {
        self.current() < self.max
    }

    pub fn increase(&self) {
        self.current.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrements the counter, never below zero.
    pub fn decrease(&self) {
        let _ = self
            .current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
    }
}

/// Circuit breaker state of a cluster.
///
/// Thresholds are captured once; the counters are driven by the connection
/// and request layers.
#[derive(Debug)]
pub struct ResourceManager {
    connections: Resource,
    pending_requests: Resource,
    requests: Resource,
    retries: Resource,
}

impl ResourceManager {
    pub fn new(circuit_breakers: &CircuitBreakers) -> Self {
        let thresholds = circuit_breakers.default_thresholds();
        Self {
            connections: Resource::new(thresholds.max_connections),
            pending_requests: Resource::new(thresholds.max_pending_requests),
            requests: Resource::new(thresholds.max_requests),
            retries: Resource::new(thresholds.max_retries),
        }
    }

    pub fn connections(&self) -> &Resource {
        &self.connections
    }

    pub fn pending_requests(&self) -> &Resource {
        &self.pending_requests
    }

    pub fn requests(&self) -> &Resource {
        &self.requests
    }

    pub fn retries(&self) -> &Resource {
        &self.retries
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::Thresholds;

    #[test]
    fn test_thresholds_from_config() {
        let manager = ResourceManager::new(&CircuitBreakers::default());
        assert_eq!(1024, manager.connections().max());
        assert_eq!(1024, manager.pending_requests().max());
        assert_eq!(1024, manager.requests().max());
        assert_eq!(3, manager.retries().max());

        let manager = ResourceManager::new(&CircuitBreakers {
            thresholds: vec![
                Thresholds {
                    max_connections: 2,
                    max_pending_requests: 4,
                    max_requests: 8,
                    max_retries: 1,
                },
                Thresholds::default(),
            ],
        });
        assert_eq!(2, manager.connections().max());
        assert_eq!(4, manager.pending_requests().max());
        assert_eq!(8, manager.requests().max());
        assert_eq!(1, manager.retries().max());
    }

    #[test]
    fn test_resource_counting() {
        let retries = Resource::new(2);
        assert!(retries.can_create());
        retries.increase();
        retries.increase();
        assert!(!retries.can_create());
        retries.decrease();
        assert!(retries.can_create());
        retries.decrease();
        retries.decrease();
        assert_eq!(0, retries.current());
    }

    #[test]
    fn test_concurrent_counting() {
        let manager = Arc::new(ResourceManager::new(&CircuitBreakers::default()));
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        manager.requests().increase();
                    }
                    for _ in 0..500 {
                        manager.requests().decrease();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(4000, manager.requests().current());
        assert!(!manager.requests().can_create());
    }
}
