//! Service registry and load balancer (C7): register/deregister/discover,
//! heartbeat-based health, and pluggable balancing strategies (spec.md §4.7).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::info;

use crate::balance::{self, Candidate};
pub use crate::balance::BalancingStrategy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Healthy,
    Unhealthy,
    Draining,
}

#[derive(Debug, Clone)]
pub struct ServiceInstance {
    pub instance_id: String,
    pub service_name: String,
    pub address: String,
    pub weight: u32,
    pub status: ServiceStatus,
    pub active_connections: u64,
    pub last_heartbeat: Instant,
    pub metadata: HashMap<String, String>,
}

impl Candidate for ServiceInstance {
    fn id(&self) -> &str {
        &self.instance_id
    }
    fn weight(&self) -> u32 {
        self.weight
    }
    fn active_connections(&self) -> u64 {
        self.active_connections
    }
}

type EventHook = std::sync::Arc<dyn Fn(&str, &ServiceInstance) + Send + Sync>;

/// Registry of instances for every service name, with heartbeat-based
/// liveness and a selectable balancing strategy.
pub struct ServiceRegistry {
    instances: RwLock<HashMap<String, Vec<ServiceInstance>>>,
    round_robin_cursors: Mutex<HashMap<String, usize>>,
    heartbeat_timeout: Duration,
    hooks: Mutex<Vec<EventHook>>,
}

impl ServiceRegistry {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
            round_robin_cursors: Mutex::new(HashMap::new()),
            heartbeat_timeout,
            hooks: Mutex::new(Vec::new()),
        }
    }

    /// Registers an event hook invoked on register/deregister/status-change
    /// with `(event, instance)`.
    pub async fn on_event(&self, hook: impl Fn(&str, &ServiceInstance) + Send + Sync + 'static) {
        self.hooks.lock().await.push(std::sync::Arc::new(hook));
    }

    async fn fire(&self, event: &str, instance: &ServiceInstance) {
        let hooks = self.hooks.lock().await;
        for hook in hooks.iter() {
            hook(event, instance);
        }
    }

    pub async fn register(
        &self,
        service_name: &str,
        instance_id: &str,
        address: &str,
        weight: u32,
        metadata: HashMap<String, String>,
    ) {
        let instance = ServiceInstance {
            instance_id: instance_id.to_string(),
            service_name: service_name.to_string(),
            address: address.to_string(),
            weight: weight.max(1),
            status: ServiceStatus::Healthy,
            active_connections: 0,
            last_heartbeat: Instant::now(),
            metadata,
        };

        let mut instances = self.instances.write().await;
        let list = instances.entry(service_name.to_string()).or_default();
        list.retain(|i| i.instance_id != instance_id);
        list.push(instance.clone());
        drop(instances);

        info!(service = service_name, instance = instance_id, "registered");
        self.fire("register", &instance).await;
    }

    pub async fn deregister(&self, service_name: &str, instance_id: &str) -> bool {
        let mut instances = self.instances.write().await;
        let Some(list) = instances.get_mut(service_name) else {
            return false;
        };
        let Some(pos) = list.iter().position(|i| i.instance_id == instance_id) else {
            return false;
        };
        let removed = list.remove(pos);
        drop(instances);
        self.fire("deregister", &removed).await;
        true
    }

    pub async fn heartbeat(&self, service_name: &str, instance_id: &str) -> bool {
        let mut instances = self.instances.write().await;
        let Some(list) = instances.get_mut(service_name) else {
            return false;
        };
        let Some(instance) = list.iter_mut().find(|i| i.instance_id == instance_id) else {
            return false;
        };
        instance.last_heartbeat = Instant::now();
        if instance.status == ServiceStatus::Unhealthy {
            instance.status = ServiceStatus::Healthy;
            let snapshot = instance.clone();
            drop(instances);
            self.fire("status_change", &snapshot).await;
        }
        true
    }

    pub async fn update_status(
        &self,
        service_name: &str,
        instance_id: &str,
        status: ServiceStatus,
    ) -> bool {
        let mut instances = self.instances.write().await;
        let Some(list) = instances.get_mut(service_name) else {
            return false;
        };
        let Some(instance) = list.iter_mut().find(|i| i.instance_id == instance_id) else {
            return false;
        };
        instance.status = status;
        let snapshot = instance.clone();
        drop(instances);
        self.fire("status_change", &snapshot).await;
        true
    }

    /// Marks instances whose heartbeat is older than the configured timeout
    /// as unhealthy. Called periodically by the pool's health loop.
    pub async fn sweep_stale(&self) -> Vec<ServiceInstance> {
        let mut instances = self.instances.write().await;
        let mut went_stale = Vec::new();
        let now = Instant::now();
        for list in instances.values_mut() {
            for instance in list.iter_mut() {
                if instance.status != ServiceStatus::Unhealthy
                    && now.duration_since(instance.last_heartbeat) > self.heartbeat_timeout
                {
                    instance.status = ServiceStatus::Unhealthy;
                    went_stale.push(instance.clone());
                }
            }
        }
        drop(instances);
        for instance in &went_stale {
            self.fire("status_change", instance).await;
        }
        went_stale
    }

    /// Returns every `Healthy` instance of `service_name` (spec.md §4.7;
    /// `service_mesh.py`'s `discover` filters to `is_healthy` the same way).
    pub async fn discover(&self, service_name: &str) -> Vec<ServiceInstance> {
        self.instances
            .read()
            .await
            .get(service_name)
            .map(|list| {
                list.iter()
                    .filter(|i| i.status == ServiceStatus::Healthy)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Picks one healthy instance using `strategy`. `hash_key` is only
    /// consulted for [`BalancingStrategy::ConsistentHash`].
    pub async fn select(
        &self,
        service_name: &str,
        strategy: BalancingStrategy,
        hash_key: Option<&str>,
    ) -> Option<ServiceInstance> {
        let candidates = self.discover(service_name).await;
        let mut cursors = self.round_robin_cursors.lock().await;
        let cursor = cursors.entry(service_name.to_string()).or_insert(0);
        let index = balance::select_index(&candidates, strategy, hash_key, cursor)?;
        Some(candidates[index].clone())
    }

    pub async fn record_connection_start(&self, service_name: &str, instance_id: &str) {
        let mut instances = self.instances.write().await;
        if let Some(list) = instances.get_mut(service_name) {
            if let Some(instance) = list.iter_mut().find(|i| i.instance_id == instance_id) {
                instance.active_connections += 1;
            }
        }
    }

    pub async fn record_connection_end(&self, service_name: &str, instance_id: &str) {
        let mut instances = self.instances.write().await;
        if let Some(list) = instances.get_mut(service_name) {
            if let Some(instance) = list.iter_mut().find(|i| i.instance_id == instance_id) {
                instance.active_connections = instance.active_connections.saturating_sub(1);
            }
        }
    }
}

/// Monotonic tag generator used by tests that need distinct instance ids.
pub fn next_instance_tag() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    COUNTER.fetch_add(1, AtomicOrdering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_robin_cycles_through_instances() {
        let registry = ServiceRegistry::new(Duration::from_secs(30));
        registry
            .register("svc", "a", "10.0.0.1:80", 1, HashMap::new())
            .await;
        registry
            .register("svc", "b", "10.0.0.2:80", 1, HashMap::new())
            .await;

        let first = registry
            .select("svc", BalancingStrategy::RoundRobin, None)
            .await
            .unwrap();
        let second = registry
            .select("svc", BalancingStrategy::RoundRobin, None)
            .await
            .unwrap();
        let third = registry
            .select("svc", BalancingStrategy::RoundRobin, None)
            .await
            .unwrap();
        assert_ne!(first.instance_id, second.instance_id);
        assert_eq!(first.instance_id, third.instance_id);
    }

    #[tokio::test]
    async fn unhealthy_instances_are_excluded() {
        let registry = ServiceRegistry::new(Duration::from_secs(30));
        registry
            .register("svc", "a", "10.0.0.1:80", 1, HashMap::new())
            .await;
        registry
            .update_status("svc", "a", ServiceStatus::Unhealthy)
            .await;
        assert!(registry
            .select("svc", BalancingStrategy::RoundRobin, None)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn least_connections_prefers_idle_instance() {
        let registry = ServiceRegistry::new(Duration::from_secs(30));
        registry
            .register("svc", "a", "10.0.0.1:80", 1, HashMap::new())
            .await;
        registry
            .register("svc", "b", "10.0.0.2:80", 1, HashMap::new())
            .await;
        registry.record_connection_start("svc", "a").await;
        registry.record_connection_start("svc", "a").await;

        let chosen = registry
            .select("svc", BalancingStrategy::LeastConnections, None)
            .await
            .unwrap();
        assert_eq!(chosen.instance_id, "b");
    }

    #[tokio::test]
    async fn consistent_hash_is_stable_for_same_key() {
        let registry = ServiceRegistry::new(Duration::from_secs(30));
        for i in 0..5 {
            registry
                .register("svc", &format!("i{i}"), "addr", 1, HashMap::new())
                .await;
        }
        let first = registry
            .select("svc", BalancingStrategy::ConsistentHash, Some("user-42"))
            .await
            .unwrap();
        let second = registry
            .select("svc", BalancingStrategy::ConsistentHash, Some("user-42"))
            .await
            .unwrap();
        assert_eq!(first.instance_id, second.instance_id);
    }

    #[tokio::test]
    async fn heartbeat_revives_unhealthy_instance() {
        let registry = ServiceRegistry::new(Duration::from_secs(30));
        registry
            .register("svc", "a", "addr", 1, HashMap::new())
            .await;
        registry
            .update_status("svc", "a", ServiceStatus::Unhealthy)
            .await;
        assert!(registry.heartbeat("svc", "a").await);
        let instances = registry.discover("svc").await;
        assert_eq!(instances[0].status, ServiceStatus::Healthy);
    }

    #[tokio::test]
    async fn sweep_marks_stale_heartbeats_unhealthy() {
        let registry = ServiceRegistry::new(Duration::from_millis(20));
        registry
            .register("svc", "a", "addr", 1, HashMap::new())
            .await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        let stale = registry.sweep_stale().await;
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].instance_id, "a");
    }

    #[tokio::test]
    async fn deregister_removes_instance() {
        let registry = ServiceRegistry::new(Duration::from_secs(30));
        registry
            .register("svc", "a", "addr", 1, HashMap::new())
            .await;
        assert!(registry.deregister("svc", "a").await);
        assert!(!registry.deregister("svc", "a").await);
        assert!(registry.discover("svc").await.is_empty());
    }
}
