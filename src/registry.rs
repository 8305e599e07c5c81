use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::time::Duration;

use parking_lot::RwLock;
use time::OffsetDateTime;

use crate::error::DhtError;
use crate::node::contact::ago;
use crate::node_id::NodeId;

/// The role a node plays in the network.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Message-processing node.
    Capacitor,
    /// Storage node.
    Locker,
}

impl Display for NodeRole {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            NodeRole::Capacitor => f.write_str("capacitor"),
            NodeRole::Locker => f.write_str("locker"),
        }
    }
}

impl FromStr for NodeRole {
    type Err = DhtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "capacitor" => Ok(NodeRole::Capacitor),
            "locker" => Ok(NodeRole::Locker),
            other => Err(DhtError::Config(format!("unknown node role `{}`", other))),
        }
    }
}

/// Metadata a node advertises about a service it runs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub node_id: NodeId,
    pub role: NodeRole,
    pub address: String,
    pub api_port: u16,
    pub grpc_port: u16,
    pub num_shards: u32,
    pub version: String,
    #[serde(default)]
    pub properties: HashMap<String, String>,
    #[serde(with = "time::serde::timestamp")]
    pub last_seen: OffsetDateTime,
}

impl ServiceInfo {
    /// Constructs a `ServiceInfo` with a single shard, no ports and no properties, seen now.
    pub fn new(node_id: NodeId, role: NodeRole, address: &str) -> Self {
        ServiceInfo {
            node_id,
            role,
            address: address.to_string(),
            api_port: 0,
            grpc_port: 0,
            num_shards: 1,
            version: crate::VERSION.to_string(),
            properties: HashMap::new(),
            last_seen: OffsetDateTime::now_utc(),
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = OffsetDateTime::now_utc();
    }

    /// Returns `true` if the service has been seen within `ttl`.
    pub fn is_active(&self, ttl: Duration) -> bool {
        match ago(ttl) {
            Some(cutoff) => self.last_seen >= cutoff,
            None => true,
        }
    }
}

/// In-memory map from service id to advertised `ServiceInfo`. Registration is last-write-wins.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: RwLock<HashMap<String, ServiceInfo>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        ServiceRegistry {
            services: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, service_id: &str, info: ServiceInfo) {
        debug!("Registering service {} ({})", service_id, info.role);
        self.services.write().insert(service_id.to_string(), info);
    }

    pub fn lookup(&self, service_id: &str) -> Option<ServiceInfo> {
        self.services.read().get(service_id).cloned()
    }

    /// Returns every service with `role`, stale entries included, in no particular order.
    pub fn find_by_role(&self, role: NodeRole) -> Vec<ServiceInfo> {
        self.services
            .read()
            .values()
            .filter(|info| info.role == role)
            .cloned()
            .collect()
    }

    /// Returns the services with `role` that have been seen within `ttl`.
    pub fn find_active_by_role(&self, role: NodeRole, ttl: Duration) -> Vec<ServiceInfo> {
        self.services
            .read()
            .values()
            .filter(|info| info.role == role && info.is_active(ttl))
            .cloned()
            .collect()
    }

    /// Refreshes `last_seen` of every service advertised by `node_id`. Returns how many were
    /// refreshed.
    pub fn touch_node(&self, node_id: &NodeId) -> usize {
        let mut services = self.services.write();
        let mut ret = 0;
        for info in services.values_mut().filter(|info| info.node_id == *node_id) {
            info.touch();
            ret += 1;
        }
        ret
    }

    pub fn remove(&self, service_id: &str) -> Option<ServiceInfo> {
        self.services.write().remove(service_id)
    }

    pub fn len(&self) -> usize {
        self.services.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use time::OffsetDateTime;

    use super::{NodeRole, ServiceInfo, ServiceRegistry};
    use crate::node_id::NodeId;

    fn service(role: NodeRole) -> ServiceInfo {
        ServiceInfo::new(NodeId::random(), role, "127.0.0.1:8080")
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = ServiceRegistry::new();
        assert!(registry.lookup("capacitor:a").is_none());

        let info = service(NodeRole::Capacitor);
        registry.register("capacitor:a", info.clone());
        assert_eq!(registry.lookup("capacitor:a"), Some(info));
    }

    #[test]
    fn test_register_last_write_wins() {
        let registry = ServiceRegistry::new();
        registry.register("svc", service(NodeRole::Capacitor));
        let second = service(NodeRole::Locker);
        registry.register("svc", second.clone());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup("svc"), Some(second));
    }

    #[test]
    fn test_find_by_role_includes_stale() {
        let registry = ServiceRegistry::new();
        let mut stale = service(NodeRole::Locker);
        stale.last_seen = OffsetDateTime::UNIX_EPOCH;
        registry.register("locker:1", stale);
        registry.register("locker:2", service(NodeRole::Locker));
        registry.register("capacitor:1", service(NodeRole::Capacitor));

        assert_eq!(registry.find_by_role(NodeRole::Locker).len(), 2);
        assert_eq!(registry.find_by_role(NodeRole::Capacitor).len(), 1);

        let active = registry.find_active_by_role(NodeRole::Locker, Duration::from_secs(300));
        assert_eq!(active.len(), 1);

        // a ttl reaching past the representable range keeps everything active
        let active = registry.find_active_by_role(NodeRole::Locker, Duration::MAX);
        assert_eq!(active.len(), 2);
    }

    #[test]
    fn test_touch_node() {
        let registry = ServiceRegistry::new();
        let mut info = service(NodeRole::Capacitor);
        info.last_seen = OffsetDateTime::UNIX_EPOCH;
        let node_id = info.node_id;
        registry.register("capacitor:self", info);
        registry.register("capacitor:other", service(NodeRole::Capacitor));

        assert_eq!(registry.touch_node(&node_id), 1);
        let touched = registry.lookup("capacitor:self").unwrap();
        assert!(touched.is_active(Duration::from_secs(60)));
    }

    #[test]
    fn test_role_parsing() {
        assert_eq!("capacitor".parse::<NodeRole>().unwrap(), NodeRole::Capacitor);
        assert_eq!(" Locker ".parse::<NodeRole>().unwrap(), NodeRole::Locker);
        assert!("vault".parse::<NodeRole>().is_err());
        assert_eq!(NodeRole::Locker.to_string(), "locker");
        assert_eq!(serde_json::to_string(&NodeRole::Capacitor).unwrap(), "\"capacitor\"");
    }
}
