pub mod contact;
mod lookup;

use std::cmp;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;

use crate::config::Config;
use crate::error::{DhtError, Result};
use crate::identity::Identity;
use crate::node::contact::Contact;
use crate::node_id::NodeId;
use crate::protocol::{
    ErrorStatus, Message, Protocol, Request, RequestPayload, Response, ResponsePayload,
};
use crate::registry::{NodeRole, ServiceInfo, ServiceRegistry};
use crate::routing::RoutingTable;
use crate::{EXPIRY_SWEEP_INTERVAL, REPLICATION_PARAM, ROUTING_TABLE_SIZE};

/// Threads owned by a running node and the channels used to stop them.
#[derive(Default)]
struct Background {
    shutdown: Vec<Sender<()>>,
    handles: Vec<JoinHandle<()>>,
}

/// A node in the DHT.
///
/// `Node` is the context shared by the request handlers, the lookup workers and the background
/// loops. Cloning it is cheap and every clone refers to the same routing table and registry.
#[derive(Clone)]
pub struct Node {
    contact: Arc<Contact>,
    identity: Arc<Identity>,
    config: Arc<Config>,
    routing_table: Arc<RoutingTable>,
    registry: Arc<ServiceRegistry>,
    pending_requests: Arc<Mutex<HashMap<u64, Sender<Response>>>>,
    protocol: Arc<Protocol>,
    is_active: Arc<AtomicBool>,
    background: Arc<Mutex<Background>>,
}

impl Node {
    /// Constructs a new `Node`: validates the listen address, generates a fresh identity and
    /// binds the DHT socket. Nothing runs until `start` is called.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let listen_addr: SocketAddr = config
            .dht_address()
            .parse()
            .map_err(|_| DhtError::InvalidListenAddress(config.dht_address()))?;
        let identity = Identity::generate()?;
        let protocol = Protocol::new(UdpSocket::bind(listen_addr)?);
        let bound_addr = protocol.local_addr()?;

        let advertised_ip = match config.external_ip {
            Some(ref ip) => ip
                .parse::<IpAddr>()
                .map_err(|_| DhtError::Config(format!("invalid external ip `{}`", ip)))?,
            None if bound_addr.ip().is_unspecified() => {
                warn!(
                    "{} - No external ip configured, advertising loopback",
                    bound_addr
                );
                IpAddr::V4(Ipv4Addr::LOCALHOST)
            },
            None => bound_addr.ip(),
        };
        let contact = Contact::new(
            identity.node_id(),
            SocketAddr::new(advertised_ip, bound_addr.port()),
        );
        info!("{} - Bound node {}", contact.addr, contact.id);

        Ok(Node {
            routing_table: Arc::new(RoutingTable::new(identity.node_id())),
            contact: Arc::new(contact),
            identity: Arc::new(identity),
            config: Arc::new(config),
            registry: Arc::new(ServiceRegistry::new()),
            pending_requests: Arc::new(Mutex::new(HashMap::new())),
            protocol: Arc::new(protocol),
            is_active: Arc::new(AtomicBool::new(false)),
            background: Arc::new(Mutex::new(Background::default())),
        })
    }

    /// Starts listening, registers the node's own service, spawns the background loops and
    /// bootstraps the routing table from the configured peers.
    pub fn start(&self) -> Result<()> {
        if self.is_active.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let (message_tx, message_rx) = channel();
        let listener = self
            .protocol
            .start(message_tx, Arc::clone(&self.is_active))?;
        let handler = self.start_message_handler(message_rx)?;
        {
            let mut background = self.background.lock();
            background.handles.push(listener);
            background.handles.push(handler);
        }

        self.registry
            .register(&self.local_service_id(), self.local_service_info());

        self.spawn_loop("bucket refresher", self.config.refresh_interval, |node| {
            node.refresh_buckets()
        })?;
        self.spawn_loop("service republisher", self.config.republish_interval, |node| {
            let count = node.registry.touch_node(&node.contact.id);
            debug!("{} - Republished {} services", node.contact.addr, count);
        })?;
        let sweep_interval = cmp::min(
            Duration::from_secs(EXPIRY_SWEEP_INTERVAL),
            self.config.contact_expiry,
        );
        self.spawn_loop("contact expirer", sweep_interval, |node| {
            let count = node.routing_table.expire_contacts(node.config.contact_expiry);
            if count > 0 {
                info!("{} - Expired {} contacts", node.contact.addr, count);
            }
        })?;

        self.bootstrap()
    }

    /// Signals every background thread to stop and waits for them. RPCs that are in flight are
    /// left to run into their timeout.
    pub fn stop(&self) {
        self.is_active.store(false, Ordering::Release);
        let background = {
            let mut background = self.background.lock();
            std::mem::take(&mut *background)
        };
        drop(background.shutdown);
        for handle in background.handles {
            if handle.join().is_err() {
                error!("{} - Background thread panicked", self.contact.addr);
            }
        }
        info!("{} - Stopped node", self.contact.addr);
    }

    /// Starts a thread that handles incoming requests and routes responses to their callers.
    fn start_message_handler(
        &self,
        rx: Receiver<(Message, SocketAddr)>,
    ) -> Result<JoinHandle<()>> {
        let node = self.clone();
        let handle = thread::Builder::new()
            .name("message handler".to_string())
            .spawn(move || {
                for (message, src_addr) in rx.iter() {
                    match message {
                        Message::Request(request) => node.handle_request(request, src_addr),
                        Message::Response(response) => node.handle_response(response),
                    }
                }
                debug!("{} - Stopped message handler", node.contact.addr);
            })?;
        Ok(handle)
    }

    /// Spawns a thread that calls `tick` every `interval` until the node is stopped. The stop
    /// signal is observed between ticks.
    fn spawn_loop<F>(&self, name: &'static str, interval: Duration, tick: F) -> Result<()>
    where
        F: Fn(&Node) + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = channel::<()>();
        let node = self.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Err(RecvTimeoutError::Timeout) = shutdown_rx.recv_timeout(interval) {
                    tick(&node);
                }
                debug!("{} - Stopped {}", node.contact.addr, name);
            })?;

        let mut background = self.background.lock();
        background.shutdown.push(shutdown_tx);
        background.handles.push(handle);
        Ok(())
    }

    /// Bootstraps the routing table. Every configured peer is pinged to learn its id, then the
    /// node looks up its own id to fill the buckets around it.
    fn bootstrap(&self) -> Result<()> {
        if self.config.bootstrap_nodes.is_empty() {
            info!(
                "{} - No bootstrap nodes configured, starting a new network",
                self.contact.addr
            );
            return Ok(());
        }

        for addr in &self.config.bootstrap_nodes {
            match self.add_bootstrap_node(addr) {
                Ok(contact) => info!("{} - Bootstrapped from {:?}", self.contact.addr, contact),
                Err(err) => warn!(
                    "{} - Failed to add bootstrap node {}: {}",
                    self.contact.addr, addr, err
                ),
            }
        }

        self.lookup(&self.contact.id)?;
        info!(
            "{} - Routing table holds {} contacts after bootstrap",
            self.contact.addr,
            self.routing_table.size()
        );
        Ok(())
    }

    fn add_bootstrap_node(&self, addr: &str) -> Result<Contact> {
        let addr = resolve(addr)?;
        let info = self.ping(addr)?;
        let contact = Contact::new(info.node_id, addr);
        self.routing_table.insert(contact.clone());
        Ok(contact)
    }

    /// Refreshes every stale, non-empty bucket plus one random bucket by looking up an id in its
    /// range.
    fn refresh_buckets(&self) {
        let mut indexes = self
            .routing_table
            .stale_indexes(self.config.refresh_interval);
        let random_index = rand::thread_rng().gen_range(0..ROUTING_TABLE_SIZE);
        if !indexes.contains(&random_index) {
            indexes.push(random_index);
        }

        for index in indexes {
            if !self.is_active() {
                break;
            }
            let target = self.routing_table.random_id_in_bucket(index);
            if let Err(err) = self.lookup(&target) {
                debug!(
                    "{} - Refresh of bucket {} failed: {}",
                    self.contact.addr, index, err
                );
            }
        }
    }

    /// Records a peer we heard from directly.
    fn observe(&self, mut contact: Contact) {
        if contact.id == self.contact.id {
            return;
        }
        contact.touch();
        self.routing_table.insert(contact);
    }

    /// Handles a request RPC and answers it.
    fn handle_request(&self, request: Request, src_addr: SocketAddr) {
        debug!(
            "{} - Receiving request from {:?} {:?}",
            self.contact.addr, request.sender, request.payload,
        );
        self.observe(request.sender.clone());

        let payload = match request.payload {
            RequestPayload::Ping => ResponsePayload::Pong(self.local_service_info()),
            RequestPayload::FindNode { target } => match target.parse::<NodeId>() {
                Ok(target) => {
                    ResponsePayload::Nodes(self.routing_table.closest(&target, REPLICATION_PARAM))
                },
                Err(err) => ResponsePayload::Error {
                    status: ErrorStatus::BadRequest,
                    message: format!("invalid target: {}", err),
                },
            },
            RequestPayload::FindService { role } => {
                let mut services = self.registry.find_by_role(role);
                // most recently seen first so that truncation drops the stalest
                services.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
                ResponsePayload::Services(services)
            },
            RequestPayload::FindValue { .. } | RequestPayload::Store { .. } => {
                ResponsePayload::Error {
                    status: ErrorStatus::NotImplemented,
                    message: "not implemented".to_string(),
                }
            },
        };

        let mut response = Response {
            token: request.token,
            receiver: (*self.contact).clone(),
            payload,
        };
        match response.truncate_to_datagram() {
            Ok(0) => {},
            Ok(dropped) => warn!(
                "{} - Dropped {} services that do not fit in the answer to {}",
                self.contact.addr, dropped, src_addr
            ),
            Err(err) => warn!(
                "{} - Could not size answer to {}: {}",
                self.contact.addr, src_addr, err
            ),
        }
        if let Err(err) = self
            .protocol
            .send_message(&Message::Response(response), src_addr)
        {
            warn!(
                "{} - Could not answer {}: {}",
                self.contact.addr, src_addr, err
            );
        }
    }

    /// Handles a response RPC. If the token in the response does not match any outgoing request,
    /// then the response will be ignored.
    fn handle_response(&self, response: Response) {
        self.observe(response.receiver.clone());
        let sender = self.pending_requests.lock().remove(&response.token);
        match sender {
            Some(sender) => {
                debug!(
                    "{} - Receiving response from {:?} {:?}",
                    self.contact.addr, response.receiver, response.payload,
                );
                if sender.send(response).is_err() {
                    debug!("{} - Requester went away", self.contact.addr);
                }
            },
            None => warn!(
                "{} - Original request not found; irrelevant response or expired request.",
                self.contact.addr
            ),
        }
    }

    /// Sends a request RPC and waits for the matching response.
    fn send_request(&self, dest: SocketAddr, payload: RequestPayload) -> Result<ResponsePayload> {
        if !self.is_active() {
            return Err(DhtError::NotRunning);
        }
        debug!(
            "{} - Sending request to {} {:?}",
            self.contact.addr, dest, payload
        );

        let (response_tx, response_rx) = channel();
        let token = {
            let mut pending_requests = self.pending_requests.lock();
            let mut token = rand::random::<u64>();
            while pending_requests.contains_key(&token) {
                token = rand::random::<u64>();
            }
            pending_requests.insert(token, response_tx);
            token
        };

        let request = Message::Request(Request {
            token,
            sender: (*self.contact).clone(),
            payload,
        });
        if let Err(err) = self.protocol.send_message(&request, dest) {
            self.pending_requests.lock().remove(&token);
            return Err(err);
        }

        match response_rx.recv_timeout(self.config.request_timeout) {
            Ok(response) => match response.payload {
                ResponsePayload::Error { status, message } => {
                    Err(DhtError::Remote { status, message })
                },
                payload => Ok(payload),
            },
            Err(_) => {
                self.pending_requests.lock().remove(&token);
                warn!(
                    "{} - Request to {} timed out after {:?}",
                    self.contact.addr, dest, self.config.request_timeout
                );
                Err(DhtError::Timeout(dest))
            },
        }
    }

    /// Sends a `PING` RPC and returns the service info of the responder.
    pub fn ping(&self, addr: SocketAddr) -> Result<ServiceInfo> {
        match self.send_request(addr, RequestPayload::Ping)? {
            ResponsePayload::Pong(info) => Ok(info),
            _ => Err(DhtError::UnexpectedResponse),
        }
    }

    /// Sends a `FIND_NODE` RPC with a hex encoded target. Contacts beyond `REPLICATION_PARAM`
    /// and the local node itself are dropped from the answer.
    pub fn find_node(&self, addr: SocketAddr, target: &str) -> Result<Vec<Contact>> {
        let payload = RequestPayload::FindNode {
            target: target.to_string(),
        };
        match self.send_request(addr, payload)? {
            ResponsePayload::Nodes(mut contacts) => {
                contacts.truncate(REPLICATION_PARAM);
                contacts.retain(|contact| contact.id != self.contact.id);
                Ok(contacts)
            },
            _ => Err(DhtError::UnexpectedResponse),
        }
    }

    /// Asks the peer at `addr` for the services it knows with `role`.
    pub fn find_remote_services(
        &self,
        addr: SocketAddr,
        role: NodeRole,
    ) -> Result<Vec<ServiceInfo>> {
        match self.send_request(addr, RequestPayload::FindService { role })? {
            ResponsePayload::Services(services) => Ok(services),
            _ => Err(DhtError::UnexpectedResponse),
        }
    }

    /// Sends a `STORE` RPC. Peers do not store values, so this fails with `NotImplemented`.
    pub fn store(&self, addr: SocketAddr, key: &str, value: &str) -> Result<()> {
        let payload = RequestPayload::Store {
            key: NodeId::from_key(key),
            value: value.to_string(),
        };
        self.send_request(addr, payload).map(|_| ())
    }

    /// Sends a `FIND_VALUE` RPC. Peers do not store values, so this fails with `NotImplemented`.
    pub fn find_value(&self, addr: SocketAddr, key: &str) -> Result<String> {
        let payload = RequestPayload::FindValue {
            key: NodeId::from_key(key),
        };
        self.send_request(addr, payload)?;
        Err(DhtError::UnexpectedResponse)
    }

    /// Registers a service locally. The last registration under `service_id` wins.
    pub fn register_service(&self, service_id: &str, info: ServiceInfo) {
        self.registry.register(service_id, info);
    }

    pub fn find_service(&self, service_id: &str) -> Result<ServiceInfo> {
        self.registry
            .lookup(service_id)
            .ok_or_else(|| DhtError::ServiceNotFound(service_id.to_string()))
    }

    /// Returns every known service with `role`, including ones not seen recently.
    pub fn find_services_by_role(&self, role: NodeRole) -> Vec<ServiceInfo> {
        self.registry.find_by_role(role)
    }

    /// Returns the services with `role` seen within the configured service ttl.
    pub fn find_active_services_by_role(&self, role: NodeRole) -> Vec<ServiceInfo> {
        self.registry
            .find_active_by_role(role, self.config.service_ttl)
    }

    /// Returns the service info this node advertises about itself.
    pub fn local_service_info(&self) -> ServiceInfo {
        let address = format!("{}:{}", self.contact.addr.ip(), self.config.api_port);
        let mut info = ServiceInfo::new(self.contact.id, self.config.node_role, &address);
        info.api_port = self.config.api_port;
        info.grpc_port = self.config.grpc_port;
        info.num_shards = self.config.num_shards;
        info.properties
            .insert("dht_address".to_string(), self.contact.addr.to_string());
        info
    }

    /// Returns the id the node's own service is registered under.
    pub fn local_service_id(&self) -> String {
        format!("{}:{}", self.config.node_role, self.contact.id)
    }

    pub fn node_id(&self) -> NodeId {
        self.contact.id
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.identity.public_key_bytes()
    }

    /// Returns the `Contact` peers use to reach this node.
    pub fn contact(&self) -> Contact {
        (*self.contact).clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_active(&self) -> bool {
        self.is_active.load(Ordering::Acquire)
    }

    pub fn routing_table_size(&self) -> usize {
        self.routing_table.size()
    }

    /// Returns every contact in the routing table.
    pub fn known_peers(&self) -> Vec<Contact> {
        self.routing_table.contacts()
    }

    pub fn knows(&self, id: &NodeId) -> bool {
        self.routing_table.contains(id)
    }
}

/// Resolves a `host:port` string to its first socket address.
fn resolve(addr: &str) -> Result<SocketAddr> {
    addr.to_socket_addrs()?
        .next()
        .ok_or_else(|| DhtError::Config(format!("could not resolve `{}`", addr)))
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::Duration;

    use super::Node;
    use crate::config::Config;
    use crate::error::DhtError;
    use crate::node::contact::Contact;
    use crate::node_id::NodeId;
    use crate::protocol::ErrorStatus;
    use crate::registry::{NodeRole, ServiceInfo};

    fn config() -> Config {
        let mut config = Config::default();
        config.listen_address = "127.0.0.1".to_string();
        config.dht_port = 0;
        config.request_timeout = Duration::from_millis(500);
        config
    }

    fn started() -> Node {
        let node = Node::new(config()).unwrap();
        node.start().unwrap();
        node
    }

    #[test]
    fn test_invalid_listen_address() {
        let mut config = config();
        config.listen_address = "not an ip".to_string();
        match Node::new(config) {
            Err(DhtError::InvalidListenAddress(_)) => {},
            _ => panic!("expected an invalid listen address"),
        }
    }

    #[test]
    fn test_zero_intervals_are_rejected() {
        let mut zero_expiry = config();
        zero_expiry.contact_expiry = Duration::from_secs(0);
        let mut zero_refresh = config();
        zero_refresh.refresh_interval = Duration::from_secs(0);
        let mut zero_timeout = config();
        zero_timeout.request_timeout = Duration::from_secs(0);

        for config in vec![zero_expiry, zero_refresh, zero_timeout] {
            match Node::new(config) {
                Err(DhtError::Config(_)) => {},
                other => panic!("unexpected {:?}", other.map(|node| node.node_id())),
            }
        }
    }

    #[test]
    fn test_node_id_matches_identity() {
        let node = Node::new(config()).unwrap();
        assert_eq!(&node.node_id().0[..], &node.public_key()[..20]);
        assert_eq!(node.contact().addr.ip().to_string(), "127.0.0.1");
        assert_ne!(node.contact().addr.port(), 0);
    }

    #[test]
    fn test_rpc_requires_running_node() {
        let node = Node::new(config()).unwrap();
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        match node.ping(addr) {
            Err(DhtError::NotRunning) => {},
            other => panic!("unexpected {:?}", other.map(|info| info.node_id)),
        }
    }

    #[test]
    fn test_start_registers_self() {
        let node = started();
        let info = node.find_service(&node.local_service_id()).unwrap();
        assert_eq!(info.node_id, node.node_id());
        assert_eq!(info.role, NodeRole::Capacitor);
        assert_eq!(node.find_services_by_role(NodeRole::Capacitor).len(), 1);
        assert!(node.find_service("locker:missing").is_err());
        node.stop();
        assert!(!node.is_active());
    }

    #[test]
    fn test_lookup_without_contacts_fails() {
        let node = started();
        match node.lookup(&NodeId::random()) {
            Err(DhtError::NoContacts) => {},
            other => panic!("unexpected {:?}", other),
        }
        node.stop();
    }

    #[test]
    fn test_ping_learns_peer() {
        let a = started();
        let b = started();
        let info = a.ping(b.contact().addr).unwrap();
        assert_eq!(info.node_id, b.node_id());
        assert!(a.knows(&b.node_id()));
        assert!(b.knows(&a.node_id()));
        a.stop();
        b.stop();
    }

    #[test]
    fn test_find_node_rejects_malformed_target() {
        let a = started();
        let b = started();
        let err = a.find_node(b.contact().addr, "abcdef").unwrap_err();
        assert!(err.is_client_error());

        let err = a.find_node(b.contact().addr, "not hex").unwrap_err();
        assert!(err.is_client_error());

        // the peer keeps serving after a bad request
        assert!(a.find_node(b.contact().addr, &NodeId::random().to_string()).is_ok());
        a.stop();
        b.stop();
    }

    #[test]
    fn test_value_rpcs_are_not_implemented() {
        let a = started();
        let b = started();
        match a.store(b.contact().addr, "key", "value") {
            Err(DhtError::Remote { status, .. }) => assert_eq!(status, ErrorStatus::NotImplemented),
            other => panic!("unexpected {:?}", other),
        }
        match a.find_value(b.contact().addr, "key") {
            Err(DhtError::Remote { status, .. }) => assert_eq!(status, ErrorStatus::NotImplemented),
            other => panic!("unexpected {:?}", other),
        }
        a.stop();
        b.stop();
    }

    #[test]
    fn test_find_remote_services() {
        let a = started();
        let b = started();
        let locker = ServiceInfo::new(NodeId::random(), NodeRole::Locker, "10.0.0.2:8080");
        b.register_service("locker:1", locker.clone());

        let lockers = a.find_remote_services(b.contact().addr, NodeRole::Locker).unwrap();
        assert_eq!(lockers.len(), 1);
        assert_eq!(lockers[0].node_id, locker.node_id);
        assert_eq!(lockers[0].address, "10.0.0.2:8080");
        a.stop();
        b.stop();
    }

    #[test]
    fn test_find_remote_services_fits_in_datagram() {
        let a = started();
        let b = started();
        let mut stale = ServiceInfo::new(NodeId::random(), NodeRole::Locker, "10.0.0.3:8080");
        stale.last_seen = time::OffsetDateTime::UNIX_EPOCH;
        b.register_service("locker:stale", stale.clone());
        for i in 0..400 {
            let mut info = ServiceInfo::new(NodeId::random(), NodeRole::Locker, "10.0.0.2:8080");
            info.properties
                .insert("shard".to_string(), format!("{:0>120}", i));
            b.register_service(&format!("locker:{}", i), info);
        }

        let lockers = a.find_remote_services(b.contact().addr, NodeRole::Locker).unwrap();
        assert!(!lockers.is_empty());
        assert!(lockers.len() < 401);
        assert!(lockers.iter().all(|info| info.node_id != stale.node_id));
        a.stop();
        b.stop();
    }

    #[test]
    fn test_ping_timeout() {
        let a = started();
        let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        match a.ping(silent.local_addr().unwrap()) {
            Err(DhtError::Timeout(_)) => {},
            other => panic!("unexpected {:?}", other.map(|info| info.node_id)),
        }
        a.stop();
    }

    #[test]
    fn test_lookup_survives_unresponsive_contact() {
        let a = started();
        let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        a.routing_table
            .insert(Contact::new(NodeId::random(), silent.local_addr().unwrap()));
        assert!(a.lookup(&NodeId::random()).is_ok());
        a.stop();
    }
}
