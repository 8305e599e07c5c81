use std::fmt::{self, Display, Formatter};
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::{DhtError, Result};
use crate::node::contact::Contact;
use crate::node_id::NodeId;
use crate::registry::{NodeRole, ServiceInfo};
use crate::MESSAGE_LENGTH;

/// How often the listener wakes up to check whether it should stop.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Request {
    pub token: u64,
    pub sender: Contact,
    pub payload: RequestPayload,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum RequestPayload {
    Ping,
    /// The target is kept as text so that a malformed id can be answered with `BadRequest`.
    FindNode { target: String },
    FindService { role: NodeRole },
    FindValue { key: NodeId },
    Store { key: NodeId, value: String },
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Response {
    pub token: u64,
    pub receiver: Contact,
    pub payload: ResponsePayload,
}

impl Response {
    /// Drops trailing services from a `Services` payload until the encoded response fits in one
    /// datagram. Returns the number of services dropped.
    pub fn truncate_to_datagram(&mut self) -> Result<usize> {
        let mut services = match self.payload {
            ResponsePayload::Services(ref mut services) => std::mem::take(services),
            _ => return Ok(0),
        };

        // the list encodes as `[a,b,c]` inside an otherwise fixed envelope
        let mut len = Message::Response(self.clone()).encode()?.len();
        let mut kept = 0;
        for info in &services {
            let item_len = serde_json::to_vec(info)?.len() + if kept > 0 { 1 } else { 0 };
            if len + item_len > MESSAGE_LENGTH {
                break;
            }
            len += item_len;
            kept += 1;
        }

        let dropped = services.len() - kept;
        services.truncate(kept);
        self.payload = ResponsePayload::Services(services);
        Ok(dropped)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum ResponsePayload {
    Pong(ServiceInfo),
    Nodes(Vec<Contact>),
    Services(Vec<ServiceInfo>),
    Error { status: ErrorStatus, message: String },
}

/// Error status carried by a `ResponsePayload::Error`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorStatus {
    BadRequest,
    NotImplemented,
}

impl Display for ErrorStatus {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            ErrorStatus::BadRequest => f.write_str("400 Bad Request"),
            ErrorStatus::NotImplemented => f.write_str("501 Not Implemented"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Message {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes a datagram. Every id inside must be valid hex of the right length, otherwise the
    /// whole message is rejected.
    pub fn decode(data: &[u8]) -> Result<Message> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Datagram transport shared by every thread of a node.
#[derive(Clone)]
pub struct Protocol {
    socket: Arc<UdpSocket>,
}

impl Protocol {
    pub fn new(socket: UdpSocket) -> Protocol {
        Protocol {
            socket: Arc::new(socket),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Spawns the listener thread. Decoded messages are forwarded to `tx` together with the
    /// address they came from. The thread exits once `is_active` is cleared or `tx` is closed.
    pub fn start(
        &self,
        tx: Sender<(Message, SocketAddr)>,
        is_active: Arc<AtomicBool>,
    ) -> Result<JoinHandle<()>> {
        self.socket.set_read_timeout(Some(POLL_INTERVAL))?;
        let socket = Arc::clone(&self.socket);
        let handle = thread::spawn(move || {
            let mut buffer = vec![0u8; MESSAGE_LENGTH];
            while is_active.load(Ordering::Acquire) {
                let (len, src_addr) = match socket.recv_from(&mut buffer) {
                    Ok(received) => received,
                    Err(ref err)
                        if err.kind() == ErrorKind::WouldBlock
                            || err.kind() == ErrorKind::TimedOut =>
                    {
                        continue;
                    },
                    Err(err) => {
                        warn!("Protocol: receive failed: {}", err);
                        continue;
                    },
                };

                let message = match Message::decode(&buffer[..len]) {
                    Ok(message) => message,
                    Err(err) => {
                        warn!("Protocol: dropping malformed datagram from {}: {}", src_addr, err);
                        continue;
                    },
                };

                if tx.send((message, src_addr)).is_err() {
                    warn!("Protocol: Connection closed.");
                    break;
                }
            }
            debug!("Protocol: listener stopped");
        });
        Ok(handle)
    }

    pub fn send_message(&self, message: &Message, addr: SocketAddr) -> Result<()> {
        let buffer = message.encode()?;
        if buffer.len() > MESSAGE_LENGTH {
            return Err(DhtError::Io(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!("message of {} bytes exceeds datagram limit", buffer.len()),
            )));
        }
        self.socket.send_to(&buffer, addr)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::{SocketAddr, UdpSocket};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc::channel;
    use std::sync::Arc;
    use std::time::Duration;

    use super::{Message, Protocol, Request, RequestPayload, Response, ResponsePayload};
    use crate::node::contact::Contact;
    use crate::node_id::NodeId;
    use crate::registry::{NodeRole, ServiceInfo};
    use crate::{MESSAGE_LENGTH, REPLICATION_PARAM};

    fn contact() -> Contact {
        Contact::new(NodeId::random(), SocketAddr::from(([127, 0, 0, 1], 4000)))
    }

    #[test]
    fn test_find_node_target_is_not_validated_on_decode() {
        let message = Message::Request(Request {
            token: 7,
            sender: contact(),
            payload: RequestPayload::FindNode {
                target: "abcd".to_string(),
            },
        });
        let decoded = Message::decode(&message.encode().unwrap()).unwrap();
        match decoded {
            Message::Request(request) => assert_eq!(
                request.payload,
                RequestPayload::FindNode {
                    target: "abcd".to_string()
                }
            ),
            _ => panic!("expected request"),
        }
    }

    #[test]
    fn test_malformed_contact_rejects_response() {
        let message = Message::Response(Response {
            token: 1,
            receiver: contact(),
            payload: ResponsePayload::Nodes(vec![contact()]),
        });
        let mut json: serde_json::Value =
            serde_json::from_slice(&message.encode().unwrap()).unwrap();
        json["Response"]["payload"]["Nodes"][0]["id"] = "00ff".into();
        let bytes = serde_json::to_vec(&json).unwrap();
        assert!(Message::decode(&bytes).is_err());

        json["Response"]["payload"]["Nodes"][0]
            .as_object_mut()
            .unwrap()
            .remove("id");
        let bytes = serde_json::to_vec(&json).unwrap();
        assert!(Message::decode(&bytes).is_err());
    }

    #[test]
    fn test_full_nodes_response_fits_in_datagram() {
        let message = Message::Response(Response {
            token: u64::MAX,
            receiver: contact(),
            payload: ResponsePayload::Nodes((0..REPLICATION_PARAM).map(|_| contact()).collect()),
        });
        assert!(message.encode().unwrap().len() < MESSAGE_LENGTH);
    }

    fn services_response(count: usize) -> Response {
        let services = (0..count)
            .map(|i| {
                let mut info =
                    ServiceInfo::new(NodeId::random(), NodeRole::Locker, "10.0.0.1:8080");
                info.properties.insert("shard".to_string(), format!("{:0>120}", i));
                info
            })
            .collect();
        Response {
            token: u64::MAX,
            receiver: contact(),
            payload: ResponsePayload::Services(services),
        }
    }

    #[test]
    fn test_oversized_services_response_is_truncated() {
        let mut response = services_response(400);
        let dropped = response.truncate_to_datagram().unwrap();
        assert!(dropped > 0);

        let kept = match response.payload {
            ResponsePayload::Services(ref services) => services.len(),
            _ => panic!("expected services"),
        };
        assert_eq!(kept + dropped, 400);
        assert!(kept > 0);

        let encoded = Message::Response(response).encode().unwrap();
        assert!(encoded.len() <= MESSAGE_LENGTH);
        // one more service would not have fit
        assert!(encoded.len() + 1000 > MESSAGE_LENGTH);
    }

    #[test]
    fn test_small_responses_are_not_truncated() {
        let mut response = services_response(3);
        assert_eq!(response.truncate_to_datagram().unwrap(), 0);
        match response.payload {
            ResponsePayload::Services(services) => assert_eq!(services.len(), 3),
            _ => panic!("expected services"),
        }

        let mut response = Response {
            token: 1,
            receiver: contact(),
            payload: ResponsePayload::Nodes(vec![contact()]),
        };
        assert_eq!(response.truncate_to_datagram().unwrap(), 0);
    }

    #[test]
    fn test_send_and_receive() {
        let a = Protocol::new(UdpSocket::bind("127.0.0.1:0").unwrap());
        let b = Protocol::new(UdpSocket::bind("127.0.0.1:0").unwrap());
        let is_active = Arc::new(AtomicBool::new(true));
        let (tx, rx) = channel();
        let handle = b.start(tx, Arc::clone(&is_active)).unwrap();

        let message = Message::Request(Request {
            token: 42,
            sender: contact(),
            payload: RequestPayload::Ping,
        });
        a.send_message(&message, b.local_addr().unwrap()).unwrap();

        let (received, src_addr) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(src_addr, a.local_addr().unwrap());
        match received {
            Message::Request(request) => {
                assert_eq!(request.token, 42);
                assert_eq!(request.payload, RequestPayload::Ping);
            },
            _ => panic!("expected request"),
        }

        is_active.store(false, Ordering::Release);
        handle.join().unwrap();
    }
}
