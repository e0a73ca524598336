//! Socket layer managing transaction ids and correlating responses
//! with inflight requests over a [Wire].

use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::common::messages::{DecodeError, Message, MessageType, RequestSpecific, ResponseSpecific};
use crate::common::Id;

use super::server::Counters;
use super::wire::Wire;

/// Default duration before an inflight request to a non-responding node
/// is abandoned.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(2000);

#[derive(Debug)]
pub(crate) struct RpcSocket {
    next_tid: u16,
    id: Id,
    wire: Box<dyn Wire>,
    request_timeout: Duration,
    inflight_requests: InflightRequests,
}

/// An inflight request that ran out of time without a response.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ExpiredRequest {
    pub tid: u16,
    pub to: SocketAddrV4,
}

impl RpcSocket {
    pub fn new(wire: Box<dyn Wire>, id: Id, request_timeout: Duration) -> RpcSocket {
        RpcSocket {
            next_tid: 0,
            id,
            wire,
            request_timeout,
            inflight_requests: InflightRequests::new(),
        }
    }

    // === Getters ===

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.wire.local_addr()
    }

    pub fn inflight(&self, tid: u16) -> bool {
        self.inflight_requests.contains(tid)
    }

    // === Public Methods ===

    /// Send a request to the given address, tracking it as inflight until
    /// a response arrives or `timeout` (default request timeout) elapses.
    /// Returns the request's transaction id.
    pub fn request(
        &mut self,
        address: SocketAddrV4,
        request: RequestSpecific,
        timeout: Option<Duration>,
    ) -> u16 {
        let transaction_id = self.tid();

        self.inflight_requests.add(
            transaction_id,
            InflightRequest {
                to: address,
                sent_at: Instant::now(),
                timeout: timeout.unwrap_or(self.request_timeout),
            },
        );

        trace!(?transaction_id, ?address, ?request, "Sending a request");

        self.send(
            address,
            Message {
                transaction_id,
                sender: self.id,
                message_type: MessageType::Request(request),
            },
        );

        transaction_id
    }

    /// Send a response to a request previously received from this address.
    pub fn response(
        &mut self,
        address: SocketAddrV4,
        transaction_id: u16,
        response: ResponseSpecific,
    ) {
        trace!(?transaction_id, ?address, ?response, "Sending a response");

        self.send(
            address,
            Message {
                transaction_id,
                sender: self.id,
                message_type: MessageType::Response(response),
            },
        );
    }

    /// Remove and return every inflight request whose timeout elapsed.
    pub fn expire(&mut self) -> Vec<ExpiredRequest> {
        self.inflight_requests.expire()
    }

    /// The next valid inbound message, if any.
    ///
    /// Requests pass through; responses are only returned when they match
    /// an inflight request's transaction id and address. Undecodable and
    /// unknown-type frames are counted and dropped.
    pub fn recv_from(&mut self, counters: &mut Counters) -> Option<(Message, SocketAddrV4)> {
        let (frame, from) = self.wire.poll_frame()?;

        if from.port() == 0 {
            trace!(?from, "Dropping frame from port 0");
            return None;
        }

        match Message::from_bytes(&frame) {
            Ok(message) => match &message.message_type {
                MessageType::Request(_) => {
                    trace!(context = "socket_message_receiving", ?message, ?from);
                    Some((message, from))
                }
                MessageType::Response(_) => {
                    if self.is_expected_response(&message, from) {
                        Some((message, from))
                    } else {
                        None
                    }
                }
            },
            Err(DecodeError::UnknownMessageType(message_type)) => {
                counters.unknown_messages += 1;
                debug!(?from, ?message_type, "Received a message of unknown type");
                None
            }
            Err(error) => {
                counters.malformed_messages += 1;
                trace!(?from, ?error, "Received a message that failed to decode");
                None
            }
        }
    }

    // === Private Methods ===

    /// Responses are accepted exactly once, and only from the address
    /// the request was sent to.
    fn is_expected_response(&mut self, message: &Message, from: SocketAddrV4) -> bool {
        match self.inflight_requests.get(message.transaction_id) {
            Some(request) => {
                if request.to == from {
                    self.inflight_requests.remove(message.transaction_id);
                    true
                } else {
                    debug!(
                        ?from,
                        expected = ?request.to,
                        "Response from the wrong address, dropped"
                    );
                    false
                }
            }
            None => {
                trace!(
                    transaction_id = ?message.transaction_id,
                    ?from,
                    "Response to no inflight request, dropped"
                );
                false
            }
        }
    }

    /// Increments self.next_tid and returns the previous value.
    fn tid(&mut self) -> u16 {
        let tid = self.next_tid;
        self.next_tid = self.next_tid.wrapping_add(1);
        tid
    }

    fn send(&mut self, address: SocketAddrV4, message: Message) {
        if let Err(error) = self.wire.send_frame(address, &message.to_bytes()) {
            debug!(?error, ?address, "RpcSocket failed to send a message");
        }
    }
}

/// Inflight requests sorted by their transaction id.
#[derive(Debug)]
struct InflightRequests {
    requests: Vec<(u16, InflightRequest)>,
}

#[derive(Debug, Clone)]
struct InflightRequest {
    to: SocketAddrV4,
    sent_at: Instant,
    timeout: Duration,
}

impl InflightRequests {
    fn new() -> Self {
        InflightRequests {
            requests: Vec::new(),
        }
    }

    fn contains(&self, tid: u16) -> bool {
        self.requests
            .binary_search_by(|(probe, _)| probe.cmp(&tid))
            .is_ok()
    }

    fn add(&mut self, tid: u16, request: InflightRequest) {
        match self.requests.binary_search_by(|(probe, _)| probe.cmp(&tid)) {
            // Transaction ids wrapped around with a request still pending;
            // the old request is abandoned.
            Ok(index) => self.requests[index] = (tid, request),
            Err(index) => self.requests.insert(index, (tid, request)),
        }
    }

    fn get(&self, tid: u16) -> Option<&InflightRequest> {
        self.requests
            .binary_search_by(|(probe, _)| probe.cmp(&tid))
            .ok()
            .map(|index| &self.requests[index].1)
    }

    fn remove(&mut self, tid: u16) -> Option<InflightRequest> {
        self.requests
            .binary_search_by(|(probe, _)| probe.cmp(&tid))
            .ok()
            .map(|index| self.requests.remove(index).1)
    }

    fn expire(&mut self) -> Vec<ExpiredRequest> {
        let mut expired = Vec::new();

        self.requests.retain(|(tid, request)| {
            if request.sent_at.elapsed() >= request.timeout {
                expired.push(ExpiredRequest {
                    tid: *tid,
                    to: request.to,
                });
                false
            } else {
                true
            }
        });

        expired
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::common::messages::RequestSpecific;
    use crate::rpc::wire::MemoryHub;

    fn socket(hub: &MemoryHub) -> RpcSocket {
        RpcSocket::new(Box::new(hub.bind()), Id::random(), DEFAULT_REQUEST_TIMEOUT)
    }

    #[test]
    fn tid_wraps_around() {
        let hub = MemoryHub::new();
        let mut socket = socket(&hub);
        socket.next_tid = u16::MAX;

        assert_eq!(socket.tid(), 65535);
        assert_eq!(socket.tid(), 0);
    }

    #[test]
    fn request_response_roundtrip() {
        let hub = MemoryHub::new();

        let mut client = socket(&hub);
        let mut server = socket(&hub);

        let mut counters = Counters::default();

        let tid = client.request(server.local_addr(), RequestSpecific::Ping, None);
        assert!(client.inflight(tid));

        let (request, from) = server.recv_from(&mut counters).expect("request arrives");
        assert_eq!(from, client.local_addr());

        server.response(from, request.transaction_id, ResponseSpecific::Pong);

        let (response, _) = client.recv_from(&mut counters).expect("response arrives");
        assert_eq!(response.transaction_id, tid);
        assert!(!client.inflight(tid));
    }

    #[test]
    fn response_from_wrong_address_is_dropped() {
        let hub = MemoryHub::new();

        let mut client = socket(&hub);
        let mut server = socket(&hub);
        let mut imposter = socket(&hub);

        let mut counters = Counters::default();

        let tid = client.request(server.local_addr(), RequestSpecific::Ping, None);
        imposter.response(client.local_addr(), tid, ResponseSpecific::Pong);

        assert!(client.recv_from(&mut counters).is_none());
        // The request is still awaiting a response from the right address.
        assert!(client.inflight(tid));
    }

    #[test]
    fn requests_expire() {
        let hub = MemoryHub::new();
        let mut client = socket(&hub);

        let nowhere = SocketAddrV4::new(std::net::Ipv4Addr::LOCALHOST, 9);
        let tid = client.request(nowhere, RequestSpecific::Ping, Some(Duration::from_millis(10)));

        assert!(client.expire().is_empty());

        thread::sleep(Duration::from_millis(20));

        let expired = client.expire();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].tid, tid);
        assert!(!client.inflight(tid));
    }

    #[test]
    fn unknown_message_types_are_counted() {
        use crate::common::messages::wire;
        use prost::Message as _;

        let hub = MemoryHub::new();

        let mut receiver = socket(&hub);
        let mut sender = hub.bind();

        let frame = wire::Message {
            r#type: 42,
            sender: Id::random().to_vec(),
            ..Default::default()
        }
        .encode_to_vec();

        sender
            .send_frame(receiver.local_addr(), &frame)
            .expect("send works");

        let mut counters = Counters::default();
        assert!(receiver.recv_from(&mut counters).is_none());
        assert_eq!(counters.unknown_messages, 1);
    }
}
