//! Transport seam between the DHT and the byte-level network.

use std::collections::HashMap;
use std::fmt::Debug;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::trace;

/// Largest frame we are willing to read.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// The maximum duration to park the actor thread waiting for inbound frames,
/// to avoid spinning when the network is quiet.
const MAX_THREAD_BLOCK_DURATION: Duration = Duration::from_millis(10);
const MEMORY_POLL_TIMEOUT: Duration = Duration::from_millis(1);

/// A framed, connectionless view of the underlying transport.
///
/// Implementations own framing, stream management and read timeouts:
/// a peer whose stream stalls past its per-frame read timeout (the timeout
/// resets after every frame delivered here) must be torn down by the
/// transport instead of stalling this interface. [poll_frame](Wire::poll_frame)
/// never blocks longer than a short backoff.
pub trait Wire: Debug + Send {
    fn local_addr(&self) -> SocketAddrV4;

    /// The next inbound frame, if any arrived.
    fn poll_frame(&mut self) -> Option<(Vec<u8>, SocketAddrV4)>;

    fn send_frame(&mut self, to: SocketAddrV4, frame: &[u8]) -> io::Result<()>;
}

/// The default [Wire]: one UDP datagram per frame.
#[derive(Debug)]
pub struct UdpWire {
    socket: UdpSocket,
    local_addr: SocketAddrV4,
}

impl UdpWire {
    /// Bind to `0.0.0.0:{port}`, or an OS assigned port if `None`.
    pub fn bind(port: Option<u16>) -> io::Result<UdpWire> {
        let socket = UdpSocket::bind(SocketAddrV4::new(
            Ipv4Addr::UNSPECIFIED,
            port.unwrap_or(0),
        ))?;
        socket.set_nonblocking(true)?;

        let local_addr = match socket.local_addr()? {
            SocketAddr::V4(address) => address,
            SocketAddr::V6(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    "IPv6 sockets are not supported",
                ))
            }
        };

        Ok(UdpWire { socket, local_addr })
    }
}

impl Wire for UdpWire {
    fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    fn poll_frame(&mut self) -> Option<(Vec<u8>, SocketAddrV4)> {
        let mut buffer = [0_u8; READ_BUFFER_SIZE];

        match self.socket.recv_from(&mut buffer) {
            Ok((amount, SocketAddr::V4(from))) => Some((buffer[..amount].to_vec(), from)),
            Ok((_, SocketAddr::V6(from))) => {
                trace!(?from, "Dropping frame from IPv6 address");
                None
            }
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(MAX_THREAD_BLOCK_DURATION);
                None
            }
            Err(error) => {
                trace!(?error, "Error reading from UDP socket");
                None
            }
        }
    }

    fn send_frame(&mut self, to: SocketAddrV4, frame: &[u8]) -> io::Result<()> {
        self.socket.send_to(frame, to)?;
        Ok(())
    }
}

/// An in-memory network of [MemoryWire]s, useful for tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryHub(Arc<Mutex<HubInner>>);

#[derive(Debug)]
struct HubInner {
    next_port: u16,
    links: HashMap<SocketAddrV4, flume::Sender<(Vec<u8>, SocketAddrV4)>>,
}

impl Default for HubInner {
    fn default() -> Self {
        HubInner {
            next_port: 1024,
            links: HashMap::new(),
        }
    }
}

impl MemoryHub {
    pub fn new() -> MemoryHub {
        MemoryHub::default()
    }

    /// Allocate a new address on this hub and the wire bound to it.
    pub fn bind(&self) -> MemoryWire {
        let mut inner = self.0.lock().expect("memory hub lock poisoned");

        let port = inner.next_port;
        inner.next_port += 1;
        let local_addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, port);

        let (sender, receiver) = flume::unbounded();
        inner.links.insert(local_addr, sender);

        MemoryWire {
            hub: self.clone(),
            local_addr,
            inbox: receiver,
        }
    }
}

/// A [Wire] delivering frames over in-process channels.
///
/// Frames to addresses with no bound wire are silently dropped, so
/// requests to them time out like requests to an unreachable host.
#[derive(Debug)]
pub struct MemoryWire {
    hub: MemoryHub,
    local_addr: SocketAddrV4,
    inbox: flume::Receiver<(Vec<u8>, SocketAddrV4)>,
}

impl Wire for MemoryWire {
    fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    fn poll_frame(&mut self) -> Option<(Vec<u8>, SocketAddrV4)> {
        self.inbox.recv_timeout(MEMORY_POLL_TIMEOUT).ok()
    }

    fn send_frame(&mut self, to: SocketAddrV4, frame: &[u8]) -> io::Result<()> {
        let inner = self.hub.0.lock().expect("memory hub lock poisoned");

        if let Some(link) = inner.links.get(&to) {
            let _ = link.send((frame.to_vec(), self.local_addr));
        }

        Ok(())
    }
}

impl Drop for MemoryWire {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.hub.0.lock() {
            inner.links.remove(&self.local_addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_wires_exchange_frames() {
        let hub = MemoryHub::new();

        let mut a = hub.bind();
        let mut b = hub.bind();

        a.send_frame(b.local_addr(), b"hello").expect("send works");

        let (frame, from) = b.poll_frame().expect("frame was delivered");

        assert_eq!(frame, b"hello");
        assert_eq!(from, a.local_addr());
    }

    #[test]
    fn frames_to_unbound_addresses_are_dropped() {
        let hub = MemoryHub::new();
        let mut a = hub.bind();

        let nowhere = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9);
        assert!(a.send_frame(nowhere, b"hello").is_ok());
        assert!(a.poll_frame().is_none());
    }

    #[test]
    fn distinct_addresses_per_bind() {
        let hub = MemoryHub::new();

        assert_ne!(hub.bind().local_addr(), hub.bind().local_addr());
    }
}
