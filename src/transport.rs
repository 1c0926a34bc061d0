//! The datagram boundary between a `Node` and the network.
//!
//! A transport sends bytes to an address and pushes every datagram it receives into the node's
//! inbound channel. Delivery may be lossy and unordered; the node correlates responses itself.
use std::collections::HashMap;
use std::io;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::MAX_MESSAGE_LENGTH;

/// A datagram received from `src`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Datagram {
    pub src: String,
    pub bytes: Vec<u8>,
}

/// Sends datagrams on behalf of a node.
pub trait Transport: Send + Sync {
    /// Returns the address other nodes reach this transport at.
    fn local_addr(&self) -> String;

    /// Sends `bytes` to `addr` without waiting for delivery.
    fn send(&self, addr: &str, bytes: &[u8]) -> io::Result<()>;

    /// Stops delivering inbound datagrams and releases the underlying endpoint.
    fn close(&self) {}
}

/// How long the UDP receive thread blocks before checking whether the transport was closed.
const RECV_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A transport over a UDP socket.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    addr: String,
    is_open: Arc<AtomicBool>,
}

impl UdpTransport {
    /// Binds a socket to `addr` and starts a thread that forwards every received datagram to
    /// `inbound` until the transport is closed or the receiving side hangs up.
    pub fn bind(addr: &str, inbound: Sender<Datagram>) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr)?);
        socket.set_read_timeout(Some(RECV_POLL_INTERVAL))?;
        let local_addr = socket.local_addr()?.to_string();
        let is_open = Arc::new(AtomicBool::new(true));

        let receiver = Arc::clone(&socket);
        let receiver_open = Arc::clone(&is_open);
        let name = local_addr.clone();
        thread::spawn(move || {
            let mut buffer = vec![0u8; MAX_MESSAGE_LENGTH];
            while receiver_open.load(Ordering::Acquire) {
                let (len, src_addr) = match receiver.recv_from(&mut buffer) {
                    Ok(received) => received,
                    Err(ref err)
                        if err.kind() == io::ErrorKind::WouldBlock
                            || err.kind() == io::ErrorKind::TimedOut =>
                    {
                        continue;
                    },
                    Err(err) => {
                        warn!("{} - Could not receive datagram: {}", name, err);
                        continue;
                    },
                };
                let datagram = Datagram {
                    src: src_addr.to_string(),
                    bytes: buffer[..len].to_vec(),
                };
                if inbound.send(datagram).is_err() {
                    warn!("{} - Inbound channel closed.", name);
                    break;
                }
            }
            debug!("{} - Closed UDP socket", name);
        });
        Ok(UdpTransport {
            socket,
            addr: local_addr,
            is_open,
        })
    }

    /// Returns `true` until the transport is closed.
    pub fn is_open(&self) -> bool {
        self.is_open.load(Ordering::Acquire)
    }
}

impl Transport for UdpTransport {
    fn local_addr(&self) -> String {
        self.addr.clone()
    }

    fn send(&self, addr: &str, bytes: &[u8]) -> io::Result<()> {
        self.socket.send_to(bytes, addr).map(|_| ())
    }

    fn close(&self) {
        self.is_open.store(false, Ordering::Release);
    }
}

/// An in-process network connecting any number of `MemoryTransport`s by address.
///
/// Datagrams to unknown or detached addresses are silently dropped, as a lossy network would.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    endpoints: Arc<Mutex<HashMap<String, Sender<Datagram>>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        MemoryNetwork::default()
    }

    /// Registers `addr` on the network and returns a transport sending from it.
    pub fn attach(&self, addr: &str, inbound: Sender<Datagram>) -> Arc<MemoryTransport> {
        let mut endpoints = match self.endpoints.lock() {
            Ok(endpoints) => endpoints,
            Err(poisoned) => poisoned.into_inner(),
        };
        endpoints.insert(addr.to_string(), inbound);
        Arc::new(MemoryTransport {
            network: self.clone(),
            addr: addr.to_string(),
        })
    }

    /// Removes `addr` from the network; datagrams sent to it are dropped from now on.
    pub fn detach(&self, addr: &str) {
        let mut endpoints = match self.endpoints.lock() {
            Ok(endpoints) => endpoints,
            Err(poisoned) => poisoned.into_inner(),
        };
        endpoints.remove(addr);
    }

    fn deliver(&self, src: &str, dest: &str, bytes: &[u8]) {
        let endpoints = match self.endpoints.lock() {
            Ok(endpoints) => endpoints,
            Err(poisoned) => poisoned.into_inner(),
        };
        let delivered = endpoints.get(dest).map_or(false, |inbound| {
            inbound
                .send(Datagram {
                    src: src.to_string(),
                    bytes: bytes.to_vec(),
                })
                .is_ok()
        });
        if !delivered {
            debug!("{} - Dropped datagram to {}", src, dest);
        }
    }
}

/// One endpoint of a `MemoryNetwork`.
pub struct MemoryTransport {
    network: MemoryNetwork,
    addr: String,
}

impl Transport for MemoryTransport {
    fn local_addr(&self) -> String {
        self.addr.clone()
    }

    fn send(&self, addr: &str, bytes: &[u8]) -> io::Result<()> {
        self.network.deliver(&self.addr, addr, bytes);
        Ok(())
    }

    fn close(&self) {
        self.network.detach(&self.addr);
    }
}
