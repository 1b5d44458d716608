//! Link and tunnel capability traits
//!
//! The session consumes two narrow interfaces: a link that moves OpenVPN
//! frames to the server, and a tunnel that moves bare IP packets to the
//! local interface. Implemented once per real transport (UDP, TCP) and once
//! as an in-memory loop for tests.

use std::io;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Static properties of a link, sampled by the session at start and rebind.
#[derive(Debug, Clone)]
pub struct LinkProperties {
    /// Remote address the link is bound to (host or IP, no port)
    pub remote_address: String,
    /// Link MTU
    pub mtu: usize,
    /// Whether the transport is already reliable (TCP-like)
    pub is_reliable: bool,
}

/// A datagram-shaped path to the OpenVPN server.
#[async_trait]
pub trait LinkInterface: Send {
    /// Remote address the link is bound to.
    fn remote_address(&self) -> String;

    /// Link MTU.
    fn mtu(&self) -> usize;

    /// Whether the transport guarantees delivery and ordering; disables
    /// control-channel retransmission timers.
    fn is_reliable(&self) -> bool;

    /// Preferred receive buffer size.
    fn packet_buffer_size(&self) -> usize {
        128 * 1024
    }

    /// Await the next batch of inbound frames.
    async fn read_packets(&mut self) -> io::Result<Vec<Vec<u8>>>;

    /// Write a batch of frames.
    async fn write_packets(&mut self, packets: Vec<Vec<u8>>) -> io::Result<()>;

    /// Properties snapshot handed to the session.
    fn properties(&self) -> LinkProperties {
        LinkProperties {
            remote_address: self.remote_address(),
            mtu: self.mtu(),
            is_reliable: self.is_reliable(),
        }
    }
}

/// The local tunnel interface carrying bare IP packets.
#[async_trait]
pub trait TunnelInterface: Send {
    /// Whether the tunnel device survives session restarts.
    fn is_persistent(&self) -> bool;

    /// Await the next batch of outbound IP packets.
    async fn read_packets(&mut self) -> io::Result<Vec<Vec<u8>>>;

    /// Deliver a batch of decrypted IP packets.
    async fn write_packets(&mut self, packets: Vec<Vec<u8>>) -> io::Result<()>;
}

/// In-memory link endpoint for tests; frames written on one side arrive on
/// the other.
pub struct MemoryLink {
    remote_address: String,
    mtu: usize,
    is_reliable: bool,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl MemoryLink {
    /// Build a connected pair of endpoints.
    pub fn pair(remote_address: &str, mtu: usize, is_reliable: bool) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Self {
                remote_address: remote_address.to_string(),
                mtu,
                is_reliable,
                tx: a_tx,
                rx: b_rx,
            },
            Self {
                remote_address: remote_address.to_string(),
                mtu,
                is_reliable,
                tx: b_tx,
                rx: a_rx,
            },
        )
    }
}

#[async_trait]
impl LinkInterface for MemoryLink {
    fn remote_address(&self) -> String {
        self.remote_address.clone()
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn is_reliable(&self) -> bool {
        self.is_reliable
    }

    async fn read_packets(&mut self) -> io::Result<Vec<Vec<u8>>> {
        match self.rx.recv().await {
            Some(packet) => Ok(vec![packet]),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "link closed")),
        }
    }

    async fn write_packets(&mut self, packets: Vec<Vec<u8>>) -> io::Result<()> {
        for packet in packets {
            self.tx
                .send(packet)
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "link closed"))?;
        }
        Ok(())
    }
}

/// In-memory tunnel endpoint for tests.
pub struct MemoryTunnel {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl MemoryTunnel {
    /// Build the device side and the test side of a tunnel.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Self { tx: a_tx, rx: b_rx },
            Self { tx: b_tx, rx: a_rx },
        )
    }
}

#[async_trait]
impl TunnelInterface for MemoryTunnel {
    fn is_persistent(&self) -> bool {
        false
    }

    async fn read_packets(&mut self) -> io::Result<Vec<Vec<u8>>> {
        match self.rx.recv().await {
            Some(packet) => Ok(vec![packet]),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "tunnel closed")),
        }
    }

    async fn write_packets(&mut self, packets: Vec<Vec<u8>>) -> io::Result<()> {
        for packet in packets {
            self.tx
                .send(packet)
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "tunnel closed"))?;
        }
        Ok(())
    }
}
