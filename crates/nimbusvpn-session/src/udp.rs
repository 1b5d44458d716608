//! UDP link adapter

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::debug;

use crate::io::LinkInterface;

/// Datagram link to an OpenVPN server.
pub struct UdpLink {
    socket: UdpSocket,
    remote: SocketAddr,
    mtu: usize,
    buffer_size: usize,
}

impl UdpLink {
    /// Connect a UDP socket to `remote` with sized kernel buffers.
    pub async fn connect(remote: SocketAddr, mtu: usize, buffer_size: usize) -> io::Result<Self> {
        let domain = if remote.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_recv_buffer_size(buffer_size)?;
        socket.set_send_buffer_size(buffer_size)?;
        socket.set_nonblocking(true)?;
        socket.connect(&remote.into())?;

        let socket = UdpSocket::from_std(socket.into())?;
        debug!(%remote, mtu, "UDP link connected");
        Ok(Self {
            socket,
            remote,
            mtu,
            buffer_size,
        })
    }
}

#[async_trait]
impl LinkInterface for UdpLink {
    fn remote_address(&self) -> String {
        self.remote.ip().to_string()
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn is_reliable(&self) -> bool {
        false
    }

    fn packet_buffer_size(&self) -> usize {
        self.buffer_size
    }

    async fn read_packets(&mut self) -> io::Result<Vec<Vec<u8>>> {
        let mut buf = vec![0u8; self.mtu.max(2048)];
        let n = self.socket.recv(&mut buf).await?;
        buf.truncate(n);
        Ok(vec![buf])
    }

    async fn write_packets(&mut self, packets: Vec<Vec<u8>>) -> io::Result<()> {
        for packet in packets {
            self.socket.send(&packet).await?;
        }
        Ok(())
    }
}
