//! TCP link adapter
//!
//! OpenVPN over TCP frames every packet with a 2-byte big-endian length
//! prefix. The transport is reliable, so the session disables its
//! control-channel retransmission timers.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::io::LinkInterface;

/// Stream link to an OpenVPN server with OpenVPN's TCP packet framing.
pub struct TcpLink {
    stream: TcpStream,
    remote: SocketAddr,
    mtu: usize,
    read_buf: BytesMut,
}

impl TcpLink {
    /// Connect to `remote`.
    pub async fn connect(remote: SocketAddr, mtu: usize) -> io::Result<Self> {
        let stream = TcpStream::connect(remote).await?;
        stream.set_nodelay(true)?;
        debug!(%remote, mtu, "TCP link connected");
        Ok(Self {
            stream,
            remote,
            mtu,
            read_buf: BytesMut::with_capacity(64 * 1024),
        })
    }

    /// Pop every complete length-prefixed frame out of the read buffer.
    fn drain_frames(&mut self) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        loop {
            if self.read_buf.len() < 2 {
                break;
            }
            let len = u16::from_be_bytes([self.read_buf[0], self.read_buf[1]]) as usize;
            if self.read_buf.len() < 2 + len {
                break;
            }
            self.read_buf.advance(2);
            frames.push(self.read_buf.split_to(len).to_vec());
        }
        frames
    }
}

#[async_trait]
impl LinkInterface for TcpLink {
    fn remote_address(&self) -> String {
        self.remote.ip().to_string()
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn is_reliable(&self) -> bool {
        true
    }

    async fn read_packets(&mut self) -> io::Result<Vec<Vec<u8>>> {
        loop {
            let frames = self.drain_frames();
            if !frames.is_empty() {
                return Ok(frames);
            }
            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "link closed by peer",
                ));
            }
        }
    }

    async fn write_packets(&mut self, packets: Vec<Vec<u8>>) -> io::Result<()> {
        let mut out = BytesMut::new();
        for packet in packets {
            debug_assert!(packet.len() <= u16::MAX as usize);
            out.extend_from_slice(&(packet.len() as u16).to_be_bytes());
            out.extend_from_slice(&packet);
        }
        self.stream.write_all(&out).await?;
        self.stream.flush().await
    }
}
