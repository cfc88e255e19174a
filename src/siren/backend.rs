//! Connection to the synthesis backend over UDP.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use tokio::net::UdpSocket;

use super::osc::{encode_message, OscArg};

/// An open, connected UDP socket to the backend. Owned by the session.
#[derive(Debug)]
pub struct BackendConnection {
    socket: UdpSocket,
    addr: SocketAddr,
}

impl BackendConnection {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let local: SocketAddr = if addr.is_ipv4() {
            ([127, 0, 0, 1], 0).into()
        } else {
            (std::net::Ipv6Addr::LOCALHOST, 0).into()
        };
        let socket = UdpSocket::bind(local)
            .await
            .with_context(|| format!("binding local UDP socket for backend {addr}"))?;
        socket
            .connect(addr)
            .await
            .with_context(|| format!("connecting to backend {addr}"))?;
        Ok(Self { socket, addr })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Encode and send one OSC message. Returns the datagram size.
    pub async fn send(&self, address: &str, args: &[OscArg]) -> Result<usize> {
        let packet = encode_message(address, args)?;
        let sent = self
            .socket
            .send(&packet)
            .await
            .with_context(|| format!("sending {address} to backend {}", self.addr))?;
        tracing::debug!(address, bytes = sent, "sent OSC message");
        Ok(sent)
    }
}
