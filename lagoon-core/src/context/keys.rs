use std::net::SocketAddr;

/// Address of the downstream peer, stamped by the accept path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddr(pub SocketAddr);

impl From<SocketAddr> for PeerAddr {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

/// Server name taken from TLS SNI, when the listener terminates TLS.
/// Virtual-host selection prefers this over the `Host` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerName(pub String);
