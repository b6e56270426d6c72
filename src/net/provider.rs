//! Socket acquisition.
//!
//! The binder never calls `bind()` itself: it asks a [`SocketProvider`],
//! so a hot-handoff provider can return sockets inherited from a previous
//! process generation instead of fresh ones.

use std::io;
use std::net::{SocketAddr, TcpListener, UdpSocket};

use socket2::{Domain, Protocol, Socket, Type};

/// Listen backlog for TCP sockets.
const LISTEN_BACKLOG: i32 = 1024;

/// Acquires listening sockets for an address.
///
/// Returned sockets are non-blocking and ready to be handed to Tokio.
pub trait SocketProvider: Send + Sync {
    /// A listening TCP socket on `addr`.
    fn listen_tcp(&self, addr: SocketAddr) -> io::Result<TcpListener>;

    /// A bound UDP socket on `addr`.
    fn listen_udp(&self, addr: SocketAddr) -> io::Result<UdpSocket>;
}

/// Binds fresh sockets.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainSockets;

impl PlainSockets {
    fn socket(addr: SocketAddr, ty: Type, proto: Protocol) -> io::Result<Socket> {
        let socket = Socket::new(Domain::for_address(addr), ty, Some(proto))?;
        if addr.is_ipv6() {
            // 0.0.0.0 and :: may be bound side by side
            socket.set_only_v6(true)?;
        }
        #[cfg(not(windows))]
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        Ok(socket)
    }
}

impl SocketProvider for PlainSockets {
    fn listen_tcp(&self, addr: SocketAddr) -> io::Result<TcpListener> {
        let socket = Self::socket(addr, Type::STREAM, Protocol::TCP)?;
        socket.bind(&addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;
        Ok(socket.into())
    }

    fn listen_udp(&self, addr: SocketAddr) -> io::Result<UdpSocket> {
        let socket = Self::socket(addr, Type::DGRAM, Protocol::UDP)?;
        socket.bind(&addr.into())?;
        Ok(socket.into())
    }
}
