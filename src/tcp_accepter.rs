use crate::logmsg;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};

pub const LISTEN_BACKLOG: i32 = 1000;

/// Non-blocking listening socket with `SO_REUSEADDR`.
pub struct TcpAccepter {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TcpAccepter {
    /// Bind and listen. Port 0 picks a free port, see `local_addr`.
    pub fn new(addr: SocketAddr) -> crate::Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&SockAddr::from(addr))?;
        socket.listen(LISTEN_BACKLOG)?;
        socket.set_nonblocking(true)?;
        let listener: TcpListener = socket.into();
        let local_addr = listener.local_addr()?;
        logmsg!("listening on {}, fd {}", local_addr, listener.as_raw_fd());
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Accept one pending connection. `WouldBlock` when none is pending.
    pub fn accept(&self) -> std::io::Result<(TcpStream, SocketAddr)> {
        let (sock, peer) = self.listener.accept()?;
        sock.set_nonblocking(true)?;
        Ok((sock, peer))
    }

    pub fn fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}
