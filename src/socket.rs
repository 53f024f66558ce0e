//! Owning non-blocking socket
//!
//! Every socket created here is non-blocking and close-on-exec from the first
//! instant. The descriptor is owned: it is closed exactly once, on drop, and
//! the type has no `Clone`. Use [`Socket::try_clone`] for an explicit
//! OS-level duplication.

use crate::addr::{Domain, Endpoint};
use std::io;
use std::net::Shutdown;
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::io::{AsRawFd, RawFd};

/// Transport type for socket creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    /// Stream (TCP)
    Stream,
    /// Datagram (UDP)
    Datagram,
    /// Raw
    Raw,
}

impl SocketKind {
    fn raw(self) -> libc::c_int {
        match self {
            SocketKind::Stream => libc::SOCK_STREAM,
            SocketKind::Datagram => libc::SOCK_DGRAM,
            SocketKind::Raw => libc::SOCK_RAW,
        }
    }
}

/// Owning wrapper around one OS socket descriptor
pub struct Socket {
    fd: RawFd,
}

impl Socket {
    /// Create a new non-blocking, close-on-exec socket
    pub fn open(domain: Domain, kind: SocketKind) -> io::Result<Self> {
        let fd = unsafe {
            libc::socket(
                domain.raw(),
                kind.raw() | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd })
    }

    /// Take ownership of an existing descriptor without altering its flags
    ///
    /// The descriptor is closed when the returned socket is dropped.
    pub fn from_fd(fd: RawFd) -> Self {
        Self { fd }
    }

    /// Get the file descriptor
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Bind to an endpoint
    pub fn bind(&self, endpoint: &Endpoint) -> io::Result<()> {
        let (sockaddr, len) = endpoint.as_sockaddr();
        let result = unsafe { libc::bind(self.fd, sockaddr, len) };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Mark the socket passive with the OS-maximum backlog
    pub fn listen(&self) -> io::Result<()> {
        let result = unsafe { libc::listen(self.fd, libc::SOMAXCONN) };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Accept one pending connection
    ///
    /// Returns `Ok(None)` when no connection is pending, the expected
    /// condition on a non-blocking listener. The accepted socket is created
    /// non-blocking and close-on-exec.
    pub fn accept(&self) -> io::Result<Option<(Socket, Endpoint)>> {
        let mut storage: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;

        let fd = unsafe {
            libc::accept4(
                self.fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };

        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err);
        }

        Ok(Some((Socket::from_fd(fd), Endpoint::from_raw(storage))))
    }

    /// Start a non-blocking connect
    ///
    /// An in-progress connection surfaces as `WouldBlock`; call
    /// [`Socket::check_connect`] once the descriptor reports writable.
    pub fn connect(&self, endpoint: &Endpoint) -> io::Result<()> {
        let (sockaddr, len) = endpoint.as_sockaddr();
        let result = unsafe { libc::connect(self.fd, sockaddr, len) };

        if result < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock
                || err.raw_os_error() == Some(libc::EINPROGRESS)
            {
                return Err(io::Error::new(
                    io::ErrorKind::WouldBlock,
                    "connection in progress",
                ));
            }
            return Err(err);
        }

        Ok(())
    }

    /// Check whether an in-progress connect completed
    pub fn check_connect(&self) -> io::Result<()> {
        let mut error: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;

        let result = unsafe {
            libc::getsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut error as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };

        if result < 0 {
            return Err(io::Error::last_os_error());
        }
        if error != 0 {
            return Err(io::Error::from_raw_os_error(error));
        }
        Ok(())
    }

    /// Single non-blocking read of up to `buf.len()` bytes
    ///
    /// "No data yet" is reported as `WouldBlock`, distinct from a hard read
    /// failure. A return of `Ok(0)` means the peer closed its end.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let result =
            unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(result as usize)
    }

    /// Single non-blocking write, returning the partial count the OS took
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let result =
            unsafe { libc::write(self.fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(result as usize)
    }

    /// Write until the whole buffer is taken or the descriptor stops
    /// accepting bytes
    ///
    /// Returns the number of bytes actually written; a result smaller than
    /// `buf.len()` means the descriptor would block and the remainder is the
    /// caller's to retry once writable again.
    pub fn write_all(&self, buf: &[u8]) -> io::Result<usize> {
        let mut written = 0;
        while written < buf.len() {
            match self.write(&buf[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(written)
    }

    /// Shut down one or both directions
    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        let how = match how {
            Shutdown::Read => libc::SHUT_RD,
            Shutdown::Write => libc::SHUT_WR,
            Shutdown::Both => libc::SHUT_RDWR,
        };
        let result = unsafe { libc::shutdown(self.fd, how) };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// The connected peer's endpoint
    pub fn peer_addr(&self) -> io::Result<Endpoint> {
        let mut storage: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
        let result = unsafe {
            libc::getpeername(self.fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
        };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Endpoint::from_raw(storage))
    }

    /// The socket's own bound endpoint
    pub fn local_addr(&self) -> io::Result<Endpoint> {
        let mut storage: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
        let result = unsafe {
            libc::getsockname(self.fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
        };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Endpoint::from_raw(storage))
    }

    /// Enable or disable SO_REUSEADDR
    pub fn set_reuse_addr(&self, on: bool) -> io::Result<()> {
        socket2::SockRef::from(self).set_reuse_address(on)
    }

    /// Enable or disable SO_REUSEPORT
    pub fn set_reuse_port(&self, on: bool) -> io::Result<()> {
        socket2::SockRef::from(self).set_reuse_port(on)
    }

    /// Enable or disable SO_KEEPALIVE
    pub fn set_keep_alive(&self, on: bool) -> io::Result<()> {
        socket2::SockRef::from(self).set_keepalive(on)
    }

    /// Enable or disable TCP_NODELAY
    pub fn set_nodelay(&self, on: bool) -> io::Result<()> {
        socket2::SockRef::from(self).set_nodelay(on)
    }

    /// Duplicate the descriptor at the OS level
    ///
    /// The clone owns a distinct descriptor value; both close independently.
    pub fn try_clone(&self) -> io::Result<Socket> {
        let fd = unsafe { libc::fcntl(self.fd, libc::F_DUPFD_CLOEXEC, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Socket::from_fd(fd))
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl AsFd for Socket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        unsafe { BorrowedFd::borrow_raw(self.fd) }
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket").field("fd", &self.fd).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read as _, Write as _};
    use std::net::TcpStream;
    use std::time::Duration;

    fn loopback_listener() -> Socket {
        let listener = Socket::open(Domain::Ipv4, SocketKind::Stream).unwrap();
        listener.set_reuse_addr(true).unwrap();
        listener.bind(&Endpoint::loopback(0, Domain::Ipv4)).unwrap();
        listener.listen().unwrap();
        listener
    }

    fn connected_pair() -> (Socket, TcpStream) {
        let listener = loopback_listener();
        let port = listener.local_addr().unwrap().port();
        let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let accepted = loop {
            if let Some((socket, _)) = listener.accept().unwrap() {
                break socket;
            }
            std::thread::sleep(Duration::from_millis(1));
        };
        (accepted, stream)
    }

    #[test]
    fn test_socket_is_nonblocking_and_cloexec() {
        let socket = Socket::open(Domain::Ipv4, SocketKind::Stream).unwrap();
        let status = unsafe { libc::fcntl(socket.fd(), libc::F_GETFL) };
        assert_ne!(status & libc::O_NONBLOCK, 0);
        let flags = unsafe { libc::fcntl(socket.fd(), libc::F_GETFD) };
        assert_ne!(flags & libc::FD_CLOEXEC, 0);
    }

    #[test]
    fn test_datagram_socket_creation() {
        let socket = Socket::open(Domain::Ipv4, SocketKind::Datagram).unwrap();
        assert!(socket.fd() >= 0);
    }

    #[test]
    fn test_unspec_domain_is_rejected() {
        assert!(Socket::open(Domain::Unspec, SocketKind::Stream).is_err());
    }

    #[test]
    fn test_local_addr_reports_bound_port() {
        let listener = loopback_listener();
        let local = listener.local_addr().unwrap();
        assert_eq!(local.family(), Domain::Ipv4);
        assert_ne!(local.port(), 0);
    }

    #[test]
    fn test_accept_without_pending_returns_none() {
        let listener = loopback_listener();
        assert!(listener.accept().unwrap().is_none());
    }

    #[test]
    fn test_accept_returns_peer_endpoint() {
        let listener = Socket::open(Domain::Ipv4, SocketKind::Stream).unwrap();
        listener.set_reuse_addr(true).unwrap();
        listener.bind(&Endpoint::loopback(9090, Domain::Ipv4)).unwrap();
        listener.listen().unwrap();

        let stream = TcpStream::connect("127.0.0.1:9090").unwrap();
        let (accepted, peer) = loop {
            if let Some(pair) = listener.accept().unwrap() {
                break pair;
            }
            std::thread::sleep(Duration::from_millis(1));
        };

        assert!(accepted.fd() >= 0);
        assert_eq!(peer.ip(), std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST));
        assert_ne!(peer.port(), 0);
        assert_eq!(peer.port(), stream.local_addr().unwrap().port());
    }

    #[test]
    fn test_read_without_data_would_block() {
        let (accepted, _stream) = connected_pair();
        let mut buf = [0u8; 64];
        let err = accepted.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_read_returns_peer_bytes() {
        let (accepted, mut stream) = connected_pair();
        stream.write_all(b"ping").unwrap();

        let mut buf = [0u8; 64];
        let n = loop {
            match accepted.read(&mut buf) {
                Ok(n) => break n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(err) => panic!("read failed: {err}"),
            }
        };
        assert_eq!(&buf[..n], b"ping");
    }

    #[test]
    fn test_write_all_surfaces_partial_write() {
        let (accepted, stream) = connected_pair();
        socket2::SockRef::from(&accepted)
            .set_send_buffer_size(4096)
            .unwrap();
        socket2::SockRef::from(&stream)
            .set_recv_buffer_size(4096)
            .unwrap();

        // Nobody reads on the peer side, so the kernel buffers fill up and
        // the loop must stop at WouldBlock with an honest partial count.
        let payload = vec![0x5au8; 32 * 1024 * 1024];
        let written = accepted.write_all(&payload).unwrap();
        assert!(written > 0);
        assert!(written < payload.len());
    }

    #[test]
    fn test_connect_then_check() {
        let listener = loopback_listener();
        let target = listener.local_addr().unwrap();

        let client = Socket::open(Domain::Ipv4, SocketKind::Stream).unwrap();
        match client.connect(&Endpoint::loopback(target.port(), Domain::Ipv4)) {
            Ok(()) => {}
            Err(err) => assert_eq!(err.kind(), io::ErrorKind::WouldBlock),
        }

        std::thread::sleep(Duration::from_millis(50));
        client.check_connect().unwrap();
        assert_eq!(client.peer_addr().unwrap().port(), target.port());
    }

    #[test]
    fn test_shutdown_write_signals_eof() {
        let (accepted, mut stream) = connected_pair();
        accepted.shutdown(Shutdown::Write).unwrap();

        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_try_clone_duplicates_descriptor() {
        let socket = Socket::open(Domain::Ipv4, SocketKind::Stream).unwrap();
        let clone = socket.try_clone().unwrap();
        assert_ne!(socket.fd(), clone.fd());
    }
}
