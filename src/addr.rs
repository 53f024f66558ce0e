//! Socket endpoint values
//!
//! An `Endpoint` stores an IPv4 or IPv6 socket address in a single
//! IPv6-sized raw sockaddr, the same overlapping representation the OS
//! accept/getpeername calls fill in.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Address family for sockets and endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    /// No family requested; the OS rejects socket creation for this value
    Unspec,
    /// IPv4
    Ipv4,
    /// IPv6
    Ipv6,
}

impl Domain {
    pub(crate) fn raw(self) -> libc::c_int {
        match self {
            Domain::Unspec => libc::AF_UNSPEC,
            Domain::Ipv4 => libc::AF_INET,
            Domain::Ipv6 => libc::AF_INET6,
        }
    }
}

/// An immutable IPv4-or-IPv6 socket endpoint
///
/// IPv4 endpoints are carried in the leading bytes of the IPv6-sized storage;
/// the active family is recorded in the storage itself, so construction from
/// a raw OS endpoint preserves it.
#[derive(Clone, Copy)]
pub struct Endpoint {
    storage: libc::sockaddr_in6,
}

impl Endpoint {
    /// Wildcard endpoint binding all interfaces for the given family
    pub fn any(port: u16, domain: Domain) -> Self {
        Self::build(port, domain, false)
    }

    /// Loopback endpoint for the given family
    pub fn loopback(port: u16, domain: Domain) -> Self {
        Self::build(port, domain, true)
    }

    fn build(port: u16, domain: Domain, loopback: bool) -> Self {
        let mut storage: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };

        if domain == Domain::Ipv6 {
            storage.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            storage.sin6_port = port.to_be();
            if loopback {
                storage.sin6_addr.s6_addr[15] = 1;
            }
        } else {
            // Non-IPv6 requests get the IPv4 representation
            let v4 = unsafe { &mut *(&mut storage as *mut libc::sockaddr_in6 as *mut libc::sockaddr_in) };
            v4.sin_family = libc::AF_INET as libc::sa_family_t;
            v4.sin_port = port.to_be();
            let host: u32 = if loopback { libc::INADDR_LOOPBACK } else { libc::INADDR_ANY };
            v4.sin_addr.s_addr = host.to_be();
        }

        Self { storage }
    }

    /// Wraps an OS-returned endpoint verbatim
    pub fn from_raw(storage: libc::sockaddr_in6) -> Self {
        Self { storage }
    }

    /// Read-only view for passing to OS bind/connect/accept calls
    ///
    /// The reported length matches the active family.
    pub fn as_sockaddr(&self) -> (*const libc::sockaddr, libc::socklen_t) {
        let len = match self.family() {
            Domain::Ipv4 => std::mem::size_of::<libc::sockaddr_in>(),
            _ => std::mem::size_of::<libc::sockaddr_in6>(),
        };
        (
            &self.storage as *const libc::sockaddr_in6 as *const libc::sockaddr,
            len as libc::socklen_t,
        )
    }

    /// The active address family
    pub fn family(&self) -> Domain {
        match self.storage.sin6_family as libc::c_int {
            libc::AF_INET => Domain::Ipv4,
            libc::AF_INET6 => Domain::Ipv6,
            _ => Domain::Unspec,
        }
    }

    /// Port in host byte order
    pub fn port(&self) -> u16 {
        u16::from_be(self.storage.sin6_port)
    }

    /// Host address
    pub fn ip(&self) -> IpAddr {
        match self.family() {
            Domain::Ipv6 => IpAddr::V6(Ipv6Addr::from(self.storage.sin6_addr.s6_addr)),
            _ => {
                let v4 = unsafe {
                    &*(&self.storage as *const libc::sockaddr_in6 as *const libc::sockaddr_in)
                };
                IpAddr::V4(Ipv4Addr::from(v4.sin_addr.s_addr.to_ne_bytes()))
            }
        }
    }

    /// Conversion to the std address type, `None` if no family is active
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        match self.family() {
            Domain::Unspec => None,
            _ => Some(SocketAddr::new(self.ip(), self.port())),
        }
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Endpoint::any(8080, Domain::Ipv4)
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.family() == other.family() && self.port() == other.port() && self.ip() == other.ip()
    }
}

impl Eq for Endpoint {}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_socket_addr() {
            Some(addr) => write!(f, "{addr}"),
            None => write!(f, "<unspecified>"),
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("family", &self.family())
            .field("port", &self.port())
            .field("ip", &self.ip())
            .finish()
    }
}
