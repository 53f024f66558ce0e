//! Sockloop - Reactor-Pattern I/O Multiplexing for Non-Blocking Sockets
//!
//! A minimal, single-threaded reactor over edge-triggered epoll. Sockets and
//! arbitrary file descriptors are wrapped in channels carrying per-event
//! callbacks; the reactor waits for OS readiness and dispatches the matching
//! callbacks in a fixed priority order.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          REACTOR CORE                           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  Reactor:  registry + interest map + poll/dispatch loop         │
//! │  Epoll:    edge-triggered readiness facility (EventSource)      │
//! │  Channel:  one descriptor + {receive, send, close, error}       │
//! │  Socket:   owning non-blocking, close-on-exec descriptor        │
//! │  Endpoint: dual IPv4/IPv6 socket address value                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use std::rc::Rc;
//! use sockloop::{CallbackKind, Channel, Domain, Endpoint, Reactor, Socket, SocketKind};
//!
//! # fn main() -> anyhow::Result<()> {
//! let reactor = Reactor::new(Reactor::DEFAULT_CAPACITY)?;
//!
//! let listener = Socket::open(Domain::Ipv4, SocketKind::Stream)?;
//! listener.bind(&Endpoint::any(8080, Domain::Ipv4))?;
//! listener.listen()?;
//!
//! let channel = Rc::new(Channel::new(listener.fd()));
//! channel.set_callback(CallbackKind::Receive, move || {
//!     // accept until drained; the facility is edge-triggered
//! });
//! reactor.register_channel(&channel)?;
//!
//! loop {
//!     reactor.poll()?;
//! }
//! # }
//! ```
//!
//! The reactor is strictly single-threaded: every type here is deliberately
//! `!Send`, channels are shared with `Rc`, and callbacks may call back into
//! the reactor (for example to unregister their own channel) because no
//! registry borrow is held while they run.

mod addr;
mod channel;
mod event_loop;
mod reactor;
mod socket;

pub use addr::{Domain, Endpoint};
pub use channel::{CallbackKind, Channel};
pub use event_loop::{Event, Interest};
pub use reactor::{Reactor, ReactorError, ReactorResult};
pub use socket::{Socket, SocketKind};
