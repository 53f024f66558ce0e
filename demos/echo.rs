//! Minimal single-threaded echo server over the reactor.
//!
//! ```text
//! cargo run --example echo [port]    # default port 8080
//! ```
//!
//! One channel accepts connections; each accepted socket gets its own
//! channel that echoes bytes back, parking any unwritten remainder until the
//! reactor reports the descriptor writable again.

use anyhow::Result;
use log::{info, warn};
use sockloop::{CallbackKind, Channel, Domain, Endpoint, Reactor, Socket, SocketKind};
use std::cell::RefCell;
use std::io::ErrorKind;
use std::rc::Rc;

fn main() -> Result<()> {
    env_logger::init();

    let port = std::env::args()
        .nth(1)
        .map(|arg| arg.parse::<u16>())
        .transpose()?
        .unwrap_or(8080);

    let reactor = Rc::new(Reactor::new(Reactor::DEFAULT_CAPACITY)?);

    let listener = Rc::new(Socket::open(Domain::Ipv4, SocketKind::Stream)?);
    listener.set_reuse_addr(true)?;
    listener.bind(&Endpoint::any(port, Domain::Ipv4))?;
    listener.listen()?;
    info!("echo server listening on {}", listener.local_addr()?);

    let accept_channel = Rc::new(Channel::new(listener.fd()));
    {
        let reactor = Rc::clone(&reactor);
        let listener = Rc::clone(&listener);
        accept_channel.set_callback(CallbackKind::Receive, move || {
            // Edge-triggered: drain the whole accept queue before returning.
            loop {
                match listener.accept() {
                    Ok(Some((socket, peer))) => {
                        info!("accepted connection from {peer}");
                        serve(&reactor, socket);
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!("accept failed: {err}");
                        break;
                    }
                }
            }
        });
    }
    reactor.register_channel(&accept_channel)?;

    loop {
        reactor.poll()?;
    }
}

/// Wire one accepted connection into the reactor with echo callbacks.
///
/// The channel's own callbacks hold only weak handles to it; the registry
/// keeps the strong one, so unregistering tears the connection down and
/// closes the socket.
fn serve(reactor: &Rc<Reactor>, socket: Socket) {
    let socket = Rc::new(socket);
    let channel = Rc::new(Channel::new(socket.fd()));
    let backlog: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));

    {
        let reactor = Rc::clone(reactor);
        let socket = Rc::clone(&socket);
        let backlog = Rc::clone(&backlog);
        let weak = Rc::downgrade(&channel);
        channel.set_callback(CallbackKind::Receive, move || {
            let Some(channel) = weak.upgrade() else { return };
            let mut buf = [0u8; 4096];
            loop {
                match socket.read(&mut buf) {
                    Ok(0) => {
                        drop_connection(&reactor, &channel);
                        break;
                    }
                    Ok(n) => {
                        if let Err(err) = echo(&reactor, &socket, &channel, &backlog, &buf[..n]) {
                            warn!("echo failed: {err}");
                            drop_connection(&reactor, &channel);
                            break;
                        }
                    }
                    Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                    Err(err) => {
                        warn!("read failed: {err}");
                        drop_connection(&reactor, &channel);
                        break;
                    }
                }
            }
        });
    }

    {
        let reactor = Rc::clone(reactor);
        let socket = Rc::clone(&socket);
        let backlog = Rc::clone(&backlog);
        let weak = Rc::downgrade(&channel);
        channel.set_callback(CallbackKind::Send, move || {
            let Some(channel) = weak.upgrade() else { return };
            let mut pending = backlog.borrow_mut();
            match socket.write_all(pending.as_slice()) {
                Ok(written) => {
                    pending.drain(..written);
                    if pending.is_empty() {
                        if let Err(err) = reactor.cancel_send(&channel) {
                            warn!("cancel send failed: {err}");
                        }
                    }
                }
                Err(err) => {
                    warn!("write failed: {err}");
                    drop(pending);
                    drop_connection(&reactor, &channel);
                }
            }
        });
    }

    {
        let reactor = Rc::clone(reactor);
        let weak = Rc::downgrade(&channel);
        channel.set_callback(CallbackKind::Close, move || {
            if let Some(channel) = weak.upgrade() {
                drop_connection(&reactor, &channel);
            }
        });
    }

    {
        let reactor = Rc::clone(reactor);
        let weak = Rc::downgrade(&channel);
        channel.set_callback(CallbackKind::Error, move || {
            if let Some(channel) = weak.upgrade() {
                warn!("fd {}: error condition reported", channel.fd());
                drop_connection(&reactor, &channel);
            }
        });
    }

    if let Err(err) = reactor.register_channel(&channel) {
        warn!("register failed: {err}");
    }
}

/// Echo one chunk, parking whatever the descriptor refuses to take.
fn echo(
    reactor: &Rc<Reactor>,
    socket: &Socket,
    channel: &Rc<Channel>,
    backlog: &Rc<RefCell<Vec<u8>>>,
    data: &[u8],
) -> Result<()> {
    let mut pending = backlog.borrow_mut();
    if !pending.is_empty() {
        // Keep byte order: everything queues behind the existing backlog.
        pending.extend_from_slice(data);
        return Ok(());
    }

    let written = socket.write_all(data)?;
    if written < data.len() {
        pending.extend_from_slice(&data[written..]);
        reactor.request_send(channel)?;
    }
    Ok(())
}

fn drop_connection(reactor: &Rc<Reactor>, channel: &Rc<Channel>) {
    info!("fd {}: closing connection", channel.fd());
    if let Err(err) = reactor.unregister_channel(channel) {
        warn!("unregister failed: {err}");
    }
}
