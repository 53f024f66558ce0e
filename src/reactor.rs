//! Reactor controller
//!
//! Owns the readiness facility, the descriptor-to-channel registry, and the
//! poll/dispatch loop. Strictly single-threaded: registration, interest
//! changes, and dispatch all happen on the thread driving [`Reactor::poll`].
//!
//! The registry is authoritative for which descriptors are watched. It is
//! only ever updated after the matching OS call succeeded, so OS state and
//! registry state cannot diverge: re-registering an already-watched
//! descriptor is a single atomic interest replacement, and a failed
//! unregistration leaves the entry in place and returns the error.

use crate::channel::{CallbackKind, Channel};
use crate::event_loop::{Epoll, Event, EventSource, Interest};
use log::{debug, trace};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

/// Errors from reactor operations
#[derive(Debug, thiserror::Error)]
pub enum ReactorError {
    #[error("failed to create the readiness facility: {0}")]
    Create(#[source] io::Error),
    #[error("failed to register fd {fd}: {source}")]
    Register { fd: RawFd, source: io::Error },
    #[error("failed to unregister fd {fd}: {source}")]
    Unregister { fd: RawFd, source: io::Error },
    #[error("failed to update interest for fd {fd}: {source}")]
    Interest { fd: RawFd, source: io::Error },
    #[error("fd {fd} is not registered with this reactor")]
    NotRegistered { fd: RawFd },
    #[error("waiting for readiness failed: {0}")]
    Wait(#[source] io::Error),
}

pub type ReactorResult<T> = Result<T, ReactorError>;

/// Single-threaded readiness multiplexer over edge-triggered epoll
///
/// Channels are shared as `Rc`; the reactor holds one handle per registered
/// descriptor and dispatch runs with no registry borrow held, so a callback
/// may call back into the reactor, including unregistering its own channel.
pub struct Reactor {
    source: RefCell<Box<dyn EventSource>>,
    channels: RefCell<HashMap<RawFd, Rc<Channel>>>,
    interests: RefCell<HashMap<RawFd, Interest>>,
    events: RefCell<Vec<Event>>,
    capacity: Cell<usize>,
    timeout: Cell<Duration>,
}

impl Reactor {
    /// Default event-buffer capacity
    pub const DEFAULT_CAPACITY: usize = 16;

    /// Default bound on how long one [`Reactor::poll`] call may block
    pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(10_000);

    /// Create a reactor with an event buffer of the given capacity
    pub fn new(capacity: usize) -> ReactorResult<Self> {
        let epoll = Epoll::new(capacity).map_err(ReactorError::Create)?;
        Ok(Self::with_source(Box::new(epoll), capacity))
    }

    pub(crate) fn with_source(source: Box<dyn EventSource>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            source: RefCell::new(source),
            channels: RefCell::new(HashMap::new()),
            interests: RefCell::new(HashMap::new()),
            events: RefCell::new(Vec::with_capacity(capacity)),
            capacity: Cell::new(capacity),
            timeout: Cell::new(Self::DEFAULT_POLL_TIMEOUT),
        }
    }

    /// Bound how long one poll call may block
    pub fn set_poll_timeout(&self, timeout: Duration) {
        self.timeout.set(timeout);
    }

    /// The current poll timeout
    pub fn poll_timeout(&self) -> Duration {
        self.timeout.get()
    }

    /// Register a channel for edge-triggered readable interest
    ///
    /// Registering a descriptor that is already watched replaces its channel
    /// and resets its interest in one atomic OS-level update; the effect of
    /// registering twice is exactly one live registration. On failure the
    /// prior registration, if any, stays authoritative.
    pub fn register_channel(&self, channel: &Rc<Channel>) -> ReactorResult<()> {
        let fd = channel.fd();
        let interest = Interest::READABLE;
        let replacing = self.channels.borrow().contains_key(&fd);

        {
            let mut source = self.source.borrow_mut();
            let result = if replacing {
                source.modify(fd, interest)
            } else {
                source.add(fd, interest)
            };
            result.map_err(|err| ReactorError::Register { fd, source: err })?;
        }

        if replacing {
            debug!("fd {fd}: replacing registered channel");
        }
        self.interests.borrow_mut().insert(fd, interest);
        self.channels.borrow_mut().insert(fd, Rc::clone(channel));
        trace!("fd {fd}: registered");
        Ok(())
    }

    /// Remove a channel's registration; a no-op if it is not registered
    ///
    /// The registry entry is erased only after the OS removal succeeded, so
    /// a failure is detectable and the channel stays registered.
    pub fn unregister_channel(&self, channel: &Rc<Channel>) -> ReactorResult<()> {
        let fd = channel.fd();
        if !self.channels.borrow().contains_key(&fd) {
            trace!("fd {fd}: unregister on unwatched descriptor ignored");
            return Ok(());
        }

        self.source
            .borrow_mut()
            .remove(fd)
            .map_err(|err| ReactorError::Unregister { fd, source: err })?;

        self.channels.borrow_mut().remove(&fd);
        self.interests.borrow_mut().remove(&fd);
        trace!("fd {fd}: unregistered");
        Ok(())
    }

    /// Look up the registered channel for a descriptor
    pub fn channel(&self, fd: RawFd) -> Option<Rc<Channel>> {
        self.channels.borrow().get(&fd).cloned()
    }

    /// Ask for a send notification once the descriptor becomes writable
    ///
    /// Writable interest is added as the union with the channel's current
    /// interest set, so read interest is never discarded.
    pub fn request_send(&self, channel: &Rc<Channel>) -> ReactorResult<()> {
        let fd = channel.fd();
        let current = self.current_interest(fd)?;
        self.update_interest(fd, current | Interest::WRITABLE)
    }

    /// Drop writable interest again once a writer has drained its backlog
    pub fn cancel_send(&self, channel: &Rc<Channel>) -> ReactorResult<()> {
        let fd = channel.fd();
        let current = self.current_interest(fd)?;
        self.update_interest(fd, current - Interest::WRITABLE)
    }

    /// Wait for readiness and dispatch callbacks, in OS-report order
    ///
    /// Blocks for up to the configured timeout; zero ready events is a
    /// normal timeout return. A full event batch grows the buffer so later
    /// polls can retrieve more events per call. Events whose descriptor is
    /// no longer in the registry are dropped as stale.
    pub fn poll(&self) -> ReactorResult<usize> {
        {
            let mut source = self.source.borrow_mut();
            let mut events = self.events.borrow_mut();
            events.clear();
            source
                .wait(&mut events, self.timeout.get())
                .map_err(ReactorError::Wait)?;
        }

        let batch = std::mem::take(&mut *self.events.borrow_mut());
        let count = batch.len();

        if count == self.capacity.get() {
            let grown = self.capacity.get() * 2;
            debug!("event buffer full at {count} events, growing to {grown}");
            self.source.borrow_mut().set_capacity(grown);
            self.capacity.set(grown);
        }

        for event in &batch {
            let channel = self.channels.borrow().get(&event.fd).cloned();
            match channel {
                Some(channel) => Self::dispatch(&channel, event.interest),
                None => trace!("fd {}: dropping stale event", event.fd),
            }
        }

        *self.events.borrow_mut() = batch;
        Ok(count)
    }

    /// Fixed dispatch priority; each condition is evaluated independently,
    /// so one event can fire several callbacks.
    fn dispatch(channel: &Rc<Channel>, interest: Interest) {
        if interest.is_hangup() && !interest.is_readable() {
            channel.handle_event(CallbackKind::Close);
        }
        if interest.is_error() {
            channel.handle_event(CallbackKind::Error);
        }
        if interest.is_readable() || interest.is_priority() || interest.is_read_hangup() {
            channel.handle_event(CallbackKind::Receive);
        }
        if interest.is_writable() {
            channel.handle_event(CallbackKind::Send);
        }
    }

    fn current_interest(&self, fd: RawFd) -> ReactorResult<Interest> {
        self.interests
            .borrow()
            .get(&fd)
            .copied()
            .ok_or(ReactorError::NotRegistered { fd })
    }

    fn update_interest(&self, fd: RawFd, desired: Interest) -> ReactorResult<()> {
        self.source
            .borrow_mut()
            .modify(fd, desired)
            .map_err(|err| ReactorError::Interest { fd, source: err })?;
        self.interests.borrow_mut().insert(fd, desired);
        Ok(())
    }
}
