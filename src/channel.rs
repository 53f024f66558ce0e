//! Descriptor-plus-callbacks channel
//!
//! A `Channel` borrows a descriptor (it never closes it; whoever created the
//! descriptor owns it) and carries one optional callback per event kind.
//! Channels are shared as `Rc<Channel>` between the reactor registry and any
//! closures that need to reach back to them, so all slots use interior
//! mutability confined to the single dispatch thread.

use std::cell::RefCell;
use std::os::unix::io::RawFd;

/// The event kinds a channel can react to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackKind {
    /// Descriptor became writable
    Send,
    /// Descriptor became readable (including priority data and read-hangup)
    Receive,
    /// Peer hung up with nothing left to read
    Close,
    /// Descriptor reported an error condition
    Error,
}

type Callback = Box<dyn FnMut()>;

/// One borrowed descriptor paired with four optional event callbacks
pub struct Channel {
    fd: RawFd,
    on_send: RefCell<Option<Callback>>,
    on_receive: RefCell<Option<Callback>>,
    on_close: RefCell<Option<Callback>>,
    on_error: RefCell<Option<Callback>>,
}

impl Channel {
    /// Create a channel over a borrowed descriptor, with no callbacks set
    pub fn new(fd: RawFd) -> Self {
        Self {
            fd,
            on_send: RefCell::new(None),
            on_receive: RefCell::new(None),
            on_close: RefCell::new(None),
            on_error: RefCell::new(None),
        }
    }

    /// Get the borrowed descriptor
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Install or replace the callback for one event kind
    ///
    /// An existing callback for the same kind is silently discarded.
    pub fn set_callback<F>(&self, kind: CallbackKind, callback: F)
    where
        F: FnMut() + 'static,
    {
        *self.slot(kind).borrow_mut() = Some(Box::new(callback));
    }

    /// Invoke the installed callback for `kind`, a no-op if none is set
    ///
    /// The callback is moved out of its slot while it runs, so it may install
    /// or replace callbacks on this same channel without re-entrancy panics.
    /// If it did not replace itself, it is put back afterwards.
    pub fn handle_event(&self, kind: CallbackKind) {
        let callback = self.slot(kind).borrow_mut().take();
        if let Some(mut callback) = callback {
            callback();
            let mut slot = self.slot(kind).borrow_mut();
            if slot.is_none() {
                *slot = Some(callback);
            }
        }
    }

    fn slot(&self, kind: CallbackKind) -> &RefCell<Option<Callback>> {
        match kind {
            CallbackKind::Send => &self.on_send,
            CallbackKind::Receive => &self.on_receive,
            CallbackKind::Close => &self.on_close,
            CallbackKind::Error => &self.on_error,
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").field("fd", &self.fd).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_fd_query() {
        let channel = Channel::new(7);
        assert_eq!(channel.fd(), 7);
    }

    #[test]
    fn test_dispatch_invokes_matching_callback_only() {
        let channel = Channel::new(3);
        let received = Rc::new(Cell::new(0u32));

        let counter = Rc::clone(&received);
        channel.set_callback(CallbackKind::Receive, move || {
            counter.set(counter.get() + 1);
        });

        channel.handle_event(CallbackKind::Receive);
        channel.handle_event(CallbackKind::Send);
        channel.handle_event(CallbackKind::Close);
        assert_eq!(received.get(), 1);
    }

    #[test]
    fn test_missing_callback_is_noop() {
        let channel = Channel::new(3);
        channel.handle_event(CallbackKind::Error);
    }

    #[test]
    fn test_overwrite_discards_prior_callback() {
        let channel = Channel::new(3);
        let first = Rc::new(Cell::new(0u32));
        let second = Rc::new(Cell::new(0u32));

        let counter = Rc::clone(&first);
        channel.set_callback(CallbackKind::Send, move || {
            counter.set(counter.get() + 1);
        });
        let counter = Rc::clone(&second);
        channel.set_callback(CallbackKind::Send, move || {
            counter.set(counter.get() + 1);
        });

        channel.handle_event(CallbackKind::Send);
        assert_eq!(first.get(), 0);
        assert_eq!(second.get(), 1);
    }

    #[test]
    fn test_callback_survives_dispatch() {
        let channel = Channel::new(3);
        let count = Rc::new(Cell::new(0u32));

        let counter = Rc::clone(&count);
        channel.set_callback(CallbackKind::Receive, move || {
            counter.set(counter.get() + 1);
        });

        channel.handle_event(CallbackKind::Receive);
        channel.handle_event(CallbackKind::Receive);
        assert_eq!(count.get(), 2);
    }

    #[test]
    fn test_callback_may_replace_itself_during_dispatch() {
        let channel = Rc::new(Channel::new(3));
        let replaced = Rc::new(Cell::new(false));

        let handle = Rc::clone(&channel);
        let flag = Rc::clone(&replaced);
        channel.set_callback(CallbackKind::Receive, move || {
            let flag = Rc::clone(&flag);
            handle.set_callback(CallbackKind::Receive, move || {
                flag.set(true);
            });
        });

        channel.handle_event(CallbackKind::Receive);
        assert!(!replaced.get());
        channel.handle_event(CallbackKind::Receive);
        assert!(replaced.get());
    }
}
