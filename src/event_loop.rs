//! Edge-triggered readiness facility
//!
//! `Epoll` wraps the Linux epoll descriptor behind the small `EventSource`
//! seam the reactor polls through. Readiness is reported as an [`Interest`]
//! bit-set attached to the descriptor that became ready.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Interest and readiness flags for I/O events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(pub u8);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READABLE: Interest = Interest(0b00_0001);
    pub const WRITABLE: Interest = Interest(0b00_0010);
    pub const ERROR: Interest = Interest(0b00_0100);
    pub const HANGUP: Interest = Interest(0b00_1000);
    pub const PRIORITY: Interest = Interest(0b01_0000);
    pub const READ_HANGUP: Interest = Interest(0b10_0000);

    pub fn is_readable(&self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    pub fn is_writable(&self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    pub fn is_error(&self) -> bool {
        self.0 & Self::ERROR.0 != 0
    }

    pub fn is_hangup(&self) -> bool {
        self.0 & Self::HANGUP.0 != 0
    }

    pub fn is_priority(&self) -> bool {
        self.0 & Self::PRIORITY.0 != 0
    }

    pub fn is_read_hangup(&self) -> bool {
        self.0 & Self::READ_HANGUP.0 != 0
    }
}

impl std::ops::BitOr for Interest {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Interest(self.0 | rhs.0)
    }
}

impl std::ops::BitAnd for Interest {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Interest(self.0 & rhs.0)
    }
}

impl std::ops::BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl std::ops::Sub for Interest {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Interest(self.0 & !rhs.0)
    }
}

/// A readiness event for one registered descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub fd: RawFd,
    pub interest: Interest,
}

/// Readiness-notification backend the reactor polls through
///
/// The production implementation is [`Epoll`]; tests drive dispatch with a
/// scripted source instead.
pub(crate) trait EventSource {
    /// Register a descriptor for events
    fn add(&mut self, fd: RawFd, interest: Interest) -> io::Result<()>;

    /// Replace the interest set of an existing registration
    fn modify(&mut self, fd: RawFd, interest: Interest) -> io::Result<()>;

    /// Remove a registration
    fn remove(&mut self, fd: RawFd) -> io::Result<()>;

    /// Block until readiness or timeout, appending events to `events`
    fn wait(&mut self, events: &mut Vec<Event>, timeout: Duration) -> io::Result<usize>;

    /// Resize the per-wait event batch
    fn set_capacity(&mut self, capacity: usize);
}

/// Edge-triggered epoll backend
///
/// Owns the epoll descriptor (created close-on-exec) and a reusable raw
/// event buffer sized to the per-wait batch capacity.
pub(crate) struct Epoll {
    epoll_fd: RawFd,
    buffer: Vec<libc::epoll_event>,
}

impl Epoll {
    pub(crate) fn new(capacity: usize) -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            epoll_fd,
            buffer: vec![unsafe { std::mem::zeroed() }; capacity.max(1)],
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: Option<Interest>) -> io::Result<()> {
        let mut event = interest.map(|interest| libc::epoll_event {
            events: interest_to_epoll(interest),
            u64: fd as u64,
        });

        let event_ptr = match event.as_mut() {
            Some(event) => event as *mut libc::epoll_event,
            None => std::ptr::null_mut(),
        };

        let result = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, event_ptr) };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl EventSource for Epoll {
    fn add(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, Some(interest))
    }

    fn modify(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, Some(interest))
    }

    fn remove(&mut self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, None)
    }

    fn wait(&mut self, events: &mut Vec<Event>, timeout: Duration) -> io::Result<usize> {
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;

        let count = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                self.buffer.as_mut_ptr(),
                self.buffer.len() as i32,
                timeout_ms,
            )
        };

        if count < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        for raw in &self.buffer[..count as usize] {
            events.push(Event {
                fd: raw.u64 as RawFd,
                interest: epoll_to_interest(raw.events),
            });
        }

        Ok(count as usize)
    }

    fn set_capacity(&mut self, capacity: usize) {
        self.buffer
            .resize(capacity.max(1), unsafe { std::mem::zeroed() });
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe { libc::close(self.epoll_fd) };
    }
}

fn interest_to_epoll(interest: Interest) -> u32 {
    // Edge-triggered; priority data and read-hangup ride along with read
    // interest so their dispatch rules stay reachable.
    let mut events = libc::EPOLLET as u32;
    if interest.is_readable() {
        events |= (libc::EPOLLIN | libc::EPOLLPRI | libc::EPOLLRDHUP) as u32;
    }
    if interest.is_writable() {
        events |= libc::EPOLLOUT as u32;
    }
    events
}

fn epoll_to_interest(events: u32) -> Interest {
    let mut interest = Interest::NONE;
    if events & libc::EPOLLIN as u32 != 0 {
        interest |= Interest::READABLE;
    }
    if events & libc::EPOLLOUT as u32 != 0 {
        interest |= Interest::WRITABLE;
    }
    if events & libc::EPOLLERR as u32 != 0 {
        interest |= Interest::ERROR;
    }
    if events & libc::EPOLLHUP as u32 != 0 {
        interest |= Interest::HANGUP;
    }
    if events & libc::EPOLLPRI as u32 != 0 {
        interest |= Interest::PRIORITY;
    }
    if events & libc::EPOLLRDHUP as u32 != 0 {
        interest |= Interest::READ_HANGUP;
    }
    interest
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interest_flags() {
        let interest = Interest::READABLE | Interest::WRITABLE;
        assert!(interest.is_readable());
        assert!(interest.is_writable());
        assert!(!interest.is_error());
    }

    #[test]
    fn test_interest_subtraction_preserves_other_bits() {
        let interest = Interest::READABLE | Interest::WRITABLE;
        let reduced = interest - Interest::WRITABLE;
        assert!(reduced.is_readable());
        assert!(!reduced.is_writable());
    }

    #[test]
    fn test_epoll_creation() {
        assert!(Epoll::new(16).is_ok());
    }

    #[test]
    fn test_epoll_reports_readable_descriptor() {
        let mut fds = [0 as RawFd; 2];
        let result = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(result, 0);
        let (read_end, write_end) = (fds[0], fds[1]);

        let mut epoll = Epoll::new(4).unwrap();
        epoll.add(read_end, Interest::READABLE).unwrap();

        let payload = [0x42u8];
        unsafe { libc::write(write_end, payload.as_ptr() as *const libc::c_void, 1) };

        let mut events = Vec::new();
        let count = epoll.wait(&mut events, Duration::from_millis(1000)).unwrap();
        assert_eq!(count, 1);
        assert_eq!(events[0].fd, read_end);
        assert!(events[0].interest.is_readable());

        unsafe {
            libc::close(read_end);
            libc::close(write_end);
        }
    }

    #[test]
    fn test_remove_unregistered_descriptor_fails() {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(
            unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) },
            0
        );

        let mut epoll = Epoll::new(4).unwrap();
        epoll.add(fds[0], Interest::READABLE).unwrap();
        epoll.remove(fds[0]).unwrap();
        assert!(epoll.remove(fds[0]).is_err());

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
