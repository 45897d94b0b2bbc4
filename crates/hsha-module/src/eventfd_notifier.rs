//! `EventFdNotifier`: default `Notifier` implementation.
//!
//! The eventfd sits in the selector's epoll set. Workers (after
//! buffering a response) and `stop()` write to it; the selector wakes,
//! drains the counter once, and processes whatever is pending.
//! Multiple `notify()` calls before the drain coalesce into one wakeup.

use hsha_core::error::{HshaError, Result};
use hsha_core::notifier::Notifier;

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

const COUNTER_LEN: usize = std::mem::size_of::<u64>();

pub struct EventFdNotifier {
    fd: OwnedFd,
}

impl EventFdNotifier {
    /// Non-blocking, close-on-exec, counter starting at zero.
    pub fn create() -> Result<Self> {
        let raw = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if raw < 0 {
            return Err(HshaError::last_os_error());
        }
        // SAFETY: eventfd just returned this descriptor and nothing else owns it.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        Ok(Self { fd })
    }

    /// Reset the counter and return how many notifications it held.
    pub fn drain(&self) -> u64 {
        let mut buf = [0u8; COUNTER_LEN];
        let n = unsafe { libc::read(self.fd.as_raw_fd(), buf.as_mut_ptr().cast(), COUNTER_LEN) };
        if n == COUNTER_LEN as isize {
            u64::from_ne_bytes(buf)
        } else {
            // EAGAIN: counter already zero.
            0
        }
    }
}

impl AsRawFd for EventFdNotifier {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Notifier for EventFdNotifier {
    fn notify(&self) -> Result<()> {
        let buf = 1u64.to_ne_bytes();
        let n = unsafe { libc::write(self.fd.as_raw_fd(), buf.as_ptr().cast(), COUNTER_LEN) };
        if n >= 0 {
            return Ok(());
        }
        match io::Error::last_os_error().raw_os_error() {
            // Counter saturated: the selector has a wakeup pending anyway.
            Some(libc::EAGAIN) => Ok(()),
            Some(errno) => Err(HshaError::Os(errno)),
            None => Err(HshaError::Os(0)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notifications_coalesce() {
        let n = EventFdNotifier::create().unwrap();
        assert_eq!(n.drain(), 0);
        n.notify().unwrap();
        n.notify().unwrap();
        n.notify().unwrap();
        assert_eq!(n.drain(), 3);
        assert_eq!(n.drain(), 0);
    }

    #[test]
    fn test_fd_is_valid_while_owned() {
        let n = EventFdNotifier::create().unwrap();
        let fd = n.as_raw_fd();
        assert!(unsafe { libc::fcntl(fd, libc::F_GETFD) } >= 0);
    }
}
