//! Thin owned wrapper over a Linux epoll instance.
//!
//! Level-triggered only. Each registration carries a `u64` key that
//! comes back verbatim in the ready event.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

pub(crate) const READABLE: u32 = libc::EPOLLIN as u32;
pub(crate) const WRITABLE: u32 = libc::EPOLLOUT as u32;
pub(crate) const PEER_CLOSED: u32 = (libc::EPOLLRDHUP | libc::EPOLLHUP) as u32;
pub(crate) const ERROR: u32 = libc::EPOLLERR as u32;

pub(crate) struct Epoll {
    fd: RawFd,
}

impl Epoll {
    pub(crate) fn new() -> io::Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: u32, key: u64) -> io::Result<()> {
        let mut ev = libc::epoll_event { events: interest, u64: key };
        let ret = unsafe { libc::epoll_ctl(self.fd, op, fd, &mut ev) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub(crate) fn add(&self, fd: RawFd, interest: u32, key: u64) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest, key)
    }

    pub(crate) fn modify(&self, fd: RawFd, interest: u32, key: u64) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, interest, key)
    }

    pub(crate) fn delete(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0, 0)
    }

    /// Wait up to `timeout`. `EINTR` surfaces as `ErrorKind::Interrupted`.
    pub(crate) fn wait(&self, events: &mut [libc::epoll_event], timeout: Duration) -> io::Result<usize> {
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        let max = events.len().min(i32::MAX as usize) as libc::c_int;
        let n = unsafe { libc::epoll_wait(self.fd, events.as_mut_ptr(), max, timeout_ms) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Zeroed event buffer for `Epoll::wait`.
pub(crate) fn event_buffer(n: usize) -> Vec<libc::epoll_event> {
    vec![libc::epoll_event { events: 0, u64: 0 }; n]
}
