//! One direction of a byte stream: a descriptor, a keep-alive flag, and a
//! weak back-reference to whatever the broker should call on readiness
//! (spec.md §3, "Side").

use crate::broker::BrokerSource;
use crate::error::{NestmeshError, Result};
use std::os::unix::io::RawFd;
use std::sync::{Mutex, Weak};

pub struct Side {
    fd: Mutex<Option<RawFd>>,
    keep_alive: bool,
    owner: Weak<dyn BrokerSource>,
}

impl Side {
    pub fn new(fd: RawFd, keep_alive: bool, owner: Weak<dyn BrokerSource>) -> Self {
        Self { fd: Mutex::new(Some(fd)), keep_alive, owner }
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn owner(&self) -> Option<std::sync::Arc<dyn BrokerSource>> {
        self.owner.upgrade()
    }

    /// Returns the underlying descriptor, or a stream error once closed.
    pub fn raw_fd(&self) -> Result<RawFd> {
        self.fd
            .lock()
            .unwrap()
            .ok_or_else(|| NestmeshError::stream(0, "side used after close"))
    }

    pub fn is_open(&self) -> bool {
        self.fd.lock().unwrap().is_some()
    }

    /// Closes the descriptor exactly once. Safe to call more than once.
    pub fn close(&self) {
        if let Some(fd) = self.fd.lock().unwrap().take() {
            unsafe {
                libc::close(fd);
            }
        }
    }

    pub fn shutdown_write(&self) {
        if let Ok(fd) = self.raw_fd() {
            unsafe {
                libc::shutdown(fd, libc::SHUT_WR);
            }
        }
    }
}

impl Drop for Side {
    fn drop(&mut self) {
        self.close();
    }
}

pub(crate) fn dup_cloexec(fd: RawFd) -> Result<RawFd> {
    let new_fd = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
    if new_fd < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(new_fd)
}

/// Sets `O_NONBLOCK` on `fd`. Every descriptor the broker thread reads or
/// writes directly needs this, since its callbacks are forbidden from
/// blocking (spec.md §4.1, §5).
pub(crate) fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}
