//! Redirects a standard descriptor into the logging subsystem as whole
//! lines (spec.md §4.8).

use crate::broker::{BrokerHandle, BrokerSource};
use crate::error::Result;
use crate::side::{self, Side};
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, Weak};

pub struct IoLogger {
    recv_side: Arc<Side>,
    xmit_side: Arc<Side>,
    logger_name: String,
    buffer: Mutex<Vec<u8>>,
}

impl IoLogger {
    /// Takes ownership of `write_fd` (the descriptor to redirect, e.g.
    /// stdout/stderr) and `read_fd` (the other end of a socket pair the
    /// broker reads lines from). Both are dup'd close-on-exec; `read_fd`
    /// is also set non-blocking, since the broker thread is the one
    /// reading it (spec.md §4.1, §5).
    pub fn install(logger_name: impl Into<String>, read_fd: RawFd, write_fd: RawFd, broker: &BrokerHandle) -> Result<Arc<Self>> {
        let read_fd = side::dup_cloexec(read_fd)?;
        let write_fd = side::dup_cloexec(write_fd)?;
        side::set_nonblocking(read_fd)?;

        let logger = Arc::new_cyclic(|weak: &Weak<IoLogger>| {
            let owner: Weak<dyn BrokerSource> = weak.clone();
            Self {
                recv_side: Arc::new(Side::new(read_fd, true, owner.clone())),
                xmit_side: Arc::new(Side::new(write_fd, false, owner)),
                logger_name: logger_name.into(),
                buffer: Mutex::new(Vec::new()),
            }
        });
        broker.start_receive(logger.recv_side.clone());
        Ok(logger)
    }
}

impl BrokerSource for IoLogger {
    fn on_receive(&self, broker: &BrokerHandle) {
        let mut chunk = [0u8; 16 * 1024];
        loop {
            let fd = match self.recv_side.raw_fd() {
                Ok(fd) => fd,
                Err(_) => return,
            };
            let n = unsafe { libc::read(fd, chunk.as_mut_ptr() as *mut libc::c_void, chunk.len()) };
            if n < 0 {
                let err = std::io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EAGAIN) | Some(libc::EINTR) => return,
                    _ => {
                        self.flush_partial_line();
                        self.on_disconnect(broker);
                        return;
                    }
                }
            }
            if n == 0 {
                self.flush_partial_line();
                self.on_disconnect(broker);
                return;
            }
            let mut buffer = self.buffer.lock().unwrap();
            buffer.extend_from_slice(&chunk[..n as usize]);
            while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                let line = &line[..line.len() - 1];
                tracing::info!(logger = %self.logger_name, "{}", String::from_utf8_lossy(line));
            }
        }
    }

    fn on_disconnect(&self, broker: &BrokerHandle) {
        broker.stop_receive(&self.recv_side);
        self.recv_side.close();
        self.xmit_side.close();
    }

    fn on_shutdown(&self, _broker: &BrokerHandle) {
        // The broker's keep-alive drain keeps polling `recv_side` until
        // the writer closes or `shutdown_timeout` elapses; once it
        // forcibly disconnects, shut down the write end first so any
        // writer observes EOF instead of a reset.
        self.xmit_side.shutdown_write();
    }
}

impl IoLogger {
    fn flush_partial_line(&self) {
        let mut buffer = self.buffer.lock().unwrap();
        if !buffer.is_empty() {
            tracing::info!(logger = %self.logger_name, "{}", String::from_utf8_lossy(&buffer));
            buffer.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Broker;
    use std::io::Write;
    use std::os::unix::net::UnixStream;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn split_writes_emit_lines_only_at_newlines() {
        let broker = Broker::spawn().unwrap();
        let (mut writer, reader) = UnixStream::pair().unwrap();
        let _logger = IoLogger::install("stdout", reader.as_raw_fd(), reader.as_raw_fd(), &broker.handle()).unwrap();

        writer.write_all(b"hello\nwor").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(100));
        writer.write_all(b"ld\n").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(100));

        drop(writer);
        broker.join();
    }
}
