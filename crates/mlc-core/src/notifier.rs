//! Wakeup pipe the workshop hands to the event loop.
//!
//! Workers call `notify()` after pushing a finished item; only the first
//! call after the handler last ran writes a byte, so a burst of completions
//! wakes the loop once.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct CompletionNotifier {
    reader: RawFd,
    writer: RawFd,
    armed: AtomicBool,
}

impl CompletionNotifier {
    pub fn new() -> io::Result<Self> {
        let mut fds = [0; 2];
        // Non-blocking so a full pipe never stalls a worker and draining never
        // stalls the event loop.
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            reader: fds[0],
            writer: fds[1],
            armed: AtomicBool::new(false),
        })
    }

    /// Read end; becomes readable when completions are waiting.
    pub fn as_raw_fd(&self) -> RawFd {
        self.reader
    }

    pub fn notify(&self) {
        if self.armed.swap(true, Ordering::AcqRel) {
            return;
        }
        let byte = 1u8;
        loop {
            let rc = unsafe { libc::write(self.writer, (&byte as *const u8).cast(), 1) };
            if rc >= 0 {
                return;
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(code) if code == libc::EINTR => continue,
                // Pipe already full: the loop is going to wake anyway.
                Some(code) if code == libc::EAGAIN => return,
                _ => {
                    log::error!("completion notify failed: {err}");
                    return;
                }
            }
        }
    }

    /// Empty the pipe, then disarm. Call before draining the completed queue.
    /// A notify that lands between the two steps is suppressed, but its item
    /// is already queued and the drain that follows picks it up; any notify
    /// after the disarm writes a fresh byte.
    pub fn acknowledge(&self) {
        self.drain_pipe();
        self.disarm();
    }

    fn drain_pipe(&self) {
        let mut scratch = [0u8; 64];
        loop {
            let rc =
                unsafe { libc::read(self.reader, scratch.as_mut_ptr().cast(), scratch.len()) };
            if rc > 0 {
                continue;
            }
            if rc == 0 {
                return;
            }
            match io::Error::last_os_error().raw_os_error() {
                Some(code) if code == libc::EINTR => continue,
                _ => return,
            }
        }
    }

    fn disarm(&self) {
        self.armed.store(false, Ordering::Release);
    }
}

impl Drop for CompletionNotifier {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.reader);
            libc::close(self.writer);
        }
    }
}

/// Wait up to `timeout_ms` for `fd` to become readable.
pub fn wait_readable(fd: RawFd, timeout_ms: i32) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    loop {
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc >= 0 {
            return Ok(rc > 0 && (pfd.revents & libc::POLLIN) != 0);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err);
        }
    }
}
