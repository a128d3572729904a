//! Contract between the workshop and the daemon's fd multiplexer.

use std::os::unix::io::RawFd;

use eyre::Result;

/// What a registered descriptor should be watched for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
}

/// Readiness reported back to a handler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub hangup: bool,
    pub error: bool,
}

impl Readiness {
    pub const fn readable() -> Self {
        Self {
            readable: true,
            hangup: false,
            error: false,
        }
    }
}

/// The multiplexer the workshop registers its completion descriptor with.
/// When the descriptor is ready the loop calls
/// [`Workshop::process`](crate::workshop::Workshop::process).
pub trait EventLoop: Send + Sync {
    fn register(&self, fd: RawFd, interest: Interest) -> Result<()>;
    fn unregister(&self, fd: RawFd) -> Result<()>;
}

/// For embedders that drive completions themselves.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoEventLoop;

impl EventLoop for NoEventLoop {
    fn register(&self, _fd: RawFd, _interest: Interest) -> Result<()> {
        Ok(())
    }

    fn unregister(&self, _fd: RawFd) -> Result<()> {
        Ok(())
    }
}
