use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::RwLock;

use log::debug;

use crate::error::{Error, Result};

/// An exclusively owned kernel object descriptor.
///
/// Operations borrow the descriptor under a read lock, so [`Handle::close`]
/// waits for in-flight calls and every later call fails with
/// [`Error::Closed`]. Closing twice is a no-op.
#[derive(Debug)]
pub struct Handle {
    kind: &'static str,
    fd: RwLock<Option<OwnedFd>>,
}

impl Handle {
    pub(crate) fn new(kind: &'static str, fd: OwnedFd) -> Self {
        Self {
            kind,
            fd: RwLock::new(Some(fd)),
        }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub(crate) fn with_fd<T>(&self, f: impl FnOnce(BorrowedFd<'_>) -> Result<T>) -> Result<T> {
        let guard = self.fd.read().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(fd) => f(fd.as_fd()),
            None => Err(Error::Closed(self.kind)),
        }
    }

    /// Raw descriptor number, valid until the handle is closed.
    pub fn raw_fd(&self) -> Result<RawFd> {
        self.with_fd(|fd| Ok(fd.as_raw_fd()))
    }

    /// Duplicates the descriptor so a reader or link can outlive this handle.
    pub(crate) fn try_clone_fd(&self) -> Result<OwnedFd> {
        self.with_fd(|fd| {
            fd.try_clone_to_owned().map_err(|source| Error::Syscall {
                call: "fcntl(F_DUPFD_CLOEXEC)",
                source,
            })
        })
    }

    pub fn is_closed(&self) -> bool {
        self.fd.read().unwrap_or_else(|e| e.into_inner()).is_none()
    }

    pub fn close(&self) {
        let fd = self.fd.write().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(fd) = fd {
            debug!("closing {} fd {}", self.kind, fd.as_raw_fd());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::sync::Arc;

    fn dev_null() -> Handle {
        let file = File::open("/dev/null").expect("open /dev/null");
        Handle::new("test", OwnedFd::from(file))
    }

    #[test]
    fn test_closed_handle_rejects_operations() {
        let handle = dev_null();
        assert!(handle.raw_fd().is_ok());

        handle.close();
        assert!(handle.is_closed());
        assert!(matches!(handle.raw_fd(), Err(Error::Closed("test"))));
        assert!(matches!(handle.try_clone_fd(), Err(Error::Closed("test"))));
    }

    #[test]
    fn test_double_close_is_noop() {
        let handle = dev_null();
        handle.close();
        handle.close();
        assert!(handle.is_closed());
    }

    #[test]
    fn test_clone_survives_close() {
        let handle = dev_null();
        let dup = handle.try_clone_fd().expect("dup");
        handle.close();
        assert!(dup.as_raw_fd() >= 0);
    }

    #[test]
    fn test_concurrent_close() {
        let handle = Arc::new(dev_null());
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let handle = handle.clone();
                std::thread::spawn(move || {
                    let _ = handle.raw_fd();
                    handle.close();
                })
            })
            .collect();
        for t in threads {
            t.join().expect("thread panicked");
        }
        assert!(handle.is_closed());
    }
}
