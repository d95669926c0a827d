use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::time::Instant;

use log::debug;
use once_cell::sync::OnceCell;
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::{Notify, watch};

use crate::error::{Error, Result};

static RUNTIME: OnceCell<Runtime> = OnceCell::new();

/// Runtime whose reactor watches the descriptors of every reader.
fn runtime() -> Result<&'static Runtime> {
    RUNTIME.get_or_try_init(|| {
        Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("honeyjar-reader")
            .enable_all()
            .build()
            .map_err(|source| Error::Syscall {
                call: "tokio runtime",
                source,
            })
    })
}

/// Wakes blocked reads when a watched descriptor turns readable or the owner
/// closes.
///
/// Each watched descriptor gets a task on the reader runtime that turns
/// `AsyncFd` readiness into a [`Notify`] permit, so a wake-up that lands
/// between a reader's drain and its wait is never lost.
pub(crate) struct Readiness {
    runtime: &'static Runtime,
    ready: Arc<Notify>,
    closed: watch::Sender<bool>,
}

impl Readiness {
    pub(crate) fn new() -> Result<Self> {
        let (closed, _) = watch::channel(false);
        Ok(Self {
            runtime: runtime()?,
            ready: Arc::new(Notify::new()),
            closed,
        })
    }

    /// Watches `fd` until [`Readiness::close`]. The watcher owns `fd`.
    pub(crate) fn watch(&self, fd: OwnedFd) -> Result<()> {
        let fd = {
            let _guard = self.runtime.enter();
            AsyncFd::with_interest(fd, Interest::READABLE).map_err(|source| Error::Syscall {
                call: "epoll_ctl(EPOLL_CTL_ADD)",
                source,
            })?
        };
        let ready = self.ready.clone();
        let closed = self.closed.subscribe();

        self.runtime.spawn(async move {
            tokio::pin! {
                let closed = closed_signal(closed);
            }
            loop {
                tokio::select! {
                    _ = &mut closed => break,
                    res = fd.readable() => match res {
                        Ok(mut guard) => {
                            guard.clear_ready();
                            ready.notify_one();
                        }
                        Err(e) => {
                            debug!("readiness watch stopped: {e}");
                            break;
                        }
                    },
                }
            }
        });
        Ok(())
    }

    /// Blocks until a watched descriptor signals, `deadline` passes or the
    /// owner closes. Must not be called from async code.
    pub(crate) fn wait(&self, deadline: Option<Instant>) -> Result<()> {
        let closed = closed_signal(self.closed.subscribe());
        self.runtime.block_on(async {
            let expired = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                _ = closed => Err(Error::ReaderClosed),
                _ = self.ready.notified() => Ok(()),
                _ = expired => Err(Error::DeadlineExceeded),
            }
        })
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Wakes every waiter and stops the watchers. Returns whether this call
    /// did the closing.
    pub(crate) fn close(&self) -> bool {
        !self.closed.send_replace(true)
    }
}

/// Resolves once `closed` reads `true` or its sender is gone.
async fn closed_signal(mut closed: watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::os::unix::net::UnixStream;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_wait_returns_when_fd_turns_readable() {
        let readiness = Readiness::new().unwrap();
        let (mut tx, rx) = UnixStream::pair().unwrap();
        readiness.watch(OwnedFd::from(rx)).unwrap();

        tx.write_all(b"x").unwrap();
        readiness
            .wait(Some(Instant::now() + Duration::from_secs(5)))
            .unwrap();
    }

    #[test]
    fn test_wait_honours_deadline() {
        let readiness = Readiness::new().unwrap();
        let (_tx, rx) = UnixStream::pair().unwrap();
        readiness.watch(OwnedFd::from(rx)).unwrap();

        let start = Instant::now();
        let deadline = start + Duration::from_millis(50);
        assert!(matches!(readiness.wait(Some(deadline)), Err(Error::DeadlineExceeded)));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_close_wakes_blocked_wait() {
        let readiness = Arc::new(Readiness::new().unwrap());
        let waiter = {
            let readiness = readiness.clone();
            thread::spawn(move || readiness.wait(None))
        };
        thread::sleep(Duration::from_millis(50));

        assert!(readiness.close());
        assert!(!readiness.close());
        assert!(readiness.is_closed());
        assert!(matches!(waiter.join().unwrap(), Err(Error::ReaderClosed)));
        assert!(matches!(readiness.wait(None), Err(Error::ReaderClosed)));
    }
}
