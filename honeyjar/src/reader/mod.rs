//! Draining records that programs push to user space.
//!
//! Both readers drain their rings through aya and block in
//! [`EventReader::read`] until a record arrives, the deadline passes, or
//! another thread calls [`EventReader::close`]. Closing is the only way to
//! cancel a blocked read. Blocking reads must not run on an async worker;
//! use [`read_timeout`] from async code.

mod perf;
mod readiness;
mod ring;

use std::ptr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use aya::Pod;
use bytes::Bytes;

use crate::error::{Error, Result};

pub use perf::{PerfReader, PerfReaderOptions};
pub use ring::RingBufReader;

/// One record taken from a ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// CPU whose ring produced the record; `None` for ring buffers, which
    /// are shared by all CPUs.
    pub cpu: Option<u32>,
    /// Sample bytes. Perf samples may carry trailing alignment padding.
    pub raw: Bytes,
    /// Samples the kernel dropped because the ring was full. A record
    /// reporting loss carries no sample.
    pub lost_samples: u64,
    /// Position of this record in the reader's delivery order.
    pub sequence: u64,
}

impl Record {
    /// Reads a `T` from the front of the sample, or `None` when the sample is
    /// too short.
    pub fn decode<T: Pod>(&self) -> Option<T> {
        if self.raw.len() < size_of::<T>() {
            return None;
        }
        // SAFETY: length checked above; `Pod` types accept any bit pattern.
        Some(unsafe { ptr::read_unaligned(self.raw.as_ptr().cast::<T>()) })
    }
}

pub trait EventReader: Send + Sync {
    /// Blocks until a record is available, `deadline` passes
    /// ([`Error::DeadlineExceeded`]) or the reader is closed
    /// ([`Error::ReaderClosed`]).
    fn read_until(&self, deadline: Option<Instant>) -> Result<Record>;

    /// Deadline applied by [`EventReader::read`]; `None` blocks indefinitely.
    fn set_deadline(&self, deadline: Option<Instant>);

    fn deadline(&self) -> Option<Instant>;

    fn read(&self) -> Result<Record> {
        self.read_until(self.deadline())
    }

    /// Unblocks pending reads and releases the ring. Idempotent.
    fn close(&self);
}

/// Reads one record on the blocking pool, giving up after `timeout`.
/// Returns `Ok(None)` when nothing arrived in time.
pub async fn read_timeout<R>(reader: Arc<R>, timeout: Duration) -> Result<Option<Record>>
where
    R: EventReader + ?Sized + 'static,
{
    let deadline = Instant::now() + timeout;
    let task = tokio::task::spawn_blocking(move || reader.read_until(Some(deadline)));
    match task.await {
        Ok(Ok(record)) => Ok(Some(record)),
        Ok(Err(Error::DeadlineExceeded)) => Ok(None),
        Ok(Err(e)) => Err(e),
        Err(join) if join.is_panic() => std::panic::resume_unwind(join.into_panic()),
        Err(_) => Err(Error::ReaderClosed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(raw: &'static [u8]) -> Record {
        Record {
            cpu: None,
            raw: Bytes::from_static(raw),
            lost_samples: 0,
            sequence: 0,
        }
    }

    #[test]
    fn test_decode_reads_from_the_front() {
        let mut raw = 7u32.to_ne_bytes().to_vec();
        raw.extend_from_slice(&[0xff; 4]);
        let record = Record {
            raw: Bytes::from(raw),
            ..record(b"")
        };
        assert_eq!(record.decode::<u32>(), Some(7));
    }

    #[test]
    fn test_decode_rejects_short_samples() {
        assert_eq!(record(b"abc").decode::<u32>(), None);
        assert_eq!(record(b"").decode::<u8>(), None);
    }
}
