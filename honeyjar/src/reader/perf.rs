use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::Mutex;
use std::time::Instant;

use aya::maps::perf::{Events, PerfBufferError, PerfEventArrayBuffer};
use aya::maps::{Map as AyaMap, MapData, PerfEventArray};
use bytes::{Bytes, BytesMut};
use log::debug;

use super::readiness::Readiness;
use super::{EventReader, Record};
use crate::error::{Error, Result};
use crate::maps::{Map, MapType};
use crate::sys;

/// Samples taken from one CPU's ring per `read_events` call.
const BATCH: usize = 16;

#[derive(Debug, Clone)]
pub struct PerfReaderOptions {
    /// Requested data bytes per CPU, rounded up to a power-of-two number of
    /// pages.
    pub per_cpu_buffer: usize,
}

impl Default for PerfReaderOptions {
    fn default() -> Self {
        Self {
            per_cpu_buffer: sys::page_size(),
        }
    }
}

/// Number of data pages backing `bytes`.
pub(crate) fn data_pages(bytes: usize, page: usize) -> usize {
    bytes.div_ceil(page).max(1).next_power_of_two()
}

/// Clears the perf array slots installed so far unless disarmed.
struct SlotGuard<F: FnMut(u32)> {
    installed: Vec<u32>,
    clear: F,
}

impl<F: FnMut(u32)> SlotGuard<F> {
    fn new(clear: F) -> Self {
        Self {
            installed: Vec::new(),
            clear,
        }
    }

    fn push(&mut self, cpu: u32) {
        self.installed.push(cpu);
    }

    fn disarm(mut self) {
        self.installed.clear();
    }
}

impl<F: FnMut(u32)> Drop for SlotGuard<F> {
    fn drop(&mut self) {
        for cpu in self.installed.drain(..) {
            (self.clear)(cpu);
        }
    }
}

fn clear_slot(map_fd: BorrowedFd<'_>, cpu: u32) {
    // The slot may already be gone if the map was closed first.
    if let Err(e) = sys::bpf_map_delete_elem(map_fd, &cpu.to_ne_bytes()) {
        debug!("perf event array slot {cpu}: {e}");
    }
}

fn perf_open_error(cpu: u32, source: io::Error) -> Error {
    let what = format!("bpf output event on cpu {cpu}");
    match source.raw_os_error() {
        Some(libc::EACCES) | Some(libc::EPERM) => Error::not_supported(what, "insufficient privilege"),
        Some(libc::ENOENT) | Some(libc::ENODEV) => {
            Error::not_supported(what, "kernel lacks PERF_COUNT_SW_BPF_OUTPUT")
        }
        _ => Error::from_errno("perf_event_open", what, source),
    }
}

fn perf_buffer_error(cpu: u32, err: PerfBufferError) -> Error {
    match err {
        PerfBufferError::OpenError { io_error } => perf_open_error(cpu, io_error),
        PerfBufferError::IOError(source) => Error::from_errno(
            "bpf(BPF_MAP_UPDATE_ELEM)",
            format!("perf event array slot {cpu}"),
            source,
        ),
        err => Error::PerfBuffer(err),
    }
}

/// Queues one `read_events` batch: a loss record first when the kernel
/// dropped samples, then the samples in ring order.
fn queue_batch(pending: &mut VecDeque<Record>, cpu: u32, events: Events, bufs: &mut [BytesMut]) {
    if events.lost > 0 {
        pending.push_back(Record {
            cpu: Some(cpu),
            raw: Bytes::new(),
            lost_samples: events.lost as u64,
            sequence: 0,
        });
    }
    for buf in &mut bufs[..events.read] {
        pending.push_back(Record {
            cpu: Some(cpu),
            raw: buf.split().freeze(),
            lost_samples: 0,
            sequence: 0,
        });
    }
}

struct PerfRing {
    cpu: u32,
    buf: PerfEventArrayBuffer<MapData>,
}

struct PerfState {
    rings: Vec<PerfRing>,
    next: usize,
    pending: VecDeque<Record>,
    scratch: Vec<BytesMut>,
    sequence: u64,
    map_fd: OwnedFd,
}

impl PerfState {
    fn next_record(&mut self) -> Result<Option<Record>> {
        if self.pending.is_empty() {
            self.fill()?;
        }
        Ok(self.pending.pop_front().map(|mut record| {
            record.sequence = self.sequence;
            self.sequence += 1;
            record
        }))
    }

    /// Reads a batch from the next readable ring. Round-robin across CPUs.
    fn fill(&mut self) -> Result<()> {
        let len = self.rings.len();
        for _ in 0..len {
            let ring = &mut self.rings[self.next];
            self.next = (self.next + 1) % len;
            if !ring.buf.readable() {
                continue;
            }
            let events = ring.buf.read_events(&mut self.scratch)?;
            queue_batch(&mut self.pending, ring.cpu, events, &mut self.scratch);
            if !self.pending.is_empty() {
                break;
            }
        }
        Ok(())
    }
}

/// Reader for perf event array maps. Opens one output event per online CPU
/// and installs it in the array slot of that CPU.
pub struct PerfReader {
    readiness: Readiness,
    state: Mutex<Option<PerfState>>,
    deadline: Mutex<Option<Instant>>,
    cpus: Vec<u32>,
}

impl PerfReader {
    pub fn new(map: &Map, opts: &PerfReaderOptions) -> Result<Self> {
        if map.map_type() != MapType::PerfEventArray {
            return Err(Error::InvalidInput(format!(
                "map {} is a {} map, not a perf event array",
                map.name(),
                map.map_type()
            )));
        }
        let pages = data_pages(opts.per_cpu_buffer, sys::page_size());
        let max_entries = map.spec().max_entries;

        let cpus: Vec<u32> = aya::util::online_cpus()
            .map_err(|(path, source)| Error::Syscall { call: path, source })?
            .into_iter()
            .filter(|&cpu| cpu < max_entries)
            .collect();
        if cpus.is_empty() {
            return Err(Error::InvalidSpec(format!(
                "perf event array {} has no slot for any online cpu",
                map.name()
            )));
        }

        let map_fd = map.handle().try_clone_fd()?;
        let data = MapData::from_fd(map.handle().try_clone_fd()?)?;
        let mut array: PerfEventArray<MapData> =
            PerfEventArray::try_from(AyaMap::PerfEventArray(data))?;
        let readiness = Readiness::new()?;

        let mut installed = SlotGuard::new(|cpu| clear_slot(map_fd.as_fd(), cpu));
        let mut rings = Vec::with_capacity(cpus.len());
        for &cpu in &cpus {
            let buf = array
                .open(cpu, Some(pages))
                .map_err(|e| perf_buffer_error(cpu, e))?;
            installed.push(cpu);
            let watched = buf.as_fd().try_clone_to_owned().map_err(|source| Error::Syscall {
                call: "fcntl(F_DUPFD_CLOEXEC)",
                source,
            })?;
            readiness.watch(watched)?;
            rings.push(PerfRing { cpu, buf });
        }
        installed.disarm();
        debug!(
            "perf reader on {} ({} cpus, {} data pages each)",
            map.name(),
            rings.len(),
            pages
        );

        Ok(Self {
            readiness,
            state: Mutex::new(Some(PerfState {
                rings,
                next: 0,
                pending: VecDeque::new(),
                scratch: (0..BATCH).map(|_| BytesMut::new()).collect(),
                sequence: 0,
                map_fd,
            })),
            deadline: Mutex::new(None),
            cpus,
        })
    }

    /// CPUs this reader opened a ring for.
    pub fn cpus(&self) -> &[u32] {
        &self.cpus
    }

    fn try_next(&self) -> Result<Option<Record>> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.as_mut().ok_or(Error::ReaderClosed)?.next_record()
    }
}

impl EventReader for PerfReader {
    fn read_until(&self, deadline: Option<Instant>) -> Result<Record> {
        loop {
            if self.readiness.is_closed() {
                return Err(Error::ReaderClosed);
            }
            if let Some(record) = self.try_next()? {
                return Ok(record);
            }
            self.readiness.wait(deadline)?;
        }
    }

    fn set_deadline(&self, deadline: Option<Instant>) {
        *self.deadline.lock().unwrap_or_else(|e| e.into_inner()) = deadline;
    }

    fn deadline(&self) -> Option<Instant> {
        *self.deadline.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn close(&self) {
        self.readiness.close();
        let Some(state) = self.state.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            return;
        };
        for ring in &state.rings {
            clear_slot(state.map_fd.as_fd(), ring.cpu);
        }
        debug!("perf reader closed ({} rings released)", state.rings.len());
    }
}

impl Drop for PerfReader {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;

    #[test]
    fn test_data_pages_round_to_power_of_two() {
        assert_eq!(data_pages(0, 4096), 1);
        assert_eq!(data_pages(4096, 4096), 1);
        assert_eq!(data_pages(4097, 4096), 2);
        assert_eq!(data_pages(3 * 4096, 4096), 4);
        assert_eq!(data_pages(64 * 1024, 4096), 16);
    }

    #[test]
    fn test_default_options() {
        let opts = PerfReaderOptions::default();
        assert_eq!(opts.per_cpu_buffer, sys::page_size());
    }

    #[test]
    fn test_failed_open_clears_installed_slots() {
        let cleared = RefCell::new(Vec::new());
        {
            let mut guard = SlotGuard::new(|cpu| cleared.borrow_mut().push(cpu));
            guard.push(0);
            guard.push(1);
            // The open for the next cpu fails, so the guard is never disarmed.
        }
        assert_eq!(*cleared.borrow(), vec![0, 1]);
    }

    #[test]
    fn test_disarmed_guard_keeps_slots() {
        let cleared = RefCell::new(Vec::new());
        let mut guard = SlotGuard::new(|cpu| cleared.borrow_mut().push(cpu));
        guard.push(0);
        guard.push(3);
        guard.disarm();
        assert!(cleared.borrow().is_empty());
    }

    #[test]
    fn test_loss_is_queued_before_samples() {
        let mut bufs = vec![
            BytesMut::from(&b"first"[..]),
            BytesMut::from(&b"second"[..]),
            BytesMut::from(&b"unread"[..]),
        ];
        let mut pending = VecDeque::new();
        queue_batch(&mut pending, 2, Events { read: 2, lost: 3 }, &mut bufs);

        let records: Vec<_> = pending.into_iter().collect();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].lost_samples, 3);
        assert!(records[0].raw.is_empty());
        assert_eq!(records[1].raw, Bytes::from_static(b"first"));
        assert_eq!(records[2].raw, Bytes::from_static(b"second"));
        assert!(records.iter().all(|r| r.cpu == Some(2)));
    }

    #[test]
    fn test_batch_without_loss_has_no_loss_record() {
        let mut bufs = vec![BytesMut::from(&b"only"[..])];
        let mut pending = VecDeque::new();
        queue_batch(&mut pending, 0, Events { read: 1, lost: 0 }, &mut bufs);

        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].lost_samples, 0);
        assert_eq!(pending[0].raw, Bytes::from_static(b"only"));
    }
}
