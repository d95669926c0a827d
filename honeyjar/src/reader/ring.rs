use std::sync::Mutex;
use std::time::Instant;

use aya::maps::{Map as AyaMap, MapData, RingBuf};
use bytes::Bytes;
use log::debug;

use super::readiness::Readiness;
use super::{EventReader, Record};
use crate::error::{Error, Result};
use crate::maps::{Map, MapType};

struct RingState {
    ring: RingBuf<MapData>,
    sequence: u64,
}

impl RingState {
    fn next_record(&mut self) -> Option<Record> {
        let raw = {
            let item = self.ring.next()?;
            Bytes::copy_from_slice(&item)
        };
        let sequence = self.sequence;
        self.sequence += 1;
        Some(Record {
            cpu: None,
            raw,
            lost_samples: 0,
            sequence,
        })
    }
}

/// Reader for ring buffer maps.
pub struct RingBufReader {
    readiness: Readiness,
    state: Mutex<Option<RingState>>,
    deadline: Mutex<Option<Instant>>,
    size: usize,
}

impl RingBufReader {
    pub fn new(map: &Map) -> Result<Self> {
        if map.map_type() != MapType::RingBuf {
            return Err(Error::InvalidInput(format!(
                "map {} is a {} map, not a ring buffer",
                map.name(),
                map.map_type()
            )));
        }
        let data = MapData::from_fd(map.handle().try_clone_fd()?)?;
        let ring: RingBuf<MapData> = RingBuf::try_from(AyaMap::RingBuf(data))?;

        let readiness = Readiness::new()?;
        readiness.watch(map.handle().try_clone_fd()?)?;
        let size = map.spec().max_entries as usize;
        debug!("ring buffer reader on {} ({size} data bytes)", map.name());

        Ok(Self {
            readiness,
            state: Mutex::new(Some(RingState { ring, sequence: 0 })),
            deadline: Mutex::new(None),
            size,
        })
    }

    /// Size of the ring's data area in bytes.
    pub fn buffer_size(&self) -> usize {
        self.size
    }

    /// Takes the next committed record without waiting.
    fn try_next(&self) -> Result<Option<Record>> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let ring = state.as_mut().ok_or(Error::ReaderClosed)?;
        Ok(ring.next_record())
    }
}

impl EventReader for RingBufReader {
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
        let released = self.state.lock().unwrap_or_else(|e| e.into_inner()).take();
        if released.is_some() {
            debug!("ring buffer reader closed");
        }
    }
}

impl Drop for RingBufReader {
    fn drop(&mut self) {
        self.close();
    }
}
