//! Host capability checks. Each check runs once per process.

use std::fmt;

use log::debug;
use once_cell::sync::OnceCell;

use crate::maps::{Map, MapSpec};
use crate::program::have_prog_test_run;
use crate::sys;

static HAVE_RING_BUFFER: OnceCell<bool> = OnceCell::new();
static HAVE_PERF_EVENT_ARRAY: OnceCell<bool> = OnceCell::new();

fn can_create(cell: &OnceCell<bool>, spec: MapSpec) -> bool {
    *cell.get_or_init(|| {
        let result = Map::new(&spec);
        if let Err(e) = &result {
            debug!("{} map unavailable: {e}", spec.map_type);
        }
        result.is_ok()
    })
}

/// Whether ring buffer maps can be created (Linux 5.8+ and privileges).
pub fn have_ring_buffer() -> bool {
    can_create(
        &HAVE_RING_BUFFER,
        MapSpec::ring_buf("check_ringbuf", sys::page_size() as u32),
    )
}

pub fn have_perf_event_array() -> bool {
    can_create(
        &HAVE_PERF_EVENT_ARRAY,
        MapSpec::perf_event_array("check_perf"),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Features {
    pub prog_test_run: bool,
    pub ring_buffer: bool,
    pub perf_event_array: bool,
}

impl Features {
    pub fn detect() -> Self {
        Self {
            prog_test_run: have_prog_test_run(),
            ring_buffer: have_ring_buffer(),
            perf_event_array: have_perf_event_array(),
        }
    }
}

impl fmt::Display for Features {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mark = |yes: bool| if yes { "yes" } else { "no" };
        writeln!(f, "prog_test_run     {}", mark(self.prog_test_run))?;
        writeln!(f, "ring_buffer       {}", mark(self.ring_buffer))?;
        write!(f, "perf_event_array  {}", mark(self.perf_event_array))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detection_is_stable() {
        let first = Features::detect();
        assert_eq!(Features::detect(), first);
    }

    #[test]
    fn test_display_lists_every_feature() {
        let features = Features {
            prog_test_run: true,
            ring_buffer: false,
            perf_event_array: true,
        };
        let text = features.to_string();
        assert!(text.contains("prog_test_run     yes"));
        assert!(text.contains("ring_buffer       no"));
        assert_eq!(text.lines().count(), 3);
    }
}
