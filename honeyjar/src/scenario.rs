//! End-to-end scenarios that exercise the harness against the running kernel.
//!
//! A scenario either passes, fails with an error, or is skipped when the host
//! lacks a capability it needs.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail, ensure};
use honeyjar_common::{ECHO_MARKER, EchoEvent};
use log::{info, warn};

use crate::error::{self, Error};
use crate::link::{HookSpec, Link};
use crate::maps::{Map, MapSpec};
use crate::program::{MIN_PACKET_INPUT, Program, ProgramOptions};
use crate::programs::{self, EVENTS_MAP, SLOTS_MAP};
use crate::reader::{EventReader, PerfReader, Record, RingBufReader};
use crate::settings::Settings;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Passed,
    Skipped(String),
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Passed => f.write_str("ok"),
            Outcome::Skipped(reason) => write!(f, "skipped ({reason})"),
        }
    }
}

pub trait Scenario: Send + Sync {
    fn name(&self) -> &'static str;
    fn run(&self, settings: &Settings) -> Result<()>;
}

/// Runs `scenario`, turning capability errors into [`Outcome::Skipped`].
pub fn run_scenario(scenario: &dyn Scenario, settings: &Settings) -> Result<Outcome> {
    match scenario.run(settings) {
        Ok(()) => Ok(Outcome::Passed),
        Err(e) if error::is_not_supported(&e) => {
            warn!("{}: {e:#}", scenario.name());
            Ok(Outcome::Skipped(format!("{e:#}")))
        }
        Err(e) => Err(e.context(format!("scenario {} failed", scenario.name()))),
    }
}

pub fn builtin() -> Vec<Box<dyn Scenario>> {
    vec![
        Box::new(ReturnConstant),
        Box::new(MapReturn),
        Box::new(RingBufSilence),
        Box::new(RingBufEcho),
        Box::new(PerfEcho),
        Box::new(CloseUnblocksRead),
        Box::new(RawTracepointAttach),
    ]
}

/// Decodes an [`EchoEvent`] from the front of a record.
pub fn decode_echo(record: &Record) -> Result<EchoEvent> {
    let event: EchoEvent = record.decode().with_context(|| {
        format!(
            "record of {} bytes is too short for an echo event",
            record.raw.len()
        )
    })?;
    ensure!(
        event.marker == ECHO_MARKER,
        "unexpected marker {:#x}",
        event.marker
    );
    Ok(event)
}

fn packet() -> [u8; MIN_PACKET_INPUT] {
    [0u8; MIN_PACKET_INPUT]
}

pub struct ReturnConstant;

impl Scenario for ReturnConstant {
    fn name(&self) -> &'static str {
        "return-constant"
    }

    fn run(&self, settings: &Settings) -> Result<()> {
        let program = Program::new(&programs::return_constant(42)).context("load")?;
        let out = program
            .run(&packet(), &settings.run_options())
            .context("test run")?;
        ensure!(out.return_code == 42, "returned {}", out.return_code);
        ensure!(out.data.len() == MIN_PACKET_INPUT, "output of {} bytes", out.data.len());
        info!("{}: {:?} per run", self.name(), out.duration);
        Ok(())
    }
}

/// Programs see map writes made after they were loaded.
pub struct MapReturn;

impl Scenario for MapReturn {
    fn name(&self) -> &'static str {
        "map-return"
    }

    fn run(&self, settings: &Settings) -> Result<()> {
        let slots = Arc::new(Map::new(&MapSpec::array(SLOTS_MAP, 4, 1)).context("create map")?);
        slots.put_pod(&0u32, &7u32)?;

        let opts = ProgramOptions::default().replace_map(SLOTS_MAP, slots.clone());
        let program = Program::with_options(&programs::map_slot(), &opts).context("load")?;

        let out = program.run(&packet(), &settings.run_options())?;
        ensure!(out.return_code == 7, "returned {}, want 7", out.return_code);

        slots.put_pod(&0u32, &9u32)?;
        let (code, _) = program.test(&packet())?;
        ensure!(code == 9, "returned {code} after update, want 9");
        Ok(())
    }
}

/// A program that never writes to the ring runs while another thread reads
/// it; the read ends through its 200ms deadline instead of a record.
pub struct RingBufSilence;

impl Scenario for RingBufSilence {
    fn name(&self) -> &'static str {
        "ringbuf-silence"
    }

    fn run(&self, settings: &Settings) -> Result<()> {
        let spec = programs::ringbuf_silent_program(settings.ring_size());
        let ring = Arc::new(Map::new(&spec.maps[EVENTS_MAP])?);
        let reader = Arc::new(RingBufReader::new(&ring)?);
        let opts = ProgramOptions::default().replace_map(EVENTS_MAP, ring.clone());
        let program = Program::with_options(&spec, &opts).context("load")?;

        let timeout = Duration::from_millis(200);
        let start = Instant::now();
        reader.set_deadline(Some(start + timeout));
        let pending = {
            let reader = reader.clone();
            std::thread::spawn(move || reader.read())
        };

        let out = program.run(&packet(), &settings.run_options());
        let read = pending.join();
        let out = out.context("test run")?;
        ensure!(out.return_code == 0, "returned {}", out.return_code);

        match read {
            Ok(Err(Error::DeadlineExceeded)) => {}
            Ok(Ok(record)) => bail!("unexpected record {record:?}"),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => bail!("reader thread panicked"),
        }
        ensure!(start.elapsed() >= timeout, "read returned early");
        Ok(())
    }
}

pub struct RingBufEcho;

impl Scenario for RingBufEcho {
    fn name(&self) -> &'static str {
        "ringbuf-echo"
    }

    fn run(&self, settings: &Settings) -> Result<()> {
        let spec = programs::ringbuf_echo_program(settings.ring_size(), 0x1234);
        let ring = Arc::new(Map::new(&spec.maps[EVENTS_MAP])?);
        let reader = RingBufReader::new(&ring)?;
        let opts = ProgramOptions::default().replace_map(EVENTS_MAP, ring.clone());
        let program = Program::with_options(&spec, &opts).context("load")?;

        const RUNS: u64 = 3;
        for _ in 0..RUNS {
            program.test(&packet())?;
        }

        let deadline = Instant::now() + settings.read_timeout();
        for expected in 0..RUNS {
            let record = reader.read_until(Some(deadline))?;
            ensure!(record.sequence == expected, "sequence {}", record.sequence);
            ensure!(record.lost_samples == 0, "ring buffer reported loss");
            let event = decode_echo(&record)?;
            ensure!(event.value == 0x1234, "value {:#x}", event.value);
        }
        match reader.read_until(Some(Instant::now() + Duration::from_millis(50))) {
            Err(Error::DeadlineExceeded) => Ok(()),
            Ok(record) => bail!("ring not drained: extra record {record:?}"),
            Err(e) => Err(e.into()),
        }
    }
}

pub struct PerfEcho;

impl Scenario for PerfEcho {
    fn name(&self) -> &'static str {
        "perf-echo"
    }

    fn run(&self, settings: &Settings) -> Result<()> {
        let spec = programs::perf_echo_program(0xbeef);
        let array = Arc::new(Map::new(&spec.maps[EVENTS_MAP])?);
        let reader = PerfReader::new(&array, &settings.perf_options())?;
        let opts = ProgramOptions::default().replace_map(EVENTS_MAP, array.clone());
        let program = Program::with_options(&spec, &opts).context("load")?;

        program.run(&packet(), &settings.run_options())?;

        let record = reader.read_until(Some(Instant::now() + settings.read_timeout()))?;
        ensure!(record.cpu.is_some(), "perf record without a cpu");
        if record.lost_samples > 0 {
            bail!("lost {} samples", record.lost_samples);
        }
        let event = decode_echo(&record)?;
        ensure!(event.value == 0xbeef, "value {:#x}", event.value);
        Ok(())
    }
}

/// Closing a reader from another thread unblocks a pending read.
pub struct CloseUnblocksRead;

impl Scenario for CloseUnblocksRead {
    fn name(&self) -> &'static str {
        "close-unblocks-read"
    }

    fn run(&self, settings: &Settings) -> Result<()> {
        let ring = Map::new(&MapSpec::ring_buf(EVENTS_MAP, settings.ring_size()))?;
        let reader = Arc::new(RingBufReader::new(&ring)?);

        let blocked = {
            let reader = reader.clone();
            std::thread::spawn(move || reader.read())
        };
        std::thread::sleep(Duration::from_millis(50));
        reader.close();
        reader.close();

        match blocked.join() {
            Ok(Err(Error::ReaderClosed)) => {}
            Ok(other) => bail!("blocked read returned {other:?}"),
            Err(_) => bail!("reader thread panicked"),
        }
        ensure!(
            matches!(reader.read(), Err(Error::ReaderClosed)),
            "read after close did not fail"
        );
        Ok(())
    }
}

pub struct RawTracepointAttach;

impl Scenario for RawTracepointAttach {
    fn name(&self) -> &'static str {
        "raw-tracepoint-attach"
    }

    fn run(&self, _settings: &Settings) -> Result<()> {
        let program = Program::new(&programs::raw_tracepoint_noop()).context("load")?;
        let link = Link::attach(&program, &HookSpec::raw_tracepoint("sched_switch"))?;
        ensure!(!link.is_closed(), "link closed right after attach");
        link.close();
        link.close();
        ensure!(link.is_closed(), "link still open after close");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Unsupported;

    impl Scenario for Unsupported {
        fn name(&self) -> &'static str {
            "unsupported"
        }

        fn run(&self, _settings: &Settings) -> Result<()> {
            Err(anyhow::Error::new(Error::not_supported("widget", "missing")).context("setting up"))
        }
    }

    struct Broken;

    impl Scenario for Broken {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn run(&self, _settings: &Settings) -> Result<()> {
            bail!("boom")
        }
    }

    #[test]
    fn test_unsupported_scenarios_are_skipped() {
        let outcome = run_scenario(&Unsupported, &Settings::default()).unwrap();
        assert!(matches!(outcome, Outcome::Skipped(reason) if reason.contains("widget not supported")));
    }

    #[test]
    fn test_failures_name_the_scenario() {
        let err = run_scenario(&Broken, &Settings::default()).unwrap_err();
        assert_eq!(err.to_string(), "scenario broken failed");
        assert_eq!(err.root_cause().to_string(), "boom");
    }

    #[test]
    fn test_builtin_names_are_unique() {
        let scenarios = builtin();
        let mut names: Vec<_> = scenarios.iter().map(|s| s.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), scenarios.len());
    }

    fn record(raw: Vec<u8>) -> Record {
        Record {
            cpu: Some(0),
            raw: raw.into(),
            lost_samples: 0,
            sequence: 0,
        }
    }

    #[test]
    fn test_decode_echo() {
        let mut raw = ECHO_MARKER.to_ne_bytes().to_vec();
        raw.extend_from_slice(&5u32.to_ne_bytes());
        raw.extend_from_slice(&[0u8; 4]);
        assert_eq!(
            decode_echo(&record(raw.clone())).unwrap(),
            EchoEvent {
                marker: ECHO_MARKER,
                value: 5
            }
        );

        assert!(decode_echo(&record(raw[..7].to_vec())).is_err());
        assert!(decode_echo(&record(vec![0u8; 8])).is_err());
    }
}
