//! A harness for loading raw eBPF programs and maps, running programs
//! synchronously, draining the records they emit, and attaching them to
//! kernel hooks.

pub mod asm;
mod error;
pub mod features;
pub mod handle;
pub mod link;
pub mod maps;
pub mod program;
pub mod programs;
pub mod reader;
pub mod scenario;
pub mod settings;
mod sys;

use log::warn;

pub use crate::error::{Error, Result, is_not_supported};
pub use crate::link::{HookKind, HookSpec, Link};
pub use crate::maps::{Map, MapSpec, MapType, UpdateFlags};
pub use crate::program::{Program, ProgramOptions, ProgramSpec, ProgramType, RunOptions, RunOutput};
pub use crate::reader::{EventReader, PerfReader, PerfReaderOptions, Record, RingBufReader};

/// Lifts `RLIMIT_MEMLOCK`, which kernels before 5.11 charge map memory to.
pub fn bump_memlock_rlimit() {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        warn!("Failed to increase rlimit");
    }
}
