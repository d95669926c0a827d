//! Attaching loaded programs to kernel hook points.

use std::ffi::CString;
use std::fmt;
use std::fs;
use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::{debug, info};

use crate::error::{Error, Result};
use crate::handle::Handle;
use crate::program::{Program, ProgramType};
use crate::sys::{self, PerfEventAttr};

const TRACEFS_MOUNT_POINTS: [&str; 2] = ["/sys/kernel/tracing", "/sys/kernel/debug/tracing"];
const KPROBE_PMU: &str = "/sys/bus/event_source/devices/kprobe";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    RawTracepoint,
    Tracepoint,
    Kprobe,
    Kretprobe,
}

impl HookKind {
    /// Program type a hook of this kind accepts.
    pub fn program_type(self) -> ProgramType {
        match self {
            HookKind::RawTracepoint => ProgramType::RawTracepoint,
            HookKind::Tracepoint => ProgramType::Tracepoint,
            HookKind::Kprobe | HookKind::Kretprobe => ProgramType::Kprobe,
        }
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HookKind::RawTracepoint => "raw_tracepoint",
            HookKind::Tracepoint => "tracepoint",
            HookKind::Kprobe => "kprobe",
            HookKind::Kretprobe => "kretprobe",
        })
    }
}

impl FromStr for HookKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "raw_tracepoint" | "raw_tp" => Ok(HookKind::RawTracepoint),
            "tracepoint" | "tp" => Ok(HookKind::Tracepoint),
            "kprobe" => Ok(HookKind::Kprobe),
            "kretprobe" => Ok(HookKind::Kretprobe),
            other => Err(Error::InvalidInput(format!("unknown hook kind {other:?}"))),
        }
    }
}

/// A hook point: the kind plus its target. Tracepoint targets are
/// `category:name`; the others are a single name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HookSpec {
    pub kind: HookKind,
    pub target: String,
}

impl HookSpec {
    pub fn raw_tracepoint(name: impl Into<String>) -> Self {
        Self {
            kind: HookKind::RawTracepoint,
            target: name.into(),
        }
    }

    pub fn tracepoint(category: &str, name: &str) -> Self {
        Self {
            kind: HookKind::Tracepoint,
            target: format!("{category}:{name}"),
        }
    }

    pub fn kprobe(symbol: impl Into<String>) -> Self {
        Self {
            kind: HookKind::Kprobe,
            target: symbol.into(),
        }
    }

    pub fn kretprobe(symbol: impl Into<String>) -> Self {
        Self {
            kind: HookKind::Kretprobe,
            target: symbol.into(),
        }
    }

    fn tracepoint_parts(&self) -> Result<(&str, &str)> {
        match self.target.split_once(':') {
            Some((category, name)) if !category.is_empty() && !name.is_empty() => {
                Ok((category, name))
            }
            _ => Err(Error::InvalidInput(format!(
                "tracepoint target {:?} is not category:name",
                self.target
            ))),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.target.is_empty() {
            return Err(Error::InvalidInput(format!("{} hook without a target", self.kind)));
        }
        if self.target.contains('\0') {
            return Err(Error::InvalidInput("hook target contains a NUL byte".to_string()));
        }
        if self.kind == HookKind::Tracepoint {
            self.tracepoint_parts()?;
        }
        Ok(())
    }
}

impl fmt::Display for HookSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.target)
    }
}

impl FromStr for HookSpec {
    type Err = Error;

    /// Parses `kind:target`, e.g. `tracepoint:sched:sched_switch`.
    fn from_str(s: &str) -> Result<Self> {
        let (kind, target) = s
            .split_once(':')
            .ok_or_else(|| Error::InvalidInput(format!("hook {s:?} is not kind:target")))?;
        let spec = HookSpec {
            kind: kind.parse()?,
            target: target.to_string(),
        };
        spec.validate()?;
        Ok(spec)
    }
}

fn check_program_type(hook: &HookSpec, program_type: ProgramType) -> Result<()> {
    let want = hook.kind.program_type();
    if program_type != want {
        return Err(Error::InvalidInput(format!(
            "{hook} needs a {want} program, got {program_type}"
        )));
    }
    Ok(())
}

fn tracefs_event_dir(category: &str, name: &str) -> Option<PathBuf> {
    TRACEFS_MOUNT_POINTS
        .iter()
        .map(|base| Path::new(base).join("events").join(category).join(name))
        .find(|dir| dir.exists())
}

/// Reads the bit index out of a PMU format file such as `config:0`.
fn parse_format_bit(contents: &str) -> Option<u32> {
    contents.trim().strip_prefix("config:")?.parse().ok()
}

fn attach_error(call: &'static str, hook: &HookSpec, source: io::Error) -> Error {
    match source.raw_os_error() {
        Some(libc::ENOENT) | Some(libc::ENODEV) | Some(libc::EINVAL) => {
            Error::not_supported(hook.to_string(), "hook point not found")
        }
        Some(libc::EACCES) => Error::not_supported(hook.to_string(), "insufficient privilege"),
        _ => Error::from_errno(call, hook.to_string(), source),
    }
}

/// An attached program. Detaches on close or drop.
#[derive(Debug)]
pub struct Link {
    hook: HookSpec,
    handle: Handle,
}

impl Link {
    pub fn attach(program: &Program, hook: &HookSpec) -> Result<Self> {
        hook.validate()?;
        check_program_type(hook, program.program_type())?;

        let fd = match hook.kind {
            HookKind::RawTracepoint => attach_raw_tracepoint(program, hook)?,
            HookKind::Tracepoint => attach_tracepoint(program, hook)?,
            HookKind::Kprobe | HookKind::Kretprobe => attach_kprobe(program, hook)?,
        };
        info!("attached {} to {hook}", program.name());

        Ok(Self {
            hook: hook.clone(),
            handle: Handle::new("link", fd),
        })
    }

    pub fn hook(&self) -> &HookSpec {
        &self.hook
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    /// Stops a perf-event based link from firing before its descriptor goes.
    fn disable(&self) -> Result<()> {
        self.handle.with_fd(|fd| {
            sys::perf_event_ioctl(fd, sys::PERF_EVENT_IOC_DISABLE, 0).map_err(|source| {
                Error::Syscall {
                    call: "ioctl(PERF_EVENT_IOC_DISABLE)",
                    source,
                }
            })
        })
    }

    /// Detaches the program. Idempotent.
    pub fn close(&self) {
        if self.hook.kind != HookKind::RawTracepoint {
            match self.disable() {
                Ok(()) | Err(Error::Closed(_)) => {}
                Err(Error::Syscall { call, source }) => debug!("{}: {call}: {source}", self.hook),
                Err(e) => debug!("{}: {e}", self.hook),
            }
        }
        if !self.handle.is_closed() {
            debug!("detaching from {}", self.hook);
        }
        self.handle.close();
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.close();
    }
}

fn attach_raw_tracepoint(program: &Program, hook: &HookSpec) -> Result<OwnedFd> {
    let name = CString::new(hook.target.as_str())
        .map_err(|_| Error::InvalidInput("hook target contains a NUL byte".to_string()))?;
    program.handle().with_fd(|prog| {
        sys::bpf_raw_tracepoint_open(&name, prog)
            .map_err(|e| attach_error("bpf(BPF_RAW_TRACEPOINT_OPEN)", hook, e))
    })
}

fn attach_tracepoint(program: &Program, hook: &HookSpec) -> Result<OwnedFd> {
    let (category, name) = hook.tracepoint_parts()?;
    let dir = tracefs_event_dir(category, name)
        .ok_or_else(|| Error::not_supported(hook.to_string(), "tracepoint not found in tracefs"))?;
    let id: u64 = fs::read_to_string(dir.join("id"))
        .map_err(|e| attach_error("read tracepoint id", hook, e))?
        .trim()
        .parse()
        .map_err(|_| Error::InvalidInput(format!("malformed id for {hook}")))?;

    let mut attr = PerfEventAttr::new(sys::PERF_TYPE_TRACEPOINT, id);
    attr.sample_period = 1;
    attr.wakeup_events = 1;
    open_and_attach(program, hook, &mut attr)
}

fn attach_kprobe(program: &Program, hook: &HookSpec) -> Result<OwnedFd> {
    let pmu = Path::new(KPROBE_PMU);
    let pmu_type: u32 = fs::read_to_string(pmu.join("type"))
        .map_err(|_| Error::not_supported(hook.to_string(), "kernel lacks the kprobe PMU"))?
        .trim()
        .parse()
        .map_err(|_| Error::InvalidInput("malformed kprobe PMU type".to_string()))?;

    let mut config = 0;
    if hook.kind == HookKind::Kretprobe {
        let bit = fs::read_to_string(pmu.join("format/retprobe"))
            .ok()
            .as_deref()
            .and_then(parse_format_bit)
            .ok_or_else(|| Error::not_supported(hook.to_string(), "kprobe PMU lacks retprobe"))?;
        config |= 1u64 << bit;
    }

    let symbol = CString::new(hook.target.as_str())
        .map_err(|_| Error::InvalidInput("hook target contains a NUL byte".to_string()))?;
    let mut attr = PerfEventAttr::new(pmu_type, config);
    // config1 carries the symbol; it must outlive perf_event_open.
    attr.config1 = symbol.as_ptr() as u64;
    attr.config2 = 0;
    attr.sample_period = 1;
    attr.wakeup_events = 1;
    open_and_attach(program, hook, &mut attr)
}

fn open_and_attach(program: &Program, hook: &HookSpec, attr: &mut PerfEventAttr) -> Result<OwnedFd> {
    let event = sys::perf_event_open(attr, -1, 0).map_err(|e| attach_error("perf_event_open", hook, e))?;
    program.handle().with_fd(|prog| {
        sys::perf_event_ioctl(event.as_fd(), sys::PERF_EVENT_IOC_SET_BPF, prog.as_raw_fd())
            .map_err(|e| attach_error("ioctl(PERF_EVENT_IOC_SET_BPF)", hook, e))
    })?;
    sys::perf_event_ioctl(event.as_fd(), sys::PERF_EVENT_IOC_ENABLE, 0)
        .map_err(|e| attach_error("ioctl(PERF_EVENT_IOC_ENABLE)", hook, e))?;
    Ok(event)
}

#[cfg(test)]
mod tests {
    use std::fs::File;

    use super::*;

    fn dev_null_link(hook: HookSpec) -> Link {
        let fd = OwnedFd::from(File::open("/dev/null").unwrap());
        Link {
            hook,
            handle: Handle::new("link", fd),
        }
    }

    #[test]
    fn test_failed_disable_still_closes() {
        let link = dev_null_link(HookSpec::tracepoint("sched", "sched_switch"));
        // /dev/null is not a perf event.
        assert!(matches!(
            link.disable(),
            Err(Error::Syscall { call: "ioctl(PERF_EVENT_IOC_DISABLE)", .. })
        ));

        link.close();
        assert!(link.is_closed());
        assert!(matches!(link.disable(), Err(Error::Closed("link"))));
        link.close();
        assert!(link.is_closed());
    }

    #[test]
    fn test_parse_hook_specs() {
        let raw: HookSpec = "raw_tracepoint:sched_switch".parse().unwrap();
        assert_eq!(raw, HookSpec::raw_tracepoint("sched_switch"));

        let tp: HookSpec = "tracepoint:sched:sched_switch".parse().unwrap();
        assert_eq!(tp, HookSpec::tracepoint("sched", "sched_switch"));
        assert_eq!(tp.tracepoint_parts().unwrap(), ("sched", "sched_switch"));

        let kp: HookSpec = "kprobe:do_sys_openat2".parse().unwrap();
        assert_eq!(kp.kind, HookKind::Kprobe);
        let krp: HookSpec = "kretprobe:do_sys_openat2".parse().unwrap();
        assert_eq!(krp, HookSpec::kretprobe("do_sys_openat2"));

        assert_eq!("raw_tp:sys_enter".parse::<HookSpec>().unwrap().kind, HookKind::RawTracepoint);
    }

    #[test]
    fn test_display_matches_parse() {
        let spec = HookSpec::tracepoint("syscalls", "sys_enter_openat");
        assert_eq!(spec.to_string(), "tracepoint:syscalls:sys_enter_openat");
        assert_eq!(spec.to_string().parse::<HookSpec>().unwrap(), spec);
    }

    #[test]
    fn test_reject_malformed_hooks() {
        for bad in [
            "sched_switch",
            "uprobe:foo",
            "kprobe:",
            "tracepoint:sched_switch",
            "tracepoint::sched_switch",
            "tracepoint:sched:",
        ] {
            assert!(
                matches!(bad.parse::<HookSpec>(), Err(Error::InvalidInput(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_program_type_must_match_hook() {
        let hook = HookSpec::kretprobe("vfs_read");
        assert!(check_program_type(&hook, ProgramType::Kprobe).is_ok());
        assert!(matches!(
            check_program_type(&hook, ProgramType::Tracepoint),
            Err(Error::InvalidInput(_))
        ));
        assert!(check_program_type(&HookSpec::raw_tracepoint("sys_enter"), ProgramType::RawTracepoint).is_ok());
        assert!(check_program_type(&HookSpec::raw_tracepoint("sys_enter"), ProgramType::SocketFilter).is_err());
    }

    #[test]
    fn test_parse_format_bit() {
        assert_eq!(parse_format_bit("config:0\n"), Some(0));
        assert_eq!(parse_format_bit("config:63"), Some(63));
        assert_eq!(parse_format_bit("config1:0-63"), None);
    }

    #[test]
    fn test_missing_tracepoint_has_no_event_dir() {
        assert!(tracefs_event_dir("no_such_category", "no_such_event").is_none());
    }
}
