//! Loading programs and running them through `BPF_PROG_TEST_RUN`.

use std::collections::{BTreeMap, HashMap};
use std::ffi::CString;
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use once_cell::sync::OnceCell;

use crate::asm::{self, Instruction};
use crate::error::{ENOTSUPP, Error, Result};
use crate::handle::Handle;
use crate::maps::{Map, MapSpec};
use crate::sys;

/// Shortest input accepted by packet-shaped programs: one Ethernet header.
pub const MIN_PACKET_INPUT: usize = 14;

/// Extra room given to programs that grow their packet during a test run.
const TEST_RUN_OUTPUT_PAD: usize = 256 + 2;

/// Raw tracepoint programs see at most this many u64 arguments.
pub const MAX_RAW_TRACEPOINT_ARGS: usize = 12;

/// License strings the kernel accepts as GPL-compatible.
const GPL_COMPATIBLE_LICENSES: [&str; 6] = [
    "GPL",
    "GPL v2",
    "GPL and additional rights",
    "Dual BSD/GPL",
    "Dual MIT/GPL",
    "Dual MPL/GPL",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ProgramType {
    SocketFilter = 1,
    Kprobe = 2,
    SchedCls = 3,
    SchedAct = 4,
    Tracepoint = 5,
    Xdp = 6,
    CgroupSkb = 8,
    RawTracepoint = 17,
}

impl ProgramType {
    /// Whether test runs feed the input to the program as a packet.
    pub fn takes_packet_input(self) -> bool {
        matches!(
            self,
            ProgramType::SocketFilter
                | ProgramType::SchedCls
                | ProgramType::SchedAct
                | ProgramType::Xdp
                | ProgramType::CgroupSkb
        )
    }
}

impl fmt::Display for ProgramType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProgramType::SocketFilter => "socket_filter",
            ProgramType::Kprobe => "kprobe",
            ProgramType::SchedCls => "sched_cls",
            ProgramType::SchedAct => "sched_act",
            ProgramType::Tracepoint => "tracepoint",
            ProgramType::Xdp => "xdp",
            ProgramType::CgroupSkb => "cgroup_skb",
            ProgramType::RawTracepoint => "raw_tracepoint",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct ProgramSpec {
    pub name: String,
    pub program_type: ProgramType,
    pub instructions: Vec<Instruction>,
    pub license: String,
    /// Maps the instructions reference by name.
    pub maps: BTreeMap<String, MapSpec>,
}

impl ProgramSpec {
    pub fn new(
        name: impl Into<String>,
        program_type: ProgramType,
        instructions: Vec<Instruction>,
    ) -> Self {
        Self {
            name: name.into(),
            program_type,
            instructions,
            license: "MIT".to_string(),
            maps: BTreeMap::new(),
        }
    }

    pub fn with_license(mut self, license: impl Into<String>) -> Self {
        self.license = license.into();
        self
    }

    pub fn with_map(mut self, spec: MapSpec) -> Self {
        self.maps.insert(spec.name.clone(), spec);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProgramOptions {
    /// Existing maps to use instead of creating the declared ones.
    pub map_replacements: HashMap<String, Arc<Map>>,
    /// Verifier log level; the log is attached to load errors when non-zero.
    pub log_level: u32,
    pub log_size: usize,
}

impl ProgramOptions {
    pub fn replace_map(mut self, name: impl Into<String>, map: Arc<Map>) -> Self {
        self.map_replacements.insert(name.into(), map);
        self
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub repeat: u32,
    /// Run on this CPU instead of the caller's.
    pub cpu: Option<u32>,
    /// Program context, e.g. a `struct __sk_buff`.
    pub context: Option<Vec<u8>>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            repeat: 1,
            cpu: None,
            context: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutput {
    pub return_code: u32,
    pub data: Vec<u8>,
    pub context: Option<Vec<u8>>,
    /// Mean duration of one run, as measured by the kernel.
    pub duration: Duration,
}

#[derive(Debug)]
pub struct Program {
    name: String,
    program_type: ProgramType,
    handle: Handle,
    maps: BTreeMap<String, Arc<Map>>,
}

impl Program {
    pub fn new(spec: &ProgramSpec) -> Result<Self> {
        Self::with_options(spec, &ProgramOptions::default())
    }

    pub fn with_options(spec: &ProgramSpec, opts: &ProgramOptions) -> Result<Self> {
        check_license(spec)?;
        check_replacements(
            spec,
            opts.map_replacements
                .iter()
                .map(|(name, map)| (name.as_str(), map.spec())),
        )?;

        // Maps created here are dropped, and so closed, if any later step fails.
        let mut maps = BTreeMap::new();
        for name in asm::map_references(&spec.instructions) {
            let map_spec = spec.maps.get(name).ok_or_else(|| {
                Error::InvalidSpec(format!("program {} references undeclared map {name}", spec.name))
            })?;
            let map = match opts.map_replacements.get(name) {
                Some(replacement) => {
                    debug!("program {}: using replacement for map {name}", spec.name);
                    replacement.clone()
                }
                None => Arc::new(Map::new(map_spec)?),
            };
            maps.insert(name.to_string(), map);
        }

        // Descriptors stay valid while `maps` is alive, which outlives the load.
        let insns = asm::encode(&spec.instructions, |name| {
            maps.get(name)
                .ok_or_else(|| Error::InvalidSpec(format!("unresolved map {name}")))?
                .fd()
        })?;
        let license = CString::new(spec.license.as_str())
            .map_err(|_| Error::InvalidSpec("license contains a NUL byte".to_string()))?;
        let mut log = vec![0u8; if opts.log_level > 0 { opts.log_size.max(4096) } else { 0 }];

        let mut attr = sys::ProgLoadAttr {
            prog_type: spec.program_type as u32,
            insn_cnt: insns.len() as u32,
            insns: insns.as_ptr() as u64,
            license: license.as_ptr() as u64,
            log_level: opts.log_level,
            log_size: log.len() as u32,
            log_buf: if log.is_empty() { 0 } else { log.as_mut_ptr() as u64 },
            prog_name: sys::object_name(&spec.name),
            ..Default::default()
        };
        let fd = sys::bpf_prog_load(&mut attr).map_err(|source| {
            let what = format!("{} program {}", spec.program_type, spec.name);
            match source.raw_os_error() {
                Some(libc::EPERM) | Some(libc::ENOSYS) | Some(libc::EOPNOTSUPP) | Some(ENOTSUPP) => {
                    Error::from_errno("bpf(BPF_PROG_LOAD)", what, source)
                }
                _ => Error::Verifier {
                    name: spec.name.clone(),
                    source,
                    log: verifier_log(&log),
                },
            }
        })?;
        info!(
            "loaded {} program {} ({} instructions, {} maps)",
            spec.program_type,
            spec.name,
            insns.len(),
            maps.len()
        );

        Ok(Self {
            name: spec.name.clone(),
            program_type: spec.program_type,
            handle: Handle::new("program", fd),
            maps,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn program_type(&self) -> ProgramType {
        self.program_type
    }

    pub fn fd(&self) -> Result<RawFd> {
        self.handle.raw_fd()
    }

    pub(crate) fn handle(&self) -> &Handle {
        &self.handle
    }

    /// A map the program references, whether created for it or replaced.
    pub fn map(&self, name: &str) -> Option<&Arc<Map>> {
        self.maps.get(name)
    }

    /// Runs the program once against `input`.
    pub fn test(&self, input: &[u8]) -> Result<(u32, Vec<u8>)> {
        let out = self.run(input, &RunOptions::default())?;
        Ok((out.return_code, out.data))
    }

    /// Runs the program `repeat` times and reports the mean duration.
    pub fn benchmark(&self, input: &[u8], repeat: u32) -> Result<(u32, Duration)> {
        let opts = RunOptions {
            repeat,
            ..Default::default()
        };
        let out = self.run(input, &opts)?;
        Ok((out.return_code, out.duration))
    }

    /// Runs the program through `BPF_PROG_TEST_RUN`.
    ///
    /// Raw tracepoint programs get `opts.context`, or `input` when it is
    /// unset, as their argument array. They produce no data, run once and
    /// report no duration.
    pub fn run(&self, input: &[u8], opts: &RunOptions) -> Result<RunOutput> {
        check_input(self.program_type, input)?;
        if self.program_type == ProgramType::RawTracepoint {
            return self.run_raw_tracepoint(input, opts);
        }

        let mut data_out = vec![0u8; input.len() + TEST_RUN_OUTPUT_PAD];
        let mut ctx_out = opts.context.as_ref().map(|ctx| vec![0u8; ctx.len()]);

        let mut attr = sys::TestRunAttr {
            data_size_in: input.len() as u32,
            data_size_out: data_out.len() as u32,
            data_in: input.as_ptr() as u64,
            data_out: data_out.as_mut_ptr() as u64,
            repeat: opts.repeat,
            ..Default::default()
        };
        if let (Some(ctx), Some(out)) = (opts.context.as_ref(), ctx_out.as_mut()) {
            attr.ctx_size_in = ctx.len() as u32;
            attr.ctx_in = ctx.as_ptr() as u64;
            attr.ctx_size_out = out.len() as u32;
            attr.ctx_out = out.as_mut_ptr() as u64;
        }
        if let Some(cpu) = opts.cpu {
            attr.flags |= sys::BPF_F_TEST_RUN_ON_CPU;
            attr.cpu = cpu;
        }

        self.test_run(&mut attr)?;

        data_out.truncate(attr.data_size_out as usize);
        if let Some(out) = ctx_out.as_mut() {
            out.truncate(attr.ctx_size_out as usize);
        }
        Ok(RunOutput {
            return_code: attr.retval,
            data: data_out,
            context: ctx_out,
            duration: Duration::from_nanos(attr.duration.into()),
        })
    }

    fn run_raw_tracepoint(&self, input: &[u8], opts: &RunOptions) -> Result<RunOutput> {
        let args = opts.context.as_deref().unwrap_or(input);
        check_input(ProgramType::RawTracepoint, args)?;

        let mut attr = raw_tracepoint_attr(args, opts.cpu);
        self.test_run(&mut attr)?;
        Ok(RunOutput {
            return_code: attr.retval,
            data: Vec::new(),
            context: None,
            duration: Duration::ZERO,
        })
    }

    fn test_run(&self, attr: &mut sys::TestRunAttr) -> Result<()> {
        self.handle.with_fd(|fd| {
            attr.prog_fd = fd.as_raw_fd() as u32;
            sys::bpf_prog_test_run(attr).map_err(|e| self.test_run_error(e))
        })
    }

    fn test_run_error(&self, source: io::Error) -> Error {
        let what = format!("test run of {} program {}", self.program_type, self.name);
        match source.raw_os_error() {
            Some(libc::EINVAL) if !have_prog_test_run() => {
                Error::not_supported(what, "kernel lacks BPF_PROG_TEST_RUN")
            }
            _ => Error::from_errno("bpf(BPF_PROG_TEST_RUN)", what, source),
        }
    }

    pub fn close(&self) {
        self.handle.close();
    }
}

/// Attributes for a raw tracepoint test run: only the argument array, with
/// every data and repeat field left zero.
fn raw_tracepoint_attr(args: &[u8], cpu: Option<u32>) -> sys::TestRunAttr {
    let mut attr = sys::TestRunAttr {
        ctx_size_in: args.len() as u32,
        ctx_in: if args.is_empty() { 0 } else { args.as_ptr() as u64 },
        ..Default::default()
    };
    if let Some(cpu) = cpu {
        attr.flags |= sys::BPF_F_TEST_RUN_ON_CPU;
        attr.cpu = cpu;
    }
    attr
}

pub fn is_gpl_compatible(license: &str) -> bool {
    GPL_COMPATIBLE_LICENSES.contains(&license)
}

/// Rejects specs that call GPL-only helpers without a GPL-compatible license.
fn check_license(spec: &ProgramSpec) -> Result<()> {
    if is_gpl_compatible(&spec.license) {
        return Ok(());
    }
    match spec
        .instructions
        .iter()
        .find_map(|insn| insn.helper().filter(|h| h.is_gpl_only()))
    {
        Some(helper) => Err(Error::InvalidSpec(format!(
            "program {} calls GPL-only helper {helper:?} under license {:?}",
            spec.name, spec.license
        ))),
        None => Ok(()),
    }
}

/// Checks each replacement against the map declared under its name, whether
/// or not the instructions use it.
fn check_replacements<'a>(
    spec: &ProgramSpec,
    replacements: impl IntoIterator<Item = (&'a str, &'a MapSpec)>,
) -> Result<()> {
    for (name, replacement) in replacements {
        let declared = spec.maps.get(name).ok_or_else(|| {
            Error::InvalidSpec(format!(
                "replacement for map {name}, which program {} does not declare",
                spec.name
            ))
        })?;
        declared.resolved()?.check_compatible(replacement)?;
    }
    Ok(())
}

/// Rejects inputs the kernel would refuse for this program type.
pub fn check_input(program_type: ProgramType, input: &[u8]) -> Result<()> {
    if program_type.takes_packet_input() && input.len() < MIN_PACKET_INPUT {
        return Err(Error::InvalidInput(format!(
            "{program_type} programs need at least {MIN_PACKET_INPUT} bytes of input, got {}",
            input.len()
        )));
    }
    if program_type == ProgramType::RawTracepoint
        && input.len() > MAX_RAW_TRACEPOINT_ARGS * size_of::<u64>()
    {
        return Err(Error::InvalidInput(format!(
            "raw tracepoint programs take at most {MAX_RAW_TRACEPOINT_ARGS} arguments, got {} bytes",
            input.len()
        )));
    }
    if u32::try_from(input.len()).is_err() {
        return Err(Error::InvalidInput(format!(
            "input of {} bytes is too large",
            input.len()
        )));
    }
    Ok(())
}

fn verifier_log(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).trim_end().to_string()
}

static HAVE_PROG_TEST_RUN: OnceCell<bool> = OnceCell::new();

/// Whether the kernel can run programs synchronously. Checked once by running
/// a trivial socket filter.
pub fn have_prog_test_run() -> bool {
    *HAVE_PROG_TEST_RUN.get_or_init(|| {
        let spec = ProgramSpec::new("check_test_run", ProgramType::SocketFilter, asm::return_imm(0));
        let supported = Program::new(&spec).is_ok_and(|prog| {
            let input = [0u8; MIN_PACKET_INPUT];
            let mut data_out = [0u8; MIN_PACKET_INPUT + TEST_RUN_OUTPUT_PAD];
            prog.handle
                .with_fd(|fd| {
                    let mut attr = sys::TestRunAttr {
                        prog_fd: fd.as_raw_fd() as u32,
                        data_size_in: input.len() as u32,
                        data_size_out: data_out.len() as u32,
                        data_in: input.as_ptr() as u64,
                        data_out: data_out.as_mut_ptr() as u64,
                        repeat: 1,
                        ..Default::default()
                    };
                    sys::bpf_prog_test_run(&mut attr).map_err(|source| Error::Syscall {
                        call: "bpf(BPF_PROG_TEST_RUN)",
                        source,
                    })
                })
                .is_ok()
        });
        debug!("BPF_PROG_TEST_RUN supported: {supported}");
        supported
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_programs_need_ethernet_header() {
        let short = [0u8; MIN_PACKET_INPUT - 1];
        let exact = [0u8; MIN_PACKET_INPUT];

        assert!(matches!(
            check_input(ProgramType::SocketFilter, &short),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            check_input(ProgramType::Xdp, &[]),
            Err(Error::InvalidInput(_))
        ));
        assert!(check_input(ProgramType::SocketFilter, &exact).is_ok());
        assert!(check_input(ProgramType::SchedCls, &exact).is_ok());
    }

    #[test]
    fn test_non_packet_programs_accept_short_input() {
        assert!(check_input(ProgramType::RawTracepoint, &[]).is_ok());
        assert!(check_input(ProgramType::Kprobe, &[0u8; 4]).is_ok());
    }

    #[test]
    fn test_default_run_options() {
        let opts = RunOptions::default();
        assert_eq!(opts.repeat, 1);
        assert!(opts.cpu.is_none());
        assert!(opts.context.is_none());
    }

    #[test]
    fn test_spec_builder() {
        let spec = ProgramSpec::new("ret", ProgramType::SocketFilter, asm::return_imm(1))
            .with_license("GPL")
            .with_map(MapSpec::array("slots", 4, 1));
        assert_eq!(spec.license, "GPL");
        assert!(spec.maps.contains_key("slots"));
    }

    #[test]
    fn test_unknown_replacement_is_rejected_before_loading() {
        let spec = ProgramSpec::new("ret", ProgramType::SocketFilter, asm::return_imm(1))
            .with_map(MapSpec::array("slots", 4, 1));
        let slots = MapSpec::array("slots", 4, 1);
        let missing = MapSpec::array("missing", 4, 1);
        assert!(check_replacements(&spec, [("slots", &slots)]).is_ok());
        assert!(matches!(
            check_replacements(&spec, [("slots", &slots), ("missing", &missing)]),
            Err(Error::InvalidSpec(_))
        ));
    }

    #[test]
    fn test_replacement_for_unreferenced_map_is_still_checked() {
        // Declared but never loaded by the instructions.
        let spec = ProgramSpec::new("ret", ProgramType::SocketFilter, asm::return_imm(1))
            .with_map(MapSpec::array("slots", 4, 1));
        assert!(asm::map_references(&spec.instructions).is_empty());

        let wrong = MapSpec::hash("slots", 8, 8, 16);
        assert!(matches!(
            check_replacements(&spec, [("slots", &wrong)]),
            Err(Error::Incompatible { ref name, .. }) if name == "slots"
        ));
    }

    #[test]
    fn test_gpl_only_helpers_need_gpl_license() {
        let insns = vec![
            Instruction::call(asm::Helper::PerfEventOutput),
            Instruction::mov64_imm(asm::Register::R0, 0),
            Instruction::exit(),
        ];
        let spec = ProgramSpec::new("out", ProgramType::SocketFilter, insns);
        assert!(matches!(check_license(&spec), Err(Error::InvalidSpec(_))));
        assert!(check_license(&spec.clone().with_license("Dual MIT/GPL")).is_ok());
        assert!(check_license(&spec.with_license("GPL")).is_ok());

        let plain = ProgramSpec::new("ret", ProgramType::SocketFilter, asm::return_imm(0));
        assert!(check_license(&plain).is_ok());
        assert!(!is_gpl_compatible("MIT"));
        assert!(!is_gpl_compatible("gpl"));
    }

    #[test]
    fn test_raw_tracepoint_runs_pass_only_arguments() {
        let args = [0u8; 16];
        let attr = raw_tracepoint_attr(&args, None);
        assert_eq!(attr.ctx_size_in, 16);
        assert_eq!(attr.ctx_in, args.as_ptr() as u64);
        assert_eq!(
            (attr.data_in, attr.data_out, attr.data_size_in, attr.data_size_out),
            (0, 0, 0, 0)
        );
        assert_eq!((attr.repeat, attr.ctx_out, attr.ctx_size_out), (0, 0, 0));
        assert_eq!(attr.flags, 0);

        let attr = raw_tracepoint_attr(&[], Some(1));
        assert_eq!((attr.ctx_in, attr.ctx_size_in), (0, 0));
        assert_eq!(attr.flags, sys::BPF_F_TEST_RUN_ON_CPU);
        assert_eq!(attr.cpu, 1);
    }

    #[test]
    fn test_raw_tracepoint_argument_limit() {
        let max = [0u8; MAX_RAW_TRACEPOINT_ARGS * 8];
        assert!(check_input(ProgramType::RawTracepoint, &max).is_ok());
        assert!(matches!(
            check_input(ProgramType::RawTracepoint, &[0u8; MAX_RAW_TRACEPOINT_ARGS * 8 + 8]),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_undeclared_map_reference_is_rejected() {
        let spec = ProgramSpec::new(
            "lookup",
            ProgramType::SocketFilter,
            vec![
                Instruction::load_map_ptr(asm::Register::R1, "nowhere"),
                Instruction::mov64_imm(asm::Register::R0, 0),
                Instruction::exit(),
            ],
        );
        assert!(matches!(Program::new(&spec), Err(Error::InvalidSpec(_))));
    }

    #[test]
    fn test_verifier_log_trims_nul_padding() {
        let mut buf = b"0: (b7) r0 = 0\n".to_vec();
        buf.extend_from_slice(&[0u8; 16]);
        assert_eq!(verifier_log(&buf), "0: (b7) r0 = 0");
    }
}
