//! Small hand-assembled programs used by the scenarios and tests.
//!
//! All of them load as socket filters unless noted, since that is the type
//! every kernel with `BPF_PROG_TEST_RUN` can run.

use honeyjar_common::ECHO_MARKER;

use crate::asm::{Helper, Instruction, JumpOp, Register, Size, return_imm};
use crate::maps::MapSpec;
use crate::program::{ProgramSpec, ProgramType};

/// Name of the array map read by [`map_slot`].
pub const SLOTS_MAP: &str = "slots";
/// Name of the ring buffer or perf array the echo programs write to.
pub const EVENTS_MAP: &str = "events";

/// `BPF_F_CURRENT_CPU`: index the perf array by the running CPU.
const BPF_F_CURRENT_CPU: i64 = 0xffff_ffff;

/// Looks up `slot` in the u32 array `map` and returns its value, or 0 when
/// the lookup fails.
pub fn return_map_slot(map: &str, slot: u32) -> Vec<Instruction> {
    use Register::*;
    vec![
        Instruction::store_imm(Size::Word, R10, -4, slot as i32),
        Instruction::load_map_ptr(R1, map),
        Instruction::mov64_reg(R2, R10),
        Instruction::add64_imm(R2, -4),
        Instruction::call(Helper::MapLookupElem),
        Instruction::jump_imm(JumpOp::Eq, R0, 0, 2),
        Instruction::load_mem(Size::Word, R0, R0, 0),
        Instruction::exit(),
        Instruction::mov64_imm(R0, 0),
        Instruction::exit(),
    ]
}

/// Writes an `EchoEvent { ECHO_MARKER, value }` to the ring buffer `map`.
pub fn ringbuf_echo(map: &str, value: u32) -> Vec<Instruction> {
    use Register::*;
    vec![
        Instruction::store_imm(Size::Word, R10, -8, ECHO_MARKER as i32),
        Instruction::store_imm(Size::Word, R10, -4, value as i32),
        Instruction::load_map_ptr(R1, map),
        Instruction::mov64_reg(R2, R10),
        Instruction::add64_imm(R2, -8),
        Instruction::mov64_imm(R3, 8),
        Instruction::mov64_imm(R4, 0),
        Instruction::call(Helper::RingbufOutput),
        Instruction::mov64_imm(R0, 0),
        Instruction::exit(),
    ]
}

/// Loads the ring buffer `map` and returns 0 without writing to it.
pub fn ringbuf_silent(map: &str) -> Vec<Instruction> {
    vec![
        Instruction::load_map_ptr(Register::R1, map),
        Instruction::mov64_imm(Register::R0, 0),
        Instruction::exit(),
    ]
}

/// Writes an `EchoEvent { ECHO_MARKER, value }` to the current CPU's slot of
/// the perf event array `map`.
pub fn perf_echo(map: &str, value: u32) -> Vec<Instruction> {
    use Register::*;
    vec![
        Instruction::mov64_reg(R6, R1),
        Instruction::store_imm(Size::Word, R10, -8, ECHO_MARKER as i32),
        Instruction::store_imm(Size::Word, R10, -4, value as i32),
        Instruction::mov64_reg(R1, R6),
        Instruction::load_map_ptr(R2, map),
        Instruction::load_imm64(R3, BPF_F_CURRENT_CPU),
        Instruction::mov64_reg(R4, R10),
        Instruction::add64_imm(R4, -8),
        Instruction::mov64_imm(R5, 8),
        Instruction::call(Helper::PerfEventOutput),
        Instruction::mov64_imm(R0, 0),
        Instruction::exit(),
    ]
}

pub fn return_constant(value: i32) -> ProgramSpec {
    ProgramSpec::new("ret_const", ProgramType::SocketFilter, return_imm(value))
}

/// Returns slot 0 of a one-entry [`SLOTS_MAP`] array.
pub fn map_slot() -> ProgramSpec {
    ProgramSpec::new("ret_slot", ProgramType::SocketFilter, return_map_slot(SLOTS_MAP, 0))
        .with_map(MapSpec::array(SLOTS_MAP, 4, 1))
}

pub fn ringbuf_echo_program(ring_size: u32, value: u32) -> ProgramSpec {
    ProgramSpec::new("ringbuf_echo", ProgramType::SocketFilter, ringbuf_echo(EVENTS_MAP, value))
        .with_map(MapSpec::ring_buf(EVENTS_MAP, ring_size))
}

pub fn ringbuf_silent_program(ring_size: u32) -> ProgramSpec {
    ProgramSpec::new("ringbuf_silent", ProgramType::SocketFilter, ringbuf_silent(EVENTS_MAP))
        .with_map(MapSpec::ring_buf(EVENTS_MAP, ring_size))
}

/// Needs a GPL-compatible license: `bpf_perf_event_output` is GPL-only.
pub fn perf_echo_program(value: u32) -> ProgramSpec {
    ProgramSpec::new("perf_echo", ProgramType::SocketFilter, perf_echo(EVENTS_MAP, value))
        .with_license("Dual MIT/GPL")
        .with_map(MapSpec::perf_event_array(EVENTS_MAP))
}

/// A do-nothing raw tracepoint program.
pub fn raw_tracepoint_noop() -> ProgramSpec {
    ProgramSpec::new("raw_tp_noop", ProgramType::RawTracepoint, return_imm(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::map_references;
    use crate::maps::MapType;
    use crate::program::is_gpl_compatible;

    fn canned() -> Vec<ProgramSpec> {
        vec![
            map_slot(),
            ringbuf_echo_program(4096, 1),
            ringbuf_silent_program(4096),
            perf_echo_program(1),
            return_constant(3),
            raw_tracepoint_noop(),
        ]
    }

    /// Slot index of the instruction at `idx`.
    fn slot_of(insns: &[Instruction], idx: usize) -> usize {
        insns[..idx].iter().map(Instruction::slots).sum()
    }

    #[test]
    fn test_map_slot_jump_lands_on_fallback() {
        let insns = return_map_slot(SLOTS_MAP, 0);
        let jump = insns
            .iter()
            .position(|i| i.offset == 2 && i.dst == Register::R0 && i.reference.is_none() && i.opcode & 0x07 == 0x05)
            .expect("null check");
        let target = slot_of(&insns, jump) + 1 + insns[jump].offset as usize;
        assert_eq!(target, slot_of(&insns, insns.len() - 2));
        assert_eq!(insns[insns.len() - 2], Instruction::mov64_imm(Register::R0, 0));
    }

    #[test]
    fn test_programs_declare_the_maps_they_use() {
        for spec in canned() {
            for name in map_references(&spec.instructions) {
                assert!(spec.maps.contains_key(name), "{} misses {name}", spec.name);
            }
            assert_eq!(spec.instructions.last(), Some(&Instruction::exit()));
        }
    }

    #[test]
    fn test_echo_programs_target_event_maps() {
        let ring = ringbuf_echo_program(8192, 5);
        assert_eq!(ring.maps[EVENTS_MAP].map_type, MapType::RingBuf);
        assert_eq!(ring.maps[EVENTS_MAP].max_entries, 8192);

        let silent = ringbuf_silent_program(8192);
        assert_eq!(silent.maps[EVENTS_MAP].map_type, MapType::RingBuf);
        assert!(
            !silent
                .instructions
                .iter()
                .any(|insn| insn.helper() == Some(Helper::RingbufOutput))
        );

        let perf = perf_echo_program(5);
        assert_eq!(perf.maps[EVENTS_MAP].map_type, MapType::PerfEventArray);
        assert!(perf.instructions.contains(&Instruction::call(Helper::PerfEventOutput)));
    }

    #[test]
    fn test_gpl_only_helpers_have_compatible_license() {
        for spec in canned() {
            let gpl_only = spec
                .instructions
                .iter()
                .any(|insn| insn.helper().is_some_and(Helper::is_gpl_only));
            if gpl_only {
                assert!(is_gpl_compatible(&spec.license), "{} is {}", spec.name, spec.license);
            }
        }
        assert!(is_gpl_compatible(&perf_echo_program(1).license));
    }

    #[test]
    fn test_raw_tracepoint_noop_type() {
        assert_eq!(raw_tracepoint_noop().program_type, ProgramType::RawTracepoint);
        assert!(raw_tracepoint_noop().maps.is_empty());
    }
}
