//! Raw eBPF instruction encoding.
//!
//! Instructions are built with the constructors below and encoded into the
//! kernel's 8-byte `struct bpf_insn` layout at load time. Nothing here
//! interprets or validates program semantics; that is the verifier's job.

use std::os::fd::RawFd;

use crate::error::{Error, Result};

// Instruction classes.
const BPF_LD: u8 = 0x00;
const BPF_LDX: u8 = 0x01;
const BPF_ST: u8 = 0x02;
const BPF_STX: u8 = 0x03;
const BPF_JMP: u8 = 0x05;
const BPF_ALU64: u8 = 0x07;

// Operand source and memory modes.
const BPF_K: u8 = 0x00;
const BPF_X: u8 = 0x08;
const BPF_IMM: u8 = 0x00;
const BPF_MEM: u8 = 0x60;

const BPF_ADD: u8 = 0x00;
const BPF_MOV: u8 = 0xb0;
const BPF_CALL: u8 = 0x80;
const BPF_EXIT: u8 = 0x90;

/// `src_reg` marker telling the loader that `imm` holds a map descriptor.
const BPF_PSEUDO_MAP_FD: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Register {
    R0 = 0,
    R1,
    R2,
    R3,
    R4,
    R5,
    R6,
    R7,
    R8,
    R9,
    /// Read-only frame pointer.
    R10,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Size {
    Word = 0x00,
    Half = 0x08,
    Byte = 0x10,
    DWord = 0x18,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JumpOp {
    Eq = 0x10,
    Gt = 0x20,
    Ge = 0x30,
    Ne = 0x50,
}

/// Kernel helper function ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Helper {
    MapLookupElem = 1,
    MapUpdateElem = 2,
    MapDeleteElem = 3,
    KtimeGetNs = 5,
    PerfEventOutput = 25,
    RingbufOutput = 130,
}

impl Helper {
    const ALL: [Helper; 6] = [
        Helper::MapLookupElem,
        Helper::MapUpdateElem,
        Helper::MapDeleteElem,
        Helper::KtimeGetNs,
        Helper::PerfEventOutput,
        Helper::RingbufOutput,
    ];

    /// Helpers the kernel only exposes to GPL-compatible programs.
    pub fn is_gpl_only(self) -> bool {
        matches!(self, Helper::PerfEventOutput)
    }

    fn from_id(id: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|h| *h as i64 == id)
    }
}

/// One logical instruction. `load_imm64` and `load_map_ptr` occupy two
/// encoded slots; jump offsets count encoded slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: u8,
    pub dst: Register,
    pub src: Register,
    pub offset: i16,
    pub constant: i64,
    /// Name of the map whose descriptor replaces `constant` at load time.
    pub reference: Option<String>,
}

/// The kernel's `struct bpf_insn`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct RawInsn {
    pub code: u8,
    pub regs: u8,
    pub off: i16,
    pub imm: i32,
}

impl Instruction {
    fn new(opcode: u8, dst: Register, src: Register, offset: i16, constant: i64) -> Self {
        Self {
            opcode,
            dst,
            src,
            offset,
            constant,
            reference: None,
        }
    }

    pub fn mov64_imm(dst: Register, imm: i32) -> Self {
        Self::new(BPF_ALU64 | BPF_MOV | BPF_K, dst, Register::R0, 0, imm.into())
    }

    pub fn mov64_reg(dst: Register, src: Register) -> Self {
        Self::new(BPF_ALU64 | BPF_MOV | BPF_X, dst, src, 0, 0)
    }

    pub fn add64_imm(dst: Register, imm: i32) -> Self {
        Self::new(BPF_ALU64 | BPF_ADD | BPF_K, dst, Register::R0, 0, imm.into())
    }

    /// `dst = value`, full 64 bits.
    pub fn load_imm64(dst: Register, value: i64) -> Self {
        Self::new(BPF_LD | BPF_IMM | Size::DWord as u8, dst, Register::R0, 0, value)
    }

    /// `dst = &map`, where `map` is resolved by name when the program loads.
    pub fn load_map_ptr(dst: Register, map: impl Into<String>) -> Self {
        let mut insn = Self::load_imm64(dst, 0);
        insn.reference = Some(map.into());
        insn
    }

    /// `dst = *(size *)(src + offset)`
    pub fn load_mem(size: Size, dst: Register, src: Register, offset: i16) -> Self {
        Self::new(BPF_LDX | BPF_MEM | size as u8, dst, src, offset, 0)
    }

    /// `*(size *)(dst + offset) = imm`
    pub fn store_imm(size: Size, dst: Register, offset: i16, imm: i32) -> Self {
        Self::new(BPF_ST | BPF_MEM | size as u8, dst, Register::R0, offset, imm.into())
    }

    /// `*(size *)(dst + offset) = src`
    pub fn store_reg(size: Size, dst: Register, src: Register, offset: i16) -> Self {
        Self::new(BPF_STX | BPF_MEM | size as u8, dst, src, offset, 0)
    }

    /// `if dst <op> imm goto pc + offset`
    pub fn jump_imm(op: JumpOp, dst: Register, imm: i32, offset: i16) -> Self {
        Self::new(BPF_JMP | op as u8 | BPF_K, dst, Register::R0, offset, imm.into())
    }

    pub fn call(helper: Helper) -> Self {
        Self::new(BPF_JMP | BPF_CALL, Register::R0, Register::R0, 0, helper as i64)
    }

    pub fn exit() -> Self {
        Self::new(BPF_JMP | BPF_EXIT, Register::R0, Register::R0, 0, 0)
    }

    /// The helper this instruction calls, if it is a known helper call.
    pub fn helper(&self) -> Option<Helper> {
        if self.opcode == BPF_JMP | BPF_CALL && self.src == Register::R0 {
            Helper::from_id(self.constant)
        } else {
            None
        }
    }

    pub fn is_load_imm64(&self) -> bool {
        self.opcode == BPF_LD | BPF_IMM | Size::DWord as u8
    }

    /// Number of encoded `bpf_insn` slots.
    pub fn slots(&self) -> usize {
        if self.is_load_imm64() { 2 } else { 1 }
    }
}

/// `r0 = value; exit`
pub fn return_imm(value: i32) -> Vec<Instruction> {
    vec![Instruction::mov64_imm(Register::R0, value), Instruction::exit()]
}

/// Names of every map the instructions reference, in first-use order.
pub fn map_references(insns: &[Instruction]) -> Vec<&str> {
    let mut names: Vec<&str> = Vec::new();
    for name in insns.iter().filter_map(|i| i.reference.as_deref()) {
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

/// Encodes `insns`, asking `resolve` for the descriptor of each referenced map.
pub(crate) fn encode(
    insns: &[Instruction],
    mut resolve: impl FnMut(&str) -> Result<RawFd>,
) -> Result<Vec<RawInsn>> {
    let mut out = Vec::with_capacity(insns.len() + 1);
    for insn in insns {
        let (src, constant) = match &insn.reference {
            Some(name) => {
                if !insn.is_load_imm64() {
                    return Err(Error::InvalidSpec(format!(
                        "map reference {name} on a non-ld_imm64 instruction"
                    )));
                }
                (BPF_PSEUDO_MAP_FD, i64::from(resolve(name)?))
            }
            None => (insn.src as u8, insn.constant),
        };
        let regs = (src << 4) | (insn.dst as u8 & 0x0f);
        if insn.is_load_imm64() {
            out.push(RawInsn {
                code: insn.opcode,
                regs,
                off: insn.offset,
                imm: constant as i32,
            });
            out.push(RawInsn {
                imm: (constant >> 32) as i32,
                ..Default::default()
            });
        } else {
            out.push(RawInsn {
                code: insn.opcode,
                regs,
                off: insn.offset,
                imm: constant as i32,
            });
        }
    }
    Ok(out)
}
