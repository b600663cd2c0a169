//! A small x86 interpreter for the instructions expanded sequences use.
//!
//! Memory is paged and faults on unmapped pages; a fault can also be
//! injected at a chosen pc. Scatter/gather instructions are executed element
//! by element, so a fault part way leaves completed elements applied and
//! their mask bits cleared, as the hardware does.

use std::collections::HashMap;
use std::fmt;

use iced_x86::{Decoder, DecoderOptions, Instruction, Mnemonic, OpKind, Register};

use crate::config::Bitness;
use crate::descriptor::{Direction, Family, InstructionDescriptor, is_scatter_gather};
use crate::ir::regs;
use crate::machine::MachineContext;

pub const PAGE_SIZE: u64 = 0x1000;

type Page = Box<[u8; PAGE_SIZE as usize]>;

/// Sparse paged memory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Memory {
    pages: HashMap<u64, Page>,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    fn pages_of(addr: u64, len: u64) -> impl Iterator<Item = u64> {
        let first = addr / PAGE_SIZE;
        let last = addr.saturating_add(len.max(1) - 1) / PAGE_SIZE;
        first..=last
    }

    /// Map zero-filled pages covering `[addr, addr + len)`.
    pub fn map(&mut self, addr: u64, len: u64) {
        for page in Self::pages_of(addr, len) {
            self.pages
                .entry(page)
                .or_insert_with(|| Box::new([0; PAGE_SIZE as usize]));
        }
    }

    pub fn unmap(&mut self, addr: u64, len: u64) {
        for page in Self::pages_of(addr, len) {
            self.pages.remove(&page);
        }
    }

    pub fn is_mapped(&self, addr: u64, len: u64) -> bool {
        Self::pages_of(addr, len).all(|page| self.pages.contains_key(&page))
    }

    /// Read bytes; the error is the first unmapped address.
    pub fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), u64> {
        for (i, byte) in buf.iter_mut().enumerate() {
            let at = addr.wrapping_add(i as u64);
            let page = self.pages.get(&(at / PAGE_SIZE)).ok_or(at)?;
            *byte = page[(at % PAGE_SIZE) as usize];
        }
        Ok(())
    }

    /// Write bytes; nothing is written unless the whole range is mapped.
    pub fn write(&mut self, addr: u64, bytes: &[u8]) -> Result<(), u64> {
        if let Some(at) = (0..bytes.len() as u64)
            .map(|i| addr.wrapping_add(i))
            .find(|at| !self.pages.contains_key(&(at / PAGE_SIZE)))
        {
            return Err(at);
        }
        for (i, byte) in bytes.iter().enumerate() {
            let at = addr.wrapping_add(i as u64);
            if let Some(page) = self.pages.get_mut(&(at / PAGE_SIZE)) {
                page[(at % PAGE_SIZE) as usize] = *byte;
            }
        }
        Ok(())
    }

    pub fn read_uint(&self, addr: u64, width: u32) -> Result<u64, u64> {
        let mut buf = [0u8; 8];
        self.read(addr, &mut buf[..width as usize])?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn write_uint(&mut self, addr: u64, width: u32, value: u64) -> Result<(), u64> {
        self.write(addr, &value.to_le_bytes()[..width as usize])
    }
}

/// Where execution was interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault {
    pub pc: u64,
    /// Faulting address; `None` when injected.
    pub address: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stop {
    /// Fell off the end of the code.
    Finished,
    Fault(Fault),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimError {
    Decode { pc: u64 },
    Unsupported { pc: u64, mnemonic: Mnemonic },
    OutsideCode { pc: u64 },
    StepLimit,
}

impl fmt::Display for SimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimError::Decode { pc } => write!(f, "invalid instruction at {:#x}", pc),
            SimError::Unsupported { pc, mnemonic } => {
                write!(f, "unsupported instruction {:?} at {:#x}", mnemonic, pc)
            }
            SimError::OutsideCode { pc } => write!(f, "control left the code at {:#x}", pc),
            SimError::StepLimit => write!(f, "step limit reached"),
        }
    }
}

impl std::error::Error for SimError {}

enum Flow {
    Next,
    Jump(u64),
    Fault(u64),
}

/// Executes code against a [`MachineContext`] and [`Memory`].
#[derive(Debug, Clone)]
pub struct Simulator {
    pub ctx: MachineContext,
    pub mem: Memory,
    pub bitness: Bitness,
    pub fs_base: u64,
    pub gs_base: u64,
    pub max_steps: usize,
}

impl Simulator {
    pub fn new(bitness: Bitness) -> Self {
        Self {
            ctx: MachineContext::new(),
            mem: Memory::new(),
            bitness,
            fs_base: 0,
            gs_base: 0,
            max_steps: 100_000,
        }
    }

    /// Run `code` placed at `start_pc` until it falls off the end or faults.
    /// On a fault `ctx.pc` is the faulting instruction.
    pub fn run(
        &mut self,
        code: &[u8],
        start_pc: u64,
        fault_at: Option<u64>,
    ) -> Result<Stop, SimError> {
        let end = start_pc + code.len() as u64;
        self.ctx.pc = start_pc;
        for _ in 0..self.max_steps {
            let pc = self.ctx.pc;
            if pc == end {
                return Ok(Stop::Finished);
            }
            if pc < start_pc || pc > end {
                return Err(SimError::OutsideCode { pc });
            }
            if fault_at == Some(pc) {
                return Ok(Stop::Fault(Fault { pc, address: None }));
            }
            let offset = (pc - start_pc) as usize;
            let mut decoder =
                Decoder::with_ip(self.bitness.bits(), &code[offset..], pc, DecoderOptions::NONE);
            let instr = decoder.decode();
            if instr.is_invalid() {
                return Err(SimError::Decode { pc });
            }
            match self.step(&instr)? {
                Flow::Next => self.ctx.pc = instr.next_ip(),
                Flow::Jump(target) => self.ctx.pc = target,
                Flow::Fault(address) => {
                    return Ok(Stop::Fault(Fault {
                        pc,
                        address: Some(address),
                    }));
                }
            }
        }
        Err(SimError::StepLimit)
    }

    fn truncate_address(&self, addr: u64) -> u64 {
        match self.bitness {
            Bitness::B64 => addr,
            Bitness::B32 => addr & 0xFFFF_FFFF,
        }
    }

    fn displacement(&self, instr: &Instruction) -> u64 {
        match self.bitness {
            Bitness::B64 => instr.memory_displacement64(),
            Bitness::B32 => instr.memory_displacement32() as i32 as i64 as u64,
        }
    }

    fn segment_base(&self, instr: &Instruction) -> u64 {
        match instr.memory_segment() {
            Register::FS => self.fs_base,
            Register::GS => self.gs_base,
            _ => 0,
        }
    }

    /// Effective address of a scalar memory operand.
    fn address(&self, instr: &Instruction) -> u64 {
        let mut addr = self.displacement(instr);
        if instr.memory_base() != Register::None {
            addr = addr.wrapping_add(self.ctx.gpr(instr.memory_base()));
        }
        if regs::gpr_number(instr.memory_index()).is_some() {
            let index = self.ctx.gpr(instr.memory_index());
            addr = addr.wrapping_add(index.wrapping_mul(instr.memory_index_scale() as u64));
        }
        self.truncate_address(addr.wrapping_add(self.segment_base(instr)))
    }

    fn step(&mut self, instr: &Instruction) -> Result<Flow, SimError> {
        let unsupported = SimError::Unsupported {
            pc: instr.ip(),
            mnemonic: instr.mnemonic(),
        };
        if is_scatter_gather(instr) {
            return self.scatter_gather(instr).ok_or(unsupported);
        }
        match instr.mnemonic() {
            Mnemonic::Nop => {}
            Mnemonic::Mov => return self.mov(instr).ok_or(unsupported),
            Mnemonic::Movsxd => {
                let value = self.ctx.gpr(instr.op1_register()) as u32 as i32 as i64 as u64;
                self.ctx.set_gpr(instr.op0_register(), value);
            }
            Mnemonic::Shr | Mnemonic::And | Mnemonic::Xor | Mnemonic::Test => {
                self.alu(instr).ok_or(unsupported)?
            }
            Mnemonic::Je if self.ctx.zf => return Ok(Flow::Jump(instr.near_branch_target())),
            Mnemonic::Jne if !self.ctx.zf => return Ok(Flow::Jump(instr.near_branch_target())),
            Mnemonic::Je | Mnemonic::Jne => {}
            Mnemonic::Vextracti128 | Mnemonic::Vextracti32x4 => {
                let src = self.ctx.vector(instr.op1_register()).to_vec();
                let chunks = src.len() / 16;
                let at = (instr.immediate(2) as usize % chunks.max(1)) * 16;
                let chunk = src.get(at..at + 16).ok_or(unsupported)?.to_vec();
                self.ctx.write_vector_zero_upper(instr.op0_register(), &chunk);
            }
            Mnemonic::Vinserti128 | Mnemonic::Vinserti32x4 => {
                let mut value = self.ctx.vector(instr.op1_register()).to_vec();
                let chunks = value.len() / 16;
                let at = (instr.immediate(3) as usize % chunks.max(1)) * 16;
                let low = self.ctx.vector(instr.op2_register())[..16].to_vec();
                value
                    .get_mut(at..at + 16)
                    .ok_or(unsupported)?
                    .copy_from_slice(&low);
                self.ctx.write_vector_zero_upper(instr.op0_register(), &value);
            }
            Mnemonic::Vpextrd | Mnemonic::Vpextrq => {
                if instr.op_kind(0) != OpKind::Register {
                    return Err(unsupported);
                }
                let width = if instr.mnemonic() == Mnemonic::Vpextrq { 8 } else { 4 };
                let lane = instr.immediate(2) as u32 % (16 / width);
                let value = self.ctx.vector_element(instr.op1_register(), lane, width);
                self.ctx.set_gpr(instr.op0_register(), value);
            }
            Mnemonic::Vpinsrd | Mnemonic::Vpinsrq => {
                if instr.op_kind(2) != OpKind::Register {
                    return Err(unsupported);
                }
                let width = if instr.mnemonic() == Mnemonic::Vpinsrq { 8 } else { 4 };
                let lane = instr.immediate(3) as u32 % (16 / width);
                let value = self.ctx.gpr(instr.op2_register()).to_le_bytes();
                let mut xmm = self.ctx.vector(instr.op1_register())[..16].to_vec();
                let at = (lane * width) as usize;
                xmm[at..at + width as usize].copy_from_slice(&value[..width as usize]);
                self.ctx.write_vector_zero_upper(instr.op0_register(), &xmm);
            }
            Mnemonic::Vpxor => {
                let a = self.ctx.vector(instr.op1_register()).to_vec();
                let b = self.ctx.vector(instr.op2_register()).to_vec();
                let value: Vec<u8> = a.iter().zip(&b).map(|(x, y)| x ^ y).collect();
                self.ctx.write_vector_zero_upper(instr.op0_register(), &value);
            }
            Mnemonic::Vmovaps
            | Mnemonic::Vmovups
            | Mnemonic::Vmovdqa
            | Mnemonic::Vmovdqu
            | Mnemonic::Vmovdqa32
            | Mnemonic::Vmovdqa64
            | Mnemonic::Vmovdqu32
            | Mnemonic::Vmovq => return self.vector_move(instr).ok_or(unsupported),
            Mnemonic::Kmovw => {
                let (dst, src) = (instr.op0_register(), instr.op1_register());
                if regs::opmask_number(dst).is_some() {
                    let value = if regs::opmask_number(src).is_some() {
                        self.ctx.opmask(src)
                    } else {
                        self.ctx.gpr(src)
                    };
                    self.ctx.set_opmask(dst, value & 0xFFFF);
                } else {
                    self.ctx.set_gpr(dst, self.ctx.opmask(src) & 0xFFFF);
                }
            }
            Mnemonic::Kandnw => {
                let value = !self.ctx.opmask(instr.op1_register()) & self.ctx.opmask(instr.op2_register());
                self.ctx.set_opmask(instr.op0_register(), value & 0xFFFF);
            }
            Mnemonic::Kxorw | Mnemonic::Kxorq => {
                let mut value =
                    self.ctx.opmask(instr.op1_register()) ^ self.ctx.opmask(instr.op2_register());
                if instr.mnemonic() == Mnemonic::Kxorw {
                    value &= 0xFFFF;
                }
                self.ctx.set_opmask(instr.op0_register(), value);
            }
            _ => return Err(unsupported),
        }
        Ok(Flow::Next)
    }

    fn mov(&mut self, instr: &Instruction) -> Option<Flow> {
        match (instr.op_kind(0), instr.op_kind(1)) {
            (OpKind::Register, OpKind::Register) => {
                let value = self.ctx.gpr(instr.op1_register());
                self.ctx.set_gpr(instr.op0_register(), value);
            }
            (OpKind::Register, OpKind::Memory) => {
                let (_, width) = regs::gpr_number(instr.op0_register())?;
                let addr = self.address(instr);
                match self.mem.read_uint(addr, width) {
                    Ok(value) => self.ctx.set_gpr(instr.op0_register(), value),
                    Err(at) => return Some(Flow::Fault(at)),
                }
            }
            (OpKind::Memory, OpKind::Register) => {
                let (_, width) = regs::gpr_number(instr.op1_register())?;
                let addr = self.address(instr);
                let value = self.ctx.gpr(instr.op1_register());
                if let Err(at) = self.mem.write_uint(addr, width, value) {
                    return Some(Flow::Fault(at));
                }
            }
            (OpKind::Register, OpKind::Immediate32)
            | (OpKind::Register, OpKind::Immediate32to64)
            | (OpKind::Register, OpKind::Immediate64) => {
                self.ctx.set_gpr(instr.op0_register(), instr.immediate(1));
            }
            _ => return None,
        }
        Some(Flow::Next)
    }

    fn alu(&mut self, instr: &Instruction) -> Option<()> {
        let dst = instr.op0_register();
        let (_, width) = regs::gpr_number(dst)?;
        let bits = width * 8;
        let value_mask = if width == 8 { u64::MAX } else { 0xFFFF_FFFF };
        let lhs = self.ctx.gpr(dst);
        let rhs = match instr.op_kind(1) {
            OpKind::Register => self.ctx.gpr(instr.op1_register()),
            _ => instr.immediate(1),
        };
        let result = match instr.mnemonic() {
            Mnemonic::Shr => {
                let count = (rhs & (bits as u64 - 1)) as u32;
                lhs >> count
            }
            Mnemonic::And | Mnemonic::Test => lhs & rhs,
            Mnemonic::Xor => lhs ^ rhs,
            _ => return None,
        } & value_mask;
        self.ctx.zf = result == 0;
        if instr.mnemonic() != Mnemonic::Test {
            self.ctx.set_gpr(dst, result);
        }
        Some(())
    }

    fn vector_move(&mut self, instr: &Instruction) -> Option<Flow> {
        match (instr.op_kind(0), instr.op_kind(1)) {
            (OpKind::Register, OpKind::Register) => {
                let dst = instr.op0_register();
                let size = if instr.mnemonic() == Mnemonic::Vmovq {
                    8
                } else {
                    regs::vector_size(dst)? as usize
                };
                let value = self.ctx.vector(instr.op1_register())[..size].to_vec();
                self.ctx.write_vector_zero_upper(dst, &value);
            }
            (OpKind::Memory, OpKind::Register) => {
                let value = self.ctx.vector(instr.op1_register()).to_vec();
                let addr = self.address(instr);
                if let Err(at) = self.mem.write(addr, &value) {
                    return Some(Flow::Fault(at));
                }
            }
            (OpKind::Register, OpKind::Memory) => {
                let dst = instr.op0_register();
                let mut value = vec![0u8; regs::vector_size(dst)? as usize];
                let addr = self.address(instr);
                if let Err(at) = self.mem.read(addr, &mut value) {
                    return Some(Flow::Fault(at));
                }
                self.ctx.write_vector_zero_upper(dst, &value);
            }
            _ => return None,
        }
        Some(Flow::Next)
    }

    /// Element-wise scatter/gather in lane order.
    fn scatter_gather(&mut self, instr: &Instruction) -> Option<Flow> {
        let desc = InstructionDescriptor::extract(instr, self.bitness).ok()?;
        let base = if desc.base == Register::None {
            0
        } else {
            self.ctx.gpr(desc.base)
        };
        let sign_bit = desc.value_width * 8 - 1;
        for lane in 0..desc.lane_count() {
            let active = match desc.family {
                Family::Narrow => {
                    self.ctx.vector_element(desc.mask, lane, desc.value_width) >> sign_bit & 1 == 1
                }
                Family::Wide => self.ctx.opmask(desc.mask) >> lane & 1 == 1,
            };
            if !active {
                continue;
            }
            let raw_index = self.ctx.vector_element(desc.index, lane, desc.index_width);
            let index = if desc.index_width == 4 {
                raw_index as u32 as i32 as i64 as u64
            } else {
                raw_index
            };
            let addr = self.truncate_address(
                base.wrapping_add(index.wrapping_mul(desc.scale as u64))
                    .wrapping_add(desc.displacement as u64),
            );
            match desc.direction {
                Direction::Load => match self.mem.read_uint(addr, desc.value_width) {
                    Ok(value) => {
                        self.ctx
                            .set_vector_element(desc.data, lane, desc.value_width, value)
                    }
                    Err(at) => return Some(Flow::Fault(at)),
                },
                Direction::Store => {
                    let value = self.ctx.vector_element(desc.data, lane, desc.value_width);
                    if let Err(at) = self.mem.write_uint(addr, desc.value_width, value) {
                        return Some(Flow::Fault(at));
                    }
                }
            }
            match desc.family {
                Family::Narrow => self
                    .ctx
                    .set_vector_element(desc.mask, lane, desc.value_width, 0),
                Family::Wide => {
                    let mask = self.ctx.opmask(desc.mask) & !(1u64 << lane);
                    self.ctx.set_opmask(desc.mask, mask);
                }
            }
        }

        match desc.family {
            Family::Narrow => {
                let size = regs::vector_size(desc.mask)? as usize;
                self.ctx.write_vector_zero_upper(desc.mask, &vec![0u8; size]);
            }
            Family::Wide => self.ctx.set_opmask(desc.mask, 0),
        }
        if desc.direction == Direction::Load {
            let full = regs::zmm(desc.data)?;
            let mut value = self.ctx.vector(full).to_vec();
            value[desc.data_bytes() as usize..].fill(0);
            self.ctx.set_vector(full, &value);
        }
        Some(Flow::Next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_pages() {
        let mut mem = Memory::new();
        mem.map(0x1FFC, 8);
        assert!(mem.is_mapped(0x1000, 0x2000));
        mem.write_uint(0x1FFC, 8, 0x1122_3344_5566_7788).unwrap();
        assert_eq!(mem.read_uint(0x1FFC, 8), Ok(0x1122_3344_5566_7788));
        assert_eq!(mem.read_uint(0x3000, 4), Err(0x3000));
        mem.unmap(0x2000, 1);
        assert_eq!(mem.write_uint(0x1FFE, 4, 0), Err(0x2000));
        // Nothing written on a partial fault
        assert_eq!(mem.read_uint(0x1FFC, 2), Ok(0x7788));
    }

    #[test]
    fn test_branch_and_alu() {
        let mut sim = Simulator::new(Bitness::B64);
        // mov ecx, 4 ; and ecx, 1 ; jz +2 ; xor eax, eax ... ; nop
        let code = [
            0xB9, 0x04, 0x00, 0x00, 0x00, 0x83, 0xE1, 0x01, 0x74, 0x02, 0x31, 0xC0, 0x90,
        ];
        sim.ctx.gpr[0] = 7;
        assert_eq!(sim.run(&code, 0x1000, None), Ok(Stop::Finished));
        assert_eq!(sim.ctx.gpr[0], 7);
        assert!(sim.ctx.zf);
    }

    #[test]
    fn test_injected_fault() {
        let mut sim = Simulator::new(Bitness::B64);
        let code = [0x90, 0x90, 0x90];
        assert_eq!(
            sim.run(&code, 0x1000, Some(0x1001)),
            Ok(Stop::Fault(Fault {
                pc: 0x1001,
                address: None
            }))
        );
        assert_eq!(sim.ctx.pc, 0x1001);
    }

    #[test]
    fn test_narrow_gather_reference() {
        let mut sim = Simulator::new(Bitness::B64);
        sim.mem.map(0x10000, 0x100);
        sim.mem.write_uint(0x10000 + 40, 4, 0xAAAA).unwrap();
        sim.ctx.set_gpr(Register::RAX, 0x10000);
        sim.ctx.set_vector_element(Register::YMM1, 0, 4, 10);
        sim.ctx.set_vector_element(Register::YMM2, 0, 4, 0x8000_0000);
        sim.ctx.set_vector_element(Register::YMM0, 1, 4, 0x5555);
        // vpgatherdd ymm0, [rax+ymm1*4], ymm2
        let code = [0xC4, 0xE2, 0x6D, 0x90, 0x04, 0x88];
        assert_eq!(sim.run(&code, 0x1000, None), Ok(Stop::Finished));
        assert_eq!(sim.ctx.vector_element(Register::YMM0, 0, 4), 0xAAAA);
        assert_eq!(sim.ctx.vector_element(Register::YMM0, 1, 4), 0x5555);
        assert!(sim.ctx.vector(Register::YMM2).iter().all(|&b| b == 0));
    }

    #[test]
    fn test_gather_faults_mid_way() {
        let mut sim = Simulator::new(Bitness::B64);
        sim.mem.map(0x10000, 0x10);
        sim.ctx.set_gpr(Register::RAX, 0x10000);
        sim.ctx.set_vector_element(Register::ZMM1, 1, 4, 0x1000);
        sim.ctx.set_opmask(Register::K1, 0b11);
        // vpgatherdd zmm0{k1}, [rax+zmm1*4]
        let code = [0x62, 0xF2, 0x7D, 0x49, 0x90, 0x04, 0x88];
        let stop = sim.run(&code, 0x1000, None).unwrap();
        assert_eq!(
            stop,
            Stop::Fault(Fault {
                pc: 0x1000,
                address: Some(0x14000)
            })
        );
        assert_eq!(sim.ctx.opmask(Register::K1), 0b10);
    }
}
