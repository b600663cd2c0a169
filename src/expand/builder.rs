//! Instruction helpers shared by the lane emitters.

use iced_x86::{Code, Instruction, MemoryOperand, Register};

use crate::config::Bitness;
use crate::descriptor::{Family, InstructionDescriptor};
use crate::error::ExpandError;
use crate::ir::{self, Label, Node, regs};

/// Accumulates the replacement sequence for one scatter/gather.
pub(crate) struct SequenceBuilder<'a> {
    pub desc: &'a InstructionDescriptor,
    pub bitness: Bitness,
    /// xmm used to move elements between vectors and GPRs
    pub scratch_xmm: Register,
    pub nodes: Vec<Node>,
}

impl<'a> SequenceBuilder<'a> {
    pub fn new(desc: &'a InstructionDescriptor, bitness: Bitness, scratch_xmm: Register) -> Self {
        Self {
            desc,
            bitness,
            scratch_xmm,
            nodes: Vec::new(),
        }
    }

    /// Application instruction standing in for the scatter/gather.
    pub fn app(&mut self, instr: Instruction) {
        self.nodes.push(Node::app(instr, self.desc.app_pc));
    }

    pub fn meta(&mut self, instr: Instruction) {
        self.nodes.push(Node::Meta(instr));
    }

    pub fn jump_if_zero(&mut self, label: Label) {
        self.nodes.push(Node::JumpIfZero(label));
    }

    pub fn label(&mut self, label: Label) {
        self.nodes.push(Node::Label(label));
    }

    pub fn finish(self) -> Vec<Node> {
        self.nodes
    }

    /// GPR view for an element of `width` bytes.
    pub fn sized(&self, gpr: Register, width: u32) -> Result<Register, ExpandError> {
        regs::resize_gpr(gpr, width).ok_or(ExpandError::Unsupported("element width"))
    }

    /// Vector view the lanes are moved through: ymm for Narrow, zmm for Wide.
    fn wide_view(&self, reg: Register) -> Result<Register, ExpandError> {
        let bytes = match self.desc.family {
            Family::Narrow => 32,
            Family::Wide => 64,
        };
        regs::resize_vector(reg, bytes).ok_or(ExpandError::Unsupported("vector register"))
    }

    /// 128-bit chunk holding element `lane`, and the element's position in it.
    fn chunk(lane: u32, width: u32) -> (u32, u32) {
        let offset = lane * width;
        (offset / 16, (offset % 16) / width)
    }

    fn extract_chunk(&mut self, src: Register, chunk: u32) -> Result<(), ExpandError> {
        let code = match self.desc.family {
            Family::Narrow => Code::VEX_Vextracti128_xmmm128_ymm_imm8,
            Family::Wide => Code::EVEX_Vextracti32x4_xmmm128_k1z_zmm_imm8,
        };
        let src = self.wide_view(src)?;
        self.app(Instruction::with3(code, self.scratch_xmm, src, chunk)?);
        Ok(())
    }

    /// Move element `lane` of `src` into `gpr`.
    pub fn extract_element(
        &mut self,
        src: Register,
        lane: u32,
        width: u32,
        gpr: Register,
    ) -> Result<(), ExpandError> {
        let (chunk, element) = Self::chunk(lane, width);
        self.extract_chunk(src, chunk)?;
        let code = if width == 8 {
            Code::VEX_Vpextrq_rm64_xmm_imm8
        } else {
            Code::VEX_Vpextrd_rm32_xmm_imm8
        };
        let dst = self.sized(gpr, width)?;
        self.app(Instruction::with3(code, dst, self.scratch_xmm, element)?);
        Ok(())
    }

    /// Replace element `lane` of `dst` with `gpr`.
    pub fn insert_element(
        &mut self,
        dst: Register,
        lane: u32,
        width: u32,
        gpr: Register,
    ) -> Result<(), ExpandError> {
        let (chunk, element) = Self::chunk(lane, width);
        self.extract_chunk(dst, chunk)?;
        let code = if width == 8 {
            Code::VEX_Vpinsrq_xmm_xmm_rm64_imm8
        } else {
            Code::VEX_Vpinsrd_xmm_xmm_rm32_imm8
        };
        let src = self.sized(gpr, width)?;
        self.app(Instruction::with4(
            code,
            self.scratch_xmm,
            self.scratch_xmm,
            src,
            element,
        )?);
        let insert = match self.desc.family {
            Family::Narrow => Code::VEX_Vinserti128_ymm_ymm_xmmm128_imm8,
            Family::Wide => Code::EVEX_Vinserti32x4_zmm_k1z_zmm_xmmm128_imm8,
        };
        let dst = self.wide_view(dst)?;
        self.app(Instruction::with4(insert, dst, dst, self.scratch_xmm, chunk)?);
        Ok(())
    }

    /// `[base + index*scale + disp]` with the index taken from `gpr`.
    /// A dword index is sign-extended first in 64-bit mode.
    fn element_address(&mut self, gpr: Register) -> Result<MemoryOperand, ExpandError> {
        let index = match self.bitness {
            Bitness::B64 => {
                let full = self.sized(gpr, 8)?;
                if self.desc.index_width == 4 {
                    let dword = self.sized(gpr, 4)?;
                    self.app(Instruction::with2(Code::Movsxd_r64_rm32, full, dword)?);
                }
                full
            }
            Bitness::B32 => self.sized(gpr, 4)?,
        };
        Ok(ir::memory_operand(
            self.desc.base,
            index,
            self.desc.scale,
            self.desc.displacement,
            self.bitness,
        ))
    }

    /// Scalar load of one element into `gpr`, addressed by `index_gpr`.
    pub fn load(&mut self, index_gpr: Register, gpr: Register) -> Result<(), ExpandError> {
        let mem = self.element_address(index_gpr)?;
        let width = self.desc.value_width;
        let code = if width == 8 {
            Code::Mov_r64_rm64
        } else {
            Code::Mov_r32_rm32
        };
        let dst = self.sized(gpr, width)?;
        self.app(Instruction::with2(code, dst, mem)?);
        Ok(())
    }

    /// Scalar store of `value_gpr`, addressed by `index_gpr`.
    pub fn store(&mut self, index_gpr: Register, value_gpr: Register) -> Result<(), ExpandError> {
        let mem = self.element_address(index_gpr)?;
        let width = self.desc.value_width;
        let code = if width == 8 {
            Code::Mov_rm64_r64
        } else {
            Code::Mov_rm32_r32
        };
        let src = self.sized(value_gpr, width)?;
        self.app(Instruction::with2(code, mem, src)?);
        Ok(())
    }
}
