//! Scratch vector register save/restore around an expanded sequence.

use iced_x86::{Code, IcedError, Instruction, Register};
use log::debug;

use crate::config::{Bitness, ExpandConfig, ProcessorFeatures};
use crate::descriptor::{Family, InstructionDescriptor};
use crate::ir::{self, Node, regs};
use crate::machine::MachineContext;

pub const SPILL_AREA_SIZE: usize = 64;

/// One vector register worth of storage, aligned for `vmovaps`.
#[repr(C, align(64))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpillArea([u8; SPILL_AREA_SIZE]);

/// Per-thread spill slot for the scratch vector register.
#[derive(Debug)]
pub struct ThreadScratch {
    area: Box<SpillArea>,
}

impl ThreadScratch {
    fn new() -> Self {
        Self {
            area: Box::new(SpillArea([0; SPILL_AREA_SIZE])),
        }
    }

    /// Address the host stores at the configured TLS offset.
    pub fn address(&self) -> u64 {
        self.area.0.as_ptr() as u64
    }

    pub fn bytes(&self) -> &[u8; SPILL_AREA_SIZE] {
        &self.area.0
    }

    pub fn bytes_mut(&mut self) -> &mut [u8; SPILL_AREA_SIZE] {
        &mut self.area.0
    }
}

/// Width at which the scratch register is saved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpillWidth {
    Ymm,
    Zmm,
}

impl SpillWidth {
    pub fn for_features(features: &ProcessorFeatures) -> Self {
        if features.avx512 {
            SpillWidth::Zmm
        } else {
            SpillWidth::Ymm
        }
    }

    pub fn bytes(self) -> u32 {
        match self {
            SpillWidth::Ymm => 32,
            SpillWidth::Zmm => 64,
        }
    }

    fn store_code(self) -> Code {
        match self {
            SpillWidth::Ymm => Code::VEX_Vmovdqa_ymmm256_ymm,
            SpillWidth::Zmm => Code::EVEX_Vmovaps_zmmm512_k1z_zmm,
        }
    }

    fn load_code(self) -> Code {
        match self {
            SpillWidth::Ymm => Code::VEX_Vmovdqa_ymm_ymmm256,
            SpillWidth::Zmm => Code::EVEX_Vmovaps_zmm_k1z_zmmm512,
        }
    }
}

/// Chooses, saves and restores the scratch vector register.
#[derive(Debug, Clone)]
pub struct ScratchStateManager {
    bitness: Bitness,
    width: SpillWidth,
    tls_offset: i32,
}

impl ScratchStateManager {
    pub fn new(config: &ExpandConfig) -> Self {
        Self {
            bitness: config.bitness,
            width: SpillWidth::for_features(&config.features),
            tls_offset: config.tls_spill_slot_offset,
        }
    }

    pub fn spill_width(&self) -> SpillWidth {
        self.width
    }

    pub fn thread_init(&self) -> ThreadScratch {
        let scratch = ThreadScratch::new();
        debug!("spill slot at {:#x}", scratch.address());
        scratch
    }

    pub fn thread_exit(&self, scratch: ThreadScratch) {
        debug!("releasing spill slot at {:#x}", scratch.address());
    }

    /// Lowest xmm0..xmm15 not aliasing the index, the data register or
    /// (Narrow) the mask.
    pub fn choose_scratch_xmm(&self, desc: &InstructionDescriptor) -> Option<Register> {
        regs::XMM[..16].iter().copied().find(|&xmm| {
            !regs::same_vector(xmm, desc.index)
                && !regs::same_vector(xmm, desc.data)
                && (desc.family == Family::Wide || !regs::same_vector(xmm, desc.mask))
        })
    }

    /// The scratch register at spill width.
    pub fn spilled_register(&self, xmm: Register) -> Option<Register> {
        regs::resize_vector(xmm, self.width.bytes())
    }

    /// `mov gpr, seg:[tls]` then store the scratch register through it.
    /// Returns the register as spilled.
    pub fn emit_save(
        &self,
        seq: &mut Vec<Node>,
        gpr: Register,
        xmm: Register,
    ) -> Result<Register, IcedError> {
        let spilled = self.spilled_register(xmm).unwrap_or(xmm);
        seq.push(Node::Meta(self.load_slot_pointer(gpr)?));
        seq.push(Node::Meta(Instruction::with2(
            self.width.store_code(),
            ir::base_operand(gpr, 0, self.bitness),
            spilled,
        )?));
        Ok(spilled)
    }

    /// Reload the scratch register saved by [`emit_save`](Self::emit_save).
    pub fn emit_restore(
        &self,
        seq: &mut Vec<Node>,
        gpr: Register,
        spilled: Register,
    ) -> Result<(), IcedError> {
        seq.push(Node::Meta(self.load_slot_pointer(gpr)?));
        seq.push(Node::Meta(Instruction::with2(
            self.width.load_code(),
            spilled,
            ir::base_operand(gpr, 0, self.bitness),
        )?));
        Ok(())
    }

    /// Copy the saved scratch register from the thread's slot into `ctx`.
    pub fn restore_from_slot(
        &self,
        thread: &ThreadScratch,
        spilled: Register,
        ctx: &mut MachineContext,
    ) {
        let size = regs::vector_size(spilled).unwrap_or(0) as usize;
        ctx.set_vector(spilled, &thread.bytes()[..size.min(SPILL_AREA_SIZE)]);
    }

    fn load_slot_pointer(&self, gpr: Register) -> Result<Instruction, IcedError> {
        let code = match self.bitness {
            Bitness::B64 => Code::Mov_r64_rm64,
            Bitness::B32 => Code::Mov_r32_rm32,
        };
        Instruction::with2(code, gpr, ir::tls_operand(self.tls_offset, self.bitness))
    }
}
