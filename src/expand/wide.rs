//! AVX-512 gather and scatter lanes. The mask is an opmask register, one
//! bit per element.

use iced_x86::{Code, Instruction, Register};

use super::builder::SequenceBuilder;
use crate::alloc::{RegSet, ScratchAllocator};
use crate::error::ExpandError;
use crate::ir::{Label, regs};

fn mask_test(
    b: &mut SequenceBuilder<'_>,
    lane: u32,
    gpr: Register,
    skip: Label,
) -> Result<(), ExpandError> {
    let dword = b.sized(gpr, 4)?;
    b.app(Instruction::with2(Code::VEX_Kmovw_r32_kr, dword, b.desc.mask)?);
    b.app(Instruction::with2(Code::Test_rm32_imm32, dword, 1u32 << lane)?);
    b.jump_if_zero(skip);
    Ok(())
}

/// Clear bit `lane` of the opmask. k0 is borrowed to hold the bit and is
/// preserved in a second scratch register.
fn mask_update(
    b: &mut SequenceBuilder<'_>,
    lane: u32,
    gpr: Register,
    alloc: &mut dyn ScratchAllocator,
    allowed: &RegSet,
) -> Result<(), ExpandError> {
    let mask = b.desc.mask;
    let dword = b.sized(gpr, 4)?;
    b.app(Instruction::with2(Code::Mov_r32_imm32, dword, 1u32 << lane)?);

    let save = alloc.reserve_gpr(&mut b.nodes, allowed)?;
    let save_dword = b.sized(save, 4)?;
    b.meta(Instruction::with2(Code::VEX_Kmovw_r32_kr, save_dword, Register::K0)?);
    b.app(Instruction::with2(Code::VEX_Kmovw_kr_r32, Register::K0, dword)?);
    b.app(Instruction::with3(Code::VEX_Kandnw_kr_kr_kr, mask, Register::K0, mask)?);
    b.meta(Instruction::with2(Code::VEX_Kmovw_kr_r32, Register::K0, save_dword)?);
    alloc.unreserve_gpr(&mut b.nodes, save)?;
    Ok(())
}

pub(super) fn gather_lane(
    b: &mut SequenceBuilder<'_>,
    lane: u32,
    gpr: Register,
    skip: Label,
    alloc: &mut dyn ScratchAllocator,
    allowed: &RegSet,
) -> Result<(), ExpandError> {
    let desc = *b.desc;
    mask_test(b, lane, gpr, skip)?;
    b.extract_element(desc.index, lane, desc.index_width, gpr)?;
    b.load(gpr, gpr)?;
    b.insert_element(desc.data, lane, desc.value_width, gpr)?;
    mask_update(b, lane, gpr, alloc, allowed)
}

pub(super) fn scatter_lane(
    b: &mut SequenceBuilder<'_>,
    lane: u32,
    gpr: Register,
    value_gpr: Register,
    skip: Label,
    alloc: &mut dyn ScratchAllocator,
    allowed: &RegSet,
) -> Result<(), ExpandError> {
    let desc = *b.desc;
    mask_test(b, lane, gpr, skip)?;
    b.extract_element(desc.index, lane, desc.index_width, gpr)?;
    b.extract_element(desc.data, lane, desc.value_width, value_gpr)?;
    b.store(gpr, value_gpr)?;
    mask_update(b, lane, gpr, alloc, allowed)
}

/// kxorq (AVX512BW) or kxorw of the mask with itself.
pub(super) fn clear_mask(b: &mut SequenceBuilder<'_>, avx512bw: bool) -> Result<(), ExpandError> {
    let mask = b.desc.mask;
    let code = if avx512bw {
        Code::VEX_Kxorq_kr_kr_kr
    } else {
        Code::VEX_Kxorw_kr_kr_kr
    };
    b.app(Instruction::with3(code, mask, mask, mask)?);
    Ok(())
}

/// Zero the data register above the bytes the lanes cover.
pub(super) fn normalize_width(b: &mut SequenceBuilder<'_>) -> Result<(), ExpandError> {
    let data = b.desc.data;
    let (code, view) = match b.desc.data_bytes() {
        8 => (Code::EVEX_Vmovq_xmm_xmmm64, regs::xmm(data)),
        16 => (Code::EVEX_Vmovdqa32_xmm_k1z_xmmm128, regs::xmm(data)),
        32 => (Code::EVEX_Vmovdqa32_ymm_k1z_ymmm256, regs::ymm(data)),
        _ => return Ok(()),
    };
    let view = view.ok_or(ExpandError::Unsupported("data register"))?;
    b.app(Instruction::with2(code, view, view)?);
    Ok(())
}
