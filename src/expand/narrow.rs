//! AVX2 gather lanes. The mask is a vector; an element is active while its
//! sign bit is set.

use iced_x86::{Code, Instruction, Register};

use super::builder::SequenceBuilder;
use crate::error::ExpandError;
use crate::ir::{Label, regs};

pub(super) fn gather_lane(
    b: &mut SequenceBuilder<'_>,
    lane: u32,
    gpr: Register,
    skip: Label,
) -> Result<(), ExpandError> {
    let desc = *b.desc;
    let width = desc.value_width;
    let element = b.sized(gpr, width)?;
    let (shr, and, xor) = if width == 8 {
        (Code::Shr_rm64_imm8, Code::And_rm64_imm8, Code::Xor_r64_rm64)
    } else {
        (Code::Shr_rm32_imm8, Code::And_rm32_imm8, Code::Xor_r32_rm32)
    };

    b.extract_element(desc.mask, lane, width, gpr)?;
    b.app(Instruction::with2(shr, element, width * 8 - 1)?);
    b.app(Instruction::with2(and, element, 1i32)?);
    b.jump_if_zero(skip);

    b.extract_element(desc.index, lane, desc.index_width, gpr)?;
    b.load(gpr, gpr)?;
    b.insert_element(desc.data, lane, width, gpr)?;

    b.app(Instruction::with2(xor, element, element)?);
    b.insert_element(desc.mask, lane, width, gpr)?;
    Ok(())
}

/// vpxor mask, mask, mask
pub(super) fn clear_mask(b: &mut SequenceBuilder<'_>) -> Result<(), ExpandError> {
    let mask = b.desc.mask;
    let code = match regs::vector_size(mask) {
        Some(16) => Code::VEX_Vpxor_xmm_xmm_xmmm128,
        Some(32) => Code::VEX_Vpxor_ymm_ymm_ymmm256,
        _ => return Err(ExpandError::Unsupported("AVX2 mask register width")),
    };
    b.app(Instruction::with3(code, mask, mask, mask)?);
    Ok(())
}

/// Zero the data register above the bytes the lanes cover.
pub(super) fn normalize_width(b: &mut SequenceBuilder<'_>) -> Result<(), ExpandError> {
    let covered = b.desc.data_bytes();
    let code = match covered {
        8 => Code::VEX_Vmovq_xmm_xmmm64,
        16 => Code::VEX_Vmovdqa_xmm_xmmm128,
        _ => return Ok(()),
    };
    let data = regs::xmm(b.desc.data).ok_or(ExpandError::Unsupported("data register"))?;
    b.app(Instruction::with2(code, data, data)?);
    Ok(())
}
