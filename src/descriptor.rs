//! Scatter/gather instruction classification.

use iced_x86::{Instruction, Mnemonic, OpKind, Register};

use crate::config::Bitness;
use crate::error::DescriptorError;
use crate::ir::regs;

/// Encoding family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    /// AVX2 (VEX): the mask is a vector register, one sign bit per element.
    Narrow,
    /// AVX-512 (EVEX): the mask is an opmask register, one bit per element.
    Wide,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// gather
    Load,
    /// scatter
    Store,
}

/// Direction and (index, value) element widths in bytes.
fn element_widths(mnemonic: Mnemonic) -> Option<(Direction, u32, u32)> {
    use Direction::*;
    let widths = match mnemonic {
        Mnemonic::Vpgatherdd | Mnemonic::Vgatherdps => (Load, 4, 4),
        Mnemonic::Vpgatherdq | Mnemonic::Vgatherdpd => (Load, 4, 8),
        Mnemonic::Vpgatherqd | Mnemonic::Vgatherqps => (Load, 8, 4),
        Mnemonic::Vpgatherqq | Mnemonic::Vgatherqpd => (Load, 8, 8),
        Mnemonic::Vpscatterdd | Mnemonic::Vscatterdps => (Store, 4, 4),
        Mnemonic::Vpscatterdq | Mnemonic::Vscatterdpd => (Store, 4, 8),
        Mnemonic::Vpscatterqd | Mnemonic::Vscatterqps => (Store, 8, 4),
        Mnemonic::Vpscatterqq | Mnemonic::Vscatterqpd => (Store, 8, 8),
        _ => return None,
    };
    Some(widths)
}

pub fn is_gather(instr: &Instruction) -> bool {
    matches!(element_widths(instr.mnemonic()), Some((Direction::Load, _, _)))
}

pub fn is_scatter(instr: &Instruction) -> bool {
    matches!(element_widths(instr.mnemonic()), Some((Direction::Store, _, _)))
}

pub fn is_scatter_gather(instr: &Instruction) -> bool {
    element_widths(instr.mnemonic()).is_some()
}

/// Everything the expansion and recovery need to know about one
/// scatter/gather instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstructionDescriptor {
    pub family: Family,
    pub direction: Direction,
    pub index_width: u32,
    pub value_width: u32,
    /// Widest of the data and index registers, in bytes.
    pub vector_width: u32,
    /// Opmask (Wide) or vector mask register (Narrow).
    pub mask: Register,
    pub base: Register,
    pub index: Register,
    pub scale: u32,
    pub displacement: i64,
    /// Destination (Load) or source (Store) vector register.
    pub data: Register,
    pub app_pc: u64,
}

impl InstructionDescriptor {
    pub fn extract(instr: &Instruction, bitness: Bitness) -> Result<Self, DescriptorError> {
        let (direction, index_width, value_width) =
            element_widths(instr.mnemonic()).ok_or(DescriptorError::NotScatterGather)?;
        let family = if instr.op_mask() != Register::None {
            Family::Wide
        } else {
            Family::Narrow
        };

        let (data, mem_op) = match direction {
            Direction::Load => (instr.op0_register(), 1),
            Direction::Store => (instr.op1_register(), 0),
        };
        if instr.op_kind(mem_op) != OpKind::Memory {
            return Err(DescriptorError::Malformed("missing vector memory operand"));
        }

        let mask = match (family, direction) {
            (Family::Wide, _) => instr.op_mask(),
            (Family::Narrow, Direction::Load) => instr.op2_register(),
            // No VEX scatter exists
            (Family::Narrow, Direction::Store) => return Err(DescriptorError::NotScatterGather),
        };
        if family == Family::Narrow && regs::vector_size(mask).is_none() {
            return Err(DescriptorError::Malformed("mask is not a vector register"));
        }

        let data_size =
            regs::vector_size(data).ok_or(DescriptorError::Malformed("data is not a vector"))?;
        let index = instr.memory_index();
        let index_size =
            regs::vector_size(index).ok_or(DescriptorError::Malformed("index is not a vector"))?;

        let displacement = match bitness {
            Bitness::B64 => instr.memory_displacement64() as i64,
            Bitness::B32 => instr.memory_displacement32() as i32 as i64,
        };

        Ok(Self {
            family,
            direction,
            index_width,
            value_width,
            vector_width: data_size.max(index_size),
            mask,
            base: instr.memory_base(),
            index,
            scale: instr.memory_index_scale(),
            displacement,
            data,
            app_pc: instr.ip(),
        })
    }

    /// Number of elements the instruction processes.
    pub fn lane_count(&self) -> u32 {
        self.vector_width / self.index_width.max(self.value_width)
    }

    pub fn is_load(&self) -> bool {
        self.direction == Direction::Load
    }

    pub fn is_store(&self) -> bool {
        self.direction == Direction::Store
    }

    /// Bytes of the data register the lanes actually cover.
    pub fn data_bytes(&self) -> u32 {
        self.lane_count() * self.value_width
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iced_x86::{Decoder, DecoderOptions};

    fn decode(bytes: &[u8]) -> Instruction {
        let mut decoder = Decoder::with_ip(64, bytes, 0x1000, DecoderOptions::NONE);
        decoder.decode()
    }

    #[test]
    fn test_narrow_gather() {
        // vpgatherdd ymm0, [rax+ymm1*4], ymm2
        let instr = decode(&[0xC4, 0xE2, 0x6D, 0x90, 0x04, 0x88]);
        let desc = InstructionDescriptor::extract(&instr, Bitness::B64).unwrap();
        assert_eq!(desc.family, Family::Narrow);
        assert_eq!(desc.direction, Direction::Load);
        assert_eq!(desc.mask, Register::YMM2);
        assert_eq!(desc.data, Register::YMM0);
        assert_eq!(desc.index, Register::YMM1);
        assert_eq!(desc.base, Register::RAX);
        assert_eq!(desc.scale, 4);
        assert_eq!(desc.lane_count(), 8);
        assert_eq!(desc.app_pc, 0x1000);
    }

    #[test]
    fn test_narrow_mixed_widths() {
        // vpgatherdq ymm0, [rax+xmm1*8], ymm2
        let instr = decode(&[0xC4, 0xE2, 0xED, 0x90, 0x04, 0xC8]);
        let desc = InstructionDescriptor::extract(&instr, Bitness::B64).unwrap();
        assert_eq!((desc.index_width, desc.value_width), (4, 8));
        assert_eq!(desc.vector_width, 32);
        assert_eq!(desc.lane_count(), 4);

        // vpgatherqd xmm0, [rax+ymm1*4], xmm2
        let instr = decode(&[0xC4, 0xE2, 0x6D, 0x91, 0x04, 0x88]);
        let desc = InstructionDescriptor::extract(&instr, Bitness::B64).unwrap();
        assert_eq!((desc.index_width, desc.value_width), (8, 4));
        assert_eq!(desc.lane_count(), 4);
        assert_eq!(desc.data_bytes(), 16);
    }

    #[test]
    fn test_wide_gather_and_scatter() {
        // vpgatherdd zmm0{k1}, [rax+zmm1*4]
        let instr = decode(&[0x62, 0xF2, 0x7D, 0x49, 0x90, 0x04, 0x88]);
        assert!(is_gather(&instr));
        let desc = InstructionDescriptor::extract(&instr, Bitness::B64).unwrap();
        assert_eq!(desc.family, Family::Wide);
        assert_eq!(desc.mask, Register::K1);
        assert_eq!(desc.lane_count(), 16);

        // vpscatterdd [rax+zmm1*4]{k1}, zmm0
        let instr = decode(&[0x62, 0xF2, 0x7D, 0x49, 0xA0, 0x04, 0x88]);
        assert!(is_scatter(&instr));
        let desc = InstructionDescriptor::extract(&instr, Bitness::B64).unwrap();
        assert_eq!(desc.direction, Direction::Store);
        assert_eq!(desc.data, Register::ZMM0);
        assert_eq!(desc.index, Register::ZMM1);
    }

    #[test]
    fn test_not_scatter_gather() {
        // add eax, ecx
        let instr = decode(&[0x01, 0xC8]);
        assert!(!is_scatter_gather(&instr));
        assert_eq!(
            InstructionDescriptor::extract(&instr, Bitness::B64),
            Err(DescriptorError::NotScatterGather)
        );
    }
}
