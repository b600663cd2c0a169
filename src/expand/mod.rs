//! Scalar expansion of scatter/gather instructions.
//!
//! A scatter/gather is replaced by a sequence that saves a scratch vector
//! register, processes each lane with scalar loads or stores, clears the mask
//! and restores the scratch register. Lane blocks always follow the order
//! mask test, skip branch, index extraction, memory access with its data
//! movement, mask update, skip label; recovery depends on it.

mod builder;
mod narrow;
mod wide;

use log::debug;

use crate::alloc::{RegSet, ScratchAllocator};
use crate::config::ExpandConfig;
use crate::descriptor::{Direction, Family, InstructionDescriptor};
use crate::error::ExpandError;
use crate::ir::{Node, Unit};
use crate::scratch::ScratchStateManager;
use builder::SequenceBuilder;

/// Rewrites one scatter/gather inside a unit.
pub struct Expander<'a> {
    config: &'a ExpandConfig,
    scratch: &'a ScratchStateManager,
}

impl<'a> Expander<'a> {
    pub fn new(config: &'a ExpandConfig, scratch: &'a ScratchStateManager) -> Self {
        Self { config, scratch }
    }

    /// Replace the node at `at` (described by `desc`) with its scalar
    /// expansion. Returns the number of lanes. On error the unit's nodes are
    /// left as they were, but reservations made on `alloc` may be held.
    pub fn expand(
        &self,
        unit: &mut Unit,
        at: usize,
        desc: &InstructionDescriptor,
        alloc: &mut dyn ScratchAllocator,
    ) -> Result<u32, ExpandError> {
        let bitness = self.config.bitness;
        if !bitness.is_64() && (desc.index_width == 8 || desc.value_width == 8) {
            return Err(ExpandError::Unsupported(
                "8-byte index or value in 32-bit mode",
            ));
        }
        if desc.family == Family::Wide && !self.config.features.avx512 {
            return Err(ExpandError::Unsupported("AVX-512 instruction without AVX-512"));
        }
        if desc.family == Family::Narrow && desc.direction == Direction::Store {
            return Err(ExpandError::Unsupported("AVX2 scatter"));
        }

        let xmm = self
            .scratch
            .choose_scratch_xmm(desc)
            .ok_or(ExpandError::NoScratchVector)?;
        let allowed = RegSet::all(bitness).without(desc.base);
        let mut b = SequenceBuilder::new(desc, bitness, xmm);

        alloc.reserve_flags(&mut b.nodes)?;
        let gpr = alloc.reserve_gpr(&mut b.nodes, &allowed)?;
        let value_gpr = match desc.direction {
            Direction::Store => Some(alloc.reserve_gpr(&mut b.nodes, &allowed)?),
            Direction::Load => None,
        };
        let spilled = self.scratch.emit_save(&mut b.nodes, gpr, xmm)?;

        let lanes = desc.lane_count();
        for lane in 0..lanes {
            let skip = unit.new_label();
            match (desc.family, value_gpr) {
                (Family::Narrow, _) => narrow::gather_lane(&mut b, lane, gpr, skip)?,
                (Family::Wide, None) => {
                    wide::gather_lane(&mut b, lane, gpr, skip, alloc, &allowed)?
                }
                (Family::Wide, Some(value)) => {
                    wide::scatter_lane(&mut b, lane, gpr, value, skip, alloc, &allowed)?
                }
            }
            b.label(skip);
        }

        match desc.family {
            Family::Narrow => narrow::clear_mask(&mut b)?,
            Family::Wide => wide::clear_mask(&mut b, self.config.features.avx512bw)?,
        }
        if desc.is_load() {
            match desc.family {
                Family::Narrow => narrow::normalize_width(&mut b)?,
                Family::Wide => wide::normalize_width(&mut b)?,
            }
        }

        self.scratch.emit_restore(&mut b.nodes, gpr, spilled)?;
        if let Some(value) = value_gpr {
            alloc.unreserve_gpr(&mut b.nodes, value)?;
        }
        alloc.unreserve_gpr(&mut b.nodes, gpr)?;
        alloc.unreserve_flags(&mut b.nodes)?;

        let seq = b.finish();
        debug!(
            "expanded {:?} {:?} at {:#x}: {} lanes, {} nodes, scratch {:?}",
            desc.family,
            desc.direction,
            desc.app_pc,
            lanes,
            seq.len(),
            spilled
        );
        if self.config.trace {
            for node in &seq {
                match node {
                    Node::App { instr, .. } => debug!("    {}", instr),
                    Node::Meta(instr) => debug!("    {}    ; meta", instr),
                    Node::JumpIfZero(label) => debug!("    jz {:?}", label),
                    Node::Label(label) => debug!("  {:?}:", label),
                }
            }
        }
        unit.replace(at, seq);
        Ok(lanes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::TlsSlotAllocator;
    use crate::config::Bitness;
    use iced_x86::{Code, Mnemonic, Register};

    fn expand(bytes: &[u8], config: &ExpandConfig) -> Result<(Unit, u32), ExpandError> {
        let mut unit = Unit::decode(config.bitness, 0x1000, bytes).unwrap();
        let Some(Node::App { instr, .. }) = unit.nodes().first().cloned() else {
            panic!("empty unit");
        };
        let desc = InstructionDescriptor::extract(&instr, config.bitness)?;
        let scratch = ScratchStateManager::new(config);
        let mut alloc = TlsSlotAllocator::with_defaults(config.bitness);
        let lanes = Expander::new(config, &scratch).expand(&mut unit, 0, &desc, &mut alloc)?;
        alloc.finish()?;
        Ok((unit, lanes))
    }

    fn codes(unit: &Unit) -> Vec<Code> {
        unit.nodes()
            .iter()
            .filter_map(|n| n.instruction().map(|i| i.code()))
            .collect()
    }

    #[test]
    fn test_narrow_gather_shape() {
        let config = ExpandConfig::default();
        // vpgatherdd ymm0, [rax+ymm1*4], ymm2
        let (unit, lanes) = expand(&[0xC4, 0xE2, 0x6D, 0x90, 0x04, 0x88], &config).unwrap();
        assert_eq!(lanes, 8);
        let jumps = unit
            .nodes()
            .iter()
            .filter(|n| matches!(n, Node::JumpIfZero(_)))
            .count();
        assert_eq!(jumps, 8);
        let codes = codes(&unit);
        assert_eq!(codes.iter().filter(|&&c| c == Code::Mov_r32_rm32).count(), 8);
        assert_eq!(codes.iter().filter(|&&c| c == Code::Movsxd_r64_rm32).count(), 8);
        assert!(codes.contains(&Code::VEX_Vpxor_ymm_ymm_ymmm256));
        assert!(codes.contains(&Code::EVEX_Vmovaps_zmmm512_k1z_zmm));
        // ymm destination: no width normalization
        assert!(!codes.contains(&Code::VEX_Vmovdqa_xmm_xmmm128));
        assert!(unit.encode(0x7000_0000).is_ok());
    }

    #[test]
    fn test_narrow_loads_use_base_and_scale() {
        let config = ExpandConfig::default();
        let (unit, _) = expand(&[0xC4, 0xE2, 0x6D, 0x90, 0x04, 0x88], &config).unwrap();
        let load = unit
            .nodes()
            .iter()
            .filter_map(Node::instruction)
            .find(|i| i.code() == Code::Mov_r32_rm32 && i.memory_base() == Register::RAX)
            .unwrap();
        assert_eq!(load.memory_index(), Register::RCX);
        assert_eq!(load.memory_index_scale(), 4);
        assert_eq!(load.op0_register(), Register::ECX);
    }

    #[test]
    fn test_wide_scatter_shape() {
        let config = ExpandConfig::default();
        // vpscatterdd [rax+zmm1*4]{k1}, zmm0
        let (unit, lanes) = expand(&[0x62, 0xF2, 0x7D, 0x49, 0xA0, 0x04, 0x88], &config).unwrap();
        assert_eq!(lanes, 16);
        let codes = codes(&unit);
        assert_eq!(codes.iter().filter(|&&c| c == Code::Mov_rm32_r32).count(), 16);
        assert_eq!(codes.iter().filter(|&&c| c == Code::VEX_Kandnw_kr_kr_kr).count(), 16);
        assert_eq!(codes.last().copied(), Some(Code::Mov_r64_rm64));
        assert!(codes.contains(&Code::VEX_Kxorq_kr_kr_kr));
    }

    #[test]
    fn test_kxorw_without_bw() {
        let mut config = ExpandConfig::default();
        config.features.avx512bw = false;
        // vpgatherdd zmm0{k1}, [rax+zmm1*4]
        let (unit, _) = expand(&[0x62, 0xF2, 0x7D, 0x49, 0x90, 0x04, 0x88], &config).unwrap();
        let codes = codes(&unit);
        assert!(codes.contains(&Code::VEX_Kxorw_kr_kr_kr));
        assert!(!codes.contains(&Code::VEX_Kxorq_kr_kr_kr));
    }

    #[test]
    fn test_xmm_destination_normalized() {
        let config = ExpandConfig::default();
        // vpgatherdd xmm0, [rax+xmm1*4], xmm2
        let (unit, lanes) = expand(&[0xC4, 0xE2, 0x69, 0x90, 0x04, 0x88], &config).unwrap();
        assert_eq!(lanes, 4);
        let normalize = unit
            .nodes()
            .iter()
            .filter_map(Node::instruction)
            .find(|i| i.code() == Code::VEX_Vmovdqa_xmm_xmmm128)
            .unwrap();
        assert_eq!(normalize.op0_register(), Register::XMM0);
        assert!(codes(&unit).contains(&Code::VEX_Vpxor_xmm_xmm_xmmm128));
    }

    #[test]
    fn test_32bit_qword_unsupported() {
        let config = ExpandConfig {
            bitness: Bitness::B32,
            ..ExpandConfig::default()
        };
        // vpgatherdq ymm0, [eax+xmm1*8], ymm2
        let err = expand(&[0xC4, 0xE2, 0xED, 0x90, 0x04, 0xC8], &config).unwrap_err();
        assert!(matches!(err, ExpandError::Unsupported(_)));
    }

    #[test]
    fn test_32bit_dword_gather() {
        let config = ExpandConfig {
            bitness: Bitness::B32,
            ..ExpandConfig::default()
        };
        let (unit, lanes) = expand(&[0xC4, 0xE2, 0x6D, 0x90, 0x04, 0x88], &config).unwrap();
        assert_eq!(lanes, 8);
        let instrs: Vec<_> = unit.nodes().iter().filter_map(Node::instruction).collect();
        assert!(instrs.iter().all(|i| i.mnemonic() != Mnemonic::Movsxd));
        assert!(instrs
            .iter()
            .any(|i| i.mnemonic() == Mnemonic::Mov && i.segment_prefix() == Register::FS));
    }
}
