//! Unit-level behavior of the expansion entry point.

mod common;

use common::*;
use iced_x86::Code;
use scalarize::error::AllocError;
use scalarize::{
    Bitness, ExpandConfig, ExpandError, Expansion, Node, Phase, ProcessorFeatures,
    ScatterGather, TlsSlotAllocator, Unit,
};

fn expand(sg: &ScatterGather, bytes: &[u8]) -> (Unit, Result<Expansion, ExpandError>) {
    let bitness = sg.config().bitness;
    let mut unit = Unit::decode(bitness, APP_PC, bytes).unwrap();
    let mut alloc = TlsSlotAllocator::with_defaults(bitness);
    let result = sg.expand_unit(&mut unit, Phase::AppToApp, &mut alloc);
    if result.is_ok() {
        alloc.finish().unwrap();
    }
    (unit, result)
}

#[test]
fn test_plain_code_is_not_applicable() {
    let sg = ScatterGather::new(ExpandConfig::default());
    // nop; add eax, ecx
    let (unit, result) = expand(&sg, &[0x90, 0x01, 0xC8]);
    assert_eq!(result.unwrap(), Expansion::NotApplicable);
    assert_eq!(unit.len(), 2);
    assert!(!sg.has_expanded());
}

#[test]
fn test_gather_after_other_code_starts_next_unit() {
    let sg = ScatterGather::new(ExpandConfig::default());
    let mut bytes = vec![0x90];
    bytes.extend_from_slice(&VPGATHERDD_YMM);
    bytes.push(0x90);
    let (unit, result) = expand(&sg, &bytes);
    assert_eq!(result.unwrap(), Expansion::NotApplicable);
    assert_eq!(unit.len(), 1);
    assert_eq!(unit.nodes()[0].instruction().unwrap().code(), Code::Nopd);
    assert!(!sg.has_expanded());
}

#[test]
fn test_trailing_code_dropped() {
    let sg = ScatterGather::new(ExpandConfig::default());
    let mut bytes = VPGATHERDD_ZMM.to_vec();
    bytes.extend_from_slice(&[0x90, 0x90]);
    let (unit, result) = expand(&sg, &bytes);
    assert_eq!(result.unwrap(), Expansion::Expanded { lanes: 16 });
    assert!(sg.has_expanded());
    let jumps = unit
        .nodes()
        .iter()
        .filter(|n| matches!(n, Node::JumpIfZero(_)))
        .count();
    assert_eq!(jumps, 16);
    assert!(
        unit.nodes()
            .iter()
            .filter_map(Node::instruction)
            .all(|i| i.code() != Code::Nopd)
    );
}

#[test]
fn test_reexpansion_is_identical() {
    let sg = ScatterGather::new(ExpandConfig::default());
    for bytes in [&VPGATHERDD_YMM[..], &VPGATHERQQ_ZMM[..], &VPSCATTERDD_ZMM[..]] {
        let (first, a) = expand(&sg, bytes);
        let (second, b) = expand(&sg, bytes);
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(
            first.encode(CACHE_PC).unwrap(),
            second.encode(CACHE_PC).unwrap()
        );
    }
}

#[test]
fn test_only_app_to_app_phase_expands() {
    let sg = ScatterGather::new(ExpandConfig::default());
    for phase in [Phase::Analysis, Phase::Insertion, Phase::InstrToInstr] {
        let mut unit = Unit::decode(Bitness::B64, APP_PC, &VPGATHERDD_YMM).unwrap();
        let mut alloc = TlsSlotAllocator::with_defaults(Bitness::B64);
        let err = sg.expand_unit(&mut unit, phase, &mut alloc).unwrap_err();
        assert!(matches!(err, ExpandError::WrongPhase));
        assert_eq!(unit.len(), 1);
        assert!(alloc.finish().is_ok());
    }
    assert!(!sg.has_expanded());
}

#[test]
fn test_qword_elements_unsupported_in_32bit() {
    let sg = ScatterGather::new(ExpandConfig {
        bitness: Bitness::B32,
        ..ExpandConfig::default()
    });
    for bytes in [&VPGATHERDQ_YMM[..], &VPGATHERQD_XMM[..]] {
        let (unit, result) = expand(&sg, bytes);
        assert!(matches!(result, Err(ExpandError::Unsupported(_))));
        assert_eq!(unit.len(), 1);
        assert!(unit.nodes()[0].is_app());
    }
}

#[test]
fn test_wide_needs_avx512() {
    let sg = ScatterGather::new(ExpandConfig {
        features: ProcessorFeatures {
            avx512: false,
            avx512bw: false,
        },
        ..ExpandConfig::default()
    });
    let (unit, result) = expand(&sg, &VPGATHERDD_ZMM);
    assert!(matches!(result, Err(ExpandError::Unsupported(_))));
    assert_eq!(unit.len(), 1);
}

#[test]
fn test_allocator_exhaustion() {
    let sg = ScatterGather::new(ExpandConfig::default());
    let mut unit = Unit::decode(Bitness::B64, APP_PC, &VPSCATTERDD_ZMM).unwrap();
    // A scatter needs an index, a value and a k0 save register.
    let mut alloc = TlsSlotAllocator::new(Bitness::B64, 0x200, 2);
    let err = sg
        .expand_unit(&mut unit, Phase::AppToApp, &mut alloc)
        .unwrap_err();
    assert!(matches!(err, ExpandError::Alloc(AllocError::Exhausted)));
}

#[test]
fn test_base_register_never_allocated() {
    // vpgatherdd ymm0, [rcx+ymm1*4], ymm2
    let bytes = [0xC4, 0xE2, 0x6D, 0x90, 0x04, 0x89];
    let h = Harness::new(&bytes);
    assert_eq!(h.desc.base, iced_x86::Register::RCX);
    for load in h.accesses() {
        assert_eq!(load.memory_base(), iced_x86::Register::RCX);
        assert_ne!(load.memory_index(), iced_x86::Register::RCX);
    }
}

#[test]
fn test_mask_clear_follows_features() {
    let bw = Harness::new(&VPGATHERDD_ZMM);
    assert!(bw.instructions().iter().any(|i| i.code() == Code::VEX_Kxorq_kr_kr_kr));

    let config = ExpandConfig {
        features: ProcessorFeatures {
            avx512: true,
            avx512bw: false,
        },
        ..ExpandConfig::default()
    };
    let no_bw = Harness::with_config(config, &VPGATHERDD_ZMM);
    let codes: Vec<Code> = no_bw.instructions().iter().map(|i| i.code()).collect();
    assert!(codes.contains(&Code::VEX_Kxorw_kr_kr_kr));
    assert!(!codes.contains(&Code::VEX_Kxorq_kr_kr_kr));
}
