//! Shared setup for the integration tests: expand one instruction, place it
//! in a simulated code cache and run it against paged memory.

#![allow(dead_code)]

use iced_x86::{Decoder, DecoderOptions, Instruction, Mnemonic, OpKind, Register};

use scalarize::descriptor::InstructionDescriptor;
use scalarize::ir::{is_tls_access, regs};
use scalarize::recover::RecoveryOutcome;
use scalarize::sim::{PAGE_SIZE, Simulator, Stop};
use scalarize::{
    Bitness, EncodedUnit, ExpandConfig, Expansion, Family, MachineContext, Node, Phase,
    ProcessorFeatures, RestoreStateQuery, ScatterGather, TlsSlotAllocator, Unit,
};

pub const APP_PC: u64 = 0x40_0000;
pub const CACHE_PC: u64 = 0x7000_0000;
pub const TLS_BASE: u64 = 0x9000_0000;
pub const SLOT_ADDR: u64 = 0x9100_0000;
pub const DATA_BASE: u64 = 0x20_0000;
pub const DATA_SIZE: u64 = 0x2000;

/// vpgatherdd ymm0, [rax+ymm1*4], ymm2
pub const VPGATHERDD_YMM: [u8; 6] = [0xC4, 0xE2, 0x6D, 0x90, 0x04, 0x88];
/// vpgatherdd xmm0, [rax+xmm1*4], xmm2
pub const VPGATHERDD_XMM: [u8; 6] = [0xC4, 0xE2, 0x69, 0x90, 0x04, 0x88];
/// vpgatherdq ymm0, [rax+xmm1*8], ymm2
pub const VPGATHERDQ_YMM: [u8; 6] = [0xC4, 0xE2, 0xED, 0x90, 0x04, 0xC8];
/// vpgatherqd xmm0, [rax+ymm1*4], xmm2
pub const VPGATHERQD_XMM: [u8; 6] = [0xC4, 0xE2, 0x6D, 0x91, 0x04, 0x88];
/// vpgatherdd zmm0{k1}, [rax+zmm1*4]
pub const VPGATHERDD_ZMM: [u8; 7] = [0x62, 0xF2, 0x7D, 0x49, 0x90, 0x04, 0x88];
/// vpgatherdd ymm0{k1}, [rax+ymm1*4]
pub const VPGATHERDD_EVEX_YMM: [u8; 7] = [0x62, 0xF2, 0x7D, 0x29, 0x90, 0x04, 0x88];
/// vpgatherqq zmm0{k1}, [rax+zmm1*8]
pub const VPGATHERQQ_ZMM: [u8; 7] = [0x62, 0xF2, 0xFD, 0x49, 0x91, 0x04, 0xC8];
/// vpscatterdd [rax+zmm1*4]{k1}, zmm0
pub const VPSCATTERDD_ZMM: [u8; 7] = [0x62, 0xF2, 0x7D, 0x49, 0xA0, 0x04, 0x88];
/// vpscatterqq [rax+zmm1*8]{k1}, zmm0
pub const VPSCATTERQQ_ZMM: [u8; 7] = [0x62, 0xF2, 0xFD, 0x49, 0xA1, 0x04, 0xC8];

/// Value stored in the data region at `DATA_BASE + 4*i`.
pub fn pattern(i: u64) -> u64 {
    0xD000_0000 + i
}

/// One expanded scatter/gather, laid out at `CACHE_PC`.
pub struct Harness {
    pub sg: ScatterGather,
    pub app_code: Vec<u8>,
    pub desc: InstructionDescriptor,
    pub lanes: u32,
    pub encoded: EncodedUnit,
}

impl Harness {
    pub fn new(bytes: &[u8]) -> Self {
        Self::with_config(ExpandConfig::default(), bytes)
    }

    pub fn with_config(config: ExpandConfig, bytes: &[u8]) -> Self {
        Self::padded(config, bytes, 0)
    }

    /// Like `with_config`, with `pad` nops laid out after every generated
    /// instruction.
    pub fn padded(config: ExpandConfig, bytes: &[u8], pad: usize) -> Self {
        let sg = ScatterGather::new(config);
        let bitness = sg.config().bitness;
        let mut unit = Unit::decode(bitness, APP_PC, bytes).unwrap();
        let app = *unit.nodes()[0].instruction().unwrap();
        let desc = InstructionDescriptor::extract(&app, bitness).unwrap();
        let mut alloc = TlsSlotAllocator::with_defaults(bitness);
        let expansion = sg
            .expand_unit(&mut unit, Phase::AppToApp, &mut alloc)
            .unwrap();
        alloc.finish().unwrap();
        let Expansion::Expanded { lanes } = expansion else {
            panic!("{:02x?} was not expanded", bytes);
        };
        let encoded = interleave_nops(&unit, pad).encode(CACHE_PC).unwrap();
        Self {
            sg,
            app_code: bytes.to_vec(),
            desc,
            lanes,
            encoded,
        }
    }

    pub fn bitness(&self) -> Bitness {
        self.sg.config().bitness
    }

    /// Simulator with TLS, the spill slot and a patterned data region mapped;
    /// the base register points at the data region.
    pub fn machine(&self) -> Simulator {
        let config = self.sg.config();
        let mut sim = Simulator::new(config.bitness);
        sim.mem.map(TLS_BASE, PAGE_SIZE);
        sim.mem.map(SLOT_ADDR, PAGE_SIZE);
        sim.mem.map(DATA_BASE, DATA_SIZE);
        match config.bitness {
            Bitness::B64 => sim.gs_base = TLS_BASE,
            Bitness::B32 => sim.fs_base = TLS_BASE,
        }
        sim.mem
            .write_uint(
                TLS_BASE + config.tls_spill_slot_offset as u64,
                config.bitness.gpr_bytes(),
                SLOT_ADDR,
            )
            .unwrap();
        for i in 0..DATA_SIZE / 4 {
            sim.mem.write_uint(DATA_BASE + 4 * i, 4, pattern(i)).unwrap();
        }
        if self.desc.base != Register::None {
            sim.ctx.set_gpr(self.desc.base, DATA_BASE);
        }
        sim
    }

    pub fn set_indices(&self, sim: &mut Simulator, indices: &[u64]) {
        for (lane, &index) in indices.iter().enumerate() {
            sim.ctx
                .set_vector_element(self.desc.index, lane as u32, self.desc.index_width, index);
        }
    }

    /// Data register lanes set to `seed + lane`.
    pub fn fill_data(&self, sim: &mut Simulator, seed: u64) {
        for lane in 0..self.lanes {
            sim.ctx.set_vector_element(
                self.desc.data,
                lane,
                self.desc.value_width,
                seed + lane as u64,
            );
        }
    }

    pub fn set_mask(&self, sim: &mut Simulator, bits: u64) {
        match self.desc.family {
            Family::Wide => sim.ctx.set_opmask(self.desc.mask, bits),
            Family::Narrow => {
                for lane in 0..self.lanes {
                    let element = if bits >> lane & 1 == 1 { u64::MAX } else { 0 };
                    sim.ctx
                        .set_vector_element(self.desc.mask, lane, self.desc.value_width, element);
                }
            }
        }
    }

    /// Active lanes of `ctx` as a bitmap.
    pub fn mask(&self, ctx: &MachineContext) -> u64 {
        match self.desc.family {
            Family::Wide => ctx.opmask(self.desc.mask),
            Family::Narrow => {
                let sign = self.desc.value_width * 8 - 1;
                (0..self.lanes)
                    .filter(|&lane| {
                        ctx.vector_element(self.desc.mask, lane, self.desc.value_width) >> sign
                            & 1
                            == 1
                    })
                    .fold(0, |acc, lane| acc | 1 << lane)
            }
        }
    }

    pub fn all_lanes(&self) -> u64 {
        (1u64 << self.lanes) - 1
    }

    /// The scratch vector register at the width it is spilled with.
    pub fn scratch_register(&self) -> Register {
        let scratch = self.sg.scratch();
        let xmm = scratch.choose_scratch_xmm(&self.desc).unwrap();
        scratch.spilled_register(xmm).unwrap()
    }

    pub fn run_original(&self, sim: &mut Simulator) -> Stop {
        sim.run(&self.app_code, APP_PC, None).unwrap()
    }

    pub fn run_expanded(&self, sim: &mut Simulator, fault_at: Option<u64>) -> Stop {
        sim.run(&self.encoded.code, self.encoded.start_pc, fault_at)
            .unwrap()
    }

    pub fn instructions(&self) -> Vec<Instruction> {
        self.encoded.instructions()
    }

    /// Scalar element loads and stores, in lane order.
    pub fn accesses(&self) -> Vec<Instruction> {
        self.instructions()
            .into_iter()
            .filter(|i| {
                i.mnemonic() == Mnemonic::Mov
                    && (i.op_kind(0) == OpKind::Memory || i.op_kind(1) == OpKind::Memory)
                    && !is_tls_access(i)
            })
            .collect()
    }

    /// Instructions that clear a lane's mask bit or element, in lane order.
    pub fn mask_updates(&self) -> Vec<Instruction> {
        let mask = self.desc.mask;
        self.instructions()
            .into_iter()
            .filter(|i| match self.desc.family {
                Family::Wide => i.mnemonic() == Mnemonic::Kandnw && i.op0_register() == mask,
                Family::Narrow => {
                    i.mnemonic() == Mnemonic::Vinserti128 && regs::same_vector(i.op0_register(), mask)
                }
            })
            .collect()
    }

    /// Instruction following the one at `pc`.
    pub fn after(&self, pc: u64) -> Instruction {
        let instructions = self.instructions();
        let pos = instructions.iter().position(|i| i.ip() == pc).unwrap();
        instructions[pos + 1]
    }

    /// Run fault recovery for a stopped simulator. Returns the outcome and
    /// the corrected context.
    pub fn recover(&self, sim: &Simulator) -> (RecoveryOutcome, MachineContext) {
        let mut thread = self.sg.thread_init();
        let mut slot = [0u8; 64];
        sim.mem.read(SLOT_ADDR, &mut slot).unwrap();
        thread.bytes_mut().copy_from_slice(&slot);

        let raw = sim.ctx.clone();
        let mut translated = raw.clone();
        let query = self.query(&raw);
        let outcome = self.sg.try_recover(&thread, &query, &mut translated);
        self.sg.thread_exit(thread);
        (outcome, translated)
    }

    pub fn query<'a>(&'a self, raw: &'a MachineContext) -> RestoreStateQuery<'a> {
        RestoreStateQuery {
            cache_start_pc: Some(self.encoded.start_pc),
            code: &self.encoded.code,
            app_pc: APP_PC,
            app_code: &self.app_code,
            app_code_consistent: true,
            raw,
        }
    }
}

/// Bytes of the data region.
pub fn data_region(sim: &Simulator) -> Vec<u8> {
    let mut bytes = vec![0u8; DATA_SIZE as usize];
    sim.mem.read(DATA_BASE, &mut bytes).unwrap();
    bytes
}

/// Fill `reg` with a recognizable byte pattern and return it.
pub fn scratch_pattern(sim: &mut Simulator, reg: Register) -> Vec<u8> {
    let size = regs::vector_size(reg).unwrap() as u8;
    let bytes: Vec<u8> = (0..size).map(|b| b.wrapping_mul(7) ^ 0x5C).collect();
    sim.ctx.set_vector(reg, &bytes);
    bytes
}

fn interleave_nops(unit: &Unit, pad: usize) -> Unit {
    if pad == 0 {
        return unit.clone();
    }
    let nop = Decoder::with_ip(unit.bitness().bits(), &[0x90], 0, DecoderOptions::NONE).decode();
    let mut padded = Unit::new(unit.bitness(), unit.app_pc());
    for node in unit.nodes() {
        padded.push(node.clone());
        if !matches!(node, Node::Label(_)) {
            for _ in 0..pad {
                padded.push(Node::Meta(nop));
            }
        }
    }
    padded
}

/// Every expandable form, under the configurations recovery has to handle.
pub fn recovery_forms() -> Vec<(&'static str, ExpandConfig, &'static [u8])> {
    let b32 = ExpandConfig {
        bitness: Bitness::B32,
        ..ExpandConfig::default()
    };
    let ymm_spill = ExpandConfig {
        features: ProcessorFeatures {
            avx512: false,
            avx512bw: false,
        },
        ..ExpandConfig::default()
    };
    let default = ExpandConfig::default;
    let forms: [(&'static str, ExpandConfig, &'static [u8]); 12] = [
        ("vpgatherdd ymm", default(), &VPGATHERDD_YMM),
        ("vpgatherdd xmm", default(), &VPGATHERDD_XMM),
        ("vpgatherdq ymm", default(), &VPGATHERDQ_YMM),
        ("vpgatherqd xmm", default(), &VPGATHERQD_XMM),
        ("vpgatherdd zmm", default(), &VPGATHERDD_ZMM),
        ("vpgatherdd evex ymm", default(), &VPGATHERDD_EVEX_YMM),
        ("vpgatherqq zmm", default(), &VPGATHERQQ_ZMM),
        ("vpscatterdd zmm", default(), &VPSCATTERDD_ZMM),
        ("vpscatterqq zmm", default(), &VPSCATTERQQ_ZMM),
        ("vpgatherdd ymm, 32-bit", b32, &VPGATHERDD_YMM),
        ("vpgatherdd ymm, ymm spill", ymm_spill.clone(), &VPGATHERDD_YMM),
        ("vpgatherdq ymm, ymm spill", ymm_spill, &VPGATHERDQ_YMM),
    ];
    forms.into()
}
