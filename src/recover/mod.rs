//! Restore-state recovery for faults inside an expanded sequence.
//!
//! The generated code is the only record of what was expanded, so recovery
//! decodes the unit from its start and follows the lane blocks with a small
//! state machine per family and direction until it passes the fault pc.
//! Corrections are collected while walking and applied only once the walk
//! completes; a walk that gives up leaves the state untouched.

mod narrow_gather;
mod wide_gather;
mod wide_scatter;

use iced_x86::{Decoder, DecoderOptions, Instruction, Mnemonic, OpKind, Register};
use log::{trace, warn};

use crate::config::ExpandConfig;
use crate::descriptor::{Direction, Family, InstructionDescriptor, is_scatter_gather};
use crate::ir::{is_tls_access, regs};
use crate::machine::MachineContext;
use crate::scratch::{ScratchStateManager, ThreadScratch};
use narrow_gather::NarrowGather;
use wide_gather::WideGather;
use wide_scatter::WideScatter;

/// What fault translation knows about an interrupted unit.
#[derive(Debug, Clone, Copy)]
pub struct RestoreStateQuery<'a> {
    /// Start of the unit in the code cache; `None` when the fault is elsewhere.
    pub cache_start_pc: Option<u64>,
    /// Code of the unit, starting at `cache_start_pc`.
    pub code: &'a [u8],
    /// Application address the unit was built from.
    pub app_pc: u64,
    /// Application bytes at `app_pc`.
    pub app_code: &'a [u8],
    pub app_code_consistent: bool,
    /// State at the fault; `raw.pc` is the fault pc.
    pub raw: &'a MachineContext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NeverExpanded,
    NotInCache,
    AppCodeInconsistent,
    NotScatterGather,
}

/// Why a walk could not place the fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveUp {
    Undecodable { pc: u64 },
    ScatterGatherInStream { pc: u64 },
    /// More lane blocks than the instruction has lanes.
    LaneOverrun,
    /// Lookahead or code exhausted before the fault point.
    FaultNotReached,
}

/// Corrections applied to the translated state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Restored {
    /// Lane whose block contained the fault, if any.
    pub lane: Option<u32>,
    /// Lane whose mask bit was forced clear.
    pub cleared_lane: Option<u32>,
    /// k0 low bits reloaded from the save register.
    pub restored_k0: bool,
    /// Scratch register reloaded from the spill slot.
    pub restored_scratch: Option<Register>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Not ours; nothing was decoded.
    Skipped(SkipReason),
    /// Ours, but the fault point could not be placed. State unchanged.
    Unresolved(GiveUp),
    Restored(Restored),
}

/// Pending corrections.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Fixups {
    lane: Option<u32>,
    clear_lane: Option<u32>,
    k0_from: Option<Register>,
    scratch: Option<Register>,
}

pub(crate) enum Step {
    Continue,
    Done(Fixups),
    GiveUp(GiveUp),
}

/// Walk state shared by every machine.
pub(crate) struct Progress {
    desc: InstructionDescriptor,
    fault_pc: u64,
    skip_max: u32,
    skipped: u32,
    lane: u32,
    spilled: Option<Register>,
    scratch_xmm: Register,
    /// pc just after the current lane's memory access
    mask_window_start: Option<u64>,
}

impl Progress {
    fn new(desc: InstructionDescriptor, fault_pc: u64, skip_max: u32) -> Self {
        Self {
            desc,
            fault_pc,
            skip_max,
            skipped: 0,
            lane: 0,
            spilled: None,
            scratch_xmm: Register::None,
            mask_window_start: None,
        }
    }

    fn fault_reached(&self, instr: &Instruction) -> bool {
        self.fault_pc <= instr.ip()
    }

    /// Count an unrecognized instruction; true once the tolerance is used up.
    fn unknown(&mut self) -> bool {
        self.skipped += 1;
        if self.skipped > self.skip_max {
            self.skipped = 0;
            self.mask_window_start = None;
            true
        } else {
            false
        }
    }

    fn matched(&mut self) {
        self.skipped = 0;
    }

    /// Scratch register store; records the register.
    fn match_save(&mut self, instr: &Instruction) -> bool {
        if !is_vector_move(instr)
            || instr.op_kind(0) != OpKind::Memory
            || instr.op_kind(1) != OpKind::Register
        {
            return false;
        }
        let reg = instr.op1_register();
        if !matches!(regs::vector_size(reg), Some(32) | Some(64)) {
            return false;
        }
        self.spilled = Some(reg);
        self.scratch_xmm = regs::xmm(reg).unwrap_or(Register::None);
        true
    }

    /// Done at the save itself, or keep walking.
    fn at_save(&mut self, instr: &Instruction) -> Option<Step> {
        if self.fault_reached(instr) {
            return Some(Step::Done(Fixups::default()));
        }
        self.matched();
        None
    }

    /// `vextract* scratch, from, imm`
    fn is_chunk_extract(&self, instr: &Instruction, from: Register) -> bool {
        matches!(instr.mnemonic(), Mnemonic::Vextracti128 | Mnemonic::Vextracti32x4)
            && instr.op_kind(0) == OpKind::Register
            && instr.op0_register() == self.scratch_xmm
            && regs::same_vector(instr.op1_register(), from)
    }

    /// `vpextrd/q gpr, scratch, imm`
    fn element_to_gpr(&self, instr: &Instruction) -> Option<Register> {
        if matches!(instr.mnemonic(), Mnemonic::Vpextrd | Mnemonic::Vpextrq)
            && instr.op_kind(0) == OpKind::Register
            && instr.op1_register() == self.scratch_xmm
        {
            Some(instr.op0_register())
        } else {
            None
        }
    }

    /// `vpinsrd/q scratch, scratch, gpr, imm`
    fn is_element_insert(&self, instr: &Instruction, gpr: Option<Register>) -> bool {
        matches!(instr.mnemonic(), Mnemonic::Vpinsrd | Mnemonic::Vpinsrq)
            && instr.op0_register() == self.scratch_xmm
            && instr.op_kind(2) == OpKind::Register
            && gpr.is_none_or(|g| regs::same_gpr(instr.op2_register(), g))
    }

    /// `vinsert* into, into, scratch, imm`
    fn is_chunk_insert(&self, instr: &Instruction, into: Register) -> bool {
        matches!(instr.mnemonic(), Mnemonic::Vinserti128 | Mnemonic::Vinserti32x4)
            && regs::same_vector(instr.op0_register(), into)
            && instr.op2_register() == self.scratch_xmm
    }

    /// Scalar element load addressed by `index`; returns the destination.
    fn scalar_load(&self, instr: &Instruction, index: Option<Register>) -> Option<Register> {
        let index = index?;
        if instr.mnemonic() == Mnemonic::Mov
            && instr.op_kind(0) == OpKind::Register
            && instr.op_kind(1) == OpKind::Memory
            && !is_tls_access(instr)
            && uses_gpr(instr, index)
        {
            Some(instr.op0_register())
        } else {
            None
        }
    }

    /// Scalar element store of `value` addressed by `index`.
    fn is_scalar_store(
        &self,
        instr: &Instruction,
        index: Option<Register>,
        value: Option<Register>,
    ) -> bool {
        let (Some(index), Some(value)) = (index, value) else {
            return false;
        };
        instr.mnemonic() == Mnemonic::Mov
            && instr.op_kind(0) == OpKind::Memory
            && instr.op_kind(1) == OpKind::Register
            && !is_tls_access(instr)
            && uses_gpr(instr, index)
            && regs::same_gpr(instr.op1_register(), value)
    }

    fn open_mask_window(&mut self, instr: &Instruction) {
        self.mask_window_start = Some(instr.next_ip());
    }

    fn in_mask_window(&self) -> bool {
        self.mask_window_start
            .is_some_and(|start| start <= self.fault_pc)
    }

    /// Corrections for a fault inside the current lane block.
    fn lane_fixups(&self) -> Fixups {
        Fixups {
            lane: Some(self.lane),
            clear_lane: self.in_mask_window().then_some(self.lane),
            k0_from: None,
            scratch: self.spilled,
        }
    }

    /// Move to the next lane; false after the last one.
    fn next_lane(&mut self) -> bool {
        self.lane += 1;
        self.skipped = 0;
        self.mask_window_start = None;
        self.lane < self.desc.lane_count()
    }

    /// After the last lane: wait for the scratch reload.
    fn epilogue(&mut self, instr: &Instruction, lane_start: Register) -> Step {
        if self.is_chunk_extract(instr, lane_start) {
            return Step::GiveUp(GiveUp::LaneOverrun);
        }
        let reload = is_vector_move(instr)
            && instr.op_kind(0) == OpKind::Register
            && instr.op_kind(1) == OpKind::Memory
            && Some(instr.op0_register()) == self.spilled;
        if !reload {
            return Step::Continue;
        }
        let mut fix = Fixups::default();
        if self.fault_reached(instr) {
            fix.scratch = self.spilled;
        }
        Step::Done(fix)
    }
}

fn is_vector_move(instr: &Instruction) -> bool {
    matches!(
        instr.mnemonic(),
        Mnemonic::Vmovaps | Mnemonic::Vmovups | Mnemonic::Vmovdqa | Mnemonic::Vmovdqu
    )
}

fn uses_gpr(instr: &Instruction, gpr: Register) -> bool {
    regs::same_gpr(instr.memory_base(), gpr) || regs::same_gpr(instr.memory_index(), gpr)
}

fn is_kmov_from_k0(instr: &Instruction) -> Option<Register> {
    (instr.mnemonic() == Mnemonic::Kmovw
        && instr.op_kind(0) == OpKind::Register
        && regs::gpr_number(instr.op0_register()).is_some()
        && instr.op1_register() == Register::K0)
        .then(|| instr.op0_register())
}

fn is_kmov_to_k0(instr: &Instruction, from: Option<Register>) -> bool {
    instr.mnemonic() == Mnemonic::Kmovw
        && instr.op0_register() == Register::K0
        && instr.op_kind(1) == OpKind::Register
        && from.is_none_or(|g| regs::same_gpr(instr.op1_register(), g))
}

fn is_single_bit_mov(instr: &Instruction, lane: u32) -> Option<Register> {
    (instr.mnemonic() == Mnemonic::Mov
        && instr.op_kind(0) == OpKind::Register
        && matches!(
            instr.op_kind(1),
            OpKind::Immediate32 | OpKind::Immediate32to64 | OpKind::Immediate64
        )
        && instr.immediate(1) == 1u64 << lane)
        .then(|| instr.op0_register())
}

enum Machine {
    NarrowGather(NarrowGather),
    WideGather(WideGather),
    WideScatter(WideScatter),
}

impl Machine {
    fn for_descriptor(progress: Progress) -> Option<Self> {
        match (progress.desc.family, progress.desc.direction) {
            (Family::Narrow, Direction::Load) => {
                Some(Machine::NarrowGather(NarrowGather::new(progress)))
            }
            (Family::Wide, Direction::Load) => Some(Machine::WideGather(WideGather::new(progress))),
            (Family::Wide, Direction::Store) => {
                Some(Machine::WideScatter(WideScatter::new(progress)))
            }
            (Family::Narrow, Direction::Store) => None,
        }
    }

    fn advance(&mut self, instr: &Instruction) -> Step {
        match self {
            Machine::NarrowGather(m) => m.advance(instr),
            Machine::WideGather(m) => m.advance(instr),
            Machine::WideScatter(m) => m.advance(instr),
        }
    }

    fn state_name(&self) -> &'static str {
        match self {
            Machine::NarrowGather(m) => m.state_name(),
            Machine::WideGather(m) => m.state_name(),
            Machine::WideScatter(m) => m.state_name(),
        }
    }

    fn lane(&self) -> u32 {
        match self {
            Machine::NarrowGather(m) => m.progress().lane,
            Machine::WideGather(m) => m.progress().lane,
            Machine::WideScatter(m) => m.progress().lane,
        }
    }
}

/// Walk the unit starting at `start_pc` and repair `translated`.
pub fn restore_state(
    config: &ExpandConfig,
    scratch: &ScratchStateManager,
    desc: &InstructionDescriptor,
    thread: &ThreadScratch,
    query: &RestoreStateQuery<'_>,
    start_pc: u64,
    translated: &mut MachineContext,
) -> RecoveryOutcome {
    let fault_pc = query.raw.pc;
    let progress = Progress::new(*desc, fault_pc, config.skip_unknown_max);
    let Some(mut machine) = Machine::for_descriptor(progress) else {
        return RecoveryOutcome::Skipped(SkipReason::NotScatterGather);
    };
    let limit = fault_pc.saturating_add(config.lookahead_bytes);
    let mut decoder = Decoder::with_ip(
        config.bitness.bits(),
        query.code,
        start_pc,
        DecoderOptions::NONE,
    );
    let mut instr = Instruction::default();

    let reason = loop {
        if !decoder.can_decode() || decoder.ip() > limit {
            break GiveUp::FaultNotReached;
        }
        let pc = decoder.ip();
        decoder.decode_out(&mut instr);
        if instr.is_invalid() {
            break GiveUp::Undecodable { pc };
        }
        if is_scatter_gather(&instr) {
            break GiveUp::ScatterGatherInStream { pc };
        }
        let step = machine.advance(&instr);
        trace!(
            "{:#x} {:<40} lane {} {}",
            pc,
            instr.to_string(),
            machine.lane(),
            machine.state_name()
        );
        match step {
            Step::Continue => {}
            Step::Done(fix) => {
                return RecoveryOutcome::Restored(apply(
                    desc, scratch, thread, query.raw, fix, translated,
                ));
            }
            Step::GiveUp(reason) => break reason,
        }
    };

    match reason {
        GiveUp::FaultNotReached => trace!("fault {:#x} not reached", fault_pc),
        other => warn!("recovery at {:#x} gave up: {:?}", fault_pc, other),
    }
    RecoveryOutcome::Unresolved(reason)
}

fn apply(
    desc: &InstructionDescriptor,
    scratch: &ScratchStateManager,
    thread: &ThreadScratch,
    raw: &MachineContext,
    fix: Fixups,
    translated: &mut MachineContext,
) -> Restored {
    if let Some(lane) = fix.clear_lane {
        match desc.family {
            Family::Wide => {
                let mask = raw.opmask(desc.mask) & !(1u64 << lane);
                translated.set_opmask(desc.mask, mask);
            }
            Family::Narrow => {
                let width = desc.value_width;
                let element = raw.vector_element(desc.mask, lane, width);
                let cleared = element & !(1u64 << (width * 8 - 1));
                translated.set_vector_element(desc.mask, lane, width, cleared);
            }
        }
    }
    if let Some(save) = fix.k0_from {
        let k0 = (translated.opmask[0] & !0xFFFF) | (raw.gpr(save) & 0xFFFF);
        translated.opmask[0] = k0;
    }
    if let Some(spilled) = fix.scratch {
        scratch.restore_from_slot(thread, spilled, translated);
    }
    Restored {
        lane: fix.lane,
        cleared_lane: fix.clear_lane,
        restored_k0: fix.k0_from.is_some(),
        restored_scratch: fix.scratch,
    }
}
