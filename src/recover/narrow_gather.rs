//! AVX2 gather lane blocks.

use iced_x86::{Instruction, Mnemonic, OpKind, Register};

use super::{Progress, Step};
use crate::ir::regs;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Save,
    /// vextracti128 of the mask
    LaneStart,
    MaskElement,
    /// index extraction happens here as well; the last vpextr wins
    Access,
    DataExtract,
    DataPack,
    DataInsert,
    ZeroGpr,
    MaskExtract,
    MaskPack,
    MaskInsert,
    Epilogue,
}

pub(crate) struct NarrowGather {
    p: Progress,
    state: State,
    index_gpr: Option<Register>,
    value_gpr: Option<Register>,
}

impl NarrowGather {
    pub(crate) fn new(p: Progress) -> Self {
        Self {
            p,
            state: State::Save,
            index_gpr: None,
            value_gpr: None,
        }
    }

    pub(crate) fn progress(&self) -> &Progress {
        &self.p
    }

    pub(crate) fn state_name(&self) -> &'static str {
        match self.state {
            State::Save => "save",
            State::LaneStart => "lane-start",
            State::MaskElement => "mask-element",
            State::Access => "access",
            State::DataExtract => "data-extract",
            State::DataPack => "data-pack",
            State::DataInsert => "data-insert",
            State::ZeroGpr => "zero-gpr",
            State::MaskExtract => "mask-extract",
            State::MaskPack => "mask-pack",
            State::MaskInsert => "mask-insert",
            State::Epilogue => "epilogue",
        }
    }

    fn goto(&mut self, state: State) {
        self.p.matched();
        self.state = state;
    }

    fn unknown(&mut self) {
        if self.p.unknown() {
            self.state = State::LaneStart;
        }
    }

    pub(crate) fn advance(&mut self, instr: &Instruction) -> Step {
        let desc = self.p.desc;
        match self.state {
            State::Save => {
                if self.p.match_save(instr) {
                    if let Some(step) = self.p.at_save(instr) {
                        return step;
                    }
                    self.state = State::LaneStart;
                }
            }
            State::LaneStart => {
                if self.p.is_chunk_extract(instr, desc.mask) {
                    self.goto(State::MaskElement);
                } else {
                    self.unknown();
                }
            }
            State::MaskElement => match self.p.element_to_gpr(instr) {
                Some(gpr) => {
                    self.index_gpr = Some(gpr);
                    self.goto(State::Access);
                }
                None => self.unknown(),
            },
            State::Access => {
                if let Some(gpr) = self.p.element_to_gpr(instr) {
                    self.index_gpr = Some(gpr);
                    self.p.matched();
                } else if let Some(value) = self.p.scalar_load(instr, self.index_gpr) {
                    self.value_gpr = Some(value);
                    self.p.open_mask_window(instr);
                    self.goto(State::DataExtract);
                } else {
                    self.unknown();
                }
            }
            State::DataExtract => {
                if self.p.is_chunk_extract(instr, desc.data) {
                    self.goto(State::DataPack);
                } else {
                    self.unknown();
                }
            }
            State::DataPack => {
                if self.p.is_element_insert(instr, self.value_gpr) {
                    self.goto(State::DataInsert);
                } else {
                    self.unknown();
                }
            }
            State::DataInsert => {
                if self.p.is_chunk_insert(instr, desc.data) {
                    self.goto(State::ZeroGpr);
                } else {
                    self.unknown();
                }
            }
            State::ZeroGpr => {
                let zeroing = instr.mnemonic() == Mnemonic::Xor
                    && instr.op_kind(0) == OpKind::Register
                    && instr.op_kind(1) == OpKind::Register
                    && instr.op0_register() == instr.op1_register()
                    && regs::gpr_number(instr.op0_register()).is_some();
                if zeroing {
                    self.goto(State::MaskExtract);
                } else {
                    self.unknown();
                }
            }
            State::MaskExtract => {
                if self.p.is_chunk_extract(instr, desc.mask) {
                    self.goto(State::MaskPack);
                } else {
                    self.unknown();
                }
            }
            State::MaskPack => {
                if self.p.is_element_insert(instr, None) {
                    self.goto(State::MaskInsert);
                } else {
                    self.unknown();
                }
            }
            State::MaskInsert => {
                if self.p.is_chunk_insert(instr, desc.mask) {
                    if self.p.fault_reached(instr) {
                        return Step::Done(self.p.lane_fixups());
                    }
                    let next = if self.p.next_lane() {
                        State::LaneStart
                    } else {
                        State::Epilogue
                    };
                    self.goto(next);
                } else {
                    self.unknown();
                }
            }
            State::Epilogue => return self.p.epilogue(instr, desc.mask),
        }
        Step::Continue
    }
}
