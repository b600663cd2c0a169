//! AVX-512 gather lane blocks.

use iced_x86::{Instruction, Mnemonic, Register};

use super::{Progress, Step, is_kmov_from_k0, is_kmov_to_k0, is_single_bit_mov};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Save,
    /// vextracti32x4 of the index
    LaneStart,
    IndexElement,
    Access,
    DataExtract,
    DataPack,
    DataInsert,
    BitImm,
    SaveK0,
    InstallK0,
    Kandn,
    RestoreK0,
    Epilogue,
}

pub(crate) struct WideGather {
    p: Progress,
    state: State,
    index_gpr: Option<Register>,
    value_gpr: Option<Register>,
    bit_gpr: Option<Register>,
    save_gpr: Option<Register>,
    /// pc just after k0 receives the lane bit
    k0_window_start: Option<u64>,
}

impl WideGather {
    pub(crate) fn new(p: Progress) -> Self {
        Self {
            p,
            state: State::Save,
            index_gpr: None,
            value_gpr: None,
            bit_gpr: None,
            save_gpr: None,
            k0_window_start: None,
        }
    }

    pub(crate) fn progress(&self) -> &Progress {
        &self.p
    }

    pub(crate) fn state_name(&self) -> &'static str {
        match self.state {
            State::Save => "save",
            State::LaneStart => "lane-start",
            State::IndexElement => "index-element",
            State::Access => "access",
            State::DataExtract => "data-extract",
            State::DataPack => "data-pack",
            State::DataInsert => "data-insert",
            State::BitImm => "bit-imm",
            State::SaveK0 => "save-k0",
            State::InstallK0 => "install-k0",
            State::Kandn => "kandn",
            State::RestoreK0 => "restore-k0",
            State::Epilogue => "epilogue",
        }
    }

    fn goto(&mut self, state: State) {
        self.p.matched();
        self.state = state;
    }

    fn unknown(&mut self) {
        if self.p.unknown() {
            self.k0_window_start = None;
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
                if self.p.is_chunk_extract(instr, desc.index) {
                    self.k0_window_start = None;
                    self.goto(State::IndexElement);
                } else {
                    self.unknown();
                }
            }
            State::IndexElement => match self.p.element_to_gpr(instr) {
                Some(gpr) => {
                    self.index_gpr = Some(gpr);
                    self.goto(State::Access);
                }
                None => self.unknown(),
            },
            State::Access => match self.p.scalar_load(instr, self.index_gpr) {
                Some(value) => {
                    self.value_gpr = Some(value);
                    self.p.open_mask_window(instr);
                    self.goto(State::DataExtract);
                }
                None => self.unknown(),
            },
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
                    self.goto(State::BitImm);
                } else {
                    self.unknown();
                }
            }
            State::BitImm => match is_single_bit_mov(instr, self.p.lane) {
                Some(gpr) => {
                    self.bit_gpr = Some(gpr);
                    self.goto(State::SaveK0);
                }
                None => self.unknown(),
            },
            State::SaveK0 => match is_kmov_from_k0(instr) {
                Some(gpr) => {
                    self.save_gpr = Some(gpr);
                    self.goto(State::InstallK0);
                }
                None => self.unknown(),
            },
            State::InstallK0 => {
                if is_kmov_to_k0(instr, self.bit_gpr) {
                    self.k0_window_start = Some(instr.next_ip());
                    self.goto(State::Kandn);
                } else {
                    self.unknown();
                }
            }
            State::Kandn => {
                if instr.mnemonic() == Mnemonic::Kandnw
                    && instr.op0_register() == desc.mask
                    && instr.op1_register() == Register::K0
                {
                    self.goto(State::RestoreK0);
                } else {
                    self.unknown();
                }
            }
            State::RestoreK0 => {
                if is_kmov_to_k0(instr, self.save_gpr) {
                    if self.p.fault_reached(instr) {
                        let mut fix = self.p.lane_fixups();
                        if self
                            .k0_window_start
                            .is_some_and(|start| start <= self.p.fault_pc)
                        {
                            fix.k0_from = self.save_gpr;
                        }
                        return Step::Done(fix);
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
            State::Epilogue => return self.p.epilogue(instr, desc.index),
        }
        Step::Continue
    }
}
