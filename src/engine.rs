//! Entry points used by the instrumentation host.

use std::sync::atomic::{AtomicBool, Ordering};

use iced_x86::{Decoder, DecoderOptions};
use log::debug;

use crate::alloc::ScratchAllocator;
use crate::config::ExpandConfig;
use crate::descriptor::{InstructionDescriptor, is_scatter_gather};
use crate::error::{DescriptorError, ExpandError};
use crate::expand::Expander;
use crate::ir::{Node, Unit};
use crate::isolate::isolate;
use crate::machine::MachineContext;
use crate::recover::{self, RecoveryOutcome, RestoreStateQuery, SkipReason};
use crate::scratch::{ScratchStateManager, ThreadScratch};

/// Instrumentation stage a unit is passing through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Application-to-application transformations; the only stage that may
    /// expand.
    AppToApp,
    Analysis,
    Insertion,
    InstrToInstr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expansion {
    /// The unit does not start with a scatter/gather.
    NotApplicable,
    Expanded { lanes: u32 },
}

impl Expansion {
    pub fn is_expanded(&self) -> bool {
        matches!(self, Expansion::Expanded { .. })
    }
}

/// Scatter/gather expansion and fault recovery for one process.
pub struct ScatterGather {
    config: ExpandConfig,
    scratch: ScratchStateManager,
    /// Set once any unit reached expansion; recovery is skipped until then.
    expanded: AtomicBool,
}

impl ScatterGather {
    pub fn new(config: ExpandConfig) -> Self {
        let scratch = ScratchStateManager::new(&config);
        Self {
            config,
            scratch,
            expanded: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ExpandConfig {
        &self.config
    }

    pub fn scratch(&self) -> &ScratchStateManager {
        &self.scratch
    }

    pub fn thread_init(&self) -> ThreadScratch {
        self.scratch.thread_init()
    }

    pub fn thread_exit(&self, thread: ThreadScratch) {
        self.scratch.thread_exit(thread)
    }

    pub fn has_expanded(&self) -> bool {
        self.expanded.load(Ordering::Acquire)
    }

    /// Isolate and expand the scatter/gather heading `unit`, if any.
    pub fn expand_unit(
        &self,
        unit: &mut Unit,
        phase: Phase,
        alloc: &mut dyn ScratchAllocator,
    ) -> Result<Expansion, ExpandError> {
        if phase != Phase::AppToApp {
            return Err(ExpandError::WrongPhase);
        }
        let Some(at) = isolate(unit) else {
            return Ok(Expansion::NotApplicable);
        };
        self.expanded.store(true, Ordering::Release);

        let instr = unit
            .nodes()
            .get(at)
            .and_then(Node::instruction)
            .copied()
            .ok_or(ExpandError::Descriptor(DescriptorError::NotScatterGather))?;
        let desc = InstructionDescriptor::extract(&instr, self.config.bitness)?;
        let lanes = Expander::new(&self.config, &self.scratch).expand(unit, at, &desc, alloc)?;
        Ok(Expansion::Expanded { lanes })
    }

    /// Repair `translated` for a fault inside an expanded unit.
    pub fn try_recover(
        &self,
        thread: &ThreadScratch,
        query: &RestoreStateQuery<'_>,
        translated: &mut MachineContext,
    ) -> RecoveryOutcome {
        if !self.has_expanded() {
            return RecoveryOutcome::Skipped(SkipReason::NeverExpanded);
        }
        let Some(start_pc) = query.cache_start_pc else {
            return RecoveryOutcome::Skipped(SkipReason::NotInCache);
        };
        if !query.app_code_consistent {
            return RecoveryOutcome::Skipped(SkipReason::AppCodeInconsistent);
        }

        let mut decoder = Decoder::with_ip(
            self.config.bitness.bits(),
            query.app_code,
            query.app_pc,
            DecoderOptions::NONE,
        );
        let instr = decoder.decode();
        if instr.is_invalid() || !is_scatter_gather(&instr) {
            return RecoveryOutcome::Skipped(SkipReason::NotScatterGather);
        }
        let desc = match InstructionDescriptor::extract(&instr, self.config.bitness) {
            Ok(desc) => desc,
            Err(_) => return RecoveryOutcome::Skipped(SkipReason::NotScatterGather),
        };

        let outcome = recover::restore_state(
            &self.config,
            &self.scratch,
            &desc,
            thread,
            query,
            start_pc,
            translated,
        );
        debug!("recovery at {:#x}: {:?}", query.raw.pc, outcome);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::TlsSlotAllocator;

    #[test]
    fn test_wrong_phase_leaves_unit() {
        let sg = ScatterGather::new(ExpandConfig::default());
        let bytes = [0xC4, 0xE2, 0x6D, 0x90, 0x04, 0x88, 0x90];
        let mut unit = Unit::decode(sg.config().bitness, 0x1000, &bytes).unwrap();
        let mut alloc = TlsSlotAllocator::with_defaults(sg.config().bitness);
        let err = sg
            .expand_unit(&mut unit, Phase::Insertion, &mut alloc)
            .unwrap_err();
        assert!(matches!(err, ExpandError::WrongPhase));
        assert_eq!(unit.len(), 2);
        assert!(!sg.has_expanded());
    }

    #[test]
    fn test_recover_skipped_before_expansion() {
        let sg = ScatterGather::new(ExpandConfig::default());
        let thread = sg.thread_init();
        let raw = MachineContext::new();
        let query = RestoreStateQuery {
            cache_start_pc: Some(0x1000),
            code: &[],
            app_pc: 0,
            app_code: &[],
            app_code_consistent: true,
            raw: &raw,
        };
        let mut translated = raw.clone();
        assert_eq!(
            sg.try_recover(&thread, &query, &mut translated),
            RecoveryOutcome::Skipped(SkipReason::NeverExpanded)
        );
    }
}
