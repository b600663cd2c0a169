//! Scratch register allocation.
//!
//! The expansion asks an allocator for general-purpose registers and for the
//! arithmetic flags; the allocator appends whatever spill and restore code it
//! needs to the sequence being built. [`TlsSlotAllocator`] is a reference
//! implementation that spills into thread-local slots.

use iced_x86::{Code, Instruction, Register};

use crate::config::Bitness;
use crate::error::AllocError;
use crate::ir::{self, Node, regs};

/// A set of general-purpose registers, by register number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegSet(u16);

impl RegSet {
    /// Every GPR addressable in the given mode.
    pub fn all(bitness: Bitness) -> Self {
        match bitness {
            Bitness::B64 => RegSet(0xFFFF),
            Bitness::B32 => RegSet(0x00FF),
        }
    }

    /// Remove a register; non-GPRs are ignored.
    pub fn remove(&mut self, reg: Register) {
        if let Some((n, _)) = regs::gpr_number(reg) {
            self.0 &= !(1 << n);
        }
    }

    pub fn without(mut self, reg: Register) -> Self {
        self.remove(reg);
        self
    }

    pub fn contains(&self, reg: Register) -> bool {
        match regs::gpr_number(reg) {
            Some((n, _)) => self.0 & (1 << n) != 0,
            None => false,
        }
    }

    pub fn contains_number(&self, n: usize) -> bool {
        n < 16 && self.0 & (1 << n) != 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }
}

/// Register and flags reservation service used while building a sequence.
///
/// Every reservation must be released before the sequence is finished.
/// Returned registers are full width for the mode (RCX, not ECX, in 64-bit).
pub trait ScratchAllocator {
    fn reserve_gpr(&mut self, seq: &mut Vec<Node>, allowed: &RegSet)
    -> Result<Register, AllocError>;
    fn unreserve_gpr(&mut self, seq: &mut Vec<Node>, reg: Register) -> Result<(), AllocError>;
    fn reserve_flags(&mut self, seq: &mut Vec<Node>) -> Result<(), AllocError>;
    fn unreserve_flags(&mut self, seq: &mut Vec<Node>) -> Result<(), AllocError>;
}

/// Default TLS offset of the first spill slot.
pub const DEFAULT_SLOT_BASE: i32 = 0x200;
/// Default number of spill slots.
pub const DEFAULT_SLOTS: usize = 8;

#[derive(Debug, Clone, Copy)]
struct Held {
    reg: Register,
    slot: usize,
}

/// Spills each reserved register to `seg:[slot_base + slot*width]`.
///
/// Flags are tracked for balance only; the reference allocator treats them
/// as dead across the unit.
#[derive(Debug)]
pub struct TlsSlotAllocator {
    bitness: Bitness,
    slot_base: i32,
    slots: usize,
    held: Vec<Held>,
    flags: bool,
}

impl TlsSlotAllocator {
    pub fn new(bitness: Bitness, slot_base: i32, slots: usize) -> Self {
        Self {
            bitness,
            slot_base,
            slots,
            held: Vec::new(),
            flags: false,
        }
    }

    pub fn with_defaults(bitness: Bitness) -> Self {
        Self::new(bitness, DEFAULT_SLOT_BASE, DEFAULT_SLOTS)
    }

    /// TLS offset of a slot.
    pub fn slot_offset(&self, slot: usize) -> i32 {
        self.slot_base + (slot as i32) * self.bitness.gpr_bytes() as i32
    }

    /// Check every reservation was released.
    pub fn finish(&self) -> Result<(), AllocError> {
        if self.held.is_empty() && !self.flags {
            Ok(())
        } else {
            Err(AllocError::Unbalanced {
                gprs: self.held.len(),
                flags: self.flags,
            })
        }
    }

    fn free_slot(&self) -> Option<usize> {
        (0..self.slots).find(|slot| self.held.iter().all(|h| h.slot != *slot))
    }

    fn is_held(&self, n: usize) -> bool {
        self.held
            .iter()
            .any(|h| regs::gpr_number(h.reg).map(|(m, _)| m) == Some(n))
    }

    fn spill_code(&self) -> (Code, Code) {
        match self.bitness {
            Bitness::B64 => (Code::Mov_rm64_r64, Code::Mov_r64_rm64),
            Bitness::B32 => (Code::Mov_rm32_r32, Code::Mov_r32_rm32),
        }
    }
}

impl ScratchAllocator for TlsSlotAllocator {
    fn reserve_gpr(
        &mut self,
        seq: &mut Vec<Node>,
        allowed: &RegSet,
    ) -> Result<Register, AllocError> {
        let count = RegSet::all(self.bitness).len();
        let n = (0..count)
            .find(|&n| n != regs::SP_NUMBER && allowed.contains_number(n) && !self.is_held(n))
            .ok_or(AllocError::Exhausted)?;
        let slot = self.free_slot().ok_or(AllocError::Exhausted)?;
        let reg = match self.bitness {
            Bitness::B64 => regs::GPR64[n],
            Bitness::B32 => regs::GPR32[n],
        };
        let (store, _) = self.spill_code();
        let spill = Instruction::with2(
            store,
            ir::tls_operand(self.slot_offset(slot), self.bitness),
            reg,
        )?;
        seq.push(Node::Meta(spill));
        self.held.push(Held { reg, slot });
        Ok(reg)
    }

    fn unreserve_gpr(&mut self, seq: &mut Vec<Node>, reg: Register) -> Result<(), AllocError> {
        let pos = self
            .held
            .iter()
            .position(|h| regs::same_gpr(h.reg, reg))
            .ok_or(AllocError::NotReserved(reg))?;
        let held = self.held[pos];
        let (_, load) = self.spill_code();
        let restore = Instruction::with2(
            load,
            held.reg,
            ir::tls_operand(self.slot_offset(held.slot), self.bitness),
        )?;
        seq.push(Node::Meta(restore));
        self.held.remove(pos);
        Ok(())
    }

    fn reserve_flags(&mut self, _seq: &mut Vec<Node>) -> Result<(), AllocError> {
        if self.flags {
            return Err(AllocError::FlagsBusy);
        }
        self.flags = true;
        Ok(())
    }

    fn unreserve_flags(&mut self, _seq: &mut Vec<Node>) -> Result<(), AllocError> {
        if !self.flags {
            return Err(AllocError::FlagsNotReserved);
        }
        self.flags = false;
        Ok(())
    }
}
