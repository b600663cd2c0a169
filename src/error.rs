//! Error types for expansion, allocation and encoding.

use std::fmt;

use iced_x86::{IcedError, Register};

use crate::ir::Label;

/// Why an instruction could not be described as a scatter/gather.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescriptorError {
    NotScatterGather,
    Malformed(&'static str),
}

impl fmt::Display for DescriptorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DescriptorError::NotScatterGather => write!(f, "not a scatter or gather instruction"),
            DescriptorError::Malformed(what) => write!(f, "malformed scatter/gather: {}", what),
        }
    }
}

impl std::error::Error for DescriptorError {}

/// Scratch register allocation failure.
#[derive(Debug)]
pub enum AllocError {
    /// No allowed register is free.
    Exhausted,
    NotReserved(Register),
    FlagsBusy,
    FlagsNotReserved,
    /// Reservations still held when the allocator was finished.
    Unbalanced { gprs: usize, flags: bool },
    Ir(IcedError),
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::Exhausted => write!(f, "no scratch register available"),
            AllocError::NotReserved(reg) => write!(f, "{:?} is not reserved", reg),
            AllocError::FlagsBusy => write!(f, "arithmetic flags already reserved"),
            AllocError::FlagsNotReserved => write!(f, "arithmetic flags not reserved"),
            AllocError::Unbalanced { gprs, flags } => write!(
                f,
                "unbalanced reservations: {} registers, flags {}",
                gprs,
                if *flags { "held" } else { "free" }
            ),
            AllocError::Ir(e) => write!(f, "failed to build spill code: {}", e),
        }
    }
}

impl std::error::Error for AllocError {}

impl From<IcedError> for AllocError {
    fn from(e: IcedError) -> Self {
        AllocError::Ir(e)
    }
}

/// Failure to expand a unit.
#[derive(Debug)]
pub enum ExpandError {
    /// Expansion was requested outside the app-to-app phase.
    WrongPhase,
    Unsupported(&'static str),
    /// Every candidate scratch vector register is in use.
    NoScratchVector,
    Descriptor(DescriptorError),
    Alloc(AllocError),
    Ir(IcedError),
}

impl fmt::Display for ExpandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpandError::WrongPhase => write!(f, "expansion must run in the app-to-app phase"),
            ExpandError::Unsupported(what) => write!(f, "unsupported: {}", what),
            ExpandError::NoScratchVector => write!(f, "no scratch vector register available"),
            ExpandError::Descriptor(e) => write!(f, "{}", e),
            ExpandError::Alloc(e) => write!(f, "{}", e),
            ExpandError::Ir(e) => write!(f, "failed to build instruction: {}", e),
        }
    }
}

impl std::error::Error for ExpandError {}

impl From<DescriptorError> for ExpandError {
    fn from(e: DescriptorError) -> Self {
        ExpandError::Descriptor(e)
    }
}

impl From<AllocError> for ExpandError {
    fn from(e: AllocError) -> Self {
        ExpandError::Alloc(e)
    }
}

impl From<IcedError> for ExpandError {
    fn from(e: IcedError) -> Self {
        ExpandError::Ir(e)
    }
}

/// Failure to lay out or decode a unit.
#[derive(Debug)]
pub enum EncodeError {
    Ir(IcedError),
    UndefinedLabel(Label),
    OutOfRange(Label),
    Decode { pc: u64 },
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodeError::Ir(e) => write!(f, "encoding failed: {}", e),
            EncodeError::UndefinedLabel(label) => write!(f, "undefined label: {:?}", label),
            EncodeError::OutOfRange(label) => {
                write!(f, "relative offset out of range for label: {:?}", label)
            }
            EncodeError::Decode { pc } => write!(f, "invalid instruction at {:#x}", pc),
        }
    }
}

impl std::error::Error for EncodeError {}
