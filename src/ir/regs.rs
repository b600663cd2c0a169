//! Register tables and width conversions.
//!
//! Lookups go through explicit tables so a register's number never depends
//! on the layout of the `Register` enum.

use iced_x86::Register;

use crate::config::Bitness;

pub const XMM: [Register; 32] = [
    Register::XMM0, Register::XMM1, Register::XMM2, Register::XMM3,
    Register::XMM4, Register::XMM5, Register::XMM6, Register::XMM7,
    Register::XMM8, Register::XMM9, Register::XMM10, Register::XMM11,
    Register::XMM12, Register::XMM13, Register::XMM14, Register::XMM15,
    Register::XMM16, Register::XMM17, Register::XMM18, Register::XMM19,
    Register::XMM20, Register::XMM21, Register::XMM22, Register::XMM23,
    Register::XMM24, Register::XMM25, Register::XMM26, Register::XMM27,
    Register::XMM28, Register::XMM29, Register::XMM30, Register::XMM31,
];

pub const YMM: [Register; 32] = [
    Register::YMM0, Register::YMM1, Register::YMM2, Register::YMM3,
    Register::YMM4, Register::YMM5, Register::YMM6, Register::YMM7,
    Register::YMM8, Register::YMM9, Register::YMM10, Register::YMM11,
    Register::YMM12, Register::YMM13, Register::YMM14, Register::YMM15,
    Register::YMM16, Register::YMM17, Register::YMM18, Register::YMM19,
    Register::YMM20, Register::YMM21, Register::YMM22, Register::YMM23,
    Register::YMM24, Register::YMM25, Register::YMM26, Register::YMM27,
    Register::YMM28, Register::YMM29, Register::YMM30, Register::YMM31,
];

pub const ZMM: [Register; 32] = [
    Register::ZMM0, Register::ZMM1, Register::ZMM2, Register::ZMM3,
    Register::ZMM4, Register::ZMM5, Register::ZMM6, Register::ZMM7,
    Register::ZMM8, Register::ZMM9, Register::ZMM10, Register::ZMM11,
    Register::ZMM12, Register::ZMM13, Register::ZMM14, Register::ZMM15,
    Register::ZMM16, Register::ZMM17, Register::ZMM18, Register::ZMM19,
    Register::ZMM20, Register::ZMM21, Register::ZMM22, Register::ZMM23,
    Register::ZMM24, Register::ZMM25, Register::ZMM26, Register::ZMM27,
    Register::ZMM28, Register::ZMM29, Register::ZMM30, Register::ZMM31,
];

pub const GPR64: [Register; 16] = [
    Register::RAX, Register::RCX, Register::RDX, Register::RBX,
    Register::RSP, Register::RBP, Register::RSI, Register::RDI,
    Register::R8, Register::R9, Register::R10, Register::R11,
    Register::R12, Register::R13, Register::R14, Register::R15,
];

pub const GPR32: [Register; 16] = [
    Register::EAX, Register::ECX, Register::EDX, Register::EBX,
    Register::ESP, Register::EBP, Register::ESI, Register::EDI,
    Register::R8D, Register::R9D, Register::R10D, Register::R11D,
    Register::R12D, Register::R13D, Register::R14D, Register::R15D,
];

pub const OPMASK: [Register; 8] = [
    Register::K0, Register::K1, Register::K2, Register::K3,
    Register::K4, Register::K5, Register::K6, Register::K7,
];

/// Stack pointer number; never handed out as scratch.
pub const SP_NUMBER: usize = 4;

fn position(table: &[Register], reg: Register) -> Option<usize> {
    table.iter().position(|&r| r == reg)
}

/// Number of an xmm/ymm/zmm register.
pub fn vector_number(reg: Register) -> Option<usize> {
    position(&XMM, reg)
        .or_else(|| position(&YMM, reg))
        .or_else(|| position(&ZMM, reg))
}

/// Size of a vector register in bytes, or `None` for anything else.
pub fn vector_size(reg: Register) -> Option<u32> {
    if position(&XMM, reg).is_some() {
        Some(16)
    } else if position(&YMM, reg).is_some() {
        Some(32)
    } else if position(&ZMM, reg).is_some() {
        Some(64)
    } else {
        None
    }
}

/// The same vector register viewed at `bytes` (16, 32 or 64).
pub fn resize_vector(reg: Register, bytes: u32) -> Option<Register> {
    let n = vector_number(reg)?;
    match bytes {
        16 => Some(XMM[n]),
        32 => Some(YMM[n]),
        64 => Some(ZMM[n]),
        _ => None,
    }
}

pub fn xmm(reg: Register) -> Option<Register> {
    resize_vector(reg, 16)
}

pub fn ymm(reg: Register) -> Option<Register> {
    resize_vector(reg, 32)
}

pub fn zmm(reg: Register) -> Option<Register> {
    resize_vector(reg, 64)
}

/// Number and width in bytes of a 32- or 64-bit general-purpose register.
pub fn gpr_number(reg: Register) -> Option<(usize, u32)> {
    position(&GPR64, reg)
        .map(|n| (n, 8))
        .or_else(|| position(&GPR32, reg).map(|n| (n, 4)))
}

/// The same GPR at `bytes` (4 or 8).
pub fn resize_gpr(reg: Register, bytes: u32) -> Option<Register> {
    let (n, _) = gpr_number(reg)?;
    match bytes {
        4 => Some(GPR32[n]),
        8 => Some(GPR64[n]),
        _ => None,
    }
}

/// Full-width GPR for the given code size.
pub fn full_gpr(reg: Register, bitness: Bitness) -> Option<Register> {
    resize_gpr(reg, bitness.gpr_bytes())
}

/// GPR aliasing check across widths.
pub fn same_gpr(a: Register, b: Register) -> bool {
    match (gpr_number(a), gpr_number(b)) {
        (Some((x, _)), Some((y, _))) => x == y,
        _ => false,
    }
}

/// Vector aliasing check across xmm/ymm/zmm views.
pub fn same_vector(a: Register, b: Register) -> bool {
    match (vector_number(a), vector_number(b)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

pub fn opmask_number(reg: Register) -> Option<usize> {
    position(&OPMASK, reg)
}
