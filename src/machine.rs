//! Register state of an interrupted thread.

use iced_x86::Register;

use crate::ir::regs;

/// Architectural state seen by fault handling and the simulator.
///
/// Vector registers are stored at full zmm width; narrower views alias the
/// low bytes. Accessors ignore registers of the wrong class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineContext {
    pub pc: u64,
    pub gpr: [u64; 16],
    pub simd: [[u8; 64]; 32],
    pub opmask: [u64; 8],
    /// Zero flag; the only flag the generated code tests.
    pub zf: bool,
}

impl Default for MachineContext {
    fn default() -> Self {
        Self {
            pc: 0,
            gpr: [0; 16],
            simd: [[0; 64]; 32],
            opmask: [0; 8],
            zf: false,
        }
    }
}

impl MachineContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of a 32- or 64-bit GPR.
    pub fn gpr(&self, reg: Register) -> u64 {
        match regs::gpr_number(reg) {
            Some((n, 8)) => self.gpr[n],
            Some((n, _)) => self.gpr[n] & 0xFFFF_FFFF,
            None => 0,
        }
    }

    /// Write a GPR; 32-bit writes zero the upper half.
    pub fn set_gpr(&mut self, reg: Register, value: u64) {
        match regs::gpr_number(reg) {
            Some((n, 8)) => self.gpr[n] = value,
            Some((n, _)) => self.gpr[n] = value & 0xFFFF_FFFF,
            None => {}
        }
    }

    /// Bytes of a vector register at the width it names.
    pub fn vector(&self, reg: Register) -> &[u8] {
        match (regs::vector_number(reg), regs::vector_size(reg)) {
            (Some(n), Some(size)) => &self.simd[n][..size as usize],
            _ => &[],
        }
    }

    /// Overwrite the low bytes of a vector register, keeping the rest.
    pub fn set_vector(&mut self, reg: Register, bytes: &[u8]) {
        if let Some(n) = regs::vector_number(reg) {
            let len = bytes.len().min(64);
            self.simd[n][..len].copy_from_slice(&bytes[..len]);
        }
    }

    /// Write a vector register and zero everything above `bytes`, as VEX and
    /// EVEX encoded writes do.
    pub fn write_vector_zero_upper(&mut self, reg: Register, bytes: &[u8]) {
        if let Some(n) = regs::vector_number(reg) {
            let len = bytes.len().min(64);
            self.simd[n] = [0; 64];
            self.simd[n][..len].copy_from_slice(&bytes[..len]);
        }
    }

    /// Element `lane` of `width` bytes, zero-extended.
    pub fn vector_element(&self, reg: Register, lane: u32, width: u32) -> u64 {
        let bytes = self.vector(reg);
        let start = (lane * width) as usize;
        let end = start + width as usize;
        if end > bytes.len() {
            return 0;
        }
        let mut buf = [0u8; 8];
        buf[..width as usize].copy_from_slice(&bytes[start..end]);
        u64::from_le_bytes(buf)
    }

    /// Replace element `lane` of `width` bytes, keeping the other bytes.
    pub fn set_vector_element(&mut self, reg: Register, lane: u32, width: u32, value: u64) {
        if let Some(n) = regs::vector_number(reg) {
            let start = (lane * width) as usize;
            let end = start + width as usize;
            if end <= 64 {
                self.simd[n][start..end].copy_from_slice(&value.to_le_bytes()[..width as usize]);
            }
        }
    }

    pub fn opmask(&self, reg: Register) -> u64 {
        regs::opmask_number(reg).map(|n| self.opmask[n]).unwrap_or(0)
    }

    pub fn set_opmask(&mut self, reg: Register, value: u64) {
        if let Some(n) = regs::opmask_number(reg) {
            self.opmask[n] = value;
        }
    }
}
