//! Byte buffer for laying out an expanded unit.
//!
//! Instructions arrive already encoded; the buffer only tracks labels and
//! patches the rel32 displacements of the conditional jumps that target them.

use std::collections::HashMap;

use super::Label;
use crate::error::EncodeError;

/// A buffer for building machine code.
pub struct CodeBuffer {
    code: Vec<u8>,
    /// Label -> offset
    labels: HashMap<Label, usize>,
    /// Pending rel32 references (offset of the displacement, target)
    forward_refs: Vec<(usize, Label)>,
}

impl CodeBuffer {
    pub fn new() -> Self {
        Self {
            code: Vec::new(),
            labels: HashMap::new(),
            forward_refs: Vec::new(),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            code: Vec::with_capacity(capacity),
            labels: HashMap::new(),
            forward_refs: Vec::new(),
        }
    }

    /// Current offset (for labels).
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    pub fn emit_u8(&mut self, byte: u8) {
        self.code.push(byte);
    }

    /// Emit a 32-bit value (little-endian).
    pub fn emit_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    /// Define a label at the current position.
    pub fn define_label(&mut self, label: Label) {
        self.labels.insert(label, self.code.len());
    }

    /// Emit a rel32 placeholder that `patch_forward_refs` resolves.
    pub fn emit_forward_ref(&mut self, label: Label) {
        let offset = self.code.len();
        self.forward_refs.push((offset, label));
        self.emit_u32(0);
    }

    /// jz rel32 (0F 84 cd)
    pub fn emit_jz(&mut self, label: Label) {
        self.emit_u8(0x0F);
        self.emit_u8(0x84);
        self.emit_forward_ref(label);
    }

    /// Patch all forward references.
    pub fn patch_forward_refs(&mut self) -> Result<(), EncodeError> {
        for (offset, label) in self.forward_refs.drain(..) {
            let target = *self
                .labels
                .get(&label)
                .ok_or(EncodeError::UndefinedLabel(label))?;
            // Relative to the end of the displacement
            let rel_offset = (target as i64) - (offset as i64 + 4);
            if rel_offset < i32::MIN as i64 || rel_offset > i32::MAX as i64 {
                return Err(EncodeError::OutOfRange(label));
            }
            self.code[offset..offset + 4].copy_from_slice(&(rel_offset as i32).to_le_bytes());
        }
        Ok(())
    }

    /// Consume the buffer. Forward references must already be patched.
    pub fn into_code(self) -> Vec<u8> {
        self.code
    }
}

impl Default for CodeBuffer {
    fn default() -> Self {
        Self::new()
    }
}
