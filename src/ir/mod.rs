//! Instruction units: the code the expansion rewrites.
//!
//! A [`Unit`] is a straight-line list of [`Node`]s decoded from application
//! code. Expansion replaces nodes in place; [`Unit::encode`] lays the result
//! out at a code-cache address.

pub mod codebuf;
pub mod regs;

use iced_x86::{Decoder, DecoderOptions, Encoder, Instruction, MemoryOperand, Register};

use crate::config::Bitness;
use crate::error::EncodeError;
use codebuf::CodeBuffer;

/// Jump target inside a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(pub(crate) u32);

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// Application instruction. Generated replacements carry the pc of the
    /// instruction they stand in for.
    App { instr: Instruction, translation: u64 },
    /// Tool instruction with no application counterpart.
    Meta(Instruction),
    /// jz rel32 to a label in the same unit
    JumpIfZero(Label),
    Label(Label),
}

impl Node {
    pub fn app(instr: Instruction, translation: u64) -> Self {
        Node::App { instr, translation }
    }

    pub fn instruction(&self) -> Option<&Instruction> {
        match self {
            Node::App { instr, .. } | Node::Meta(instr) => Some(instr),
            _ => None,
        }
    }

    pub fn is_app(&self) -> bool {
        matches!(self, Node::App { .. })
    }
}

/// A straight-line unit of code.
#[derive(Debug, Clone)]
pub struct Unit {
    bitness: Bitness,
    app_pc: u64,
    nodes: Vec<Node>,
    next_label: u32,
}

impl Unit {
    pub fn new(bitness: Bitness, app_pc: u64) -> Self {
        Self {
            bitness,
            app_pc,
            nodes: Vec::new(),
            next_label: 0,
        }
    }

    /// Decode application bytes at `app_pc` into a unit of app nodes.
    pub fn decode(bitness: Bitness, app_pc: u64, bytes: &[u8]) -> Result<Self, EncodeError> {
        let mut unit = Unit::new(bitness, app_pc);
        let mut decoder = Decoder::with_ip(bitness.bits(), bytes, app_pc, DecoderOptions::NONE);
        while decoder.can_decode() {
            let pc = decoder.ip();
            let instr = decoder.decode();
            if instr.is_invalid() {
                return Err(EncodeError::Decode { pc });
            }
            unit.push(Node::app(instr, pc));
        }
        Ok(unit)
    }

    pub fn bitness(&self) -> Bitness {
        self.bitness
    }

    pub fn app_pc(&self) -> u64 {
        self.app_pc
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn push(&mut self, node: Node) {
        self.nodes.push(node);
    }

    pub fn new_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    pub fn truncate(&mut self, len: usize) {
        self.nodes.truncate(len);
    }

    pub fn remove(&mut self, index: usize) -> Node {
        self.nodes.remove(index)
    }

    /// Replace the node at `index` with `seq`.
    pub fn replace(&mut self, index: usize, seq: Vec<Node>) {
        self.nodes.splice(index..=index, seq);
    }

    /// Index of the first application instruction.
    pub fn first_app(&self) -> Option<usize> {
        self.nodes.iter().position(Node::is_app)
    }

    /// Encode the unit as if placed at `start_pc`.
    pub fn encode(&self, start_pc: u64) -> Result<EncodedUnit, EncodeError> {
        let mut buf = CodeBuffer::with_capacity(self.nodes.len() * 6);
        let mut encoder = Encoder::new(self.bitness.bits());
        for node in &self.nodes {
            match node {
                Node::App { instr, .. } | Node::Meta(instr) => {
                    let pc = start_pc + buf.offset() as u64;
                    encoder.encode(instr, pc).map_err(EncodeError::Ir)?;
                    buf.emit_bytes(&encoder.take_buffer());
                }
                Node::JumpIfZero(label) => buf.emit_jz(*label),
                Node::Label(label) => buf.define_label(*label),
            }
        }
        buf.patch_forward_refs()?;
        Ok(EncodedUnit {
            start_pc,
            bitness: self.bitness,
            code: buf.into_code(),
        })
    }
}

/// Machine code for a unit at a fixed address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedUnit {
    pub start_pc: u64,
    pub bitness: Bitness,
    pub code: Vec<u8>,
}

impl EncodedUnit {
    pub fn end_pc(&self) -> u64 {
        self.start_pc + self.code.len() as u64
    }

    /// Decode the laid-out code back into instructions (with their pcs).
    pub fn instructions(&self) -> Vec<Instruction> {
        let mut decoder = Decoder::with_ip(
            self.bitness.bits(),
            &self.code,
            self.start_pc,
            DecoderOptions::NONE,
        );
        decoder.iter().collect()
    }
}

/// Displacement size the encoder expects for a base/displacement pair.
fn displ_size(base: Register, displacement: i64, bitness: Bitness) -> u32 {
    if base == Register::None {
        bitness.gpr_bytes()
    } else if displacement == 0 {
        0
    } else if i8::try_from(displacement).is_ok() {
        1
    } else {
        bitness.gpr_bytes()
    }
}

/// `[base + index*scale + displacement]`
pub fn memory_operand(
    base: Register,
    index: Register,
    scale: u32,
    displacement: i64,
    bitness: Bitness,
) -> MemoryOperand {
    MemoryOperand::new(
        base,
        index,
        scale,
        displacement,
        displ_size(base, displacement, bitness),
        false,
        Register::None,
    )
}

/// `[base + displacement]`
pub fn base_operand(base: Register, displacement: i64, bitness: Bitness) -> MemoryOperand {
    memory_operand(base, Register::None, 1, displacement, bitness)
}

/// Segment register holding the thread-local base.
pub fn tls_segment(bitness: Bitness) -> Register {
    match bitness {
        Bitness::B64 => Register::GS,
        Bitness::B32 => Register::FS,
    }
}

/// Absolute thread-local operand `seg:[offset]`.
pub fn tls_operand(offset: i32, bitness: Bitness) -> MemoryOperand {
    MemoryOperand::new(
        Register::None,
        Register::None,
        1,
        offset as i64,
        bitness.gpr_bytes(),
        false,
        tls_segment(bitness),
    )
}

/// Memory operand that goes through the thread-local segment.
pub fn is_tls_access(instr: &Instruction) -> bool {
    matches!(instr.segment_prefix(), Register::FS | Register::GS)
}
