//! Scalarize - scalar expansion of x86 scatter/gather instructions
//!
//! Rewrites AVX2 and AVX-512 gathers and scatters inside a code unit into
//! sequences of scalar loads and stores, one lane at a time, and repairs the
//! machine state when one of those scalar accesses faults.

pub mod alloc;
pub mod config;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod expand;
pub mod ir;
pub mod isolate;
pub mod machine;
pub mod recover;
pub mod scratch;
pub mod sim;

// Re-export commonly used types
pub use alloc::{RegSet, ScratchAllocator, TlsSlotAllocator};
pub use config::{Bitness, ExpandConfig, ProcessorFeatures};
pub use descriptor::{Direction, Family, InstructionDescriptor};
pub use engine::{Expansion, Phase, ScatterGather};
pub use error::{AllocError, DescriptorError, EncodeError, ExpandError};
pub use ir::{EncodedUnit, Node, Unit};
pub use machine::MachineContext;
pub use recover::{RecoveryOutcome, RestoreStateQuery};
pub use scratch::ThreadScratch;
