//! Splits units so a scatter/gather is always alone at the head of one.

use crate::descriptor::is_scatter_gather;
use crate::ir::{Node, Unit};

/// Truncate the unit at its first scatter/gather.
///
/// Everything after the scatter/gather is dropped. When it is not the unit's
/// first application instruction it is dropped as well, so it starts the next
/// unit. Returns the node index of the scatter/gather when it heads the unit.
pub fn isolate(unit: &mut Unit) -> Option<usize> {
    let pos = unit.nodes().iter().position(|node| match node {
        Node::App { instr, .. } => is_scatter_gather(instr),
        _ => false,
    })?;
    let first = unit.first_app();
    unit.truncate(pos + 1);
    if first == Some(pos) {
        Some(pos)
    } else {
        unit.remove(pos);
        None
    }
}
