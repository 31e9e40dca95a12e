//! Section content transforms: plain copy, byte reversal, interleave
//! extraction and zero-fill materialization.

use crate::config::Interleave;
use crate::{Error, Result};

/// Whether the byte at distance `position` from the section start is
/// kept by the interleave window. The window is anchored to the load
/// address so that extraction stays in phase across sections.
fn kept(position: u64, lma: u64, interleave: &Interleave) -> bool {
    let phase = (lma.wrapping_add(position)) % interleave.stride;
    phase >= interleave.offset && phase < interleave.offset + interleave.width
}

/// The output size of an interleave-extracted section.
pub(crate) fn interleaved_size(size: u64, lma: u64, interleave: &Interleave) -> u64 {
    let cycles = size / interleave.stride;
    let remainder = size % interleave.stride;
    let mut count = cycles * interleave.width;
    for position in 0..remainder {
        if kept(position, lma, interleave) {
            count += 1;
        }
    }
    count
}

/// Extract the interleaved bytes of a section.
pub(crate) fn extract_interleave(data: &[u8], lma: u64, interleave: &Interleave) -> Vec<u8> {
    let mut out = Vec::with_capacity(interleaved_size(data.len() as u64, lma, interleave) as usize);
    for (position, byte) in data.iter().enumerate() {
        if kept(position as u64, lma, interleave) {
            out.push(*byte);
        }
    }
    out
}

/// Reverse the bytes of a section within groups of `unit` bytes.
///
/// The section size must be an exact multiple of the unit.
pub(crate) fn reverse_bytes(data: &mut [u8], unit: u64, name: &[u8]) -> Result<()> {
    let unit = unit as usize;
    if unit == 0 || data.len() % unit != 0 {
        return Err(Error::config(format!(
            "section '{}' size {:#x} is not a multiple of the reverse-bytes unit {}",
            String::from_utf8_lossy(name),
            data.len(),
            unit,
        )));
    }
    for group in data.chunks_mut(unit) {
        group.reverse();
    }
    Ok(())
}
