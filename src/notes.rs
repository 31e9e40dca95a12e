//! Merging of GNU build attribute notes.
//!
//! Build attribute sections contain a flat stream of note records, one
//! per compilation unit and function. Each producer emits its own run of
//! records, so concatenated inputs carry many duplicates. Merging sums
//! stack-size attributes, coalesces identical attributes whose address
//! ranges abut, and physically removes the deleted records, shrinking
//! the section.
//!
//! The records are parsed into owned values, mutated, and then serialized
//! to a fresh buffer; records that were not touched are copied verbatim.

use object::Endianness;

use super::{Error, Result};

/// Note type for an attribute that applies to a range of code.
pub(crate) const NT_GNU_BUILD_ATTRIBUTE_OPEN: u32 = 0x100;
/// Note type for an attribute that applies to a single function.
pub(crate) const NT_GNU_BUILD_ATTRIBUTE_FUNC: u32 = 0x101;

const NOTE_NAME_PREFIX: &[u8] = b"GA";
const TYPE_NUMERIC: u8 = b'*';
const TYPE_STRING: u8 = b'$';
const ATTR_VERSION: u8 = 1;
const ATTR_STACK_SIZE: u8 = 4;

/// Sentinel for an end address the legacy description layouts cannot
/// express. Always satisfies the no-gap test.
const END_UNKNOWN: u64 = u64::MAX;

#[derive(Debug, Clone)]
struct Note {
    kind: u32,
    name: Vec<u8>,
    desc: Vec<u8>,
    start: u64,
    end: u64,
    deleted: bool,
    modified: bool,
    raw: Vec<u8>,
}

impl Note {
    /// The schema version digit if this is a version marker note.
    fn version(&self) -> Option<u8> {
        if self.name.len() > 4
            && self.name.starts_with(NOTE_NAME_PREFIX)
            && self.name[2] == TYPE_STRING
            && self.name[3] == ATTR_VERSION
        {
            Some(self.name[4])
        } else {
            None
        }
    }

    /// The attribute type byte following the name prefix.
    fn attr_type(&self) -> Option<u8> {
        if self.name.len() > 2 && self.name.starts_with(NOTE_NAME_PREFIX) {
            Some(self.name[2])
        } else {
            None
        }
    }

    fn is_stack_size(&self) -> bool {
        self.attr_type() == Some(TYPE_NUMERIC) && self.name.get(3) == Some(&ATTR_STACK_SIZE)
    }

    /// The numeric value encoded in the name, and its width in bytes.
    fn numeric_value(&self) -> Option<(u64, usize)> {
        let bytes = self.name.get(4..self.name.len() - 1)?;
        if bytes.is_empty() || bytes.len() > 8 {
            return None;
        }
        let mut value = 0u64;
        for (i, byte) in bytes.iter().enumerate() {
            value |= u64::from(*byte) << (8 * i);
        }
        Some((value, bytes.len()))
    }

    /// Replace the description with an explicit start/end range.
    fn set_range_desc(&mut self, endian: Endianness, is_64: bool) {
        let mut desc = Vec::with_capacity(16);
        if is_64 {
            push_u64(&mut desc, self.start, endian);
            push_u64(&mut desc, self.end, endian);
        } else {
            push_u32(&mut desc, self.start as u32, endian);
            push_u32(&mut desc, self.end as u32, endian);
        }
        self.desc = desc;
    }
}

fn read_u32(data: &[u8], offset: usize, endian: Endianness) -> u32 {
    let bytes = [
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ];
    match endian {
        Endianness::Little => u32::from_le_bytes(bytes),
        Endianness::Big => u32::from_be_bytes(bytes),
    }
}

fn read_u64(data: &[u8], offset: usize, endian: Endianness) -> u64 {
    let mut bytes = [0; 8];
    bytes.copy_from_slice(&data[offset..offset + 8]);
    match endian {
        Endianness::Little => u64::from_le_bytes(bytes),
        Endianness::Big => u64::from_be_bytes(bytes),
    }
}

fn push_u32(buffer: &mut Vec<u8>, value: u32, endian: Endianness) {
    match endian {
        Endianness::Little => buffer.extend_from_slice(&value.to_le_bytes()),
        Endianness::Big => buffer.extend_from_slice(&value.to_be_bytes()),
    }
}

fn push_u64(buffer: &mut Vec<u8>, value: u64, endian: Endianness) {
    match endian {
        Endianness::Little => buffer.extend_from_slice(&value.to_le_bytes()),
        Endianness::Big => buffer.extend_from_slice(&value.to_be_bytes()),
    }
}

fn align4(size: u32) -> usize {
    (size as usize + 3) & !3
}

fn align16(address: u64) -> u64 {
    address.checked_add(15).map_or(u64::MAX, |sum| sum & !15)
}

fn parse(data: &[u8], endian: Endianness, is_64: bool) -> Result<Vec<Note>> {
    let mut notes = Vec::new();
    let mut offset = 0;
    // Records with an empty description inherit the current range of
    // their own kind.
    let mut last_open = (0, 0);
    let mut last_func = (0, 0);
    while offset < data.len() {
        if data.len() - offset < 12 {
            return Err(Error::note("record header extends past the end of the section"));
        }
        let namesz = read_u32(data, offset, endian);
        let descsz = read_u32(data, offset + 4, endian);
        let kind = read_u32(data, offset + 8, endian);
        if kind != NT_GNU_BUILD_ATTRIBUTE_OPEN && kind != NT_GNU_BUILD_ATTRIBUTE_FUNC {
            return Err(Error::note(format!("wrong note type {:#x}", kind)));
        }
        let name_size = align4(namesz);
        let desc_size = align4(descsz);
        let total = 12 + name_size + desc_size;
        if total > data.len() - offset {
            return Err(Error::note("note record extends past the end of the section"));
        }
        if namesz < 2 {
            return Err(Error::note("name size too small"));
        }
        let name = data[offset + 12..offset + 12 + namesz as usize].to_vec();
        if name.last() != Some(&0) {
            return Err(Error::note("name is not NUL terminated"));
        }
        let desc_offset = offset + 12 + name_size;
        let desc = data[desc_offset..desc_offset + descsz as usize].to_vec();
        let (start, end) = match descsz {
            0 => {
                if kind == NT_GNU_BUILD_ATTRIBUTE_OPEN {
                    last_open
                } else {
                    last_func
                }
            }
            4 => (u64::from(read_u32(&desc, 0, endian)), END_UNKNOWN),
            8 => {
                if is_64 {
                    (read_u64(&desc, 0, endian), END_UNKNOWN)
                } else {
                    (
                        u64::from(read_u32(&desc, 0, endian)),
                        u64::from(read_u32(&desc, 4, endian)),
                    )
                }
            }
            16 => (read_u64(&desc, 0, endian), read_u64(&desc, 8, endian)),
            _ => return Err(Error::note(format!("bad description size {}", descsz))),
        };
        if kind == NT_GNU_BUILD_ATTRIBUTE_OPEN {
            last_open = (start, end);
        } else {
            last_func = (start, end);
        }
        notes.push(Note {
            kind,
            name,
            desc,
            start,
            end,
            deleted: false,
            modified: false,
            raw: data[offset..offset + total].to_vec(),
        });
        offset += total;
    }
    Ok(notes)
}

/// Resolve the schema version of the note stream.
///
/// Mixing two different versions in one section is fatal. A stream with
/// no version marker merges under the newest schema's semantics.
fn resolve_version(notes: &[Note]) -> Result<u8> {
    let mut version = None;
    for note in notes {
        let Some(digit) = note.version() else {
            continue;
        };
        let found = match digit {
            b'1' => 1,
            b'2' => 2,
            b'3' => 3,
            _ => {
                return Err(Error::note(format!(
                    "unsupported version '{}'",
                    digit as char
                )));
            }
        };
        match version {
            None => version = Some(found),
            Some(previous) if previous != found => {
                return Err(Error::note("multiple different version notes"));
            }
            Some(_) => {}
        }
    }
    Ok(version.unwrap_or(3))
}

/// Merge a build attribute note section.
///
/// Returns the merged section contents, or `None` when nothing changed
/// (including a section holding only a single version marker, which has
/// nothing to merge).
pub(crate) fn merge(data: &[u8], endian: Endianness, is_64: bool) -> Result<Option<Vec<u8>>> {
    if data.is_empty() {
        return Ok(None);
    }
    let mut notes = parse(data, endian, is_64)?;
    if notes.len() < 2 {
        return Ok(None);
    }
    let version = resolve_version(&notes)?;

    for i in 1..notes.len() {
        if notes[i].deleted
            || notes[i].kind != NT_GNU_BUILD_ATTRIBUTE_OPEN
            || notes[i].version().is_some()
        {
            continue;
        }
        let Some(attr) = notes[i].attr_type() else {
            continue;
        };
        let mut undelete = false;
        // Scan backward for the nearest live open note with the same
        // attribute type byte; whichever rule applies ends the scan.
        for j in (0..i).rev() {
            if notes[j].deleted
                || notes[j].kind != NT_GNU_BUILD_ATTRIBUTE_OPEN
                || notes[j].version().is_some()
                || notes[j].attr_type() != Some(attr)
            {
                continue;
            }
            let (head, tail) = notes.split_at_mut(i);
            let earlier = &mut head[j];
            let later = &mut tail[0];

            if earlier.is_stack_size() && later.is_stack_size() {
                merge_stack_sizes(earlier, later);
                break;
            }

            if earlier.name == later.name {
                let gap = earlier.end == 0
                    || later.start == 0
                    || later.end == 0
                    || align16(earlier.end) < later.start;
                if !gap {
                    if later.end > earlier.end {
                        earlier.end = later.end;
                    }
                    earlier.set_range_desc(endian, is_64);
                    earlier.modified = true;
                    later.deleted = true;
                    break;
                }
            }

            if version >= 3 {
                // Unmergeable open notes become function notes so that
                // their ranges stay intrinsic.
                for note in [earlier, later] {
                    note.kind = NT_GNU_BUILD_ATTRIBUTE_FUNC;
                    if note.desc.is_empty() && (note.start != 0 || note.end != 0) {
                        note.set_range_desc(endian, is_64);
                    }
                    note.modified = true;
                }
            } else if later.desc.is_empty() {
                // Pre-v3 streams inherit ranges from the previous open
                // note with a description; resurrect it if it was
                // merged away.
                undelete = true;
            }
            break;
        }
        if undelete {
            for k in (0..i).rev() {
                if notes[k].deleted && !notes[k].desc.is_empty() {
                    notes[k].deleted = false;
                    break;
                }
            }
        }
    }

    if !notes.iter().any(|note| note.deleted || note.modified) {
        return Ok(None);
    }
    Ok(Some(serialize(&notes, endian)))
}

/// Sum two numeric stack-size attributes into the earlier record.
///
/// The sum must still fit in the earlier record's byte width; on
/// overflow both records are preserved unmerged.
fn merge_stack_sizes(earlier: &mut Note, later: &mut Note) {
    let Some((earlier_value, width)) = earlier.numeric_value() else {
        return;
    };
    let Some((later_value, _)) = later.numeric_value() else {
        return;
    };
    let Some(sum) = earlier_value.checked_add(later_value) else {
        return;
    };
    if width < 8 && sum >= 1 << (8 * width) {
        return;
    }
    for i in 0..width {
        earlier.name[4 + i] = (sum >> (8 * i)) as u8;
    }
    earlier.modified = true;
    later.deleted = true;
}

fn serialize(notes: &[Note], endian: Endianness) -> Vec<u8> {
    let mut out = Vec::new();
    for note in notes {
        if note.deleted {
            continue;
        }
        if !note.modified {
            out.extend_from_slice(&note.raw);
            continue;
        }
        push_u32(&mut out, note.name.len() as u32, endian);
        push_u32(&mut out, note.desc.len() as u32, endian);
        push_u32(&mut out, note.kind, endian);
        out.extend_from_slice(&note.name);
        while out.len() % 4 != 0 {
            out.push(0);
        }
        out.extend_from_slice(&note.desc);
        while out.len() % 4 != 0 {
            out.push(0);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    const LE: Endianness = Endianness::Little;

    fn note_bytes(kind: u32, name: &[u8], desc: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        push_u32(&mut out, name.len() as u32, LE);
        push_u32(&mut out, desc.len() as u32, LE);
        push_u32(&mut out, kind, LE);
        out.extend_from_slice(name);
        while out.len() % 4 != 0 {
            out.push(0);
        }
        out.extend_from_slice(desc);
        while out.len() % 4 != 0 {
            out.push(0);
        }
        out
    }

    fn range16(start: u64, end: u64) -> Vec<u8> {
        let mut desc = Vec::new();
        push_u64(&mut desc, start, LE);
        push_u64(&mut desc, end, LE);
        desc
    }

    fn version_note(digit: u8) -> Vec<u8> {
        note_bytes(
            NT_GNU_BUILD_ATTRIBUTE_OPEN,
            &[b'G', b'A', TYPE_STRING, ATTR_VERSION, digit, 0],
            &[],
        )
    }

    const TOOL_NAME: &[u8] = b"GA$\x05gcc\0";

    #[test]
    fn adjacent_identical_notes_merge() {
        let mut data = note_bytes(NT_GNU_BUILD_ATTRIBUTE_OPEN, TOOL_NAME, &range16(0x100, 0x140));
        data.extend(note_bytes(
            NT_GNU_BUILD_ATTRIBUTE_OPEN,
            TOOL_NAME,
            &range16(0x140, 0x180),
        ));
        let input_len = data.len();

        let merged = merge(&data, LE, true).unwrap().unwrap();
        assert!(merged.len() < input_len);

        let notes = parse(&merged, LE, true).unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].kind, NT_GNU_BUILD_ATTRIBUTE_OPEN);
        assert_eq!(notes[0].start, 0x100);
        assert_eq!(notes[0].end, 0x180);
    }

    #[test]
    fn gap_prevents_merging() {
        // 0x110 rounds up to 0x120, which is below 0x130.
        let mut data = note_bytes(NT_GNU_BUILD_ATTRIBUTE_OPEN, TOOL_NAME, &range16(0x100, 0x110));
        data.extend(note_bytes(
            NT_GNU_BUILD_ATTRIBUTE_OPEN,
            TOOL_NAME,
            &range16(0x130, 0x140),
        ));
        // Under the newest schema the unmergeable pair is converted to
        // function notes.
        let merged = merge(&data, LE, true).unwrap().unwrap();
        let notes = parse(&merged, LE, true).unwrap();
        assert_eq!(notes.len(), 2);
        assert!(notes
            .iter()
            .all(|note| note.kind == NT_GNU_BUILD_ATTRIBUTE_FUNC));
    }

    #[test]
    fn rounded_end_still_merges() {
        // 0x13a rounds up to 0x140, closing the apparent gap.
        let mut data = note_bytes(NT_GNU_BUILD_ATTRIBUTE_OPEN, TOOL_NAME, &range16(0x100, 0x13a));
        data.extend(note_bytes(
            NT_GNU_BUILD_ATTRIBUTE_OPEN,
            TOOL_NAME,
            &range16(0x140, 0x180),
        ));
        let merged = merge(&data, LE, true).unwrap().unwrap();
        let notes = parse(&merged, LE, true).unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].end, 0x180);
    }

    fn stack_note(value: u8) -> Vec<u8> {
        note_bytes(
            NT_GNU_BUILD_ATTRIBUTE_OPEN,
            &[b'G', b'A', TYPE_NUMERIC, ATTR_STACK_SIZE, value, 0],
            &[],
        )
    }

    #[test]
    fn stack_sizes_are_summed() {
        let mut data = stack_note(4);
        data.extend(stack_note(6));
        let merged = merge(&data, LE, true).unwrap().unwrap();
        let notes = parse(&merged, LE, true).unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].numeric_value(), Some((10, 1)));
    }

    #[test]
    fn stack_size_overflow_preserves_both() {
        // 250 + 10 does not fit in the one-byte field.
        let mut data = stack_note(250);
        data.extend(stack_note(10));
        assert!(merge(&data, LE, true).unwrap().is_none());
    }

    #[test]
    fn single_record_is_unmodified() {
        let data = version_note(b'3');
        assert!(merge(&data, LE, true).unwrap().is_none());
    }

    #[test]
    fn mixed_versions_are_fatal() {
        let mut data = version_note(b'2');
        data.extend(version_note(b'3'));
        let err = merge(&data, LE, true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Note);
    }

    #[test]
    fn wrong_note_type_is_fatal() {
        let data = note_bytes(1, b"GNU\0", &[]);
        let err = merge(&data, LE, true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Note);
    }

    #[test]
    fn unterminated_name_is_fatal() {
        let mut data = note_bytes(NT_GNU_BUILD_ATTRIBUTE_OPEN, b"GA*X", &[]);
        data.extend(note_bytes(NT_GNU_BUILD_ATTRIBUTE_OPEN, TOOL_NAME, &[]));
        let err = merge(&data, LE, true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Note);
    }

    #[test]
    fn truncated_record_is_fatal() {
        let mut data = note_bytes(NT_GNU_BUILD_ATTRIBUTE_OPEN, TOOL_NAME, &range16(0, 0x10));
        data.extend(note_bytes(NT_GNU_BUILD_ATTRIBUTE_OPEN, TOOL_NAME, &[]));
        data.truncate(data.len() - 2);
        let err = merge(&data, LE, true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Note);
    }

    #[test]
    fn legacy_4_byte_description_merges() {
        // A 4-byte description has no end address; the range extends to
        // the sentinel end, so the next start is always covered.
        let mut start = Vec::new();
        push_u32(&mut start, 0x100, LE);
        let mut data = note_bytes(NT_GNU_BUILD_ATTRIBUTE_OPEN, TOOL_NAME, &start);
        let mut next = Vec::new();
        push_u32(&mut next, 0x140, LE);
        data.extend(note_bytes(NT_GNU_BUILD_ATTRIBUTE_OPEN, TOOL_NAME, &next));
        let merged = merge(&data, LE, false).unwrap().unwrap();
        let notes = parse(&merged, LE, false).unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].start, 0x100);
    }

    #[test]
    fn v3_converts_unmergeable_opens_to_func() {
        let mut data = version_note(b'3');
        data.extend(note_bytes(
            NT_GNU_BUILD_ATTRIBUTE_OPEN,
            b"GA$\x05gcc\0",
            &range16(0x100, 0x140),
        ));
        data.extend(note_bytes(
            NT_GNU_BUILD_ATTRIBUTE_OPEN,
            b"GA$\x05clang\0",
            &range16(0x140, 0x180),
        ));
        let merged = merge(&data, LE, true).unwrap().unwrap();
        let notes = parse(&merged, LE, true).unwrap();
        assert_eq!(notes.len(), 3);
        assert!(notes[0].version().is_some());
        assert_eq!(notes[1].kind, NT_GNU_BUILD_ATTRIBUTE_FUNC);
        assert_eq!(notes[2].kind, NT_GNU_BUILD_ATTRIBUTE_FUNC);
    }

    #[test]
    fn legacy_undelete_restores_inherited_description() {
        // Version 2 stream: the third tool note has an empty description
        // and inherits its range from the second, which was merged away.
        // The second note must come back so the inheritance still works.
        let mut data = version_note(b'2');
        data.extend(note_bytes(
            NT_GNU_BUILD_ATTRIBUTE_OPEN,
            TOOL_NAME,
            &range16(0x100, 0x140),
        ));
        data.extend(note_bytes(
            NT_GNU_BUILD_ATTRIBUTE_OPEN,
            TOOL_NAME,
            &range16(0x140, 0x180),
        ));
        data.extend(note_bytes(NT_GNU_BUILD_ATTRIBUTE_OPEN, b"GA$\x06abi\0", &[]));
        let merged = merge(&data, LE, true).unwrap().unwrap();
        let notes = parse(&merged, LE, true).unwrap();
        // Version note, extended tool note, resurrected tool note, abi note.
        assert_eq!(notes.len(), 4);
        assert_eq!(notes[1].start, 0x100);
        assert_eq!(notes[1].end, 0x180);
        assert_eq!(notes[2].start, 0x140);
    }
}
