//! Relocation marking and copying.
//!
//! The mark phase runs before symbol filtering: every symbol targeted by
//! a relocation in a surviving section must stay alive. The copy phase
//! runs per output section and must agree with the final symbol table.

use std::collections::{HashMap, HashSet};

use object::read::{File, Object, ObjectSection, ObjectSymbol};
use object::{ObjectKind, RelocationTarget, SectionIndex, SymbolIndex};

use crate::config::{Options, StripKind};
use crate::flavour::kind_has_relocations;

/// Mark every symbol used by a relocation in a section that has an
/// output counterpart.
///
/// Only symbol-targeted relocations are marked; the provider models the
/// absolute and per-section pseudo-targets separately and those never
/// pin a symbol-table entry.
pub(crate) fn mark_relocation_symbols(
    file: &File,
    surviving: &HashMap<SectionIndex, usize>,
) -> HashSet<SymbolIndex> {
    let mut marked = HashSet::new();
    if !kind_has_relocations(file.kind()) {
        return marked;
    }
    for section in file.sections() {
        if !surviving.contains_key(&section.index()) {
            continue;
        }
        for (_, relocation) in section.relocations() {
            if let RelocationTarget::Symbol(symbol) = relocation.target() {
                // Section symbols are marked too; the emitter resolves
                // them through the output section's own symbol.
                marked.insert(symbol);
            }
        }
    }
    marked
}

/// Enumerate the relocations to copy for one section.
///
/// Core dumps and remove-relocation rules yield an empty list (the
/// provider then emits no relocation section, clearing the presence
/// flag). Under global strip-all only relocations against explicitly
/// kept symbols survive.
pub(crate) fn copy_section_relocations(
    file: &File,
    section: &object::read::Section,
    input_name: &[u8],
    options: &Options,
) -> Vec<(u64, object::read::Relocation)> {
    if !kind_has_relocations(file.kind()) || options.sections.relocations_removed(input_name) {
        return Vec::new();
    }
    let mut relocations = Vec::new();
    for (offset, relocation) in section.relocations() {
        if options.strip == StripKind::All {
            let kept = match relocation.target() {
                RelocationTarget::Symbol(symbol) => file
                    .symbol_by_index(symbol)
                    .ok()
                    .and_then(|symbol| symbol.name_bytes().ok().map(|name| options.keep_symbols.matches(name)))
                    .unwrap_or(false),
                _ => false,
            };
            if !kept {
                continue;
            }
        }
        relocations.push((offset, relocation));
    }
    relocations
}
