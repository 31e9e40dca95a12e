//! Symbol filtering: one ordered pass over the symbol table deciding
//! survival, names and visibility, followed by synthetic symbol
//! splicing.

use std::collections::{HashMap, HashSet};

#[cfg(feature = "logging")]
use log::info;
use object::read::{File, Object, ObjectSection, ObjectSymbol};
use object::{elf, ObjectKind, SymbolFlags, SymbolIndex, SymbolKind, SymbolScope, SymbolSection};

use crate::config::{AddedSymbol, DiscardKind, Options, StripKind, SymbolAttrs};
use crate::flavour::Flavour;
use crate::sections::SectionPlan;
use crate::{Error, Result};

/// Where an output symbol is defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SymbolPlace {
    Undefined,
    Absolute,
    Common,
    /// Defined in the input section with this index.
    Section(object::SectionIndex),
    /// Defined in the planned output section with this position.
    Plan(usize),
}

/// One symbol of the output symbol table.
#[derive(Debug, Clone)]
pub(crate) struct OutputSymbol {
    /// The input symbol this was copied from, if any.
    pub(crate) source: Option<SymbolIndex>,
    pub(crate) name: Vec<u8>,
    pub(crate) value: u64,
    pub(crate) size: u64,
    pub(crate) kind: SymbolKind,
    pub(crate) scope: SymbolScope,
    pub(crate) weak: bool,
    pub(crate) place: SymbolPlace,
    /// ELF `st_info`/`st_other`, with the binding bits already adjusted
    /// for any visibility transform.
    pub(crate) st: Option<(u8, u8)>,
}

/// The result of the filtering pass.
#[derive(Debug, Default)]
pub(crate) struct FilteredSymbols {
    /// Surviving symbols, input order preserved, synthetic symbols
    /// spliced in.
    pub(crate) symbols: Vec<OutputSymbol>,
    /// Input section-symbol index to plan position; the provider
    /// materializes these on demand.
    pub(crate) section_symbols: HashMap<SymbolIndex, usize>,
}

fn lossy(name: &[u8]) -> String {
    String::from_utf8_lossy(name).into_owned()
}

/// The survival decision for one non-section symbol, in precedence
/// order. `Err` is raised when a policy conflicts with a
/// relocation-kept symbol.
#[allow(clippy::too_many_arguments)]
fn keep_symbol(
    symbol: &object::read::Symbol,
    name: &[u8],
    options: &Options,
    flavour: Flavour,
    relocatable: bool,
    reloc_kept: bool,
    group_signature: bool,
    surviving: &HashMap<object::SectionIndex, usize>,
) -> Result<bool> {
    let weak = symbol.is_weak();
    let global = symbol.is_global();
    let unneeded = options.strip == StripKind::Unneeded;

    // 1. Global strip-all: only an explicit keep pattern saves a symbol.
    if options.strip == StripKind::All {
        if options.keep_symbols.matches(name) {
            return Ok(true);
        }
        if reloc_kept {
            return Err(Error::config(format!(
                "symbol '{}' is needed by a relocation and can't be stripped",
                lossy(name)
            )));
        }
        return Ok(false);
    }

    // 2. Relocation targets are kept unconditionally; an explicit strip
    // pattern for one is a configuration error.
    if reloc_kept {
        if options.strip_symbols.matches(name) {
            return Err(Error::config(format!(
                "symbol '{}' is needed by a relocation and can't be stripped",
                lossy(name)
            )));
        }
        return Ok(true);
    }

    let is_debug = symbol.kind() == SymbolKind::File;
    let mut keep = if relocatable && (global || weak || symbol.is_common()) {
        // 3. Unlinked objects keep their external symbols.
        !unneeded
    } else if is_debug {
        // 4. Debug symbols go when debug info goes.
        (options.keep_file_symbols && symbol.kind() == SymbolKind::File)
            || !(matches!(options.strip, StripKind::Debug)
                || unneeded
                || options.convert_debugging)
    } else if global || weak || symbol.is_undefined() || symbol.is_common() {
        // 5. External symbols otherwise survive everything but
        // strip-unneeded.
        !unneeded
    } else if group_signature {
        // 6. Group signatures hold their groups together.
        true
    } else if symbol.is_local() {
        // 7. Locals honor the discard policies.
        !(unneeded
            || options.discard == DiscardKind::All
            || (options.discard == DiscardKind::Locals
                && name.starts_with(flavour.local_label_prefix())))
    } else {
        true
    };

    // 8. Explicit name patterns override, and membership in a dropped
    // section overrides even those.
    if options.strip_symbols.matches(name) {
        keep = false;
    }
    if options.strip_unneeded_symbols.matches(name) {
        keep = false;
    }
    if options.keep_symbols.matches(name) {
        keep = true;
    }
    if let SymbolSection::Section(index) = symbol.section() {
        if !surviving.contains_key(&index) {
            keep = false;
        }
    }
    Ok(keep)
}

/// Apply the name transforms every survivor receives.
fn transform_name(
    mut name: Vec<u8>,
    options: &Options,
    flavour: Flavour,
    out_flavour: Flavour,
) -> Vec<u8> {
    if options.remove_leading_char {
        if let Some(leading) = flavour.leading_char() {
            if name.first() == Some(&leading) {
                name.remove(0);
            }
        }
    }
    if options.change_leading_char && flavour != out_flavour {
        if let Some(leading) = flavour.leading_char() {
            if name.first() == Some(&leading) {
                name.remove(0);
            }
        }
        if let Some(leading) = out_flavour.leading_char() {
            name.insert(0, leading);
        }
    }
    if !options.prefix_symbols.is_empty() {
        let mut prefixed = options.prefix_symbols.clone();
        prefixed.extend_from_slice(&name);
        name = prefixed;
    }
    if let Some(new) = options.rename_symbols.get(&name) {
        name = new.to_vec();
    }
    name
}

fn added_to_output(added: &AddedSymbol, plans: &[SectionPlan]) -> Result<OutputSymbol> {
    let place = match &added.section {
        Some(section) => {
            let position = plans
                .iter()
                .position(|plan| &plan.name == section)
                .ok_or_else(|| {
                    Error::config(format!(
                        "section '{}' for symbol '{}' not found",
                        lossy(section),
                        lossy(&added.name)
                    ))
                })?;
            SymbolPlace::Plan(position)
        }
        None => SymbolPlace::Absolute,
    };
    let kind = if added.attrs.contains(SymbolAttrs::FUNCTION) {
        SymbolKind::Text
    } else if added.attrs.contains(SymbolAttrs::OBJECT) {
        SymbolKind::Data
    } else if added.attrs.contains(SymbolAttrs::FILE) {
        SymbolKind::File
    } else {
        SymbolKind::Unknown
    };
    let scope = if added.attrs.contains(SymbolAttrs::LOCAL) {
        SymbolScope::Compilation
    } else if added.attrs.contains(SymbolAttrs::HIDDEN) {
        SymbolScope::Linkage
    } else {
        SymbolScope::Dynamic
    };
    Ok(OutputSymbol {
        source: None,
        name: added.name.clone(),
        value: added.value,
        size: 0,
        kind,
        scope,
        weak: added.attrs.contains(SymbolAttrs::WEAK),
        place,
        st: None,
    })
}

/// Filter the input symbol table in one ordered pass.
///
/// `reloc_keep` holds the symbols marked by the relocation copier;
/// `group_signatures` holds the signature symbols of surviving COMDAT
/// groups.
pub(crate) fn filter_symbols(
    file: &File,
    options: &Options,
    plans: &[SectionPlan],
    surviving: &HashMap<object::SectionIndex, usize>,
    reloc_keep: &HashSet<SymbolIndex>,
    group_signatures: &HashSet<SymbolIndex>,
) -> Result<FilteredSymbols> {
    let flavour = Flavour::from_format(file.format());
    let out_flavour = Flavour::from_format(options.output_format.unwrap_or_else(|| file.format()));
    let relocatable = file.kind() == ObjectKind::Relocatable;

    let mut anchored: HashMap<Vec<u8>, Vec<&AddedSymbol>> = HashMap::new();
    for added in &options.add_symbols {
        if let Some(anchor) = &added.before {
            anchored.entry(anchor.clone()).or_default().push(added);
        }
    }

    let mut filtered = FilteredSymbols::default();
    for symbol in file.symbols() {
        let index = symbol.index();
        if flavour.has_null_symbol() && index.0 == 0 {
            continue;
        }

        // Section symbols are materialized by the provider; only the
        // mapping for relocation targets is recorded.
        if symbol.kind() == SymbolKind::Section {
            if let SymbolSection::Section(section) = symbol.section() {
                if let Some(&position) = surviving.get(&section) {
                    filtered.section_symbols.insert(index, position);
                }
            }
            continue;
        }

        let name = symbol.name_bytes().map_err(Error::parse)?;
        if !keep_symbol(
            &symbol,
            name,
            options,
            flavour,
            relocatable,
            reloc_keep.contains(&index),
            group_signatures.contains(&index),
            surviving,
        )? {
            #[cfg(feature = "logging")]
            info!("Stripping symbol {}", lossy(name));
            continue;
        }

        let name = transform_name(name.to_vec(), options, flavour, out_flavour);

        let (mut st_info, st_other) = match symbol.flags() {
            SymbolFlags::Elf { st_info, st_other } => (Some(st_info), Some(st_other)),
            _ => (None, None),
        };
        let mut weak = symbol.is_weak();
        let mut global = symbol.is_global() && !weak;
        let mut scope = symbol.scope();
        if !symbol.is_undefined() {
            if (options.weaken || options.weaken_symbols.matches(&name)) && global {
                global = false;
                weak = true;
            }
            let hidden = st_other
                .map(|other| matches!(other & 0x3, elf::STV_INTERNAL | elf::STV_HIDDEN))
                .unwrap_or(false);
            let demoted = !options.keep_global_symbols.is_empty()
                && !options.keep_global_symbols.matches(&name);
            if (global || weak)
                && (options.localize_symbols.matches(&name)
                    || demoted
                    || (options.localize_hidden && hidden))
            {
                global = false;
                weak = false;
                scope = SymbolScope::Compilation;
            } else if symbol.is_local() && options.globalize_symbols.matches(&name) {
                global = true;
                scope = SymbolScope::Dynamic;
            }
        }
        if let Some(info) = st_info.as_mut() {
            let bind = if weak {
                elf::STB_WEAK
            } else if global {
                elf::STB_GLOBAL
            } else {
                elf::STB_LOCAL
            };
            *info = (bind << 4) | (*info & 0xf);
        }

        let (place, value) = match symbol.section() {
            SymbolSection::Section(section) => {
                let base = file
                    .section_by_index(section)
                    .map_err(Error::parse)?
                    .address();
                (
                    SymbolPlace::Section(section),
                    symbol.address().wrapping_sub(base),
                )
            }
            SymbolSection::Absolute => (SymbolPlace::Absolute, symbol.address()),
            SymbolSection::Common => (SymbolPlace::Common, symbol.address()),
            _ => (SymbolPlace::Undefined, symbol.address()),
        };

        if let Some(pending) = anchored.remove(&name) {
            for added in pending {
                filtered.symbols.push(added_to_output(added, plans)?);
            }
        }
        filtered.symbols.push(OutputSymbol {
            source: Some(index),
            name,
            value,
            size: symbol.size(),
            kind: symbol.kind(),
            scope,
            weak,
            place,
            st: st_info.map(|info| (info, st_other.unwrap_or(0))),
        });
    }

    // Unmatched anchors are fatal; unanchored additions append in
    // configuration order.
    for added in &options.add_symbols {
        match &added.before {
            Some(anchor) => {
                if anchored.contains_key(anchor) {
                    return Err(Error::config(format!(
                        "insert-before symbol '{}' not found",
                        lossy(anchor)
                    )));
                }
            }
            None => {
                filtered.symbols.push(added_to_output(added, plans)?);
            }
        }
    }

    Ok(filtered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sections::plan_sections;
    use object::write;
    use object::{Architecture, BinaryFormat, Endianness, SectionKind};

    fn fixture() -> Vec<u8> {
        let mut obj = write::Object::new(
            BinaryFormat::Elf,
            Architecture::X86_64,
            Endianness::Little,
        );
        let text = obj.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
        obj.set_section_data(text, vec![0xc3; 16], 16);
        obj.add_symbol(write::Symbol {
            name: b"main".to_vec(),
            value: 0,
            size: 8,
            kind: SymbolKind::Text,
            scope: SymbolScope::Dynamic,
            weak: false,
            section: write::SymbolSection::Section(text),
            flags: SymbolFlags::None,
        });
        obj.add_symbol(write::Symbol {
            name: b"helper".to_vec(),
            value: 8,
            size: 8,
            kind: SymbolKind::Text,
            scope: SymbolScope::Dynamic,
            weak: false,
            section: write::SymbolSection::Section(text),
            flags: SymbolFlags::None,
        });
        obj.add_symbol(write::Symbol {
            name: b".Llocal".to_vec(),
            value: 4,
            size: 0,
            kind: SymbolKind::Text,
            scope: SymbolScope::Compilation,
            weak: false,
            section: write::SymbolSection::Section(text),
            flags: SymbolFlags::None,
        });
        obj.write().unwrap()
    }

    fn run(options: &Options, reloc_keep: &[&[u8]]) -> Result<FilteredSymbols> {
        let bytes = fixture();
        let file = File::parse(&*bytes).unwrap();
        let plans = plan_sections(&file, options).unwrap();
        let surviving: HashMap<object::SectionIndex, usize> = plans
            .iter()
            .enumerate()
            .map(|(position, plan)| (plan.index, position))
            .collect();
        let keep: HashSet<SymbolIndex> = file
            .symbols()
            .filter(|symbol| {
                symbol
                    .name_bytes()
                    .map(|name| reloc_keep.contains(&name))
                    .unwrap_or(false)
            })
            .map(|symbol| symbol.index())
            .collect();
        filter_symbols(&file, options, &plans, &surviving, &keep, &HashSet::new())
    }

    fn names(filtered: &FilteredSymbols) -> Vec<Vec<u8>> {
        filtered
            .symbols
            .iter()
            .map(|symbol| symbol.name.clone())
            .collect()
    }

    #[test]
    fn strip_all_removes_everything() {
        let mut options = Options::default();
        options.strip = StripKind::All;
        let filtered = run(&options, &[]).unwrap();
        assert!(filtered.symbols.is_empty());
    }

    #[test]
    fn strip_all_honors_keep_patterns() {
        let mut options = Options::default();
        options.strip = StripKind::All;
        options.keep_symbols.insert(b"main".to_vec());
        let filtered = run(&options, &[]).unwrap();
        assert_eq!(names(&filtered), vec![b"main".to_vec()]);
    }

    #[test]
    fn strip_all_with_reloc_kept_symbol_is_fatal() {
        let mut options = Options::default();
        options.strip = StripKind::All;
        let err = run(&options, &[b"helper"]).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Config);
    }

    #[test]
    fn strip_pattern_on_reloc_kept_symbol_is_fatal() {
        let mut options = Options::default();
        options.strip_symbols.insert(b"helper".to_vec());
        let err = run(&options, &[b"helper"]).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Config);
    }

    #[test]
    fn reloc_kept_symbol_survives_strip_unneeded() {
        let mut options = Options::default();
        options.strip = StripKind::Unneeded;
        let filtered = run(&options, &[b"helper"]).unwrap();
        assert_eq!(names(&filtered), vec![b"helper".to_vec()]);
    }

    #[test]
    fn discard_locals_uses_label_prefix() {
        let mut options = Options::default();
        options.discard = DiscardKind::Locals;
        let filtered = run(&options, &[]).unwrap();
        assert!(!names(&filtered).contains(&b".Llocal".to_vec()));
        assert!(names(&filtered).contains(&b"main".to_vec()));
    }

    #[test]
    fn localize_and_weaken_adjust_binding() {
        let mut options = Options::default();
        options.localize_symbols.insert(b"main".to_vec());
        options.weaken_symbols.insert(b"helper".to_vec());
        let filtered = run(&options, &[]).unwrap();
        let main = filtered
            .symbols
            .iter()
            .find(|symbol| symbol.name == b"main")
            .unwrap();
        assert_eq!(main.scope, SymbolScope::Compilation);
        assert_eq!(main.st.map(|(info, _)| info >> 4), Some(elf::STB_LOCAL));
        let helper = filtered
            .symbols
            .iter()
            .find(|symbol| symbol.name == b"helper")
            .unwrap();
        assert!(helper.weak);
        assert_eq!(helper.st.map(|(info, _)| info >> 4), Some(elf::STB_WEAK));
    }

    #[test]
    fn keep_global_allow_list_localizes_the_rest() {
        let mut options = Options::default();
        options.keep_global_symbols.insert(b"main".to_vec());
        let filtered = run(&options, &[]).unwrap();
        let helper = filtered
            .symbols
            .iter()
            .find(|symbol| symbol.name == b"helper")
            .unwrap();
        assert_eq!(helper.scope, SymbolScope::Compilation);
        let main = filtered
            .symbols
            .iter()
            .find(|symbol| symbol.name == b"main")
            .unwrap();
        assert_ne!(main.scope, SymbolScope::Compilation);
    }

    #[test]
    fn rename_applies_to_survivors() {
        let mut options = Options::default();
        options
            .rename_symbols
            .insert(b"main".to_vec(), b"entry".to_vec())
            .unwrap();
        let filtered = run(&options, &[]).unwrap();
        assert!(names(&filtered).contains(&b"entry".to_vec()));
        assert!(!names(&filtered).contains(&b"main".to_vec()));
    }

    #[test]
    fn anchored_addition_inserted_before_anchor() {
        let mut options = Options::default();
        options.add_symbols.push(AddedSymbol {
            name: b"injected".to_vec(),
            section: Some(b".text".to_vec()),
            value: 0,
            attrs: SymbolAttrs::GLOBAL | SymbolAttrs::FUNCTION,
            before: Some(b"helper".to_vec()),
        });
        let filtered = run(&options, &[]).unwrap();
        let names = names(&filtered);
        let injected = names.iter().position(|n| n == b"injected").unwrap();
        let helper = names.iter().position(|n| n == b"helper").unwrap();
        assert_eq!(injected + 1, helper);
    }

    #[test]
    fn unmatched_anchor_is_fatal() {
        let mut options = Options::default();
        options.add_symbols.push(AddedSymbol {
            name: b"injected".to_vec(),
            section: None,
            value: 0x10,
            attrs: SymbolAttrs::GLOBAL,
            before: Some(b"missing".to_vec()),
        });
        let err = run(&options, &[]).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Config);
    }

    #[test]
    fn unanchored_additions_append_in_order() {
        let mut options = Options::default();
        for name in [b"one".as_slice(), b"two".as_slice()] {
            options.add_symbols.push(AddedSymbol {
                name: name.to_vec(),
                section: None,
                value: 0,
                attrs: SymbolAttrs::GLOBAL,
                before: None,
            });
        }
        let filtered = run(&options, &[]).unwrap();
        let names = names(&filtered);
        let len = names.len();
        assert_eq!(&names[len - 2..], &[b"one".to_vec(), b"two".to_vec()][..]);
    }
}
