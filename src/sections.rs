//! Section planning: which input sections survive, and with what
//! geometry.

use std::collections::HashSet;

#[cfg(feature = "logging")]
use log::info;
use object::read::{File, Object, ObjectComdat, ObjectSection, ObjectSymbol};
use object::{elf, SectionFlags, SectionIndex, SectionKind};

use crate::config::{Options, SectionFlagSet, StripKind};
use crate::contents;
use crate::{Error, Result};

/// The planned output for one surviving input section.
///
/// Geometry is fixed at planning time; the content copier fills `data`
/// and the gap-fill engine may grow `size` afterwards.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SectionPlan {
    /// Input section index.
    pub(crate) index: SectionIndex,
    /// Input section name, before renaming.
    pub(crate) input_name: Vec<u8>,
    /// Output section name.
    pub(crate) name: Vec<u8>,
    /// Output segment name (Mach-O only; empty elsewhere).
    pub(crate) segment: Vec<u8>,
    pub(crate) kind: SectionKind,
    pub(crate) flags: SectionFlags,
    pub(crate) size: u64,
    pub(crate) vma: u64,
    pub(crate) lma: u64,
    pub(crate) align: u64,
    pub(crate) entsize: u64,
    /// The section occupies memory in the loaded image.
    pub(crate) loadable: bool,
    /// The section has bytes in the output file.
    pub(crate) has_contents: bool,
    /// Demoted to a content-free placeholder (only-keep-debug).
    pub(crate) placeholder: bool,
    /// Materialize `size` zero bytes (flag override requested contents).
    pub(crate) zero_fill: bool,
    /// Output section bytes, filled by the content copier.
    pub(crate) data: Vec<u8>,
    /// Output section handle, set at emit time.
    pub(crate) out: Option<object::write::SectionId>,
}

/// Debug section names, for formats whose section kinds don't already
/// say so.
fn is_debug_section_name(name: &[u8]) -> bool {
    name.starts_with(b".debug")
        || name.starts_with(b".gnu.debuglto_.debug_")
        || name.starts_with(b".gnu.linkonce.wi.")
        || name.starts_with(b".zdebug")
        || name.starts_with(b".line")
        || name.starts_with(b".stab")
        || name.starts_with(b".gdb_index")
}

fn is_debug_section(name: &[u8], kind: SectionKind) -> bool {
    kind == SectionKind::Debug || is_debug_section_name(name)
}

fn is_dwo_section(name: &[u8]) -> bool {
    name.ends_with(b".dwo")
}

/// Sections the object model provider rebuilds itself: symbol and string
/// tables, relocation sections, and group sections (re-emitted from the
/// COMDAT records).
fn provider_managed(kind: SectionKind) -> bool {
    match kind {
        SectionKind::Metadata => true,
        SectionKind::Elf(sh_type) => matches!(
            sh_type,
            elf::SHT_NULL
                | elf::SHT_SYMTAB
                | elf::SHT_SYMTAB_SHNDX
                | elf::SHT_STRTAB
                | elf::SHT_REL
                | elf::SHT_RELA
                | elf::SHT_GROUP
        ),
        _ => false,
    }
}

fn strip_removes_debug(options: &Options) -> bool {
    matches!(
        options.strip,
        StripKind::Debug | StripKind::Unneeded | StripKind::All
    ) || options.convert_debugging
}

/// The policy drop test for one section, ignoring group membership.
fn section_would_drop(name: &[u8], kind: SectionKind, options: &Options) -> bool {
    if options.sections.is_removed(name) {
        return true;
    }
    // `.reloc` is always preserved for platform-specific linkage.
    if is_debug_section(name, kind) && strip_removes_debug(options) && name != b".reloc" {
        return true;
    }
    match options.strip {
        StripKind::Dwo => is_dwo_section(name),
        StripKind::NonDwo => !is_dwo_section(name),
        _ => false,
    }
}

/// Whether the symbol policies would remove the named symbol. Used only
/// for group signature symbols, before the symbol filter runs.
pub(crate) fn symbol_scheduled_for_removal(name: &[u8], options: &Options) -> bool {
    if options.strip_symbols.matches(name) {
        return true;
    }
    options.strip == StripKind::All && !options.keep_symbols.matches(name)
}

/// Sections of COMDAT groups that must be dropped as a whole: the group
/// survives only if its signature symbol is kept and every member passes
/// the drop test.
pub(crate) fn group_dropped_sections(file: &File, options: &Options) -> HashSet<SectionIndex> {
    let mut dropped = HashSet::new();
    for comdat in file.comdats() {
        let members: Vec<SectionIndex> = comdat.sections().collect();
        let signature_removed = file
            .symbol_by_index(comdat.symbol())
            .ok()
            .and_then(|symbol| symbol.name_bytes().ok().map(|name| name.to_vec()))
            .map_or(true, |name| symbol_scheduled_for_removal(&name, options));
        let member_dropped = members.iter().any(|&index| match file.section_by_index(index) {
            Ok(section) => {
                let name = section.name_bytes().unwrap_or(b"");
                section_would_drop(name, section.kind(), options)
            }
            Err(_) => true,
        });
        if signature_removed || member_dropped {
            dropped.extend(members);
        }
    }
    dropped
}

/// Translate a flag override set to the output format's section flags.
fn override_flags(set: SectionFlagSet, format: object::BinaryFormat) -> SectionFlags {
    if format != object::BinaryFormat::Elf {
        return SectionFlags::None;
    }
    let mut sh_flags = 0;
    if set.intersects(SectionFlagSet::ALLOC | SectionFlagSet::LOAD) {
        sh_flags |= u64::from(elf::SHF_ALLOC);
    }
    if !set.contains(SectionFlagSet::READONLY) && !set.contains(SectionFlagSet::ROM) {
        sh_flags |= u64::from(elf::SHF_WRITE);
    }
    if set.contains(SectionFlagSet::CODE) {
        sh_flags |= u64::from(elf::SHF_EXECINSTR);
    }
    if set.contains(SectionFlagSet::MERGE) {
        sh_flags |= u64::from(elf::SHF_MERGE);
    }
    if set.contains(SectionFlagSet::STRINGS) {
        sh_flags |= u64::from(elf::SHF_STRINGS);
    }
    if set.contains(SectionFlagSet::EXCLUDE) {
        sh_flags |= u64::from(elf::SHF_EXCLUDE);
    }
    SectionFlags::Elf { sh_flags }
}

/// The section kind implied by a flag override, if it implies one.
fn override_kind(set: SectionFlagSet) -> Option<SectionKind> {
    if set.contains(SectionFlagSet::NOLOAD) {
        Some(SectionKind::UninitializedData)
    } else if set.contains(SectionFlagSet::CODE) {
        Some(SectionKind::Text)
    } else if set.contains(SectionFlagSet::DEBUG) {
        Some(SectionKind::Debug)
    } else if set.contains(SectionFlagSet::DATA) {
        if set.contains(SectionFlagSet::READONLY) {
            Some(SectionKind::ReadOnlyData)
        } else {
            Some(SectionKind::Data)
        }
    } else {
        None
    }
}

pub(crate) fn is_loadable(flags: SectionFlags, kind: SectionKind) -> bool {
    match flags {
        SectionFlags::Elf { sh_flags } => sh_flags & u64::from(elf::SHF_ALLOC) != 0,
        _ => matches!(
            kind,
            SectionKind::Text
                | SectionKind::Data
                | SectionKind::ReadOnlyData
                | SectionKind::ReadOnlyDataWithRel
                | SectionKind::ReadOnlyString
                | SectionKind::UninitializedData
                | SectionKind::Tls
                | SectionKind::UninitializedTls
        ),
    }
}

pub(crate) fn is_bss_kind(kind: SectionKind) -> bool {
    matches!(
        kind,
        SectionKind::UninitializedData | SectionKind::UninitializedTls | SectionKind::Common
    )
}

/// The ELF section entity size, where the flavour exposes it.
fn section_entsize(file: &File, index: SectionIndex) -> u64 {
    match file {
        File::Elf32(inner) => inner
            .elf_section_table()
            .section(index)
            .map_or(0, |header| u64::from(header.sh_entsize.get(inner.endian()))),
        File::Elf64(inner) => inner
            .elf_section_table()
            .section(index)
            .map_or(0, |header| header.sh_entsize.get(inner.endian())),
        _ => 0,
    }
}

/// Plan the output sections for `file`. The returned plans preserve
/// input order; dropped sections simply have no plan.
pub(crate) fn plan_sections(file: &File, options: &Options) -> Result<Vec<SectionPlan>> {
    let group_dropped = group_dropped_sections(file, options);
    let mut plans = Vec::new();
    for section in file.sections() {
        if let Some(plan) = plan_section(file, &section, options, &group_dropped)? {
            plans.push(plan);
        }
    }
    Ok(plans)
}

/// Decide whether one section survives, and with what name, flags and
/// geometry.
pub(crate) fn plan_section(
    file: &File,
    section: &object::read::Section,
    options: &Options,
    group_dropped: &HashSet<SectionIndex>,
) -> Result<Option<SectionPlan>> {
    let kind = section.kind();
    if provider_managed(kind) {
        return Ok(None);
    }
    let input_name = section.name_bytes().map_err(Error::parse)?.to_vec();
    if group_dropped.contains(&section.index()) {
        #[cfg(feature = "logging")]
        info!(
            "Removing group section {}",
            String::from_utf8_lossy(&input_name)
        );
        return Ok(None);
    }
    if section_would_drop(&input_name, kind, options) {
        #[cfg(feature = "logging")]
        info!("Removing section {}", String::from_utf8_lossy(&input_name));
        return Ok(None);
    }

    let mut name = match options.rename_sections.get(&input_name) {
        Some(new) => new.to_vec(),
        None => input_name.clone(),
    };
    if !options.prefix_sections.is_empty() {
        let mut prefixed = options.prefix_sections.clone();
        prefixed.extend_from_slice(&name);
        name = prefixed;
    }
    let segment = section
        .segment_name_bytes()
        .map_err(Error::parse)?
        .unwrap_or(b"")
        .to_vec();

    let input_flags = section.flags();
    let mut flags = input_flags;
    let mut out_kind = kind;
    let mut has_contents = !is_bss_kind(kind);
    let mut zero_fill = false;
    if let Some(set) = options.sections.flags(&input_name) {
        // The override replaces the flags wholesale, but the presence of
        // contents is preserved from the input unless the override asks
        // for contents to be materialized.
        flags = override_flags(set, file.format());
        if let Some(new_kind) = override_kind(set) {
            out_kind = new_kind;
        }
        if set.contains(SectionFlagSet::CONTENTS) && !has_contents {
            zero_fill = true;
            has_contents = true;
            out_kind = SectionKind::Data;
        }
    }

    let mut placeholder = false;
    if options.strip == StripKind::NonDebug
        && !is_debug_section(&input_name, kind)
        && is_loadable(input_flags, kind)
    {
        // Keep the section's identity and input flags bit-for-bit, but
        // write no bytes for it.
        placeholder = true;
        has_contents = false;
        zero_fill = false;
        flags = input_flags;
    }

    // The generic provider reports one address per section; it serves as
    // both VMA and LMA on input.
    let input_vma = section.address();
    let input_lma = section.address();
    let vma = match options.sections.vma(&input_name) {
        Some(change) => change.apply(input_vma),
        None => input_vma.wrapping_add(options.change_addresses as u64),
    };
    let mut lma = match options.sections.lma(&input_name) {
        Some(change) => change.apply(input_lma),
        None => input_lma.wrapping_add(options.change_addresses as u64),
    };

    let mut size = section.size();
    if options.extract_symbol {
        size = 0;
        has_contents = false;
        zero_fill = false;
    } else if let Some(interleave) = options.interleave {
        if has_contents && !zero_fill {
            size = contents::interleaved_size(size, input_lma, &interleave);
            lma /= interleave.stride;
        }
    }

    Ok(Some(SectionPlan {
        index: section.index(),
        input_name,
        name,
        segment,
        kind: out_kind,
        flags,
        size,
        vma,
        lma,
        align: section.align(),
        entsize: section_entsize(file, section.index()),
        loadable: is_loadable(flags, out_kind),
        has_contents,
        placeholder,
        zero_fill,
        data: Vec::new(),
        out: None,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AddressChange;
    use object::write;
    use object::{Architecture, BinaryFormat, Endianness};

    fn fixture() -> Vec<u8> {
        let mut obj = write::Object::new(
            BinaryFormat::Elf,
            Architecture::X86_64,
            Endianness::Little,
        );
        let text = obj.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
        obj.set_section_data(text, vec![0xc3; 16], 16);
        let data = obj.add_section(Vec::new(), b".data".to_vec(), SectionKind::Data);
        obj.set_section_data(data, vec![1, 2, 3, 4], 4);
        let debug = obj.add_section(Vec::new(), b".debug_info".to_vec(), SectionKind::Debug);
        obj.set_section_data(debug, vec![0xaa; 8], 1);
        obj.write().unwrap()
    }

    fn names(plans: &[SectionPlan]) -> Vec<Vec<u8>> {
        plans.iter().map(|plan| plan.name.clone()).collect()
    }

    #[test]
    fn replanning_is_idempotent() {
        let bytes = fixture();
        let file = File::parse(&*bytes).unwrap();
        let mut options = Options::default();
        options.strip = StripKind::Debug;
        options
            .sections
            .change_vma(b".data", AddressChange::Set(0x2000))
            .unwrap();
        let first = plan_sections(&file, &options).unwrap();
        let second = plan_sections(&file, &options).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn strip_debug_drops_debug_sections() {
        let bytes = fixture();
        let file = File::parse(&*bytes).unwrap();
        let mut options = Options::default();
        options.strip = StripKind::Debug;
        let plans = plan_sections(&file, &options).unwrap();
        assert!(names(&plans).contains(&b".text".to_vec()));
        assert!(!names(&plans).contains(&b".debug_info".to_vec()));
    }

    #[test]
    fn remove_rule_drops_section() {
        let bytes = fixture();
        let file = File::parse(&*bytes).unwrap();
        let mut options = Options::default();
        options.sections.remove(b".data").unwrap();
        let plans = plan_sections(&file, &options).unwrap();
        assert!(!names(&plans).contains(&b".data".to_vec()));
        assert!(names(&plans).contains(&b".text".to_vec()));
    }

    #[test]
    fn rename_and_address_changes_apply() {
        let bytes = fixture();
        let file = File::parse(&*bytes).unwrap();
        let mut options = Options::default();
        options
            .rename_sections
            .insert(b".data".to_vec(), b".rodata".to_vec())
            .unwrap();
        options
            .sections
            .change_vma(b".data", AddressChange::Set(0x4000))
            .unwrap();
        options
            .sections
            .change_lma(b".data", AddressChange::Adjust(0x100))
            .unwrap();
        let plans = plan_sections(&file, &options).unwrap();
        let plan = plans
            .iter()
            .find(|plan| plan.input_name == b".data")
            .unwrap();
        assert_eq!(plan.name, b".rodata");
        assert_eq!(plan.vma, 0x4000);
        assert_eq!(plan.lma, 0x100);
    }

    #[test]
    fn whole_image_delta_applies_when_no_rule_matches() {
        let bytes = fixture();
        let file = File::parse(&*bytes).unwrap();
        let mut options = Options::default();
        options.change_addresses = 0x1000;
        let plans = plan_sections(&file, &options).unwrap();
        for plan in &plans {
            assert_eq!(plan.vma, 0x1000);
            assert_eq!(plan.lma, 0x1000);
        }
    }

    #[test]
    fn only_keep_debug_demotes_non_debug_sections() {
        let bytes = fixture();
        let file = File::parse(&*bytes).unwrap();
        let mut options = Options::default();
        options.strip = StripKind::NonDebug;
        let plans = plan_sections(&file, &options).unwrap();
        let text = plans
            .iter()
            .find(|plan| plan.input_name == b".text")
            .unwrap();
        assert!(text.placeholder);
        assert!(!text.has_contents);
        // Input flags survive bit-for-bit.
        let file_text = file.section_by_name(".text").unwrap();
        assert_eq!(text.flags, file_text.flags());
        let debug = plans
            .iter()
            .find(|plan| plan.input_name == b".debug_info")
            .unwrap();
        assert!(!debug.placeholder);
    }

    #[test]
    fn extract_symbol_zeroes_sizes() {
        let bytes = fixture();
        let file = File::parse(&*bytes).unwrap();
        let mut options = Options::default();
        options.extract_symbol = true;
        let plans = plan_sections(&file, &options).unwrap();
        assert!(plans.iter().all(|plan| plan.size == 0));
    }
}
