//! The per-image copy pipeline: plan sections, mark relocation targets,
//! filter symbols, copy relocations and contents, fill gaps, and emit
//! the output through the object model provider.

use std::collections::{HashMap, HashSet};

#[cfg(feature = "logging")]
use log::warn;
use object::read::{File, Object, ObjectComdat, ObjectSection};
use object::{
    write, BinaryFormat, FileFlags, RelocationTarget, SectionFlags, SectionIndex, SectionKind,
    SymbolFlags, SymbolIndex,
};

use crate::config::Options;
use crate::sections::{is_bss_kind, plan_sections, SectionPlan};
use crate::symbols::{filter_symbols, SymbolPlace};
use crate::{archive, contents, fill, notes, relocs, Error, Result};

/// The outcome of a copy run.
#[derive(Debug)]
pub struct CopyOutput {
    /// The produced file contents.
    pub data: Vec<u8>,
    /// True if a non-fatal policy problem was recorded; the run's exit
    /// status should reflect it even though output was produced.
    pub failed: bool,
}

/// A copier for object and executable files.
///
/// This struct reads a file, applies the configured transformations, and
/// produces the output file contents.
#[derive(Debug)]
pub struct Copier<'data> {
    file: File<'data>,
}

impl<'data> Copier<'data> {
    /// Read a file and create a new copier.
    pub fn read(data: &'data [u8]) -> Result<Self> {
        let file = File::parse(data).map_err(Error::parse)?;
        Ok(Self { file })
    }

    /// The parsed input file.
    pub fn file(&self) -> &File<'data> {
        &self.file
    }

    /// Copy the file according to the given options.
    pub fn copy(&self, options: &Options) -> Result<CopyOutput> {
        let format = options.output_format.unwrap_or_else(|| self.file.format());
        let mut out = write::Object::new(format, self.file.architecture(), self.file.endianness());
        if format == self.file.format() {
            // Private format data passes through unopened.
            out.flags = self.file.flags();
        } else {
            out.flags = FileFlags::None;
        }
        let mut failed = false;

        let mut plans = plan_sections(&self.file, options)?;
        let surviving: HashMap<SectionIndex, usize> = plans
            .iter()
            .enumerate()
            .map(|(position, plan)| (plan.index, position))
            .collect();

        // Groups survive only whole; their signature symbols must not be
        // stripped.
        let mut group_signatures = HashSet::new();
        for comdat in self.file.comdats() {
            let members: Vec<SectionIndex> = comdat.sections().collect();
            if !members.is_empty() && members.iter().all(|index| surviving.contains_key(index)) {
                group_signatures.insert(comdat.symbol());
            }
        }

        let reloc_keep = relocs::mark_relocation_symbols(&self.file, &surviving);
        let filtered = filter_symbols(
            &self.file,
            options,
            &plans,
            &surviving,
            &reloc_keep,
            &group_signatures,
        )?;

        self.copy_contents(&mut plans, options)?;

        let fills = fill::plan_fills(&mut plans, options.gap_fill, options.pad_to);
        fill::apply(&mut plans, &fills);

        // Emit sections.
        for plan in &mut plans {
            let kind = if plan.has_contents || is_bss_kind(plan.kind) {
                plan.kind
            } else {
                SectionKind::UninitializedData
            };
            let id = out.add_section(plan.segment.clone(), plan.name.clone(), kind);
            let align = plan.align.max(1);
            if plan.has_contents {
                out.set_section_data(id, std::mem::take(&mut plan.data), align);
            } else {
                out.append_section_bss(id, plan.size, align);
            }
            out.section_mut(id).flags = match (plan.flags, format) {
                (SectionFlags::Elf { .. }, BinaryFormat::Elf) => plan.flags,
                (SectionFlags::Coff { .. }, BinaryFormat::Coff | BinaryFormat::Pe) => plan.flags,
                _ => SectionFlags::None,
            };
            plan.out = Some(id);
        }

        // Emit the symbol table in filtered order.
        let mut ids_by_source: HashMap<SymbolIndex, write::SymbolId> = HashMap::new();
        for symbol in &filtered.symbols {
            let section = match symbol.place {
                SymbolPlace::Undefined => write::SymbolSection::Undefined,
                SymbolPlace::Absolute => write::SymbolSection::Absolute,
                SymbolPlace::Common => write::SymbolSection::Common,
                SymbolPlace::Section(index) => {
                    write::SymbolSection::Section(plans[surviving[&index]].out.unwrap())
                }
                SymbolPlace::Plan(position) => {
                    write::SymbolSection::Section(plans[position].out.unwrap())
                }
            };
            let flags = match (symbol.st, format) {
                (Some((st_info, st_other)), BinaryFormat::Elf) => {
                    SymbolFlags::Elf { st_info, st_other }
                }
                _ => SymbolFlags::None,
            };
            let id = out.add_symbol(write::Symbol {
                name: symbol.name.clone(),
                value: symbol.value,
                size: symbol.size,
                kind: symbol.kind,
                scope: symbol.scope,
                weak: symbol.weak,
                section,
                flags,
            });
            if let Some(source) = symbol.source {
                ids_by_source.insert(source, id);
            }
        }

        // Re-emit surviving groups.
        for comdat in self.file.comdats() {
            let members: Vec<SectionIndex> = comdat.sections().collect();
            if members.is_empty() || !members.iter().all(|index| surviving.contains_key(index)) {
                continue;
            }
            let Some(&symbol) = ids_by_source.get(&comdat.symbol()) else {
                continue;
            };
            let sections = members
                .iter()
                .map(|index| plans[surviving[index]].out.unwrap())
                .collect();
            out.add_comdat(write::Comdat {
                kind: comdat.kind(),
                symbol,
                sections,
            });
        }

        // Copy relocations, consistently with the final symbol table.
        for plan in &plans {
            let section = self.file.section_by_index(plan.index).map_err(Error::parse)?;
            let out_id = plan.out.unwrap();
            for (offset, relocation) in
                relocs::copy_section_relocations(&self.file, &section, &plan.input_name, options)
            {
                let symbol = match relocation.target() {
                    RelocationTarget::Symbol(index) => {
                        if let Some(&id) = ids_by_source.get(&index) {
                            id
                        } else if let Some(&position) = filtered.section_symbols.get(&index) {
                            out.section_symbol(plans[position].out.unwrap())
                        } else {
                            #[cfg(feature = "logging")]
                            warn!(
                                "Dropping relocation at {:#x} in {}: target symbol was stripped",
                                offset,
                                String::from_utf8_lossy(&plan.name)
                            );
                            failed = true;
                            continue;
                        }
                    }
                    RelocationTarget::Section(index) => {
                        if let Some(&position) = surviving.get(&index) {
                            out.section_symbol(plans[position].out.unwrap())
                        } else {
                            #[cfg(feature = "logging")]
                            warn!(
                                "Dropping relocation at {:#x} in {}: target section was removed",
                                offset,
                                String::from_utf8_lossy(&plan.name)
                            );
                            failed = true;
                            continue;
                        }
                    }
                    _ => {
                        #[cfg(feature = "logging")]
                        warn!(
                            "Dropping relocation at {:#x} in {}: unsupported target",
                            offset,
                            String::from_utf8_lossy(&plan.name)
                        );
                        failed = true;
                        continue;
                    }
                };
                out.add_relocation(
                    out_id,
                    write::Relocation {
                        offset,
                        symbol,
                        addend: relocation.addend(),
                        flags: relocation.flags(),
                    },
                )
                .map_err(Error::write)?;
            }
        }

        let data = out.write().map_err(Error::write)?;
        Ok(CopyOutput { data, failed })
    }

    /// Produce the output bytes of every planned section.
    fn copy_contents(&self, plans: &mut [SectionPlan], options: &Options) -> Result<()> {
        let endian = self.file.endianness();
        let is_64 = self.file.is_64();
        for plan in plans.iter_mut() {
            if !plan.has_contents {
                continue;
            }
            if plan.zero_fill {
                plan.data = vec![0; plan.size as usize];
                continue;
            }
            let section = self.file.section_by_index(plan.index).map_err(Error::parse)?;
            let raw = section.data().map_err(Error::parse)?;
            let mut data = raw.to_vec();
            if let Some(unit) = options.reverse_bytes {
                contents::reverse_bytes(&mut data, unit, &plan.input_name)?;
            }
            if let Some(interleave) = options.interleave {
                data = contents::extract_interleave(&data, section.address(), &interleave);
            }
            if options.merge_notes
                && plan.kind == SectionKind::Note
                && plan.input_name.starts_with(b".gnu.build.attributes")
            {
                if let Some(merged) = notes::merge(&data, endian, is_64)? {
                    data = merged;
                }
            }
            plan.size = data.len() as u64;
            plan.data = data;
        }
        Ok(())
    }
}

/// Copy a file, dispatching between single objects and archives.
///
/// This is the top-level entry point: archives run the per-image
/// pipeline over every member, isolating member failures.
pub fn copy(data: &[u8], options: &Options) -> Result<CopyOutput> {
    if archive::is_archive(data) {
        archive::copy_archive(data, options)
    } else {
        Copier::read(data)?.copy(options)
    }
}
