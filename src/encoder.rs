//! Turns one module's ELF relocations into the bundle's per-import
//! relocation streams (§4.4).

use std::collections::HashMap;

use object::{ObjectSection, ObjectSymbol, RelocationFlags, RelocationTarget, SymbolSection};

use crate::bundle::{RelocEntry, RelocType};
use crate::elf::ElfObject;
use crate::helper::{ParseProblem, Result};
use crate::resolver::Resolver;

/// All relocations routed to one source module, in the order they must be
/// replayed by the loader.
#[derive(Debug, Clone)]
pub struct ImportGroup {
    pub source_module_id: u32,
    pub relocs:            Vec<RelocEntry>,
}

/// Walk every relocation in `elf` (a module about to be assigned
/// `module_id`) and group them by the module that defines the referenced
/// symbol, inserting [`RelocType::UltraSec`] markers whenever the section
/// being patched changes within a group.
pub fn encode_relocations(elf: &ElfObject, module_id: u32, resolver: &Resolver) -> Result<Vec<ImportGroup>> {
    let mut groups: Vec<ImportGroup> = Vec::new();
    let mut cursors: HashMap<u32, Option<u16>> = HashMap::new();

    let group_index = |groups: &mut Vec<ImportGroup>, source_module_id: u32| -> usize {
        if let Some(i) = groups.iter().position(|g| g.source_module_id == source_module_id) {
            return i;
        }
        groups.push(ImportGroup {
            source_module_id,
            relocs: Vec::new(),
        });
        groups.len() - 1
    };

    for patch_section in elf.sections() {
        let patch_index = patch_section.index().0 as u16;

        for (offset, reloc) in patch_section.relocations() {
            let RelocationFlags::Elf { r_type } = reloc.flags() else {
                return Err(ParseProblem::InvalidData(
                    "non-ELF relocation flags",
                    std::panic::Location::caller(),
                )
                .into());
            };
            let kind = RelocType::try_from(r_type as u8)
                .map_err(|_| ParseProblem::UnknownRelocationType(r_type as u8, std::panic::Location::caller()))?;

            let RelocationTarget::Symbol(symbol_index) = reloc.target() else {
                return Err(
                    ParseProblem::InvalidData("unsupported relocation target", std::panic::Location::caller()).into(),
                );
            };
            let symbol = elf.symbol_by_index(symbol_index).ok_or_else(|| {
                ParseProblem::InvalidData("relocation targets unknown symbol", std::panic::Location::caller())
            })?;

            let (source_module_id, symbol_section, sym_ofs) = match symbol.section() {
                SymbolSection::Section(index) => {
                    // Defined within this same object: a self-import.
                    (module_id, index.0 as u16, (symbol.address() as i64 + reloc.addend()) as u32)
                },
                SymbolSection::Undefined => {
                    let name = symbol
                        .name()
                        .map_err(|_| ParseProblem::InvalidData("symbol name is not valid UTF-8", std::panic::Location::caller()))?;
                    let resolved = resolver.resolve(name, module_id, patch_section.name().unwrap_or(""), offset as u32)?;
                    (resolved.module_id, resolved.section, (resolved.address as i64 + reloc.addend()) as u32)
                },
                _ => {
                    return Err(
                        ParseProblem::InvalidData("unsupported symbol section kind", std::panic::Location::caller())
                            .into(),
                    )
                },
            };

            let index = group_index(&mut groups, source_module_id);
            let cursor = cursors.entry(source_module_id).or_insert(None);
            if *cursor != Some(patch_index) {
                groups[index].relocs.push(RelocEntry {
                    offset:  0,
                    kind:    RelocType::UltraSec.into(),
                    section: patch_index,
                    sym_ofs: 0,
                });
                *cursor = Some(patch_index);
            }

            groups[index].relocs.push(RelocEntry {
                offset: offset as u32,
                kind: kind.into(),
                section: symbol_section,
                sym_ofs,
            });
        }
    }

    Ok(groups)
}
