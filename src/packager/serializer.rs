//! Serializes one module's ELF object into a module blob byte sequence:
//! header, section-info array, `PROGBITS` data bodies, and the per-import
//! relocation streams the encoder produced (§4.5).

use object::{ObjectSection, ObjectSymbol, SectionFlags};

use crate::bundle::{ImportModuleEntry, ModuleHeader, SectionInfo, NO_SECTION};
use crate::elf::ElfObject;
use crate::encoder::{encode_relocations, ImportGroup};
use crate::helper::{AlignPowerOfTwo, ParseProblem, Result, Writer};
use crate::resolver::Resolver;

// ELF `sh_type` values this packager cares about; the `object` crate does
// not expose these as a portable enum (`SectionKind` collapses PROGBITS
// executable/data/rodata into separate variants and has no single "stored
// vs. not" predicate), so they are named directly here.
const SHT_PROGBITS: u32 = 1;
const SHT_NOBITS: u32 = 8;

fn sh_type(section: &object::read::Section<'_, '_>) -> u32 {
    match section.flags() {
        SectionFlags::Elf { sh_type, .. } => sh_type,
        _ => 0,
    }
}

/// One module, fully serialized and ready to be concatenated into a bundle
/// by [`super::writer::write_bundle`].
pub struct SerializedModule {
    pub name: String,
    pub bytes: Vec<u8>,
    pub module_align: u32,
    pub noload_align: u32,
    pub noload_size: u32,
}

/// Find `name`'s ELF section index, or [`NO_SECTION`] if the module carries
/// no such section (the `.ctors`/`.dtors` lookup, §4.11).
fn find_section_index(elf: &ElfObject, name: &str) -> u16 {
    elf.section_by_name(name).map(|s| s.index().0 as u16).unwrap_or(NO_SECTION)
}

/// Resolve a hook symbol (`_prolog`/`_epilog`/`_unresolved`) to its
/// `(section, offset)` pair, or `(NO_SECTION, 0)` if the module exports no
/// such symbol.
fn find_hook(elf: &ElfObject, name: &str) -> (u16, u32) { elf.find_global_symbol(name).unwrap_or((NO_SECTION, 0)) }

/// Serialize one module object into its blob bytes (§4.5).
pub fn serialize_module(elf: &ElfObject, module_id: u32, resolver: &Resolver, name: String) -> Result<SerializedModule> {
    let groups: Vec<ImportGroup> = encode_relocations(elf, module_id, resolver)?;

    let sections: Vec<_> = elf.sections().collect();
    let num_sections = sections.len() as u32;

    let header_size = ModuleHeader::SIZE;
    let section_info_ofs = header_size;
    let section_info_size = num_sections * SectionInfo::SIZE;
    let mut data_ofs = section_info_ofs + section_info_size;

    let mut module_align = 4u32;
    let mut noload_align = 1u32;
    let mut noload_cursor = 0u32;

    let mut section_infos = Vec::with_capacity(sections.len());
    let mut section_bodies: Vec<&[u8]> = Vec::with_capacity(sections.len());
    let mut owned_bodies: Vec<Vec<u8>> = Vec::new();

    for section in &sections {
        match sh_type(section) {
            SHT_PROGBITS => {
                let align = (section.align() as u32).max(1);
                data_ofs = data_ofs.align_next(align);
                let size = section.size() as u32;
                section_infos.push(SectionInfo {
                    offset_or_null: data_ofs,
                    align,
                    size,
                });
                let data = section
                    .data()
                    .map_err(|_| ParseProblem::InvalidData("failed to read section data", std::panic::Location::caller()))?;
                owned_bodies.push(data.to_vec());
                data_ofs += size;
                module_align = module_align.max(align);
            },
            SHT_NOBITS => {
                let align = (section.align() as u32).max(1);
                noload_cursor = noload_cursor.align_next(align);
                let size = section.size() as u32;
                section_infos.push(SectionInfo {
                    offset_or_null: 0,
                    align,
                    size,
                });
                owned_bodies.push(Vec::new());
                noload_cursor += size;
                noload_align = noload_align.max(align);
            },
            _ => {
                section_infos.push(SectionInfo::default());
                owned_bodies.push(Vec::new());
            },
        }
    }
    section_bodies.extend(owned_bodies.iter().map(|v| v.as_slice()));
    let noload_size = noload_cursor;

    let mut blob = vec![0u8; header_size as usize];
    for info in &section_infos {
        info.write(&mut blob)?;
    }
    debug_assert_eq!(blob.len() as u32, section_info_ofs + section_info_size);

    for (info, body) in section_infos.iter().zip(section_bodies.iter()) {
        if info.is_null() || info.is_bss() {
            continue;
        }
        while (blob.len() as u32) < info.offset_or_null {
            blob.push(0);
        }
        blob.extend_from_slice(body);
    }

    let import_modules_ofs = (blob.len() as u32).align_next(4);
    while (blob.len() as u32) < import_modules_ofs {
        blob.push(0);
    }

    let num_import_modules = groups.len() as u32;
    let mut reloc_ofs = import_modules_ofs + num_import_modules * ImportModuleEntry::SIZE;
    let mut import_entries = Vec::with_capacity(groups.len());
    for group in &groups {
        import_entries.push(ImportModuleEntry {
            source_module_id: group.source_module_id,
            num_relocs: group.relocs.len() as u32,
            relocs_ofs: reloc_ofs,
        });
        reloc_ofs += group.relocs.len() as u32 * crate::bundle::RelocEntry::SIZE;
    }
    for entry in &import_entries {
        entry.write(&mut blob)?;
    }
    for group in &groups {
        for reloc in &group.relocs {
            reloc.write(&mut blob)?;
        }
    }

    let (ctor_section, dtor_section) = (find_section_index(elf, ".ctors"), find_section_index(elf, ".dtors"));
    let (prolog_section, prolog_ofs) = find_hook(elf, "_prolog");
    let (epilog_section, epilog_ofs) = find_hook(elf, "_epilog");
    let (unresolved_section, unresolved_ofs) = find_hook(elf, "_unresolved");

    let header = ModuleHeader {
        num_sections,
        section_info_ofs,
        num_import_modules,
        import_modules_ofs,
        ctor_section,
        dtor_section,
        prolog_section,
        epilog_section,
        unresolved_section,
        prolog_ofs,
        epilog_ofs,
        unresolved_ofs,
    };
    let mut header_bytes = Vec::new();
    header.write(&mut header_bytes)?;
    blob[..header_bytes.len()].copy_from_slice(&header_bytes);

    log::debug!(
        target: "ultramod::packager",
        "serialized module '{name}': {} bytes, {num_sections} section(s), {num_import_modules} import group(s)",
        blob.len()
    );

    Ok(SerializedModule {
        name,
        bytes: blob,
        module_align,
        noload_align,
        noload_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_section_index_falls_back_to_no_section() {
        // Exercised indirectly through `serialize_module` in
        // `packager::tests`; this just locks the sentinel value itself.
        assert_eq!(NO_SECTION, 0);
    }
}
