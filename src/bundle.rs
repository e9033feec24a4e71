//! On-disk bundle format shared by the packager and the runtime loader.
//!
//! Everything in this module is a direct transcription of the byte layout:
//! it performs no linking, relocation or allocation decisions of its own, it
//! only knows how to read and write the bytes. The packager
//! ([`crate::packager`]) and the runtime loader ([`crate::loader`]) build on
//! top of these types so that both sides of the format agree bit-for-bit.
//!
//! Big-endian throughout: `num_modules`, `string_table_size`, a handle-record
//! table, a NUL-terminated name string table (2-byte aligned), and the
//! concatenated module blobs.

use std::io::Cursor;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::helper::{ensure, AlignPowerOfTwo, ParseProblem, Parser, Result, Seeker, Writer};

/// Sentinel used for a module-header section field that has no hook.
pub const NO_SECTION: u16 = 0;
/// `module_id` for relocations sourced from the host executable.
pub const HOST_MODULE: u32 = 0;

/// The outer bundle header: `{num_modules, string_table_size}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OuterHeader {
    pub num_modules:       u32,
    pub string_table_size: u32,
}

impl OuterHeader {
    pub const SIZE: u32 = 8;

    pub fn read<R: Parser + Seeker>(r: &mut R) -> Result<Self> {
        Ok(OuterHeader {
            num_modules:       r.bu32()?,
            string_table_size: r.bu32()?,
        })
    }

    pub fn write<W: Writer>(&self, w: &mut W) -> Result<()> {
        w.bu32(self.num_modules)?;
        w.bu32(self.string_table_size)?;
        Ok(())
    }
}

/// One entry in the outer handle table (32 bytes on disk).
///
/// At rest every offset is file-absolute; the loader turns `name_offset` and
/// `rom_offset` into addresses/absolute offsets relative to the regions it
/// allocates (§4.7), but this type itself never mutates its fields in place —
/// see the "typed offsets instead of in-place pointer fixups" redesign flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleRecord {
    pub name_offset:  u32,
    pub module_align: u32,
    pub module_size:  u32,
    pub rom_offset:   u32,
    pub noload_align: u32,
    pub noload_size:  u32,
}

impl HandleRecord {
    pub const SIZE: u32 = 32;

    pub fn read<R: Parser + Seeker>(r: &mut R) -> Result<Self> {
        let name_offset = r.bu32()?;
        let module_align = r.bu32()?;
        let module_size = r.bu32()?;
        let rom_offset = r.bu32()?;
        let noload_align = r.bu32()?;
        let noload_size = r.bu32()?;
        let _reserved0 = r.bu32()?;
        let _reserved1 = r.bu32()?;
        Ok(HandleRecord {
            name_offset,
            module_align,
            module_size,
            rom_offset,
            noload_align,
            noload_size,
        })
    }

    pub fn write<W: Writer>(&self, w: &mut W) -> Result<()> {
        w.bu32(self.name_offset)?;
        w.bu32(self.module_align)?;
        w.bu32(self.module_size)?;
        w.bu32(self.rom_offset)?;
        w.bu32(self.noload_align)?;
        w.bu32(self.noload_size)?;
        w.bu32(0)?;
        w.bu32(0)?;
        Ok(())
    }

    /// Total RAM footprint of the loaded image: the stored bytes, aligned up
    /// to the BSS alignment, plus the BSS arena (§4.7 step 2).
    pub fn footprint(&self) -> u32 { self.module_size.align_next(self.noload_align.max(1)) + self.noload_size }

    /// RAM alignment required for the combined image.
    pub fn ram_align(&self) -> u32 { self.module_align.max(self.noload_align).max(1) }
}

/// A module blob's header (§4.1, 40 bytes on disk).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleHeader {
    pub num_sections:        u32,
    pub section_info_ofs:    u32,
    pub num_import_modules:  u32,
    pub import_modules_ofs:  u32,
    pub ctor_section:        u16,
    pub dtor_section:        u16,
    pub prolog_section:      u16,
    pub epilog_section:      u16,
    pub unresolved_section:  u16,
    pub prolog_ofs:          u32,
    pub epilog_ofs:          u32,
    pub unresolved_ofs:      u32,
}

impl ModuleHeader {
    pub const SIZE: u32 = 40;

    pub fn read<R: Parser + Seeker>(r: &mut R) -> Result<Self> {
        let num_sections = r.bu32()?;
        let section_info_ofs = r.bu32()?;
        let num_import_modules = r.bu32()?;
        let import_modules_ofs = r.bu32()?;
        let ctor_section = r.bu16()?;
        let dtor_section = r.bu16()?;
        let prolog_section = r.bu16()?;
        let epilog_section = r.bu16()?;
        let unresolved_section = r.bu16()?;
        let _pad = r.bu16()?;
        let prolog_ofs = r.bu32()?;
        let epilog_ofs = r.bu32()?;
        let unresolved_ofs = r.bu32()?;
        Ok(ModuleHeader {
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
        })
    }

    pub fn write<W: Writer>(&self, w: &mut W) -> Result<()> {
        w.bu32(self.num_sections)?;
        w.bu32(self.section_info_ofs)?;
        w.bu32(self.num_import_modules)?;
        w.bu32(self.import_modules_ofs)?;
        w.bu16(self.ctor_section)?;
        w.bu16(self.dtor_section)?;
        w.bu16(self.prolog_section)?;
        w.bu16(self.epilog_section)?;
        w.bu16(self.unresolved_section)?;
        w.bu16(0)?;
        w.bu32(self.prolog_ofs)?;
        w.bu32(self.epilog_ofs)?;
        w.bu32(self.unresolved_ofs)?;
        Ok(())
    }
}

/// One section descriptor (§3, 12 bytes on disk).
///
/// `offset_or_null == 0 && size > 0` marks a BSS section whose address is
/// assigned from the loader's BSS arena rather than stored in the blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SectionInfo {
    pub offset_or_null: u32,
    pub align:          u32,
    pub size:           u32,
}

impl SectionInfo {
    pub const SIZE: u32 = 12;

    pub fn read<R: Parser + Seeker>(r: &mut R) -> Result<Self> {
        Ok(SectionInfo {
            offset_or_null: r.bu32()?,
            align:          r.bu32()?,
            size:           r.bu32()?,
        })
    }

    pub fn write<W: Writer>(&self, w: &mut W) -> Result<()> {
        w.bu32(self.offset_or_null)?;
        w.bu32(self.align)?;
        w.bu32(self.size)?;
        Ok(())
    }

    pub fn is_null(&self) -> bool { self.offset_or_null == 0 && self.align == 0 && self.size == 0 }

    pub fn is_bss(&self) -> bool { self.offset_or_null == 0 && self.size > 0 }
}

/// One entry in the import-module array (§3, 12 bytes on disk).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportModuleEntry {
    pub source_module_id: u32,
    pub num_relocs:       u32,
    pub relocs_ofs:       u32,
}

impl ImportModuleEntry {
    pub const SIZE: u32 = 12;

    pub fn read<R: Parser + Seeker>(r: &mut R) -> Result<Self> {
        Ok(ImportModuleEntry {
            source_module_id: r.bu32()?,
            num_relocs:       r.bu32()?,
            relocs_ofs:       r.bu32()?,
        })
    }

    pub fn write<W: Writer>(&self, w: &mut W) -> Result<()> {
        w.bu32(self.source_module_id)?;
        w.bu32(self.num_relocs)?;
        w.bu32(self.relocs_ofs)?;
        Ok(())
    }
}

/// The four MIPS relocation kinds this format understands, plus the
/// synthetic section-change marker (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum RelocType {
    Mips32   = 2,
    Mips26   = 4,
    MipsHi16 = 5,
    MipsLo16 = 6,
    UltraSec = 100,
}

/// One relocation record (§3, 12 bytes on disk).
///
/// `section` means "the source module's section the symbol lives in" for
/// every kind except [`RelocType::UltraSec`], where it is reinterpreted as
/// the destination module's section that subsequent `offset`s apply to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocEntry {
    pub offset:  u32,
    pub kind:    u8,
    pub section: u16,
    pub sym_ofs: u32,
}

impl RelocEntry {
    pub const SIZE: u32 = 12;

    pub fn read<R: Parser + Seeker>(r: &mut R) -> Result<Self> {
        let offset = r.bu32()?;
        let kind = r.u8()?;
        let _pad = r.u8()?;
        let section = r.bu16()?;
        let sym_ofs = r.bu32()?;
        Ok(RelocEntry {
            offset,
            kind,
            section,
            sym_ofs,
        })
    }

    pub fn write<W: Writer>(&self, w: &mut W) -> Result<()> {
        w.bu32(self.offset)?;
        w.u8(self.kind)?;
        w.u8(0)?;
        w.bu16(self.section)?;
        w.bu32(self.sym_ofs)?;
        Ok(())
    }

    /// Decode the wire `kind` byte into [`RelocType`], returning `None` for
    /// an unrecognised value (§7 taxonomy item 7: logged and skipped, never
    /// a hard error at the format layer).
    pub fn reloc_type(&self) -> Option<RelocType> { RelocType::try_from(self.kind).ok() }
}

/// A fully parsed module blob, independent of where its bytes came from
/// (temporary packager file, or a loaded module image).
#[derive(Debug, Clone)]
pub struct ModuleBlob {
    pub header:         ModuleHeader,
    pub sections:       Vec<SectionInfo>,
    pub section_data:   Vec<Vec<u8>>,
    pub import_modules: Vec<ImportModuleEntry>,
    pub relocs:         Vec<Vec<RelocEntry>>,
}

impl ModuleBlob {
    /// Parse a module blob out of a byte slice (the slice starts at the
    /// blob's own offset 0; every intra-blob offset is relative to it).
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);
        let header = ModuleHeader::read(&mut cursor)?;

        cursor.goto(header.section_info_ofs as u64)?;
        let mut sections = Vec::with_capacity(header.num_sections as usize);
        for _ in 0..header.num_sections {
            sections.push(SectionInfo::read(&mut cursor)?);
        }

        let section_data = sections
            .iter()
            .map(|s| {
                if s.offset_or_null == 0 || s.size == 0 {
                    Ok(Vec::new())
                } else {
                    let start = s.offset_or_null as usize;
                    let end = start + s.size as usize;
                    ensure!(
                        end <= bytes.len(),
                        ParseProblem::InvalidRange(
                            "section data runs past end of blob",
                            std::panic::Location::caller()
                        )
                    );
                    Ok(bytes[start..end].to_vec())
                }
            })
            .collect::<Result<Vec<_>>>()?;

        cursor.goto(header.import_modules_ofs as u64)?;
        let mut import_modules = Vec::with_capacity(header.num_import_modules as usize);
        for _ in 0..header.num_import_modules {
            import_modules.push(ImportModuleEntry::read(&mut cursor)?);
        }

        let mut relocs = Vec::with_capacity(import_modules.len());
        for group in &import_modules {
            cursor.goto(group.relocs_ofs as u64)?;
            let mut entries = Vec::with_capacity(group.num_relocs as usize);
            for _ in 0..group.num_relocs {
                entries.push(RelocEntry::read(&mut cursor)?);
            }
            relocs.push(entries);
        }

        Ok(ModuleBlob {
            header,
            sections,
            section_data,
            import_modules,
            relocs,
        })
    }
}
