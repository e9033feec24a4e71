//! The relocation application/undo algorithm shared by load-time linking
//! (§4.7 step 5) and unload-time unlinking (§4.8). Both directions walk the
//! same per-import-group stream; only the arithmetic sign and the `R_MIPS_26`
//! retarget direction differ.

use crate::bundle::{RelocEntry, RelocType, NO_SECTION};
use crate::loader::image::LoadedImage;
use crate::platform::{Address, Platform};

/// Resolve `(section, offset)` against a concrete loaded module, falling
/// back to treating `offset` as an already-absolute address when `section`
/// indexes past the end of the section table — mirroring the original
/// `GetSectionPtr`'s "indexing into invalid section" fallback.
fn section_ptr(image: &LoadedImage, section: u16, offset: u32) -> Address {
    match image.sections.get(section as usize) {
        Some((addr, _)) => addr.offset(offset),
        None => Address(offset),
    }
}

/// Resolve a relocation's source symbol address. `source == None` means the
/// host: the encoder already baked the host's link-time absolute address
/// into `sym_ofs`, so it is used as-is (§4.7: `base_of(null, s) = 0`).
fn source_addr(source: Option<&LoadedImage>, section: u16, sym_ofs: u32) -> Address {
    match source {
        Some(image) => section_ptr(image, section, sym_ofs),
        None => Address(sym_ofs),
    }
}

fn flush_section(platform: &mut impl Platform, dest: &LoadedImage, section: u16) {
    let Some((addr, size)) = dest.sections.get(section as usize) else {
        return;
    };
    if !addr.is_null() && *size > 0 {
        platform.dcache_writeback(*addr, *size);
        platform.icache_invalidate(*addr, *size);
    }
}

fn sign_extend_16(value: u16) -> u32 { (value as u32).wrapping_sub(((value as u32) & 0x8000) << 1) }

/// Apply every entry of one import group into `dest`, reading symbol
/// addresses from `source` (`None` for the host). `unresolved` is `dest`'s
/// own unresolved-call stub, used to anchor `R_MIPS_26` retargeting.
pub fn apply_group(platform: &mut impl Platform, dest: &LoadedImage, source: Option<&LoadedImage>, relocs: &[RelocEntry]) {
    let mut cur_section = NO_SECTION;
    for (i, reloc) in relocs.iter().enumerate() {
        match reloc.reloc_type() {
            Some(RelocType::UltraSec) => {
                flush_section(platform, dest, cur_section);
                cur_section = reloc.section;
            },
            Some(RelocType::Mips32) => {
                let ptr = section_ptr(dest, cur_section, reloc.offset);
                let sym = source_addr(source, reloc.section, reloc.sym_ofs);
                let value = platform.read_u32(ptr);
                platform.write_u32(ptr, value.wrapping_add(sym.0));
            },
            Some(RelocType::Mips26) => {
                let ptr = section_ptr(dest, cur_section, reloc.offset);
                let sym = source_addr(source, reloc.section, reloc.sym_ofs);
                let instr = platform.read_u32(ptr);
                let mut target = ((instr & 0x03ff_ffff) << 2) | (ptr.0 & 0xf000_0000);
                if target == dest.unresolved.0 {
                    target = target.wrapping_sub(dest.unresolved.0 & 0x0fff_fffc);
                }
                target = target.wrapping_add(sym.0 & 0x0fff_fffc);
                platform.write_u32(ptr, (instr & 0xfc00_0000) | ((target & 0x0fff_fffc) >> 2));
            },
            Some(RelocType::MipsHi16) => {
                let ptr = section_ptr(dest, cur_section, reloc.offset);
                let instr = platform.read_u32(ptr);
                let hi_orig = (instr & 0xffff) as u16;
                let mut addr = (hi_orig as u32) << 16;
                let mut hi = hi_orig;
                for later in &relocs[i + 1..] {
                    if later.reloc_type() == Some(RelocType::MipsLo16) {
                        let sym = source_addr(source, later.section, later.sym_ofs);
                        let lo_ptr = section_ptr(dest, cur_section, later.offset);
                        let lo = (platform.read_u32(lo_ptr) & 0xffff) as u16;
                        addr = addr.wrapping_add(sign_extend_16(lo)).wrapping_add(sym.0);
                        hi = ((addr >> 16) + ((addr & 0x8000) >> 15)) as u16;
                        break;
                    }
                }
                platform.write_u32(ptr, (instr & 0xffff_0000) | hi as u32);
            },
            Some(RelocType::MipsLo16) => {
                let ptr = section_ptr(dest, cur_section, reloc.offset);
                let sym = source_addr(source, reloc.section, reloc.sym_ofs);
                let instr = platform.read_u32(ptr);
                let lo = ((instr & 0xffff) as u32).wrapping_add(sym.0) & 0xffff;
                platform.write_u32(ptr, (instr & 0xffff_0000) | lo);
            },
            None => log::warn!(target: "ultramod::loader", "unknown relocation type {}", reloc.kind),
        }
    }
    flush_section(platform, dest, cur_section);
}

/// Inverse of [`apply_group`]: subtracts instead of adding, and retargets
/// `R_MIPS_26` call sites back to `dest`'s unresolved stub rather than
/// restoring the pre-link zero (§4.8).
pub fn undo_group(platform: &mut impl Platform, dest: &LoadedImage, source: Option<&LoadedImage>, relocs: &[RelocEntry]) {
    let mut cur_section = NO_SECTION;
    for (i, reloc) in relocs.iter().enumerate() {
        match reloc.reloc_type() {
            Some(RelocType::UltraSec) => {
                flush_section(platform, dest, cur_section);
                cur_section = reloc.section;
            },
            Some(RelocType::Mips32) => {
                let ptr = section_ptr(dest, cur_section, reloc.offset);
                let sym = source_addr(source, reloc.section, reloc.sym_ofs);
                let value = platform.read_u32(ptr);
                platform.write_u32(ptr, value.wrapping_sub(sym.0));
            },
            Some(RelocType::Mips26) => {
                let ptr = section_ptr(dest, cur_section, reloc.offset);
                let sym = source_addr(source, reloc.section, reloc.sym_ofs);
                let instr = platform.read_u32(ptr);
                let mut target = ((instr & 0x03ff_ffff) << 2) | (ptr.0 & 0xf000_0000);
                target = target.wrapping_sub(sym.0 & 0x0fff_fffc);
                target = target.wrapping_add(dest.unresolved.0 & 0x0fff_fffc);
                platform.write_u32(ptr, (instr & 0xfc00_0000) | ((target & 0x0fff_fffc) >> 2));
            },
            Some(RelocType::MipsHi16) => {
                let ptr = section_ptr(dest, cur_section, reloc.offset);
                let instr = platform.read_u32(ptr);
                let hi_orig = (instr & 0xffff) as u16;
                let mut addr = (hi_orig as u32) << 16;
                let mut hi = hi_orig;
                for later in &relocs[i + 1..] {
                    if later.reloc_type() == Some(RelocType::MipsLo16) {
                        let sym = source_addr(source, later.section, later.sym_ofs);
                        let lo_ptr = section_ptr(dest, cur_section, later.offset);
                        let lo = (platform.read_u32(lo_ptr) & 0xffff) as u16;
                        addr = addr.wrapping_add(sign_extend_16(lo)).wrapping_sub(sym.0);
                        hi = ((addr >> 16) + ((addr & 0x8000) >> 15)) as u16;
                        break;
                    }
                }
                platform.write_u32(ptr, (instr & 0xffff_0000) | hi as u32);
            },
            Some(RelocType::MipsLo16) => {
                let ptr = section_ptr(dest, cur_section, reloc.offset);
                let sym = source_addr(source, reloc.section, reloc.sym_ofs);
                let instr = platform.read_u32(ptr);
                let lo = ((instr & 0xffff) as u32).wrapping_sub(sym.0) & 0xffff;
                platform.write_u32(ptr, (instr & 0xffff_0000) | lo);
            },
            None => log::warn!(target: "ultramod::loader", "unknown relocation type {}", reloc.kind),
        }
    }
    flush_section(platform, dest, cur_section);
}

/// Degraded pass run when an import group's source module is not yet
/// loaded: `R_MIPS_32`/`HI16`/`LO16` are left alone (they will be patched
/// in full once the source loads), and any `R_MIPS_26` call site still
/// pointing at its pristine PC-relative zero is retargeted to `dest`'s
/// unresolved stub so an uninitialised call traps cleanly (§4.7, §9).
pub fn apply_degraded(platform: &mut impl Platform, dest: &LoadedImage, relocs: &[RelocEntry]) {
    let mut cur_section = NO_SECTION;
    for reloc in relocs {
        match reloc.reloc_type() {
            Some(RelocType::UltraSec) => {
                flush_section(platform, dest, cur_section);
                cur_section = reloc.section;
            },
            Some(RelocType::Mips26) => {
                let ptr = section_ptr(dest, cur_section, reloc.offset);
                let instr = platform.read_u32(ptr);
                let target = ((instr & 0x03ff_ffff) << 2) | (ptr.0 & 0xf000_0000);
                // Only patch calls still targeting the natural PC-relative
                // zero; a non-zero relocatable jump here would indicate the
                // encoder emitted something this format never produces (§9
                // open question).
                if target == (ptr.0 & 0xf000_0000) {
                    let retargeted = target.wrapping_add(dest.unresolved.0 & 0x0fff_fffc);
                    platform.write_u32(ptr, (instr & 0xfc00_0000) | ((retargeted & 0x0fff_fffc) >> 2));
                }
            },
            Some(RelocType::Mips32) | Some(RelocType::MipsHi16) | Some(RelocType::MipsLo16) => {
                // Deferred until the source module loads.
            },
            None => log::warn!(target: "ultramod::loader", "unknown relocation type {}", reloc.kind),
        }
    }
    flush_section(platform, dest, cur_section);
}
