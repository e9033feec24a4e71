//! The runtime, RAM-resident counterpart of a [`crate::bundle::ModuleBlob`]:
//! where each section actually landed and which functions the module
//! exposes, all as [`Address`]es inside one [`crate::platform::Platform`].

use crate::bundle::{ModuleBlob, NO_SECTION};
use crate::platform::Address;

/// One import group as replayed at load/unload time: which module supplies
/// the symbols, and the relocation stream to apply/undo against it.
#[derive(Debug, Clone)]
pub struct ImportRecord {
    pub source_module_id: u32,
    pub relocs:            Vec<crate::bundle::RelocEntry>,
    /// Set once the source module has actually been strong-linked; until
    /// then this group was only degraded-applied and must be revisited in
    /// full once the source loads (§4.7 step 5d/5e).
    pub strong:            bool,
}

/// A module's loaded-in-RAM state: section base addresses, exported hook
/// addresses, and the import groups that still need tracking for later
/// cross-module link/unlink passes.
#[derive(Debug, Clone)]
pub struct LoadedImage {
    /// Base address of the module's combined allocation (stored bytes +
    /// BSS arena), used only for the eventual `free`.
    pub base:      Address,
    pub footprint: u32,
    /// Parallel to the blob's `SectionInfo` table: resolved base address
    /// (or [`Address::NULL`] for a genuinely empty/absent section) and
    /// size.
    pub sections: Vec<(Address, u32)>,
    pub ctor_section: u16,
    pub dtor_section: u16,
    pub prolog:       Option<Address>,
    pub epilog:       Option<Address>,
    /// Always present: synthesised from [`crate::platform::DEFAULT_UNRESOLVED`]
    /// when the module exports no `_unresolved` handler of its own (§4.9).
    pub unresolved: Address,
    pub import_modules: Vec<ImportRecord>,
}

impl LoadedImage {
    pub fn ctor_addr(&self) -> Option<Address> {
        self.sections.get(self.ctor_section as usize).map(|(a, _)| *a).filter(|a| !a.is_null())
    }

    pub fn dtor_addr(&self) -> Option<Address> {
        self.sections.get(self.dtor_section as usize).map(|(a, _)| *a).filter(|a| !a.is_null())
    }
}

/// The resolved-address counterpart of [`ModuleBlob`]'s section table,
/// produced by placing the blob's `PROGBITS` data and BSS sections at
/// concrete addresses (§4.7 step 2-4). Pure arithmetic: no I/O happens here.
pub fn resolve_section_addresses(blob: &ModuleBlob, data_base: Address, bss_base: Address) -> (Vec<(Address, u32)>, u32) {
    let mut out = Vec::with_capacity(blob.sections.len());
    let mut bss_cursor = bss_base.0;
    for section in &blob.sections {
        if section.is_null() {
            out.push((Address::NULL, 0));
        } else if section.is_bss() {
            let aligned = crate::helper::AlignPowerOfTwo::align_next(bss_cursor, section.align.max(1));
            out.push((Address(aligned), section.size));
            bss_cursor = aligned + section.size;
        } else {
            out.push((data_base.offset(section.offset_or_null), section.size));
        }
    }
    (out, bss_cursor - bss_base.0)
}

/// Resolve a module-header `(section, offset)` hook pair into an `Address`,
/// or `None` when the section is [`NO_SECTION`] (no such hook, §4.1).
pub fn resolve_hook(sections: &[(Address, u32)], section: u16, offset: u32) -> Option<Address> {
    if section == NO_SECTION {
        return None;
    }
    sections.get(section as usize).map(|(addr, _)| addr.offset(offset))
}
