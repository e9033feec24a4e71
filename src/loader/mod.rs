//! The runtime half of the format: turning a parsed bundle into loaded,
//! linked modules and keeping every loaded module's cross-module imports
//! consistent as siblings load and unload around it (§4, C7/C8).
//!
//! Everything here is owned by a [`LoaderContext`] rather than held in
//! process-wide statics, so an embedder can run more than one independent
//! loader (or reset one for a test) without linker-level singletons — see
//! the "embedder-owned context instead of globals" redesign flag.

mod image;
mod reloc;

use std::io::Cursor;

pub use image::{resolve_hook, resolve_section_addresses, ImportRecord, LoadedImage};

use crate::bundle::{HandleRecord, ModuleBlob, OuterHeader, HOST_MODULE, NO_SECTION};
use crate::helper::{ensure, AlignPowerOfTwo, LoadProblem, ParseProblem, Parser, Result, Seeker};
use crate::platform::{Address, Platform, DEFAULT_UNRESOLVED};

/// A 1-based reference to one module slot in a bundle. `Handle(0)` never
/// names a real module; it is used internally to mean "the host".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(pub u32);

impl Handle {
    pub const NULL: Handle = Handle(0);

    fn index(self) -> usize { self.0 as usize - 1 }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "#{}", self.0) }
}

#[derive(Debug)]
enum HandleState {
    Unloaded,
    Loaded { ref_count: u32, image: LoadedImage },
}

#[derive(Debug)]
struct Entry {
    name:   String,
    record: HandleRecord,
    state:  HandleState,
}

/// An embedder-owned loader: one bundle's handle table plus the
/// [`Platform`] it loads modules into. Replaces the original implementation's
/// process-wide module table and the single global `Platform` it assumed.
pub struct LoaderContext<P: Platform> {
    platform: P,
    entries:  Vec<Entry>,
}

impl<P: Platform> LoaderContext<P> {
    /// Read a bundle's handle table and string table off `platform`'s ROM
    /// and return a context with every module in the `Unloaded` state
    /// (§4.6, `ModuleInit`). No module bytes are read yet — loading is
    /// lazy, driven entirely by [`LoaderContext::load`].
    pub fn init(mut platform: P) -> Result<Self> {
        let mut header_bytes = [0u8; OuterHeader::SIZE as usize];
        platform.rom_read(&mut header_bytes, 0)?;
        let header = OuterHeader::read(&mut Cursor::new(&header_bytes[..]))?;

        let table_size = header.num_modules * HandleRecord::SIZE + header.string_table_size;
        let mut table_buf = vec![0u8; table_size as usize];
        platform.rom_read(&mut table_buf, OuterHeader::SIZE)?;

        let mut cursor = Cursor::new(&table_buf[..]);
        let mut records = Vec::with_capacity(header.num_modules as usize);
        for _ in 0..header.num_modules {
            records.push(HandleRecord::read(&mut cursor)?);
        }

        let entries = records
            .into_iter()
            .map(|record| {
                let name = read_cstr(&table_buf, record.name_offset as usize)?;
                Ok(Entry {
                    name,
                    record,
                    state: HandleState::Unloaded,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        log::info!(target: "ultramod::loader", "initialised bundle with {} module(s)", entries.len());
        Ok(LoaderContext { platform, entries })
    }

    pub fn platform(&self) -> &P { &self.platform }
    pub fn platform_mut(&mut self) -> &mut P { &mut self.platform }

    /// `ModuleFind`: look up a module by name, independent of whether it is
    /// currently loaded.
    pub fn find(&self, name: &str) -> Option<Handle> {
        self.entries.iter().position(|e| e.name == name).map(|i| Handle((i + 1) as u32))
    }

    /// The name a handle was registered under, for diagnostics.
    pub fn name(&self, handle: Handle) -> Option<&str> { self.entries.get(handle.index()).map(|e| e.name.as_str()) }

    /// `ModuleIsLoaded`.
    pub fn is_loaded(&self, handle: Handle) -> bool {
        matches!(self.entries.get(handle.index()), Some(Entry { state: HandleState::Loaded { .. }, .. }))
    }

    /// `ModulePrintLoadedList`: emit one diagnostic line per currently
    /// loaded module.
    pub fn print_loaded_list(&self) {
        for (i, entry) in self.entries.iter().enumerate() {
            if let HandleState::Loaded { ref_count, .. } = &entry.state {
                self.platform.debug_printf(&format!("  #{} {} (refs={ref_count})", i + 1, entry.name));
            }
        }
    }

    /// `ModuleAddrToHandle`: find which loaded module, if any, owns `addr`
    /// (§4.7: the whole `[image, image+footprint)` range, not just its
    /// sections — `GetModuleRamSize`-equivalent, module.c:666).
    pub fn addr_to_handle(&self, addr: Address) -> Option<Handle> {
        self.entries.iter().enumerate().find_map(|(i, entry)| {
            let HandleState::Loaded { image, .. } = &entry.state else { return None };
            let in_range = addr.0 >= image.base.0 && addr.0 < image.base.0.wrapping_add(image.footprint);
            in_range.then_some(Handle((i + 1) as u32))
        })
    }

    /// `ModuleLoadHandle` by name, combining [`LoaderContext::find`] and
    /// [`LoaderContext::load`] (§4.6).
    pub fn load_by_name(&mut self, name: &str) -> Result<Handle> {
        let handle = self.find(name).ok_or_else(|| LoadProblem::NotFound(name.to_string()))?;
        self.load(handle)
    }

    /// `ModuleLoad`: load a module and link it against the host and every
    /// already-loaded module, or bump its reference count if it is already
    /// loaded (§4.7).
    pub fn load(&mut self, handle: Handle) -> Result<Handle> {
        ensure!(
            handle.0 != 0 && handle.index() < self.entries.len(),
            LoadProblem::NotFound(handle.to_string())
        );

        if let HandleState::Loaded { ref_count, .. } = &mut self.entries[handle.index()].state {
            *ref_count += 1;
            log::debug!(target: "ultramod::loader", "{handle} already loaded, ref_count now {ref_count}");
            return Ok(handle);
        }

        let record = self.entries[handle.index()].record;
        let name = self.entries[handle.index()].name.clone();
        log::info!(target: "ultramod::loader", "loading module {handle} ({name})");

        let mut blob_bytes = vec![0u8; record.module_size as usize];
        self.platform.rom_read(&mut blob_bytes, record.rom_offset + OuterHeader::SIZE)?;
        let blob = ModuleBlob::parse(&blob_bytes)?;

        let base = self.platform.alloc_aligned(record.ram_align(), record.footprint())?;
        let bss_base = base.offset(record.module_size.align_next(record.noload_align.max(1)));
        let (sections, bss_used) = resolve_section_addresses(&blob, base, bss_base);
        ensure!(
            bss_used <= record.noload_size,
            ParseProblem::InvalidData("bss sections overflow the reserved arena", std::panic::Location::caller())
        );

        for (i, (addr, size)) in sections.iter().enumerate() {
            let data = &blob.section_data[i];
            if !addr.is_null() && !data.is_empty() {
                self.platform.write_bytes(*addr, data);
                self.platform.dcache_writeback(*addr, *size);
            }
        }

        let prolog = resolve_hook(&sections, blob.header.prolog_section, blob.header.prolog_ofs);
        let epilog = resolve_hook(&sections, blob.header.epilog_section, blob.header.epilog_ofs);
        let unresolved =
            resolve_hook(&sections, blob.header.unresolved_section, blob.header.unresolved_ofs).unwrap_or(DEFAULT_UNRESOLVED);

        let mut image = LoadedImage {
            base,
            footprint: record.footprint(),
            sections,
            ctor_section: blob.header.ctor_section,
            dtor_section: blob.header.dtor_section,
            prolog,
            epilog,
            unresolved,
            import_modules: Vec::new(),
        };

        // Self- and host-sourced imports are always strong: the host never
        // unloads and a module's own code is already fully placed.
        for (group, relocs) in blob.import_modules.iter().zip(blob.relocs.iter()) {
            let strong = match group.source_module_id {
                HOST_MODULE => {
                    reloc::apply_group(&mut self.platform, &image, None, relocs);
                    true
                },
                id if id == handle.0 => {
                    let snapshot = image.clone();
                    reloc::apply_group(&mut self.platform, &snapshot, Some(&snapshot), relocs);
                    true
                },
                id => match &self.entries[Handle(id).index()].state {
                    HandleState::Loaded { image: source, .. } => {
                        reloc::apply_group(&mut self.platform, &image, Some(source), relocs);
                        true
                    },
                    HandleState::Unloaded => {
                        reloc::apply_degraded(&mut self.platform, &image, relocs);
                        false
                    },
                },
            };
            image.import_modules.push(ImportRecord {
                source_module_id: group.source_module_id,
                relocs: relocs.clone(),
                strong,
            });
        }

        // Re-scan every other loaded module: any import group of theirs
        // sourced from the module now loading was necessarily degraded
        // until now, and can be fully linked (§4.7 step 5e).
        for i in 0..self.entries.len() {
            if i == handle.index() {
                continue;
            }
            let Entry { state: HandleState::Loaded { image: other, .. }, .. } = &mut self.entries[i] else {
                continue;
            };
            for record in other.import_modules.iter_mut() {
                if record.source_module_id == handle.0 && !record.strong {
                    reloc::apply_group(&mut self.platform, other, Some(&image), &record.relocs);
                    record.strong = true;
                }
            }
        }

        self.run_ctors(&image);
        if let Some(prolog) = image.prolog {
            self.platform.call(prolog)?;
        }

        self.entries[handle.index()].state = HandleState::Loaded { ref_count: 1, image };
        Ok(handle)
    }

    /// `ModuleUnload`: drop one reference, fully unlinking and freeing the
    /// module's RAM once the count reaches zero (§4.8).
    pub fn unload(&mut self, handle: Handle) -> Result<()> {
        let index = handle.index();
        match self.entries.get(index).map(|e| &e.state) {
            Some(HandleState::Loaded { ref_count, .. }) if *ref_count > 1 => {
                if let HandleState::Loaded { ref_count, .. } = &mut self.entries[index].state {
                    *ref_count -= 1;
                }
                Ok(())
            },
            Some(HandleState::Loaded { .. }) => self.unlink_and_free(handle),
            _ => Err(LoadProblem::NotFound(handle.to_string()).into()),
        }
    }

    /// `ModuleUnloadForce`: unlink and free regardless of reference count.
    /// Calling this on a module that is not loaded is a logged no-op rather
    /// than an error — an embedder racing shutdown against a slow loader
    /// should not have to track load state just to force-unload safely.
    pub fn unload_force(&mut self, handle: Handle) -> Result<()> {
        if !self.is_loaded(handle) {
            log::warn!(target: "ultramod::loader", "force-unload of already-unloaded {handle}, ignoring");
            return Ok(());
        }
        self.unlink_and_free(handle)
    }

    fn unlink_and_free(&mut self, handle: Handle) -> Result<()> {
        let index = handle.index();
        let HandleState::Loaded { image, .. } = std::mem::replace(&mut self.entries[index].state, HandleState::Unloaded)
        else {
            return Err(LoadProblem::NotFound(handle.to_string()).into());
        };

        if let Some(epilog) = image.epilog {
            self.platform.call(epilog)?;
        }
        self.run_dtors(&image);

        // Degrade every other module's still-strong import sourced from
        // this one back to its unresolved trap before the memory behind it
        // disappears (§4.8).
        for i in 0..self.entries.len() {
            if i == index {
                continue;
            }
            let Entry { state: HandleState::Loaded { image: other, .. }, .. } = &mut self.entries[i] else {
                continue;
            };
            for record in other.import_modules.iter_mut() {
                if record.source_module_id == handle.0 && record.strong {
                    reloc::undo_group(&mut self.platform, other, Some(&image), &record.relocs);
                    record.strong = false;
                }
            }
        }

        for group in &image.import_modules {
            match group.source_module_id {
                HOST_MODULE => reloc::undo_group(&mut self.platform, &image, None, &group.relocs),
                id if id == handle.0 => reloc::undo_group(&mut self.platform, &image, Some(&image), &group.relocs),
                id if group.strong => {
                    // Still loaded (it can only be this module's own imports
                    // from *other* modules, not the reverse rescan above).
                    if let Some(HandleState::Loaded { image: source, .. }) = self.entries.get(Handle(id).index()).map(|e| &e.state) {
                        reloc::undo_group(&mut self.platform, &image, Some(source), &group.relocs);
                    }
                },
                _ => {}, // was only ever degraded-applied: nothing to undo
            }
        }

        self.platform.free(image.base, image.footprint);
        log::info!(target: "ultramod::loader", "unloaded module {handle}");
        Ok(())
    }

    /// The default `unresolved` handler (§4.9), installed in place of a
    /// module-supplied one whenever a module exports none. Real stack
    /// inspection is architecture-specific (§9 design notes); this takes
    /// the caller's return address as an explicit parameter, as supplied by
    /// the trampoline the embedder wires each stub invocation through.
    pub fn default_unresolved_handler(&self, caller_return_addr: Address) -> ! {
        // Back up past the `jal`/delay-slot pair to the address of the call
        // itself, matching the source's "return address minus 8".
        let call_addr = Address(caller_return_addr.0.wrapping_sub(8));
        match self.addr_to_handle(call_addr) {
            Some(handle) => {
                let name = self.name(handle).unwrap_or("?");
                self.platform
                    .debug_printf(&format!("call to module not loaded from module {name} at address {call_addr}"));
            },
            None => self
                .platform
                .debug_printf(&format!("call to module not loaded at address {call_addr} (owning module unknown)")),
        }
        self.print_loaded_list();
        self.platform.halt()
    }

    fn run_ctors(&mut self, image: &LoadedImage) {
        self.run_function_array(image, image.ctor_section, true);
    }

    fn run_dtors(&mut self, image: &LoadedImage) {
        self.run_function_array(image, image.dtor_section, false);
    }

    /// Execute a `.ctors`/`.dtors`-style array of function pointers, either
    /// front-to-back (construction) or back-to-front (destruction, §8).
    fn run_function_array(&mut self, image: &LoadedImage, section: u16, ascending: bool) {
        if section == NO_SECTION {
            return;
        }
        let Some((base, size)) = image.sections.get(section as usize) else { return };
        if base.is_null() || *size == 0 {
            return;
        }
        let count = size / 4;
        let indices: Box<dyn Iterator<Item = u32>> = if ascending { Box::new(0..count) } else { Box::new((0..count).rev()) };
        for i in indices {
            let entry = self.platform.read_u32(base.offset(i * 4));
            if entry != 0 {
                if let Err(err) = self.platform.call(Address(entry)) {
                    log::warn!(target: "ultramod::loader", "constructor/destructor at {:#010x} failed: {err}", entry);
                }
            }
        }
    }
}

fn read_cstr(buf: &[u8], start: usize) -> Result<String> {
    ensure!(
        start <= buf.len(),
        ParseProblem::InvalidRange("module name offset out of range", std::panic::Location::caller())
    );
    let end = buf[start..].iter().position(|&b| b == 0).map(|n| start + n).unwrap_or(buf.len());
    Ok(String::from_utf8_lossy(&buf[start..end]).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::HostPlatform;

    fn one_module_bundle() -> Vec<u8> {
        // A single, import-free module whose lone section is one `jal`-free
        // word of code, with matching ctor/dtor arrays of one entry each.
        let name = b"leaf\0\0\0\0"; // padded to 8 for 2-byte alignment, arbitrary
        let string_table = name.to_vec();

        let module_header_size = crate::bundle::ModuleHeader::SIZE;
        let section_info_ofs = module_header_size;
        let num_sections = 1u32;
        let section_info_size = num_sections * crate::bundle::SectionInfo::SIZE;
        let data_ofs = section_info_ofs + section_info_size;
        let code = [0u32; 2]; // two words of "code", section size 8
        let data_size = (code.len() * 4) as u32;
        let import_modules_ofs = data_ofs + data_size;

        let mut blob = Vec::new();
        let header = crate::bundle::ModuleHeader {
            num_sections,
            section_info_ofs,
            num_import_modules: 0,
            import_modules_ofs,
            ctor_section: NO_SECTION,
            dtor_section: NO_SECTION,
            prolog_section: NO_SECTION,
            epilog_section: NO_SECTION,
            unresolved_section: NO_SECTION,
            prolog_ofs: 0,
            epilog_ofs: 0,
            unresolved_ofs: 0,
        };
        header.write(&mut blob).unwrap();
        let section = crate::bundle::SectionInfo {
            offset_or_null: data_ofs,
            align: 4,
            size: data_size,
        };
        section.write(&mut blob).unwrap();
        for word in code {
            blob.extend_from_slice(&word.to_be_bytes());
        }

        // `name_offset`/`rom_offset` are relative to the start of the handle
        // table (immediately after the outer header), matching
        // `packager::write_bundle`'s convention and how the loader reads
        // them back.
        let record = HandleRecord {
            name_offset:  HandleRecord::SIZE,
            module_align: 4,
            module_size:  blob.len() as u32,
            rom_offset:   HandleRecord::SIZE + string_table.len() as u32,
            noload_align: 1,
            noload_size:  0,
        };

        let outer = OuterHeader {
            num_modules:       1,
            string_table_size: string_table.len() as u32,
        };
        let mut bundle = Vec::new();
        outer.write(&mut bundle).unwrap();
        record.write(&mut bundle).unwrap();
        bundle.extend_from_slice(&string_table);
        bundle.extend_from_slice(&blob);
        bundle
    }

    #[test]
    fn find_load_unload_round_trip() {
        let bundle = one_module_bundle();
        let platform = HostPlatform::new(bundle);
        let mut ctx = LoaderContext::init(platform).unwrap();

        let handle = ctx.find("leaf").expect("module present by name");
        assert!(!ctx.is_loaded(handle));

        ctx.load(handle).unwrap();
        assert!(ctx.is_loaded(handle));

        ctx.unload(handle).unwrap();
        assert!(!ctx.is_loaded(handle));
    }

    #[test]
    fn double_load_is_ref_counted() {
        let bundle = one_module_bundle();
        let platform = HostPlatform::new(bundle);
        let mut ctx = LoaderContext::init(platform).unwrap();
        let handle = ctx.find("leaf").unwrap();

        ctx.load(handle).unwrap();
        ctx.load(handle).unwrap();
        ctx.unload(handle).unwrap();
        assert!(ctx.is_loaded(handle), "still referenced once");

        ctx.unload(handle).unwrap();
        assert!(!ctx.is_loaded(handle));
    }

    #[test]
    fn force_unload_on_unloaded_handle_is_a_no_op() {
        let bundle = one_module_bundle();
        let platform = HostPlatform::new(bundle);
        let mut ctx = LoaderContext::init(platform).unwrap();
        let handle = ctx.find("leaf").unwrap();

        assert!(ctx.unload_force(handle).is_ok());
        assert!(!ctx.is_loaded(handle));
    }

    #[test]
    fn addr_to_handle_finds_owning_module_only_while_loaded() {
        let bundle = one_module_bundle();
        let platform = HostPlatform::new(bundle);
        let mut ctx = LoaderContext::init(platform).unwrap();
        let handle = ctx.find("leaf").unwrap();

        ctx.load(handle).unwrap();
        let addr = match &ctx.entries[handle.index()].state {
            HandleState::Loaded { image, .. } => image.sections[0].0,
            _ => unreachable!(),
        };
        assert_eq!(ctx.addr_to_handle(addr), Some(handle));

        ctx.unload(handle).unwrap();
        assert_eq!(ctx.addr_to_handle(addr), None);
    }

    #[test]
    #[should_panic]
    fn default_unresolved_handler_halts() {
        let bundle = one_module_bundle();
        let platform = HostPlatform::new(bundle);
        let mut ctx = LoaderContext::init(platform).unwrap();
        let handle = ctx.find("leaf").unwrap();
        ctx.load(handle).unwrap();

        let call_site = match &ctx.entries[handle.index()].state {
            HandleState::Loaded { image, .. } => image.sections[0].0,
            _ => unreachable!(),
        };
        ctx.default_unresolved_handler(Address(call_site.0 + 8));
    }
}
