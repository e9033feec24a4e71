//! Assembles serialized module blobs into the final bundle: outer header,
//! handle table, name string table, and the concatenated blobs (§4.6).

use crate::bundle::{HandleRecord, OuterHeader};
use crate::helper::{AlignPowerOfTwo, Result, Writer};
use crate::packager::serializer::SerializedModule;

/// Concatenate every serialized module into one bundle, computing the
/// string table and each handle's `rom_offset` along the way.
///
/// Offsets written here (`name_offset`, `rom_offset`) are relative to the
/// start of the handle table, *not* the file: the loader reads them the
/// same way (§4.1, §4.7 `ModuleInit`), so both sides agree without either
/// needing to know about the other's base address.
pub fn write_bundle(modules: &[SerializedModule]) -> Result<Vec<u8>> {
    let num_modules = modules.len() as u32;
    let string_table_size: u32 = modules
        .iter()
        .map(|m| m.name.len() as u32 + 1)
        .sum::<u32>()
        .align_next(2);

    let mut out = Vec::new();
    OuterHeader {
        num_modules,
        string_table_size,
    }
    .write(&mut out)?;

    let mut string_ofs = num_modules * HandleRecord::SIZE;
    let mut data_ofs = string_ofs + string_table_size;
    let mut records = Vec::with_capacity(modules.len());
    for module in modules {
        records.push(HandleRecord {
            name_offset:  string_ofs,
            module_align: module.module_align,
            module_size:  module.bytes.len() as u32,
            rom_offset:   data_ofs,
            noload_align: module.noload_align,
            noload_size:  module.noload_size,
        });
        data_ofs += module.bytes.len() as u32;
        string_ofs += module.name.len() as u32 + 1;
    }
    for record in &records {
        record.write(&mut out)?;
    }

    let strings_start = out.len();
    for module in modules {
        out.extend_from_slice(module.name.as_bytes());
        out.push(0);
    }
    while (out.len() - strings_start) < string_table_size as usize {
        out.push(0);
    }

    for module in modules {
        out.extend_from_slice(&module.bytes);
    }

    log::info!(target: "ultramod::packager", "wrote bundle: {} module(s), {} byte(s)", modules.len(), out.len());
    Ok(out)
}
