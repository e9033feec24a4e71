//! Example program to dump the contents of an ultramod bundle file:
//! the handle table and, per module, its section layout and import groups.

use std::io::Cursor;
use std::path::PathBuf;

use clap::Parser;
use ultramod::bundle::{HandleRecord, ModuleBlob, OuterHeader};

#[derive(Parser, Debug)]
#[command(
    name = "bundle_dump",
    bin_name = "bundle_dump",
    version = env!("CARGO_PKG_VERSION"),
    about = "Dump the handle table and module layout of an ultramod bundle",
    long_about = None
)]
struct Args {
    /// Path to the bundle file to dump
    path: PathBuf,
    /// Dump each module's section and import layout
    #[arg(short, long)]
    modules: bool,
}

fn read_cstr(bytes: &[u8], offset: usize) -> String {
    let end = bytes[offset..].iter().position(|&b| b == 0).map(|n| offset + n).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[offset..end]).into_owned()
}

fn main() {
    let args = Args::parse();
    let data = std::fs::read(&args.path).expect("failed to read bundle file");

    let mut cursor = Cursor::new(&data[..]);
    let header = OuterHeader::read(&mut cursor).expect("not a valid bundle: bad outer header");
    println!("modules: {}, string table: {} byte(s)", header.num_modules, header.string_table_size);

    let strings_start = OuterHeader::SIZE + header.num_modules * HandleRecord::SIZE;
    let mut records = Vec::with_capacity(header.num_modules as usize);
    for _ in 0..header.num_modules {
        records.push(HandleRecord::read(&mut cursor).expect("truncated handle table"));
    }

    for (i, record) in records.iter().enumerate() {
        let name = read_cstr(&data, (strings_start + record.name_offset) as usize);
        println!(
            "[{i}] {name}: {} byte(s) @ rom {:#x} (align {}), noload {} byte(s) (align {})",
            record.module_size, record.rom_offset, record.module_align, record.noload_size, record.noload_align
        );

        if args.modules {
            let blob_start = record.rom_offset as usize;
            let blob_end = blob_start + record.module_size as usize;
            let blob = ModuleBlob::parse(&data[blob_start..blob_end]).expect("malformed module blob");
            println!(
                "    {} section(s), {} import group(s), ctor={} dtor={} prolog={} epilog={} unresolved={}",
                blob.header.num_sections,
                blob.header.num_import_modules,
                blob.header.ctor_section,
                blob.header.dtor_section,
                blob.header.prolog_section,
                blob.header.epilog_section,
                blob.header.unresolved_section
            );
            for (s, section) in blob.sections.iter().enumerate() {
                let kind = if section.is_null() {
                    "null"
                } else if section.is_bss() {
                    "bss"
                } else {
                    "data"
                };
                println!("      section {s}: {kind}, {} byte(s), align {}", section.size, section.align);
            }
            for (group, relocs) in blob.import_modules.iter().zip(blob.relocs.iter()) {
                println!("      import from module {}: {} reloc(s)", group.source_module_id, relocs.len());
            }
        }
    }
}
