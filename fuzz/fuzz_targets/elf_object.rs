#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = ultramod::elf::ElfObject::parse("fuzz.elf", data);
});
