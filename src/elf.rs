//! Thin adapter around the `object` crate for the one kind of input this
//! packager accepts: a 32-bit, big-endian MIPS ELF, either the non-relocatable
//! host executable or a relocatable module object.

use object::{Architecture, BinaryFormat, Object, ObjectSection, ObjectSymbol};

use crate::helper::{ensure, ParseProblem, Result};

/// A parsed ELF input, with the handful of properties the packager cares
/// about already validated.
pub struct ElfObject<'data> {
    path: String,
    file: object::File<'data>,
}

impl<'data> ElfObject<'data> {
    /// Parse `data` and validate that it is a 32-bit big-endian MIPS ELF
    /// carrying a symbol table.
    pub fn parse(path: impl Into<String>, data: &'data [u8]) -> Result<Self> {
        let path = path.into();
        let file = object::File::parse(data)
            .map_err(|_| ParseProblem::NotAnObject(path.clone(), "not a valid ELF object"))?;

        ensure!(
            file.format() == BinaryFormat::Elf,
            ParseProblem::NotAnObject(path.clone(), "not an ELF object")
        );
        ensure!(
            file.architecture() == Architecture::Mips,
            ParseProblem::NotAnObject(path.clone(), "expected MIPS architecture")
        );
        ensure!(
            file.endianness() == object::Endianness::Big,
            ParseProblem::NotAnObject(path.clone(), "expected big-endian object")
        );
        ensure!(
            !file.is_64(),
            ParseProblem::NotAnObject(path.clone(), "expected a 32-bit object")
        );
        ensure!(
            file.symbols().next().is_some(),
            ParseProblem::NotAnObject(path.clone(), "object carries no symbol table")
        );

        Ok(ElfObject { path, file })
    }

    pub fn path(&self) -> &str { &self.path }

    /// `true` for a relocatable module object, `false` for the non-relocatable
    /// host executable.
    pub fn is_relocatable(&self) -> bool { self.file.kind() == object::ObjectKind::Relocatable }

    pub fn kind_name(&self) -> &'static str {
        if self.is_relocatable() {
            "relocatable"
        } else {
            "executable"
        }
    }

    pub fn sections(&self) -> object::read::SectionIterator<'data, '_> { self.file.sections() }

    pub fn section_count(&self) -> usize { self.file.sections().count() }

    pub fn section_by_name(&self, name: &str) -> Option<object::read::Section<'data, '_>> {
        self.file.section_by_name(name)
    }

    /// Look up a symbol by its ELF symbol-table index, as referenced by a
    /// relocation's target.
    pub fn symbol_by_index(&self, index: object::SymbolIndex) -> Option<object::read::Symbol<'data, '_>> {
        self.file.symbol_by_index(index).ok()
    }

    /// Look up a symbol by name, returning `None` both when it is absent and
    /// when it resolves to something that is not a valid definition target
    /// (local binding, or no defining section) — matching the resolver's
    /// rule that such symbols can never be returned to a caller (§4.3).
    pub fn find_global_symbol(&self, name: &str) -> Option<(u16, u32)> {
        let symbol = self.file.symbol_by_name(name)?;
        if symbol.is_local() {
            return None;
        }
        match symbol.section() {
            object::SymbolSection::Section(index) => Some((index.0 as u16, symbol.address() as u32)),
            _ => None,
        }
    }
}
