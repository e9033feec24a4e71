//! Symbol resolution across the host executable and every module object
//! being packaged together (§4.3).

use crate::bundle::HOST_MODULE;
use crate::elf::ElfObject;
use crate::helper::{ResolveProblem, Result};

/// Where a symbol was found: which module defines it, which section of that
/// module it lives in, and its value within that section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedSymbol {
    pub module_id: u32,
    pub section:   u16,
    pub address:   u32,
}

/// Searches the host first, then every other registered module, skipping
/// the requester itself. First match wins.
pub struct Resolver<'a, 'data> {
    host:    &'a ElfObject<'data>,
    modules: Vec<(u32, &'a ElfObject<'data>)>,
}

impl<'a, 'data> Resolver<'a, 'data> {
    pub fn new(host: &'a ElfObject<'data>) -> Self {
        Resolver {
            host,
            modules: Vec::new(),
        }
    }

    /// Register a module object with its 1-based handle index.
    pub fn add_module(&mut self, module_id: u32, elf: &'a ElfObject<'data>) {
        debug_assert!(module_id != HOST_MODULE, "module ids are 1-based, 0 is reserved for the host");
        self.modules.push((module_id, elf));
    }

    /// Resolve `name` as seen from `requester_id` (`0` for the host itself).
    pub fn resolve(&self, name: &str, requester_id: u32, section: &str, offset: u32) -> Result<ResolvedSymbol> {
        if requester_id != HOST_MODULE {
            if let Some((section, address)) = self.host.find_global_symbol(name) {
                return Ok(ResolvedSymbol {
                    module_id: HOST_MODULE,
                    section,
                    address,
                });
            }
        }

        for (module_id, elf) in &self.modules {
            if *module_id == requester_id {
                continue;
            }
            if let Some((section, address)) = elf.find_global_symbol(name) {
                return Ok(ResolvedSymbol {
                    module_id: *module_id,
                    section,
                    address,
                });
            }
        }

        let path = if requester_id == HOST_MODULE {
            self.host.path().to_string()
        } else {
            self.modules
                .iter()
                .find(|(id, _)| *id == requester_id)
                .map(|(_, elf)| elf.path().to_string())
                .unwrap_or_default()
        };

        Err(ResolveProblem::UndefinedReference {
            path,
            section: section.to_string(),
            offset,
            symbol: name.to_string(),
        }
        .into())
    }
}
