use std::convert::TryFrom;
use std::fs;

use anyhow::{anyhow, Context, Result};
use elf::abi::ET_DYN;
use elf::endian::AnyEndian;
use elf::file::Class;
use elf::ElfBytes;

use crate::trace::WatchWidth;

/// A watchable global, resolved from the target binary's symbol table.
///
/// `image_offset` is the symbol's `st_value`, i.e. its virtual address with
/// the image loaded at base 0. For ET_DYN (PIE) binaries the tracee's load
/// base still has to be added; for ET_EXEC it already is the runtime address.
#[derive(Clone, Debug)]
pub struct WatchedSymbol {
    pub name: String,
    pub image_offset: u64,
    pub width: WatchWidth,
    pub pie: bool,
}

/// Looks up `name` in the symbol table of the 64-bit ELF binary at `path`.
///
/// The first `SHT_SYMTAB` entry whose name matches wins; symbols that aren't
/// 4 or 8 bytes wide are rejected.
pub fn resolve(path: &str, name: &str) -> Result<WatchedSymbol> {
    let data = fs::read(path).with_context(|| format!("failed to read binary {}", path))?;

    let elf = ElfBytes::<AnyEndian>::minimal_parse(&data)
        .map_err(|e| anyhow!("{} is not a well-formed ELF binary: {}", path, e))?;
    if elf.ehdr.class != Class::ELF64 {
        return Err(anyhow!("{} is not a 64-bit ELF binary", path));
    }

    let (symtab, strtab) = elf
        .symbol_table()
        .map_err(|e| anyhow!("malformed symbol table in {}: {}", path, e))?
        .ok_or_else(|| anyhow!("{} has no symbol table", path))?;

    for sym in symtab.iter() {
        let sym_name = strtab
            .get(sym.st_name as usize)
            .map_err(|e| anyhow!("malformed string table in {}: {}", path, e))?;
        if sym_name != name {
            continue;
        }

        let width = WatchWidth::try_from(sym.st_size)
            .with_context(|| format!("symbol {} is not watchable", name))?;

        log::debug!(
            "resolved {} at image offset {:#x} ({:?}, pie: {})",
            name,
            sym.st_value,
            width,
            elf.ehdr.e_type == ET_DYN
        );

        return Ok(WatchedSymbol {
            name: name.to_string(),
            image_offset: sym.st_value,
            width,
            pie: elf.ehdr.e_type == ET_DYN,
        });
    }

    Err(anyhow!("symbol {} not found in {}", name, path))
}
