//! Best-effort nearest-symbol resolution.
//!
//! The match for an address is the symbol with the greatest value that
//! does not exceed it, never an exact match; stripped or partial tables
//! make the answer a guess, and callers must treat it as one.

use tracing::trace;

use crate::error::{Error, Result};
use crate::macho::symtab::SymtabReader;
use crate::macho::MachImage;
use crate::mem::TaskMemory;
use crate::string::TaskString;

/// Which symbol sources to consult.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SymbolStrategy {
    /// The image's static symbol table only.
    SymbolTable,
    /// A collaborator-supplied runtime source only.
    Runtime,
    /// Both; the candidate with the greatest address wins.
    All,
}

/// A resolved (or guessed) symbol.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Symbol {
    /// Loaded address of the symbol.
    pub address: u64,
    /// The symbol's name, when its string could be read.
    pub name: Option<String>,
}

/// A collaborator-supplied source of symbol names derived from runtime
/// metadata (for example a language runtime's method tables). Out of
/// scope here beyond this seam.
pub trait RuntimeSymbols<T: TaskMemory> {
    fn find_symbol(&self, task: &T, image: &MachImage, pc: u64) -> Result<Symbol>;
}

/// Find the best-guess symbol for `pc` within `image`.
///
/// The static scan prefers the dysymtab's global/local partitions when
/// present, skipping debugging and non-section entries. A runtime source,
/// when allowed by `strategy` and supplied, contributes a second
/// candidate; the reported symbol is whichever candidate is the tightest
/// lower bound for `pc`.
pub fn find_symbol<T: TaskMemory>(
    task: &T,
    image: &MachImage,
    strategy: SymbolStrategy,
    runtime: Option<&dyn RuntimeSymbols<T>>,
    pc: u64,
) -> Result<Symbol> {
    let mut best: Option<Symbol> = None;

    if strategy != SymbolStrategy::Runtime {
        match find_symtab_symbol(task, image, pc) {
            Ok(symbol) => best = Some(symbol),
            Err(err) => trace!(%err, pc, "symbol table lookup produced no candidate"),
        }
    }

    if strategy != SymbolStrategy::SymbolTable {
        if let Some(runtime) = runtime {
            match runtime.find_symbol(task, image, pc) {
                Ok(candidate) => {
                    let better = match &best {
                        Some(existing) => candidate.address > existing.address,
                        None => true,
                    };
                    if better && candidate.address <= pc {
                        best = Some(candidate);
                    }
                }
                Err(err) => trace!(%err, pc, "runtime lookup produced no candidate"),
            }
        }
    }

    best.ok_or(Error::NotFound("no symbol at or below the address"))
}

fn scan_range(
    reader: &SymtabReader,
    range: core::ops::Range<u32>,
    slide_pc: u64,
    best: &mut Option<crate::macho::symtab::SymtabEntry>,
) -> Result<()> {
    for index in range {
        let entry = reader.read(index)?;
        if !entry.names_code() {
            continue;
        }
        if entry.value <= slide_pc && best.map_or(true, |b| b.value < entry.value) {
            *best = Some(entry);
        }
    }
    Ok(())
}

fn find_symtab_symbol<T: TaskMemory>(task: &T, image: &MachImage, pc: u64) -> Result<Symbol> {
    let reader = SymtabReader::new(task, image)?;

    // The table holds link-time addresses; compare against the
    // slide-corrected pc.
    let slide_pc = u64::try_from(pc as i128 - image.vmaddr_slide() as i128)
        .map_err(|_| Error::Invalid("address precedes the image's link base"))?;

    let mut best = None;
    match (reader.global_range(), reader.local_range()) {
        (Some(global), Some(local)) => {
            scan_range(&reader, global, slide_pc, &mut best)?;
            scan_range(&reader, local, slide_pc, &mut best)?;
        }
        _ => scan_range(&reader, 0..reader.len(), slide_pc, &mut best)?,
    }
    let entry = best.ok_or(Error::NotFound("no symbol at or below the address"))?;

    // Thumb normalization applies to the reported address.
    let address = u64::try_from(entry.normalized_value as i128 + image.vmaddr_slide() as i128)
        .map_err(|_| Error::Invalid("symbol address overflows after sliding"))?;

    // Read the name lazily out of the target's string table; a missing
    // name does not fail the lookup.
    let name = reader
        .symbol_name_address(entry.strx)
        .ok()
        .and_then(|addr| TaskString::new(addr).read_to_string(task).ok());

    Ok(Symbol { address, name })
}
