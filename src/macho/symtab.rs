//! Reading of the Mach-O symbol and string tables out of the mapped
//! `__LINKEDIT` segment.

use tracing::trace;

use super::{
    MachImage, MappedSegment, DYSYMTAB_COMMAND_SIZE, LC_DYSYMTAB, LC_SYMTAB, SEG_LINKEDIT,
    SYMTAB_COMMAND_SIZE,
};
use crate::error::{Error, Result};
use crate::mem::TaskMemory;

/// `n_type` mask for debugging (stab) entries.
pub const N_STAB: u8 = 0xe0;
/// `n_type` mask for the type bits.
pub const N_TYPE: u8 = 0x0e;
/// Type bits: symbol is defined in a section.
pub const N_SECT: u8 = 0x0e;
/// `n_type` flag: external symbol.
pub const N_EXT: u8 = 0x01;
/// `n_desc` flag: ARM thumb function; the low address bit must be set.
pub const N_ARM_THUMB_DEF: u16 = 0x0008;

/// One symbol-table record, normalized from the 32-bit or 64-bit nlist
/// layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SymtabEntry {
    pub strx: u32,
    pub n_type: u8,
    pub n_sect: u8,
    pub n_desc: u16,
    pub value: u64,
    /// `value` with architecture tag bits applied (thumb low bit).
    pub normalized_value: u64,
}

impl SymtabEntry {
    /// Whether this entry can name code: defined in a section and not a
    /// debugging entry.
    pub fn names_code(&self) -> bool {
        (self.n_type & N_TYPE) == N_SECT && (self.n_type & N_STAB) == 0
    }
}

#[derive(Debug)]
struct Partitions {
    global: (u32, u32),
    local: (u32, u32),
}

/// A borrowed view over an image's symbol and string tables.
///
/// The `__LINKEDIT` mapping may be short (declared vmsize larger than
/// what is resident), so the table and every string access are validated
/// against what was actually mapped.
#[derive(Debug)]
pub struct SymtabReader {
    linkedit: MappedSegment,
    m64: bool,
    endian: gimli::RunTimeEndian,
    nsyms: u32,
    symtab_addr: u64,
    strtab_addr: u64,
    strsize: u32,
    partitions: Option<Partitions>,
}

impl SymtabReader {
    /// Map the image's `__LINKEDIT` segment and validate the symbol and
    /// string tables inside it.
    pub fn new<T: TaskMemory>(task: &T, image: &MachImage) -> Result<SymtabReader> {
        let symtab_cmd = image
            .find_command(LC_SYMTAB)
            .ok_or(Error::NotFound("image has no LC_SYMTAB load command"))?;
        if (symtab_cmd.cmdsize as u64) < SYMTAB_COMMAND_SIZE {
            return Err(Error::Invalid("LC_SYMTAB command is too short"));
        }
        let e = image.endian;
        let symoff = image.load_cmds.read_u32(e, symtab_cmd.addr, 8)?;
        let nsyms = image.load_cmds.read_u32(e, symtab_cmd.addr, 12)?;
        let stroff = image.load_cmds.read_u32(e, symtab_cmd.addr, 16)?;
        let strsize = image.load_cmds.read_u32(e, symtab_cmd.addr, 20)?;

        let linkedit = image.map_segment(task, SEG_LINKEDIT)?;
        let base = linkedit.mapping.base_address();

        let nlist_size: u64 = if image.m64 { 16 } else { 12 };
        let table_len = nsyms as u64 * nlist_size;
        let symtab_addr = (symoff as u64)
            .checked_sub(linkedit.fileoff)
            .and_then(|delta| base.checked_add(delta))
            .ok_or(Error::Invalid("symbol table offset precedes __LINKEDIT"))?;
        if !linkedit.mapping.verify_range(symtab_addr, 0, table_len) {
            return Err(Error::Internal("symbol table lies outside the mapped __LINKEDIT"));
        }

        let strtab_addr = (stroff as u64)
            .checked_sub(linkedit.fileoff)
            .and_then(|delta| base.checked_add(delta))
            .ok_or(Error::Invalid("string table offset precedes __LINKEDIT"))?;
        if !linkedit.mapping.verify_range(strtab_addr, 0, strsize as u64) {
            return Err(Error::Internal("string table lies outside the mapped __LINKEDIT"));
        }

        // The dysymtab partition is optional; when present it narrows the
        // scan to the global and local sub-ranges.
        let mut partitions = None;
        if let Some(dysym) = image.find_command(LC_DYSYMTAB) {
            if (dysym.cmdsize as u64) < DYSYMTAB_COMMAND_SIZE {
                trace!(image = %image.name, "LC_DYSYMTAB command is too short, ignoring");
            } else {
                let ilocal = image.load_cmds.read_u32(e, dysym.addr, 8)?;
                let nlocal = image.load_cmds.read_u32(e, dysym.addr, 12)?;
                let iext = image.load_cmds.read_u32(e, dysym.addr, 16)?;
                let next = image.load_cmds.read_u32(e, dysym.addr, 20)?;
                let global_end = iext.checked_add(next);
                let local_end = ilocal.checked_add(nlocal);
                match (global_end, local_end) {
                    (Some(g), Some(l)) if g <= nsyms && l <= nsyms => {
                        partitions = Some(Partitions {
                            global: (iext, next),
                            local: (ilocal, nlocal),
                        });
                    }
                    _ => return Err(Error::Invalid("dysymtab ranges exceed the symbol table")),
                }
            }
        }

        Ok(SymtabReader {
            linkedit,
            m64: image.m64,
            endian: e,
            nsyms,
            symtab_addr,
            strtab_addr,
            strsize,
            partitions,
        })
    }

    /// Number of symbol-table entries.
    pub fn len(&self) -> u32 {
        self.nsyms
    }

    pub fn is_empty(&self) -> bool {
        self.nsyms == 0
    }

    /// Index range of the externally-visible symbols, when the dysymtab
    /// partition is present.
    pub fn global_range(&self) -> Option<core::ops::Range<u32>> {
        self.partitions
            .as_ref()
            .map(|p| p.global.0..p.global.0 + p.global.1)
    }

    /// Index range of the local symbols, when the dysymtab partition is
    /// present.
    pub fn local_range(&self) -> Option<core::ops::Range<u32>> {
        self.partitions
            .as_ref()
            .map(|p| p.local.0..p.local.0 + p.local.1)
    }

    /// Read one entry, dispatching on the record width and normalizing
    /// into the canonical layout.
    pub fn read(&self, index: u32) -> Result<SymtabEntry> {
        if index >= self.nsyms {
            return Err(Error::Invalid("symbol index out of range"));
        }
        let nlist_size: u64 = if self.m64 { 16 } else { 12 };
        let addr = self.symtab_addr + index as u64 * nlist_size;
        let m = &self.linkedit.mapping;
        let e = self.endian;

        let strx = m.read_u32(e, addr, 0)?;
        let n_type = m.read_u8(addr, 4)?;
        let n_sect = m.read_u8(addr, 5)?;
        let n_desc = m.read_u16(e, addr, 6)?;
        let value = if self.m64 {
            m.read_u64(e, addr, 8)?
        } else {
            m.read_u32(e, addr, 8)? as u64
        };

        let normalized_value = if n_desc & N_ARM_THUMB_DEF != 0 {
            value | 1
        } else {
            value
        };

        Ok(SymtabEntry {
            strx,
            n_type,
            n_sect,
            n_desc,
            value,
            normalized_value,
        })
    }

    /// All entries, in table order.
    pub fn entries(&self) -> impl Iterator<Item = Result<SymtabEntry>> + '_ {
        (0..self.nsyms).map(move |i| self.read(i))
    }

    /// Task-relative address of the name for string-table index `strx`.
    pub fn symbol_name_address(&self, strx: u32) -> Result<u64> {
        if strx >= self.strsize {
            return Err(Error::Invalid("string table index out of range"));
        }
        Ok(self.strtab_addr + strx as u64)
    }

    /// The NUL-terminated name at `strx`, validated byte by byte against
    /// the mapped string table.
    pub fn symbol_name(&self, strx: u32) -> Result<&str> {
        let start = self.symbol_name_address(strx)?;
        let limit = (self.strsize - strx) as u64;
        let m = &self.linkedit.mapping;
        let mut len = 0u64;
        loop {
            if len >= limit || !m.verify_range(start, len as i64, 1) {
                return Err(Error::Invalid("unterminated string table entry"));
            }
            if m.read_u8(start, len as i64)? == 0 {
                break;
            }
            len += 1;
        }
        core::str::from_utf8(m.remap(start, 0, len)?)
            .map_err(|_| Error::Invalid("symbol name is not valid UTF-8"))
    }
}
