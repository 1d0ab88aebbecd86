//! Test-only builders for synthetic Mach-O images, unwind-info sections,
//! eh_frame sections, and multi-region fake tasks. Everything is built
//! byte by byte so tests control the exact on-disk layout.

use crate::error::{Error, Result};
use crate::mem::{TaskMemory, PAGE_SIZE};

pub fn uleb(mut value: u64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
    out
}

pub fn sleb(mut value: i64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        let sign = byte & 0x40 != 0;
        if (value == 0 && !sign) || (value == -1 && sign) {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
    out
}

/// A task made of several disjoint memory regions. Each region is served
/// at page granularity (bytes after the region's data but inside its last
/// page read as zero), the way resident task memory behaves.
pub struct Regions {
    regions: Vec<(u64, Vec<u8>)>,
}

impl Regions {
    pub fn new() -> Regions {
        Regions { regions: Vec::new() }
    }

    pub fn add(&mut self, base: u64, data: Vec<u8>) {
        self.regions.push((base, data));
    }
}

impl TaskMemory for Regions {
    fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let end = addr
            .checked_add(buf.len() as u64)
            .ok_or(Error::Invalid("address offset overflows"))?;
        for (base, data) in &self.regions {
            let page_start = base & !(PAGE_SIZE - 1);
            let page_end = (base + data.len() as u64 + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
            if addr >= page_start && end <= page_end {
                for (i, b) in buf.iter_mut().enumerate() {
                    let a = addr + i as u64;
                    *b = if a >= *base && a - base < data.len() as u64 {
                        data[(a - base) as usize]
                    } else {
                        0
                    };
                }
                return Ok(());
            }
        }
        Err(Error::Internal("address not readable in target"))
    }
}

fn name16(name: &[u8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..name.len()].copy_from_slice(name);
    out
}

struct Sym {
    name: String,
    value: u64,
    n_type: u8,
    n_desc: u16,
    global: bool,
}

/// Builds a synthetic 64-bit little-endian Mach-O image with a fixed
/// layout:
///
/// ```text
///   +0x0000  mach header + load commands
///   +0x1000  __text            (TEXT_SECTION_OFFSET)
///   +0x2000  __unwind_info     (if set)
///   +0x3000  __eh_frame        (if set)
///   +0x4000  __LINKEDIT        (symtab + strtab)
/// ```
///
/// The `__TEXT` segment spans the first 0x4000 bytes, so section
/// addresses are known before any content exists (eh_frame contents are
/// position-dependent).
pub struct MachBuilder {
    base: u64,
    unwind_info: Option<Vec<u8>>,
    eh_frame: Option<Vec<u8>>,
    symbols: Vec<Sym>,
    dysymtab: bool,
    symtab: bool,
    raw_commands: Vec<Vec<u8>>,
}

impl MachBuilder {
    pub const TEXT_SECTION_OFFSET: u64 = 0x1000;
    pub const UNWIND_INFO_OFFSET: u64 = 0x2000;
    pub const EH_FRAME_OFFSET: u64 = 0x3000;
    pub const LINKEDIT_OFFSET: u64 = 0x4000;

    pub fn new_x86_64(base: u64) -> MachBuilder {
        MachBuilder {
            base,
            unwind_info: None,
            eh_frame: None,
            symbols: Vec::new(),
            dysymtab: false,
            symtab: true,
            raw_commands: Vec::new(),
        }
    }

    pub fn unwind_info(&mut self, bytes: Vec<u8>) -> &mut Self {
        assert!(bytes.len() <= 0x1000);
        self.unwind_info = Some(bytes);
        self
    }

    pub fn eh_frame(&mut self, bytes: Vec<u8>) -> &mut Self {
        assert!(bytes.len() <= 0x1000);
        self.eh_frame = Some(bytes);
        self
    }

    /// Link-time address the `__eh_frame` section will occupy.
    pub fn eh_frame_address(&self) -> u64 {
        self.base + Self::EH_FRAME_OFFSET
    }

    pub fn add_symbol(&mut self, name: &str, value: u64, global: bool) -> &mut Self {
        // N_SECT, plus N_EXT for globals.
        self.add_symbol_raw(name, value, 0x0e | u8::from(global), global)
    }

    pub fn add_symbol_raw(&mut self, name: &str, value: u64, n_type: u8, global: bool) -> &mut Self {
        self.symbols.push(Sym {
            name: name.to_string(),
            value,
            n_type,
            n_desc: 0,
            global,
        });
        self
    }

    pub fn with_dysymtab(&mut self) -> &mut Self {
        self.dysymtab = true;
        self
    }

    pub fn omit_symtab(&mut self) -> &mut Self {
        self.symtab = false;
        self
    }

    pub fn push_raw_command(&mut self, bytes: &[u8]) -> &mut Self {
        self.raw_commands.push(bytes.to_vec());
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let base = self.base;

        // Symbol table: locals first, then globals, as the linker lays
        // them out.
        let mut ordered: Vec<&Sym> = self.symbols.iter().filter(|s| !s.global).collect();
        let nlocal = ordered.len() as u32;
        ordered.extend(self.symbols.iter().filter(|s| s.global));
        let nglobal = ordered.len() as u32 - nlocal;

        let mut strtab = vec![0u8];
        let mut nlist = Vec::new();
        for sym in &ordered {
            let strx = strtab.len() as u32;
            strtab.extend_from_slice(sym.name.as_bytes());
            strtab.push(0);
            nlist.extend_from_slice(&strx.to_le_bytes());
            nlist.push(sym.n_type);
            nlist.push(1); // n_sect
            nlist.extend_from_slice(&sym.n_desc.to_le_bytes());
            nlist.extend_from_slice(&sym.value.to_le_bytes());
        }
        let mut linkedit = nlist.clone();
        linkedit.extend_from_slice(&strtab);

        // Load commands.
        let mut cmds = Vec::new();

        // LC_SEGMENT_64 __TEXT with its sections.
        {
            let mut sections = Vec::new();
            let sect =
                |sections: &mut Vec<u8>, sectname: &[u8], addr: u64, size: u64| {
                    sections.extend_from_slice(&name16(sectname));
                    sections.extend_from_slice(&name16(b"__TEXT"));
                    sections.extend_from_slice(&addr.to_le_bytes());
                    sections.extend_from_slice(&size.to_le_bytes());
                    sections.extend_from_slice(&[0u8; 32]); // offset..reserved3
                };
            sect(
                &mut sections,
                b"__text",
                base + Self::TEXT_SECTION_OFFSET,
                0x1000,
            );
            if let Some(ui) = &self.unwind_info {
                sect(
                    &mut sections,
                    b"__unwind_info",
                    base + Self::UNWIND_INFO_OFFSET,
                    ui.len() as u64,
                );
            }
            if let Some(eh) = &self.eh_frame {
                sect(
                    &mut sections,
                    b"__eh_frame",
                    base + Self::EH_FRAME_OFFSET,
                    eh.len() as u64,
                );
            }
            let nsects = (sections.len() / 80) as u32;

            cmds.extend_from_slice(&0x19u32.to_le_bytes()); // LC_SEGMENT_64
            cmds.extend_from_slice(&(72 + sections.len() as u32).to_le_bytes());
            cmds.extend_from_slice(&name16(b"__TEXT"));
            cmds.extend_from_slice(&base.to_le_bytes()); // vmaddr
            cmds.extend_from_slice(&Self::LINKEDIT_OFFSET.to_le_bytes()); // vmsize
            cmds.extend_from_slice(&0u64.to_le_bytes()); // fileoff
            cmds.extend_from_slice(&Self::LINKEDIT_OFFSET.to_le_bytes()); // filesize
            cmds.extend_from_slice(&5u32.to_le_bytes()); // maxprot
            cmds.extend_from_slice(&5u32.to_le_bytes()); // initprot
            cmds.extend_from_slice(&nsects.to_le_bytes());
            cmds.extend_from_slice(&0u32.to_le_bytes()); // flags
            cmds.extend_from_slice(&sections);
        }

        if self.symtab {
            // LC_SEGMENT_64 __LINKEDIT.
            cmds.extend_from_slice(&0x19u32.to_le_bytes());
            cmds.extend_from_slice(&72u32.to_le_bytes());
            cmds.extend_from_slice(&name16(b"__LINKEDIT"));
            cmds.extend_from_slice(&(base + Self::LINKEDIT_OFFSET).to_le_bytes());
            cmds.extend_from_slice(&(linkedit.len().max(1) as u64).to_le_bytes());
            cmds.extend_from_slice(&Self::LINKEDIT_OFFSET.to_le_bytes()); // fileoff
            cmds.extend_from_slice(&(linkedit.len() as u64).to_le_bytes()); // filesize
            cmds.extend_from_slice(&1u32.to_le_bytes());
            cmds.extend_from_slice(&1u32.to_le_bytes());
            cmds.extend_from_slice(&0u32.to_le_bytes());
            cmds.extend_from_slice(&0u32.to_le_bytes());

            // LC_SYMTAB.
            cmds.extend_from_slice(&0x2u32.to_le_bytes());
            cmds.extend_from_slice(&24u32.to_le_bytes());
            cmds.extend_from_slice(&(Self::LINKEDIT_OFFSET as u32).to_le_bytes()); // symoff
            cmds.extend_from_slice(&(ordered.len() as u32).to_le_bytes());
            cmds.extend_from_slice(&(Self::LINKEDIT_OFFSET as u32 + nlist.len() as u32).to_le_bytes());
            cmds.extend_from_slice(&(strtab.len() as u32).to_le_bytes());

            if self.dysymtab {
                // LC_DYSYMTAB: only the local/extdef ranges matter here.
                let mut dysym = Vec::new();
                dysym.extend_from_slice(&0xbu32.to_le_bytes());
                dysym.extend_from_slice(&80u32.to_le_bytes());
                dysym.extend_from_slice(&0u32.to_le_bytes()); // ilocalsym
                dysym.extend_from_slice(&nlocal.to_le_bytes());
                dysym.extend_from_slice(&nlocal.to_le_bytes()); // iextdefsym
                dysym.extend_from_slice(&nglobal.to_le_bytes());
                dysym.resize(80, 0);
                cmds.extend_from_slice(&dysym);
            }
        }

        let mut ncmds = 2 + u32::from(self.symtab) + u32::from(self.symtab && self.dysymtab);
        if !self.symtab {
            ncmds = 1;
        }
        for raw in &self.raw_commands {
            cmds.extend_from_slice(raw);
            ncmds += 1;
        }

        assert!(cmds.len() + 32 <= Self::TEXT_SECTION_OFFSET as usize);

        let mut image = vec![0u8; Self::LINKEDIT_OFFSET as usize + linkedit.len()];
        // mach_header_64.
        image[0..4].copy_from_slice(&crate::macho::MH_MAGIC_64.to_le_bytes());
        image[4..8].copy_from_slice(&crate::arch::CPU_TYPE_X86_64.to_le_bytes());
        image[8..12].copy_from_slice(&3u32.to_le_bytes()); // cpusubtype
        image[12..16].copy_from_slice(&2u32.to_le_bytes()); // MH_EXECUTE
        image[16..20].copy_from_slice(&ncmds.to_le_bytes());
        image[20..24].copy_from_slice(&(cmds.len() as u32).to_le_bytes());
        image[32..32 + cmds.len()].copy_from_slice(&cmds);

        if let Some(ui) = &self.unwind_info {
            let off = Self::UNWIND_INFO_OFFSET as usize;
            image[off..off + ui.len()].copy_from_slice(ui);
        }
        if let Some(eh) = &self.eh_frame {
            let off = Self::EH_FRAME_OFFSET as usize;
            image[off..off + eh.len()].copy_from_slice(eh);
        }
        let off = Self::LINKEDIT_OFFSET as usize;
        image[off..off + linkedit.len()].copy_from_slice(&linkedit);
        image
    }
}

/// A tiny 32-bit image: `__TEXT`, `__LINKEDIT`, and a two-entry symbol
/// table (one plain entry, one thumb-tagged).
pub fn build_minimal_32bit_image(base: u64) -> Vec<u8> {
    let base32 = u32::try_from(base).unwrap();
    let linkedit_off = 0x2000u32;

    let mut strtab = vec![0u8];
    let mut nlist = Vec::new();
    let mut add = |name: &str, value: u32, n_desc: u16, strtab: &mut Vec<u8>| {
        let strx = strtab.len() as u32;
        strtab.extend_from_slice(name.as_bytes());
        strtab.push(0);
        nlist.extend_from_slice(&strx.to_le_bytes());
        nlist.push(0x0e); // N_SECT
        nlist.push(1);
        nlist.extend_from_slice(&n_desc.to_le_bytes());
        nlist.extend_from_slice(&value.to_le_bytes());
    };
    add("_plain", base32 + 0x1000, 0, &mut strtab);
    add("_thumb", base32 + 0x1200, 0x0008, &mut strtab);
    let mut linkedit = nlist.clone();
    linkedit.extend_from_slice(&strtab);

    let mut cmds = Vec::new();
    let seg32 = |cmds: &mut Vec<u8>, name: &[u8], vmaddr: u32, vmsize: u32, fileoff: u32| {
        cmds.extend_from_slice(&0x1u32.to_le_bytes()); // LC_SEGMENT
        cmds.extend_from_slice(&56u32.to_le_bytes());
        cmds.extend_from_slice(&name16(name));
        cmds.extend_from_slice(&vmaddr.to_le_bytes());
        cmds.extend_from_slice(&vmsize.to_le_bytes());
        cmds.extend_from_slice(&fileoff.to_le_bytes());
        cmds.extend_from_slice(&vmsize.to_le_bytes()); // filesize
        cmds.extend_from_slice(&1u32.to_le_bytes());
        cmds.extend_from_slice(&1u32.to_le_bytes());
        cmds.extend_from_slice(&0u32.to_le_bytes()); // nsects
        cmds.extend_from_slice(&0u32.to_le_bytes());
    };
    seg32(&mut cmds, b"__TEXT", base32, linkedit_off, 0);
    seg32(
        &mut cmds,
        b"__LINKEDIT",
        base32 + linkedit_off,
        linkedit.len() as u32,
        linkedit_off,
    );
    cmds.extend_from_slice(&0x2u32.to_le_bytes()); // LC_SYMTAB
    cmds.extend_from_slice(&24u32.to_le_bytes());
    cmds.extend_from_slice(&linkedit_off.to_le_bytes());
    cmds.extend_from_slice(&2u32.to_le_bytes());
    cmds.extend_from_slice(&(linkedit_off + nlist.len() as u32).to_le_bytes());
    cmds.extend_from_slice(&(strtab.len() as u32).to_le_bytes());

    let mut image = vec![0u8; linkedit_off as usize + linkedit.len()];
    image[0..4].copy_from_slice(&crate::macho::MH_MAGIC.to_le_bytes());
    image[4..8].copy_from_slice(&12u32.to_le_bytes()); // CPU_TYPE_ARM
    image[8..12].copy_from_slice(&9u32.to_le_bytes());
    image[12..16].copy_from_slice(&2u32.to_le_bytes());
    image[16..20].copy_from_slice(&3u32.to_le_bytes());
    image[20..24].copy_from_slice(&(cmds.len() as u32).to_le_bytes());
    image[28..28 + cmds.len()].copy_from_slice(&cmds);
    let off = linkedit_off as usize;
    image[off..off + linkedit.len()].copy_from_slice(&linkedit);
    image
}

enum Page {
    Regular {
        first: u32,
        entries: Vec<(u32, u32)>,
    },
    Compressed {
        first: u32,
        entries: Vec<(u32, u32)>,
        locals: Vec<u32>,
    },
}

/// Builds a `__unwind_info` section: header, common encodings palette,
/// first-level index (with the trailing sentinel entry), and second-level
/// pages.
pub struct UnwindInfoBuilder {
    common: Vec<u32>,
    pages: Vec<Page>,
}

impl UnwindInfoBuilder {
    pub fn new() -> UnwindInfoBuilder {
        UnwindInfoBuilder {
            common: Vec::new(),
            pages: Vec::new(),
        }
    }

    pub fn common(mut self, encodings: &[u32]) -> Self {
        self.common = encodings.to_vec();
        self
    }

    /// A regular page: absolute (function offset, encoding) pairs.
    pub fn regular_page(mut self, first: u32, entries: &[(u32, u32)]) -> Self {
        self.pages.push(Page::Regular {
            first,
            entries: entries.to_vec(),
        });
        self
    }

    /// A compressed page: (offset relative to `first`, palette index)
    /// pairs plus the page-local encoding palette.
    pub fn compressed_page(mut self, first: u32, entries: &[(u32, u32)], locals: &[u32]) -> Self {
        self.pages.push(Page::Compressed {
            first,
            entries: entries.to_vec(),
            locals: locals.to_vec(),
        });
        self
    }

    pub fn build(self) -> Vec<u8> {
        let common_off = 28u32;
        let index_off = common_off + self.common.len() as u32 * 4;
        let index_count = self.pages.len() as u32 + 1;
        let pages_start = index_off + index_count * 12;

        let mut page_blobs = Vec::new();
        for page in &self.pages {
            let mut blob = Vec::new();
            match page {
                Page::Regular { entries, .. } => {
                    blob.extend_from_slice(&2u32.to_le_bytes());
                    blob.extend_from_slice(&8u16.to_le_bytes()); // entryPageOffset
                    blob.extend_from_slice(&(entries.len() as u16).to_le_bytes());
                    for (fo, enc) in entries {
                        blob.extend_from_slice(&fo.to_le_bytes());
                        blob.extend_from_slice(&enc.to_le_bytes());
                    }
                }
                Page::Compressed {
                    entries, locals, ..
                } => {
                    blob.extend_from_slice(&3u32.to_le_bytes());
                    blob.extend_from_slice(&12u16.to_le_bytes()); // entryPageOffset
                    blob.extend_from_slice(&(entries.len() as u16).to_le_bytes());
                    blob.extend_from_slice(
                        &(12 + entries.len() as u16 * 4).to_le_bytes(), // encodingsPageOffset
                    );
                    blob.extend_from_slice(&(locals.len() as u16).to_le_bytes());
                    for (rel, palette) in entries {
                        blob.extend_from_slice(&((palette << 24) | (rel & 0xff_ffff)).to_le_bytes());
                    }
                    for enc in locals {
                        blob.extend_from_slice(&enc.to_le_bytes());
                    }
                }
            }
            page_blobs.push(blob);
        }

        let mut out = Vec::new();
        out.extend_from_slice(&1u32.to_le_bytes()); // version
        out.extend_from_slice(&common_off.to_le_bytes());
        out.extend_from_slice(&(self.common.len() as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // personalities offset
        out.extend_from_slice(&0u32.to_le_bytes()); // personalities count
        out.extend_from_slice(&index_off.to_le_bytes());
        out.extend_from_slice(&index_count.to_le_bytes());
        for enc in &self.common {
            out.extend_from_slice(&enc.to_le_bytes());
        }

        let mut page_off = pages_start;
        let mut last_first = 0;
        for (page, blob) in self.pages.iter().zip(&page_blobs) {
            let first = match page {
                Page::Regular { first, .. } | Page::Compressed { first, .. } => *first,
            };
            last_first = first;
            out.extend_from_slice(&first.to_le_bytes());
            out.extend_from_slice(&page_off.to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes()); // lsda index offset
            page_off += blob.len() as u32;
        }
        // The sentinel entry marks the end of the covered range.
        out.extend_from_slice(&(last_first + 0x2000).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());

        for blob in &page_blobs {
            out.extend_from_slice(blob);
        }
        out
    }
}

/// Builds an `__eh_frame` section containing one CIE (code alignment 1,
/// data alignment -8, return-address register 16, `zR` augmentation with
/// pc-relative sdata4 pointers) and any number of FDEs.
pub struct EhFrameBuilder {
    addr: u64,
    bytes: Vec<u8>,
}

impl EhFrameBuilder {
    /// `addr` is the loaded address the section will occupy; FDE address
    /// fields are pc-relative and depend on it.
    pub fn new(addr: u64) -> EhFrameBuilder {
        let mut body = Vec::new();
        body.extend_from_slice(&0u32.to_le_bytes()); // CIE id
        body.push(1); // version
        body.extend_from_slice(b"zR\0");
        body.extend_from_slice(&uleb(1)); // code alignment
        body.extend_from_slice(&sleb(-8)); // data alignment
        body.extend_from_slice(&uleb(16)); // return address register
        body.extend_from_slice(&uleb(1)); // augmentation data length
        body.push(0x1b); // DW_EH_PE_pcrel | DW_EH_PE_sdata4
        while (body.len() + 4) % 4 != 0 {
            body.push(0); // DW_CFA_nop padding
        }

        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(body.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&body);
        EhFrameBuilder { addr, bytes }
    }

    pub fn add_fde(&mut self, func: u64, range: u64, instructions: &[u8]) -> &mut Self {
        let entry_off = self.bytes.len() as u64;
        let mut body = Vec::new();
        // CIE pointer: distance from this field back to the CIE at 0.
        body.extend_from_slice(&((entry_off + 4) as u32).to_le_bytes());
        // initial_location, pcrel sdata4 against its own field address.
        let field_addr = self.addr + entry_off + 8;
        let rel = i32::try_from(func as i128 - field_addr as i128).unwrap();
        body.extend_from_slice(&rel.to_le_bytes());
        body.extend_from_slice(&(range as u32).to_le_bytes());
        body.extend_from_slice(&uleb(0)); // augmentation data length
        body.extend_from_slice(instructions);
        while (body.len() + 4) % 4 != 0 {
            body.push(0);
        }

        self.bytes.extend_from_slice(&(body.len() as u32).to_le_bytes());
        self.bytes.extend_from_slice(&body);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = self.bytes.clone();
        out.extend_from_slice(&0u32.to_le_bytes()); // terminator
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leb_encoders() {
        assert_eq!(uleb(0), vec![0]);
        assert_eq!(uleb(127), vec![0x7f]);
        assert_eq!(uleb(128), vec![0x80, 0x01]);
        assert_eq!(uleb(0x1_0000), vec![0x80, 0x80, 0x04]);
        assert_eq!(sleb(-8), vec![0x78]);
        assert_eq!(sleb(2), vec![0x02]);
        assert_eq!(sleb(-129), vec![0xff, 0x7e]);
    }

    #[test]
    fn regions_serve_disjoint_ranges() {
        let mut task = Regions::new();
        task.add(0x1000, vec![1, 2, 3, 4]);
        task.add(0x9000, vec![9]);
        let mut buf = [0u8; 2];
        task.read_bytes(0x1002, &mut buf).unwrap();
        assert_eq!(buf, [3, 4]);
        task.read_bytes(0x9000, &mut buf[..1]).unwrap();
        assert_eq!(buf[0], 9);
        assert!(task.read_bytes(0x5000, &mut buf).is_err());
    }
}
