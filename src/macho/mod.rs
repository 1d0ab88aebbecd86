//! Parsing of Mach-O images out of a target task's memory.
//!
//! Everything here goes through bounds-checked [`Mapping`] reads; a
//! corrupt or hostile image can make lookups fail, but it cannot make the
//! reader walk outside mapped memory or loop forever. 32-bit and 64-bit
//! record layouts are decoded through one canonical record type each,
//! dispatched on the header width.

pub mod symtab;

use gimli::RunTimeEndian;
use tracing::trace;

use crate::arch::Arch;
use crate::error::{Error, Result};
use crate::mem::{apply_offset, read_task_u32, Mapping, TaskMemory};

pub const MH_MAGIC: u32 = 0xfeed_face;
pub const MH_CIGAM: u32 = 0xcefa_edfe;
pub const MH_MAGIC_64: u32 = 0xfeed_facf;
pub const MH_CIGAM_64: u32 = 0xcffa_edfe;
pub const FAT_MAGIC: u32 = 0xcafe_babe;
pub const FAT_CIGAM: u32 = 0xbeba_feca;

pub const LC_SEGMENT: u32 = 0x1;
pub const LC_SYMTAB: u32 = 0x2;
pub const LC_DYSYMTAB: u32 = 0xb;
pub const LC_SEGMENT_64: u32 = 0x19;

pub const SEG_TEXT: &[u8] = b"__TEXT";
pub const SEG_LINKEDIT: &[u8] = b"__LINKEDIT";
pub const SECT_UNWIND_INFO: &[u8] = b"__unwind_info";
pub const SECT_EH_FRAME: &[u8] = b"__eh_frame";

const LOAD_COMMAND_SIZE: u64 = 8;
const SEGMENT_COMMAND_SIZE_32: u64 = 56;
const SEGMENT_COMMAND_SIZE_64: u64 = 72;
const SECTION_SIZE_32: u64 = 68;
const SECTION_SIZE_64: u64 = 80;
const SYMTAB_COMMAND_SIZE: u64 = 24;
const DYSYMTAB_COMMAND_SIZE: u64 = 80;

/// A validated load command: its declared size has been checked against
/// the mapped load-command region before this value is handed out.
#[derive(Clone, Copy, Debug)]
pub struct LoadCommand {
    /// Task-relative address of the command.
    pub addr: u64,
    pub cmd: u32,
    pub cmdsize: u32,
}

/// Canonical segment record, decoded from either the 32-bit or 64-bit
/// layout.
#[derive(Clone, Copy)]
pub struct SegmentCommand {
    pub segname: [u8; 16],
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    pub filesize: u64,
    pub nsects: u32,
    /// Task-relative address of the first entry of the section table.
    sect_base: u64,
}

/// Canonical section record.
#[derive(Clone, Copy, Debug)]
pub struct Section {
    pub sectname: [u8; 16],
    pub segname: [u8; 16],
    /// Link-time address; apply the image slide to get the loaded address.
    pub addr: u64,
    pub size: u64,
}

/// A mapped segment, together with the file layout data needed to locate
/// file-offset-addressed tables (symtab) inside it.
#[derive(Debug)]
pub struct MappedSegment {
    pub mapping: Mapping,
    pub fileoff: u64,
    pub filesize: u64,
}

/// Compare a fixed-width, NUL-padded name field against a name.
fn name_eq(field: &[u8; 16], name: &[u8]) -> bool {
    let len = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    &field[..len] == name
}

/// A Mach-O image loaded in the target task.
///
/// Constructed on the non-signal-safe path when an image-load event is
/// observed; once built, all accessors only touch the already-mapped
/// load-command region or issue fresh bounds-checked mappings.
pub struct MachImage {
    name: String,
    header_addr: u64,
    m64: bool,
    endian: RunTimeEndian,
    cputype: u32,
    sizeofcmds: u32,
    header_size: u64,
    load_cmds: Mapping,
    text_vmaddr: u64,
    text_size: u64,
    vmaddr_slide: i64,
}

impl MachImage {
    /// Read and validate the image whose Mach-O header is at
    /// `header_addr` in `task`. Not signal-safe (allocates).
    pub fn open<T: TaskMemory>(task: &T, name: &str, header_addr: u64) -> Result<MachImage> {
        let mut magic = [0u8; 4];
        task.read_bytes(header_addr, &mut magic)?;
        let (m64, endian) = match u32::from_le_bytes(magic) {
            MH_MAGIC => (false, RunTimeEndian::Little),
            MH_CIGAM => (false, RunTimeEndian::Big),
            MH_MAGIC_64 => (true, RunTimeEndian::Little),
            MH_CIGAM_64 => (true, RunTimeEndian::Big),
            FAT_MAGIC | FAT_CIGAM => {
                return Err(Error::Invalid("universal (fat) archive is not a loaded image"))
            }
            _ => return Err(Error::Invalid("unknown Mach-O magic")),
        };

        let cputype = read_task_u32(task, endian, header_addr, 4)?;
        let sizeofcmds = read_task_u32(task, endian, header_addr, 20)?;
        let header_size = if m64 { 32 } else { 28 };

        // The load-command table must be fully present; unlike segment
        // data, a truncated command table makes the image unparsable.
        let cmds_addr = apply_offset(header_addr, header_size as i64)?;
        let load_cmds = Mapping::new(task, cmds_addr, sizeofcmds as u64, true)?;

        let mut image = MachImage {
            name: name.to_string(),
            header_addr,
            m64,
            endian,
            cputype,
            sizeofcmds,
            header_size,
            load_cmds,
            text_vmaddr: 0,
            text_size: 0,
            vmaddr_slide: 0,
        };

        let text = image
            .find_segment(SEG_TEXT)?
            .ok_or(Error::Invalid("image has no __TEXT segment"))?;
        image.text_vmaddr = text.vmaddr;
        image.text_size = text.vmsize;
        image.vmaddr_slide = i64::try_from(header_addr as i128 - text.vmaddr as i128)
            .map_err(|_| Error::Invalid("vm slide does not fit a signed offset"))?;

        Ok(image)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Task-relative address of the Mach-O header.
    pub fn header_address(&self) -> u64 {
        self.header_addr
    }

    pub fn is_64(&self) -> bool {
        self.m64
    }

    pub fn endian(&self) -> RunTimeEndian {
        self.endian
    }

    pub fn cputype(&self) -> u32 {
        self.cputype
    }

    /// The image's architecture, if its unwind encodings are supported.
    pub fn arch(&self) -> Result<Arch> {
        Arch::from_cputype(self.cputype)
    }

    /// Offset between the loaded address and the link-time address.
    pub fn vmaddr_slide(&self) -> i64 {
        self.vmaddr_slide
    }

    /// True if `addr` falls within the loaded `__TEXT` region.
    pub fn contains_address(&self, addr: u64) -> bool {
        addr >= self.header_addr && addr - self.header_addr < self.text_size
    }

    /// Iterate load commands. Returns `None` at the end of the table and
    /// on any malformed declared size: a zero or oversized `cmdsize` is
    /// treated as corruption and terminates iteration rather than looping
    /// or overrunning.
    pub fn next_command(&self, prev: Option<LoadCommand>) -> Option<LoadCommand> {
        let addr = match prev {
            None => {
                if (self.sizeofcmds as u64) < LOAD_COMMAND_SIZE {
                    trace!(image = %self.name, "sizeofcmds is smaller than a load command");
                    return None;
                }
                self.header_addr + self.header_size
            }
            Some(p) => p.addr.checked_add(p.cmdsize as u64)?,
        };

        if !self.load_cmds.verify_range(addr, 0, LOAD_COMMAND_SIZE) {
            return None;
        }
        let cmd = self.load_cmds.read_u32(self.endian, addr, 0).ok()?;
        let cmdsize = self.load_cmds.read_u32(self.endian, addr, 4).ok()?;
        if (cmdsize as u64) < LOAD_COMMAND_SIZE {
            trace!(image = %self.name, cmd, "load command declares an undersized cmdsize");
            return None;
        }
        if !self.load_cmds.verify_range(addr, 0, cmdsize as u64) {
            trace!(image = %self.name, cmd, "load command extends past the mapped table");
            return None;
        }
        Some(LoadCommand { addr, cmd, cmdsize })
    }

    /// Iterate load commands of one type.
    pub fn next_command_of_type(
        &self,
        prev: Option<LoadCommand>,
        cmd_type: u32,
    ) -> Option<LoadCommand> {
        let mut cur = prev;
        loop {
            cur = Some(self.next_command(cur)?);
            if cur.map(|c| c.cmd) == Some(cmd_type) {
                return cur;
            }
        }
    }

    /// First load command of one type.
    pub fn find_command(&self, cmd_type: u32) -> Option<LoadCommand> {
        self.next_command_of_type(None, cmd_type)
    }

    fn segment_command_type(&self) -> u32 {
        if self.m64 {
            LC_SEGMENT_64
        } else {
            LC_SEGMENT
        }
    }

    /// Decode the segment command at `cmd` into the canonical record.
    pub fn read_segment(&self, cmd: LoadCommand) -> Result<SegmentCommand> {
        let fixed = if self.m64 {
            SEGMENT_COMMAND_SIZE_64
        } else {
            SEGMENT_COMMAND_SIZE_32
        };
        if (cmd.cmdsize as u64) < fixed {
            return Err(Error::Invalid("segment command is too short"));
        }
        let mut segname = [0u8; 16];
        segname.copy_from_slice(self.load_cmds.remap(cmd.addr, 8, 16)?);

        let e = self.endian;
        let (vmaddr, vmsize, fileoff, filesize, nsects) = if self.m64 {
            (
                self.load_cmds.read_u64(e, cmd.addr, 24)?,
                self.load_cmds.read_u64(e, cmd.addr, 32)?,
                self.load_cmds.read_u64(e, cmd.addr, 40)?,
                self.load_cmds.read_u64(e, cmd.addr, 48)?,
                self.load_cmds.read_u32(e, cmd.addr, 64)?,
            )
        } else {
            (
                self.load_cmds.read_u32(e, cmd.addr, 24)? as u64,
                self.load_cmds.read_u32(e, cmd.addr, 28)? as u64,
                self.load_cmds.read_u32(e, cmd.addr, 32)? as u64,
                self.load_cmds.read_u32(e, cmd.addr, 36)? as u64,
                self.load_cmds.read_u32(e, cmd.addr, 48)?,
            )
        };
        Ok(SegmentCommand {
            segname,
            vmaddr,
            vmsize,
            fileoff,
            filesize,
            nsects,
            sect_base: cmd.addr + fixed,
        })
    }

    /// Locate a named segment by linear scan of the load commands.
    pub fn find_segment(&self, segname: &[u8]) -> Result<Option<SegmentCommand>> {
        let mut cur = None;
        while let Some(cmd) = self.next_command_of_type(cur, self.segment_command_type()) {
            let seg = self.read_segment(cmd)?;
            if name_eq(&seg.segname, segname) {
                return Ok(Some(seg));
            }
            cur = Some(cmd);
        }
        Ok(None)
    }

    /// Decode the `index`-th section record of `seg`, validating the
    /// section-table slot against the mapped load-command region first.
    pub fn read_section(&self, seg: &SegmentCommand, index: u32) -> Result<Section> {
        let slot = if self.m64 { SECTION_SIZE_64 } else { SECTION_SIZE_32 };
        let addr = seg
            .sect_base
            .checked_add(index as u64 * slot)
            .ok_or(Error::Invalid("section table slot overflows"))?;
        if !self.load_cmds.verify_range(addr, 0, slot) {
            return Err(Error::Invalid("section table entry outside the mapped range"));
        }
        let mut sectname = [0u8; 16];
        sectname.copy_from_slice(self.load_cmds.remap(addr, 0, 16)?);
        let mut segname = [0u8; 16];
        segname.copy_from_slice(self.load_cmds.remap(addr, 16, 16)?);
        let (vaddr, size) = if self.m64 {
            (
                self.load_cmds.read_u64(self.endian, addr, 32)?,
                self.load_cmds.read_u64(self.endian, addr, 40)?,
            )
        } else {
            (
                self.load_cmds.read_u32(self.endian, addr, 32)? as u64,
                self.load_cmds.read_u32(self.endian, addr, 36)? as u64,
            )
        };
        Ok(Section {
            sectname,
            segname,
            addr: vaddr,
            size,
        })
    }

    /// Find a named section inside a named segment.
    pub fn find_section(&self, segname: &[u8], sectname: &[u8]) -> Result<Section> {
        let seg = self
            .find_segment(segname)?
            .ok_or(Error::NotFound("segment is not present in the image"))?;
        for i in 0..seg.nsects {
            let sect = self.read_section(&seg, i)?;
            if name_eq(&sect.sectname, sectname) {
                return Ok(sect);
            }
        }
        Err(Error::NotFound("section is not present in the segment"))
    }

    /// Map a named segment's loaded bytes.
    ///
    /// Short mappings are permitted: segment vmsize values larger than
    /// what is actually resident have been observed in the wild (shared
    /// cache LINKEDIT), so the caller gets the largest readable prefix
    /// and must bounds-check all access through the mapping.
    pub fn map_segment<T: TaskMemory>(&self, task: &T, segname: &[u8]) -> Result<MappedSegment> {
        let seg = self
            .find_segment(segname)?
            .ok_or(Error::NotFound("segment is not present in the image"))?;
        let addr = apply_offset(seg.vmaddr, self.vmaddr_slide)?;
        let mapping = Mapping::new(task, addr, seg.vmsize, false)?;
        Ok(MappedSegment {
            mapping,
            fileoff: seg.fileoff,
            filesize: seg.filesize,
        })
    }

    /// Map a named section's loaded bytes. The full section must be
    /// mappable.
    pub fn map_section<T: TaskMemory>(
        &self,
        task: &T,
        segname: &[u8],
        sectname: &[u8],
    ) -> Result<Mapping> {
        let sect = self.find_section(segname, sectname)?;
        let addr = apply_offset(sect.addr, self.vmaddr_slide)?;
        Mapping::new(task, addr, sect.size, true)
    }
}
