//! The compact unwind encoding ("CFE") side table: a dense, two-level
//! indexed table mapping function ranges to bit-packed frame-restoration
//! recipes, consulted before falling back to DWARF call frame info.

pub mod arm64;
pub mod permutation;
pub mod x86_64;

use arrayvec::ArrayVec;
use gimli::RunTimeEndian;
use tracing::trace;

use crate::arch::Arch;
use crate::error::{Error, Result};
use crate::mem::{apply_offset, read_task_u32, read_task_u64, Mapping, TaskMemory};
use crate::regs::RegisterState;

/// Upper bound on registers a single entry can restore (arm64 frame
/// entries can name five pairs).
pub const CFE_SAVED_REGISTER_MAX: usize = 10;

const UNWIND_SECOND_LEVEL_REGULAR: u32 = 2;
const UNWIND_SECOND_LEVEL_COMPRESSED: u32 = 3;

/// Extract the bits selected by `mask`, shifted down to bit zero.
fn extract(value: u32, mask: u32) -> u32 {
    (value >> mask.trailing_zeros()) & ((1u64 << mask.count_ones()) - 1) as u32
}

fn compressed_entry_func_offset(entry: u32) -> u32 {
    entry & 0x00ff_ffff
}

fn compressed_entry_encoding_index(entry: u32) -> u32 {
    (entry >> 24) & 0xff
}

/// Floor binary search: the greatest index whose value is <= `pc`, or
/// `None` when `pc` precedes every entry.
fn floor_search(count: u32, pc: u32, value_at: impl Fn(u32) -> Result<u32>) -> Result<Option<u32>> {
    let mut lo = 0u32;
    let mut hi = count;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if value_at(mid)? <= pc {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    Ok(lo.checked_sub(1))
}

/// A reader over a mapped `__unwind_info` section.
pub struct CfeReader<'m> {
    mobj: &'m Mapping,
    endian: RunTimeEndian,
    arch: Arch,
    common_off: u32,
    common_count: u32,
    index_off: u32,
    index_count: u32,
}

impl<'m> CfeReader<'m> {
    /// Validate the section header. Only format version 1 exists.
    pub fn new(mobj: &'m Mapping, arch: Arch) -> Result<CfeReader<'m>> {
        let endian = arch.endian();
        let base = mobj.base_address();
        let version = mobj.read_u32(endian, base, 0)?;
        if version != 1 {
            trace!(version, "unsupported compact unwind section version");
            return Err(Error::NotSupported("unsupported compact unwind section version"));
        }
        Ok(CfeReader {
            mobj,
            endian,
            arch,
            common_off: mobj.read_u32(endian, base, 4)?,
            common_count: mobj.read_u32(endian, base, 8)?,
            index_off: mobj.read_u32(endian, base, 20)?,
            index_count: mobj.read_u32(endian, base, 24)?,
        })
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    fn addr(&self, offset: u32) -> Result<u64> {
        self.mobj
            .base_address()
            .checked_add(offset as u64)
            .ok_or(Error::Invalid("section offset overflows"))
    }

    /// Look up the entry covering `pc` (relative to the image's load
    /// address). Returns the function's start offset and its raw encoding.
    ///
    /// The lookup is a floor search at both levels: the returned entry is
    /// the one with the greatest function offset that does not exceed
    /// `pc`, never an exact-match-only search.
    pub fn find_entry(&self, pc: u64) -> Result<(u64, u32)> {
        let Ok(pc) = u32::try_from(pc) else {
            return Err(Error::NotFound("address beyond the range of the unwind table"));
        };
        let e = self.endian;

        // The common encodings palette, shared by compressed pages.
        let common_addr = self.addr(self.common_off)?;
        let common_len = self.common_count as u64 * 4;
        if !self.mobj.verify_range(common_addr, 0, common_len) {
            return Err(Error::Invalid("common encodings table outside the mapped section"));
        }

        // First level: one entry per second-level page, keyed by function
        // offset, with one trailing sentinel entry appended by the linker
        // that tools skip.
        if self.index_count == 0 {
            return Err(Error::NotFound("unwind table index is empty"));
        }
        let index_count = self.index_count - 1;
        if index_count == 0 {
            return Err(Error::NotFound("unwind table index is empty"));
        }
        let index_addr = self.addr(self.index_off)?;
        if !self.mobj.verify_range(index_addr, 0, index_count as u64 * 12) {
            return Err(Error::Invalid("unwind table index outside the mapped section"));
        }
        let index_fn_offset =
            |i: u32| -> Result<u32> { self.mobj.read_u32(e, index_addr, i as i64 * 12) };
        let Some(first) = floor_search(index_count, pc, &index_fn_offset)? else {
            return Err(Error::NotFound("address precedes every unwind table entry"));
        };

        let first_fn_offset = index_fn_offset(first)?;
        let second_off = self.mobj.read_u32(e, index_addr, first as i64 * 12 + 4)?;
        if second_off == 0 {
            return Err(Error::NotFound("index entry has no second-level page"));
        }
        let page_addr = self.addr(second_off)?;

        match self.mobj.read_u32(e, page_addr, 0)? {
            UNWIND_SECOND_LEVEL_REGULAR => {
                let entries_off = self.mobj.read_u16(e, page_addr, 4)? as u64;
                let entries_count = self.mobj.read_u16(e, page_addr, 6)? as u32;
                let entries_addr = apply_offset(page_addr, entries_off as i64)?;
                if !self.mobj.verify_range(entries_addr, 0, entries_count as u64 * 8) {
                    return Err(Error::Invalid("second-level entries outside the mapped section"));
                }

                let entry_fn_offset =
                    |i: u32| -> Result<u32> { self.mobj.read_u32(e, entries_addr, i as i64 * 8) };
                let Some(i) = floor_search(entries_count, pc, &entry_fn_offset)? else {
                    return Err(Error::NotFound("no unwind entry at or below the address"));
                };
                let function_base = entry_fn_offset(i)? as u64;
                let encoding = self.mobj.read_u32(e, entries_addr, i as i64 * 8 + 4)?;
                Ok((function_base, encoding))
            }

            UNWIND_SECOND_LEVEL_COMPRESSED => {
                let entries_off = self.mobj.read_u16(e, page_addr, 4)? as u64;
                let entries_count = self.mobj.read_u16(e, page_addr, 6)? as u32;
                let entries_addr = apply_offset(page_addr, entries_off as i64)?;
                if !self.mobj.verify_range(entries_addr, 0, entries_count as u64 * 4) {
                    return Err(Error::Invalid("second-level entries outside the mapped section"));
                }

                // Compressed entries pack a 24-bit function offset
                // (relative to the page's base function offset) with an
                // 8-bit palette index.
                let entry_fn_offset = |i: u32| -> Result<u32> {
                    let raw = self.mobj.read_u32(e, entries_addr, i as i64 * 4)?;
                    first_fn_offset
                        .checked_add(compressed_entry_func_offset(raw))
                        .ok_or(Error::Invalid("compressed entry offset overflows"))
                };
                let Some(i) = floor_search(entries_count, pc, &entry_fn_offset)? else {
                    return Err(Error::NotFound("no unwind entry at or below the address"));
                };

                let raw = self.mobj.read_u32(e, entries_addr, i as i64 * 4)?;
                let function_base = entry_fn_offset(i)? as u64;
                let palette_index = compressed_entry_encoding_index(raw);

                // Palette indices below the common count select the shared
                // table; the rest select the page-local table.
                if palette_index < self.common_count {
                    let encoding = self.mobj.read_u32(e, common_addr, palette_index as i64 * 4)?;
                    return Ok((function_base, encoding));
                }
                let local_off = self.mobj.read_u16(e, page_addr, 8)? as u64;
                let local_count = self.mobj.read_u16(e, page_addr, 10)? as u32;
                let local_addr = apply_offset(page_addr, local_off as i64)?;
                if !self.mobj.verify_range(local_addr, 0, local_count as u64 * 4) {
                    return Err(Error::Invalid("page-local encodings outside the mapped section"));
                }
                let local_index = palette_index - self.common_count;
                if local_index >= local_count {
                    return Err(Error::Invalid("encoding index outside the page-local table"));
                }
                let encoding = self.mobj.read_u32(e, local_addr, local_index as i64 * 4)?;
                Ok((function_base, encoding))
            }

            kind => {
                trace!(kind, "unsupported second-level page kind");
                Err(Error::Invalid("unsupported second-level page kind"))
            }
        }
    }
}

/// The kind of frame-restoration recipe an entry encodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CfeEntryKind {
    /// Standard frame: saved registers at a fixed offset from the frame
    /// pointer.
    FramePtr,
    /// Frameless function; the post-prologue stack size is encoded
    /// directly.
    FramelessImmediate,
    /// Frameless function; the stack size must be read out of an
    /// instruction operand in the function's own prologue.
    FramelessIndirect,
    /// The entry defers to the DWARF call frame information.
    Dwarf,
    /// No unwind information is available for the function.
    None,
}

/// A decoded compact unwind entry: a stack-allocated, per-step recipe for
/// restoring the caller's register state.
#[derive(Clone, Debug)]
pub struct CfeEntry {
    arch: Arch,
    kind: CfeEntryKind,
    stack_offset: i64,
    stack_adjust: u32,
    return_address_reg: Option<u16>,
    registers: ArrayVec<Option<u16>, CFE_SAVED_REGISTER_MAX>,
}

impl CfeEntry {
    /// Decode a raw encoding for the given architecture.
    pub fn decode(arch: Arch, encoding: u32) -> Result<CfeEntry> {
        match arch {
            Arch::X86_64 => x86_64::decode(encoding),
            Arch::Arm64 => arm64::decode(encoding),
        }
    }

    pub fn kind(&self) -> CfeEntryKind {
        self.kind
    }

    /// Interpretation depends on the kind: offset from the frame pointer
    /// to the saved registers (frame), the stack size (frameless
    /// immediate), or the offset of the stack-size operand within the
    /// function (frameless indirect) or of the FDE within the DWARF
    /// section (dwarf).
    pub fn stack_offset(&self) -> i64 {
        self.stack_offset
    }

    /// Added to the indirectly-read stack size (frameless indirect only).
    pub fn stack_adjust(&self) -> u32 {
        self.stack_adjust
    }

    /// The register holding the return address, when it is not on the
    /// stack (arm64 frameless entries).
    pub fn return_address_register(&self) -> Option<u16> {
        self.return_address_reg
    }

    /// The ordered, possibly sparse list of saved registers (DWARF
    /// numbers).
    pub fn registers(&self) -> &[Option<u16>] {
        &self.registers
    }

    /// Apply the recipe to `old`, reading saved values from `task`, and
    /// produce the caller's register state. `function_address` is the
    /// loaded address of the function this entry covers.
    pub fn apply<T: TaskMemory>(
        &self,
        task: &T,
        function_address: u64,
        old: &RegisterState,
    ) -> Result<RegisterState> {
        let endian = self.arch.endian();
        let greg: u64 = 8;

        let mut new = old.clone();
        new.clear_volatile();

        let saved_reg_addr: u64;
        match self.kind {
            CfeEntryKind::FramePtr => {
                let fp = old
                    .fp()
                    .ok_or(Error::NotFound("frame pointer is not available"))?;
                saved_reg_addr = apply_offset(fp, self.stack_offset)?;

                // The caller's stack pointer sits above the saved frame
                // pointer and return address.
                let new_sp = fp
                    .checked_add(greg * 2)
                    .ok_or(Error::Invalid("frame pointer falls outside addressable bounds"))?;
                new.set_sp(new_sp);
                new.set_fp(read_task_u64(task, endian, fp, 0)?);
                new.set_ip(read_task_u64(task, endian, fp, greg as i64)?);
            }

            CfeEntryKind::FramelessImmediate | CfeEntryKind::FramelessIndirect => {
                let sp = old
                    .sp()
                    .ok_or(Error::NotFound("stack pointer is not available"))?;

                let stack_size = if self.kind == CfeEntryKind::FramelessIndirect {
                    // The stack size lives in the function's prologue as a
                    // 32-bit instruction operand.
                    let indirect = read_task_u32(task, endian, function_address, self.stack_offset)?;
                    indirect as u64 + self.stack_adjust as u64
                } else {
                    self.stack_offset as u64
                };

                let unwound_sp = sp
                    .checked_add(stack_size)
                    .ok_or(Error::Invalid("stack size falls outside addressable bounds"))?;

                match self.return_address_reg {
                    None => {
                        // The return address is the last thing on the
                        // frame; saved registers sit just below it.
                        let retaddr = unwound_sp
                            .checked_sub(greg)
                            .ok_or(Error::Invalid("stack pointer underflows"))?;
                        saved_reg_addr = retaddr
                            .checked_sub(greg * self.registers.len() as u64)
                            .ok_or(Error::Invalid("stack pointer underflows"))?;
                        new.set_sp(unwound_sp);
                        new.set_ip(read_task_u64(task, endian, retaddr, 0)?);
                    }
                    Some(reg) => {
                        let ra = old.reg(reg).ok_or(Error::NotFound(
                            "return address register is not available",
                        ))?;
                        new.set_ip(ra);
                        new.set_sp(unwound_sp);
                        saved_reg_addr = unwound_sp
                            .checked_sub(greg * self.registers.len() as u64)
                            .ok_or(Error::Invalid("stack pointer underflows"))?;
                    }
                }
            }

            CfeEntryKind::Dwarf => {
                return Err(Error::NotSupported("entry defers to DWARF unwinding"))
            }
            CfeEntryKind::None => {
                return Err(Error::NotSupported("entry has no unwind information"))
            }
        }

        // Restore the saved non-volatile registers. The list may be
        // sparse; empty slots still occupy a stack position.
        for (i, slot) in self.registers.iter().enumerate() {
            let Some(reg) = slot else { continue };
            let value = read_task_u64(task, endian, saved_reg_addr, i as i64 * 8)?;
            new.set_reg(*reg, value);
        }

        Ok(new)
    }
}
