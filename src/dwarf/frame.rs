//! Locating the frame description entry that covers a pc, by linear scan
//! of a mapped `__eh_frame` (or `__debug_frame`) section.

use gimli::RunTimeEndian;
use tracing::trace;

use super::{parse_cie, read_encoded_pointer, CieInfo, Opstream};
use crate::error::{Error, Result};
use crate::mem::Mapping;

/// An FDE that covers the queried pc, with everything needed to run its
/// CFA program.
#[derive(Debug)]
pub struct FdeInfo {
    pub cie: CieInfo,
    /// Loaded address of the first covered instruction.
    pub initial_location: u64,
    /// Size in bytes of the covered range.
    pub range: u64,
    /// Task-relative address and length of the FDE's CFA instructions.
    pub instructions: (u64, u64),
}

/// A reader over a mapped call-frame-information section.
pub struct FrameReader<'m> {
    mobj: &'m Mapping,
    endian: RunTimeEndian,
    debug_frame: bool,
}

impl<'m> FrameReader<'m> {
    pub fn new(mobj: &'m Mapping, endian: RunTimeEndian, debug_frame: bool) -> FrameReader<'m> {
        FrameReader {
            mobj,
            endian,
            debug_frame,
        }
    }

    /// Scan the section for the FDE whose range covers `pc` (a loaded
    /// address). The scan is bounded by the mapped length and by
    /// validated entry lengths; a malformed length terminates it with
    /// `Invalid` rather than walking out of bounds.
    pub fn find_fde(&self, pc: u64) -> Result<FdeInfo> {
        let base = self.mobj.base_address();
        let e = self.endian;
        let mut offset: u64 = 0;
        // CIE references repeat across consecutive FDEs; cache the last
        // one parsed.
        let mut cached_cie: Option<CieInfo> = None;

        while offset < self.mobj.length() {
            let entry_addr = base + offset;
            let length32 = self.mobj.read_u32(e, entry_addr, 0)?;
            if length32 == 0 {
                // eh_frame end-of-section terminator.
                break;
            }
            let (entry_len, len_size, m64) = if length32 == u32::MAX {
                (self.mobj.read_u64(e, entry_addr, 4)?, 12u64, true)
            } else {
                (length32 as u64, 4u64, false)
            };

            let next_offset = offset
                .checked_add(len_size)
                .and_then(|v| v.checked_add(entry_len))
                .ok_or(Error::Invalid("frame entry length overflows"))?;
            if next_offset > self.mobj.length() {
                return Err(Error::Invalid("frame entry extends past the section"));
            }

            let id_size = if m64 { 8u64 } else { 4u64 };
            if entry_len < id_size {
                return Err(Error::Invalid("frame entry is too short"));
            }
            let body_addr = entry_addr + len_size;
            let id = if m64 {
                self.mobj.read_u64(e, body_addr, 0)?
            } else {
                self.mobj.read_u32(e, body_addr, 0)? as u64
            };

            let cie_id = if self.debug_frame {
                if m64 {
                    u64::MAX
                } else {
                    u32::MAX as u64
                }
            } else {
                0
            };
            if id == cie_id {
                offset = next_offset;
                continue;
            }

            // An FDE. Resolve its CIE: a section offset in debug_frame, a
            // back-reference from the id field in eh_frame.
            let cie_addr = if self.debug_frame {
                base.checked_add(id)
            } else {
                body_addr.checked_sub(id)
            }
            .ok_or(Error::Invalid("FDE CIE pointer out of range"))?;

            let cie = match &cached_cie {
                Some(c) if c.address == cie_addr => c.clone(),
                _ => {
                    let c = parse_cie(self.mobj, e, cie_addr)?;
                    cached_cie = Some(c.clone());
                    c
                }
            };

            let mut stream = Opstream::new(
                self.mobj,
                e,
                body_addr,
                id_size as i64,
                entry_len - id_size,
            )?;
            let initial_location = read_encoded_pointer(&mut stream, cie.pointer_encoding)?;
            // The range is encoded with the value format only, no base.
            let range = read_encoded_pointer(&mut stream, cie.pointer_encoding & 0x0f)?;
            if cie.has_eh_augmentation {
                let aug_len = stream.read_uleb128()?;
                stream.skip(i64::try_from(aug_len).map_err(|_| {
                    Error::Invalid("augmentation data length overflows")
                })?)?;
            }

            if pc >= initial_location && pc - initial_location < range {
                let instr_addr = stream.target_address();
                let instr_len = (entry_len - id_size)
                    .checked_sub(stream.position())
                    .ok_or(Error::Invalid("FDE instructions overrun the entry"))?;
                trace!(
                    pc,
                    initial_location,
                    range,
                    "matched frame description entry"
                );
                return Ok(FdeInfo {
                    cie,
                    initial_location,
                    range,
                    instructions: (instr_addr, instr_len),
                });
            }

            offset = next_offset;
        }

        Err(Error::NotFound("no FDE covers the address"))
    }
}
