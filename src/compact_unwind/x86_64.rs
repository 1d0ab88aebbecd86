//! x86-64 compact unwind encoding bit layout.

use arrayvec::ArrayVec;

use super::permutation;
use super::{extract, CfeEntry, CfeEntryKind, CFE_SAVED_REGISTER_MAX};
use crate::arch::{x86_64 as regs, Arch};
use crate::error::{Error, Result};

pub const UNWIND_X86_64_MODE_MASK: u32 = 0x0f00_0000;
pub const UNWIND_X86_64_MODE_RBP_FRAME: u32 = 0x0100_0000;
pub const UNWIND_X86_64_MODE_STACK_IMMD: u32 = 0x0200_0000;
pub const UNWIND_X86_64_MODE_STACK_IND: u32 = 0x0300_0000;
pub const UNWIND_X86_64_MODE_DWARF: u32 = 0x0400_0000;

pub const UNWIND_X86_64_RBP_FRAME_REGISTERS: u32 = 0x0000_7fff;
pub const UNWIND_X86_64_RBP_FRAME_OFFSET: u32 = 0x00ff_0000;
pub const UNWIND_X86_64_FRAMELESS_STACK_SIZE: u32 = 0x00ff_0000;
pub const UNWIND_X86_64_FRAMELESS_STACK_ADJUST: u32 = 0x0000_e000;
pub const UNWIND_X86_64_FRAMELESS_STACK_REG_COUNT: u32 = 0x0000_1c00;
pub const UNWIND_X86_64_FRAMELESS_STACK_REG_PERMUTATION: u32 = 0x0000_03ff;
pub const UNWIND_X86_64_DWARF_SECTION_OFFSET: u32 = 0x00ff_ffff;

/// Map a CFE register number to its DWARF register. Zero is the sparse
/// "no register" slot.
fn map_register(cfe_reg: u32) -> Result<Option<u16>> {
    match cfe_reg {
        0 => Ok(None),
        1 => Ok(Some(regs::RBX)),
        2 => Ok(Some(regs::R12)),
        3 => Ok(Some(regs::R13)),
        4 => Ok(Some(regs::R14)),
        5 => Ok(Some(regs::R15)),
        6 => Ok(Some(regs::RBP)),
        _ => Err(Error::Invalid("unknown x86-64 CFE register number")),
    }
}

pub(super) fn decode(encoding: u32) -> Result<CfeEntry> {
    let mut entry = CfeEntry {
        arch: Arch::X86_64,
        kind: CfeEntryKind::None,
        stack_offset: 0,
        stack_adjust: 0,
        return_address_reg: None,
        registers: ArrayVec::new(),
    };

    match encoding & UNWIND_X86_64_MODE_MASK {
        UNWIND_X86_64_MODE_RBP_FRAME => {
            entry.kind = CfeEntryKind::FramePtr;
            entry.stack_offset = -((extract(encoding, UNWIND_X86_64_RBP_FRAME_OFFSET) as i64) * 8);

            // Registers are stored as a run of 3-bit fields. Sparse slots
            // are kept, but an all-zero remainder ends the list.
            let packed = extract(encoding, UNWIND_X86_64_RBP_FRAME_REGISTERS);
            for i in 0..CFE_SAVED_REGISTER_MAX {
                let remaining = packed >> (3 * i);
                if remaining == 0 {
                    break;
                }
                entry.registers.push(map_register(remaining & 0x7)?);
            }
            Ok(entry)
        }

        mode @ (UNWIND_X86_64_MODE_STACK_IMMD | UNWIND_X86_64_MODE_STACK_IND) => {
            // The two modes differ only in how the stack size and
            // adjustment are interpreted.
            if mode == UNWIND_X86_64_MODE_STACK_IMMD {
                entry.kind = CfeEntryKind::FramelessImmediate;
                entry.stack_offset =
                    (extract(encoding, UNWIND_X86_64_FRAMELESS_STACK_SIZE) as i64) * 8;
            } else {
                entry.kind = CfeEntryKind::FramelessIndirect;
                entry.stack_offset = extract(encoding, UNWIND_X86_64_FRAMELESS_STACK_SIZE) as i64;
                entry.stack_adjust = extract(encoding, UNWIND_X86_64_FRAMELESS_STACK_ADJUST) * 8;
            }

            let count = extract(encoding, UNWIND_X86_64_FRAMELESS_STACK_REG_COUNT);
            let packed = extract(encoding, UNWIND_X86_64_FRAMELESS_STACK_REG_PERMUTATION);
            for cfe_reg in permutation::decode(packed, count)? {
                entry.registers.push(map_register(cfe_reg)?);
            }
            Ok(entry)
        }

        UNWIND_X86_64_MODE_DWARF => {
            entry.kind = CfeEntryKind::Dwarf;
            entry.stack_offset = extract(encoding, UNWIND_X86_64_DWARF_SECTION_OFFSET) as i64;
            Ok(entry)
        }

        0 => {
            // A zero encoding means "no unwind information for this
            // function"; Apple's tooling emits it deliberately.
            Ok(entry)
        }

        _ => Err(Error::NotSupported("unrecognized x86-64 compact unwind mode")),
    }
}
